use anyhow::{Context, Result};
use rowdex::config::Config;

/// Print the effective configuration (file values merged over defaults)
pub fn cmd_config_show(config: &Config) -> Result<()> {
  let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
  println!("{}", rendered);
  Ok(())
}
