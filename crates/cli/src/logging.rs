//! Logging setup for the rowdex binary

use tracing_subscriber::{EnvFilter, filter::LevelFilter};

/// Parse log level from config string
fn parse_log_level(level: &str) -> LevelFilter {
  match level.to_lowercase().as_str() {
    "off" => LevelFilter::OFF,
    "error" => LevelFilter::ERROR,
    "warn" => LevelFilter::WARN,
    "info" => LevelFilter::INFO,
    "debug" => LevelFilter::DEBUG,
    "trace" => LevelFilter::TRACE,
    _ => LevelFilter::INFO,
  }
}

/// Initialize console logging at the configured level (`RUST_LOG` overrides it).
pub fn init_logging(level: &str) {
  let env_filter = EnvFilter::builder()
    .with_default_directive(parse_log_level(level).into())
    .from_env_lossy();

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .with_writer(std::io::stderr)
    .init();
}
