//! rowdex CLI - operator tooling for row log driven search indexing

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rowdex::{config::Config, repository::MemoryTypeCatalog};

mod commands;
mod logging;

use commands::{cmd_check, cmd_config_show, cmd_demo, cmd_match, cmd_route};
use logging::init_logging;

const DEFAULT_CONFIG_FILE: &str = "rowdex.toml";

#[derive(Parser)]
#[command(name = "rowdex")]
#[command(about = "Row log driven search indexing")]
#[command(after_help = "\
EXAMPLES:
  rowdex check                               # Validate config, index rules and shard map
  rowdex route 'b1!lang=en'                  # Which shard a record lands on
  rowdex match org.books:Book 'b1!lang=en'   # Which index rule a record matches
  rowdex demo --records 500                  # Run the pipeline in memory")]
struct Cli {
  /// Configuration file (default: $ROWDEX_CONFIG, then ./rowdex.toml)
  #[arg(short, long, global = true, value_name = "FILE")]
  config: Option<PathBuf>,

  /// Version tag known to the record schema besides `last` (repeatable)
  #[arg(long = "version-tag", global = true, value_name = "TAG")]
  version_tags: Vec<String>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Validate the configuration, index rules and shard map
  Check,
  /// Show the shard a record routes to
  Route {
    /// Record id, `master` or `master!key=value,...`
    record_id: String,
  },
  /// Show the index rule a record matches and the version tags it indexes
  Match {
    /// Record type, `namespace:name` or `{namespace}name`
    record_type: String,
    /// Record id carrying the variant dimensions
    record_id: String,
  },
  /// Print the effective configuration
  Config,
  /// Run an in-memory pipeline over generated records and report the counters
  Demo {
    /// Records to write
    #[arg(long, default_value = "100")]
    records: usize,
    /// Output the report as JSON
    #[arg(long)]
    json: bool,
  },
}

/// Explicit `--config` must load; the default location may be missing.
fn load_config(cli: &Cli) -> Result<Config> {
  let (path, explicit) = match &cli.config {
    Some(path) => (path.clone(), true),
    None => match Config::user_config_path() {
      Some(path) => (path, true),
      None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    },
  };

  let mut config = if explicit || path.exists() {
    Config::load(&path).with_context(|| format!("Failed to load {}", path.display()))?
  } else {
    Config::default()
  };
  let base = path.parent().unwrap_or_else(|| Path::new("."));
  config.resolve_paths(base);
  Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  let loaded = load_config(&cli);
  let level = loaded
    .as_ref()
    .map(|config| config.logging.level.clone())
    .unwrap_or_else(|_| "info".to_string());
  init_logging(&level);
  let config = loaded?;

  let catalog = MemoryTypeCatalog::new(cli.version_tags.iter().cloned());

  match cli.command {
    Commands::Check => cmd_check(&config, &catalog),
    Commands::Route { record_id } => cmd_route(&config, &catalog, &record_id),
    Commands::Match { record_type, record_id } => cmd_match(&config, &catalog, &record_type, &record_id),
    Commands::Config => cmd_config_show(&config),
    Commands::Demo { records, json } => cmd_demo(&config, &catalog, records, json).await,
  }
}
