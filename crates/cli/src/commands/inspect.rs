//! Configuration inspection commands (check, route, match)

use anyhow::{Context, Result, anyhow};
use rowdex::{
  conf::GenerationHandle,
  config::Config,
  indexer::document_id,
  record::{QName, RecordId},
  repository::MemoryTypeCatalog,
};

fn load_generation(config: &Config, catalog: &MemoryTypeCatalog) -> Result<GenerationHandle> {
  GenerationHandle::load(&config.indexer, catalog).context("Indexer configuration rejected")
}

fn parse_record_id(record_id: &str) -> Result<RecordId> {
  record_id
    .parse::<RecordId>()
    .with_context(|| format!("Invalid record id '{}'", record_id))
}

/// Validate the index rules and shard map the indexer would start with
pub fn cmd_check(config: &Config, catalog: &MemoryTypeCatalog) -> Result<()> {
  let handle = load_generation(config, catalog)?;
  let generation = handle.current();

  println!("Index:          {}", config.indexer.name);
  println!("Subscription:   {}", config.indexer.subscription_id);
  println!("Workers:        {}", config.indexer.worker_count());
  println!(
    "Locking:        {}",
    if config.lock.enabled { "enabled" } else { "disabled" }
  );

  println!("\n--- Index rules ---");
  match &config.indexer.indexer_conf {
    Some(path) => println!("File:           {}", path.display()),
    None => println!("File:           (none)"),
  }
  if generation.conf.cases().is_empty() {
    println!("Warning: no index rules, no record will be indexed");
  }
  for (i, case) in generation.conf.cases().iter().enumerate() {
    println!("  {:>2}. {}", i + 1, case);
  }
  for field in generation.conf.fields() {
    println!("  field {} <- {}", field.name, field.source);
  }

  println!("\n--- Shards ---");
  match &config.indexer.sharding_conf {
    Some(path) => println!("Routing:        rules from {}", path.display()),
    None => println!("Routing:        hash of master id"),
  }
  for name in generation.shard_map.shard_names() {
    println!("  {} -> {}", name, generation.shard_map.address(name).unwrap_or("?"));
  }

  println!("\nConfiguration OK");
  Ok(())
}

/// Show the shard a record routes to
pub fn cmd_route(config: &Config, catalog: &MemoryTypeCatalog, record_id: &str) -> Result<()> {
  let record_id = parse_record_id(record_id)?;
  let generation = load_generation(config, catalog)?.current();

  let shard = generation.shard_map.select_shard(&record_id);
  println!(
    "{} -> {} ({})",
    record_id,
    shard,
    generation.shard_map.address(shard).unwrap_or("?")
  );
  Ok(())
}

/// Show the first index rule matching a record type and the record's variant
pub fn cmd_match(config: &Config, catalog: &MemoryTypeCatalog, record_type: &str, record_id: &str) -> Result<()> {
  let record_type: QName = record_type.parse().map_err(|e: String| anyhow!(e))?;
  let record_id = parse_record_id(record_id)?;
  let generation = load_generation(config, catalog)?.current();

  let Some(case) = generation
    .conf
    .matching_case(&record_type, record_id.variant_properties())
  else {
    println!("{} {}: no index rule matches, record is not indexed", record_type, record_id);
    return Ok(());
  };

  let position = generation
    .conf
    .cases()
    .iter()
    .position(|c| std::ptr::eq(c, case))
    .map_or(0, |i| i + 1);
  println!("{} {}: rule {} {}", record_type, record_id, position, case);
  for vtag in case.version_tags() {
    println!("  document {}", document_id(&record_id, vtag));
  }
  Ok(())
}
