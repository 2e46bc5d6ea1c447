//! rowdex - row log driven search indexing.
//!
//! Record mutations append messages to a [`rowlog::RowLog`]; each subscription
//! consumes them independently. The indexer subscription locks the record,
//! matches it against the current index rules and ships documents to the
//! search shard the record routes to.

pub mod conf;
pub mod coordinator;
pub mod domain;
pub mod indexer;
pub mod lock;
pub mod repository;
pub mod rowlog;
pub mod search;
pub mod worker;

pub use domain::{config, record};
