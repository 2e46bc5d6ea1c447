//! Domain types - core entities shared by every pipeline stage
//!
//! These types are independent of the coordinator, log storage and search
//! backend they travel through.

pub mod config;
pub mod record;
