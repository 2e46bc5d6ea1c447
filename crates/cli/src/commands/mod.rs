//! CLI command implementations

mod config;
mod demo;
mod inspect;

pub use config::cmd_config_show;
pub use demo::cmd_demo;
pub use inspect::{cmd_check, cmd_match, cmd_route};
