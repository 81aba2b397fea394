//! Gateway configuration: schema types and the TOML loader.
//!
//! Config is discovered from `./ferry.toml` or `~/.config/ferry/ferry.toml`,
//! with `${ENV_VAR}` placeholders substituted before parsing.

pub mod loader;
pub mod schema;

pub use {
    loader::{discover_and_load, load_config},
    schema::FerryConfig,
};
