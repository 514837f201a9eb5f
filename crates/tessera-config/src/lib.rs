//! Configuration for tessera worlds and the simulator.
//!
//! Settings persist to disk as RON. Every section tolerates missing and
//! unknown fields, and CLI arguments override what was loaded.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{ChunkConfig, Config, DebugConfig, SimConfig, WorldConfig, default_config_dir};
pub use error::ConfigError;
