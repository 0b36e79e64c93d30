pub mod config;
pub mod core;
pub mod dirs;
pub mod error;
pub mod logging;
pub mod transport;

pub use config::{ConfigStore, JsonConfigStore, ProjectConfig, ProjectRegistry, RunConfig};
pub use core::{EngineConfig, SyncEngine, TickReport};
pub use error::{ConfigError, SyncError};
