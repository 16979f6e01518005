//! Configuration subsystem.
//!
//! # Data Flow
//! ```text
//! TOML file ──▶ loader.rs (parse + RS_* env overlay)
//!                  │
//!                  ▼
//!              validation.rs (semantic checks)
//!                  │
//!                  ▼
//!              Snapshot (config + compiled policy), swapped atomically
//!                  ▲
//!              watcher.rs (mtime polling from the supervisor)
//! ```

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

use crate::net::policy::CompiledPolicy;
use loader::ConfigError;
use schema::ServerConfig;

pub use loader::{load_config, read_config};
pub use watcher::ConfigWatcher;

/// An immutable configuration snapshot: the validated config plus its
/// compiled policy lists. Workers copy what they need at connect time, so a
/// mid-flight swap never affects established sessions.
#[derive(Debug)]
pub struct Snapshot {
    pub config: ServerConfig,
    pub policy: CompiledPolicy,
}

impl Snapshot {
    /// Compile a validated configuration into a snapshot.
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        let policy = CompiledPolicy::compile(&config.access)
            .map_err(|e| ConfigError::Validation(vec![validation::ValidationError(e)]))?;
        Ok(Self { config, policy })
    }
}
