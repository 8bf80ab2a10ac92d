//! KDL configuration parsing for the complect build service.
//!
//! This crate handles parsing of:
//! - System configuration (complect.kdl)
//! - Compiler and deployer remote targets
//! - The worker table derived from them

pub mod error;
mod nodes;
pub mod system;
pub mod targets;
pub mod workers;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    DatabaseConfig, PreprocessorConfig, SystemConfig, WorkerSettings, load_system_config,
    parse_system_config,
};
pub use targets::{KubernetesConfig, RemoteTarget, SshConfig, TargetKind, TargetRole};
pub use workers::{WorkerSpec, find_worker, worker_table};
