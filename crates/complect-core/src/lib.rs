//! Core domain types and traits for the complect build service.
//!
//! This crate contains:
//! - Task identifiers, statuses and queue records
//! - The remote `Backend` trait and execution results
//! - The `Preprocessor` collaborator contract
//! - Artifact location encoding and the retention policy

pub mod artifact;
pub mod backend;
pub mod error;
pub mod id;
pub mod preprocessor;
pub mod task;

pub use artifact::{ArtifactLocation, RETENTION, RETENTION_DAYS};
pub use backend::{Backend, BackendProvider, Capabilities, ExecResult, RemotePath, UploadOutcome};
pub use error::{Error, Result};
pub use id::TaskId;
pub use preprocessor::{DownloadOutcome, Preprocessor};
pub use task::{RoutingFilter, Task, TaskOutcome, TaskReport, TaskStatus};
