//! Remote engine backends for the complect build service.
//!
//! Provides backend implementations:
//! - Dedicated hosts over SSH
//! - Docker containers on SSH hosts
//! - Kubernetes pods
//!
//! plus the local command runner and the command preprocessor.

pub mod command;
pub mod docker;
pub mod engine;
pub mod factory;
mod host;
pub mod kubernetes;
pub mod preprocessor;
pub mod ssh;
pub mod vm;

pub use docker::DockerBackend;
pub use factory::{TargetBackends, create_backend};
pub use kubernetes::KubernetesBackend;
pub use preprocessor::CommandPreprocessor;
pub use ssh::SshSession;
pub use vm::VirtualMachineBackend;
