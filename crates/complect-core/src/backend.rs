//! Backend trait and remote execution types.
//!
//! Backends drive a remote linguistic-engine host through the compile/deploy
//! stages: bare SSH hosts, Docker containers reached over SSH, Kubernetes pods.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// Exit code and captured output of one process run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub code: i32,
    pub out: String,
    pub err: String,
}

impl ExecResult {
    pub fn new(code: i32, out: impl Into<String>, err: impl Into<String>) -> Self {
        Self {
            code,
            out: out.into(),
            err: err.into(),
        }
    }

    /// Successful run with no output.
    pub fn ok() -> Self {
        Self::default()
    }

    /// A run that could not be started at all.
    pub fn spawn_failure(reason: impl Into<String>) -> Self {
        Self::new(-1, "", reason)
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Location of uploaded sources on a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePath {
    /// Path on the machine we upload to (SSH host, pod filesystem).
    pub remote_path: String,
    /// The same directory as seen by the engine binaries; differs from
    /// `remote_path` when the engine runs inside a container.
    pub engine_path: String,
}

impl RemotePath {
    pub fn same(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            remote_path: path.clone(),
            engine_path: path,
        }
    }
}

/// Result of the upload stage.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub path: RemotePath,
    pub result: ExecResult,
}

/// Optional operations a backend variant implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub update: bool,
    pub restart: bool,
    pub get_file: bool,
}

impl Capabilities {
    pub const ALL: Capabilities = Capabilities {
        update: true,
        restart: true,
        get_file: true,
    };
}

/// Uniform remote-execution contract implemented by every target variant.
///
/// A backend is built once from immutable target configuration and used by a
/// single pipeline run. Callers must `close` it on every exit path.
/// `compile`, `update` and `restart` return the raw exit code and output of the
/// remote command; interpretation happens in the pipelines.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Name of this backend variant.
    fn name(&self) -> &'static str;

    /// Configured target name this backend drives.
    fn target(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    async fn connect(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Copy a local file or directory into a fresh remote directory.
    async fn upload(&mut self, local_path: &Path) -> Result<UploadOutcome>;

    async fn compile(&mut self, path: &RemotePath) -> Result<ExecResult>;

    /// Load a compiled artifact into the running engine.
    async fn update(&mut self, path: &RemotePath) -> Result<ExecResult>;

    async fn restart(&mut self) -> Result<ExecResult>;

    /// Download a single remote file; both arguments are file paths.
    async fn get_file(&mut self, remote_path: &str, local_path: &Path) -> Result<()>;
}

/// Builds backends for configured compiler and deployer targets.
///
/// Each call returns a new, unconnected backend owned by one pipeline run.
pub trait BackendProvider: Send + Sync {
    fn compiler(&self, target: &str) -> Result<Box<dyn Backend>>;

    fn deployer(&self, target: &str) -> Result<Box<dyn Backend>>;
}
