//! Preprocessor collaborator contract.
//!
//! A preprocessor fetches complect sources and prepares them for the compiler.
//! It never fails: every problem is reported through a non-zero exit code or
//! non-empty stderr in the returned `ExecResult`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::ExecResult;

/// Result of downloading complect sources.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// Directory holding the sources, under the requested root.
    pub base_path: PathBuf,
    pub result: ExecResult,
}

#[async_trait]
pub trait Preprocessor: Send + Sync {
    /// Download templates and dictionaries of `complect_id` into `root_dir`.
    async fn download(&self, root_dir: &Path, complect_id: &str) -> DownloadOutcome;

    /// Preprocess the sources under `base_path` in place.
    async fn preprocess(&self, base_path: &Path) -> ExecResult;
}
