//! Pieces shared by the compile and deploy pipelines.

use complect_core::{Backend, ExecResult};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::retention;

/// An error that stopped a pipeline, recorded instead of propagated.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedError {
    pub message: String,
    pub trace: String,
    /// Misconfiguration rather than a remote or unexpected failure.
    pub configuration: bool,
}

impl CapturedError {
    pub fn from_error(error: &complect_core::Error) -> Self {
        Self {
            message: error.to_string(),
            trace: format!("{:?}", error),
            configuration: error.is_configuration(),
        }
    }

    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = panic_message(payload.as_ref());
        Self {
            trace: format!("panicked: {}", message),
            message,
            configuration: false,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run pipeline stages, turning an error or panic into a `CapturedError`.
pub(crate) async fn capture<F>(stages: F) -> Option<CapturedError>
where
    F: Future<Output = complect_core::Result<()>>,
{
    match AssertUnwindSafe(stages).catch_unwind().await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            warn!(error = %e, "Pipeline stopped by error");
            Some(CapturedError::from_error(&e))
        }
        Err(payload) => {
            let captured = CapturedError::from_panic(payload);
            warn!(error = %captured.message, "Pipeline panicked");
            Some(captured)
        }
    }
}

/// Close a backend, logging rather than returning a failure.
pub(crate) async fn close_backend(backend: &mut dyn Backend) {
    if let Err(e) = backend.close().await {
        warn!(backend = backend.name(), target = backend.target(), error = %e, "Failed to close backend");
    }
}

/// Concatenated stdout of the stages that ran.
pub(crate) fn combined_stdout<'a>(stages: impl IntoIterator<Item = Option<&'a ExecResult>>) -> String {
    stages.into_iter().flatten().map(|r| r.out.as_str()).collect()
}

/// Delete aged local working files in the background.
pub(crate) async fn sweep(dir: &Path, older_than: Duration) {
    let dir = dir.to_path_buf();
    let swept = tokio::task::spawn_blocking({
        let dir = dir.clone();
        move || retention::sweep_local(&dir, older_than)
    })
    .await;

    match swept {
        Ok(Ok(removed)) => info!(dir = %dir.display(), removed, "Deleted old local files"),
        Ok(Err(e)) => warn!(dir = %dir.display(), error = %e, "Local cleanup failed"),
        Err(e) => warn!(dir = %dir.display(), error = %e, "Local cleanup task failed"),
    }
}
