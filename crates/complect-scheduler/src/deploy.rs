//! Deploy pipeline.
//!
//! Fetches a revision's compiled artifact from the compiler target that built
//! it and installs it on a deployer target: `upload -> update -> restart`.

use complect_core::{ArtifactLocation, Backend, BackendProvider, Error, ExecResult, RETENTION};
use complect_db::RevisionRepo;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::pipeline::{CapturedError, capture, close_backend, combined_stdout, sweep};

/// Local directory for fetched artifacts, under the worker root dir.
pub const DEPLOY_DIR: &str = "deploy";

/// Outcome of one deploy invocation.
#[derive(Debug, Clone, Default)]
pub struct DeployRun {
    /// Set for business outcomes that stop the deploy before any remote work.
    pub notice: Option<String>,
    pub complect_id: Option<String>,
    pub upload: Option<ExecResult>,
    pub update: Option<ExecResult>,
    pub restart: Option<ExecResult>,
    pub error: Option<CapturedError>,
    pub success: bool,
}

impl DeployRun {
    pub fn output(&self) -> String {
        let mut output = self.notice.clone().unwrap_or_default();
        output.push_str(&combined_stdout([
            self.upload.as_ref(),
            self.update.as_ref(),
            self.restart.as_ref(),
        ]));
        if let Some(error) = &self.error {
            output.push_str("ERROR: ");
            output.push_str(&error.message);
        }
        output
    }

    pub fn to_result(&self) -> Value {
        json!({
            "output": self.output(),
            "messages": [],
            "success": self.success,
        })
    }
}

pub struct DeployPipeline {
    revisions: Arc<dyn RevisionRepo>,
    backends: Arc<dyn BackendProvider>,
    root_dir: PathBuf,
}

impl DeployPipeline {
    pub fn new(
        revisions: Arc<dyn RevisionRepo>,
        backends: Arc<dyn BackendProvider>,
        root_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            revisions,
            backends,
            root_dir: root_dir.into(),
        }
    }

    pub async fn execute(&self, revision_id: Uuid, target: &str) -> DeployRun {
        let mut run = DeployRun::default();
        info!(revision_id = %revision_id, target, "Deploying");

        let error = capture(self.run_stages(revision_id, target, &mut run)).await;
        run.error = error;
        run
    }

    async fn run_stages(
        &self,
        revision_id: Uuid,
        target: &str,
        run: &mut DeployRun,
    ) -> complect_core::Result<()> {
        let revision = self
            .revisions
            .get(revision_id)
            .await
            .map_err(|e| Error::Internal(format!("revision lookup failed: {}", e)))?;

        let Some(revision) = revision else {
            run.notice = Some(format!("No such complect_revision_id={}", revision_id));
            return Ok(());
        };
        run.complect_id = Some(revision.complect_id.to_string());

        let Some(binary_path) = revision.binary_path.as_deref().filter(|p| !p.is_empty()) else {
            run.notice = Some(format!(
                "No deployed binary path for complect_revision_id={}",
                revision_id
            ));
            return Ok(());
        };
        let location = ArtifactLocation::parse(binary_path)?;

        let local_dir = self.create_local_dir().await?;
        let file_name = Path::new(&location.path)
            .file_name()
            .ok_or_else(|| Error::InvalidInput(format!("artifact path has no file name: {}", location)))?;
        let local_file = local_dir.join(file_name);

        let mut source = self.backends.compiler(&location.target)?;
        let fetched = fetch(source.as_mut(), &location, &local_file).await;
        close_backend(source.as_mut()).await;
        fetched?;
        debug!(from = %location, to = %local_file.display(), "Fetched artifact");

        let mut destination = self.backends.deployer(target)?;
        let installed = install(destination.as_mut(), &local_dir, run).await;
        close_backend(destination.as_mut()).await;

        if installed? {
            sweep(&self.root_dir.join(DEPLOY_DIR), RETENTION).await;
            run.success = true;
        }
        Ok(())
    }

    async fn create_local_dir(&self) -> complect_core::Result<PathBuf> {
        let dir = self
            .root_dir
            .join(DEPLOY_DIR)
            .join(format!("deploy_{}", Uuid::now_v7().simple()));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

async fn fetch(
    source: &mut dyn Backend,
    location: &ArtifactLocation,
    local_file: &Path,
) -> complect_core::Result<()> {
    source.connect().await?;
    source.get_file(&location.path, local_file).await
}

/// Returns whether every stage exited 0.
async fn install(
    destination: &mut dyn Backend,
    local_dir: &Path,
    run: &mut DeployRun,
) -> complect_core::Result<bool> {
    destination.connect().await?;

    let upload = destination.upload(local_dir).await?;
    let failed = !upload.result.success();
    run.upload = Some(upload.result);
    if failed {
        debug!("Stopping deploy: upload failed");
        return Ok(false);
    }

    let update = destination.update(&upload.path).await?;
    let failed = !update.success();
    run.update = Some(update);
    if failed {
        debug!("Stopping deploy: update failed");
        return Ok(false);
    }

    let restart = destination.restart().await?;
    let failed = !restart.success();
    run.restart = Some(restart);
    if failed {
        debug!("Stopping deploy: restart failed");
        return Ok(false);
    }
    Ok(true)
}
