//! Compile pipeline.
//!
//! `download -> preprocess -> upload -> compile -> update -> restart`, stopping
//! at the first stage that fails or that the request did not ask for. The
//! pipeline never returns an error: failures are recorded in the `CompileRun`.

use complect_core::{Backend, ExecResult, Preprocessor, RETENTION, RemotePath};
use serde_json::{Value, json};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::output::{EngineMessage, TemplateCatalog, enrich, parse_engine_output};
use crate::pipeline::{CapturedError, capture, close_backend, combined_stdout, sweep};

/// Prefix of per-compile local working directories.
pub const WORK_DIR_PREFIX: &str = "complect";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Preprocess,
    Upload,
    Compile,
    Update,
    Restart,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Download => "download",
            Stage::Preprocess => "preprocess",
            Stage::Upload => "upload",
            Stage::Compile => "compile",
            Stage::Update => "update",
            Stage::Restart => "restart",
        };
        f.write_str(name)
    }
}

/// What to compile and how far to go.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub complect_id: String,
    pub do_upload: bool,
    pub do_compile: bool,
    pub do_update: bool,
}

impl CompileRequest {
    pub fn full(complect_id: impl Into<String>) -> Self {
        Self {
            complect_id: complect_id.into(),
            do_upload: true,
            do_compile: true,
            do_update: true,
        }
    }
}

/// Stage results of one compile invocation. Unset stages did not run.
#[derive(Debug, Clone, Default)]
pub struct CompileRun {
    /// Target name of the compiler backend.
    pub host: String,
    pub download: Option<ExecResult>,
    pub preprocess: Option<ExecResult>,
    pub upload: Option<ExecResult>,
    pub compile: Option<ExecResult>,
    pub update: Option<ExecResult>,
    pub restart: Option<ExecResult>,
    /// Stages skipped because the backend variant does not implement them.
    pub not_applicable: Vec<Stage>,
    pub remote_path: Option<RemotePath>,
    pub error: Option<CapturedError>,
}

impl CompileRun {
    fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    pub fn stdout(&self) -> String {
        combined_stdout([
            self.download.as_ref(),
            self.preprocess.as_ref(),
            self.upload.as_ref(),
            self.compile.as_ref(),
            self.update.as_ref(),
            self.restart.as_ref(),
        ])
    }

    /// Stage stdout followed by the captured error, if any.
    pub fn output(&self) -> String {
        let mut output = self.stdout();
        if let Some(error) = &self.error {
            output.push_str("ERROR: ");
            output.push_str(&error.message);
        }
        output
    }

    /// The compiler ran, exited 0 and reported no template errors.
    pub fn is_success(&self, messages: &[EngineMessage]) -> bool {
        self.compile
            .as_ref()
            .map(|c| c.success() && messages.is_empty())
            .unwrap_or(false)
    }

    /// Parse compiler messages out of the stage output and enrich them.
    pub async fn messages(&self, catalog: Option<&dyn TemplateCatalog>) -> Vec<EngineMessage> {
        let stdout = self.stdout();
        if stdout.is_empty() {
            return Vec::new();
        }
        let mut messages = parse_engine_output(&stdout);
        if let Some(catalog) = catalog {
            enrich(catalog, &mut messages).await;
        }
        messages
    }

    /// Result document persisted for a compile task.
    pub fn to_result(&self, messages: &[EngineMessage]) -> Value {
        fn stage(result: &Option<ExecResult>) -> Value {
            result
                .as_ref()
                .map(|r| json!({"code": r.code, "out": r.out, "err": r.err}))
                .unwrap_or_else(|| json!({}))
        }

        json!({
            "output": self.output(),
            "messages": messages.iter().map(EngineMessage::to_json).collect::<Vec<_>>(),
            "success": self.is_success(messages),
            "_run": {
                "p0": stage(&self.download),
                "p1": stage(&self.preprocess),
                "p2": stage(&self.compile),
                "host": self.host,
                "path": self.remote_path.as_ref().map(|p| p.remote_path.as_str()).unwrap_or(""),
                "exc_error": self.error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
                "exc_traceback": self.error.as_ref().map(|e| e.trace.as_str()).unwrap_or(""),
            },
        })
    }
}

/// Runs the compile stages against one backend.
pub struct CompilePipeline {
    preprocessor: Arc<dyn Preprocessor>,
    root_dir: PathBuf,
}

impl CompilePipeline {
    pub fn new(preprocessor: Arc<dyn Preprocessor>, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            preprocessor,
            root_dir: root_dir.into(),
        }
    }

    /// Run the stages. The backend is closed before returning.
    pub async fn execute(&self, backend: &mut dyn Backend, request: &CompileRequest) -> CompileRun {
        let mut run = CompileRun::new(backend.target());
        info!(complect_id = %request.complect_id, target = backend.target(), "Compiling");

        let error = capture(self.run_stages(&mut *backend, request, &mut run)).await;
        run.error = error;
        close_backend(backend).await;

        run
    }

    async fn run_stages(
        &self,
        backend: &mut dyn Backend,
        request: &CompileRequest,
        run: &mut CompileRun,
    ) -> complect_core::Result<()> {
        let work_dir = self.create_work_dir().await?;
        debug!(work_dir = %work_dir.display(), "Created work dir");

        backend.connect().await?;

        let download = self
            .preprocessor
            .download(&work_dir, &request.complect_id)
            .await;
        let failed = failed_with_stderr(&download.result);
        run.download = Some(download.result);
        if failed {
            return stop(Stage::Download, "download failed");
        }
        let base_path = download.base_path;

        let preprocess = self.preprocessor.preprocess(&base_path).await;
        let failed = failed_with_stderr(&preprocess);
        run.preprocess = Some(preprocess);
        if !request.do_upload {
            return stop(Stage::Preprocess, "upload not requested");
        }
        if failed {
            return stop(Stage::Preprocess, "preprocess failed");
        }

        let upload = backend.upload(&base_path).await?;
        let path = upload.path;
        let failed = !upload.result.success();
        run.upload = Some(upload.result);
        run.remote_path = Some(path.clone());
        if !request.do_compile {
            return stop(Stage::Upload, "compile not requested");
        }
        if failed {
            return stop(Stage::Upload, "upload failed");
        }

        let compile = backend.compile(&path).await?;
        let failed = !compile.success();
        run.compile = Some(compile);
        if !request.do_update {
            return stop(Stage::Compile, "update not requested");
        }
        if failed {
            return stop(Stage::Compile, "compile failed");
        }

        let capabilities = backend.capabilities();
        if !capabilities.update {
            run.not_applicable.extend([Stage::Update, Stage::Restart]);
            self.cleanup().await;
            return stop(Stage::Compile, "backend has no update");
        }
        let update = backend.update(&path).await?;
        let failed = !update.success();
        run.update = Some(update);
        if failed {
            return stop(Stage::Update, "update failed");
        }

        if !capabilities.restart {
            run.not_applicable.push(Stage::Restart);
            self.cleanup().await;
            return stop(Stage::Update, "backend has no restart");
        }
        let restart = backend.restart().await?;
        let failed = !restart.success();
        run.restart = Some(restart);
        if failed {
            return stop(Stage::Restart, "restart failed");
        }

        self.cleanup().await;
        debug!("Compile pipeline completed");
        Ok(())
    }

    async fn create_work_dir(&self) -> complect_core::Result<PathBuf> {
        let dir = self
            .root_dir
            .join(format!("{}_{}", WORK_DIR_PREFIX, uuid::Uuid::now_v7().simple()));
        tokio::fs::create_dir_all(&dir).await?;
        open_permissions(&dir).await?;
        Ok(dir)
    }

    async fn cleanup(&self) {
        sweep(&self.root_dir, RETENTION).await;
    }
}

/// Download and preprocess treat any stderr output as fatal.
fn failed_with_stderr(result: &ExecResult) -> bool {
    !result.success() || !result.err.is_empty()
}

fn stop(stage: Stage, reason: &str) -> complect_core::Result<()> {
    debug!(stage = %stage, reason, "Stopping compile pipeline");
    Ok(())
}

// The preprocessing tools may run under another user.
#[cfg(unix)]
async fn open_permissions(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777)).await
}

#[cfg(not(unix))]
async fn open_permissions(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
