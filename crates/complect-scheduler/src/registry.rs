//! Script registry.
//!
//! Maps the `script` strings producers write into tasks to typed handlers.

use anyhow::{Context, bail};
use async_trait::async_trait;
use complect_config::WorkerSpec;
use complect_core::{ArtifactLocation, Task, TaskOutcome};
use complect_executor::engine::ARTIFACT_NAME;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::compile::{CompilePipeline, CompileRequest};
use crate::context::{Stores, WorkerContext};
use crate::deploy::DeployPipeline;
use crate::error::{SchedulerError, SchedulerResult};

pub const COMPILER_SCRIPT: &str = "scripts.compiler.run";
pub const DEPLOY_SCRIPT: &str = "scripts.deploy.run";

/// A function a task can run.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(
        &self,
        ctx: &WorkerContext,
        stores: &Stores,
        args: Map<String, Value>,
    ) -> anyhow::Result<TaskOutcome>;
}

pub struct Registry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with the compile and deploy handlers.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(COMPILER_SCRIPT, Arc::new(CompileHandler));
        registry.register(DEPLOY_SCRIPT, Arc::new(DeployHandler));
        registry
    }

    pub fn register(&mut self, script: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(script.into(), handler);
    }

    pub fn resolve(&self, script: &str) -> SchedulerResult<Arc<dyn TaskHandler>> {
        self.handlers
            .get(script)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownScript(script.to_string()))
    }

    pub fn scripts(&self) -> Vec<&str> {
        let mut scripts: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        scripts.sort_unstable();
        scripts
    }
}

/// Invocation arguments: worker extras, then task args, then injected values.
pub fn merge_args(spec: &WorkerSpec, task: &Task) -> Map<String, Value> {
    let mut args = spec.extra.clone();
    args.extend(task.args.clone());
    if spec.injects_task_id() {
        args.insert("task_id".to_string(), Value::String(task.id.to_string()));
    }
    args
}

fn parse_args<T: DeserializeOwned>(script: &str, args: Map<String, Value>) -> SchedulerResult<T> {
    serde_json::from_value(Value::Object(args)).map_err(|e| SchedulerError::InvalidArguments {
        script: script.to_string(),
        message: e.to_string(),
    })
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompilerArgs {
    pub complect_id: String,
    pub compiler_host: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub try_create_revision: bool,
    #[serde(default = "yes")]
    pub do_upload: bool,
    #[serde(default = "yes")]
    pub do_compile: bool,
    #[serde(default = "yes")]
    pub do_update: bool,
}

impl CompilerArgs {
    fn request(&self) -> CompileRequest {
        CompileRequest {
            complect_id: self.complect_id.clone(),
            do_upload: self.do_upload,
            do_compile: self.do_compile,
            do_update: self.do_update,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeployArgs {
    pub complect_revision_id: String,
    pub target: String,
    #[serde(default)]
    pub task_id: Option<String>,
}

/// `scripts.compiler.run`
pub struct CompileHandler;

#[async_trait]
impl TaskHandler for CompileHandler {
    async fn run(
        &self,
        ctx: &WorkerContext,
        stores: &Stores,
        args: Map<String, Value>,
    ) -> anyhow::Result<TaskOutcome> {
        let args: CompilerArgs = parse_args(COMPILER_SCRIPT, args)?;
        info!(
            complect_id = %args.complect_id,
            compiler_host = %args.compiler_host,
            target = ?args.target,
            "Running compile"
        );

        let mut backend = ctx.backends.compiler(&args.compiler_host)?;
        let pipeline = CompilePipeline::new(ctx.preprocessor.clone(), &ctx.root_dir);
        let run = pipeline.execute(backend.as_mut(), &args.request()).await;

        if let Some(error) = run.error.as_ref().filter(|e| e.configuration) {
            bail!("compile on {} failed: {}", args.compiler_host, error.message);
        }

        let messages = run.messages(ctx.catalog.as_deref()).await;
        let mut result = run.to_result(&messages);
        let mut extra = json!({ "complect_id": args.complect_id });
        info!(success = %result["success"], messages = messages.len(), "Got compile result");

        if args.try_create_revision {
            if let Some(path) = &run.remote_path {
                let complect_id = Uuid::parse_str(&args.complect_id)
                    .with_context(|| format!("complect_id {} is not a UUID", args.complect_id))?;
                let location = ArtifactLocation::new(
                    &args.compiler_host,
                    format!("{}/{}", path.remote_path.trim_end_matches('/'), ARTIFACT_NAME),
                );
                let revision = stores
                    .revisions
                    .create(complect_id, Some(&location.encode()))
                    .await
                    .context("creating complect revision")?;
                info!(revision = %revision.code, binary_path = %location, "Created complect revision");

                let revision_id = revision.revision_id.to_string();
                result["complect_revision_id"] = json!(revision_id);
                result["complect_revision_code"] = json!(revision.code);
                extra["complect_revision_id"] = json!(revision_id);
            }
        }

        Ok(TaskOutcome::new(result).with_extra(extra))
    }
}

/// `scripts.deploy.run`
pub struct DeployHandler;

#[async_trait]
impl TaskHandler for DeployHandler {
    async fn run(
        &self,
        ctx: &WorkerContext,
        stores: &Stores,
        args: Map<String, Value>,
    ) -> anyhow::Result<TaskOutcome> {
        let args: DeployArgs = parse_args(DEPLOY_SCRIPT, args)?;
        info!(
            complect_revision_id = %args.complect_revision_id,
            target = %args.target,
            task_id = ?args.task_id,
            "Running deploy"
        );

        let revision_id = Uuid::parse_str(&args.complect_revision_id).map_err(|e| {
            SchedulerError::InvalidArguments {
                script: DEPLOY_SCRIPT.to_string(),
                message: format!("complect_revision_id: {}", e),
            }
        })?;

        let pipeline = DeployPipeline::new(stores.revisions.clone(), ctx.backends.clone(), &ctx.root_dir);
        let run = pipeline.execute(revision_id, &args.target).await;

        if let Some(error) = run.error.as_ref().filter(|e| e.configuration) {
            bail!("deploy to {} failed: {}", args.target, error.message);
        }

        let extra = json!({
            "complect_revision_id": args.complect_revision_id,
            "complect_id": run.complect_id,
        });
        Ok(TaskOutcome::new(run.to_result()).with_extra(extra))
    }
}
