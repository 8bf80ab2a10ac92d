//! Poll loop that claims and executes tasks for one worker spec.

use complect_config::{SystemConfig, WorkerSpec};
use complect_core::{Task, TaskOutcome};
use complect_db::{DbError, DbResult, create_pool};
use futures::FutureExt;
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, error, info, info_span, warn};

use crate::context::{Stores, WorkerContext};
use crate::pipeline::panic_message;
use crate::registry::{Registry, merge_args};

/// Pause before re-establishing a lost store connection.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Why a task ended up failed.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    /// Short message stored in the result document.
    pub message: String,
    /// Full error chain, stored as `errortext`.
    pub errortext: String,
}

impl TaskFailure {
    fn from_error(error: &anyhow::Error) -> Self {
        Self {
            message: format!("{:#}", error),
            errortext: format!("{:?}", error),
        }
    }

    fn from_store_error(error: &DbError) -> Self {
        Self {
            message: format!("Can't store task outcome: {}", error),
            errortext: format!("{:?}", error),
        }
    }

    pub fn result(&self) -> Value {
        json!({
            "output": self.message,
            "success": false,
            "messages": [],
        })
    }
}

pub struct Worker {
    ctx: Arc<WorkerContext>,
    registry: Registry,
}

impl Worker {
    pub fn new(ctx: Arc<WorkerContext>, registry: Registry) -> Self {
        Self { ctx, registry }
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.ctx.spec
    }

    /// Force-fail tasks a previous process left working under this identity.
    pub async fn recover(&self, stores: &Stores) -> DbResult<usize> {
        let recovered = stores.queue.recover_stale(&self.ctx.spec.name).await?;
        for task in &recovered {
            warn!(task_id = %task.id, worker = %self.ctx.spec.name, "Failed stale task");
            self.ctx.notifier.notify(task).await;
        }
        Ok(recovered.len())
    }

    /// Poll until the store connection is lost.
    ///
    /// Task failures never end the loop; only store connectivity errors do.
    pub async fn run(&self, stores: &Stores) -> DbError {
        info!(worker = %self.ctx.spec.name, task_type = %self.ctx.spec.task_type, "Starting worker");

        loop {
            match self.poll_once(stores).await {
                Ok(true) => {}
                Ok(false) => sleep(self.ctx.poll_interval).await,
                Err(e) if e.is_connection_error() => {
                    error!(worker = %self.ctx.spec.name, error = %e, "Lost store connection");
                    return e;
                }
                Err(e) => {
                    error!(worker = %self.ctx.spec.name, error = %e, "Unhandled error in task cycle");
                    sleep(self.ctx.poll_interval).await;
                }
            }
        }
    }

    /// Claim and run one task. Returns whether a task was claimed.
    pub async fn poll_once(&self, stores: &Stores) -> DbResult<bool> {
        let spec = &self.ctx.spec;
        let Some(task) = stores
            .queue
            .claim(&spec.task_type, &spec.filters, &spec.name)
            .await?
        else {
            return Ok(false);
        };
        self.ctx.notifier.notify(&task).await;

        let span = info_span!(
            "task",
            task_id = %task.id,
            worker = %spec.name,
            script = %task.script
        );
        self.process(stores, task).instrument(span).await?;
        Ok(true)
    }

    async fn process(&self, stores: &Stores, task: Task) -> DbResult<()> {
        info!("Task in progress");

        let done = match self.invoke(stores, &task).await {
            Ok(outcome) => match stores.queue.finish(task.id, &outcome).await {
                Ok(done) => done,
                Err(e) if e.is_connection_error() => return Err(e),
                Err(e) => {
                    error!(error = %e, "Can't store task result");
                    self.store_failure(stores, &task, TaskFailure::from_store_error(&e))
                        .await?
                }
            },
            Err(failure) => {
                error!(error = %failure.message, "Task failed");
                self.store_failure(stores, &task, failure).await?
            }
        };

        info!(status = %done.status, "Completed task");
        self.ctx.notifier.notify(&done).await;
        Ok(())
    }

    /// Mark the task failed. A rejected failure document is replaced by one
    /// describing the store error, so the task never stays working.
    async fn store_failure(&self, stores: &Stores, task: &Task, failure: TaskFailure) -> DbResult<Task> {
        match stores
            .queue
            .fail(task.id, &failure.errortext, &failure.result())
            .await
        {
            Err(e) if !e.is_connection_error() => {
                error!(error = %e, "Can't store task failure");
                let fallback = TaskFailure::from_store_error(&e);
                stores
                    .queue
                    .fail(task.id, &fallback.errortext, &fallback.result())
                    .await
            }
            stored => stored,
        }
    }

    async fn invoke(&self, stores: &Stores, task: &Task) -> Result<TaskOutcome, TaskFailure> {
        let handler = self
            .registry
            .resolve(&task.script)
            .map_err(|e| TaskFailure::from_error(&e.into()))?;
        let args = merge_args(&self.ctx.spec, task);

        match AssertUnwindSafe(handler.run(&self.ctx, stores, args))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(TaskFailure::from_error(&e)),
            Err(payload) => {
                let message = format!("task panicked: {}", panic_message(payload.as_ref()));
                Err(TaskFailure {
                    errortext: message.clone(),
                    message,
                })
            }
        }
    }
}

/// Run a worker process: recover once, then poll forever, reconnecting to
/// the store whenever the connection is lost.
pub async fn run_worker(config: Arc<SystemConfig>, spec: WorkerSpec) -> anyhow::Result<()> {
    let database_url = config.database_url()?.to_string();
    let max_connections = config.database.max_connections;
    let ctx = Arc::new(WorkerContext::from_config(config, spec));
    let worker = Worker::new(ctx, Registry::builtin());
    let mut recovered = false;

    loop {
        match create_pool(&database_url, max_connections).await {
            Ok(pool) => {
                let stores = Stores::postgres(pool.clone());
                if !recovered {
                    match worker.recover(&stores).await {
                        Ok(count) => {
                            info!(worker = %worker.spec().name, count, "Startup recovery done");
                            recovered = true;
                        }
                        Err(e) => warn!(error = %e, "Startup recovery failed"),
                    }
                }
                if recovered {
                    worker.run(&stores).await;
                }
                pool.close().await;
            }
            Err(e) => warn!(error = %e, "Can't connect to the task store"),
        }
        sleep(RECONNECT_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{COMPILER_SCRIPT, TaskHandler};
    use crate::testing::{MemoryQueue, MemoryRevisions, MockBackend, MockBackends, context, stores, task};
    use async_trait::async_trait;
    use complect_core::{RoutingFilter, TaskStatus};
    use complect_db::{NewTask, RECOVERY_MESSAGE, TaskQueue};
    use serde_json::Map;
    use std::sync::atomic::Ordering;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn run(
            &self,
            _ctx: &WorkerContext,
            _stores: &Stores,
            args: Map<String, Value>,
        ) -> anyhow::Result<TaskOutcome> {
            Ok(TaskOutcome::new(Value::Object(args)))
        }
    }

    struct Broken;

    #[async_trait]
    impl TaskHandler for Broken {
        async fn run(
            &self,
            _ctx: &WorkerContext,
            _stores: &Stores,
            _args: Map<String, Value>,
        ) -> anyhow::Result<TaskOutcome> {
            Err(anyhow::anyhow!("disk full").context("writing archive"))
        }
    }

    struct Panics;

    #[async_trait]
    impl TaskHandler for Panics {
        async fn run(
            &self,
            _ctx: &WorkerContext,
            _stores: &Stores,
            _args: Map<String, Value>,
        ) -> anyhow::Result<TaskOutcome> {
            panic!("handler bug")
        }
    }

    fn spec() -> WorkerSpec {
        let mut extra = Map::new();
        extra.insert("compiler_host".to_string(), json!("sova"));
        WorkerSpec {
            name: "compiler-sova".to_string(),
            task_type: "compiler".to_string(),
            filters: vec![RoutingFilter::new("target", "main")],
            extra,
            inject: vec!["task_id".to_string()],
        }
    }

    fn worker(root: &std::path::Path) -> Worker {
        let mut registry = Registry::empty();
        registry.register("test.echo", Arc::new(Echo));
        registry.register("test.broken", Arc::new(Broken));
        registry.register("test.panics", Arc::new(Panics));
        let ctx = context(spec(), MockBackends::default(), root);
        Worker::new(Arc::new(ctx), registry)
    }

    fn setup() -> (tempfile::TempDir, Arc<MemoryQueue>, Stores) {
        let root = tempfile::tempdir().unwrap();
        let queue = Arc::new(MemoryQueue::default());
        let stores = stores(queue.clone(), Arc::new(MemoryRevisions::default()));
        (root, queue, stores)
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let (root, _queue, stores) = setup();
        assert!(!worker(root.path()).poll_once(&stores).await.unwrap());
    }

    #[tokio::test]
    async fn test_finished_task_gets_merged_args() {
        let (root, queue, stores) = setup();
        let task = task("test.echo", "compiler", json!({"target": "main", "complect_id": "c1"}));
        let id = task.id;
        queue.insert(task);

        assert!(worker(root.path()).poll_once(&stores).await.unwrap());

        let done = queue.task(id);
        assert_eq!(done.status, TaskStatus::Finished);
        assert!(done.is_consistent());
        let result = done.result.unwrap();
        assert_eq!(result["compiler_host"], "sova");
        assert_eq!(result["complect_id"], "c1");
        assert_eq!(result["task_id"], id.to_string());
        assert_eq!(
            queue.statuses(id),
            vec![TaskStatus::Working, TaskStatus::Finished]
        );
    }

    #[tokio::test]
    async fn test_rejected_result_still_fails_task() {
        let (root, queue, stores) = setup();
        let task = task("test.echo", "compiler", json!({"target": "main"}));
        let id = task.id;
        queue.insert(task);
        queue.rejected_writes.store(1, Ordering::SeqCst);

        assert!(worker(root.path()).poll_once(&stores).await.unwrap());

        let done = queue.task(id);
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.is_consistent());
        let result = done.result.unwrap();
        assert_eq!(result["success"], false);
        assert!(result["output"].as_str().unwrap().contains("result rejected"));
        assert!(done.errortext.unwrap().contains("InvalidRow"));
    }

    #[tokio::test]
    async fn test_rejected_failure_document_is_replaced() {
        let (root, queue, stores) = setup();
        let task = task("test.broken", "compiler", json!({"target": "main"}));
        let id = task.id;
        queue.insert(task);
        queue.rejected_writes.store(1, Ordering::SeqCst);

        assert!(worker(root.path()).poll_once(&stores).await.unwrap());

        let done = queue.task(id);
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.is_consistent());
        assert!(done.result.unwrap()["output"].as_str().unwrap().contains("result rejected"));
    }

    #[tokio::test]
    async fn test_routing_filters_apply() {
        let (root, queue, stores) = setup();
        queue.insert(task("test.echo", "compiler", json!({"target": "other"})));
        queue.insert(task("test.echo", "deploy", json!({"target": "main"})));

        assert!(!worker(root.path()).poll_once(&stores).await.unwrap());
    }

    #[tokio::test]
    async fn test_oldest_task_first() {
        let (root, queue, stores) = setup();
        let mut older = task("test.echo", "compiler", json!({"target": "main"}));
        older.created -= chrono::Duration::seconds(10);
        let newer = task("test.echo", "compiler", json!({"target": "main"}));
        let (older_id, newer_id) = (older.id, newer.id);
        queue.insert(newer);
        queue.insert(older);

        worker(root.path()).poll_once(&stores).await.unwrap();

        assert_eq!(queue.task(older_id).status, TaskStatus::Finished);
        assert_eq!(queue.task(newer_id).status, TaskStatus::Enqueued);
    }

    #[tokio::test]
    async fn test_unknown_script_fails_task() {
        let (root, queue, stores) = setup();
        let task = task("scripts.missing.run", "compiler", json!({"target": "main"}));
        let id = task.id;
        queue.insert(task);

        worker(root.path()).poll_once(&stores).await.unwrap();

        let failed = queue.task(id);
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.is_consistent());
        assert!(failed.errortext.unwrap().contains("unknown script: scripts.missing.run"));
        assert_eq!(failed.result.unwrap()["success"], false);
    }

    #[tokio::test]
    async fn test_handler_error_records_chain() {
        let (root, queue, stores) = setup();
        let task = task("test.broken", "compiler", json!({"target": "main"}));
        let id = task.id;
        queue.insert(task);

        worker(root.path()).poll_once(&stores).await.unwrap();

        let failed = queue.task(id);
        assert_eq!(failed.status, TaskStatus::Failed);
        let errortext = failed.errortext.unwrap();
        assert!(errortext.contains("writing archive"));
        assert!(errortext.contains("disk full"));
        assert_eq!(failed.result.unwrap()["output"], "writing archive: disk full");
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_kill_worker() {
        let (root, queue, stores) = setup();
        let bad = task("test.panics", "compiler", json!({"target": "main"}));
        let bad_id = bad.id;
        queue.insert(bad);
        let worker = worker(root.path());

        assert!(worker.poll_once(&stores).await.unwrap());
        let failed = queue.task(bad_id);
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.errortext.unwrap(), "task panicked: handler bug");

        let good = queue
            .enqueue(NewTask::new(
                "compiler",
                "test.echo",
                json!({"target": "main"}).as_object().cloned().unwrap(),
            ))
            .await
            .unwrap();
        assert!(worker.poll_once(&stores).await.unwrap());
        assert_eq!(queue.task(good.id).status, TaskStatus::Finished);
    }

    #[tokio::test]
    async fn test_recovery_is_idempotent() {
        let (root, queue, stores) = setup();
        let mut stale = task(COMPILER_SCRIPT, "compiler", json!({"target": "main"}));
        stale.status = TaskStatus::Working;
        stale.locked_by = Some("compiler-sova".to_string());
        let mut foreign = task(COMPILER_SCRIPT, "compiler", json!({"target": "main"}));
        foreign.status = TaskStatus::Working;
        foreign.locked_by = Some("compiler-other".to_string());
        let (stale_id, foreign_id) = (stale.id, foreign.id);
        queue.insert(stale);
        queue.insert(foreign);
        let worker = worker(root.path());

        assert_eq!(worker.recover(&stores).await.unwrap(), 1);
        assert_eq!(worker.recover(&stores).await.unwrap(), 0);

        let failed = queue.task(stale_id);
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.errortext.as_deref(), Some(RECOVERY_MESSAGE));
        assert_eq!(failed.result.unwrap()["output"], RECOVERY_MESSAGE);
        assert_eq!(queue.statuses(stale_id), vec![TaskStatus::Failed]);
        assert_eq!(queue.task(foreign_id).status, TaskStatus::Working);
    }

    #[tokio::test]
    async fn test_lost_connection_ends_run() {
        let (root, queue, stores) = setup();
        queue.disconnected.store(true, Ordering::SeqCst);

        let err = worker(root.path()).run(&stores).await;
        assert!(err.is_connection_error());
    }

    #[tokio::test]
    async fn test_compile_task_end_to_end() {
        let (root, queue, stores) = setup();
        let ctx = context(
            spec(),
            MockBackends::default().with_compiler("sova", MockBackend::ok()),
            root.path(),
        );
        let worker = Worker::new(Arc::new(ctx), Registry::builtin());
        let task = task(COMPILER_SCRIPT, "compiler", json!({"target": "main", "complect_id": "c1"}));
        let id = task.id;
        queue.insert(task);

        worker.poll_once(&stores).await.unwrap();

        let done = queue.task(id);
        assert_eq!(done.status, TaskStatus::Finished);
        assert_eq!(done.result.unwrap()["success"], true);
        assert_eq!(done.extra.unwrap(), json!({"complect_id": "c1"}));
    }
}
