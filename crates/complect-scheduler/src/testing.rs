//! In-memory stand-ins for the collaborator traits.

use async_trait::async_trait;
use chrono::Utc;
use complect_core::{
    Backend, BackendProvider, Capabilities, DownloadOutcome, Error, ExecResult, Preprocessor,
    RemotePath, RoutingFilter, Task, TaskId, TaskOutcome, TaskReport, TaskStatus, UploadOutcome,
};
use complect_config::WorkerSpec;
use complect_db::{
    DbError, DbResult, NewTask, RECOVERY_MESSAGE, RevisionRecord, RevisionRepo, TaskQueue,
    recovery_result, revision_code,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::context::{Stores, WorkerContext};
use crate::notify::NoopNotifier;

pub struct MockPreprocessor {
    pub download: ExecResult,
    pub preprocess: ExecResult,
}

impl MockPreprocessor {
    pub fn ok() -> Self {
        Self {
            download: ExecResult::new(0, "downloaded\n", ""),
            preprocess: ExecResult::new(0, "preprocessed\n", ""),
        }
    }
}

#[async_trait]
impl Preprocessor for MockPreprocessor {
    async fn download(&self, root_dir: &Path, _complect_id: &str) -> DownloadOutcome {
        DownloadOutcome {
            base_path: root_dir.join("source"),
            result: self.download.clone(),
        }
    }

    async fn preprocess(&self, _base_path: &Path) -> ExecResult {
        self.preprocess.clone()
    }
}

pub type CallLog = Arc<Mutex<Vec<&'static str>>>;

/// Backend that records calls and returns scripted results.
pub struct MockBackend {
    pub target: String,
    pub capabilities: Capabilities,
    pub connect_error: bool,
    pub upload: ExecResult,
    pub compile: ExecResult,
    pub update: ExecResult,
    pub restart: ExecResult,
    pub panic_on_compile: bool,
    pub calls: CallLog,
}

impl MockBackend {
    pub fn ok() -> Self {
        Self {
            target: "mock-target".to_string(),
            capabilities: Capabilities::ALL,
            connect_error: false,
            upload: ExecResult::new(0, "uploaded\n", ""),
            compile: ExecResult::new(0, "compiled\n", ""),
            update: ExecResult::new(0, "updated\n", ""),
            restart: ExecResult::new(0, "restarted\n", ""),
            panic_on_compile: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn connect(&mut self) -> complect_core::Result<()> {
        self.record("connect");
        if self.connect_error {
            return Err(Error::Remote("connection refused".to_string()));
        }
        Ok(())
    }

    async fn close(&mut self) -> complect_core::Result<()> {
        self.record("close");
        Ok(())
    }

    async fn upload(&mut self, _local_path: &Path) -> complect_core::Result<UploadOutcome> {
        self.record("upload");
        Ok(UploadOutcome {
            path: RemotePath::same("/dldata/complect_x"),
            result: self.upload.clone(),
        })
    }

    async fn compile(&mut self, _path: &RemotePath) -> complect_core::Result<ExecResult> {
        self.record("compile");
        if self.panic_on_compile {
            panic!("compiler crashed");
        }
        Ok(self.compile.clone())
    }

    async fn update(&mut self, _path: &RemotePath) -> complect_core::Result<ExecResult> {
        self.record("update");
        if !self.capabilities.update {
            return Err(Error::Unsupported {
                backend: "mock",
                operation: "update",
            });
        }
        Ok(self.update.clone())
    }

    async fn restart(&mut self) -> complect_core::Result<ExecResult> {
        self.record("restart");
        Ok(self.restart.clone())
    }

    async fn get_file(&mut self, _remote_path: &str, local_path: &Path) -> complect_core::Result<()> {
        self.record("get_file");
        std::fs::write(local_path, b"binary")?;
        Ok(())
    }
}

/// Hands out pre-built backends once each, by target name.
#[derive(Default)]
pub struct MockBackends {
    compilers: Mutex<HashMap<String, MockBackend>>,
    deployers: Mutex<HashMap<String, MockBackend>>,
    pub requested: Mutex<Vec<String>>,
}

impl MockBackends {
    pub fn with_compiler(self, target: &str, mut backend: MockBackend) -> Self {
        backend.target = target.to_string();
        self.compilers.lock().unwrap().insert(target.to_string(), backend);
        self
    }

    pub fn with_deployer(self, target: &str, mut backend: MockBackend) -> Self {
        backend.target = target.to_string();
        self.deployers.lock().unwrap().insert(target.to_string(), backend);
        self
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }

    fn take(
        &self,
        backends: &Mutex<HashMap<String, MockBackend>>,
        role: &str,
        target: &str,
    ) -> complect_core::Result<Box<dyn Backend>> {
        let backend = backends
            .lock()
            .unwrap()
            .remove(target)
            .ok_or_else(|| Error::Configuration(format!("no {} target {}", role, target)))?;
        self.requested.lock().unwrap().push(format!("{}:{}", role, target));
        Ok(Box::new(backend))
    }
}

impl BackendProvider for MockBackends {
    fn compiler(&self, target: &str) -> complect_core::Result<Box<dyn Backend>> {
        self.take(&self.compilers, "compiler", target)
    }

    fn deployer(&self, target: &str) -> complect_core::Result<Box<dyn Backend>> {
        self.take(&self.deployers, "deployer", target)
    }
}

#[derive(Default)]
pub struct MemoryRevisions {
    records: Mutex<HashMap<Uuid, RevisionRecord>>,
    sequences: Mutex<HashMap<Uuid, i32>>,
}

impl MemoryRevisions {
    pub fn insert(&self, record: RevisionRecord) {
        self.records.lock().unwrap().insert(record.revision_id, record);
    }

    pub fn all(&self) -> Vec<RevisionRecord> {
        let mut records: Vec<_> = self.records.lock().unwrap().values().cloned().collect();
        records.sort_by_key(|r| r.revision_number);
        records
    }
}

pub fn revision(binary_path: Option<&str>) -> RevisionRecord {
    let complect_id = Uuid::now_v7();
    RevisionRecord {
        revision_id: Uuid::now_v7(),
        complect_id,
        revision_number: 1,
        code: revision_code(&complect_id, 1),
        source_archive_path: String::new(),
        binary_path: binary_path.map(str::to_string),
        meta: json!({}),
        created: Utc::now(),
    }
}

#[async_trait]
impl RevisionRepo for MemoryRevisions {
    async fn create(&self, complect_id: Uuid, binary_path: Option<&str>) -> DbResult<RevisionRecord> {
        let number = {
            let mut sequences = self.sequences.lock().unwrap();
            let next = sequences.entry(complect_id).or_insert(0);
            *next += 1;
            *next
        };
        let record = RevisionRecord {
            revision_id: Uuid::now_v7(),
            complect_id,
            revision_number: number,
            code: revision_code(&complect_id, number),
            source_archive_path: String::new(),
            binary_path: binary_path.map(str::to_string),
            meta: json!({}),
            created: Utc::now(),
        };
        self.insert(record.clone());
        Ok(record)
    }

    async fn get(&self, revision_id: Uuid) -> DbResult<Option<RevisionRecord>> {
        Ok(self.records.lock().unwrap().get(&revision_id).cloned())
    }
}

/// Task queue over a vector, with a switch that simulates a lost connection.
#[derive(Default)]
pub struct MemoryQueue {
    tasks: Mutex<Vec<Task>>,
    reports: Mutex<Vec<TaskReport>>,
    pub disconnected: AtomicBool,
    /// Number of upcoming finish/fail writes to reject as invalid rows.
    pub rejected_writes: AtomicUsize,
}

impl MemoryQueue {
    pub fn insert(&self, task: Task) {
        self.tasks.lock().unwrap().push(task);
    }

    pub fn task(&self, id: TaskId) -> Task {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .unwrap()
    }

    pub fn statuses(&self, id: TaskId) -> Vec<TaskStatus> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.task_id == id)
            .map(|r| r.status)
            .collect()
    }

    fn check_connection(&self) -> DbResult<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(DbError::Database(sqlx::Error::PoolClosed));
        }
        Ok(())
    }

    fn report(&self, task: &Task) {
        let mut reports = self.reports.lock().unwrap();
        let id = reports.len() as i64 + 1;
        reports.push(TaskReport {
            id,
            task_id: task.id,
            status: task.status,
            meta: task.meta.clone(),
            created: Utc::now(),
        });
    }

    fn transition<F>(&self, id: TaskId, apply: F) -> DbResult<Task>
    where
        F: FnOnce(&mut Task),
    {
        self.check_connection()?;
        if self
            .rejected_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DbError::InvalidRow(format!("task {}: result rejected", id)));
        }
        let task = {
            let mut tasks = self.tasks.lock().unwrap();
            let task = tasks
                .iter_mut()
                .find(|t| t.id == id && t.status == TaskStatus::Working)
                .ok_or_else(|| DbError::NotFound(format!("working task {}", id)))?;
            apply(task);
            task.locked_by = None;
            task.updated = Some(Utc::now());
            task.clone()
        };
        self.report(&task);
        Ok(task)
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, new: NewTask) -> DbResult<Task> {
        self.check_connection()?;
        let task = Task {
            id: TaskId::new(),
            status: TaskStatus::Enqueued,
            script: new.script,
            task_type: new.task_type,
            args: new.args,
            result: None,
            errortext: None,
            meta: new.meta,
            extra: None,
            locked_by: None,
            created: Utc::now(),
            updated: None,
        };
        self.insert(task.clone());
        self.report(&task);
        Ok(task)
    }

    async fn claim(
        &self,
        task_type: &str,
        filters: &[RoutingFilter],
        worker: &str,
    ) -> DbResult<Option<Task>> {
        self.check_connection()?;
        let claimed = {
            let mut tasks = self.tasks.lock().unwrap();
            let next = tasks
                .iter_mut()
                .filter(|t| t.status == TaskStatus::Enqueued && t.task_type == task_type)
                .filter(|t| filters.iter().all(|f| f.matches(&t.args)))
                .min_by_key(|t| t.created);
            next.map(|task| {
                task.status = TaskStatus::Working;
                task.locked_by = Some(worker.to_string());
                task.updated = Some(Utc::now());
                task.clone()
            })
        };
        if let Some(task) = &claimed {
            self.report(task);
        }
        Ok(claimed)
    }

    async fn finish(&self, id: TaskId, outcome: &TaskOutcome) -> DbResult<Task> {
        self.transition(id, |task| {
            task.status = TaskStatus::Finished;
            task.result = Some(outcome.result.clone());
            task.extra = outcome.extra.clone();
        })
    }

    async fn fail(&self, id: TaskId, errortext: &str, result: &Value) -> DbResult<Task> {
        self.transition(id, |task| {
            task.status = TaskStatus::Failed;
            task.errortext = Some(errortext.to_string());
            task.result = Some(result.clone());
        })
    }

    async fn recover_stale(&self, worker: &str) -> DbResult<Vec<Task>> {
        self.check_connection()?;
        let stale: Vec<TaskId> = self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.status == TaskStatus::Working && t.locked_by.as_deref() == Some(worker))
            .map(|t| t.id)
            .collect();
        stale
            .into_iter()
            .map(|id| {
                self.transition(id, |task| {
                    task.status = TaskStatus::Failed;
                    task.errortext = Some(RECOVERY_MESSAGE.to_string());
                    task.result = Some(recovery_result());
                })
            })
            .collect()
    }

    async fn get(&self, id: TaskId) -> DbResult<Task> {
        self.check_connection()?;
        Ok(self.task(id))
    }

    async fn reports(&self, id: TaskId) -> DbResult<Vec<TaskReport>> {
        self.check_connection()?;
        Ok(self
            .reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.task_id == id)
            .cloned()
            .collect())
    }
}

pub fn task(script: &str, task_type: &str, args: Value) -> Task {
    Task {
        id: TaskId::new(),
        status: TaskStatus::Enqueued,
        script: script.to_string(),
        task_type: task_type.to_string(),
        args: args.as_object().cloned().unwrap_or_default(),
        result: None,
        errortext: None,
        meta: json!({}),
        extra: None,
        locked_by: None,
        created: Utc::now(),
        updated: None,
    }
}

pub fn context(spec: WorkerSpec, backends: MockBackends, root_dir: &Path) -> WorkerContext {
    WorkerContext {
        spec,
        poll_interval: Duration::from_millis(10),
        root_dir: root_dir.to_path_buf(),
        backends: Arc::new(backends),
        preprocessor: Arc::new(MockPreprocessor::ok()),
        catalog: None,
        notifier: Arc::new(NoopNotifier),
    }
}

pub fn stores(queue: Arc<MemoryQueue>, revisions: Arc<MemoryRevisions>) -> Stores {
    Stores { queue, revisions }
}
