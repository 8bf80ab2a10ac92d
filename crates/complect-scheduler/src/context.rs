//! Explicit per-process state handed to the poll loop and task handlers.

use complect_config::{SystemConfig, WorkerSpec};
use complect_core::{BackendProvider, Preprocessor};
use complect_db::{PgRevisionRepo, PgTaskQueue, RevisionRepo, TaskQueue};
use complect_executor::{CommandPreprocessor, TargetBackends};
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::gateway::GatewayCatalog;
use crate::notify::{NoopNotifier, Notifier, WebhookNotifier};
use crate::output::TemplateCatalog;

/// Everything a worker needs besides its store connection.
///
/// Built once at process start from the loaded configuration.
pub struct WorkerContext {
    pub spec: WorkerSpec,
    pub poll_interval: Duration,
    /// Parent of local working directories.
    pub root_dir: PathBuf,
    pub backends: Arc<dyn BackendProvider>,
    pub preprocessor: Arc<dyn Preprocessor>,
    /// Enrichment source for compiler messages; none leaves them un-enriched.
    pub catalog: Option<Arc<dyn TemplateCatalog>>,
    pub notifier: Arc<dyn Notifier>,
}

impl WorkerContext {
    pub fn from_config(config: Arc<SystemConfig>, spec: WorkerSpec) -> Self {
        let notifier: Arc<dyn Notifier> = match &config.notifier_url {
            Some(url) => Arc::new(WebhookNotifier::new(url)),
            None => Arc::new(NoopNotifier),
        };
        let catalog = config
            .gateway_url
            .as_ref()
            .map(|url| Arc::new(GatewayCatalog::new(url.clone())) as Arc<dyn TemplateCatalog>);
        let preprocessor = Arc::new(CommandPreprocessor::new(
            config.preprocessor.clone(),
            config.gateway_url.clone(),
        ));

        Self {
            spec,
            poll_interval: config.worker.poll_interval,
            root_dir: config.worker.root_dir.clone(),
            backends: Arc::new(TargetBackends::new(config.clone())),
            preprocessor,
            catalog,
            notifier,
        }
    }
}

/// Store handles; rebuilt whenever the connection is re-established.
#[derive(Clone)]
pub struct Stores {
    pub queue: Arc<dyn TaskQueue>,
    pub revisions: Arc<dyn RevisionRepo>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            queue: Arc::new(PgTaskQueue::new(pool.clone())),
            revisions: Arc::new(PgRevisionRepo::new(pool)),
        }
    }
}
