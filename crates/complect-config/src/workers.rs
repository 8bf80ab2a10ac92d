//! Worker table derivation.
//!
//! Maps the configured targets to one worker process specification each.
//! Compiler and deployer workers are routed by the `target` task argument.

use crate::SystemConfig;
use crate::targets::RemoteTarget;
use complect_core::RoutingFilter;
use serde::Serialize;
use serde_json::{Map, Value};

/// Name of the injectable task id argument.
pub const INJECT_TASK_ID: &str = "task_id";

/// Configuration of one worker process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSpec {
    /// Stable identity the worker claims tasks under.
    pub name: String,
    pub task_type: String,
    pub filters: Vec<RoutingFilter>,
    /// Arguments merged under each task's own args.
    pub extra: Map<String, Value>,
    /// Values the poll loop adds to each invocation.
    pub inject: Vec<String>,
}

impl WorkerSpec {
    pub fn plain(task_type: impl Into<String>) -> Self {
        let task_type = task_type.into();
        Self {
            name: task_type.clone(),
            task_type,
            filters: Vec::new(),
            extra: Map::new(),
            inject: Vec::new(),
        }
    }

    pub fn injects_task_id(&self) -> bool {
        self.inject.iter().any(|v| v == INJECT_TASK_ID)
    }
}

fn routed(prefix: &str, task_type: &str, extra_key: &str, target: &RemoteTarget) -> WorkerSpec {
    let mut extra = Map::new();
    extra.insert(extra_key.to_string(), Value::String(target.name.clone()));

    WorkerSpec {
        name: format!("{}-{}", prefix, target.name),
        task_type: task_type.to_string(),
        filters: vec![RoutingFilter::new("target", target.routing_key())],
        extra,
        inject: vec![INJECT_TASK_ID.to_string()],
    }
}

/// Build the full worker table: plain workers, then compilers, then deployers.
pub fn worker_table(config: &SystemConfig) -> Vec<WorkerSpec> {
    let plain = config.worker_types.iter().map(WorkerSpec::plain);
    let compilers = config
        .compilers
        .iter()
        .map(|t| routed("compiler", "compiler", "compiler_host", t));
    let deployers = config
        .deployers
        .iter()
        .map(|t| routed("deploy", "deploy", "target", t));

    plain.chain(compilers).chain(deployers).collect()
}

pub fn find_worker(config: &SystemConfig, name: &str) -> Option<WorkerSpec> {
    worker_table(config).into_iter().find(|w| w.name == name)
}
