//! Queued tasks and their audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, TaskId};

/// Lifecycle status of a task.
///
/// `Enqueued -> Working -> (Finished | Failed)`; terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Enqueued,
    Working,
    Finished,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Enqueued => "enqueued",
            TaskStatus::Working => "working",
            TaskStatus::Finished => "finished",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueued" => Ok(TaskStatus::Enqueued),
            "working" => Ok(TaskStatus::Working),
            "finished" => Ok(TaskStatus::Finished),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(Error::InvalidInput(format!("unknown task status: {}", other))),
        }
    }
}

/// A unit of work in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Registry key of the handler that executes this task.
    pub script: String,
    /// Routing category, e.g. `compiler` or `deploy`.
    pub task_type: String,
    pub args: Map<String, Value>,
    pub result: Option<Value>,
    pub errortext: Option<String>,
    pub meta: Value,
    pub extra: Option<Value>,
    /// Worker identity holding the task; set only while `Working`.
    pub locked_by: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: Option<DateTime<Utc>>,
}

impl Task {
    /// `locked_by` is set iff working, `result` is set iff terminal.
    pub fn is_consistent(&self) -> bool {
        let lock_ok = self.locked_by.is_some() == (self.status == TaskStatus::Working);
        let result_ok = self.result.is_some() == self.status.is_terminal();
        lock_ok && result_ok
    }

    /// Routing namespace used for status notifications.
    pub fn namespace(&self) -> String {
        format!("/{}", self.task_type)
    }
}

/// Append-only audit row written on every status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub id: i64,
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub meta: Value,
    pub created: DateTime<Utc>,
}

/// Equality predicate over a top-level key of `Task::args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingFilter {
    pub key: String,
    pub value: String,
}

impl RoutingFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, args: &Map<String, Value>) -> bool {
        args.get(&self.key)
            .and_then(|v| v.as_str())
            .map(|v| v == self.value)
            .unwrap_or(false)
    }
}

/// Value returned by a task handler that completed normally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub result: Value,
    pub extra: Option<Value>,
}

impl TaskOutcome {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_task(status: TaskStatus) -> Task {
        Task {
            id: TaskId::new(),
            status,
            script: "scripts.compiler.run".to_string(),
            task_type: "compiler".to_string(),
            args: Map::new(),
            result: None,
            errortext: None,
            meta: json!({}),
            extra: None,
            locked_by: None,
            created: Utc::now(),
            updated: None,
        }
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            TaskStatus::Enqueued,
            TaskStatus::Working,
            TaskStatus::Finished,
            TaskStatus::Failed,
        ] {
            let parsed: TaskStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Enqueued.is_terminal());
        assert!(!TaskStatus::Working.is_terminal());
        assert!(TaskStatus::Finished.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_consistency_rules() {
        let enqueued = make_task(TaskStatus::Enqueued);
        assert!(enqueued.is_consistent());

        let mut working = make_task(TaskStatus::Working);
        assert!(!working.is_consistent());
        working.locked_by = Some("compiler-a".to_string());
        assert!(working.is_consistent());

        let mut finished = make_task(TaskStatus::Finished);
        assert!(!finished.is_consistent());
        finished.result = Some(json!({"success": true}));
        assert!(finished.is_consistent());
    }

    #[test]
    fn test_routing_filter_matches_string_values_only() {
        let mut args = Map::new();
        args.insert("target".to_string(), json!("sova"));
        args.insert("count".to_string(), json!(3));

        assert!(RoutingFilter::new("target", "sova").matches(&args));
        assert!(!RoutingFilter::new("target", "other").matches(&args));
        assert!(!RoutingFilter::new("count", "3").matches(&args));
        assert!(!RoutingFilter::new("missing", "").matches(&args));
    }

    #[test]
    fn test_namespace() {
        let task = make_task(TaskStatus::Enqueued);
        assert_eq!(task.namespace(), "/compiler");
    }
}
