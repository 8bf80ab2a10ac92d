//! Task status notifications.

use async_trait::async_trait;
use complect_core::Task;
use serde_json::{Value, json};
use tracing::{debug, warn};

pub const TASK_REPORT_EVENT: &str = "task_report";

/// Receives every task status transition. Delivery is best effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, task: &Task);
}

/// Drops notifications; used when no listener is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _task: &Task) {}
}

pub fn notification_payload(task: &Task) -> Value {
    json!({
        "event": TASK_REPORT_EVENT,
        "data": {
            "data": {
                "task_id": task.id.to_string(),
                "status": task.status,
            }
        },
        "namespace": task.namespace(),
    })
}

/// POSTs notifications to `<base>/send_notification`.
pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: Option<reqwest::Url>,
}

impl WebhookNotifier {
    pub fn new(base_url: &str) -> Self {
        let endpoint = match reqwest::Url::parse(base_url).and_then(|base| base.join("send_notification")) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(url = base_url, error = %e, "Invalid notifier URL");
                None
            }
        };
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    pub fn endpoint(&self) -> Option<&reqwest::Url> {
        self.endpoint.as_ref()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, task: &Task) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };
        let sent = self
            .client
            .post(endpoint.clone())
            .json(&notification_payload(task))
            .send()
            .await
            .and_then(|response| response.error_for_status());
        if let Err(e) = sent {
            debug!(task_id = %task.id, error = %e, "Notification not delivered");
        }
    }
}
