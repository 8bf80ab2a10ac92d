//! Compiler output parsing.
//!
//! The engine compiler reports template errors in sections introduced by a
//! `file:` line:
//!
//! ```text
//! file: a.tpl
//!   ERROR: bad token
//!   Id: T1
//!   STRING: near here
//! ```
//!
//! Each `ERROR:` line opens a message, `Id:` attaches the template id and a
//! `STRING:` line or a blank line closes it. `[WARN]` and `[FAILED]` lines
//! close any open message.

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::LazyLock;
use tracing::error;

static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ERROR: (.*?)$").unwrap());
static ID_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)Id: ([\w.-]+)$").unwrap());
static STRING_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)STRING: (.*?)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Error,
    Warning,
}

/// One compiler diagnostic tied to a template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineMessage {
    pub status: MessageStatus,
    pub message: String,
    pub template_id: String,
    pub near_text: String,
    pub suite_id: String,
    pub profile_id: String,
    pub template_meta: Value,
}

impl EngineMessage {
    fn error(message: impl Into<String>) -> Self {
        Self {
            status: MessageStatus::Error,
            message: message.into(),
            template_id: String::new(),
            near_text: String::new(),
            suite_id: String::new(),
            profile_id: String::new(),
            template_meta: Value::Object(Map::new()),
        }
    }

    /// Document shape stored in task results.
    pub fn to_json(&self) -> Value {
        json!({
            "status": self.status,
            "message": self.message,
            "type": "template",
            "template_id": self.template_id,
            "suite_id": self.suite_id,
            "profile_id": self.profile_id,
            "near_text": self.near_text,
            "template_meta": self.template_meta,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    WaitForSection,
    InMessage,
}

/// Extract error messages from raw compiler stdout.
pub fn parse_engine_output(output: &str) -> Vec<EngineMessage> {
    let mut state = ScanState::WaitForSection;
    let mut messages = Vec::new();
    let mut current: Option<EngineMessage> = None;

    for line in output.split('\n') {
        let cmd = line.trim_start();

        match state {
            ScanState::WaitForSection => {
                if cmd.starts_with("file:") {
                    state = ScanState::InMessage;
                }
            }
            ScanState::InMessage => {
                if let Some(caps) = ERROR_REGEX.captures(cmd) {
                    current = Some(EngineMessage::error(&caps[1]));
                }

                if let (Some(caps), Some(message)) = (ID_REGEX.captures(cmd), current.as_mut()) {
                    message.template_id = caps[1].to_string();
                }

                let near_text = STRING_REGEX.captures(cmd);
                if current.is_some() && (near_text.is_some() || cmd.is_empty()) {
                    if let Some(mut message) = current.take() {
                        if let Some(caps) = near_text {
                            message.near_text = caps[1].to_string();
                        }
                        messages.push(message);
                    }
                }
            }
        }

        if cmd.starts_with("[WARN]") || cmd.starts_with("[FAILED]") {
            if let Some(message) = current.take() {
                messages.push(message);
            }
        }
    }

    messages
}

/// Parent suite and metadata of a template.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateInfo {
    pub suite_id: String,
    pub meta: Value,
}

/// Lookup of template and suite records by id.
#[async_trait]
pub trait TemplateCatalog: Send + Sync {
    async fn template(&self, template_id: &str) -> anyhow::Result<TemplateInfo>;

    /// Profile id owning a suite.
    async fn suite_profile(&self, suite_id: &str) -> anyhow::Result<String>;
}

/// Fill in suite, profile and template metadata for messages with a template id.
///
/// Lookup failures are logged and leave the fields empty.
pub async fn enrich(catalog: &dyn TemplateCatalog, messages: &mut [EngineMessage]) {
    for message in messages.iter_mut() {
        if message.template_id.is_empty() {
            continue;
        }

        match catalog.template(&message.template_id).await {
            Ok(info) => {
                message.suite_id = info.suite_id;
                message.template_meta = info.meta;
            }
            Err(e) => {
                error!(template_id = %message.template_id, error = ?e, "Can't find suite for template");
            }
        }

        if !message.suite_id.is_empty() {
            match catalog.suite_profile(&message.suite_id).await {
                Ok(profile_id) => message.profile_id = profile_id,
                Err(e) => {
                    error!(suite_id = %message.suite_id, error = ?e, "Can't find profile for suite");
                }
            }
        }
    }
}
