//! Collaborators the engine reports to: the audit trail, operator
//! notifications and extension observers. All are fire-and-forget.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::model::{Agent, Job, JobResult, JsonMap};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    /// Dotted action name, e.g. `job.leased`.
    pub action: String,
    /// Agent id, `admin` or `system`.
    pub actor: String,
    pub subject: String,
    pub detail: JsonMap,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(action: &str, actor: &str, subject: &str, at: DateTime<Utc>) -> Self {
        Self {
            action: action.to_string(),
            actor: actor.to_string(),
            subject: subject.to_string(),
            detail: JsonMap::new(),
            at,
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    InstanceError,
    BackupFailed,
    DdosAttack,
    DiskCritical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub subject: String,
    pub message: String,
}

impl Notification {
    pub fn new(kind: NotificationKind, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self { kind, subject: subject.into(), message: message.into() }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Extension hooks around dispatch and ingestion. The engine is fully
/// functional with none registered.
pub trait JobObserver: Send + Sync {
    /// Returning `false` holds the job back from this agent for this poll.
    fn before_dispatch(&self, _job: &Job, _agent: &Agent) -> bool {
        true
    }

    fn after_result(&self, _job: &Job, _result: &JobResult) {}
}

/// Default audit sink: structured log lines on the `audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let detail = serde_json::Value::Object(event.detail);
        info!(target: "audit", action = %event.action, actor = %event.actor, subject = %event.subject, detail = %detail);
    }
}

#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, n: Notification) {
        warn!(target: "notify", kind = ?n.kind, subject = %n.subject, "{}", n.message);
    }
}

/// In-memory audit sink for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn actions(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.action).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notification: Notification) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification);
        }
    }
}
