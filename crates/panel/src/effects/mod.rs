//! Side-effect engine: turns a completed job into domain state changes.
//!
//! Handlers are pure functions from a completed job to a list of
//! [`DomainEvent`]s. The [`EffectRegistry`] routes a job type to its handler
//! (exact types win over `family.` prefixes) and the applier in [`apply`]
//! writes the events into [`PanelState`](crate::store::PanelState).

pub mod apply;
pub mod handlers;

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::model::{
    DdosPolicy, DdosStatus, DomainStatus, InstanceStatus, Job, JobStatus, JsonMap, QueryStatus, TsFlavor,
};
use crate::payload::JobPayload;
use crate::ports::PortRule;

pub use apply::{Applied, DiskThresholds};

/// Everything a handler may look at.
#[derive(Debug, Clone, Copy)]
pub struct EffectInput<'a> {
    pub job: &'a Job,
    pub payload: &'a JobPayload,
    pub status: JobStatus,
    pub output: &'a JsonMap,
    pub completed_at: DateTime<Utc>,
}

impl EffectInput<'_> {
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    DomainStatusChanged { domain_id: String, status: DomainStatus },
    CertificateIssued { domain_id: String, expires_at: DateTime<Utc> },
    FirewallApplied { node_id: String, opened: Vec<PortRule>, closed: Vec<PortRule> },
    DdosStatusReported(DdosStatus),
    DdosPolicyApplied(DdosPolicy),
    TsServerStatusChanged { ts_server_id: String, flavor: TsFlavor, status: InstanceStatus },
    InstanceStatusChanged { instance_id: String, status: InstanceStatus },
    /// Enqueue a disk scan unless one is in flight or usage is already known.
    DiskScanRequested { instance_id: String, node_id: Option<String> },
    InstancePortsReleased { instance_id: String },
    InstanceDiskScanned { instance_id: String, used_bytes: Option<u64>, error: Option<String> },
    NodeDiskReported { node_id: String, total_bytes: Option<u64>, free_bytes: Option<u64>, error: Option<String> },
    QueryStatusChanged { instance_id: String, status: QueryStatus },
    BackupFinished { backup_id: String, succeeded: bool, size_bytes: Option<u64>, error: Option<String> },
    UserAnonymized { user_id: String, request_id: String },
}

pub type EffectHandler = fn(&EffectInput<'_>) -> Vec<DomainEvent>;

#[derive(Clone, Default)]
pub struct EffectRegistry {
    exact: HashMap<String, EffectHandler>,
    prefixes: Vec<(String, EffectHandler)>,
}

impl EffectRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: &str, handler: EffectHandler) -> &mut Self {
        self.exact.insert(job_type.to_string(), handler);
        self
    }

    /// Route every job type starting with `prefix` (e.g. `"ts3."`).
    pub fn register_prefix(&mut self, prefix: &str, handler: EffectHandler) -> &mut Self {
        self.prefixes.push((prefix.to_string(), handler));
        // longest prefix first
        self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    pub fn handler_for(&self, job_type: &str) -> Option<EffectHandler> {
        self.exact.get(job_type).copied().or_else(|| {
            self.prefixes
                .iter()
                .find(|(prefix, _)| job_type.starts_with(prefix.as_str()))
                .map(|(_, h)| *h)
        })
    }

    /// Events for a completed job; unknown types yield none.
    pub fn events_for(&self, input: &EffectInput<'_>) -> Vec<DomainEvent> {
        self.handler_for(&input.job.job_type).map(|h| h(input)).unwrap_or_default()
    }

    /// The built-in table for every job family the panel understands.
    pub fn with_defaults() -> Self {
        let mut r = Self::empty();
        r.register("domain.add", handlers::domain_added)
            .register("domain.ssl.issue", handlers::certificate_issued)
            .register("firewall.open_ports", handlers::firewall_applied)
            .register("firewall.close_ports", handlers::firewall_applied)
            .register("ddos.status.check", handlers::ddos_status)
            .register("ddos.policy.apply", handlers::ddos_policy)
            .register("instance.disk.scan", handlers::instance_disk_scan)
            .register("node.disk.stat", handlers::node_disk_stat)
            .register("server.status.check", handlers::query_status)
            .register("instance.query.check", handlers::query_status)
            .register("instance.backup.create", handlers::backup_finished)
            .register("gdpr.anonymize_user", handlers::user_anonymized)
            .register_prefix("ts3.", handlers::ts_lifecycle)
            .register_prefix("ts6.", handlers::ts_lifecycle)
            .register_prefix("instance.", handlers::instance_lifecycle);
        r
    }
}

impl std::fmt::Debug for EffectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut exact: Vec<&String> = self.exact.keys().collect();
        exact.sort();
        f.debug_struct("EffectRegistry")
            .field("exact", &exact)
            .field("prefixes", &self.prefixes.iter().map(|(p, _)| p).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &EffectInput<'_>) -> Vec<DomainEvent> {
        Vec::new()
    }

    #[test]
    fn exact_entries_beat_prefixes() {
        let r = EffectRegistry::with_defaults();
        assert_eq!(r.handler_for("instance.disk.scan").map(|h| h as usize), Some(handlers::instance_disk_scan as usize));
        assert_eq!(r.handler_for("instance.start").map(|h| h as usize), Some(handlers::instance_lifecycle as usize));
        assert_eq!(r.handler_for("ts6.server.stop").map(|h| h as usize), Some(handlers::ts_lifecycle as usize));
        assert!(r.handler_for("mail.box.create").is_none());
    }

    #[test]
    fn longest_prefix_wins() {
        let mut r = EffectRegistry::empty();
        r.register_prefix("instance.", handlers::instance_lifecycle).register_prefix("instance.mod.", noop);
        assert_eq!(r.handler_for("instance.mod.install").map(|h| h as usize), Some(noop as usize));
    }
}
