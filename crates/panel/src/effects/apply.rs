//! Writes [`DomainEvent`]s into the panel state.

use chrono::{DateTime, Utc};
use common::JobPayloadMap;
use tracing::debug;

use super::DomainEvent;
use crate::config::PanelConfig;
use crate::error::PanelResult;
use crate::model::{
    BackupStatus, DeletionStatus, DiskLevel, DomainStatus, InstanceStatus, Job, NodeDisk,
};
use crate::ports::ReleaseSummary;
use crate::sinks::{Notification, NotificationKind};
use crate::store::{missing, PanelState};

/// Free-space thresholds, in percent, for the node disk state machine.
#[derive(Debug, Clone, Copy)]
pub struct DiskThresholds {
    pub warn_free_percent: f64,
    pub critical_free_percent: f64,
}

impl DiskThresholds {
    pub fn from_config(config: &PanelConfig) -> Self {
        Self {
            warn_free_percent: config.disk_warn_free_percent,
            critical_free_percent: config.disk_critical_free_percent,
        }
    }

    pub fn level_for(&self, free_percent: f64) -> DiskLevel {
        if free_percent < self.critical_free_percent {
            DiskLevel::Critical
        } else if free_percent < self.warn_free_percent {
            DiskLevel::Warning
        } else {
            DiskLevel::Ok
        }
    }
}

impl Default for DiskThresholds {
    fn default() -> Self {
        Self { warn_free_percent: 15.0, critical_free_percent: 5.0 }
    }
}

/// What applying events produced beyond the state change itself.
#[derive(Debug, Default)]
pub struct Applied {
    pub notifications: Vec<Notification>,
    pub created_jobs: Vec<Job>,
    pub released: Vec<ReleaseSummary>,
}

impl Applied {
    pub fn merge(&mut self, other: Applied) {
        self.notifications.extend(other.notifications);
        self.created_jobs.extend(other.created_jobs);
        self.released.extend(other.released);
    }
}

impl PanelState {
    /// Apply one event. Lookups happen before any write, so an `Err` leaves
    /// the state as it was.
    pub fn apply_event(&mut self, event: DomainEvent, disk: &DiskThresholds, now: DateTime<Utc>) -> PanelResult<Applied> {
        let mut applied = Applied::default();
        match event {
            DomainEvent::DomainStatusChanged { domain_id, status } => {
                let domain = self.domains.get_mut(&domain_id).ok_or_else(|| missing("domain", &domain_id))?;
                domain.status = status;
                domain.updated_at = Some(now);
            }
            DomainEvent::CertificateIssued { domain_id, expires_at } => {
                let domain = self.domains.get_mut(&domain_id).ok_or_else(|| missing("domain", &domain_id))?;
                domain.ssl_expires_at = Some(expires_at);
                if domain.status == DomainStatus::Pending {
                    domain.status = DomainStatus::Active;
                }
                domain.updated_at = Some(now);
            }
            DomainEvent::FirewallApplied { node_id, opened, closed } => {
                self.apply_firewall_change(&node_id, &opened, &closed, now);
            }
            DomainEvent::DdosStatusReported(status) => {
                let was_active = self.ddos_status.get(&status.node_id).map(|s| s.attack_active).unwrap_or(false);
                if status.attack_active && !was_active {
                    applied.notifications.push(Notification::new(
                        NotificationKind::DdosAttack,
                        status.node_id.clone(),
                        format!("DDoS attack detected on node {} ({} pps)", status.node_id, status.pps),
                    ));
                }
                self.ddos_status.insert(status.node_id.clone(), status);
            }
            DomainEvent::DdosPolicyApplied(policy) => {
                self.ddos_policy.insert(policy.node_id.clone(), policy);
            }
            DomainEvent::TsServerStatusChanged { ts_server_id, flavor, status } => {
                let server = self.ts_servers.get_mut(&ts_server_id).ok_or_else(|| missing("ts server", &ts_server_id))?;
                if server.flavor != flavor {
                    debug!(ts_server = %ts_server_id, "job flavor differs from stored server flavor");
                }
                if status == InstanceStatus::Error && server.status != InstanceStatus::Error {
                    applied.notifications.push(Notification::new(
                        NotificationKind::InstanceError,
                        ts_server_id.clone(),
                        format!("TS server {} entered error state", ts_server_id),
                    ));
                }
                server.status = status;
                server.updated_at = Some(now);
            }
            DomainEvent::InstanceStatusChanged { instance_id, status } => {
                let instance = self.instances.get_mut(&instance_id).ok_or_else(|| missing("instance", &instance_id))?;
                if status == InstanceStatus::Error && instance.status != InstanceStatus::Error {
                    applied.notifications.push(Notification::new(
                        NotificationKind::InstanceError,
                        instance_id.clone(),
                        format!("instance {} entered error state", instance_id),
                    ));
                }
                instance.status = status;
                instance.updated_at = Some(now);
            }
            DomainEvent::DiskScanRequested { instance_id, node_id } => {
                let instance = self.instances.get(&instance_id).ok_or_else(|| missing("instance", &instance_id))?;
                let already_known = instance.disk_used_bytes.is_some();
                let node = node_id.unwrap_or_else(|| instance.node_id.clone());
                if !already_known && !self.has_pending_job("instance.disk.scan", "instance_id", &instance_id) {
                    let mut payload = JobPayloadMap::new();
                    payload.insert("instance_id".into(), instance_id.clone());
                    payload.insert("node_id".into(), node.clone());
                    payload.insert("agent_id".into(), node);
                    applied.created_jobs.push(self.insert_job("instance.disk.scan", payload, Some("system".into()), now));
                }
            }
            DomainEvent::InstancePortsReleased { instance_id } => {
                let summary = self.ports.release_instance(&instance_id, now);
                for node in &summary.nodes {
                    applied.created_jobs.extend(self.reconcile_firewall(node, now));
                }
                applied.released.push(summary);
            }
            DomainEvent::InstanceDiskScanned { instance_id, used_bytes, error } => {
                let instance = self.instances.get_mut(&instance_id).ok_or_else(|| missing("instance", &instance_id))?;
                if used_bytes.is_some() {
                    instance.disk_used_bytes = used_bytes;
                }
                instance.disk_error = error;
                instance.disk_scanned_at = Some(now);
            }
            DomainEvent::NodeDiskReported { node_id, total_bytes, free_bytes, error } => {
                let entry = self.node_disks.entry(node_id.clone()).or_insert_with(|| NodeDisk {
                    node_id: node_id.clone(),
                    total_bytes: None,
                    free_bytes: None,
                    level: DiskLevel::Ok,
                    override_active: false,
                    error: None,
                    updated_at: now,
                });
                entry.updated_at = now;
                if let Some(error) = error {
                    entry.error = Some(error);
                } else if let (Some(total), Some(free)) = (total_bytes, free_bytes) {
                    entry.total_bytes = Some(total);
                    entry.free_bytes = Some(free);
                    entry.error = None;
                    if total > 0 {
                        let free_percent = free as f64 * 100.0 / total as f64;
                        let level = disk.level_for(free_percent);
                        if level == DiskLevel::Critical && entry.level != DiskLevel::Critical {
                            applied.notifications.push(Notification::new(
                                NotificationKind::DiskCritical,
                                node_id.clone(),
                                format!("node {} has {:.1}% disk free", node_id, free_percent),
                            ));
                        }
                        if level == DiskLevel::Ok {
                            entry.override_active = false;
                        }
                        entry.level = level;
                    }
                }
            }
            DomainEvent::QueryStatusChanged { instance_id, status } => {
                let instance = self.instances.get_mut(&instance_id).ok_or_else(|| missing("instance", &instance_id))?;
                instance.query = Some(status);
                instance.updated_at = Some(now);
            }
            DomainEvent::BackupFinished { backup_id, succeeded, size_bytes, error } => {
                let backup = self.backups.get_mut(&backup_id).ok_or_else(|| missing("backup", &backup_id))?;
                backup.status = if succeeded { BackupStatus::Succeeded } else { BackupStatus::Failed };
                backup.size_bytes = size_bytes.or(backup.size_bytes);
                backup.error = error.clone();
                backup.completed_at = Some(now);
                if !succeeded {
                    applied.notifications.push(Notification::new(
                        NotificationKind::BackupFailed,
                        backup_id.clone(),
                        format!(
                            "backup {} of instance {} failed: {}",
                            backup_id,
                            backup.instance_id,
                            error.unwrap_or_default()
                        ),
                    ));
                }
            }
            DomainEvent::UserAnonymized { user_id, request_id } => {
                if !self.users.contains_key(&user_id) {
                    return Err(missing("user", &user_id));
                }
                let request = self
                    .deletion_requests
                    .get_mut(&request_id)
                    .ok_or_else(|| missing("deletion request", &request_id))?;
                request.status = DeletionStatus::Completed;
                request.completed_at = Some(now);
                if let Some(user) = self.users.get_mut(&user_id) {
                    user.email = format!("deleted-{}@anonymized.invalid", user_id);
                    user.display_name = "Deleted user".to_string();
                    user.anonymized_at = Some(now);
                }
            }
        }
        Ok(applied)
    }
}
