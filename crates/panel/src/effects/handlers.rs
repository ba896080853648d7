//! Built-in side-effect handlers, one per job family.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use super::{DomainEvent, EffectInput};
use crate::model::{DdosPolicy, DdosStatus, DomainStatus, InstanceStatus, JobStatus, JsonMap, QueryState, QueryStatus};
use crate::payload::{JobPayload, LifecycleAction};

// ===== output readers =====

fn out_str(output: &JsonMap, key: &str) -> Option<String> {
    match output.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn out_u64(output: &JsonMap, key: &str) -> Option<u64> {
    match output.get(key)? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn out_bool(output: &JsonMap, key: &str) -> Option<bool> {
    match output.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Array of numbers/strings, or a comma separated string.
fn out_list(output: &JsonMap, key: &str) -> Vec<String> {
    match output.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

fn out_ports(output: &JsonMap, key: &str) -> Vec<u16> {
    out_list(output, key).iter().filter_map(|p| p.parse().ok()).collect()
}

/// RFC 3339 string or unix seconds.
fn out_time(output: &JsonMap, key: &str) -> Option<DateTime<Utc>> {
    match output.get(key)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim()).ok().map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

fn failure_reason(output: &JsonMap, fallback: &str) -> String {
    out_str(output, "error")
        .or_else(|| out_str(output, "message"))
        .unwrap_or_else(|| fallback.to_string())
}

// ===== handlers =====

/// Domain status follows the outcome whatever it was.
pub fn domain_added(input: &EffectInput<'_>) -> Vec<DomainEvent> {
    let JobPayload::Domain { domain_id } = input.payload else { return Vec::new() };
    let status = match input.status {
        JobStatus::Succeeded => DomainStatus::Active,
        JobStatus::Cancelled => DomainStatus::Cancelled,
        _ => DomainStatus::Failed,
    };
    vec![DomainEvent::DomainStatusChanged { domain_id: domain_id.clone(), status }]
}

pub fn certificate_issued(input: &EffectInput<'_>) -> Vec<DomainEvent> {
    let JobPayload::Domain { domain_id } = input.payload else { return Vec::new() };
    if !input.succeeded() {
        return Vec::new();
    }
    match out_time(input.output, "expires_at") {
        Some(expires_at) => vec![DomainEvent::CertificateIssued { domain_id: domain_id.clone(), expires_at }],
        None => Vec::new(),
    }
}

pub fn firewall_applied(input: &EffectInput<'_>) -> Vec<DomainEvent> {
    let JobPayload::Firewall { node_id, ports } = input.payload else { return Vec::new() };
    if !input.succeeded() {
        return Vec::new();
    }
    let (opened, closed) = if input.job.job_type == "firewall.close_ports" {
        (Vec::new(), ports.clone())
    } else {
        (ports.clone(), Vec::new())
    };
    vec![DomainEvent::FirewallApplied { node_id: node_id.clone(), opened, closed }]
}

pub fn ddos_status(input: &EffectInput<'_>) -> Vec<DomainEvent> {
    let JobPayload::DdosCheck { node_id } = input.payload else { return Vec::new() };
    if !input.succeeded() {
        return Vec::new();
    }
    let out = input.output;
    vec![DomainEvent::DdosStatusReported(DdosStatus {
        node_id: node_id.clone(),
        attack_active: out_bool(out, "attack_active").unwrap_or(false),
        pps: out_u64(out, "pps").unwrap_or(0),
        bps: out_u64(out, "bps"),
        ports: out_ports(out, "ports"),
        protocols: out_list(out, "protocols").into_iter().map(|p| p.to_ascii_lowercase()).collect(),
        reported_at: input.completed_at,
    })]
}

pub fn ddos_policy(input: &EffectInput<'_>) -> Vec<DomainEvent> {
    let JobPayload::DdosPolicy { node_id, mode, ports, protocols, enabled } = input.payload else { return Vec::new() };
    if !input.succeeded() {
        return Vec::new();
    }
    vec![DomainEvent::DdosPolicyApplied(DdosPolicy {
        node_id: node_id.clone(),
        mode: mode.clone(),
        ports: ports.clone(),
        protocols: protocols.clone(),
        enabled: *enabled,
        applied_at: input.completed_at,
    })]
}

/// Status a TS server lands in after a successful action.
fn ts_status_after(action: &LifecycleAction) -> Option<InstanceStatus> {
    match action {
        LifecycleAction::Create | LifecycleAction::Start | LifecycleAction::Restart => Some(InstanceStatus::Running),
        LifecycleAction::Stop => Some(InstanceStatus::Stopped),
        LifecycleAction::Delete => Some(InstanceStatus::Deleted),
        _ => None,
    }
}

pub fn ts_lifecycle(input: &EffectInput<'_>) -> Vec<DomainEvent> {
    let JobPayload::TsServer { ts_server_id, flavor, action } = input.payload else { return Vec::new() };
    let status = match input.status {
        JobStatus::Succeeded => ts_status_after(action),
        JobStatus::Failed if ts_status_after(action).is_some() => Some(InstanceStatus::Error),
        _ => None,
    };
    status
        .map(|status| vec![DomainEvent::TsServerStatusChanged { ts_server_id: ts_server_id.clone(), flavor: *flavor, status }])
        .unwrap_or_default()
}

/// Status a customer instance lands in after a successful action.
fn instance_status_after(action: &LifecycleAction) -> Option<InstanceStatus> {
    match action {
        LifecycleAction::Create => Some(InstanceStatus::Stopped),
        LifecycleAction::Start => Some(InstanceStatus::Running),
        LifecycleAction::Stop => Some(InstanceStatus::Stopped),
        LifecycleAction::Restart => Some(InstanceStatus::Running),
        LifecycleAction::Reinstall => Some(InstanceStatus::Stopped),
        LifecycleAction::Delete => Some(InstanceStatus::Deleted),
        LifecycleAction::Suspend => Some(InstanceStatus::Suspended),
        LifecycleAction::Unsuspend => Some(InstanceStatus::Stopped),
        LifecycleAction::Other(_) => None,
    }
}

pub fn instance_lifecycle(input: &EffectInput<'_>) -> Vec<DomainEvent> {
    let JobPayload::Instance { instance_id, node_id, action } = input.payload else { return Vec::new() };
    match input.status {
        JobStatus::Succeeded => {
            let Some(status) = instance_status_after(action) else { return Vec::new() };
            let mut events = vec![DomainEvent::InstanceStatusChanged { instance_id: instance_id.clone(), status }];
            match action {
                LifecycleAction::Create | LifecycleAction::Start => events.push(DomainEvent::DiskScanRequested {
                    instance_id: instance_id.clone(),
                    node_id: node_id.clone(),
                }),
                LifecycleAction::Delete => {
                    events.push(DomainEvent::InstancePortsReleased { instance_id: instance_id.clone() })
                }
                _ => {}
            }
            events
        }
        JobStatus::Failed if action.is_mutating() => {
            vec![DomainEvent::InstanceStatusChanged { instance_id: instance_id.clone(), status: InstanceStatus::Error }]
        }
        _ => Vec::new(),
    }
}

pub fn instance_disk_scan(input: &EffectInput<'_>) -> Vec<DomainEvent> {
    let JobPayload::DiskScan { instance_id, .. } = input.payload else { return Vec::new() };
    let out = input.output;
    let event = match input.status {
        JobStatus::Succeeded => DomainEvent::InstanceDiskScanned {
            instance_id: instance_id.clone(),
            used_bytes: out_u64(out, "used_bytes").or_else(|| out_u64(out, "bytes")),
            error: None,
        },
        JobStatus::Failed => DomainEvent::InstanceDiskScanned {
            instance_id: instance_id.clone(),
            used_bytes: None,
            error: Some(failure_reason(out, "disk scan failed")),
        },
        _ => return Vec::new(),
    };
    vec![event]
}

pub fn node_disk_stat(input: &EffectInput<'_>) -> Vec<DomainEvent> {
    let JobPayload::NodeDiskStat { node_id } = input.payload else { return Vec::new() };
    let out = input.output;
    let event = match input.status {
        JobStatus::Succeeded => DomainEvent::NodeDiskReported {
            node_id: node_id.clone(),
            total_bytes: out_u64(out, "total_bytes"),
            free_bytes: out_u64(out, "free_bytes"),
            error: None,
        },
        JobStatus::Failed => DomainEvent::NodeDiskReported {
            node_id: node_id.clone(),
            total_bytes: None,
            free_bytes: None,
            error: Some(failure_reason(out, "disk stat failed")),
        },
        _ => return Vec::new(),
    };
    vec![event]
}

pub fn query_status(input: &EffectInput<'_>) -> Vec<DomainEvent> {
    let JobPayload::StatusCheck { instance_id } = input.payload else { return Vec::new() };
    let out = input.output;
    let status = match input.status {
        JobStatus::Succeeded => {
            let online = out_bool(out, "online")
                .or_else(|| out_str(out, "status").map(|s| s.eq_ignore_ascii_case("online")))
                .unwrap_or(false);
            QueryStatus {
                state: if online { QueryState::Online } else { QueryState::Offline },
                players: out_u64(out, "players").and_then(|p| u32::try_from(p).ok()),
                max_players: out_u64(out, "max_players").and_then(|p| u32::try_from(p).ok()),
                error: None,
                checked_at: input.completed_at,
            }
        }
        JobStatus::Failed => QueryStatus {
            state: QueryState::Error,
            players: None,
            max_players: None,
            error: Some(failure_reason(out, "status check failed")),
            checked_at: input.completed_at,
        },
        _ => return Vec::new(),
    };
    vec![DomainEvent::QueryStatusChanged { instance_id: instance_id.clone(), status }]
}

/// A cancelled backup counts as failed.
pub fn backup_finished(input: &EffectInput<'_>) -> Vec<DomainEvent> {
    let JobPayload::Backup { backup_id, .. } = input.payload else { return Vec::new() };
    let out = input.output;
    let succeeded = input.succeeded();
    vec![DomainEvent::BackupFinished {
        backup_id: backup_id.clone(),
        succeeded,
        size_bytes: if succeeded { out_u64(out, "size_bytes") } else { None },
        error: if succeeded {
            None
        } else if input.status == JobStatus::Cancelled {
            Some("backup cancelled".to_string())
        } else {
            Some(failure_reason(out, "backup failed"))
        },
    }]
}

pub fn user_anonymized(input: &EffectInput<'_>) -> Vec<DomainEvent> {
    let JobPayload::GdprAnonymize { user_id, request_id } = input.payload else { return Vec::new() };
    if !input.succeeded() {
        return Vec::new();
    }
    vec![DomainEvent::UserAnonymized { user_id: user_id.clone(), request_id: request_id.clone() }]
}
