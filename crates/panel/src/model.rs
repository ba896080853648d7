//! Persistent records: jobs, agents and the domain aggregates that job
//! results feed into.

use chrono::{DateTime, Utc};
use common::JobPayloadMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub type JobId = String;
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Job types throttled separately from the general concurrency cap.
pub const UPDATE_JOB_TYPES: &[&str] = &["sniper.update", "agent.update", "agent.self_update"];

pub fn is_update_job(job_type: &str) -> bool {
    UPDATE_JOB_TYPES.contains(&job_type)
}

// ===================== Job State & Management =====================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Legal edges of the job lifecycle. Terminal states have none.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }

    /// Parse an agent-reported outcome. Only terminal states are accepted.
    pub fn parse_reported(value: &str) -> Option<JobStatus> {
        match value.trim().to_ascii_lowercase().as_str() {
            "succeeded" | "success" => Some(JobStatus::Succeeded),
            "failed" | "failure" => Some(JobStatus::Failed),
            "cancelled" | "canceled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: JobPayloadMap,
    pub status: JobStatus,
    pub locked_by: Option<String>,
    pub lock_token: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Monotonic creation sequence; breaks ties between equal timestamps.
    pub seq: u64,
    /// Producer that enqueued the job, allowed to cancel it while queued.
    #[serde(default)]
    pub created_by: Option<String>,
}

impl Job {
    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    /// Lock fields are all set or all clear; only a running job holds a lock.
    pub fn lock_invariant_holds(&self) -> bool {
        let all_set = self.locked_by.is_some() && self.lock_token.is_some() && self.lock_expires_at.is_some();
        let all_clear = self.locked_by.is_none() && self.lock_token.is_none() && self.lock_expires_at.is_none();
        (all_clear) || (all_set && self.status == JobStatus::Running)
    }

    /// Agent explicitly targeted by the producer, if any.
    pub fn target_agent(&self) -> Option<&str> {
        self.payload.get("agent_id").map(String::as_str).filter(|s| !s.is_empty())
    }

    pub fn node_id(&self) -> Option<&str> {
        self.payload
            .get("node_id")
            .or_else(|| self.payload.get("agent_id"))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: JobStatus,
    pub output: JsonMap,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogLine {
    pub job_id: JobId,
    pub message: String,
    pub progress: Option<u8>,
    pub created_at: DateTime<Utc>,
}

// ===================== Agents =====================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Registered,
    Online,
    Degraded,
    Maintenance,
    Offline,
    Disabled,
}

impl AgentStatus {
    pub fn parse(value: &str) -> Option<AgentStatus> {
        match value.to_ascii_lowercase().as_str() {
            "registered" => Some(AgentStatus::Registered),
            "online" | "ok" => Some(AgentStatus::Online),
            "degraded" => Some(AgentStatus::Degraded),
            "maintenance" => Some(AgentStatus::Maintenance),
            "offline" => Some(AgentStatus::Offline),
            "disabled" => Some(AgentStatus::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    /// Shared secret, encrypted at rest.
    pub secret_payload: String,
    pub roles: BTreeSet<String>,
    pub status: AgentStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_heartbeat_ip: Option<String>,
    pub last_heartbeat_version: Option<String>,
    #[serde(default)]
    pub last_heartbeat_stats: JsonMap,
    pub job_concurrency: u32,
    #[serde(default)]
    pub metadata: JsonMap,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    /// Windows-class nodes are identified from the last heartbeat.
    pub fn is_windows(&self) -> bool {
        let os = self
            .last_heartbeat_stats
            .get("os")
            .or_else(|| self.metadata.get("os"))
            .and_then(|v| v.as_str());
        os.map(|s| s.eq_ignore_ascii_case("windows")).unwrap_or(false)
    }
}

// ===================== Domain aggregates =====================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    Pending,
    Active,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRecord {
    pub id: String,
    pub name: String,
    pub status: DomainStatus,
    #[serde(default)]
    pub ssl_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Provisioning,
    Running,
    Stopped,
    Suspended,
    Error,
    Deleted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueryState {
    Online,
    Offline,
    Error,
}

/// Cached result of the latest status/query check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryStatus {
    pub state: QueryState,
    pub players: Option<u32>,
    pub max_players: Option<u32>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub customer_id: String,
    pub node_id: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub disk_used_bytes: Option<u64>,
    #[serde(default)]
    pub disk_error: Option<String>,
    #[serde(default)]
    pub disk_scanned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub query: Option<QueryStatus>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TsFlavor {
    Ts3,
    Ts6,
}

impl TsFlavor {
    pub fn from_job_type(job_type: &str) -> Option<TsFlavor> {
        match job_type.split('.').next() {
            Some("ts3") => Some(TsFlavor::Ts3),
            Some("ts6") => Some(TsFlavor::Ts6),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsServer {
    pub id: String,
    pub flavor: TsFlavor,
    pub node_id: String,
    pub status: InstanceStatus,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Queued,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub instance_id: String,
    pub status: BackupStatus,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: String,
    #[serde(default)]
    pub anonymized_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeletionStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionRequest {
    pub id: String,
    pub user_id: String,
    pub status: DeletionStatus,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DiskLevel {
    Ok,
    Warning,
    Critical,
}

/// Node disk telemetry plus the disk-protection state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDisk {
    pub node_id: String,
    pub total_bytes: Option<u64>,
    pub free_bytes: Option<u64>,
    pub level: DiskLevel,
    /// Operator override letting provisioning proceed despite low space.
    #[serde(default)]
    pub override_active: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DdosStatus {
    pub node_id: String,
    pub attack_active: bool,
    pub pps: u64,
    #[serde(default)]
    pub bps: Option<u64>,
    pub ports: Vec<u16>,
    pub protocols: Vec<String>,
    pub reported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DdosPolicy {
    pub node_id: String,
    pub mode: String,
    pub ports: Vec<u16>,
    pub protocols: Vec<String>,
    pub enabled: bool,
    pub applied_at: DateTime<Utc>,
}
