//! Typed view over the flat string payload of a job.
//!
//! Producers write `type` + a flat map; everything downstream (validation at
//! enqueue time, the side-effect registry) works on [`JobPayload`] so that a
//! missing or malformed field fails here instead of turning into a silent
//! `None` deep inside a handler.

use common::JobPayloadMap;
use thiserror::Error;

use crate::model::{is_update_job, TsFlavor};
use crate::ports::PortRule;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("job type {job_type}: missing payload field `{field}`")]
    Missing { job_type: String, field: &'static str },

    #[error("job type {job_type}: invalid payload field `{field}`: {reason}")]
    Invalid { job_type: String, field: &'static str, reason: String },
}

/// Lifecycle verb carried in the last segment(s) of an instance-like job type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    Create,
    Start,
    Stop,
    Restart,
    Reinstall,
    Delete,
    Suspend,
    Unsuspend,
    Other(String),
}

impl LifecycleAction {
    pub fn parse(value: &str) -> Self {
        match value {
            "create" | "install" => LifecycleAction::Create,
            "start" => LifecycleAction::Start,
            "stop" => LifecycleAction::Stop,
            "restart" => LifecycleAction::Restart,
            "reinstall" => LifecycleAction::Reinstall,
            "delete" | "destroy" => LifecycleAction::Delete,
            "suspend" => LifecycleAction::Suspend,
            "unsuspend" => LifecycleAction::Unsuspend,
            other => LifecycleAction::Other(other.to_string()),
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, LifecycleAction::Other(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    Domain { domain_id: String },
    Firewall { node_id: String, ports: Vec<PortRule> },
    DdosCheck { node_id: String },
    DdosPolicy { node_id: String, mode: String, ports: Vec<u16>, protocols: Vec<String>, enabled: bool },
    TsServer { ts_server_id: String, flavor: TsFlavor, action: LifecycleAction },
    Instance { instance_id: String, node_id: Option<String>, action: LifecycleAction },
    DiskScan { instance_id: String, node_id: Option<String> },
    NodeDiskStat { node_id: String },
    StatusCheck { instance_id: String },
    Backup { backup_id: String, instance_id: Option<String> },
    GdprAnonymize { user_id: String, request_id: String },
    AgentUpdate { version: Option<String> },
    /// Job types without a schema; carried through untouched.
    Generic(JobPayloadMap),
}

struct Fields<'a> {
    job_type: &'a str,
    map: &'a JobPayloadMap,
}

impl<'a> Fields<'a> {
    fn optional(&self, field: &str) -> Option<String> {
        self.map.get(field).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&self, field: &'static str) -> Result<String, PayloadError> {
        self.optional(field).ok_or_else(|| PayloadError::Missing {
            job_type: self.job_type.to_string(),
            field,
        })
    }

    fn invalid(&self, field: &'static str, reason: impl Into<String>) -> PayloadError {
        PayloadError::Invalid { job_type: self.job_type.to_string(), field, reason: reason.into() }
    }

    /// Node the job targets; `agent_id` doubles as node id.
    fn node(&self) -> Result<String, PayloadError> {
        self.optional("node_id")
            .or_else(|| self.optional("agent_id"))
            .ok_or_else(|| PayloadError::Missing { job_type: self.job_type.to_string(), field: "node_id" })
    }

    fn port_list(&self, field: &'static str) -> Result<Vec<u16>, PayloadError> {
        let Some(raw) = self.optional(field) else { return Ok(Vec::new()) };
        split_list(&raw)
            .map(|p| p.parse::<u16>().map_err(|_| self.invalid(field, format!("`{}` is not a port", p))))
            .collect()
    }

    fn string_list(&self, field: &str) -> Vec<String> {
        self.optional(field)
            .map(|raw| split_list(&raw).map(|s| s.to_ascii_lowercase()).collect())
            .unwrap_or_default()
    }

    fn flag(&self, field: &'static str, default: bool) -> Result<bool, PayloadError> {
        match self.optional(field).as_deref() {
            None => Ok(default),
            Some("1") | Some("true") | Some("yes") => Ok(true),
            Some("0") | Some("false") | Some("no") => Ok(false),
            Some(other) => Err(self.invalid(field, format!("`{}` is not a boolean", other))),
        }
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl JobPayload {
    pub fn decode(job_type: &str, map: &JobPayloadMap) -> Result<JobPayload, PayloadError> {
        let f = Fields { job_type, map };
        let payload = match job_type {
            "domain.add" | "domain.ssl.issue" => JobPayload::Domain { domain_id: f.required("domain_id")? },
            "firewall.open_ports" | "firewall.close_ports" => {
                let raw = f.required("ports")?;
                let ports = split_list(&raw)
                    .map(|p| p.parse::<PortRule>().map_err(|e| f.invalid("ports", e)))
                    .collect::<Result<Vec<_>, _>>()?;
                JobPayload::Firewall { node_id: f.node()?, ports }
            }
            "ddos.status.check" => JobPayload::DdosCheck { node_id: f.node()? },
            "ddos.policy.apply" => JobPayload::DdosPolicy {
                node_id: f.node()?,
                mode: f.required("mode")?,
                ports: f.port_list("ports")?,
                protocols: f.string_list("protocols"),
                enabled: f.flag("enabled", true)?,
            },
            "instance.disk.scan" => JobPayload::DiskScan {
                instance_id: f.required("instance_id")?,
                node_id: f.optional("node_id").or_else(|| f.optional("agent_id")),
            },
            "instance.backup.create" => JobPayload::Backup {
                backup_id: f.required("backup_id")?,
                instance_id: f.optional("instance_id"),
            },
            "server.status.check" | "instance.query.check" => {
                JobPayload::StatusCheck { instance_id: f.required("instance_id")? }
            }
            "node.disk.stat" => JobPayload::NodeDiskStat { node_id: f.node()? },
            "gdpr.anonymize_user" => JobPayload::GdprAnonymize {
                user_id: f.required("user_id")?,
                request_id: f.required("request_id")?,
            },
            t => {
                if is_update_job(t) {
                    JobPayload::AgentUpdate { version: f.optional("version") }
                } else if let Some(flavor) = TsFlavor::from_job_type(t) {
                    let ts_server_id = f
                        .optional("ts_server_id")
                        .or_else(|| f.optional("instance_id"))
                        .ok_or_else(|| PayloadError::Missing { job_type: t.to_string(), field: "ts_server_id" })?;
                    let action = t.rsplit('.').next().unwrap_or_default();
                    JobPayload::TsServer { ts_server_id, flavor, action: LifecycleAction::parse(action) }
                } else if let Some(action) = t.strip_prefix("instance.") {
                    JobPayload::Instance {
                        instance_id: f.required("instance_id")?,
                        node_id: f.optional("node_id").or_else(|| f.optional("agent_id")),
                        action: LifecycleAction::parse(action),
                    }
                } else {
                    JobPayload::Generic(map.clone())
                }
            }
        };
        Ok(payload)
    }
}
