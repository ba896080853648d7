use chrono::{DateTime, Utc};
use common::RegisterRequest;
use rand::RngCore;
use std::collections::BTreeSet;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::{PanelError, PanelResult};
use crate::model::{Agent, AgentStatus};
use crate::store::PanelState;

/// Concurrency ceiling a freshly registered agent starts with.
pub const DEFAULT_JOB_CONCURRENCY: u32 = 4;

/// Length-aware constant-time comparison for tokens.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// 32 random bytes, hex encoded. Shown to the agent exactly once.
pub fn generate_agent_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl PanelState {
    /// Create the agent row for a registration that already passed the
    /// bootstrap check. `secret_payload` is the encrypted shared secret.
    pub fn register_agent(&mut self, req: &RegisterRequest, secret_payload: String, now: DateTime<Utc>) -> PanelResult<Agent> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(PanelError::BadRequest("agent name is required".to_string()));
        }
        let job_concurrency = req
            .metadata
            .get("job_concurrency")
            .and_then(|v| v.as_u64())
            .map(|v| v.clamp(1, 64) as u32)
            .unwrap_or(DEFAULT_JOB_CONCURRENCY);
        let agent = Agent {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            secret_payload,
            roles: req.roles.iter().map(|r| r.trim().to_string()).filter(|r| !r.is_empty()).collect::<BTreeSet<_>>(),
            status: AgentStatus::Registered,
            last_heartbeat_at: None,
            last_heartbeat_ip: None,
            last_heartbeat_version: None,
            last_heartbeat_stats: Default::default(),
            job_concurrency,
            metadata: req.metadata.clone(),
            registered_at: now,
        };
        self.agents.insert(agent.id.clone(), agent.clone());
        Ok(agent)
    }
}
