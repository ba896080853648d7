//! Dispatch engine: hands queued jobs to a polling agent.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::PanelConfig;
use crate::error::{PanelError, PanelResult};
use crate::model::{is_update_job, Job};
use crate::sinks::JobObserver;
use crate::store::PanelState;

/// Dispatch limits taken from configuration.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub lease_ttl: Duration,
    pub update_job_limit: usize,
    pub windows_enabled: bool,
    pub windows_allowed_job_types: Vec<String>,
}

impl DispatchPolicy {
    pub fn from_config(config: &PanelConfig) -> Self {
        Self {
            lease_ttl: Duration::seconds(config.lease_ttl_secs),
            update_job_limit: config.update_job_limit,
            windows_enabled: config.windows_enabled,
            windows_allowed_job_types: config.windows_allowed_job_types.clone(),
        }
    }

    fn windows_allows(&self, job_type: &str) -> bool {
        self.windows_allowed_job_types.iter().any(|t| t == job_type)
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from_config(&PanelConfig::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PollOutcome {
    pub leased: Vec<Job>,
    /// Jobs reclaimed by the stale sweep that ran first.
    pub expired: Vec<Job>,
    pub max_concurrency: u32,
}

/// Opaque lease capability handed to the agent.
pub fn generate_lease_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl PanelState {
    /// Lease up to `limit` queued jobs to `agent_id`, honoring the agent's
    /// concurrency ceiling, job targeting, the update-job throttle and the
    /// Windows allow-list.
    pub fn poll_for_work(
        &mut self,
        agent_id: &str,
        limit: usize,
        policy: &DispatchPolicy,
        observers: &[Arc<dyn JobObserver>],
        now: DateTime<Utc>,
    ) -> PanelResult<PollOutcome> {
        let agent = self
            .agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| PanelError::Unauthenticated(format!("unknown agent {}", agent_id)))?;
        let windows = agent.is_windows();
        if windows && !policy.windows_enabled {
            return Err(PanelError::ServiceUnavailable("windows agents are disabled".to_string()));
        }

        let mut outcome = PollOutcome {
            expired: self.expire_stale_jobs(now),
            max_concurrency: agent.job_concurrency,
            ..Default::default()
        };

        let candidates: Vec<String> = self.queued_job_ids().into_iter().take(limit).collect();
        let running = self.running_jobs_for(agent_id).count();
        let available = (agent.job_concurrency as usize).saturating_sub(running);
        if available == 0 {
            debug!(agent = %agent_id, running, "agent at concurrency ceiling");
            return Ok(outcome);
        }
        let mut running_updates = self.running_update_jobs_for(agent_id);

        for job_id in candidates {
            if outcome.leased.len() >= available {
                break;
            }
            let Some(job) = self.jobs.get(&job_id) else { continue };
            if job.target_agent().map(|t| t != agent_id).unwrap_or(false) {
                continue;
            }
            let update = is_update_job(&job.job_type);
            if update && running_updates >= policy.update_job_limit {
                continue;
            }
            if windows && !policy.windows_allows(&job.job_type) {
                continue;
            }
            if !observers.iter().all(|o| o.before_dispatch(job, &agent)) {
                continue;
            }

            let token = generate_lease_token();
            let leased = match self.lease_job(&job_id, agent_id, &token, policy.lease_ttl, now) {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %job_id, agent = %agent_id, error = %e, "job not leased");
                    continue;
                }
            };
            if update {
                running_updates += 1;
            }
            outcome.leased.push(leased);
        }
        Ok(outcome)
    }
}
