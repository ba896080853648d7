//! Job store operations: creation, the lease lock and the status machine.
//!
//! Everything here is a method on [`PanelState`] and takes `now` explicitly;
//! callers run it inside [`Store::transact`](crate::store::Store::transact).

use chrono::{DateTime, Utc};
use common::JobPayloadMap;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{PanelError, PanelResult};
use crate::model::{is_update_job, Job, JobLogLine, JobResult, JobStatus, JsonMap};
use crate::payload::JobPayload;
use crate::store::{missing, PanelState};

/// Producer request to enqueue work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: JobPayloadMap,
    #[serde(default)]
    pub created_by: Option<String>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: JobPayloadMap) -> Self {
        Self { job_type: job_type.into(), payload, created_by: None }
    }
}

/// Split free-form agent output into trimmed, non-blank lines, keeping at most
/// the last `cap`.
pub fn collect_lines<'a>(chunks: impl IntoIterator<Item = &'a str>, cap: usize) -> Vec<String> {
    let mut lines: Vec<String> = chunks
        .into_iter()
        .flat_map(str::lines)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    if lines.len() > cap {
        lines.drain(..lines.len() - cap);
    }
    lines
}

impl PanelState {
    pub fn create_job(&mut self, new: NewJob, now: DateTime<Utc>) -> PanelResult<Job> {
        let job_type = new.job_type.trim();
        if job_type.is_empty() || job_type.contains(char::is_whitespace) {
            return Err(PanelError::BadRequest(format!("invalid job type `{}`", new.job_type)));
        }
        JobPayload::decode(job_type, &new.payload)?;
        Ok(self.insert_job(job_type, new.payload, new.created_by, now))
    }

    /// Enqueue an already validated job. Used where the payload is built
    /// in-process and the caller may not fail halfway through a transaction.
    pub(crate) fn insert_job(
        &mut self,
        job_type: &str,
        payload: JobPayloadMap,
        created_by: Option<String>,
        now: DateTime<Utc>,
    ) -> Job {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.to_string(),
            payload,
            status: JobStatus::Queued,
            locked_by: None,
            lock_token: None,
            lock_expires_at: None,
            created_at: now,
            updated_at: now,
            seq: self.next_seq(),
            created_by,
        };
        self.jobs.insert(job.id.clone(), job.clone());
        job
    }

    pub fn job(&self, job_id: &str) -> PanelResult<&Job> {
        self.jobs.get(job_id).ok_or_else(|| missing("job", job_id))
    }

    fn job_mut(&mut self, job_id: &str) -> PanelResult<&mut Job> {
        self.jobs.get_mut(job_id).ok_or_else(|| missing("job", job_id))
    }

    /// Move a job along a legal lifecycle edge; returns the previous status.
    pub fn transition_job(&mut self, job_id: &str, to: JobStatus, now: DateTime<Utc>) -> PanelResult<JobStatus> {
        let job = self.job_mut(job_id)?;
        let from = job.status;
        if !from.can_transition_to(to) {
            return Err(PanelError::InvalidTransition { from, to });
        }
        job.status = to;
        job.updated_at = now;
        Ok(from)
    }

    /// Take the lease. Only a queued, unlocked job can be locked.
    pub fn lock_job(&mut self, job_id: &str, agent_id: &str, token: &str, expires_at: DateTime<Utc>) -> PanelResult<()> {
        let job = self.job_mut(job_id)?;
        if job.status != JobStatus::Queued || job.is_locked() {
            return Err(PanelError::Conflict(format!("job {} is not available for leasing", job_id)));
        }
        job.locked_by = Some(agent_id.to_string());
        job.lock_token = Some(token.to_string());
        job.lock_expires_at = Some(expires_at);
        Ok(())
    }

    /// Clear the lease if `token` is the one currently held. Returns whether
    /// anything was released.
    pub fn unlock_job(&mut self, job_id: &str, token: &str) -> PanelResult<bool> {
        let job = self.job_mut(job_id)?;
        if job.lock_token.as_deref() != Some(token) {
            return Ok(false);
        }
        job.locked_by = None;
        job.lock_token = None;
        job.lock_expires_at = None;
        Ok(true)
    }

    /// Push the lease expiry forward while the job is running and the lease
    /// has not lapsed.
    pub fn extend_lock(&mut self, job_id: &str, new_expiry: DateTime<Utc>, now: DateTime<Utc>) -> PanelResult<DateTime<Utc>> {
        let job = self.job_mut(job_id)?;
        match (job.status, job.lock_expires_at) {
            (JobStatus::Running, Some(expires)) if expires > now => {
                let extended = expires.max(new_expiry);
                job.lock_expires_at = Some(extended);
                job.updated_at = now;
                Ok(extended)
            }
            (JobStatus::Running, _) => Err(PanelError::Conflict(format!("lease on job {} has expired", job_id))),
            (status, _) => Err(PanelError::Conflict(format!("job {} is {}, not running", job_id, status))),
        }
    }

    /// Lease a queued job to an agent: lock, transition to running and
    /// record the start.
    pub fn lease_job(&mut self, job_id: &str, agent_id: &str, token: &str, ttl: chrono::Duration, now: DateTime<Utc>) -> PanelResult<Job> {
        self.lock_job(job_id, agent_id, token, now + ttl)?;
        self.transition_job(job_id, JobStatus::Running, now)?;
        self.append_log(job_id, format!("started by agent {}", agent_id), Some(0), now);
        self.job(job_id).cloned()
    }

    /// Producer-side cancel; only while still queued.
    pub fn cancel_job(&mut self, job_id: &str, now: DateTime<Utc>) -> PanelResult<Job> {
        let status = self.job(job_id)?.status;
        if status == JobStatus::Running {
            return Err(PanelError::Conflict(format!(
                "job {} is running and can only be reclaimed by lease expiry",
                job_id
            )));
        }
        if status != JobStatus::Queued {
            return Err(PanelError::InvalidTransition { from: status, to: JobStatus::Cancelled });
        }
        self.transition_job(job_id, JobStatus::Cancelled, now)?;
        self.append_log(job_id, "cancelled before dispatch".to_string(), None, now);
        self.job(job_id).cloned()
    }

    pub fn append_log(&mut self, job_id: &str, message: String, progress: Option<u8>, now: DateTime<Utc>) {
        self.logs.entry(job_id.to_string()).or_default().push(JobLogLine {
            job_id: job_id.to_string(),
            message,
            progress: progress.map(|p| p.min(100)),
            created_at: now,
        });
    }

    pub fn log_lines(&self, job_id: &str) -> &[JobLogLine] {
        self.logs.get(job_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Write the one result a job ever gets.
    pub fn record_result(&mut self, job_id: &str, status: JobStatus, output: JsonMap, completed_at: DateTime<Utc>) -> PanelResult<JobResult> {
        if self.results.contains_key(job_id) {
            return Err(PanelError::Conflict(format!("job {} already has a result", job_id)));
        }
        let result = JobResult { job_id: job_id.to_string(), status, output, completed_at };
        self.results.insert(job_id.to_string(), result.clone());
        Ok(result)
    }

    /// Reclaim running jobs whose lease lapsed: force them to failed, clear
    /// the lock and leave a trace. Returns the reclaimed jobs.
    pub fn expire_stale_jobs(&mut self, now: DateTime<Utc>) -> Vec<Job> {
        let stale: Vec<String> = self
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.lock_expires_at.map(|e| e <= now).unwrap_or(false))
            .map(|j| j.id.clone())
            .collect();

        let mut reclaimed = Vec::with_capacity(stale.len());
        for id in stale {
            let Some(job) = self.jobs.get_mut(&id) else { continue };
            let holder = job.locked_by.take().unwrap_or_default();
            job.lock_token = None;
            job.lock_expires_at = None;
            job.status = JobStatus::Failed;
            job.updated_at = now;
            let job = job.clone();

            self.append_log(&id, format!("lease held by agent {} expired; job failed", holder), None, now);
            if !self.results.contains_key(&id) {
                let mut output = JsonMap::new();
                output.insert("reason".into(), "lease_expired".into());
                output.insert("agent_id".into(), holder.clone().into());
                let _ = self.record_result(&id, JobStatus::Failed, output, now);
            }
            info!(job_id = %id, job_type = %job.job_type, agent = %holder, "reclaimed job with expired lease");
            reclaimed.push(job);
        }
        reclaimed
    }

    pub fn running_jobs_for(&self, agent_id: &str) -> impl Iterator<Item = &Job> + '_ {
        let agent_id = agent_id.to_string();
        self.jobs
            .values()
            .filter(move |j| j.status == JobStatus::Running && j.locked_by.as_deref() == Some(agent_id.as_str()))
    }

    pub fn running_update_jobs_for(&self, agent_id: &str) -> usize {
        self.running_jobs_for(agent_id).filter(|j| is_update_job(&j.job_type)).count()
    }

    /// Queued job ids in creation order.
    pub fn queued_job_ids(&self) -> Vec<String> {
        let mut queued: Vec<&Job> = self.jobs.values().filter(|j| j.status == JobStatus::Queued).collect();
        queued.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
        queued.into_iter().map(|j| j.id.clone()).collect()
    }

    /// Whether a queued or running job of `job_type` already targets the
    /// payload field `key = value`.
    pub fn has_pending_job(&self, job_type: &str, key: &str, value: &str) -> bool {
        self.jobs.values().any(|j| {
            matches!(j.status, JobStatus::Queued | JobStatus::Running)
                && j.job_type == job_type
                && j.payload.get(key).map(String::as_str) == Some(value)
        })
    }
}
