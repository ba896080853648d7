//! Result and progress ingestion from agents.

use chrono::{DateTime, Duration, Utc};
use common::{LogReport, ResultReport};
use serde_json::Value;
use tracing::warn;

use crate::effects::{Applied, DiskThresholds, EffectInput, EffectRegistry};
use crate::error::{PanelError, PanelResult};
use crate::jobs::collect_lines;
use crate::model::{Job, JobResult, JobStatus, JsonMap};
use crate::payload::JobPayload;
use crate::store::PanelState;

/// Settings ingestion needs from the engine.
#[derive(Debug, Clone, Copy)]
pub struct IngestContext<'a> {
    pub registry: &'a EffectRegistry,
    pub disk: DiskThresholds,
    pub max_log_lines: usize,
    pub lease_ttl: Duration,
}

#[derive(Debug)]
pub struct Ingested {
    pub job: Job,
    pub result: JobResult,
    pub applied: Applied,
    /// Side-effect events that could not be applied.
    pub skipped_events: usize,
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Object(o) => o.get("message").and_then(Value::as_str).map(str::to_string),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        _ => None,
    }
}

/// stdout, stderr and log fields carried in a result output.
fn output_lines(output: &JsonMap, cap: usize) -> Vec<String> {
    let chunks: Vec<String> = ["stdout", "stderr", "logs", "log"]
        .iter()
        .filter_map(|k| output.get(*k).and_then(value_text))
        .collect();
    collect_lines(chunks.iter().map(String::as_str), cap)
}

/// An agent may echo its lease token; when it does, it must be the live one.
fn check_echoed_token(job_id: &str, token: &str, echoed: Option<&str>) -> PanelResult<()> {
    match echoed {
        Some(echoed) if echoed != token => {
            Err(PanelError::Conflict(format!("lease token for job {} does not match", job_id)))
        }
        _ => Ok(()),
    }
}

impl PanelState {
    /// Current lease token, provided `agent_id` holds the lease on a
    /// running job.
    fn lease_token(&self, agent_id: &str, job_id: &str) -> PanelResult<String> {
        let job = self.job(job_id)?;
        if job.status != JobStatus::Running {
            return Err(PanelError::Conflict(format!("job {} is {}, not running", job_id, job.status)));
        }
        if job.locked_by.as_deref() != Some(agent_id) {
            return Err(PanelError::Conflict(format!("job {} is not leased to agent {}", job_id, agent_id)));
        }
        Ok(job.lock_token.clone().unwrap_or_default())
    }

    pub fn submit_result(
        &mut self,
        agent_id: &str,
        job_id: &str,
        report: ResultReport,
        ctx: &IngestContext<'_>,
        now: DateTime<Utc>,
    ) -> PanelResult<Ingested> {
        let token = self.lease_token(agent_id, job_id)?;
        if report.job_id != job_id {
            return Err(PanelError::BadRequest(format!("body job_id {} does not match {}", report.job_id, job_id)));
        }
        let status = JobStatus::parse_reported(&report.status)
            .ok_or_else(|| PanelError::BadRequest(format!("unknown result status `{}`", report.status)))?;
        check_echoed_token(job_id, &token, report.lock_token.as_deref())?;
        if self.results.contains_key(job_id) {
            return Err(PanelError::Conflict(format!("job {} already has a result", job_id)));
        }
        if !JobStatus::Running.can_transition_to(status) {
            return Err(PanelError::InvalidTransition { from: JobStatus::Running, to: status });
        }

        for line in output_lines(&report.output, ctx.max_log_lines) {
            self.append_log(job_id, line, None, now);
        }
        let completed_at = report.completed_at.unwrap_or(now);
        let result = self.record_result(job_id, status, report.output, completed_at)?;
        self.transition_job(job_id, status, now)?;
        self.unlock_job(job_id, &token)?;
        self.append_log(job_id, format!("finished: {}", status), Some(100), now);
        let job = self.job(job_id)?.clone();

        let mut applied = Applied::default();
        let mut skipped_events = 0;
        match JobPayload::decode(&job.job_type, &job.payload) {
            Ok(payload) => {
                let input = EffectInput { job: &job, payload: &payload, status, output: &result.output, completed_at };
                for event in ctx.registry.events_for(&input) {
                    match self.apply_event(event, &ctx.disk, now) {
                        Ok(a) => applied.merge(a),
                        Err(e) => {
                            skipped_events += 1;
                            warn!(job_id = %job.id, job_type = %job.job_type, error = %e, "side effect skipped");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(job_id = %job.id, job_type = %job.job_type, error = %e, "payload does not decode; side effects skipped");
            }
        }

        Ok(Ingested { job, result, applied, skipped_events })
    }

    /// Progress report: append lines and extend the lease. Returns the new
    /// lease expiry.
    pub fn submit_logs(
        &mut self,
        agent_id: &str,
        job_id: &str,
        report: LogReport,
        ctx: &IngestContext<'_>,
        now: DateTime<Utc>,
    ) -> PanelResult<DateTime<Utc>> {
        if report.job_id != job_id {
            return Err(PanelError::BadRequest(format!("body job_id {} does not match {}", report.job_id, job_id)));
        }
        let token = self.lease_token(agent_id, job_id)?;
        check_echoed_token(job_id, &token, report.lock_token.as_deref())?;
        let expires = self.extend_lock(job_id, now + ctx.lease_ttl, now)?;

        let progress = report.progress.map(|p| p.clamp(0, 100) as u8);
        let logs_text = report.logs.as_ref().and_then(value_text);
        let chunks = [report.stdout.as_deref(), report.stderr.as_deref(), logs_text.as_deref()];
        let lines = collect_lines(chunks.into_iter().flatten(), ctx.max_log_lines);

        match (report.message.as_deref().map(str::trim).filter(|m| !m.is_empty()), progress) {
            (Some(message), _) => self.append_log(job_id, message.to_string(), progress, now),
            (None, Some(p)) => self.append_log(job_id, format!("progress {}%", p), Some(p), now),
            (None, None) => {}
        }
        for line in lines {
            self.append_log(job_id, line, None, now);
        }
        Ok(expires)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchPolicy;
    use crate::jobs::NewJob;
    use crate::model::{Agent, AgentStatus, DiskLevel, Instance, InstanceStatus};
    use crate::sinks::NotificationKind;
    use common::JobPayloadMap;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn agent(id: &str) -> Agent {
        Agent {
            id: id.into(),
            name: id.into(),
            secret_payload: String::new(),
            roles: BTreeSet::new(),
            status: AgentStatus::Online,
            last_heartbeat_at: None,
            last_heartbeat_ip: None,
            last_heartbeat_version: None,
            last_heartbeat_stats: Default::default(),
            job_concurrency: 4,
            metadata: Default::default(),
            registered_at: t0(),
        }
    }

    fn leased(job_type: &str, pairs: &[(&str, &str)]) -> (PanelState, Job) {
        let mut s = PanelState::default();
        s.agents.insert("a1".into(), agent("a1"));
        s.agents.insert("a2".into(), agent("a2"));
        let payload: JobPayloadMap = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        s.create_job(NewJob::new(job_type, payload), t0()).unwrap();
        let out = s.poll_for_work("a1", 10, &DispatchPolicy::default(), &[], t0()).unwrap();
        let job = out.leased[0].clone();
        (s, job)
    }

    /// Queue one more job on an existing state and lease it to `a1`.
    fn lease_another(s: &mut PanelState, job_type: &str, pairs: &[(&str, &str)]) -> Job {
        let payload: JobPayloadMap = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let job = s.create_job(NewJob::new(job_type, payload), t0()).unwrap();
        let out = s.poll_for_work("a1", 10, &DispatchPolicy::default(), &[], t0()).unwrap();
        assert_eq!(out.leased[0].id, job.id);
        out.leased[0].clone()
    }

    fn instance(id: &str) -> Instance {
        Instance {
            id: id.into(),
            customer_id: "c1".into(),
            node_id: "a1".into(),
            status: InstanceStatus::Running,
            disk_used_bytes: None,
            disk_error: None,
            disk_scanned_at: None,
            query: None,
            updated_at: None,
        }
    }

    fn report(job_id: &str, status: &str, output: Value) -> ResultReport {
        ResultReport {
            job_id: job_id.into(),
            status: status.into(),
            completed_at: None,
            output: output.as_object().cloned().unwrap_or_default(),
            lock_token: None,
        }
    }

    fn ctx(registry: &EffectRegistry) -> IngestContext<'_> {
        IngestContext { registry, disk: DiskThresholds::default(), max_log_lines: 200, lease_ttl: Duration::minutes(10) }
    }

    #[test]
    fn result_without_side_effect_round_trips() {
        let registry = EffectRegistry::with_defaults();
        let (mut s, job) = leased("mail.sync", &[]);
        let done = s.submit_result("a1", &job.id, report(&job.id, "succeeded", json!({})), &ctx(&registry), t0()).unwrap();
        assert_eq!(done.job.status, JobStatus::Succeeded);
        assert!(!done.job.is_locked());
        assert_eq!(s.results.len(), 1);
        assert_eq!(s.results[&job.id].status, JobStatus::Succeeded);
    }

    #[test]
    fn preconditions_fail_in_order() {
        let registry = EffectRegistry::with_defaults();
        let (mut s, job) = leased("mail.sync", &[]);
        let c = ctx(&registry);

        let err = s.submit_result("a1", "nope", report("nope", "succeeded", json!({})), &c, t0()).unwrap_err();
        assert!(matches!(err, PanelError::NotFound(_)));

        let err = s.submit_result("a2", &job.id, report(&job.id, "succeeded", json!({})), &c, t0()).unwrap_err();
        assert!(matches!(err, PanelError::Conflict(_)));

        let err = s.submit_result("a1", &job.id, report("other", "succeeded", json!({})), &c, t0()).unwrap_err();
        assert!(matches!(err, PanelError::BadRequest(_)));

        let err = s.submit_result("a1", &job.id, report(&job.id, "done", json!({})), &c, t0()).unwrap_err();
        assert!(matches!(err, PanelError::BadRequest(_)));

        let mut wrong_token = report(&job.id, "succeeded", json!({}));
        wrong_token.lock_token = Some("forged".into());
        assert!(matches!(s.submit_result("a1", &job.id, wrong_token, &c, t0()), Err(PanelError::Conflict(_))));

        // nothing above touched the job
        assert_eq!(s.jobs[&job.id].status, JobStatus::Running);
        assert!(s.results.is_empty());

        s.submit_result("a1", &job.id, report(&job.id, "failed", json!({})), &c, t0()).unwrap();
        let err = s.submit_result("a1", &job.id, report(&job.id, "failed", json!({})), &c, t0()).unwrap_err();
        assert!(matches!(err, PanelError::Conflict(_)));
    }

    #[test]
    fn output_lines_are_capped() {
        let registry = EffectRegistry::with_defaults();
        let (mut s, job) = leased("mail.sync", &[]);
        let stdout: String = (0..300).map(|i| format!("line {}\n\n", i)).collect();
        let c = IngestContext { max_log_lines: 200, ..ctx(&registry) };
        s.submit_result("a1", &job.id, report(&job.id, "succeeded", json!({ "stdout": stdout })), &c, t0()).unwrap();
        let lines = s.log_lines(&job.id);
        let output_lines: Vec<_> = lines.iter().filter(|l| l.message.starts_with("line ")).collect();
        assert_eq!(output_lines.len(), 200);
        assert_eq!(output_lines[0].message, "line 100");
    }

    #[test]
    fn missing_instance_does_not_block_result() {
        let registry = EffectRegistry::with_defaults();
        let (mut s, job) = leased("instance.start", &[("instance_id", "gone")]);
        let done = s.submit_result("a1", &job.id, report(&job.id, "succeeded", json!({})), &ctx(&registry), t0()).unwrap();
        assert_eq!(done.job.status, JobStatus::Succeeded);
        assert_eq!(done.skipped_events, 2);
    }

    #[test]
    fn instance_start_updates_status_and_requests_scan() {
        let registry = EffectRegistry::with_defaults();
        let (mut s, job) = leased("instance.start", &[("instance_id", "i1")]);
        s.instances.insert(
            "i1".into(),
            Instance {
                id: "i1".into(),
                customer_id: "c1".into(),
                node_id: "a1".into(),
                status: InstanceStatus::Stopped,
                disk_used_bytes: None,
                disk_error: None,
                disk_scanned_at: None,
                query: None,
                updated_at: None,
            },
        );
        let done = s.submit_result("a1", &job.id, report(&job.id, "succeeded", json!({})), &ctx(&registry), t0()).unwrap();
        assert_eq!(s.instances["i1"].status, InstanceStatus::Running);
        assert_eq!(done.applied.created_jobs.len(), 1);
        assert_eq!(done.applied.created_jobs[0].job_type, "instance.disk.scan");
    }

    #[test]
    fn logs_extend_the_lease_until_it_lapses() {
        let registry = EffectRegistry::with_defaults();
        let (mut s, job) = leased("mail.sync", &[]);
        let c = ctx(&registry);
        let log = |msg: &str| LogReport { job_id: job.id.clone(), progress: Some(40), message: Some(msg.into()), ..Default::default() };

        let later = t0() + Duration::minutes(8);
        let expires = s.submit_logs("a1", &job.id, log("copying"), &c, later).unwrap();
        assert_eq!(expires, later + Duration::minutes(10));
        assert!(s.log_lines(&job.id).iter().any(|l| l.message == "copying" && l.progress == Some(40)));

        let lapsed = later + Duration::minutes(11);
        assert!(matches!(s.submit_logs("a1", &job.id, log("late"), &c, lapsed), Err(PanelError::Conflict(_))));
        assert!(matches!(s.submit_logs("a2", &job.id, log("spoof"), &c, later), Err(PanelError::Conflict(_))));
    }

    #[test]
    fn result_for_never_leased_job_is_a_conflict() {
        let registry = EffectRegistry::with_defaults();
        let mut s = PanelState::default();
        s.agents.insert("a1".into(), agent("a1"));
        let job = s.create_job(NewJob::new("mail.sync", JobPayloadMap::new()), t0()).unwrap();

        let err = s
            .submit_result("a1", &job.id, report(&job.id, "succeeded", json!({"stdout": "done"})), &ctx(&registry), t0())
            .unwrap_err();
        assert!(matches!(err, PanelError::Conflict(_)));
        assert_eq!(s.jobs[&job.id].status, JobStatus::Queued);
        assert!(s.results.is_empty());
        assert!(s.log_lines(&job.id).is_empty());
    }

    #[test]
    fn node_disk_stat_sets_level_and_keeps_it_on_failure() {
        let registry = EffectRegistry::with_defaults();
        let (mut s, job) = leased("node.disk.stat", &[("node_id", "a1")]);
        let c = ctx(&registry);

        let output = json!({"total_bytes": 1000, "free_bytes": 30});
        let done = s.submit_result("a1", &job.id, report(&job.id, "succeeded", output), &c, t0()).unwrap();
        let disk = &s.node_disks["a1"];
        assert_eq!((disk.total_bytes, disk.free_bytes), (Some(1000), Some(30)));
        assert_eq!(disk.level, DiskLevel::Critical);
        assert!(disk.error.is_none());
        assert_eq!(done.applied.notifications.len(), 1);
        assert_eq!(done.applied.notifications[0].kind, NotificationKind::DiskCritical);

        let retry = lease_another(&mut s, "node.disk.stat", &[("node_id", "a1")]);
        let done = s
            .submit_result("a1", &retry.id, report(&retry.id, "failed", json!({"error": "df: permission denied"})), &c, t0())
            .unwrap();
        assert_eq!(done.job.status, JobStatus::Failed);
        assert_eq!(done.skipped_events, 0);
        let disk = &s.node_disks["a1"];
        assert_eq!(disk.error.as_deref(), Some("df: permission denied"));
        // last good reading stands
        assert_eq!(disk.level, DiskLevel::Critical);
        assert_eq!(disk.free_bytes, Some(30));
        assert!(done.applied.notifications.is_empty());
    }

    #[test]
    fn instance_disk_scan_records_usage_or_error() {
        let registry = EffectRegistry::with_defaults();
        let (mut s, job) = leased("instance.disk.scan", &[("instance_id", "i1")]);
        s.instances.insert("i1".into(), instance("i1"));
        let c = ctx(&registry);

        s.submit_result("a1", &job.id, report(&job.id, "succeeded", json!({"used_bytes": 52_428_800})), &c, t0()).unwrap();
        let i1 = &s.instances["i1"];
        assert_eq!(i1.disk_used_bytes, Some(52_428_800));
        assert!(i1.disk_error.is_none());
        assert_eq!(i1.disk_scanned_at, Some(t0()));

        let retry = lease_another(&mut s, "instance.disk.scan", &[("instance_id", "i1")]);
        s.submit_result("a1", &retry.id, report(&retry.id, "failed", json!({"message": "du timed out"})), &c, t0()).unwrap();
        let i1 = &s.instances["i1"];
        assert_eq!(i1.disk_error.as_deref(), Some("du timed out"));
        assert_eq!(i1.disk_used_bytes, Some(52_428_800));
    }

    #[test]
    fn progress_is_recorded_alongside_output_lines() {
        let registry = EffectRegistry::with_defaults();
        let (mut s, job) = leased("mail.sync", &[]);
        let report = LogReport {
            job_id: job.id.clone(),
            progress: Some(65),
            stdout: Some("synced inbox\nsynced archive".into()),
            ..Default::default()
        };
        s.submit_logs("a1", &job.id, report, &ctx(&registry), t0()).unwrap();
        let lines = s.log_lines(&job.id);
        assert!(lines.iter().any(|l| l.message == "progress 65%" && l.progress == Some(65)));
        assert!(lines.iter().any(|l| l.message == "synced archive" && l.progress.is_none()));
    }
}
