//! `ControlPlane`: the facade the HTTP layer and the background sweep talk
//! to. It owns the store and the collaborators, opens one transaction per
//! operation and reports to the audit/notification sinks after commit.

use chrono::{DateTime, Utc};
use common::{HeartbeatRequest, LogReport, PollResponse, RegisterRequest, RegisterResponse, ResultReport, JobEnvelope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{constant_time_eq, generate_agent_secret, AesSecretCipher, SecretCipher, SignatureParts, SignatureVerifier};
use crate::clock::{Clock, SystemClock};
use crate::config::PanelConfig;
use crate::dispatch::DispatchPolicy;
use crate::effects::{Applied, DiskThresholds, EffectRegistry};
use crate::error::{PanelError, PanelResult};
use crate::ingest::IngestContext;
use crate::jobs::NewJob;
use crate::model::{AgentStatus, Job, JobLogLine, JobResult};
use crate::ports::{AllocationRequest, PortAllocation, PortBlock, PortPool, PortRange, PortRule, ReleaseSummary};
use crate::sinks::{AuditEvent, AuditSink, JobObserver, Notifier, TracingAuditSink, TracingNotifier};
use crate::store::{Change, PanelState, Store};

/// Job plus everything recorded about it.
#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    pub job: Job,
    pub result: Option<JobResult>,
    pub logs: Vec<JobLogLine>,
}

/// Block request: whole pool, or restricted to `[start, end]`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockRequest {
    pub customer_id: String,
    pub size: u32,
    #[serde(default)]
    pub start: Option<u16>,
    #[serde(default)]
    pub end: Option<u16>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortRelease {
    pub blocks: Vec<String>,
    pub allocations: Vec<PortAllocation>,
    pub firewall_jobs: Vec<Job>,
}

pub struct ControlPlane {
    config: PanelConfig,
    store: Store,
    clock: Arc<dyn Clock>,
    cipher: Arc<dyn SecretCipher>,
    verifier: SignatureVerifier,
    registry: EffectRegistry,
    dispatch: DispatchPolicy,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    observers: Vec<Arc<dyn JobObserver>>,
}

pub struct ControlPlaneBuilder {
    config: PanelConfig,
    store: Option<Store>,
    clock: Arc<dyn Clock>,
    cipher: Option<Arc<dyn SecretCipher>>,
    registry: EffectRegistry,
    audit: Arc<dyn AuditSink>,
    notifier: Arc<dyn Notifier>,
    observers: Vec<Arc<dyn JobObserver>>,
}

impl ControlPlaneBuilder {
    pub fn new(config: PanelConfig) -> Self {
        Self {
            config,
            store: None,
            clock: Arc::new(SystemClock),
            cipher: None,
            registry: EffectRegistry::with_defaults(),
            audit: Arc::new(TracingAuditSink),
            notifier: Arc::new(TracingNotifier),
            observers: Vec::new(),
        }
    }

    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cipher(mut self, cipher: Arc<dyn SecretCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn registry(mut self, registry: EffectRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> ControlPlane {
        let store = self.store.unwrap_or_else(|| {
            if self.config.persist {
                Store::persistent(self.config.state_file())
            } else {
                Store::in_memory()
            }
        });
        let cipher = self
            .cipher
            .unwrap_or_else(|| Arc::new(AesSecretCipher::from_master_key(&self.config.master_key)));
        ControlPlane {
            verifier: SignatureVerifier::new(self.config.signature_window_secs),
            dispatch: DispatchPolicy::from_config(&self.config),
            config: self.config,
            store,
            clock: self.clock,
            cipher,
            registry: self.registry,
            audit: self.audit,
            notifier: self.notifier,
            observers: self.observers,
        }
    }
}

fn envelope(job: &Job) -> JobEnvelope {
    JobEnvelope {
        id: job.id.clone(),
        job_type: job.job_type.clone(),
        payload: job.payload.clone(),
        created_at: job.created_at,
        lock_token: job.lock_token.clone().unwrap_or_default(),
        lock_expires_at: job.lock_expires_at.unwrap_or(job.updated_at),
    }
}

impl ControlPlane {
    pub fn builder(config: PanelConfig) -> ControlPlaneBuilder {
        ControlPlaneBuilder::new(config)
    }

    pub fn config(&self) -> &PanelConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn record(&self, action: &str, actor: &str, subject: &str) -> AuditEvent {
        AuditEvent::new(action, actor, subject, self.now())
    }

    fn ingest_context(&self) -> IngestContext<'_> {
        IngestContext {
            registry: &self.registry,
            disk: DiskThresholds::from_config(&self.config),
            max_log_lines: self.config.max_log_lines,
            lease_ttl: self.dispatch.lease_ttl,
        }
    }

    /// Report follow-up work and notifications produced by side effects.
    fn report_applied(&self, applied: Applied) {
        for job in &applied.created_jobs {
            self.audit.record(self.record("job.created", "system", &job.id).with("type", job.job_type.clone()));
        }
        for summary in &applied.released {
            self.audit_release(summary, "system");
        }
        for n in applied.notifications {
            self.notifier.notify(n);
        }
    }

    fn audit_release(&self, summary: &ReleaseSummary, actor: &str) {
        for block in &summary.blocks {
            self.audit.record(self.record("port.block.released", actor, block));
        }
    }

    // ===== agent identity =====

    pub async fn register(&self, req: RegisterRequest) -> PanelResult<RegisterResponse> {
        if self.config.bootstrap_token.is_empty() || !constant_time_eq(&req.bootstrap_token, &self.config.bootstrap_token) {
            warn!(name = %req.name, "agent registration with bad bootstrap token");
            return Err(PanelError::Unauthenticated("bad bootstrap token".to_string()));
        }
        let secret = generate_agent_secret();
        let sealed = self.cipher.encrypt(&secret)?;
        let now = self.now();
        let agent = self.store.transact(|s| s.register_agent(&req, sealed, now)).await?;
        info!(agent_id = %agent.id, name = %agent.name, "agent registered");
        self.audit.record(self.record("agent.registered", &agent.id, &agent.id).with("name", agent.name.clone()));
        Ok(RegisterResponse { agent_id: agent.id, secret })
    }

    /// Verify a signed agent request; returns the authenticated agent id.
    pub async fn authenticate(&self, parts: &SignatureParts<'_>, method: &str, path_and_query: &str, body: &[u8]) -> PanelResult<String> {
        if parts.agent_id.is_empty() {
            return Err(PanelError::Unauthenticated("missing agent id".to_string()));
        }
        let agent = self
            .store
            .read(|s| s.agents.get(parts.agent_id).map(|a| (a.secret_payload.clone(), a.status)))
            .await;
        let (sealed, status) = agent.ok_or_else(|| PanelError::Unauthenticated(format!("unknown agent {}", parts.agent_id)))?;
        if status == AgentStatus::Disabled {
            return Err(PanelError::Unauthenticated(format!("agent {} is disabled", parts.agent_id)));
        }
        let secret = self.cipher.decrypt(&sealed)?;
        if let Err(e) = self.verifier.verify(parts, &secret, method, path_and_query, body, self.now()) {
            warn!(agent_id = %parts.agent_id, error = %e, "rejected agent signature");
            return Err(e);
        }
        Ok(parts.agent_id.to_string())
    }

    // ===== agent protocol =====

    pub async fn heartbeat(&self, agent_id: &str, req: HeartbeatRequest, ip: Option<String>) -> PanelResult<()> {
        let reports_windows = req
            .stats
            .get("os")
            .and_then(|v| v.as_str())
            .map(|os| os.eq_ignore_ascii_case("windows"))
            .unwrap_or(false);
        if reports_windows && !self.config.windows_enabled {
            return Err(PanelError::ServiceUnavailable("windows agents are disabled".to_string()));
        }
        let status = match req.status.as_deref() {
            None => AgentStatus::Online,
            Some(s) => AgentStatus::parse(s).ok_or_else(|| PanelError::BadRequest(format!("unknown agent status `{}`", s)))?,
        };
        let open_ports: Option<BTreeSet<PortRule>> = match req.stats.get("open_ports") {
            Some(serde_json::Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|p| p.parse::<PortRule>().map_err(PanelError::BadRequest))
                    .collect::<PanelResult<_>>()?,
            ),
            _ => None,
        };

        let now = self.now();
        self.store
            .transact_with(|s| {
                let agent = s
                    .agents
                    .get_mut(agent_id)
                    .ok_or_else(|| PanelError::Unauthenticated(format!("unknown agent {}", agent_id)))?;
                agent.last_heartbeat_at = Some(now);
                agent.last_heartbeat_ip = ip;
                agent.last_heartbeat_version = Some(req.version.clone());
                if let Some(metadata) = req.metadata {
                    agent.metadata.extend(metadata);
                }
                for key in ["os", "arch"] {
                    if let Some(v) = req.stats.get(key) {
                        agent.metadata.insert(key.to_string(), v.clone());
                    }
                }
                let roles_before = agent.roles.clone();
                if !req.roles.is_empty() {
                    agent.roles = req.roles.iter().map(|r| r.trim().to_string()).filter(|r| !r.is_empty()).collect();
                }
                // liveness alone stays in memory; routing inputs are saved
                let durable = agent.status != status || agent.roles != roles_before || open_ports.is_some();
                agent.status = status;
                agent.last_heartbeat_stats = req.stats;
                if let Some(ports) = open_ports {
                    s.record_open_ports(agent_id, ports, now);
                }
                Ok(((), if durable { Change::Durable } else { Change::InMemory }))
            })
            .await?;
        debug!(agent_id, "heartbeat");
        Ok(())
    }

    pub async fn poll(&self, agent_id: &str, limit: Option<usize>) -> PanelResult<PollResponse> {
        let limit = self.config.clamp_poll_limit(limit);
        let now = self.now();
        let outcome = self
            .store
            .transact_with(|s| {
                let outcome = s.poll_for_work(agent_id, limit, &self.dispatch, &self.observers, now)?;
                let changed = !outcome.leased.is_empty() || !outcome.expired.is_empty();
                Ok((outcome, Change::durable_if(changed)))
            })
            .await?;

        for job in &outcome.expired {
            self.audit.record(self.record("job.expired", "system", &job.id).with("type", job.job_type.clone()));
        }
        for job in &outcome.leased {
            info!(job_id = %job.id, job_type = %job.job_type, agent = %agent_id, "job leased");
            self.audit.record(self.record("job.leased", agent_id, &job.id).with("type", job.job_type.clone()));
        }
        Ok(PollResponse { jobs: outcome.leased.iter().map(envelope).collect(), max_concurrency: outcome.max_concurrency })
    }

    pub async fn submit_result(&self, agent_id: &str, job_id: &str, report: ResultReport) -> PanelResult<()> {
        let now = self.now();
        let ctx = self.ingest_context();
        let ingested = self.store.transact(|s| s.submit_result(agent_id, job_id, report, &ctx, now)).await?;

        info!(
            job_id = %job_id,
            job_type = %ingested.job.job_type,
            status = %ingested.result.status,
            agent = %agent_id,
            skipped = ingested.skipped_events,
            "job result recorded"
        );
        self.audit.record(
            self.record("job.result", agent_id, job_id)
                .with("type", ingested.job.job_type.clone())
                .with("status", ingested.result.status.as_str()),
        );
        for observer in &self.observers {
            observer.after_result(&ingested.job, &ingested.result);
        }
        self.report_applied(ingested.applied);
        Ok(())
    }

    pub async fn submit_logs(&self, agent_id: &str, job_id: &str, report: LogReport) -> PanelResult<DateTime<Utc>> {
        let now = self.now();
        let ctx = self.ingest_context();
        self.store.transact(|s| s.submit_logs(agent_id, job_id, report, &ctx, now)).await
    }

    // ===== producer side =====

    pub async fn create_job(&self, mut new: NewJob, actor: &str) -> PanelResult<Job> {
        if new.created_by.is_none() {
            new.created_by = Some(actor.to_string());
        }
        let now = self.now();
        let job = self.store.transact(|s| s.create_job(new, now)).await?;
        self.audit.record(self.record("job.created", actor, &job.id).with("type", job.job_type.clone()));
        Ok(job)
    }

    pub async fn job_detail(&self, job_id: &str) -> PanelResult<JobDetail> {
        self.store
            .read(|s| {
                Ok(JobDetail {
                    job: s.job(job_id)?.clone(),
                    result: s.results.get(job_id).cloned(),
                    logs: s.log_lines(job_id).to_vec(),
                })
            })
            .await
    }

    pub async fn cancel_job(&self, job_id: &str, actor: &str) -> PanelResult<Job> {
        let now = self.now();
        let job = self.store.transact(|s| s.cancel_job(job_id, now)).await?;
        self.audit.record(self.record("job.cancelled", actor, job_id));
        Ok(job)
    }

    pub async fn expire_stale_jobs(&self) -> PanelResult<Vec<Job>> {
        let now = self.now();
        let expired = self
            .store
            .transact_with(|s| {
                let expired = s.expire_stale_jobs(now);
                let changed = !expired.is_empty();
                Ok((expired, Change::durable_if(changed)))
            })
            .await?;
        for job in &expired {
            self.audit.record(self.record("job.expired", "system", &job.id).with("type", job.job_type.clone()));
        }
        Ok(expired)
    }

    /// Periodic stale-lease reclamation, in addition to the sweep at the
    /// start of every poll.
    pub fn spawn_stale_sweep(self: Arc<Self>) -> JoinHandle<()> {
        let plane = self;
        let period = StdDuration::from_secs(plane.config.stale_sweep_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match plane.expire_stale_jobs().await {
                    Ok(expired) if !expired.is_empty() => info!(count = expired.len(), "stale sweep reclaimed jobs"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "stale sweep failed"),
                }
            }
        })
    }

    // ===== ports =====

    pub async fn add_pool(&self, pool: PortPool) -> PanelResult<PortPool> {
        self.store.transact(|s| s.ports.add_pool(pool)).await
    }

    pub async fn add_range(&self, range: PortRange) -> PanelResult<PortRange> {
        self.store.transact(|s| s.ports.add_range(range)).await
    }

    pub async fn allocate_blocks(&self, pool_id: &str, req: BlockRequest, actor: &str) -> PanelResult<Vec<PortBlock>> {
        let now = self.now();
        let blocks = self
            .store
            .transact(|s| match (req.start, req.end) {
                (None, None) => Ok(vec![s.ports.allocate_block(pool_id, &req.customer_id, req.size, now)?]),
                (start, end) => {
                    let pool = s.ports.pools.get(pool_id).ok_or_else(|| crate::store::missing("port pool", pool_id))?;
                    let start = start.unwrap_or(pool.start_port);
                    let end = end.unwrap_or(pool.end_port);
                    s.ports.allocate_blocks_in_range(pool_id, &req.customer_id, start, end, req.size, now)
                }
            })
            .await?;
        for b in &blocks {
            info!(block = %b.id, pool = %pool_id, start = b.start_port, end = b.end_port, "port block allocated");
            self.audit.record(
                self.record("port.block.allocated", actor, &b.id)
                    .with("customer_id", b.customer_id.clone())
                    .with("range", format!("{}-{}", b.start_port, b.end_port)),
            );
        }
        Ok(blocks)
    }

    /// Bind a block to an instance and queue any firewall change it needs.
    pub async fn bind_block(&self, block_id: &str, instance_id: &str) -> PanelResult<PortBlock> {
        let now = self.now();
        let (block, jobs) = self
            .store
            .transact(|s| {
                let block = s.ports.bind_block(block_id, instance_id)?;
                let jobs = s.reconcile_firewall(&block.node_id, now);
                Ok((block, jobs))
            })
            .await?;
        self.report_applied(Applied { created_jobs: jobs, ..Default::default() });
        Ok(block)
    }

    pub async fn release_block(&self, block_id: &str, actor: &str) -> PanelResult<PortBlock> {
        let now = self.now();
        let (block, jobs) = self
            .store
            .transact(|s| {
                let block = s.ports.release_block(block_id, now)?;
                let jobs = s.reconcile_firewall(&block.node_id, now);
                Ok((block, jobs))
            })
            .await?;
        self.audit.record(self.record("port.block.released", actor, block_id));
        self.report_applied(Applied { created_jobs: jobs, ..Default::default() });
        Ok(block)
    }

    pub async fn allocate_port(&self, req: AllocationRequest, actor: &str) -> PanelResult<PortAllocation> {
        let now = self.now();
        let (allocation, jobs) = self
            .store
            .transact(|s| {
                let allocation = s.ports.allocate_port(&req, now)?;
                let jobs = s.reconcile_firewall(&allocation.node_id, now);
                Ok((allocation, jobs))
            })
            .await?;
        self.audit.record(
            self.record("port.allocated", actor, &allocation.id)
                .with("port", format!("{}:{}", allocation.protocol, allocation.port))
                .with("instance_id", allocation.instance_id.clone())
                .with("role", allocation.role.clone()),
        );
        self.report_applied(Applied { created_jobs: jobs, ..Default::default() });
        Ok(allocation)
    }

    pub async fn release_instance_ports(&self, instance_id: &str, actor: &str) -> PanelResult<PortRelease> {
        let now = self.now();
        let (summary, jobs) = self
            .store
            .transact(|s: &mut PanelState| {
                let summary = s.ports.release_instance(instance_id, now);
                let mut jobs = Vec::new();
                for node in &summary.nodes {
                    jobs.extend(s.reconcile_firewall(node, now));
                }
                Ok((summary, jobs))
            })
            .await?;
        self.audit_release(&summary, actor);
        self.report_applied(Applied { created_jobs: jobs.clone(), ..Default::default() });
        Ok(PortRelease { blocks: summary.blocks, allocations: summary.allocations, firewall_jobs: jobs })
    }

    pub async fn reconcile_firewall(&self, node_id: &str) -> PanelResult<Vec<Job>> {
        let now = self.now();
        let jobs = self
            .store
            .transact_with(|s| {
                let jobs = s.reconcile_firewall(node_id, now);
                let changed = !jobs.is_empty();
                Ok((jobs, Change::durable_if(changed)))
            })
            .await?;
        self.report_applied(Applied { created_jobs: jobs.clone(), ..Default::default() });
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{Agent, Backup, BackupStatus, JobStatus};
    use crate::sinks::{MemoryAuditSink, MemoryNotifier, NotificationKind};
    use chrono::Duration;
    use common::{JobPayloadMap, SignedHeaders};

    struct Fixture {
        plane: Arc<ControlPlane>,
        clock: Arc<ManualClock>,
        audit: Arc<MemoryAuditSink>,
        notifier: Arc<MemoryNotifier>,
    }

    fn fixture(observer: Option<Arc<dyn JobObserver>>) -> Fixture {
        let config = PanelConfig {
            persist: false,
            bootstrap_token: "boot".into(),
            master_key: "master".into(),
            ..PanelConfig::default()
        };
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let audit = Arc::new(MemoryAuditSink::default());
        let notifier = Arc::new(MemoryNotifier::default());
        let mut builder = ControlPlane::builder(config)
            .store(Store::in_memory())
            .clock(clock.clone())
            .audit(audit.clone())
            .notifier(notifier.clone());
        if let Some(observer) = observer {
            builder = builder.observer(observer);
        }
        Fixture { plane: Arc::new(builder.build()), clock, audit, notifier }
    }

    fn payload(pairs: &[(&str, &str)]) -> JobPayloadMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    async fn register(plane: &ControlPlane) -> RegisterResponse {
        let req = RegisterRequest {
            bootstrap_token: "boot".into(),
            name: "node-a".into(),
            roles: vec!["game".into()],
            metadata: Default::default(),
        };
        plane.register(req).await.unwrap()
    }

    #[tokio::test]
    async fn registration_seals_secret_and_authenticates_signatures() {
        let f = fixture(None);
        let bad = RegisterRequest {
            bootstrap_token: "nope".into(),
            name: "x".into(),
            roles: vec![],
            metadata: Default::default(),
        };
        assert!(matches!(f.plane.register(bad).await, Err(PanelError::Unauthenticated(_))));

        let creds = register(&f.plane).await;
        let sealed = f.plane.store().read(|s| s.agents[&creds.agent_id].secret_payload.clone()).await;
        assert!(!sealed.contains(&creds.secret));

        let ts = f.plane.now().timestamp();
        let headers = SignedHeaders::sign(&creds.agent_id, &creds.secret, "GET", "/agent/jobs?limit=2", b"", ts);
        let ts_text = headers.timestamp.to_string();
        let parts = SignatureParts {
            agent_id: &headers.agent_id,
            timestamp: &ts_text,
            nonce: &headers.nonce,
            signature: &headers.signature,
        };
        let agent = f.plane.authenticate(&parts, "GET", "/agent/jobs?limit=2", b"").await.unwrap();
        assert_eq!(agent, creds.agent_id);
        // same path, different query
        let err = f.plane.authenticate(&parts, "GET", "/agent/jobs?limit=3", b"").await.unwrap_err();
        assert!(matches!(err, PanelError::SignatureInvalid(_)));
    }

    #[tokio::test]
    async fn lapsed_lease_is_reclaimed_and_never_reoffered() {
        let f = fixture(None);
        let creds = register(&f.plane).await;
        let job = f.plane.create_job(NewJob::new("mail.sync", JobPayloadMap::new()), "admin").await.unwrap();

        let first = f.plane.poll(&creds.agent_id, None).await.unwrap();
        assert_eq!(first.jobs.len(), 1);
        assert_eq!(first.max_concurrency, 4);

        f.clock.advance(Duration::seconds(599));
        assert!(f.plane.expire_stale_jobs().await.unwrap().is_empty());
        f.clock.advance(Duration::seconds(1));

        // the sweep at the start of a poll reclaims it
        let second = f.plane.poll(&creds.agent_id, None).await.unwrap();
        assert!(second.jobs.is_empty());
        let detail = f.plane.job_detail(&job.id).await.unwrap();
        assert_eq!(detail.job.status, JobStatus::Failed);
        assert!(detail.job.lock_invariant_holds());
        let result = detail.result.unwrap();
        assert_eq!(result.output.get("reason").and_then(|v| v.as_str()), Some("lease_expired"));
        assert!(f.audit.actions().contains(&"job.expired".to_string()));
    }

    #[tokio::test]
    async fn failed_backup_notifies_after_commit() {
        let f = fixture(None);
        let creds = register(&f.plane).await;
        f.plane
            .store()
            .transact(|s| {
                s.backups.insert(
                    "b1".into(),
                    Backup {
                        id: "b1".into(),
                        instance_id: "i1".into(),
                        status: BackupStatus::Queued,
                        size_bytes: None,
                        error: None,
                        completed_at: None,
                    },
                );
                Ok(())
            })
            .await
            .unwrap();

        let job = f
            .plane
            .create_job(NewJob::new("instance.backup.create", payload(&[("backup_id", "b1"), ("instance_id", "i1")])), "admin")
            .await
            .unwrap();
        f.plane.poll(&creds.agent_id, None).await.unwrap();
        let mut output = serde_json::Map::new();
        output.insert("error".into(), "disk full".into());
        let report = ResultReport { job_id: job.id.clone(), status: "failed".into(), completed_at: None, output, lock_token: None };
        f.plane.submit_result(&creds.agent_id, &job.id, report).await.unwrap();

        let backup = f.plane.store().read(|s| s.backups["b1"].clone()).await;
        assert_eq!(backup.status, BackupStatus::Failed);
        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::BackupFailed);
    }

    struct HoldUpdates;

    impl JobObserver for HoldUpdates {
        fn before_dispatch(&self, job: &Job, _agent: &Agent) -> bool {
            job.job_type != "agent.update"
        }
    }

    #[tokio::test]
    async fn observer_veto_leaves_job_queued() {
        let f = fixture(Some(Arc::new(HoldUpdates)));
        let creds = register(&f.plane).await;
        let held = f.plane.create_job(NewJob::new("agent.update", JobPayloadMap::new()), "admin").await.unwrap();
        f.clock.advance(Duration::seconds(1));
        f.plane.create_job(NewJob::new("mail.sync", JobPayloadMap::new()), "admin").await.unwrap();

        let polled = f.plane.poll(&creds.agent_id, None).await.unwrap();
        assert_eq!(polled.jobs.len(), 1);
        assert_eq!(polled.jobs[0].job_type, "mail.sync");
        let held = f.plane.job_detail(&held.id).await.unwrap();
        assert_eq!(held.job.status, JobStatus::Queued);
        assert!(!held.job.is_locked());
    }

    #[tokio::test]
    async fn cancel_only_while_queued() {
        let f = fixture(None);
        let creds = register(&f.plane).await;
        let job = f.plane.create_job(NewJob::new("mail.sync", JobPayloadMap::new()), "admin").await.unwrap();
        f.plane.poll(&creds.agent_id, None).await.unwrap();
        assert!(matches!(f.plane.cancel_job(&job.id, "admin").await, Err(PanelError::Conflict(_))));

        let queued = f.plane.create_job(NewJob::new("mail.sync", JobPayloadMap::new()), "admin").await.unwrap();
        let cancelled = f.plane.cancel_job(&queued.id, "admin").await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(f.audit.actions().contains(&"job.cancelled".to_string()));
    }

    fn heartbeat_req() -> HeartbeatRequest {
        HeartbeatRequest { version: "1.0.0".into(), stats: Default::default(), roles: vec![], metadata: None, status: None }
    }

    #[tokio::test]
    async fn idle_operations_leave_the_snapshot_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel-state.json");
        let config = PanelConfig { bootstrap_token: "boot".into(), master_key: "master".into(), ..PanelConfig::default() };
        let plane = ControlPlane::builder(config).store(Store::persistent(&path)).build();

        let creds = register(&plane).await;
        // first heartbeat moves the agent online
        plane.heartbeat(&creds.agent_id, heartbeat_req(), None).await.unwrap();
        let revision = plane.store().read(|s| s.revision).await;
        let snapshot = std::fs::read(&path).unwrap();

        assert!(plane.expire_stale_jobs().await.unwrap().is_empty());
        assert!(plane.poll(&creds.agent_id, None).await.unwrap().jobs.is_empty());
        assert!(plane.reconcile_firewall(&creds.agent_id).await.unwrap().is_empty());
        plane.heartbeat(&creds.agent_id, heartbeat_req(), None).await.unwrap();

        assert_eq!(plane.store().read(|s| s.revision).await, revision);
        assert_eq!(std::fs::read(&path).unwrap(), snapshot);
        assert!(plane.store().read(|s| s.agents[&creds.agent_id].last_heartbeat_at.is_some()).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_block_requests_never_overlap() {
        let f = fixture(None);
        f.plane
            .add_pool(PortPool {
                id: "pool-1".into(),
                node_id: "n1".into(),
                name: "game".into(),
                start_port: 7000,
                end_port: 7099,
                protocols: vec![],
                purpose: "game".into(),
                enabled: true,
            })
            .await
            .unwrap();

        let tasks: Vec<_> = (0..12)
            .map(|i| {
                let plane = f.plane.clone();
                tokio::spawn(async move {
                    let req = BlockRequest { customer_id: format!("c{}", i), size: 8, start: None, end: None };
                    plane.allocate_blocks("pool-1", req, "admin").await
                })
            })
            .collect();

        let mut granted = Vec::new();
        let mut exhausted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(blocks) => granted.extend(blocks),
                Err(PanelError::PortsExhausted { .. }) => exhausted += 1,
                Err(e) => panic!("unexpected {:?}", e),
            }
        }
        // 100 ports hold twelve 8-port blocks
        assert_eq!((granted.len(), exhausted), (12, 0));
        granted.sort_by_key(|b| b.start_port);
        for pair in granted.windows(2) {
            assert!(pair[0].end_port < pair[1].start_port, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
        assert_eq!(granted.first().map(|b| b.start_port), Some(7000));
        assert_eq!(granted.last().map(|b| b.end_port), Some(7095));
    }
}
