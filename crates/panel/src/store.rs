//! Durable control-plane state.
//!
//! All state lives in one [`PanelState`] behind a `tokio::sync::Mutex`. Each
//! operation runs as one closure under the lock, mutating the state in place.
//! Operations check every precondition before their first write, so an `Err`
//! leaves the state as it was. The closure reports a [`Change`]; only durable
//! changes bump the revision and rewrite the snapshot on disk.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{PanelError, PanelResult};
use crate::firewall::NodeFirewall;
use crate::model::{
    Agent, Backup, DdosPolicy, DdosStatus, DeletionRequest, DomainRecord, Instance, Job, JobId, JobLogLine, JobResult,
    NodeDisk, TsServer, User,
};
use crate::ports::PortTables;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelState {
    pub jobs: BTreeMap<JobId, Job>,
    pub results: BTreeMap<JobId, JobResult>,
    pub logs: BTreeMap<JobId, Vec<JobLogLine>>,
    pub agents: BTreeMap<String, Agent>,
    pub ports: PortTables,
    pub firewalls: BTreeMap<String, NodeFirewall>,
    pub ddos_status: BTreeMap<String, DdosStatus>,
    pub ddos_policy: BTreeMap<String, DdosPolicy>,
    pub domains: BTreeMap<String, DomainRecord>,
    pub instances: BTreeMap<String, Instance>,
    pub ts_servers: BTreeMap<String, TsServer>,
    pub backups: BTreeMap<String, Backup>,
    pub users: BTreeMap<String, User>,
    pub deletion_requests: BTreeMap<String, DeletionRequest>,
    pub node_disks: BTreeMap<String, NodeDisk>,
    pub next_seq: u64,
    /// Bumped on every committed transaction.
    pub revision: u64,
}

impl PanelState {
    pub fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// What a transaction did to the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// Nothing was written.
    Unchanged,
    /// Liveness data only; kept in memory and saved with the next durable
    /// change.
    InMemory,
    Durable,
}

impl Change {
    pub fn durable_if(changed: bool) -> Self {
        if changed {
            Change::Durable
        } else {
            Change::Unchanged
        }
    }
}

pub struct Store {
    state: Arc<Mutex<PanelState>>,
    state_file: Option<PathBuf>,
    /// Revision most recently written to disk.
    written: Mutex<u64>,
}

impl Store {
    pub fn in_memory() -> Self {
        Self::with_state(PanelState::default(), None)
    }

    pub fn persistent(state_file: impl Into<PathBuf>) -> Self {
        Self::with_state(PanelState::default(), Some(state_file.into()))
    }

    pub fn with_state(state: PanelState, state_file: Option<PathBuf>) -> Self {
        Self { state: Arc::new(Mutex::new(state)), state_file, written: Mutex::new(0) }
    }

    pub async fn load_from_disk(&self) -> anyhow::Result<()> {
        let Some(state_file) = &self.state_file else { return Ok(()) };
        if !tokio::fs::try_exists(state_file).await.unwrap_or(false) {
            return Ok(());
        }
        let content = tokio::fs::read_to_string(state_file).await?;
        let loaded: PanelState = serde_json::from_str(&content)?;
        info!(
            jobs = loaded.jobs.len(),
            agents = loaded.agents.len(),
            path = %state_file.display(),
            "loaded panel state from disk"
        );
        *self.written.lock().await = loaded.revision;
        *self.state.lock().await = loaded;
        Ok(())
    }

    /// Read-only access.
    pub async fn read<R>(&self, f: impl FnOnce(&PanelState) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    /// Run `f` as one atomic transaction that always persists.
    pub async fn transact<R>(&self, f: impl FnOnce(&mut PanelState) -> PanelResult<R>) -> PanelResult<R> {
        self.transact_with(|s| f(s).map(|out| (out, Change::Durable))).await
    }

    /// Run `f` as one atomic transaction; the reported [`Change`] decides
    /// whether the revision moves and the snapshot is rewritten.
    pub async fn transact_with<R>(
        &self,
        f: impl FnOnce(&mut PanelState) -> PanelResult<(R, Change)>,
    ) -> PanelResult<R> {
        let (out, snapshot) = {
            let mut state = self.state.lock().await;
            let (out, change) = f(&mut state)?;
            if change != Change::Durable {
                return Ok(out);
            }
            state.revision += 1;
            let snapshot = match &self.state_file {
                Some(_) => Some((state.revision, serde_json::to_vec_pretty(&*state))),
                None => None,
            };
            (out, snapshot)
        };

        if let Some((revision, encoded)) = snapshot {
            match encoded {
                Ok(bytes) => {
                    if let Err(e) = self.save(revision, bytes).await {
                        warn!(error = %e, "failed to save panel state");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode panel state"),
            }
        }
        Ok(out)
    }

    async fn save(&self, revision: u64, bytes: Vec<u8>) -> anyhow::Result<()> {
        let Some(state_file) = &self.state_file else { return Ok(()) };
        let mut written = self.written.lock().await;
        // a later revision already reached disk
        if revision <= *written {
            return Ok(());
        }
        if let Some(dir) = state_file.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = state_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, state_file).await?;
        *written = revision;
        debug!(revision, "panel state saved");
        Ok(())
    }
}

/// Shorthand for "row not found" lookups.
pub fn missing(kind: &str, id: &str) -> PanelError {
    PanelError::NotFound(format!("{} {}", kind, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejected_transaction_is_not_committed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel-state.json");
        let store = Store::persistent(&path);
        let res: PanelResult<()> = store.transact(|_| Err(PanelError::Conflict("nope".into()))).await;
        assert!(res.is_err());
        assert_eq!(store.read(|s| s.revision).await, 0);
        assert!(!path.exists());

        store.transact(|s| Ok(s.next_seq())).await.unwrap();
        assert_eq!(store.read(|s| (s.next_seq, s.revision)).await, (1, 1));
    }

    #[tokio::test]
    async fn unchanged_and_in_memory_transactions_skip_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel-state.json");
        let store = Store::persistent(&path);

        store.transact_with(|_| Ok(((), Change::Unchanged))).await.unwrap();
        assert_eq!(store.read(|s| s.revision).await, 0);
        assert!(!path.exists());

        store.transact_with(|s| Ok((s.next_seq(), Change::InMemory))).await.unwrap();
        assert_eq!(store.read(|s| (s.next_seq, s.revision)).await, (1, 0));
        assert!(!path.exists());

        // the next durable change carries the in-memory one to disk
        store.transact(|s| Ok(s.next_seq())).await.unwrap();
        let reloaded = Store::persistent(&path);
        reloaded.load_from_disk().await.unwrap();
        assert_eq!(reloaded.read(|s| (s.next_seq, s.revision)).await, (2, 1));
    }

    #[tokio::test]
    async fn snapshot_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel-state.json");

        let store = Store::persistent(&path);
        store.transact(|s| Ok(s.next_seq())).await.unwrap();
        store.transact(|s| Ok(s.next_seq())).await.unwrap();
        assert!(path.exists());

        let reloaded = Store::persistent(&path);
        reloaded.load_from_disk().await.unwrap();
        assert_eq!(reloaded.read(|s| (s.next_seq, s.revision)).await, (2, 2));
    }

    #[tokio::test]
    async fn missing_state_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::persistent(dir.path().join("absent.json"));
        store.load_from_disk().await.unwrap();
        assert_eq!(store.read(|s| s.jobs.len()).await, 0);
    }
}
