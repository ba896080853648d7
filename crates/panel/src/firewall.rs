//! Firewall state reconciler: compares the ports a node should expose with
//! what it last reported and enqueues the firewall jobs that close the gap.

use chrono::{DateTime, Utc};
use common::JobPayloadMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::info;

use crate::model::{Job, JobStatus};
use crate::ports::PortRule;
use crate::store::PanelState;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeFirewall {
    pub node_id: String,
    /// Last reported set of open ports.
    pub open_ports: BTreeSet<PortRule>,
    /// Ports the panel opened itself; only these are ever closed again.
    #[serde(default)]
    pub managed: BTreeSet<PortRule>,
    pub reported_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FirewallPlan {
    pub node_id: String,
    pub open: Vec<PortRule>,
    pub close: Vec<PortRule>,
}

impl FirewallPlan {
    pub fn is_empty(&self) -> bool {
        self.open.is_empty() && self.close.is_empty()
    }
}

/// `tcp:80,udp:27015`
pub fn format_ports(ports: &[PortRule]) -> String {
    ports.iter().map(PortRule::to_string).collect::<Vec<_>>().join(",")
}

impl PanelState {
    pub fn firewall_plan(&self, node_id: &str) -> FirewallPlan {
        let desired = self.ports.desired_open_ports(node_id);
        let (reported, managed) = self
            .firewalls
            .get(node_id)
            .map(|f| (f.open_ports.clone(), f.managed.clone()))
            .unwrap_or_default();
        FirewallPlan {
            node_id: node_id.to_string(),
            open: desired.difference(&reported).copied().collect(),
            close: reported
                .iter()
                .filter(|p| managed.contains(p) && !desired.contains(p))
                .copied()
                .collect(),
        }
    }

    /// Enqueue `firewall.open_ports` / `firewall.close_ports` for the current
    /// diff, skipping a job identical to one already queued or running.
    pub fn reconcile_firewall(&mut self, node_id: &str, now: DateTime<Utc>) -> Vec<Job> {
        let plan = self.firewall_plan(node_id);
        let mut created = Vec::new();
        for (job_type, ports) in [("firewall.open_ports", &plan.open), ("firewall.close_ports", &plan.close)] {
            if ports.is_empty() {
                continue;
            }
            let ports = format_ports(ports);
            if self.has_identical_firewall_job(job_type, node_id, &ports) {
                continue;
            }
            let mut payload = JobPayloadMap::new();
            payload.insert("node_id".into(), node_id.to_string());
            payload.insert("agent_id".into(), node_id.to_string());
            payload.insert("ports".into(), ports.clone());
            let job = self.insert_job(job_type, payload, Some("system".into()), now);
            info!(node = %node_id, job_id = %job.id, job_type, ports = %ports, "firewall drift queued");
            created.push(job);
        }
        created
    }

    fn has_identical_firewall_job(&self, job_type: &str, node_id: &str, ports: &str) -> bool {
        self.jobs.values().any(|j| {
            matches!(j.status, JobStatus::Queued | JobStatus::Running)
                && j.job_type == job_type
                && j.node_id() == Some(node_id)
                && j.payload.get("ports").map(String::as_str) == Some(ports)
        })
    }

    /// Heartbeat-reported firewall state replaces the recorded set.
    pub fn record_open_ports(&mut self, node_id: &str, ports: BTreeSet<PortRule>, now: DateTime<Utc>) {
        let fw = self.firewall_entry(node_id);
        fw.open_ports = ports;
        fw.reported_at = Some(now);
    }

    /// Result of a successful firewall job.
    pub fn apply_firewall_change(&mut self, node_id: &str, opened: &[PortRule], closed: &[PortRule], now: DateTime<Utc>) {
        let fw = self.firewall_entry(node_id);
        for p in opened {
            fw.open_ports.insert(*p);
            fw.managed.insert(*p);
        }
        for p in closed {
            fw.open_ports.remove(p);
            fw.managed.remove(p);
        }
        fw.reported_at = Some(now);
    }

    fn firewall_entry(&mut self, node_id: &str) -> &mut NodeFirewall {
        self.firewalls
            .entry(node_id.to_string())
            .or_insert_with(|| NodeFirewall { node_id: node_id.to_string(), ..Default::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{PortAllocation, Protocol};

    fn alloc(s: &mut PanelState, instance: &str, protocol: Protocol, port: u16) {
        s.ports
            .insert_allocation(PortAllocation {
                id: format!("{}-{}-{}", instance, protocol, port),
                node_id: "n1".into(),
                protocol,
                port,
                instance_id: instance.into(),
                role: format!("r{}", port),
                allocated_at: Utc::now(),
            })
            .unwrap();
    }

    #[test]
    fn plan_opens_missing_ports() {
        let mut s = PanelState::default();
        alloc(&mut s, "i1", Protocol::Udp, 27015);
        alloc(&mut s, "i1", Protocol::Tcp, 80);
        s.record_open_ports("n1", [PortRule::new(Protocol::Tcp, 22)].into_iter().collect(), Utc::now());

        let jobs = s.reconcile_firewall("n1", Utc::now());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_type, "firewall.open_ports");
        assert_eq!(jobs[0].payload["ports"], "tcp:80,udp:27015");
        assert_eq!(jobs[0].target_agent(), Some("n1"));

        // identical job already queued
        assert!(s.reconcile_firewall("n1", Utc::now()).is_empty());
    }

    #[test]
    fn only_managed_ports_are_closed() {
        let mut s = PanelState::default();
        alloc(&mut s, "i1", Protocol::Tcp, 8080);
        s.apply_firewall_change("n1", &[PortRule::new(Protocol::Tcp, 8080)], &[], Utc::now());
        let mut reported = BTreeSet::new();
        reported.insert(PortRule::new(Protocol::Tcp, 22));
        reported.insert(PortRule::new(Protocol::Tcp, 8080));
        s.record_open_ports("n1", reported, Utc::now());
        assert!(s.firewall_plan("n1").is_empty());

        s.ports.release_instance("i1", Utc::now());
        let plan = s.firewall_plan("n1");
        assert!(plan.open.is_empty());
        assert_eq!(plan.close, vec![PortRule::new(Protocol::Tcp, 8080)]);
    }
}
