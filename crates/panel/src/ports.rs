//! Port lease manager: contiguous port blocks leased from per-node pools and
//! single-port allocations from per-node ranges.
//!
//! Every operation here runs on `&mut PortTables` inside one store
//! transaction, so scan-and-insert is atomic per call. `insert_allocation` is
//! the only path that creates a [`PortAllocation`] and is where the
//! `(node, protocol, port)` uniqueness is enforced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{PanelError, PanelResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol `{}`", other)),
        }
    }
}

/// One firewall-relevant `(protocol, port)` pair, written `tcp:25565`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortRule {
    pub protocol: Protocol,
    pub port: u16,
}

impl PortRule {
    pub fn new(protocol: Protocol, port: u16) -> Self {
        Self { protocol, port }
    }
}

impl fmt::Display for PortRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.port)
    }
}

impl FromStr for PortRule {
    type Err = String;

    /// Accepts `tcp:80` and `80/tcp`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (proto, port) = if let Some((p, n)) = s.split_once(':') {
            (p, n)
        } else if let Some((n, p)) = s.split_once('/') {
            (p, n)
        } else {
            return Err(format!("`{}` is not protocol:port", s));
        };
        let port: u16 = port.trim().parse().map_err(|_| format!("`{}` is not a port", port.trim()))?;
        if port == 0 {
            return Err("port 0 is not allocatable".to_string());
        }
        Ok(PortRule::new(proto.parse()?, port))
    }
}

fn default_protocols() -> Vec<Protocol> {
    vec![Protocol::Tcp, Protocol::Udp]
}

fn default_enabled() -> bool {
    true
}

/// Named per-node pool that port blocks are leased from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortPool {
    #[serde(default)]
    pub id: String,
    pub node_id: String,
    pub name: String,
    pub start_port: u16,
    pub end_port: u16,
    #[serde(default = "default_protocols")]
    pub protocols: Vec<Protocol>,
    #[serde(default)]
    pub purpose: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Per-node range that single-port allocations draw from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRange {
    #[serde(default)]
    pub id: String,
    pub node_id: String,
    pub name: String,
    pub start_port: u16,
    pub end_port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub purpose: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortBlock {
    pub id: String,
    pub pool_id: String,
    pub node_id: String,
    pub customer_id: String,
    pub instance_id: Option<String>,
    pub start_port: u16,
    pub end_port: u16,
    pub allocated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl PortBlock {
    /// Released blocks stay on record but no longer reserve their ports.
    pub fn is_active(&self) -> bool {
        self.released_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortAllocation {
    pub id: String,
    pub node_id: String,
    pub protocol: Protocol,
    pub port: u16,
    pub instance_id: String,
    /// Role key within the instance, e.g. "game", "query", "rcon".
    pub role: String,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Lowest free port of the range.
    FirstFree { range_id: String },
    /// `port(base_role) + offset`, e.g. query = game + 1.
    Derived { base_role: String, offset: i32 },
    Explicit { port: u16 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub node_id: String,
    pub protocol: Protocol,
    pub instance_id: String,
    pub role: String,
    pub strategy: AllocationStrategy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReleaseSummary {
    pub blocks: Vec<String>,
    pub allocations: Vec<PortAllocation>,
    pub nodes: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortTables {
    pub pools: BTreeMap<String, PortPool>,
    pub ranges: BTreeMap<String, PortRange>,
    pub blocks: BTreeMap<String, PortBlock>,
    pub allocations: BTreeMap<String, PortAllocation>,
}

fn check_bounds(start: u16, end: u16) -> PanelResult<()> {
    if start == 0 || start > end {
        return Err(PanelError::InvalidRange(format!("{}-{} is not a valid port range", start, end)));
    }
    Ok(())
}

impl PortTables {
    pub fn add_pool(&mut self, mut pool: PortPool) -> PanelResult<PortPool> {
        check_bounds(pool.start_port, pool.end_port)?;
        if pool.protocols.is_empty() {
            pool.protocols = default_protocols();
        }
        if pool.id.is_empty() {
            pool.id = Uuid::new_v4().to_string();
        }
        self.pools.insert(pool.id.clone(), pool.clone());
        Ok(pool)
    }

    pub fn add_range(&mut self, mut range: PortRange) -> PanelResult<PortRange> {
        check_bounds(range.start_port, range.end_port)?;
        if range.id.is_empty() {
            range.id = Uuid::new_v4().to_string();
        }
        self.ranges.insert(range.id.clone(), range.clone());
        Ok(range)
    }

    fn pool(&self, pool_id: &str) -> PanelResult<&PortPool> {
        let pool = self
            .pools
            .get(pool_id)
            .ok_or_else(|| PanelError::NotFound(format!("port pool {}", pool_id)))?;
        if !pool.enabled {
            return Err(PanelError::Conflict(format!("port pool {} is disabled", pool_id)));
        }
        Ok(pool)
    }

    /// Whether an active block reserves `protocol`. A block whose pool is
    /// gone reserves both.
    fn block_reserves(&self, block: &PortBlock, protocol: Protocol) -> bool {
        block.is_active()
            && self
                .pools
                .get(&block.pool_id)
                .map(|p| p.protocols.contains(&protocol))
                .unwrap_or(true)
    }

    /// Reserved intervals on a node as seen by a pool: blocks and single
    /// allocations that hold any of the pool's protocols. Sorted by start.
    fn occupied_for_pool(&self, pool: &PortPool) -> Vec<(u32, u32)> {
        let mut occupied: Vec<(u32, u32)> = self
            .blocks
            .values()
            .filter(|b| b.node_id == pool.node_id && pool.protocols.iter().any(|p| self.block_reserves(b, *p)))
            .map(|b| (u32::from(b.start_port), u32::from(b.end_port)))
            .chain(
                self.allocations
                    .values()
                    .filter(|a| a.node_id == pool.node_id && pool.protocols.contains(&a.protocol))
                    .map(|a| (u32::from(a.port), u32::from(a.port))),
            )
            .collect();
        occupied.sort_unstable();
        occupied
    }

    /// Free runs inside `[start, end]`, in ascending order.
    fn free_runs(occupied: &[(u32, u32)], start: u32, end: u32) -> Vec<(u32, u32)> {
        let mut runs = Vec::new();
        let mut cursor = start;
        for &(s, e) in occupied {
            if cursor > end {
                break;
            }
            if e < cursor || s > end {
                continue;
            }
            if s > cursor {
                runs.push((cursor, s - 1));
            }
            cursor = cursor.max(e + 1);
        }
        if cursor <= end {
            runs.push((cursor, end));
        }
        runs
    }

    fn insert_block(&mut self, pool: &PortPool, customer_id: &str, start: u32, end: u32, now: DateTime<Utc>) -> PortBlock {
        // start/end come from a u16 pool range
        let block = PortBlock {
            id: Uuid::new_v4().to_string(),
            pool_id: pool.id.clone(),
            node_id: pool.node_id.clone(),
            customer_id: customer_id.to_string(),
            instance_id: None,
            start_port: start as u16,
            end_port: end as u16,
            allocated_at: now,
            released_at: None,
        };
        self.blocks.insert(block.id.clone(), block.clone());
        block
    }

    /// First-fit lease of `size` consecutive ports from the whole pool.
    pub fn allocate_block(&mut self, pool_id: &str, customer_id: &str, size: u32, now: DateTime<Utc>) -> PanelResult<PortBlock> {
        if size == 0 {
            return Err(PanelError::BadRequest("block size must be at least 1".to_string()));
        }
        let pool = self.pool(pool_id)?.clone();
        let occupied = self.occupied_for_pool(&pool);
        let run = Self::free_runs(&occupied, u32::from(pool.start_port), u32::from(pool.end_port))
            .into_iter()
            .find(|(s, e)| e - s + 1 >= size)
            .ok_or_else(|| PanelError::PortsExhausted { pool_id: pool.id.clone(), size })?;
        Ok(self.insert_block(&pool, customer_id, run.0, run.0 + size - 1, now))
    }

    /// First-fit lease of `size` ports restricted to `[start, end]`. A single
    /// contiguous block is preferred; otherwise the earliest free runs are
    /// combined into several disjoint blocks.
    pub fn allocate_blocks_in_range(
        &mut self,
        pool_id: &str,
        customer_id: &str,
        start: u16,
        end: u16,
        size: u32,
        now: DateTime<Utc>,
    ) -> PanelResult<Vec<PortBlock>> {
        if start > end {
            return Err(PanelError::InvalidRange(format!("start {} is after end {}", start, end)));
        }
        let pool = self.pool(pool_id)?.clone();
        if start < pool.start_port || end > pool.end_port {
            return Err(PanelError::InvalidRange(format!(
                "{}-{} is outside pool {} ({}-{})",
                start, end, pool.id, pool.start_port, pool.end_port
            )));
        }
        if size == 0 {
            return Err(PanelError::BadRequest("block size must be at least 1".to_string()));
        }
        let occupied = self.occupied_for_pool(&pool);
        let runs = Self::free_runs(&occupied, u32::from(start), u32::from(end));

        if let Some(&(s, _)) = runs.iter().find(|(s, e)| e - s + 1 >= size) {
            return Ok(vec![self.insert_block(&pool, customer_id, s, s + size - 1, now)]);
        }

        let available: u32 = runs.iter().map(|(s, e)| e - s + 1).sum();
        if available < size {
            return Err(PanelError::PortsExhausted { pool_id: pool.id.clone(), size });
        }
        let mut remaining = size;
        let mut blocks = Vec::new();
        for (s, e) in runs {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(e - s + 1);
            blocks.push(self.insert_block(&pool, customer_id, s, s + take - 1, now));
            remaining -= take;
        }
        Ok(blocks)
    }

    pub fn bind_block(&mut self, block_id: &str, instance_id: &str) -> PanelResult<PortBlock> {
        let block = self
            .blocks
            .get_mut(block_id)
            .ok_or_else(|| PanelError::NotFound(format!("port block {}", block_id)))?;
        if !block.is_active() {
            return Err(PanelError::Conflict(format!("port block {} is released", block_id)));
        }
        match block.instance_id.as_deref() {
            Some(existing) if existing != instance_id => {
                return Err(PanelError::Conflict(format!("port block {} is bound to {}", block_id, existing)));
            }
            _ => block.instance_id = Some(instance_id.to_string()),
        }
        Ok(block.clone())
    }

    /// Idempotent: releasing an already released block returns it unchanged.
    pub fn release_block(&mut self, block_id: &str, now: DateTime<Utc>) -> PanelResult<PortBlock> {
        let block = self
            .blocks
            .get_mut(block_id)
            .ok_or_else(|| PanelError::NotFound(format!("port block {}", block_id)))?;
        if block.is_active() {
            block.instance_id = None;
            block.released_at = Some(now);
        }
        Ok(block.clone())
    }

    /// Teardown path: release every block bound to the instance and drop its
    /// single-port allocations.
    pub fn release_instance(&mut self, instance_id: &str, now: DateTime<Utc>) -> ReleaseSummary {
        let mut summary = ReleaseSummary::default();
        for block in self.blocks.values_mut() {
            if block.is_active() && block.instance_id.as_deref() == Some(instance_id) {
                block.instance_id = None;
                block.released_at = Some(now);
                summary.blocks.push(block.id.clone());
                summary.nodes.insert(block.node_id.clone());
            }
        }
        let ids: Vec<String> = self
            .allocations
            .values()
            .filter(|a| a.instance_id == instance_id)
            .map(|a| a.id.clone())
            .collect();
        for id in ids {
            if let Some(a) = self.allocations.remove(&id) {
                summary.nodes.insert(a.node_id.clone());
                summary.allocations.push(a);
            }
        }
        summary
    }

    fn port_taken(&self, node_id: &str, protocol: Protocol, port: u16) -> bool {
        self.allocations
            .values()
            .any(|a| a.node_id == node_id && a.protocol == protocol && a.port == port)
    }

    fn port_in_active_block(&self, node_id: &str, protocol: Protocol, port: u16) -> bool {
        self.blocks.values().any(|b| {
            b.node_id == node_id && (b.start_port..=b.end_port).contains(&port) && self.block_reserves(b, protocol)
        })
    }

    /// Sole insertion path for single-port allocations.
    pub fn insert_allocation(&mut self, allocation: PortAllocation) -> PanelResult<PortAllocation> {
        if self.port_taken(&allocation.node_id, allocation.protocol, allocation.port) {
            return Err(PanelError::PortConflict {
                node_id: allocation.node_id,
                protocol: allocation.protocol.to_string(),
                port: allocation.port,
            });
        }
        self.allocations.insert(allocation.id.clone(), allocation.clone());
        Ok(allocation)
    }

    pub fn allocate_port(&mut self, req: &AllocationRequest, now: DateTime<Utc>) -> PanelResult<PortAllocation> {
        let role_taken = self
            .allocations
            .values()
            .any(|a| a.instance_id == req.instance_id && a.role == req.role && a.protocol == req.protocol);
        if role_taken {
            return Err(PanelError::Conflict(format!(
                "instance {} already has a {} port for role {}",
                req.instance_id, req.protocol, req.role
            )));
        }

        let port = match &req.strategy {
            AllocationStrategy::Explicit { port } => *port,
            AllocationStrategy::Derived { base_role, offset } => {
                let base = self
                    .allocations
                    .values()
                    .filter(|a| a.instance_id == req.instance_id && &a.role == base_role)
                    .min_by_key(|a| if a.protocol == req.protocol { 0 } else { 1 })
                    .ok_or_else(|| {
                        PanelError::NotFound(format!("instance {} has no {} port to derive from", req.instance_id, base_role))
                    })?;
                let derived = i64::from(base.port) + i64::from(*offset);
                u16::try_from(derived)
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| PanelError::InvalidRange(format!("derived port {} is out of range", derived)))?
            }
            AllocationStrategy::FirstFree { range_id } => {
                let range = self
                    .ranges
                    .get(range_id)
                    .ok_or_else(|| PanelError::NotFound(format!("port range {}", range_id)))?;
                if range.node_id != req.node_id || range.protocol != req.protocol {
                    return Err(PanelError::BadRequest(format!(
                        "range {} serves {}/{}, not {}/{}",
                        range_id, range.node_id, range.protocol, req.node_id, req.protocol
                    )));
                }
                if !range.enabled {
                    return Err(PanelError::Conflict(format!("port range {} is disabled", range_id)));
                }
                (range.start_port..=range.end_port)
                    .find(|p| {
                        !self.port_taken(&req.node_id, req.protocol, *p)
                            && !self.port_in_active_block(&req.node_id, req.protocol, *p)
                    })
                    .ok_or_else(|| PanelError::PortsExhausted { pool_id: range_id.clone(), size: 1 })?
            }
        };
        if port == 0 {
            return Err(PanelError::InvalidRange("port 0 is not allocatable".to_string()));
        }

        self.insert_allocation(PortAllocation {
            id: Uuid::new_v4().to_string(),
            node_id: req.node_id.clone(),
            protocol: req.protocol,
            port,
            instance_id: req.instance_id.clone(),
            role: req.role.clone(),
            allocated_at: now,
        })
    }

    /// Ports that must be open on a node: single allocations plus every port
    /// of an active block that is bound to an instance.
    pub fn desired_open_ports(&self, node_id: &str) -> BTreeSet<PortRule> {
        let mut desired: BTreeSet<PortRule> = self
            .allocations
            .values()
            .filter(|a| a.node_id == node_id)
            .map(|a| PortRule::new(a.protocol, a.port))
            .collect();
        for block in self.blocks.values() {
            if !block.is_active() || block.node_id != node_id || block.instance_id.is_none() {
                continue;
            }
            let protocols = self.pools.get(&block.pool_id).map(|p| p.protocols.clone()).unwrap_or_else(default_protocols);
            for port in block.start_port..=block.end_port {
                for proto in &protocols {
                    desired.insert(PortRule::new(*proto, port));
                }
            }
        }
        desired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn tables_with_pool(start: u16, end: u16) -> PortTables {
        let mut t = PortTables::default();
        t.add_pool(PortPool {
            id: "pool-1".into(),
            node_id: "node-1".into(),
            name: "game".into(),
            start_port: start,
            end_port: end,
            protocols: vec![Protocol::Tcp, Protocol::Udp],
            purpose: "game".into(),
            enabled: true,
        })
        .unwrap();
        t
    }

    fn span(b: &PortBlock) -> (u16, u16) {
        (b.start_port, b.end_port)
    }

    #[test]
    fn first_fit_skips_existing_block() {
        let mut t = tables_with_pool(5000, 5010);
        let first = t.allocate_block("pool-1", "cust-a", 5, now()).unwrap();
        assert_eq!(span(&first), (5000, 5004));
        let next = t.allocate_block("pool-1", "cust-b", 3, now()).unwrap();
        assert_eq!(span(&next), (5005, 5007));
    }

    #[test]
    fn released_range_is_reused_first() {
        let mut t = tables_with_pool(5000, 5010);
        let a = t.allocate_block("pool-1", "cust-a", 4, now()).unwrap();
        let _b = t.allocate_block("pool-1", "cust-b", 4, now()).unwrap();
        t.bind_block(&a.id, "inst-1").unwrap();
        let released = t.release_block(&a.id, now()).unwrap();
        assert!(released.instance_id.is_none());
        assert!(released.released_at.is_some());

        let again = t.allocate_block("pool-1", "cust-c", 4, now()).unwrap();
        assert_eq!(span(&again), (5000, 5003));
        // history is kept
        assert_eq!(t.blocks.len(), 3);
    }

    #[test]
    fn pool_exhaustion_is_reported() {
        let mut t = tables_with_pool(5000, 5003);
        t.allocate_block("pool-1", "c", 3, now()).unwrap();
        match t.allocate_block("pool-1", "c", 2, now()) {
            Err(PanelError::PortsExhausted { size: 2, .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn range_allocation_validates_bounds() {
        let mut t = tables_with_pool(5000, 5010);
        assert!(matches!(
            t.allocate_blocks_in_range("pool-1", "c", 5008, 5002, 2, now()),
            Err(PanelError::InvalidRange(_))
        ));
        assert!(matches!(
            t.allocate_blocks_in_range("pool-1", "c", 4990, 5005, 2, now()),
            Err(PanelError::InvalidRange(_))
        ));
    }

    #[test]
    fn range_allocation_splits_across_free_runs() {
        let mut t = tables_with_pool(5000, 5010);
        // occupy 5002..=5003 and 5006..=5010
        t.allocate_blocks_in_range("pool-1", "x", 5002, 5003, 2, now()).unwrap();
        t.allocate_blocks_in_range("pool-1", "x", 5006, 5010, 5, now()).unwrap();

        let blocks = t.allocate_blocks_in_range("pool-1", "c", 5000, 5010, 4, now()).unwrap();
        let spans: Vec<_> = blocks.iter().map(span).collect();
        assert_eq!(spans, vec![(5000, 5001), (5004, 5005)]);

        assert!(matches!(
            t.allocate_blocks_in_range("pool-1", "c", 5000, 5010, 1, now()),
            Err(PanelError::PortsExhausted { .. })
        ));
    }

    #[test]
    fn contiguous_run_preferred_in_range() {
        let mut t = tables_with_pool(5000, 5010);
        t.allocate_blocks_in_range("pool-1", "x", 5002, 5002, 1, now()).unwrap();
        let blocks = t.allocate_blocks_in_range("pool-1", "c", 5000, 5010, 3, now()).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(span(&blocks[0]), (5003, 5005));
    }

    #[test]
    fn bind_rejects_second_instance() {
        let mut t = tables_with_pool(5000, 5010);
        let b = t.allocate_block("pool-1", "c", 2, now()).unwrap();
        t.bind_block(&b.id, "inst-1").unwrap();
        t.bind_block(&b.id, "inst-1").unwrap();
        assert!(matches!(t.bind_block(&b.id, "inst-2"), Err(PanelError::Conflict(_))));
    }

    fn range_tables() -> PortTables {
        let mut t = PortTables::default();
        t.add_range(PortRange {
            id: "r1".into(),
            node_id: "node-1".into(),
            name: "games".into(),
            start_port: 27015,
            end_port: 27020,
            protocol: Protocol::Udp,
            purpose: "game".into(),
            enabled: true,
        })
        .unwrap();
        t
    }

    fn req(instance: &str, role: &str, strategy: AllocationStrategy) -> AllocationRequest {
        AllocationRequest {
            node_id: "node-1".into(),
            protocol: Protocol::Udp,
            instance_id: instance.into(),
            role: role.into(),
            strategy,
        }
    }

    #[test]
    fn derived_port_follows_base_role() {
        let mut t = range_tables();
        let game = t.allocate_port(&req("i1", "game", AllocationStrategy::FirstFree { range_id: "r1".into() }), now()).unwrap();
        assert_eq!(game.port, 27015);
        let query = t
            .allocate_port(&req("i1", "query", AllocationStrategy::Derived { base_role: "game".into(), offset: 1 }), now())
            .unwrap();
        assert_eq!(query.port, 27016);
        // the next first-free skips both
        let other = t.allocate_port(&req("i2", "game", AllocationStrategy::FirstFree { range_id: "r1".into() }), now()).unwrap();
        assert_eq!(other.port, 27017);
    }

    #[test]
    fn derived_collision_is_a_conflict_not_an_overwrite() {
        let mut t = range_tables();
        t.allocate_port(&req("i1", "game", AllocationStrategy::Explicit { port: 27015 }), now()).unwrap();
        t.allocate_port(&req("i2", "game", AllocationStrategy::Explicit { port: 27016 }), now()).unwrap();
        let err = t
            .allocate_port(&req("i1", "query", AllocationStrategy::Derived { base_role: "game".into(), offset: 1 }), now())
            .unwrap_err();
        assert!(matches!(err, PanelError::PortConflict { port: 27016, .. }));
        assert_eq!(t.allocations.values().filter(|a| a.port == 27016).count(), 1);
    }

    #[test]
    fn same_port_on_other_protocol_is_allowed() {
        let mut t = range_tables();
        t.allocate_port(&req("i1", "game", AllocationStrategy::Explicit { port: 27015 }), now()).unwrap();
        let mut tcp = req("i1", "game", AllocationStrategy::Explicit { port: 27015 });
        tcp.protocol = Protocol::Tcp;
        assert!(t.allocate_port(&tcp, now()).is_ok());
    }

    #[test]
    fn release_instance_frees_blocks_and_allocations() {
        let mut t = tables_with_pool(5000, 5010);
        let b = t.allocate_block("pool-1", "c", 2, now()).unwrap();
        t.bind_block(&b.id, "inst-1").unwrap();
        t.insert_allocation(PortAllocation {
            id: "a1".into(),
            node_id: "node-1".into(),
            protocol: Protocol::Tcp,
            port: 8080,
            instance_id: "inst-1".into(),
            role: "web".into(),
            allocated_at: now(),
        })
        .unwrap();
        assert_eq!(t.desired_open_ports("node-1").len(), 5);

        let summary = t.release_instance("inst-1", now());
        assert_eq!(summary.blocks, vec![b.id.clone()]);
        assert_eq!(summary.allocations.len(), 1);
        assert!(summary.nodes.contains("node-1"));
        assert!(t.desired_open_ports("node-1").is_empty());
        assert!(!t.blocks[&b.id].is_active());
    }

    fn add_pool(t: &mut PortTables, id: &str, protocols: Vec<Protocol>) {
        t.add_pool(PortPool {
            id: id.into(),
            node_id: "node-1".into(),
            name: id.into(),
            start_port: 6000,
            end_port: 6009,
            protocols,
            purpose: "game".into(),
            enabled: true,
        })
        .unwrap();
    }

    #[test]
    fn blocks_only_collide_on_a_shared_protocol() {
        let mut t = PortTables::default();
        add_pool(&mut t, "tcp-only", vec![Protocol::Tcp]);
        add_pool(&mut t, "udp-only", vec![Protocol::Udp]);
        add_pool(&mut t, "both", vec![Protocol::Tcp, Protocol::Udp]);

        let tcp = t.allocate_block("tcp-only", "c", 4, now()).unwrap();
        let udp = t.allocate_block("udp-only", "c", 4, now()).unwrap();
        assert_eq!(span(&tcp), (6000, 6003));
        assert_eq!(span(&udp), (6000, 6003));

        let both = t.allocate_block("both", "c", 4, now()).unwrap();
        assert_eq!(span(&both), (6004, 6007));
        // a tcp block now also sees the dual-protocol block
        let tcp2 = t.allocate_block("tcp-only", "c", 2, now()).unwrap();
        assert_eq!(span(&tcp2), (6008, 6009));
        let udp2 = t.allocate_block("udp-only", "c", 2, now()).unwrap();
        assert_eq!(span(&udp2), (6008, 6009));
        assert!(matches!(t.allocate_block("both", "c", 1, now()), Err(PanelError::PortsExhausted { .. })));
    }

    #[test]
    fn single_allocation_only_blocks_pools_on_its_protocol() {
        let mut t = PortTables::default();
        add_pool(&mut t, "tcp-only", vec![Protocol::Tcp]);
        add_pool(&mut t, "udp-only", vec![Protocol::Udp]);
        t.insert_allocation(PortAllocation {
            id: "a1".into(),
            node_id: "node-1".into(),
            protocol: Protocol::Udp,
            port: 6000,
            instance_id: "i1".into(),
            role: "game".into(),
            allocated_at: now(),
        })
        .unwrap();
        assert_eq!(span(&t.allocate_block("tcp-only", "c", 1, now()).unwrap()), (6000, 6000));
        assert_eq!(span(&t.allocate_block("udp-only", "c", 1, now()).unwrap()), (6001, 6001));
    }

    #[test]
    fn port_rule_parsing() {
        assert_eq!("tcp:80".parse::<PortRule>().unwrap(), PortRule::new(Protocol::Tcp, 80));
        assert_eq!("443/udp".parse::<PortRule>().unwrap(), PortRule::new(Protocol::Udp, 443));
        assert!("sctp:80".parse::<PortRule>().is_err());
        assert!("tcp:0".parse::<PortRule>().is_err());
        assert_eq!(PortRule::new(Protocol::Udp, 9987).to_string(), "udp:9987");
    }
}
