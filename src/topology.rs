//! Slot-map parsing, the node registry, and the atomic topology swap.
//!
//! Two wire formats are accepted, mirroring what a real cluster exposes:
//! `CLUSTER SLOTS` (a structured array reply, Format A) and
//! `CLUSTER NODES` (a bulk-string line format, Format B). Both produce
//! the same [`Topology`]: a [`NodeRegistry`] plus a dense slot→node table.

use crate::error::{ClusterError, Result};
use crate::resp::types::RespValue;
use std::collections::HashMap;

pub const SLOT_COUNT: usize = 16384;

/// Index into the *current* [`NodeRegistry`] generation. Never carried across
/// a topology swap — each refresh produces a fresh registry with its own
/// `NodeId` space.
pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unknown,
    Primary,
    Replica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

/// A single cluster member. Connections are owned by whoever is driving the
/// topology (the sync/async engine), not by the node itself — the registry
/// only records addressing and routing metadata.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub role: Role,
    pub slots: Vec<SlotRange>,
    pub replica_of: Option<NodeId>,
    pub failed: bool,
}

impl Node {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn owns_slot(&self, slot: u16) -> bool {
        self.slots.iter().any(|r| slot >= r.start && slot <= r.end)
    }
}

/// Address-indexed collection of nodes for one topology generation.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    pub nodes: Vec<Node>,
    by_addr: HashMap<String, NodeId>,
}

impl NodeRegistry {
    pub fn push(&mut self, node: Node) -> NodeId {
        let id = self.nodes.len();
        self.by_addr.insert(node.addr(), id);
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn find_by_addr(&self, addr: &str) -> Option<NodeId> {
        self.by_addr.get(addr).copied()
    }

    pub fn primaries(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.role == Role::Primary)
    }
}

/// Dense slot → node lookup table. Replicas are listed separately so reads
/// can round-robin across them without walking the registry.
#[derive(Debug, Clone)]
pub struct SlotTable {
    primary: Box<[Option<NodeId>; SLOT_COUNT]>,
    replicas: Box<[Vec<NodeId>; SLOT_COUNT]>,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self {
            primary: Box::new([None; SLOT_COUNT]),
            replicas: Box::new(std::array::from_fn(|_| Vec::new())),
        }
    }
}

impl SlotTable {
    pub fn primary_for(&self, slot: u16) -> Option<NodeId> {
        self.primary[slot as usize]
    }

    pub fn replicas_for(&self, slot: u16) -> &[NodeId] {
        &self.replicas[slot as usize]
    }

    pub fn set_primary(&mut self, slot: u16, id: Option<NodeId>) {
        self.primary[slot as usize] = id;
    }

    /// Fraction of the 16384 slots that have an assigned primary — used by
    /// coverage checks.
    pub fn coverage(&self) -> f64 {
        let covered = self.primary.iter().filter(|s| s.is_some()).count();
        covered as f64 / SLOT_COUNT as f64
    }

    fn claim_range(&mut self, range: SlotRange, id: NodeId) -> Result<()> {
        for slot in range.start..=range.end {
            if let Some(existing) = self.primary[slot as usize] {
                if existing != id {
                    return Err(ClusterError::Topology(format!(
                        "slot {slot} claimed by more than one primary"
                    )));
                }
            }
            self.primary[slot as usize] = Some(id);
        }
        Ok(())
    }
}

/// One complete, internally consistent view of the cluster: who owns what.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub registry: NodeRegistry,
    pub table: SlotTable,
}

impl Topology {
    fn from_registry(registry: NodeRegistry) -> Result<Self> {
        let mut table = SlotTable::default();
        for (id, node) in registry.primaries() {
            for range in &node.slots {
                table.claim_range(*range, id)?;
            }
        }
        for (id, node) in registry.nodes.iter().enumerate() {
            if node.role == Role::Replica {
                if let Some(primary_id) = node.replica_of {
                    if let Some(primary) = registry.get(primary_id) {
                        for range in &primary.slots {
                            for slot in range.start..=range.end {
                                table.replicas[slot as usize].push(id);
                            }
                        }
                    }
                }
            }
        }
        Ok(Self { registry, table })
    }

    /// Parse a `CLUSTER SLOTS` array reply (Format A).
    pub fn from_cluster_slots(resp: &RespValue) -> Result<Self> {
        let slots = match resp {
            RespValue::Array(arr) => arr,
            other => {
                return Err(ClusterError::Topology(format!(
                    "CLUSTER SLOTS: expected array, got {:?}",
                    other.type_name()
                )));
            }
        };

        let mut registry = NodeRegistry::default();
        for entry in slots {
            let items = match entry {
                RespValue::Array(arr) if arr.len() >= 3 => arr,
                _ => continue,
            };
            let start = items[0]
                .as_int()
                .ok_or_else(|| ClusterError::Topology("invalid slot start".into()))?
                as u16;
            let end = items[1]
                .as_int()
                .ok_or_else(|| ClusterError::Topology("invalid slot end".into()))?
                as u16;
            let range = SlotRange { start, end };

            let (host, port, node_id) = parse_slots_node_entry(&items[2])?;
            let addr = format!("{host}:{port}");
            let primary_id = match registry.find_by_addr(&addr) {
                Some(id) => {
                    registry.nodes[id].slots.push(range);
                    id
                }
                None => registry.push(Node {
                    id: node_id,
                    host,
                    port,
                    role: Role::Primary,
                    slots: vec![range],
                    replica_of: None,
                    failed: false,
                }),
            };

            for replica_entry in items.iter().skip(3) {
                let (rhost, rport, rid) = match parse_slots_node_entry(replica_entry) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let raddr = format!("{rhost}:{rport}");
                if registry.find_by_addr(&raddr).is_some() {
                    continue;
                }
                registry.push(Node {
                    id: rid,
                    host: rhost,
                    port: rport,
                    role: Role::Replica,
                    slots: Vec::new(),
                    replica_of: Some(primary_id),
                    failed: false,
                });
            }
        }

        Topology::from_registry(registry)
    }

    /// Parse a `CLUSTER NODES` bulk-string reply (Format B).
    pub fn from_cluster_nodes(text: &str, fallback_host: &str) -> Result<Self> {
        let mut registry = NodeRegistry::default();
        // First pass: create every non-noaddr node, addr → registry id.
        let mut addr_to_id: HashMap<String, NodeId> = HashMap::new();
        let mut pending: Vec<NodeLine> = Vec::new();

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed = match parse_node_line(line, fallback_host) {
                Some(p) => p,
                None => continue, // noaddr, skipped per spec
            };
            let id = registry.push(Node {
                id: parsed.node_id.clone(),
                host: parsed.host.clone(),
                port: parsed.port,
                role: if parsed.is_replica {
                    Role::Replica
                } else {
                    Role::Primary
                },
                slots: Vec::new(),
                replica_of: None,
                failed: parsed.failed,
            });
            addr_to_id.insert(parsed.node_id.clone(), id);
            pending.push(parsed);
        }

        // Second pass: wire up replica_of and slot ranges now that every
        // node id is known.
        for parsed in &pending {
            let id = addr_to_id[&parsed.node_id];
            if parsed.is_replica {
                if let Some(&primary_id) = parsed
                    .replica_of_id
                    .as_ref()
                    .and_then(|pid| addr_to_id.get(pid))
                {
                    registry.nodes[id].replica_of = Some(primary_id);
                }
            } else {
                for range in &parsed.slots {
                    registry.nodes[id].slots.push(*range);
                }
            }
        }

        Topology::from_registry(registry)
    }

    /// Build a brand-new topology, steal live connection handles from `old`
    /// for every address that still exists, and return the swap-ready pair.
    /// The actual handle transfer is the caller's responsibility (the engine
    /// owns connections, not the topology) — this only tells the caller
    /// which addresses are carried forward versus newly introduced or gone.
    pub fn diff_addrs(&self, old: &Topology) -> TopologyDiff {
        let new_addrs: std::collections::HashSet<String> =
            self.registry.nodes.iter().map(Node::addr).collect();
        let old_addrs: std::collections::HashSet<String> =
            old.registry.nodes.iter().map(Node::addr).collect();
        TopologyDiff {
            carried: new_addrs.intersection(&old_addrs).cloned().collect(),
            added: new_addrs.difference(&old_addrs).cloned().collect(),
            removed: old_addrs.difference(&new_addrs).cloned().collect(),
        }
    }
}

pub struct TopologyDiff {
    pub carried: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

fn parse_slots_node_entry(val: &RespValue) -> Result<(String, u16, String)> {
    let items = match val {
        RespValue::Array(arr) if arr.len() >= 2 => arr,
        _ => return Err(ClusterError::Topology("expected node array".into())),
    };
    let host = items[0]
        .as_str()
        .ok_or_else(|| ClusterError::Topology("invalid host".into()))?
        .to_string();
    let port = items[1]
        .as_int()
        .ok_or_else(|| ClusterError::Topology("invalid port".into()))? as u16;
    let node_id = items
        .get(2)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Ok((host, port, node_id))
}

struct NodeLine {
    node_id: String,
    host: String,
    port: u16,
    is_replica: bool,
    replica_of_id: Option<String>,
    failed: bool,
    slots: Vec<SlotRange>,
}

/// Parse one `CLUSTER NODES` line. Returns `None` for `noaddr` entries,
/// which carry no usable address and are skipped entirely.
fn parse_node_line(line: &str, fallback_host: &str) -> Option<NodeLine> {
    let mut fields = line.split(' ');
    let node_id = fields.next()?.to_string();
    let ip_port = fields.next()?;
    let flags = fields.next()?;
    let master_id = fields.next()?;
    let _ping_sent = fields.next()?;
    let _pong_recv = fields.next()?;
    let _config_epoch = fields.next()?;
    let _link_state = fields.next()?;
    let rest: Vec<&str> = fields.collect();

    if flags.split(',').any(|f| f == "noaddr") {
        return None;
    }

    let is_replica = flags.split(',').any(|f| f == "slave" || f == "replica");
    let failed = flags
        .split(',')
        .any(|f| f == "fail" || f == "fail?" || f == "handshake");

    // ip:port[@cport][,hostname]  — legacy lines omit @cport entirely.
    let addr_part = ip_port.split(',').next().unwrap_or(ip_port);
    let host_port = addr_part.split('@').next().unwrap_or(addr_part);
    let (mut host, port_str) = host_port.rsplit_once(':')?;
    if host.is_empty() {
        host = fallback_host;
    }
    let port: u16 = port_str.parse().ok()?;

    let replica_of_id = if is_replica && master_id != "-" {
        Some(master_id.to_string())
    } else {
        None
    };

    let mut slots = Vec::new();
    if !is_replica && !failed {
        for tok in rest {
            if tok.starts_with('[') {
                continue; // migrating/importing slot marker, not an assignment
            }
            match tok.split_once('-') {
                Some((a, b)) => {
                    if let (Ok(a), Ok(b)) = (a.parse::<u16>(), b.parse::<u16>()) {
                        slots.push(SlotRange { start: a, end: b });
                    }
                }
                None => {
                    if let Ok(s) = tok.parse::<u16>() {
                        slots.push(SlotRange { start: s, end: s });
                    }
                }
            }
        }
    }

    Some(NodeLine {
        node_id,
        host: host.to_string(),
        port,
        is_replica,
        replica_of_id,
        failed,
        slots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_slots_basic() {
        let resp = RespValue::Array(vec![RespValue::Array(vec![
            RespValue::Integer(0),
            RespValue::Integer(5460),
            RespValue::Array(vec![
                RespValue::SimpleString("127.0.0.1".into()),
                RespValue::Integer(7000),
                RespValue::SimpleString("abc".into()),
            ]),
            RespValue::Array(vec![
                RespValue::SimpleString("127.0.0.1".into()),
                RespValue::Integer(7003),
                RespValue::SimpleString("def".into()),
            ]),
        ])]);

        let topo = Topology::from_cluster_slots(&resp).unwrap();
        let id = topo.table.primary_for(0).unwrap();
        assert_eq!(topo.registry.get(id).unwrap().addr(), "127.0.0.1:7000");
        assert_eq!(topo.table.primary_for(5460), Some(id));
        assert_eq!(topo.table.primary_for(5461), None);
        assert_eq!(topo.table.replicas_for(0).len(), 1);
    }

    #[test]
    fn cluster_slots_conflicting_claim_errors() {
        let resp = RespValue::Array(vec![
            RespValue::Array(vec![
                RespValue::Integer(0),
                RespValue::Integer(100),
                RespValue::Array(vec![
                    RespValue::SimpleString("a".into()),
                    RespValue::Integer(7000),
                ]),
            ]),
            RespValue::Array(vec![
                RespValue::Integer(50),
                RespValue::Integer(150),
                RespValue::Array(vec![
                    RespValue::SimpleString("b".into()),
                    RespValue::Integer(7001),
                ]),
            ]),
        ]);
        assert!(Topology::from_cluster_slots(&resp).is_err());
    }

    const NODES_TEXT: &str = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383
";

    #[test]
    fn cluster_nodes_basic() {
        let topo = Topology::from_cluster_nodes(NODES_TEXT, "127.0.0.1").unwrap();
        assert_eq!(topo.table.coverage(), 1.0);
        let id0 = topo.table.primary_for(0).unwrap();
        assert_eq!(topo.registry.get(id0).unwrap().port, 30001);
        let replica_id = topo.table.replicas_for(10923)[0];
        assert_eq!(topo.registry.get(replica_id).unwrap().port, 30004);
    }

    #[test]
    fn cluster_nodes_myself_prefix_stripped() {
        let topo = Topology::from_cluster_nodes(NODES_TEXT, "10.0.0.1").unwrap();
        assert!(topo
            .registry
            .nodes
            .iter()
            .any(|n| n.role == Role::Primary && n.port == 30001));
    }

    #[test]
    fn cluster_nodes_noaddr_skipped() {
        let text = "abc :0@0 master,noaddr - 0 0 1 connected\n\
                     def 127.0.0.1:7000@17000 master - 0 0 2 connected 0-16383";
        let topo = Topology::from_cluster_nodes(text, "127.0.0.1").unwrap();
        assert_eq!(topo.registry.nodes.len(), 1);
    }

    #[test]
    fn cluster_nodes_fail_primary_keeps_no_slots() {
        let text = "\
abc 127.0.0.1:7000@17000 master,fail - 0 0 1 connected 0-8191\n\
def 127.0.0.1:7001@17001 master - 0 0 2 connected 8192-16383";
        let topo = Topology::from_cluster_nodes(text, "127.0.0.1").unwrap();
        assert_eq!(topo.table.primary_for(0), None);
        assert_eq!(
            topo.registry.get(topo.table.primary_for(8192).unwrap()).unwrap().port,
            7001
        );
    }

    #[test]
    fn cluster_nodes_legacy_no_cport() {
        let text = "def 127.0.0.1:7000 master - 0 0 2 connected 0-16383";
        let topo = Topology::from_cluster_nodes(text, "127.0.0.1").unwrap();
        assert_eq!(topo.table.coverage(), 1.0);
    }

    #[test]
    fn cluster_nodes_migrating_marker_ignored() {
        let text = "def 127.0.0.1:7000@17000 master - 0 0 2 connected 0-100 [200->-abcd]";
        let topo = Topology::from_cluster_nodes(text, "127.0.0.1").unwrap();
        let id = topo.table.primary_for(0).unwrap();
        assert_eq!(topo.table.primary_for(200), None);
        assert_eq!(topo.registry.get(id).unwrap().port, 7000);
    }

    #[test]
    fn node_owns_slot() {
        let n = Node {
            id: "x".into(),
            host: "h".into(),
            port: 1,
            role: Role::Primary,
            slots: vec![SlotRange { start: 10, end: 20 }],
            replica_of: None,
            failed: false,
        };
        assert!(n.owns_slot(15));
        assert!(!n.owns_slot(25));
    }
}
