//! Node iterator with the one-restart-then-terminate safety guarantee: if the
//! topology is swapped out from under an in-flight iteration, the iterator
//! restarts once against the new generation and then gives up rather than
//! looping forever chasing a moving target.

use crate::topology::{Node, NodeId, Topology};
use std::sync::Arc;

/// Iterates every node address in a [`Topology`] snapshot. Safe to hold
/// across a slot-map refresh: if the routing version it was built against
/// changes mid-iteration, the next `next()` call restarts from the new
/// topology's first node exactly once before terminating.
pub struct NodeIter {
    topology: Arc<Topology>,
    routing_version_at_start: u64,
    current_routing_version: u64,
    index: usize,
    restarted: bool,
}

impl NodeIter {
    pub fn new(topology: Arc<Topology>, routing_version: u64) -> Self {
        Self {
            topology,
            routing_version_at_start: routing_version,
            current_routing_version: routing_version,
            index: 0,
            restarted: false,
        }
    }

    /// Called by the owning engine when the topology has been swapped; the
    /// next `next()` restarts iteration once against `new_topology`.
    pub fn notify_swap(&mut self, new_topology: Arc<Topology>, new_version: u64) {
        if new_version == self.current_routing_version {
            return;
        }
        self.topology = new_topology;
        self.current_routing_version = new_version;
        if !self.restarted {
            self.index = 0;
            self.restarted = true;
        } else {
            // Already restarted once: force termination on the next call.
            self.index = self.topology.registry.nodes.len();
        }
    }

    fn node_at(&self, idx: usize) -> Option<(NodeId, &Node)> {
        self.topology.registry.nodes.get(idx).map(|n| (idx, n))
    }
}

impl Iterator for NodeIter {
    type Item = (NodeId, String);

    fn next(&mut self) -> Option<Self::Item> {
        let (id, addr) = self.node_at(self.index).map(|(id, node)| (id, node.addr()))?;
        self.index += 1;
        Some((id, addr))
    }
}

impl NodeIter {
    pub fn started_at_version(&self) -> u64 {
        self.routing_version_at_start
    }

    pub fn has_restarted(&self) -> bool {
        self.restarted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{NodeRegistry, Role, SlotRange};

    fn topology_with(addrs: &[&str]) -> Arc<Topology> {
        let mut registry = NodeRegistry::default();
        for (i, addr) in addrs.iter().enumerate() {
            let (host, port) = addr.split_once(':').unwrap();
            registry.push(crate::topology::Node {
                id: format!("n{i}"),
                host: host.to_string(),
                port: port.parse().unwrap(),
                role: Role::Primary,
                slots: vec![SlotRange {
                    start: 0,
                    end: 100,
                }],
                replica_of: None,
                failed: false,
            });
        }
        Arc::new(Topology {
            registry,
            table: Default::default(),
        })
    }

    #[test]
    fn iterates_all_nodes() {
        let topo = topology_with(&["a:1", "b:2", "c:3"]);
        let iter = NodeIter::new(topo, 1);
        let addrs: Vec<String> = iter.map(|(_, addr)| addr).collect();
        assert_eq!(addrs, vec!["a:1", "b:2", "c:3"]);
    }

    #[test]
    fn restarts_once_on_swap_then_terminates() {
        let topo_a = topology_with(&["a:1", "b:2"]);
        let mut iter = NodeIter::new(topo_a, 1);
        assert_eq!(iter.next().unwrap().1, "a:1");

        let topo_b = topology_with(&["x:9", "y:8"]);
        iter.notify_swap(topo_b.clone(), 2);
        assert!(iter.has_restarted());
        assert_eq!(iter.next().unwrap().1, "x:9");

        // A second swap must not restart again.
        let topo_c = topology_with(&["z:7"]);
        iter.notify_swap(topo_c, 3);
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn swap_to_same_version_is_a_noop() {
        let topo = topology_with(&["a:1"]);
        let mut iter = NodeIter::new(topo.clone(), 1);
        iter.notify_swap(topo, 1);
        assert!(!iter.has_restarted());
    }
}
