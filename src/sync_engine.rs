//! Blocking cluster request engine.
//!
//! One [`SyncCluster`] is meant to be used from a single thread at a time
//! (clone the `Arc` and build another engine per thread rather than sharing
//! one across threads that block concurrently).

use crate::config::{ClusterOptions, DiscoveryFormat};
use crate::connection::blocking::BlockingConnection;
use crate::crc16::hash_slot;
use crate::error::{ClusterError, RedisErrorKind, Result};
use crate::keys::{extract_key, is_read_only_command};
use crate::resp::types::RespValue;
use crate::topology::Topology;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Blocking, retrying cluster client.
pub struct SyncCluster {
    topology: RwLock<Arc<Topology>>,
    connections: Mutex<HashMap<String, BlockingConnection>>,
    options: ClusterOptions,
    routing_version: AtomicU64,
}

impl std::fmt::Debug for SyncCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCluster").finish_non_exhaustive()
    }
}

impl SyncCluster {
    /// Connect to the first reachable seed node and perform the initial
    /// slot-map discovery.
    pub fn new(options: ClusterOptions) -> Result<Self> {
        if options.initial_nodes.is_empty() {
            return Err(ClusterError::Routing(
                "at least one seed node is required".into(),
            ));
        }
        let engine = Self {
            topology: RwLock::new(Arc::new(Topology::default())),
            connections: Mutex::new(HashMap::new()),
            options,
            routing_version: AtomicU64::new(0),
        };
        engine.update_slotmap()?;
        Ok(engine)
    }

    pub fn routing_version(&self) -> u64 {
        self.routing_version.load(Ordering::Acquire)
    }

    /// Re-run topology discovery against any known (or seed) node and
    /// install the result, bumping the routing version.
    pub fn update_slotmap(&self) -> Result<()> {
        let mut candidates: Vec<String> = {
            let topo = self.topology.read();
            if topo.registry.nodes.is_empty() {
                self.options
                    .initial_nodes
                    .iter()
                    .map(|(h, p)| format!("{h}:{p}"))
                    .collect()
            } else {
                topo.registry.nodes.iter().map(|n| n.addr()).collect()
            }
        };
        // Randomize scan order so a consistently-first-but-dead seed doesn't
        // dominate every refresh attempt.
        use rand::seq::SliceRandom;
        candidates.shuffle(&mut rand::thread_rng());

        let mut last_err = None;
        for addr in candidates {
            match self.discover_from(&addr) {
                Ok(new_topology) => {
                    let diff = {
                        let old = self.topology.read();
                        new_topology.diff_addrs(&old)
                    };
                    if !diff.removed.is_empty() {
                        let mut conns = self.connections.lock();
                        for removed in &diff.removed {
                            conns.remove(removed);
                        }
                        tracing::debug!(count = diff.removed.len(), "dropped connections for removed nodes");
                    }
                    *self.topology.write() = Arc::new(new_topology);
                    self.routing_version.fetch_add(1, Ordering::AcqRel);
                    tracing::debug!(addr = %addr, "slot map refreshed");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "slot discovery failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| ClusterError::Routing("no reachable seed node".into())))
    }

    fn discover_from(&self, addr: &str) -> Result<Topology> {
        let host = addr.split(':').next().unwrap_or(addr).to_string();
        let mut conn = self.connect_fresh(addr)?;
        let topo = match self.options.discovery_format {
            DiscoveryFormat::Slots => {
                let resp = conn.execute_str(&["CLUSTER", "SLOTS"])?;
                Topology::from_cluster_slots(&resp)?
            }
            DiscoveryFormat::Nodes => {
                let resp = conn.execute_str(&["CLUSTER", "NODES"])?;
                let text = resp.as_str().ok_or_else(|| {
                    ClusterError::Topology("CLUSTER NODES: expected bulk string".into())
                })?;
                Topology::from_cluster_nodes(text, &host)?
            }
        };
        self.connections.lock().insert(addr.to_string(), conn);
        Ok(topo)
    }

    fn connect_fresh(&self, addr: &str) -> Result<BlockingConnection> {
        let mut conn = BlockingConnection::connect(addr, self.options.connect_timeout)?;
        conn.set_timeouts(Some(self.options.command_timeout), Some(self.options.command_timeout))?;
        conn.init(self.options.username.as_deref(), self.options.password.as_deref())?;
        Ok(conn)
    }

    fn with_connection<T>(
        &self,
        addr: &str,
        f: impl FnOnce(&mut BlockingConnection) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.connections.lock();
        if !guard.contains_key(addr) {
            drop(guard);
            let conn = self.connect_fresh(addr)?;
            guard = self.connections.lock();
            guard.insert(addr.to_string(), conn);
        }
        let conn = guard.get_mut(addr).expect("just inserted");
        match f(conn) {
            Ok(v) => Ok(v),
            Err(e @ ClusterError::Io(_)) => {
                guard.remove(addr);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn target_addr(&self, args: &[&str]) -> Result<String> {
        let topo = self.topology.read();
        let slot = extract_key(args).map(|k| hash_slot(k.as_bytes()));
        let read = !args.is_empty() && is_read_only_command(args[0]);

        let Some(slot) = slot else {
            return topo
                .registry
                .primaries()
                .next()
                .map(|(_, n)| n.addr())
                .ok_or_else(|| ClusterError::Routing("no primary available".into()));
        };

        if read && self.options.use_replicas {
            let replicas = topo.table.replicas_for(slot);
            if let Some(&id) = replicas.first() {
                if let Some(node) = topo.registry.get(id) {
                    return Ok(node.addr());
                }
            }
        }

        let primary_id = topo.table.primary_for(slot);
        match primary_id.and_then(|id| topo.registry.get(id)) {
            Some(node) => Ok(node.addr()),
            None => Err(ClusterError::Routing(format!("no node owns slot {slot}"))),
        }
    }

    /// Execute one command, following MOVED/ASK/TRYAGAIN redirects up to
    /// `max_retry` times.
    pub fn command(&self, args: &[&str]) -> Result<RespValue> {
        let mut addr = self.target_addr(args)?;
        let mut asking = false;
        let mut attempts = 0usize;

        loop {
            if attempts > self.options.max_retry {
                return Err(ClusterError::RedirectBudget { attempts });
            }

            let result = self.with_connection(&addr, |conn| {
                if asking {
                    conn.execute_str(&["ASKING"])?;
                }
                conn.execute_str(args)
            });
            asking = false;

            let reply = match result {
                Ok(r) => r,
                Err(ClusterError::Io(_)) if attempts < self.options.max_retry => {
                    attempts += 1;
                    self.update_slotmap()?;
                    addr = self.target_addr(args)?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let RespValue::Error(ref msg) = reply else {
                return Ok(reply);
            };
            let (kind, _) = RedisErrorKind::from_error_msg(msg);
            match kind {
                RedisErrorKind::Moved { slot, addr: new_addr } => {
                    attempts += 1;
                    self.update_slotmap().ok();
                    let _ = slot;
                    addr = new_addr;
                }
                RedisErrorKind::Ask { addr: new_addr, .. } => {
                    attempts += 1;
                    addr = new_addr;
                    asking = true;
                }
                RedisErrorKind::TryAgain => {
                    attempts += 1;
                    std::thread::sleep(Duration::from_millis(50));
                }
                RedisErrorKind::ClusterDown => {
                    return Err(ClusterError::redis(msg.clone()));
                }
                _ => return Ok(reply),
            }
        }
    }

    /// Execute a command against a specific node address, bypassing slot
    /// routing entirely (used for administrative commands like `CLUSTER
    /// NODES` or `INFO` issued against a known node).
    pub fn command_to_node(&self, addr: &str, args: &[&str]) -> Result<RespValue> {
        self.with_connection(addr, |conn| conn.execute_str(args))
    }

    /// Close every open connection, dropping all cached state. The next
    /// command reconnects lazily.
    pub fn reset(&self) {
        self.connections.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn slots_reply_for(addr: &str) -> Vec<u8> {
        let (host, port) = addr.split_once(':').unwrap();
        format!(
            "*1\r\n*3\r\n:0\r\n:16383\r\n*2\r\n${}\r\n{}\r\n:{}\r\n",
            host.len(),
            host,
            port
        )
        .into_bytes()
    }

    /// A single-node "cluster" that owns every slot: answers `CLUSTER SLOTS`
    /// once, then replies `command_reply` to whatever comes next.
    fn single_node_cluster(command_reply: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let slots = slots_reply_for(&addr);
        std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).unwrap(); // CLUSTER SLOTS
            sock.write_all(&slots).unwrap();
            let _ = sock.read(&mut buf).unwrap(); // the actual command
            sock.write_all(&command_reply).unwrap();
        });
        addr
    }

    fn nodes_reply_for(addr: &str) -> Vec<u8> {
        let line = format!(
            "abc {addr}@{}0 myself,master - 0 0 1 connected 0-16383",
            addr.rsplit_once(':').unwrap().1
        );
        format!("${}\r\n{}\r\n", line.len(), line).into_bytes()
    }

    /// A single-node "cluster" that answers `CLUSTER NODES` once, then
    /// replies `command_reply` to whatever comes next.
    fn single_node_cluster_via_nodes(command_reply: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let nodes = nodes_reply_for(&addr);
        std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4096];
            let _ = sock.read(&mut buf).unwrap(); // CLUSTER NODES
            sock.write_all(&nodes).unwrap();
            let _ = sock.read(&mut buf).unwrap(); // the actual command
            sock.write_all(&command_reply).unwrap();
        });
        addr
    }

    fn options_for(addr: &str) -> ClusterOptions {
        let (host, port) = addr.split_once(':').unwrap();
        ClusterOptions {
            initial_nodes: vec![(host.to_string(), port.parse().unwrap())],
            ..ClusterOptions::default()
        }
    }

    #[test]
    fn single_node_basic_command() {
        let addr = single_node_cluster(b"$5\r\nhello\r\n".to_vec());
        let cluster = SyncCluster::new(options_for(&addr)).unwrap();
        let reply = cluster.command(&["GET", "foo"]).unwrap();
        assert_eq!(reply, RespValue::BulkString(Bytes::from_static(b"hello")));
    }

    #[test]
    fn keyless_command_routes_to_a_primary() {
        let addr = single_node_cluster(b"+PONG\r\n".to_vec());
        let cluster = SyncCluster::new(options_for(&addr)).unwrap();
        let reply = cluster.command(&["PING"]).unwrap();
        assert_eq!(reply, RespValue::SimpleString("PONG".into()));
    }

    #[test]
    fn discovers_via_cluster_nodes_when_configured() {
        let addr = single_node_cluster_via_nodes(b"$5\r\nhello\r\n".to_vec());
        let options = ClusterOptions {
            discovery_format: DiscoveryFormat::Nodes,
            ..options_for(&addr)
        };
        let cluster = SyncCluster::new(options).unwrap();
        let reply = cluster.command(&["GET", "foo"]).unwrap();
        assert_eq!(reply, RespValue::BulkString(Bytes::from_static(b"hello")));
    }

    #[test]
    fn new_fails_with_no_seed_nodes() {
        let err = SyncCluster::new(ClusterOptions::default()).unwrap_err();
        assert!(matches!(err, ClusterError::Routing(_)));
    }

    #[test]
    fn reset_drops_cached_connections() {
        let addr = single_node_cluster(b"+PONG\r\n".to_vec());
        let cluster = SyncCluster::new(options_for(&addr)).unwrap();
        cluster.command(&["PING"]).unwrap();
        assert!(!cluster.connections.lock().is_empty());
        cluster.reset();
        assert!(cluster.connections.lock().is_empty());
    }
}
