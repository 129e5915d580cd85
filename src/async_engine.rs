//! Cooperative async cluster request engine.
//!
//! One [`AsyncCluster`] is driven entirely from the owning tokio runtime;
//! there is no background thread. A throttled slot-map refresh and the
//! subscription bookkeeping both live here rather than spread across a
//! separate event-loop abstraction, following the connection layer's existing
//! `tokio::net::TcpStream` based design.

use crate::config::{ClusterOptions, DiscoveryFormat};
use crate::connection::tcp::RedisConnection;
use crate::crc16::hash_slot;
use crate::error::{ClusterError, RedisErrorKind, Result};
use crate::keys::{extract_key, is_read_only_command};
use crate::resp::types::RespValue;
use crate::resp::writer::encode_command_str;
use crate::topology::Topology;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};

/// Per-channel/pattern subscription callback. Invoked with the published
/// message body; channel name matching is the caller's responsibility for
/// pattern subscriptions.
pub type SubscribeCallback = Arc<dyn Fn(RespValue) + Send + Sync>;

/// Channel/pattern callback bookkeeping for one connection in subscribe mode.
/// A connection is considered done with subscriptions only once both maps are
/// empty and no UNSUBSCRIBE/PUNSUBSCRIBE reply is still outstanding.
#[derive(Default)]
pub struct SubscriptionState {
    channels: HashMap<String, SubscribeCallback>,
    patterns: HashMap<String, SubscribeCallback>,
    pending_unsubscribe: usize,
}

impl SubscriptionState {
    pub fn subscribe(&mut self, channel: impl Into<String>, cb: SubscribeCallback) {
        self.channels.insert(channel.into(), cb);
    }

    pub fn psubscribe(&mut self, pattern: impl Into<String>, cb: SubscribeCallback) {
        self.patterns.insert(pattern.into(), cb);
    }

    pub fn unsubscribe(&mut self, channel: &str) {
        if self.channels.remove(channel).is_some() {
            self.pending_unsubscribe += 1;
        }
    }

    pub fn punsubscribe(&mut self, pattern: &str) {
        if self.patterns.remove(pattern).is_some() {
            self.pending_unsubscribe += 1;
        }
    }

    pub fn ack_unsubscribe(&mut self) {
        self.pending_unsubscribe = self.pending_unsubscribe.saturating_sub(1);
    }

    /// Whether this connection can drop out of subscribe mode.
    pub fn is_done(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty() && self.pending_unsubscribe == 0
    }

    pub fn dispatch(&self, channel: &str, payload: RespValue) -> bool {
        if let Some(cb) = self.channels.get(channel) {
            cb(payload);
            return true;
        }
        for (pattern, cb) in &self.patterns {
            if glob_match(pattern, channel) {
                cb(payload);
                return true;
            }
        }
        false
    }
}

/// Minimal glob matcher for `*`/`?` pattern subscriptions, sufficient for the
/// patterns a pub/sub client is expected to register (no character classes).
fn glob_match(pattern: &str, text: &str) -> bool {
    fn helper(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => helper(&p[1..], t) || (!t.is_empty() && helper(p, &t[1..])),
            (Some(b'?'), Some(_)) => helper(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => helper(&p[1..], &t[1..]),
            _ => false,
        }
    }
    helper(pattern.as_bytes(), text.as_bytes())
}

struct NodeConnection {
    conn: RedisConnection,
}

/// A dedicated connection driving one node's subscribe-mode traffic: a
/// background task owns the socket, writing whatever arrives on `cmd_rx` and
/// classifying every incoming reply as a push (dispatched to a callback) or
/// a subscribe/unsubscribe acknowledgement.
struct PubSubConn {
    subs: Arc<Mutex<SubscriptionState>>,
    cmd_tx: mpsc::UnboundedSender<Vec<u8>>,
}

fn reply_text(value: &RespValue) -> Option<String> {
    value.as_str().map(str::to_string)
}

/// Classify one reply read off a subscribed connection and act on it: a
/// `message`/`pmessage` push is handed to the matching callback, a
/// `(p)unsubscribe` acknowledgement closes out the pending-unsubscribe count.
async fn dispatch_push(subs: &Mutex<SubscriptionState>, value: RespValue) {
    let items = match value {
        RespValue::Push { data, .. } => data,
        RespValue::Array(items) => items,
        _ => return,
    };
    let mut it = items.into_iter();
    let Some(kind) = it.next().and_then(|v| reply_text(&v)) else {
        return;
    };
    match kind.as_str() {
        "message" => {
            let channel = it.next().and_then(|v| reply_text(&v));
            let payload = it.next();
            if let (Some(channel), Some(payload)) = (channel, payload) {
                subs.lock().await.dispatch(&channel, payload);
            }
        }
        "pmessage" => {
            let _pattern = it.next();
            let channel = it.next().and_then(|v| reply_text(&v));
            let payload = it.next();
            if let (Some(channel), Some(payload)) = (channel, payload) {
                subs.lock().await.dispatch(&channel, payload);
            }
        }
        "unsubscribe" | "punsubscribe" => {
            subs.lock().await.ack_unsubscribe();
        }
        _ => {}
    }
}

/// Drives one subscribed connection until the socket errors or every
/// `cmd_tx` sender is dropped (on [`AsyncCluster::reset`]). Writes and reads
/// interleave on the same connection, matching how a real subscribe-mode
/// connection multiplexes SUBSCRIBE acks and published messages.
async fn run_pubsub_loop(
    mut conn: RedisConnection,
    subs: Arc<Mutex<SubscriptionState>>,
    mut cmd_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(bytes) => {
                        if conn.send_raw(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            reply = conn.read_response() => {
                match reply {
                    Ok(value) => dispatch_push(&subs, value).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "subscribed connection closed");
                        break;
                    }
                }
            }
        }
    }
}

/// Async, retrying cluster client. Cheap to clone: all shared state lives
/// behind `Arc`.
#[derive(Clone)]
pub struct AsyncCluster {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AsyncCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCluster").finish_non_exhaustive()
    }
}

struct Inner {
    topology: RwLock<Arc<Topology>>,
    connections: Mutex<HashMap<String, NodeConnection>>,
    pubsub: Mutex<HashMap<String, PubSubConn>>,
    options: ClusterOptions,
    routing_version: AtomicU64,
    /// Millis since epoch of the last successful refresh; used to throttle
    /// concurrent refreshes to at most one per `refresh_throttle` window.
    last_refresh_millis: AtomicI64,
    /// Set for the duration of a slot-map refresh so a second caller's
    /// `maybe_refresh_slotmap` inside the throttle window is a true no-op
    /// rather than a second concurrent refresh racing the first.
    refresh_in_flight: AtomicBool,
}

impl AsyncCluster {
    pub async fn new(options: ClusterOptions) -> Result<Self> {
        if options.initial_nodes.is_empty() {
            return Err(ClusterError::Routing(
                "at least one seed node is required".into(),
            ));
        }
        let cluster = Self {
            inner: Arc::new(Inner {
                topology: RwLock::new(Arc::new(Topology::default())),
                connections: Mutex::new(HashMap::new()),
                pubsub: Mutex::new(HashMap::new()),
                options,
                routing_version: AtomicU64::new(0),
                last_refresh_millis: AtomicI64::new(i64::MIN),
                refresh_in_flight: AtomicBool::new(false),
            }),
        };
        cluster.update_slotmap().await?;
        if let Some(cb) = &cluster.inner.options.event_callback {
            cb.on_ready();
        }
        Ok(cluster)
    }

    pub fn routing_version(&self) -> u64 {
        self.inner.routing_version.load(Ordering::Acquire)
    }

    /// Refresh the slot map unconditionally, ignoring the throttle window.
    /// Used for the initial discovery and for caller-triggered retries after
    /// a MOVED reply.
    pub async fn update_slotmap(&self) -> Result<()> {
        let mut candidates: Vec<String> = {
            let topo = self.inner.topology.read().await;
            if topo.registry.nodes.is_empty() {
                self.inner
                    .options
                    .initial_nodes
                    .iter()
                    .map(|(h, p)| format!("{h}:{p}"))
                    .collect()
            } else {
                topo.registry.nodes.iter().map(|n| n.addr()).collect()
            }
        };
        use rand::seq::SliceRandom;
        candidates.shuffle(&mut rand::thread_rng());

        let mut last_err = None;
        for addr in candidates {
            match self.discover_from(&addr).await {
                Ok(new_topology) => {
                    let diff = {
                        let old = self.inner.topology.read().await;
                        new_topology.diff_addrs(&old)
                    };
                    if !diff.removed.is_empty() {
                        let mut conns = self.inner.connections.lock().await;
                        let mut pubsub = self.inner.pubsub.lock().await;
                        for removed in &diff.removed {
                            conns.remove(removed);
                            pubsub.remove(removed);
                        }
                        tracing::debug!(count = diff.removed.len(), "dropped connections for removed nodes");
                    }
                    *self.inner.topology.write().await = Arc::new(new_topology);
                    let version = self.inner.routing_version.fetch_add(1, Ordering::AcqRel) + 1;
                    self.inner
                        .last_refresh_millis
                        .store(now_millis(), Ordering::Release);
                    tracing::debug!(addr = %addr, version, "slot map refreshed");
                    if let Some(cb) = &self.inner.options.event_callback {
                        cb.on_slotmap_updated(version);
                    }
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

    /// Best-effort background refresh: a no-op if the last refresh happened
    /// inside the configured throttle window, and a no-op if another refresh
    /// is already in flight (at-most-one-in-flight refresh).
    pub async fn maybe_refresh_slotmap(&self) {
        let last = self.inner.last_refresh_millis.load(Ordering::Acquire);
        let throttle_ms = self.inner.options.refresh_throttle.as_millis() as i64;
        if last != i64::MIN && now_millis() - last < throttle_ms {
            return;
        }
        if self
            .inner
            .refresh_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let result = self.update_slotmap().await;
        self.inner.refresh_in_flight.store(false, Ordering::Release);
        if let Err(e) = result {
            tracing::warn!(error = %e, "background slot map refresh failed");
        }
    }

    async fn discover_from(&self, addr: &str) -> Result<Topology> {
        let host = addr.split(':').next().unwrap_or(addr).to_string();
        let mut conn = self.connect_fresh(addr).await?;
        let topo = match self.inner.options.discovery_format {
            DiscoveryFormat::Slots => {
                let resp = conn.execute_str(&["CLUSTER", "SLOTS"]).await?;
                Topology::from_cluster_slots(&resp)?
            }
            DiscoveryFormat::Nodes => {
                let resp = conn.execute_str(&["CLUSTER", "NODES"]).await?;
                let text = resp.as_str().ok_or_else(|| {
                    ClusterError::Topology("CLUSTER NODES: expected bulk string".into())
                })?;
                Topology::from_cluster_nodes(text, &host)?
            }
        };
        self.inner
            .connections
            .lock()
            .await
            .insert(addr.to_string(), NodeConnection { conn });
        Ok(topo)
    }

    async fn connect_fresh(&self, addr: &str) -> Result<RedisConnection> {
        let mut conn =
            RedisConnection::connect_timeout(addr, self.inner.options.connect_timeout).await?;
        conn.init(
            self.inner.options.username.as_deref(),
            self.inner.options.password.as_deref(),
            0,
        )
        .await?;
        Ok(conn)
    }

    async fn ensure_connected(&self, addr: &str) -> Result<()> {
        let mut guard = self.inner.connections.lock().await;
        if !guard.contains_key(addr) {
            drop(guard);
            let conn = self.connect_fresh(addr).await?;
            guard = self.inner.connections.lock().await;
            guard.entry(addr.to_string()).or_insert(NodeConnection { conn });
        }
        Ok(())
    }

    async fn ensure_pubsub_connection(&self, addr: &str) -> Result<()> {
        let mut guard = self.inner.pubsub.lock().await;
        if guard.contains_key(addr) {
            return Ok(());
        }
        drop(guard);
        let conn = self.connect_fresh(addr).await?;
        let subs = Arc::new(Mutex::new(SubscriptionState::default()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_pubsub_loop(conn, subs.clone(), cmd_rx));
        guard = self.inner.pubsub.lock().await;
        guard.entry(addr.to_string()).or_insert(PubSubConn { subs, cmd_tx });
        Ok(())
    }

    async fn send_command(&self, addr: &str, args: &[&str], asking: bool) -> Result<RespValue> {
        self.ensure_connected(addr).await?;
        let mut guard = self.inner.connections.lock().await;
        let node = guard.get_mut(addr).expect("just inserted");
        let attempt = async {
            if asking {
                node.conn.execute_str(&["ASKING"]).await?;
            }
            node.conn.execute_str(args).await
        };
        match tokio::time::timeout(self.inner.options.command_timeout, attempt).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e @ ClusterError::Io(_))) => {
                guard.remove(addr);
                Err(e)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                guard.remove(addr);
                Err(ClusterError::Timeout(format!("command to {addr} timed out")))
            }
        }
    }

    async fn target_addr(&self, args: &[&str]) -> Result<String> {
        let topo = self.inner.topology.read().await;
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

        if read && self.inner.options.use_replicas {
            if let Some(&id) = topo.table.replicas_for(slot).first() {
                if let Some(node) = topo.registry.get(id) {
                    return Ok(node.addr());
                }
            }
        }

        match topo.table.primary_for(slot).and_then(|id| topo.registry.get(id)) {
            Some(node) => Ok(node.addr()),
            None => Err(ClusterError::Routing(format!("no node owns slot {slot}"))),
        }
    }

    /// Execute one command, following MOVED/ASK/TRYAGAIN redirects up to
    /// `max_retry` times.
    pub async fn command(&self, args: &[&str]) -> Result<RespValue> {
        let mut addr = self.target_addr(args).await?;
        let mut asking = false;
        let mut attempts = 0usize;

        loop {
            if attempts > self.inner.options.max_retry {
                return Err(ClusterError::RedirectBudget { attempts });
            }

            let result = self.send_command(&addr, args, asking).await;
            asking = false;

            let reply = match result {
                Ok(r) => r,
                Err(ClusterError::Io(_)) if attempts < self.inner.options.max_retry => {
                    attempts += 1;
                    self.update_slotmap().await?;
                    addr = self.target_addr(args).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let RespValue::Error(ref msg) = reply else {
                return Ok(reply);
            };
            let (kind, _) = RedisErrorKind::from_error_msg(msg);
            match kind {
                RedisErrorKind::Moved { addr: new_addr, .. } => {
                    attempts += 1;
                    self.update_slotmap().await.ok();
                    addr = new_addr;
                }
                RedisErrorKind::Ask { addr: new_addr, .. } => {
                    attempts += 1;
                    addr = new_addr;
                    asking = true;
                }
                RedisErrorKind::TryAgain => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                RedisErrorKind::ClusterDown => return Err(ClusterError::redis(msg.clone())),
                _ => return Ok(reply),
            }
        }
    }

    /// Execute a command against a specific node address, bypassing slot
    /// routing.
    pub async fn command_to_node(&self, addr: &str, args: &[&str]) -> Result<RespValue> {
        self.send_command(addr, args, false).await
    }

    /// Subscribe to a channel on `addr`, pinning this subscription to a
    /// dedicated connection for that node. A background task drains that
    /// connection and invokes `cb` for every published message; the mode
    /// is only exited once every channel/pattern is unsubscribed and every
    /// unsubscribe reply has been observed (see [`SubscriptionState`]).
    pub async fn subscribe(&self, addr: &str, channel: &str, cb: SubscribeCallback) -> Result<()> {
        self.ensure_pubsub_connection(addr).await?;
        let guard = self.inner.pubsub.lock().await;
        let handle = guard.get(addr).expect("just ensured");
        handle.subs.lock().await.subscribe(channel, cb);
        handle
            .cmd_tx
            .send(encode_command_str(&["SUBSCRIBE", channel]))
            .map_err(|_| ClusterError::Routing(format!("subscribed connection to {addr} is gone")))
    }

    /// Unsubscribe from a channel on `addr`. The pending-unsubscribe count
    /// clears only once the server's UNSUBSCRIBE reply is observed by the
    /// background read loop, not synchronously here.
    pub async fn unsubscribe(&self, addr: &str, channel: &str) -> Result<()> {
        let guard = self.inner.pubsub.lock().await;
        let Some(handle) = guard.get(addr) else {
            return Ok(());
        };
        handle.subs.lock().await.unsubscribe(channel);
        handle
            .cmd_tx
            .send(encode_command_str(&["UNSUBSCRIBE", channel]))
            .map_err(|_| ClusterError::Routing(format!("subscribed connection to {addr} is gone")))
    }

    /// Drop all cached connections, including subscribed ones (closing their
    /// command channel stops each background read loop). The next command or
    /// subscribe reconnects lazily. Fires `on_free_context` if an event
    /// callback is registered.
    pub async fn reset(&self) {
        self.inner.connections.lock().await.clear();
        self.inner.pubsub.lock().await.clear();
        if let Some(cb) = &self.inner.options.event_callback {
            cb.on_free_context();
        }
    }
}

fn now_millis() -> i64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(*epoch).as_millis() as i64
}
