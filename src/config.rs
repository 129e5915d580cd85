//! Cluster connection options.
//!
//! Parses `redis+cluster://` URLs, narrowed to the options a cluster router
//! actually needs.

use crate::error::{ClusterError, Result};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 6379;

/// Whether `CLUSTER SLOTS` or `CLUSTER NODES` is used for topology
/// discovery. Both are supported; this only picks the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryFormat {
    Slots,
    Nodes,
}

/// Fired when the topology changes, becomes ready, or the context is torn
/// down. Implementors decide what to do with the event; the default
/// is to do nothing.
pub trait EventCallback: Send + Sync {
    fn on_slotmap_updated(&self, _version: u64) {}
    fn on_ready(&self) {}
    fn on_free_context(&self) {}
}

/// Full cluster router configuration.
#[derive(Clone)]
pub struct ClusterOptions {
    /// Seed nodes used for the first slot-map discovery.
    pub initial_nodes: Vec<(String, u16)>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    /// `CLUSTER SLOTS` vs `CLUSTER NODES` for discovery.
    pub discovery_format: DiscoveryFormat,
    /// Route read-only commands to replicas when available.
    pub use_replicas: bool,
    /// Per-connection connect timeout.
    pub connect_timeout: Duration,
    /// Per-command timeout (sync engine: socket read timeout; async engine:
    /// wall-clock deadline on the pending callback).
    pub command_timeout: Duration,
    /// Maximum number of MOVED/ASK/TRYAGAIN redirects a single command may
    /// follow before giving up.
    pub max_retry: usize,
    /// If true, `new()`/connect blocks until the first slot-map refresh
    /// completes; otherwise it returns immediately and commands issued
    /// before the first refresh land on `Routing` errors.
    pub blocking_initial_update: bool,
    /// Minimum interval between background slot-map refreshes.
    pub refresh_throttle: Duration,
    /// Maximum read buffer size per connection.
    pub max_buffer_size: usize,
    pub event_callback: Option<Arc<dyn EventCallback>>,
}

impl std::fmt::Debug for ClusterOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterOptions")
            .field("initial_nodes", &self.initial_nodes)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("use_tls", &self.use_tls)
            .field("discovery_format", &self.discovery_format)
            .field("use_replicas", &self.use_replicas)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("max_retry", &self.max_retry)
            .field("blocking_initial_update", &self.blocking_initial_update)
            .field("refresh_throttle", &self.refresh_throttle)
            .field("max_buffer_size", &self.max_buffer_size)
            .finish()
    }
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            initial_nodes: Vec::new(),
            username: None,
            password: None,
            use_tls: false,
            discovery_format: DiscoveryFormat::Slots,
            use_replicas: false,
            connect_timeout: Duration::from_millis(5_000),
            command_timeout: Duration::from_millis(30_000),
            max_retry: 5,
            blocking_initial_update: true,
            refresh_throttle: Duration::from_secs(1),
            max_buffer_size: 512 * 1024 * 1024,
            event_callback: None,
        }
    }
}

impl ClusterOptions {
    /// Parse `redis+cluster://[user:pass@]host1[:port][,host2[:port]…][?query]`.
    pub fn from_url(url: &str) -> Result<Self> {
        let mut opts = Self::default();

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| ClusterError::Topology(format!("invalid URL, missing ://: {url}")))?;

        opts.use_tls = match scheme {
            "redis+cluster" => false,
            "rediss+cluster" => true,
            other => {
                return Err(ClusterError::Topology(format!(
                    "unsupported scheme for a cluster URL: {other}"
                )))
            }
        };

        let hosts_str = if let Some((userinfo, hp)) = rest.rsplit_once('@') {
            parse_userinfo(&mut opts, userinfo);
            hp
        } else {
            rest
        };

        let mut nodes = Vec::new();
        for addr in hosts_str.split(',') {
            let addr = addr.trim();
            if addr.is_empty() {
                continue;
            }
            nodes.push(parse_host_port(addr)?);
        }
        if nodes.is_empty() {
            return Err(ClusterError::Topology(
                "cluster URL must include at least one node".into(),
            ));
        }
        opts.initial_nodes = nodes;
        Ok(opts)
    }

    pub fn with_max_retry(mut self, max_retry: usize) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_use_replicas(mut self, use_replicas: bool) -> Self {
        self.use_replicas = use_replicas;
        self
    }

    pub fn with_event_callback(mut self, cb: Arc<dyn EventCallback>) -> Self {
        self.event_callback = Some(cb);
        self
    }
}

fn parse_userinfo(opts: &mut ClusterOptions, userinfo: &str) {
    match userinfo.split_once(':') {
        Some((user, pass)) => {
            if !user.is_empty() {
                opts.username = Some(user.to_string());
            }
            if !pass.is_empty() {
                opts.password = Some(pass.to_string());
            }
        }
        None => {
            if !userinfo.is_empty() {
                opts.password = Some(userinfo.to_string());
            }
        }
    }
}

fn parse_host_port(s: &str) -> Result<(String, u16)> {
    if let Some(stripped) = s.strip_prefix('[') {
        let close = stripped
            .find(']')
            .ok_or_else(|| ClusterError::Topology(format!("unclosed IPv6 bracket: {s}")))?;
        let host = stripped[..close].to_string();
        let after = &stripped[close + 1..];
        let port = match after.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| ClusterError::Topology(format!("invalid port: {p}")))?,
            None => DEFAULT_PORT,
        };
        return Ok((host, port));
    }
    match s.rsplit_once(':') {
        Some((h, p)) => match p.parse::<u16>() {
            Ok(port) => Ok((h.to_string(), port)),
            Err(_) if h.contains(':') => Ok((s.to_string(), DEFAULT_PORT)),
            Err(_) => Err(ClusterError::Topology(format!("invalid port: {p}"))),
        },
        None => Ok((s.to_string(), DEFAULT_PORT)),
    }
}
