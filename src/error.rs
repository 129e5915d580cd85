//! Error taxonomy for the cluster router.

use std::fmt;
use std::io;

/// Structured Redis error kinds for programmatic matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisErrorKind {
    /// Generic ERR
    Err,
    /// WRONGTYPE Operation against a key holding the wrong kind of value
    WrongType,
    /// MOVED slot host:port  (cluster)
    Moved { slot: u16, addr: String },
    /// ASK slot host:port  (cluster)
    Ask { slot: u16, addr: String },
    /// CLUSTERDOWN
    ClusterDown,
    /// LOADING Redis is loading the dataset in memory
    Loading,
    /// READONLY You can't write against a read only replica
    ReadOnly,
    /// NOSCRIPT No matching script
    NoScript,
    /// BUSY Redis is busy running a script
    Busy,
    /// TRYAGAIN
    TryAgain,
    /// Any other Redis error prefix
    Other(String),
}

impl RedisErrorKind {
    /// Parse from a Redis error message string (e.g. "WRONGTYPE Operation against…").
    pub fn from_error_msg(msg: &str) -> (Self, String) {
        if let Some(rest) = msg.strip_prefix("MOVED ") {
            if let Some((slot_str, addr)) = rest.split_once(' ') {
                if let Ok(slot) = slot_str.parse::<u16>() {
                    return (
                        Self::Moved {
                            slot,
                            addr: addr.to_string(),
                        },
                        msg.to_string(),
                    );
                }
            }
            return (Self::Other("MOVED".to_string()), msg.to_string());
        }
        if let Some(rest) = msg.strip_prefix("ASK ") {
            if let Some((slot_str, addr)) = rest.split_once(' ') {
                if let Ok(slot) = slot_str.parse::<u16>() {
                    return (
                        Self::Ask {
                            slot,
                            addr: addr.to_string(),
                        },
                        msg.to_string(),
                    );
                }
            }
            return (Self::Other("ASK".to_string()), msg.to_string());
        }

        let kind = if msg.starts_with("WRONGTYPE") {
            Self::WrongType
        } else if msg.starts_with("CLUSTERDOWN") {
            Self::ClusterDown
        } else if msg.starts_with("LOADING") {
            Self::Loading
        } else if msg.starts_with("READONLY") {
            Self::ReadOnly
        } else if msg.starts_with("NOSCRIPT") {
            Self::NoScript
        } else if msg.starts_with("BUSY") {
            Self::Busy
        } else if msg.starts_with("TRYAGAIN") {
            Self::TryAgain
        } else if msg.starts_with("ERR") {
            Self::Err
        } else {
            let prefix = msg.split_whitespace().next().unwrap_or("UNKNOWN");
            Self::Other(prefix.to_string())
        };
        (kind, msg.to_string())
    }

    /// Whether this kind should trigger a full slot-map refresh before retrying.
    pub fn forces_refresh(&self) -> bool {
        matches!(self, Self::Moved { .. })
    }
}

/// Maximum length kept for the last-error string mirrored on the cluster
/// context, matching the bounded error buffer of the originating C client.
pub const MAX_ERROR_LEN: usize = 128;

/// Truncate `s` to at most `MAX_ERROR_LEN` bytes on a char boundary.
pub fn truncate_error(s: &str) -> String {
    if s.len() <= MAX_ERROR_LEN {
        return s.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// All error variants produced by the cluster router.
#[derive(Debug)]
pub enum ClusterError {
    /// TCP / IO level errors.
    Io(io::Error),
    /// RESP protocol parse errors (bad type byte, malformed length, oversized
    /// reply, multi-bulk element cap exceeded, ...).
    Protocol(String),
    /// RESP parser needs more data — not a real error, used as control flow.
    Incomplete,
    /// Redis returned an error string with a structured kind.
    Redis { kind: RedisErrorKind, message: String },
    /// No node could be found for a command (empty slot table, unroutable key).
    Routing(String),
    /// The redirect/retry budget for a single command was exhausted.
    RedirectBudget { attempts: usize },
    /// A command or connection attempt exceeded its configured timeout.
    Timeout(String),
    /// Topology discovery or parsing failed (CLUSTER SLOTS / CLUSTER NODES).
    Topology(String),
    /// TLS handshake or configuration failure.
    Tls(String),
}

impl ClusterError {
    /// Build a `Redis` error from a raw error-reply message, auto-classifying it.
    pub fn redis(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        let (kind, message) = RedisErrorKind::from_error_msg(&msg);
        Self::Redis { kind, message }
    }

    pub fn is_moved(&self) -> bool {
        matches!(
            self,
            Self::Redis {
                kind: RedisErrorKind::Moved { .. },
                ..
            }
        )
    }

    pub fn is_ask(&self) -> bool {
        matches!(
            self,
            Self::Redis {
                kind: RedisErrorKind::Ask { .. },
                ..
            }
        )
    }

    pub fn moved_info(&self) -> Option<(u16, &str)> {
        match self {
            Self::Redis {
                kind: RedisErrorKind::Moved { slot, addr },
                ..
            } => Some((*slot, addr)),
            _ => None,
        }
    }

    pub fn ask_info(&self) -> Option<(u16, &str)> {
        match self {
            Self::Redis {
                kind: RedisErrorKind::Ask { slot, addr },
                ..
            } => Some((*slot, addr)),
            _ => None,
        }
    }

    /// The last-error string mirrored on the cluster context, capped at
    /// `MAX_ERROR_LEN` bytes.
    pub fn as_fixed_message(&self) -> String {
        truncate_error(&self.to_string())
    }
}

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "connection error: {e}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Incomplete => write!(f, "incomplete RESP message"),
            Self::Redis { message, .. } => write!(f, "redis error: {message}"),
            Self::Routing(msg) => write!(f, "routing error: {msg}"),
            Self::RedirectBudget { attempts } => {
                write!(f, "too many cluster retries ({attempts} attempts)")
            }
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Topology(msg) => write!(f, "topology error: {msg}"),
            Self::Tls(msg) => write!(f, "tls error: {msg}"),
        }
    }
}

impl std::error::Error for ClusterError {}

impl From<io::Error> for ClusterError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

// ── Tests ──────────────────────────────────────────────────────────
