//! Cluster-aware routing core for a sharded key-value store client.
//!
//! This crate owns the parts of a cluster client that do not depend on any
//! particular transport or embedding language: slot hashing, RESP2/RESP3
//! wire parsing, slot-map discovery and the atomic topology swap, the
//! sync/async request engines with MOVED/ASK/TRYAGAIN redirect handling, and
//! node iteration. Callers provide a [`config::ClusterOptions`] and drive
//! either [`sync_engine::SyncCluster`] or [`async_engine::AsyncCluster`].

pub mod async_engine;
pub mod config;
pub mod connection;
pub mod crc16;
pub mod error;
pub mod iter;
pub mod keys;
pub mod resp;
pub mod runtime;
pub mod sync_engine;
pub mod topology;

pub use async_engine::AsyncCluster;
pub use config::{ClusterOptions, DiscoveryFormat, EventCallback};
pub use error::{ClusterError, RedisErrorKind, Result};
pub use sync_engine::SyncCluster;
pub use topology::{Node, NodeId, Role, Topology};
