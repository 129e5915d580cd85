pub mod blocking;
pub mod tcp;

pub use blocking::{BlockingConnection, BlockingStream};
pub use tcp::RedisConnection;

/// Hook for installing TLS on a connection. The crate ships no concrete TLS
/// stack (that belongs to an external collaborator); this
/// trait is the seam a caller plugs one into, e.g. via `rustls`/`tokio-rustls`
/// under the `tls` feature.
pub trait TlsConnector: Send + Sync {
    fn wrap_hint(&self) -> &str {
        "tls"
    }
}
