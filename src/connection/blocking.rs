//! Blocking TCP connection to a cluster node, used by the sync request
//! engine. Mirrors [`crate::connection::tcp::RedisConnection`]'s
//! handshake and command sequencing, but drives the socket synchronously.

use crate::error::{ClusterError, Result};
use crate::resp::reader::{DefaultFactory, Reader};
use crate::resp::types::RespValue;
use crate::resp::writer::{encode_command, encode_command_str};

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

/// Minimal transport seam so tests can substitute an in-memory stream
/// instead of a real socket.
pub trait BlockingStream: Read + Write {
    fn set_read_timeout(&self, dur: Option<Duration>) -> std::io::Result<()>;
    fn set_write_timeout(&self, dur: Option<Duration>) -> std::io::Result<()>;
}

impl BlockingStream for TcpStream {
    fn set_read_timeout(&self, dur: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_read_timeout(self, dur)
    }
    fn set_write_timeout(&self, dur: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_write_timeout(self, dur)
    }
}

const READ_CHUNK: usize = 16 * 1024;

/// A single blocking connection, owned directly by whichever [`crate::topology::Node`]
/// it serves — not pooled.
pub struct BlockingConnection<S: BlockingStream = TcpStream> {
    stream: S,
    reader: Reader<DefaultFactory>,
    pub last_used: Instant,
}

impl BlockingConnection<TcpStream> {
    pub fn connect(addr: &str, connect_timeout: Duration) -> Result<Self> {
        let socket_addr = addr
            .to_socket_addrs_first()
            .ok_or_else(|| ClusterError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("could not resolve {addr}"),
            )))?;
        let stream = TcpStream::connect_timeout(&socket_addr, connect_timeout)?;
        stream.set_nodelay(true).ok();
        Ok(Self::from_stream(stream))
    }
}

impl<S: BlockingStream> BlockingConnection<S> {
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream,
            reader: Reader::default(),
            last_used: Instant::now(),
        }
    }

    pub fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(read)?;
        self.stream.set_write_timeout(write)?;
        Ok(())
    }

    pub fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data)?;
        self.last_used = Instant::now();
        Ok(())
    }

    pub fn read_response(&mut self) -> Result<RespValue> {
        loop {
            if let Some(value) = self.reader.next_reply()? {
                self.last_used = Instant::now();
                return Ok(value);
            }
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(ClusterError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )));
            }
            self.reader.feed(&chunk[..n]);
        }
    }

    pub fn execute(&mut self, args: &[&[u8]]) -> Result<RespValue> {
        let cmd = encode_command(args);
        self.send_raw(&cmd)?;
        self.read_response()
    }

    pub fn execute_str(&mut self, args: &[&str]) -> Result<RespValue> {
        let cmd = encode_command_str(args);
        self.send_raw(&cmd)?;
        self.read_response()
    }

    pub fn auth(&mut self, username: Option<&str>, password: &str) -> Result<()> {
        let response = match username {
            Some(user) => self.execute_str(&["AUTH", user, password])?,
            None => self.execute_str(&["AUTH", password])?,
        };
        match response {
            RespValue::SimpleString(ref s) if s == "OK" => Ok(()),
            RespValue::Error(msg) => Err(ClusterError::redis(msg)),
            other => Err(ClusterError::Protocol(format!(
                "unexpected AUTH response: {:?}",
                other.type_name()
            ))),
        }
    }

    pub fn ping(&mut self) -> Result<bool> {
        let response = self.execute_str(&["PING"])?;
        Ok(matches!(response, RespValue::SimpleString(ref s) if s == "PONG"))
    }

    pub fn init(&mut self, username: Option<&str>, password: Option<&str>) -> Result<()> {
        if let Some(pass) = password {
            self.auth(username, pass)?;
        }
        Ok(())
    }
}

trait ResolveFirst {
    fn to_socket_addrs_first(&self) -> Option<std::net::SocketAddr>;
}

impl ResolveFirst for str {
    fn to_socket_addrs_first(&self) -> Option<std::net::SocketAddr> {
        use std::net::ToSocketAddrs;
        self.to_socket_addrs().ok()?.next()
    }
}
