//! Incremental RESP2/RESP3 reader.
//!
//! Unlike [`crate::resp::parser`], which parses one complete frame out of an
//! already-buffered `Bytes`, this reader is fed bytes as they arrive off the
//! wire and can be polled for completed replies at any point. Internally it
//! keeps an explicit stack of in-progress container frames (arrays, maps,
//! sets, pushes, attributes) rather than recursing, so a reply nested many
//! levels deep never grows the call stack and a reply that straddles several
//! `feed()` calls resumes exactly where it left off.
//!
//! The stack starts sized for 9 concurrently open frames — enough for any
//! reply shape seen in practice — and grows on demand for pathological
//! inputs.

use crate::error::{ClusterError, Result};
use crate::resp::types::RespValue;
use bytes::{Buf, Bytes, BytesMut};
use memchr::memchr;

const INITIAL_STACK_DEPTH: usize = 9;

/// Hard cap on the number of elements a single container reply may declare,
/// guarding against a hostile or corrupt length prefix forcing an
/// unbounded allocation before any bytes have actually arrived.
const MAX_ELEMENT_COUNT: i64 = 1 << 20;

/// Once this many bytes have been consumed from the front of the buffer
/// without a full compaction, the reader discards them eagerly instead of
/// letting the dead prefix grow unbounded.
const COMPACT_THRESHOLD: usize = 1024;

/// Pluggable reply construction, so tests can observe parse structure
/// directly via a mock factory instead of asserting on [`RespValue`] trees.
pub trait ReplyFactory {
    type Reply;

    fn make_nil(&mut self) -> Self::Reply;
    fn make_bool(&mut self, v: bool) -> Self::Reply;
    fn make_integer(&mut self, v: i64) -> Self::Reply;
    fn make_double(&mut self, v: f64) -> Self::Reply;
    fn make_string(&mut self, kind: StringKind, s: Bytes) -> Self::Reply;
    fn make_array(&mut self, kind: ArrayKind, items: Vec<Self::Reply>) -> Self::Reply;
    fn make_error(&mut self, s: String) -> Self::Reply;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringKind {
    Simple,
    Bulk,
    Verbatim,
    BigNumber,
    BulkError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayKind {
    Array,
    Set,
    Map,
    Push,
    Attribute,
}

/// The default factory: builds plain [`RespValue`] trees.
#[derive(Default)]
pub struct DefaultFactory;

impl ReplyFactory for DefaultFactory {
    type Reply = RespValue;

    fn make_nil(&mut self) -> RespValue {
        RespValue::Null
    }
    fn make_bool(&mut self, v: bool) -> RespValue {
        RespValue::Boolean(v)
    }
    fn make_integer(&mut self, v: i64) -> RespValue {
        RespValue::Integer(v)
    }
    fn make_double(&mut self, v: f64) -> RespValue {
        RespValue::Double(v)
    }
    fn make_string(&mut self, kind: StringKind, s: Bytes) -> RespValue {
        match kind {
            StringKind::Simple => {
                RespValue::SimpleString(String::from_utf8_lossy(&s).into_owned())
            }
            StringKind::Bulk => RespValue::BulkString(s),
            StringKind::Verbatim => {
                let text = String::from_utf8_lossy(&s);
                let (encoding, data) = text.split_once(':').unwrap_or(("txt", &text));
                RespValue::VerbatimString {
                    encoding: encoding.to_string(),
                    data: data.to_string(),
                }
            }
            StringKind::BigNumber => {
                RespValue::BigNumber(String::from_utf8_lossy(&s).into_owned())
            }
            StringKind::BulkError => {
                RespValue::BulkError(String::from_utf8_lossy(&s).into_owned())
            }
        }
    }
    fn make_array(&mut self, kind: ArrayKind, items: Vec<RespValue>) -> RespValue {
        match kind {
            ArrayKind::Array => RespValue::Array(items),
            ArrayKind::Set => RespValue::Set(items),
            ArrayKind::Map => {
                let mut pairs = Vec::with_capacity(items.len() / 2);
                let mut it = items.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    pairs.push((k, v));
                }
                RespValue::Map(pairs)
            }
            ArrayKind::Push => {
                let mut it = items.into_iter();
                let kind = match it.next() {
                    Some(RespValue::SimpleString(s)) => s,
                    Some(RespValue::BulkString(b)) => {
                        String::from_utf8_lossy(&b).into_owned()
                    }
                    Some(other) => other.type_name().to_string(),
                    None => String::new(),
                };
                RespValue::Push {
                    kind,
                    data: it.collect(),
                }
            }
            ArrayKind::Attribute => {
                let mut it = items.into_iter();
                let mut pairs = Vec::new();
                let data = it.next_back().unwrap_or(RespValue::Null);
                let mut it = it.peekable();
                while it.peek().is_some() {
                    let (Some(k), Some(v)) = (it.next(), it.next()) else {
                        break;
                    };
                    pairs.push((k, v));
                }
                RespValue::Attribute {
                    data: Box::new(data),
                    attributes: pairs,
                }
            }
        }
    }
    fn make_error(&mut self, s: String) -> RespValue {
        RespValue::Error(s)
    }
}

/// One in-progress container frame: how it will be assembled once complete,
/// and the items parsed so far.
struct Frame<R> {
    kind: ArrayKind,
    remaining: usize,
    items: Vec<R>,
}

/// Incremental reader over a growable byte buffer.
///
/// `feed()` appends bytes; `next_reply()` attempts to produce one complete
/// top-level reply, returning `Ok(None)` when more data is required. A
/// protocol error is sticky: once hit, every subsequent `next_reply()` call
/// returns the same error until the reader is reset.
pub struct Reader<F: ReplyFactory> {
    buf: BytesMut,
    pos: usize,
    stack: Vec<Frame<F::Reply>>,
    factory: F,
    poisoned: Option<String>,
}

impl Default for Reader<DefaultFactory> {
    fn default() -> Self {
        Self::new(DefaultFactory)
    }
}

impl<F: ReplyFactory> Reader<F> {
    pub fn with_factory(factory: F) -> Self {
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
            pos: 0,
            stack: Vec::with_capacity(INITIAL_STACK_DEPTH),
            factory,
            poisoned: None,
        }
    }

    pub fn new(factory: F) -> Self {
        Self::with_factory(factory)
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempt to produce one complete top-level reply from buffered bytes.
    pub fn next_reply(&mut self) -> Result<Option<F::Reply>> {
        if let Some(msg) = &self.poisoned {
            return Err(ClusterError::Protocol(msg.clone()));
        }
        match self.drive() {
            Ok(v) => {
                self.compact();
                Ok(v)
            }
            Err(ClusterError::Incomplete) => Ok(None),
            Err(e) => {
                self.poisoned = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn compact(&mut self) {
        if self.pos >= COMPACT_THRESHOLD {
            self.buf.advance(self.pos);
            self.pos = 0;
        }
    }

    /// Drain the stack, pushing `value` into the parent frame or returning it
    /// as the completed top-level reply.
    fn resolve(&mut self, mut value: F::Reply) -> Option<F::Reply> {
        loop {
            match self.stack.last_mut() {
                None => return Some(value),
                Some(frame) => {
                    frame.items.push(value);
                    if frame.items.len() < frame.remaining {
                        return None;
                    }
                    let frame = self.stack.pop().unwrap();
                    value = self.factory.make_array(frame.kind, frame.items);
                }
            }
        }
    }

    fn drive(&mut self) -> Result<Option<F::Reply>> {
        loop {
            let remaining = &self.buf[self.pos..];
            if remaining.is_empty() {
                return Err(ClusterError::Incomplete);
            }
            let tag = remaining[0];
            let Some(line_end) = memchr(b'\n', remaining) else {
                return Err(ClusterError::Incomplete);
            };
            if line_end == 0 || remaining[line_end - 1] != b'\r' {
                return Err(ClusterError::Protocol("malformed line terminator".into()));
            }
            let header = &remaining[1..line_end - 1];
            let header_str = std::str::from_utf8(header)
                .map_err(|_| ClusterError::Protocol("non-UTF8 header".into()))?;
            let consumed_header = line_end + 1;

            match tag {
                b'+' => {
                    self.pos += consumed_header;
                    let v = self.factory.make_string(
                        StringKind::Simple,
                        Bytes::copy_from_slice(header_str.as_bytes()),
                    );
                    if let Some(done) = self.resolve(v) {
                        return Ok(Some(done));
                    }
                }
                b'-' => {
                    self.pos += consumed_header;
                    let v = self.factory.make_error(header_str.to_string());
                    if let Some(done) = self.resolve(v) {
                        return Ok(Some(done));
                    }
                }
                b':' => {
                    self.pos += consumed_header;
                    let n = parse_i64(header_str)?;
                    let v = self.factory.make_integer(n);
                    if let Some(done) = self.resolve(v) {
                        return Ok(Some(done));
                    }
                }
                b'_' => {
                    self.pos += consumed_header;
                    let v = self.factory.make_nil();
                    if let Some(done) = self.resolve(v) {
                        return Ok(Some(done));
                    }
                }
                b'#' => {
                    self.pos += consumed_header;
                    let v = match header_str {
                        "t" => self.factory.make_bool(true),
                        "f" => self.factory.make_bool(false),
                        other => {
                            return Err(ClusterError::Protocol(format!(
                                "invalid boolean: {other}"
                            )))
                        }
                    };
                    if let Some(done) = self.resolve(v) {
                        return Ok(Some(done));
                    }
                }
                b',' => {
                    self.pos += consumed_header;
                    let d: f64 = match header_str {
                        "inf" => f64::INFINITY,
                        "-inf" => f64::NEG_INFINITY,
                        "nan" => f64::NAN,
                        s => s
                            .parse()
                            .map_err(|_| ClusterError::Protocol("invalid double".into()))?,
                    };
                    let v = self.factory.make_double(d);
                    if let Some(done) = self.resolve(v) {
                        return Ok(Some(done));
                    }
                }
                b'(' => {
                    self.pos += consumed_header;
                    let v = self.factory.make_string(
                        StringKind::BigNumber,
                        Bytes::copy_from_slice(header_str.as_bytes()),
                    );
                    if let Some(done) = self.resolve(v) {
                        return Ok(Some(done));
                    }
                }
                b'$' | b'!' | b'=' => {
                    let len = parse_i64(header_str)?;
                    if tag == b'$' && len == -1 {
                        self.pos += consumed_header;
                        let v = self.factory.make_nil();
                        if let Some(done) = self.resolve(v) {
                            return Ok(Some(done));
                        }
                        continue;
                    }
                    if len < 0 {
                        return Err(ClusterError::Protocol("negative bulk length".into()));
                    }
                    let len = len as usize;
                    let total = consumed_header + len + 2;
                    if remaining.len() < total {
                        return Err(ClusterError::Incomplete);
                    }
                    if &remaining[consumed_header + len..total] != b"\r\n" {
                        return Err(ClusterError::Protocol(
                            "missing CRLF after bulk payload".into(),
                        ));
                    }
                    let data =
                        Bytes::copy_from_slice(&remaining[consumed_header..consumed_header + len]);
                    self.pos += total;
                    let kind = match tag {
                        b'$' => StringKind::Bulk,
                        b'!' => StringKind::BulkError,
                        _ => StringKind::Verbatim,
                    };
                    let v = self.factory.make_string(kind, data);
                    if let Some(done) = self.resolve(v) {
                        return Ok(Some(done));
                    }
                }
                b'*' | b'%' | b'~' | b'>' | b'|' => {
                    self.pos += consumed_header;
                    if tag == b'*' && header_str == "-1" {
                        let v = self.factory.make_nil();
                        if let Some(done) = self.resolve(v) {
                            return Ok(Some(done));
                        }
                        continue;
                    }
                    let declared = parse_i64(header_str)?;
                    if declared < 0 || declared > MAX_ELEMENT_COUNT {
                        return Err(ClusterError::Protocol(format!(
                            "implausible element count: {declared}"
                        )));
                    }
                    // maps/attributes declare pair counts, not element counts.
                    // Push replies declare a plain element count whose first
                    // element is the push kind string (e.g. "message").
                    let (kind, remaining_items) = match tag {
                        b'*' => (ArrayKind::Array, declared as usize),
                        b'~' => (ArrayKind::Set, declared as usize),
                        b'%' => (ArrayKind::Map, declared as usize * 2),
                        b'|' => (ArrayKind::Attribute, declared as usize * 2 + 1),
                        b'>' => (ArrayKind::Push, declared as usize),
                        _ => unreachable!(),
                    };
                    if remaining_items == 0 {
                        let v = self.factory.make_array(kind, Vec::new());
                        if let Some(done) = self.resolve(v) {
                            return Ok(Some(done));
                        }
                        continue;
                    }
                    if self.stack.len() >= self.stack.capacity() {
                        self.stack.reserve(INITIAL_STACK_DEPTH);
                    }
                    self.stack.push(Frame {
                        kind,
                        remaining: remaining_items,
                        items: Vec::with_capacity(remaining_items.min(64)),
                    });
                }
                other => {
                    return Err(ClusterError::Protocol(format!(
                        "unknown RESP type byte: 0x{other:02x}"
                    )))
                }
            }
        }
    }
}

fn parse_i64(s: &str) -> Result<i64> {
    s.parse::<i64>()
        .map_err(|_| ClusterError::Protocol(format!("invalid integer: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_one(input: &[u8]) -> RespValue {
        let mut r = Reader::default();
        r.feed(input);
        r.next_reply().unwrap().unwrap()
    }

    #[test]
    fn simple_string() {
        assert_eq!(
            read_one(b"+OK\r\n"),
            RespValue::SimpleString("OK".into())
        );
    }

    #[test]
    fn integer() {
        assert_eq!(read_one(b":1000\r\n"), RespValue::Integer(1000));
    }

    #[test]
    fn bulk_string() {
        assert_eq!(
            read_one(b"$5\r\nhello\r\n"),
            RespValue::BulkString(Bytes::from_static(b"hello"))
        );
    }

    #[test]
    fn null_bulk() {
        assert_eq!(read_one(b"$-1\r\n"), RespValue::Null);
    }

    #[test]
    fn null_array() {
        assert_eq!(read_one(b"*-1\r\n"), RespValue::Null);
    }

    #[test]
    fn resp3_null() {
        assert_eq!(read_one(b"_\r\n"), RespValue::Null);
    }

    #[test]
    fn boolean() {
        assert_eq!(read_one(b"#t\r\n"), RespValue::Boolean(true));
        assert_eq!(read_one(b"#f\r\n"), RespValue::Boolean(false));
    }

    #[test]
    fn double() {
        assert_eq!(read_one(b",3.14\r\n"), RespValue::Double(3.14));
    }

    #[test]
    fn nested_array() {
        let v = read_one(b"*2\r\n*1\r\n:1\r\n$3\r\nfoo\r\n");
        assert_eq!(
            v,
            RespValue::Array(vec![
                RespValue::Array(vec![RespValue::Integer(1)]),
                RespValue::BulkString(Bytes::from_static(b"foo")),
            ])
        );
    }

    #[test]
    fn map() {
        let v = read_one(b"%2\r\n+a\r\n:1\r\n+b\r\n:2\r\n");
        assert_eq!(
            v,
            RespValue::Map(vec![
                (RespValue::SimpleString("a".into()), RespValue::Integer(1)),
                (RespValue::SimpleString("b".into()), RespValue::Integer(2)),
            ])
        );
    }

    #[test]
    fn push() {
        let v = read_one(b">2\r\n+message\r\n+hello\r\n");
        match v {
            RespValue::Push { kind, data } => {
                assert_eq!(kind, "message");
                assert_eq!(data, vec![RespValue::SimpleString("hello".into())]);
            }
            other => panic!("expected a push reply, got {other:?}"),
        }
    }

    #[test]
    fn byte_at_a_time() {
        let mut r = Reader::default();
        let wire = b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        for &b in &wire[..wire.len() - 1] {
            r.feed(&[b]);
            assert_eq!(r.next_reply().unwrap(), None);
        }
        r.feed(&wire[wire.len() - 1..]);
        let v = r.next_reply().unwrap().unwrap();
        assert_eq!(
            v,
            RespValue::Array(vec![
                RespValue::BulkString(Bytes::from_static(b"foo")),
                RespValue::BulkString(Bytes::from_static(b"bar")),
            ])
        );
    }

    #[test]
    fn multiple_replies_in_one_feed() {
        let mut r = Reader::default();
        r.feed(b"+OK\r\n:1\r\n");
        assert_eq!(r.next_reply().unwrap(), Some(RespValue::SimpleString("OK".into())));
        assert_eq!(r.next_reply().unwrap(), Some(RespValue::Integer(1)));
        assert_eq!(r.next_reply().unwrap(), None);
    }

    #[test]
    fn error_is_sticky() {
        let mut r = Reader::default();
        r.feed(b"*99999999999\r\n");
        assert!(r.next_reply().is_err());
        assert!(r.next_reply().is_err());
    }

    #[test]
    fn deeply_nested_does_not_overflow_initial_capacity() {
        let mut wire = Vec::new();
        for _ in 0..20 {
            wire.extend_from_slice(b"*1\r\n");
        }
        wire.extend_from_slice(b":1\r\n");
        let v = read_one(&wire);
        let mut depth = 0;
        let mut cur = v;
        loop {
            match cur {
                RespValue::Array(mut items) if items.len() == 1 => {
                    depth += 1;
                    cur = items.remove(0);
                }
                RespValue::Integer(1) => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(depth, 20);
    }

    #[test]
    fn compaction_advances_buffer() {
        let mut r = Reader::default();
        for _ in 0..200 {
            r.feed(b"+x\r\n");
            r.next_reply().unwrap();
        }
        assert!(r.buf.len() < 200 * 5);
    }
}
