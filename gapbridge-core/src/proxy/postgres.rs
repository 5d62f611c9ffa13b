//! PostgreSQL wire protocol (v3) proxy
//!
//! Frontend messages are reassembled from the byte stream so that every
//! simple query (`Q`) and extended-protocol parse (`P`) can be checked by
//! the SQL policy before it leaves side A. Rejected statements are answered
//! locally with an `ErrorResponse`, the backend never sees them. TLS and
//! GSS encryption requests are declined so the stream stays inspectable.

use bytes::BytesMut;
use tracing::debug;

use super::{push_forward, CodecContext, Directive, ProtocolCodec, ScanWindow};
use crate::audit::AuditAction;
use crate::error::{Error, Result};
use crate::frame::ProtocolTag;
use crate::inspect::Verdict;

pub const PROTOCOL_V3: u32 = 196_608;
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;
pub const SSL_REQUEST_CODE: u32 = 80_877_103;
pub const GSSENC_REQUEST_CODE: u32 = 80_877_104;

const MIN_STARTUP_LEN: usize = 8;
const MAX_STARTUP_LEN: usize = 10_000;
const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

/// SQLSTATE for a statement refused by policy
pub const SQLSTATE_INSUFFICIENT_PRIVILEGE: &str = "42501";
/// SQLSTATE when the backend cannot be reached
pub const SQLSTATE_CONNECTION_FAILURE: &str = "08006";
const SQLSTATE_PROTOCOL_VIOLATION: &str = "08P01";

/// One complete protocol message, raw bytes included
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgMessage {
    /// Untyped startup-phase packet
    Startup { code: u32, bytes: Vec<u8> },
    /// Type byte, length, body
    Regular { kind: u8, bytes: Vec<u8> },
}

impl PgMessage {
    pub fn bytes(&self) -> &[u8] {
        match self {
            PgMessage::Startup { bytes, .. } | PgMessage::Regular { bytes, .. } => bytes,
        }
    }
}

/// Reassembles protocol messages from arbitrarily split input.
#[derive(Debug)]
pub struct PgMessageBuffer {
    buf: BytesMut,
    startup: bool,
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

impl PgMessageBuffer {
    /// Client-to-server stream, starting with the untyped startup packet
    pub fn frontend() -> Self {
        Self {
            buf: BytesMut::new(),
            startup: true,
        }
    }

    /// Server-to-client stream
    pub fn backend() -> Self {
        Self {
            buf: BytesMut::new(),
            startup: false,
        }
    }

    pub fn in_startup(&self) -> bool {
        self.startup
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append `data` and return every message it completes.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<PgMessage>> {
        self.buf.extend_from_slice(data);
        let mut messages = Vec::new();

        loop {
            if self.startup {
                if self.buf.len() < MIN_STARTUP_LEN {
                    break;
                }
                let len = be_u32(&self.buf[0..4]) as usize;
                if !(MIN_STARTUP_LEN..=MAX_STARTUP_LEN).contains(&len) {
                    self.buf.clear();
                    return Err(Error::Malformed(format!("startup packet length {}", len)));
                }
                if self.buf.len() < len {
                    break;
                }
                let code = be_u32(&self.buf[4..8]);
                let bytes = self.buf.split_to(len).to_vec();
                // SSL/GSS/cancel requests keep the stream in startup framing.
                if code >> 16 == 3 {
                    self.startup = false;
                }
                messages.push(PgMessage::Startup { code, bytes });
            } else {
                if self.buf.len() < 5 {
                    break;
                }
                let len = be_u32(&self.buf[1..5]) as usize;
                let kind = self.buf[0];
                if !(4..=MAX_MESSAGE_LEN).contains(&len) {
                    self.buf.clear();
                    return Err(Error::Malformed(format!(
                        "message {:?} length {}",
                        char::from(kind),
                        len
                    )));
                }
                let total = len + 1;
                if self.buf.len() < total {
                    break;
                }
                let bytes = self.buf.split_to(total).to_vec();
                messages.push(PgMessage::Regular { kind, bytes });
            }
        }
        Ok(messages)
    }
}

/// Build an `ErrorResponse` message.
pub fn error_response(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
        body.push(field);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);

    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(b'E');
    out.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Transaction status byte of an idle session
pub const TRANSACTION_IDLE: u8 = b'I';

/// `ReadyForQuery` in idle state
pub fn ready_for_query() -> Vec<u8> {
    ready_for_query_in(TRANSACTION_IDLE)
}

/// `ReadyForQuery` reporting `status` (`I`, `T` or `E`)
pub fn ready_for_query_in(status: u8) -> Vec<u8> {
    vec![b'Z', 0, 0, 0, 5, status]
}

/// SQL text of a `Q` or `P` message
pub fn query_text(kind: u8, message: &[u8]) -> Result<&str> {
    let body = message.get(5..).unwrap_or_default();
    let raw = match kind {
        b'Q' => body.split(|b| *b == 0).next().unwrap_or_default(),
        // Parse: statement name, then query, both NUL-terminated
        b'P' => body
            .split(|b| *b == 0)
            .nth(1)
            .ok_or_else(|| Error::Malformed("parse message without query".to_string()))?,
        other => return Err(Error::Protocol(format!("message {:?} carries no SQL", char::from(other)))),
    };
    std::str::from_utf8(raw).map_err(|_| Error::Malformed("query is not valid UTF-8".to_string()))
}

/// PostgreSQL session codec
#[derive(Debug)]
pub struct PostgresCodec {
    requests: PgMessageBuffer,
    responses: PgMessageBuffer,
    response_window: ScanWindow,
    /// Extended protocol: a rejected Parse voids everything up to Sync
    skip_until_sync: bool,
    /// Status from the backend's last `ReadyForQuery`
    transaction: u8,
}

impl Default for PostgresCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PostgresCodec {
    pub fn new() -> Self {
        Self {
            requests: PgMessageBuffer::frontend(),
            responses: PgMessageBuffer::backend(),
            response_window: ScanWindow::new("postgres-response"),
            skip_until_sync: false,
            transaction: TRANSACTION_IDLE,
        }
    }

    /// Transaction status last reported by the backend
    pub fn transaction_status(&self) -> u8 {
        self.transaction
    }

    fn on_query(&mut self, cx: &CodecContext<'_>, kind: u8, bytes: &[u8], out: &mut Vec<Directive>) {
        let verdict = match query_text(kind, bytes) {
            Ok(sql) => cx.inspector.check_sql(sql),
            Err(e) => Verdict::Malformed(e.to_string()),
        };
        match verdict {
            Verdict::Accepted => push_forward(out, ProtocolTag::PostgresQuery, bytes),
            Verdict::Rejected(reason) | Verdict::Malformed(reason) => {
                cx.rejected(AuditAction::QueryRejected, &reason);
                out.push(Directive::Reply(error_response(
                    "ERROR",
                    SQLSTATE_INSUFFICIENT_PRIVILEGE,
                    &format!("Query rejected by security policy: {}", reason),
                )));
                if kind == b'Q' {
                    out.push(Directive::Reply(ready_for_query_in(self.transaction)));
                } else {
                    self.skip_until_sync = true;
                }
            }
        }
    }
}

impl ProtocolCodec for PostgresCodec {
    fn on_request(&mut self, cx: &CodecContext<'_>, bytes: &[u8]) -> Vec<Directive> {
        let messages = match self.requests.push(bytes) {
            Ok(messages) => messages,
            Err(e) => return vec![Directive::Drop(e.to_string())],
        };

        let mut out = Vec::new();
        for message in messages {
            match message {
                PgMessage::Startup { code, bytes } => match code {
                    SSL_REQUEST_CODE | GSSENC_REQUEST_CODE => {
                        debug!(session = %cx.session.short(), code, "encryption request declined");
                        out.push(Directive::Reply(b"N".to_vec()));
                    }
                    CANCEL_REQUEST_CODE => push_forward(&mut out, ProtocolTag::PostgresStartup, &bytes),
                    code if code >> 16 == 3 => push_forward(&mut out, ProtocolTag::PostgresStartup, &bytes),
                    other => {
                        out.push(Directive::Reply(error_response(
                            "FATAL",
                            SQLSTATE_PROTOCOL_VIOLATION,
                            &format!("unsupported frontend protocol {}", other),
                        )));
                        out.push(Directive::Drop(format!("unsupported startup code {}", other)));
                        return out;
                    }
                },
                PgMessage::Regular { kind, bytes } => {
                    if self.skip_until_sync {
                        // The backend answers the Sync with its own
                        // ReadyForQuery.
                        if kind == b'S' {
                            self.skip_until_sync = false;
                            push_forward(&mut out, ProtocolTag::PostgresData, &bytes);
                        }
                        continue;
                    }
                    match kind {
                        b'Q' | b'P' => self.on_query(cx, kind, &bytes, &mut out),
                        _ => push_forward(&mut out, ProtocolTag::PostgresData, &bytes),
                    }
                }
            }
        }
        out
    }

    fn on_response(&mut self, cx: &CodecContext<'_>, bytes: &[u8]) -> Vec<Directive> {
        let messages = match self.responses.push(bytes) {
            Ok(messages) => messages,
            Err(e) => return vec![Directive::Drop(e.to_string())],
        };

        let mut out = Vec::new();
        for message in messages {
            if let PgMessage::Regular { kind: b'Z', bytes } = &message {
                if let Some(&status) = bytes.get(5) {
                    self.transaction = status;
                }
            }
            match self.response_window.check(cx.inspector, message.bytes()) {
                Verdict::Accepted => push_forward(&mut out, ProtocolTag::PostgresResponse, message.bytes()),
                Verdict::Rejected(reason) | Verdict::Malformed(reason) => {
                    cx.threat(&reason);
                    out.push(Directive::Drop(reason));
                    return out;
                }
            }
        }
        out
    }

    fn reply_tag(&self) -> ProtocolTag {
        ProtocolTag::PostgresResponse
    }

    fn backend_unavailable(&self) -> Option<Vec<u8>> {
        Some(error_response(
            "FATAL",
            SQLSTATE_CONNECTION_FAILURE,
            "backend database server unavailable",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ProtocolFamily;
    use crate::proxy::testing::{forwarded, Harness};

    fn startup() -> Vec<u8> {
        let mut body = PROTOCOL_V3.to_be_bytes().to_vec();
        body.extend_from_slice(b"user\0alice\0database\0app\0\0");
        let mut out = ((body.len() + 4) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(&body);
        out
    }

    fn message(kind: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![kind];
        out.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn query(sql: &str) -> Vec<u8> {
        message(b'Q', format!("{}\0", sql).as_bytes())
    }

    fn parse(sql: &str) -> Vec<u8> {
        message(b'P', format!("stmt\0{}\0\0\0", sql).as_bytes())
    }

    fn ssl_request() -> Vec<u8> {
        let mut out = 8u32.to_be_bytes().to_vec();
        out.extend_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
        out
    }

    fn stream() -> Vec<u8> {
        let mut all = ssl_request();
        all.extend(startup());
        all.extend(query("SELECT 1"));
        all.extend(parse("SELECT * FROM users WHERE id = $1"));
        all.extend(message(b'S', b""));
        all
    }

    #[test]
    fn test_buffer_independent_of_split_points() {
        let whole = PgMessageBuffer::frontend().push(&stream()).unwrap();
        assert_eq!(whole.len(), 5);

        let data = stream();
        for split in 1..data.len() {
            let mut buffer = PgMessageBuffer::frontend();
            let mut messages = buffer.push(&data[..split]).unwrap();
            messages.extend(buffer.push(&data[split..]).unwrap());
            assert_eq!(messages, whole, "split at {}", split);
            assert_eq!(buffer.buffered(), 0);
        }

        let mut buffer = PgMessageBuffer::frontend();
        let mut messages = Vec::new();
        for byte in &data {
            messages.extend(buffer.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(messages, whole);
    }

    #[test]
    fn test_startup_switches_framing() {
        let mut buffer = PgMessageBuffer::frontend();
        let messages = buffer.push(&ssl_request()).unwrap();
        assert!(matches!(messages[0], PgMessage::Startup { code: SSL_REQUEST_CODE, .. }));
        assert!(buffer.in_startup());

        buffer.push(&startup()).unwrap();
        assert!(!buffer.in_startup());
    }

    #[test]
    fn test_bad_lengths_rejected() {
        let mut buffer = PgMessageBuffer::frontend();
        assert!(buffer.push(&[0, 0, 0, 4, 0, 0, 0, 0]).is_err());

        let mut buffer = PgMessageBuffer::backend();
        assert!(buffer.push(&[b'Q', 0, 0, 0, 2]).is_err());
        assert!(buffer.push(&[b'Q', 0x7f, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_query_text() {
        assert_eq!(query_text(b'Q', &query("SELECT 1")).unwrap(), "SELECT 1");
        assert_eq!(query_text(b'P', &parse("SELECT $1")).unwrap(), "SELECT $1");
        assert!(query_text(b'Q', &message(b'Q', b"\xff\xfe\0")).is_err());
    }

    #[test]
    fn test_ssl_declined_and_startup_forwarded() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Postgres);
        let mut codec = PostgresCodec::new();

        assert_eq!(codec.on_request(&cx, &ssl_request()), vec![Directive::Reply(b"N".to_vec())]);
        assert_eq!(
            codec.on_request(&cx, &startup()),
            vec![Directive::Forward {
                tag: ProtocolTag::PostgresStartup,
                bytes: startup()
            }]
        );
    }

    #[test]
    fn test_dangerous_query_answered_locally() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Postgres);
        let mut codec = PostgresCodec::new();
        codec.on_request(&cx, &startup());

        let out = codec.on_request(&cx, &query("DROP TABLE users"));
        assert!(forwarded(&out).is_empty());
        assert_eq!(out.len(), 2);
        let Directive::Reply(error) = &out[0] else {
            panic!("expected an error reply, got {:?}", out[0]);
        };
        assert_eq!(error[0], b'E');
        assert!(error.windows(5).any(|w| w == SQLSTATE_INSUFFICIENT_PRIVILEGE.as_bytes()));
        assert_eq!(out[1], Directive::Reply(ready_for_query()));
        assert_eq!(harness.stats.snapshot().policy_rejections, 1);
    }

    #[test]
    fn test_rejected_parse_skips_to_sync() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Postgres);
        let mut codec = PostgresCodec::new();
        codec.on_request(&cx, &startup());

        let mut batch = parse("SELECT * FROM pg_shadow");
        batch.extend(message(b'B', b"\0stmt\0\0\0\0\0\0\0"));
        batch.extend(message(b'E', b"\0\0\0\0\0"));
        batch.extend(message(b'S', b""));
        batch.extend(query("SELECT 1"));

        let out = codec.on_request(&cx, &batch);
        assert_eq!(out.len(), 3);
        assert!(matches!(&out[0], Directive::Reply(e) if e[0] == b'E'));
        assert_eq!(
            out[1],
            Directive::Forward {
                tag: ProtocolTag::PostgresData,
                bytes: message(b'S', b"")
            }
        );
        let mut expected = message(b'S', b"");
        expected.extend(query("SELECT 1"));
        assert_eq!(forwarded(&out), expected);
    }

    #[test]
    fn test_local_ready_reports_backend_transaction_status() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Postgres);
        let mut codec = PostgresCodec::new();
        codec.on_request(&cx, &startup());

        codec.on_response(&cx, &ready_for_query_in(b'T'));
        assert_eq!(codec.transaction_status(), b'T');

        let out = codec.on_request(&cx, &query("DROP TABLE users"));
        assert_eq!(out[1], Directive::Reply(ready_for_query_in(b'T')));

        codec.on_response(&cx, &ready_for_query());
        let out = codec.on_request(&cx, &query("DROP TABLE users"));
        assert_eq!(out[1], Directive::Reply(ready_for_query()));
    }

    #[test]
    fn test_benign_traffic_tagged() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Postgres);
        let mut codec = PostgresCodec::new();
        codec.on_request(&cx, &startup());

        let mut batch = query("SELECT name FROM users WHERE id = 1");
        batch.extend(message(b'X', b""));
        let out = codec.on_request(&cx, &batch);
        assert_eq!(
            out,
            vec![
                Directive::Forward {
                    tag: ProtocolTag::PostgresQuery,
                    bytes: query("SELECT name FROM users WHERE id = 1")
                },
                Directive::Forward {
                    tag: ProtocolTag::PostgresData,
                    bytes: message(b'X', b"")
                },
            ]
        );
    }

    #[test]
    fn test_responses_reassembled() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Postgres);
        let mut codec = PostgresCodec::new();

        let reply = ready_for_query();
        assert!(codec.on_response(&cx, &reply[..3]).is_empty());
        assert_eq!(
            codec.on_response(&cx, &reply[3..]),
            vec![Directive::Forward {
                tag: ProtocolTag::PostgresResponse,
                bytes: reply
            }]
        );
    }

    #[test]
    fn test_error_response_layout() {
        let bytes = error_response("FATAL", SQLSTATE_CONNECTION_FAILURE, "down");
        let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        assert_eq!(len + 1, bytes.len());
        assert_eq!(bytes.last(), Some(&0));
        let parsed = PgMessageBuffer::backend().push(&bytes).unwrap();
        assert!(matches!(parsed[0], PgMessage::Regular { kind: b'E', .. }));
    }
}
