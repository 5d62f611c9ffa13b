//! SFTP (SSH transport) relay
//!
//! SSH is encrypted end to end, so beyond the identification exchange the
//! stream is opaque. Identification lines travel as `SftpControl`, the
//! binary packet stream as `SftpData`, scanned for known signatures.

use tracing::{debug, warn};

use super::{push_forward, CodecContext, Directive, ProtocolCodec, ScanWindow};
use crate::frame::ProtocolTag;
use crate::inspect::Verdict;

/// RFC 4253 limit for the identification line, CRLF included
pub const MAX_IDENT_LINE: usize = 255;

#[derive(Debug)]
struct Direction {
    ident: Option<String>,
    pending: Vec<u8>,
    window: ScanWindow,
}

impl Direction {
    fn new(label: &'static str) -> Self {
        Self {
            ident: None,
            pending: Vec::new(),
            window: ScanWindow::new(label),
        }
    }

    fn process(&mut self, cx: &CodecContext<'_>, bytes: &[u8]) -> Vec<Directive> {
        let mut out = Vec::new();
        let mut data = bytes;
        let rest;

        if self.ident.is_none() {
            self.pending.extend_from_slice(bytes);
            loop {
                let Some(pos) = self.pending.iter().position(|b| *b == b'\n') else {
                    if self.pending.len() > MAX_IDENT_LINE {
                        warn!(session = %cx.session.short(), "SSH identification line too long");
                        return vec![Directive::Drop("oversized SSH identification line".to_string())];
                    }
                    return out;
                };
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                if line.len() > MAX_IDENT_LINE {
                    warn!(session = %cx.session.short(), "SSH identification line too long");
                    return vec![Directive::Drop("oversized SSH identification line".to_string())];
                }
                push_forward(&mut out, ProtocolTag::SftpControl, &line);
                if line.starts_with(b"SSH-") {
                    let ident = String::from_utf8_lossy(&line).trim_end().to_string();
                    debug!(session = %cx.session.short(), ident = %ident, "SSH identification");
                    self.ident = Some(ident);
                    break;
                }
            }
            rest = std::mem::take(&mut self.pending);
            data = &rest;
        }

        if data.is_empty() {
            return out;
        }
        match self.window.check(cx.inspector, data) {
            Verdict::Accepted => push_forward(&mut out, ProtocolTag::SftpData, data),
            Verdict::Rejected(reason) | Verdict::Malformed(reason) => {
                cx.threat(&reason);
                out.push(Directive::Drop(reason));
            }
        }
        out
    }
}

/// SSH stream codec
#[derive(Debug)]
pub struct SftpCodec {
    client: Direction,
    server: Direction,
}

impl Default for SftpCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SftpCodec {
    pub fn new() -> Self {
        Self {
            client: Direction::new("sftp-client"),
            server: Direction::new("sftp-server"),
        }
    }

    /// Identification strings seen so far, client then server
    pub fn identities(&self) -> (Option<&str>, Option<&str>) {
        (self.client.ident.as_deref(), self.server.ident.as_deref())
    }
}

impl ProtocolCodec for SftpCodec {
    fn on_request(&mut self, cx: &CodecContext<'_>, bytes: &[u8]) -> Vec<Directive> {
        self.client.process(cx, bytes)
    }

    fn on_response(&mut self, cx: &CodecContext<'_>, bytes: &[u8]) -> Vec<Directive> {
        self.server.process(cx, bytes)
    }

    fn reply_tag(&self) -> ProtocolTag {
        ProtocolTag::SftpData
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ProtocolFamily;
    use crate::inspect::signature::EICAR;
    use crate::proxy::testing::{forwarded, Harness};

    #[test]
    fn test_identification_split_from_binary() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Sftp);
        let mut codec = SftpCodec::new();

        assert!(codec.on_response(&cx, b"SSH-2.0-Open").is_empty());
        let out = codec.on_response(&cx, b"SSH_9.6\r\n\x00\x00\x01\x2c\x0a\x14");
        assert_eq!(
            out,
            vec![
                Directive::Forward {
                    tag: ProtocolTag::SftpControl,
                    bytes: b"SSH-2.0-OpenSSH_9.6\r\n".to_vec()
                },
                Directive::Forward {
                    tag: ProtocolTag::SftpData,
                    bytes: b"\x00\x00\x01\x2c\x0a\x14".to_vec()
                },
            ]
        );
        assert_eq!(codec.identities(), (None, Some("SSH-2.0-OpenSSH_9.6")));
    }

    #[test]
    fn test_banner_lines_before_identification() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Sftp);
        let mut codec = SftpCodec::new();

        let out = codec.on_response(&cx, b"Welcome\r\nSSH-2.0-srv\r\n");
        assert_eq!(forwarded(&out), b"Welcome\r\nSSH-2.0-srv\r\n".to_vec());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_oversized_identification_dropped() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Sftp);
        let mut codec = SftpCodec::new();

        let out = codec.on_request(&cx, &[b'x'; 300]);
        assert!(matches!(out[0], Directive::Drop(_)));
    }

    #[test]
    fn test_signature_in_stream_closes_session() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Sftp);
        let mut codec = SftpCodec::new();

        codec.on_request(&cx, b"SSH-2.0-client\r\n");
        let out = codec.on_request(&cx, EICAR);
        assert!(matches!(out.last(), Some(Directive::Drop(_))));
        assert_eq!(harness.stats.snapshot().threats_detected, 1);
    }
}
