//! FTP control and data channels
//!
//! The control channel is line-oriented: every client command is checked
//! against the command policy before it crosses the link. Only passive mode
//! is supported. Side B records the backend's PASV/EPSV endpoint, side A
//! opens its own data listener and rewrites the reply so the client
//! connects to the bridge instead. Data channels reuse the control session
//! id under the `FtpData` tag.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    connect_backend, finish_session, push_forward, queue_frame, track_sequence, Closed, CodecContext, Directive,
    Downstream, ProtocolCodec, ProxyContext, Relay, ScanWindow,
};
use crate::audit::{AuditAction, AuditEvent};
use crate::config::Side;
use crate::error::{Error, Result};
use crate::frame::{FrameFlags, ProtocolFamily, ProtocolTag, SecureFrame};
use crate::inspect::Verdict;
use crate::session::{Session, SessionId, SessionManager};

/// Longest buffered control line before it is discarded
pub const MAX_LINE: usize = 4096;

/// How long side A waits for the client to connect to a data listener
pub const DATA_ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);

pub const REPLY_REJECTED: &[u8] = b"550 Command rejected by security policy\r\n";
pub const REPLY_SYNTAX_ERROR: &[u8] = b"500 Syntax error, command unrecognized\r\n";
pub const REPLY_LINE_TOO_LONG: &[u8] = b"500 Command line too long\r\n";
pub const REPLY_ACTIVE_UNSUPPORTED: &[u8] = b"502 Active mode not supported, use PASV\r\n";
pub const REPLY_CANT_OPEN_DATA: &[u8] = b"425 Can't open data connection\r\n";
pub const REPLY_SERVICE_UNAVAILABLE: &[u8] = b"421 Service not available, closing control connection\r\n";

/// Output of one [`LineBuffer::push`]
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LineBatch {
    /// Complete lines, terminator included
    pub lines: Vec<Vec<u8>>,
    /// A line grew past the limit and was discarded
    pub overflowed: bool,
}

/// Splits a byte stream into LF-terminated lines.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line: usize,
    discarding: bool,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(MAX_LINE)
    }
}

impl LineBuffer {
    pub fn new(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line,
            discarding: false,
        }
    }

    pub fn push(&mut self, data: &[u8]) -> LineBatch {
        let mut batch = LineBatch::default();
        for &byte in data {
            if self.discarding {
                // Drop the rest of an oversized line up to its terminator.
                if byte == b'\n' {
                    self.discarding = false;
                }
                continue;
            }
            self.pending.push(byte);
            if byte == b'\n' {
                batch.lines.push(std::mem::take(&mut self.pending));
            } else if self.pending.len() >= self.max_line {
                self.pending.clear();
                self.discarding = true;
                batch.overflowed = true;
            }
        }
        batch
    }

    /// Bytes of the incomplete trailing line
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Upper-cased first word of a command line
pub fn command_verb(line: &str) -> String {
    line.split_whitespace().next().unwrap_or_default().to_ascii_uppercase()
}

/// Parse `PORT h1,h2,h3,h4,p1,p2`.
pub fn parse_port(line: &str) -> Option<SocketAddr> {
    let args = line.trim().split_once(' ')?.1;
    let (ip, port) = parse_host_port(args)?;
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Parse `EPRT |proto|addr|port|`.
pub fn parse_eprt(line: &str) -> Option<SocketAddr> {
    let args = line.trim().split_once(' ')?.1.trim();
    let delim = args.chars().next()?;
    let mut fields = args.split(delim).skip(1);
    let _proto = fields.next()?;
    let addr: IpAddr = fields.next()?.parse().ok()?;
    let port: u16 = fields.next()?.parse().ok()?;
    Some(SocketAddr::new(addr, port))
}

fn parse_host_port(args: &str) -> Option<(Ipv4Addr, u16)> {
    let numbers = args
        .trim()
        .split(',')
        .map(|n| n.trim().parse::<u8>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .ok()?;
    if numbers.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::new(numbers[0], numbers[1], numbers[2], numbers[3]);
    let port = u16::from(numbers[4]) << 8 | u16::from(numbers[5]);
    Some((ip, port))
}

/// Data endpoint announced by a 227 or 229 reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassiveEndpoint {
    /// Only 227 replies carry an address
    pub host: Option<Ipv4Addr>,
    pub port: u16,
    /// Announced through EPSV
    pub extended: bool,
}

impl PassiveEndpoint {
    /// Address to connect to; `fallback` stands in for a missing or
    /// unspecified host.
    pub fn resolve(&self, fallback: IpAddr) -> SocketAddr {
        match self.host {
            Some(ip) if !ip.is_unspecified() => SocketAddr::new(IpAddr::V4(ip), self.port),
            _ => SocketAddr::new(fallback, self.port),
        }
    }
}

/// Parse a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` or
/// `229 Entering Extended Passive Mode (|||port|)` reply line.
pub fn parse_passive_reply(line: &str) -> Option<PassiveEndpoint> {
    let line = line.trim_end();
    if line.starts_with("227") {
        let start = line.find('(')?;
        let end = line[start..].find(')')? + start;
        let (ip, port) = parse_host_port(&line[start + 1..end])?;
        return Some(PassiveEndpoint {
            host: Some(ip),
            port,
            extended: false,
        });
    }
    if line.starts_with("229") {
        let start = line.find('(')?;
        let end = line[start..].find(')')? + start;
        let inner = &line[start + 1..end];
        let delim = inner.chars().next()?;
        let port = inner.split(delim).nth(3)?.parse().ok()?;
        return Some(PassiveEndpoint {
            host: None,
            port,
            extended: true,
        });
    }
    None
}

/// Build the passive reply the client sees, pointing at `advertised`.
///
/// `None` when a 227 reply would need an IPv6 address.
pub fn passive_reply(original: &PassiveEndpoint, advertised: SocketAddr) -> Option<Vec<u8>> {
    let port = advertised.port();
    if original.extended {
        return Some(format!("229 Entering Extended Passive Mode (|||{}|)\r\n", port).into_bytes());
    }
    let IpAddr::V4(ip) = advertised.ip() else {
        return None;
    };
    let [a, b, c, d] = ip.octets();
    Some(
        format!(
            "227 Entering Passive Mode ({},{},{},{},{},{})\r\n",
            a,
            b,
            c,
            d,
            port >> 8,
            port & 0xff
        )
        .into_bytes(),
    )
}

/// FTP control channel codec
pub struct FtpCodec {
    side: Side,
    requests: LineBuffer,
    responses: LineBuffer,
    active: Option<SocketAddr>,
    passive: Option<PassiveEndpoint>,
}

impl FtpCodec {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            requests: LineBuffer::default(),
            responses: LineBuffer::default(),
            active: None,
            passive: None,
        }
    }

    /// Last endpoint requested through PORT/EPRT
    pub fn active_endpoint(&self) -> Option<SocketAddr> {
        self.active
    }

    /// Last endpoint announced through PASV/EPSV
    pub fn passive_endpoint(&self) -> Option<PassiveEndpoint> {
        self.passive
    }
}

impl ProtocolCodec for FtpCodec {
    fn on_request(&mut self, cx: &CodecContext<'_>, bytes: &[u8]) -> Vec<Directive> {
        let batch = self.requests.push(bytes);
        let mut out = Vec::new();

        if batch.overflowed {
            cx.rejected(AuditAction::CommandRejected, "command line too long");
            out.push(Directive::Reply(REPLY_LINE_TOO_LONG.to_vec()));
        }

        for line in batch.lines {
            let text = String::from_utf8_lossy(&line);
            match cx.inspector.check_ftp_command(&text) {
                Verdict::Accepted => {}
                Verdict::Malformed(_) => {
                    out.push(Directive::Reply(REPLY_SYNTAX_ERROR.to_vec()));
                    continue;
                }
                Verdict::Rejected(reason) => {
                    cx.rejected(AuditAction::CommandRejected, &reason);
                    out.push(Directive::Reply(REPLY_REJECTED.to_vec()));
                    continue;
                }
            }

            let verb = command_verb(&text);
            if verb == "PORT" || verb == "EPRT" {
                self.active = if verb == "PORT" {
                    parse_port(&text)
                } else {
                    parse_eprt(&text)
                };
                debug!(session = %cx.session.short(), endpoint = ?self.active, "active mode refused");
                out.push(Directive::Reply(REPLY_ACTIVE_UNSUPPORTED.to_vec()));
                continue;
            }

            push_forward(&mut out, ProtocolTag::FtpControl, &line);
        }
        out
    }

    fn on_response(&mut self, cx: &CodecContext<'_>, bytes: &[u8]) -> Vec<Directive> {
        let batch = self.responses.push(bytes);
        if batch.overflowed {
            warn!(session = %cx.session.short(), "oversized server reply line discarded");
        }

        let mut out = Vec::new();
        for line in batch.lines {
            if let Some(endpoint) = parse_passive_reply(&String::from_utf8_lossy(&line)) {
                self.passive = Some(endpoint);
                out.push(Directive::PassiveData { backend: endpoint });
                // Side A answers the client with its own rewritten reply.
                if self.side == Side::Client {
                    continue;
                }
            }
            push_forward(&mut out, ProtocolTag::FtpControl, &line);
        }
        out
    }

    fn reply_tag(&self) -> ProtocolTag {
        ProtocolTag::FtpControl
    }

    fn backend_unavailable(&self) -> Option<Vec<u8>> {
        Some(REPLY_SERVICE_UNAVAILABLE.to_vec())
    }
}

/// FTP data channel codec: content scanning in both directions
pub struct FtpDataCodec {
    upload: ScanWindow,
    download: ScanWindow,
}

impl Default for FtpDataCodec {
    fn default() -> Self {
        Self {
            upload: ScanWindow::new("ftp-upload"),
            download: ScanWindow::new("ftp-download"),
        }
    }
}

fn scanned(window: &mut ScanWindow, cx: &CodecContext<'_>, bytes: &[u8]) -> Vec<Directive> {
    match window.check(cx.inspector, bytes) {
        Verdict::Accepted => vec![Directive::Forward {
            tag: ProtocolTag::FtpData,
            bytes: bytes.to_vec(),
        }],
        Verdict::Rejected(reason) | Verdict::Malformed(reason) => {
            cx.threat(&reason);
            vec![Directive::Drop(reason)]
        }
    }
}

impl ProtocolCodec for FtpDataCodec {
    fn on_request(&mut self, cx: &CodecContext<'_>, bytes: &[u8]) -> Vec<Directive> {
        scanned(&mut self.upload, cx, bytes)
    }

    fn on_response(&mut self, cx: &CodecContext<'_>, bytes: &[u8]) -> Vec<Directive> {
        scanned(&mut self.download, cx, bytes)
    }

    fn reply_tag(&self) -> ProtocolTag {
        ProtocolTag::FtpData
    }
}

/// Passive data connections of every FTP control session on this side
pub struct FtpDataPlane {
    ctx: Arc<ProxyContext>,
    /// FTP control sessions, shared with the FTP proxy engine
    control: Arc<SessionManager<Downstream>>,
    channels: Arc<SessionManager<Downstream>>,
    /// Side B: backend data endpoint per control session
    passive: DashMap<SessionId, SocketAddr>,
    data_bind: IpAddr,
    advertise_ip: Option<Ipv4Addr>,
}

impl FtpDataPlane {
    pub fn new(ctx: Arc<ProxyContext>, data_bind: IpAddr, advertise_ip: Option<Ipv4Addr>) -> Arc<Self> {
        let control = Arc::new(SessionManager::new("ftp", ctx.cancel.clone()));
        let channels = Arc::new(SessionManager::reusable("ftp-data", ctx.cancel.clone()));
        Arc::new(Self {
            ctx,
            control,
            channels,
            passive: DashMap::new(),
            data_bind,
            advertise_ip,
        })
    }

    pub fn control(&self) -> &Arc<SessionManager<Downstream>> {
        &self.control
    }

    pub fn channels(&self) -> &Arc<SessionManager<Downstream>> {
        &self.channels
    }

    /// Side B: control sessions with a recorded passive endpoint
    pub fn pending_endpoints(&self) -> usize {
        self.passive.len()
    }

    pub fn record_passive(&self, control: SessionId, backend: SocketAddr) {
        debug!(session = %control.short(), %backend, "passive endpoint recorded");
        self.passive.insert(control, backend);
    }

    pub fn passive_endpoint(&self, control: &SessionId) -> Option<SocketAddr> {
        self.passive.get(control).map(|entry| *entry)
    }

    /// Drop all data state of a finished control session.
    pub fn forget(&self, control: &SessionId) {
        self.passive.remove(control);
        if let Some(channel) = self.channels.get(control) {
            channel.cancel_token().cancel();
        }
    }

    pub fn spawn_sweeper(&self, timeout: Duration) {
        self.channels
            .spawn_sweeper(&self.ctx.tracker, timeout, self.ctx.cancel.clone());
    }

    /// Side A: bind a listener for the next data connection of `control`
    /// and return the address to advertise to the client. Only `client`
    /// may connect; the listener goes away with `control_cancel`.
    ///
    /// Boxed because the data relay it spawns can itself announce passive
    /// endpoints.
    pub fn open_listener(
        self: &Arc<Self>,
        control: SessionId,
        control_cancel: CancellationToken,
        control_local: IpAddr,
        client: IpAddr,
    ) -> BoxFuture<'static, Result<SocketAddr>> {
        let plane = Arc::clone(self);
        async move {
            if let Some(previous) = plane.channels.remove(&control) {
                previous.cancel_token().cancel();
            }

            let listener = TcpListener::bind(SocketAddr::new(plane.data_bind, 0)).await?;
            let port = listener.local_addr()?.port();
            let ip = plane.advertise_ip.map(IpAddr::V4).unwrap_or(control_local);

            let tracker = plane.ctx.tracker.clone();
            tracker.spawn(plane.accept_data(control, control_cancel, listener, client));
            Ok(SocketAddr::new(ip, port))
        }
        .boxed()
    }

    /// Wait for the control session's client to connect. Connections from
    /// any other address are refused and waiting continues.
    async fn accept_client(
        &self,
        control: SessionId,
        control_cancel: &CancellationToken,
        listener: &TcpListener,
        client: IpAddr,
    ) -> Option<(TcpStream, SocketAddr)> {
        let deadline = Instant::now() + DATA_ACCEPT_TIMEOUT;
        loop {
            let accepted = tokio::select! {
                _ = control_cancel.cancelled() => return None,
                accepted = tokio::time::timeout_at(deadline, listener.accept()) => accepted,
            };
            match accepted {
                Err(_) => {
                    debug!(session = %control.short(), "no data connection within {:?}", DATA_ACCEPT_TIMEOUT);
                    return None;
                }
                Ok(Err(e)) => {
                    debug!(session = %control.short(), error = %e, "data accept failed");
                    return None;
                }
                Ok(Ok((stream, peer))) if peer.ip() == client => return Some((stream, peer)),
                Ok(Ok((_, peer))) => {
                    warn!(
                        session = %control.short(),
                        %peer,
                        expected = %client,
                        "data connection from foreign address refused"
                    );
                    self.ctx.audit.record(
                        AuditEvent::new(AuditAction::ConnectionRefused)
                            .with_session(control)
                            .with_protocol(ProtocolFamily::Ftp)
                            .with_peer(peer)
                            .with_detail(format!("data connection expected from {}", client)),
                    );
                }
            }
        }
    }

    async fn accept_data(
        self: Arc<Self>,
        control: SessionId,
        control_cancel: CancellationToken,
        listener: TcpListener,
        client: IpAddr,
    ) {
        let Some((stream, peer)) = self.accept_client(control, &control_cancel, &listener, client).await else {
            return;
        };
        drop(listener);

        let (downstream, frames) = Downstream::channel();
        let session = match self.channels.register(control, ProtocolFamily::Ftp, Some(peer), downstream) {
            Ok(session) => session,
            Err(e) => {
                warn!(session = %control.short(), error = %e, "data channel not registered");
                return;
            }
        };
        self.ctx.stats.record_session_opened();
        debug!(session = %control.short(), %peer, "data connection accepted");

        let reason = match Relay::new(&self.ctx, &session, Box::<FtpDataCodec>::default(), &stream) {
            Ok(relay) => match self
                .ctx
                .send_control(&session, ProtocolTag::FtpData, FrameFlags::open())
                .await
            {
                Ok(()) => relay.keeping_alive(&self.control).run(stream, frames).await,
                Err(e) => Closed::DownstreamError(e.to_string()),
            },
            Err(e) => Closed::DownstreamError(e.to_string()),
        };
        finish_session(&self.ctx, &self.channels, &session, ProtocolTag::FtpData, reason).await;
    }

    /// Route an inbound `FtpData` frame.
    pub async fn deliver(self: &Arc<Self>, frame: SecureFrame) {
        if frame.flags.open && self.ctx.side == Side::Backend {
            self.connect_data(frame).await;
            return;
        }
        match self.channels.get(&frame.session_id) {
            Some(channel) => {
                track_sequence(&self.ctx, &channel, frame.sequence);
                queue_frame(&self.channels, &channel, frame);
            }
            None => debug!(session = %frame.session_id.short(), "data frame for unknown channel dropped"),
        }
    }

    async fn connect_data(self: &Arc<Self>, open: SecureFrame) {
        let control = open.session_id;
        let Some(endpoint) = self.passive_endpoint(&control) else {
            warn!(session = %control.short(), "data channel opened without a passive endpoint");
            let refuse = SecureFrame::control(control, 0, ProtocolTag::FtpData, FrameFlags::close());
            if let Err(e) = self.ctx.send_frame(&refuse).await {
                debug!(session = %control.short(), error = %e, "refusal not sent");
            }
            return;
        };

        if let Some(previous) = self.channels.remove(&control) {
            previous.cancel_token().cancel();
        }
        let (downstream, frames) = Downstream::channel();
        let session = match self.channels.register(control, ProtocolFamily::Ftp, Some(endpoint), downstream) {
            Ok(session) => session,
            Err(e) => {
                warn!(session = %control.short(), error = %e, "data channel not registered");
                return;
            }
        };
        track_sequence(&self.ctx, &session, open.sequence);
        self.ctx.stats.record_session_opened();

        let plane = Arc::clone(self);
        self.ctx.tracker.spawn(async move {
            let reason = plane.run_backend_channel(&session, endpoint, frames).await;
            finish_session(&plane.ctx, &plane.channels, &session, ProtocolTag::FtpData, reason).await;
        });
    }

    async fn run_backend_channel(
        &self,
        session: &Arc<Session<Downstream>>,
        endpoint: SocketAddr,
        frames: tokio::sync::mpsc::Receiver<SecureFrame>,
    ) -> Closed {
        let stream = match connect_backend(&self.ctx, session.cancel_token(), &endpoint.to_string()).await {
            Ok(stream) => stream,
            Err(Error::Cancelled) => return Closed::Cancelled,
            Err(e) => return Closed::BackendUnavailable(e.to_string()),
        };
        match Relay::new(&self.ctx, session, Box::<FtpDataCodec>::default(), &stream) {
            Ok(relay) => relay.keeping_alive(&self.control).run(stream, frames).await,
            Err(e) => Closed::DownstreamError(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::signature::EICAR;
    use crate::transport::Transceiver;
    use crate::proxy::testing::{context, forwarded, Harness};
    use futures::stream::{BoxStream, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpSocket;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn next_frame(frames: &mut BoxStream<'static, Vec<u8>>, ctx: &ProxyContext) -> SecureFrame {
        let raw = tokio::time::timeout(Duration::from_secs(5), frames.next())
            .await
            .expect("no frame on the link")
            .expect("link closed");
        SecureFrame::deserialize(&raw, &ctx.engine).unwrap()
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    #[test]
    fn test_line_buffer_reassembles_split_lines() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"USER te").lines.is_empty());
        let batch = buffer.push(b"st\r\nPASS x\r\nLI");
        assert_eq!(batch.lines, vec![b"USER test\r\n".to_vec(), b"PASS x\r\n".to_vec()]);
        assert_eq!(buffer.pending(), 2);
    }

    #[test]
    fn test_line_buffer_discards_oversized_line() {
        let mut buffer = LineBuffer::new(16);
        let batch = buffer.push(&[b'A'; 40]);
        assert!(batch.overflowed);
        assert!(batch.lines.is_empty());

        let batch = buffer.push(b"AAAA\r\nNOOP\r\n");
        assert!(!batch.overflowed);
        assert_eq!(batch.lines, vec![b"NOOP\r\n".to_vec()]);
    }

    #[test]
    fn test_parse_pasv_reply_and_rewrite() {
        let endpoint = parse_passive_reply("227 Entering Passive Mode (192,168,1,20,19,137)\r\n").unwrap();
        assert_eq!(endpoint.host, Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(endpoint.port, 19 * 256 + 137);
        assert!(!endpoint.extended);

        let advertised: SocketAddr = "10.0.0.5:40001".parse().unwrap();
        let reply = passive_reply(&endpoint, advertised).unwrap();
        assert_eq!(reply, b"227 Entering Passive Mode (10,0,0,5,156,65)\r\n".to_vec());

        let reparsed = parse_passive_reply(std::str::from_utf8(&reply).unwrap()).unwrap();
        assert_eq!(reparsed.resolve(IpAddr::V4(Ipv4Addr::LOCALHOST)), advertised);
    }

    #[test]
    fn test_parse_epsv_reply() {
        let endpoint = parse_passive_reply("229 Entering Extended Passive Mode (|||6446|)").unwrap();
        assert_eq!(endpoint.host, None);
        assert_eq!(endpoint.port, 6446);
        assert!(endpoint.extended);

        let backend = endpoint.resolve("172.16.0.9".parse().unwrap());
        assert_eq!(backend, "172.16.0.9:6446".parse().unwrap());

        let advertised: SocketAddr = "[::1]:5000".parse().unwrap();
        assert_eq!(
            passive_reply(&endpoint, advertised).unwrap(),
            b"229 Entering Extended Passive Mode (|||5000|)\r\n".to_vec()
        );
    }

    #[test]
    fn test_unspecified_pasv_host_uses_fallback() {
        let endpoint = parse_passive_reply("227 Entering Passive Mode (0,0,0,0,4,1)").unwrap();
        let fallback = IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1));
        assert_eq!(endpoint.resolve(fallback), SocketAddr::new(fallback, 1025));
        assert!(parse_passive_reply("200 OK").is_none());
        assert!(parse_passive_reply("227 garbage").is_none());
    }

    #[test]
    fn test_parse_active_commands() {
        assert_eq!(parse_port("PORT 127,0,0,1,4,0\r\n"), Some("127.0.0.1:1024".parse().unwrap()));
        assert_eq!(parse_eprt("EPRT |2|::1|5282|\r\n"), Some("[::1]:5282".parse().unwrap()));
        assert_eq!(parse_port("PORT 1,2,3"), None);
    }

    #[test]
    fn test_commands_forwarded_and_rejected() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Ftp);
        let mut codec = FtpCodec::new(Side::Client);

        let out = codec.on_request(&cx, b"USER test\r\nFOOBAR\r\nPWD\r\n");
        assert_eq!(
            out,
            vec![
                Directive::Forward {
                    tag: ProtocolTag::FtpControl,
                    bytes: b"USER test\r\n".to_vec()
                },
                Directive::Reply(REPLY_REJECTED.to_vec()),
                Directive::Forward {
                    tag: ProtocolTag::FtpControl,
                    bytes: b"PWD\r\n".to_vec()
                },
            ]
        );
        assert_eq!(harness.stats.snapshot().policy_rejections, 1);
    }

    #[test]
    fn test_injection_never_forwarded() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Ftp);
        let mut codec = FtpCodec::new(Side::Client);

        let out = codec.on_request(&cx, b"CWD /tmp; rm -rf /\r\n");
        assert!(forwarded(&out).is_empty());
        assert_eq!(out, vec![Directive::Reply(REPLY_REJECTED.to_vec())]);
    }

    #[test]
    fn test_active_mode_refused() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Ftp);
        let mut codec = FtpCodec::new(Side::Client);

        let out = codec.on_request(&cx, b"PORT 10,0,0,1,200,10\r\n");
        assert_eq!(out, vec![Directive::Reply(REPLY_ACTIVE_UNSUPPORTED.to_vec())]);
        assert_eq!(codec.active_endpoint(), Some("10.0.0.1:51210".parse().unwrap()));
    }

    #[test]
    fn test_empty_line_is_syntax_error() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Ftp);
        let mut codec = FtpCodec::new(Side::Client);
        assert_eq!(
            codec.on_request(&cx, b"\r\n"),
            vec![Directive::Reply(REPLY_SYNTAX_ERROR.to_vec())]
        );
    }

    #[test]
    fn test_passive_reply_handling_per_side() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Ftp);
        let reply = b"150 Here it comes\r\n227 Entering Passive Mode (127,0,0,1,39,16)\r\n";
        let endpoint = PassiveEndpoint {
            host: Some(Ipv4Addr::LOCALHOST),
            port: 10000,
            extended: false,
        };

        let mut side_b = FtpCodec::new(Side::Backend);
        let out = side_b.on_response(&cx, reply);
        assert!(out.contains(&Directive::PassiveData { backend: endpoint }));
        assert_eq!(forwarded(&out), reply.to_vec());

        let mut side_a = FtpCodec::new(Side::Client);
        let out = side_a.on_response(&cx, reply);
        assert!(out.contains(&Directive::PassiveData { backend: endpoint }));
        assert_eq!(forwarded(&out), b"150 Here it comes\r\n".to_vec());
        assert_eq!(side_a.passive_endpoint(), Some(endpoint));
    }

    #[test]
    fn test_data_codec_drops_infected_transfer() {
        let harness = Harness::new();
        let cx = harness.cx(ProtocolFamily::Ftp);
        let mut codec = FtpDataCodec::default();

        let clean = codec.on_request(&cx, b"plain file contents");
        assert_eq!(forwarded(&clean), b"plain file contents".to_vec());

        let (head, tail) = EICAR.split_at(10);
        assert!(matches!(codec.on_response(&cx, head)[0], Directive::Forward { .. }));
        assert!(matches!(codec.on_response(&cx, tail)[0], Directive::Drop(_)));
        assert_eq!(harness.stats.snapshot().threats_detected, 1);
    }

    #[tokio::test]
    async fn test_forget_releases_data_state() {
        let (ctx, _far) = context(Side::Backend);
        let plane = FtpDataPlane::new(ctx, LOCALHOST, None);
        let control = SessionId::generate();
        plane.record_passive(control, "127.0.0.1:2121".parse().unwrap());
        let (downstream, _frames) = Downstream::channel();
        let channel = plane
            .channels()
            .register(control, ProtocolFamily::Ftp, None, downstream)
            .unwrap();
        assert_eq!(plane.pending_endpoints(), 1);

        plane.forget(&control);
        assert_eq!(plane.pending_endpoints(), 0);
        assert!(plane.passive_endpoint(&control).is_none());
        assert!(channel.is_cancelled());
    }

    #[tokio::test]
    async fn test_data_listener_only_admits_control_client() {
        let (ctx, far) = context(Side::Client);
        let plane = FtpDataPlane::new(Arc::clone(&ctx), LOCALHOST, None);
        let control = SessionId::generate();
        let advertised = plane
            .open_listener(control, CancellationToken::new(), LOCALHOST, LOCALHOST)
            .await
            .unwrap();

        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.2:0".parse().unwrap()).unwrap();
        let mut foreign = socket.connect(advertised).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(5), foreign.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(!plane.channels().contains(&control));

        let _client = TcpStream::connect(advertised).await.unwrap();
        wait_until(|| plane.channels().contains(&control)).await;

        let mut frames = far.receive_stream();
        let open = next_frame(&mut frames, &ctx).await;
        assert_eq!(open.session_id, control);
        assert_eq!(open.protocol, ProtocolTag::FtpData);
        assert!(open.flags.open);
    }

    #[tokio::test]
    async fn test_data_listener_closes_with_control_session() {
        let (ctx, _far) = context(Side::Client);
        let plane = FtpDataPlane::new(ctx, LOCALHOST, None);
        let control_cancel = CancellationToken::new();
        let advertised = plane
            .open_listener(SessionId::generate(), control_cancel.clone(), LOCALHOST, LOCALHOST)
            .await
            .unwrap();

        control_cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), async {
            while TcpStream::connect(advertised).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener still accepting");
    }

    #[tokio::test]
    async fn test_data_traffic_keeps_control_session_alive() {
        let (ctx, far) = context(Side::Client);
        let plane = FtpDataPlane::new(Arc::clone(&ctx), LOCALHOST, None);
        let (busy_tx, _busy_rx) = Downstream::channel();
        let (quiet_tx, _quiet_rx) = Downstream::channel();
        let busy = plane
            .control()
            .register(SessionId::generate(), ProtocolFamily::Ftp, None, busy_tx)
            .unwrap();
        let quiet = plane
            .control()
            .register(SessionId::generate(), ProtocolFamily::Ftp, None, quiet_tx)
            .unwrap();

        let advertised = plane
            .open_listener(busy.id, busy.cancel_token().clone(), LOCALHOST, LOCALHOST)
            .await
            .unwrap();
        let mut client = TcpStream::connect(advertised).await.unwrap();
        let mut frames = far.receive_stream();
        assert!(next_frame(&mut frames, &ctx).await.flags.open);

        tokio::time::sleep(Duration::from_millis(300)).await;
        client.write_all(b"upload bytes").await.unwrap();
        assert_eq!(next_frame(&mut frames, &ctx).await.payload, b"upload bytes".to_vec());

        let evicted = plane.control().evict_idle(Duration::from_millis(250));
        assert_eq!(evicted, vec![quiet.id]);
        assert!(plane.control().contains(&busy.id));
    }
}
