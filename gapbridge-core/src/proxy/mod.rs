//! Protocol proxies
//!
//! Each proxied protocol runs the same two-sided engine with a
//! protocol-specific [`ProtocolCodec`] plugged in.
//!
//! ## Side A (client-facing)
//! ```text
//! Listening --accept--> Accepted --OPEN frame--> Streaming --EOF/error--> Closed
//! ```
//! Every accepted connection gets a fresh [`SessionId`]. Bytes read from
//! the client go through `on_request`; frames from the peer go through
//! `on_response` and are written back to the client.
//!
//! ## Side B (backend-facing)
//! ```text
//! Idle --first frame--> Connected --> Relaying --EOF/error/CLOSE--> Closed
//! ```
//! The first frame for an unknown id connects to the backend under the
//! retry policy. Frames are re-inspected through `on_request` before being
//! written to the backend; backend bytes go through `on_response` and are
//! framed back with the same id.
//!
//! Each session is driven by a single task that owns its socket, so the
//! bytes of one session are always framed in the order they were read.
//! The receive loop reaches that task through a bounded frame queue and
//! never waits on it: a session whose queue is full is closed so the
//! others keep flowing.

pub mod ftp;
pub mod postgres;
pub mod sftp;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::audit::{AuditAction, AuditEvent, AuditLogger};
use crate::config::Side;
use crate::crypto::CryptoEngine;
use crate::error::{Error, Result};
use crate::frame::{FrameFlags, ProtocolFamily, ProtocolTag, SecureFrame, FRAME_OVERHEAD};
use crate::inspect::{Inspector, Verdict};
use crate::retry::{with_timeout, RetryPolicy};
use crate::session::{SequenceStatus, Session, SessionId, SessionManager};
use crate::stats::BridgeStats;
use crate::transport::Transceiver;

pub use ftp::{FtpCodec, FtpDataCodec, FtpDataPlane, LineBuffer, PassiveEndpoint};
pub use postgres::{PgMessage, PgMessageBuffer, PostgresCodec};
pub use sftp::SftpCodec;

const READ_BUFFER: usize = 16 * 1024;

/// Frames queued per session before the session is closed as stalled
pub const FRAME_QUEUE: usize = 512;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// What the engine should do with the outcome of a codec step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Pass bytes on in their direction of travel
    Forward { tag: ProtocolTag, bytes: Vec<u8> },
    /// Protocol-native answer sent back to where the bytes came from
    Reply(Vec<u8>),
    /// The FTP server announced a passive data endpoint
    PassiveData { backend: PassiveEndpoint },
    /// Discard the bytes and tear the session down
    Drop(String),
}

/// Append a forward, merging with a directly preceding forward of the same tag
pub(crate) fn push_forward(out: &mut Vec<Directive>, tag: ProtocolTag, bytes: &[u8]) {
    if let Some(Directive::Forward { tag: last, bytes: pending }) = out.last_mut() {
        if *last == tag {
            pending.extend_from_slice(bytes);
            return;
        }
    }
    out.push(Directive::Forward {
        tag,
        bytes: bytes.to_vec(),
    });
}

/// Shared services a codec may use while processing one chunk
pub struct CodecContext<'a> {
    pub session: SessionId,
    pub family: ProtocolFamily,
    pub inspector: &'a Inspector,
    pub audit: &'a AuditLogger,
    pub stats: &'a BridgeStats,
}

impl CodecContext<'_> {
    /// Record a policy rejection.
    pub fn rejected(&self, action: AuditAction, reason: &str) {
        self.stats.record_policy_rejection();
        warn!(session = %self.session.short(), protocol = %self.family, reason, "rejected by policy");
        self.audit.record(
            AuditEvent::new(action)
                .with_session(self.session)
                .with_protocol(self.family)
                .with_detail(reason),
        );
    }

    /// Record a content scanner hit.
    pub fn threat(&self, reason: &str) {
        self.stats.record_threat();
        warn!(session = %self.session.short(), protocol = %self.family, reason, "threat detected");
        self.audit.record(
            AuditEvent::new(AuditAction::ThreatDetected)
                .with_session(self.session)
                .with_protocol(self.family)
                .with_detail(reason),
        );
    }
}

/// Per-session protocol state machine.
///
/// `on_request` sees client-to-backend bytes (side A: the client socket,
/// side B: link payloads), `on_response` the other direction. Input may be
/// split anywhere; codecs buffer until a message is complete.
pub trait ProtocolCodec: Send {
    fn on_request(&mut self, cx: &CodecContext<'_>, bytes: &[u8]) -> Vec<Directive>;

    fn on_response(&mut self, cx: &CodecContext<'_>, bytes: &[u8]) -> Vec<Directive>;

    /// Tag for `Reply` bytes that have to cross the link
    fn reply_tag(&self) -> ProtocolTag;

    /// Sent to the client when the backend cannot be reached
    fn backend_unavailable(&self) -> Option<Vec<u8>> {
        None
    }
}

pub fn codec_for(family: ProtocolFamily, side: Side) -> Box<dyn ProtocolCodec> {
    match family {
        ProtocolFamily::Ftp => Box::new(FtpCodec::new(side)),
        ProtocolFamily::Sftp => Box::new(SftpCodec::new()),
        ProtocolFamily::Postgres => Box::new(PostgresCodec::new()),
    }
}

/// Content scan state for one stream direction.
///
/// Keeps the last `max_pattern_len - 1` bytes of the previous chunk so a
/// signature split across two chunks is still found.
#[derive(Debug)]
pub struct ScanWindow {
    label: &'static str,
    tail: Vec<u8>,
}

impl ScanWindow {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            tail: Vec::new(),
        }
    }

    pub fn check(&mut self, inspector: &Inspector, data: &[u8]) -> Verdict {
        let keep = inspector.max_pattern_len().saturating_sub(1);
        let mut window = std::mem::take(&mut self.tail);
        window.extend_from_slice(data);

        let verdict = inspector.check_content(&window, self.label);

        let start = window.len().saturating_sub(keep);
        window.drain(..start);
        self.tail = window;
        verdict
    }
}

/// Services shared by every proxy on one side of the bridge
pub struct ProxyContext {
    pub side: Side,
    pub engine: Arc<CryptoEngine>,
    pub link: Arc<dyn Transceiver>,
    pub inspector: Arc<Inspector>,
    pub retry: RetryPolicy,
    pub audit: AuditLogger,
    pub stats: Arc<BridgeStats>,
    /// Process-wide hard stop; every session token is a child of it
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
}

impl ProxyContext {
    /// Largest payload that fits one link frame
    pub fn max_payload(&self) -> usize {
        self.link.max_frame_size().saturating_sub(FRAME_OVERHEAD).max(1)
    }

    pub fn codec_context(&self, session: SessionId, family: ProtocolFamily) -> CodecContext<'_> {
        CodecContext {
            session,
            family,
            inspector: &self.inspector,
            audit: &self.audit,
            stats: &self.stats,
        }
    }

    /// Seal and send one frame, retrying transient link failures.
    pub async fn send_frame(&self, frame: &SecureFrame) -> Result<()> {
        let bytes = frame.serialize(&self.engine)?;
        let (link, wire) = (&self.link, &bytes);
        self.retry
            .execute_with_cancel("link send", &self.cancel, move || link.send(wire))
            .await?;
        self.stats.record_tx(bytes.len());
        trace!(
            session = %frame.session_id.short(),
            protocol = ?frame.protocol,
            sequence = frame.sequence,
            bytes = bytes.len(),
            "frame sent"
        );
        Ok(())
    }

    /// Send `payload` as consecutive frames no larger than the link allows.
    pub async fn send_payload<C>(&self, session: &Session<C>, tag: ProtocolTag, payload: &[u8]) -> Result<()> {
        for chunk in payload.chunks(self.max_payload()) {
            let frame = SecureFrame::new(session.id, session.next_sequence(), tag, chunk.to_vec());
            self.send_frame(&frame).await?;
        }
        session.touch();
        Ok(())
    }

    pub async fn send_control<C>(&self, session: &Session<C>, tag: ProtocolTag, flags: FrameFlags) -> Result<()> {
        let frame = SecureFrame::control(session.id, session.next_sequence(), tag, flags);
        self.send_frame(&frame).await
    }

    fn session_opened<C>(&self, session: &Session<C>) {
        self.stats.record_session_opened();
        let mut event = AuditEvent::new(AuditAction::SessionOpened)
            .with_session(session.id)
            .with_protocol(session.protocol);
        if let Some(peer) = session.peer {
            event = event.with_peer(peer);
        }
        self.audit.record(event);
    }
}

/// Receive-loop handle to the task that owns a session's socket
#[derive(Debug, Clone)]
pub struct Downstream {
    frames: mpsc::Sender<SecureFrame>,
}

impl Downstream {
    pub fn channel() -> (Self, mpsc::Receiver<SecureFrame>) {
        let (tx, rx) = mpsc::channel(FRAME_QUEUE);
        (Self { frames: tx }, rx)
    }

    /// Queue `frame` for the session task without waiting.
    pub fn deliver(&self, frame: SecureFrame) -> Delivery {
        match self.frames.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Gone,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The session task is not keeping up
    Full,
    /// The session task has finished
    Gone,
}

/// Hand `frame` to its session. A session whose queue is full is pulled
/// from dispatch and cancelled; its task then closes it with the peer.
pub(crate) fn queue_frame(
    registry: &SessionManager<Downstream>,
    session: &Arc<Session<Downstream>>,
    frame: SecureFrame,
) {
    match session.connection().deliver(frame) {
        Delivery::Queued => {}
        Delivery::Gone => debug!(session = %session.id.short(), "frame for finished session dropped"),
        Delivery::Full => {
            warn!(
                session = %session.id.short(),
                protocol = %session.protocol,
                queued = FRAME_QUEUE,
                "session stalled, closing it"
            );
            registry.remove_session(session);
            session.cancel_token().cancel();
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closed {
    DownstreamEof,
    DownstreamError(String),
    PeerClosed,
    Dropped(String),
    BackendUnavailable(String),
    Cancelled,
}

impl Closed {
    fn notify_peer(&self) -> bool {
        !matches!(self, Closed::PeerClosed)
    }
}

impl std::fmt::Display for Closed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Closed::DownstreamEof => write!(f, "downstream closed"),
            Closed::DownstreamError(e) => write!(f, "downstream error: {}", e),
            Closed::PeerClosed => write!(f, "closed by peer"),
            Closed::Dropped(reason) => write!(f, "dropped: {}", reason),
            Closed::BackendUnavailable(e) => write!(f, "backend unavailable: {}", e),
            Closed::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Socket,
    Link,
}

pub(crate) fn track_sequence<C>(ctx: &ProxyContext, session: &Session<C>, sequence: u64) {
    match session.observe_sequence(sequence) {
        SequenceStatus::First | SequenceStatus::InOrder => {}
        SequenceStatus::Gap { expected, received } => {
            ctx.stats.record_sequence_anomaly();
            debug!(session = %session.id.short(), expected, received, "sequence gap");
        }
        SequenceStatus::Regressed { last, received } => {
            ctx.stats.record_sequence_anomaly();
            debug!(session = %session.id.short(), last, received, "sequence regressed");
        }
    }
}

pub(crate) async fn connect_backend(ctx: &ProxyContext, cancel: &CancellationToken, backend: &str) -> Result<TcpStream> {
    ctx.retry
        .execute_with_cancel("backend connect", cancel, move || async move {
            with_timeout(CONNECT_TIMEOUT, "backend connect", async {
                TcpStream::connect(backend)
                    .await
                    .map_err(|e| Error::Transport(format!("connecting to {}: {}", backend, e)))
            })
            .await
        })
        .await
}

async fn write_downstream(
    writer: &mut OwnedWriteHalf,
    bytes: &[u8],
    cancel: &CancellationToken,
) -> Result<()> {
    let write = with_timeout(WRITE_TIMEOUT, "downstream write", async {
        writer.write_all(bytes).await?;
        Ok(())
    });
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        written = write => written,
    }
}

/// Tell the peer, unregister, and audit a finished session.
pub(crate) async fn finish_session(
    ctx: &ProxyContext,
    registry: &SessionManager<Downstream>,
    session: &Arc<Session<Downstream>>,
    close_tag: ProtocolTag,
    reason: Closed,
) {
    let superseded = registry
        .get(&session.id)
        .map_or(false, |current| !Arc::ptr_eq(&current, session));

    if reason.notify_peer() && !superseded && !ctx.cancel.is_cancelled() {
        if let Err(e) = ctx.send_control(session, close_tag, FrameFlags::close()).await {
            debug!(session = %session.id.short(), error = %e, "close frame not sent");
        }
    }

    registry.remove_session(session);
    session.cancel_token().cancel();
    ctx.stats.record_session_closed();

    info!(
        session = %session.id.short(),
        protocol = %session.protocol,
        duration_ms = session.created_at.elapsed().as_millis() as u64,
        "session closed: {}",
        reason
    );
    ctx.audit.record(
        AuditEvent::new(AuditAction::SessionClosed)
            .with_session(session.id)
            .with_protocol(session.protocol)
            .with_detail(reason.to_string()),
    );
}

/// Pumps one session: downstream socket on one end, link frames on the other.
pub(crate) struct Relay<'a> {
    ctx: &'a ProxyContext,
    session: &'a Session<Downstream>,
    codec: Box<dyn ProtocolCodec>,
    passive: Option<&'a Arc<FtpDataPlane>>,
    /// Registry of the control session kept alive by this data channel
    control: Option<&'a SessionManager<Downstream>>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl<'a> Relay<'a> {
    pub(crate) fn new(
        ctx: &'a ProxyContext,
        session: &'a Session<Downstream>,
        codec: Box<dyn ProtocolCodec>,
        stream: &TcpStream,
    ) -> Result<Self> {
        Ok(Self {
            ctx,
            session,
            codec,
            passive: None,
            control: None,
            local: stream.local_addr()?,
            peer: stream.peer_addr()?,
        })
    }

    pub(crate) fn with_passive(mut self, plane: Option<&'a Arc<FtpDataPlane>>) -> Self {
        self.passive = plane;
        self
    }

    /// Count traffic on this channel as activity of the same-id session
    /// in `registry`.
    pub(crate) fn keeping_alive(mut self, registry: &'a SessionManager<Downstream>) -> Self {
        self.control = Some(registry);
        self
    }

    fn touch(&self) {
        self.session.touch();
        if let Some(control) = self.control.and_then(|registry| registry.get(&self.session.id)) {
            control.touch();
        }
    }

    pub(crate) async fn run(mut self, stream: TcpStream, mut frames: mpsc::Receiver<SecureFrame>) -> Closed {
        let (mut reader, mut writer) = stream.into_split();
        let mut buf = vec![0u8; READ_BUFFER];
        let cancel = self.session.cancel_token().clone();

        let reason = loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => break Closed::Cancelled,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break Closed::DownstreamEof,
                    Ok(n) => {
                        self.touch();
                        self.process(Origin::Socket, &buf[..n], &mut writer).await
                    }
                    Err(e) => break Closed::DownstreamError(e.to_string()),
                },
                frame = frames.recv() => match frame {
                    None => break Closed::Cancelled,
                    Some(frame) if frame.flags.close => break Closed::PeerClosed,
                    Some(frame) if frame.flags.open => Ok(None),
                    Some(frame) => {
                        self.touch();
                        self.process(Origin::Link, &frame.payload, &mut writer).await
                    }
                },
            };
            match step {
                Ok(None) => {}
                Ok(Some(reason)) => break reason,
                Err(Error::Cancelled) => break Closed::Cancelled,
                Err(e) => break Closed::DownstreamError(e.to_string()),
            }
        };

        if let Err(e) = writer.shutdown().await {
            trace!(session = %self.session.id.short(), error = %e, "downstream shutdown");
        }
        reason
    }

    async fn process(&mut self, origin: Origin, bytes: &[u8], writer: &mut OwnedWriteHalf) -> Result<Option<Closed>> {
        let directives = {
            let cx = self.ctx.codec_context(self.session.id, self.session.protocol);
            // Client-to-backend bytes come from the socket on side A and
            // from the link on side B.
            match (self.ctx.side, origin) {
                (Side::Client, Origin::Socket) | (Side::Backend, Origin::Link) => self.codec.on_request(&cx, bytes),
                (Side::Client, Origin::Link) | (Side::Backend, Origin::Socket) => {
                    self.codec.on_response(&cx, bytes)
                }
            }
        };
        self.apply(origin, directives, writer).await
    }

    async fn apply(
        &mut self,
        origin: Origin,
        directives: Vec<Directive>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<Option<Closed>> {
        let session = self.session;
        let cancel = session.cancel_token();
        for directive in directives {
            match (directive, origin) {
                (Directive::Forward { tag, bytes }, Origin::Socket) => {
                    self.ctx.send_payload(self.session, tag, &bytes).await?
                }
                (Directive::Forward { bytes, .. }, Origin::Link) => write_downstream(writer, &bytes, cancel).await?,
                (Directive::Reply(bytes), Origin::Socket) => write_downstream(writer, &bytes, cancel).await?,
                (Directive::Reply(bytes), Origin::Link) => {
                    let tag = self.codec.reply_tag();
                    self.ctx.send_payload(self.session, tag, &bytes).await?
                }
                (Directive::PassiveData { backend }, _) => self.passive_announced(backend, writer).await?,
                (Directive::Drop(reason), _) => return Ok(Some(Closed::Dropped(reason))),
            }
        }
        Ok(None)
    }

    async fn passive_announced(&mut self, endpoint: PassiveEndpoint, writer: &mut OwnedWriteHalf) -> Result<()> {
        let Some(plane) = self.passive else {
            warn!(session = %self.session.id.short(), "passive reply outside an FTP control session");
            return Ok(());
        };
        match self.ctx.side {
            Side::Client => {
                let listener = plane.open_listener(
                    self.session.id,
                    self.session.cancel_token().clone(),
                    self.local.ip(),
                    self.peer.ip(),
                );
                let reply = match listener.await {
                    Ok(advertised) => ftp::passive_reply(&endpoint, advertised),
                    Err(e) => {
                        warn!(session = %self.session.id.short(), error = %e, "cannot open data listener");
                        None
                    }
                };
                let reply = reply.unwrap_or_else(|| ftp::REPLY_CANT_OPEN_DATA.to_vec());
                write_downstream(writer, &reply, self.session.cancel_token()).await
            }
            Side::Backend => {
                plane.record_passive(self.session.id, endpoint.resolve(self.peer.ip()));
                Ok(())
            }
        }
    }
}

/// One protocol's proxy on one side of the bridge
pub struct ProxyEngine {
    family: ProtocolFamily,
    ctx: Arc<ProxyContext>,
    sessions: Arc<SessionManager<Downstream>>,
    backend: Option<String>,
    ftp_data: Option<Arc<FtpDataPlane>>,
}

impl ProxyEngine {
    pub fn new(
        family: ProtocolFamily,
        ctx: Arc<ProxyContext>,
        backend: Option<String>,
        ftp_data: Option<Arc<FtpDataPlane>>,
    ) -> Arc<Self> {
        let name = match family {
            ProtocolFamily::Ftp => "ftp",
            ProtocolFamily::Sftp => "sftp",
            ProtocolFamily::Postgres => "postgres",
        };
        // FTP control sessions live in the data plane's registry so data
        // channels can keep them alive.
        let sessions = match &ftp_data {
            Some(plane) => Arc::clone(plane.control()),
            None => Arc::new(SessionManager::new(name, ctx.cancel.clone())),
        };
        Arc::new(Self {
            family,
            ctx,
            sessions,
            backend,
            ftp_data,
        })
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    pub fn sessions(&self) -> &Arc<SessionManager<Downstream>> {
        &self.sessions
    }

    /// Side A accept loop. Stops accepting once `stop` fires; sessions
    /// already running are left to finish.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, stop: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!("{} proxy listening on {}", self.family, addr),
            Err(e) => warn!("{} proxy listener has no local address: {}", self.family, e),
        }

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept_client(stream, peer),
                    Err(e) => {
                        warn!("{} accept failed: {}", self.family, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!("{} listener stopped", self.family);
    }

    fn accept_client(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (downstream, frames) = Downstream::channel();
        let session = match self
            .sessions
            .register(SessionId::generate(), self.family, Some(peer), downstream)
        {
            Ok(session) => session,
            Err(e) => {
                warn!("{} connection from {} refused: {}", self.family, peer, e);
                return;
            }
        };
        debug!(session = %session.id.short(), %peer, protocol = %self.family, "client accepted");
        self.ctx.session_opened(&session);

        let engine = Arc::clone(self);
        self.ctx.tracker.spawn(async move {
            let reason = engine.run_client(&session, stream, frames).await;
            engine.finish(&session, reason).await;
        });
    }

    async fn run_client(
        &self,
        session: &Arc<Session<Downstream>>,
        stream: TcpStream,
        frames: mpsc::Receiver<SecureFrame>,
    ) -> Closed {
        let relay = match Relay::new(&self.ctx, session, codec_for(self.family, Side::Client), &stream) {
            Ok(relay) => relay.with_passive(self.ftp_data.as_ref()),
            Err(e) => return Closed::DownstreamError(e.to_string()),
        };
        // The backend may speak first (FTP greeting), so side B connects
        // as soon as the session exists rather than on the first payload.
        if let Err(e) = self
            .ctx
            .send_control(session, self.family.control_tag(), FrameFlags::open())
            .await
        {
            return Closed::DownstreamError(e.to_string());
        }
        relay.run(stream, frames).await
    }

    /// Close a session and any data channel state it owns.
    async fn finish(&self, session: &Arc<Session<Downstream>>, reason: Closed) {
        finish_session(&self.ctx, &self.sessions, session, self.family.control_tag(), reason).await;
        if let Some(plane) = &self.ftp_data {
            plane.forget(&session.id);
        }
    }

    /// Route an inbound frame to its session, creating it on side B.
    pub fn deliver(self: &Arc<Self>, frame: SecureFrame) {
        if let Some(session) = self.sessions.get(&frame.session_id) {
            track_sequence(&self.ctx, &session, frame.sequence);
            queue_frame(&self.sessions, &session, frame);
            return;
        }

        match self.ctx.side {
            Side::Client => {
                debug!(session = %frame.session_id.short(), "frame for unknown session dropped");
            }
            Side::Backend if frame.flags.close => {
                trace!(session = %frame.session_id.short(), "close for unknown session ignored");
            }
            Side::Backend if self.sessions.is_retired(&frame.session_id) => {
                debug!(session = %frame.session_id.short(), "late frame for closed session dropped");
            }
            Side::Backend => self.open_backend(frame),
        }
    }

    fn open_backend(self: &Arc<Self>, first: SecureFrame) {
        let Some(backend) = self.backend.clone() else {
            warn!("{} frame received but no backend is configured", self.family);
            return;
        };
        let (downstream, frames) = Downstream::channel();
        let session = match self.sessions.register(first.session_id, self.family, None, downstream) {
            Ok(session) => session,
            Err(e) => {
                warn!("{} session not created: {}", self.family, e);
                return;
            }
        };
        track_sequence(&self.ctx, &session, first.sequence);
        queue_frame(&self.sessions, &session, first);
        self.ctx.session_opened(&session);

        let engine = Arc::clone(self);
        self.ctx.tracker.spawn(async move {
            let reason = engine.run_backend(&session, &backend, frames).await;
            engine.finish(&session, reason).await;
        });
    }

    async fn run_backend(
        &self,
        session: &Arc<Session<Downstream>>,
        backend: &str,
        frames: mpsc::Receiver<SecureFrame>,
    ) -> Closed {
        let codec = codec_for(self.family, Side::Backend);

        let stream = match connect_backend(&self.ctx, session.cancel_token(), backend).await {
            Ok(stream) => stream,
            Err(Error::Cancelled) => return Closed::Cancelled,
            Err(e) => {
                warn!(session = %session.id.short(), "{} backend {} unavailable: {}", self.family, backend, e);
                self.ctx.audit.record(
                    AuditEvent::new(AuditAction::BackendUnavailable)
                        .with_session(session.id)
                        .with_protocol(self.family)
                        .with_peer(backend)
                        .with_detail(e.to_string()),
                );
                if let Some(reply) = codec.backend_unavailable() {
                    if let Err(e) = self.ctx.send_payload(session, codec.reply_tag(), &reply).await {
                        debug!(session = %session.id.short(), error = %e, "backend error reply not sent");
                    }
                }
                return Closed::BackendUnavailable(e.to_string());
            }
        };
        debug!(session = %session.id.short(), backend, "backend connected");

        match Relay::new(&self.ctx, session, codec, &stream) {
            Ok(relay) => relay.with_passive(self.ftp_data.as_ref()).run(stream, frames).await,
            Err(e) => Closed::DownstreamError(e.to_string()),
        }
    }

    pub fn spawn_sweeper(&self, timeout: Duration) {
        self.sessions
            .spawn_sweeper(&self.ctx.tracker, timeout, self.ctx.cancel.clone());
    }
}

/// Frame routing table for the receive loop
pub struct Router {
    engines: HashMap<ProtocolFamily, Arc<ProxyEngine>>,
    ftp_data: Option<Arc<FtpDataPlane>>,
}

impl Router {
    pub fn new(engines: Vec<Arc<ProxyEngine>>, ftp_data: Option<Arc<FtpDataPlane>>) -> Self {
        Self {
            engines: engines.into_iter().map(|e| (e.family(), e)).collect(),
            ftp_data,
        }
    }

    pub fn engine(&self, family: ProtocolFamily) -> Option<&Arc<ProxyEngine>> {
        self.engines.get(&family)
    }

    pub fn engines(&self) -> impl Iterator<Item = &Arc<ProxyEngine>> {
        self.engines.values()
    }

    pub fn ftp_data(&self) -> Option<&Arc<FtpDataPlane>> {
        self.ftp_data.as_ref()
    }

    pub fn active_sessions(&self) -> usize {
        let control: usize = self.engines.values().map(|e| e.sessions().len()).sum();
        control + self.ftp_data.as_ref().map_or(0, |plane| plane.channels().len())
    }

    pub async fn dispatch(&self, frame: SecureFrame) {
        if frame.protocol.is_data_channel() {
            match &self.ftp_data {
                Some(plane) => plane.deliver(frame).await,
                None => debug!("FTP data frame without an FTP proxy dropped"),
            }
            return;
        }
        match self.engines.get(&frame.protocol.family()) {
            Some(engine) => engine.deliver(frame),
            None => debug!(protocol = ?frame.protocol, "frame for unconfigured protocol dropped"),
        }
    }

    pub fn shutdown_all(&self) {
        for engine in self.engines.values() {
            engine.sessions().shutdown_all();
        }
        if let Some(plane) = &self.ftp_data {
            plane.channels().shutdown_all();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::transport::MemoryLink;

    /// Proxy context over one end of an in-memory link. The other end is
    /// returned to observe what the proxy sends.
    pub(crate) fn context(side: Side) -> (Arc<ProxyContext>, MemoryLink) {
        let (near, far) = MemoryLink::pair();
        let ctx = Arc::new(ProxyContext {
            side,
            engine: Arc::new(CryptoEngine::from_key(&[9u8; 32]).unwrap()),
            link: Arc::new(near),
            inspector: Arc::new(Inspector::with_defaults().unwrap()),
            retry: RetryPolicy::new(1, Duration::from_millis(10), Duration::from_millis(10)),
            audit: AuditLogger::new("test"),
            stats: Arc::new(BridgeStats::default()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });
        (ctx, far)
    }

    /// Codec context backed by default policies
    pub(crate) struct Harness {
        pub inspector: Inspector,
        pub audit: AuditLogger,
        pub stats: BridgeStats,
        pub session: SessionId,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            Self {
                inspector: Inspector::with_defaults().unwrap(),
                audit: AuditLogger::new("test"),
                stats: BridgeStats::default(),
                session: SessionId::generate(),
            }
        }

        pub(crate) fn cx(&self, family: ProtocolFamily) -> CodecContext<'_> {
            CodecContext {
                session: self.session,
                family,
                inspector: &self.inspector,
                audit: &self.audit,
                stats: &self.stats,
            }
        }
    }

    /// Concatenated bytes of every forward directive
    pub(crate) fn forwarded(directives: &[Directive]) -> Vec<u8> {
        directives
            .iter()
            .filter_map(|d| match d {
                Directive::Forward { bytes, .. } => Some(bytes.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::signature::EICAR;

    #[test]
    fn test_push_forward_merges_same_tag() {
        let mut out = Vec::new();
        push_forward(&mut out, ProtocolTag::FtpControl, b"USER a\r\n");
        push_forward(&mut out, ProtocolTag::FtpControl, b"PASS b\r\n");
        out.push(Directive::Reply(b"550\r\n".to_vec()));
        push_forward(&mut out, ProtocolTag::FtpControl, b"LIST\r\n");

        assert_eq!(out.len(), 3);
        assert_eq!(
            out[0],
            Directive::Forward {
                tag: ProtocolTag::FtpControl,
                bytes: b"USER a\r\nPASS b\r\n".to_vec()
            }
        );
    }

    #[test]
    fn test_scan_window_catches_split_signature() {
        let inspector = Inspector::with_defaults().unwrap();
        let mut window = ScanWindow::new("test");
        let (head, tail) = EICAR.split_at(30);

        assert!(window.check(&inspector, head).is_accepted());
        assert!(!window.check(&inspector, tail).is_accepted());
    }

    #[test]
    fn test_scan_window_tail_is_bounded() {
        let inspector = Inspector::with_defaults().unwrap();
        let mut window = ScanWindow::new("test");
        for _ in 0..10 {
            assert!(window.check(&inspector, &[b'a'; 4096]).is_accepted());
        }
        assert_eq!(window.tail.len(), inspector.max_pattern_len() - 1);
    }

    fn noop(id: SessionId) -> SecureFrame {
        SecureFrame::new(id, 0, ProtocolTag::FtpControl, b"NOOP\r\n".to_vec())
    }

    #[test]
    fn test_full_queue_closes_only_that_session() {
        let registry = SessionManager::new("test", CancellationToken::new());
        let (stalled_tx, _stalled_rx) = Downstream::channel();
        let (live_tx, mut live_rx) = Downstream::channel();
        let stalled = registry
            .register(SessionId::generate(), ProtocolFamily::Ftp, None, stalled_tx)
            .unwrap();
        let live = registry
            .register(SessionId::generate(), ProtocolFamily::Postgres, None, live_tx)
            .unwrap();

        for _ in 0..FRAME_QUEUE {
            queue_frame(&registry, &stalled, noop(stalled.id));
        }
        assert!(!stalled.is_cancelled());

        queue_frame(&registry, &stalled, noop(stalled.id));
        assert!(stalled.is_cancelled());
        assert!(registry.is_retired(&stalled.id));

        queue_frame(&registry, &live, noop(live.id));
        assert_eq!(live_rx.try_recv().unwrap().session_id, live.id);
        assert!(registry.contains(&live.id));
        assert!(!live.is_cancelled());
    }

    #[test]
    fn test_delivery_to_finished_task() {
        let (downstream, frames) = Downstream::channel();
        assert_eq!(downstream.deliver(noop(SessionId::generate())), Delivery::Queued);
        drop(frames);
        assert_eq!(downstream.deliver(noop(SessionId::generate())), Delivery::Gone);
    }

    #[tokio::test]
    async fn test_blocked_write_gives_way_to_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        // The accepted end is never read, so the writer eventually blocks.
        let (_unread, _) = listener.accept().await.unwrap();
        let (_reader, mut writer) = client.into_split();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let chunk = vec![0u8; 1 << 20];
        let err = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Err(e) = write_downstream(&mut writer, &chunk, &cancel).await {
                    break e;
                }
            }
        })
        .await
        .expect("write never gave way");
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_closed_notifies_peer() {
        assert!(Closed::DownstreamEof.notify_peer());
        assert!(Closed::Cancelled.notify_peer());
        assert!(!Closed::PeerClosed.notify_peer());
    }
}
