//! One side of the bridge: link, proxies and background tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::gauge;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditAction, AuditEvent, AuditLogger};
use crate::config::{BridgeConfig, Side};
use crate::crypto::CryptoEngine;
use crate::error::{Error, Result};
use crate::frame::{ProtocolFamily, SecureFrame};
use crate::inspect::Inspector;
use crate::proxy::{FtpDataPlane, ProxyContext, ProxyEngine, Router};
use crate::stats::{BridgeStats, StatsSnapshot};
use crate::transport::Transceiver;

/// Time given to background tasks after sessions are force-closed
const FINAL_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How often shutdown polls for drained sessions
const DRAIN_POLL: Duration = Duration::from_millis(100);

pub struct Bridge {
    config: BridgeConfig,
    ctx: Arc<ProxyContext>,
    router: Arc<Router>,
    /// Cancelled first on shutdown: listeners stop, sessions keep running
    accepting: CancellationToken,
    link_lost: Arc<AtomicBool>,
}

impl Bridge {
    /// Open the configured link and build every proxy.
    pub async fn from_config(config: BridgeConfig) -> Result<Self> {
        let engine = Arc::new(config.crypto.build_engine()?);
        let inspector = Arc::new(config.inspection.build_inspector()?);
        let link = config.link.open().await?;
        info!("{} link ready ({}, max frame {} bytes)", config.side, link.name(), link.max_frame_size());
        Ok(Self::new(config, engine, link, inspector))
    }

    /// Build from already constructed parts.
    pub fn new(
        config: BridgeConfig,
        engine: Arc<CryptoEngine>,
        link: Arc<dyn Transceiver>,
        inspector: Arc<Inspector>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let ctx = Arc::new(ProxyContext {
            side: config.side,
            engine,
            link,
            inspector,
            retry: config.retry.policy(),
            audit: AuditLogger::new(config.side.label()),
            stats: Arc::new(BridgeStats::default()),
            cancel: cancel.clone(),
            tracker: TaskTracker::new(),
        });

        let ftp_data = config
            .ftp
            .as_ref()
            .map(|ftp| FtpDataPlane::new(Arc::clone(&ctx), ftp.data_bind, ftp.advertise_ip));

        let engines = config
            .proxies()
            .into_iter()
            .map(|(family, proxy)| {
                let plane = match family {
                    ProtocolFamily::Ftp => ftp_data.clone(),
                    _ => None,
                };
                ProxyEngine::new(family, Arc::clone(&ctx), proxy.backend, plane)
            })
            .collect();

        Self {
            config,
            ctx,
            router: Arc::new(Router::new(engines, ftp_data)),
            accepting: cancel.child_token(),
            link_lost: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn side(&self) -> Side {
        self.ctx.side
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn active_sessions(&self) -> usize {
        self.router.active_sessions()
    }

    /// Token that fires when the bridge stops for any reason
    pub fn stopped(&self) -> CancellationToken {
        self.ctx.cancel.clone()
    }

    /// Bind the client-side listeners and spawn the receive loop, idle
    /// sweepers and stats reporter. Returns the bound listener addresses.
    pub async fn start(&self) -> Result<Vec<(ProtocolFamily, SocketAddr)>> {
        let mut bound = Vec::new();

        if self.ctx.side == Side::Client {
            for (family, proxy) in self.config.proxies() {
                let Some(listen) = proxy.listen else {
                    return Err(Error::Config(format!("[{}] has no listen address", family)));
                };
                let listener = TcpListener::bind(listen)
                    .await
                    .map_err(|e| Error::Transport(format!("binding {} listener on {}: {}", family, listen, e)))?;
                bound.push((family, listener.local_addr()?));

                let Some(engine) = self.router.engine(family) else {
                    continue;
                };
                self.ctx
                    .tracker
                    .spawn(Arc::clone(engine).serve(listener, self.accepting.clone()));
            }
        }

        let idle_timeout = self.config.session.idle_timeout();
        for engine in self.router.engines() {
            engine.spawn_sweeper(idle_timeout);
        }
        if let Some(plane) = self.router.ftp_data() {
            plane.spawn_sweeper(idle_timeout);
        }

        let (ctx, router, link_lost) = (Arc::clone(&self.ctx), Arc::clone(&self.router), Arc::clone(&self.link_lost));
        self.ctx.tracker.spawn(async move {
            if receive_loop(&ctx, &router).await {
                link_lost.store(true, Ordering::SeqCst);
                ctx.cancel.cancel();
            }
        });

        self.spawn_stats_reporter();

        info!(
            "{} bridge running with {} proxies",
            self.ctx.side,
            self.config.proxies().len()
        );
        Ok(bound)
    }

    /// Run until the bridge stops. Fails if the link went away.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        self.ctx.cancel.cancelled().await;
        self.shutdown().await;
        if self.link_lost() {
            return Err(Error::Transport("link receive stream ended".to_string()));
        }
        Ok(())
    }

    /// Whether the bridge stopped because the link went away
    pub fn link_lost(&self) -> bool {
        self.link_lost.load(Ordering::SeqCst)
    }

    /// Stop accepting, give open sessions the drain timeout to finish,
    /// then close whatever is left.
    pub async fn shutdown(&self) {
        info!("{} shutting down", self.ctx.side);
        self.accepting.cancel();

        let drain = self.config.session.drain_timeout();
        if tokio::time::timeout(drain, self.wait_for_sessions()).await.is_err() {
            warn!(
                "{} sessions still open after {:?}, closing them",
                self.active_sessions(),
                drain
            );
        }

        self.ctx.cancel.cancel();
        self.router.shutdown_all();
        self.ctx.tracker.close();
        if tokio::time::timeout(FINAL_JOIN_TIMEOUT, self.ctx.tracker.wait())
            .await
            .is_err()
        {
            warn!("background tasks did not stop within {:?}", FINAL_JOIN_TIMEOUT);
        }

        let stats = self.stats();
        info!(
            frames_tx = stats.frames_tx,
            frames_rx = stats.frames_rx,
            frames_rejected = stats.frames_rejected,
            sessions = stats.sessions_opened,
            "{} stopped",
            self.ctx.side
        );
    }

    async fn wait_for_sessions(&self) {
        while self.active_sessions() > 0 && !self.ctx.cancel.is_cancelled() {
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    fn spawn_stats_reporter(&self) {
        let interval = self.config.session.stats_interval();
        let (ctx, router) = (Arc::clone(&self.ctx), Arc::clone(&self.router));
        self.ctx.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let active = router.active_sessions();
                        let stats = ctx.stats.snapshot();
                        gauge!("gapbridge_active_sessions", active as f64);
                        info!(
                            active_sessions = active,
                            frames_tx = stats.frames_tx,
                            frames_rx = stats.frames_rx,
                            bytes_tx = stats.bytes_tx,
                            bytes_rx = stats.bytes_rx,
                            frames_rejected = stats.frames_rejected,
                            policy_rejections = stats.policy_rejections,
                            threats = stats.threats_detected,
                            "bridge statistics"
                        );
                    }
                }
            }
        });
    }
}

/// Drain the link into the proxies. Returns `true` if the link ended
/// before the bridge was told to stop.
async fn receive_loop(ctx: &ProxyContext, router: &Router) -> bool {
    let mut frames = ctx.link.receive_stream();
    loop {
        let raw = tokio::select! {
            _ = ctx.cancel.cancelled() => return false,
            next = frames.next() => match next {
                Some(raw) => raw,
                None => {
                    error!("link receive stream ended");
                    return true;
                }
            },
        };
        ctx.stats.record_rx(raw.len());

        match SecureFrame::deserialize(&raw, &ctx.engine) {
            Ok(frame) => router.dispatch(frame).await,
            Err(e) => reject_frame(ctx, &raw, &e),
        }
    }
}

fn reject_frame(ctx: &ProxyContext, raw: &[u8], err: &Error) {
    ctx.stats.record_frame_rejected();
    let header = SecureFrame::peek_header(raw).ok();
    if err.is_integrity() {
        warn!(bytes = raw.len(), error = %err, "frame failed authentication");
    } else {
        debug!(bytes = raw.len(), error = %err, "undecodable frame dropped");
    }

    let mut event = AuditEvent::new(AuditAction::FrameRejected).with_detail(err.to_string());
    if let Some(header) = header {
        event = event.with_session(header.session_id);
    }
    ctx.audit.record(event);
}
