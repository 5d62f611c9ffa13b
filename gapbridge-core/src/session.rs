//! Session registry
//!
//! Maps session ids to the downstream connection each side owns for a
//! logical client connection: the accepted client socket on side A, the
//! backend socket on side B.
//!
//! ## Session Lifecycle
//! ```text
//! (none) --register--> Active --remove / idle eviction / shutdown--> gone
//! ```
//! Ids are never reused. A removed id is retired, so a frame that arrives
//! for it later is dropped instead of opening a fresh backend connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frame::ProtocolFamily;

/// Sweep runs this many times per idle timeout.
const SWEEPS_PER_TIMEOUT: u32 = 4;

/// 128-bit session identifier carried in every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// First eight hex digits, for log lines
    pub fn short(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(8);
        s
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of comparing an inbound sequence number with the last one seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    First,
    InOrder,
    Gap { expected: u64, received: u64 },
    Regressed { last: u64, received: u64 },
}

/// One logical connection on one side of the link
pub struct Session<C> {
    pub id: SessionId,
    pub protocol: ProtocolFamily,
    pub peer: Option<SocketAddr>,
    pub created_at: Instant,
    last_activity_ms: AtomicU64,
    connection: C,
    cancel: CancellationToken,
    tx_sequence: AtomicU64,
    rx_last: Mutex<Option<u64>>,
}

impl<C> Session<C> {
    fn new(
        id: SessionId,
        protocol: ProtocolFamily,
        peer: Option<SocketAddr>,
        connection: C,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            protocol,
            peer,
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            connection,
            cancel,
            tx_sequence: AtomicU64::new(0),
            rx_last: Mutex::new(None),
        }
    }

    /// Handle to the task that owns the downstream socket
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Token cancelled when this session is evicted or the process stops
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record activity now.
    pub fn touch(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn idle_time(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last)
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.idle_time() > timeout
    }

    /// Next outbound frame sequence number for this session
    pub fn next_sequence(&self) -> u64 {
        self.tx_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Advisory check of an inbound sequence number. Never rejects.
    pub fn observe_sequence(&self, received: u64) -> SequenceStatus {
        let mut last = self.rx_last.lock();
        let status = match *last {
            None => SequenceStatus::First,
            Some(prev) if received == prev.wrapping_add(1) => SequenceStatus::InOrder,
            Some(prev) if received > prev => SequenceStatus::Gap {
                expected: prev.wrapping_add(1),
                received,
            },
            Some(prev) => SequenceStatus::Regressed { last: prev, received },
        };
        if last.map_or(true, |prev| received > prev) {
            *last = Some(received);
        }
        status
    }
}

impl<C> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("peer", &self.peer)
            .field("idle", &self.idle_time())
            .finish_non_exhaustive()
    }
}

/// Concurrent registry of live sessions
pub struct SessionManager<C> {
    name: &'static str,
    sessions: DashMap<SessionId, Arc<Session<C>>>,
    /// Ids that were removed and must not be registered again
    retired: Option<DashMap<SessionId, Instant>>,
    root: CancellationToken,
}

impl<C: Send + Sync + 'static> SessionManager<C> {
    /// `root` is the process-wide token; every session gets a child of it.
    pub fn new(name: &'static str, root: CancellationToken) -> Self {
        Self {
            name,
            sessions: DashMap::new(),
            retired: Some(DashMap::new()),
            root,
        }
    }

    /// Registry whose ids may be registered again once removed. FTP data
    /// channels use this: every transfer reuses its control session id.
    pub fn reusable(name: &'static str, root: CancellationToken) -> Self {
        Self {
            retired: None,
            ..Self::new(name, root)
        }
    }

    /// Register a new session. Duplicate and retired ids are rejected,
    /// never overwritten.
    pub fn register(
        &self,
        id: SessionId,
        protocol: ProtocolFamily,
        peer: Option<SocketAddr>,
        connection: C,
    ) -> Result<Arc<Session<C>>> {
        if self.is_retired(&id) {
            warn!(registry = self.name, session = %id, "retired session id rejected");
            return Err(Error::Session(format!("session {} already closed", id)));
        }
        match self.sessions.entry(id) {
            Entry::Occupied(_) => {
                warn!(registry = self.name, session = %id, "duplicate session id rejected");
                Err(Error::Session(format!("session {} already registered", id)))
            }
            Entry::Vacant(slot) => {
                let session = Arc::new(Session::new(
                    id,
                    protocol,
                    peer,
                    connection,
                    self.root.child_token(),
                ));
                slot.insert(session.clone());
                debug!(registry = self.name, session = %id, %protocol, "session registered");
                Ok(session)
            }
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session<C>>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// `true` once `id` has been removed from a retiring registry
    pub fn is_retired(&self, id: &SessionId) -> bool {
        self.retired.as_ref().map_or(false, |retired| retired.contains_key(id))
    }

    fn retire(&self, id: SessionId) {
        if let Some(retired) = &self.retired {
            retired.insert(id, Instant::now());
        }
    }

    /// Drop a session from dispatch. Idempotent; the caller owns teardown.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session<C>>> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            self.retire(*id);
            debug!(registry = self.name, session = %id, "session removed");
        }
        removed
    }

    /// Remove `session` only if it is still the registered entry for its id.
    /// A replacement registered under the same id is left alone.
    pub fn remove_session(&self, session: &Arc<Session<C>>) -> bool {
        let removed = self
            .sessions
            .remove_if(&session.id, |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            self.retire(session.id);
            debug!(registry = self.name, session = %session.id, "session removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Remove and cancel every session idle for longer than `timeout`.
    ///
    /// Staleness is re-checked under the shard lock, so a session touched
    /// by an in-flight send between the scan and the removal survives.
    pub fn evict_idle(&self, timeout: Duration) -> Vec<SessionId> {
        let mut evicted = Vec::new();
        for id in self.ids() {
            if let Some((_, session)) = self.sessions.remove_if(&id, |_, s| s.is_expired(timeout)) {
                self.retire(id);
                session.cancel.cancel();
                info!(
                    registry = self.name,
                    session = %id,
                    idle_secs = session.idle_time().as_secs(),
                    "idle session evicted"
                );
                evicted.push(id);
            }
        }
        evicted
    }

    /// Forget retired ids older than `age`.
    pub fn prune_retired(&self, age: Duration) {
        if let Some(retired) = &self.retired {
            retired.retain(|_, at| at.elapsed() < age);
        }
    }

    /// Cancel every session, e.g. once the shutdown drain period expires.
    pub fn shutdown_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().cancel.cancel();
        }
        self.sessions.clear();
    }

    /// Run `evict_idle` periodically until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, tracker: &TaskTracker, timeout: Duration, cancel: CancellationToken) {
        let manager = Arc::clone(self);
        let period = (timeout / SWEEPS_PER_TIMEOUT).max(Duration::from_secs(1));

        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = manager.evict_idle(timeout);
                        manager.prune_retired(timeout * 2);
                        trace!(registry = manager.name, evicted = evicted.len(), active = manager.len(), "idle sweep");
                    }
                }
            }
            debug!(registry = manager.name, "sweeper stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager<u32> {
        SessionManager::new("test", CancellationToken::new())
    }

    #[test]
    fn test_session_id_bytes() {
        let id = SessionId::generate();
        assert_eq!(SessionId::from_bytes(*id.as_bytes()), id);
        assert_eq!(id.short().len(), 8);
        assert_ne!(SessionId::generate(), id);
    }

    #[test]
    fn test_register_get_remove_isolation() {
        let manager = manager();
        let ids: Vec<SessionId> = (0..5).map(|_| SessionId::generate()).collect();
        for (i, id) in ids.iter().enumerate() {
            manager.register(*id, ProtocolFamily::Ftp, None, i as u32).unwrap();
        }
        assert_eq!(manager.len(), 5);

        assert!(manager.remove(&ids[2]).is_some());
        assert!(manager.get(&ids[2]).is_none());
        assert_eq!(manager.len(), 4);

        for (i, id) in ids.iter().enumerate().filter(|(i, _)| *i != 2) {
            let session = manager.get(id).unwrap();
            assert_eq!(session.id, *id);
            assert_eq!(*session.connection(), i as u32);
        }

        // Idempotent
        assert!(manager.remove(&ids[2]).is_none());
        assert_eq!(manager.len(), 4);
    }

    #[test]
    fn test_duplicate_register_rejected() {
        let manager = manager();
        let id = SessionId::generate();
        manager.register(id, ProtocolFamily::Postgres, None, 1).unwrap();
        assert!(matches!(
            manager.register(id, ProtocolFamily::Postgres, None, 2),
            Err(Error::Session(_))
        ));
        assert_eq!(*manager.get(&id).unwrap().connection(), 1);
    }

    #[test]
    fn test_removed_ids_never_resurrected() {
        let manager = manager();
        let id = SessionId::generate();
        manager.register(id, ProtocolFamily::Ftp, None, 1).unwrap();
        manager.remove(&id);
        assert!(manager.is_retired(&id));
        assert!(manager.register(id, ProtocolFamily::Ftp, None, 2).is_err());

        manager.prune_retired(Duration::ZERO);
        assert!(!manager.is_retired(&id));
    }

    #[test]
    fn test_reusable_registry_and_replacement() {
        let manager: SessionManager<u32> = SessionManager::reusable("data", CancellationToken::new());
        let id = SessionId::generate();
        let first = manager.register(id, ProtocolFamily::Ftp, None, 1).unwrap();
        assert!(manager.remove_session(&first));
        let second = manager.register(id, ProtocolFamily::Ftp, None, 2).unwrap();

        // A stale handle must not remove its replacement
        assert!(!manager.remove_session(&first));
        assert!(manager.get(&id).is_some());
        assert!(manager.remove_session(&second));
    }

    #[tokio::test]
    async fn test_evict_idle_only_removes_stale() {
        let manager = manager();
        let stale = SessionId::generate();
        let fresh = SessionId::generate();
        let stale_session = manager.register(stale, ProtocolFamily::Sftp, None, 0).unwrap();
        manager.register(fresh, ProtocolFamily::Sftp, None, 1).unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        manager.get(&fresh).unwrap().touch();

        let evicted = manager.evict_idle(Duration::from_millis(30));
        assert_eq!(evicted, vec![stale]);
        assert!(stale_session.is_cancelled());
        assert!(manager.get(&fresh).is_some());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_child_tokens_follow_root() {
        let root = CancellationToken::new();
        let manager: SessionManager<()> = SessionManager::new("test", root.clone());
        let session = manager.register(SessionId::generate(), ProtocolFamily::Ftp, None, ()).unwrap();
        assert!(!session.is_cancelled());
        root.cancel();
        assert!(session.is_cancelled());
    }

    #[test]
    fn test_sequence_tracking() {
        let manager = manager();
        let session = manager.register(SessionId::generate(), ProtocolFamily::Ftp, None, 0).unwrap();

        assert_eq!(session.next_sequence(), 0);
        assert_eq!(session.next_sequence(), 1);

        assert_eq!(session.observe_sequence(0), SequenceStatus::First);
        assert_eq!(session.observe_sequence(1), SequenceStatus::InOrder);
        assert_eq!(session.observe_sequence(4), SequenceStatus::Gap { expected: 2, received: 4 });
        assert_eq!(session.observe_sequence(3), SequenceStatus::Regressed { last: 4, received: 3 });
        assert_eq!(session.observe_sequence(5), SequenceStatus::InOrder);
    }
}
