use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::codec::Message;
use crate::session::idle::spawn_idle_checker;
use crate::session::{SessionHandle, SessionListener, SessionState};
use crate::service::ShutdownNotifier;
use crate::utils::{SpeedListener, Speedometer};
use crate::{AppError, AppResult};

/// Authoritative registry of live sessions.
///
/// Shared by the accept loop, the periodic services, and application
/// threads issuing sends, so every mutation goes through the concurrent
/// map. The registry never holds a closed session: closing and removal are
/// a single step.
pub struct SessionManager {
    sessions: DashMap<u64, SessionHandle>,
    /// stops the idle checker and speedometer owned by this registry
    services: ShutdownNotifier,
    speedometer: RwLock<Option<Arc<Speedometer>>>,
    idle_started: AtomicBool,
    closed: AtomicBool,
}

impl SessionManager {
    pub fn new() -> Arc<SessionManager> {
        Arc::new(SessionManager {
            sessions: DashMap::new(),
            services: ShutdownNotifier::new(),
            speedometer: RwLock::new(None),
            idle_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Adds a session keyed by its id. A duplicate id is a no-op, the
    /// original registration wins.
    pub fn register(&self, handle: SessionHandle) {
        self.sessions.entry(handle.id()).or_insert(handle);
    }

    /// Atomic remove-and-return.
    pub fn unregister(&self, session_id: u64) -> Option<SessionHandle> {
        self.sessions.remove(&session_id).map(|(_, handle)| handle)
    }

    pub fn contains(&self, session_id: u64) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn session(&self, session_id: u64) -> Option<SessionHandle> {
        self.sessions.get(&session_id).map(|entry| entry.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of the registered handles. Never exposes the live map.
    pub fn session_handles(&self) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Encodes and queues `message` on one session. Absent or closed
    /// sessions and full queues surface as delivery errors.
    pub fn send_to(&self, session_id: u64, message: &Message) -> AppResult<()> {
        let handle = self
            .session(session_id)
            .ok_or(AppError::SessionNotFound(session_id))?;
        handle.send(message)
    }

    /// Queues `message` on every registered session. One session's failure
    /// never aborts delivery to the rest; returns how many sends were
    /// accepted.
    pub fn broadcast(&self, message: &Message) -> usize {
        let mut delivered = 0;
        for handle in self.session_handles() {
            match handle.send(message) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        session_id = handle.id(),
                        "broadcast skipped a session: {}", err
                    );
                }
            }
        }
        delivered
    }

    /// Starts the periodic idle sweep. `idle_timeout` of zero disables it.
    pub fn start_idle_checker(
        self: &Arc<Self>,
        idle_timeout: Duration,
        listener: Arc<dyn SessionListener>,
    ) {
        if idle_timeout.is_zero() {
            return;
        }
        if self.idle_started.swap(true, Ordering::SeqCst) {
            return;
        }
        spawn_idle_checker(
            Arc::clone(self),
            listener,
            idle_timeout,
            self.services.watcher(),
        );
    }

    /// Attaches a throughput meter fed by `speed_touch`.
    pub fn install_speedometer(
        &self,
        speedometer: Arc<Speedometer>,
        listener: Arc<dyn SpeedListener>,
    ) {
        speedometer.start(listener);
        *self.speedometer.write() = Some(speedometer);
    }

    /// Counts one unit of traffic, called by readers on every decoded
    /// message.
    pub fn speed_touch(&self) {
        if let Some(speedometer) = self.speedometer.read().as_ref() {
            speedometer.touch();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes every session, releases the registry storage, and stops the
    /// periodic services owned by this registry.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("session manager closing {} sessions", self.sessions.len());
        self.services.shutdown();
        if let Some(speedometer) = self.speedometer.write().take() {
            speedometer.close();
        }
        for handle in self.session_handles() {
            handle.advance_state(SessionState::Closing);
            handle.request_close();
            handle.advance_state(SessionState::Closed);
        }
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::session::test_support::channel_session;

    #[test]
    fn count_follows_register_and_unregister() {
        let manager = SessionManager::new();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let (handle, rx) = channel_session(4);
            manager.register(handle.clone());
            handles.push((handle, rx));
        }
        assert_eq!(manager.session_count(), 5);

        let victim = handles[0].0.id();
        assert!(manager.unregister(victim).is_some());
        assert_eq!(manager.session_count(), 4);
        // removing again is a no-op
        assert!(manager.unregister(victim).is_none());
    }

    #[test]
    fn duplicate_registration_is_a_noop() {
        let manager = SessionManager::new();
        let (handle, _rx) = channel_session(4);
        manager.register(handle.clone());
        manager.register(handle.clone());
        assert_eq!(manager.session_count(), 1);
    }

    #[test]
    fn send_to_unknown_session_is_a_delivery_error() {
        let manager = SessionManager::new();
        let (handle, _rx) = channel_session(4);
        let id = handle.id();
        manager.register(handle);
        manager.unregister(id);
        assert!(matches!(
            manager.send_to(id, &Message::from_text("hi")),
            Err(AppError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn broadcast_survives_partial_failure() {
        let manager = SessionManager::new();
        let (healthy, mut healthy_rx) = channel_session(4);
        let (closed, _closed_rx) = channel_session(4);
        closed.advance_state(SessionState::Closing);
        manager.register(healthy.clone());
        manager.register(closed);

        let delivered = manager.broadcast(&Message::from_text("abc"));
        assert_eq!(delivered, 1);
        assert!(healthy_rx.recv().await.is_some());
    }

    #[test]
    fn close_empties_the_registry() {
        let manager = SessionManager::new();
        let (handle, _rx) = channel_session(4);
        manager.register(handle.clone());
        manager.close();
        assert_eq!(manager.session_count(), 0);
        assert_eq!(handle.state(), SessionState::Closed);
        assert!(manager.is_closed());
    }
}
