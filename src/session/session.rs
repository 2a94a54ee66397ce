use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::codec::{Codec, Message};
use crate::service::ShutdownNotifier;
use crate::utils::now_millis;
use crate::{AppError, AppResult};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle of a session. Transitions are strictly forward; a state is
/// never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> SessionState {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// One live connection's identity and outbound path.
///
/// The inbound buffer lives in the connection's reader task and never
/// crosses a task boundary; the session only carries what the registry,
/// the periodic services, and application callbacks need to see.
pub struct Session {
    id: u64,
    remote_addr: SocketAddr,
    state: AtomicU8,
    /// unix millis of the last inbound activity
    last_activity_ms: AtomicU64,
    outbound: mpsc::Sender<Bytes>,
    codec: Arc<dyn Codec>,
    closer: ShutdownNotifier,
}

/// Cheap clonable handle exposing identity and send capability without the
/// raw socket. This is the value handed to application callbacks.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<Session>,
}

impl SessionHandle {
    pub(crate) fn new(
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Bytes>,
        codec: Arc<dyn Codec>,
        closer: ShutdownNotifier,
    ) -> SessionHandle {
        SessionHandle {
            inner: Arc::new(Session {
                id: next_session_id(),
                remote_addr,
                state: AtomicU8::new(SessionState::Connecting as u8),
                last_activity_ms: AtomicU64::new(now_millis()),
                outbound,
                codec,
                closer,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn last_activity_ms(&self) -> u64 {
        self.inner.last_activity_ms.load(Ordering::Relaxed)
    }

    /// Refreshes the activity timestamp. Called by the reader on every
    /// inbound frame; periodic services treat it as proof of liveness.
    pub fn touch(&self) {
        self.inner
            .last_activity_ms
            .store(now_millis(), Ordering::Relaxed);
    }

    /// Encodes and queues a message for the writer task.
    pub fn send(&self, message: &Message) -> AppResult<()> {
        match self.inner.codec.encode(message)? {
            Some(frame) => self.send_bytes(frame),
            None => Ok(()),
        }
    }

    /// Queues an already-framed payload. Rejects instead of blocking when
    /// the outbound queue is full so callers see capacity pressure.
    pub fn send_bytes(&self, frame: Bytes) -> AppResult<()> {
        if self.state() >= SessionState::Closing {
            return Err(AppError::SessionClosed(self.id()));
        }
        self.inner.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => AppError::QueueFull(self.id()),
            TrySendError::Closed(_) => AppError::SessionClosed(self.id()),
        })
    }

    /// Moves the state machine forward. Returns false when the session is
    /// already at or past `next`, which makes close-path callbacks fire
    /// exactly once no matter who races to trigger them.
    pub(crate) fn advance_state(&self, next: SessionState) -> bool {
        let mut current = self.inner.state.load(Ordering::Acquire);
        loop {
            if current >= next as u8 {
                return false;
            }
            match self.inner.state.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Asks the owning connection tasks to tear the session down. The
    /// actual state transitions and callbacks run on the reader task.
    pub fn request_close(&self) {
        self.inner.closer.shutdown();
    }

    pub(crate) fn closer(&self) -> &ShutdownNotifier {
        &self.inner.closer
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id())
            .field("remote", &self.remote_addr())
            .field("state", &self.state())
            .finish()
    }
}
