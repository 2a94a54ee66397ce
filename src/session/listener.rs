use crate::codec::Message;
use crate::session::SessionHandle;
use crate::AppError;

/// Lifecycle callbacks exposed to application code. All methods default to
/// no-ops; implement only what the application cares about and wire the
/// value into `Server::new` or `Client::new`.
///
/// `on_message_received` runs on the dispatch pool, never on a connection's
/// reader task, so a slow handler only stalls its own session's callback
/// lane. The remaining callbacks are short notifications and run inline.
pub trait SessionListener: Send + Sync + 'static {
    /// A server accepted a new connection.
    fn on_session_accepted(&self, _session: &SessionHandle) {}

    /// The session was added to its registry.
    fn on_session_registered(&self, _session: &SessionHandle) {}

    /// A client link finished connecting.
    fn on_session_connected(&self, _session: &SessionHandle) {}

    fn on_before_session_closed(&self, _session: &SessionHandle) {}

    fn on_after_session_closed(&self, _session: &SessionHandle) {}

    /// A decoded message arrived. Returning `Some` sends the reply back on
    /// the same session.
    fn on_message_received(&self, _message: Message, _session: &SessionHandle) -> Option<Message> {
        None
    }

    /// A transport error was attributed to this session. Framing errors do
    /// not close the session unless they recur; I/O errors are followed by
    /// the close callbacks.
    fn on_exception_caught(&self, _error: &AppError, _session: &SessionHandle) {}

    /// The idle checker evicted this session.
    fn on_session_idle_removed(&self, _session: &SessionHandle) {}

    /// A dropped client link was re-established.
    fn on_client_reconnected(&self, _session: &SessionHandle) {}
}

/// Listener that ignores every event. Useful as a default and in tests.
pub struct NoopListener;

impl SessionListener for NoopListener {}
