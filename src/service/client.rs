use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info};

use crate::codec::{Codec, Message};
use crate::service::heartbeat::{spawn_heartbeat, HeartbeatRole};
use crate::service::reconnect::{spawn_reconnect, LinkStatus};
use crate::service::server::{spawn_connection, CallbackHandler, ConnectionParams, MessageTask};
use crate::service::{ClientConfig, ShutdownNotifier};
use crate::session::{SessionHandle, SessionListener, SessionManager, SessionState};
use crate::utils::{DispatchPool, DispatchPoolConfig};
use crate::{AppError, AppResult};

/// State shared between the client facade, its connection tasks, and the
/// reconnect and heartbeat services.
pub(crate) struct ClientShared {
    config: ClientConfig,
    codec: Arc<dyn Codec>,
    listener: Arc<dyn SessionListener>,
    manager: Arc<SessionManager>,
    pool: Arc<DispatchPool<MessageTask>>,
    link_status: AtomicU8,
    session: RwLock<Option<SessionHandle>>,
    closed: AtomicBool,
    shutdown: ShutdownNotifier,
    reconnect_tx: mpsc::Sender<()>,
}

impl ClientShared {
    pub(crate) fn status(&self) -> LinkStatus {
        LinkStatus::from_u8(self.link_status.load(Ordering::Acquire))
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.status() == LinkStatus::Connected
            && self
                .session
                .read()
                .as_ref()
                .map(|handle| handle.is_open())
                .unwrap_or(false)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn listener(&self) -> &Arc<dyn SessionListener> {
        &self.listener
    }

    pub(crate) fn reconnect_interval_ms(&self) -> u64 {
        self.config.reconnect_interval_ms
    }

    /// `Disconnected -> Connecting`; false when another attempt owns the
    /// link already.
    pub(crate) fn begin_attempt(&self) -> bool {
        self.link_status
            .compare_exchange(
                LinkStatus::Disconnected as u8,
                LinkStatus::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// `Connecting -> Disconnected` after a failed dial.
    pub(crate) fn attempt_failed(&self) {
        let _ = self.link_status.compare_exchange(
            LinkStatus::Connecting as u8,
            LinkStatus::Disconnected as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// `Connected -> Disconnected` once a dead link is observed.
    pub(crate) fn note_link_down(&self) {
        let _ = self.link_status.compare_exchange(
            LinkStatus::Connected as u8,
            LinkStatus::Disconnected as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Dials the remote end and wires up a fresh session. The caller owns
    /// the `Connecting` state; on success the link is `Connected`.
    pub(crate) async fn establish(self: &Arc<Self>) -> AppResult<SessionHandle> {
        let address = format!("{}:{}", self.config.remote_host, self.config.port);
        let stream = time::timeout(
            Duration::from_millis(self.config.connection_timeout_ms),
            TcpStream::connect(&address),
        )
        .await
        .map_err(|_| AppError::ConnectTimeout(self.config.connection_timeout_ms))??;

        let remote_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.thread_queue_size);
        let conn_closer = ShutdownNotifier::new();
        let handle = SessionHandle::new(remote_addr, outbound_tx, self.codec.clone(), conn_closer);

        self.manager.register(handle.clone());
        spawn_connection(
            ConnectionParams {
                conn_shutdown: handle.closer().watcher(),
                handle: handle.clone(),
                reader,
                writer,
                outbound_rx,
                codec: self.codec.clone(),
                buffer_size: self.config.buffer_size,
                manager: self.manager.clone(),
                listener: self.listener.clone(),
                pool: self.pool.clone(),
                shutdown: self.shutdown.watcher(),
                reconnect: Some(self.reconnect_tx.clone()),
            },
            None,
        );
        handle.advance_state(SessionState::Open);
        *self.session.write() = Some(handle.clone());
        self.link_status
            .store(LinkStatus::Connected as u8, Ordering::Release);
        info!(
            "client [{}] connected to {} as session {}",
            self.config.client_name,
            address,
            handle.id()
        );
        self.listener.on_session_connected(&handle);
        Ok(handle)
    }
}

/// Connecting engine: dials one remote endpoint, keeps the link alive with
/// heartbeats, and re-establishes it when it drops.
pub struct Client {
    shared: Arc<ClientShared>,
    /// handed to the reconnect service on first connect
    reconnect_rx: Mutex<Option<mpsc::Receiver<()>>>,
    services_started: AtomicBool,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        codec: Arc<dyn Codec>,
        listener: Arc<dyn SessionListener>,
    ) -> Client {
        let shutdown = ShutdownNotifier::new();
        let pool = Arc::new(DispatchPool::new(
            &shutdown,
            CallbackHandler {
                listener: listener.clone(),
            },
            DispatchPoolConfig {
                lane_capacity: config.thread_queue_size,
                num_lanes: config.executor_count(),
                ..Default::default()
            },
        ));
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        Client {
            shared: Arc::new(ClientShared {
                config,
                codec,
                listener,
                manager: SessionManager::new(),
                pool,
                link_status: AtomicU8::new(LinkStatus::Disconnected as u8),
                session: RwLock::new(None),
                closed: AtomicBool::new(false),
                shutdown,
                reconnect_tx,
            }),
            reconnect_rx: Mutex::new(Some(reconnect_rx)),
            services_started: AtomicBool::new(false),
        }
    }

    /// Dials the configured endpoint and starts the reconnect and
    /// heartbeat services. Connecting an already-connected client is a
    /// no-op.
    pub async fn connect(&self) -> AppResult<()> {
        if self.shared.is_closed() {
            return Err(AppError::IllegalState("client is closed".to_string()));
        }
        if self.shared.is_connected() {
            return Ok(());
        }
        if !self.shared.begin_attempt() {
            return Err(AppError::IllegalState(
                "a connect attempt is already in flight".to_string(),
            ));
        }
        match self.shared.establish().await {
            Ok(_handle) => {
                self.start_services();
                Ok(())
            }
            Err(err) => {
                self.shared.attempt_failed();
                Err(err)
            }
        }
    }

    fn start_services(&self) {
        if self.services_started.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reconnect_rx) = self.reconnect_rx.lock().take() {
            spawn_reconnect(
                self.shared.clone(),
                reconnect_rx,
                self.shared.shutdown.watcher(),
            );
        }
        if self.shared.config.keep_alive_ms > 0 {
            spawn_heartbeat(
                self.shared.manager.clone(),
                Duration::from_millis(self.shared.config.keep_alive_ms),
                self.shared.config.heartbeat_missed_limit,
                HeartbeatRole::Client {
                    probe: Message::from_text(self.shared.config.heartbeat_packet.clone()),
                },
                self.shared.shutdown.watcher(),
            );
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Current session, while the link is up.
    pub fn session(&self) -> Option<SessionHandle> {
        self.shared.session.read().clone()
    }

    /// Registry holding this client's live session.
    pub fn manager(&self) -> Arc<SessionManager> {
        self.shared.manager.clone()
    }

    /// Queues a message on the current link.
    pub fn send(&self, message: &Message) -> AppResult<()> {
        let session = self.session().ok_or(AppError::NotConnected)?;
        if !session.is_open() {
            return Err(AppError::NotConnected);
        }
        session.send(message)
    }

    /// Tears the client down. No reconnect attempt survives an explicit
    /// close.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("client [{}] closing", self.shared.config.client_name);
        self.shared.shutdown.shutdown();
        if let Some(handle) = self.shared.session.write().take() {
            handle.request_close();
        }
        self.shared.manager.close();
        self.shared
            .link_status
            .store(LinkStatus::Disconnected as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::net::TcpListener;

    use super::*;
    use crate::codec::LengthFieldCodec;
    use crate::service::server::Server;
    use crate::service::ServerConfig;
    use crate::session::NoopListener;
    use crate::utils::test_util::wait_until;

    fn length_codec() -> Arc<dyn Codec> {
        Arc::new(LengthFieldCodec::new("UTF-8", 1024).unwrap())
    }

    struct EchoListener;

    impl SessionListener for EchoListener {
        fn on_message_received(
            &self,
            message: Message,
            _session: &SessionHandle,
        ) -> Option<Message> {
            Some(message)
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        received: Mutex<Vec<String>>,
        reconnects: AtomicUsize,
        connects: AtomicUsize,
    }

    impl SessionListener for RecordingListener {
        fn on_session_connected(&self, _session: &SessionHandle) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message_received(
            &self,
            message: Message,
            _session: &SessionHandle,
        ) -> Option<Message> {
            if let Ok(text) = message.text() {
                self.received.lock().push(text.to_string());
            }
            None
        }

        fn on_client_reconnected(&self, _session: &SessionHandle) {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn start_echo_server() -> (std::net::SocketAddr, Arc<SessionManager>, ShutdownNotifier)
    {
        let manager = SessionManager::new();
        let shutdown = ShutdownNotifier::new();
        let server = Server::new(
            ServerConfig::default(),
            length_codec(),
            Arc::new(EchoListener),
            manager.clone(),
            shutdown.clone(),
        );
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.serve(tcp_listener).await;
        });
        (addr, manager, shutdown)
    }

    fn client_config(addr: std::net::SocketAddr) -> ClientConfig {
        ClientConfig {
            remote_host: addr.ip().to_string(),
            port: addr.port(),
            reconnect_interval_ms: 100,
            keep_alive_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn reconnects_after_the_server_drops_the_link() {
        let (addr, server_manager, _server_shutdown) = start_echo_server().await;

        let listener = Arc::new(RecordingListener::default());
        let client = Client::new(client_config(addr), length_codec(), listener.clone());
        client.connect().await.unwrap();
        assert!(client.is_connected());
        let first_session = client.session().unwrap().id();

        // kill the link from the server side
        assert!(
            wait_until(|| server_manager.session_count() == 1, Duration::from_secs(5)).await
        );
        for handle in server_manager.session_handles() {
            server_manager.unregister(handle.id());
            handle.request_close();
        }

        // the client notices and re-establishes within the retry interval
        assert!(
            wait_until(
                || listener.reconnects.load(Ordering::SeqCst) >= 1 && client.is_connected(),
                Duration::from_secs(5)
            )
            .await
        );
        assert_ne!(client.session().unwrap().id(), first_session);

        // traffic flows verbatim over the new link
        client.send(&Message::from_text("after-reconnect")).unwrap();
        assert!(
            wait_until(
                || listener.received.lock().contains(&"after-reconnect".to_string()),
                Duration::from_secs(5)
            )
            .await
        );
        client.close();
    }

    #[tokio::test]
    async fn heartbeat_detects_a_silent_peer_and_reconnects() {
        // accepts connections but never sends a byte back
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp_listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let accepted_counter = accepted.clone();
        tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = tcp_listener.accept().await {
                accepted_counter.fetch_add(1, Ordering::SeqCst);
                sockets.push(socket);
            }
        });

        let listener = Arc::new(RecordingListener::default());
        let config = ClientConfig {
            keep_alive_ms: 150,
            heartbeat_missed_limit: 2,
            ..client_config(addr)
        };
        let client = Client::new(config, length_codec(), listener.clone());
        client.connect().await.unwrap();

        // the silent peer is declared dead within a few intervals and a
        // fresh connection is dialed
        assert!(
            wait_until(
                || accepted.load(Ordering::SeqCst) >= 2
                    && listener.reconnects.load(Ordering::SeqCst) >= 1,
                Duration::from_secs(10)
            )
            .await
        );
        client.close();
    }

    #[tokio::test]
    async fn explicit_close_stops_reconnection() {
        let (addr, server_manager, _server_shutdown) = start_echo_server().await;

        let client = Client::new(client_config(addr), length_codec(), Arc::new(NoopListener));
        client.connect().await.unwrap();
        assert!(
            wait_until(|| server_manager.session_count() == 1, Duration::from_secs(5)).await
        );

        client.close();
        assert!(!client.is_connected());
        assert!(matches!(
            client.send(&Message::from_text("x")),
            Err(AppError::NotConnected)
        ));

        // no new link appears after an explicit close
        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(server_manager.session_count(), 0);
        assert!(client.connect().await.is_err());
    }

    #[tokio::test]
    async fn initial_connect_failure_surfaces() {
        // grab a port, then free it so the dial is refused
        let tcp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp_listener.local_addr().unwrap();
        drop(tcp_listener);

        let client = Client::new(client_config(addr), length_codec(), Arc::new(NoopListener));
        assert!(client.connect().await.is_err());
        assert!(!client.is_connected());
    }
}
