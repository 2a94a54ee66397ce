use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, Message};
use crate::network::Connection;
use crate::service::heartbeat::{spawn_heartbeat, HeartbeatRole};
use crate::service::{ServerConfig, Shutdown, ShutdownNotifier};
use crate::session::{SessionHandle, SessionListener, SessionManager, SessionState};
use crate::utils::{
    DispatchPool, DispatchPoolConfig, LogSpeedListener, PoolHandler, Speedometer,
};
use crate::{AppError, AppResult};

/// One decoded message on its way to the application callback.
pub(crate) struct MessageTask {
    pub session: SessionHandle,
    pub message: Message,
}

/// Pool handler invoking the business callback and sending the optional
/// reply. Routed by session id, so one session's messages stay in order.
#[derive(Clone)]
pub(crate) struct CallbackHandler {
    pub listener: Arc<dyn SessionListener>,
}

impl PoolHandler<MessageTask> for CallbackHandler {
    fn handle(&self, task: MessageTask) -> impl Future<Output = ()> + Send {
        let listener = self.listener.clone();
        async move {
            let MessageTask { session, message } = task;
            if let Some(reply) = listener.on_message_received(message, &session) {
                if let Err(err) = session.send(&reply) {
                    listener.on_exception_caught(&err, &session);
                }
            }
        }
    }
}

/// Everything one connection's reader and writer tasks need.
pub(crate) struct ConnectionParams {
    pub handle: SessionHandle,
    pub reader: OwnedReadHalf,
    pub writer: OwnedWriteHalf,
    pub outbound_rx: mpsc::Receiver<Bytes>,
    pub codec: Arc<dyn Codec>,
    pub buffer_size: usize,
    pub manager: Arc<SessionManager>,
    pub listener: Arc<dyn SessionListener>,
    pub pool: Arc<DispatchPool<MessageTask>>,
    /// engine-wide shutdown
    pub shutdown: Shutdown,
    /// session-scoped close signal
    pub conn_shutdown: Shutdown,
    /// client side only: poked after teardown so the reconnect service
    /// notices the dead link
    pub reconnect: Option<mpsc::Sender<()>>,
}

/// Spawns the writer and reader tasks for one established connection.
pub(crate) fn spawn_connection(params: ConnectionParams, permit: Option<OwnedSemaphorePermit>) {
    tokio::spawn(async move {
        drive_connection(params).await;
        // whether gracefully or unexpectedly closed, release the slot
        drop(permit);
    });
}

fn spawn_writer(
    handle: SessionHandle,
    writer: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    mut conn_shutdown: Shutdown,
) {
    tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        loop {
            tokio::select! {
                maybe_frame = outbound_rx.recv() => {
                    let Some(frame) = maybe_frame else { break };
                    if let Err(err) = writer.write_all(&frame).await {
                        debug!(session_id = handle.id(), "write failed: {}", err);
                        break;
                    }
                    if let Err(err) = writer.flush().await {
                        debug!(session_id = handle.id(), "flush failed: {}", err);
                        break;
                    }
                }
                _ = conn_shutdown.recv() => break,
            }
        }
        debug!(session_id = handle.id(), "writer task exited");
    });
}

/// Read loop plus teardown. Every close path funnels through here, so the
/// close callbacks fire exactly once and registry removal is atomic with
/// the state transition.
async fn drive_connection(params: ConnectionParams) {
    let ConnectionParams {
        handle,
        reader,
        writer,
        outbound_rx,
        codec,
        buffer_size,
        manager,
        listener,
        pool,
        mut shutdown,
        mut conn_shutdown,
        reconnect,
    } = params;

    spawn_writer(
        handle.clone(),
        writer,
        outbound_rx,
        handle.closer().watcher(),
    );
    let mut connection = Connection::new(reader, codec, buffer_size);
    loop {
        let result = tokio::select! {
            res = connection.read_message() => Some(res),
            _ = shutdown.recv() => None,
            _ = conn_shutdown.recv() => None,
        };
        match result {
            None => break,
            Some(Ok(Some(message))) => {
                handle.touch();
                manager.speed_touch();
                let task = MessageTask {
                    session: handle.clone(),
                    message,
                };
                if let Err(err) = pool.dispatch(task, handle.id()).await {
                    listener.on_exception_caught(&err, &handle);
                    break;
                }
            }
            // peer closed gracefully
            Some(Ok(None)) => break,
            Some(Err(err)) if err.is_framing() => {
                listener.on_exception_caught(&err, &handle);
                if connection.framing_strikes() > 1 {
                    warn!(
                        session_id = handle.id(),
                        "closing session after repeated framing errors"
                    );
                    break;
                }
            }
            Some(Err(err)) => {
                listener.on_exception_caught(&err, &handle);
                break;
            }
        }
    }

    if handle.advance_state(SessionState::Closing) {
        listener.on_before_session_closed(&handle);
    }
    manager.unregister(handle.id());
    handle.advance_state(SessionState::Closed);
    // stop the writer task and anyone else holding a session watcher
    handle.closer().shutdown();
    listener.on_after_session_closed(&handle);
    debug!(session_id = handle.id(), "connection closed");

    if let Some(reconnect) = reconnect {
        let _ = reconnect.try_send(());
    }
}

/// Accepting engine: owns the listen socket, the connection limit, and the
/// per-server services (dispatch pool, idle checker, heartbeat,
/// speedometer).
pub struct Server {
    config: ServerConfig,
    codec: Arc<dyn Codec>,
    listener: Arc<dyn SessionListener>,
    manager: Arc<SessionManager>,
    shutdown: ShutdownNotifier,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        codec: Arc<dyn Codec>,
        listener: Arc<dyn SessionListener>,
        manager: Arc<SessionManager>,
        shutdown: ShutdownNotifier,
    ) -> Server {
        Server {
            config,
            codec,
            listener,
            manager,
            shutdown,
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> AppResult<()> {
        let listen_address = format!("{}:{}", self.config.host, self.config.port);
        let tcp_listener = TcpListener::bind(&listen_address).await.map_err(|err| {
            AppError::DetailedIoError(format!(
                "failed to bind {}: {}",
                listen_address, err
            ))
        })?;
        info!(
            "server [{}] listening on {}",
            self.config.server_name, listen_address
        );
        self.serve(tcp_listener).await
    }

    /// Serves on an already-bound listener. Split out so tests can use an
    /// ephemeral port.
    pub async fn serve(&self, tcp_listener: TcpListener) -> AppResult<()> {
        let pool = Arc::new(DispatchPool::new(
            &self.shutdown,
            CallbackHandler {
                listener: self.listener.clone(),
            },
            DispatchPoolConfig {
                lane_capacity: self.config.thread_queue_size,
                num_lanes: self.config.executor_count(),
                ..Default::default()
            },
        ));
        self.start_services()?;

        let limit_connections = Arc::new(Semaphore::new(self.config.max_connection));
        loop {
            let permit = limit_connections.clone().acquire_owned().await.unwrap();

            let socket = self.accept(&tcp_listener).await?;
            let remote_addr = match socket.peer_addr() {
                Ok(addr) => addr,
                Err(err) => {
                    warn!("connection vanished before registration: {}", err);
                    continue;
                }
            };
            debug!("accepted connection from {}", remote_addr);

            let (reader, writer) = socket.into_split();
            let (outbound_tx, outbound_rx) = mpsc::channel(self.config.thread_queue_size);
            let conn_closer = ShutdownNotifier::new();
            let handle =
                SessionHandle::new(remote_addr, outbound_tx, self.codec.clone(), conn_closer);
            handle.advance_state(SessionState::Open);

            self.listener.on_session_accepted(&handle);
            self.manager.register(handle.clone());
            self.listener.on_session_registered(&handle);

            spawn_connection(
                ConnectionParams {
                    conn_shutdown: handle.closer().watcher(),
                    handle,
                    reader,
                    writer,
                    outbound_rx,
                    codec: self.codec.clone(),
                    buffer_size: self.config.buffer_size,
                    manager: self.manager.clone(),
                    listener: self.listener.clone(),
                    pool: pool.clone(),
                    shutdown: self.shutdown.watcher(),
                    reconnect: None,
                },
                Some(permit),
            );
        }
    }

    fn start_services(&self) -> AppResult<()> {
        self.manager.start_idle_checker(
            Duration::from_millis(self.config.idle_timeout_ms),
            self.listener.clone(),
        );
        if self.config.keep_alive_ms > 0 {
            spawn_heartbeat(
                self.manager.clone(),
                Duration::from_millis(self.config.keep_alive_ms),
                3,
                HeartbeatRole::Server,
                self.shutdown.watcher(),
            );
        }
        let speedometer = Arc::new(
            Speedometer::new(format!("{}-inbound", self.config.server_name))?
                .interval(Duration::from_secs(5)),
        );
        let speed_listener = Arc::new(LogSpeedListener::new(self.config.server_name.clone()));
        self.manager.install_speedometer(speedometer, speed_listener);
        Ok(())
    }

    async fn accept(&self, tcp_listener: &TcpListener) -> AppResult<TcpStream> {
        let mut backoff = 1;
        loop {
            match tcp_listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIoError(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    error!("accept failed, backing off {}s: {}", backoff, err);
                }
            }
            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}
