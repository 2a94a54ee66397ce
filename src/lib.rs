mod codec;
mod network;
mod service;
mod session;
mod utils;

pub use codec::{Codec, LengthFieldCodec, LineCodec, Message};
pub use network::Connection;
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Client, ClientConfig, LinkConfig,
    LogGuard, Server, ServerConfig, Shutdown, ShutdownNotifier,
};
pub use session::{NoopListener, SessionHandle, SessionListener, SessionManager, SessionState};
pub use utils::{
    DispatchPool, DispatchPoolConfig, LogSpeedListener, PoolHandler, SpeedListener, Speedometer,
};
