pub use app_error::{AppError, AppResult};
pub use client::Client;
pub use config::{ClientConfig, LinkConfig, ServerConfig};
pub use server::Server;
pub use shutdown::{Shutdown, ShutdownNotifier};
pub use tracing_config::{setup_local_tracing, setup_tracing, LogGuard};

mod app_error;
pub(crate) mod client;
mod config;
pub(crate) mod heartbeat;
mod reconnect;
pub(crate) mod server;
mod shutdown;
mod tracing_config;
