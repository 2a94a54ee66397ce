pub use dispatch_pool::{DispatchPool, DispatchPoolConfig, PoolHandler};
pub use speedometer::{LogSpeedListener, SpeedListener, Speedometer};

mod dispatch_pool;
mod speedometer;

/// Milliseconds since the unix epoch; the clock behind activity timestamps.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
