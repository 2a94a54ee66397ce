use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use crate::session::{SessionListener, SessionManager};
use crate::service::Shutdown;
use crate::utils::now_millis;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Periodic sweep closing sessions that have been quiet for longer than
/// `idle_timeout`. The sweep cadence is fixed and coarser than heartbeat
/// intervals; precision eviction is not the point, reclaiming dead
/// registrations is.
pub(crate) fn spawn_idle_checker(
    manager: Arc<SessionManager>,
    listener: Arc<dyn SessionListener>,
    idle_timeout: Duration,
    mut shutdown: Shutdown,
) {
    let idle_timeout_ms = idle_timeout.as_millis() as u64;
    tokio::spawn(async move {
        debug!("idle checker started, timeout {} ms", idle_timeout_ms);
        let mut ticker = time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }
            let now = now_millis();
            for handle in manager.session_handles() {
                if !handle.is_open() {
                    continue;
                }
                let quiet = now.saturating_sub(handle.last_activity_ms());
                if quiet > idle_timeout_ms {
                    info!(
                        session_id = handle.id(),
                        "evicting idle session, quiet for {} ms", quiet
                    );
                    // unregister before signalling so the next sweep and
                    // concurrent sends no longer see the session
                    manager.unregister(handle.id());
                    listener.on_session_idle_removed(&handle);
                    handle.request_close();
                }
            }
        }
        debug!("idle checker exited");
    });
}
