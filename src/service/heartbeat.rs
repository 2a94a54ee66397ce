// Copyright 2025 the servlink authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use crate::codec::Message;
use crate::service::Shutdown;
use crate::session::SessionManager;
use crate::utils::now_millis;

/// Which end of the link this service guards. Client links actively send
/// the probe packet; the server side only watches for silence.
pub(crate) enum HeartbeatRole {
    Server,
    Client { probe: Message },
}

/// Liveness bookkeeping for one session. Any inbound traffic counts as an
/// acknowledgment and clears the missed count.
#[derive(Debug, Default)]
struct HeartbeatState {
    last_sent_ms: u64,
    last_ack_ms: u64,
    missed_count: u32,
}

/// Periodic liveness probe over every session in `manager`.
///
/// A link with no inbound activity for `missed_limit` whole intervals is
/// declared dead and asked to close; on the client the subsequent teardown
/// wakes the reconnect service. Sessions that close for any other reason
/// just disappear from the registry and the per-session state is dropped,
/// so a stale entry can never act on a new session.
pub(crate) fn spawn_heartbeat(
    manager: Arc<SessionManager>,
    interval: Duration,
    missed_limit: u32,
    role: HeartbeatRole,
    mut shutdown: Shutdown,
) {
    let interval_ms = interval.as_millis() as u64;
    tokio::spawn(async move {
        debug!("heartbeat service started, interval {} ms", interval_ms);
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut states: HashMap<u64, HeartbeatState> = HashMap::new();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }
            states.retain(|id, _| manager.contains(*id));
            let now = now_millis();
            for handle in manager.session_handles() {
                if !handle.is_open() {
                    // closed elsewhere; this tick is a no-op for it
                    continue;
                }
                let state = states.entry(handle.id()).or_default();
                let last_ack = handle.last_activity_ms();
                if last_ack > state.last_ack_ms {
                    state.last_ack_ms = last_ack;
                    state.missed_count = 0;
                } else if state.last_sent_ms > 0 {
                    state.missed_count += 1;
                }

                if now.saturating_sub(last_ack) > interval_ms.saturating_mul(missed_limit as u64)
                {
                    warn!(
                        session_id = handle.id(),
                        missed = state.missed_count,
                        "link declared dead, no acknowledgment for {} ms",
                        now.saturating_sub(last_ack)
                    );
                    states.remove(&handle.id());
                    manager.unregister(handle.id());
                    handle.request_close();
                    continue;
                }

                if let HeartbeatRole::Client { probe } = &role {
                    match handle.send(probe) {
                        Ok(()) => state.last_sent_ms = now,
                        Err(err) => {
                            debug!(
                                session_id = handle.id(),
                                "heartbeat probe not sent: {}", err
                            );
                        }
                    }
                }
            }
        }
        debug!("heartbeat service exited");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ShutdownNotifier;
    use crate::session::session::test_support::channel_session;
    use crate::utils::test_util::wait_until;

    #[tokio::test]
    async fn silent_link_is_declared_dead() {
        let manager = SessionManager::new();
        let (session, mut outbound_rx) = channel_session(16);
        manager.register(session.clone());

        let shutdown = ShutdownNotifier::new();
        spawn_heartbeat(
            manager.clone(),
            Duration::from_millis(100),
            2,
            HeartbeatRole::Client {
                probe: Message::from_text("0"),
            },
            shutdown.watcher(),
        );

        // probes flow while the link is considered alive
        assert!(outbound_rx.recv().await.is_some());

        // the peer never answers, so the link dies within a few intervals
        assert!(
            wait_until(|| !manager.contains(session.id()), Duration::from_secs(5)).await
        );
        shutdown.shutdown();
    }

    #[tokio::test]
    async fn inbound_activity_keeps_the_link_alive() {
        let manager = SessionManager::new();
        let (session, _outbound_rx) = channel_session(16);
        manager.register(session.clone());

        let shutdown = ShutdownNotifier::new();
        spawn_heartbeat(
            manager.clone(),
            Duration::from_millis(200),
            3,
            HeartbeatRole::Server,
            shutdown.watcher(),
        );

        for _ in 0..10 {
            session.touch();
            time::sleep(Duration::from_millis(100)).await;
        }
        assert!(manager.contains(session.id()));
        shutdown.shutdown();
    }
}
