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

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use crate::service::client::ClientShared;
use crate::service::Shutdown;

/// Link lifecycle as seen by the reconnect service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum LinkStatus {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl LinkStatus {
    pub(crate) fn from_u8(value: u8) -> LinkStatus {
        match value {
            2 => LinkStatus::Connected,
            1 => LinkStatus::Connecting,
            _ => LinkStatus::Disconnected,
        }
    }
}

/// Re-establishes a dropped outbound link.
///
/// Connection teardown pokes the signal channel; the service then moves
/// the link `Disconnected -> Connecting` and dials until one attempt
/// succeeds, sleeping `reconnect_interval` between attempts. The CAS into
/// `Connecting` guarantees a single in-flight attempt. Retries continue
/// indefinitely; only an explicit close of the owning client stops them.
pub(crate) fn spawn_reconnect(
    shared: Arc<ClientShared>,
    mut signal: mpsc::Receiver<()>,
    mut shutdown: Shutdown,
) {
    tokio::spawn(async move {
        debug!("reconnect service started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                received = signal.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }
            if shared.is_closed() {
                break;
            }
            if shared.is_connected() {
                // stale signal from an already-replaced link
                continue;
            }
            shared.note_link_down();
            if !shared.begin_attempt() {
                continue;
            }

            let delay = Duration::from_millis(shared.reconnect_interval_ms());
            loop {
                if shared.is_closed() {
                    shared.attempt_failed();
                    break;
                }
                time::sleep(delay).await;
                match shared.establish().await {
                    Ok(handle) => {
                        info!(session_id = handle.id(), "client link re-established");
                        shared.listener().on_client_reconnected(&handle);
                        break;
                    }
                    Err(err) => {
                        warn!("reconnect attempt failed: {}", err);
                        shared.attempt_failed();
                        if !shared.begin_attempt() {
                            break;
                        }
                    }
                }
            }
        }
        debug!("reconnect service exited");
    });
}
