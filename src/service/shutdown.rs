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

use tokio::sync::broadcast;

/// Owns a shutdown broadcast channel and hands out per-task watchers.
///
/// One notifier exists per engine (server, client, session manager) and one
/// per live connection, so a single session can be torn down without
/// disturbing its siblings.
#[derive(Debug, Clone)]
pub struct ShutdownNotifier {
    sender: broadcast::Sender<()>,
}

impl ShutdownNotifier {
    pub fn new() -> ShutdownNotifier {
        let (sender, _) = broadcast::channel(1);
        ShutdownNotifier { sender }
    }

    pub fn watcher(&self) -> Shutdown {
        Shutdown::new(self.sender.subscribe())
    }

    /// Signals every watcher. A send error only means no watcher is alive
    /// anymore, which is a legal state during teardown.
    pub fn shutdown(&self) {
        let _ = self.sender.send(());
    }
}

impl Default for ShutdownNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Cooperative shutdown flag carried by every long-lived task.
#[derive(Debug)]
pub struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    pub async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}
