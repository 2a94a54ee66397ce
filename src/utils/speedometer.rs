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

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::info;

use crate::service::ShutdownNotifier;
use crate::{AppError, AppResult};

const MIN_INTERVAL: Duration = Duration::from_secs(1);
const MIN_WINDOW: usize = 5;
const DEFAULT_WINDOW: usize = 20;

/// Receives one sample per interval: the latest rate plus the average,
/// maximum, and minimum over the sliding window.
pub trait SpeedListener: Send + Sync + 'static {
    fn listen(&self, latest: u64, average: u64, max: u64, min: u64);
}

/// Listener that reports samples through the log.
pub struct LogSpeedListener {
    name: String,
}

impl LogSpeedListener {
    pub fn new(name: impl Into<String>) -> LogSpeedListener {
        LogSpeedListener { name: name.into() }
    }
}

impl SpeedListener for LogSpeedListener {
    fn listen(&self, latest: u64, average: u64, max: u64, min: u64) {
        info!(
            "{}: speed {}/interval, average {}, max {}, min {}",
            self.name, latest, average, max, min
        );
    }
}

/// Sliding-window throughput counter.
///
/// `touch` is called concurrently from every I/O task; the counter is a
/// single atomic. The window itself is read and mutated only by the
/// sampler task, once per interval.
pub struct Speedometer {
    name: String,
    interval: Duration,
    window_size: usize,
    touch_times: Arc<AtomicU64>,
    started: AtomicBool,
    stop: ShutdownNotifier,
}

impl Speedometer {
    pub fn new(name: impl Into<String>) -> AppResult<Speedometer> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(AppError::InvalidValue("speedometer name".to_string()));
        }
        Ok(Speedometer {
            name,
            interval: Duration::from_secs(5),
            window_size: DEFAULT_WINDOW,
            touch_times: Arc::new(AtomicU64::new(0)),
            started: AtomicBool::new(false),
            stop: ShutdownNotifier::new(),
        })
    }

    /// Sampling interval; values under one second are ignored.
    pub fn interval(mut self, interval: Duration) -> Speedometer {
        if interval >= MIN_INTERVAL {
            self.interval = interval;
        }
        self
    }

    /// Window length in samples; values under the minimum are ignored.
    pub fn window_size(mut self, window_size: usize) -> Speedometer {
        if window_size >= MIN_WINDOW {
            self.window_size = window_size;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        self.touch_times.fetch_add(1, Ordering::Relaxed);
    }

    pub fn touch_times(&self) -> u64 {
        self.touch_times.load(Ordering::Relaxed)
    }

    /// Spawns the sampler task. Starting twice is a no-op.
    pub fn start(&self, listener: Arc<dyn SpeedListener>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let touch_times = self.touch_times.clone();
        let interval = self.interval;
        let window_size = self.window_size;
        let mut shutdown = self.stop.watcher();
        tokio::spawn(async move {
            let mut window: VecDeque<u64> = VecDeque::with_capacity(window_size);
            let mut previous = touch_times.load(Ordering::Relaxed);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = time::sleep(interval) => {}
                }
                let current = touch_times.load(Ordering::Relaxed);
                let latest = current.saturating_sub(previous);
                previous = current;
                if latest == 0 {
                    // quiet intervals are not recorded
                    continue;
                }
                window.push_back(latest);
                while window.len() > window_size {
                    window.pop_front();
                }
                let max = window.iter().copied().max().unwrap_or(latest);
                let min = window.iter().copied().min().unwrap_or(latest);
                let sum: u64 = window.iter().sum();
                let average = sum / window.len() as u64;
                listener.listen(latest, average, max, min);
            }
        });
    }

    pub fn close(&self) {
        if self.started.swap(false, Ordering::AcqRel) {
            self.stop.shutdown();
        }
    }
}
