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

use std::any::type_name;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

use crate::service::{Shutdown, ShutdownNotifier};
use crate::{AppError, AppResult};

/// Handler invoked by pool workers for every dispatched task.
pub trait PoolHandler<T>: Clone + Send + Sync + 'static {
    fn handle(&self, task: T) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone)]
pub struct DispatchPoolConfig {
    /// capacity of each lane's queue
    pub lane_capacity: usize,
    pub num_lanes: usize,
    pub monitor_interval: Duration,
    pub worker_check_timeout: Duration,
}

impl Default for DispatchPoolConfig {
    fn default() -> Self {
        Self {
            lane_capacity: 1024,
            num_lanes: 4,
            monitor_interval: Duration::from_secs(5),
            worker_check_timeout: Duration::from_millis(200),
        }
    }
}

/// Worker pool with multiple independent task lanes.
///
/// Each lane has one dedicated worker, so tasks routed by the same key are
/// processed strictly in order. A monitor task restarts workers that exit
/// through a panic in application callback code.
#[derive(Debug)]
pub struct DispatchPool<T> {
    lanes: Arc<HashMap<usize, Lane<T>>>,
    config: DispatchPoolConfig,
}

#[derive(Debug)]
struct Lane<T> {
    sender: async_channel::Sender<T>,
    receiver: async_channel::Receiver<T>,
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> DispatchPool<T> {
    pub fn new<H: PoolHandler<T>>(
        shutdown: &ShutdownNotifier,
        handler: H,
        config: DispatchPoolConfig,
    ) -> Self {
        let lanes = Self::spawn_lanes_with_monitor(config.clone(), shutdown, handler);
        Self { lanes, config }
    }

    fn lane(&self, key: u64) -> &Lane<T> {
        let index = (key % self.lanes.len() as u64) as usize;
        &self.lanes[&index]
    }

    /// Queues a task on the lane selected by `key`, waiting while the lane
    /// is full. Fails only when the pool has shut down.
    pub async fn dispatch(&self, task: T, key: u64) -> AppResult<()> {
        self.lane(key)
            .sender
            .send(task)
            .await
            .map_err(|e| AppError::ChannelSendError(e.to_string()))
    }

    /// Non-blocking variant: a full lane rejects the task instead of
    /// waiting so the caller sees the capacity pressure.
    pub fn try_dispatch(&self, task: T, key: u64) -> AppResult<()> {
        use async_channel::TrySendError;
        self.lane(key).sender.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => AppError::QueueFull(key),
            TrySendError::Closed(_) => AppError::ChannelSendError("pool is closed".to_string()),
        })
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn config(&self) -> &DispatchPoolConfig {
        &self.config
    }

    fn spawn_lanes_with_monitor<H: PoolHandler<T>>(
        config: DispatchPoolConfig,
        shutdown: &ShutdownNotifier,
        handler: H,
    ) -> Arc<HashMap<usize, Lane<T>>> {
        let num_lanes = config.num_lanes.max(1);
        let mut workers = Vec::with_capacity(num_lanes);
        let mut lanes = HashMap::with_capacity(num_lanes);

        for id in 0..num_lanes {
            let (sender, receiver) = async_channel::bounded(config.lane_capacity);
            let worker =
                Self::spawn_worker(id, handler.clone(), shutdown.watcher(), receiver.clone());
            workers.push(worker);
            lanes.insert(id, Lane { sender, receiver });
        }

        let lanes = Arc::new(lanes);
        Self::spawn_monitor(workers, lanes.clone(), shutdown.clone(), handler, config);
        lanes
    }

    fn spawn_worker<H: PoolHandler<T>>(
        id: usize,
        handler: H,
        mut shutdown: Shutdown,
        receiver: async_channel::Receiver<T>,
    ) -> Worker {
        let handle = tokio::spawn(async move {
            debug!("dispatch worker {id} started");
            loop {
                tokio::select! {
                    task = receiver.recv() => {
                        match task {
                            Ok(task) => handler.handle(task).await,
                            Err(_) => break,
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("dispatch worker {id} shutting down");
                        break;
                    }
                }
            }
        });
        Worker { id, handle }
    }

    fn spawn_monitor<H: PoolHandler<T>>(
        mut workers: Vec<Worker>,
        lanes: Arc<HashMap<usize, Lane<T>>>,
        shutdown: ShutdownNotifier,
        handler: H,
        config: DispatchPoolConfig,
    ) {
        let mut watcher = shutdown.watcher();
        tokio::spawn(async move {
            let mut interval = time::interval(config.monitor_interval);
            loop {
                tokio::select! {
                    _ = watcher.recv() => {
                        debug!("dispatch pool monitor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        for worker in &mut workers {
                            match time::timeout(config.worker_check_timeout, &mut worker.handle).await {
                                Ok(join_result) => {
                                    match join_result {
                                        Ok(_) => {
                                            warn!("dispatch worker {} completed unexpectedly", worker.id);
                                        }
                                        Err(err) if err.is_panic() => {
                                            log_worker_panic(worker.id, err);
                                        }
                                        Err(_) => {
                                            error!("dispatch worker {} failed with a non-panic error", worker.id);
                                        }
                                    }
                                    warn!("restarting dispatch worker {}", worker.id);
                                    *worker = Self::spawn_worker(
                                        worker.id,
                                        handler.clone(),
                                        shutdown.watcher(),
                                        lanes[&worker.id].receiver.clone(),
                                    );
                                }
                                Err(_) => {
                                    trace!("dispatch worker {} is running", worker.id);
                                }
                            }
                        }
                    }
                }
            }
            debug!("dispatch pool monitor exited");
        });
    }
}

fn log_worker_panic(worker_id: usize, err: tokio::task::JoinError) {
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        error!("dispatch worker {worker_id} panicked: {message}");
    } else if let Some(message) = payload.downcast_ref::<String>() {
        error!("dispatch worker {worker_id} panicked: {message}");
    } else {
        error!(
            "dispatch worker {worker_id} panicked with an unknown payload type: {}",
            get_type_name(&payload)
        );
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI32, Ordering};

    use super::*;

    #[derive(Clone)]
    struct SummingHandler {
        total: Arc<AtomicI32>,
    }

    impl PoolHandler<i32> for SummingHandler {
        fn handle(&self, task: i32) -> impl Future<Output = ()> + Send {
            let total = self.total.clone();
            async move {
                total.fetch_add(task, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn tasks_reach_their_lanes() {
        let shutdown = ShutdownNotifier::new();
        let handler = SummingHandler {
            total: Arc::new(AtomicI32::new(0)),
        };
        let pool = DispatchPool::new(
            &shutdown,
            handler.clone(),
            DispatchPoolConfig {
                lane_capacity: 10,
                num_lanes: 2,
                monitor_interval: Duration::from_millis(100),
                worker_check_timeout: Duration::from_millis(50),
            },
        );

        pool.dispatch(1, 0).await.unwrap();
        pool.dispatch(2, 1).await.unwrap();
        pool.dispatch(4, 7).await.unwrap();

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handler.total.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn panicked_worker_is_restarted() {
        #[derive(Clone)]
        struct PanicHandler {
            handled: Arc<AtomicI32>,
        }

        impl PoolHandler<bool> for PanicHandler {
            fn handle(&self, should_panic: bool) -> impl Future<Output = ()> + Send {
                let handled = self.handled.clone();
                async move {
                    if should_panic {
                        panic!("callback blew up");
                    }
                    handled.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let shutdown = ShutdownNotifier::new();
        let handler = PanicHandler {
            handled: Arc::new(AtomicI32::new(0)),
        };
        let pool = DispatchPool::new(
            &shutdown,
            handler.clone(),
            DispatchPoolConfig {
                lane_capacity: 10,
                num_lanes: 1,
                monitor_interval: Duration::from_millis(100),
                worker_check_timeout: Duration::from_millis(50),
            },
        );

        pool.dispatch(true, 0).await.unwrap();
        time::sleep(Duration::from_millis(400)).await;

        // the restarted worker keeps draining the same lane
        pool.dispatch(false, 0).await.unwrap();
        time::sleep(Duration::from_millis(400)).await;
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn full_lane_rejects_instead_of_dropping() {
        #[derive(Clone)]
        struct StallingHandler;

        impl PoolHandler<i32> for StallingHandler {
            fn handle(&self, _task: i32) -> impl Future<Output = ()> + Send {
                async move {
                    time::sleep(Duration::from_secs(60)).await;
                }
            }
        }

        let shutdown = ShutdownNotifier::new();
        let pool = DispatchPool::new(
            &shutdown,
            StallingHandler,
            DispatchPoolConfig {
                lane_capacity: 1,
                num_lanes: 1,
                ..Default::default()
            },
        );

        // first task occupies the worker, second fills the lane
        pool.dispatch(1, 0).await.unwrap();
        time::sleep(Duration::from_millis(50)).await;
        pool.dispatch(2, 0).await.unwrap();
        assert!(matches!(
            pool.try_dispatch(3, 0),
            Err(AppError::QueueFull(_))
        ));
        shutdown.shutdown();
    }
}
