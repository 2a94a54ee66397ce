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

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use super::AppResult;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Console-only subscriber, filtered through `RUST_LOG`.
pub fn setup_local_tracing() -> AppResult<()> {
    let timer = ChronoLocal::new(TIMESTAMP_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    Ok(())
}

/// Keeps the non-blocking appender alive; dropping it flushes pending logs.
pub struct LogGuard {
    _worker_guard: WorkerGuard,
}

/// Console plus hourly-rolling log file under `log_dir`.
pub fn setup_tracing(log_dir: &str, file_prefix: &str) -> LogGuard {
    let file_appender = tracing_appender::rolling::hourly(log_dir, file_prefix);
    let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
    let writer = non_blocking.and(std::io::stdout);

    let timer = ChronoLocal::new(TIMESTAMP_FORMAT.to_string());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(timer)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    LogGuard {
        _worker_guard: worker_guard,
    }
}
