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

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// framing errors
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unsupported charset: {0}")]
    UnsupportedCharset(String),

    /// marker error, a frame needs more bytes before it can be decoded
    #[error("incomplete frame")]
    Incomplete,

    /// session and delivery errors
    #[error("session {0} not found")]
    SessionNotFound(u64),

    #[error("session {0} is closed")]
    SessionClosed(u64),

    #[error("outbound queue full for session {0}")]
    QueueFull(u64),

    #[error("client is not connected")]
    NotConnected,

    #[error("connect timed out after {0} ms")]
    ConnectTimeout(u64),
}

impl AppError {
    /// Framing errors are recoverable once; everything else tears the
    /// connection down.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            AppError::MalformedFrame(_) | AppError::UnsupportedCharset(_)
        )
    }
}
