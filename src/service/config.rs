use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Server side profile. Field names match the configuration keys consumed
/// from TOML profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server_name: String,
    pub host: String,
    pub port: u16,
    pub charset: String,
    /// initial capacity of every connection's inbound buffer
    pub buffer_size: usize,
    /// business callback worker count, 0 means one per cpu core
    pub executor_count: usize,
    /// keep-alive probe interval in milliseconds, 0 disables liveness checks
    pub keep_alive_ms: u64,
    /// capacity of callback lanes and per-session outbound queues
    pub thread_queue_size: usize,
    /// event-loop shard count, sizes the runtime the binary builds
    pub selector_count: usize,
    /// sessions idle longer than this are evicted, 0 disables the sweep
    pub idle_timeout_ms: u64,
    pub max_connection: usize,
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            server_name: "default".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8281,
            charset: "UTF-8".to_string(),
            buffer_size: 4096,
            executor_count: 0,
            keep_alive_ms: 0,
            thread_queue_size: 1024,
            selector_count: 1,
            idle_timeout_ms: 0,
            max_connection: 1024,
            max_frame_size: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn executor_count(&self) -> usize {
        if self.executor_count == 0 {
            num_cpus::get()
        } else {
            self.executor_count
        }
    }
}

/// Client side profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub client_name: String,
    pub remote_host: String,
    pub port: u16,
    pub charset: String,
    pub buffer_size: usize,
    pub executor_count: usize,
    pub connection_timeout_ms: u64,
    /// delay between reconnect attempts
    pub reconnect_interval_ms: u64,
    /// heartbeat probe interval, 0 disables the heartbeat service
    pub keep_alive_ms: u64,
    /// missed probe intervals after which the link is declared dead
    pub heartbeat_missed_limit: u32,
    /// payload of the liveness probe, framed by the configured codec
    pub heartbeat_packet: String,
    pub thread_queue_size: usize,
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            client_name: "default".to_string(),
            remote_host: "127.0.0.1".to_string(),
            port: 8281,
            charset: "UTF-8".to_string(),
            buffer_size: 4096,
            executor_count: 0,
            connection_timeout_ms: 30_000,
            reconnect_interval_ms: 1_000,
            keep_alive_ms: 60_000,
            heartbeat_missed_limit: 3,
            heartbeat_packet: "0".to_string(),
            thread_queue_size: 1024,
            max_frame_size: 1024 * 1024,
        }
    }
}

impl ClientConfig {
    pub fn executor_count(&self) -> usize {
        if self.executor_count == 0 {
            num_cpus::get()
        } else {
            self.executor_count
        }
    }
}

/// Top-level profile holding both sides, as loaded from a TOML file.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl LinkConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<LinkConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or_else(|| AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .build()?;
        let link_config: LinkConfig = settings.try_deserialize()?;
        Ok(link_config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn load_profile_overrides_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servlink.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
            [server]
            server_name = "echo"
            port = 9291
            idle_timeout_ms = 30000

            [client]
            remote_host = "10.0.0.7"
            keep_alive_ms = 1000
            "#
        )
        .unwrap();

        let cfg = LinkConfig::from_file(&path).unwrap();
        assert_eq!(cfg.server.server_name, "echo");
        assert_eq!(cfg.server.port, 9291);
        assert_eq!(cfg.server.idle_timeout_ms, 30_000);
        // untouched keys fall back to defaults
        assert_eq!(cfg.server.charset, "UTF-8");
        assert_eq!(cfg.server.buffer_size, 4096);
        assert_eq!(cfg.client.remote_host, "10.0.0.7");
        assert_eq!(cfg.client.keep_alive_ms, 1_000);
        assert_eq!(cfg.client.heartbeat_packet, "0");
    }

    #[test]
    fn executor_count_zero_means_cpu_count() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.executor_count(), num_cpus::get());
    }
}
