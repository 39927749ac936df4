//! Sync core configuration.

use crate::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use vite_network::{CMD_SET, DEFAULT_PORT, MAINNET_MAGIC, MAX_MESSAGE_SIZE};

/// Network and sync configuration.
///
/// Every field has a default, so a TOML file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Address the listeners bind to.
    pub bind_address: IpAddr,
    /// Control channel port.
    pub listen_port: u16,
    /// File server port. 0 binds an ephemeral port.
    pub file_port: u16,
    /// Network magic bytes.
    pub magic: [u8; 4],
    /// Command set version required from peers.
    pub cmd_set: u32,

    /// Interval between status pushes, in seconds.
    pub status_interval_secs: u64,
    /// Handshake deadline, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Outbound queue capacity per peer.
    pub peer_queue_size: usize,
    /// Close connections to peers on another genesis instead of excluding
    /// them from sync only.
    pub disconnect_on_genesis_mismatch: bool,

    /// Per-attempt request deadline, in milliseconds.
    pub request_timeout_ms: u64,
    /// Retries after the first attempt.
    pub request_retries: u32,
    /// Interval of the pending-request sweep, in milliseconds.
    pub pool_sweep_ms: u64,

    /// Snapshot heights per chunk.
    pub chunk_size: u64,
    /// Chunks fetched concurrently.
    pub parallel_chunks: usize,
    /// Retries per chunk before the sync run fails.
    pub chunk_retries: u32,
    /// File transfer deadline, in milliseconds.
    pub file_timeout_ms: u64,
    /// Largest accepted chunk file.
    pub max_file_size: u64,
    /// Encoded chunk files kept by the file server.
    pub file_cache_size: usize,

    /// Heights a peer must be ahead before a bulk sync starts.
    pub lag_threshold: u64,
    /// Dedup filter capacity.
    pub filter_capacity: usize,
    /// Dedup retention window, in seconds.
    pub filter_ttl_secs: u64,
    /// Gossip blocks buffered while a bulk sync runs.
    pub receiver_buffer_size: usize,
    /// Upper bound of blocks returned for a single block request.
    pub max_blocks_per_response: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: DEFAULT_PORT,
            file_port: DEFAULT_PORT + 1,
            magic: MAINNET_MAGIC,
            cmd_set: CMD_SET,
            status_interval_secs: 10,
            handshake_timeout_ms: 10_000,
            peer_queue_size: 1000,
            disconnect_on_genesis_mismatch: false,
            request_timeout_ms: 10_000,
            request_retries: 3,
            pool_sweep_ms: 1_000,
            chunk_size: 100,
            parallel_chunks: 4,
            chunk_retries: 3,
            file_timeout_ms: 60_000,
            max_file_size: 256 * 1024 * 1024,
            file_cache_size: 16,
            lag_threshold: 1,
            filter_capacity: 10_000,
            filter_ttl_secs: 60,
            receiver_buffer_size: 1_000,
            max_blocks_per_response: 1_000,
        }
    }
}

impl NetConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> SyncResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject values the sync core cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        let positive = [
            ("chunk_size", self.chunk_size),
            ("parallel_chunks", self.parallel_chunks as u64),
            ("peer_queue_size", self.peer_queue_size as u64),
            ("request_timeout_ms", self.request_timeout_ms),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("file_timeout_ms", self.file_timeout_ms),
            ("status_interval_secs", self.status_interval_secs),
            ("pool_sweep_ms", self.pool_sweep_ms),
            ("filter_capacity", self.filter_capacity as u64),
            ("file_cache_size", self.file_cache_size as u64),
            ("max_blocks_per_response", self.max_blocks_per_response),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(SyncError::Config(format!("{} must be positive", name)));
        }
        if self.max_file_size > MAX_MESSAGE_SIZE as u64 * 1024 {
            return Err(SyncError::Config(format!(
                "max_file_size {} is unreasonably large",
                self.max_file_size
            )));
        }
        if self.listen_port != 0 && self.listen_port == self.file_port {
            return Err(SyncError::Config(
                "listen_port and file_port must differ".into(),
            ));
        }
        Ok(())
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn pool_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.pool_sweep_ms)
    }

    pub fn file_timeout(&self) -> Duration {
        Duration::from_millis(self.file_timeout_ms)
    }

    pub fn filter_ttl(&self) -> Duration {
        Duration::from_secs(self.filter_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetConfig::default();
        assert_eq!(config.listen_port, 8484);
        assert_eq!(config.status_interval(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = NetConfig::from_toml_str(
            r#"
            bind_address = "127.0.0.1"
            chunk_size = 50
            parallel_chunks = 8
            disconnect_on_genesis_mismatch = true
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.chunk_size, 50);
        assert_eq!(config.parallel_chunks, 8);
        assert!(config.disconnect_on_genesis_mismatch);
        assert_eq!(config.request_retries, 3);
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            NetConfig::from_toml_str("chunk_size = 0"),
            Err(SyncError::Config(_))
        ));
        assert!(NetConfig::from_toml_str("listen_port = 9000\nfile_port = 9000").is_err());
        assert!(NetConfig::from_toml_str("chunk_size = \"big\"").is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = NetConfig {
            chunk_size: 42,
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(NetConfig::from_toml_str(&text).unwrap(), config);
    }
}
