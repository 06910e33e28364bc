extern crate config as rs_config;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::AppError::InvalidValue;
use crate::AppResult;

const DEFAULT_CONNECTION_LIMIT: usize = 4096;

/// Per-node configuration.
///
/// `NodeConfig::new` fills every field with the runtime defaults; fields can
/// then be adjusted before the node is started. `from_file` loads the same
/// structure from a TOML file, with absent keys falling back to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Local address the node listens on, e.g. `":9001"` or `"0.0.0.0:9001"`.
    pub bind_address: String,
    /// How long to wait for a callee to answer a dial, in seconds.
    pub connect_timeout_sec: u64,
    /// Per-read timeout in microseconds; values below ~600 are essentially
    /// non-blocking.
    pub read_timeout_us: u64,
    /// Read buffer size in bytes, ideally matching the transport MTU.
    pub read_buffer_size: usize,
    /// Cap on accepted connections; <0 means 4096, 0 means unlimited.
    pub incoming_connection_limit: i32,
    /// Cap on dialed connections; <0 means 4096, 0 means unlimited.
    pub outgoing_connection_limit: i32,
    /// Connections with no read/write activity for this long are pruned;
    /// values below 1 disable pruning.
    pub idle_connection_timeout_ms: i64,
    pub error_chan_buffer_size: usize,
    pub recv_chan_buffer_size: usize,
    pub status_chan_buffer_size: usize,
    /// Automatically send a receipt upon receiving a message.
    pub send_message_receipts: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            bind_address: String::new(),
            connect_timeout_sec: 30,
            read_timeout_us: 1_000_000,
            read_buffer_size: 1500,
            incoming_connection_limit: -1,
            outgoing_connection_limit: -1,
            idle_connection_timeout_ms: 60_000,
            error_chan_buffer_size: 100,
            recv_chan_buffer_size: 100,
            status_chan_buffer_size: 100,
            send_message_receipts: true,
        }
    }
}

impl NodeConfig {
    pub fn new(bind_address: impl Into<String>) -> Self {
        NodeConfig {
            bind_address: bind_address.into(),
            ..Default::default()
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<NodeConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(InvalidValue("config file path", String::new()))?;
        let settings = rs_config::Config::builder()
            .add_source(rs_config::File::with_name(path_str))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Resolved accept cap: `None` means unlimited.
    pub(crate) fn effective_incoming_limit(&self) -> Option<usize> {
        effective_limit(self.incoming_connection_limit)
    }

    /// Resolved dial cap: `None` means unlimited.
    pub(crate) fn effective_outgoing_limit(&self) -> Option<usize> {
        effective_limit(self.outgoing_connection_limit)
    }
}

fn effective_limit(limit: i32) -> Option<usize> {
    if limit < 0 {
        Some(DEFAULT_CONNECTION_LIMIT)
    } else if limit == 0 {
        None
    } else {
        Some(limit as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = NodeConfig::new(":9001");
        assert_eq!(cfg.bind_address, ":9001");
        assert_eq!(cfg.connect_timeout_sec, 30);
        assert_eq!(cfg.read_timeout_us, 1_000_000);
        assert_eq!(cfg.read_buffer_size, 1500);
        assert_eq!(cfg.incoming_connection_limit, -1);
        assert_eq!(cfg.outgoing_connection_limit, -1);
        assert_eq!(cfg.idle_connection_timeout_ms, 60_000);
        assert_eq!(cfg.error_chan_buffer_size, 100);
        assert_eq!(cfg.recv_chan_buffer_size, 100);
        assert_eq!(cfg.status_chan_buffer_size, 100);
        assert!(cfg.send_message_receipts);
    }

    #[test]
    fn test_effective_limits() {
        let mut cfg = NodeConfig::new(":9001");
        assert_eq!(cfg.effective_incoming_limit(), Some(4096));
        cfg.incoming_connection_limit = 0;
        assert_eq!(cfg.effective_incoming_limit(), None);
        cfg.incoming_connection_limit = 7;
        assert_eq!(cfg.effective_incoming_limit(), Some(7));
        cfg.outgoing_connection_limit = -5;
        assert_eq!(cfg.effective_outgoing_limit(), Some(4096));
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join("peerlink_config_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("node.toml");
        std::fs::write(
            &path,
            "bind_address = \":9400\"\nrecv_chan_buffer_size = 256\n",
        )
        .unwrap();

        let cfg = NodeConfig::from_file(&path).unwrap();
        assert_eq!(cfg.bind_address, ":9400");
        assert_eq!(cfg.recv_chan_buffer_size, 256);
        // untouched keys keep their defaults
        assert_eq!(cfg.connect_timeout_sec, 30);
        assert!(cfg.send_message_receipts);
    }
}
