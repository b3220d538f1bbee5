//! Tunable limits for every layer.
//!
//! Every field has a default, so a configuration file only needs to name the
//! values it changes:
//!
//! ```
//! let config = simio::Config::from_json(r#"{ "packet": { "max_packet_size": 1024 } }"#).unwrap();
//! assert_eq!(config.packet.max_packet_size, 1024);
//! assert_eq!(config.packet.blocksize, 4096);
//! ```

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub packet: PacketConfig,
    pub http: HttpConfig,
    pub websocket: WebSocketConfig,
    pub rpc: RpcConfig,
    pub virtual_net: VirtualConfig,
    pub logging: LogConfig,
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PacketConfig {
    pub max_packet_size: usize,
    pub blocksize: usize,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 16384,
            blocksize: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub blocksize: usize,
    /// Upper bound for the header section and for chunk headers and trailers.
    pub max_header_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            blocksize: 4096,
            max_header_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub blocksize: usize,
    /// Largest payload a single incoming frame may declare.
    pub max_frame_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            blocksize: 4096,
            max_frame_size: 1 << 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Bounds outstanding requests in each direction and the proxy table.
    pub message_limit: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            message_limit: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct VirtualConfig {
    pub max_buffer_size: usize,
    /// Defaults to `max_buffer_size` when unset.
    pub max_segment_size: Option<usize>,
    /// Loopback latency in milliseconds.
    pub latency_ms: f64,
    pub backlog: usize,
    /// Seeds the generator behind uniformly distributed link latencies.
    pub seed: u64,
}

impl VirtualConfig {
    pub fn segment_size(&self) -> usize {
        self.max_segment_size.unwrap_or(self.max_buffer_size)
    }
}

impl Default for VirtualConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 4096,
            max_segment_size: None,
            latency_ms: 1.0,
            backlog: 5,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub json: bool,
    /// Write to a timestamped file in this directory instead of stderr.
    pub directory: Option<PathBuf>,
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            json: true,
            directory: None,
            level: "info".into(),
        }
    }
}
