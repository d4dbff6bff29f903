// SPDX-License-Identifier: Apache-2.0

//! Configuration for server nodes and client connectors.

use serde::{
    Deserialize,
    Serialize,
};
use std::net::SocketAddr;

/// Default maximum frame size: 1 MiB.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 1024 * 1024;

/// A peer node of this process, with its endpoint and, for Api nodes, the
/// service it offers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// The peer's node id.
    pub node_id: String,
    /// The peer's S2S endpoint.
    pub address: SocketAddr,
    /// The Api service the peer serves, if any.
    #[serde(default)]
    pub service_id: Option<u16>,
}

/// Configuration for one server process (Play or Api role, or both).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// This process's node id, unique in the fleet.
    pub node_id: String,
    /// Client listener endpoint; absent on pure Api nodes.
    #[serde(default)]
    pub client_bind: Option<SocketAddr>,
    /// S2S listener endpoint.
    #[serde(default)]
    pub s2s_bind: Option<SocketAddr>,
    /// The Api service this node serves, if it hosts controllers.
    #[serde(default)]
    pub service_id: Option<u16>,
    /// Accept clients over WebSocket instead of raw TCP.
    #[serde(default)]
    pub use_websocket: bool,
    /// Wrap the client transport in TLS.
    #[serde(default)]
    pub use_ssl: bool,
    /// WS upgrade path.
    #[serde(default = "default_ws_path")]
    pub web_socket_path: String,
    /// PEM certificate chain, required with `use_ssl`.
    #[serde(default)]
    pub certificate_path: Option<String>,
    /// PEM private key, required with `use_ssl`.
    #[serde(default)]
    pub private_key_path: Option<String>,
    /// Disconnect a session after this much total inactivity.
    #[serde(default = "default_idle_timeout")]
    pub connection_idle_timeout_ms: u64,
    /// Send a ping after this much inbound silence.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Declare the peer dead after this much inbound silence.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    /// Default deadline for request/reply exchanges.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Optional socket send buffer size.
    #[serde(default)]
    pub send_buffer_size: Option<u32>,
    /// Optional socket receive buffer size.
    #[serde(default)]
    pub receive_buffer_size: Option<u32>,
    /// Maximum accepted frame size.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    /// Compress payloads larger than this many bytes.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,
    /// The msg id expected as the first post-connect request.
    #[serde(default = "default_authenticate_msg_id")]
    pub authenticate_message_id: String,
    /// Stage type used when a connect exchange omits one.
    #[serde(default)]
    pub default_stage_type: String,
    /// Per-stage queue capacity; posts beyond it fail `Overloaded`.
    #[serde(default = "default_stage_queue_capacity")]
    pub stage_queue_capacity: usize,
    /// Worker threads for the runtime; defaults to the logical core count.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// The other nodes of the fleet.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: "1".to_string(),
            client_bind: None,
            s2s_bind: None,
            service_id: None,
            use_websocket: false,
            use_ssl: false,
            web_socket_path: default_ws_path(),
            certificate_path: None,
            private_key_path: None,
            connection_idle_timeout_ms: default_idle_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            request_timeout_ms: default_request_timeout(),
            send_buffer_size: None,
            receive_buffer_size: None,
            max_packet_size: default_max_packet_size(),
            compression_threshold_bytes: default_compression_threshold(),
            authenticate_message_id: default_authenticate_msg_id(),
            default_stage_type: String::new(),
            stage_queue_capacity: default_stage_queue_capacity(),
            worker_threads: default_worker_threads(),
            peers: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Create a config with the given node id and otherwise default values.
    pub fn new<T: Into<String>>(node_id: T) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }
}

/// Configuration for a client connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Connect over WebSocket instead of raw TCP.
    #[serde(default)]
    pub use_websocket: bool,
    /// Wrap the transport in TLS.
    #[serde(default)]
    pub use_ssl: bool,
    /// WS upgrade path.
    #[serde(default = "default_ws_path")]
    pub web_socket_path: String,
    /// Accept any server certificate. Test environments only.
    #[serde(default)]
    pub skip_server_certificate_validation: bool,
    /// Disconnect after this much total inactivity.
    #[serde(default = "default_idle_timeout")]
    pub connection_idle_timeout_ms: u64,
    /// Send a ping after this much inbound silence.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    /// Declare the server dead after this much inbound silence.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    /// Default deadline for request/reply exchanges.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Optional socket send buffer size.
    #[serde(default)]
    pub send_buffer_size: Option<u32>,
    /// Optional socket receive buffer size.
    #[serde(default)]
    pub receive_buffer_size: Option<u32>,
    /// Maximum accepted frame size.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    /// Compress payloads larger than this many bytes. Request frames carry
    /// no compression marker, so this only bounds what the connector will
    /// accept inflating to on receive.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold_bytes: usize,
    /// The msg id the server expects as the first request.
    #[serde(default = "default_authenticate_msg_id")]
    pub authenticate_message_id: String,
    /// Stage type used when a connect exchange omits one.
    #[serde(default)]
    pub default_stage_type: String,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            use_websocket: false,
            use_ssl: false,
            web_socket_path: default_ws_path(),
            skip_server_certificate_validation: false,
            connection_idle_timeout_ms: default_idle_timeout(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            request_timeout_ms: default_request_timeout(),
            send_buffer_size: None,
            receive_buffer_size: None,
            max_packet_size: default_max_packet_size(),
            compression_threshold_bytes: default_compression_threshold(),
            authenticate_message_id: default_authenticate_msg_id(),
            default_stage_type: String::new(),
        }
    }
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_idle_timeout() -> u64 {
    60_000
}

fn default_heartbeat_interval() -> u64 {
    5_000
}

fn default_heartbeat_timeout() -> u64 {
    15_000
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_max_packet_size() -> u32 {
    DEFAULT_MAX_PACKET_SIZE
}

fn default_compression_threshold() -> usize {
    4096
}

fn default_authenticate_msg_id() -> String {
    "Authenticate".to_string()
}

fn default_stage_queue_capacity() -> usize {
    4096
}

fn default_worker_threads() -> usize {
    num_cpus::get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_defaults_from_json() {
        let cfg: ServerConfig = serde_json::from_str(r#"{"node_id":"play-1"}"#).unwrap();
        assert_eq!(cfg.node_id, "play-1");
        assert_eq!(cfg.max_packet_size, DEFAULT_MAX_PACKET_SIZE);
        assert_eq!(cfg.web_socket_path, "/ws");
        assert!(cfg.peers.is_empty());
    }

    #[test]
    fn connector_config_defaults() {
        let cfg = ConnectorConfig::default();
        assert_eq!(cfg.request_timeout_ms, 10_000);
        assert!(!cfg.skip_server_certificate_validation);
    }
}
