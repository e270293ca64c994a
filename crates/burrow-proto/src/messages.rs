//! Agent protocol message types

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Message type names exchanged over an agent session
pub mod message_types {
    // Newt (site agent)
    pub const NEWT_PING: &str = "newt/ping";
    pub const NEWT_PING_REQUEST: &str = "newt/ping/request";
    pub const NEWT_PING_EXIT_NODES: &str = "newt/ping/exitNodes";
    pub const NEWT_RECEIVE_BANDWIDTH: &str = "newt/receive-bandwidth";
    pub const NEWT_REGISTER: &str = "newt/wg/register";
    pub const NEWT_CONNECT: &str = "newt/wg/connect";
    pub const NEWT_PEER_ADD: &str = "newt/wg/peer/add";
    pub const NEWT_PEER_REMOVE: &str = "newt/wg/peer/remove";
    pub const NEWT_TARGETS_ADD: &str = "newt/wg/targets/add";
    pub const NEWT_TARGETS_REMOVE: &str = "newt/wg/targets/remove";

    // Olm (client agent)
    pub const OLM_PING: &str = "olm/ping";
    pub const OLM_REGISTER: &str = "olm/wg/register";
    pub const OLM_CONNECT: &str = "olm/wg/connect";
    pub const OLM_PEER_ADD: &str = "olm/wg/peer/add";
    pub const OLM_PEER_REMOVE: &str = "olm/wg/peer/remove";
    pub const OLM_TERMINATE: &str = "olm/terminate";

    // Remote exit node
    pub const REMOTE_EXIT_NODE_PING: &str = "remoteExitNode/ping";
    pub const EXIT_NODE_RECEIVE_BANDWIDTH: &str = "exitNode/receive-bandwidth";
    pub const EXIT_NODE_PEER_ADD: &str = "remoteExitNode/peer/add";
    pub const EXIT_NODE_PEER_REMOVE: &str = "remoteExitNode/peer/remove";

    pub const PONG: &str = "pong";
}

/// Envelope for every message on an agent session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl AgentMessage {
    /// Build an envelope from any serializable payload
    pub fn new<T: Serialize>(message_type: &str, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_type: message_type.to_string(),
            data: serde_json::to_value(data)?,
        })
    }

    /// Envelope with an empty object payload
    pub fn empty(message_type: &str) -> Self {
        Self {
            message_type: message_type.to_string(),
            data: serde_json::Value::Object(Default::default()),
        }
    }

    /// Decode the payload into a typed structure
    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        // A missing payload decodes like an empty object so all-default payloads work
        if self.data.is_null() {
            return serde_json::from_value(serde_json::Value::Object(Default::default()));
        }
        serde_json::from_value(self.data.clone())
    }
}

/// One exit node offered to a connected site
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ExitNodeCandidate {
    pub exit_node_id: i32,
    pub exit_node_name: String,
    pub endpoint: String,
    /// Fraction of spare capacity in (0, 1]
    pub weight: f64,
    pub was_previously_connected: bool,
}

/// Payload of `newt/ping/request`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    /// Skip remote exit nodes
    #[serde(default)]
    pub no_cloud: bool,
}

/// Payload of `newt/ping/exitNodes`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExitNodeList {
    pub exit_nodes: Vec<ExitNodeCandidate>,
}

/// Usage counters for one WireGuard peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct PeerBandwidth {
    pub public_key: String,
    pub bytes_in: i64,
    pub bytes_out: i64,
}

/// Payload of `newt/receive-bandwidth` and `exitNode/receive-bandwidth`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct BandwidthReport {
    #[serde(default)]
    pub bandwidth_data: Vec<PeerBandwidth>,
}

/// Payload of `pong`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pong {
    /// RFC 3339 timestamp
    pub timestamp: String,
}

/// Ping result reported by a Newt for one exit node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExitNodePingResult {
    pub exit_node_id: i32,
    #[serde(default)]
    pub exit_node_name: String,
    #[serde(default)]
    pub endpoint: String,
    pub latency_ms: f64,
    pub weight: f64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub was_previously_connected: bool,
}

/// Payload of `newt/wg/register`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub public_key: String,
    #[serde(default)]
    pub ping_results: Vec<ExitNodePingResult>,
    #[serde(default)]
    pub no_cloud: bool,
}

/// Payload of `newt/wg/connect`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectReply {
    pub endpoint: String,
    /// Exit node public key
    pub public_key: String,
    pub server_ip: String,
    pub tunnel_ip: String,
    /// Client peers the site must accept
    #[serde(default)]
    pub peers: Vec<NewtPeer>,
    /// Destinations each client peer may reach through the site
    #[serde(default)]
    pub targets: Vec<NewtTargets>,
}

/// Payload of `newt/wg/peer/add`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewtPeer {
    pub public_key: String,
    pub allowed_ips: Vec<String>,
}

/// Payload of `newt/wg/peer/remove`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewtPeerRemove {
    pub public_key: String,
}

/// Payload of `newt/wg/targets/add` and `newt/wg/targets/remove`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewtTargets {
    /// Client peer the targets apply to
    pub public_key: String,
    /// `host:port` or bare host destinations
    pub targets: Vec<String>,
}

/// Payload of `olm/wg/peer/add`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OlmPeer {
    pub site_id: i32,
    pub public_key: String,
    pub endpoint: String,
    pub server_ip: String,
}

/// Payload of `olm/wg/register`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OlmRegisterRequest {
    pub public_key: String,
}

/// Payload of `olm/wg/connect`: every site the client is peered with
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OlmConnectReply {
    #[serde(default)]
    pub sites: Vec<OlmPeer>,
}

/// Payload of `olm/wg/peer/remove`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OlmPeerRemove {
    pub site_id: i32,
}
