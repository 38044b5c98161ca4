//! Signaling message types
//!
//! JSON text frames exchanged with viewers over the WebSocket. The server
//! sends exactly one offer per session; renegotiation is not supported.

use serde::{Deserialize, Serialize};

use crate::config::CameraConfig;

/// Camera summary advertised to clients in `camera_list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraInfo {
    pub id: String,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl From<&CameraConfig> for CameraInfo {
    fn from(config: &CameraConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            width: config.width,
            height: config.height,
            fps: config.fps,
        }
    }
}

/// Server-to-client messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once when the socket opens
    CameraList { cameras: Vec<CameraInfo> },
    /// The SDP offer for the whole session
    Offer { sdp: String },
    /// A local ICE candidate; `candidate: null` means end-of-candidates
    Candidate {
        candidate: Option<String>,
        #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
    },
    /// Fatal per-client error; the socket may be closed right after
    Error { message: String },
}

/// Client-to-server messages. Unknown types fail to parse and are logged
/// and dropped by the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// SDP answer to our offer
    Answer { sdp: String },
    /// Remote ICE candidate; `candidate: null` means end-of-candidates
    Candidate {
        #[serde(default)]
        candidate: Option<String>,
        #[serde(rename = "sdpMid", default)]
        sdp_mid: Option<String>,
    },
    /// Legacy no-op: streams start as soon as the peer is created
    RequestStream,
}
