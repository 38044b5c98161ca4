//! Per-client session state

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use webrtc::peer_connection::RTCPeerConnection;

use super::track::FeedMap;
use crate::capture::SubscriptionId;
use crate::signaling::ClientSender;

/// Everything the server holds for one connected viewer.
///
/// Created and mutated only by the peer manager, under its map lock. The
/// session owns the strong handles to its track feeds; the capture sinks
/// registered on its behalf hold only weak observers, so dropping the
/// session is what invalidates them.
pub struct PeerSession {
    pub client_id: String,
    pub(super) ws: ClientSender,
    pub(super) pc: Arc<RTCPeerConnection>,
    /// camera id -> strong feed handle
    pub(super) feeds: FeedMap,
    /// RTP writer tasks, one per feed
    pub(super) writers: Vec<JoinHandle<()>>,
    /// (camera id, subscription id) registered on behalf of this peer
    pub(super) subscriptions: Vec<(String, SubscriptionId)>,
    pub(super) started_at: Instant,
    /// True once the client's SDP answer has been installed
    pub(super) negotiated: bool,
}

impl PeerSession {
    pub(super) fn new(client_id: &str, ws: ClientSender, pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            client_id: client_id.to_string(),
            ws,
            pc,
            feeds: FeedMap::new(),
            writers: Vec::new(),
            subscriptions: Vec::new(),
            started_at: Instant::now(),
            negotiated: false,
        }
    }

    pub fn negotiated(&self) -> bool {
        self.negotiated
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}
