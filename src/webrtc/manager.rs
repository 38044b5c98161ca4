//! Peer session lifecycle
//!
//! For each admitted client: build a peer connection carrying one
//! send-only H.264 track per camera, wire capture subscriptions to the
//! tracks, drive the offer-first negotiation, and tear everything down on
//! disconnect so that no camera retains a subscription for a dead peer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::peer::PeerSession;
use super::track::{spawn_feed, VideoTrack, VideoTrackConfig};
use crate::capture::CameraPipeline;
use crate::config::WebRtcConfig;
use crate::error::{AppError, Result};
use crate::signaling::{ClientMessage, ClientSender, ServerMessage};

/// Base SSRC for camera tracks; camera *i* gets `1000 + i`
const SSRC_BASE: u32 = 1000;
/// Base RTP payload type; camera *i* gets `96 + i`
const PAYLOAD_TYPE_BASE: u8 = 96;

/// Owns every live [`PeerSession`].
pub struct PeerManager {
    config: WebRtcConfig,
    cameras: Vec<Arc<CameraPipeline>>,
    peers: Mutex<HashMap<String, PeerSession>>,
}

impl PeerManager {
    pub fn new(config: WebRtcConfig, cameras: Vec<Arc<CameraPipeline>>) -> Self {
        Self {
            config,
            cameras,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Build a session for `client_id` and send the SDP offer. Idempotent:
    /// a second call for a live client is a no-op.
    pub async fn create_peer(&self, client_id: &str, ws: ClientSender) -> Result<()> {
        let mut peers = self.peers.lock().await;
        if peers.contains_key(client_id) {
            debug!(client = %client_id, "peer already exists");
            return Ok(());
        }

        info!(client = %client_id, cameras = self.cameras.len(), "creating peer session");
        let session = self.build_session(client_id, ws).await?;
        peers.insert(client_id.to_string(), session);
        Ok(())
    }

    async fn build_session(&self, client_id: &str, ws: ClientSender) -> Result<PeerSession> {
        let pc = self.new_peer_connection(client_id, &ws).await?;
        let mut session = PeerSession::new(client_id, ws, pc.clone());

        let negotiated = self.negotiate(client_id, &mut session).await;
        match negotiated {
            Ok(sdp) => {
                info!(client = %client_id, bytes = sdp.len(), "sending SDP offer");
                session.ws.send(&ServerMessage::Offer { sdp });
                Ok(session)
            }
            Err(e) => {
                self.release(&mut session).await;
                let _ = pc.close().await;
                Err(e)
            }
        }
    }

    /// Attach tracks and produce the local offer SDP.
    async fn negotiate(&self, client_id: &str, session: &mut PeerSession) -> Result<String> {
        self.setup_tracks(session).await?;

        let offer = session
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::negotiation(client_id, format!("create_offer: {e}")))?;
        session
            .pc
            .set_local_description(offer)
            .await
            .map_err(|e| AppError::negotiation(client_id, format!("set_local_description: {e}")))?;

        // The applied description carries the final identifiers.
        let sdp = session
            .pc
            .local_description()
            .await
            .ok_or_else(|| AppError::negotiation(client_id, "local description missing"))?
            .sdp;
        Ok(sdp)
    }

    /// Create the peer connection and install its callbacks. The callback
    /// order matters: everything is in place before any description is
    /// requested, so no candidate can be generated unobserved.
    async fn new_peer_connection(
        &self,
        client_id: &str,
        ws: &ClientSender,
    ) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtc(format!("register codecs: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtc(format!("register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut ice_servers = vec![];
        if !self.config.stun_server.is_empty() {
            ice_servers.push(RTCIceServer {
                urls: vec![self.config.stun_server.clone()],
                ..Default::default()
            });
        }
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| AppError::WebRtc(format!("new peer connection: {e}")))?,
        );

        let id = client_id.to_string();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let id = id.clone();
            Box::pin(async move {
                info!(client = %id, ?state, "peer connection state");
            })
        }));

        let id = client_id.to_string();
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            let id = id.clone();
            Box::pin(async move {
                debug!(client = %id, ?state, "ICE gathering state");
            })
        }));

        let id = client_id.to_string();
        let candidate_ws = ws.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let id = id.clone();
            let ws = candidate_ws.clone();
            Box::pin(async move {
                match candidate {
                    Some(c) => match c.to_json() {
                        Ok(json) => {
                            debug!(client = %id, candidate = %json.candidate, "local ICE candidate");
                            ws.send(&ServerMessage::Candidate {
                                candidate: Some(json.candidate),
                                sdp_mid: json.sdp_mid,
                            });
                        }
                        Err(e) => warn!(client = %id, error = %e, "cannot encode ICE candidate"),
                    },
                    None => {
                        debug!(client = %id, "ICE gathering complete");
                        ws.send(&ServerMessage::Candidate {
                            candidate: None,
                            sdp_mid: None,
                        });
                    }
                }
            })
        }));

        Ok(pc)
    }

    /// Add one send-only track per camera and register its capture
    /// subscription. The sink holds only a weak observer of the feed; the
    /// session keeps the strong handle.
    async fn setup_tracks(&self, session: &mut PeerSession) -> Result<()> {
        for (i, camera) in self.cameras.iter().enumerate() {
            let track_config = VideoTrackConfig {
                camera_id: camera.id().to_string(),
                ssrc: SSRC_BASE + i as u32,
                payload_type: PAYLOAD_TYPE_BASE + i as u8,
                mtu: self.config.mtu,
            };
            let ssrc = track_config.ssrc;
            let payload_type = track_config.payload_type;

            let track = VideoTrack::new(track_config, session.started_at);
            session
                .pc
                .add_track(track.track_local())
                .await
                .map_err(|e| {
                    AppError::WebRtc(format!("add track for {}: {e}", camera.id()))
                })?;

            let (feed, writer) = spawn_feed(track);
            let weak = Arc::downgrade(&feed);
            let subscription = camera.register_frame_sink(Box::new(move |unit| {
                let Some(feed) = weak.upgrade() else {
                    return;
                };
                feed.push(unit.clone());
            }));

            info!(
                client = %session.client_id,
                camera = %camera.id(),
                ssrc,
                payload_type,
                "track attached"
            );
            session.feeds.insert(camera.id().to_string(), feed);
            session.writers.push(writer);
            session
                .subscriptions
                .push((camera.id().to_string(), subscription));
        }
        Ok(())
    }

    /// Dispatch a signaling message from `client_id`.
    pub async fn handle_message(&self, client_id: &str, msg: ClientMessage) {
        let mut peers = self.peers.lock().await;
        let Some(session) = peers.get_mut(client_id) else {
            warn!(client = %client_id, "message for unknown peer");
            return;
        };

        match msg {
            ClientMessage::Answer { sdp } => {
                info!(client = %client_id, "received SDP answer");
                match RTCSessionDescription::answer(sdp) {
                    Ok(answer) => match session.pc.set_remote_description(answer).await {
                        Ok(()) => session.negotiated = true,
                        Err(e) => {
                            warn!(client = %client_id, error = %e, "cannot apply answer")
                        }
                    },
                    Err(e) => warn!(client = %client_id, error = %e, "invalid answer SDP"),
                }
            }
            ClientMessage::Candidate {
                candidate: Some(candidate),
                sdp_mid,
            } => {
                debug!(client = %client_id, "adding remote ICE candidate");
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    ..Default::default()
                };
                if let Err(e) = session.pc.add_ice_candidate(init).await {
                    warn!(client = %client_id, error = %e, "cannot add remote candidate");
                }
            }
            ClientMessage::Candidate {
                candidate: None, ..
            } => {
                debug!(client = %client_id, "remote end of candidates");
            }
            ClientMessage::RequestStream => {
                debug!(client = %client_id, "stream already running");
            }
        }
    }

    /// Tear a session down: unregister every capture subscription (each
    /// call drains any in-flight fan-out), drop the feeds, let the writer
    /// tasks finish, then close the connection. After return no camera
    /// retains a subscription for this peer.
    pub async fn remove_peer(&self, client_id: &str) {
        let mut peers = self.peers.lock().await;
        let Some(mut session) = peers.remove(client_id) else {
            return;
        };
        info!(
            client = %client_id,
            subscriptions = session.subscriptions.len(),
            "removing peer"
        );

        self.release(&mut session).await;
        if let Err(e) = session.pc.close().await {
            warn!(client = %client_id, error = %e, "error closing peer connection");
        }
    }

    async fn release(&self, session: &mut PeerSession) {
        for (camera_id, subscription) in session.subscriptions.drain(..) {
            if let Some(camera) = self.cameras.iter().find(|c| c.id() == camera_id) {
                camera.remove_subscription(subscription);
            }
        }
        session.feeds.clear();
        for writer in session.writers.drain(..) {
            let _ = writer.await;
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Close every session; used during shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.peers.lock().await.keys().cloned().collect();
        for id in ids {
            self.remove_peer(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CameraConfig, EncoderKind, SourceKind};
    use axum::extract::ws::Message;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn test_camera(id: &str) -> Arc<CameraPipeline> {
        Arc::new(CameraPipeline::new(CameraConfig {
            id: id.into(),
            name: id.to_uppercase(),
            kind: SourceKind::Test,
            uri: String::new(),
            width: 640,
            height: 480,
            fps: 30,
            bitrate_kbps: 1000,
            encoder: EncoderKind::Software,
        }))
    }

    fn manager_with(cameras: Vec<Arc<CameraPipeline>>) -> PeerManager {
        PeerManager::new(WebRtcConfig::default(), cameras)
    }

    fn client() -> (ClientSender, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientSender::new("client_1".into(), tx), rx)
    }

    async fn expect_offer(rx: &mut mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
        // Candidate frames can interleave with the offer.
        for _ in 0..32 {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for offer")
                .expect("channel closed");
            if let Message::Text(text) = msg {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                if value["type"] == "offer" {
                    return value;
                }
            }
        }
        panic!("no offer observed");
    }

    #[tokio::test]
    async fn create_peer_sends_offer_with_one_mline_per_camera() {
        let cameras = vec![test_camera("cam_a"), test_camera("cam_b")];
        let manager = manager_with(cameras.clone());
        let (sender, mut rx) = client();

        manager.create_peer("client_1", sender).await.unwrap();
        assert_eq!(manager.peer_count().await, 1);

        let offer = expect_offer(&mut rx).await;
        let sdp = offer["sdp"].as_str().unwrap();
        assert_eq!(sdp.matches("m=video").count(), 2);
        assert!(sdp.contains("sendonly") || sdp.contains("sendrecv"));

        // One capture subscription per camera.
        for camera in &cameras {
            assert_eq!(camera.subscription_count(), 1);
        }

        manager.remove_peer("client_1").await;
    }

    #[tokio::test]
    async fn create_peer_is_idempotent() {
        let camera = test_camera("cam_a");
        let manager = manager_with(vec![camera.clone()]);
        let (sender, _rx) = client();

        manager.create_peer("client_1", sender.clone()).await.unwrap();
        manager.create_peer("client_1", sender).await.unwrap();

        assert_eq!(manager.peer_count().await, 1);
        assert_eq!(camera.subscription_count(), 1);

        manager.remove_peer("client_1").await;
    }

    #[tokio::test]
    async fn remove_peer_leaves_no_subscriptions_behind() {
        let cameras = vec![test_camera("cam_a"), test_camera("cam_b")];
        let manager = manager_with(cameras.clone());
        let (sender, _rx) = client();

        manager.create_peer("client_1", sender).await.unwrap();
        manager.remove_peer("client_1").await;

        assert_eq!(manager.peer_count().await, 0);
        for camera in &cameras {
            assert_eq!(camera.subscription_count(), 0);
        }

        // A second removal is a no-op.
        manager.remove_peer("client_1").await;
        assert_eq!(manager.peer_count().await, 0);
    }

    #[tokio::test]
    async fn client_churn_does_not_leak_subscriptions() {
        let camera = test_camera("cam_a");
        let manager = manager_with(vec![camera.clone()]);

        for _ in 0..10 {
            let (sender, _rx) = client();
            manager.create_peer("client_1", sender).await.unwrap();
            manager.remove_peer("client_1").await;
        }

        assert_eq!(manager.peer_count().await, 0);
        assert_eq!(camera.subscription_count(), 0);
    }

    #[tokio::test]
    async fn messages_for_unknown_peers_are_dropped() {
        let manager = manager_with(vec![test_camera("cam_a")]);
        manager
            .handle_message(
                "client_404",
                ClientMessage::Answer { sdp: "v=0".into() },
            )
            .await;
        assert_eq!(manager.peer_count().await, 0);
    }

    #[tokio::test]
    async fn close_all_empties_the_peer_map() {
        let camera = test_camera("cam_a");
        let manager = manager_with(vec![camera.clone()]);

        for n in 1..=3 {
            let (tx, _rx) = mpsc::unbounded_channel();
            let sender = ClientSender::new(format!("client_{n}"), tx);
            manager.create_peer(&format!("client_{n}"), sender).await.unwrap();
        }
        assert_eq!(manager.peer_count().await, 3);
        assert_eq!(camera.subscription_count(), 3);

        manager.close_all().await;
        assert_eq!(manager.peer_count().await, 0);
        assert_eq!(camera.subscription_count(), 0);
    }
}
