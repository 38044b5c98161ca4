//! H.264 RTP egress track
//!
//! One send-only track per (viewer, camera). Access units arrive from the
//! capture thread through a bounded queue; a writer task packetizes them
//! (FU-A fragmentation via the rtp crate's H.264 payloader) and writes RTP
//! to the underlying WebRTC track.
//!
//! The RTP timestamp is derived from wall-clock time since the session
//! started, not from the capture timestamp, so a late-joining viewer sees
//! a timeline starting at zero.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::rtp;
use webrtc::rtp::codecs::h264::H264Payloader;
use webrtc::rtp::packetizer::Payloader;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::capture::AccessUnit;
use crate::error::{AppError, Result};

/// Queue depth between the capture thread and the RTP writer task
pub(crate) const FEED_QUEUE: usize = 16;

/// RTP identifiers and packetization budget for one track.
#[derive(Debug, Clone)]
pub struct VideoTrackConfig {
    /// Camera id; doubles as track and stream id
    pub camera_id: String,
    pub ssrc: u32,
    pub payload_type: u8,
    /// Payload budget per RTP packet in bytes
    pub mtu: usize,
}

struct RtpState {
    payloader: H264Payloader,
    sequence_number: u16,
}

/// Send-only H.264 track bound to one camera.
pub struct VideoTrack {
    config: VideoTrackConfig,
    track: Arc<TrackLocalStaticRTP>,
    started_at: Instant,
    rtp: Mutex<RtpState>,
}

impl VideoTrack {
    pub fn new(config: VideoTrackConfig, started_at: Instant) -> Self {
        let capability = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_owned(),
            clock_rate: 90_000,
            channels: 0,
            sdp_fmtp_line:
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                    .to_string(),
            rtcp_feedback: vec![],
        };
        let track = Arc::new(TrackLocalStaticRTP::new(
            capability,
            config.camera_id.clone(),
            config.camera_id.clone(),
        ));

        Self {
            config,
            track,
            started_at,
            rtp: Mutex::new(RtpState {
                payloader: H264Payloader::default(),
                sequence_number: 0,
            }),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.config.camera_id
    }

    /// Handle for `RTCPeerConnection::add_track`.
    pub fn track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Packetize one access unit and write it out. Per-packet write
    /// failures are logged, not surfaced; a track that is not yet (or no
    /// longer) bound simply discards the packets.
    pub async fn write_access_unit(&self, unit: &AccessUnit) -> Result<()> {
        let timestamp = rtp_timestamp(self.started_at.elapsed());

        // Hold the lock only for payload generation and state update.
        let (payloads, first_seq) = {
            let mut rtp = self.rtp.lock().await;
            let payloads = rtp
                .payloader
                .payload(self.config.mtu, &unit.data)
                .map_err(|e| AppError::WebRtc(format!("H264 payload: {e}")))?;
            if payloads.is_empty() {
                return Ok(());
            }
            let first_seq = rtp.sequence_number;
            rtp.sequence_number = rtp.sequence_number.wrapping_add(payloads.len() as u16);
            (payloads, first_seq)
        };

        let count = payloads.len();
        for (i, payload) in payloads.into_iter().enumerate() {
            let packet = rtp::packet::Packet {
                header: rtp::header::Header {
                    version: 2,
                    marker: i == count - 1,
                    payload_type: self.config.payload_type,
                    sequence_number: first_seq.wrapping_add(i as u16),
                    timestamp,
                    ssrc: self.config.ssrc,
                    ..Default::default()
                },
                payload,
            };
            if let Err(e) = self.track.write_rtp(&packet).await {
                trace!(camera = %self.config.camera_id, error = %e, "write_rtp failed");
            }
        }

        Ok(())
    }
}

/// 90 kHz RTP clock from elapsed wall time, wrapping modulo 2^32.
pub(crate) fn rtp_timestamp(elapsed: Duration) -> u32 {
    (elapsed.as_micros() * 90 / 1000) as u32
}

/// The peer-owned ingest handle a capture sink observes weakly.
///
/// Dropping the feed closes the queue, which ends the writer task after it
/// drains. A capture sink that fails to upgrade its `Weak<TrackFeed>`
/// returns without sending, which is what makes peer removal safe against
/// an in-flight fan-out.
pub struct TrackFeed {
    camera_id: String,
    tx: mpsc::Sender<AccessUnit>,
}

impl TrackFeed {
    /// Queue an access unit for egress; drops the unit when the writer is
    /// behind rather than blocking the capture thread.
    pub fn push(&self, unit: AccessUnit) {
        match self.tx.try_send(unit) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(camera = %self.camera_id, "egress queue full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Spawn the writer task for a track and return its feed.
pub fn spawn_feed(track: VideoTrack) -> (Arc<TrackFeed>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<AccessUnit>(FEED_QUEUE);
    let feed = Arc::new(TrackFeed {
        camera_id: track.camera_id().to_string(),
        tx,
    });

    let handle = tokio::spawn(async move {
        while let Some(unit) = rx.recv().await {
            if let Err(e) = track.write_access_unit(&unit).await {
                debug!(camera = %track.camera_id(), error = %e, "egress write failed");
            }
        }
    });

    (feed, handle)
}

/// Per-camera feeds held by one peer session.
pub type FeedMap = HashMap<String, Arc<TrackFeed>>;

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn timestamp_follows_ninety_khz_clock() {
        assert_eq!(rtp_timestamp(Duration::ZERO), 0);
        assert_eq!(rtp_timestamp(Duration::from_secs(1)), 90_000);
        assert_eq!(rtp_timestamp(Duration::from_millis(500)), 45_000);
    }

    #[test]
    fn timestamp_wraps_modulo_two_pow_32() {
        // 2^32 ticks of a 90 kHz clock is ~47721 seconds.
        let elapsed = Duration::from_secs(50_000);
        let expected = ((elapsed.as_micros() * 90 / 1000) % (1u128 << 32)) as u32;
        assert_eq!(rtp_timestamp(elapsed), expected);
    }

    fn fake_idr(len: usize) -> AccessUnit {
        let mut data = vec![0u8, 0, 0, 1, 0x65];
        data.extend(std::iter::repeat(0xAB).take(len));
        AccessUnit {
            data: Bytes::from(data),
            pts_ns: 0,
            is_keyframe: true,
        }
    }

    #[tokio::test]
    async fn sequence_numbers_advance_per_packet() {
        let track = VideoTrack::new(
            VideoTrackConfig {
                camera_id: "cam0".into(),
                ssrc: 1000,
                payload_type: 96,
                mtu: 1200,
            },
            Instant::now(),
        );

        // Large unit fragments into several FU-A packets.
        track.write_access_unit(&fake_idr(5000)).await.unwrap();
        let after_first = track.rtp.lock().await.sequence_number;
        assert!(after_first >= 5, "expected FU-A fragmentation");

        track.write_access_unit(&fake_idr(100)).await.unwrap();
        let after_second = track.rtp.lock().await.sequence_number;
        assert!(after_second > after_first);
    }

    #[tokio::test]
    async fn feed_drops_when_writer_is_gone() {
        let track = VideoTrack::new(
            VideoTrackConfig {
                camera_id: "cam0".into(),
                ssrc: 1000,
                payload_type: 96,
                mtu: 1200,
            },
            Instant::now(),
        );
        let (feed, writer) = spawn_feed(track);

        feed.push(fake_idr(100));
        let weak = Arc::downgrade(&feed);
        drop(feed);
        let _ = writer.await;

        // The capture-side weak observer now fails to upgrade.
        assert!(weak.upgrade().is_none());
    }
}
