//! Periodic health reporting and ordered shutdown
//!
//! The driver runs the report loop on its own task; the helpers here only
//! read the atomic counters each camera exposes, so a report never blocks
//! capture or signaling.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::capture::{CameraPipeline, CameraState};
use crate::signaling::SignalingServer;
use crate::webrtc::PeerManager;

/// Interval between health reports
pub const REPORT_INTERVAL: Duration = Duration::from_secs(30);
/// A running camera without frames for this long counts as stalled
pub const STALL_THRESHOLD: Duration = Duration::from_secs(10);
/// Wall deadline for the whole graceful shutdown
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// One camera's health at a point in time.
#[derive(Debug, Clone)]
pub struct CameraHealth {
    pub id: String,
    pub state: CameraState,
}

impl CameraHealth {
    /// Running but silent for longer than the stall threshold.
    pub fn is_stalled(&self) -> bool {
        self.state.running
            && self.state.seconds_since_last_frame > STALL_THRESHOLD.as_secs_f64()
    }
}

/// Read every camera's counters.
pub fn snapshot(cameras: &[Arc<CameraPipeline>]) -> Vec<CameraHealth> {
    cameras
        .iter()
        .map(|camera| CameraHealth {
            id: camera.id().to_string(),
            state: camera.state(),
        })
        .collect()
}

/// Emit the periodic status report.
pub fn log_report(health: &[CameraHealth], peer_count: usize) {
    let active = health.iter().filter(|h| h.state.running).count();
    info!(
        cameras_active = active,
        cameras_total = health.len(),
        peers = peer_count,
        "status"
    );

    for h in health {
        info!(
            camera = %h.id,
            running = h.state.running,
            frames = h.state.frame_count,
            restarts = h.state.restart_count,
            silent_secs = format!("{:.1}", h.state.seconds_since_last_frame),
            "camera status"
        );
        if h.is_stalled() {
            warn!(
                camera = %h.id,
                silent_secs = format!("{:.1}", h.state.seconds_since_last_frame),
                "camera appears stalled"
            );
        }
    }
}

/// Stop everything in order: capture pipelines first (their bus monitors
/// quiesce), then the peer sessions, then the signaling listener. Bounded
/// by [`SHUTDOWN_DEADLINE`]; on overrun we log and return anyway.
pub async fn graceful_shutdown(
    cameras: &[Arc<CameraPipeline>],
    peers: &PeerManager,
    signaling: &SignalingServer,
) {
    let work = async {
        let cameras = cameras.to_vec();
        // stop() joins the bus monitor and can block up to the framework's
        // 3 s state deadline.
        let _ = tokio::task::spawn_blocking(move || {
            for camera in &cameras {
                camera.stop();
            }
        })
        .await;

        peers.close_all().await;
        signaling.stop().await;
    };

    if tokio::time::timeout(SHUTDOWN_DEADLINE, work).await.is_err() {
        warn!(
            deadline_secs = SHUTDOWN_DEADLINE.as_secs(),
            "graceful shutdown exceeded deadline, exiting anyway"
        );
    }
}
