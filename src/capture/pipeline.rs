//! Per-camera capture pipeline
//!
//! Owns one camera source end-to-end: renders the GStreamer pipeline
//! description, launches it, runs a dedicated bus-monitor thread, fans
//! encoded access units out to subscribers, and relaunches the pipeline
//! with bounded exponential backoff when the source fails.
//!
//! ```text
//! source ─ depay/encode ─ h264parse ─ appsink ──► SinkRegistry ──► sinks
//!                                        │
//!                        bus monitor ◄───┘ (ERROR / EOS → restart)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::frame::AccessUnit;
use super::registry::{FrameSink, SinkRegistry, SubscriptionId};
use crate::config::{CameraConfig, EncoderKind, SourceKind};
use crate::error::{AppError, Result};

/// Bus poll timeout; bounds how quickly shutdown is observed
const BUS_POLL_MS: u64 = 500;
/// Tick for shutdown checks inside a backoff sleep
const SHUTDOWN_TICK: Duration = Duration::from_millis(100);
/// Deadline for the NULL state transition during teardown
const STATE_DEADLINE_SECS: u64 = 3;

const APPSINK: &str = "appsink name=sink emit-signals=true sync=false max-buffers=2 drop=true";
const H264_CAPS: &str = "video/x-h264,stream-format=byte-stream,alignment=au";

/// Public health view of one camera, readable without a lock.
#[derive(Debug, Clone)]
pub struct CameraState {
    pub running: bool,
    pub frame_count: u64,
    pub seconds_since_last_frame: f64,
    pub restart_count: u64,
    pub backoff_seconds: u64,
}

struct CaptureShared {
    config: CameraConfig,
    registry: SinkRegistry,
    running: AtomicBool,
    shutdown: AtomicBool,
    frame_count: AtomicU64,
    restart_count: AtomicU64,
    backoff_secs: AtomicU64,
    /// Construction instant; `last_frame_ms` counts from here, so a camera
    /// that has never produced a frame reports a growing duration.
    epoch: Instant,
    last_frame_ms: AtomicU64,
}

impl CaptureShared {
    fn touch_last_frame(&self) {
        self.last_frame_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn seconds_since_last_frame(&self) -> f64 {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let last_ms = self.last_frame_ms.load(Ordering::Relaxed);
        now_ms.saturating_sub(last_ms) as f64 / 1000.0
    }
}

/// One camera's capture pipeline and restart supervisor.
pub struct CameraPipeline {
    shared: Arc<CaptureShared>,
    // Also serializes start()/stop() against each other.
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl CameraPipeline {
    pub fn new(config: CameraConfig) -> Self {
        Self {
            shared: Arc::new(CaptureShared {
                config,
                registry: SinkRegistry::new(),
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                frame_count: AtomicU64::new(0),
                restart_count: AtomicU64::new(0),
                backoff_secs: AtomicU64::new(1),
                epoch: Instant::now(),
                last_frame_ms: AtomicU64::new(0),
            }),
            monitor: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.config.id
    }

    pub fn config(&self) -> &CameraConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn frame_count(&self) -> u64 {
        self.shared.frame_count.load(Ordering::Relaxed)
    }

    pub fn restart_count(&self) -> u64 {
        self.shared.restart_count.load(Ordering::Relaxed)
    }

    pub fn seconds_since_last_frame(&self) -> f64 {
        self.shared.seconds_since_last_frame()
    }

    pub fn state(&self) -> CameraState {
        CameraState {
            running: self.is_running(),
            frame_count: self.frame_count(),
            seconds_since_last_frame: self.seconds_since_last_frame(),
            restart_count: self.restart_count(),
            backoff_seconds: self.shared.backoff_secs.load(Ordering::Relaxed),
        }
    }

    /// Register a sink for every access unit this camera emits.
    ///
    /// Thread-safe. The returned id is the order point for removal: frames
    /// emitted after this call returns are observed by the sink.
    pub fn register_frame_sink(&self, sink: FrameSink) -> SubscriptionId {
        self.shared.registry.add(sink)
    }

    /// Unregister a sink. After return the sink will not be invoked again;
    /// a call racing a fan-out blocks until that fan-out completes.
    pub fn remove_subscription(&self, id: SubscriptionId) {
        self.shared.registry.remove(id);
    }

    /// Unregister every sink.
    pub fn clear_subscriptions(&self) {
        self.shared.registry.clear();
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Launch the pipeline and start the bus monitor. Idempotent.
    ///
    /// Only the initial launch can fail: a rejected description is
    /// [`AppError::Config`], an unopenable source is [`AppError::Source`].
    /// Later failures are handled by the internal restart loop.
    pub fn start(&self) -> Result<()> {
        let mut monitor = self.monitor.lock();
        if self.shared.running.load(Ordering::SeqCst) {
            warn!(camera = %self.id(), "pipeline already running");
            return Ok(());
        }

        self.shared.shutdown.store(false, Ordering::SeqCst);
        let pipeline = launch(&self.shared)?;
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.backoff_secs.store(1, Ordering::Relaxed);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("bus-{}", self.id()))
            .spawn(move || run_monitor(shared, pipeline))?;
        *monitor = Some(handle);

        info!(camera = %self.id(), "pipeline started");
        Ok(())
    }

    /// Signal permanent shutdown, tear the pipeline down and join the bus
    /// monitor. Idempotent. Subscriber state is left untouched; subscribers
    /// unregister themselves.
    pub fn stop(&self) {
        let mut monitor = self.monitor.lock();
        self.shared.shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = monitor.take() {
            info!(camera = %self.id(), "stopping pipeline");
            if handle.join().is_err() {
                warn!(camera = %self.id(), "bus monitor panicked");
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for CameraPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Render the GStreamer launch description for a camera.
fn pipeline_description(config: &CameraConfig) -> String {
    match config.kind {
        SourceKind::Rtsp => format!(
            "rtspsrc location={} protocols=tcp tcp-timeout=5000000 retry=3 latency=0 \
             ! rtph264depay ! h264parse config-interval=-1 ! {H264_CAPS} ! {APPSINK}",
            config.uri
        ),
        SourceKind::Usb => format!(
            "v4l2src device={} ! {raw} ! videoconvert ! {enc} ! {caps} \
             ! h264parse config-interval=-1 ! {APPSINK}",
            config.uri,
            raw = raw_caps(config),
            enc = encoder_fragment(config),
            caps = encoded_caps(config),
        ),
        SourceKind::Test => format!(
            "videotestsrc is-live=true pattern=smpte ! {raw} ! videoconvert \
             ! clockoverlay font-desc=\"Sans 36\" time-format=\"%H:%M:%S\" \
             ! {enc} ! {caps} ! h264parse config-interval=-1 ! {APPSINK}",
            raw = raw_caps(config),
            enc = encoder_fragment(config),
            caps = encoded_caps(config),
        ),
    }
}

fn raw_caps(config: &CameraConfig) -> String {
    format!(
        "video/x-raw,width={},height={},framerate={}/1",
        config.width, config.height, config.fps
    )
}

fn encoded_caps(config: &CameraConfig) -> String {
    match config.encoder {
        EncoderKind::Software => format!("{H264_CAPS},profile=baseline"),
        EncoderKind::Hardware => H264_CAPS.to_string(),
    }
}

fn encoder_fragment(config: &CameraConfig) -> String {
    // Zero-latency, no B-frames: a late-joining viewer must be able to
    // decode from the next IDR without reordering.
    match config.encoder {
        EncoderKind::Software => format!(
            "x264enc tune=zerolatency bitrate={} speed-preset=ultrafast \
             key-int-max={} bframes=0 b-adapt=false sliced-threads=true threads={}",
            config.bitrate_kbps,
            config.fps * 2,
            encoder_threads(),
        ),
        EncoderKind::Hardware => format!(
            "vaapih264enc bitrate={} keyframe-period={}",
            config.bitrate_kbps,
            config.fps * 2,
        ),
    }
}

fn encoder_threads() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    (cores / 4).max(1)
}

/// Parse, wire and start a pipeline for `shared`'s descriptor.
fn launch(shared: &Arc<CaptureShared>) -> Result<gst::Pipeline> {
    let id = shared.config.id.clone();
    let desc = pipeline_description(&shared.config);
    debug!(camera = %id, pipeline = %desc, "launching");

    let pipeline = gst::parse::launch(&desc)
        .map_err(|e| AppError::Config(format!("camera {id}: pipeline rejected: {e}")))?
        .downcast::<gst::Pipeline>()
        .map_err(|_| AppError::Config(format!("camera {id}: description is not a pipeline")))?;

    let appsink = pipeline
        .by_name("sink")
        .ok_or_else(|| AppError::Config(format!("camera {id}: appsink element missing")))?
        .downcast::<gst_app::AppSink>()
        .map_err(|_| AppError::Config(format!("camera {id}: sink element is not an appsink")))?;

    let sample_shared = shared.clone();
    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| on_sample(&sample_shared, sink))
            .build(),
    );

    if let Err(e) = pipeline.set_state(gst::State::Playing) {
        let _ = pipeline.set_state(gst::State::Null);
        return Err(AppError::source(&id, format!("cannot start pipeline: {e}")));
    }

    Ok(pipeline)
}

/// Appsink callback: snapshot metadata, copy the payload, fan out.
fn on_sample(
    shared: &Arc<CaptureShared>,
    sink: &gst_app::AppSink,
) -> std::result::Result<gst::FlowSuccess, gst::FlowError> {
    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
    let Some(buffer) = sample.buffer() else {
        return Ok(gst::FlowSuccess::Ok);
    };

    let is_keyframe = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
    let pts_ns = buffer.pts().map(|t| t.nseconds()).unwrap_or(0);
    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
    let unit = AccessUnit {
        data: Bytes::copy_from_slice(map.as_slice()),
        pts_ns,
        is_keyframe,
    };
    drop(map);

    shared.frame_count.fetch_add(1, Ordering::Relaxed);
    // Updated before any sink sees the unit.
    shared.touch_last_frame();
    shared.registry.dispatch(&unit);

    Ok(gst::FlowSuccess::Ok)
}

enum BusVerdict {
    Restart,
    Shutdown,
}

/// Bus-monitor thread body: watch the bus, restart on failure, exit on
/// shutdown. Owns the pipeline from launch to teardown.
fn run_monitor(shared: Arc<CaptureShared>, mut pipeline: gst::Pipeline) {
    loop {
        let verdict = watch_bus(&shared, &pipeline);
        teardown(&shared, &pipeline);
        shared.running.store(false, Ordering::SeqCst);

        if matches!(verdict, BusVerdict::Shutdown) {
            break;
        }

        shared.restart_count.fetch_add(1, Ordering::Relaxed);
        match relaunch_with_backoff(&shared) {
            Some(next) => {
                pipeline = next;
                shared.running.store(true, Ordering::SeqCst);
                info!(camera = %shared.config.id, "pipeline relaunched");
            }
            None => break,
        }
    }

    shared.running.store(false, Ordering::SeqCst);
    debug!(camera = %shared.config.id, "bus monitor exiting");
}

/// Poll the bus until an event forces a restart or shutdown is requested.
fn watch_bus(shared: &Arc<CaptureShared>, pipeline: &gst::Pipeline) -> BusVerdict {
    let id = shared.config.id.as_str();
    let Some(bus) = pipeline.bus() else {
        error!(camera = %id, "pipeline has no bus");
        return BusVerdict::Restart;
    };
    let pipeline_name = pipeline.name();

    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return BusVerdict::Shutdown;
        }
        let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(BUS_POLL_MS)) else {
            continue;
        };

        match msg.view() {
            gst::MessageView::Error(err) => {
                error!(
                    camera = %id,
                    error = %err.error(),
                    debug = ?err.debug(),
                    "pipeline error, scheduling restart"
                );
                return BusVerdict::Restart;
            }
            gst::MessageView::Eos(..) => {
                warn!(camera = %id, "unexpected end of stream, scheduling restart");
                return BusVerdict::Restart;
            }
            gst::MessageView::Warning(w) => {
                warn!(camera = %id, warning = %w.error(), "pipeline warning");
            }
            gst::MessageView::StateChanged(s) => {
                if msg.src().map(|src| src.name() == pipeline_name).unwrap_or(false) {
                    debug!(
                        camera = %id,
                        old = ?s.old(),
                        new = ?s.current(),
                        "pipeline state changed"
                    );
                }
            }
            _ => {}
        }
    }
}

/// Drive the pipeline to NULL with a bounded wait on the state transition.
fn teardown(shared: &Arc<CaptureShared>, pipeline: &gst::Pipeline) {
    let _ = pipeline.set_state(gst::State::Null);
    let (result, _, _) = pipeline.state(gst::ClockTime::from_seconds(STATE_DEADLINE_SECS));
    match result {
        Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::NoPreroll) => {}
        other => {
            warn!(
                camera = %shared.config.id,
                ?other,
                "NULL transition did not complete within {STATE_DEADLINE_SECS}s, proceeding"
            );
        }
    }
}

/// Sleep-and-relaunch loop. Returns the new pipeline, or `None` when
/// shutdown was requested during the wait.
fn relaunch_with_backoff(shared: &Arc<CaptureShared>) -> Option<gst::Pipeline> {
    let mut backoff = Backoff::new();
    shared
        .backoff_secs
        .store(backoff.current_secs(), Ordering::Relaxed);

    loop {
        let delay = Duration::from_secs(backoff.current_secs());
        debug!(camera = %shared.config.id, ?delay, "backing off before relaunch");
        if !sleep_unless_shutdown(shared, delay) {
            return None;
        }

        match launch(shared) {
            Ok(pipeline) => {
                backoff.reset();
                shared
                    .backoff_secs
                    .store(backoff.current_secs(), Ordering::Relaxed);
                return Some(pipeline);
            }
            Err(e) => {
                backoff.advance();
                shared
                    .backoff_secs
                    .store(backoff.current_secs(), Ordering::Relaxed);
                warn!(
                    camera = %shared.config.id,
                    error = %e,
                    retry_in_secs = backoff.current_secs(),
                    "relaunch failed"
                );
            }
        }
    }
}

/// Sleep in short ticks so a shutdown request is observed promptly.
/// Returns false if shutdown was requested.
fn sleep_unless_shutdown(shared: &CaptureShared, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SHUTDOWN_TICK.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(kind: SourceKind, encoder: EncoderKind) -> CameraConfig {
        CameraConfig {
            id: "cam0".into(),
            name: "Test".into(),
            kind,
            uri: match kind {
                SourceKind::Rtsp => "rtsp://10.0.0.5:554/main".into(),
                SourceKind::Usb => "/dev/video0".into(),
                SourceKind::Test => String::new(),
            },
            width: 1280,
            height: 720,
            fps: 30,
            bitrate_kbps: 2000,
            encoder,
        }
    }

    #[test]
    fn rtsp_description_uses_tcp_and_bounded_sink() {
        let desc = pipeline_description(&camera(SourceKind::Rtsp, EncoderKind::Software));
        assert!(desc.starts_with("rtspsrc location=rtsp://10.0.0.5:554/main"));
        assert!(desc.contains("protocols=tcp"));
        assert!(desc.contains("tcp-timeout=5000000"));
        assert!(desc.contains("retry=3"));
        assert!(desc.contains("rtph264depay"));
        assert!(desc.contains("h264parse config-interval=-1"));
        assert!(desc.contains("stream-format=byte-stream,alignment=au"));
        assert!(desc.contains("max-buffers=2 drop=true"));
        assert!(desc.contains("sync=false"));
        // RTSP sources are already encoded.
        assert!(!desc.contains("x264enc"));
    }

    #[test]
    fn usb_description_encodes_with_x264() {
        let desc = pipeline_description(&camera(SourceKind::Usb, EncoderKind::Software));
        assert!(desc.starts_with("v4l2src device=/dev/video0"));
        assert!(desc.contains("width=1280,height=720,framerate=30/1"));
        assert!(desc.contains("x264enc tune=zerolatency bitrate=2000"));
        assert!(desc.contains("key-int-max=60"));
        assert!(desc.contains("bframes=0 b-adapt=false"));
        assert!(desc.contains("profile=baseline"));
    }

    #[test]
    fn hardware_encoder_uses_vaapi() {
        let desc = pipeline_description(&camera(SourceKind::Usb, EncoderKind::Hardware));
        assert!(desc.contains("vaapih264enc bitrate=2000 keyframe-period=60"));
        assert!(!desc.contains("x264enc"));
        assert!(!desc.contains("profile=baseline"));
    }

    #[test]
    fn test_description_overlays_a_clock() {
        let desc = pipeline_description(&camera(SourceKind::Test, EncoderKind::Software));
        assert!(desc.starts_with("videotestsrc is-live=true pattern=smpte"));
        assert!(desc.contains("clockoverlay"));
        assert!(desc.contains("x264enc"));
    }

    #[test]
    fn encoder_thread_count_is_quarter_of_cores_at_least_one() {
        let threads = encoder_threads();
        assert!(threads >= 1);
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap();
        assert!(threads <= cores);
    }

    #[test]
    fn fresh_pipeline_reports_idle_state() {
        let pipeline = CameraPipeline::new(camera(SourceKind::Test, EncoderKind::Software));
        let state = pipeline.state();
        assert!(!state.running);
        assert_eq!(state.frame_count, 0);
        assert_eq!(state.restart_count, 0);
        assert_eq!(state.backoff_seconds, 1);
        assert_eq!(pipeline.subscription_count(), 0);
    }

    #[test]
    fn never_produced_camera_reports_growing_silence() {
        let pipeline = CameraPipeline::new(camera(SourceKind::Test, EncoderKind::Software));
        std::thread::sleep(Duration::from_millis(30));
        assert!(pipeline.seconds_since_last_frame() > 0.0);
    }

    #[test]
    fn stop_without_start_is_a_noop() {
        let pipeline = CameraPipeline::new(camera(SourceKind::Test, EncoderKind::Software));
        pipeline.stop();
        pipeline.stop();
        assert!(!pipeline.is_running());
    }

    #[test]
    fn subscriptions_survive_stop() {
        let pipeline = CameraPipeline::new(camera(SourceKind::Test, EncoderKind::Software));
        pipeline.register_frame_sink(Box::new(|_| {}));
        pipeline.stop();
        assert_eq!(pipeline.subscription_count(), 1);
    }
}
