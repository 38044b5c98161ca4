//! Camera capture: GStreamer pipelines, restart supervision and frame fan-out

mod backoff;
mod frame;
mod pipeline;
mod registry;

pub use frame::AccessUnit;
pub use pipeline::{CameraPipeline, CameraState};
pub use registry::{FrameSink, SinkRegistry, SubscriptionId};
