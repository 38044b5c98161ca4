//! multicam — multi-camera WebRTC streaming server
//!
//! Ingests H.264 from several camera sources (RTSP, V4L2, test pattern),
//! fans each stream out to connected viewers, and multiplexes all cameras
//! into a single WebRTC session per viewer with WebSocket signaling.

pub mod capture;
pub mod config;
pub mod error;
pub mod signaling;
pub mod supervisor;
pub mod webrtc;

pub use error::{AppError, Result};
