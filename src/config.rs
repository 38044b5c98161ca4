//! Server configuration
//!
//! Loaded once at startup from a YAML file and treated as immutable for the
//! lifetime of the process. Every subsystem receives the validated record
//! (or the slice of it that it needs) by value.

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Kind of camera source feeding a capture pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Network camera delivering H.264 over RTSP
    Rtsp,
    /// Local V4L2 device producing raw video that we encode
    Usb,
    /// Synthetic test pattern with a clock overlay
    Test,
}

/// H.264 encoder selection for USB/TEST sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    /// x264 software encoder
    Software,
    /// VAAPI hardware encoder
    Hardware,
}

impl Default for EncoderKind {
    fn default() -> Self {
        EncoderKind::Software
    }
}

/// One camera entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Short stable identifier, unique across the process
    pub id: String,
    /// Human-readable display name
    pub name: String,
    /// Source kind
    #[serde(rename = "type")]
    pub kind: SourceKind,
    /// RTSP URL or V4L2 device path; unused for test sources
    #[serde(default)]
    pub uri: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Target encoder bitrate in kbit/s (USB/TEST only)
    #[serde(default = "default_bitrate", alias = "bitrate")]
    pub bitrate_kbps: u32,
    /// Encoder backend (USB/TEST only)
    #[serde(default)]
    pub encoder: EncoderKind,
}

fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_fps() -> u32 {
    30
}
fn default_bitrate() -> u32 {
    2000
}

/// Listener settings for the signaling endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(alias = "bind")]
    pub bind_address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8554,
        }
    }
}

/// WebRTC session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URL; empty disables STUN (LAN-only deployments)
    pub stun_server: String,
    /// Admission ceiling for concurrent viewers
    pub max_clients: usize,
    /// RTP payload budget per packet in bytes
    pub mtu: usize,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_server: String::new(),
            max_clients: 3,
            mtu: 1200,
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
}

impl AppConfig {
    /// Parse a YAML document. Does not validate; call [`AppConfig::validate`].
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| AppError::Config(format!("invalid YAML: {e}")))
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_yaml(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(AppError::Config("no cameras configured".into()));
        }
        if self.webrtc.max_clients == 0 {
            return Err(AppError::Config("max_clients must be at least 1".into()));
        }
        if self.webrtc.mtu < 576 {
            return Err(AppError::Config(format!(
                "mtu {} is too small for RTP",
                self.webrtc.mtu
            )));
        }
        self.server
            .bind_address
            .parse::<IpAddr>()
            .map_err(|_| AppError::Config(format!("invalid bind address: {}", self.server.bind_address)))?;

        let mut seen = std::collections::HashSet::new();
        for cam in &self.cameras {
            if cam.id.is_empty() {
                return Err(AppError::Config("camera id must not be empty".into()));
            }
            if !seen.insert(cam.id.as_str()) {
                return Err(AppError::Config(format!("duplicate camera id: {}", cam.id)));
            }
            if cam.width == 0 || cam.height == 0 || cam.fps == 0 {
                return Err(AppError::Config(format!(
                    "camera {}: width/height/fps must be non-zero",
                    cam.id
                )));
            }
            match cam.kind {
                SourceKind::Rtsp | SourceKind::Usb if cam.uri.is_empty() => {
                    return Err(AppError::Config(format!(
                        "camera {}: uri is required for rtsp/usb sources",
                        cam.id
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  bind: 127.0.0.1
  port: 9000

cameras:
  - id: cam_front
    name: Front
    type: rtsp
    uri: rtsp://10.0.0.10:554/stream1
  - id: cam_test
    name: Pattern
    type: test
    width: 640
    height: 480
    fps: 30
    bitrate: 1000

webrtc:
  stun_server: stun:stun.l.google.com:19302
  max_clients: 2
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind_address, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.webrtc.max_clients, 2);
        assert_eq!(config.webrtc.mtu, 1200);

        let front = &config.cameras[0];
        assert_eq!(front.kind, SourceKind::Rtsp);
        assert_eq!(front.width, 1280);
        assert_eq!(front.fps, 30);
        assert_eq!(front.encoder, EncoderKind::Software);

        let test = &config.cameras[1];
        assert_eq!(test.kind, SourceKind::Test);
        assert_eq!(test.bitrate_kbps, 1000);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut config = AppConfig::from_yaml(SAMPLE).unwrap();
        config.cameras[1].id = "cam_front".into();
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn rejects_missing_uri() {
        let mut config = AppConfig::from_yaml(SAMPLE).unwrap();
        config.cameras[0].uri.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_camera_list() {
        let config = AppConfig::from_yaml("cameras: []").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_bind_address() {
        let mut config = AppConfig::from_yaml(SAMPLE).unwrap();
        config.server.bind_address = "not-an-ip".into();
        assert!(config.validate().is_err());
    }
}
