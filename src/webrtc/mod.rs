//! WebRTC peer sessions and per-camera RTP egress

mod manager;
mod peer;
mod track;

pub use manager::PeerManager;
pub use peer::PeerSession;
pub use track::{TrackFeed, VideoTrack, VideoTrackConfig};
