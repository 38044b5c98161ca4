//! Encoded video frames handed from capture to subscribers

use bytes::Bytes;

/// One complete H.264 access unit in Annex-B byte-stream form.
///
/// The payload is immutable after emission; `Bytes` lets subscribers share
/// it without copying. `pts_ns` is the source presentation timestamp and is
/// monotonic within a single stream.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// NAL units with Annex-B start codes, one access unit
    pub data: Bytes,
    /// Presentation timestamp in nanoseconds
    pub pts_ns: u64,
    /// True exactly when the unit contains an IDR
    pub is_keyframe: bool,
}

impl AccessUnit {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
