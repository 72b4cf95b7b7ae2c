//! In-process delivery endpoint

use crate::CoreError;
use crate::types::FrameInfo;

/// Result of handing a batch of frames to a destination
///
/// Frames listed in `dropped` were not taken by the destination and go back
/// to the publisher. `error` explains a failed delivery; it never fails the
/// publish call itself.
#[derive(Debug, Default)]
pub struct Delivery {
    pub dropped: Vec<u64>,
    pub error: Option<CoreError>,
}

impl Delivery {
    /// Every frame was taken
    pub fn delivered() -> Self {
        Self::default()
    }

    /// Nothing was taken
    pub fn all_dropped(frames: &[FrameInfo], error: CoreError) -> Self {
        Self {
            dropped: frames.iter().map(|f| f.sequence_number).collect(),
            error: Some(error),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.dropped.is_empty() && self.error.is_none()
    }
}

/// Port of a consuming stream inside this process
pub trait ComponentPort: Send + Sync + 'static {
    /// Push published frames to the consumer
    ///
    /// The consumer hands each taken frame back later through
    /// [`FrameSender::release_frame`](super::FrameSender::release_frame).
    fn send_frames(&self, frames: &[FrameInfo]) -> Delivery;
}
