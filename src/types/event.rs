//! Events reported to the stream that owns a frame manager

/// Event raised by a frame manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// A frame was dropped without reaching the application
    FrameDropped { sequence_number: u64 },
}

impl StreamEvent {
    /// Sequence number of the frame the event refers to
    pub fn sequence_number(&self) -> u64 {
        match self {
            StreamEvent::FrameDropped { sequence_number } => *sequence_number,
        }
    }
}
