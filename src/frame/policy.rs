//! Buffering policies deciding how a new arrival is admitted

use serde::{Deserialize, Serialize};

/// Admission policy of a [`FrameManager`](super::FrameManager)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferingPolicy {
    /// Admit only while reserved slots remain; reject the rest
    Discard,

    /// Evict the oldest unconsumed frame when the slots run out
    #[default]
    Overwrite,

    /// Keep only the newest arrival; evict every unconsumed frame first
    Realtime,

    /// Never evict or reject
    Unlimited,
}

/// Outcome of a policy decision for one arrival
///
/// `evict` and `acquirable` are independent: a realtime burst may evict
/// several frames and still produce an acquirable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Number of unconsumed frames to evict from the front of the queue
    pub evict: usize,
    /// Whether a slot is available for the new frame
    pub slot: bool,
    /// Whether the new frame may be handed to the application
    pub acquirable: bool,
}

impl Admission {
    const REJECT: Admission = Admission { evict: 0, slot: false, acquirable: false };
    const ACCEPT: Admission = Admission { evict: 0, slot: true, acquirable: true };
}

impl BufferingPolicy {
    /// Decide how to admit one arrival.
    ///
    /// `queued` is the number of frames waiting for the application and
    /// `reserved` the number of free slots. Evicted frames return their slot
    /// before the new frame takes one.
    pub fn admit(self, queued: usize, reserved: usize) -> Admission {
        match self {
            BufferingPolicy::Discard => {
                if reserved > 0 {
                    Admission::ACCEPT
                } else {
                    Admission::REJECT
                }
            }
            BufferingPolicy::Overwrite => {
                if reserved > 0 {
                    Admission::ACCEPT
                } else if queued > 0 {
                    Admission { evict: 1, slot: true, acquirable: true }
                } else {
                    // every slot is held by the application
                    Admission::REJECT
                }
            }
            BufferingPolicy::Realtime => {
                let slot = reserved + queued > 0;
                Admission { evict: queued, slot, acquirable: slot }
            }
            BufferingPolicy::Unlimited => Admission::ACCEPT,
        }
    }

    /// Whether admissions take a reserved slot
    pub fn uses_reservation(self) -> bool {
        !matches!(self, BufferingPolicy::Unlimited)
    }
}
