//! Frame buffering between a producing component and the application.
//!
//! A [`FrameManager`] holds two queues: frames waiting to be acquired and
//! frames the application currently holds. How a new arrival is admitted
//! when the reserved slots run out is decided by its [`BufferingPolicy`].
//!
//! ```rust
//! use framelink::frame::{BufferingPolicy, FrameManager, FrameOwner};
//! use framelink::types::{FrameInfo, StreamEvent};
//! use std::sync::Arc;
//!
//! struct Stream;
//!
//! impl FrameOwner for Stream {
//!     fn frame_arrived(&self, _info: &FrameInfo) -> framelink::Result<()> {
//!         Ok(())
//!     }
//!     fn send_event(&self, event: StreamEvent) -> framelink::Result<()> {
//!         println!("dropped {}", event.sequence_number());
//!         Ok(())
//!     }
//!     fn release_frame_info(&self, _info: &FrameInfo, _channels: &[u32]) -> framelink::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let manager = FrameManager::new(BufferingPolicy::Overwrite);
//! manager.init(2, Arc::new(Stream))?;
//! for seq in 0..4 {
//!     manager.set(FrameInfo::new(seq, vec![]), 0)?;
//! }
//! let frame = manager.get()?;
//! assert_eq!(frame.sequence_number(), 2);
//! manager.remove(&frame, false)?;
//! # Ok::<(), framelink::CoreError>(())
//! ```

mod manager;
mod policy;

pub use manager::{FrameBufferInfo, FrameManager, FrameOwner, SetOutcome};
pub use policy::{Admission, BufferingPolicy};
