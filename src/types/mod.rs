//! Core types for frame representation.
//!
//! This module provides the data structures that flow between producers,
//! frame managers, publishers and consumers:
//!
//! - [`FrameInfo`] is the producer's description of a frame: a sequence number,
//!   a send time and one [`ChannelRawData`] per channel
//! - [`Frame`] is a buffered frame as handed to the application, with masked
//!   channels filtered out and user data attached
//! - [`MemoryRef`] names the allocator that owns a channel's raw bytes; frames
//!   never own those bytes themselves
//! - [`StreamEvent`] reports drops back to the owning stream
//!
//! ## Usage Example
//!
//! ```rust
//! use framelink::types::{ChannelRawData, FrameInfo, MemoryRef, NamedAllocator};
//! use std::sync::Arc;
//!
//! let shm = Arc::new(NamedAllocator::new("shm"));
//! let image = ChannelRawData::new(0, "image_data", 1_000)
//!     .with_memory(MemoryRef::new(shm, 0x4000, 4096), 4096, 0);
//!
//! let info = FrameInfo::new(0, vec![image]);
//! assert_eq!(info.channels[0].location().address, 0x4000);
//! ```

mod event;
mod frame;
mod memory;

pub use event::StreamEvent;
pub use frame::{ChannelRawData, Frame, FrameInfo, RawDataLocation};
pub use memory::{
    AllocatorRegistry, DEFAULT_ALLOCATOR_KEY, DEFAULT_ALLOCATOR_NAME, MemoryAllocator, MemoryRef,
    NamedAllocator,
};

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use std::sync::Arc;

    prop_compose! {
        fn arb_channel()(
            channel_id in 0u32..16,
            data_type in "[a-z_]{1,12}",
            captured_timestamp in any::<u64>()
        ) -> ChannelRawData {
            ChannelRawData::new(channel_id, data_type, captured_timestamp)
        }
    }

    proptest! {
        #[test]
        fn prop_masked_channels_never_visible(
            channels in prop::collection::vec(arb_channel(), 0..8),
            mask in prop::collection::vec(0u32..16, 0..6)
        ) {
            let total = channels.len();
            let frame = Frame::new(FrameInfo::new(1, channels), 0, &mask, None);

            for channel in frame.channels() {
                prop_assert!(!mask.contains(&channel.channel_id));
            }
            prop_assert_eq!(frame.info().channels.len(), total);
        }
    }

    #[test]
    fn location_defaults_without_memory() {
        let channel = ChannelRawData::new(3, "meta", 5);
        assert_eq!(channel.location(), RawDataLocation::default());

        let shm: Arc<dyn MemoryAllocator> = Arc::new(NamedAllocator::new("shm"));
        let with_memory = channel.with_memory(MemoryRef::new(shm, 0x10, 8), 8, 2);
        assert_eq!(with_memory.location(), RawDataLocation { address: 0x10, size: 8, offset: 2 });
    }
}
