//! Frame types for the buffering and messaging layers

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::memory::MemoryRef;

/// Location of a channel's raw bytes inside an allocator-owned block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDataLocation {
    /// Address or handle of the block, as understood by the allocator
    pub address: u64,
    /// Size of the raw data in bytes
    pub size: usize,
    /// Offset of the raw data from the start of the block
    pub offset: usize,
}

/// Raw data of one channel
///
/// The frame never owns the bytes. They belong to the allocator named by
/// `memory` and are handed back to the producer when the frame is released.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRawData {
    /// Channel identifier
    pub channel_id: u32,

    /// Backing memory block (None for metadata-only channels)
    pub memory: Option<MemoryRef>,

    /// Size of the raw data in bytes
    pub size: usize,

    /// Offset of the raw data within `memory`
    pub offset: usize,

    /// Raw data type name
    pub data_type: String,

    /// Capture timestamp in nanoseconds
    pub captured_timestamp: u64,
}

impl ChannelRawData {
    /// Create a metadata-only channel entry
    pub fn new(channel_id: u32, data_type: impl Into<String>, captured_timestamp: u64) -> Self {
        Self {
            channel_id,
            memory: None,
            size: 0,
            offset: 0,
            data_type: data_type.into(),
            captured_timestamp,
        }
    }

    /// Attach backing memory to the channel
    pub fn with_memory(mut self, memory: MemoryRef, size: usize, offset: usize) -> Self {
        self.memory = Some(memory);
        self.size = size;
        self.offset = offset;
        self
    }

    /// Location of the raw bytes for transfer to another process
    pub fn location(&self) -> RawDataLocation {
        RawDataLocation {
            address: self.memory.as_ref().map(|m| m.address()).unwrap_or_default(),
            size: self.size,
            offset: self.offset,
        }
    }
}

/// Frame description as produced by a component or publisher
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameInfo {
    /// Sequence number (overwritten by the topic when published)
    pub sequence_number: u64,

    /// Time the frame was sent, in nanoseconds
    pub sent_time: u64,

    /// Per-channel raw data
    pub channels: Vec<ChannelRawData>,
}

impl FrameInfo {
    /// Create a frame description
    pub fn new(sequence_number: u64, channels: Vec<ChannelRawData>) -> Self {
        Self { sequence_number, sent_time: 0, channels }
    }
}

#[derive(Debug)]
struct FrameData {
    info: FrameInfo,
    channels: Vec<ChannelRawData>,
    sent_time: u64,
    user_data: Option<Arc<[u8]>>,
}

/// A buffered frame handed to the application
///
/// Cloning is cheap; clones refer to the same buffered frame. The visible
/// channel list already has masked channels removed.
#[derive(Debug, Clone)]
pub struct Frame {
    inner: Arc<FrameData>,
}

impl Frame {
    pub(crate) fn new(
        info: FrameInfo,
        sent_time: u64,
        masked_channels: &[u32],
        user_data: Option<Arc<[u8]>>,
    ) -> Self {
        let channels = info
            .channels
            .iter()
            .filter(|ch| !masked_channels.contains(&ch.channel_id))
            .cloned()
            .collect();
        Self { inner: Arc::new(FrameData { info, channels, sent_time, user_data }) }
    }

    /// Sequence number assigned by the producer
    pub fn sequence_number(&self) -> u64 {
        self.inner.info.sequence_number
    }

    /// Time the frame was sent
    pub fn sent_time(&self) -> u64 {
        self.inner.sent_time
    }

    /// Unmasked channels
    pub fn channels(&self) -> &[ChannelRawData] {
        &self.inner.channels
    }

    /// Look up an unmasked channel by id
    pub fn channel(&self, channel_id: u32) -> Option<&ChannelRawData> {
        self.inner.channels.iter().find(|ch| ch.channel_id == channel_id)
    }

    /// Ids of the unmasked channels
    pub fn channel_ids(&self) -> Vec<u32> {
        self.inner.channels.iter().map(|ch| ch.channel_id).collect()
    }

    /// User data attached when the frame was admitted
    pub fn user_data(&self) -> Option<&[u8]> {
        self.inner.user_data.as_deref()
    }

    /// The frame description exactly as the producer supplied it
    pub fn info(&self) -> &FrameInfo {
        &self.inner.info
    }

    /// Whether both handles refer to the same buffered frame
    pub fn same_frame(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_hides_channels_but_keeps_original_info() {
        let info = FrameInfo::new(
            9,
            vec![
                ChannelRawData::new(0, "image", 10),
                ChannelRawData::new(1, "depth", 11),
                ChannelRawData::new(2, "imu", 12),
            ],
        );
        let frame = Frame::new(info, 100, &[1], None);

        assert_eq!(frame.channel_ids(), vec![0, 2]);
        assert!(frame.channel(1).is_none());
        assert_eq!(frame.info().channels.len(), 3);
        assert_eq!(frame.sent_time(), 100);
    }

    #[test]
    fn clones_refer_to_the_same_frame() {
        let a = Frame::new(FrameInfo::new(1, vec![]), 0, &[], Some(Arc::from(&b"ud"[..])));
        let b = a.clone();
        let c = Frame::new(FrameInfo::new(1, vec![]), 0, &[], None);

        assert!(a.same_frame(&b));
        assert!(!a.same_frame(&c));
        assert_eq!(b.user_data(), Some(&b"ud"[..]));
    }
}
