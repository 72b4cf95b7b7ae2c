//! Frame buffering and publish/subscribe plumbing for sensor streams.
//!
//! Framelink sits between components that produce sensor frames and the
//! applications that consume them.
//!
//! # Features
//!
//! - **Buffering policies**: discard, overwrite, realtime and unlimited
//!   queues with skip rates and channel masks ([`frame`])
//! - **Async consumption**: frames as a `futures::Stream` ([`stream`])
//! - **Publishers**: generation-tracked topics that survive publisher
//!   restarts without dropping their consumers ([`messenger`])
//! - **Remote delivery**: frames forwarded over a pluggable server
//!   connection with per-channel property history
//!
//! # Quick Start
//!
//! ```rust
//! use framelink::{BufferingPolicy, FrameManager, FrameStream, FrameOwner, FrameInfo, StreamEvent};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! struct Sink;
//!
//! impl FrameOwner for Sink {
//!     fn frame_arrived(&self, _info: &FrameInfo) -> framelink::Result<()> { Ok(()) }
//!     fn send_event(&self, _event: StreamEvent) -> framelink::Result<()> { Ok(()) }
//!     fn release_frame_info(&self, _info: &FrameInfo, _channels: &[u32]) -> framelink::Result<()> { Ok(()) }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> framelink::Result<()> {
//!     let manager = Arc::new(FrameManager::new(BufferingPolicy::Realtime));
//!     manager.init(1, Arc::new(Sink))?;
//!     manager.set(FrameInfo::new(0, vec![]), 0)?;
//!
//!     let mut frames = FrameStream::new(Arc::clone(&manager));
//!     if let Some(frame) = frames.next().await {
//!         manager.remove(&frame, false)?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
mod error;
pub mod frame;
pub mod messenger;
pub mod stream;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

pub use config::{BufferConfig, ClientInstanceConfig, MessengerConfig, PublisherInstanceConfig};
pub use error::*;
pub use frame::{BufferingPolicy, FrameBufferInfo, FrameManager, FrameOwner, SetOutcome};
pub use messenger::{
    FrameSender, MessengerManager, Publisher, PublisherSetting, PublisherState, ReleaseCallback, SenderState,
};
pub use stream::FrameStream;
pub use types::*;
