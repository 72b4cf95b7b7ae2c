//! Publishing frames to in-process or remote consumers.
//!
//! Frames flow publisher → topic → sender → consumer:
//!
//! - [`MessengerManager`] hands out a [`Publisher`] to producing applications
//!   and a [`FrameSender`] to consuming components, keyed by topic name
//! - [`MessengerTopic`] numbers frames and tracks which are still out, one
//!   generation per publisher lifetime
//! - [`FrameSender`] delivers either to a [`ComponentPort`] in this process
//!   or over a [`ClientMessenger`] connection to a server
//!
//! Reopening a publisher does not tear down its consumer: the new generation
//! takes over the old sender's port or connection, and the old generation is
//! reclaimed by the manager's monitor once every frame it sent is released.
//!
//! ```rust,no_run
//! use framelink::config::MessengerConfig;
//! use framelink::messenger::{MessengerManager, PublisherSetting, ReleaseCallback};
//! use framelink::types::FrameInfo;
//! use std::sync::Arc;
//!
//! # async fn run() -> framelink::Result<()> {
//! let config = MessengerConfig::from_file("messenger.yaml")?;
//! let manager = MessengerManager::new(config);
//! manager.init()?;
//!
//! let on_release: ReleaseCallback = Arc::new(|_, frame| println!("released {}", frame.sequence_number));
//! let publisher = manager.get_publisher(&PublisherSetting::new("camera", "front"), on_release).await?;
//! publisher.publish_frames(vec![FrameInfo::default()]).await?;
//!
//! manager.release_publisher(&publisher).await?;
//! manager.exit().await?;
//! # Ok(())
//! # }
//! ```

mod history;
mod manager;
mod port;
mod publisher;
mod sender;
mod topic;
mod transport;

pub use history::{PropertyHistoryBook, PropertySnapshot};
pub use manager::{ManagerGuard, MessengerManager, MessengerManagerBuilder, PublisherSetting};
pub use port::{ComponentPort, Delivery};
pub use publisher::{Publisher, PublisherParam, PublisherState, ReleaseCallback};
pub use sender::{FrameSender, InnerFrameSender, SenderState, ServerFrameSender};
pub use topic::{MessengerTopic, RecordSnapshot, ReleaseNotifier};
pub use transport::{
    ChannelMessage, ClientMessenger, Connection, Connector, FrameMessage, Message, MessageData,
    MessageDataType, MessageHeader, MessageType, PropertyMessage, ReplyStatus,
};
