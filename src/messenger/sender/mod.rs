//! Frame senders deliver published frames to their consumer
//!
//! A sender is either in-process ([`InnerFrameSender`]) or remote
//! ([`ServerFrameSender`]). When a publisher cycles, the next generation's
//! sender is built with [`FrameSender::take_over`], which moves the live
//! port or connection out of the old sender and leaves it `Closeable`.

mod inner;
mod server;

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

pub use inner::InnerFrameSender;
pub use server::ServerFrameSender;

use super::port::{ComponentPort, Delivery};
use super::topic::MessengerTopic;
use crate::types::FrameInfo;
use crate::{CoreError, Result};

/// Whether a sender still has work outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderState {
    Running,
    Closeable,
}

#[derive(Debug)]
enum SenderKind {
    Inner(InnerFrameSender),
    Server(ServerFrameSender),
}

/// Sender of one topic generation
#[derive(Debug)]
pub struct FrameSender {
    topic: Weak<MessengerTopic>,
    kind: SenderKind,
}

impl FrameSender {
    pub(crate) fn new(topic: Weak<MessengerTopic>, remote: bool) -> Self {
        let kind = if remote {
            SenderKind::Server(ServerFrameSender::new(topic.clone()))
        } else {
            SenderKind::Inner(InnerFrameSender::new())
        };
        Self { topic, kind }
    }

    /// Build the next generation's sender from this one
    ///
    /// This sender is left `Closeable` with only the bookkeeping it cannot
    /// hand over.
    pub(crate) fn take_over(&self) -> Self {
        let kind = match &self.kind {
            SenderKind::Inner(old) => SenderKind::Inner(InnerFrameSender::take_over(old)),
            SenderKind::Server(old) => SenderKind::Server(ServerFrameSender::take_over(old)),
        };
        Self { topic: self.topic.clone(), kind }
    }

    pub fn state(&self) -> SenderState {
        match &self.kind {
            SenderKind::Inner(inner) => inner.state(),
            SenderKind::Server(server) => server.state(),
        }
    }

    /// Whether frames cross a server connection
    pub fn is_remote(&self) -> bool {
        matches!(self.kind, SenderKind::Server(_))
    }

    pub fn as_inner(&self) -> Option<&InnerFrameSender> {
        match &self.kind {
            SenderKind::Inner(inner) => Some(inner),
            SenderKind::Server(_) => None,
        }
    }

    pub fn as_server(&self) -> Option<&ServerFrameSender> {
        match &self.kind {
            SenderKind::Server(server) => Some(server),
            SenderKind::Inner(_) => None,
        }
    }

    /// Bind a consumer port; only in-process senders have one
    pub fn attach_port(&self, port: Arc<dyn ComponentPort>) -> Result<()> {
        self.as_inner()
            .ok_or_else(|| CoreError::invalid_operation("server sender has no port"))?
            .attach_port(port);
        Ok(())
    }

    /// Unbind the consumer port, if any
    pub fn detach_port(&self) {
        if let Some(inner) = self.as_inner() {
            inner.detach_port();
        }
    }

    pub(crate) async fn publish_frames(&self, frames: &[FrameInfo]) -> Delivery {
        match &self.kind {
            SenderKind::Inner(inner) => inner.publish_frames(frames),
            SenderKind::Server(server) => server.publish_frames(frames).await,
        }
    }

    /// Hand a delivered frame back to the topic it was published on
    pub fn release_frame(&self, frame: &FrameInfo) -> Result<()> {
        self.topic()?.release_frame(frame)
    }

    pub(crate) fn topic(&self) -> Result<Arc<MessengerTopic>> {
        self.topic.upgrade().ok_or_else(|| CoreError::invalid_operation("topic was released"))
    }

    /// Shut the sender down
    pub async fn close(&self) -> Result<()> {
        match &self.kind {
            SenderKind::Inner(inner) => {
                inner.detach_port();
                Ok(())
            }
            SenderKind::Server(server) => server.close().await,
        }
    }

    /// Shut the sender down, dropping a server connection even if the
    /// server refuses to close the remote publisher
    pub(crate) async fn force_close(&self) {
        match &self.kind {
            SenderKind::Inner(inner) => inner.detach_port(),
            SenderKind::Server(server) => server.force_close().await,
        }
    }
}
