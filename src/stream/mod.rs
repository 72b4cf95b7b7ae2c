//! Async consumption of buffered frames

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use tokio_stream::wrappers::WatchStream;

use crate::frame::FrameManager;
use crate::types::Frame;

pin_project! {
    /// Stream of frames acquired from a [`FrameManager`]
    ///
    /// Each yielded frame has moved to the received queue exactly as if
    /// [`FrameManager::get`] had been called, so it must still be handed back
    /// with [`FrameManager::remove`].
    pub struct FrameStream {
        manager: Arc<FrameManager>,
        #[pin]
        arrivals: WatchStream<u64>,
    }
}

impl FrameStream {
    /// Create a stream over `manager`'s acquirable frames
    pub fn new(manager: Arc<FrameManager>) -> Self {
        let arrivals = WatchStream::new(manager.subscribe_arrivals());
        Self { manager, arrivals }
    }

    /// The manager frames are acquired from
    pub fn manager(&self) -> &Arc<FrameManager> {
        &self.manager
    }
}

impl Stream for FrameStream {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if let Ok(frame) = this.manager.get() {
                return Poll::Ready(Some(frame));
            }
            // Nothing queued; park until the arrival counter moves
            match ready!(this.arrivals.as_mut().poll_next(cx)) {
                Some(_) => continue,
                None => return Poll::Ready(None),
            }
        }
    }
}
