//! In-process frame sender

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::SenderState;
use crate::CoreError;
use crate::messenger::port::{ComponentPort, Delivery};
use crate::types::FrameInfo;

/// Delivers frames to a consumer's port in this process
///
/// Running while a port is attached.
#[derive(Default)]
pub struct InnerFrameSender {
    port: Mutex<Option<Arc<dyn ComponentPort>>>,
}

impl InnerFrameSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the next generation's sender, moving the port out of `old`
    pub(crate) fn take_over(old: &InnerFrameSender) -> Self {
        let port = old.port.lock().take();
        debug!(port_attached = port.is_some(), "Inner sender taken over");
        Self { port: Mutex::new(port) }
    }

    pub fn attach_port(&self, port: Arc<dyn ComponentPort>) {
        *self.port.lock() = Some(port);
    }

    pub fn detach_port(&self) {
        self.port.lock().take();
    }

    pub fn state(&self) -> SenderState {
        if self.port.lock().is_some() { SenderState::Running } else { SenderState::Closeable }
    }

    pub(crate) fn publish_frames(&self, frames: &[FrameInfo]) -> Delivery {
        let port = self.port.lock().clone();
        match port {
            Some(port) => port.send_frames(frames),
            None => Delivery::all_dropped(frames, CoreError::not_found("unconnected port")),
        }
    }
}

impl std::fmt::Debug for InnerFrameSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InnerFrameSender").field("state", &self.state()).finish()
    }
}
