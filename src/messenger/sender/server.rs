//! Frame sender that forwards frames to a remote server
//!
//! Frames sent to the server stay pending until the server hands them back,
//! either in a `SendFrame` reply or in a `ReleaseFrame` request. The pending
//! map travels with the connection, so a sender generation that takes over a
//! connection also takes over the frames still out on it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::SenderState;
use crate::config::ClientInstanceConfig;
use crate::messenger::history::PropertyHistoryBook;
use crate::messenger::port::Delivery;
use crate::messenger::topic::MessengerTopic;
use crate::messenger::transport::{
    ChannelMessage, ClientMessenger, Connection, Connector, FrameMessage, Message, MessageData,
    MessageDataType, MessageHeader, MessageType, PropertyMessage, ReplyStatus,
};
use crate::types::FrameInfo;
use crate::{CoreError, Result, ResultExt};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// Delivers frames over a server connection
///
/// Running while frames sent on its connection await release.
pub struct ServerFrameSender {
    topic: Weak<MessengerTopic>,
    link: Mutex<Option<Arc<ServerLink>>>,
}

impl ServerFrameSender {
    pub(crate) fn new(topic: Weak<MessengerTopic>) -> Self {
        Self { topic, link: Mutex::new(None) }
    }

    /// Build the next generation's sender, moving the connection and its
    /// pending frames out of `old`
    pub(crate) fn take_over(old: &ServerFrameSender) -> Self {
        let link = old.link.lock().take();
        debug!(
            server_stream_id = link.as_ref().map(|l| l.server_stream_id),
            "Server sender taken over"
        );
        Self { topic: old.topic.clone(), link: Mutex::new(link) }
    }

    /// Running iff its connection has frames awaiting release
    ///
    /// A sender that took over an idle connection reports `Closeable` before
    /// its publisher opens. Publisher acquisition holds the manager's
    /// lifecycle lock until the open completes, so the monitor cannot reclaim
    /// that generation in between.
    pub fn state(&self) -> SenderState {
        match self.link.lock().as_ref() {
            Some(link) if link.pending_count() > 0 => SenderState::Running,
            _ => SenderState::Closeable,
        }
    }

    /// Whether this sender holds a connection
    pub fn is_connected(&self) -> bool {
        self.link.lock().as_ref().is_some_and(|link| link.messenger.is_connected())
    }

    /// Stream id the server assigned at open
    pub fn server_stream_id(&self) -> Option<u64> {
        self.link.lock().as_ref().map(|link| link.server_stream_id)
    }

    /// Number of frames awaiting release by the server
    pub fn pending_count(&self) -> usize {
        self.link.lock().as_ref().map(|link| link.pending_count()).unwrap_or_default()
    }

    /// Connect and open the remote publisher unless a connection was taken over
    pub async fn open(
        &self,
        key: &str,
        config: &ClientInstanceConfig,
        connector: &dyn Connector,
    ) -> Result<()> {
        if let Some(link) = self.link.lock().as_ref() {
            debug!(server_stream_id = link.server_stream_id, "Reusing server connection");
            return Ok(());
        }

        let Connection { messenger, inbound } = connector.connect(config).await.traced()?;
        let reply_timeout = config.reply_timeout();

        let server_stream_id = match open_remote(messenger.as_ref(), key, reply_timeout).await {
            Ok(id) => id,
            Err(e) => {
                if let Err(stop) = messenger.stop().await {
                    warn!("Failed to stop messenger after open failure: {}", stop);
                }
                return Err(e);
            }
        };

        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        let link = Arc::new(ServerLink {
            messenger,
            server_stream_id,
            reply_timeout,
            topic: self.topic.clone(),
            pending: Mutex::new(BTreeMap::new()),
            viewer: format!("server-link-{}", id),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(inbound_task(Arc::downgrade(&link), inbound, link.cancel.clone()));

        info!(server_stream_id, address = %config.address, "Remote publisher opened");
        *self.link.lock() = Some(link);
        Ok(())
    }

    /// Close the remote publisher and drop the connection
    ///
    /// A connection that is already gone counts as closed. On any other
    /// failure the connection is kept so close can be retried.
    pub async fn close(&self) -> Result<()> {
        let Some(link) = self.link.lock().take() else {
            return Ok(());
        };
        if let Err(e) = link.disconnect().await {
            *self.link.lock() = Some(link);
            return Err(e);
        }
        Ok(())
    }

    /// Close, stopping the transport even when the server refuses
    pub(crate) async fn force_close(&self) {
        let Err(e) = self.close().await else {
            return;
        };
        let Some(link) = self.link.lock().take() else {
            return;
        };
        warn!(server_stream_id = link.server_stream_id, "Close refused, stopping transport: {}", e);
        link.stop().await;
    }

    pub(crate) async fn publish_frames(&self, frames: &[FrameInfo]) -> Delivery {
        if frames.is_empty() {
            return Delivery::delivered();
        }
        let link = self.link.lock().clone();
        match link {
            Some(link) => link.publish(frames).await,
            None => Delivery::all_dropped(frames, CoreError::disconnected("server sender is not connected")),
        }
    }
}

impl std::fmt::Debug for ServerFrameSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerFrameSender")
            .field("server_stream_id", &self.server_stream_id())
            .field("pending", &self.pending_count())
            .finish()
    }
}

async fn request(
    messenger: &dyn ClientMessenger,
    data_type: MessageDataType,
    server_stream_id: u64,
    data: MessageData,
    timeout: Duration,
) -> Result<Message> {
    let request_id = messenger.next_request_id();
    messenger
        .send_request(Message::request(data_type, request_id, server_stream_id, data))
        .await
        .traced()?;
    match tokio::time::timeout(timeout, messenger.wait_reply(request_id)).await {
        Ok(reply) => reply.traced(),
        Err(_) => Err(CoreError::timed_out(format!("{:?} reply (req_id={})", data_type, request_id), timeout)),
    }
}

async fn open_remote(messenger: &dyn ClientMessenger, key: &str, timeout: Duration) -> Result<u64> {
    let reply = request(
        messenger,
        MessageDataType::OpenPublisher,
        0,
        MessageData::OpenPublisherRequest { key: key.to_string() },
        timeout,
    )
    .await?;
    reply.reply_status().traced()?;
    Ok(reply.header.server_stream_id)
}

struct ServerLink {
    messenger: Arc<dyn ClientMessenger>,
    server_stream_id: u64,
    reply_timeout: Duration,
    topic: Weak<MessengerTopic>,
    pending: Mutex<BTreeMap<u64, FrameInfo>>,
    /// Identity used for updated-property tracking
    viewer: String,
    cancel: CancellationToken,
}

impl ServerLink {
    fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    async fn publish(&self, frames: &[FrameInfo]) -> Delivery {
        let Some(topic) = self.topic.upgrade() else {
            return Delivery::all_dropped(frames, CoreError::invalid_operation("topic was released"));
        };
        let book = topic.history_book();
        let message_frames: Vec<FrameMessage> =
            frames.iter().map(|frame| self.frame_message(book, frame)).collect();

        {
            let mut pending = self.pending.lock();
            for frame in frames {
                pending.insert(frame.sequence_number, frame.clone());
            }
        }

        let msg = Message {
            header: MessageHeader {
                msg_type: MessageType::SendFrame,
                data_type: MessageDataType::SendFrame,
                request_id: self.messenger.next_request_id(),
                server_stream_id: self.server_stream_id,
            },
            data: MessageData::SendFrame { frames: message_frames },
        };

        match self.messenger.send_frames(msg).await {
            Ok(()) => Delivery::delivered(),
            Err(e) => {
                let mut pending = self.pending.lock();
                for frame in frames {
                    pending.remove(&frame.sequence_number);
                }
                Delivery::all_dropped(frames, e)
            }
        }
    }

    fn frame_message(&self, book: &PropertyHistoryBook, frame: &FrameInfo) -> FrameMessage {
        let channels = frame
            .channels
            .iter()
            .map(|channel| {
                let snapshot = book.reference_current_properties(channel.channel_id);
                let properties = snapshot
                    .iter()
                    .filter_map(|(key, history_id)| {
                        book.get_property(channel.channel_id, key, *history_id)
                            .ok()
                            .map(|data| PropertyMessage { key: key.clone(), data: data.to_vec() })
                    })
                    .collect();
                let updated_property_keys = book.updated_property_list(&self.viewer, channel.channel_id);
                book.release_properties(channel.channel_id, &snapshot);

                ChannelMessage {
                    channel_id: channel.channel_id,
                    allocator_key: channel
                        .memory
                        .as_ref()
                        .map(|m| m.allocator_key().to_string())
                        .unwrap_or_default(),
                    rawdata: channel.location(),
                    rawdata_type: channel.data_type.clone(),
                    timestamp: channel.captured_timestamp,
                    properties,
                    updated_property_keys,
                }
            })
            .collect();

        FrameMessage {
            sequence_number: frame.sequence_number,
            sent_time: frame.sent_time,
            channels,
        }
    }

    /// Hand one pending frame back to its topic
    fn release_pending(&self, sequence_number: u64) -> Result<()> {
        let frame = self.pending.lock().remove(&sequence_number);
        let Some(frame) = frame else {
            warn!(sequence_number, "Pending release not found");
            return Err(CoreError::not_found(format!("unmanaged frame: seqnum={}", sequence_number)));
        };
        trace!(sequence_number, server_stream_id = self.server_stream_id, "Pending release popped");
        let topic = self
            .topic
            .upgrade()
            .ok_or_else(|| CoreError::invalid_operation("topic was released"))?;
        topic.release_frame(&frame).traced()
    }

    async fn handle_inbound(&self, msg: Message) {
        let header = msg.header;
        match (header.msg_type, msg.data) {
            (MessageType::Reply, MessageData::SendFrameReply { sequence_numbers }) => {
                for sequence_number in sequence_numbers {
                    if let Err(e) = self.release_pending(sequence_number) {
                        debug!(sequence_number, "Release by send reply failed: {}", e);
                    }
                }
            }
            (MessageType::Request, MessageData::ReleaseFrameRequest { sequence_number }) => {
                let status = self.release_pending(sequence_number);
                let reply = Message::reply_to(
                    &header,
                    MessageData::ReleaseFrameReply { status: ReplyStatus::from_result(&status) },
                );
                if let Err(e) = self.messenger.send_reply(reply).await {
                    warn!(request_id = header.request_id, "Failed to answer release request: {}", e);
                }
            }
            (msg_type, _) => {
                warn!(?msg_type, data_type = ?header.data_type, "Unknown message ignored");
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let closed = async {
            let reply = request(
                self.messenger.as_ref(),
                MessageDataType::ClosePublisher,
                self.server_stream_id,
                MessageData::ClosePublisherRequest,
                self.reply_timeout,
            )
            .await?;
            reply.reply_status()
        }
        .await;

        match closed {
            Ok(()) => {}
            Err(e) if !self.messenger.is_connected() => {
                warn!(server_stream_id = self.server_stream_id, "Disconnected during close: {}", e);
            }
            Err(e) => return Err(e),
        }

        self.cancel.cancel();
        self.messenger.stop().await.traced()?;
        self.forget_viewer();
        info!(server_stream_id = self.server_stream_id, "Remote publisher closed");
        Ok(())
    }

    /// Drop the connection without a close handshake
    async fn stop(&self) {
        self.cancel.cancel();
        if let Err(e) = self.messenger.stop().await {
            warn!(server_stream_id = self.server_stream_id, "Failed to stop messenger: {}", e);
        }
        self.forget_viewer();
    }

    fn forget_viewer(&self) {
        if let Some(topic) = self.topic.upgrade() {
            topic.history_book().remove_viewer(&self.viewer);
        }
    }
}

impl Drop for ServerLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn inbound_task(
    link: Weak<ServerLink>,
    mut inbound: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    debug!("Inbound task started");
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => {
                    debug!("Inbound channel closed");
                    break;
                }
            },
        };
        let Some(link) = link.upgrade() else {
            break;
        };
        link.handle_inbound(msg).await;
    }
    debug!("Inbound task ended");
}
