//! Server transport: message model and client messenger seams
//!
//! The core only builds and reads these messages; encoding them on the wire
//! is the business of the [`ClientMessenger`] implementation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::ClientInstanceConfig;
use crate::types::RawDataLocation;
use crate::{Cause, CoreError, Result};

/// Message framing kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Request,
    Reply,
    SendFrame,
}

/// Payload kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDataType {
    OpenPublisher,
    ClosePublisher,
    SendFrame,
    ReleaseFrame,
    /// A kind this core does not handle
    Other(u32),
}

/// Header shared by every message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub data_type: MessageDataType,
    pub request_id: u64,
    pub server_stream_id: u64,
}

/// Status carried in a reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    Ok,
    Failed { cause: Cause, message: String },
}

impl ReplyStatus {
    pub fn from_result(result: &Result<()>) -> Self {
        match result {
            Ok(()) => ReplyStatus::Ok,
            Err(e) => ReplyStatus::Failed { cause: e.cause(), message: e.to_string() },
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            ReplyStatus::Ok => Ok(()),
            ReplyStatus::Failed { cause, message } => Err(CoreError::remote(cause, message)),
        }
    }
}

/// Serialized property value attached to a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyMessage {
    pub key: String,
    pub data: Vec<u8>,
}

/// One channel of a frame sent to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub channel_id: u32,
    pub allocator_key: String,
    pub rawdata: RawDataLocation,
    pub rawdata_type: String,
    pub timestamp: u64,
    pub properties: Vec<PropertyMessage>,
    pub updated_property_keys: Vec<String>,
}

/// One frame sent to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMessage {
    pub sequence_number: u64,
    pub sent_time: u64,
    pub channels: Vec<ChannelMessage>,
}

/// Message payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageData {
    OpenPublisherRequest { key: String },
    OpenPublisherReply { status: ReplyStatus },
    ClosePublisherRequest,
    ClosePublisherReply { status: ReplyStatus },
    SendFrame { frames: Vec<FrameMessage> },
    SendFrameReply { sequence_numbers: Vec<u64> },
    ReleaseFrameRequest { sequence_number: u64 },
    ReleaseFrameReply { status: ReplyStatus },
    Empty,
}

/// A framed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    pub data: MessageData,
}

impl Message {
    /// Build a request
    pub fn request(
        data_type: MessageDataType,
        request_id: u64,
        server_stream_id: u64,
        data: MessageData,
    ) -> Self {
        Self {
            header: MessageHeader {
                msg_type: MessageType::Request,
                data_type,
                request_id,
                server_stream_id,
            },
            data,
        }
    }

    /// Build the reply to `request`, echoing its routing fields
    pub fn reply_to(request: &MessageHeader, data: MessageData) -> Self {
        Self { header: MessageHeader { msg_type: MessageType::Reply, ..*request }, data }
    }

    /// Status of a reply, if the payload carries one
    pub fn reply_status(&self) -> Result<()> {
        match &self.data {
            MessageData::OpenPublisherReply { status }
            | MessageData::ClosePublisherReply { status }
            | MessageData::ReleaseFrameReply { status } => status.clone().into_result(),
            other => Err(CoreError::invalid_argument(format!(
                "reply {:?} carries no status: {:?}",
                self.header.data_type, other
            ))),
        }
    }
}

/// Connection to a server as seen by a frame sender
#[async_trait]
pub trait ClientMessenger: Send + Sync + 'static {
    /// Allocate a request id for a new request
    fn next_request_id(&self) -> u64;

    /// Send a command request
    async fn send_request(&self, msg: Message) -> Result<()>;

    /// Wait for the reply to `request_id`; the caller bounds the wait
    async fn wait_reply(&self, request_id: u64) -> Result<Message>;

    /// Send a frame message
    async fn send_frames(&self, msg: Message) -> Result<()>;

    /// Answer a request from the server
    async fn send_reply(&self, msg: Message) -> Result<()>;

    /// Whether the underlying connection is still up
    fn is_connected(&self) -> bool;

    /// Tear the connection down
    async fn stop(&self) -> Result<()>;
}

/// An established connection plus the server's unsolicited messages
pub struct Connection {
    pub messenger: Arc<dyn ClientMessenger>,
    /// Requests from the server and replies to frame messages
    pub inbound: mpsc::UnboundedReceiver<Message>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("connected", &self.messenger.is_connected()).finish()
    }
}

/// Opens connections to servers
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, config: &ClientInstanceConfig) -> Result<Connection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_echoes_routing_fields() {
        let request = Message::request(
            MessageDataType::ReleaseFrame,
            42,
            0xbeef,
            MessageData::ReleaseFrameRequest { sequence_number: 3 },
        );
        let reply = Message::reply_to(
            &request.header,
            MessageData::ReleaseFrameReply { status: ReplyStatus::Ok },
        );

        assert_eq!(reply.header.msg_type, MessageType::Reply);
        assert_eq!(reply.header.request_id, 42);
        assert_eq!(reply.header.server_stream_id, 0xbeef);
        assert_eq!(reply.header.data_type, MessageDataType::ReleaseFrame);
        assert!(reply.reply_status().is_ok());
    }

    #[test]
    fn failed_status_becomes_remote_error() {
        let status = ReplyStatus::from_result(&Err(CoreError::not_found("no such key")));
        let err = status.into_result().unwrap_err();
        assert_eq!(err.cause(), Cause::NotFound);
        assert!(err.to_string().contains("no such key"));
    }

    #[test]
    fn payload_without_status_is_invalid() {
        let msg = Message::request(MessageDataType::SendFrame, 1, 0, MessageData::Empty);
        assert_eq!(msg.reply_status().unwrap_err().cause(), Cause::InvalidArgument);
    }
}
