//! Test doubles shared by unit tests and benchmarks
//!
//! [`RecordingOwner`] and [`RecordingPort`] capture what a frame manager or
//! sender hands them. [`ScriptedConnector`] opens [`ScriptedMessenger`]s that
//! answer open/close requests from a script instead of a real server.

#![cfg(any(test, feature = "benchmark"))]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::ClientInstanceConfig;
use crate::frame::FrameOwner;
use crate::messenger::{
    ClientMessenger, ComponentPort, Connection, Connector, Delivery, Message, MessageData, MessageDataType,
    ReplyStatus,
};
use crate::types::{ChannelRawData, FrameInfo, StreamEvent};
use crate::{CoreError, Result};

/// Frame with channels 0 (image), 1 (depth) and 2 (imu)
pub fn frame_info(sequence_number: u64) -> FrameInfo {
    let timestamp = sequence_number * 1_000;
    FrameInfo::new(
        sequence_number,
        vec![
            ChannelRawData::new(0, "image", timestamp),
            ChannelRawData::new(1, "depth", timestamp),
            ChannelRawData::new(2, "imu", timestamp),
        ],
    )
}

/// Poll `condition` for up to two seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[derive(Default)]
struct OwnerLog {
    arrivals: Vec<u64>,
    dropped: Vec<u64>,
    released: Vec<(u64, Vec<u32>)>,
    fail_release: bool,
}

/// Frame owner that records every callback
#[derive(Default)]
pub struct RecordingOwner {
    log: Mutex<OwnerLog>,
}

impl RecordingOwner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn arrivals(&self) -> Vec<u64> {
        self.log.lock().arrivals.clone()
    }

    /// Sequence numbers reported through `FrameDropped` events
    pub fn dropped(&self) -> Vec<u64> {
        self.log.lock().dropped.clone()
    }

    /// Released frames with their referenced channel ids
    pub fn released(&self) -> Vec<(u64, Vec<u32>)> {
        self.log.lock().released.clone()
    }

    pub fn released_sequence_numbers(&self) -> Vec<u64> {
        self.log.lock().released.iter().map(|(seq, _)| *seq).collect()
    }

    /// Make `release_frame_info` fail until reset
    pub fn set_fail_release(&self, fail: bool) {
        self.log.lock().fail_release = fail;
    }
}

impl FrameOwner for RecordingOwner {
    fn frame_arrived(&self, info: &FrameInfo) -> Result<()> {
        self.log.lock().arrivals.push(info.sequence_number);
        Ok(())
    }

    fn send_event(&self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::FrameDropped { sequence_number } => self.log.lock().dropped.push(sequence_number),
        }
        Ok(())
    }

    fn release_frame_info(&self, info: &FrameInfo, referenced_channel_ids: &[u32]) -> Result<()> {
        let mut log = self.log.lock();
        if log.fail_release {
            return Err(CoreError::aborted("scripted release failure", None));
        }
        log.released.push((info.sequence_number, referenced_channel_ids.to_vec()));
        Ok(())
    }
}

/// Consumer port that keeps every frame it is sent
#[derive(Default)]
pub struct RecordingPort {
    frames: Mutex<Vec<FrameInfo>>,
    drop_all: AtomicBool,
}

impl RecordingPort {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delivered(&self) -> Vec<u64> {
        self.frames.lock().iter().map(|f| f.sequence_number).collect()
    }

    pub fn frames(&self) -> Vec<FrameInfo> {
        self.frames.lock().clone()
    }

    /// Refuse every frame as if the consumer's buffers were full
    pub fn set_drop_all(&self, drop_all: bool) {
        self.drop_all.store(drop_all, Ordering::SeqCst);
    }
}

impl ComponentPort for RecordingPort {
    fn send_frames(&self, frames: &[FrameInfo]) -> Delivery {
        if self.drop_all.load(Ordering::SeqCst) {
            return Delivery::all_dropped(frames, CoreError::resource_exhausted("port buffers full"));
        }
        self.frames.lock().extend_from_slice(frames);
        Delivery::delivered()
    }
}

/// How scripted messengers answer
#[derive(Debug, Clone)]
struct Script {
    server_stream_id: u64,
    silent: bool,
    open_status: ReplyStatus,
    fail_connect: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self { server_stream_id: 1, silent: false, open_status: ReplyStatus::Ok, fail_connect: false }
    }
}

#[derive(Default)]
struct Traffic {
    requests: VecDeque<Message>,
    frames: Vec<Message>,
    replies: Vec<Message>,
}

/// Client messenger answering requests from a script
pub struct ScriptedMessenger {
    script: Script,
    close_status: Mutex<ReplyStatus>,
    request_ids: AtomicU64,
    connected: AtomicBool,
    stopped: AtomicBool,
    fail_sends: AtomicBool,
    traffic: Mutex<Traffic>,
    inbound: mpsc::UnboundedSender<Message>,
}

impl ScriptedMessenger {
    fn new(script: Script, inbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            script,
            close_status: Mutex::new(ReplyStatus::Ok),
            request_ids: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
            traffic: Mutex::new(Traffic::default()),
            inbound,
        }
    }

    /// Deliver a message as if the server had sent it
    pub fn inject(&self, msg: Message) {
        let _ = self.inbound.send(msg);
    }

    pub fn sent_requests(&self) -> Vec<Message> {
        self.traffic.lock().requests.iter().cloned().collect()
    }

    pub fn sent_frames(&self) -> Vec<Message> {
        self.traffic.lock().frames.clone()
    }

    /// Replies sent back to the server
    pub fn replies(&self) -> Vec<Message> {
        self.traffic.lock().replies.clone()
    }

    /// Drop the connection; later sends fail
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn set_close_status(&self, status: ReplyStatus) {
        *self.close_status.lock() = status;
    }

    /// Make frame sends fail while the connection stays up
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    fn check_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::disconnected("scripted connection dropped"))
        }
    }

    fn reply_for(&self, request_id: u64) -> Result<Message> {
        let traffic = self.traffic.lock();
        let request = traffic
            .requests
            .iter()
            .find(|msg| msg.header.request_id == request_id)
            .ok_or_else(|| CoreError::not_found(format!("no request {}", request_id)))?;

        let reply = match request.header.data_type {
            MessageDataType::OpenPublisher => {
                let mut reply = Message::reply_to(
                    &request.header,
                    MessageData::OpenPublisherReply { status: self.script.open_status.clone() },
                );
                reply.header.server_stream_id = self.script.server_stream_id;
                reply
            }
            MessageDataType::ClosePublisher => Message::reply_to(
                &request.header,
                MessageData::ClosePublisherReply { status: self.close_status.lock().clone() },
            ),
            other => {
                return Err(CoreError::invalid_argument(format!("unscripted request {:?}", other)));
            }
        };
        Ok(reply)
    }
}

#[async_trait]
impl ClientMessenger for ScriptedMessenger {
    fn next_request_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_request(&self, msg: Message) -> Result<()> {
        self.check_connected()?;
        self.traffic.lock().requests.push_back(msg);
        Ok(())
    }

    async fn wait_reply(&self, request_id: u64) -> Result<Message> {
        if self.script.silent {
            return futures::future::pending().await;
        }
        self.reply_for(request_id)
    }

    async fn send_frames(&self, msg: Message) -> Result<()> {
        self.check_connected()?;
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CoreError::resource_exhausted("scripted send failure"));
        }
        self.traffic.lock().frames.push(msg);
        Ok(())
    }

    async fn send_reply(&self, msg: Message) -> Result<()> {
        self.check_connected()?;
        self.traffic.lock().replies.push(msg);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out scripted messengers
#[derive(Default)]
pub struct ScriptedConnector {
    script: Mutex<Script>,
    messengers: Mutex<Vec<Arc<ScriptedMessenger>>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream id returned in later open replies
    pub fn set_server_stream_id(&self, server_stream_id: u64) {
        self.script.lock().server_stream_id = server_stream_id;
    }

    /// Never answer requests on later connections
    pub fn set_silent(&self, silent: bool) {
        self.script.lock().silent = silent;
    }

    pub fn set_open_status(&self, status: ReplyStatus) {
        self.script.lock().open_status = status;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.script.lock().fail_connect = fail;
    }

    /// Most recently opened messenger
    pub fn last(&self) -> Option<Arc<ScriptedMessenger>> {
        self.messengers.lock().last().cloned()
    }

    /// Number of successful connects
    pub fn connects(&self) -> usize {
        self.messengers.lock().len()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, config: &ClientInstanceConfig) -> Result<Connection> {
        let script = self.script.lock().clone();
        if script.fail_connect {
            return Err(CoreError::disconnected(format!("{} refused the connection", config.address)));
        }
        let (tx, inbound) = mpsc::unbounded_channel();
        let messenger = Arc::new(ScriptedMessenger::new(script, tx));
        self.messengers.lock().push(Arc::clone(&messenger));
        Ok(Connection { messenger, inbound })
    }
}
