//! End-to-end publisher lifecycles through the public API
//!
//! A local consumer receives frames through a port; a remote consumer is a
//! loopback messenger that answers open/close requests immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use framelink::messenger::{
    ClientMessenger, ComponentPort, Connection, Connector, Delivery, Message, MessageData, MessageDataType,
    MessageType, ReplyStatus,
};
use framelink::{
    ChannelRawData, ClientInstanceConfig, FrameInfo, MessengerConfig, MessengerManager, PublisherSetting,
    PublisherState, ReleaseCallback, Result,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

const CONFIG: &str = r#"
publishers:
  camera: {}
client_instances:
  remote:
    connection: loopback
    address: loopback:0
    reply_timeout_ms: 1000
"#;

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

fn frame() -> FrameInfo {
    FrameInfo::new(0, vec![ChannelRawData::new(0, "image", 0)])
}

fn recorder() -> (ReleaseCallback, Arc<Mutex<Vec<u64>>>) {
    let released = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&released);
    let callback: ReleaseCallback = Arc::new(move |_, frame| sink.lock().push(frame.sequence_number));
    (callback, released)
}

#[derive(Default)]
struct Port {
    frames: Mutex<Vec<FrameInfo>>,
}

impl ComponentPort for Port {
    fn send_frames(&self, frames: &[FrameInfo]) -> Delivery {
        self.frames.lock().extend_from_slice(frames);
        Delivery::delivered()
    }
}

struct Loopback {
    ids: AtomicU64,
    requests: Mutex<Vec<Message>>,
    frames: Mutex<Vec<Message>>,
    stopped: AtomicBool,
    inbound: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl ClientMessenger for Loopback {
    fn next_request_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_request(&self, msg: Message) -> Result<()> {
        self.requests.lock().push(msg);
        Ok(())
    }

    async fn wait_reply(&self, request_id: u64) -> Result<Message> {
        let requests = self.requests.lock();
        let request = requests
            .iter()
            .find(|m| m.header.request_id == request_id)
            .ok_or_else(|| framelink::CoreError::not_found("no such request"))?;
        let data = match request.header.data_type {
            MessageDataType::OpenPublisher => MessageData::OpenPublisherReply { status: ReplyStatus::Ok },
            _ => MessageData::ClosePublisherReply { status: ReplyStatus::Ok },
        };
        let mut reply = Message::reply_to(&request.header, data);
        reply.header.server_stream_id = 42;
        Ok(reply)
    }

    async fn send_frames(&self, msg: Message) -> Result<()> {
        self.frames.lock().push(msg);
        Ok(())
    }

    async fn send_reply(&self, _msg: Message) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct LoopbackConnector {
    connects: AtomicUsize,
    last: Mutex<Option<Arc<Loopback>>>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, _config: &ClientInstanceConfig) -> Result<Connection> {
        let (tx, inbound) = mpsc::unbounded_channel();
        let messenger = Arc::new(Loopback {
            ids: AtomicU64::new(1),
            requests: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            inbound: tx,
        });
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some(Arc::clone(&messenger));
        Ok(Connection { messenger, inbound })
    }
}

/// Server acknowledging frames with a `SendFrame` reply
fn acknowledge(messenger: &Loopback, sequence_numbers: Vec<u64>) {
    let msg = Message {
        header: framelink::messenger::MessageHeader {
            msg_type: MessageType::Reply,
            data_type: MessageDataType::SendFrame,
            request_id: 0,
            server_stream_id: 42,
        },
        data: MessageData::SendFrameReply { sequence_numbers },
    };
    let _ = messenger.inbound.send(msg);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_consumer_survives_publisher_restart() {
    let _ = tracing_subscriber::fmt::try_init();
    let manager = MessengerManager::new(MessengerConfig::from_yaml_str(CONFIG).unwrap());
    manager.init().unwrap();

    let sender = manager.get_frame_sender("camera").await.unwrap();
    let port = Arc::new(Port::default());
    sender.attach_port(port.clone()).unwrap();

    let setting = PublisherSetting::new("camera", "front");
    let (callback, released) = recorder();
    let first = manager.get_publisher(&setting, callback.clone()).await.unwrap();
    assert_eq!(first.publish_frames(vec![frame(), frame()]).await.unwrap(), vec![0, 1]);
    manager.release_publisher(&first).await.unwrap();
    assert_eq!(first.state(), PublisherState::Close);

    let second = manager.get_publisher(&setting, callback).await.unwrap();
    assert_eq!(second.publish_frames(vec![frame()]).await.unwrap(), vec![2]);
    assert_eq!(port.frames.lock().len(), 3);

    let topic = manager.topic("camera").unwrap();
    assert_eq!(topic.records().len(), 2);

    let delivered = port.frames.lock().clone();
    for frame in &delivered[..2] {
        sender.release_frame(frame).unwrap();
    }
    assert!(eventually(|| topic.records().len() == 1).await);
    assert_eq!(*released.lock(), vec![0, 1]);

    manager.exit().await.unwrap();
    assert_eq!(manager.topic_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_publisher_restart_keeps_one_connection() {
    let connector = Arc::new(LoopbackConnector::default());
    let manager = MessengerManager::builder(MessengerConfig::from_yaml_str(CONFIG).unwrap())
        .connector(connector.clone())
        .build();
    manager.init().unwrap();

    let setting = PublisherSetting::new("camera", "front").with_client_instance("remote");
    let (callback, released) = recorder();

    let first = manager.get_publisher(&setting, callback.clone()).await.unwrap();
    first.publish_frames(vec![frame()]).await.unwrap();
    manager.release_publisher(&first).await.unwrap();

    let second = manager.get_publisher(&setting, callback).await.unwrap();
    second.publish_frames(vec![frame()]).await.unwrap();
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

    let messenger = connector.last.lock().clone().unwrap();
    let sent = messenger.frames.lock().clone();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|m| m.header.server_stream_id == 42));

    acknowledge(&messenger, vec![0, 1]);
    assert!(eventually(|| released.lock().len() == 2).await);

    let topic = manager.topic("camera").unwrap();
    assert!(eventually(|| topic.records().len() == 1).await);
    assert!(!messenger.stopped.load(Ordering::SeqCst));

    manager.release_publisher(&second).await.unwrap();
    assert!(eventually(|| messenger.stopped.load(Ordering::SeqCst)).await);
    assert!(eventually(|| manager.topic_count() == 0).await);
    manager.exit().await.unwrap();
}
