//! Messenger manager: topic registry and background reclamation
//!
//! The manager is reference counted. The first [`MessengerManager::init`]
//! spawns a monitor task that reclaims releasable generations whenever a
//! topic reports one; the matching last [`MessengerManager::exit`] stops the
//! monitor and force-releases every topic.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::publisher::{Publisher, ReleaseCallback};
use super::sender::FrameSender;
use super::topic::{MessengerTopic, ReleaseNotifier};
use super::transport::Connector;
use crate::config::{MessengerConfig, requires_server};
use crate::types::AllocatorRegistry;
use crate::{CoreError, Result, ResultExt};

/// What an application asks for when it opens a publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherSetting {
    /// Publisher instance, also the topic name
    pub instance_name: String,
    /// Stream key handed to the publisher and the server
    pub stream_key: String,
    /// Server endpoint; `None` or `localhost` delivers in-process
    pub client_instance: Option<String>,
}

impl PublisherSetting {
    pub fn new(instance_name: impl Into<String>, stream_key: impl Into<String>) -> Self {
        Self { instance_name: instance_name.into(), stream_key: stream_key.into(), client_instance: None }
    }

    pub fn with_client_instance(mut self, client_instance: impl Into<String>) -> Self {
        self.client_instance = Some(client_instance.into());
        self
    }
}

struct MonitorTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct MonitorState {
    reference_count: usize,
    task: Option<MonitorTask>,
    notifier: Option<ReleaseNotifier>,
}

struct ManagerInner {
    config: MessengerConfig,
    registry: AllocatorRegistry,
    connector: Option<Arc<dyn Connector>>,
    topics: Mutex<BTreeMap<String, Arc<MessengerTopic>>>,
    monitor: Mutex<MonitorState>,
    /// Serializes publisher/sender acquisition against reclamation
    lifecycle: tokio::sync::Mutex<()>,
}

impl ManagerInner {
    /// Reclaim what `name` reported releasable, then drop empty topics
    async fn sweep(&self, name: &str) -> usize {
        let _lifecycle = self.lifecycle.lock().await;
        let topic = self.topics.lock().get(name).cloned();
        let Some(topic) = topic else {
            debug!(topic = name, "Release request for unknown topic");
            return 0;
        };
        let reclaimed = topic.release_unreferenced_resource().await;
        debug!(topic = name, reclaimed, "Swept topic");
        self.release_unreferenced_topic();
        reclaimed
    }

    fn release_unreferenced_topic(&self) -> usize {
        let mut topics = self.topics.lock();
        let before = topics.len();
        topics.retain(|name, topic| {
            let keep = topic.is_referenced();
            if !keep {
                debug!(topic = %name, "Topic released");
            }
            keep
        });
        before - topics.len()
    }

    async fn release_all_topics(&self) -> usize {
        let topics = std::mem::take(&mut *self.topics.lock());
        let count = topics.len();
        for topic in topics.values() {
            topic.release_all_records().await;
        }
        if count > 0 {
            info!(count, "Released all topics");
        }
        count
    }
}

/// Builder for [`MessengerManager`]
pub struct MessengerManagerBuilder {
    config: MessengerConfig,
    registry: AllocatorRegistry,
    connector: Option<Arc<dyn Connector>>,
}

impl MessengerManagerBuilder {
    /// Allocators publishers may resolve
    pub fn allocators(mut self, registry: AllocatorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Connector used for publishers bound to a server
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> MessengerManager {
        MessengerManager {
            inner: Arc::new(ManagerInner {
                config: self.config,
                registry: self.registry,
                connector: self.connector,
                topics: Mutex::new(BTreeMap::new()),
                monitor: Mutex::new(MonitorState::default()),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }
}

/// Hands out publishers and frame senders, and reclaims them
///
/// Cloning is cheap; every clone shares the same registry.
#[derive(Clone)]
pub struct MessengerManager {
    inner: Arc<ManagerInner>,
}

impl MessengerManager {
    /// Manager with the default allocator and no server connector
    pub fn new(config: MessengerConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: MessengerConfig) -> MessengerManagerBuilder {
        MessengerManagerBuilder { config, registry: AllocatorRegistry::new(), connector: None }
    }

    /// Take a reference, starting the monitor on the first one
    ///
    /// Must be called inside a tokio runtime.
    pub fn init(&self) -> Result<()> {
        let mut monitor = self.inner.monitor.lock();
        if monitor.reference_count == 0 {
            let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
                CoreError::aborted("messenger monitor needs a tokio runtime", Some(Box::new(e)))
            })?;
            let (notifier, requests) = ReleaseNotifier::channel();
            let cancel = CancellationToken::new();
            let handle =
                runtime.spawn(monitor_task(Arc::downgrade(&self.inner), requests, cancel.clone()));
            monitor.task = Some(MonitorTask { handle, cancel });
            monitor.notifier = Some(notifier);
        }
        monitor.reference_count += 1;
        debug!(reference_count = monitor.reference_count, "Messenger manager initialized");
        Ok(())
    }

    /// Drop a reference; the last one stops the monitor and releases all topics
    ///
    /// Release requests already queued are handled before the monitor stops.
    pub async fn exit(&self) -> Result<()> {
        let task = {
            let mut monitor = self.inner.monitor.lock();
            if monitor.reference_count > 1 {
                monitor.reference_count -= 1;
                debug!(reference_count = monitor.reference_count, "Messenger manager released");
                return Ok(());
            }
            monitor.reference_count = 0;
            monitor.notifier = None;
            monitor.task.take()
        };

        if let Some(MonitorTask { handle, cancel }) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!("Messenger monitor ended abnormally: {}", e);
            }
        }
        self.inner.release_all_topics().await;
        Ok(())
    }

    /// Take a reference released with [`ManagerGuard::release`]
    pub fn acquire(&self) -> Result<ManagerGuard> {
        self.init()?;
        Ok(ManagerGuard { manager: Some(self.clone()) })
    }

    /// Whether the monitor task is alive
    pub fn is_running(&self) -> bool {
        self.inner.monitor.lock().task.as_ref().is_some_and(|task| !task.handle.is_finished())
    }

    pub fn reference_count(&self) -> usize {
        self.inner.monitor.lock().reference_count
    }

    /// Open a publisher on the topic named by `setting.instance_name`
    ///
    /// The instance must be configured. When the setting names a server
    /// endpoint the generation's sender connects to it, or reuses the
    /// connection a previous generation left behind. On failure nothing
    /// opened by this call stays open.
    pub async fn get_publisher(
        &self,
        setting: &PublisherSetting,
        callback: ReleaseCallback,
    ) -> Result<Arc<Publisher>> {
        let notifier = self.notifier()?;
        let instance = self.inner.config.publisher(&setting.instance_name).traced()?;
        let remote = requires_server(setting.client_instance.as_deref());

        let lifecycle = self.inner.lifecycle.lock().await;
        let (topic, publisher, sender) = self.acquire_record(&setting.instance_name, remote, notifier);

        let mut status = publisher
            .open(&setting.stream_key, callback, &instance.allocator_keys, &self.inner.registry)
            .traced();
        let opened = status.is_ok();
        if opened && remote {
            status = self.open_server_sender(setting, &sender).await.traced();
        }

        if let Err(e) = status {
            if opened {
                publisher.close();
            }
            topic.release_publisher(&publisher);
            drop(lifecycle);
            self.inner.release_unreferenced_topic();
            return Err(e);
        }

        debug!(topic = %setting.instance_name, key = %setting.stream_key, remote, "Publisher acquired");
        Ok(publisher)
    }

    /// Close `publisher` and let its generation be reclaimed once drained
    pub async fn release_publisher(&self, publisher: &Publisher) -> Result<()> {
        {
            let _lifecycle = self.inner.lifecycle.lock().await;
            publisher.close();
            match publisher.topic() {
                Ok(topic) => topic.release_publisher(publisher),
                Err(e) => debug!("Publisher released after its topic: {}", e),
            }
        }
        self.inner.release_unreferenced_topic();
        Ok(())
    }

    /// The in-process sender of the topic's current generation
    ///
    /// Consumers attach their port to it with [`FrameSender::attach_port`].
    /// When the current generation is a closed remote one, a new generation
    /// starts with a fresh in-process sender and the old one keeps its
    /// connection until it drains. An open remote generation hands back its
    /// server sender, which has no port to attach.
    pub async fn get_frame_sender(&self, name: &str) -> Result<Arc<FrameSender>> {
        let notifier = self.notifier()?;
        let _lifecycle = self.inner.lifecycle.lock().await;
        let (_topic, _publisher, sender) = self.acquire_record(name, false, notifier);
        debug!(topic = name, "Frame sender acquired");
        Ok(sender)
    }

    /// Detach the consumer from `sender` and let its generation be reclaimed
    pub async fn release_frame_sender(&self, sender: &FrameSender) -> Result<()> {
        {
            let _lifecycle = self.inner.lifecycle.lock().await;
            sender.detach_port();
            match sender.topic() {
                Ok(topic) => topic.release_frame_sender(sender),
                Err(e) => debug!("Frame sender released after its topic: {}", e),
            }
        }
        self.inner.release_unreferenced_topic();
        Ok(())
    }

    /// Drop topics with no generation left, returning how many went
    pub fn release_unreferenced_topic(&self) -> usize {
        self.inner.release_unreferenced_topic()
    }

    pub fn topic(&self, name: &str) -> Option<Arc<MessengerTopic>> {
        self.inner.topics.lock().get(name).cloned()
    }

    pub fn topic_count(&self) -> usize {
        self.inner.topics.lock().len()
    }

    fn notifier(&self) -> Result<ReleaseNotifier> {
        self.inner
            .monitor
            .lock()
            .notifier
            .clone()
            .ok_or_else(|| CoreError::invalid_operation("messenger manager is not initialized"))
    }

    /// Find or create the topic and take its current generation atomically
    fn acquire_record(
        &self,
        name: &str,
        remote: bool,
        notifier: ReleaseNotifier,
    ) -> (Arc<MessengerTopic>, Arc<Publisher>, Arc<FrameSender>) {
        let mut topics = self.inner.topics.lock();
        let topic = match topics.get(name) {
            Some(topic) => Arc::clone(topic),
            None => {
                let topic = MessengerTopic::new(name, notifier);
                topics.insert(name.to_string(), Arc::clone(&topic));
                debug!(topic = name, "Topic created");
                topic
            }
        };
        let (publisher, sender) = topic.current_record(remote);
        (topic, publisher, sender)
    }

    async fn open_server_sender(&self, setting: &PublisherSetting, sender: &FrameSender) -> Result<()> {
        let name = setting.client_instance.as_deref().unwrap_or_default();
        let client = self.inner.config.client_instance(name)?;
        let connector = self
            .inner
            .connector
            .as_ref()
            .ok_or_else(|| CoreError::invalid_operation("no server connector configured"))?;
        let server = sender.as_server().ok_or_else(|| {
            CoreError::invalid_operation(format!("topic {} delivers in-process", setting.instance_name))
        })?;
        server.open(&setting.stream_key, client, connector.as_ref()).await
    }
}

impl std::fmt::Debug for MessengerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessengerManager")
            .field("reference_count", &self.reference_count())
            .field("topics", &self.inner.topics.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A manager reference taken with [`MessengerManager::acquire`]
///
/// Give it back with [`ManagerGuard::release`]. A guard dropped without
/// release exits on a spawned task when a runtime is available.
pub struct ManagerGuard {
    manager: Option<MessengerManager>,
}

impl ManagerGuard {
    pub fn manager(&self) -> Option<&MessengerManager> {
        self.manager.as_ref()
    }

    pub async fn release(mut self) -> Result<()> {
        match self.manager.take() {
            Some(manager) => manager.exit().await,
            None => Ok(()),
        }
    }
}

impl Drop for ManagerGuard {
    fn drop(&mut self) {
        let Some(manager) = self.manager.take() else {
            return;
        };
        warn!("Manager guard dropped without release");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = manager.exit().await {
                        warn!("Deferred manager exit failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime to exit the messenger manager; reference leaked"),
        }
    }
}

async fn monitor_task(
    inner: Weak<ManagerInner>,
    mut requests: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    info!("Messenger monitor started");
    let mut reclaimed = 0usize;
    loop {
        let name = tokio::select! {
            biased;
            name = requests.recv() => match name {
                Some(name) => name,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        reclaimed += inner.sweep(&name).await;
    }
    info!(reclaimed, "Messenger monitor stopped");
}
