//! Application-facing publisher handle

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::topic::MessengerTopic;
use crate::types::{AllocatorRegistry, DEFAULT_ALLOCATOR_KEY, DEFAULT_ALLOCATOR_NAME, FrameInfo, MemoryAllocator};
use crate::{CoreError, Result, ResultExt};

/// Lifecycle of a publisher; `Close` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublisherState {
    Init,
    Open,
    Close,
}

/// Called once for every published frame handed back by its consumer
pub type ReleaseCallback = Arc<dyn Fn(&PublisherParam<'_>, &FrameInfo) + Send + Sync>;

/// View of the publisher passed to a [`ReleaseCallback`]
pub struct PublisherParam<'a> {
    publisher: &'a Publisher,
    user_data: u64,
}

impl PublisherParam<'_> {
    /// Allocator configured under `name`
    pub fn allocator(&self, name: &str) -> Result<Arc<dyn MemoryAllocator>> {
        self.publisher.allocator(name)
    }

    /// Stream key the publisher was opened with
    pub fn key(&self) -> String {
        self.publisher.key()
    }

    /// Value set with [`Publisher::set_callback_user_data`]
    pub fn user_data(&self) -> u64 {
        self.user_data
    }
}

struct PublisherInner {
    state: PublisherState,
    key: String,
    callback: Option<ReleaseCallback>,
    callback_user_data: u64,
    allocators: BTreeMap<String, Arc<dyn MemoryAllocator>>,
}

/// Publishes frames on one topic generation
///
/// Obtained from [`MessengerManager::get_publisher`](super::MessengerManager::get_publisher).
pub struct Publisher {
    topic: Weak<MessengerTopic>,
    topic_name: String,
    inner: Mutex<PublisherInner>,
}

impl Publisher {
    pub(crate) fn new(topic: Weak<MessengerTopic>, topic_name: impl Into<String>) -> Self {
        Self {
            topic,
            topic_name: topic_name.into(),
            inner: Mutex::new(PublisherInner {
                state: PublisherState::Init,
                key: String::new(),
                callback: None,
                callback_user_data: 0,
                allocators: BTreeMap::new(),
            }),
        }
    }

    /// Move from `Init` to `Open`
    ///
    /// `allocator_keys` maps allocator names to registry keys; when it is
    /// empty the default allocator is installed under
    /// [`DEFAULT_ALLOCATOR_NAME`].
    pub fn open(
        &self,
        key: &str,
        callback: ReleaseCallback,
        allocator_keys: &BTreeMap<String, String>,
        registry: &AllocatorRegistry,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != PublisherState::Init {
            return Err(CoreError::invalid_operation("already initialized"));
        }

        let mut allocators = BTreeMap::new();
        for (name, allocator_key) in allocator_keys {
            allocators.insert(name.clone(), registry.get(allocator_key).traced()?);
        }
        if allocators.is_empty() {
            allocators
                .insert(DEFAULT_ALLOCATOR_NAME.to_string(), registry.get(DEFAULT_ALLOCATOR_KEY).traced()?);
        }

        inner.key = key.to_string();
        inner.callback = Some(callback);
        inner.allocators = allocators;
        inner.state = PublisherState::Open;
        debug!(topic = %self.topic_name, key, "Publisher opened");
        Ok(())
    }

    /// Enter the terminal `Close` state
    ///
    /// Allocators stay installed because frames may still be released after
    /// close.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state != PublisherState::Close {
            debug!(topic = %self.topic_name, key = %inner.key, "Publisher closed");
        }
        inner.state = PublisherState::Close;
    }

    pub fn state(&self) -> PublisherState {
        self.inner.lock().state
    }

    /// Stream key given at open
    pub fn key(&self) -> String {
        self.inner.lock().key.clone()
    }

    /// Name of the topic this publisher belongs to
    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    /// Publish frames, returning the sequence numbers the topic assigned
    ///
    /// Caller-supplied sequence numbers are ignored.
    pub async fn publish_frames(&self, frames: Vec<FrameInfo>) -> Result<Vec<u64>> {
        if self.state() != PublisherState::Open {
            return Err(CoreError::invalid_operation("publisher is not open"));
        }
        let topic = self.topic()?;
        topic.publish_frames(self, frames).await.traced()
    }

    /// Allocator configured under `name`
    pub fn allocator(&self, name: &str) -> Result<Arc<dyn MemoryAllocator>> {
        self.inner
            .lock()
            .allocators
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("not found allocator name={}", name)))
    }

    /// Record a new serialized property value attached to later frames
    pub fn set_update_channel_property(&self, channel_id: u32, key: &str, property: &[u8]) -> Result<()> {
        let topic = self.topic()?;
        topic.history_book().set_property(channel_id, key, property);
        Ok(())
    }

    /// Value handed to the release callback
    pub fn set_callback_user_data(&self, user_data: u64) {
        self.inner.lock().callback_user_data = user_data;
    }

    pub(crate) fn topic(&self) -> Result<Arc<MessengerTopic>> {
        self.topic
            .upgrade()
            .ok_or_else(|| CoreError::invalid_operation(format!("topic {} was released", self.topic_name)))
    }

    /// Invoke the release callback for a frame handed back by a consumer
    pub(crate) fn release_frame(&self, frame: &FrameInfo) {
        let (callback, user_data) = {
            let inner = self.inner.lock();
            (inner.callback.clone(), inner.callback_user_data)
        };
        match callback {
            Some(callback) => callback(&PublisherParam { publisher: self, user_data }, frame),
            None => debug!(
                topic = %self.topic_name,
                sequence_number = frame.sequence_number,
                "Released frame has no callback"
            ),
        }
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Publisher")
            .field("topic", &self.topic_name)
            .field("key", &inner.key)
            .field("state", &inner.state)
            .field("allocators", &inner.allocators.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cause;
    use crate::types::NamedAllocator;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn noop() -> ReleaseCallback {
        Arc::new(|_, _| {})
    }

    fn detached() -> Publisher {
        Publisher::new(Weak::new(), "camera")
    }

    #[test]
    fn open_installs_default_allocator_when_none_configured() {
        let publisher = detached();
        publisher.open("key", noop(), &BTreeMap::new(), &AllocatorRegistry::new()).unwrap();

        assert_eq!(publisher.state(), PublisherState::Open);
        assert_eq!(publisher.allocator(DEFAULT_ALLOCATOR_NAME).unwrap().key(), DEFAULT_ALLOCATOR_KEY);
        assert_eq!(publisher.allocator("image").err().map(|e| e.cause()), Some(Cause::NotFound));
    }

    #[test]
    fn open_resolves_configured_allocators() {
        let mut registry = AllocatorRegistry::new();
        registry.register(Arc::new(NamedAllocator::new("shm_image")));
        let keys = BTreeMap::from([("image".to_string(), "shm_image".to_string())]);

        let publisher = detached();
        publisher.open("key", noop(), &keys, &registry).unwrap();
        assert_eq!(publisher.allocator("image").unwrap().key(), "shm_image");
        assert!(publisher.allocator(DEFAULT_ALLOCATOR_NAME).is_err());
    }

    #[test]
    fn unknown_allocator_key_leaves_publisher_in_init() {
        let keys = BTreeMap::from([("image".to_string(), "missing".to_string())]);
        let publisher = detached();

        let err = publisher.open("key", noop(), &keys, &AllocatorRegistry::new()).unwrap_err();
        assert_eq!(err.cause(), Cause::NotFound);
        assert_eq!(publisher.state(), PublisherState::Init);
    }

    #[test]
    fn open_twice_is_invalid_operation() {
        let publisher = detached();
        let registry = AllocatorRegistry::new();
        publisher.open("key", noop(), &BTreeMap::new(), &registry).unwrap();

        let err = publisher.open("key", noop(), &BTreeMap::new(), &registry).unwrap_err();
        assert_eq!(err.cause(), Cause::InvalidOperation);

        publisher.close();
        let err = publisher.open("key", noop(), &BTreeMap::new(), &registry).unwrap_err();
        assert_eq!(err.cause(), Cause::InvalidOperation);
    }

    #[test]
    fn release_callback_sees_user_data_and_allocators_after_close() {
        let seen = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&seen);
        let callback: ReleaseCallback = Arc::new(move |param, frame| {
            assert!(param.allocator(DEFAULT_ALLOCATOR_NAME).is_ok());
            assert_eq!(param.key(), "stream-key");
            sink.store(param.user_data() + frame.sequence_number, Ordering::SeqCst);
        });

        let publisher = detached();
        publisher.open("stream-key", callback, &BTreeMap::new(), &AllocatorRegistry::new()).unwrap();
        publisher.set_callback_user_data(100);
        publisher.close();
        publisher.release_frame(&FrameInfo::new(5, vec![]));

        assert_eq!(seen.load(Ordering::SeqCst), 105);
    }

    #[tokio::test]
    async fn publish_requires_open_state() {
        let publisher = detached();
        let err = publisher.publish_frames(vec![FrameInfo::default()]).await.unwrap_err();
        assert_eq!(err.cause(), Cause::InvalidOperation);
    }
}
