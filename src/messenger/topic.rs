//! Topics: generations of publisher/sender pairs under one name
//!
//! A topic never destroys a generation while frames published through it
//! are still out. Reopening a publisher starts a new generation at once and
//! the old one lingers until it drains; releasable generations are reported
//! through a [`ReleaseNotifier`] and reclaimed by the manager's monitor.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::history::PropertyHistoryBook;
use super::publisher::{Publisher, PublisherState};
use super::sender::{FrameSender, SenderState};
use crate::types::FrameInfo;
use crate::{CoreError, Result};

/// Sends "this topic has releasable records" requests to the monitor
#[derive(Debug, Clone)]
pub struct ReleaseNotifier {
    tx: mpsc::UnboundedSender<String>,
}

impl ReleaseNotifier {
    /// Create a notifier and the receiving end the monitor drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn notify(&self, topic: &str) {
        if self.tx.send(topic.to_string()).is_err() {
            debug!(topic, "Monitor stopped, release request dropped");
        }
    }
}

/// One generation: a publisher, its sender and the frames still out
struct ResourceRecord {
    publisher: Arc<Publisher>,
    sender: Arc<FrameSender>,
    sent_frames: BTreeSet<u64>,
}

impl ResourceRecord {
    fn new(publisher: Publisher, sender: FrameSender) -> Self {
        Self { publisher: Arc::new(publisher), sender: Arc::new(sender), sent_frames: BTreeSet::new() }
    }

    fn is_releasable(&self) -> bool {
        matches!(self.publisher.state(), PublisherState::Init | PublisherState::Close)
            && self.sender.state() == SenderState::Closeable
            && self.sent_frames.is_empty()
    }

    fn owns_publisher(&self, publisher: &Publisher) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.publisher), publisher)
    }
}

/// Observable state of one generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub generation: u64,
    pub publisher_state: PublisherState,
    pub sender_state: SenderState,
    pub sent_frames: Vec<u64>,
}

struct TopicState {
    records: BTreeMap<u64, ResourceRecord>,
    current_id: u64,
    latest_seq_num: u64,
}

/// Registry of generations for one topic name
pub struct MessengerTopic {
    name: String,
    history: PropertyHistoryBook,
    state: Mutex<TopicState>,
    notifier: ReleaseNotifier,
    this: Weak<MessengerTopic>,
}

impl MessengerTopic {
    pub(crate) fn new(name: impl Into<String>, notifier: ReleaseNotifier) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.into(),
            history: PropertyHistoryBook::new(),
            state: Mutex::new(TopicState { records: BTreeMap::new(), current_id: 0, latest_seq_num: 0 }),
            notifier,
            this: this.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Property history shared by every generation
    pub fn history_book(&self) -> &PropertyHistoryBook {
        &self.history
    }

    /// The active generation's publisher and sender
    ///
    /// The first call creates generation 0. When the active publisher is
    /// closed a new generation is started whose sender takes over the old
    /// one's port or connection.
    pub(crate) fn current_record(&self, needs_remote: bool) -> (Arc<Publisher>, Arc<FrameSender>) {
        let (pair, releasable) = {
            let mut state = self.state.lock();
            let current_id = state.current_id;

            let Some(current) = state.records.get(&current_id) else {
                let record = ResourceRecord::new(
                    Publisher::new(self.this.clone(), self.name.clone()),
                    FrameSender::new(self.this.clone(), needs_remote),
                );
                let pair = (Arc::clone(&record.publisher), Arc::clone(&record.sender));
                state.records.insert(current_id, record);
                self.dump_records(&state, "add");
                return pair;
            };

            if current.publisher.state() != PublisherState::Close {
                return (Arc::clone(&current.publisher), Arc::clone(&current.sender));
            }

            let sender = if current.sender.is_remote() == needs_remote {
                current.sender.take_over()
            } else {
                FrameSender::new(self.this.clone(), needs_remote)
            };
            let releasable = current.is_releasable();
            let record = ResourceRecord::new(Publisher::new(self.this.clone(), self.name.clone()), sender);
            let pair = (Arc::clone(&record.publisher), Arc::clone(&record.sender));

            state.current_id += 1;
            let new_id = state.current_id;
            state.records.insert(new_id, record);
            self.dump_records(&state, "add");
            (pair, releasable)
        };

        if releasable {
            self.notify_release();
        }
        pair
    }

    /// Number and publish `frames` through `publisher`'s generation
    ///
    /// Sequence numbers are assigned from the topic counter, overwriting
    /// whatever the caller set. Frames the sender could not deliver are
    /// released back to the publisher; a delivery failure is logged and does
    /// not fail the call.
    pub(crate) async fn publish_frames(&self, publisher: &Publisher, mut frames: Vec<FrameInfo>) -> Result<Vec<u64>> {
        let sender = {
            let mut state = self.state.lock();
            let TopicState { records, latest_seq_num, .. } = &mut *state;
            let record = records
                .values_mut()
                .find(|record| record.owns_publisher(publisher))
                .ok_or_else(|| CoreError::not_found(format!("unmanaged publisher on topic {}", self.name)))?;
            for frame in frames.iter_mut() {
                frame.sequence_number = *latest_seq_num;
                record.sent_frames.insert(*latest_seq_num);
                *latest_seq_num += 1;
            }
            let sender = Arc::clone(&record.sender);
            self.dump_records(&state, "pub");
            sender
        };

        let delivery = sender.publish_frames(&frames).await;
        if let Some(e) = &delivery.error {
            debug!(topic = %self.name, "Failed to send frames: {}", e);
        }

        if !delivery.dropped.is_empty() {
            let releasable = {
                let mut state = self.state.lock();
                let record = state.records.values_mut().find(|record| record.owns_publisher(publisher));
                match record {
                    Some(record) => {
                        for sequence_number in &delivery.dropped {
                            record.sent_frames.remove(sequence_number);
                        }
                        record.is_releasable()
                    }
                    None => false,
                }
            };
            for frame in frames.iter().filter(|f| delivery.dropped.contains(&f.sequence_number)) {
                publisher.release_frame(frame);
            }
            if releasable {
                self.notify_release();
            }
        }

        Ok(frames.iter().map(|f| f.sequence_number).collect())
    }

    /// Hand a published frame back to the publisher that sent it
    ///
    /// Each sequence number can be released once; a second release is
    /// `NotFound`.
    pub fn release_frame(&self, frame: &FrameInfo) -> Result<()> {
        let found = {
            let mut state = self.state.lock();
            let found = state
                .records
                .values_mut()
                .find_map(|record| {
                    record.sent_frames.remove(&frame.sequence_number).then(|| Arc::clone(&record.publisher))
                });
            if found.is_some() {
                self.dump_records(&state, "rel");
            }
            found
        };

        let Some(publisher) = found else {
            return Err(CoreError::not_found(format!(
                "unmanaged frame: seqnum={}",
                frame.sequence_number
            )));
        };

        publisher.release_frame(frame);
        if self.is_releasable_publisher(&publisher) {
            self.notify_release();
        }
        Ok(())
    }

    /// Report that the application is done with `publisher`
    pub(crate) fn release_publisher(&self, publisher: &Publisher) {
        let releasable = {
            let state = self.state.lock();
            let releasable = state
                .records
                .values()
                .find(|record| record.owns_publisher(publisher))
                .is_some_and(ResourceRecord::is_releasable);
            self.dump_records(&state, "rpb");
            releasable
        };
        if releasable {
            self.notify_release();
        }
    }

    /// Report that the consumer is done with `sender`
    pub(crate) fn release_frame_sender(&self, sender: &FrameSender) {
        let releasable = {
            let state = self.state.lock();
            let releasable = state
                .records
                .values()
                .find(|record| std::ptr::eq(Arc::as_ptr(&record.sender), sender))
                .is_some_and(ResourceRecord::is_releasable);
            self.dump_records(&state, "rfs");
            releasable
        };
        if releasable {
            self.notify_release();
        }
    }

    /// Whether any generation is still alive
    pub fn is_referenced(&self) -> bool {
        !self.state.lock().records.is_empty()
    }

    /// Destroy every releasable generation, closing its sender
    ///
    /// Returns the number of generations reclaimed.
    pub(crate) async fn release_unreferenced_resource(&self) -> usize {
        let reclaimed: Vec<(u64, ResourceRecord)> = {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state
                .records
                .iter()
                .filter(|(_, record)| record.is_releasable())
                .map(|(id, _)| *id)
                .collect();
            let reclaimed: Vec<(u64, ResourceRecord)> = ids
                .into_iter()
                .filter_map(|id| state.records.remove(&id).map(|record| (id, record)))
                .collect();
            self.dump_records(&state, "del");
            reclaimed
        };

        for (generation, record) in &reclaimed {
            if let Err(e) = record.sender.close().await {
                warn!(topic = %self.name, generation, "Failed to close sender: {}", e);
            }
        }
        reclaimed.len()
    }

    /// Drop every generation regardless of outstanding frames
    ///
    /// Each dropped sender is closed; a server connection is stopped even
    /// when the server refuses the close.
    pub(crate) async fn release_all_records(&self) -> usize {
        let records = std::mem::take(&mut self.state.lock().records);
        let count = records.len();
        if count > 0 {
            warn!(topic = %self.name, count, "Force-released topic records");
        }
        for record in records.values() {
            record.sender.force_close().await;
        }
        count
    }

    /// Snapshot of every live generation, oldest first
    pub fn records(&self) -> Vec<RecordSnapshot> {
        let state = self.state.lock();
        state
            .records
            .iter()
            .map(|(generation, record)| RecordSnapshot {
                generation: *generation,
                publisher_state: record.publisher.state(),
                sender_state: record.sender.state(),
                sent_frames: record.sent_frames.iter().copied().collect(),
            })
            .collect()
    }

    fn is_releasable_publisher(&self, publisher: &Arc<Publisher>) -> bool {
        self.state
            .lock()
            .records
            .values()
            .find(|record| Arc::ptr_eq(&record.publisher, publisher))
            .is_some_and(ResourceRecord::is_releasable)
    }

    fn notify_release(&self) {
        self.notifier.notify(&self.name);
    }

    fn dump_records(&self, state: &TopicState, op: &str) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }
        let records: Vec<String> = state
            .records
            .iter()
            .map(|(id, record)| {
                format!(
                    "[id:{},p:{:?},f:{:?},s:{:?}]",
                    id,
                    record.publisher.state(),
                    record.sender.state(),
                    record.sent_frames
                )
            })
            .collect();
        debug!(topic = %self.name, op, records = %records.join(", "), "Records");
    }
}

impl std::fmt::Debug for MessengerTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessengerTopic").field("name", &self.name).field("records", &self.records()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Cause;
    use crate::messenger::publisher::ReleaseCallback;
    use crate::test_utils::{RecordingPort, frame_info};
    use crate::types::AllocatorRegistry;
    use proptest::prelude::*;

    fn open(publisher: &Publisher, released: &Arc<Mutex<Vec<u64>>>) {
        let sink = Arc::clone(released);
        let callback: ReleaseCallback = Arc::new(move |_, frame| sink.lock().push(frame.sequence_number));
        publisher
            .open("key", callback, &BTreeMap::new(), &AllocatorRegistry::new())
            .unwrap();
    }

    fn topic() -> (Arc<MessengerTopic>, mpsc::UnboundedReceiver<String>) {
        let (notifier, requests) = ReleaseNotifier::channel();
        (MessengerTopic::new("camera", notifier), requests)
    }

    #[tokio::test]
    async fn sequence_numbers_ignore_caller_values() {
        let (topic, _requests) = topic();
        let (publisher, sender) = topic.current_record(false);
        sender.attach_port(RecordingPort::new()).unwrap();
        open(&publisher, &Arc::new(Mutex::new(Vec::new())));

        let first = publisher.publish_frames(vec![frame_info(99), frame_info(7)]).await.unwrap();
        let second = publisher.publish_frames(vec![frame_info(0)]).await.unwrap();
        assert_eq!(first, vec![0, 1]);
        assert_eq!(second, vec![2]);
        assert_eq!(topic.records()[0].sent_frames, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn release_is_at_most_once() {
        let (topic, mut requests) = topic();
        let (publisher, sender) = topic.current_record(false);
        let port = RecordingPort::new();
        sender.attach_port(port.clone()).unwrap();
        let released = Arc::new(Mutex::new(Vec::new()));
        open(&publisher, &released);

        publisher.publish_frames(vec![frame_info(0)]).await.unwrap();
        let delivered = port.frames();
        sender.release_frame(&delivered[0]).unwrap();
        assert_eq!(*released.lock(), vec![0]);

        let err = sender.release_frame(&delivered[0]).unwrap_err();
        assert_eq!(err.cause(), Cause::NotFound);
        // publisher still open: nothing to reclaim
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_frames_go_back_to_the_publisher() {
        let (topic, _requests) = topic();
        let (publisher, sender) = topic.current_record(false);
        let port = RecordingPort::new();
        port.set_drop_all(true);
        sender.attach_port(port).unwrap();
        let released = Arc::new(Mutex::new(Vec::new()));
        open(&publisher, &released);

        let seqs = publisher.publish_frames(vec![frame_info(0), frame_info(0)]).await.unwrap();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(*released.lock(), vec![0, 1]);
        assert!(topic.records()[0].sent_frames.is_empty());
    }

    #[tokio::test]
    async fn closed_publisher_starts_a_new_generation() {
        let (topic, mut requests) = topic();
        let (first, sender) = topic.current_record(false);
        let port = RecordingPort::new();
        sender.attach_port(port.clone()).unwrap();
        let released = Arc::new(Mutex::new(Vec::new()));
        open(&first, &released);
        first.publish_frames(vec![frame_info(0)]).await.unwrap();

        first.close();
        topic.release_publisher(&first);
        let (second, second_sender) = topic.current_record(false);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second_sender.state(), SenderState::Running);
        assert_eq!(sender.state(), SenderState::Closeable);

        let records = topic.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sent_frames, vec![0]);
        assert!(requests.try_recv().is_err());

        // draining the old generation makes it releasable
        second_sender.release_frame(&port.frames()[0]).unwrap();
        assert_eq!(requests.try_recv().unwrap(), "camera");
        assert_eq!(topic.release_unreferenced_resource().await, 1);
        assert_eq!(topic.records().len(), 1);
        assert_eq!(topic.records()[0].generation, 1);
    }

    #[tokio::test]
    async fn open_publisher_is_returned_again() {
        let (topic, _requests) = topic();
        let (a, _) = topic.current_record(false);
        open(&a, &Arc::new(Mutex::new(Vec::new())));
        let (b, _) = topic.current_record(false);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn unmanaged_publisher_is_not_found() {
        let (topic, _requests) = topic();
        let (other_topic, _other_requests) = {
            let (notifier, requests) = ReleaseNotifier::channel();
            (MessengerTopic::new("other", notifier), requests)
        };
        let (stranger, _) = other_topic.current_record(false);

        let err = topic.publish_frames(&stranger, vec![frame_info(0)]).await.unwrap_err();
        assert_eq!(err.cause(), Cause::NotFound);
    }

    #[tokio::test]
    async fn releasable_requires_all_three_conditions() {
        let (topic, _requests) = topic();
        let (publisher, sender) = topic.current_record(false);
        sender.attach_port(RecordingPort::new()).unwrap();

        // Init publisher, but sender still has a port
        assert_eq!(topic.release_unreferenced_resource().await, 0);

        sender.detach_port();
        assert_eq!(topic.release_unreferenced_resource().await, 1);
        assert!(!topic.is_referenced());
        drop(publisher);
    }

    proptest! {
        #[test]
        fn prop_sequence_numbers_unique_across_generations(batches in prop::collection::vec(1usize..5, 1..6)) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async {
                let (topic, _requests) = topic();
                let released = Arc::new(Mutex::new(Vec::new()));
                let mut seen = Vec::new();
                for size in &batches {
                    let (publisher, sender) = topic.current_record(false);
                    sender.attach_port(RecordingPort::new()).unwrap();
                    open(&publisher, &released);
                    let frames = (0..*size).map(|_| frame_info(0)).collect();
                    seen.extend(publisher.publish_frames(frames).await.unwrap());
                    publisher.close();
                }
                let expected: Vec<u64> = (0..seen.len() as u64).collect();
                assert_eq!(seen, expected);
            });
        }
    }
}
