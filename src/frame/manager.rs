//! Frame manager: policy-driven buffering between a producer and the application

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::policy::BufferingPolicy;
use crate::config::BufferConfig;
use crate::types::{Frame, FrameInfo, StreamEvent};
use crate::{CoreError, Result, ResultExt};

/// The stream a frame manager reports to
///
/// Callbacks are invoked without any manager lock held.
pub trait FrameOwner: Send + Sync + 'static {
    /// A new acquirable frame was queued
    fn frame_arrived(&self, info: &FrameInfo) -> Result<()>;

    /// Deliver an event such as a frame drop
    fn send_event(&self, event: StreamEvent) -> Result<()>;

    /// Hand a frame back to the producing component.
    ///
    /// `referenced_channel_ids` lists the channels whose raw data the
    /// application accessed; it is empty when none was touched.
    fn release_frame_info(&self, info: &FrameInfo, referenced_channel_ids: &[u32]) -> Result<()>;
}

/// Result of offering one arrival to the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    /// The frame was queued; `evicted` lists frames dropped to make room
    Queued { evicted: Vec<u64>, acquirable: bool },
    /// Dropped by the skip rate
    Skipped,
    /// No slot was available
    Rejected,
}

/// Snapshot of queue occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBufferInfo {
    /// Free reserved slots
    pub reserved: usize,
    /// Frames waiting for the application
    pub arrived: usize,
    /// Frames held by the application
    pub received: usize,
}

struct FrameBuffer {
    frame: Frame,
    rawdata_accessed: bool,
}

struct QueueState {
    owner: Option<Arc<dyn FrameOwner>>,
    reserved_count: usize,
    incoming: VecDeque<FrameBuffer>,
    outgoing: VecDeque<FrameBuffer>,
}

struct SkipState {
    rate: u32,
    counter: u32,
}

/// Buffers arriving frames according to a [`BufferingPolicy`]
///
/// Producers call [`set`](Self::set); the application calls
/// [`get`](Self::get) and later [`remove`](Self::remove). User data, the
/// channel mask and the skip rate each have their own lock so updating one
/// never waits on the frame queues.
pub struct FrameManager {
    policy: BufferingPolicy,
    queues: Mutex<QueueState>,
    user_data: Mutex<Option<Arc<[u8]>>>,
    channel_mask: Mutex<Vec<u32>>,
    skip: Mutex<SkipState>,
    arrivals: watch::Sender<u64>,
}

impl FrameManager {
    /// Create an uninitialized manager
    pub fn new(policy: BufferingPolicy) -> Self {
        let (arrivals, _) = watch::channel(0);
        Self {
            policy,
            queues: Mutex::new(QueueState {
                owner: None,
                reserved_count: 0,
                incoming: VecDeque::new(),
                outgoing: VecDeque::new(),
            }),
            user_data: Mutex::new(None),
            channel_mask: Mutex::new(Vec::new()),
            skip: Mutex::new(SkipState { rate: 0, counter: 0 }),
            arrivals,
        }
    }

    /// Create and initialize a manager from configuration
    pub fn from_config(config: &BufferConfig, owner: Arc<dyn FrameOwner>) -> Result<Self> {
        let manager = Self::new(config.policy);
        manager.init(config.capacity, owner)?;
        Ok(manager)
    }

    /// The admission policy
    pub fn policy(&self) -> BufferingPolicy {
        self.policy
    }

    /// Bind the manager to its stream with `capacity` reserved slots
    pub fn init(&self, capacity: usize, owner: Arc<dyn FrameOwner>) -> Result<()> {
        let mut queues = self.queues.lock();
        if queues.owner.is_some() {
            return Err(CoreError::invalid_operation("frame manager already initialized"));
        }
        queues.reserved_count = capacity;
        queues.owner = Some(owner);
        debug!(policy = ?self.policy, capacity, "Frame manager initialized");
        Ok(())
    }

    /// Release every buffered frame and return to the uninitialized state
    pub fn exit(&self) -> Result<()> {
        if !self.is_initialized() {
            return Ok(());
        }
        let released = self.clear()?;
        *self.user_data.lock() = None;
        self.queues.lock().owner = None;
        debug!(released, "Frame manager terminated");
        Ok(())
    }

    /// Whether [`init`](Self::init) has been called
    pub fn is_initialized(&self) -> bool {
        self.queues.lock().owner.is_some()
    }

    /// Offer a newly arrived frame.
    ///
    /// Frames that are skipped, rejected or evicted are released back to the
    /// owner and reported with one `FrameDropped` event each; none of these
    /// are errors.
    pub fn set(&self, info: FrameInfo, sent_time: u64) -> Result<SetOutcome> {
        let owner = self.owner()?;
        let sequence_number = info.sequence_number;

        if self.is_skip_frame() {
            trace!(sequence_number, "Frame skipped by skip rate");
            Self::drop_frame(owner.as_ref(), &info);
            return Ok(SetOutcome::Skipped);
        }

        let frame = {
            let mask = self.channel_mask.lock();
            let user_data = self.user_data.lock().clone();
            Frame::new(info, sent_time, &mask, user_data)
        };

        let (evicted, admission, rejected) = {
            let mut queues = self.queues.lock();
            let admission = self.policy.admit(queues.incoming.len(), queues.reserved_count);
            let evicted: Vec<FrameBuffer> = queues.incoming.drain(..admission.evict).collect();
            let uses_reservation = self.policy.uses_reservation();
            if uses_reservation {
                queues.reserved_count += evicted.len();
            }
            let rejected = if admission.slot {
                if uses_reservation {
                    queues.reserved_count -= 1;
                }
                queues.incoming.push_back(FrameBuffer { frame: frame.clone(), rawdata_accessed: false });
                None
            } else {
                Some(frame.clone())
            };
            (evicted, admission, rejected)
        };

        let evicted_numbers: Vec<u64> = evicted.iter().map(|b| b.frame.sequence_number()).collect();
        for buffer in &evicted {
            debug!(sequence_number = buffer.frame.sequence_number(), "Evicting unconsumed frame");
            Self::drop_frame(owner.as_ref(), buffer.frame.info());
        }

        if let Some(frame) = rejected {
            debug!(sequence_number, policy = ?self.policy, "No free slot, frame rejected");
            Self::drop_frame(owner.as_ref(), frame.info());
            return Ok(SetOutcome::Rejected);
        }

        if admission.acquirable {
            owner.frame_arrived(frame.info()).traced()?;
            self.arrivals.send_modify(|count| *count += 1);
        }
        trace!(sequence_number, evicted = evicted_numbers.len(), "Frame queued");

        Ok(SetOutcome::Queued { evicted: evicted_numbers, acquirable: admission.acquirable })
    }

    /// Take the oldest queued frame
    pub fn get(&self) -> Result<Frame> {
        let mut queues = self.queues.lock();
        let buffer = queues
            .incoming
            .pop_front()
            .ok_or_else(|| CoreError::not_found("frame queue is empty"))?;
        let frame = buffer.frame.clone();
        queues.outgoing.push_back(buffer);
        Ok(frame)
    }

    /// Wait up to `timeout` for a frame to become available
    pub async fn wait_frame(&self, timeout: Duration) -> Result<Frame> {
        let mut arrivals = self.arrivals.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            arrivals.borrow_and_update();
            if let Ok(frame) = self.get() {
                return Ok(frame);
            }
            match tokio::time::timeout_at(deadline, arrivals.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(CoreError::invalid_operation("frame manager dropped")),
                Err(_) => return Err(CoreError::timed_out("wait for frame", timeout)),
            }
        }
    }

    /// Subscribe to the count of acquirable arrivals
    pub fn subscribe_arrivals(&self) -> watch::Receiver<u64> {
        self.arrivals.subscribe()
    }

    /// Release a frame obtained from [`get`](Self::get) back to its producer
    pub fn remove(&self, frame: &Frame, rawdata_accessed: bool) -> Result<()> {
        let (owner, mut buffer) = {
            let mut queues = self.queues.lock();
            let index = queues
                .outgoing
                .iter()
                .position(|b| b.frame.same_frame(frame))
                .ok_or_else(|| {
                    CoreError::invalid_argument(format!(
                        "not managed frame: seqnum={}",
                        frame.sequence_number()
                    ))
                })?;
            let owner = queues
                .owner
                .clone()
                .ok_or_else(|| CoreError::invalid_operation("uninitialized"))?;
            let buffer = queues.outgoing.remove(index).ok_or_else(|| {
                CoreError::invalid_argument("frame vanished from the received queue")
            })?;
            (owner, buffer)
        };

        buffer.rawdata_accessed = rawdata_accessed;
        match Self::release(owner.as_ref(), &buffer).traced() {
            Ok(()) => {
                if self.policy.uses_reservation() {
                    self.queues.lock().reserved_count += 1;
                }
                Ok(())
            }
            Err(e) => {
                self.queues.lock().outgoing.push_back(buffer);
                Err(e)
            }
        }
    }

    /// Release every buffered frame in both queues, returning how many were released
    pub fn clear(&self) -> Result<usize> {
        let (owner, drained) = {
            let mut queues = self.queues.lock();
            let Some(owner) = queues.owner.clone() else {
                return Ok(0);
            };
            let mut drained: Vec<FrameBuffer> = queues.outgoing.drain(..).collect();
            drained.extend(queues.incoming.drain(..));
            if self.policy.uses_reservation() {
                queues.reserved_count += drained.len();
            }
            (owner, drained)
        };

        for buffer in &drained {
            if let Err(e) = Self::release(owner.as_ref(), buffer) {
                warn!(sequence_number = buffer.frame.sequence_number(), "Release failed: {}", e);
            }
        }
        Ok(drained.len())
    }

    /// Queue occupancy
    pub fn frame_buffer_info(&self) -> FrameBufferInfo {
        let queues = self.queues.lock();
        FrameBufferInfo {
            reserved: queues.reserved_count,
            arrived: queues.incoming.len(),
            received: queues.outgoing.len(),
        }
    }

    /// Replace the user data attached to new frames; empty data clears it
    pub fn set_user_data(&self, data: &[u8]) {
        let mut user_data = self.user_data.lock();
        if user_data.as_deref().unwrap_or_default() == data {
            return;
        }
        *user_data = if data.is_empty() { None } else { Some(Arc::from(data)) };
    }

    /// Current user data
    pub fn user_data(&self) -> Option<Arc<[u8]>> {
        self.user_data.lock().clone()
    }

    /// Replace the set of channel ids filtered out of new frames
    pub fn set_channel_mask(&self, mask: Vec<u32>) {
        *self.channel_mask.lock() = mask;
    }

    /// Current channel mask
    pub fn channel_mask(&self) -> Vec<u32> {
        self.channel_mask.lock().clone()
    }

    /// Keep one of every `skip_rate + 1` arrivals; 0 keeps all.
    ///
    /// The next arrival after a change is always kept.
    pub fn set_skip_rate(&self, skip_rate: u32) {
        let mut skip = self.skip.lock();
        skip.rate = skip_rate;
        skip.counter = 0;
    }

    /// Current skip rate
    pub fn skip_rate(&self) -> u32 {
        self.skip.lock().rate
    }

    fn owner(&self) -> Result<Arc<dyn FrameOwner>> {
        self.queues.lock().owner.clone().ok_or_else(|| CoreError::invalid_operation("uninitialized"))
    }

    fn is_skip_frame(&self) -> bool {
        let mut skip = self.skip.lock();
        if skip.rate == 0 {
            return false;
        }
        let skipped = skip.counter != 0;
        skip.counter = (skip.counter + 1) % (skip.rate + 1);
        skipped
    }

    fn release(owner: &dyn FrameOwner, buffer: &FrameBuffer) -> Result<()> {
        let referenced =
            if buffer.rawdata_accessed { buffer.frame.channel_ids() } else { Vec::new() };
        owner.release_frame_info(buffer.frame.info(), &referenced)
    }

    fn drop_frame(owner: &dyn FrameOwner, info: &FrameInfo) {
        let sequence_number = info.sequence_number;
        if let Err(e) = owner.release_frame_info(info, &[]) {
            warn!(sequence_number, "Failed to release dropped frame: {}", e);
        }
        if let Err(e) = owner.send_event(StreamEvent::FrameDropped { sequence_number }) {
            warn!(sequence_number, "Failed to send frame drop event: {}", e);
        }
    }
}

impl std::fmt::Debug for FrameManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameManager")
            .field("policy", &self.policy)
            .field("buffers", &self.frame_buffer_info())
            .finish()
    }
}
