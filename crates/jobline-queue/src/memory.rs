//! In-process priority channel.
//!
//! Messages live in a max-heap ordered by priority, then publish order.
//! Unacknowledged deliveries are tracked per subscription and returned to
//! the heap when the subscription is dropped, which stands in for a consumer
//! crash.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info};

use jobline_core::{Delivery, DeliveryTag, Error, PriorityChannel, Result, Subscription};

use crate::config::ChannelConfig;

#[derive(Debug, Clone)]
struct Message {
    priority: u8,
    /// Position within the priority level. A dropped subscription returns
    /// a message to its old place; a nack sends it to the back.
    seq: u64,
    body: Vec<u8>,
    deliveries: u32,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Message {}

impl Ord for Message {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Message {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A message discarded by `nack(requeue = false)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub body: Vec<u8>,
    pub priority: u8,
    /// Times the message was delivered before it was discarded.
    pub deliveries: u32,
}

#[derive(Debug, Default)]
struct ChannelState {
    ready: BinaryHeap<Message>,
    unacked: HashMap<DeliveryTag, Message>,
    dead: Vec<DeadLetter>,
    next_seq: u64,
    next_tag: DeliveryTag,
    closed: bool,
}

impl ChannelState {
    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn requeue(&mut self, tag: DeliveryTag) {
        if let Some(message) = self.unacked.remove(&tag) {
            self.ready.push(message);
        }
    }

    fn requeue_last(&mut self, tag: DeliveryTag) {
        if let Some(mut message) = self.unacked.remove(&tag) {
            message.seq = self.take_seq();
            self.ready.push(message);
        }
    }
}

fn lock(state: &Mutex<ChannelState>) -> Result<MutexGuard<'_, ChannelState>> {
    state
        .lock()
        .map_err(|_| Error::Queue("channel state poisoned".to_string()))
}

/// In-memory implementation of PriorityChannel.
#[derive(Clone)]
pub struct InMemoryChannel {
    config: Arc<ChannelConfig>,
    state: Arc<Mutex<ChannelState>>,
    notify: Arc<Notify>,
}

impl fmt::Debug for InMemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryChannel")
            .field("name", &self.config.name)
            .field("state", &"<Mutex<ChannelState>>")
            .finish()
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new(ChannelConfig::default())
    }
}

impl InMemoryChannel {
    pub fn new(config: ChannelConfig) -> Self {
        info!(
            subsystem = "queue",
            component = "memory",
            queue = %config.name,
            max_priority = config.max_priority,
            capacity = config.capacity,
            "Declared in-memory channel"
        );
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(ChannelState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Messages waiting for delivery.
    pub fn depth(&self) -> usize {
        lock(&self.state).map(|s| s.ready.len()).unwrap_or(0)
    }

    /// Messages delivered but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        lock(&self.state).map(|s| s.unacked.len()).unwrap_or(0)
    }

    /// Messages discarded by a non-requeueing nack.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.state).map(|s| s.dead.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PriorityChannel for InMemoryChannel {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn max_priority(&self) -> u8 {
        self.config.max_priority
    }

    async fn publish(&self, body: &[u8], priority: u8) -> Result<bool> {
        let priority = self.config.clamp_priority(priority);
        let accepted = {
            let mut state = lock(&self.state)?;
            if state.closed {
                return Err(Error::Queue(format!("channel {} is closed", self.config.name)));
            }
            let seq = state.take_seq();
            state.ready.push(Message {
                priority,
                seq,
                body: body.to_vec(),
                deliveries: 0,
            });
            state.ready.len() <= self.config.capacity
        };
        self.notify.notify_waiters();
        Ok(accepted)
    }

    async fn subscribe(&self, prefetch: usize) -> Result<Box<dyn Subscription>> {
        if prefetch == 0 {
            return Err(Error::Validation("prefetch must be at least 1".to_string()));
        }
        if lock(&self.state)?.closed {
            return Err(Error::Queue(format!("channel {} is closed", self.config.name)));
        }
        debug!(queue = %self.config.name, prefetch, "Opened subscription");
        Ok(Box::new(InMemorySubscription {
            state: self.state.clone(),
            notify: self.notify.clone(),
            prefetch,
            held: HashSet::new(),
        }))
    }

    async fn close(&self) -> Result<()> {
        lock(&self.state)?.closed = true;
        self.notify.notify_waiters();
        info!(queue = %self.config.name, "Channel closed");
        Ok(())
    }
}

enum Take {
    Delivered(Delivery),
    Empty,
    Closed,
}

/// Subscription on an [`InMemoryChannel`].
pub struct InMemorySubscription {
    state: Arc<Mutex<ChannelState>>,
    notify: Arc<Notify>,
    prefetch: usize,
    held: HashSet<DeliveryTag>,
}

impl InMemorySubscription {
    fn try_take(&mut self) -> Result<Take> {
        let mut state = lock(&self.state)?;
        if state.closed {
            return Ok(Take::Closed);
        }
        if self.held.len() >= self.prefetch {
            return Err(Error::Queue(format!(
                "prefetch limit of {} unacknowledged deliveries reached",
                self.prefetch
            )));
        }
        let Some(mut message) = state.ready.pop() else {
            return Ok(Take::Empty);
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        message.deliveries += 1;
        let delivery = Delivery {
            tag,
            body: message.body.clone(),
            priority: message.priority,
            redelivered: message.deliveries > 1,
        };
        state.unacked.insert(tag, message);
        self.held.insert(tag);
        Ok(Take::Delivered(delivery))
    }

    fn release(&mut self, tag: DeliveryTag) -> Result<()> {
        if !self.held.remove(&tag) {
            return Err(Error::Queue(format!("unknown delivery tag {tag}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        let notify = self.notify.clone();
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            // Register before checking so a publish between the check and
            // the await is not missed.
            notified.as_mut().enable();

            match self.try_take()? {
                Take::Delivered(delivery) => return Ok(Some(delivery)),
                Take::Closed => return Ok(None),
                Take::Empty => notified.await,
            }
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        self.release(tag)?;
        lock(&self.state)?.unacked.remove(&tag);
        Ok(())
    }

    async fn nack(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.release(tag)?;
        {
            let mut state = lock(&self.state)?;
            if requeue {
                state.requeue_last(tag);
            } else if let Some(message) = state.unacked.remove(&tag) {
                state.dead.push(DeadLetter {
                    body: message.body,
                    priority: message.priority,
                    deliveries: message.deliveries,
                });
            }
        }
        if requeue {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.requeue_held();
        Ok(())
    }
}

impl InMemorySubscription {
    fn requeue_held(&mut self) {
        if self.held.is_empty() {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            for tag in self.held.drain() {
                state.requeue(tag);
            }
        }
        self.notify.notify_waiters();
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        self.requeue_held();
    }
}
