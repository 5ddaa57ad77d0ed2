//! The message bus: a bounded, generation-checked arena of live messages
//! shared by publishers and the control loop.

use crate::config::MrosConfig;
use crate::error::{MrosError, MrosResult};
use crate::event::Event;
use crate::message::{Message, MessageId, Payload, Timestamp};
use crate::subscriber::SubscriberId;
use crate::time::{MonotonicTime, TimeSource};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lock-free counters for bus monitoring
#[derive(Debug, Default)]
pub struct AtomicBusStats {
    pub published: AtomicU64,
    pub acknowledged: AtomicU64,
    pub expired: AtomicU64,
    pub collected: AtomicU64,
    pub partially_delivered: AtomicU64,
    pub dispatched: AtomicU64,
    pub rejected: AtomicU64,
}

impl AtomicBusStats {
    /// Get current counter snapshot (for monitoring/debugging)
    pub fn snapshot(&self) -> BusStats {
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            collected: self.collected.load(Ordering::Relaxed),
            partially_delivered: self.partially_delivered.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the bus counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub acknowledged: u64,
    pub expired: u64,
    pub collected: u64,
    pub partially_delivered: u64,
    pub dispatched: u64,
    pub rejected: u64,
}

struct Slot {
    generation: u32,
    message: Option<Message>,
}

/// Fixed-capacity arena of in-flight messages
struct BusInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_sequence: u64,
    last_millis: u64,
}

impl BusInner {
    fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                message: None,
            })
            .collect();
        // reversed so the lowest indices are handed out first
        let free = (0..capacity as u32).rev().collect();
        Self {
            slots,
            free,
            next_sequence: 0,
            last_millis: 0,
        }
    }

    fn get(&self, id: MessageId) -> Option<&Message> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.message.as_ref()
    }

    fn get_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.message.as_mut()
    }

    fn take(&mut self, index: u32) -> Option<Message> {
        let slot = &mut self.slots[index as usize];
        let message = slot.message.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        Some(message)
    }

    fn live(&self) -> impl Iterator<Item = &Message> {
        self.slots.iter().filter_map(|slot| slot.message.as_ref())
    }

    fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// Central queue of in-flight messages
///
/// `MessageBus` is a cheap, cloneable handle: every publisher, subscriber
/// scan and the scheduler share the same arena. All mutation goes through
/// the bus methods, each of which takes the internal lock exactly once.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Mutex<BusInner>>,
    stats: Arc<AtomicBusStats>,
    time: Arc<dyn TimeSource>,
    capacity: usize,
    max_age_ms: u64,
    clip_length: Option<usize>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("capacity", &self.capacity)
            .field("max_age_ms", &self.max_age_ms)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl MessageBus {
    /// Create a bus holding at most `capacity` messages, expiring after `max_age_ms`.
    pub fn new(capacity: usize, max_age_ms: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner::with_capacity(capacity))),
            stats: Arc::new(AtomicBusStats::default()),
            time: Arc::new(MonotonicTime::new()),
            capacity,
            max_age_ms,
            clip_length: None,
        }
    }

    pub fn from_config(config: &MrosConfig) -> Self {
        let bus = Self::new(config.bus_capacity, config.max_age_ms);
        match config.clip_length {
            Some(clip) => bus.with_clip_length(clip),
            None => bus,
        }
    }

    /// Replace the time source (builder pattern). Call before cloning the handle.
    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Limit [`display`](Self::display) to the `clip` most recent messages.
    pub fn with_clip_length(mut self, clip: usize) -> Self {
        self.clip_length = Some(clip);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_age_ms(&self) -> u64 {
        self.max_age_ms
    }

    pub fn now_ms(&self) -> u64 {
        self.time.now_ms()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BusStats {
        self.stats.snapshot()
    }

    /// Publish a new message. Non-blocking apart from the short arena lock.
    pub fn publish(&self, event: Event, payload: Payload) -> MrosResult<MessageId> {
        let now = self.time.now_ms();
        let mut inner = self.inner.lock();

        let Some(index) = inner.free.pop() else {
            drop(inner);
            AtomicBusStats::bump(&self.stats.rejected, 1);
            log::warn!(
                "bus: rejected {} event, capacity of {} reached",
                event,
                self.capacity
            );
            return Err(MrosError::BusFull {
                capacity: self.capacity,
            });
        };

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        // never let a time source make creation stamps run backwards
        let millis = now.max(inner.last_millis);
        inner.last_millis = millis;

        let generation = inner.slots[index as usize].generation;
        let id = MessageId { index, generation };
        let created = Timestamp { millis, sequence };
        inner.slots[index as usize].message = Some(Message::new(id, event, payload, created));
        drop(inner);

        AtomicBusStats::bump(&self.stats.published, 1);
        log::trace!("bus: published {} as {} (seq {})", event, id, sequence);
        Ok(id)
    }

    /// Clone of every active message, in publication order.
    pub fn snapshot(&self) -> Vec<Message> {
        self.snapshot_through(u64::MAX)
    }

    /// Like [`snapshot`](Self::snapshot) but only messages with a sequence
    /// number up to and including `last_sequence`.
    pub fn snapshot_through(&self, last_sequence: u64) -> Vec<Message> {
        let inner = self.inner.lock();
        let mut messages: Vec<Message> = inner
            .live()
            .filter(|m| m.created.sequence <= last_sequence)
            .cloned()
            .collect();
        drop(inner);
        messages.sort_by_key(|m| m.created);
        messages
    }

    pub fn get(&self, id: MessageId) -> Option<Message> {
        self.inner.lock().get(id).cloned()
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.inner.lock().get(id).is_some()
    }

    /// Record that `subscriber` consumed the message.
    ///
    /// Returns `Ok(false)` if the subscriber had already acknowledged it.
    pub fn acknowledge(&self, id: MessageId, subscriber: SubscriberId) -> MrosResult<bool> {
        let mut inner = self.inner.lock();
        let message = inner.get_mut(id).ok_or(MrosError::UnknownMessage(id))?;
        let fresh = message.acks.insert(subscriber);
        drop(inner);
        if fresh {
            AtomicBusStats::bump(&self.stats.acknowledged, 1);
            log::trace!("bus: {} acknowledged by subscriber {}", id, subscriber);
        }
        Ok(fresh)
    }

    /// Flag the arbitration winner so it is never dispatched twice.
    pub fn mark_dispatched(&self, id: MessageId) -> MrosResult<()> {
        let mut inner = self.inner.lock();
        let message = inner.get_mut(id).ok_or(MrosError::UnknownMessage(id))?;
        message.dispatched = true;
        drop(inner);
        AtomicBusStats::bump(&self.stats.dispatched, 1);
        Ok(())
    }

    /// Remove a single message, ending the bus's ownership of it.
    pub fn remove(&self, id: MessageId) -> MrosResult<Message> {
        let mut inner = self.inner.lock();
        if inner.get(id).is_none() {
            return Err(MrosError::UnknownMessage(id));
        }
        let message = inner.take(id.index).ok_or(MrosError::UnknownMessage(id))?;
        drop(inner);
        AtomicBusStats::bump(&self.stats.collected, 1);
        Ok(message)
    }

    /// Remove every message older than `max_age_ms` at `now_ms`; returns their ids.
    pub fn expire_stale(&self, now_ms: u64) -> Vec<MessageId> {
        self.drain_stale(now_ms).iter().map(|m| m.id).collect()
    }

    /// Remove and return every message older than `max_age_ms` at `now_ms`.
    pub fn drain_stale(&self, now_ms: u64) -> Vec<Message> {
        let max_age = self.max_age_ms;
        let removed = self.remove_where(|m| m.is_expired(now_ms, max_age));
        if !removed.is_empty() {
            AtomicBusStats::bump(&self.stats.expired, removed.len() as u64);
            log::debug!("bus: expired {} stale message(s)", removed.len());
        }
        removed
    }

    /// Remove, under a single lock, every message matching `predicate`.
    pub(crate) fn remove_where<F>(&self, mut predicate: F) -> Vec<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        let mut inner = self.inner.lock();
        let doomed: Vec<u32> = inner
            .live()
            .filter(|m| predicate(m))
            .map(|m| m.id.index)
            .collect();
        let mut removed: Vec<Message> = doomed
            .into_iter()
            .filter_map(|index| inner.take(index))
            .collect();
        drop(inner);
        removed.sort_by_key(|m| m.created);
        removed
    }

    pub(crate) fn record_collected(&self, count: usize) {
        AtomicBusStats::bump(&self.stats.collected, count as u64);
    }

    pub(crate) fn record_partial_delivery(&self, count: usize) {
        AtomicBusStats::bump(&self.stats.partially_delivered, count as u64);
    }

    /// Summaries of the most recent messages, clipped to `clip_length`.
    ///
    /// Display only: clipping never removes anything from the bus.
    pub fn display(&self) -> Vec<String> {
        let snapshot = self.snapshot();
        let skip = match self.clip_length {
            Some(clip) => snapshot.len().saturating_sub(clip),
            None => 0,
        };
        snapshot.iter().skip(skip).map(Message::summary).collect()
    }
}
