//! Subscribers and the per-tick delivery scan.
//!
//! Subscribers are registered once at startup. Each tick the registry walks
//! the subscribers in registration order and offers each one every active
//! message that matches its interests and that it has not yet consumed.

use crate::bus::MessageBus;
use crate::event::{Event, EventSet};
use crate::error::{MrosError, MrosResult};
use crate::message::{AckSet, Message};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Identity of a registered subscriber; doubles as its bit in an [`AckSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(crate) u8);

impl SubscriberId {
    pub fn from_index(index: usize) -> Option<Self> {
        (index < AckSet::CAPACITY).then_some(SubscriberId(index as u8))
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of offering a message to a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// The message was handled; never offer it to this subscriber again
    Consumed,
    /// Leave it unacknowledged and offer it again next tick
    Deferred,
}

/// A consumer of bus messages
///
/// `on_message` runs inside the tick and must return quickly; a callback
/// that blocks delays every later stage of the tick.
pub trait Subscriber: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Event types this subscriber wants to see. Read once, at registration.
    fn interests(&self) -> EventSet;

    fn on_message(&mut self, message: &Message) -> Acknowledgement;
}

struct RegisteredSubscriber {
    id: SubscriberId,
    interests: EventSet,
    subscriber: Box<dyn Subscriber>,
    consumed: u64,
    deferred: u64,
}

/// Counts from one delivery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub offered: usize,
    pub consumed: usize,
    pub deferred: usize,
    pub failed: usize,
}

/// All registered subscribers, in registration order
#[derive(Default)]
pub struct SubscriberRegistry {
    entries: Vec<RegisteredSubscriber>,
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, subscriber: Box<dyn Subscriber>) -> MrosResult<SubscriberId> {
        let id = SubscriberId::from_index(self.entries.len()).ok_or(MrosError::SubscriberLimit {
            limit: AckSet::CAPACITY,
        })?;
        let interests = subscriber.interests();
        log::info!(
            "registered subscriber '{}' as {} ({} event types)",
            subscriber.name(),
            id,
            interests.len()
        );
        self.entries.push(RegisteredSubscriber {
            id,
            interests,
            subscriber,
            consumed: 0,
            deferred: 0,
        });
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.subscriber.name()).collect()
    }

    pub fn name_of(&self, id: SubscriberId) -> Option<&str> {
        self.entries.get(id.index()).map(|e| e.subscriber.name())
    }

    /// The set of subscribers that must acknowledge an `event` message
    /// before it may be garbage collected.
    pub fn interested_in(&self, event: Event) -> AckSet {
        self.entries
            .iter()
            .filter(|e| e.interests.contains(event))
            .map(|e| e.id)
            .collect()
    }

    /// (consumed, deferred) totals for a subscriber
    pub fn counters(&self, id: SubscriberId) -> Option<(u64, u64)> {
        self.entries
            .get(id.index())
            .map(|e| (e.consumed, e.deferred))
    }

    /// Offer each message of `snapshot` to every interested subscriber that
    /// has not consumed it yet, recording acknowledgements on the bus.
    pub fn deliver(&mut self, bus: &MessageBus, snapshot: &[Message]) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for entry in self.entries.iter_mut() {
            for message in snapshot {
                if !entry.interests.contains(message.event()) || message.is_acknowledged_by(entry.id)
                {
                    continue;
                }
                report.offered += 1;

                let subscriber = &mut entry.subscriber;
                let outcome = catch_unwind(AssertUnwindSafe(|| subscriber.on_message(message)));

                match outcome {
                    Ok(Acknowledgement::Consumed) => match bus.acknowledge(message.id(), entry.id) {
                        Ok(_) => {
                            entry.consumed += 1;
                            report.consumed += 1;
                        }
                        Err(e) => {
                            log::debug!("{}: could not acknowledge: {}", entry.subscriber.name(), e);
                        }
                    },
                    Ok(Acknowledgement::Deferred) => {
                        entry.deferred += 1;
                        report.deferred += 1;
                    }
                    Err(panic) => {
                        report.failed += 1;
                        log::error!(
                            "{}: panicked on {}: {}",
                            entry.subscriber.name(),
                            message.summary(),
                            panic_message(&*panic)
                        );
                    }
                }
            }
        }

        report
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
