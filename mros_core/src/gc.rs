//! Garbage collector: the last stage of every tick.
//!
//! A message is collected once every subscriber interested in its event has
//! acknowledged it, or once it is stale. Messages nobody subscribes to are
//! kept until they have been dispatched or have expired.

use crate::bus::MessageBus;
use crate::message::{Message, MessageId};
use crate::subscriber::SubscriberRegistry;

/// Result of an expiry pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    /// Every message removed for exceeding `max_age_ms`
    pub expired: Vec<MessageId>,
    /// The subset that expired before all interested subscribers consumed it
    pub partially_delivered: Vec<MessageId>,
}

#[derive(Debug, Default)]
pub struct GarbageCollector {
    passes: u64,
}

impl GarbageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sweeps run so far
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Whether `message` has been acknowledged by every interested subscriber.
    pub fn is_fully_acknowledged(message: &Message, registry: &SubscriberRegistry) -> bool {
        let required = registry.interested_in(message.event());
        if required.is_empty() {
            message.is_dispatched()
        } else {
            message.acknowledgements().is_superset_of(required)
        }
    }

    /// Remove stale messages, reporting any that expired undelivered.
    ///
    /// Partial delivery is accepted as best-effort degradation: it is logged
    /// and counted, never escalated.
    pub fn expire(&self, bus: &MessageBus, registry: &SubscriberRegistry, now_ms: u64) -> ExpiryReport {
        let stale = bus.drain_stale(now_ms);
        let mut report = ExpiryReport::default();

        for message in &stale {
            report.expired.push(message.id());
            let required = registry.interested_in(message.event());
            let missing = required.difference(message.acknowledgements());
            if !missing.is_empty() {
                let names: Vec<&str> = missing
                    .iter()
                    .filter_map(|id| registry.name_of(id))
                    .collect();
                log::warn!(
                    "gc: {} expired after {}ms without delivery to {:?}",
                    message.summary(),
                    message.age_ms(now_ms),
                    names
                );
                report.partially_delivered.push(message.id());
            } else {
                log::debug!("gc: {} expired", message.summary());
            }
        }

        if !report.partially_delivered.is_empty() {
            bus.record_partial_delivery(report.partially_delivered.len());
        }
        report
    }

    /// Remove every fully acknowledged or stale message. Idempotent.
    pub fn sweep(&mut self, bus: &MessageBus, registry: &SubscriberRegistry, now_ms: u64) -> Vec<MessageId> {
        self.passes += 1;
        let max_age = bus.max_age_ms();
        let removed = bus.remove_where(|m| {
            m.is_expired(now_ms, max_age) || Self::is_fully_acknowledged(m, registry)
        });

        if !removed.is_empty() {
            bus.record_collected(removed.len());
            log::debug!("gc: collected {} message(s)", removed.len());
        }
        removed.iter().map(Message::id).collect()
    }
}
