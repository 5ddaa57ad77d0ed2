//! Arbitration: choosing which message the controller acts on this tick.
//!
//! Highest priority wins; ties go to the oldest message. Stale and already
//! dispatched messages are never eligible.

use crate::event::Priority;
use crate::message::Message;

/// Per-tick selection of the single highest-priority eligible message
///
/// Stateless apart from its configuration: `select` never mutates anything.
#[derive(Debug, Clone, Copy)]
pub struct Arbitrator {
    max_age_ms: u64,
    priority_floor: Option<Priority>,
}

impl Arbitrator {
    pub fn new(max_age_ms: u64) -> Self {
        Self {
            max_age_ms,
            priority_floor: None,
        }
    }

    /// Ignore messages whose priority is below `floor`.
    pub fn with_priority_floor(mut self, floor: Priority) -> Self {
        self.priority_floor = Some(floor);
        self
    }

    pub fn priority_floor(&self) -> Option<Priority> {
        self.priority_floor
    }

    /// A message may win if it has not been dispatched, is not stale, and
    /// clears the priority floor.
    pub fn is_eligible(&self, message: &Message, now_ms: u64) -> bool {
        !message.is_dispatched()
            && !message.is_expired(now_ms, self.max_age_ms)
            && self
                .priority_floor
                .map_or(true, |floor| message.priority() >= floor)
    }

    /// Highest priority eligible message; ties go to the earliest created.
    pub fn select<'a>(&self, snapshot: &'a [Message], now_ms: u64) -> Option<&'a Message> {
        snapshot
            .iter()
            .filter(|m| self.is_eligible(m, now_ms))
            .min_by(|a, b| {
                b.priority()
                    .cmp(&a.priority())
                    .then_with(|| a.created().cmp(&b.created()))
            })
    }
}
