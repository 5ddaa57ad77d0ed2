//! Messages and their acknowledgement state.
//!
//! A [`Message`] is owned by the [`MessageBus`](crate::bus::MessageBus) from
//! publication until garbage collection. Everything outside the bus only
//! ever sees clones taken in a snapshot.

use crate::event::{Event, Priority};
use crate::subscriber::SubscriberId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle of a message slot in the bus arena
///
/// The generation distinguishes a reused slot from the message that
/// previously lived in it, so stale ids are rejected rather than aliased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl MessageId {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}.{}", self.index, self.generation)
    }
}

/// Opaque message payload. The bus and arbitrator never look inside.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Payload {
    #[default]
    Empty,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

impl From<bool> for Payload {
    fn from(v: bool) -> Self {
        Payload::Bool(v)
    }
}

impl From<i64> for Payload {
    fn from(v: i64) -> Self {
        Payload::Int(v)
    }
}

impl From<f64> for Payload {
    fn from(v: f64) -> Self {
        Payload::Float(v)
    }
}

impl From<&str> for Payload {
    fn from(v: &str) -> Self {
        Payload::Text(v.to_string())
    }
}

impl From<String> for Payload {
    fn from(v: String) -> Self {
        Payload::Text(v)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Payload::Bytes(v)
    }
}

/// Creation timestamp: wall milliseconds plus a bus-wide sequence number.
///
/// Both components are monotonic, so ordering by timestamp is publication order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub millis: u64,
    pub sequence: u64,
}

/// Fixed-size bitset of subscriber identities (one bit per registered subscriber)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AckSet(u64);

impl AckSet {
    /// Number of subscriber identities an `AckSet` can hold
    pub const CAPACITY: usize = 64;

    pub const fn empty() -> Self {
        AckSet(0)
    }

    /// Returns `true` if the subscriber was not already present.
    pub fn insert(&mut self, id: SubscriberId) -> bool {
        let bit = 1u64 << id.index();
        let fresh = self.0 & bit == 0;
        self.0 |= bit;
        fresh
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.0 & (1u64 << id.index()) != 0
    }

    pub fn is_superset_of(&self, other: AckSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn difference(&self, other: AckSet) -> AckSet {
        AckSet(self.0 & !other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = SubscriberId> + '_ {
        (0..Self::CAPACITY as u8)
            .map(SubscriberId)
            .filter(move |id| self.contains(*id))
    }
}

impl FromIterator<SubscriberId> for AckSet {
    fn from_iter<I: IntoIterator<Item = SubscriberId>>(iter: I) -> Self {
        let mut set = AckSet::empty();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl fmt::Debug for AckSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|id| id.index())).finish()
    }
}

/// An in-flight event with its payload and acknowledgement state
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) id: MessageId,
    pub(crate) event: Event,
    pub(crate) payload: Payload,
    pub(crate) created: Timestamp,
    pub(crate) acks: AckSet,
    pub(crate) dispatched: bool,
}

impl Message {
    pub(crate) fn new(id: MessageId, event: Event, payload: Payload, created: Timestamp) -> Self {
        Self {
            id,
            event,
            payload,
            created,
            acks: AckSet::empty(),
            dispatched: false,
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn event(&self) -> Event {
        self.event
    }

    pub fn priority(&self) -> Priority {
        self.event.priority()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    pub fn acknowledgements(&self) -> AckSet {
        self.acks
    }

    pub fn is_acknowledged_by(&self, id: SubscriberId) -> bool {
        self.acks.contains(id)
    }

    /// Whether this message already won arbitration and was dispatched.
    pub fn is_dispatched(&self) -> bool {
        self.dispatched
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created.millis)
    }

    /// Strictly older than `max_age_ms`.
    pub fn is_expired(&self, now_ms: u64, max_age_ms: u64) -> bool {
        self.age_ms(now_ms) > max_age_ms
    }

    /// One-line description for logs and diagnostic display
    pub fn summary(&self) -> String {
        format!(
            "{} {} (p{}) @{}ms acks={}{}",
            self.id,
            self.event,
            self.event.priority(),
            self.created.millis,
            self.acks.len(),
            if self.dispatched { " dispatched" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(millis: u64) -> Message {
        Message::new(
            MessageId {
                index: 0,
                generation: 0,
            },
            Event::BumperPort,
            Payload::Empty,
            Timestamp {
                millis,
                sequence: 0,
            },
        )
    }

    #[test]
    fn test_ack_set() {
        let mut acks = AckSet::empty();
        assert!(acks.insert(SubscriberId(0)));
        assert!(!acks.insert(SubscriberId(0)));
        assert!(acks.insert(SubscriberId(63)));
        assert_eq!(acks.len(), 2);
        assert!(acks.contains(SubscriberId(63)));
        assert!(!acks.contains(SubscriberId(1)));

        let required: AckSet = [SubscriberId(0), SubscriberId(1)].into_iter().collect();
        assert!(!acks.is_superset_of(required));
        acks.insert(SubscriberId(1));
        assert!(acks.is_superset_of(required));
        assert_eq!(required.difference(AckSet::empty()).iter().count(), 2);
    }

    #[test]
    fn test_expiry_is_strict() {
        let msg = message(0);
        assert!(!msg.is_expired(20, 20));
        assert!(msg.is_expired(21, 20));
        assert_eq!(msg.age_ms(25), 25);
        // clock readings before creation never underflow
        assert_eq!(message(30).age_ms(10), 0);
    }

    #[test]
    fn test_payload_conversions() {
        assert_eq!(Payload::from(3i64), Payload::Int(3));
        assert_eq!(Payload::from("left"), Payload::Text("left".into()));
        assert!(Payload::default().is_empty());
    }
}
