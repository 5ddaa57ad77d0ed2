//! Built-in subscribers installed by the scheduler when enabled in the configuration.

use crate::event::{Event, EventSet, Group};
use crate::message::{Message, Payload};
use crate::publisher::MacroHandle;
use crate::scheduler::StopHandle;
use crate::subscriber::{Acknowledgement, Subscriber};

/// Reacts to SYSTEM events: SHUTDOWN requests an orderly stop, faults are logged.
#[derive(Debug)]
pub struct SystemSubscriber {
    stop: StopHandle,
}

impl SystemSubscriber {
    pub fn new(stop: StopHandle) -> Self {
        Self { stop }
    }
}

impl Subscriber for SystemSubscriber {
    fn name(&self) -> &str {
        "system"
    }

    fn interests(&self) -> EventSet {
        EventSet::of_group(Group::System)
    }

    fn on_message(&mut self, message: &Message) -> Acknowledgement {
        match message.event() {
            Event::Shutdown => {
                log::info!("system: shutdown requested");
                self.stop.request_stop();
            }
            Event::BatteryLow | Event::HighTemperature | Event::CollisionDetect => {
                log::error!("system: {} ({:?})", message.event().label(), message.payload());
            }
            other => log::debug!("system: ignoring {}", other),
        }
        Acknowledgement::Consumed
    }
}

/// Groups the omni subscriber listens to
const OMNI_GROUPS: [Group; 10] = [
    Group::System,
    Group::Macro,
    Group::Gamepad,
    Group::Stop,
    Group::Bumper,
    Group::Infrared,
    Group::Velocity,
    Group::Theta,
    Group::Chadburn,
    Group::Behaviour,
];

/// Bus tap: logs robot-facing traffic, leaving out clock, remote,
/// experiment and housekeeping events
#[derive(Debug, Default)]
pub struct OmniSubscriber {
    seen: u64,
}

impl OmniSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }
}

impl Subscriber for OmniSubscriber {
    fn name(&self) -> &str {
        "omni"
    }

    fn interests(&self) -> EventSet {
        EventSet::of_groups(&OMNI_GROUPS)
    }

    fn on_message(&mut self, message: &Message) -> Acknowledgement {
        self.seen += 1;
        log::info!("omni: {}", message.summary());
        Acknowledgement::Consumed
    }
}

/// Starts macros on request
///
/// A MACRO message names the macro to play in a text payload. AVOID plays
/// the macro called `AVOID` and publishes VELOCITY, carrying the AVOID
/// payload, once that macro completes.
#[derive(Debug)]
pub struct MacroSubscriber {
    macros: MacroHandle,
}

impl MacroSubscriber {
    pub fn new(macros: MacroHandle) -> Self {
        Self { macros }
    }
}

impl Subscriber for MacroSubscriber {
    fn name(&self) -> &str {
        "macro"
    }

    fn interests(&self) -> EventSet {
        EventSet::of_group(Group::Macro).with(Event::Avoid)
    }

    fn on_message(&mut self, message: &Message) -> Acknowledgement {
        match (message.event(), message.payload()) {
            (Event::Macro, Payload::Text(name)) => {
                self.macros.queue_by_name(name, None);
            }
            (Event::Macro, other) => {
                log::warn!("macro: MACRO message without a macro name: {:?}", other);
            }
            (Event::Lambda, _) => log::debug!("macro: ignoring {}", message.summary()),
            (event, payload) => {
                self.macros
                    .queue_by_name(event.name(), Some((Event::Velocity, payload.clone())));
            }
        }
        Acknowledgement::Consumed
    }
}
