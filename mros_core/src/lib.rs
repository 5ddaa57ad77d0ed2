//! # MROS Core
//!
//! The message-passing and arbitration core of a behaviour-based robot
//! operating system.
//!
//! Sensors and other sources publish [`Message`]s onto a shared
//! [`MessageBus`]. Once per clock tick the [`Scheduler`]:
//!
//! - offers active messages to every interested **subscriber**, which
//!   consumes (acknowledges) or defers each one
//! - lets the **arbitrator** pick the single highest-priority message
//! - has the **controller** run every behaviour bound to that event
//! - **garbage collects** messages that are fully acknowledged or stale
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mros_core::prelude::*;
//!
//! struct Avoid;
//!
//! impl Behaviour for Avoid {
//!     fn name(&self) -> &str { "avoid" }
//!
//!     fn execute(&mut self, message: &Message) -> MrosResult<()> {
//!         println!("avoiding after {}", message.event());
//!         Ok(())
//!     }
//! }
//!
//! let mut scheduler = Scheduler::from_config(MrosConfig::standard())?;
//! scheduler.install_builtin_components()?;
//! scheduler.add_behaviour(Box::new(Avoid), &[Event::BumperPort, Event::BumperStbd]);
//! scheduler.bus().publish(Event::BumperPort, Payload::Empty)?;
//! scheduler.run_for(std::time::Duration::from_secs(1))?;
//! # Ok::<(), MrosError>(())
//! ```

pub mod arbitrator;
pub mod builtin;
pub mod bus;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod gc;
pub mod macros;
pub mod message;
pub mod publisher;
pub mod scheduler;
pub mod subscriber;
pub mod time;

// Re-export commonly used types for easy access
pub use arbitrator::Arbitrator;
pub use bus::{BusStats, MessageBus};
pub use clock::{ClockSignal, ClockSource, ClockState, ExternalClock, InternalClock, Tick};
pub use config::{ClockMode, MrosConfig};
pub use controller::{Behaviour, BehaviourId, Controller, DispatchReport};
pub use error::{MrosError, MrosResult};
pub use event::{Event, EventSet, Group, Priority};
pub use gc::GarbageCollector;
pub use macros::{Macro, MacroLibrary, Statement};
pub use message::{Message, MessageId, Payload};
pub use publisher::{
    ClockPublisher, MacroHandle, MacroPublisher, Publisher, QueueHandle, QueuePublisher,
};
pub use scheduler::{Scheduler, StopHandle, TickReport};
pub use subscriber::{Acknowledgement, Subscriber, SubscriberId, SubscriberRegistry};

/// Everything needed to write subscribers and behaviours
pub mod prelude {
    pub use crate::builtin::{MacroSubscriber, OmniSubscriber, SystemSubscriber};
    pub use crate::{
        Acknowledgement, Behaviour, Event, EventSet, Group, Macro, Message, MessageBus, MrosConfig,
        MrosError, MrosResult, Payload, Priority, Publisher, Scheduler, StopHandle, Subscriber,
    };
}
