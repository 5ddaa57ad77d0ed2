//! Controller: maps the arbitration winner to its registered behaviours.

use crate::error::{MrosError, MrosResult};
use crate::event::Event;
use crate::message::Message;
use crate::subscriber::panic_message;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// A unit of robot action triggered by the controller
///
/// `execute` runs synchronously inside the tick. Returning `Err` (or
/// panicking) is contained: siblings still run and the next tick proceeds.
pub trait Behaviour: Send {
    fn name(&self) -> &str;

    fn execute(&mut self, message: &Message) -> MrosResult<()>;
}

/// Handle returned when registering a behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BehaviourId(usize);

impl BehaviourId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// What happened when one message was dispatched
#[derive(Debug)]
pub struct DispatchReport {
    pub event: Event,
    /// Behaviours that ran to completion, in invocation order
    pub invoked: Vec<String>,
    pub failures: Vec<MrosError>,
}

impl DispatchReport {
    fn new(event: Event) -> Self {
        Self {
            event,
            invoked: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of behaviours the controller tried to run
    pub fn attempted(&self) -> usize {
        self.invoked.len() + self.failures.len()
    }
}

#[derive(Default)]
pub struct Controller {
    behaviours: Vec<Box<dyn Behaviour>>,
    bindings: HashMap<Event, Vec<BehaviourId>>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field(
                "behaviours",
                &self.behaviours.iter().map(|b| b.name()).collect::<Vec<_>>(),
            )
            .field("bindings", &self.bindings.len())
            .finish()
    }
}

impl Controller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `behaviour` and bind it to each of `events`.
    pub fn register(&mut self, behaviour: Box<dyn Behaviour>, events: &[Event]) -> BehaviourId {
        let id = BehaviourId(self.behaviours.len());
        log::info!(
            "registered behaviour '{}' for {} event type(s)",
            behaviour.name(),
            events.len()
        );
        self.behaviours.push(behaviour);
        for &event in events {
            self.bind_unchecked(id, event);
        }
        id
    }

    /// Bind an already registered behaviour to another event type.
    pub fn bind(&mut self, id: BehaviourId, event: Event) -> MrosResult<()> {
        if id.0 >= self.behaviours.len() {
            return Err(MrosError::UnknownBehaviour(id.0));
        }
        self.bind_unchecked(id, event);
        Ok(())
    }

    fn bind_unchecked(&mut self, id: BehaviourId, event: Event) {
        let bound = self.bindings.entry(event).or_default();
        if !bound.contains(&id) {
            bound.push(id);
        }
    }

    pub fn len(&self) -> usize {
        self.behaviours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.behaviours.is_empty()
    }

    /// Names of the behaviours bound to `event`, in invocation order.
    pub fn behaviours_for(&self, event: Event) -> Vec<&str> {
        self.bindings
            .get(&event)
            .map(|ids| ids.iter().map(|id| self.behaviours[id.0].name()).collect())
            .unwrap_or_default()
    }

    /// Invoke every behaviour bound to the message's event, in registration order.
    ///
    /// Failures are collected in the report and never retried.
    pub fn dispatch(&mut self, message: &Message) -> DispatchReport {
        let mut report = DispatchReport::new(message.event());
        let Some(ids) = self.bindings.get(&message.event()) else {
            log::debug!("controller: no behaviour bound to {}", message.event());
            return report;
        };

        for id in ids {
            let behaviour = &mut self.behaviours[id.0];
            let result = catch_unwind(AssertUnwindSafe(|| behaviour.execute(message)));
            let name = behaviour.name().to_string();

            match result {
                Ok(Ok(())) => {
                    log::trace!("controller: {} handled {}", name, message.summary());
                    report.invoked.push(name);
                }
                Ok(Err(e)) => {
                    log::warn!("controller: behaviour '{}' failed on {}: {}", name, message.event(), e);
                    report.failures.push(match e {
                        e @ MrosError::BehaviourFailure { .. } => e,
                        other => MrosError::behaviour(name, other.to_string()),
                    });
                }
                Err(panic) => {
                    let msg = panic_message(&*panic);
                    log::warn!("controller: behaviour '{}' panicked on {}: {}", name, message.event(), msg);
                    report
                        .failures
                        .push(MrosError::behaviour(name, format!("panicked: {}", msg)));
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBus;
    use crate::message::Payload;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Behaviour for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn execute(&mut self, message: &Message) -> MrosResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, message.event()));
            Ok(())
        }
    }

    struct Failing;

    impl Behaviour for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn execute(&mut self, _message: &Message) -> MrosResult<()> {
            Err(MrosError::Config("motor controller not ready".into()))
        }
    }

    struct Panicking;

    impl Behaviour for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn execute(&mut self, _message: &Message) -> MrosResult<()> {
            panic!("servo stalled");
        }
    }

    fn message(event: Event) -> Message {
        let bus = MessageBus::new(4, 1_000);
        let id = bus.publish(event, Payload::Empty).unwrap();
        bus.get(id).unwrap()
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut controller = Controller::new();
        controller.register(
            Box::new(Recorder {
                name: "avoid",
                log: log.clone(),
            }),
            &[Event::BumperPort, Event::BumperStbd],
        );
        controller.register(
            Box::new(Recorder {
                name: "stop",
                log: log.clone(),
            }),
            &[Event::BumperPort],
        );

        let report = controller.dispatch(&message(Event::BumperPort));
        assert!(report.is_success());
        assert_eq!(report.invoked, vec!["avoid", "stop"]);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["avoid:BUMPER_PORT", "stop:BUMPER_PORT"]
        );

        let report = controller.dispatch(&message(Event::BumperStbd));
        assert_eq!(report.invoked, vec!["avoid"]);
    }

    #[test]
    fn test_unbound_event_is_a_no_op() {
        let mut controller = Controller::new();
        let report = controller.dispatch(&message(Event::Tick));
        assert_eq!(report.attempted(), 0);
        assert_eq!(report.event, Event::Tick);
    }

    #[test]
    fn test_failures_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut controller = Controller::new();
        controller.register(Box::new(Failing), &[Event::Roam]);
        controller.register(Box::new(Panicking), &[Event::Roam]);
        controller.register(
            Box::new(Recorder {
                name: "roam",
                log: log.clone(),
            }),
            &[Event::Roam],
        );

        let report = controller.dispatch(&message(Event::Roam));
        assert_eq!(report.invoked, vec!["roam"]);
        assert_eq!(report.failures.len(), 2);
        assert!(report
            .failures
            .iter()
            .all(|e| matches!(e, MrosError::BehaviourFailure { .. })));

        // no retry and no lasting damage: the next dispatch runs all three again
        let report = controller.dispatch(&message(Event::Roam));
        assert_eq!(report.attempted(), 3);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_bind() {
        let mut controller = Controller::new();
        let id = controller.register(Box::new(Failing), &[]);
        controller.bind(id, Event::Idle).unwrap();
        controller.bind(id, Event::Idle).unwrap();
        assert_eq!(controller.behaviours_for(Event::Idle), vec!["failing"]);
        assert!(matches!(
            controller.bind(BehaviourId(7), Event::Idle),
            Err(MrosError::UnknownBehaviour(7))
        ));
    }
}
