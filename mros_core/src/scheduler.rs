//! The control loop.
//!
//! Each tick runs these stages in order, synchronously:
//!
//! 1. expire stale messages
//! 2. publish the clock `TICK` (slow ticks only, when enabled)
//! 3. offer the bus snapshot to every subscriber
//! 4. arbitrate over the same messages, now carrying this tick's acks
//! 5. dispatch the winner to the controller
//! 6. garbage collect
//!
//! Publishers may add messages at any moment; anything published after the
//! snapshot in stage 3 waits for the next tick.

use crate::arbitrator::Arbitrator;
use crate::builtin::{MacroSubscriber, OmniSubscriber, SystemSubscriber};
use crate::bus::MessageBus;
use crate::clock::{self, ClockSignal, ClockSource, ClockState, Tick};
use crate::config::MrosConfig;
use crate::controller::{Behaviour, BehaviourId, Controller, DispatchReport};
use crate::error::{MrosError, MrosResult};
use crate::event::Event;
use crate::gc::GarbageCollector;
use crate::message::{Message, MessageId};
use crate::publisher::{ClockPublisher, MacroHandle, MacroPublisher, QueueHandle, QueuePublisher};
use crate::subscriber::{DeliveryReport, Subscriber, SubscriberId, SubscriberRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct StopState {
    clock: ClockState,
    /// Stop requested before the loop started
    pending: bool,
}

/// Cloneable handle for requesting an orderly stop from any thread
#[derive(Debug, Clone)]
pub struct StopHandle {
    state: Arc<Mutex<StopState>>,
}

impl StopHandle {
    pub fn new(initial: ClockState) -> Self {
        Self {
            state: Arc::new(Mutex::new(StopState {
                clock: initial,
                pending: false,
            })),
        }
    }

    pub fn state(&self) -> ClockState {
        self.state.lock().clock
    }

    /// Move a running loop to `Stopping`. A request made while stopped is
    /// held and ends the next run before its first tick. Returns `false`
    /// if a stop is already under way.
    pub fn request_stop(&self) -> bool {
        let mut state = self.state.lock();
        match state.clock {
            ClockState::Running => {
                state.clock = ClockState::Stopping;
                log::info!("scheduler: stop requested");
                true
            }
            ClockState::Stopped => {
                state.pending = true;
                log::info!("scheduler: stop requested before start, holding it");
                true
            }
            ClockState::Stopping => {
                log::debug!("scheduler: stop already in progress");
                false
            }
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        let state = self.state.lock();
        state.clock == ClockState::Stopping || state.pending
    }

    fn start(&self) -> MrosResult<()> {
        let mut state = self.state.lock();
        state.clock = state.clock.transition(ClockState::Running)?;
        if state.pending {
            state.pending = false;
            state.clock = ClockState::Stopping;
            log::info!("scheduler: honouring stop requested before start");
        }
        Ok(())
    }

    /// Walk through `Stopping` to `Stopped`.
    fn finish(&self) {
        let mut state = self.state.lock();
        if state.clock == ClockState::Running {
            state.clock = ClockState::Stopping;
        }
        if state.clock == ClockState::Stopping {
            state.clock = ClockState::Stopped;
        }
    }
}

/// Everything that happened in one tick
#[derive(Debug)]
pub struct TickReport {
    pub tick: Tick,
    pub expired: Vec<MessageId>,
    /// Expired before every interested subscriber consumed them
    pub partially_delivered: Vec<MessageId>,
    pub delivery: DeliveryReport,
    pub winner: Option<Message>,
    pub dispatch: Option<DispatchReport>,
    pub collected: Vec<MessageId>,
}

impl TickReport {
    pub fn winning_event(&self) -> Option<Event> {
        self.winner.as_ref().map(Message::event)
    }
}

pub struct Scheduler {
    name: String,
    config: Arc<MrosConfig>,
    bus: MessageBus,
    subscribers: SubscriberRegistry,
    arbitrator: Arbitrator,
    controller: Controller,
    gc: GarbageCollector,
    clock: Option<Box<dyn ClockSource>>,
    clock_signal: Option<ClockSignal>,
    clock_publisher: Option<ClockPublisher>,
    queue_publisher: Option<QueuePublisher>,
    macro_publisher: Option<MacroPublisher>,
    stop: StopHandle,
    ticks: u64,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("state", &self.stop.state())
            .field("ticks", &self.ticks)
            .field("subscribers", &self.subscribers)
            .field("controller", &self.controller)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler over an existing bus. The configuration is validated here.
    pub fn new(config: MrosConfig, bus: MessageBus) -> MrosResult<Self> {
        config.validate()?;
        let mut arbitrator = Arbitrator::new(bus.max_age_ms());
        if let Some(floor) = config.priority_floor() {
            arbitrator = arbitrator.with_priority_floor(floor);
        }
        let (clock, clock_signal) = clock::from_config(&config);

        Ok(Self {
            name: "mros".to_string(),
            config: Arc::new(config),
            bus,
            subscribers: SubscriberRegistry::new(),
            arbitrator,
            controller: Controller::new(),
            gc: GarbageCollector::new(),
            clock: Some(clock),
            clock_signal,
            clock_publisher: None,
            queue_publisher: None,
            macro_publisher: None,
            stop: StopHandle::new(ClockState::Stopped),
            ticks: 0,
        })
    }

    /// Create a scheduler and its bus from `config`.
    pub fn from_config(config: MrosConfig) -> MrosResult<Self> {
        let bus = MessageBus::from_config(&config);
        Self::new(config, bus)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Replace the configured clock source (builder pattern).
    pub fn with_clock(mut self, clock: Box<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self.clock_signal = None;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Arc<MrosConfig> {
        &self.config
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn subscribers(&self) -> &SubscriberRegistry {
        &self.subscribers
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Ticks completed so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn state(&self) -> ClockState {
        self.stop.state()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Request an orderly stop: the current tick completes, no new tick starts.
    pub fn stop(&self) {
        self.stop.request_stop();
    }

    /// Signal driving the external clock, if one is configured
    pub fn clock_signal(&self) -> Option<ClockSignal> {
        self.clock_signal.clone()
    }

    /// Sending side of the queue publisher, if installed
    pub fn queue_handle(&self) -> Option<QueueHandle> {
        self.queue_publisher.as_ref().map(QueuePublisher::handle)
    }

    /// Library and play queue of the macro publisher, if installed
    pub fn macro_handle(&self) -> Option<MacroHandle> {
        self.macro_publisher.as_ref().map(MacroPublisher::handle)
    }

    pub fn add_subscriber(&mut self, subscriber: Box<dyn Subscriber>) -> MrosResult<SubscriberId> {
        self.subscribers.register(subscriber)
    }

    pub fn add_behaviour(&mut self, behaviour: Box<dyn Behaviour>, events: &[Event]) -> BehaviourId {
        self.controller.register(behaviour, events)
    }

    /// Bind an already registered behaviour to one more event type.
    pub fn bind_behaviour(&mut self, id: BehaviourId, event: Event) -> MrosResult<()> {
        self.controller.bind(id, event)
    }

    /// Install the built-in components enabled in the configuration.
    pub fn install_builtin_components(&mut self) -> MrosResult<()> {
        let components = self.config.components.clone();
        if components.enable_system_subscriber {
            let system = SystemSubscriber::new(self.stop.clone());
            self.add_subscriber(Box::new(system))?;
        }
        if components.enable_omni_subscriber {
            self.add_subscriber(Box::new(OmniSubscriber::new()))?;
        }
        if components.enable_clock_publisher {
            self.clock_publisher = Some(ClockPublisher::new(self.bus.clone()));
        }
        if components.enable_queue_publisher {
            self.queue_publisher = Some(QueuePublisher::from_config(&self.config, self.bus.clone()));
        }
        if components.enable_macro_publisher {
            self.macro_publisher = Some(MacroPublisher::from_config(&self.config, self.bus.clone()));
        }
        if components.enable_macro_subscriber {
            let handle = self.macro_handle().ok_or_else(|| {
                MrosError::Config("the macro subscriber requires the macro publisher".into())
            })?;
            self.add_subscriber(Box::new(MacroSubscriber::new(handle)))?;
        }
        log::info!(
            "{}: installed built-ins ({} subscriber(s))",
            self.name,
            self.subscribers.len()
        );
        Ok(())
    }

    /// Run a single tick immediately, without waiting on the clock source.
    pub fn tick(&mut self) -> MrosResult<TickReport> {
        let count = self.ticks;
        let tick = Tick {
            count,
            slow: count % self.config.clock.divider == 0,
        };
        self.process_tick(tick)
    }

    fn process_tick(&mut self, tick: Tick) -> MrosResult<TickReport> {
        let now = self.bus.now_ms();

        let expiry = self.gc.expire(&self.bus, &self.subscribers, now);

        if let Some(publisher) = &self.clock_publisher {
            if let Err(e) = publisher.on_tick(&tick) {
                log::warn!("{}: clock publisher failed: {}", self.name, e);
            }
        }

        let snapshot = self.bus.snapshot();
        let delivery = self.subscribers.deliver(&self.bus, &snapshot);

        // re-read the same messages so arbitration sees this tick's acks
        let candidates = match snapshot.last() {
            Some(last) => self.bus.snapshot_through(last.created().sequence),
            None => Vec::new(),
        };
        let winner = self.arbitrator.select(&candidates, now).cloned();

        let dispatch = match &winner {
            Some(message) => {
                log::debug!("{}: tick {} winner {}", self.name, tick.count, message.summary());
                let report = self.controller.dispatch(message);
                if let Err(e) = self.bus.mark_dispatched(message.id()) {
                    log::warn!("{}: winner vanished before dispatch completed: {}", self.name, e);
                }
                Some(report)
            }
            None => None,
        };

        let collected = self.gc.sweep(&self.bus, &self.subscribers, now);
        self.ticks += 1;

        if let Some(event) = winner.as_ref().map(Message::event) {
            if event.is_dire() && self.config.exit_on_dire_event {
                log::error!("{}: dire event {} dispatched, exiting control loop", self.name, event);
                return Err(MrosError::DireSystemEvent { event });
            }
        }

        Ok(TickReport {
            tick,
            expired: expiry.expired,
            partially_delivered: expiry.partially_delivered,
            delivery,
            winner,
            dispatch,
            collected,
        })
    }

    /// Run until stopped or an escalation occurs.
    pub fn run(&mut self) -> MrosResult<()> {
        self.run_loop(None)
    }

    /// Run for at most `duration`, then stop gracefully.
    pub fn run_for(&mut self, duration: Duration) -> MrosResult<()> {
        self.run_loop(Some(duration))
    }

    fn run_loop(&mut self, duration: Option<Duration>) -> MrosResult<()> {
        let mut clock = self
            .clock
            .take()
            .ok_or_else(|| MrosError::Config("scheduler has no clock source".into()))?;
        if let Err(e) = self.stop.start() {
            self.clock = Some(clock);
            return Err(e);
        }

        log::info!(
            "{}: running ({} clock, {} subscriber(s), {} behaviour(s))",
            self.name,
            clock.name(),
            self.subscribers.len(),
            self.controller.len()
        );

        if let Some(queue) = self.queue_publisher.as_mut() {
            if let Err(e) = queue.start() {
                log::error!("{}: could not start queue publisher: {}", self.name, e);
            }
        }
        if let Some(macros) = self.macro_publisher.as_mut() {
            if let Err(e) = macros.start() {
                log::error!("{}: could not start macro publisher: {}", self.name, e);
            }
        }

        let start = Instant::now();
        let result = loop {
            if self.stop.state() != ClockState::Running {
                break Ok(());
            }
            if let Some(limit) = duration {
                if start.elapsed() >= limit {
                    log::info!("{}: reached time limit of {:?}", self.name, limit);
                    break Ok(());
                }
            }

            let tick = match clock.wait_tick() {
                Ok(tick) => tick,
                Err(_) if self.stop.is_stop_requested() => break Ok(()),
                Err(e) => {
                    log::error!("{}: {}", self.name, e);
                    break Err(e);
                }
            };
            // no new tick once a stop has been requested
            if self.stop.is_stop_requested() {
                break Ok(());
            }

            match self.process_tick(tick) {
                Ok(report) => {
                    if !report.partially_delivered.is_empty() {
                        log::debug!(
                            "{}: tick {} expired {} partially delivered message(s)",
                            self.name,
                            tick.count,
                            report.partially_delivered.len()
                        );
                    }
                }
                Err(e) => break Err(e),
            }
        };

        if let Some(queue) = self.queue_publisher.as_mut() {
            queue.stop();
        }
        if let Some(macros) = self.macro_publisher.as_mut() {
            macros.stop();
        }
        self.stop.finish();
        self.clock = Some(clock);
        log::info!("{}: stopped after {} tick(s)", self.name, self.ticks);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use crate::subscriber::Acknowledgement;
    use crate::time::ManualTime;

    struct Consumer;

    impl Subscriber for Consumer {
        fn name(&self) -> &str {
            "consumer"
        }

        fn interests(&self) -> crate::event::EventSet {
            crate::event::EventSet::all()
        }

        fn on_message(&mut self, _message: &Message) -> Acknowledgement {
            Acknowledgement::Consumed
        }
    }

    fn scheduler(config: MrosConfig) -> (Scheduler, Arc<ManualTime>) {
        let time = Arc::new(ManualTime::new(0));
        let bus = MessageBus::from_config(&config).with_time_source(time.clone());
        (Scheduler::new(config, bus).unwrap(), time)
    }

    #[test]
    fn test_stop_handle_lifecycle() {
        let handle = StopHandle::new(ClockState::Stopped);
        assert!(!handle.is_stop_requested());
        handle.start().unwrap();
        assert!(handle.start().is_err());
        assert!(handle.request_stop());
        assert!(handle.is_stop_requested());
        assert!(!handle.request_stop());
        handle.finish();
        assert_eq!(handle.state(), ClockState::Stopped);
        assert!(!handle.is_stop_requested());
    }

    #[test]
    fn test_stop_before_start_is_held() {
        let handle = StopHandle::new(ClockState::Stopped);
        assert!(handle.request_stop());
        assert!(handle.is_stop_requested());
        assert_eq!(handle.state(), ClockState::Stopped);

        handle.start().unwrap();
        assert_eq!(handle.state(), ClockState::Stopping);
        handle.finish();

        // the held request is used up by one run
        handle.start().unwrap();
        assert_eq!(handle.state(), ClockState::Running);
    }

    #[test]
    fn test_run_ends_at_once_after_early_stop() {
        let (mut scheduler, _) = scheduler(MrosConfig::standard());
        scheduler.bus().publish(Event::Roam, Payload::Empty).unwrap();
        scheduler.stop_handle().request_stop();

        let start = Instant::now();
        scheduler.run_for(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(scheduler.ticks(), 0);
        assert_eq!(scheduler.state(), ClockState::Stopped);
        assert_eq!(scheduler.bus().len(), 1);
    }

    #[test]
    fn test_winner_is_dispatched_once() {
        let (mut scheduler, _) = scheduler(MrosConfig::standard());
        scheduler.bus().publish(Event::Roam, Payload::Empty).unwrap();

        let report = scheduler.tick().unwrap();
        assert_eq!(report.winning_event(), Some(Event::Roam));
        // nobody subscribes to ROAM, so it is collected right after dispatch
        assert_eq!(report.collected.len(), 1);

        let report = scheduler.tick().unwrap();
        assert!(report.winner.is_none());
        assert_eq!(scheduler.ticks(), 2);
    }

    #[test]
    fn test_consumed_winner_is_collected() {
        let (mut scheduler, _) = scheduler(MrosConfig::standard());
        scheduler.add_subscriber(Box::new(Consumer)).unwrap();
        scheduler.bus().publish(Event::Idle, Payload::Empty).unwrap();

        let report = scheduler.tick().unwrap();
        assert_eq!(report.delivery.consumed, 1);
        assert_eq!(report.winning_event(), Some(Event::Idle));
        assert!(scheduler.bus().is_empty());
    }

    #[test]
    fn test_clock_publisher_on_slow_ticks() {
        let mut config = MrosConfig::standard();
        config.components.enable_clock_publisher = true;
        config.components.enable_queue_publisher = false;
        config.clock.divider = 2;
        let (mut scheduler, _) = scheduler(config);
        scheduler.install_builtin_components().unwrap();

        let winners: Vec<Option<Event>> = (0..4)
            .map(|_| scheduler.tick().unwrap().winning_event())
            .collect();
        assert_eq!(
            winners,
            vec![Some(Event::Tick), None, Some(Event::Tick), None]
        );
    }

    #[test]
    fn test_macro_components_installed_together() {
        let mut config = MrosConfig::standard();
        config.components.enable_queue_publisher = false;
        config.components.enable_macro_publisher = true;
        config.components.enable_macro_subscriber = true;
        let (mut scheduler, _) = scheduler(config);
        assert!(scheduler.macro_handle().is_none());
        scheduler.install_builtin_components().unwrap();

        let handle = scheduler.macro_handle().unwrap();
        handle.add_macro(crate::macros::Macro::new("dance").add_event(Event::Roam, Payload::Empty, 0));
        assert!(handle.has_macro("dance"));
        assert_eq!(scheduler.subscribers().len(), 2);

        scheduler
            .bus()
            .publish(Event::Macro, Payload::Text("dance".into()))
            .unwrap();
        let report = scheduler.tick().unwrap();
        assert_eq!(report.delivery.consumed, 1);
        assert_eq!(report.winning_event(), Some(Event::Macro));
        assert_eq!(scheduler.macro_publisher.as_ref().unwrap().pending(), 1);
    }

    #[test]
    fn test_dire_event_escalates_when_configured() {
        let mut config = MrosConfig::standard();
        config.exit_on_dire_event = true;
        let (mut scheduler, _) = scheduler(config);
        scheduler.bus().publish(Event::BatteryLow, Payload::Empty).unwrap();

        assert!(matches!(
            scheduler.tick(),
            Err(MrosError::DireSystemEvent {
                event: Event::BatteryLow
            })
        ));
        // dispatch and collection still completed
        assert!(scheduler.bus().is_empty());
        assert_eq!(scheduler.bus().stats().dispatched, 1);
    }

    #[test]
    fn test_dire_event_ignored_by_default() {
        let (mut scheduler, _) = scheduler(MrosConfig::standard());
        scheduler.bus().publish(Event::HighTemperature, Payload::Empty).unwrap();
        let report = scheduler.tick().unwrap();
        assert_eq!(report.winning_event(), Some(Event::HighTemperature));
    }

    #[test]
    fn test_run_requires_stopped_state() {
        let (mut scheduler, _) = scheduler(MrosConfig::standard());
        scheduler.stop.start().unwrap();
        assert!(matches!(
            scheduler.run_for(Duration::from_millis(10)),
            Err(MrosError::InvalidState { .. })
        ));
        assert!(scheduler.clock.is_some());
    }
}
