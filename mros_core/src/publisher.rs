//! Publishers: the only producers of bus messages.
//!
//! - [`Publisher`] publishes directly, gated by enable and suppress flags
//! - [`QueuePublisher`] buffers events from non-realtime code and drains
//!   them onto the bus from a worker thread every `publish_delay_ms`
//! - [`ClockPublisher`] turns slow clock ticks into `TICK` messages
//! - [`MacroPublisher`] plays queued [`Macro`]s, running each statement
//!   once its delay has passed

use crate::bus::MessageBus;
use crate::clock::Tick;
use crate::config::MrosConfig;
use crate::error::MrosResult;
use crate::event::Event;
use crate::macros::{Action, Macro, MacroLibrary, Statement};
use crate::message::{MessageId, Payload};
use crate::subscriber::panic_message;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Named producer bound to a bus handle
///
/// Clones share their enable and suppress flags.
#[derive(Debug, Clone)]
pub struct Publisher {
    name: String,
    bus: MessageBus,
    enabled: Arc<AtomicBool>,
    suppressed: Arc<AtomicBool>,
}

impl Publisher {
    pub fn new(name: impl Into<String>, bus: MessageBus) -> Self {
        Self {
            name: name.into(),
            bus,
            enabled: Arc::new(AtomicBool::new(true)),
            suppressed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Temporarily silence an enabled publisher.
    pub fn suppress(&self, suppressed: bool) {
        self.suppressed.store(suppressed, Ordering::SeqCst);
    }

    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.is_enabled() && !self.is_suppressed()
    }

    /// Publish now if active. Returns `Ok(None)` when the publisher is
    /// disabled or suppressed and the event was dropped.
    pub fn enqueue(&self, event: Event, payload: Payload) -> MrosResult<Option<MessageId>> {
        if !self.is_enabled() {
            log::debug!("{}: disabled, dropping {}", self.name, event);
            return Ok(None);
        }
        if self.is_suppressed() {
            log::warn!("{}: suppressed, dropping {}", self.name, event);
            return Ok(None);
        }
        let id = self.bus.publish(event, payload)?;
        Ok(Some(id))
    }
}

/// Cloneable sending side of a [`QueuePublisher`]
#[derive(Debug, Clone)]
pub struct QueueHandle {
    sender: Sender<(Event, Payload)>,
}

impl QueueHandle {
    /// Queue an event for the next drain. Returns `false` if the queue
    /// publisher has been dropped.
    pub fn put(&self, event: Event, payload: impl Into<Payload>) -> bool {
        self.sender.send((event, payload.into())).is_ok()
    }
}

/// Buffered publisher drained by a worker thread
pub struct QueuePublisher {
    publisher: Publisher,
    sender: Sender<(Event, Payload)>,
    receiver: Receiver<(Event, Payload)>,
    delay: Duration,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl QueuePublisher {
    pub fn new(bus: MessageBus, delay: Duration) -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            publisher: Publisher::new("queue-publisher", bus),
            sender,
            receiver,
            delay,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn from_config(config: &MrosConfig, bus: MessageBus) -> Self {
        Self::new(bus, config.publish_delay())
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            sender: self.sender.clone(),
        }
    }

    pub fn put(&self, event: Event, payload: impl Into<Payload>) -> bool {
        self.sender.send((event, payload.into())).is_ok()
    }

    /// Number of queued events not yet published
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Publish everything queued so far on the calling thread.
    pub fn flush(&self) -> usize {
        drain(&self.receiver, &self.publisher)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Spawn the drain worker. Calling `start` twice is a no-op.
    pub fn start(&mut self) -> MrosResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let receiver = self.receiver.clone();
        let publisher = self.publisher.clone();
        let delay = self.delay;

        let worker = thread::Builder::new()
            .name("mros-queue-publisher".to_string())
            .spawn(move || {
                log::debug!("queue publisher: draining every {:?}", delay);
                while running.load(Ordering::SeqCst) {
                    thread::sleep(delay);
                    drain(&receiver, &publisher);
                }
                drain(&receiver, &publisher);
            })?;
        self.worker = Some(worker);
        log::info!("queue publisher started");
        Ok(())
    }

    /// Stop the worker and wait for its final drain.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("queue publisher: worker thread panicked");
            }
            log::info!("queue publisher stopped");
        }
    }
}

impl Drop for QueuePublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain(receiver: &Receiver<(Event, Payload)>, publisher: &Publisher) -> usize {
    let mut published = 0;
    for (event, payload) in receiver.try_iter() {
        match publisher.enqueue(event, payload) {
            Ok(Some(_)) => published += 1,
            Ok(None) => {}
            Err(e) => log::warn!("{}: could not publish {}: {}", publisher.name(), event, e),
        }
    }
    published
}

/// Publishes `TICK` on every slow tick
#[derive(Debug)]
pub struct ClockPublisher {
    publisher: Publisher,
}

impl ClockPublisher {
    pub fn new(bus: MessageBus) -> Self {
        Self {
            publisher: Publisher::new("clock-publisher", bus),
        }
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn on_tick(&self, tick: &Tick) -> MrosResult<Option<MessageId>> {
        if !tick.slow {
            return Ok(None);
        }
        self.publisher
            .enqueue(Event::Tick, Payload::Int(tick.count as i64))
    }
}

/// Cloneable access to a [`MacroPublisher`]'s library and play queue
#[derive(Debug, Clone)]
pub struct MacroHandle {
    library: Arc<RwLock<MacroLibrary>>,
    sender: Sender<Macro>,
}

impl MacroHandle {
    /// Store `script` in the library, replacing any macro of the same name.
    pub fn add_macro(&self, script: Macro) {
        log::info!("macro publisher: adding '{}' to library", script.name());
        self.library.write().put(script);
    }

    pub fn has_macro(&self, name: &str) -> bool {
        self.library.read().contains(name)
    }

    /// Queue `script` for playback after any macros already queued.
    pub fn queue(&self, script: Macro) -> bool {
        self.sender.send(script).is_ok()
    }

    /// Queue a copy of the named library macro. `completion`, if given, is
    /// published once the copy has finished. Returns `false` if no such
    /// macro exists.
    pub fn queue_by_name(&self, name: &str, completion: Option<(Event, Payload)>) -> bool {
        let mut script = match self.library.read().get(name) {
            Some(script) => script.clone(),
            None => {
                log::warn!("macro publisher: could not find macro '{}'", name);
                return false;
            }
        };
        if let Some((event, payload)) = completion {
            script.set_completion(event, payload);
        }
        log::info!("macro publisher: queued '{}' ({} statement(s))", name, script.len());
        self.queue(script)
    }
}

/// Playback state: the macro being played and its current statement
#[derive(Debug)]
struct MacroPlayer {
    receiver: Receiver<Macro>,
    current: Option<Macro>,
    statement: Option<(Statement, Instant)>,
    wait_limit: Duration,
}

impl MacroPlayer {
    /// Advance playback to `now`; returns the number of statements run.
    fn process(&mut self, publisher: &Publisher, now: Instant) -> usize {
        if !publisher.is_active() {
            return 0;
        }
        if self.current.is_none() {
            match self.receiver.try_recv() {
                Ok(script) => {
                    log::info!(
                        "macro publisher: playing '{}' ({} statement(s))",
                        script.name(),
                        script.len()
                    );
                    self.current = Some(script);
                }
                Err(_) => return 0,
            }
        }
        let Some(script) = self.current.as_mut() else {
            return 0;
        };

        if self.statement.is_none() {
            if let Some(statement) = script.poll() {
                self.statement = Some((statement, now));
            }
        }

        let mut executed = 0;
        if let Some((statement, started)) = self.statement.take() {
            let elapsed = now.saturating_duration_since(started);
            if elapsed >= statement.delay() || elapsed >= self.wait_limit {
                run_statement(publisher, script.name(), &statement);
                executed += 1;
            } else {
                log::trace!(
                    "macro publisher: {} waiting, {:?} elapsed",
                    statement.label(),
                    elapsed
                );
                self.statement = Some((statement, started));
            }
        }

        if self.statement.is_none() && script.is_empty() {
            if let Some((event, payload)) = script.completion().cloned() {
                if let Err(e) = publisher.enqueue(event, payload) {
                    log::warn!("macro publisher: could not publish completion {}: {}", event, e);
                }
            }
            log::info!("macro publisher: '{}' complete", script.name());
            self.current = None;
        }
        executed
    }
}

fn run_statement(publisher: &Publisher, macro_name: &str, statement: &Statement) {
    match statement.action() {
        Action::Publish { event, payload } => {
            log::debug!("macro publisher: {} {} publishes {}", macro_name, statement.label(), event);
            if let Err(e) = publisher.enqueue(*event, payload.clone()) {
                log::warn!("macro publisher: could not publish {}: {}", event, e);
            }
        }
        Action::Call(function) => {
            log::debug!("macro publisher: {} {} runs a function", macro_name, statement.label());
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| function())) {
                log::error!(
                    "macro publisher: function in {} {} panicked: {}",
                    macro_name,
                    statement.label(),
                    panic_message(&*panic)
                );
            }
        }
    }
}

/// Plays macros from a worker thread, checking every `loop_delay` whether
/// the next statement is due
pub struct MacroPublisher {
    publisher: Publisher,
    handle: MacroHandle,
    player: Arc<Mutex<MacroPlayer>>,
    loop_delay: Duration,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl MacroPublisher {
    pub fn new(bus: MessageBus, loop_delay: Duration, wait_limit: Duration) -> Self {
        let (sender, receiver) = channel::unbounded();
        Self {
            publisher: Publisher::new("macro-publisher", bus),
            handle: MacroHandle {
                library: Arc::new(RwLock::new(MacroLibrary::new("default"))),
                sender,
            },
            player: Arc::new(Mutex::new(MacroPlayer {
                receiver,
                current: None,
                statement: None,
                wait_limit,
            })),
            loop_delay,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn from_config(config: &MrosConfig, bus: MessageBus) -> Self {
        Self::new(bus, config.macro_loop_delay(), config.macro_wait_limit())
    }

    /// Replace the macro library.
    pub fn set_library(&self, library: MacroLibrary) {
        log::info!("macro publisher: using library '{}' ({} macro(s))", library.name(), library.len());
        *self.handle.library.write() = library;
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn handle(&self) -> MacroHandle {
        self.handle.clone()
    }

    pub fn add_macro(&self, script: Macro) {
        self.handle.add_macro(script);
    }

    pub fn queue_by_name(&self, name: &str, completion: Option<(Event, Payload)>) -> bool {
        self.handle.queue_by_name(name, completion)
    }

    /// Macros waiting behind the one being played
    pub fn pending(&self) -> usize {
        self.player.lock().receiver.len()
    }

    /// Name of the macro being played, if any
    pub fn playing(&self) -> Option<String> {
        self.player.lock().current.as_ref().map(|m| m.name().to_string())
    }

    /// Advance playback to `now` on the calling thread.
    pub fn process(&self, now: Instant) -> usize {
        self.player.lock().process(&self.publisher, now)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Spawn the playback worker. Calling `start` twice is a no-op.
    pub fn start(&mut self) -> MrosResult<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let player = self.player.clone();
        let publisher = self.publisher.clone();
        let delay = self.loop_delay;

        let worker = thread::Builder::new()
            .name("mros-macro-publisher".to_string())
            .spawn(move || {
                log::debug!("macro publisher: checking statements every {:?}", delay);
                while running.load(Ordering::SeqCst) {
                    thread::sleep(delay);
                    player.lock().process(&publisher, Instant::now());
                }
            })?;
        self.worker = Some(worker);
        log::info!("macro publisher started");
        Ok(())
    }

    /// Stop the worker. A macro still playing is left where it is.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("macro publisher: worker thread panicked");
            }
            if let Some(name) = self.playing() {
                log::warn!("macro publisher: stopped while playing '{}'", name);
            }
            log::info!("macro publisher stopped");
        }
    }
}

impl Drop for MacroPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}
