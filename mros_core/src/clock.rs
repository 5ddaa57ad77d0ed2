//! Tick sources and the scheduler lifecycle.
//!
//! Two [`ClockSource`] implementations are provided. [`InternalClock`] sleeps
//! to fixed deadlines at `loop_freq_hz`. [`ExternalClock`] blocks on pulses
//! sent through a [`ClockSignal`] (typically from a GPIO edge handler) and
//! reports [`MrosError::ClockSourceLoss`] when they stop arriving.

use crate::config::{ClockMode, MrosConfig};
use crate::error::{MrosError, MrosResult};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::fmt;
use std::time::{Duration, Instant};

/// Lifecycle of the control loop: `Stopped -> Running -> Stopping -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Stopped,
    Running,
    Stopping,
}

impl fmt::Display for ClockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClockState::Stopped => "stopped",
            ClockState::Running => "running",
            ClockState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

impl ClockState {
    pub fn can_transition_to(self, next: ClockState) -> bool {
        matches!(
            (self, next),
            (ClockState::Stopped, ClockState::Running)
                | (ClockState::Running, ClockState::Stopping)
                | (ClockState::Stopping, ClockState::Stopped)
        )
    }

    /// Validated transition
    pub fn transition(self, next: ClockState) -> MrosResult<ClockState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(MrosError::InvalidState {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

/// One clock tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Zero-based tick number
    pub count: u64,
    /// Every `divider`th tick is also a slow tick
    pub slow: bool,
}

#[derive(Debug, Clone)]
struct TickCounter {
    next: u64,
    divider: u64,
}

impl TickCounter {
    fn new(divider: u64) -> Self {
        Self {
            next: 0,
            divider: divider.max(1),
        }
    }

    fn advance(&mut self) -> Tick {
        let count = self.next;
        self.next += 1;
        Tick {
            count,
            slow: count % self.divider == 0,
        }
    }
}

/// Something that paces the control loop
pub trait ClockSource: Send {
    fn name(&self) -> &str;

    /// Block until the next tick is due.
    fn wait_tick(&mut self) -> MrosResult<Tick>;
}

/// Fixed-rate local timer
#[derive(Debug)]
pub struct InternalClock {
    period: Duration,
    counter: TickCounter,
    deadline: Option<Instant>,
}

impl InternalClock {
    pub fn new(period: Duration, divider: u64) -> Self {
        Self {
            period,
            counter: TickCounter::new(divider),
            deadline: None,
        }
    }

    pub fn from_frequency(hz: f64, divider: u64) -> Self {
        Self::new(Duration::from_secs_f64(1.0 / hz), divider)
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl ClockSource for InternalClock {
    fn name(&self) -> &str {
        "internal"
    }

    fn wait_tick(&mut self) -> MrosResult<Tick> {
        let now = Instant::now();
        match self.deadline {
            // first tick fires immediately
            None => self.deadline = Some(now + self.period),
            Some(deadline) if deadline > now => {
                std::thread::sleep(deadline - now);
                self.deadline = Some(deadline + self.period);
            }
            Some(deadline) => {
                let behind = now - deadline;
                if behind > self.period {
                    log::debug!("internal clock: {:?} behind schedule, resyncing", behind);
                    self.deadline = Some(now + self.period);
                } else {
                    self.deadline = Some(deadline + self.period);
                }
            }
        }
        Ok(self.counter.advance())
    }
}

/// Sending side of an external clock: call [`pulse`](Self::pulse) on each edge.
#[derive(Debug, Clone)]
pub struct ClockSignal {
    sender: Sender<Instant>,
}

impl ClockSignal {
    /// Returns `false` if the pulse was dropped (no clock listening, or the
    /// loop has fallen too far behind).
    pub fn pulse(&self) -> bool {
        match self.sender.try_send(Instant::now()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::trace!("external clock: pulse overrun");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Ticks driven by an outside signal
#[derive(Debug)]
pub struct ExternalClock {
    receiver: Receiver<Instant>,
    loss_timeout: Duration,
    counter: TickCounter,
    pin: Option<u8>,
}

impl ExternalClock {
    const PENDING_PULSES: usize = 16;

    /// Create the clock together with the signal that drives it.
    pub fn new(loss_timeout: Duration, divider: u64) -> (Self, ClockSignal) {
        let (sender, receiver) = channel::bounded(Self::PENDING_PULSES);
        let clock = Self {
            receiver,
            loss_timeout,
            counter: TickCounter::new(divider),
            pin: None,
        };
        (clock, ClockSignal { sender })
    }

    pub fn with_pin(mut self, pin: u8) -> Self {
        self.pin = Some(pin);
        self
    }

    pub fn pin(&self) -> Option<u8> {
        self.pin
    }
}

impl ClockSource for ExternalClock {
    fn name(&self) -> &str {
        "external"
    }

    fn wait_tick(&mut self) -> MrosResult<Tick> {
        match self.receiver.recv_timeout(self.loss_timeout) {
            Ok(_) => Ok(self.counter.advance()),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(MrosError::ClockSourceLoss {
                    waited: self.loss_timeout,
                })
            }
        }
    }
}

/// Build the clock selected by `config`. The signal is `Some` in external mode.
pub fn from_config(config: &MrosConfig) -> (Box<dyn ClockSource>, Option<ClockSignal>) {
    match config.clock.mode {
        ClockMode::Internal => (
            Box::new(InternalClock::new(config.tick_period(), config.clock.divider)),
            None,
        ),
        ClockMode::External => {
            let (clock, signal) = ExternalClock::new(config.loss_timeout(), config.clock.divider);
            let clock = match config.clock.pin {
                Some(pin) => clock.with_pin(pin),
                None => clock,
            };
            (Box::new(clock), Some(signal))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use ClockState::*;
        assert_eq!(Stopped.transition(Running).unwrap(), Running);
        assert_eq!(Running.transition(Stopping).unwrap(), Stopping);
        assert_eq!(Stopping.transition(Stopped).unwrap(), Stopped);
        assert!(matches!(
            Stopped.transition(Stopping),
            Err(MrosError::InvalidState { .. })
        ));
        assert!(Running.transition(Running).is_err());
    }

    #[test]
    fn test_slow_ticks() {
        let mut counter = TickCounter::new(4);
        let slow: Vec<u64> = (0..9)
            .map(|_| counter.advance())
            .filter(|t| t.slow)
            .map(|t| t.count)
            .collect();
        assert_eq!(slow, vec![0, 4, 8]);
    }

    #[test]
    fn test_internal_clock_paces_ticks() {
        let mut clock = InternalClock::new(Duration::from_millis(10), 1);
        let start = Instant::now();
        for expected in 0..4 {
            assert_eq!(clock.wait_tick().unwrap().count, expected);
        }
        // first tick is immediate, the next three wait one period each
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_external_clock_follows_signal() {
        let (mut clock, signal) = ExternalClock::new(Duration::from_millis(200), 2);
        assert!(signal.pulse());
        assert!(signal.pulse());
        assert_eq!(clock.wait_tick().unwrap(), Tick { count: 0, slow: true });
        assert_eq!(clock.wait_tick().unwrap(), Tick { count: 1, slow: false });
    }

    #[test]
    fn test_external_clock_loss() {
        let (mut clock, signal) = ExternalClock::new(Duration::from_millis(20), 1);
        assert!(matches!(
            clock.wait_tick(),
            Err(MrosError::ClockSourceLoss { .. })
        ));
        drop(signal);
        assert!(matches!(
            clock.wait_tick(),
            Err(MrosError::ClockSourceLoss { .. })
        ));
    }

    #[test]
    fn test_from_config() {
        let (clock, signal) = from_config(&MrosConfig::standard());
        assert_eq!(clock.name(), "internal");
        assert!(signal.is_none());

        let mut config = MrosConfig::external_clock();
        config.clock.pin = Some(17);
        let (clock, signal) = from_config(&config);
        assert_eq!(clock.name(), "external");
        assert!(signal.is_some());
    }
}
