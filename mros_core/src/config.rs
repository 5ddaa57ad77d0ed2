//! Process-wide configuration
//!
//! Loaded once at startup (usually from YAML), validated, then shared
//! read-only behind an `Arc` for the lifetime of the process.

use crate::error::{MrosError, MrosResult};
use crate::event::Priority;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Where ticks come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockMode {
    /// Local timer at `loop_freq_hz`
    #[default]
    Internal,
    /// Edge signal from outside the process (GPIO interrupt or similar)
    External,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub mode: ClockMode,
    /// Every `divider`th tick is a slow tick
    pub divider: u64,
    /// How long to wait for an external tick before giving up
    pub loss_timeout_ms: u64,
    /// Input line label for the external clock
    pub pin: Option<u8>,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            mode: ClockMode::Internal,
            divider: 4,
            loss_timeout_ms: 500,
            pin: None,
        }
    }
}

/// Macro processor timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacroConfig {
    /// How often the worker checks whether the next statement is due
    pub loop_freq_hz: f64,
    /// Upper bound on any single statement delay
    pub wait_limit_ms: u64,
}

impl Default for MacroConfig {
    fn default() -> Self {
        Self {
            loop_freq_hz: 20.0,
            wait_limit_ms: 10_000,
        }
    }
}

/// Enable flags for the built-in components
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentConfig {
    pub enable_queue_publisher: bool,
    pub enable_clock_publisher: bool,
    pub enable_macro_publisher: bool,
    pub enable_system_subscriber: bool,
    pub enable_omni_subscriber: bool,
    /// Requires `enable_macro_publisher`
    pub enable_macro_subscriber: bool,
}

impl Default for ComponentConfig {
    fn default() -> Self {
        Self {
            enable_queue_publisher: true,
            enable_clock_publisher: false,
            enable_macro_publisher: false,
            enable_system_subscriber: true,
            enable_omni_subscriber: false,
            enable_macro_subscriber: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MrosConfig {
    /// Internal clock frequency
    pub loop_freq_hz: f64,
    /// Messages strictly older than this are stale. Must cover at least one
    /// internal tick period.
    pub max_age_ms: u64,
    /// Maximum number of messages held by the bus
    pub bus_capacity: usize,
    /// Limit for diagnostic display of the bus; never affects semantics
    pub clip_length: Option<usize>,
    /// Drain period of the queue publisher
    pub publish_delay_ms: u64,
    /// Messages below this priority never win arbitration
    pub priority_floor: Option<u16>,
    /// Stop the control loop when a dire event is dispatched
    pub exit_on_dire_event: bool,
    pub clock: ClockConfig,
    pub macros: MacroConfig,
    pub components: ComponentConfig,
}

impl Default for MrosConfig {
    fn default() -> Self {
        Self {
            loop_freq_hz: 20.0,
            max_age_ms: 100,
            bus_capacity: 256,
            clip_length: None,
            publish_delay_ms: 50,
            priority_floor: None,
            exit_on_dire_event: false,
            clock: ClockConfig::default(),
            macros: MacroConfig::default(),
            components: ComponentConfig::default(),
        }
    }
}

impl MrosConfig {
    /// Default configuration: 20 Hz internal clock
    pub fn standard() -> Self {
        Self::default()
    }

    /// Ticks driven by an external signal, with a slow tick every fourth pulse
    pub fn external_clock() -> Self {
        Self {
            clock: ClockConfig {
                mode: ClockMode::External,
                ..ClockConfig::default()
            },
            ..Self::default()
        }
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> MrosResult<Self> {
        let config: MrosConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> MrosResult<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)?;
        log::info!("loading configuration from {}", path.display());
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> MrosResult<()> {
        if !(self.loop_freq_hz.is_finite() && self.loop_freq_hz > 0.0) {
            return Err(MrosError::Config(format!(
                "loop_freq_hz must be positive, got {}",
                self.loop_freq_hz
            )));
        }
        if self.max_age_ms == 0 {
            return Err(MrosError::Config("max_age_ms must be greater than zero".into()));
        }
        // an external clock has no known period to check against
        if self.clock.mode == ClockMode::Internal
            && Duration::from_millis(self.max_age_ms) < self.tick_period()
        {
            return Err(MrosError::Config(format!(
                "max_age_ms ({}) is shorter than the tick period ({:?}); \
                 messages published between ticks would expire unseen",
                self.max_age_ms,
                self.tick_period()
            )));
        }
        if self.bus_capacity == 0 {
            return Err(MrosError::Config("bus_capacity must be greater than zero".into()));
        }
        if self.clip_length == Some(0) {
            return Err(MrosError::Config("clip_length must be greater than zero when set".into()));
        }
        if self.publish_delay_ms == 0 {
            return Err(MrosError::Config("publish_delay_ms must be greater than zero".into()));
        }
        if self.clock.divider == 0 {
            return Err(MrosError::Config("clock.divider must be greater than zero".into()));
        }
        if self.clock.loss_timeout_ms == 0 {
            return Err(MrosError::Config("clock.loss_timeout_ms must be greater than zero".into()));
        }
        if !(self.macros.loop_freq_hz.is_finite() && self.macros.loop_freq_hz > 0.0) {
            return Err(MrosError::Config(format!(
                "macros.loop_freq_hz must be positive, got {}",
                self.macros.loop_freq_hz
            )));
        }
        if self.components.enable_macro_subscriber && !self.components.enable_macro_publisher {
            return Err(MrosError::Config(
                "the macro subscriber requires the macro publisher".into(),
            ));
        }
        Ok(())
    }

    /// Period of the internal clock
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.loop_freq_hz)
    }

    pub fn publish_delay(&self) -> Duration {
        Duration::from_millis(self.publish_delay_ms)
    }

    pub fn loss_timeout(&self) -> Duration {
        Duration::from_millis(self.clock.loss_timeout_ms)
    }

    pub fn priority_floor(&self) -> Option<Priority> {
        self.priority_floor.map(Priority)
    }

    pub fn macro_loop_delay(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.macros.loop_freq_hz)
    }

    pub fn macro_wait_limit(&self) -> Duration {
        Duration::from_millis(self.macros.wait_limit_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MrosConfig::standard();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_period(), Duration::from_millis(50));
        assert_eq!(config.max_age_ms, 100);
        assert!(Duration::from_millis(config.max_age_ms) >= config.tick_period());
        assert!(!config.components.enable_macro_publisher);
        assert_eq!(config.clock.mode, ClockMode::Internal);
        assert!(config.components.enable_system_subscriber);
        assert_eq!(MrosConfig::external_clock().clock.mode, ClockMode::External);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = MrosConfig::from_yaml_str(
            "loop_freq_hz: 10\n\
             exit_on_dire_event: true\n\
             priority_floor: 100\n\
             clock:\n  mode: external\n  pin: 18\n",
        )
        .unwrap();
        assert_eq!(config.tick_period(), Duration::from_millis(100));
        assert!(config.exit_on_dire_event);
        assert_eq!(config.priority_floor(), Some(Priority(100)));
        assert_eq!(config.clock.mode, ClockMode::External);
        assert_eq!(config.clock.pin, Some(18));
        assert_eq!(config.clock.divider, 4);
        assert_eq!(config.bus_capacity, 256);
    }

    #[test]
    fn test_validation() {
        let cases = [
            "loop_freq_hz: 0",
            "max_age_ms: 0",
            "bus_capacity: 0",
            "clip_length: 0",
            "clock:\n  divider: 0",
            "clock:\n  loss_timeout_ms: 0",
            "macros:\n  loop_freq_hz: 0",
            "components:\n  enable_macro_subscriber: true",
        ];
        for yaml in cases {
            assert!(
                matches!(MrosConfig::from_yaml_str(yaml), Err(MrosError::Config(_))),
                "{} should be rejected",
                yaml
            );
        }
        assert!(matches!(
            MrosConfig::from_yaml_str("clock:\n  mode: sundial"),
            Err(MrosError::Yaml(_))
        ));
    }

    #[test]
    fn test_max_age_must_cover_a_tick() {
        // 20 Hz ticks every 50 ms
        let short = MrosConfig {
            max_age_ms: 20,
            ..MrosConfig::standard()
        };
        assert!(matches!(short.validate(), Err(MrosError::Config(_))));

        let exact = MrosConfig {
            max_age_ms: 50,
            ..MrosConfig::standard()
        };
        assert!(exact.validate().is_ok());

        let fast = MrosConfig::from_yaml_str("loop_freq_hz: 100\nmax_age_ms: 20").unwrap();
        assert_eq!(fast.max_age_ms, 20);

        // no period to compare against when ticks come from outside
        let external = MrosConfig {
            max_age_ms: 20,
            ..MrosConfig::external_clock()
        };
        assert!(external.validate().is_ok());
    }

    #[test]
    fn test_macro_settings() {
        let config = MrosConfig::from_yaml_str(
            "macros:\n  loop_freq_hz: 50\n  wait_limit_ms: 2000\n\
             components:\n  enable_macro_publisher: true\n  enable_macro_subscriber: true\n",
        )
        .unwrap();
        assert_eq!(config.macro_loop_delay(), Duration::from_millis(20));
        assert_eq!(config.macro_wait_limit(), Duration::from_secs(2));
        assert!(config.components.enable_macro_subscriber);
    }
}
