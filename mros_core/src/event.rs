//! # Event registry
//!
//! Every message on the bus carries an [`Event`]. Events form a closed,
//! compile-time table: each one has a stable numeric code, a label, a fixed
//! [`Priority`] and a [`Group`]. Higher priority values win arbitration.
//!
//! ## Priority bands
//!
//! - **900-1000**: system and stop events
//! - **700-899**: bumpers and infrared sensors
//! - **400-699**: macros, remote control, motion directives
//! - **300-399**: high level behaviours
//! - **0-199**: clock, experiments and housekeeping

use crate::error::MrosError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed arbitration priority of an event type (higher wins)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u16);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    pub const HIGHEST: Priority = Priority(u16::MAX);

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event groups, used to register interest in whole families of events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Group {
    None,
    System,
    Macro,
    Gamepad,
    Stop,
    Bumper,
    Infrared,
    Velocity,
    Theta,
    Chadburn,
    Behaviour,
    Clock,
    Experiment,
    Remote,
    Other,
}

impl Group {
    pub const ALL: [Group; 15] = [
        Group::None,
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
        Group::Clock,
        Group::Experiment,
        Group::Remote,
        Group::Other,
    ];
}

macro_rules! define_events {
    ($( $variant:ident = ($name:literal, $code:literal, $label:literal, $priority:literal, $group:ident) ),+ $(,)?) => {
        /// Event types known to the core
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum Event {
            $( #[serde(rename = $name)] $variant ),+
        }

        impl Event {
            /// Every event, in declaration order
            pub const ALL: &'static [Event] = &[ $( Event::$variant ),+ ];

            /// Canonical upper-case name
            pub const fn name(self) -> &'static str {
                match self { $( Event::$variant => $name ),+ }
            }

            /// Stable numeric code
            pub const fn code(self) -> u16 {
                match self { $( Event::$variant => $code ),+ }
            }

            /// Human readable label
            pub const fn label(self) -> &'static str {
                match self { $( Event::$variant => $label ),+ }
            }

            /// Fixed arbitration priority
            pub const fn priority(self) -> Priority {
                match self { $( Event::$variant => Priority($priority) ),+ }
            }

            pub const fn group(self) -> Group {
                match self { $( Event::$variant => Group::$group ),+ }
            }
        }
    };
}

define_events! {
    Noop                 = ("NOOP",                   0, "no operation",             0, None),

    // system
    Shutdown             = ("SHUTDOWN",              10, "shutdown",              1000, System),
    BatteryLow           = ("BATTERY_LOW",           11, "battery low",            990, System),
    HighTemperature      = ("HIGH_TEMPERATURE",      12, "high temperature",       990, System),
    CollisionDetect      = ("COLLISION_DETECT",      13, "collision detect",       980, System),

    // macros
    Macro                = ("MACRO",                 20, "macro script",           600, Macro),
    Lambda               = ("LAMBDA",                21, "lambda function",        600, Macro),

    Gamepad              = ("GAMEPAD",               40, "gamepad",                500, Gamepad),

    // stopping and halting
    Stop                 = ("STOP",                  50, "stop",                   900, Stop),
    Halt                 = ("HALT",                  51, "halt",                   890, Stop),
    Brake                = ("BRAKE",                 52, "brake",                  880, Stop),
    Standby              = ("STANDBY",               53, "standby",                870, Stop),
    Button               = ("BUTTON",                54, "button",                 860, Stop),

    // remote
    RemoteA              = ("REMOTE_A",              60, "remote A",               500, Remote),
    RemoteB              = ("REMOTE_B",              61, "remote B",               500, Remote),
    RemoteY              = ("REMOTE_Y",              62, "remote Y",               500, Remote),
    RemoteX              = ("REMOTE_X",              63, "remote X",               500, Remote),
    RemoteD              = ("REMOTE_D",              64, "remote D",               500, Remote),
    RemoteR              = ("REMOTE_R",              65, "remote R",               500, Remote),
    RemoteU              = ("REMOTE_U",              66, "remote U",               500, Remote),
    RemoteL              = ("REMOTE_L",              67, "remote L",               500, Remote),
    RemoteForward        = ("REMOTE_FORWARD",        68, "remote forward",         500, Remote),
    RemoteAft            = ("REMOTE_AFT",            69, "remote aft",             500, Remote),
    RemotePort           = ("REMOTE_PORT",           70, "remote port",            500, Remote),
    RemoteStbd           = ("REMOTE_STBD",           71, "remote stbd",            500, Remote),

    // bumpers
    BumperMast           = ("BUMPER_MAST",          110, "mast bumper",            800, Bumper),
    BumperPaft           = ("BUMPER_PAFT",          111, "port aft bumper",        770, Bumper),
    BumperPort           = ("BUMPER_PORT",          112, "port bumper",            780, Bumper),
    BumperCntr           = ("BUMPER_CNTR",          113, "center bumper",          790, Bumper),
    BumperStbd           = ("BUMPER_STBD",          114, "starboard bumper",       780, Bumper),
    BumperSaft           = ("BUMPER_SAFT",          115, "starboard aft bumper",   760, Bumper),

    // infrared
    InfraredPsid         = ("INFRARED_PSID",        120, "infrared port side",     680, Infrared),
    InfraredPort         = ("INFRARED_PORT",        121, "infrared port",          690, Infrared),
    InfraredCntr         = ("INFRARED_CNTR",        122, "infrared cntr",          700, Infrared),
    InfraredStbd         = ("INFRARED_STBD",        123, "infrared stbd",          690, Infrared),
    InfraredSsid         = ("INFRARED_SSID",        124, "infrared stbd side",     680, Infrared),

    // velocity directives
    Velocity             = ("VELOCITY",             200, "velocity",               400, Velocity),
    PortVelocity         = ("PORT_VELOCITY",        201, "port velocity",          400, Velocity),
    StbdVelocity         = ("STBD_VELOCITY",        202, "stbd velocity",          400, Velocity),
    DecreaseVelocity     = ("DECREASE_VELOCITY",    203, "decrease velocity",      400, Velocity),
    IncreaseVelocity     = ("INCREASE_VELOCITY",    204, "increase velocity",      400, Velocity),
    DecreasePortVelocity = ("DECREASE_PORT_VELOCITY", 205, "decrease port velocity", 400, Velocity),
    IncreasePortVelocity = ("INCREASE_PORT_VELOCITY", 206, "increase port velocity", 400, Velocity),
    DecreaseStbdVelocity = ("DECREASE_STBD_VELOCITY", 207, "decrease stbd velocity", 400, Velocity),
    IncreaseStbdVelocity = ("INCREASE_STBD_VELOCITY", 208, "increase stbd velocity", 400, Velocity),

    // theta directives
    Theta                = ("THETA",                300, "theta",                  400, Theta),
    PortTheta            = ("PORT_THETA",           301, "port theta",             400, Theta),
    StbdTheta            = ("STBD_THETA",           302, "stbd theta",             400, Theta),
    Even                 = ("EVEN",                 303, "even",                   400, Theta),
    IncreasePortTheta    = ("INCREASE_PORT_THETA",  304, "increase port theta",    400, Theta),
    DecreasePortTheta    = ("DECREASE_PORT_THETA",  305, "decrease port theta",    400, Theta),
    IncreaseStbdTheta    = ("INCREASE_STBD_THETA",  306, "increase stbd theta",    400, Theta),
    DecreaseStbdTheta    = ("DECREASE_STBD_THETA",  307, "decrease stbd theta",    400, Theta),
    TurnAheadPort        = ("TURN_AHEAD_PORT",      310, "turn ahead port",        400, Theta),
    TurnToPort           = ("TURN_TO_PORT",         311, "turn to port",           400, Theta),
    TurnAsternPort       = ("TURN_ASTERN_PORT",     312, "turn astern port",       400, Theta),
    SpinPort             = ("SPIN_PORT",            313, "spin port",              400, Theta),
    SpinStbd             = ("SPIN_STBD",            320, "spin stbd",              400, Theta),
    TurnAsternStbd       = ("TURN_ASTERN_STBD",     321, "turn astern stbd",       400, Theta),
    TurnToStbd           = ("TURN_TO_STBD",         322, "turn to stbd",           400, Theta),
    TurnAheadStbd        = ("TURN_AHEAD_STBD",      323, "turn ahead stbd",        400, Theta),

    // chadburn (engine order telegraph)
    FullAstern           = ("FULL_ASTERN",          401, "full astern",            400, Chadburn),
    TwoThirdsAstern      = ("TWO_THIRDS_ASTERN",    402, "two thirds astern",      400, Chadburn),
    HalfAstern           = ("HALF_ASTERN",          403, "half astern",            400, Chadburn),
    OneThirdAstern       = ("ONE_THIRD_ASTERN",     404, "one third astern",       400, Chadburn),
    SlowAstern           = ("SLOW_ASTERN",          405, "slow astern",            400, Chadburn),
    DeadSlowAstern       = ("DEAD_SLOW_ASTERN",     406, "dead slow astern",       400, Chadburn),
    FullAhead            = ("FULL_AHEAD",           411, "full ahead",             400, Chadburn),
    TwoThirdsAhead       = ("TWO_THIRDS_AHEAD",     412, "two thirds ahead",       400, Chadburn),
    HalfAhead            = ("HALF_AHEAD",           413, "half ahead",             400, Chadburn),
    OneThirdAhead        = ("ONE_THIRD_AHEAD",      414, "one third ahead",        400, Chadburn),
    SlowAhead            = ("SLOW_AHEAD",           415, "slow ahead",             400, Chadburn),
    DeadSlowAhead        = ("DEAD_SLOW_AHEAD",      416, "dead slow ahead",        400, Chadburn),

    // high level behaviours
    Avoid                = ("AVOID",                500, "avoid",                  350, Behaviour),
    MotionDetect         = ("MOTION_DETECT",        501, "motion detect",          349, Behaviour),
    Roam                 = ("ROAM",                 502, "roam",                   340, Behaviour),
    Moth                 = ("MOTH",                 503, "moth",                   339, Behaviour),
    Swerve               = ("SWERVE",               504, "swerve",                 338, Behaviour),
    Sniff                = ("SNIFF",                505, "sniff",                  338, Behaviour),
    EventL2              = ("EVENT_L2",             506, "L2",                     337, Behaviour),
    EventR1              = ("EVENT_R1",             507, "cruise",                 336, Behaviour),
    Lights               = ("LIGHTS",               508, "lights",                 335, Behaviour),
    Video                = ("VIDEO",                509, "video",                  325, Behaviour),
    Idle                 = ("IDLE",                 510, "idle",                   320, Behaviour),

    Tick                 = ("TICK",                 701, "tick",                   100, Clock),

    // experiments
    Experiment1          = ("EXPERIMENT_1",         801, "experiment 1",            50, Experiment),
    Experiment2          = ("EXPERIMENT_2",         802, "experiment 2",            50, Experiment),
    Experiment3          = ("EXPERIMENT_3",         803, "experiment 3",            50, Experiment),
    Experiment4          = ("EXPERIMENT_4",         804, "experiment 4",            50, Experiment),
    Experiment5          = ("EXPERIMENT_5",         805, "experiment 5",            50, Experiment),
    Experiment6          = ("EXPERIMENT_6",         806, "experiment 6",            50, Experiment),
    Experiment7          = ("EXPERIMENT_7",         807, "experiment 7",            50, Experiment),

    NoAction             = ("NO_ACTION",            900, "no action",                2, Other),
    Rgb                  = ("RGB",                  909, "rgb",                      1, Other),
}

impl Event {
    /// Position in [`Event::ALL`], used as the bit index in [`EventSet`]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_code(code: u16) -> Option<Event> {
        Event::ALL.iter().copied().find(|e| e.code() == code)
    }

    /// All events belonging to `group`, in declaration order.
    pub fn by_group(group: Group) -> Vec<Event> {
        Event::ALL.iter().copied().filter(|e| e.group() == group).collect()
    }

    pub fn is_system_event(self) -> bool {
        self.group() == Group::System
    }

    pub fn is_bumper_event(self) -> bool {
        self.group() == Group::Bumper
    }

    pub fn is_infrared_event(self) -> bool {
        self.group() == Group::Infrared
    }

    /// Bumper or infrared: the integrated front sensor events.
    pub fn is_ifs_event(self) -> bool {
        self.is_bumper_event() || self.is_infrared_event()
    }

    /// Events that directly command the motors (stopping, velocity, theta, chadburn).
    pub fn is_motor_event(self) -> bool {
        matches!(
            self.group(),
            Group::Stop | Group::Velocity | Group::Theta | Group::Chadburn
        )
    }

    /// High-severity faults that may terminate the control loop.
    pub fn is_dire(self) -> bool {
        matches!(self, Event::BatteryLow | Event::HighTemperature)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Event {
    type Err = MrosError;

    /// Parse a case-insensitive event name such as `bumper_port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Event::ALL
            .iter()
            .copied()
            .find(|e| e.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| MrosError::UnknownEvent(s.to_string()))
    }
}

/// Fixed-size bitset over all [`Event`]s
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventSet(u128);

impl EventSet {
    pub const fn empty() -> Self {
        EventSet(0)
    }

    pub fn all() -> Self {
        Event::ALL.iter().copied().collect()
    }

    pub fn of(events: &[Event]) -> Self {
        events.iter().copied().collect()
    }

    pub fn of_group(group: Group) -> Self {
        Event::ALL
            .iter()
            .copied()
            .filter(|e| e.group() == group)
            .collect()
    }

    pub fn of_groups(groups: &[Group]) -> Self {
        Event::ALL
            .iter()
            .copied()
            .filter(|e| groups.contains(&e.group()))
            .collect()
    }

    /// Builder-style insert
    pub fn with(mut self, event: Event) -> Self {
        self.insert(event);
        self
    }

    pub fn insert(&mut self, event: Event) {
        self.0 |= 1u128 << event.index();
    }

    pub fn remove(&mut self, event: Event) {
        self.0 &= !(1u128 << event.index());
    }

    pub fn contains(&self, event: Event) -> bool {
        self.0 & (1u128 << event.index()) != 0
    }

    pub fn union(self, other: EventSet) -> EventSet {
        EventSet(self.0 | other.0)
    }

    pub fn difference(self, other: EventSet) -> EventSet {
        EventSet(self.0 & !other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        Event::ALL.iter().copied().filter(move |e| self.contains(*e))
    }
}

impl FromIterator<Event> for EventSet {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        let mut set = EventSet::empty();
        for event in iter {
            set.insert(event);
        }
        set
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_table_fits_event_set() {
        assert!(Event::ALL.len() <= 128);
        for (i, event) in Event::ALL.iter().enumerate() {
            assert_eq!(event.index(), i);
        }
    }

    #[test]
    fn test_codes_and_names_unique() {
        let codes: HashSet<u16> = Event::ALL.iter().map(|e| e.code()).collect();
        let names: HashSet<&str> = Event::ALL.iter().map(|e| e.name()).collect();
        assert_eq!(codes.len(), Event::ALL.len());
        assert_eq!(names.len(), Event::ALL.len());
    }

    #[test]
    fn test_lookup() {
        assert_eq!(Event::from_code(112), Some(Event::BumperPort));
        assert_eq!(Event::from_code(9999), None);
        assert_eq!("bumper_port".parse::<Event>().unwrap(), Event::BumperPort);
        assert_eq!(" REMOTE_FORWARD ".parse::<Event>().unwrap(), Event::RemoteForward);
        assert!("NOT_AN_EVENT".parse::<Event>().is_err());
        assert_eq!(Event::BumperPort.to_string(), "BUMPER_PORT");
    }

    #[test]
    fn test_serde_uses_canonical_names() {
        for event in Event::ALL {
            let json = serde_json::to_string(event).unwrap();
            assert_eq!(json, format!("\"{}\"", event.name()));
            assert_eq!(serde_json::from_str::<Event>(&json).unwrap(), *event);
        }
        assert_eq!(
            serde_json::to_string(&Event::Experiment1).unwrap(),
            "\"EXPERIMENT_1\""
        );
    }

    #[test]
    fn test_priorities() {
        assert!(Event::BumperPort.priority() > Event::RemoteForward.priority());
        assert!(Event::Shutdown.priority() > Event::Stop.priority());
        assert!(Event::Stop.priority() > Event::BumperMast.priority());
        assert!(Event::Tick.priority() < Event::Idle.priority());
        assert_eq!(Event::BumperPort.priority(), Event::BumperStbd.priority());
    }

    #[test]
    fn test_groups_and_predicates() {
        let bumpers = Event::by_group(Group::Bumper);
        assert_eq!(bumpers.len(), 6);
        assert!(bumpers.iter().all(|e| e.is_bumper_event() && e.is_ifs_event()));
        assert!(Event::InfraredCntr.is_ifs_event());
        assert!(Event::HalfAhead.is_motor_event());
        assert!(Event::Brake.is_motor_event());
        assert!(!Event::Avoid.is_motor_event());
        assert!(Event::BatteryLow.is_dire());
        assert!(Event::HighTemperature.is_dire());
        assert!(!Event::Shutdown.is_dire());
        assert!(Event::Shutdown.is_system_event());
    }

    #[test]
    fn test_event_set() {
        let mut set = EventSet::of(&[Event::BumperPort, Event::Tick]);
        assert!(set.contains(Event::BumperPort));
        assert!(!set.contains(Event::BumperStbd));
        assert_eq!(set.len(), 2);

        set.remove(Event::Tick);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![Event::BumperPort]);

        let all = EventSet::all();
        assert_eq!(all.len(), Event::ALL.len());
        assert!(Event::ALL.iter().all(|e| all.contains(*e)));

        let no_clock = all.difference(EventSet::of_group(Group::Clock));
        assert!(!no_clock.contains(Event::Tick));
        assert_eq!(no_clock.len(), Event::ALL.len() - 1);

        let ifs = EventSet::of_groups(&[Group::Bumper, Group::Infrared]);
        assert_eq!(ifs.len(), 11);
        assert!(EventSet::empty().is_empty());
    }
}
