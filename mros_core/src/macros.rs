//! Macro scripts: named, timed sequences of events and functions
//!
//! A [`Macro`] is a queue of [`Statement`]s. Each statement waits for its
//! delay, then either publishes an event or runs a function. Macros are
//! stored by name in a [`MacroLibrary`] and played back by the
//! [`MacroPublisher`](crate::publisher::MacroPublisher).

use crate::event::Event;
use crate::message::Payload;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Function run by a `LAMBDA` statement
pub type MacroFunction = Arc<dyn Fn() + Send + Sync>;

/// What a statement does once its delay has passed
#[derive(Clone)]
pub enum Action {
    Publish { event: Event, payload: Payload },
    Call(MacroFunction),
}

impl Action {
    /// Event type of the action; function calls are `LAMBDA`.
    pub fn event(&self) -> Event {
        match self {
            Action::Publish { event, .. } => *event,
            Action::Call(_) => Event::Lambda,
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Publish { event, payload } => f
                .debug_struct("Publish")
                .field("event", event)
                .field("payload", payload)
                .finish(),
            Action::Call(_) => f.write_str("Call(..)"),
        }
    }
}

/// One step of a macro
#[derive(Debug, Clone)]
pub struct Statement {
    label: String,
    action: Action,
    delay: Duration,
}

impl Statement {
    pub fn publish(label: impl Into<String>, event: Event, payload: Payload, delay: Duration) -> Self {
        Self {
            label: label.into(),
            action: Action::Publish { event, payload },
            delay,
        }
    }

    pub fn call(label: impl Into<String>, function: MacroFunction, delay: Duration) -> Self {
        Self {
            label: label.into(),
            action: Action::Call(function),
            delay,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Wait between the statement becoming current and running it
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_call(&self) -> bool {
        matches!(self.action, Action::Call(_))
    }
}

/// A named queue of statements
///
/// Queuing a macro from a library plays a copy; the stored macro is
/// never consumed.
#[derive(Debug, Clone, Default)]
pub struct Macro {
    name: String,
    description: Option<String>,
    statements: VecDeque<Statement>,
    completion: Option<(Event, Payload)>,
}

impl Macro {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append a statement publishing `event` after `delay_ms`.
    pub fn add_event(mut self, event: Event, payload: impl Into<Payload>, delay_ms: u64) -> Self {
        let label = self.next_label();
        self.statements.push_back(Statement::publish(
            label,
            event,
            payload.into(),
            Duration::from_millis(delay_ms),
        ));
        self
    }

    /// Append a statement running `function` after `delay_ms`.
    pub fn add_function<F>(mut self, function: F, delay_ms: u64) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let label = self.next_label();
        self.statements.push_back(Statement::call(
            label,
            Arc::new(function),
            Duration::from_millis(delay_ms),
        ));
        self
    }

    pub fn push(&mut self, statement: Statement) {
        self.statements.push_back(statement);
    }

    /// Event published once the last statement has run.
    pub fn set_completion(&mut self, event: Event, payload: Payload) {
        self.completion = Some((event, payload));
    }

    pub fn completion(&self) -> Option<&(Event, Payload)> {
        self.completion.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn statements(&self) -> impl Iterator<Item = &Statement> {
        self.statements.iter()
    }

    /// Take the next statement off the front.
    pub fn poll(&mut self) -> Option<Statement> {
        self.statements.pop_front()
    }

    // stmt-a, stmt-b, ...
    fn next_label(&self) -> String {
        let n = self.statements.len();
        match char::from_u32('a' as u32 + n as u32).filter(|c| c.is_ascii_lowercase()) {
            Some(c) => format!("stmt-{}", c),
            None => format!("stmt-{}", n),
        }
    }
}

/// Macros by name; storing a macro under an existing name replaces it.
#[derive(Debug, Clone, Default)]
pub struct MacroLibrary {
    name: String,
    macros: HashMap<String, Macro>,
}

impl MacroLibrary {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            macros: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn put(&mut self, script: Macro) -> Option<Macro> {
        log::debug!("macro library {}: storing '{}'", self.name, script.name());
        self.macros.insert(script.name().to_string(), script)
    }

    pub fn get(&self, name: &str) -> Option<&Macro> {
        self.macros.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }

    /// Stored macro names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.macros.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_builder_labels_and_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut script = Macro::new("back-off")
            .with_description("reverse, then turn away")
            .add_event(Event::HalfAstern, Payload::Empty, 0)
            .add_function(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }, 500)
            .add_event(Event::SpinPort, 2.5f64, 1000);

        assert_eq!(script.len(), 3);
        assert_eq!(script.description(), Some("reverse, then turn away"));
        let labels: Vec<&str> = script.statements().map(Statement::label).collect();
        assert_eq!(labels, vec!["stmt-a", "stmt-b", "stmt-c"]);

        let first = script.poll().unwrap();
        assert_eq!(first.action().event(), Event::HalfAstern);
        assert_eq!(first.delay(), Duration::ZERO);

        let second = script.poll().unwrap();
        assert!(second.is_call());
        assert_eq!(second.action().event(), Event::Lambda);
        if let Action::Call(function) = second.action() {
            function();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let third = script.poll().unwrap();
        assert_eq!(third.delay(), Duration::from_secs(1));
        assert!(script.poll().is_none());
        assert!(script.is_empty());
    }

    #[test]
    fn test_library_copies_and_replaces() {
        let mut library = MacroLibrary::new("default");
        assert!(library.is_empty());
        library.put(Macro::new("avoid").add_event(Event::Halt, Payload::Empty, 0));
        library.put(Macro::new("roam").add_event(Event::SlowAhead, Payload::Empty, 0));

        let mut copy = library.get("avoid").unwrap().clone();
        copy.poll();
        assert!(copy.is_empty());
        assert_eq!(library.get("avoid").unwrap().len(), 1);

        let replaced = library.put(Macro::new("avoid"));
        assert_eq!(replaced.map(|m| m.len()), Some(1));
        assert_eq!(library.names(), vec!["avoid", "roam"]);
        assert!(library.contains("roam"));
        assert!(library.get("missing").is_none());
    }
}
