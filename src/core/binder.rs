// src/core/binder.rs

use crate::models::{Command, DomEvent, ProcessId, RunMode};
use serde::Serialize;

/// An event listener attached to a rendered element.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub selector: String,
    pub event: String,
    pub command: Command,
}

impl Binding {
    /// Whether `event` fires this binding, including the keydown key and modifier filters.
    pub fn accepts(&self, event: &DomEvent) -> bool {
        if !self.event.eq_ignore_ascii_case(&event.kind) {
            return false;
        }
        if !event.kind.eq_ignore_ascii_case("keydown") {
            return true;
        }
        let options = &self.command.options;
        let key_code = event.key_code.map(|c| c.to_string());
        let key_matches = options.event_codes().iter().any(|code| {
            event.key.as_deref() == Some(code.as_str()) || key_code.as_deref() == Some(code.as_str())
        });
        key_matches
            && options
                .queue_event_ctrl_key
                .is_none_or(|ctrl| ctrl == event.ctrl_key)
            && options
                .queue_event_shift_key
                .is_none_or(|shift| shift == event.shift_key)
    }

    /// The command to enqueue when the binding fires: a fresh Instant copy.
    pub fn instantiate(&self) -> Command {
        let mut command = self.command.clone();
        command.options.queue_run = Some(RunMode::Instant);
        command
    }
}

/// What happened when the host reported an event.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct EventOutcome {
    /// Processes started by the event, one per matching binding.
    pub fired: Vec<ProcessId>,
    /// The host should cancel the event's default action.
    pub prevent_default: bool,
}

#[derive(Debug, Default)]
pub struct Binder {
    bindings: Vec<Binding>,
}

impl Binder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a binding unless the same command is already bound to that selector and event.
    pub fn add(&mut self, binding: Binding) -> bool {
        let duplicate = self.bindings.iter().any(|b| {
            b.selector == binding.selector
                && b.event == binding.event
                && b.command.id == binding.command.id
        });
        if duplicate {
            return false;
        }
        log::debug!(
            "Bound '{}' on '{}' to command #{} '{}'.",
            binding.event,
            binding.selector,
            binding.command.id,
            binding.command.target
        );
        self.bindings.push(binding);
        true
    }

    /// Keeps only bindings whose selector is still present.
    pub fn prune(&mut self, mut exists: impl FnMut(&str) -> bool) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|b| exists(&b.selector));
        before - self.bindings.len()
    }

    pub fn matching(&self, selector: &str, event: &DomEvent) -> Vec<&Binding> {
        self.bindings
            .iter()
            .filter(|b| b.selector == selector && b.accepts(event))
            .collect()
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Target;

    fn binding(event: &str) -> Binding {
        Binding {
            selector: "#go".to_string(),
            event: event.to_string(),
            command: Command::new(4, Target::new("api", "get")),
        }
    }

    #[test]
    fn test_click_binding() {
        let b = binding("click");
        assert!(b.accepts(&DomEvent::click()));
        assert!(!b.accepts(&DomEvent::new("change")));
        assert_eq!(b.instantiate().options.queue_run, Some(RunMode::Instant));
        assert_eq!(b.command.options.queue_run, None);
    }

    #[test]
    fn test_keydown_defaults_to_enter() {
        let b = binding("keydown");
        assert!(b.accepts(&DomEvent::keydown("Enter")));
        assert!(!b.accepts(&DomEvent::keydown("a")));
        assert!(!b.accepts(&DomEvent::new("keydown")));
    }

    #[test]
    fn test_keydown_numeric_codes_match_key_code() {
        let mut b = binding("keydown");
        b.command.options.queue_event_codes = Some(vec!["13".to_string(), "Escape".to_string()]);

        assert!(b.accepts(&DomEvent::keydown("Enter").with_key_code(13)));
        assert!(b.accepts(&DomEvent::keydown("Escape").with_key_code(27)));
        assert!(!b.accepts(&DomEvent::keydown("Enter")));
        assert!(!b.accepts(&DomEvent::keydown("a").with_key_code(65)));
    }

    #[test]
    fn test_keydown_modifiers_match_exactly_when_set() {
        let mut b = binding("keydown");
        b.command.options.queue_event_codes = Some(vec!["s".to_string()]);
        b.command.options.queue_event_ctrl_key = Some(true);

        assert!(b.accepts(&DomEvent::keydown("s").with_ctrl()));
        assert!(b.accepts(&DomEvent::keydown("s").with_ctrl().with_shift()));
        assert!(!b.accepts(&DomEvent::keydown("s")));

        b.command.options.queue_event_shift_key = Some(false);
        assert!(!b.accepts(&DomEvent::keydown("s").with_ctrl().with_shift()));
    }

    #[test]
    fn test_binder_dedups_and_prunes() {
        let mut binder = Binder::new();
        assert!(binder.add(binding("click")));
        assert!(!binder.add(binding("click")));
        assert!(binder.add(binding("keydown")));

        assert_eq!(binder.matching("#go", &DomEvent::click()).len(), 1);
        assert_eq!(binder.prune(|selector| selector != "#go"), 2);
        assert!(binder.is_empty());
    }
}
