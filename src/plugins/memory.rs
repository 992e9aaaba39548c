// src/plugins/memory.rs

use crate::core::registry::{Invocation, MethodTable, Queueable};
use crate::models::MemoryMode;
use serde_json::Value;

/// `memory.set({name, value, mode?})` and `memory.delete({name})`.
#[derive(Debug)]
pub struct MemoryPlugin {
    methods: MethodTable,
}

impl MemoryPlugin {
    pub fn new() -> Self {
        Self {
            methods: MethodTable::new().with("set", set).with("delete", delete),
        }
    }
}

impl Default for MemoryPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Queueable for MemoryPlugin {
    fn start(&self, invocation: Invocation) {
        self.methods.dispatch(invocation);
    }
}

fn set(invocation: Invocation) {
    let Some((invocation, name)) = super::required_str(invocation, "name") else {
        return;
    };
    let value = invocation.argument("value").cloned().unwrap_or(Value::Null);
    let mode = match invocation.argument("mode") {
        None => MemoryMode::default(),
        Some(raw) => match serde_json::from_value::<MemoryMode>(raw.clone()) {
            Ok(mode) => mode,
            Err(_) => {
                let message = format!("Unknown memory mode {}.", raw);
                invocation.fail(message);
                return;
            }
        },
    };
    match invocation.engine().set_memory(&name, value, mode) {
        Ok(()) => invocation.ok(),
        Err(e) => invocation.fail(e.to_string()),
    }
}

fn delete(invocation: Invocation) {
    let Some((invocation, name)) = super::required_str(invocation, "name") else {
        return;
    };
    match invocation.engine().delete_memory(&name) {
        Ok(Some(_)) => invocation.ok(),
        Ok(None) => invocation.warn(format!("Memory slot '{}' does not exist.", name)),
        Err(e) => invocation.fail(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::core::engine::Engine;
    use crate::models::{Command, CommandState, DiagnosticLevel, Target};
    use serde_json::json;
    use std::sync::Arc;

    fn run(engine: &Engine, method: &str, arguments: Value) -> crate::models::ProcessId {
        let mut command = Command::new(1, Target::new("memory", method));
        command.arguments = arguments.as_object().unwrap().clone();
        engine.enqueue(command)
    }

    fn engine() -> Engine {
        let engine = Engine::new(EngineConfig::synchronous());
        engine.register_plugin("memory", Arc::new(MemoryPlugin::new()));
        engine
    }

    #[test]
    fn test_set_and_delete() {
        let engine = engine();

        run(&engine, "set", json!({"name": "a", "value": [1], "mode": "session"}));
        let slot = engine.memory_slot("a").unwrap();
        assert_eq!(slot.value, json!([1]));
        assert_eq!(slot.mode, MemoryMode::Session);

        run(&engine, "delete", json!({"name": "a"}));
        assert!(engine.memory_slot("a").is_none());

        run(&engine, "delete", json!({"name": "a"}));
        assert_eq!(engine.diagnostics()[0].level, DiagnosticLevel::Warning);
    }

    #[test]
    fn test_bad_mode_fails() {
        let engine = engine();
        let pid = run(&engine, "set", json!({"name": "a", "value": 1, "mode": "Forever"}));
        assert_eq!(engine.state_of(pid), Some(CommandState::Error));
        assert!(engine.memory_slot("a").is_none());
    }
}
