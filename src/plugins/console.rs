// src/plugins/console.rs

use crate::core::expression;
use crate::core::registry::{Invocation, MethodTable, Queueable};
use serde_json::Value;

/// `console.log({message})`: writes the message to the log and keeps it as the command result.
#[derive(Debug)]
pub struct ConsolePlugin {
    methods: MethodTable,
}

impl ConsolePlugin {
    pub fn new() -> Self {
        Self {
            methods: MethodTable::new().with("log", log_message),
        }
    }
}

impl Default for ConsolePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Queueable for ConsolePlugin {
    fn start(&self, invocation: Invocation) {
        self.methods.dispatch(invocation);
    }
}

fn log_message(invocation: Invocation) {
    let message = invocation.argument("message").cloned().unwrap_or(Value::Null);
    log::info!("[#{}] {}", invocation.pid(), expression::to_display(&message));
    match invocation.set_result(message) {
        Ok(_) => invocation.ok(),
        Err(e) => invocation.fail(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::core::engine::Engine;
    use crate::models::{Command, Target};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_log_stores_message_under_memory_name() {
        let engine = Engine::new(EngineConfig::synchronous());
        engine.register_plugin("console", Arc::new(ConsolePlugin::new()));
        let mut command = Command::new(1, Target::new("console", "log"));
        command.arguments = json!({"message": "hi #pid"}).as_object().unwrap().clone();
        command.options.memory_name = Some("said".to_string());
        command.options.memory_mode = Some(crate::models::MemoryMode::Session);

        let pid = engine.enqueue(command);

        assert_eq!(engine.memory_value("said"), Some(json!(format!("hi {}", pid))));
        assert_eq!(engine.memory_slot("said").unwrap().origin, "console.log");
    }
}
