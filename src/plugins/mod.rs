//! # Built-in Queueables
//!
//! Small plugins that make the engine usable on its own: logging, direct memory writes,
//! register toggling, prepared-queue execution and timed waits. Each one routes its methods
//! through a [`MethodTable`](crate::core::registry::MethodTable), so an unknown method fails
//! the invocation instead of stalling the chain.

pub mod console;
pub mod memory;
pub mod queue;
pub mod register;
pub mod wait;

use crate::core::engine::Engine;
use crate::core::registry::Invocation;
use std::sync::Arc;

/// Registers every built-in plugin under its conventional name.
pub fn register_builtins(engine: &Engine) {
    engine.register_plugin("console", Arc::new(console::ConsolePlugin::new()));
    engine.register_plugin("memory", Arc::new(memory::MemoryPlugin::new()));
    engine.register_plugin("register", Arc::new(register::RegisterPlugin::new()));
    engine.register_plugin("queue", Arc::new(queue::QueuePlugin::new()));
    engine.register_plugin("wait", Arc::new(wait::WaitPlugin::new()));
}

/// Fetches a required string argument, failing the invocation when it is missing.
fn required_str(invocation: Invocation, key: &str) -> Option<(Invocation, String)> {
    match invocation.str_argument(key).map(str::to_string) {
        Some(value) => Some((invocation, value)),
        None => {
            let message = format!(
                "'{}' requires a string argument '{}'.",
                invocation.target(),
                key
            );
            invocation.fail(message);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::models::{Command, CommandState, Target};
    use serde_json::json;

    #[test]
    fn test_builtins_are_registered_in_order() {
        let engine = Engine::new(EngineConfig::synchronous());
        register_builtins(&engine);
        assert_eq!(
            engine.plugin_names(),
            vec!["console", "memory", "register", "queue", "wait"]
        );
    }

    #[test]
    fn test_missing_required_argument_fails() {
        let engine = Engine::new(EngineConfig::synchronous());
        register_builtins(&engine);
        let mut command = Command::new(1, Target::new("register", "add"));
        command.arguments = json!({"nom": "x"}).as_object().unwrap().clone();

        let pid = engine.enqueue(command);

        assert_eq!(engine.state_of(pid), Some(CommandState::Error));
        assert!(engine.error_of(pid).unwrap().contains("'name'"));
    }
}
