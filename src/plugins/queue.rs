// src/plugins/queue.rs

use crate::core::engine::ExecuteOutcome;
use crate::core::registry::{Invocation, MethodTable, Queueable};
use serde_json::Value;

/// `queue.execute({name, overrides?})`: instantiates a prepared queue from inside a chain.
#[derive(Debug)]
pub struct QueuePlugin {
    methods: MethodTable,
}

impl QueuePlugin {
    pub fn new() -> Self {
        Self {
            methods: MethodTable::new().with("execute", execute),
        }
    }
}

impl Default for QueuePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Queueable for QueuePlugin {
    fn start(&self, invocation: Invocation) {
        self.methods.dispatch(invocation);
    }
}

fn execute(invocation: Invocation) {
    let Some((invocation, name)) = super::required_str(invocation, "name") else {
        return;
    };
    let overrides = match invocation.argument("overrides") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map.clone()),
        Some(other) => {
            let message = format!("'overrides' must be an object, got {}.", other);
            invocation.fail(message);
            return;
        }
    };

    match invocation.engine().execute(&name, overrides, true) {
        ExecuteOutcome::Enqueued(pid) => {
            log::debug!("Prepared queue '{}' started as process #{}.", name, pid);
            if let Err(e) = invocation.set_result(Value::from(pid.0)) {
                invocation.fail(e.to_string());
                return;
            }
            invocation.ok();
        }
        ExecuteOutcome::NotRun => invocation.ok(),
        ExecuteOutcome::NotFound => {
            invocation.fail(format!("Prepared queue '{}' not found.", name));
        }
    }
}
