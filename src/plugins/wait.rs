// src/plugins/wait.rs

use crate::core::registry::{Invocation, MethodTable, Queueable};
use serde_json::Value;
use std::time::Duration;

/// `wait.sleep({ms})`: completes after a delay. On a tokio runtime the wait is a spawned
/// timer; otherwise the calling thread sleeps.
#[derive(Debug)]
pub struct WaitPlugin {
    methods: MethodTable,
}

impl WaitPlugin {
    pub fn new() -> Self {
        Self {
            methods: MethodTable::new().with("sleep", sleep),
        }
    }
}

impl Default for WaitPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Queueable for WaitPlugin {
    fn start(&self, invocation: Invocation) {
        self.methods.dispatch(invocation);
    }
}

fn sleep(invocation: Invocation) {
    let Some(ms) = invocation.argument("ms").and_then(Value::as_u64) else {
        invocation.fail("'wait.sleep' requires a non-negative integer 'ms'.");
        return;
    };
    let delay = Duration::from_millis(ms);
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if !invocation.engine().config().dispatch.synchronous => {
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                invocation.ok();
            });
        }
        _ => {
            std::thread::sleep(delay);
            invocation.ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::config::EngineConfig;
    use crate::core::engine::Engine;
    use crate::plugins::register_builtins;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sleep_completes_asynchronously() {
        let mut config = EngineConfig::default();
        config.dispatch.delay_ms = 0;
        let engine = Engine::new(config);
        register_builtins(&engine);

        engine
            .render(concat!(
                r#"@wait.sleep({"ms":20},{"queueRun":"Instant"});"#,
                r#"-memory.set({"name":"woke","value":true,"mode":"Session"});"#,
            ))
            .unwrap();
        assert_eq!(engine.memory_value("woke"), None);

        assert!(engine.settle(Duration::from_secs(2)).await);
        assert_eq!(engine.memory_value("woke"), Some(json!(true)));
    }

    #[test]
    fn test_sleep_inline_without_runtime() {
        let engine = Engine::new(EngineConfig::synchronous());
        register_builtins(&engine);
        let rendered = engine.render(r#"@wait.sleep({"ms":1},{"queueRun":"Instant"});"#).unwrap();
        assert_eq!(engine.state_of(rendered.started[0]), None);

        let bad = engine.render(r#"@wait.sleep({"ms":-1},{"queueRun":"Instant"});"#).unwrap();
        assert!(engine.error_of(bad.started[0]).is_some());
    }
}
