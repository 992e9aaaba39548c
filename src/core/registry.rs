// src/core/registry.rs

//! Plugins ("queueables") and the registry the scheduler dispatches through.
//!
//! A plugin receives one [`Invocation`] per dispatched command and must complete it exactly
//! once. The invocation is consumed by `ok`, `warn`, `fail` or `finish`; dropping it without
//! completing reports an `Error` completion, so a forgotten code path cannot stall a chain.

use crate::{
    core::engine::{Engine, EngineError},
    models::{Command, CommandOptions, FinishMode, JsonMap, ProcessId, Target},
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The contract every plugin implements.
pub trait Queueable: Send + Sync {
    /// Called once, at boot, in registration order. Plugins that need setup time report
    /// readiness later through a [`ReadyFlag`].
    fn init(&self, engine: &Engine) {
        let _ = engine;
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn start(&self, invocation: Invocation);
}

// --- INVOCATION ---

/// One dispatched command, handed to its plugin.
pub struct Invocation {
    engine: Engine,
    pid: ProcessId,
    command: Command,
    completed: bool,
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("pid", &self.pid)
            .field("target", &self.command.target)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

impl Invocation {
    pub(crate) fn new(engine: Engine, pid: ProcessId, command: Command) -> Self {
        Self {
            engine,
            pid,
            command,
            completed: false,
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn target(&self) -> &Target {
        &self.command.target
    }

    pub fn method(&self) -> &str {
        &self.command.target.method
    }

    /// Arguments after dispatch-time resolution.
    pub fn arguments(&self) -> &JsonMap {
        &self.command.arguments
    }

    pub fn argument(&self, key: &str) -> Option<&Value> {
        self.command.arguments.get(key)
    }

    /// String argument, if present and a string.
    pub fn str_argument(&self, key: &str) -> Option<&str> {
        self.argument(key).and_then(Value::as_str)
    }

    pub fn options(&self) -> &CommandOptions {
        &self.command.options
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Stores `value` as this command's result (see `Engine::set_result`).
    pub fn set_result(&self, value: Value) -> Result<String, EngineError> {
        self.engine.set_result(self.pid, value)
    }

    pub fn ok(self) {
        self.finish(FinishMode::Ok, None);
    }

    pub fn warn(self, message: impl Into<String>) {
        self.finish(FinishMode::Warning, Some(message.into()));
    }

    pub fn fail(self, message: impl Into<String>) {
        self.finish(FinishMode::Error, Some(message.into()));
    }

    pub fn finish(mut self, mode: FinishMode, message: Option<String>) {
        self.completed = true;
        // Structural errors are already recorded on the console.
        let _ = self.engine.finished(self.pid, mode, message);
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        if !self.completed {
            self.completed = true;
            let message = format!(
                "'{}' was dropped without completing.",
                self.command.target
            );
            let _ = self.engine.finished(self.pid, FinishMode::Error, Some(message));
        }
    }
}

// --- METHOD TABLE ---

pub type Handler = Box<dyn Fn(Invocation) + Send + Sync>;

/// Per-plugin mapping from method name to handler.
#[derive(Default)]
pub struct MethodTable {
    handlers: BTreeMap<String, Handler>,
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(Invocation) + Send + Sync + 'static,
    {
        self.register(method, handler);
        self
    }

    pub fn register<F>(&mut self, method: &str, handler: F)
    where
        F: Fn(Invocation) + Send + Sync + 'static,
    {
        self.handlers.insert(method.to_string(), Box::new(handler));
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Runs the handler for the invocation's method, or fails it when there is none.
    pub fn dispatch(&self, invocation: Invocation) {
        match self.handlers.get(invocation.method()) {
            Some(handler) => handler(invocation),
            None => {
                let message = format!(
                    "Plugin '{}' has no method '{}'.",
                    invocation.target().plugin,
                    invocation.method()
                );
                invocation.fail(message);
            }
        }
    }
}

// --- READINESS ---

/// Readiness flag for plugins whose `init` finishes asynchronously.
#[derive(Debug, Default)]
pub struct ReadyFlag(AtomicBool);

impl ReadyFlag {
    pub fn new(ready: bool) -> Self {
        Self(AtomicBool::new(ready))
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Marks the plugin ready and lets the scheduler pick up commands that were waiting on it.
    pub fn mark_ready(&self, engine: &Engine) {
        self.0.store(true, Ordering::Release);
        engine.process();
    }
}

// --- REGISTRY ---

struct PluginEntry {
    name: String,
    plugin: Arc<dyn Queueable>,
    initialized: bool,
}

/// Registered plugins, kept in registration order.
#[derive(Default)]
pub struct PluginRegistry {
    entries: Vec<PluginEntry>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `plugin` under `name`, replacing any previous plugin of that name.
    pub fn register(&mut self, name: &str, plugin: Arc<dyn Queueable>) {
        match self.entries.iter_mut().find(|e| e.name == name) {
            Some(entry) => {
                log::warn!("Replacing plugin '{}'.", name);
                entry.plugin = plugin;
                entry.initialized = false;
            }
            None => self.entries.push(PluginEntry {
                name: name.to_string(),
                plugin,
                initialized: false,
            }),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Queueable>> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| Arc::clone(&e.plugin))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    /// Plugins not initialised yet, in registration order. They are marked initialised.
    pub(crate) fn take_uninitialized(&mut self) -> Vec<(String, Arc<dyn Queueable>)> {
        self.entries
            .iter_mut()
            .filter(|e| !e.initialized)
            .map(|e| {
                e.initialized = true;
                (e.name.clone(), Arc::clone(&e.plugin))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl Queueable for Noop {
        fn start(&self, invocation: Invocation) {
            invocation.ok();
        }
    }

    #[test]
    fn test_registry_keeps_order_and_inits_once() {
        let mut registry = PluginRegistry::new();
        registry.register("b", Arc::new(Noop));
        registry.register("a", Arc::new(Noop));

        assert_eq!(registry.names(), vec!["b", "a"]);
        let first: Vec<String> = registry
            .take_uninitialized()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(first, vec!["b", "a"]);
        assert!(registry.take_uninitialized().is_empty());
        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_none());
    }

    #[test]
    fn test_method_table_lists_methods() {
        let table = MethodTable::new()
            .with("get", |inv: Invocation| inv.ok())
            .with("post", |inv: Invocation| inv.ok());
        assert!(table.contains("get"));
        assert_eq!(table.methods().collect::<Vec<_>>(), vec!["get", "post"]);
    }

    #[test]
    fn test_ready_flag() {
        let flag = ReadyFlag::new(false);
        assert!(!flag.is_ready());
        flag.mark_ready(&Engine::default());
        assert!(flag.is_ready());
    }
}
