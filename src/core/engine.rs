//! # Engine
//!
//! The handle every host and plugin talks to. It owns the scheduler, the memory store, the
//! binder, the document and the plugin registry, and runs the dispatch loop:
//!
//! 1. **Pass:** every chain in `Added` is checked in pid order. Unknown plugins fail the
//!    chain; unmet `queueRegister`/`queueStatement` gates and plugins that are not ready leave
//!    it waiting. Otherwise its arguments are resolved against memory and it turns `Running`.
//! 2. **Dispatch:** the plugin's `start` runs inline (synchronous mode, or outside a tokio
//!    runtime) or on a spawned task after the dispatch delay.
//! 3. **Completion:** `finished` advances, finishes or fails the chain, then runs another pass.
//!
//! Passes never nest: a pass requested while one is running marks it for a re-run instead.
//! Locks are always taken in the order state, then document, and are never held while a
//! plugin runs.

use crate::{
    constants::BODY_SELECTOR,
    core::binder::{Binder, Binding, EventOutcome},
    core::config::EngineConfig,
    core::console::Console,
    core::expression,
    core::memory::{MemoryError, MemoryScope, MemoryStore},
    core::parser::{self, ParsedTemplate, RenderError},
    core::registry::{Invocation, PluginRegistry, Queueable},
    core::scheduler::{Completion, Scheduler, SchedulerError},
    core::template::{self, Expander},
    models::{
        Command, CommandState, Diagnostic, DiagnosticLevel, DomEvent, ExternalMessage, FinishMode, IdGenerator,
        JsonMap, MemoryMode, MemorySlot, ProcessId, RunMode, Target,
    },
    system::cookies::{CookieJar, MemoryCookieJar},
    system::document::{Document, VirtualDocument},
};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

lazy_static! {
    // `*memory.path`, `*slot.value.field`, `*#stack.page`, `*items[0]`
    static ref POINTER_RE: Regex =
        Regex::new(r"^\*([#A-Za-z_$][\w$]*)((?:\.[\w$]+|\[\d+\])*)$").expect("valid regex");
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("Invalid target '{0}', expected 'plugin.method'.")]
    InvalidTarget(String),
}

/// Result of asking for a prepared queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Enqueued(ProcessId),
    /// The queue's `queueStatement` gate was false.
    NotRun,
    NotFound,
}

/// A rendered template: markup ready to be mounted plus its root commands.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub html: String,
    pub commands: Vec<Command>,
    /// Processes started for the template's Instant commands.
    pub started: Vec<ProcessId>,
}

/// A ready chain handed from a pass to dispatch.
struct Job {
    pid: ProcessId,
    plugin: Arc<dyn Queueable>,
    command: Command,
    delay: Duration,
}

struct EngineState {
    scheduler: Scheduler,
    memory: MemoryStore,
    binder: Binder,
    registers: BTreeSet<String>,
    prepared: BTreeMap<String, Command>,
    console: Console,
    processing: bool,
    rerun: bool,
}

impl EngineState {
    /// Drops settled chains and releases the Garbage slots of the ones removed.
    fn compact(&mut self) {
        for pid in self.scheduler.compact() {
            self.memory.cleanup_garbage(pid);
        }
    }
}

struct EngineInner {
    config: EngineConfig,
    ids: IdGenerator,
    state: Mutex<EngineState>,
    document: Mutex<Box<dyn Document>>,
    registry: RwLock<PluginRegistry>,
    settled: tokio::sync::Notify,
}

/// Cheaply cloneable handle to one engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    /// An engine over an empty [`VirtualDocument`] and an in-memory cookie jar.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_host(
            config,
            Box::new(VirtualDocument::new()),
            Box::new(MemoryCookieJar::new()),
        )
    }

    pub fn with_host(
        config: EngineConfig,
        document: Box<dyn Document>,
        jar: Box<dyn CookieJar>,
    ) -> Self {
        let state = EngineState {
            scheduler: Scheduler::with_error_limit(config.console.retained_errors),
            memory: MemoryStore::new(jar, config.persistence.clone()),
            binder: Binder::new(),
            registers: BTreeSet::new(),
            prepared: BTreeMap::new(),
            console: Console::new(config.console.history),
            processing: false,
            rerun: false,
        };
        Self {
            inner: Arc::new(EngineInner {
                config,
                ids: IdGenerator::new(),
                state: Mutex::new(state),
                document: Mutex::new(document),
                registry: RwLock::new(PluginRegistry::new()),
                settled: tokio::sync::Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_document(&self) -> MutexGuard<'_, Box<dyn Document>> {
        self.inner
            .document
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // --- PLUGINS ---

    pub fn register_plugin(&self, name: &str, plugin: Arc<dyn Queueable>) {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(name, plugin);
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Initialises every plugin not initialised yet, in registration order.
    pub fn boot_plugins(&self) -> usize {
        let pending = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take_uninitialized();
        for (name, plugin) in &pending {
            log::debug!("Initialising plugin '{}'.", name);
            plugin.init(self);
        }
        if !pending.is_empty() {
            self.process();
        }
        pending.len()
    }

    fn plugin(&self, name: &str) -> Option<Arc<dyn Queueable>> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
    }

    // --- RENDERING ---

    /// Expands and parses `template`, stores its prepared queues and starts its Instant
    /// commands. The markup is returned unmounted.
    pub fn render(&self, template: &str) -> Result<Rendered, RenderError> {
        let result = self.render_locked(template);
        self.process();
        result
    }

    fn render_locked(&self, template: &str) -> Result<Rendered, RenderError> {
        let mut state = self.lock_state();
        let expansion = {
            let document = self.lock_document();
            Expander::new(&mut state.memory, &**document).expand(template)
        };
        for warning in expansion.warnings {
            state.console.warning(warning, None);
        }

        let ParsedTemplate { html, commands } =
            match parser::parse_template(&expansion.html, &self.inner.ids) {
                Ok(parsed) => parsed,
                Err(e) => {
                    state.console.error(format!("Template rejected: {}", e), None);
                    return Err(e.into());
                }
            };

        let mut started = Vec::new();
        for command in &commands {
            if let Some(name) = &command.options.queue_prepare {
                log::debug!("Prepared queue '{}' stored.", name);
                state.prepared.insert(name.clone(), command.clone());
            } else if command.is_instant() {
                started.push(self.enqueue_locked(&mut state, command.clone()));
            }
        }
        Ok(Rendered {
            html,
            commands,
            started,
        })
    }

    /// Replaces the inner markup of `selector` with the rendered template and binds its
    /// event commands. Bindings whose element disappeared are dropped.
    pub fn mount(&self, selector: &str, rendered: &Rendered) -> bool {
        {
            let mut state = self.lock_state();
            let mut document = self.lock_document();
            if !document.set_inner_html(selector, &rendered.html) {
                drop(document);
                state
                    .console
                    .error(format!("Mount target '{}' not found.", selector), None);
                return false;
            }
            let pruned = state.binder.prune(|s| document.contains(s));
            if pruned > 0 {
                log::debug!("Pruned {} stale binding(s).", pruned);
            }
        }
        self.bind(&rendered.commands);
        true
    }

    /// Appends the rendered markup inside `selector` and binds its event commands.
    pub fn append(&self, selector: &str, rendered: &Rendered) -> bool {
        let appended = self.lock_document().append_html(selector, &rendered.html);
        if !appended {
            self.lock_state()
                .console
                .error(format!("Append target '{}' not found.", selector), None);
            return false;
        }
        self.bind(&rendered.commands);
        true
    }

    /// Render, then mount into `selector`.
    pub fn render_into(&self, selector: &str, template: &str) -> Result<Rendered, RenderError> {
        let rendered = self.render(template)?;
        self.mount(selector, &rendered);
        Ok(rendered)
    }

    /// Attaches listeners for every Event-mode root command that is not a prepared queue.
    pub fn bind(&self, commands: &[Command]) -> usize {
        let mut state = self.lock_state();
        let document = self.lock_document();
        let mut bound = 0;
        for command in commands {
            if command.run_mode() != RunMode::Event || command.options.queue_prepare.is_some() {
                continue;
            }
            let selector = command.bind_selector();
            if !document.contains(&selector) {
                state.console.warning(
                    format!(
                        "Bind target '{}' of '{}' not found; binding skipped.",
                        selector, command.target
                    ),
                    None,
                );
                continue;
            }
            for event in command.options.events() {
                let binding = Binding {
                    selector: selector.clone(),
                    event,
                    command: command.clone(),
                };
                if state.binder.add(binding) {
                    bound += 1;
                }
            }
        }
        bound
    }

    /// Reports a DOM event on `selector`. Every matching binding enqueues a fresh Instant copy
    /// of its command.
    pub fn trigger(&self, selector: &str, event: &DomEvent) -> EventOutcome {
        let mut outcome = EventOutcome::default();
        {
            let mut state = self.lock_state();
            let fired: Vec<(Command, bool)> = state
                .binder
                .matching(selector, event)
                .into_iter()
                .map(|b| {
                    (
                        b.instantiate(),
                        b.command.options.queue_button_disable == Some(true),
                    )
                })
                .collect();
            for (command, disable) in fired {
                if disable {
                    self.lock_document()
                        .set_attribute(selector, "disabled", "disabled");
                }
                let pid = self.enqueue_locked(&mut state, command);
                outcome.fired.push(pid);
            }
        }
        outcome.prevent_default =
            !outcome.fired.is_empty() && !event.kind.eq_ignore_ascii_case("keydown");
        if !outcome.fired.is_empty() {
            self.process();
        }
        outcome
    }

    pub fn document_html(&self) -> String {
        self.lock_document().html()
    }

    pub fn with_document<R>(&self, f: impl FnOnce(&mut dyn Document) -> R) -> R {
        let mut document = self.lock_document();
        f(&mut **document)
    }

    pub fn binding_count(&self) -> usize {
        self.lock_state().binder.len()
    }

    // --- QUEUE ---

    fn enqueue_locked(&self, state: &mut EngineState, command: Command) -> ProcessId {
        let pid = ProcessId(self.inner.ids.next_id());
        state.scheduler.enqueue(pid, command)
    }

    /// Adds `command` as a new chain and runs a pass.
    pub fn enqueue(&self, command: Command) -> ProcessId {
        let pid = {
            let mut state = self.lock_state();
            self.enqueue_locked(&mut state, command)
        };
        self.process();
        pid
    }

    /// Enqueues a command handed over from outside any template.
    pub fn submit(&self, message: ExternalMessage) -> Result<ProcessId, EngineError> {
        let target = Target::parse(&message.target)
            .ok_or_else(|| EngineError::InvalidTarget(message.target.clone()))?;
        let mut command = Command::new(self.inner.ids.next_id(), target);
        command.arguments = message.arguments;
        command.options = message.options;
        command.options.queue_run = Some(RunMode::Instant);
        Ok(self.enqueue(command))
    }

    /// Runs scheduler passes until nothing new becomes ready.
    pub fn process(&self) {
        {
            let mut state = self.lock_state();
            if state.processing {
                state.rerun = true;
                return;
            }
            state.processing = true;
        }
        let _reset = scopeguard::guard_on_unwind(self, |engine| {
            engine.lock_state().processing = false;
        });

        loop {
            let jobs = self.collect_ready();
            for job in jobs {
                self.dispatch(job);
            }
            let mut state = self.lock_state();
            if state.rerun {
                state.rerun = false;
            } else {
                state.processing = false;
                break;
            }
        }
    }

    fn collect_ready(&self) -> Vec<Job> {
        let mut state = self.lock_state();
        state.rerun = false;
        let state = &mut *state;
        let mut jobs = Vec::new();

        for pid in state.scheduler.pending() {
            let Some(chain) = state.scheduler.get_mut(pid) else {
                continue;
            };
            let Some(command) = chain.current().cloned() else {
                continue;
            };

            let Some(plugin) = self.plugin(&command.target.plugin) else {
                let message = format!("Unknown plugin '{}'.", command.target.plugin);
                chain.state = CommandState::Error;
                chain.error = Some(message.clone());
                state.console.error(message, Some(pid));
                continue;
            };

            if let Some(register) = &command.options.queue_register
                && !state.registers.contains(register)
            {
                log::trace!("Process #{} waits for register '{}'.", pid, register);
                continue;
            }

            if let Some(statement) = &command.options.queue_statement {
                let scope = MemoryScope::for_process(&state.memory, pid, &chain.stack);
                match expression::evaluate_truthy(statement, &scope) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        log::debug!("Statement of process #{} failed: {}", pid, e);
                        continue;
                    }
                }
            }

            if !plugin.is_ready() {
                log::trace!("Plugin '{}' is not ready yet.", command.target.plugin);
                continue;
            }

            let resolved = resolve_arguments(&command, pid, &state.memory, &chain.stack);
            let (arguments, warnings) = match resolved {
                Ok(resolved) => resolved,
                Err(e) => {
                    chain.state = CommandState::Error;
                    chain.error = Some(e.to_string());
                    state.console.error(e.to_string(), Some(pid));
                    continue;
                }
            };
            chain.state = CommandState::Running;
            for warning in warnings {
                state.console.warning(warning, Some(pid));
            }

            let delay = command
                .options
                .queue_timer
                .map_or_else(|| self.inner.config.dispatch.delay(), Duration::from_millis);
            let mut command = command;
            command.arguments = arguments;
            jobs.push(Job {
                pid,
                plugin,
                command,
                delay,
            });
        }
        state.compact();
        jobs
    }

    fn dispatch(&self, job: Job) {
        log::debug!("Dispatching '{}' as process #{}.", job.command.target, job.pid);
        let runtime = if self.inner.config.dispatch.synchronous {
            None
        } else {
            tokio::runtime::Handle::try_current().ok()
        };
        match runtime {
            Some(handle) => {
                let engine = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(job.delay).await;
                    engine.invoke(job);
                });
            }
            None => self.invoke(job),
        }
    }

    fn invoke(&self, job: Job) {
        let invocation = Invocation::new(self.clone(), job.pid, job.command);
        job.plugin.start(invocation);
    }

    /// Completion entry point for plugins. Reports (and returns) structural errors such as
    /// completing a chain that is not running.
    pub fn finished(
        &self,
        pid: ProcessId,
        mode: FinishMode,
        message: Option<String>,
    ) -> Result<Completion, SchedulerError> {
        let completion = {
            let mut state = self.lock_state();
            let completion = match state.scheduler.complete(pid, mode, message.clone()) {
                Ok(completion) => completion,
                Err(e) => {
                    state.console.error(e.to_string(), Some(pid));
                    return Err(e);
                }
            };
            match completion {
                Completion::Failed => {
                    let text = message.unwrap_or_else(|| "Command failed.".to_string());
                    state.console.error(text, Some(pid));
                }
                Completion::Advanced | Completion::Finished => {
                    if mode == FinishMode::Warning {
                        let text = message.unwrap_or_else(|| "Completed with a warning.".to_string());
                        state.console.warning(text, Some(pid));
                    }
                }
            }
            if completion == Completion::Finished {
                state.memory.cleanup_garbage(pid);
                log::debug!("Process #{} finished.", pid);
            }
            if completion != Completion::Advanced {
                state.compact();
            }
            completion
        };
        self.inner.settled.notify_waiters();
        self.process();
        Ok(completion)
    }

    /// Stores `value` as the result of the command running as `pid`.
    pub fn set_result(&self, pid: ProcessId, value: Value) -> Result<String, EngineError> {
        let mut state = self.lock_state();
        let state = &mut *state;
        let command = state
            .scheduler
            .get(pid)
            .and_then(|chain| chain.current())
            .ok_or(SchedulerError::UnknownProcess(pid))?;
        Ok(state.memory.set_from_command(pid, command, value)?)
    }

    pub fn state_of(&self, pid: ProcessId) -> Option<CommandState> {
        self.lock_state().scheduler.get(pid).map(|chain| chain.state)
    }

    pub fn error_of(&self, pid: ProcessId) -> Option<String> {
        self.lock_state()
            .scheduler
            .get(pid)
            .and_then(|chain| chain.error.clone())
    }

    /// The step currently pointed at by the chain's cursor.
    pub fn current_command(&self, pid: ProcessId) -> Option<Command> {
        self.lock_state()
            .scheduler
            .get(pid)
            .and_then(|chain| chain.current().cloned())
    }

    pub fn chain_count(&self) -> usize {
        self.lock_state().scheduler.len()
    }

    pub fn running_count(&self) -> usize {
        self.lock_state().scheduler.running_count()
    }

    /// Waits until no chain is Running, or `timeout` elapses. Returns whether it settled.
    pub async fn settle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.running_count() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(Duration::from_millis(5));
            let _ = tokio::time::timeout(wait, self.inner.settled.notified()).await;
        }
    }

    // --- STACK ---

    pub fn stack(&self, pid: ProcessId) -> Option<Value> {
        self.lock_state()
            .scheduler
            .get(pid)
            .map(|chain| chain.stack.clone())
    }

    pub fn set_stack(&self, pid: ProcessId, key: &str, value: Value) -> Result<(), SchedulerError> {
        let mut state = self.lock_state();
        let chain = state
            .scheduler
            .get_mut(pid)
            .ok_or(SchedulerError::UnknownProcess(pid))?;
        if let Value::Object(map) = &mut chain.stack {
            map.insert(key.to_string(), value);
        }
        Ok(())
    }

    // --- PREPARED QUEUES ---

    pub fn prepare(&self, name: &str, command: Command) {
        self.lock_state().prepared.insert(name.to_string(), command);
    }

    pub fn prepared(&self, name: &str) -> Option<Command> {
        self.lock_state().prepared.get(name).cloned()
    }

    pub fn prepared_names(&self) -> Vec<String> {
        self.lock_state().prepared.keys().cloned().collect()
    }

    /// Instantiates the prepared queue `name`: a deep copy, forced Instant, with `overrides`
    /// merged over its arguments.
    pub fn execute(&self, name: &str, overrides: Option<JsonMap>, silent_fail: bool) -> ExecuteOutcome {
        let outcome = {
            let mut state = self.lock_state();
            let Some(template) = state.prepared.get(name) else {
                if !silent_fail {
                    state
                        .console
                        .error(format!("Prepared queue '{}' not found.", name), None);
                }
                return ExecuteOutcome::NotFound;
            };

            if let Some(statement) = &template.options.queue_statement {
                let scope = MemoryScope::new(&state.memory);
                if !expression::evaluate_truthy(statement, &scope).unwrap_or(false) {
                    log::debug!("Prepared queue '{}' not run: statement is false.", name);
                    return ExecuteOutcome::NotRun;
                }
            }

            let mut command = template.clone();
            command.options.queue_run = Some(RunMode::Instant);
            command.options.queue_prepare = None;
            if let Some(overrides) = overrides {
                command.arguments.extend(overrides);
            }
            ExecuteOutcome::Enqueued(self.enqueue_locked(&mut state, command))
        };
        self.process();
        outcome
    }

    /// Records a failed transport call and runs the configured error queue, if any.
    pub fn report_transport_failure(&self, message: &str) -> ExecuteOutcome {
        self.lock_state().console.error(message, None);
        let mut overrides = JsonMap::new();
        overrides.insert("message".to_string(), Value::String(message.to_string()));
        let queue = self.inner.config.console.error_queue.clone();
        self.execute(&queue, Some(overrides), true)
    }

    // --- REGISTERS ---

    pub fn add_register(&self, name: &str) {
        self.lock_state().registers.insert(name.to_string());
        self.process();
    }

    pub fn remove_register(&self, name: &str) {
        self.lock_state().registers.remove(name);
        self.process();
    }

    pub fn has_register(&self, name: &str) -> bool {
        self.lock_state().registers.contains(name)
    }

    // --- MEMORY ---

    pub fn set_memory(&self, name: &str, value: Value, mode: MemoryMode) -> Result<(), EngineError> {
        Ok(self.lock_state().memory.set(name, value, mode)?)
    }

    /// Stores a fully described slot, e.g. one seeded from configuration.
    pub fn insert_memory(&self, name: &str, slot: MemorySlot) -> Result<(), EngineError> {
        Ok(self.lock_state().memory.insert(name, slot)?)
    }

    pub fn delete_memory(&self, name: &str) -> Result<Option<MemorySlot>, EngineError> {
        Ok(self.lock_state().memory.delete(name)?)
    }

    pub fn memory_slot(&self, name: &str) -> Option<MemorySlot> {
        self.lock_state().memory.get(name).cloned()
    }

    pub fn memory_value(&self, name: &str) -> Option<Value> {
        self.lock_state().memory.value(name).cloned()
    }

    pub fn memory_snapshot(&self) -> BTreeMap<String, MemorySlot> {
        self.lock_state()
            .memory
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect()
    }

    /// Evaluates an expression against the current memory.
    pub fn evaluate(&self, source: &str) -> Result<Value, expression::ExpressionError> {
        let state = self.lock_state();
        expression::evaluate(source, &MemoryScope::new(&state.memory))
    }

    /// Restores Permanent slots from the cookie jar. Failures are reported, never fatal.
    pub fn restore_memory(&self) -> usize {
        let mut state = self.lock_state();
        match state.memory.restore() {
            Ok(count) => count,
            Err(e) => {
                state
                    .console
                    .warning(format!("Could not restore persisted memory: {}", e), None);
                0
            }
        }
    }

    // --- CONSOLE ---

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.lock_state().console.entries()
    }

    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        self.lock_state().console.take()
    }

    /// Records a host-side diagnostic on the engine console.
    pub fn report(&self, level: DiagnosticLevel, message: impl Into<String>, pid: Option<ProcessId>) {
        self.lock_state().console.record(level, message, pid);
    }

    /// Appends `html` to the body. Used by boot to flush rendered templates.
    pub(crate) fn flush_to_body(&self, html: &str) -> bool {
        self.lock_document().append_html(BODY_SELECTOR, html)
    }
}

/// Resolves a command's arguments at dispatch time: `#pid` substitution, deferred `{{!…}}`
/// tags, then pointer strings.
fn resolve_arguments(
    command: &Command,
    pid: ProcessId,
    memory: &MemoryStore,
    stack: &Value,
) -> Result<(JsonMap, Vec<String>), RenderError> {
    let target = command.target.to_string();
    let serialized = serde_json::to_string(&command.arguments).map_err(|source| {
        RenderError::ArgumentJson {
            target: target.clone(),
            source,
        }
    })?;
    let serialized = serialized.replace("#pid", &pid.to_string());

    let scope = MemoryScope::for_process(memory, pid, stack);
    let (text, mut warnings) = template::resolve_deferred(&serialized, &scope);
    let mut value: Value = serde_json::from_str(&text).map_err(|source| {
        RenderError::ArgumentJson {
            target: target.clone(),
            source,
        }
    })?;
    dereference_pointers(&mut value, &scope, &mut warnings);

    match value {
        Value::Object(map) => Ok((map, warnings)),
        _ => Err(RenderError::ArgumentsNotObject { target }),
    }
}

fn dereference_pointers(value: &mut Value, scope: &MemoryScope<'_>, warnings: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            let Some(caps) = POINTER_RE.captures(text) else {
                return;
            };
            let root = caps.get(1).map_or("", |m| m.as_str());
            let path = &text[1..];
            let expression_text = if root == "memory" || root.starts_with('#') {
                path.to_string()
            } else {
                format!("memory.{}", path)
            };
            *value = match expression::evaluate(&expression_text, scope) {
                Ok(Value::Null) => {
                    warnings.push(format!("Pointer '{}' did not resolve to a value.", text));
                    Value::Null
                }
                Ok(resolved) => resolved,
                Err(e) => {
                    warnings.push(format!("Pointer '{}' did not resolve: {}", text, e));
                    Value::Null
                }
            };
        }
        Value::Array(items) => {
            for item in items {
                dereference_pointers(item, scope, warnings);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                dereference_pointers(item, scope, warnings);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::MethodTable;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records every invocation and completes it according to its `outcome` argument.
    struct Recorder {
        log: Arc<Mutex<Vec<(ProcessId, String, JsonMap)>>>,
        hold: AtomicBool,
        held: Mutex<Vec<Invocation>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                log: Arc::new(Mutex::new(Vec::new())),
                hold: AtomicBool::new(false),
                held: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(ProcessId, String, JsonMap)> {
            self.log.lock().unwrap().clone()
        }

        fn methods(&self) -> Vec<String> {
            self.calls().into_iter().map(|(_, m, _)| m).collect()
        }

        fn release_one(&self) {
            let invocation = self.held.lock().unwrap().remove(0);
            invocation.ok();
        }
    }

    impl Queueable for Recorder {
        fn start(&self, invocation: Invocation) {
            self.log.lock().unwrap().push((
                invocation.pid(),
                invocation.method().to_string(),
                invocation.arguments().clone(),
            ));
            if self.hold.load(Ordering::SeqCst) {
                self.held.lock().unwrap().push(invocation);
                return;
            }
            if let Some(value) = invocation.argument("result").cloned() {
                invocation.set_result(value).unwrap();
            }
            let outcome = invocation.str_argument("outcome").map(str::to_string);
            match outcome.as_deref() {
                Some("error") => invocation.fail("requested failure"),
                Some("warn") => invocation.warn("requested warning"),
                Some("drop") => drop(invocation),
                _ => invocation.ok(),
            }
        }
    }

    fn engine_with(recorder: &Arc<Recorder>) -> Engine {
        let engine = Engine::new(EngineConfig::synchronous());
        engine.register_plugin("rec", recorder.clone());
        engine.boot_plugins();
        engine
    }

    fn command(method: &str, arguments: Value) -> Command {
        let mut command = Command::new(0, Target::new("rec", method));
        if let Value::Object(map) = arguments {
            command.arguments = map;
        }
        command.options.queue_run = Some(RunMode::Instant);
        command
    }

    #[test]
    fn test_children_run_strictly_in_sequence() {
        // --- Setup ---
        let recorder = Recorder::new();
        recorder.hold.store(true, Ordering::SeqCst);
        let engine = engine_with(&recorder);
        let mut root = command("first", json!({}));
        root.children.push(command("second", json!({})));
        root.children.push(command("third", json!({})));

        // --- Execute & Assert ---
        let pid = engine.enqueue(root);
        assert_eq!(recorder.methods(), vec!["first"]);
        engine.process();
        assert_eq!(recorder.methods(), vec!["first"]);

        recorder.release_one();
        assert_eq!(recorder.methods(), vec!["first", "second"]);
        assert_eq!(engine.state_of(pid), Some(CommandState::Running));

        recorder.release_one();
        recorder.release_one();
        assert_eq!(recorder.methods(), vec!["first", "second", "third"]);
        assert_eq!(engine.state_of(pid), None);
        assert!(recorder.calls().iter().all(|(p, _, _)| *p == pid));
    }

    #[test]
    fn test_error_halts_only_its_chain() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder);
        let mut failing = command("a", json!({"outcome": "error"}));
        failing.children.push(command("never", json!({})));

        let failed = engine.enqueue(failing);
        let other = engine.enqueue(command("b", json!({})));

        assert_eq!(engine.state_of(failed), Some(CommandState::Error));
        assert_eq!(engine.error_of(failed).as_deref(), Some("requested failure"));
        assert_eq!(engine.state_of(other), None);
        assert!(!recorder.methods().contains(&"never".to_string()));
    }

    #[test]
    fn test_garbage_released_when_chain_finishes() {
        let recorder = Recorder::new();
        recorder.hold.store(true, Ordering::SeqCst);
        let engine = engine_with(&recorder);

        let mut root = command("a", json!({}));
        root.options.memory_name = Some("tmp".to_string());
        let mut keep = command("b", json!({}));
        keep.options.memory_name = Some("kept".to_string());
        keep.options.memory_mode = Some(MemoryMode::Session);
        root.children.push(keep);

        let pid = engine.enqueue(root);
        engine.set_result(pid, json!(1)).unwrap();
        recorder.release_one();
        engine.set_result(pid, json!(2)).unwrap();
        assert_eq!(engine.memory_value("tmp"), Some(json!(1)));

        recorder.release_one();

        assert_eq!(engine.memory_value("tmp"), None);
        assert_eq!(engine.memory_value("kept"), Some(json!(2)));
    }

    #[test]
    fn test_errored_chain_keeps_its_garbage() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder);
        let mut failing = command("a", json!({"outcome": "error", "result": 5}));
        failing.options.memory_name = Some("partial".to_string());

        let pid = engine.enqueue(failing);

        assert_eq!(engine.state_of(pid), Some(CommandState::Error));
        assert_eq!(engine.memory_value("partial"), Some(json!(5)));
    }

    #[test]
    fn test_errored_chains_are_bounded() {
        let recorder = Recorder::new();
        let mut config = EngineConfig::synchronous();
        config.console.retained_errors = 2;
        let engine = Engine::new(config);
        engine.register_plugin("rec", recorder.clone());
        engine.boot_plugins();

        let pids: Vec<ProcessId> = (0..5)
            .map(|i| {
                let mut failing = command("a", json!({"outcome": "error", "result": i}));
                failing.options.memory_name = Some(format!("partial{}", i));
                engine.enqueue(failing)
            })
            .collect();

        assert_eq!(engine.chain_count(), 2);
        assert_eq!(engine.state_of(pids[0]), None);
        assert_eq!(engine.memory_value("partial0"), None);
        assert_eq!(engine.state_of(pids[4]), Some(CommandState::Error));
        assert_eq!(engine.memory_value("partial4"), Some(json!(4)));
    }

    #[test]
    fn test_prepared_executions_are_independent() {
        let recorder = Recorder::new();
        recorder.hold.store(true, Ordering::SeqCst);
        let engine = engine_with(&recorder);
        let mut template = command("page", json!({"incr": 1, "list": [1]}));
        template.options.queue_run = Some(RunMode::Event);
        engine.prepare("paging", template.clone());

        let first = engine.execute("paging", Some(json!({"incr": 2}).as_object().unwrap().clone()), false);
        let second = engine.execute("paging", Some(json!({"incr": 3}).as_object().unwrap().clone()), false);

        let pids: Vec<ProcessId> = [first, second]
            .into_iter()
            .filter_map(|outcome| match outcome {
                ExecuteOutcome::Enqueued(pid) => Some(pid),
                _ => None,
            })
            .collect();
        assert_eq!(pids.len(), 2);
        assert_ne!(pids[0], pids[1]);
        let a = pids[0];
        let calls = recorder.calls();
        assert_eq!(calls[0].2["incr"], json!(2));
        assert_eq!(calls[1].2["incr"], json!(3));
        assert_eq!(engine.current_command(a).unwrap().options.queue_run, Some(RunMode::Instant));
        assert_eq!(engine.prepared("paging").unwrap(), template);
    }

    #[test]
    fn test_register_gate() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder);
        let mut gated = command("gated", json!({}));
        gated.options.queue_register = Some("R".to_string());

        let pid = engine.enqueue(gated);
        engine.process();
        engine.process();
        assert_eq!(engine.state_of(pid), Some(CommandState::Added));
        assert!(recorder.calls().is_empty());

        engine.add_register("R");

        assert_eq!(engine.state_of(pid), None);
        assert_eq!(recorder.methods(), vec!["gated"]);
    }

    #[test]
    fn test_statement_gate_waits_for_memory() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder);
        let mut gated = command("gated", json!({}));
        gated.options.queue_statement = Some("memory.ready.value == true".to_string());

        let pid = engine.enqueue(gated);
        engine.set_memory("ready", json!(false), MemoryMode::Session).unwrap();
        for _ in 0..3 {
            engine.process();
            assert_eq!(engine.state_of(pid), Some(CommandState::Added));
        }

        engine.set_memory("ready", json!(true), MemoryMode::Session).unwrap();
        engine.process();

        assert_eq!(engine.state_of(pid), None);
        assert_eq!(recorder.methods(), vec!["gated"]);
    }

    #[test]
    fn test_missing_prepared_queue() {
        let engine = Engine::new(EngineConfig::synchronous());

        assert_eq!(engine.execute("missingQueue", None, false), ExecuteOutcome::NotFound);
        assert_eq!(engine.diagnostics().len(), 1);
        assert_eq!(engine.execute("missingQueue", None, true), ExecuteOutcome::NotFound);
        assert_eq!(engine.diagnostics().len(), 1);
    }

    #[test]
    fn test_prepared_statement_false_is_not_run() {
        let engine = Engine::new(EngineConfig::synchronous());
        let mut template = command("x", json!({}));
        template.options.queue_statement = Some("false".to_string());
        engine.prepare("q", template);

        assert_eq!(engine.execute("q", None, false), ExecuteOutcome::NotRun);
        assert_eq!(engine.chain_count(), 0);
    }

    #[test]
    fn test_unknown_plugin_fails_immediately() {
        let engine = Engine::new(EngineConfig::synchronous());
        let pid = engine.enqueue(Command::new(1, Target::new("ghost", "run")));

        assert_eq!(engine.state_of(pid), Some(CommandState::Error));
        let diagnostics = engine.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].level, DiagnosticLevel::Error);
        assert!(diagnostics[0].message.contains("ghost"));
    }

    #[test]
    fn test_completing_a_non_running_chain_is_reported() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder);
        let mut gated = command("a", json!({}));
        gated.options.queue_register = Some("never".to_string());
        let pid = engine.enqueue(gated);

        let result = engine.finished(pid, FinishMode::Ok, None);

        assert!(matches!(result, Err(SchedulerError::NotRunning { .. })));
        assert_eq!(engine.diagnostics().len(), 1);
        assert_eq!(engine.state_of(pid), Some(CommandState::Added));
    }

    #[test]
    fn test_dropped_invocation_fails_chain() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder);
        let pid = engine.enqueue(command("a", json!({"outcome": "drop"})));

        assert_eq!(engine.state_of(pid), Some(CommandState::Error));
        assert!(engine.error_of(pid).unwrap().contains("dropped"));
    }

    #[test]
    fn test_warning_is_logged_and_chain_proceeds() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder);
        let mut root = command("a", json!({"outcome": "warn"}));
        root.children.push(command("b", json!({})));

        let pid = engine.enqueue(root);

        assert_eq!(engine.state_of(pid), None);
        assert_eq!(recorder.methods(), vec!["a", "b"]);
        assert_eq!(engine.diagnostics()[0].level, DiagnosticLevel::Warning);
    }

    #[test]
    fn test_arguments_resolve_at_dispatch_time() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder);
        engine.set_memory("user", json!({"name": "Ada", "tags": ["x"]}), MemoryMode::Session).unwrap();

        engine.enqueue(command(
            "a",
            json!({
                "id": "#pid",
                "greeting": "Hi {{!memory.user.value.name}}",
                "user": "{{!^memory.user.value}}",
                "tags": "*user.value.tags",
                "literal": "*not a pointer"
            }),
        ));

        let (pid, _, args) = recorder.calls().remove(0);
        assert_eq!(args["id"], json!(pid.to_string()));
        assert_eq!(args["greeting"], json!("Hi Ada"));
        assert_eq!(args["user"], json!({"name": "Ada", "tags": ["x"]}));
        assert_eq!(args["tags"], json!(["x"]));
        assert_eq!(args["literal"], json!("*not a pointer"));
    }

    #[test]
    fn test_unresolved_pointer_is_null_with_a_warning() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder);

        engine.enqueue(command("a", json!({"value": "*required", "nested": ["*user.value"]})));

        let (_, _, args) = recorder.calls().remove(0);
        assert_eq!(args["value"], Value::Null);
        assert_eq!(args["nested"], json!([null]));
        let warnings: Vec<_> = engine
            .diagnostics()
            .into_iter()
            .filter(|d| d.level == DiagnosticLevel::Warning)
            .collect();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.message.contains("*required")));
    }

    #[test]
    fn test_render_binds_and_trigger_fires_fresh_copies() {
        // --- Setup ---
        let recorder = Recorder::new();
        let engine = engine_with(&recorder);
        let rendered = engine
            .render_into(
                "body",
                r#"<button id="go" @rec.click({"n":1},{"queueButtonDisable":true});>Go</button>@rec.boot({},{"queueRun":"Instant"});"#,
            )
            .unwrap();

        // --- Assert: instant ran, event is bound ---
        assert_eq!(rendered.started.len(), 1);
        assert_eq!(recorder.methods(), vec!["boot"]);
        assert_eq!(engine.binding_count(), 1);
        let selector = rendered.commands[0].bind_selector();

        // --- Execute ---
        let first = engine.trigger(&selector, &DomEvent::click());
        let second = engine.trigger(&selector, &DomEvent::click());
        let ignored = engine.trigger(&selector, &DomEvent::keydown("Enter"));

        // --- Assert ---
        assert_eq!(first.fired.len(), 1);
        assert!(first.prevent_default);
        assert_ne!(first.fired, second.fired);
        assert!(ignored.fired.is_empty());
        assert_eq!(recorder.methods(), vec!["boot", "click", "click"]);
        assert!(engine.document_html().contains(r#"disabled="disabled""#));
    }

    #[test]
    fn test_failed_render_keeps_accepted_nothing_and_reports() {
        let engine = Engine::new(EngineConfig::synchronous());
        let result = engine.render(r#"@rec.a({"x":1});-rec.b({bad});"#);

        assert!(matches!(result, Err(RenderError::Parse(_))));
        assert_eq!(engine.chain_count(), 0);
        assert_eq!(engine.diagnostics()[0].level, DiagnosticLevel::Error);
    }

    #[test]
    fn test_remount_prunes_stale_bindings() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder);
        engine.render_into("body", r#"<a @rec.go({});>x</a>"#).unwrap();
        assert_eq!(engine.binding_count(), 1);

        engine.render_into("body", "<p>empty</p>").unwrap();

        assert_eq!(engine.binding_count(), 0);
    }

    #[test]
    fn test_submit_external_message() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder);
        let message: ExternalMessage =
            serde_json::from_value(json!({"target": "rec.ext", "arguments": {"a": 1}})).unwrap();

        engine.submit(message).unwrap();
        assert_eq!(recorder.methods(), vec!["ext"]);

        let bad = ExternalMessage {
            target: "nodot".to_string(),
            arguments: JsonMap::new(),
            options: Default::default(),
        };
        assert!(matches!(engine.submit(bad), Err(EngineError::InvalidTarget(_))));
    }

    #[test]
    fn test_transport_failure_runs_error_queue() {
        let recorder = Recorder::new();
        let engine = engine_with(&recorder);
        engine.prepare("error", command("showError", json!({})));

        let outcome = engine.report_transport_failure("HTTP 500");

        assert!(matches!(outcome, ExecuteOutcome::Enqueued(_)));
        assert_eq!(recorder.calls()[0].2["message"], json!("HTTP 500"));
    }

    #[test]
    fn test_unknown_method_fails_through_method_table() {
        struct Tabled(MethodTable);
        impl Queueable for Tabled {
            fn start(&self, invocation: Invocation) {
                self.0.dispatch(invocation);
            }
        }
        let engine = Engine::new(EngineConfig::synchronous());
        engine.register_plugin("t", Arc::new(Tabled(MethodTable::new().with("known", |inv: Invocation| inv.ok()))));

        let ok = engine.enqueue(Command::new(1, Target::new("t", "known")));
        let bad = engine.enqueue(Command::new(2, Target::new("t", "unknown")));

        assert_eq!(engine.state_of(ok), None);
        assert_eq!(engine.state_of(bad), Some(CommandState::Error));
    }

    #[test]
    fn test_stack_is_shared_across_steps() {
        let recorder = Recorder::new();
        recorder.hold.store(true, Ordering::SeqCst);
        let engine = engine_with(&recorder);
        let mut root = command("a", json!({}));
        root.children.push(command("b", json!({"page": "{{!^#stack.page}}"})));

        let pid = engine.enqueue(root);
        engine.set_stack(pid, "page", json!(3)).unwrap();
        recorder.release_one();

        assert_eq!(recorder.calls()[1].2["page"], json!(3));
        assert_eq!(engine.stack(pid), Some(json!({"page": 3})));
    }

    #[tokio::test]
    async fn test_delayed_dispatch_settles() {
        let recorder = Recorder::new();
        let mut config = EngineConfig::default();
        config.dispatch.delay_ms = 5;
        let engine = Engine::new(config);
        engine.register_plugin("rec", recorder.clone());
        engine.boot_plugins();

        let mut root = command("a", json!({}));
        root.children.push(command("b", json!({})));
        let pid = engine.enqueue(root);
        assert_eq!(engine.state_of(pid), Some(CommandState::Running));
        assert!(recorder.calls().is_empty());

        assert!(engine.settle(Duration::from_secs(2)).await);
        assert_eq!(recorder.methods(), vec!["a", "b"]);
        assert_eq!(engine.state_of(pid), None);
    }

    #[tokio::test]
    async fn test_queue_timer_overrides_default_delay() {
        let recorder = Recorder::new();
        let mut config = EngineConfig::default();
        config.dispatch.delay_ms = 60_000;
        let engine = Engine::new(config);
        engine.register_plugin("rec", recorder.clone());
        engine.boot_plugins();

        let mut fast = command("fast", json!({}));
        fast.options.queue_timer = Some(5);
        let fast_pid = engine.enqueue(fast);
        let slow_pid = engine.enqueue(command("slow", json!({})));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(recorder.methods(), vec!["fast"]);
        assert_eq!(engine.state_of(fast_pid), None);
        assert_eq!(engine.state_of(slow_pid), Some(CommandState::Running));
        assert!(!engine.settle(Duration::from_millis(50)).await);
    }
}
