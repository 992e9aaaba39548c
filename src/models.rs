// src/models.rs

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// JSON object as carried by command arguments, options extras and stacks.
pub type JsonMap = Map<String, Value>;

// --- IDENTITIES ---

/// Identity of a scheduled chain. Stable for the whole life of the chain and used as the
/// owner of the memory slots its commands produce.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic counter shared by the parser (command ids) and the scheduler (process ids).
/// Values are never reused while the generator lives.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// --- ENUMERATIONS ---

/// How a parsed command gets onto the queue.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
    /// Schedulable as soon as it is parsed.
    #[serde(alias = "instant")]
    Instant,
    /// Waits for a DOM event on its placeholder or bind target.
    #[serde(alias = "event")]
    Event,
    /// Only runs as a step of its parent's chain.
    #[serde(alias = "sub")]
    Sub,
}

/// Retention policy of a memory slot.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryMode {
    /// Released when the owning chain finishes.
    #[default]
    #[serde(alias = "garbage")]
    Garbage,
    /// Lives as long as the engine.
    #[serde(alias = "session")]
    Session,
    /// Like `Session`, and mirrored into the cookie jar.
    #[serde(alias = "permanent")]
    Permanent,
}

impl fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Garbage => "Garbage",
            Self::Session => "Session",
            Self::Permanent => "Permanent",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandState {
    Added,
    Running,
    Finished,
    Error,
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Completion status reported by a plugin.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinishMode {
    Ok,
    Warning,
    Error,
}

// --- COMMAND MODEL ---

/// The `(plugin, method)` pair a command invokes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub plugin: String,
    pub method: String,
}

impl Target {
    pub fn new(plugin: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            method: method.into(),
        }
    }

    /// Parses `plugin.method`.
    pub fn parse(text: &str) -> Option<Self> {
        let (plugin, method) = text.split_once('.')?;
        if plugin.is_empty() || method.is_empty() || method.contains('.') {
            return None;
        }
        Some(Self::new(plugin, method))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.plugin, self.method)
    }
}

/// Options recognised on the second JSON literal of a command call.
/// Keys the engine does not know about are kept in `extra` for the plugin.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_run: Option<RunMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_prepare: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_bind_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_event: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_event_codes"
    )]
    pub queue_event_codes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_event_ctrl_key: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_event_shift_key: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_button_disable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_register: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_statement: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_timer: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mode: Option<MemoryMode>,
    #[serde(flatten)]
    pub extra: JsonMap,
}

impl CommandOptions {
    /// DOM events the command listens to. Defaults to `click`.
    pub fn events(&self) -> Vec<String> {
        let raw = self.queue_event.as_deref().unwrap_or("click");
        let events: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();
        if events.is_empty() {
            vec!["click".to_string()]
        } else {
            events
        }
    }

    /// Keys accepted by `keydown` bindings. Defaults to `Enter`.
    pub fn event_codes(&self) -> Vec<String> {
        match &self.queue_event_codes {
            Some(codes) if !codes.is_empty() => codes.clone(),
            _ => vec!["Enter".to_string()],
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EventCodesRepr {
    Joined(String),
    List(Vec<Value>),
}

fn deserialize_event_codes<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let repr: Option<EventCodesRepr> = Option::deserialize(deserializer)?;
    Ok(repr.map(|r| match r {
        EventCodesRepr::Joined(s) => s
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect(),
        EventCodesRepr::List(list) => list
            .into_iter()
            .map(|code| match code {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|c| !c.is_empty())
            .collect(),
    }))
}

/// One parsed invocation of a plugin method.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Command {
    pub id: u64,
    pub target: Target,
    pub arguments: JsonMap,
    pub options: CommandOptions,
    /// Steps that run after this command, in order. Only present on parent commands.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Command>,
}

impl Command {
    pub fn new(id: u64, target: Target) -> Self {
        Self {
            id,
            target,
            arguments: JsonMap::new(),
            options: CommandOptions::default(),
            children: Vec::new(),
        }
    }

    pub fn run_mode(&self) -> RunMode {
        self.options.queue_run.unwrap_or(RunMode::Event)
    }

    pub fn is_instant(&self) -> bool {
        self.run_mode() == RunMode::Instant
    }

    /// Selector the binder attaches to: the explicit bind target, or the placeholder.
    pub fn bind_selector(&self) -> String {
        match &self.options.queue_bind_target {
            Some(selector) => selector.clone(),
            None => placeholder_selector(self.id),
        }
    }
}

/// Selector of the placeholder attribute the parser leaves in markup for command `id`.
pub fn placeholder_selector(id: u64) -> String {
    format!(
        "[{}=\"{}\"]",
        crate::constants::PLACEHOLDER_ATTRIBUTE,
        id
    )
}

// --- MEMORY MODEL ---

/// A stored value with its ownership and retention metadata.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MemorySlot {
    /// Owning chain, or `None` (serialized as `-1`) for values set outside the scheduler.
    #[serde(with = "owner_serde")]
    pub pid: Option<ProcessId>,
    pub mode: MemoryMode,
    pub origin: String,
    pub value: Value,
}

mod owner_serde {
    use super::ProcessId;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        owner: &Option<ProcessId>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match owner {
            Some(pid) => serializer.serialize_i64(i64::try_from(pid.0).unwrap_or(i64::MAX)),
            None => serializer.serialize_i64(-1),
        }
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<ProcessId>, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        Ok(u64::try_from(raw).ok().map(ProcessId))
    }
}

// --- CONSOLE MODEL ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Error,
}

/// One message written to the operator console.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    pub process: Option<ProcessId>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.process {
            Some(pid) => write!(f, "[{:?}] #{}: {}", self.level, pid, self.message),
            None => write!(f, "[{:?}] {}", self.level, self.message),
        }
    }
}

// --- HOST EVENTS ---

/// A DOM event as reported by the host to `Engine::trigger`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct DomEvent {
    pub kind: String,
    pub key: Option<String>,
    /// Legacy numeric key code, matched by numeric `queueEventCodes` entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_code: Option<u32>,
    pub ctrl_key: bool,
    pub shift_key: bool,
}

impl DomEvent {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn click() -> Self {
        Self::new("click")
    }

    pub fn keydown(key: impl Into<String>) -> Self {
        Self {
            kind: "keydown".to_string(),
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn with_key_code(mut self, code: u32) -> Self {
        self.key_code = Some(code);
        self
    }

    pub fn with_ctrl(mut self) -> Self {
        self.ctrl_key = true;
        self
    }

    pub fn with_shift(mut self) -> Self {
        self.shift_key = true;
        self
    }
}

/// A command handed to the engine from outside any template (e.g. a browser extension).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExternalMessage {
    /// `plugin.method`
    pub target: String,
    #[serde(default)]
    pub arguments: JsonMap,
    #[serde(default)]
    pub options: CommandOptions,
}

// --- BOOT CONFIGURATION ---

/// The boot file: which templates to render and the optional cache seed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BootConfig {
    pub version: f64,
    pub templates: Vec<TemplateRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum TemplateRef {
    Path(String),
    Detailed {
        url: String,
        #[serde(rename = "type", default)]
        kind: TemplateKind,
    },
}

impl TemplateRef {
    pub fn url(&self) -> &str {
        match self {
            Self::Path(url) | Self::Detailed { url, .. } => url,
        }
    }

    pub fn kind(&self) -> TemplateKind {
        match self {
            Self::Path(_) => TemplateKind::Template,
            Self::Detailed { kind, .. } => *kind,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    /// Expanded, parsed and scheduled.
    #[default]
    Template,
    /// Inserted verbatim.
    Static,
}
