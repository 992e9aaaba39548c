//! # Memory Store
//!
//! Named slots shared by every command. Each slot records the chain that produced it and a
//! retention mode:
//!
//! - **Garbage** slots are released when their owning chain finishes.
//! - **Session** slots live as long as the store.
//! - **Permanent** slots are also mirrored into a [`CookieJar`]: one cookie per slot
//!   (`<prefix><name>` holding the slot as JSON) plus an index cookie (`<prefix>INDEX`, a
//!   base64 JSON array of slot names). Every Permanent write rewrites the set with a fresh
//!   expiry, and [`MemoryStore::restore`] rebuilds the slots from it.

use crate::{
    constants::{COOKIE_INDEX_SUFFIX, USER_ORIGIN},
    core::config::PersistenceConfig,
    core::expression::Scope,
    models::{Command, MemoryMode, MemorySlot, ProcessId},
    system::cookies::{Cookie, CookieError, CookieJar, MemoryCookieJar},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to encode memory slot '{name}': {source}")]
    Encode {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Persisted memory index is corrupt: {0}")]
    CorruptIndex(String),
    #[error("Cookie jar error: {0}")]
    Cookie(#[from] CookieError),
}

/// Slot name prefix of loop bindings, e.g. `for0`.
pub const LOOP_SLOT_PREFIX: &str = "for";

pub struct MemoryStore {
    slots: BTreeMap<String, MemorySlot>,
    jar: Box<dyn CookieJar>,
    persistence: PersistenceConfig,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("slots", &self.slots)
            .field("persistence", &self.persistence)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Box::new(MemoryCookieJar::new()), PersistenceConfig::default())
    }
}

impl MemoryStore {
    pub fn new(jar: Box<dyn CookieJar>, persistence: PersistenceConfig) -> Self {
        Self {
            slots: BTreeMap::new(),
            jar,
            persistence,
        }
    }

    pub fn get(&self, name: &str) -> Option<&MemorySlot> {
        self.slots.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.slots.get(name).map(|slot| &slot.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MemorySlot)> {
        self.slots.iter()
    }

    /// Direct write from outside the scheduler: no owner, origin `User`.
    pub fn set(&mut self, name: &str, value: Value, mode: MemoryMode) -> Result<(), MemoryError> {
        self.insert(
            name,
            MemorySlot {
                pid: None,
                mode,
                origin: USER_ORIGIN.to_string(),
                value,
            },
        )
    }

    /// Stores the result of `command`, running as `pid`. The slot is named after
    /// `memoryName` (with `#pid` substituted) or `plugin.method`, and defaults to Garbage.
    /// Returns the slot name.
    pub fn set_from_command(
        &mut self,
        pid: ProcessId,
        command: &Command,
        value: Value,
    ) -> Result<String, MemoryError> {
        let origin = command.target.to_string();
        let name = match &command.options.memory_name {
            Some(name) => name.replace("#pid", &pid.to_string()),
            None => origin.clone(),
        };
        let slot = MemorySlot {
            pid: Some(pid),
            mode: command.options.memory_mode.unwrap_or_default(),
            origin,
            value,
        };
        self.insert(&name, slot)?;
        Ok(name)
    }

    /// Stores a fully built slot. Persistence is synced when the new or the replaced slot is
    /// Permanent.
    pub fn insert(&mut self, name: &str, slot: MemorySlot) -> Result<(), MemoryError> {
        let touches_cookies = slot.mode == MemoryMode::Permanent;
        let previous = self.slots.insert(name.to_string(), slot);
        log::trace!("Memory slot '{}' written.", name);
        if touches_cookies || previous.is_some_and(|p| p.mode == MemoryMode::Permanent) {
            self.sync_persistence()?;
        }
        Ok(())
    }

    /// Replaces a slot without touching persistence. Used for transient template bindings.
    pub(crate) fn swap(&mut self, name: &str, slot: Option<MemorySlot>) -> Option<MemorySlot> {
        match slot {
            Some(slot) => self.slots.insert(name.to_string(), slot),
            None => self.slots.remove(name),
        }
    }

    pub fn delete(&mut self, name: &str) -> Result<Option<MemorySlot>, MemoryError> {
        let removed = self.slots.remove(name);
        self.sync_persistence()?;
        Ok(removed)
    }

    /// Removes every Garbage slot owned by `pid` and returns their names.
    pub fn cleanup_garbage(&mut self, pid: ProcessId) -> Vec<String> {
        let doomed: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.mode == MemoryMode::Garbage && slot.pid == Some(pid))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &doomed {
            self.slots.remove(name);
        }
        if !doomed.is_empty() {
            log::debug!("Released {} garbage slot(s) of process #{}.", doomed.len(), pid);
        }
        doomed
    }

    /// The `memory` object seen by expressions: slot name → `{ value, origin, mode }`.
    pub fn as_scope_value(&self) -> Value {
        let mut map = Map::new();
        for (name, slot) in &self.slots {
            map.insert(
                name.clone(),
                json!({
                    "value": slot.value,
                    "origin": slot.origin,
                    "mode": slot.mode.to_string(),
                }),
            );
        }
        Value::Object(map)
    }

    // --- PERSISTENCE ---

    fn index_cookie_name(&self) -> String {
        format!("{}{}", self.persistence.prefix, COOKIE_INDEX_SUFFIX)
    }

    fn slot_cookie_name(&self, name: &str) -> String {
        format!("{}{}", self.persistence.prefix, name)
    }

    pub fn persistence(&self) -> &PersistenceConfig {
        &self.persistence
    }

    /// Rewrites the Permanent slot cookies and the index, dropping cookies of slots that are
    /// no longer Permanent.
    pub fn sync_persistence(&mut self) -> Result<(), MemoryError> {
        let expiry = self.persistence.expiry();
        let secure = self.persistence.secure;
        let index_name = self.index_cookie_name();

        let mut names = Vec::new();
        let mut cookies = Vec::new();
        for (name, slot) in &self.slots {
            if slot.mode != MemoryMode::Permanent {
                continue;
            }
            let encoded = serde_json::to_string(slot).map_err(|source| MemoryError::Encode {
                name: name.clone(),
                source,
            })?;
            cookies.push(Cookie::new(self.slot_cookie_name(name), encoded, expiry, secure));
            names.push(name.clone());
        }

        let wanted: Vec<String> = cookies.iter().map(|c| c.name.clone()).collect();
        for existing in self.jar.names() {
            if existing.starts_with(&self.persistence.prefix)
                && existing != index_name
                && !wanted.contains(&existing)
            {
                self.jar.remove(&existing)?;
            }
        }
        for cookie in cookies {
            self.jar.set(cookie)?;
        }

        let index = serde_json::to_string(&names).map_err(|source| MemoryError::Encode {
            name: index_name.clone(),
            source,
        })?;
        self.jar
            .set(Cookie::new(index_name, STANDARD.encode(index), expiry, secure))?;
        log::debug!("Persisted {} permanent slot(s).", names.len());
        Ok(())
    }

    /// Rebuilds Permanent slots from the cookie jar and returns how many were restored.
    /// A corrupt index is an error; an individual unreadable slot is skipped with a warning.
    pub fn restore(&mut self) -> Result<usize, MemoryError> {
        let Some(raw_index) = self.jar.get(&self.index_cookie_name()) else {
            return Ok(0);
        };
        let decoded = STANDARD
            .decode(raw_index.trim())
            .map_err(|e| MemoryError::CorruptIndex(e.to_string()))?;
        let names: Vec<String> = serde_json::from_slice(&decoded)
            .map_err(|e| MemoryError::CorruptIndex(e.to_string()))?;

        let mut restored = 0;
        for name in names {
            let Some(raw) = self.jar.get(&self.slot_cookie_name(&name)) else {
                log::warn!("Persisted slot '{}' is listed but has no cookie.", name);
                continue;
            };
            match serde_json::from_str::<MemorySlot>(&raw) {
                Ok(mut slot) => {
                    slot.pid = None;
                    slot.mode = MemoryMode::Permanent;
                    self.slots.insert(name, slot);
                    restored += 1;
                }
                Err(e) => log::warn!("Skipping unreadable persisted slot '{}': {}", name, e),
            }
        }
        log::info!("Restored {} permanent memory slot(s).", restored);
        Ok(restored)
    }
}

// --- EXPRESSION SCOPE ---

/// What expressions may see: `memory`, loop bindings (`#loop<n>`, `#increment<n>`) and, while
/// a command is being resolved, its `#pid` and `#stack`.
pub struct MemoryScope<'a> {
    memory: &'a MemoryStore,
    pid: Option<ProcessId>,
    stack: Option<&'a Value>,
}

impl<'a> MemoryScope<'a> {
    pub fn new(memory: &'a MemoryStore) -> Self {
        Self {
            memory,
            pid: None,
            stack: None,
        }
    }

    pub fn for_process(memory: &'a MemoryStore, pid: ProcessId, stack: &'a Value) -> Self {
        Self {
            memory,
            pid: Some(pid),
            stack: Some(stack),
        }
    }

    fn loop_binding(&self, suffix: &str, field: &str) -> Option<Value> {
        let level = if suffix.is_empty() { "0" } else { suffix };
        if !level.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        self.memory
            .value(&format!("{}{}", LOOP_SLOT_PREFIX, level))
            .and_then(|binding| binding.get(field))
            .cloned()
    }
}

impl Scope for MemoryScope<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        match name {
            "memory" => Some(self.memory.as_scope_value()),
            "#pid" => self.pid.map(|pid| pid.0.into()),
            "#stack" => self.stack.cloned(),
            _ => {
                if let Some(suffix) = name.strip_prefix("#loop") {
                    self.loop_binding(suffix, "index")
                } else if let Some(suffix) = name.strip_prefix("#increment") {
                    self.loop_binding(suffix, "increment")
                } else {
                    None
                }
            }
        }
    }
}
