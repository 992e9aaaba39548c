// src/core/scheduler.rs

//! The chain table. A chain is a root command plus its children, flattened into an immutable
//! step list under one stable process id; the cursor only moves forward.
//!
//! ```text
//! Added ──dispatch──▶ Running ──Ok/Warning──▶ Added (next step)
//!                        │                  └▶ Finished (last step)
//!                        └──Error──▶ Error
//! ```

use crate::constants::DEFAULT_RETAINED_ERRORS;
use crate::models::{Command, CommandState, FinishMode, ProcessId};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("No command is registered under process #{0}.")]
    UnknownProcess(ProcessId),
    #[error("Process #{pid} reported completion while {state}, expected Running.")]
    NotRunning { pid: ProcessId, state: CommandState },
}

/// What a completion did to its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The next step is back in `Added`.
    Advanced,
    Finished,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chain {
    pid: ProcessId,
    steps: Vec<Command>,
    cursor: usize,
    pub state: CommandState,
    /// Private per-chain values, exposed to expressions as `#stack`.
    pub stack: Value,
    pub error: Option<String>,
}

impl Chain {
    pub fn new(pid: ProcessId, mut root: Command) -> Self {
        let children = std::mem::take(&mut root.children);
        let mut steps = Vec::with_capacity(children.len() + 1);
        steps.push(root);
        steps.extend(children);
        Self {
            pid,
            steps,
            cursor: 0,
            state: CommandState::Added,
            stack: Value::Object(Map::new()),
            error: None,
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn current(&self) -> Option<&Command> {
        self.steps.get(self.cursor)
    }

    pub fn current_mut(&mut self) -> Option<&mut Command> {
        self.steps.get_mut(self.cursor)
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Moves to the next step. Returns `false` when the chain is exhausted.
    fn advance(&mut self) -> bool {
        if self.cursor + 1 < self.steps.len() {
            self.cursor += 1;
            self.state = CommandState::Added;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
pub struct Scheduler {
    chains: BTreeMap<ProcessId, Chain>,
    retained_errors: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::with_error_limit(DEFAULT_RETAINED_ERRORS)
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scheduler keeping at most `retained_errors` errored chains.
    pub fn with_error_limit(retained_errors: usize) -> Self {
        Self {
            chains: BTreeMap::new(),
            retained_errors,
        }
    }

    pub fn enqueue(&mut self, pid: ProcessId, command: Command) -> ProcessId {
        log::debug!(
            "Enqueued '{}' (command #{}) as process #{}.",
            command.target,
            command.id,
            pid
        );
        self.chains.insert(pid, Chain::new(pid, command));
        pid
    }

    pub fn get(&self, pid: ProcessId) -> Option<&Chain> {
        self.chains.get(&pid)
    }

    pub fn get_mut(&mut self, pid: ProcessId) -> Option<&mut Chain> {
        self.chains.get_mut(&pid)
    }

    /// Chains waiting in `Added`, in ascending pid order.
    pub fn pending(&self) -> Vec<ProcessId> {
        self.chains
            .values()
            .filter(|chain| chain.state == CommandState::Added)
            .map(Chain::pid)
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.chains
            .values()
            .filter(|chain| chain.state == CommandState::Running)
            .count()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chain> {
        self.chains.values()
    }

    /// Applies a plugin's completion report to the chain running as `pid`.
    pub fn complete(
        &mut self,
        pid: ProcessId,
        mode: FinishMode,
        message: Option<String>,
    ) -> Result<Completion, SchedulerError> {
        let chain = self
            .chains
            .get_mut(&pid)
            .ok_or(SchedulerError::UnknownProcess(pid))?;
        if chain.state != CommandState::Running {
            return Err(SchedulerError::NotRunning {
                pid,
                state: chain.state,
            });
        }

        if mode == FinishMode::Error {
            chain.state = CommandState::Error;
            chain.error = Some(message.unwrap_or_else(|| "Command failed.".to_string()));
            return Ok(Completion::Failed);
        }
        if mode == FinishMode::Warning {
            chain.error = message;
        }
        if chain.advance() {
            Ok(Completion::Advanced)
        } else {
            chain.state = CommandState::Finished;
            Ok(Completion::Finished)
        }
    }

    /// Drops finished chains, and the oldest errored chains past the retention limit.
    /// Returns the pids removed.
    pub fn compact(&mut self) -> Vec<ProcessId> {
        let errored: Vec<ProcessId> = self
            .chains
            .values()
            .filter(|chain| chain.state == CommandState::Error)
            .map(Chain::pid)
            .collect();
        let excess = errored.len().saturating_sub(self.retained_errors);

        let mut removed: Vec<ProcessId> = self
            .chains
            .values()
            .filter(|chain| chain.state == CommandState::Finished)
            .map(Chain::pid)
            .collect();
        removed.extend(errored.into_iter().take(excess));
        for pid in &removed {
            self.chains.remove(pid);
        }
        removed
    }
}
