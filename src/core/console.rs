// src/core/console.rs

use crate::models::{Diagnostic, DiagnosticLevel, ProcessId};
use std::collections::VecDeque;

/// The operator console: every diagnostic goes to the `log` facade and is kept in a bounded
/// history that hosts and tests can read back.
#[derive(Debug, Clone)]
pub struct Console {
    history: VecDeque<Diagnostic>,
    capacity: usize,
}

impl Console {
    pub fn new(capacity: usize) -> Self {
        Self {
            history: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, level: DiagnosticLevel, message: impl Into<String>, process: Option<ProcessId>) {
        let diagnostic = Diagnostic {
            level,
            message: message.into(),
            process,
        };
        match level {
            DiagnosticLevel::Info => log::info!("{}", diagnostic),
            DiagnosticLevel::Warning => log::warn!("{}", diagnostic),
            DiagnosticLevel::Error => log::error!("{}", diagnostic),
        }
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(diagnostic);
    }

    pub fn info(&mut self, message: impl Into<String>, process: Option<ProcessId>) {
        self.record(DiagnosticLevel::Info, message, process);
    }

    pub fn warning(&mut self, message: impl Into<String>, process: Option<ProcessId>) {
        self.record(DiagnosticLevel::Warning, message, process);
    }

    pub fn error(&mut self, message: impl Into<String>, process: Option<ProcessId>) {
        self.record(DiagnosticLevel::Error, message, process);
    }

    pub fn entries(&self) -> Vec<Diagnostic> {
        self.history.iter().cloned().collect()
    }

    /// Drains the history.
    pub fn take(&mut self) -> Vec<Diagnostic> {
        self.history.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
