// src/cli/handlers/commons.rs

// Helpers shared by the CLI handlers.

use crate::{
    core::{config::EngineConfig, paths},
    models::{Diagnostic, DiagnosticLevel, MemorySlot},
    system::cookies::FileCookieJar,
};
use anyhow::{Context, Result, anyhow};
use colored::Colorize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;

/// Loads the engine configuration from `path`, or from the default location.
/// A missing default file yields the defaults.
pub fn load_config(path: Option<&str>) -> Result<EngineConfig> {
    let path = match path {
        Some(p) => paths::expand_path(p)?,
        None => match paths::get_engine_config_path() {
            Ok(p) => p,
            Err(e) => {
                log::warn!("{}; using the default engine configuration.", e);
                return Ok(EngineConfig::default());
            }
        },
    };
    EngineConfig::load(&path)
        .with_context(|| format!("Failed to load engine configuration '{}'", path.display()))
}

/// Opens the cookie jar at `path`, or the default one.
pub fn open_cookie_jar(path: Option<&str>) -> Result<FileCookieJar> {
    let path = match path {
        Some(p) => paths::expand_path(p)?,
        None => paths::get_cookie_jar_path()?,
    };
    FileCookieJar::open(&path)
        .with_context(|| format!("Failed to open cookie jar '{}'", path.display()))
}

/// Reads a template file given on the command line.
pub fn read_template(path: &str) -> Result<String> {
    let path = paths::expand_path(path)?;
    fs::read_to_string(&path)
        .with_context(|| format!("Could not read template '{}'", path.display()))
}

/// Parses a `name=json` assignment. A value that is not valid JSON is taken as a string.
pub fn parse_assignment(raw: &str) -> Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected NAME=JSON, got '{}'.", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("Memory slot name is empty in '{}'.", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

pub fn print_diagnostics(diagnostics: &[Diagnostic]) {
    if diagnostics.is_empty() {
        return;
    }
    println!("\n{}", "--- Diagnostics ---".yellow().bold());
    for diagnostic in diagnostics {
        let label = match diagnostic.level {
            DiagnosticLevel::Info => "info".dimmed(),
            DiagnosticLevel::Warning => "warning".yellow(),
            DiagnosticLevel::Error => "error".red().bold(),
        };
        match diagnostic.process {
            Some(pid) => println!("  {} {} {}", label, format!("#{}", pid).dimmed(), diagnostic.message),
            None => println!("  {} {}", label, diagnostic.message),
        }
    }
}

pub fn print_memory(slots: &BTreeMap<String, MemorySlot>) {
    println!("\n{}", "--- Memory ---".yellow().bold());
    if slots.is_empty() {
        println!("  {}", "(empty)".dimmed());
        return;
    }
    for (name, slot) in slots {
        println!(
            "  {} {} = {}",
            name.cyan(),
            format!("[{}, {}]", slot.mode, slot.origin).dimmed(),
            slot.value
        );
    }
}
