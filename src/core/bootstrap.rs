// src/core/bootstrap.rs

//! # Boot
//!
//! Brings a page up from its boot file:
//!
//! 1. Restore Permanent memory from the cookie jar and initialise plugins.
//! 2. Read the boot file, check its version and seed the `cache` slot.
//! 3. Pop template entries from the end of the list, rendering each one. Static entries are
//!    taken verbatim; a template that fails to load or render is reported and skipped.
//! 4. Append the collected markup to `body` in declaration order, bind its event commands and
//!    run the `init` prepared queue if the page defines one.

use crate::{
    constants::{CONFIG_ORIGIN, INIT_QUEUE},
    core::engine::Engine,
    core::paths,
    models::{BootConfig, Command, DiagnosticLevel, MemoryMode, MemorySlot, TemplateKind},
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

const MIN_BOOT_VERSION: f64 = 1.0;

#[derive(Error, Debug)]
pub enum BootError {
    #[error("Could not read boot file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Boot file '{path}' is not valid: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Boot file version {found} is not supported (minimum {minimum}).")]
    UnsupportedVersion { found: f64, minimum: f64 },
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BootReport {
    pub templates_rendered: usize,
    pub templates_failed: usize,
    pub restored_slots: usize,
}

/// Reads and validates a boot file.
pub fn load_boot_config(path: &Path) -> Result<BootConfig, BootError> {
    let content = fs::read_to_string(path).map_err(|source| BootError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let config: BootConfig = serde_json::from_str(&content).map_err(|source| BootError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    if config.version < MIN_BOOT_VERSION {
        return Err(BootError::UnsupportedVersion {
            found: config.version,
            minimum: MIN_BOOT_VERSION,
        });
    }
    Ok(config)
}

/// Boots `engine` from the boot file at `path`.
pub fn boot(engine: &Engine, path: &Path) -> Result<BootReport> {
    let mut report = BootReport {
        restored_slots: engine.restore_memory(),
        ..BootReport::default()
    };
    engine.boot_plugins();

    let config = load_boot_config(path)
        .with_context(|| format!("Failed to boot from '{}'", path.display()))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    if let Some(cache) = config.cache {
        let slot = MemorySlot {
            pid: None,
            mode: MemoryMode::Session,
            origin: CONFIG_ORIGIN.to_string(),
            value: cache,
        };
        engine
            .insert_memory("cache", slot)
            .context("Failed to store the boot cache")?;
    }

    let mut pending = config.templates;
    let mut chunks: Vec<String> = Vec::new();
    let mut commands: Vec<Command> = Vec::new();

    while let Some(entry) = pending.pop() {
        let source = match read_template(base_dir, entry.url()) {
            Ok(source) => source,
            Err(e) => {
                engine.report(DiagnosticLevel::Error, format!("{:#}", e), None);
                report.templates_failed += 1;
                continue;
            }
        };
        match entry.kind() {
            TemplateKind::Static => {
                chunks.push(source);
                report.templates_rendered += 1;
            }
            TemplateKind::Template => match engine.render(&source) {
                Ok(rendered) => {
                    log::debug!("Rendered boot template '{}'.", entry.url());
                    chunks.push(rendered.html);
                    commands.extend(rendered.commands);
                    report.templates_rendered += 1;
                }
                Err(e) => {
                    log::debug!("Boot template '{}' skipped: {}", entry.url(), e);
                    report.templates_failed += 1;
                }
            },
        }
    }

    chunks.reverse();
    if !engine.flush_to_body(&chunks.concat()) {
        engine.report(DiagnosticLevel::Error, "The document has no body to boot into.", None);
    }
    engine.bind(&commands);
    engine.execute(INIT_QUEUE, None, true);

    log::info!(
        "Boot finished: {} template(s) rendered, {} failed, {} slot(s) restored.",
        report.templates_rendered,
        report.templates_failed,
        report.restored_slots
    );
    Ok(report)
}

fn read_template(base_dir: &Path, reference: &str) -> Result<String> {
    let path = paths::resolve_relative(base_dir, reference)?;
    fs::read_to_string(&path)
        .with_context(|| format!("Could not load template '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::plugins;
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn engine() -> Engine {
        let engine = Engine::new(EngineConfig::synchronous());
        plugins::register_builtins(&engine);
        engine
    }

    #[test]
    fn test_boot_renders_in_declaration_order_and_runs_init() {
        // --- Setup ---
        let dir = TempDir::new().unwrap();
        write(&dir, "header.html", "<header>static {{not expanded}}</header>");
        write(
            &dir,
            "main.html",
            r#"<main>{{memory.cache.value.title}}<button id="b" @register.add({"name":"clicked"});>Go</button></main>
@memory.set({"name":"booted","value":true,"mode":"Session"},{"queuePrepare":"init"});"#,
        );
        let boot_file = write(
            &dir,
            "boot.json",
            r#"{"version": 1.0,
                "templates": [{"url": "header.html", "type": "static"}, "main.html", "missing.html"],
                "cache": {"title": "Hello"}}"#,
        );
        let engine = engine();

        // --- Execute ---
        let report = boot(&engine, &boot_file).unwrap();

        // --- Assert ---
        assert_eq!(report.templates_rendered, 2);
        assert_eq!(report.templates_failed, 1);
        let html = engine.document_html();
        let header = html.find("<header>static {{not expanded}}</header>").unwrap();
        let main = html.find("<main>Hello<button").unwrap();
        assert!(header < main);
        assert_eq!(engine.memory_value("booted"), Some(json!(true)));
        assert_eq!(engine.memory_slot("cache").unwrap().origin, CONFIG_ORIGIN);
        assert_eq!(engine.binding_count(), 1);
    }

    #[test]
    fn test_boot_skips_broken_templates() {
        let dir = TempDir::new().unwrap();
        write(&dir, "bad.html", r#"@memory.set({"name": });"#);
        write(&dir, "good.html", "<p>ok</p>");
        let boot_file = write(
            &dir,
            "boot.json",
            r#"{"version": 1, "templates": ["good.html", "bad.html"]}"#,
        );
        let engine = engine();

        let report = boot(&engine, &boot_file).unwrap();

        assert_eq!(report.templates_rendered, 1);
        assert_eq!(report.templates_failed, 1);
        assert_eq!(engine.document_html(), "<body><p>ok</p></body>");
    }

    #[test]
    fn test_old_boot_version_is_rejected() {
        let dir = TempDir::new().unwrap();
        let boot_file = write(&dir, "boot.json", r#"{"version": 0.9, "templates": []}"#);

        let error = load_boot_config(&boot_file).unwrap_err();

        assert!(matches!(error, BootError::UnsupportedVersion { .. }));
        assert!(boot(&engine(), &boot_file).is_err());
    }

    #[test]
    fn test_init_queue_is_optional() {
        let dir = TempDir::new().unwrap();
        let boot_file = write(&dir, "boot.json", r#"{"version": 2, "templates": []}"#);
        let engine = engine();

        boot(&engine, &boot_file).unwrap();

        assert!(engine.diagnostics().is_empty());
        assert_eq!(engine.chain_count(), 0);
    }
}
