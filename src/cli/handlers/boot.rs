// src/cli/handlers/boot.rs

use crate::{
    cli::{args::BootArgs, handlers::commons},
    core::{bootstrap, engine::Engine, paths},
    plugins,
    system::document::VirtualDocument,
};
use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::time::{Duration, Instant};

/// The main handler for the `boot` command.
/// Boots a page on a tokio runtime, waits for the queue to settle and prints the page.
pub fn handle(args: Vec<String>) -> Result<()> {
    let boot_args = BootArgs::try_parse_from(&args)?;
    let config = commons::load_config(boot_args.config.as_deref())?;
    let jar = commons::open_cookie_jar(boot_args.cookies.as_deref())?;
    let boot_file = paths::expand_path(&boot_args.boot_file)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    runtime.block_on(async move {
        let started = Instant::now();
        let engine = Engine::with_host(config, Box::new(VirtualDocument::new()), Box::new(jar));
        plugins::register_builtins(&engine);

        let report = bootstrap::boot(&engine, &boot_file)?;
        let settled = engine
            .settle(Duration::from_millis(boot_args.timeout_ms))
            .await;
        let elapsed = started.elapsed();
        log::debug!("Boot settled={} after {} ms.", settled, elapsed.as_millis());

        println!("{}", "--- Document ---".yellow().bold());
        println!("{}", engine.document_html());
        println!(
            "\n{} {} template(s) rendered, {} failed, {} slot(s) restored in {} ms",
            "Booted".green(),
            report.templates_rendered,
            report.templates_failed,
            report.restored_slots,
            elapsed.as_millis()
        );
        if !settled {
            println!(
                "{} {} command(s) still running after {} ms",
                "Warning:".yellow().bold(),
                engine.running_count(),
                boot_args.timeout_ms
            );
        }
        commons::print_memory(&engine.memory_snapshot());
        commons::print_diagnostics(&engine.diagnostics());
        Ok::<_, anyhow::Error>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_boot_handler_runs_a_page() {
        // --- Setup ---
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("page.html"), "<p>hi</p>").unwrap();
        let boot_file = dir.path().join("boot.json");
        fs::write(&boot_file, r#"{"version": 1, "templates": ["page.html"]}"#).unwrap();
        let path = |p: &std::path::Path| p.display().to_string();

        // --- Execute ---
        let result = handle(vec![
            path(&boot_file),
            "--cookies".to_string(),
            path(&dir.path().join("cookies.bin")),
            "--config".to_string(),
            path(&dir.path().join("queueable.toml")),
            "--timeout-ms".to_string(),
            "200".to_string(),
        ]);

        // --- Assert ---
        assert!(result.is_ok());
    }
}
