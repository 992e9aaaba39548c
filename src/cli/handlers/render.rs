// src/cli/handlers/render.rs

use crate::{
    cli::{args::RenderArgs, handlers::commons},
    constants::BODY_SELECTOR,
    core::engine::Engine,
    models::MemoryMode,
    plugins,
};
use anyhow::{Context, Result};
use clap::Parser;
use colored::*;

/// The main handler for the `render` command.
/// Renders a template into an empty page with inline dispatch and prints the result.
pub fn handle(args: Vec<String>) -> Result<()> {
    let render_args = RenderArgs::try_parse_from(&args)?;
    let mut config = commons::load_config(render_args.config.as_deref())?;
    config.dispatch.synchronous = true;

    let engine = Engine::new(config);
    plugins::register_builtins(&engine);
    engine.boot_plugins();

    for assignment in &render_args.set {
        let (name, value) = commons::parse_assignment(assignment)?;
        engine
            .set_memory(&name, value, MemoryMode::Session)
            .with_context(|| format!("Failed to seed memory slot '{}'", name))?;
    }

    let source = commons::read_template(&render_args.template)?;
    let rendered = engine
        .render_into(BODY_SELECTOR, &source)
        .with_context(|| format!("Template '{}' was rejected", render_args.template))?;

    println!("{}", "--- Document ---".yellow().bold());
    println!("{}", engine.document_html());
    println!(
        "\n{} {} command(s), {} started, {} binding(s)",
        "Parsed".green(),
        rendered.commands.len(),
        rendered.started.len(),
        engine.binding_count()
    );
    commons::print_memory(&engine.memory_snapshot());
    commons::print_diagnostics(&engine.diagnostics());
    Ok(())
}
