// src/cli/handlers/parse.rs

use crate::{
    cli::{args::ParseArgs, handlers::commons},
    core::parser,
    models::IdGenerator,
};
use anyhow::{Context, Result};
use clap::Parser;
use colored::*;

/// The main handler for the `parse` command.
/// Prints the residual markup and the parsed command tree without running anything.
pub fn handle(args: Vec<String>) -> Result<()> {
    let parse_args = ParseArgs::try_parse_from(&args)?;
    let source = commons::read_template(&parse_args.template)?;

    let parsed = parser::parse_template(&source, &IdGenerator::new())
        .with_context(|| format!("Template '{}' was rejected", parse_args.template))?;

    println!("{}", "--- Markup ---".yellow().bold());
    println!("{}", parsed.html);
    println!("\n{}", "--- Commands ---".yellow().bold());
    println!("{}", serde_json::to_string_pretty(&parsed.commands)?);
    Ok(())
}
