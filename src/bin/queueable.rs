// src/bin/queueable.rs

use anyhow::Result;
use clap::Parser;
use colored::*;
use queueable::cli::{Cli, handlers};

// --- Command Definition and Registry ---

/// A CLI command, its aliases and its handler.
struct CommandDefinition {
    name: &'static str,
    aliases: &'static [&'static str],
    handler: fn(Vec<String>) -> Result<()>,
}

/// Every command the binary understands. To add one, add an entry here.
static COMMAND_REGISTRY: &[CommandDefinition] = &[
    CommandDefinition {
        name: "boot",
        aliases: &[],
        handler: handlers::boot::handle,
    },
    CommandDefinition {
        name: "cookies",
        aliases: &["jar"],
        handler: handlers::cookies::handle,
    },
    CommandDefinition {
        name: "parse",
        aliases: &[],
        handler: handlers::parse::handle,
    },
    CommandDefinition {
        name: "render",
        aliases: &["r"],
        handler: handlers::render::handle,
    },
];

/// Finds a command definition in the registry by its name or alias.
fn find_command(name: &str) -> Option<&'static CommandDefinition> {
    COMMAND_REGISTRY
        .iter()
        .find(|cmd| cmd.name == name || cmd.aliases.contains(&name))
}

/// Sets up logging, dispatches to the handler and prints any error in one place.
fn main() {
    env_logger::init();

    if let Err(e) = run_cli(Cli::parse()) {
        eprintln!("\n{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli) -> Result<()> {
    log::debug!("CLI args parsed: {:?}", cli);

    let mut args = cli.args.into_iter();
    let Some(command_name) = args.next() else {
        let names: Vec<&str> = COMMAND_REGISTRY.iter().map(|cmd| cmd.name).collect();
        println!(
            "Usage: queueable <command> [args...]  ({})",
            names.join(", ").cyan()
        );
        return Ok(());
    };

    match find_command(&command_name) {
        Some(command) => (command.handler)(args.collect()),
        None => Err(anyhow::anyhow!(
            "Unknown command '{}'. Run 'queueable --help' for the list of commands.",
            command_name
        )),
    }
}
