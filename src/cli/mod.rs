// src/cli/mod.rs

use clap::Parser;

pub mod args;
pub mod handlers;

const HELP_TEMPLATE: &str = "\
<title>queueable</title> {version}
{about}

<group>USAGE</group>
  <cmd>queueable</cmd> <hl><command></hl> [args...]

<group>COMMANDS</group>
  <cmd>render</cmd> <hl><template></hl> [--set name=json]... [--config path]
      Render a template into an empty page and run its Instant commands.
  <cmd>parse</cmd> <hl><template></hl>
      Print the markup left after command extraction and the parsed command tree.
  <cmd>boot</cmd> <hl><boot.json></hl> [--cookies path] [--config path] [--timeout-ms n]
      Boot a page from its boot file and wait for the queue to settle.
  <cmd>cookies</cmd> [--cookies path] [--config path] [--clear]
      List (or <err>clear</err>) the Permanent memory kept in a cookie jar.

<dim>Set RUST_LOG=debug to follow the scheduler.</dim>
";

/// Builds the color-aware help string at runtime.
fn build_help_string() -> &'static str {
    let use_colors = colored::control::SHOULD_COLORIZE.should_colorize();

    let title = if use_colors { "\x1b[1;33m" } else { "" }; // Bold Yellow
    let hl = if use_colors { "\x1b[1;36m" } else { "" }; // Bold Cyan
    let cmd = if use_colors { "\x1b[36m" } else { "" }; // Cyan
    let group = if use_colors { "\x1b[1;32m" } else { "" }; // Bold Green
    let err = if use_colors { "\x1b[91m" } else { "" }; // Bright Red
    let dim = if use_colors { "\x1b[2m" } else { "" };
    let reset = if use_colors { "\x1b[0m" } else { "" };

    let formatted_string = HELP_TEMPLATE
        .replace("<title>", title)
        .replace("</title>", reset)
        .replace("<hl>", hl)
        .replace("</hl>", reset)
        .replace("<cmd>", cmd)
        .replace("</cmd>", reset)
        .replace("<group>", group)
        .replace("</group>", reset)
        .replace("<err>", err)
        .replace("</err>", reset)
        .replace("<dim>", dim)
        .replace("</dim>", reset);

    Box::leak(formatted_string.into_boxed_str())
}

/// queueable: render templates, run their command queues and inspect persisted memory.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    help_template = { build_help_string() },
    styles = clap::builder::Styles::styled()
        .header(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .usage(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .literal(clap::builder::styling::AnsiColor::Cyan.on_default().bold())
        .placeholder(clap::builder::styling::AnsiColor::Green.on_default()),
)]
#[command(disable_help_subcommand = true)]
#[command(trailing_var_arg = true)]
pub struct Cli {
    /// The command name followed by its own arguments.
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,
}
