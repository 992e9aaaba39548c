// src/core/parser.rs

//! Extracts command calls (`@plugin.method({...},{...});` and `-plugin.method(...);`) from
//! expanded template markup. Each call becomes a [`Command`]; its text is replaced by a
//! placeholder attribute or removed.

use crate::{
    constants::PLACEHOLDER_ATTRIBUTE,
    models::{Command, CommandOptions, IdGenerator, JsonMap, RunMode, Target},
};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Malformed command call at offset {offset}: {reason}")]
    Syntax { offset: usize, reason: String },
    #[error("Invalid JSON in the call of '{target}': {source}")]
    Json {
        target: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("The call of '{target}' must pass JSON objects for arguments and options.")]
    NotAnObject { target: String },
    #[error("Child command '{target}' at offset {offset} has no parent command before it.")]
    OrphanChild { target: String, offset: usize },
}

/// Failures that abort a render or a command's dispatch.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("Arguments of '{target}' are not valid JSON after substitution: {source}")]
    ArgumentJson {
        target: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Arguments of '{target}' must resolve to a JSON object.")]
    ArgumentsNotObject { target: String },
}

/// Markup with placeholders plus the root commands found in it, in source order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTemplate {
    pub html: String,
    pub commands: Vec<Command>,
}

impl ParsedTemplate {
    /// Root commands flagged Instant that are not stored as prepared queues.
    pub fn instants(&self) -> impl Iterator<Item = &Command> {
        self.commands
            .iter()
            .filter(|c| c.is_instant() && c.options.queue_prepare.is_none())
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Reads an identifier at `from`, returning its end offset.
fn read_ident(text: &str, from: usize) -> Option<usize> {
    let mut chars = text[from..].char_indices();
    let (_, first) = chars.next()?;
    if !is_ident_start(first) {
        return None;
    }
    let len = chars
        .find(|(_, c)| !is_ident_char(*c))
        .map_or(text.len() - from, |(i, _)| i);
    Some(from + len)
}

/// Finds the `)` closing the argument list opened just before `from`. Brackets are balanced
/// and JSON strings skipped.
fn find_call_end(text: &str, from: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[from..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' | '(' => depth += 1,
            '}' | ']' => depth = depth.saturating_sub(1),
            ')' if depth == 0 => return Some(from + i),
            ')' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Splits an argument list at top-level commas.
fn split_arguments(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn parse_object(text: &str, target: &Target) -> Result<JsonMap, ParseError> {
    let value: Value = serde_json::from_str(text).map_err(|source| ParseError::Json {
        target: target.to_string(),
        source,
    })?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(ParseError::NotAnObject {
            target: target.to_string(),
        }),
    }
}

/// A command call located in the text.
struct CallSite {
    is_child: bool,
    start: usize,
    end: usize,
    target: Target,
    arguments: JsonMap,
    options: CommandOptions,
}

/// Tries to read a call starting at the marker at `start`. `Ok(None)` means the text there is
/// not a call at all; `Err` means it is one, but malformed.
fn read_call(text: &str, start: usize) -> Result<Option<CallSite>, ParseError> {
    let is_child = text[start..].starts_with('-');
    let Some(plugin_end) = read_ident(text, start + 1) else {
        return Ok(None);
    };
    if !text[plugin_end..].starts_with('.') {
        return Ok(None);
    }
    let Some(method_end) = read_ident(text, plugin_end + 1) else {
        return Ok(None);
    };
    if !text[method_end..].starts_with('(') {
        return Ok(None);
    }
    let target = Target::new(&text[start + 1..plugin_end], &text[plugin_end + 1..method_end]);

    let args_start = method_end + 1;
    let args_end = find_call_end(text, args_start).ok_or_else(|| ParseError::Syntax {
        offset: start,
        reason: format!("unterminated argument list of '{}'", target),
    })?;
    let after = &text[args_end + 1..];
    let trimmed = after.trim_start();
    if !trimmed.starts_with(';') {
        return Err(ParseError::Syntax {
            offset: start,
            reason: format!("missing ';' after the call of '{}'", target),
        });
    }
    let end = args_end + 1 + (after.len() - trimmed.len()) + 1;

    let raw_arguments = text[args_start..args_end].trim();
    let (arguments, options) = if raw_arguments.is_empty() {
        (JsonMap::new(), JsonMap::new())
    } else {
        match split_arguments(raw_arguments).as_slice() {
            [arguments] => (parse_object(arguments.trim(), &target)?, JsonMap::new()),
            [arguments, options] => (
                parse_object(arguments.trim(), &target)?,
                parse_object(options.trim(), &target)?,
            ),
            _ => {
                return Err(ParseError::Syntax {
                    offset: start,
                    reason: format!("'{}' takes at most two JSON arguments", target),
                });
            }
        }
    };
    let options: CommandOptions =
        serde_json::from_value(Value::Object(options)).map_err(|source| ParseError::Json {
            target: target.to_string(),
            source,
        })?;

    Ok(Some(CallSite {
        is_child,
        start,
        end,
        target,
        arguments,
        options,
    }))
}

/// Whether a command leaves a placeholder behind in the markup.
fn needs_placeholder(command: &Command) -> bool {
    command.run_mode() == RunMode::Event
        && command.options.queue_prepare.is_none()
        && command.options.queue_bind_target.is_none()
}

/// Parses every command call out of `text`. Any malformed call fails the whole template.
pub fn parse_template(text: &str, ids: &IdGenerator) -> Result<ParsedTemplate, ParseError> {
    let mut html = String::with_capacity(text.len());
    let mut commands: Vec<Command> = Vec::new();
    let mut copied_to = 0;
    let mut previous: Option<char> = None;

    let mut indices = text.char_indices();
    while let Some((i, c)) = indices.next() {
        let candidate = (c == '@' || c == '-')
            && i >= copied_to
            && !previous.is_some_and(|p| is_ident_char(p) || p == '-');
        previous = Some(c);
        if !candidate {
            continue;
        }
        let Some(call) = read_call(text, i)? else {
            continue;
        };

        html.push_str(&text[copied_to..call.start]);
        copied_to = call.end;

        let mut command = Command::new(ids.next_id(), call.target);
        command.arguments = call.arguments;
        command.options = call.options;
        if command.options.queue_run.is_none() {
            command.options.queue_run = Some(if call.is_child {
                RunMode::Sub
            } else {
                RunMode::Event
            });
        }
        log::trace!("Parsed command #{} '{}'.", command.id, command.target);

        if call.is_child {
            let parent = commands.last_mut().ok_or_else(|| ParseError::OrphanChild {
                target: command.target.to_string(),
                offset: call.start,
            })?;
            parent.children.push(command);
        } else {
            if needs_placeholder(&command) {
                html.push_str(&format!("{}=\"{}\"", PLACEHOLDER_ATTRIBUTE, command.id));
            }
            commands.push(command);
        }

        // Skip the consumed call.
        while indices.clone().next().is_some_and(|(j, _)| j < copied_to) {
            previous = indices.next().map(|(_, c)| c);
        }
    }
    html.push_str(&text[copied_to..]);

    Ok(ParsedTemplate { html, commands })
}
