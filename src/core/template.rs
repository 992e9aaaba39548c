// src/core/template.rs

//! Template expansion: loops, conditionals, includes and inline expressions, resolved in that
//! order against a [`MemoryScope`]. `{{!…}}` tags are deferred to dispatch time and handled by
//! [`resolve_deferred`]; `{{~…}}` tags are passed through.

use crate::{
    constants::TEMPLATE_ORIGIN,
    core::expression::{self, Scope},
    core::memory::{LOOP_SLOT_PREFIX, MemoryScope, MemoryStore},
    models::{MemoryMode, MemorySlot},
    system::document::Document,
};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Value, json};
use std::collections::HashSet;

const MAX_RECURSION_DEPTH: u32 = 32;

lazy_static! {
    static ref LOOP_OPEN_RE: Regex = Regex::new(r"\{\{#(\d*)for\s").expect("valid regex");
    static ref LOOP_TAG_RE: Regex = Regex::new(r"\{\{(#|/)(\d*)for[\s}]").expect("valid regex");
    static ref IF_OPEN_RE: Regex = Regex::new(r"\{\{#if\s").expect("valid regex");
    static ref INCLUDE_RE: Regex = Regex::new(r"\{\{#include\s").expect("valid regex");
}

/// Delimits placeholders for loop and include output that is already fully expanded.
const FROZEN_MARK: char = '\u{E000}';

const IF_CLOSE: &str = "{{/if}}";
const ELSE_TAG: &str = "{{else}}";

/// Result of expanding one template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expansion {
    pub html: String,
    /// Recovered errors: failed expressions, missing includes, runaway recursion.
    pub warnings: Vec<String>,
}

/// Finds the `}}` closing a tag whose content starts at `from`, skipping quoted strings and
/// balanced braces inside the expression. Returns the offset of the first `}`.
fn find_tag_end(text: &str, from: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = from;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == b'\\' {
                i += 1;
            } else if b == q {
                quote = None;
            }
        } else {
            match b {
                b'"' | b'\'' => quote = Some(b),
                b'{' => depth += 1,
                b'}' if depth == 0 => {
                    if bytes.get(i + 1) == Some(&b'}') {
                        return Some(i);
                    }
                    return None;
                }
                b'}' => depth -= 1,
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Expands template tags against `memory`, reading include sources from `document`.
pub struct Expander<'a> {
    memory: &'a mut MemoryStore,
    document: &'a dyn Document,
    // For include cycle detection (#a -> #b -> #a)
    include_stack: HashSet<String>,
    // Expanded loop and include output, kept out of the remaining passes of the caller
    frozen: Vec<String>,
    warnings: Vec<String>,
}

impl<'a> Expander<'a> {
    pub fn new(memory: &'a mut MemoryStore, document: &'a dyn Document) -> Self {
        Self {
            memory,
            document,
            include_stack: HashSet::new(),
            frozen: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn expand(mut self, template: &str) -> Expansion {
        let html = self.expand_at(&template.replace(FROZEN_MARK, ""), 0);
        Expansion {
            html,
            warnings: self.warnings,
        }
    }

    fn warn(&mut self, message: String) {
        log::warn!("{}", message);
        self.warnings.push(message);
    }

    fn expand_at(&mut self, template: &str, depth: u32) -> String {
        if depth >= MAX_RECURSION_DEPTH {
            self.warn(format!(
                "Maximum template nesting depth ({}) exceeded; check for runaway loops or includes.",
                MAX_RECURSION_DEPTH
            ));
            return String::new();
        }
        let mark = self.frozen.len();
        let text = self.expand_loops(template, depth);
        let text = self.expand_conditionals(&text);
        let text = self.expand_includes(&text, depth);
        let text = self.expand_inline(&text);
        self.thaw(&text, mark)
    }

    fn freeze(&mut self, expanded: String) -> String {
        let token = format!("{m}{}{m}", self.frozen.len(), m = FROZEN_MARK);
        self.frozen.push(expanded);
        token
    }

    /// Puts back the output frozen since `mark`.
    fn thaw(&mut self, text: &str, mark: usize) -> String {
        if self.frozen.len() == mark {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        for (i, part) in text.split(FROZEN_MARK).enumerate() {
            if i % 2 == 0 {
                out.push_str(part);
                continue;
            }
            match part.parse::<usize>().ok().filter(|idx| *idx >= mark) {
                Some(idx) => {
                    if let Some(expanded) = self.frozen.get_mut(idx) {
                        out.push_str(&std::mem::take(expanded));
                    }
                }
                None => out.push_str(part),
            }
        }
        self.frozen.truncate(mark);
        out
    }

    // --- LOOPS ---

    fn expand_loops(&mut self, template: &str, depth: u32) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(caps) = LOOP_OPEN_RE.captures(rest) {
            let (Some(whole), Some(level)) = (caps.get(0), caps.get(1)) else {
                break;
            };
            let level = level.as_str().to_string();
            let Some(expr_end) = find_tag_end(rest, whole.end()) else {
                break;
            };
            let expr = rest[whole.end()..expr_end].trim().to_string();
            let body_start = expr_end + 2;
            let Some((body_end, close_end)) = find_loop_close(rest, body_start, &level) else {
                self.warn(format!("Unclosed loop tag '{{{{#{}for {}}}}}'.", level, expr));
                break;
            };

            out.push_str(&rest[..whole.start()]);
            let body = rest[body_start..body_end].to_string();
            let expanded = self.run_loop(&level, &expr, &body, depth);
            let token = self.freeze(expanded);
            out.push_str(&token);
            rest = &rest[close_end..];
        }
        out.push_str(rest);
        out
    }

    fn run_loop(&mut self, level: &str, expr: &str, body: &str, depth: u32) -> String {
        let iterable = {
            let scope = MemoryScope::new(self.memory);
            expression::evaluate(expr, &scope)
        };
        let entries: Vec<Value> = match iterable {
            Ok(Value::Array(items)) => (0..items.len()).map(Value::from).collect(),
            Ok(Value::Object(map)) => map.keys().cloned().map(Value::String).collect(),
            Ok(Value::Number(n)) if n.as_u64().is_some() => {
                (0..n.as_u64().unwrap_or(0)).map(Value::from).collect()
            }
            Ok(other) => {
                self.warn(format!("Loop expression '{}' is not iterable: {}", expr, other));
                return String::new();
            }
            Err(e) => {
                self.warn(format!("Loop expression '{}' failed: {}", expr, e));
                return String::new();
            }
        };

        let slot_name = format!("{}{}", LOOP_SLOT_PREFIX, if level.is_empty() { "0" } else { level });
        let mut previous: Option<Option<MemorySlot>> = None;
        let mut out = String::new();
        for (increment, index) in entries.into_iter().enumerate() {
            let binding = MemorySlot {
                pid: None,
                mode: MemoryMode::Session,
                origin: TEMPLATE_ORIGIN.to_string(),
                value: json!({ "index": index, "increment": increment }),
            };
            let replaced = self.memory.swap(&slot_name, Some(binding));
            if previous.is_none() {
                previous = Some(replaced);
            }
            out.push_str(&self.expand_at(body, depth + 1));
        }
        if let Some(previous) = previous {
            self.memory.swap(&slot_name, previous);
        }
        out
    }

    // --- CONDITIONALS ---

    fn expand_conditionals(&mut self, template: &str) -> String {
        let mut text = template.to_string();
        let mut search_from = 0;

        while let Some(close_rel) = text[search_from..].find(IF_CLOSE) {
            let close = search_from + close_rel;
            // Innermost: the last opening tag before the first closing tag.
            let Some(open) = IF_OPEN_RE
                .find_iter(&text[..close])
                .last()
                .map(|m| (m.start(), m.end()))
            else {
                search_from = close + IF_CLOSE.len();
                continue;
            };
            let Some(expr_end) = find_tag_end(&text, open.1).filter(|end| *end < close) else {
                search_from = close + IF_CLOSE.len();
                continue;
            };
            let expr = text[open.1..expr_end].trim().to_string();
            let inner = &text[expr_end + 2..close];
            let (then_part, else_part) = match inner.find(ELSE_TAG) {
                Some(pos) => (&inner[..pos], &inner[pos + ELSE_TAG.len()..]),
                None => (inner, ""),
            };

            let outcome = {
                let scope = MemoryScope::new(self.memory);
                expression::evaluate_truthy(&expr, &scope)
            };
            let replacement = match outcome {
                Ok(true) => then_part.to_string(),
                Ok(false) => else_part.to_string(),
                Err(e) => {
                    self.warn(format!("Condition '{}' failed: {}", expr, e));
                    String::new()
                }
            };
            text.replace_range(open.0..close + IF_CLOSE.len(), &replacement);
            search_from = 0;
        }
        text
    }

    // --- INCLUDES ---

    fn expand_includes(&mut self, template: &str, depth: u32) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(m) = INCLUDE_RE.find(rest) {
            let Some(expr_end) = find_tag_end(rest, m.end()) else {
                break;
            };
            let expr = rest[m.end()..expr_end].trim().to_string();
            out.push_str(&rest[..m.start()]);
            let included = self.include(&expr, depth);
            let token = self.freeze(included);
            out.push_str(&token);
            rest = &rest[expr_end + 2..];
        }
        out.push_str(rest);
        out
    }

    fn include(&mut self, expr: &str, depth: u32) -> String {
        let selector = {
            let scope = MemoryScope::new(self.memory);
            expression::evaluate(expr, &scope)
        };
        let selector = match selector {
            Ok(value) => expression::to_display(&value),
            Err(e) => {
                self.warn(format!("Include expression '{}' failed: {}", expr, e));
                return String::new();
            }
        };
        if self.include_stack.contains(&selector) {
            self.warn(format!("Include cycle detected at '{}'.", selector));
            return String::new();
        }
        let Some(source) = self.document.inner_html(&selector) else {
            self.warn(format!("Include target '{}' not found in the document.", selector));
            return String::new();
        };

        self.include_stack.insert(selector.clone());
        let expanded = self.expand_at(&source.replace(FROZEN_MARK, ""), depth + 1);
        self.include_stack.remove(&selector);
        expanded
    }

    // --- INLINE EXPRESSIONS ---

    fn expand_inline(&mut self, template: &str) -> String {
        let scope = MemoryScope::new(self.memory);
        let (text, warnings) = substitute(template, &scope, false);
        for warning in warnings {
            self.warn(warning);
        }
        text
    }
}

/// Locates `{{/<level>for}}` balancing an opening loop tag of the same level.
/// Returns `(body_end, after_close)`.
fn find_loop_close(text: &str, from: usize, level: &str) -> Option<(usize, usize)> {
    let mut depth = 1usize;
    for caps in LOOP_TAG_RE.captures_iter(&text[from..]) {
        let whole = caps.get(0)?;
        if caps.get(2).map(|m| m.as_str()) != Some(level) {
            continue;
        }
        if caps.get(1).map(|m| m.as_str()) == Some("#") {
            depth += 1;
            continue;
        }
        if !whole.as_str().ends_with('}') {
            continue;
        }
        depth -= 1;
        if depth == 0 {
            let start = from + whole.start();
            // `{{/<level>for}` was matched, skip the final brace.
            let end = from + whole.end() + 1;
            return text.get(start..end).map(|_| (start, end));
        }
    }
    None
}

/// Resolves `{{!expr}}` and `{{!^expr}}` tags at dispatch time. Plain substitutions are
/// escaped for use inside a JSON string; `^` substitutions are inserted raw with their
/// surrounding quotes removed.
pub fn resolve_deferred(text: &str, scope: &dyn Scope) -> (String, Vec<String>) {
    substitute(text, scope, true)
}

/// Shared inline substitution. With `deferred`, only `{{!…}}` tags are evaluated and every
/// other tag is left alone; otherwise `{{!…}}` and `{{~…}}` are the ones left alone.
fn substitute(text: &str, scope: &dyn Scope, deferred: bool) -> (String, Vec<String>) {
    let mut out = String::with_capacity(text.len());
    let mut warnings = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        let content_start = start + 2;
        let Some(end) = find_tag_end(rest, content_start) else {
            out.push_str(&rest[..content_start]);
            rest = &rest[content_start..];
            continue;
        };
        let content = &rest[content_start..end];
        let after = end + 2;

        let expression_text = if deferred {
            content.strip_prefix('!')
        } else if content.starts_with('!') || content.starts_with('~') {
            None
        } else {
            Some(content)
        };
        let Some(expression_text) = expression_text else {
            out.push_str(&rest[..after]);
            rest = &rest[after..];
            continue;
        };

        let (raw, expression_text) = match expression_text.strip_prefix('^') {
            Some(stripped) => (true, stripped.trim()),
            None => (false, expression_text.trim()),
        };
        let substitution = match expression::evaluate(expression_text, scope) {
            Ok(value) => {
                let display = expression::to_display(&value);
                if deferred && !raw {
                    escape_json_fragment(&display)
                } else if deferred {
                    display
                } else {
                    display.replace(FROZEN_MARK, "")
                }
            }
            Err(e) => {
                warnings.push(format!("Expression '{}' failed: {}", expression_text, e));
                if deferred && raw {
                    "null".to_string()
                } else {
                    String::new()
                }
            }
        };

        let mut prefix = &rest[..start];
        let mut tail = &rest[after..];
        if raw && prefix.ends_with('"') && tail.starts_with('"') {
            prefix = &prefix[..prefix.len() - 1];
            tail = &tail[1..];
        }
        out.push_str(prefix);
        out.push_str(&substitution);
        rest = tail;
    }
    out.push_str(rest);
    (out, warnings)
}

fn escape_json_fragment(text: &str) -> String {
    let quoted = Value::String(text.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::expression::MapScope;
    use crate::system::document::VirtualDocument;

    fn expand(memory: &mut MemoryStore, template: &str) -> Expansion {
        let document = VirtualDocument::new();
        Expander::new(memory, &document).expand(template)
    }

    #[test]
    fn test_loop_binds_index_and_increment() {
        let mut memory = MemoryStore::default();
        let result = expand(
            &mut memory,
            "<ul>{{#for [1,2,3]}}<li>{{^JSON.stringify(memory.for0.value)}}</li>{{/for}}</ul>",
        );

        assert_eq!(result.html.matches("<li>").count(), 3);
        assert_eq!(
            result.html,
            r#"<ul><li>{"increment":0,"index":0}</li><li>{"increment":1,"index":1}</li><li>{"increment":2,"index":2}</li></ul>"#
        );
        assert!(result.warnings.is_empty());
        assert!(!memory.contains("for0"));
    }

    #[test]
    fn test_nested_numbered_loops_and_object_keys() {
        let mut memory = MemoryStore::default();
        memory
            .set("rows", json!({"a": [1, 2], "b": [3]}), MemoryMode::Session)
            .unwrap();

        let result = expand(
            &mut memory,
            "{{#for memory.rows.value}}[{{#loop}}:{{#1for memory.rows.value[#loop0]}}{{#loop1}}{{/1for}}]{{/for}}",
        );

        assert_eq!(result.html, "[a:01][b:0]");
    }

    #[test]
    fn test_loop_restores_previous_binding() {
        let mut memory = MemoryStore::default();
        memory.set("for0", json!("outer"), MemoryMode::Session).unwrap();

        let result = expand(&mut memory, "{{#for 2}}{{#increment}}{{/for}}");

        assert_eq!(result.html, "01");
        assert_eq!(memory.value("for0"), Some(&json!("outer")));
    }

    #[test]
    fn test_conditionals_with_else_and_nesting() {
        let mut memory = MemoryStore::default();
        memory.set("n", json!(5), MemoryMode::Session).unwrap();

        let result = expand(
            &mut memory,
            "{{#if memory.n.value > 3}}big{{#if memory.n.value > 10}} huge{{else}} modest{{/if}}{{else}}small{{/if}}",
        );

        assert_eq!(result.html, "big modest");
    }

    #[test]
    fn test_failed_condition_is_recovered() {
        let mut memory = MemoryStore::default();
        let result = expand(&mut memory, "a{{#if memory.nope.value}}b{{/if}}c");

        assert_eq!(result.html, "ac");
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_include_expands_document_fragment() {
        let mut memory = MemoryStore::default();
        memory.set("who", json!("Ada"), MemoryMode::Session).unwrap();
        let document = VirtualDocument::from_html(
            r#"<body><template id="greet"><b>{{memory.who.value}}</b></template><template id="loop">{{#include '#loop'}}</template></body>"#,
        );

        let result = Expander::new(&mut memory, &document).expand("<p>{{#include '#greet'}}</p>");
        assert_eq!(result.html, "<p><b>Ada</b></p>");

        let result = Expander::new(&mut memory, &document).expand("{{#include '#loop'}}");
        assert_eq!(result.html, "");
        assert!(result.warnings[0].contains("cycle"));
    }

    #[test]
    fn test_inline_leaves_deferred_and_reserved_tags() {
        let mut memory = MemoryStore::default();
        memory.set("id", json!(7), MemoryMode::Session).unwrap();
        memory
            .set("user", json!({"name": "Ada"}), MemoryMode::Session)
            .unwrap();

        let result = expand(
            &mut memory,
            r#"{{memory.id.value}} {{!memory.id.value}} {{~raw}} "{{^JSON.stringify(memory.user.value)}}""#,
        );

        assert_eq!(
            result.html,
            r#"7 {{!memory.id.value}} {{~raw}} {"name":"Ada"}"#
        );
    }

    #[test]
    fn test_substituted_values_are_not_expanded_again() {
        let mut memory = MemoryStore::default();
        memory
            .set("evil", json!("{{memory.secret.value}}"), MemoryMode::Session)
            .unwrap();
        memory.set("secret", json!("S3CRET"), MemoryMode::Session).unwrap();
        let document = VirtualDocument::from_html(
            r#"<body><template id="frag"><i>{{memory.evil.value}}</i></template></body>"#,
        );

        let plain = Expander::new(&mut memory, &document).expand("<p>{{memory.evil.value}}</p>");
        let looped = Expander::new(&mut memory, &document)
            .expand("{{#for [1]}}<p>{{memory.evil.value}}</p>{{/for}}");
        let included = Expander::new(&mut memory, &document).expand("{{#include '#frag'}}");

        assert_eq!(plain.html, "<p>{{memory.secret.value}}</p>");
        assert_eq!(looped.html, "<p>{{memory.secret.value}}</p>");
        assert_eq!(included.html, "<i>{{memory.secret.value}}</i>");
        assert!(!looped.html.contains("S3CRET"));
    }

    #[test]
    fn test_condition_around_loop_keeps_loop_output() {
        let mut memory = MemoryStore::default();
        memory.set("on", json!(true), MemoryMode::Session).unwrap();

        let result = expand(
            &mut memory,
            "{{#if memory.on.value}}[{{#for 2}}{{#increment}}{{/for}}]{{else}}off{{/if}}",
        );

        assert_eq!(result.html, "[01]");
    }

    #[test]
    fn test_inline_failure_substitutes_empty() {
        let mut memory = MemoryStore::default();
        let result = expand(&mut memory, "x{{memory.missing.value}}y");
        assert_eq!(result.html, "xy");
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_deferred_resolution_escapes_plain_tags() {
        let scope = MapScope::new()
            .with("name", json!("say \"hi\""))
            .with("user", json!({"id": 1}));

        let (text, warnings) = resolve_deferred(
            r#"{"q":"{{!name}}","u":"{{!^user}}","keep":"{{other}}","bad":"{{!^nope}}"}"#,
            &scope,
        );

        assert_eq!(
            text,
            r#"{"q":"say \"hi\"","u":{"id":1},"keep":"{{other}}","bad":null}"#
        );
        assert_eq!(warnings.len(), 1);
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["q"], json!("say \"hi\""));
    }
}
