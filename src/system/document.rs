// src/system/document.rs

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // An opening tag with its attribute list, e.g. `<button id="go" disabled>`.
    static ref OPEN_TAG_RE: Regex = Regex::new(
        r#"<([A-Za-z][A-Za-z0-9-]*)((?:\s+[^\s=/>]+(?:\s*=\s*(?:"[^"]*"|'[^']*'|[^\s>]+))?)*)\s*(/?)>"#
    )
    .expect("valid regex");
    static ref ATTRIBUTE_RE: Regex =
        Regex::new(r#"([^\s=/>]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+)))?"#).expect("valid regex");
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

/// The page the engine renders into. Implemented over the real DOM by browser hosts and by
/// [`VirtualDocument`] everywhere else.
pub trait Document: Send {
    /// Serialized markup of the whole document.
    fn html(&self) -> String;
    fn contains(&self, selector: &str) -> bool;
    fn inner_html(&self, selector: &str) -> Option<String>;
    fn set_inner_html(&mut self, selector: &str, html: &str) -> bool;
    fn append_html(&mut self, selector: &str, html: &str) -> bool;
    fn set_attribute(&mut self, selector: &str, name: &str, value: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Selector {
    Id(String),
    Tag(String),
    Attribute { name: String, value: Option<String> },
}

impl Selector {
    fn parse(selector: &str) -> Option<Self> {
        let selector = selector.trim();
        if let Some(id) = selector.strip_prefix('#') {
            return (!id.is_empty()).then(|| Self::Id(id.to_string()));
        }
        if let Some(inner) = selector.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            return Some(match inner.split_once('=') {
                Some((name, value)) => Self::Attribute {
                    name: name.trim().to_string(),
                    value: Some(
                        value
                            .trim()
                            .trim_matches(|c| c == '"' || c == '\'')
                            .to_string(),
                    ),
                },
                None => Self::Attribute {
                    name: inner.trim().to_string(),
                    value: None,
                },
            });
        }
        selector
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
            .then(|| Self::Tag(selector.to_ascii_lowercase()))
            .filter(|_| !selector.is_empty())
    }

    fn matches(&self, tag: &str, attributes: &[(String, String)]) -> bool {
        let attribute = |name: &str| {
            attributes
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        };
        match self {
            Self::Id(id) => attribute("id") == Some(id.as_str()),
            Self::Tag(name) => tag.eq_ignore_ascii_case(name),
            Self::Attribute { name, value } => match value {
                Some(expected) => attribute(name) == Some(expected.as_str()),
                None => attribute(name).is_some(),
            },
        }
    }
}

/// Byte ranges of one element inside the document markup.
#[derive(Debug, Clone, Copy)]
struct ElementSpan {
    open_start: usize,
    open_end: usize,
    inner_start: usize,
    inner_end: usize,
}

fn parse_attributes(text: &str) -> Vec<(String, String)> {
    ATTRIBUTE_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().to_string();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            Some((name, value))
        })
        .collect()
}

/// A markup-string backed document. Elements are located by scanning opening tags and
/// balancing same-name closing tags; it is not an HTML parser, but it is enough for
/// placeholders, include sources and render targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualDocument {
    markup: String,
}

impl VirtualDocument {
    pub fn new() -> Self {
        Self::from_html("<body></body>")
    }

    pub fn from_html(html: impl Into<String>) -> Self {
        Self {
            markup: html.into(),
        }
    }

    /// Value of `name` on the first element matching `selector`.
    pub fn attribute(&self, selector: &str, name: &str) -> Option<String> {
        let span = self.find(selector)?;
        let caps = OPEN_TAG_RE.captures(&self.markup[span.open_start..span.open_end])?;
        parse_attributes(caps.get(2).map_or("", |m| m.as_str()))
            .into_iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    fn find(&self, selector: &str) -> Option<ElementSpan> {
        let selector = Selector::parse(selector)?;
        for caps in OPEN_TAG_RE.captures_iter(&self.markup) {
            let whole = caps.get(0)?;
            let tag = caps.get(1)?.as_str();
            let attributes = parse_attributes(caps.get(2).map_or("", |m| m.as_str()));
            if !selector.matches(tag, &attributes) {
                continue;
            }
            let self_closing = caps.get(3).is_some_and(|m| !m.as_str().is_empty());
            if self_closing || VOID_ELEMENTS.contains(&tag.to_ascii_lowercase().as_str()) {
                return Some(ElementSpan {
                    open_start: whole.start(),
                    open_end: whole.end(),
                    inner_start: whole.end(),
                    inner_end: whole.end(),
                });
            }
            let inner_end = self.closing_tag_start(tag, whole.end());
            return Some(ElementSpan {
                open_start: whole.start(),
                open_end: whole.end(),
                inner_start: whole.end(),
                inner_end,
            });
        }
        None
    }

    /// Start of the closing tag balancing an element named `tag` opened before `from`.
    /// Unclosed elements extend to the end of the document.
    fn closing_tag_start(&self, tag: &str, from: usize) -> usize {
        let Ok(tag_re) = Regex::new(&format!(r"(?i)<(/?){}\b[^>]*?(/?)>", regex::escape(tag)))
        else {
            return self.markup.len();
        };
        let mut depth = 1usize;
        for caps in tag_re.captures_iter(&self.markup[from..]) {
            let Some(whole) = caps.get(0) else { continue };
            let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
            let self_closing = caps.get(2).is_some_and(|m| !m.as_str().is_empty());
            if closing {
                depth -= 1;
                if depth == 0 {
                    return from + whole.start();
                }
            } else if !self_closing {
                depth += 1;
            }
        }
        self.markup.len()
    }
}

impl Default for VirtualDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl Document for VirtualDocument {
    fn html(&self) -> String {
        self.markup.clone()
    }

    fn contains(&self, selector: &str) -> bool {
        self.find(selector).is_some()
    }

    fn inner_html(&self, selector: &str) -> Option<String> {
        let span = self.find(selector)?;
        Some(self.markup[span.inner_start..span.inner_end].to_string())
    }

    fn set_inner_html(&mut self, selector: &str, html: &str) -> bool {
        match self.find(selector) {
            Some(span) => {
                self.markup
                    .replace_range(span.inner_start..span.inner_end, html);
                true
            }
            None => false,
        }
    }

    fn append_html(&mut self, selector: &str, html: &str) -> bool {
        match self.find(selector) {
            Some(span) => {
                self.markup.insert_str(span.inner_end, html);
                true
            }
            None => false,
        }
    }

    fn set_attribute(&mut self, selector: &str, name: &str, value: &str) -> bool {
        let Some(span) = self.find(selector) else {
            return false;
        };
        let open_tag = &self.markup[span.open_start..span.open_end];
        let Some(caps) = OPEN_TAG_RE.captures(open_tag) else {
            return false;
        };
        let tag = caps.get(1).map_or("", |m| m.as_str()).to_string();
        let self_closing = caps.get(3).is_some_and(|m| !m.as_str().is_empty());
        let mut attributes = parse_attributes(caps.get(2).map_or("", |m| m.as_str()));
        match attributes
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(existing) => existing.1 = value.to_string(),
            None => attributes.push((name.to_string(), value.to_string())),
        }

        let mut rebuilt = format!("<{}", tag);
        for (n, v) in &attributes {
            rebuilt.push_str(&format!(" {}=\"{}\"", n, v.replace('"', "&quot;")));
        }
        rebuilt.push_str(if self_closing { " />" } else { ">" });
        self.markup
            .replace_range(span.open_start..span.open_end, &rebuilt);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page() -> VirtualDocument {
        VirtualDocument::from_html(
            r#"<body><div id="main"><div class="x">inner</div><p>tail</p></div><template id="row"><li>{{#loop0}}</li></template><button data-queueable="4">Go</button><input id="name" /></body>"#,
        )
    }

    #[test]
    fn test_inner_html_balances_nested_same_tags() {
        let doc = page();
        assert_eq!(
            doc.inner_html("#main").as_deref(),
            Some(r#"<div class="x">inner</div><p>tail</p>"#)
        );
        assert_eq!(doc.inner_html("#row").as_deref(), Some("<li>{{#loop0}}</li>"));
        assert_eq!(doc.inner_html("#name").as_deref(), Some(""));
    }

    #[test]
    fn test_selector_forms() {
        let doc = page();
        assert!(doc.contains("[data-queueable=\"4\"]"));
        assert!(doc.contains("[data-queueable='4']"));
        assert!(doc.contains("[data-queueable]"));
        assert!(doc.contains("button"));
        assert!(!doc.contains("#missing"));
        assert!(!doc.contains("[data-queueable=\"5\"]"));
    }

    #[test]
    fn test_set_and_append_inner_html() {
        let mut doc = VirtualDocument::new();
        assert!(doc.set_inner_html("body", "<ul id=\"list\"></ul>"));
        assert!(doc.append_html("#list", "<li>a</li>"));
        assert!(doc.append_html("#list", "<li>b</li>"));
        assert_eq!(doc.html(), "<body><ul id=\"list\"><li>a</li><li>b</li></ul></body>");
        assert!(!doc.append_html("#nope", "x"));
    }

    #[test]
    fn test_set_attribute_rewrites_open_tag() {
        let mut doc = page();
        assert!(doc.set_attribute("[data-queueable=\"4\"]", "disabled", "disabled"));
        assert_eq!(
            doc.attribute("[data-queueable=\"4\"]", "disabled").as_deref(),
            Some("disabled")
        );
        assert!(doc.html().contains(r#"<button data-queueable="4" disabled="disabled">Go</button>"#));
    }
}
