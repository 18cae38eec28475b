//! LPML — the tag-based markup every context speaks.
//!
//! An LPML document is plain text interleaved with XML-like tags:
//!
//! ```text
//! Let me look first. <list_files path="."/>
//! <send to="parent">Found `<b>` in the output</send>
//! ```
//!
//! Parsing is deliberately forgiving: model output is often slightly
//! malformed, so unmatched or unclosed tags produce a `warn!` diagnostic and a
//! best-effort tree instead of an error. Backtick spans are opaque: nothing
//! between a pair of backticks is ever interpreted as a tag.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use tracing::warn;

// ─────────────────────────────────────────────
// Patterns
// ─────────────────────────────────────────────

/// Attribute names exclude whitespace, quotes, `/`, `<`, `>` and `=`.
const ATTRIBUTE: &str = r#"([^"'/<>\s=]+)=(?:"([^"]*)"|'([^']*)')"#;

/// Closing tag, or opening tag with optional attributes and a trailing `/`
/// for the self-closing form.
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"<(?:/(?P<close>[^/>\s]+)\s*>|(?P<open>[^/>\s]+)(?P<attrs>(?:\s+[^"'/<>\s=]+=(?:"[^"]*"|'[^']*'))*)\s*(?P<empty>/)?>)"#,
    )
    .expect("tag pattern is valid")
});

static ATTRIBUTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(ATTRIBUTE).expect("attribute pattern is valid"));

static BACKTICK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)`.*?`").expect("backtick pattern is valid"));

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__PROTECTED_[0-9a-f]{32}__").expect("placeholder pattern is valid")
});

// ─────────────────────────────────────────────
// Data model
// ─────────────────────────────────────────────

/// Ordered attribute map. Insertion order is preserved so that a parsed
/// element deparses back to the same text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Look up a value by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or overwrite. An overwritten key keeps its original position.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let idx = self.0.iter().position(|(k, _)| k == key)?;
        Some(self.0.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut attrs = Attributes::new();
        for (k, v) in iter {
            attrs.insert(k, v);
        }
        attrs
    }
}

/// A node of an LPML tree: literal text or a tagged element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    Text(String),
    Element(Element),
}

impl From<Element> for Node {
    fn from(element: Element) -> Self {
        Node::Element(element)
    }
}

impl From<&str> for Node {
    fn from(text: &str) -> Self {
        Node::Text(text.to_string())
    }
}

impl From<String> for Node {
    fn from(text: String) -> Self {
        Node::Text(text)
    }
}

/// A parsed document: an ordered sequence of nodes.
pub type Tree = Vec<Node>;

/// A tagged element. `content == None` is a self-closing tag (`<tag/>`),
/// which is distinct from an element with empty content (`<tag></tag>`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Element {
    pub tag: String,
    pub attributes: Attributes,
    pub content: Option<Tree>,
}

impl Element {
    /// A paired element with empty content.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attributes: Attributes::new(),
            content: Some(Vec::new()),
        }
    }

    /// A self-closing element.
    pub fn empty(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attributes: Attributes::new(),
            content: None,
        }
    }

    /// A paired element wrapping a single text node.
    pub fn with_text(tag: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(tag).child(Node::Text(text.into()))
    }

    /// Builder: set an attribute.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key, value);
        self
    }

    /// Builder: append a child node, turning a self-closing element into a
    /// paired one.
    pub fn child(mut self, node: impl Into<Node>) -> Self {
        self.content.get_or_insert_with(Vec::new).push(node.into());
        self
    }

    pub fn get_attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key)
    }

    /// Deparsed content, or an empty string for a self-closing element.
    pub fn text(&self) -> String {
        self.content.as_deref().map(deparse).unwrap_or_default()
    }

    /// Direct child elements (text nodes skipped).
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.content.iter().flatten().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First direct child element with the given tag.
    pub fn find_child(&self, tag: &str) -> Option<&Element> {
        self.children().find(|e| e.tag == tag)
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&deparse_element(self))
    }
}

// ─────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────

/// Options for [`parse_with`].
#[derive(Clone, Debug, Default)]
pub struct ParseOptions<'a> {
    /// Trim every literal text run and drop runs that become empty.
    pub strip: bool,
    /// Tags whose body is kept verbatim as one text node.
    pub exclude: &'a [String],
}

/// Parse LPML text with default options (no stripping, no excluded tags).
pub fn parse(text: &str) -> Tree {
    parse_with(text, &ParseOptions::default())
}

/// Parse LPML text.
///
/// Never fails, and never repairs the input. An unmatched closing tag is
/// kept as literal text at the current nesting level. An element still
/// open at end of input stays attached where it was opened, holding
/// everything that followed it. Both cases log a warning.
pub fn parse_with(text: &str, options: &ParseOptions<'_>) -> Tree {
    let (text, protected) = protect_backticks(text);

    let mut parser = Parser {
        strip: options.strip,
        root: Vec::new(),
        stack: Vec::new(),
    };

    let mut cursor = 0;
    let mut excluding: Option<String> = None;

    for caps in TAG_RE.captures_iter(&text) {
        let Some(whole) = caps.get(0) else { continue };

        if let Some(name) = &excluding {
            match caps.name("close") {
                Some(close) if close.as_str() == name => excluding = None,
                _ => continue,
            }
        }

        parser.push_text(&text[cursor..whole.start()]);
        cursor = whole.end();

        if let Some(close) = caps.name("close") {
            parser.close(close.as_str(), whole.as_str());
            continue;
        }

        let Some(open) = caps.name("open") else { continue };
        let name = open.as_str().to_string();
        let attributes = parse_attributes(caps.name("attrs").map_or("", |m| m.as_str()));

        if caps.name("empty").is_some() {
            parser.append(Node::Element(Element {
                tag: name,
                attributes,
                content: None,
            }));
        } else {
            if options.exclude.iter().any(|t| *t == name) {
                excluding = Some(name.clone());
            }
            parser.stack.push(Element {
                tag: name,
                attributes,
                content: Some(Vec::new()),
            });
        }
    }

    parser.push_text(&text[cursor..]);

    if !parser.stack.is_empty() {
        let remaining: Vec<&str> = parser.stack.iter().map(|e| e.tag.as_str()).collect();
        warn!(tags = ?remaining, "LPML: unclosed elements remain");
    }

    let mut tree = parser.finish();
    if !protected.is_empty() {
        restore_tree(&mut tree, &protected);
    }
    tree
}

struct Parser {
    strip: bool,
    root: Tree,
    /// Open elements, innermost last.
    stack: Vec<Element>,
}

impl Parser {
    fn append(&mut self, node: Node) {
        match self.stack.last_mut() {
            Some(open) => open.content.get_or_insert_with(Vec::new).push(node),
            None => self.root.push(node),
        }
    }

    fn push_text(&mut self, raw: &str) {
        let text = if self.strip { raw.trim() } else { raw };
        if !text.is_empty() {
            self.append(Node::Text(text.to_string()));
        }
    }

    /// Pop back to the nearest open element named `name`, implicitly
    /// closing everything opened after it.
    fn close(&mut self, name: &str, literal: &str) {
        let Some(idx) = self.stack.iter().rposition(|e| e.tag == name) else {
            warn!(tag = name, "LPML: unmatched closing tag");
            self.append(Node::Text(literal.to_string()));
            return;
        };
        while self.stack.len() > idx {
            self.pop();
        }
    }

    fn pop(&mut self) {
        if let Some(done) = self.stack.pop() {
            self.append(Node::Element(done));
        }
    }

    fn finish(mut self) -> Tree {
        while !self.stack.is_empty() {
            self.pop();
        }
        self.root
    }
}

fn parse_attributes(text: &str) -> Attributes {
    ATTRIBUTE_RE
        .captures_iter(text)
        .map(|caps: Captures<'_>| {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map_or("", |m| m.as_str());
            (caps[1].to_string(), value.to_string())
        })
        .collect()
}

/// Replace every backtick span (delimiters included) with a unique
/// placeholder so its content is never scanned for tags.
fn protect_backticks(text: &str) -> (String, HashMap<String, String>) {
    let mut protected = HashMap::new();
    let replaced = BACKTICK_RE.replace_all(text, |caps: &Captures<'_>| {
        let placeholder = format!("__PROTECTED_{}__", uuid::Uuid::new_v4().simple());
        protected.insert(placeholder.clone(), caps[0].to_string());
        placeholder
    });
    (replaced.into_owned(), protected)
}

fn restore(text: &str, protected: &HashMap<String, String>) -> String {
    PLACEHOLDER_RE
        .replace_all(text, |caps: &Captures<'_>| {
            protected
                .get(&caps[0])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn restore_tree(tree: &mut Tree, protected: &HashMap<String, String>) {
    for node in tree.iter_mut() {
        match node {
            Node::Text(text) => *text = restore(text, protected),
            Node::Element(element) => {
                for (_, value) in element.attributes.0.iter_mut() {
                    *value = restore(value, protected);
                }
                if let Some(content) = element.content.as_mut() {
                    restore_tree(content, protected);
                }
            }
        }
    }
}

// ─────────────────────────────────────────────
// Serialization
// ─────────────────────────────────────────────

/// Render a tree back to LPML text.
pub fn deparse(tree: &[Node]) -> String {
    let mut out = String::new();
    for node in tree {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Element(element) => out.push_str(&deparse_element(element)),
        }
    }
    out
}

fn deparse_element(element: &Element) -> String {
    let mut open = format!("<{}", element.tag);
    for (key, value) in element.attributes.iter() {
        // A value holding a double quote can only round-trip single-quoted.
        if value.contains('"') {
            open.push_str(&format!(" {key}='{value}'"));
        } else {
            open.push_str(&format!(" {key}=\"{value}\""));
        }
    }
    match &element.content {
        None => format!("{open}/>"),
        Some(content) => format!("{open}>{}</{}>", deparse(content), element.tag),
    }
}

// ─────────────────────────────────────────────
// Search
// ─────────────────────────────────────────────

/// Every element with `tag` at any depth, in document (pre-order) order.
pub fn findall<'a>(tree: &'a [Node], tag: &str) -> Vec<&'a Element> {
    let mut found = Vec::new();
    collect(tree, tag, &mut found);
    found
}

fn collect<'a>(tree: &'a [Node], tag: &str, found: &mut Vec<&'a Element>) {
    for node in tree {
        if let Node::Element(element) = node {
            if element.tag == tag {
                found.push(element);
            }
            if let Some(content) = &element.content {
                collect(content, tag, found);
            }
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
