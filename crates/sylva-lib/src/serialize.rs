//! Serialization of node-trees: S-expressions, SXML, XML, JSON, and an
//! indented text-tree outline.
//!
//! The S-expression and XML serializers share a line-based tree renderer
//! that is parameterized over opening/closing strings and a data filter.
//! Builder-pattern printers ([`SxprPrinter`], [`XmlPrinter`]) expose the
//! serialization options; `Node::as_sxpr()` and friends are shorthands
//! with the default options.

use std::cell::RefCell;
use std::collections::HashSet;

use serde_json::{json, Value};
use thiserror::Error as ThisError;

use sylva_core::{line_col, linebreaks};

use crate::config::{with_config, AttrErrorPolicy};
use crate::node::{Node, Path, CHAR_REF_PTYPE, ENTITY_REF_PTYPE, LEAF_PTYPES};
use crate::root::RootNode;

/// Failures of the serializers.
#[derive(Debug, ThisError)]
pub enum SerializeError {
    #[error("empty element \"{name}\" has content \"{content}\"; use strict_mode=false to suppress")]
    NonEmptyEmptyTag { name: String, content: String },
    #[error("ill-formed XML attribute value {0:?}")]
    IllformedAttribute(String),
    #[error("unknown serialization format \"{0}\"")]
    UnknownFormat(String),
    #[error("position {0} lies outside of the serialization")]
    PositionOutOfRange(usize),
    #[error("position cannot be mapped onto the pure string content of a formatted serialization")]
    UnmappablePosition,
}

// tag name sanitization //////////////////////////////////////////////////

/// Cleans anonymous tag-names for serialization, so that the leading colon
/// does not lead to invalid XML: `:Series` becomes `Series__`.
pub fn xml_tag_name(tag_name: &str) -> String {
    match tag_name.strip_prefix(':') {
        Some(rest) => format!("{}__", rest),
        None => tag_name.to_string(),
    }
}

/// Reverts [`xml_tag_name`]: both `Series__` and `ANONYMOUS_Series__`
/// restore to `:Series`.
pub fn restore_tag_name(tag_name: &str) -> String {
    if let Some(stem) = tag_name.strip_suffix("__") {
        if let Some(rest) = stem.strip_prefix("ANONYMOUS_") {
            return format!(":{}", rest);
        }
        if let Some(rest) = stem.strip_prefix("__") {
            return format!(":{}", rest);
        }
        return format!(":{}", stem);
    }
    tag_name.to_string()
}

// string-level flatteners ////////////////////////////////////////////////

fn collapse_blank_runs(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_blank = false;
    for c in s.chars() {
        if c == ' ' {
            if !last_blank {
                out.push(c);
            }
            last_blank = true;
        } else {
            out.push(c);
            last_blank = false;
        }
    }
    out
}

/// Returns the S-expression as a one-liner without unnecessary
/// whitespace. If the flattened expression exceeds `threshold` (for a
/// positive threshold), the original is returned trimmed; a negative
/// threshold flattens unconditionally; a threshold of zero disables
/// flattening altogether.
pub fn flatten_sxpr(sxpr: &str, threshold: i32) -> String {
    if threshold == 0 {
        return sxpr.to_string();
    }
    // newline plus indentation becomes a single blank
    let mut joined = String::with_capacity(sxpr.len());
    let mut chars = sxpr.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\n' {
            while chars.peek().is_some_and(|w| w.is_whitespace()) {
                chars.next();
            }
            joined.push(' ');
        } else {
            joined.push(c);
        }
    }
    // drop the whitespace immediately preceding a closing bracket
    let mut flat = String::with_capacity(joined.len());
    for c in joined.chars() {
        if c == ')' && flat.ends_with([' ', '\t']) {
            flat.pop();
        }
        flat.push(c);
    }
    let flat = flat.trim();
    // collapse runs of blanks outside of string literals
    let parts: Vec<&str> = flat.split('"').collect();
    let flat = if parts.len() > 1 {
        parts
            .iter()
            .enumerate()
            .map(|(i, part)| {
                if i % 2 == 0 {
                    collapse_blank_runs(part)
                } else {
                    part.to_string()
                }
            })
            .collect::<Vec<String>>()
            .join("\"")
    } else {
        collapse_blank_runs(flat)
    };
    if threshold > 0 && flat.len() > threshold as usize {
        return sxpr.trim().to_string();
    }
    flat
}

/// Returns an XML-tree as a one-liner; only whitespace within leaf nodes
/// is preserved.
pub fn flatten_xml(xml: &str) -> String {
    // drop whitespace after closing tags
    let rx_closing = regex::Regex::new(r"(</:?\w+>)\s+").unwrap();
    let stage1 = rx_closing.replace_all(xml, "$1");
    // drop whitespace before opening tags
    let rx_opening = regex::Regex::new(r"\s+<([\w:])").unwrap();
    rx_opening.replace_all(&stage1, "<$1").into_owned()
}

/// Substitutes `&` (except in well-formed entities), `<` and `>` in
/// XML text content by the respective character references.
fn escape_xml_text(content: &str) -> String {
    let bytes = content.as_bytes();
    let mut out = String::with_capacity(content.len());
    for (idx, c) in content.char_indices() {
        match c {
            '&' => {
                // keep character and entity references intact
                let rest = &bytes[idx + 1..];
                let mut j = 0;
                if rest.first() == Some(&b'#') {
                    j = 1;
                }
                let start = j;
                while j < rest.len() && (rest[j].is_ascii_alphanumeric() || rest[j] == b'_') {
                    j += 1;
                }
                if j > start && rest.get(j) == Some(&b';') {
                    out.push('&');
                } else {
                    out.push_str("&amp;");
                }
            }
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

// the shared line-based tree renderer ////////////////////////////////////

struct ReprOps<'a> {
    tab: String,
    density: u8,
    allow_omissions: bool,
    open: Box<dyn Fn(&Node) -> String + 'a>,
    close: Box<dyn Fn(&Node) -> String + 'a>,
    data: Box<dyn Fn(&str) -> String + 'a>,
    inline: Box<dyn Fn(&Node) -> bool + 'a>,
}

fn tree_repr(node: &Node, ops: &ReprOps, inline_in: bool, depth: i32) -> Vec<String> {
    let head = (ops.open)(node);
    let tail = (ops.close)(node);

    let switching = !inline_in && (ops.inline)(node);
    let inline = inline_in || switching;
    let indent = ops.tab.repeat(depth.max(0) as usize);
    let usetab = if inline {
        if switching {
            indent
        } else {
            String::new()
        }
    } else {
        indent
    };
    let hlf = !inline;
    let tlf = !inline && (ops.density == 0 || tail.starts_with('<'));

    if node.is_empty() {
        return vec![format!("{}{}{}", usetab, head, tail)];
    }

    let mut content: Vec<String>;
    if node.has_children() {
        content = if head.is_empty() {
            Vec::new()
        } else {
            vec![format!("{}{}", usetab, head)]
        };
        for child in node.children() {
            let subtree = tree_repr(&child, ops, inline, depth + 1);
            if !subtree.is_empty() {
                if inline {
                    content.push(subtree.join("\n"));
                } else {
                    content.extend(subtree);
                }
            }
        }
        if inline {
            content.push(tail);
            content = vec![content.concat()];
        } else if tlf {
            content.push(format!("{}{}", usetab, tail));
        } else {
            match content.last_mut() {
                Some(last) => last.push_str(&tail),
                None => content.push(format!("{}{}", usetab, tail)),
            }
        }
    } else {
        let mut res = node.content();
        if !inline && head.is_empty() && ops.allow_omissions {
            // strip whitespace for omitted non-inline nodes, e.g. text
            // runs in mixed-content elements
            res = res.trim().to_string();
        }
        if ops.density & 1 == 1 && !res.contains('\n') {
            let gap = if !inline
                && !head.is_empty()
                && head != "&"
                && head != "&#x"
                && !head.ends_with('>')
                && head != "<!--"
            {
                " "
            } else if inline && head.starts_with('(') {
                " "
            } else {
                ""
            };
            content = vec![format!(
                "{}{}{}{}{}",
                usetab,
                head,
                gap,
                (ops.data)(&res),
                tail
            )];
        } else {
            let lines: Vec<String> = res.split('\n').map(|s| (ops.data)(s)).collect();
            let n = lines.len();
            let mut i = 0usize;
            let mut k = n as isize - 1;
            if !inline && ops.allow_omissions {
                while i < n && lines[i].is_empty() {
                    i += 1;
                }
                while k >= 0 && lines[k as usize].is_empty() {
                    k -= 1;
                }
            }
            let tb = format!(
                "{}{}",
                usetab,
                if switching || !inline { ops.tab.as_str() } else { "" }
            );
            content = if hlf {
                vec![format!("{}{}", usetab, head), tb.clone()]
            } else {
                vec![format!("{}{}", usetab, head)]
            };
            if (i as isize) <= k {
                for line in &lines[i..k as usize] {
                    content.last_mut().unwrap().push_str(line);
                    content.push(tb.clone());
                }
                content.last_mut().unwrap().push_str(&lines[k as usize]);
            }
            if tlf {
                content.push(format!("{}{}", usetab, tail));
            } else {
                content.last_mut().unwrap().push_str(&tail);
            }
        }
    }
    content
}

// S-expressions //////////////////////////////////////////////////////////

/// Encloses `s` with the kind of quotation marks that avoids escaping
/// where possible.
fn pretty_quote(s: &str) -> String {
    if !s.contains('"') {
        format!("\"{}\"", s)
    } else if !s.contains('\'') {
        format!("'{}'", s)
    } else {
        format!("\"{}\"", s.replace('"', "\\\""))
    }
}

/// Builder for serializing a tree as S-expression (or SXML).
pub struct SxprPrinter<'a> {
    node: &'a Node,
    root: Option<&'a RootNode>,
    src: Option<&'a str>,
    indentation: usize,
    compact: bool,
    flatten_threshold: i32,
    sxml: u8,
}

impl<'a> SxprPrinter<'a> {
    pub fn new(node: &'a Node) -> Self {
        SxprPrinter {
            node,
            root: None,
            src: None,
            indentation: 2,
            compact: true,
            flatten_threshold: 92,
            sxml: 0,
        }
    }

    /// Makes error locations available; errors then appear as `err`
    /// pseudo-attributes on the nodes they are attached to.
    pub fn root(mut self, root: &'a RootNode) -> Self {
        self.root = Some(root);
        self
    }

    /// With the source text, positions are reported as `line:column pos`;
    /// with an empty string, only initialized `pos` values are reported.
    pub fn src(mut self, src: &'a str) -> Self {
        self.src = Some(src);
        self
    }

    pub fn indentation(mut self, indentation: usize) -> Self {
        self.indentation = indentation;
        self
    }

    /// With `compact` unset, closing brackets move onto their own lines.
    pub fn compact(mut self, compact: bool) -> Self {
        self.compact = compact;
        self
    }

    /// Maximum length up to which the result is flattened into a single
    /// line; negative always flattens, zero never.
    pub fn flatten_threshold(mut self, threshold: i32) -> Self {
        self.flatten_threshold = threshold;
        self
    }

    /// Renders attributes by the SXML convention `(@ (key "value") …)`;
    /// level 2 always emits the attribute node, even if empty.
    pub fn sxml(mut self, level: u8) -> Self {
        assert!(level <= 2);
        self.sxml = level;
        self
    }

    pub fn render(&self) -> String {
        let ops = self.repr_ops();
        let rendered = tree_repr(self.node, &ops, false, 0).join("\n");
        flatten_sxpr(&rendered, self.flatten_threshold)
    }

    fn repr_ops(&self) -> ReprOps<'a> {
        let sxml = self.sxml;
        let src = self.src;
        let root = self.root;
        let lbreaks = src
            .filter(|s| !s.is_empty())
            .map(linebreaks);

        let attr = move |key: &str, value: &str| -> String {
            if sxml > 0 {
                format!(" ({} \"{}\")", key, value)
            } else {
                format!(" `({} \"{}\")", key, value)
            }
        };

        let open = move |node: &Node| -> String {
            let mut txt = format!("({}", node.name());
            let has_attrs = node.has_attr();
            let render_pos = node.pos_opt().is_some() && src.is_some();
            let node_errors = root
                .map(|r| r.node_errors(node))
                .filter(|errors| !errors.is_empty());
            let show_attrs = has_attrs || render_pos || node_errors.is_some();
            if show_attrs || sxml >= 2 {
                if sxml > 0 {
                    txt.push_str(" (@");
                }
                if has_attrs {
                    for (k, v) in node.attrs() {
                        txt.push_str(&attr(&k, &v));
                    }
                }
                if render_pos {
                    let pos = node.pos_opt().unwrap_or(0);
                    match &lbreaks {
                        Some(lb) => {
                            let (line, col) = line_col(lb, pos);
                            if sxml > 0 {
                                txt.push_str(&format!(" (pos \"{}:{} {}\")", line, col, pos));
                            } else {
                                txt.push_str(&format!(" `(pos {} {}  {})", line, col, pos));
                            }
                        }
                        None => {
                            if sxml > 0 {
                                txt.push_str(&format!(" (pos \"{}\")", pos));
                            } else {
                                txt.push_str(&format!(" `(pos {})", pos));
                            }
                        }
                    }
                }
                if let Some(errors) = node_errors {
                    if !node.has_attr_named("err") {
                        let err_str = errors
                            .iter()
                            .map(|e| e.to_string())
                            .collect::<Vec<String>>()
                            .join(";  ")
                            .replace('"', "\\\"");
                        if !err_str.is_empty() {
                            txt.push_str(&attr("err", &err_str));
                        }
                    }
                }
                if sxml > 0 {
                    txt.push(')');
                }
            }
            txt
        };

        ReprOps {
            tab: " ".repeat(self.indentation),
            density: if self.compact { 1 } else { 0 },
            allow_omissions: false,
            open: Box::new(open),
            close: Box::new(|_| ")".to_string()),
            data: Box::new(|s| pretty_quote(s)),
            inline: Box::new(|_| false),
        }
    }

    /// Renders a single-line serialization together with a mapping from
    /// offsets in the serialization back to the producing nodes.
    pub fn render_mapped(&self) -> (String, SerializationMapping) {
        let ops = self.repr_ops();
        let mut out = String::new();
        let mut entries = Vec::new();
        let mut path = Vec::new();
        write_inline(self.node, &ops, &mut out, &mut entries, &mut path, true, false);
        let mapping = SerializationMapping {
            serialization: out.clone(),
            is_xml: false,
            entries,
        };
        (out, mapping)
    }
}

// XML ////////////////////////////////////////////////////////////////////

fn quote_attr_value(value: &str) -> String {
    if value.contains('"') {
        format!("'{}'", value)
    } else {
        format!("\"{}\"", value)
    }
}

fn filter_attr_value(value: &str, policy: AttrErrorPolicy) -> String {
    match policy {
        AttrErrorPolicy::Fail => format!("\"{}\"", value),
        AttrErrorPolicy::Fix => format!(
            "\"{}\"",
            value
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;")
                .replace('"', "&quot;")
        ),
        AttrErrorPolicy::Lxml => format!(
            "\"{}\"",
            value.replace(['&', '<', '>', '"'], "?")
        ),
        AttrErrorPolicy::Ignore => quote_attr_value(value),
    }
}

/// Builder for serializing a tree as XML.
pub struct XmlPrinter<'a> {
    node: &'a Node,
    root: Option<&'a RootNode>,
    src: Option<&'a str>,
    indentation: usize,
    inline_tags: HashSet<String>,
    string_tags: HashSet<String>,
    empty_tags: Option<HashSet<String>>,
    strict_mode: bool,
}

impl<'a> XmlPrinter<'a> {
    pub fn new(node: &'a Node) -> Self {
        XmlPrinter {
            node,
            root: None,
            src: None,
            indentation: 2,
            inline_tags: HashSet::new(),
            string_tags: LEAF_PTYPES.iter().map(|s| s.to_string()).collect(),
            empty_tags: None,
            strict_mode: true,
        }
    }

    /// Uses the root's serialization hints (inline/string/empty tags) and
    /// makes error locations available as `err` attributes.
    pub fn root(mut self, root: &'a RootNode) -> Self {
        self.root = Some(root);
        self.inline_tags = root.inline_tags.clone();
        self.string_tags = root.string_tags.clone();
        if !root.empty_tags.is_empty() {
            self.empty_tags = Some(root.empty_tags.clone());
        }
        self
    }

    /// With the source text, positions are also reported as `line`/`col`
    /// attributes; with an empty string, as `_pos` attributes.
    pub fn src(mut self, src: &'a str) -> Self {
        self.src = Some(src);
        self
    }

    pub fn indentation(mut self, indentation: usize) -> Self {
        self.indentation = indentation;
        self
    }

    /// Tag names the content of which is always rendered on a single line.
    pub fn inline_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Self {
        self.inline_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Tag names of which only the content is printed (mixed content).
    pub fn string_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Self {
        self.string_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Tag names rendered as empty elements, e.g. `<br/>`. Without this,
    /// the always-empty tag names of the tree are detected automatically.
    pub fn empty_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Self {
        self.empty_tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// In strict mode, stylistic or interoperability violations (e.g. a
    /// tag name used both empty and non-empty) fail the serialization.
    pub fn strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn render(&self) -> Result<String, SerializeError> {
        let empty_tags = self.resolved_empty_tags();
        let policy = with_config(|c| c.xml_attribute_error_handling);
        self.validate(&empty_tags, policy)?;
        let empty_tags = RefCell::new(empty_tags);
        let ops = self.repr_ops(&empty_tags, policy);
        let depth = if self.node.has_name(":XML") { -1 } else { 0 };
        Ok(tree_repr(self.node, &ops, false, depth).join("\n"))
    }

    /// Renders a single-line serialization together with a mapping from
    /// offsets in the serialization back to the producing nodes.
    pub fn render_mapped(&self) -> Result<(String, SerializationMapping), SerializeError> {
        let empty_tags = self.resolved_empty_tags();
        let policy = with_config(|c| c.xml_attribute_error_handling);
        self.validate(&empty_tags, policy)?;
        let empty_tags = RefCell::new(empty_tags);
        let ops = self.repr_ops(&empty_tags, policy);
        let mut out = String::new();
        let mut entries = Vec::new();
        let mut path = Vec::new();
        write_inline(self.node, &ops, &mut out, &mut entries, &mut path, false, false);
        let mapping = SerializationMapping {
            serialization: out.clone(),
            is_xml: true,
            entries,
        };
        Ok((out, mapping))
    }

    fn resolved_empty_tags(&self) -> HashSet<String> {
        match &self.empty_tags {
            Some(tags) => tags.clone(),
            None => self.node.collect_empty_tags(),
        }
    }

    fn validate(
        &self,
        empty_tags: &HashSet<String>,
        policy: AttrErrorPolicy,
    ) -> Result<(), SerializeError> {
        for node in self.node.walk_tree(true, false) {
            let name = node.name();
            if self.strict_mode
                && empty_tags.contains(&name)
                && !name.starts_with('?')
                && !node.is_empty()
            {
                return Err(SerializeError::NonEmptyEmptyTag {
                    name,
                    content: node.content(),
                });
            }
            if policy == AttrErrorPolicy::Fail && node.has_attr() {
                for (_, value) in node.attrs() {
                    if value.contains(['<', '>', '&', '"']) {
                        return Err(SerializeError::IllformedAttribute(value));
                    }
                }
            }
        }
        Ok(())
    }

    fn repr_ops<'b>(
        &'b self,
        empty_tags: &'b RefCell<HashSet<String>>,
        policy: AttrErrorPolicy,
    ) -> ReprOps<'b> {
        let src = self.src;
        let root = self.root;
        let string_tags = &self.string_tags;
        let inline_tags = &self.inline_tags;
        let self_node = self.node;
        let lbreaks = src.filter(|s| !s.is_empty()).map(linebreaks);

        let open = move |node: &Node| -> String {
            if node == self_node && node.has_name(":XML") {
                return String::new();
            }
            let name = node.name();
            if string_tags.contains(&name) && !node.has_attr() {
                if name == CHAR_REF_PTYPE && node.content().chars().all(|c| c.is_alphanumeric()) {
                    return "&#x".to_string();
                } else if name == ENTITY_REF_PTYPE {
                    return "&".to_string();
                }
                return String::new();
            }
            let mut txt = format!("<{}", xml_tag_name(&name));
            if node.has_attr() {
                if name.starts_with('?')
                    && !name[1..].to_lowercase().starts_with("xml")
                    && node.has_attr_named("instructions__")
                {
                    txt.push(' ');
                    txt.push_str(&node.get_attr("instructions__", ""));
                } else {
                    for (k, v) in node.attrs() {
                        txt.push_str(&format!(" {}={}", k, filter_attr_value(&v, policy)));
                    }
                }
            }
            if let Some(lb) = &lbreaks {
                if !node.has_attr_named("line") && !node.has_attr_named("col") {
                    if let Some(pos) = node.pos_opt() {
                        let (line, col) = line_col(lb, pos);
                        txt.push_str(&format!(" line=\"{}\" col=\"{}\"", line, col));
                    }
                }
            }
            if src == Some("") && !node.has_attr_named("_pos") {
                if let Some(pos) = node.pos_opt() {
                    txt.push_str(&format!(" _pos=\"{}\"", pos));
                }
            }
            if let Some(r) = root {
                if !node.has_attr_named("err") {
                    let errors = r.node_errors(node);
                    if !errors.is_empty() {
                        let err_str = errors
                            .iter()
                            .map(|e| e.to_string())
                            .collect::<Vec<String>>()
                            .join("");
                        txt.push_str(&format!(
                            " err={}",
                            filter_attr_value(&err_str, AttrErrorPolicy::Fix)
                        ));
                    }
                }
            }
            if name.starts_with('?') && node.is_empty() {
                empty_tags.borrow_mut().insert(name.clone());
            }
            let ending = if empty_tags.borrow().contains(&name) {
                if name.starts_with('?') {
                    "?>"
                } else if !node.is_empty() {
                    ">"
                } else {
                    "/>"
                }
            } else if name == "!--" {
                ""
            } else {
                ">"
            };
            txt.push_str(ending);
            txt
        };

        let close = move |node: &Node| -> String {
            if node == self_node && node.has_name(":XML") {
                return String::new();
            }
            let name = node.name();
            if (empty_tags.borrow().contains(&name) && node.is_empty())
                || (string_tags.contains(&name) && !node.has_attr())
            {
                if name == CHAR_REF_PTYPE && node.content().chars().all(|c| c.is_alphanumeric()) {
                    return ";".to_string();
                } else if name == ENTITY_REF_PTYPE {
                    return ";".to_string();
                }
                return String::new();
            }
            if name == "!--" {
                return "-->".to_string();
            }
            format!("</{}>", xml_tag_name(&name))
        };

        let inlining = move |node: &Node| -> bool {
            inline_tags.contains(&node.name())
                || node.get_attr("xml:space", "default") == "preserve"
        };

        ReprOps {
            tab: " ".repeat(self.indentation),
            density: 1,
            allow_omissions: !string_tags.is_empty(),
            open: Box::new(open),
            close: Box::new(close),
            data: Box::new(escape_xml_text),
            inline: Box::new(inlining),
        }
    }
}

// serialization mapping //////////////////////////////////////////////////

/// Part of a node's serialization a character belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerPart {
    OpeningTag,
    Inside,
    ClosingTag,
}

/// A location within a serialized version of the tree.
#[derive(Debug, Clone)]
pub struct SerLocation {
    /// Path to the innermost node covering the position.
    pub path: Path,
    /// Offset of the node's serialization within the serialized string.
    pub ser_pos: usize,
    /// Offset of the looked-up position within the node's serialization.
    pub offset: usize,
    pub part: SerPart,
}

struct MapEntry {
    path: Path,
    start: usize,
    head: usize,
    total: usize,
    tail: usize,
}

/// Maps offsets in a single-line serialization (XML or S-expression) back
/// to the nodes that produced them.
pub struct SerializationMapping {
    serialization: String,
    is_xml: bool,
    entries: Vec<MapEntry>,
}

impl SerializationMapping {
    pub fn serialization(&self) -> &str {
        &self.serialization
    }

    /// The `(head_length, total_length, tail_length)` triple of a node's
    /// serialization.
    pub fn head_total_tail(&self, node: &Node) -> Option<(usize, usize, usize)> {
        self.entries
            .iter()
            .find(|e| e.path.last() == Some(node))
            .map(|e| (e.head, e.total, e.tail))
    }

    /// Returns the path of the innermost node which covers the character
    /// at `pos` in the serialization, along with the node's position in
    /// the serialization and which part of the tag the character belongs
    /// to.
    pub fn get_path(&self, pos: usize) -> Result<SerLocation, SerializeError> {
        // spans nest, so the innermost covering node is the one with the
        // shortest total length
        let entry = self
            .entries
            .iter()
            .filter(|e| e.start <= pos && pos < e.start + e.total)
            .min_by_key(|e| e.total)
            .ok_or(SerializeError::PositionOutOfRange(pos))?;
        let offset = pos - entry.start;
        let part = if offset < entry.head {
            SerPart::OpeningTag
        } else if offset >= entry.total - entry.tail {
            SerPart::ClosingTag
        } else {
            SerPart::Inside
        };
        Ok(SerLocation {
            path: entry.path.clone(),
            ser_pos: entry.start,
            offset,
            part,
        })
    }

    /// Returns the position within the pure string content of the tree
    /// that corresponds to a location in the serialization of a leaf node.
    pub fn content_pos(&self, location: &SerLocation) -> Result<usize, SerializeError> {
        let node = location
            .path
            .last()
            .ok_or(SerializeError::UnmappablePosition)?;
        assert!(node.is_leaf(), "content positions exist only for leaves");
        match location.part {
            SerPart::OpeningTag => return Ok(0),
            SerPart::ClosingTag => return Ok(node.strlen()),
            SerPart::Inside => {}
        }
        let entry = self
            .entries
            .iter()
            .find(|e| e.start == location.ser_pos && e.path.last() == Some(node))
            .ok_or(SerializeError::UnmappablePosition)?;
        let region_len = entry.total - entry.head - entry.tail;
        let offset = location.offset - entry.head;
        if self.is_xml {
            if region_len != node.strlen() {
                return Err(SerializeError::UnmappablePosition);
            }
            Ok(offset)
        } else {
            // gap and quotation marks surround the leaf's content
            if region_len != node.strlen() + 3 {
                return Err(SerializeError::UnmappablePosition);
            }
            Ok(offset.saturating_sub(2).min(node.strlen()))
        }
    }
}

fn write_inline(
    node: &Node,
    ops: &ReprOps,
    out: &mut String,
    entries: &mut Vec<MapEntry>,
    path: &mut Path,
    is_sxpr: bool,
    separated: bool,
) {
    path.push(node.clone());
    let start = out.len();
    if separated {
        out.push(' ');
    }
    let head = (ops.open)(node);
    out.push_str(&head);
    if node.has_children() {
        for child in node.children() {
            write_inline(&child, ops, out, entries, path, is_sxpr, is_sxpr);
        }
    } else if !node.is_empty() {
        if is_sxpr && head.starts_with('(') {
            out.push(' ');
        }
        out.push_str(&(ops.data)(&node.content()));
    }
    let tail = (ops.close)(node);
    out.push_str(&tail);
    entries.push(MapEntry {
        path: path.clone(),
        start,
        // a separating blank before the node belongs to its head
        head: head.len() + usize::from(separated),
        total: out.len() - start,
        tail: tail.len(),
    });
    path.pop();
}

// JSON ///////////////////////////////////////////////////////////////////

fn json_list_flavor(node: &Node, include_pos: bool) -> Value {
    let mut arr = vec![Value::String(node.name())];
    if node.has_children() {
        arr.push(Value::Array(
            node.children()
                .iter()
                .map(|c| json_list_flavor(c, include_pos))
                .collect(),
        ));
    } else {
        arr.push(Value::String(node.content()));
    }
    if include_pos {
        if let Some(pos) = node.pos_opt() {
            arr.push(json!(pos));
        }
    }
    if node.has_attr() {
        arr.push(Value::Object(
            node.attrs()
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        ));
    }
    Value::Array(arr)
}

fn json_dict_flavor(node: &Node, include_pos: bool) -> Value {
    let children = node.children();
    let mut names: HashSet<String> = HashSet::new();
    let duplicates = children.iter().any(|c| !names.insert(c.name()));

    let inner: Value = if node.has_children() {
        if duplicates {
            // duplicate child names force the list-of-pairs representation
            Value::Array(
                children
                    .iter()
                    .map(|c| {
                        let entry = json_dict_flavor(c, include_pos);
                        let value = entry
                            .as_object()
                            .and_then(|o| o.get(&c.name()))
                            .cloned()
                            .unwrap_or(Value::Null);
                        json!([c.name(), value])
                    })
                    .collect(),
            )
        } else {
            let mut map = serde_json::Map::new();
            for c in &children {
                let entry = json_dict_flavor(c, include_pos);
                let value = entry
                    .as_object()
                    .and_then(|o| o.get(&c.name()))
                    .cloned()
                    .unwrap_or(Value::Null);
                map.insert(c.name(), value);
            }
            Value::Object(map)
        }
    } else {
        Value::String(node.content())
    };

    let mut additional: Vec<(String, Value)> = Vec::new();
    if include_pos {
        if let Some(pos) = node.pos_opt() {
            additional.push(("pos__".to_string(), Value::String(pos.to_string())));
        }
    }
    if node.has_attr() {
        additional.push((
            "attributes__".to_string(),
            Value::Object(
                node.attrs()
                    .into_iter()
                    .map(|(k, v)| (k, Value::String(v)))
                    .collect(),
            ),
        ));
    }

    let inner = if additional.is_empty() {
        inner
    } else if node.has_children() {
        match inner {
            Value::Object(mut map) => {
                for (k, v) in additional {
                    map.insert(k, v);
                }
                Value::Object(map)
            }
            Value::Array(mut pairs) => {
                for (k, v) in additional {
                    pairs.push(json!([k, v]));
                }
                Value::Array(pairs)
            }
            other => other,
        }
    } else {
        let mut map = serde_json::Map::new();
        map.insert("content__".to_string(), inner);
        for (k, v) in additional {
            map.insert(k, v);
        }
        Value::Object(map)
    };

    let mut outer = serde_json::Map::new();
    outer.insert(node.name(), inner);
    Value::Object(outer)
}

// collect_empty_tags /////////////////////////////////////////////////////

impl Node {
    /// Collects the names for which all nodes with that name are empty.
    pub fn collect_empty_tags(&self) -> HashSet<String> {
        let mut empty_tags: HashSet<String> = HashSet::new();
        let mut not_empty: HashSet<String> = HashSet::new();
        for nd in self.select_if(
            std::rc::Rc::new(|nd: &Node| nd.is_leaf()),
            true,
            false,
            std::rc::Rc::new(|_| false),
        ) {
            let tag = nd.name();
            if !nd.is_empty() {
                empty_tags.remove(&tag);
                not_empty.insert(tag);
            } else if !not_empty.contains(&tag) {
                empty_tags.insert(tag);
            }
        }
        empty_tags
    }

    /// Serializes the tree as S-expression with the default options. Use
    /// [`SxprPrinter`] for customization.
    pub fn as_sxpr(&self) -> String {
        SxprPrinter::new(self).render()
    }

    /// Serializes the tree as SXML.
    pub fn as_sxml(&self) -> String {
        SxprPrinter::new(self).sxml(1).render()
    }

    /// Serializes the tree as XML with the default options. Use
    /// [`XmlPrinter`] for customization.
    pub fn as_xml(&self) -> Result<String, SerializeError> {
        XmlPrinter::new(self).render()
    }

    /// Converts the tree into a JSON value; list flavor by default, dict
    /// flavor with `as_dict`.
    pub fn to_json_value(&self, as_dict: bool, include_pos: bool) -> Value {
        if as_dict {
            json_dict_flavor(self, include_pos)
        } else {
            json_list_flavor(self, include_pos)
        }
    }

    /// Serializes the tree as JSON string. `indent` of `None` or zero
    /// yields the compact form.
    pub fn as_json(&self, indent: Option<usize>, as_dict: bool, include_pos: bool) -> String {
        let value = self.to_json_value(as_dict, include_pos);
        match indent {
            Some(n) if n > 0 => {
                serde_json::to_string_pretty(&value).expect("tree values always serialize")
            }
            _ => serde_json::to_string(&value).expect("tree values always serialize"),
        }
    }

    /// Serializes as a human-readable indented text-tree outline.
    pub fn as_tree(&self) -> String {
        let sxpr = SxprPrinter::new(self).flatten_threshold(0).render();
        let rx_open = regex::Regex::new(r"^(\s*)\(").unwrap();
        let rx_close = regex::Regex::new(r"\)+$").unwrap();
        sxpr.split('\n')
            .map(|line| {
                let line = rx_open.replace(line, "$1").into_owned();
                let line = rx_close.replace(&line, "").into_owned();
                line.replace(") `(", " `")
                    .replace("`(", "`")
                    .replace("\") \"", "\" \"")
            })
            .collect::<Vec<String>>()
            .join("\n")
    }

    /// Serializes the tree in the format named by `how`: "sxpr" /
    /// "S-expression", "sxml", "xml", "json", "jsondict" / "dict.json",
    /// "indented" / "tree", or "default" / "ast" / "cst", which pick the
    /// format from the configuration.
    pub fn serialize(&self, how: &str) -> Result<String, SerializeError> {
        let mut switch = how.to_lowercase();
        let default = with_config(|c| c.default_serialization.to_lowercase());
        if switch == "ast" {
            switch = with_config(|c| c.ast_serialization.to_lowercase());
        } else if switch == "cst" {
            switch = with_config(|c| c.cst_serialization.to_lowercase());
        }
        if switch.is_empty() || switch == "default" {
            switch = default;
        }

        let compact_threshold = with_config(|c| c.compact_sxpr_threshold);
        let exceeds_threshold = || {
            let mut size = 0usize;
            for _ in self.walk_tree(true, false) {
                size += 1;
                if size > compact_threshold {
                    return true;
                }
            }
            false
        };

        match switch.as_str() {
            "s-expression" | "sxpr" => Ok(SxprPrinter::new(self)
                .flatten_threshold(with_config(|c| c.flatten_sxpr_threshold))
                .compact(exceeds_threshold())
                .render()),
            "sxml" | "sxml1" | "sxml2" => {
                let level = if switch == "sxml2" { 2 } else { 1 };
                Ok(SxprPrinter::new(self)
                    .flatten_threshold(with_config(|c| c.flatten_sxpr_threshold))
                    .compact(exceeds_threshold())
                    .sxml(level)
                    .render())
            }
            "xml" => XmlPrinter::new(self).strict_mode(false).render(),
            "json" => Ok(self.as_json(None, false, true)),
            "dict.json" | "jsondict" => Ok(self.as_json(Some(2), true, false)),
            "indented" | "tree" => Ok(self.as_tree()),
            _ => Err(SerializeError::UnknownFormat(how.to_string())),
        }
    }
}

impl RootNode {
    /// Serializes as S-expression; errors appear as `err`
    /// pseudo-attributes on the nodes they are attached to.
    pub fn as_sxpr(&self) -> String {
        SxprPrinter::new(self.tree()).root(self).render()
    }

    /// Serializes as XML, honoring the root's serialization hints
    /// (`inline_tags`, `string_tags`, `empty_tags`).
    pub fn as_xml(&self) -> Result<String, SerializeError> {
        XmlPrinter::new(self.tree()).root(self).render()
    }

    /// Serializes in the format named by `how`, falling back to the
    /// root's `serialization_type`.
    pub fn serialize(&self, how: &str) -> Result<String, SerializeError> {
        let how = if how.is_empty() {
            self.serialization_type.as_str()
        } else {
            how
        };
        if how.eq_ignore_ascii_case("xml") {
            return XmlPrinter::new(self.tree())
                .root(self)
                .strict_mode(false)
                .render();
        }
        self.tree().serialize(how)
    }
}

#[cfg(test)]
#[path = "serialize_tests.rs"]
mod serialize_tests;
