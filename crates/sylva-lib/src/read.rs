//! Deserialization of node-trees from S-expressions, XML and JSON.
//!
//! The XML reader is deliberately simple: processing instructions and
//! document-type declarations are skipped, comments are handled, and tag
//! mismatches are tolerated when strict mode is off. For standards-
//! conformant XML use a dedicated XML parser.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error as ThisError;

use crate::node::{Node, NodeContent, TOKEN_PTYPE};
use crate::root::RootNode;
use crate::serialize::restore_tag_name;

/// Failures of the tree readers.
#[derive(Debug, ThisError)]
pub enum ReadError {
    #[error("malformed S-expression: {0}")]
    MalformedSxpr(String),
    #[error("malformed XML: {0}")]
    MalformedXml(String),
    #[error("malformed JSON tree: {0}")]
    MalformedJson(String),
    #[error("JSON syntax error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snippet is neither S-expression nor XML nor JSON: {0}")]
    Unrecognized(String),
}

// S-expressions //////////////////////////////////////////////////////////

struct SxprParser<'s> {
    s: &'s str,
    pos: usize,
}

impl<'s> SxprParser<'s> {
    fn rest(&self) -> &'s str {
        &self.s[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.s.len() - trimmed.len();
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn error(&self, message: &str) -> ReadError {
        let snippet: String = self.rest().chars().take(20).collect();
        ReadError::MalformedSxpr(format!("{} at: {:?}", message, snippet))
    }

    fn parse_tag_name(&mut self) -> &'s str {
        let rest = self.rest();
        let mut end = 0;
        let bytes = rest.as_bytes();
        if bytes.first() == Some(&b'?') {
            end = 1;
        }
        while end < bytes.len()
            && (bytes[end].is_ascii_alphanumeric() || b"_.:-".contains(&bytes[end]))
        {
            end += 1;
        }
        self.pos += end;
        &rest[..end]
    }

    fn parse_attrs(
        &mut self,
        attr_start: &str,
        attrs: &mut IndexMap<String, String>,
    ) -> Result<Option<usize>, ReadError> {
        let mut pos_value: Option<usize> = None;
        let ell = attr_start.len();
        while self.rest().starts_with(attr_start) {
            let rest = self.rest();
            let quote = rest.find('"');
            let mut k = rest
                .find(')')
                .ok_or_else(|| self.error("unbalanced parentheses"))?;
            if let Some(q) = quote {
                if k > q {
                    // the closing bracket must follow the closing quote
                    if let Some(cq) = rest[q + 1..].find('"').map(|x| x + q + 1) {
                        if let Some(k2) = rest[cq..].find(')') {
                            k = cq + k2;
                        }
                    }
                }
            }
            let i = quote.unwrap_or(k + 1);
            let inner = &rest[ell..];
            if inner.starts_with("pos") && k >= ell + 3 && (ell == 1 || (0 < k && k < i)) {
                let raw = rest[ell + 3..k]
                    .trim_matches(|c: char| c == ' ' || c == '\'' || c == '"');
                let first = raw.split(' ').next().unwrap_or("");
                pos_value = first.parse::<usize>().ok();
            } else if inner.starts_with("err") && k >= ell + 3 && rest[ell + 3..k].contains('`') {
                // skip the error pseudo-attribute, extending over nested
                // parentheses
                let mut m = rest[ell + 3..].find('(').map(|x| x + ell + 3);
                while m.is_some_and(|mv| mv < k) {
                    m = rest[k..].find('(').map(|x| x + k);
                    let from = m.unwrap_or(0);
                    match rest[from..].find(')') {
                        Some(close) if k < from + close => k = from + close,
                        _ => break,
                    }
                }
            } else {
                let name = rest[ell..i.min(k + 1).min(rest.len())].trim();
                let valid = name
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_alphanumeric() || "_.:-".contains(c));
                if !valid {
                    return Err(ReadError::MalformedSxpr(format!(
                        "illegal attribute name: {:?}",
                        name
                    )));
                }
                let value = if i < k { rest[i..k].trim() } else { "" };
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                attrs.insert(name.to_string(), value.to_string());
            }
            self.pos += k + 1;
            self.skip_ws();
        }
        Ok(pos_value)
    }

    fn parse_node(&mut self) -> Result<Node, ReadError> {
        self.skip_ws();
        if !self.eat("(") {
            return Err(self.error("\"(\" expected"));
        }
        self.skip_ws();
        let tagname = self.parse_tag_name();
        if tagname.is_empty() {
            return Err(self.error("node name or identifier expected"));
        }
        let (name, class_name) = match tagname.split_once(':') {
            Some((name, class_name)) => (name, class_name),
            None => (tagname, ""),
        };
        let node_name = if name.is_empty() {
            format!(":{}", class_name)
        } else {
            name.to_string()
        };
        self.skip_ws();

        let mut attrs: IndexMap<String, String> = IndexMap::new();
        let pos_value;
        if self.rest().starts_with("(@") {
            self.pos += 2;
            self.skip_ws();
            pos_value = self.parse_attrs("(", &mut attrs)?;
            if !self.eat(")") {
                return Err(self.error("\")\" closing the attribute node expected"));
            }
            self.skip_ws();
        } else {
            pos_value = self.parse_attrs("`(", &mut attrs)?;
        }

        let node;
        if self.rest().starts_with('(') {
            let mut children = Vec::new();
            loop {
                self.skip_ws();
                if self.rest().starts_with(')') || self.rest().is_empty() {
                    break;
                }
                if !self.rest().starts_with('(') {
                    return Err(self.error("\"(\" expected"));
                }
                children.push(self.parse_node()?);
            }
            node = Node::new(node_name, children);
        } else {
            let mut lines: Vec<String> = Vec::new();
            'content: while !self.rest().is_empty() && !self.rest().starts_with(')') {
                for quote in ["\"\"\"", "'''", "\"", "'"] {
                    if self.rest().starts_with(quote) {
                        let start = self.pos + quote.len();
                        let end = self.s[start..]
                            .find(quote)
                            .map(|x| x + start)
                            .ok_or_else(|| self.error("closing quotation mark missing"))?;
                        lines.push(self.s[start..end].to_string());
                        self.pos = end + quote.len();
                        self.skip_ws();
                        continue 'content;
                    }
                }
                let end = self
                    .rest()
                    .find(')')
                    .ok_or_else(|| self.error("closing bracket(s) \")\" missing"))?;
                lines.push(self.rest()[..end].to_string());
                self.pos += end;
            }
            node = Node::new_leaf(node_name, lines.join("\n"));
        }
        self.skip_ws();
        if !self.eat(")") {
            return Err(self.error("closing bracket(s) \")\" missing"));
        }
        if let Some(p) = pos_value {
            node.force_pos(Some(p));
        }
        if !attrs.is_empty() {
            node.set_attrs(attrs);
        }
        Ok(node)
    }
}

/// Generates a tree of nodes from an S-expression. Among other things,
/// this deserializes trees serialized with `Node::as_sxpr()` and is a
/// convenient way to produce test data. Positions are not initialized
/// unless `pos` pseudo-attributes are present; use `with_pos()`.
pub fn parse_sxpr(sxpr: &str) -> Result<RootNode, ReadError> {
    let mut parser = SxprParser { s: sxpr, pos: 0 };
    let tree = parser.parse_node()?;
    parser.skip_ws();
    if !parser.rest().is_empty() {
        return Err(parser.error("superfluous characters"));
    }
    Ok(RootNode::from(tree))
}

/// Generates a tree of nodes from SXML, i.e. an S-expression with the
/// `(@ (key "value") …)` attribute convention.
pub fn parse_sxml(sxml: &str) -> Result<RootNode, ReadError> {
    parse_sxpr(sxml)
}

// XML ////////////////////////////////////////////////////////////////////

/// Options for [`parse_xml_with`].
pub struct XmlReadOptions {
    /// Name used for text runs inside mixed-content tags.
    pub string_tag: String,
    /// Treat `_pos` like a normal attribute instead of assigning it to
    /// the node's position.
    pub ignore_pos: bool,
    /// Fail on interoperability problems such as mismatched tag names.
    pub strict_mode: bool,
}

impl Default for XmlReadOptions {
    fn default() -> Self {
        XmlReadOptions {
            string_tag: TOKEN_PTYPE.to_string(),
            ignore_pos: false,
            strict_mode: true,
        }
    }
}

/// Result of [`parse_xml_with`]: the tree plus the names of the tags that
/// occurred as empty elements, e.g. `<br/>`.
pub struct XmlReadResult {
    pub root: RootNode,
    pub empty_tags: HashSet<String>,
}

struct XmlParser<'s, 'o> {
    s: &'s str,
    pos: usize,
    options: &'o XmlReadOptions,
    empty_tags: HashSet<String>,
    non_empty_tags: HashSet<String>,
}

impl<'s, 'o> XmlParser<'s, 'o> {
    fn rest(&self) -> &'s str {
        &self.s[self.pos..]
    }

    fn error(&self, message: &str) -> ReadError {
        let snippet: String = self.rest().chars().take(24).collect();
        ReadError::MalformedXml(format!("{} at: {:?}", message, snippet))
    }

    fn parse_attributes(&mut self) -> IndexMap<String, String> {
        let rx = regex::Regex::new(r#"\s*([\w:.\-]+)\s*=\s*"([^"]*)"\s*"#).unwrap();
        let rest = self.rest();
        let eot = rest.find('>').unwrap_or(rest.len());
        let mut attrs = IndexMap::new();
        let mut restart = 0;
        for caps in rx.captures_iter(rest) {
            let m = caps.get(0).unwrap();
            if m.start() >= eot {
                break;
            }
            attrs.insert(caps[1].to_string(), caps[2].to_string());
            restart = m.end();
        }
        self.pos += restart;
        attrs
    }

    fn parse_opening_tag(
        &mut self,
    ) -> Result<(String, IndexMap<String, String>, bool), ReadError> {
        let rx = regex::Regex::new(r"^<\s*([\w:.\-]+)\s*").unwrap();
        let caps = rx
            .captures(self.rest())
            .ok_or_else(|| self.error("opening tag expected"))?;
        let tagname = caps[1].to_string();
        self.pos += caps.get(0).unwrap().end();
        let attrs = self.parse_attributes();
        let rest = self.rest();
        let i = rest
            .find('>')
            .ok_or_else(|| self.error("\">\" of opening tag missing"))?;
        let solitary = i > 0 && rest.as_bytes()[i - 1] == b'/';
        self.pos += i + 1;
        Ok((tagname, attrs, solitary))
    }

    fn parse_closing_tag(&mut self) -> Result<String, ReadError> {
        let rx = regex::Regex::new(r"^</\s*([\w:.\-]+)\s*>").unwrap();
        let caps = rx
            .captures(self.rest())
            .ok_or_else(|| self.error("closing tag expected"))?;
        let tagname = caps[1].to_string();
        self.pos += caps.get(0).unwrap().end();
        Ok(tagname)
    }

    fn parse_leaf_content(&mut self) -> Result<&'s str, ReadError> {
        let rest = self.rest();
        let i = rest
            .find('<')
            .ok_or_else(|| self.error("unexpected end of document"))?;
        self.pos += i;
        Ok(&rest[..i])
    }

    fn skip_comment(&mut self) -> Result<(), ReadError> {
        debug_assert!(self.rest().starts_with("<!--"));
        match self.rest().find("-->") {
            Some(i) => self.pos += i + 3,
            None => {
                if self.options.strict_mode {
                    return Err(self.error("comment is never closed"));
                }
                self.pos += 4;
            }
        }
        Ok(())
    }

    fn skip_special_tag(&mut self) {
        debug_assert!(self.rest().starts_with("<!") || self.rest().starts_with("<?"));
        let rest = self.rest();
        let i = find_plain_tag(&rest[1..]).map(|x| x + 1).unwrap_or(rest.len());
        match rest[..i].rfind('>') {
            Some(k) => self.pos += k + 1,
            None => self.pos += 2,
        }
    }

    fn parse_full_content(&mut self) -> Result<Node, ReadError> {
        let mut result: Vec<Node> = Vec::new();
        let (tagname, mut attrs, solitary) = self.parse_opening_tag()?;
        if solitary {
            // a tag used both empty and non-empty will round-trip badly,
            // but reading continues either way
            self.non_empty_tags.remove(&tagname);
            self.empty_tags.insert(tagname.clone());
        } else {
            if !self.empty_tags.contains(&tagname) {
                self.non_empty_tags.insert(tagname.clone());
            }
            while !self.rest().is_empty() && !self.rest().starts_with("</") {
                let leaf = self.parse_leaf_content()?;
                if !leaf.is_empty() && (!leaf.contains('\n') || !leaf.trim().is_empty()) {
                    // entity references are kept verbatim; the serializer
                    // leaves well-formed entities untouched, so XML
                    // round-trips are stable at the serialized level
                    result.push(Node::new_leaf(self.options.string_tag.clone(), leaf));
                }
                if self.rest().starts_with('<') {
                    if self.rest().starts_with("<!--") {
                        self.skip_comment()?;
                    } else if self.rest().starts_with("<?") || self.rest().starts_with("<!") {
                        self.skip_special_tag();
                    } else if !self.rest().starts_with("</") {
                        result.push(self.parse_full_content()?);
                    }
                }
            }
            let closing_tagname = self.parse_closing_tag()?;
            if tagname != closing_tagname && self.options.strict_mode {
                return Err(ReadError::MalformedXml(format!(
                    "tag-name mismatch: <{}>...</{}>",
                    tagname, closing_tagname
                )));
            }
        }

        let content = if result.len() == 1 && result[0].has_name(&self.options.string_tag) {
            NodeContent::Leaf(result[0].content())
        } else {
            NodeContent::Branch(result)
        };
        let (name, class_name) = match tagname.split_once(':') {
            Some((name, class_name)) => (name.to_string(), format!(":{}", class_name)),
            None => (tagname.clone(), String::new()),
        };
        let name = if !name.is_empty() && class_name.is_empty() {
            restore_tag_name(&name)
        } else {
            name
        };
        let node = Node::with_content(format!("{}{}", name, class_name), content);
        if !self.options.ignore_pos {
            if let Some(raw) = attrs.shift_remove("_pos") {
                node.force_pos(raw.trim().parse::<usize>().ok());
            }
        }
        if !attrs.is_empty() {
            node.set_attrs(attrs);
        }
        Ok(node)
    }
}

/// The index of the first `<` that does not open a comment, processing
/// instruction or declaration.
fn find_plain_tag(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'<' && !matches!(bytes.get(i + 1), Some(b'?') | Some(b'!')) {
            return Some(i);
        }
    }
    None
}

/// Generates a tree of nodes from a (pseudo-)XML source with the default
/// options. Text runs in mixed-content elements become anonymous `:Text`
/// children; an element containing a single text run becomes a leaf.
pub fn parse_xml(xml: &str) -> Result<RootNode, ReadError> {
    parse_xml_with(xml, &XmlReadOptions::default()).map(|result| result.root)
}

/// Like [`parse_xml`], but configurable, and additionally reporting the
/// names of the tags that occurred as empty elements.
pub fn parse_xml_with(xml: &str, options: &XmlReadOptions) -> Result<XmlReadResult, ReadError> {
    let start = find_plain_tag(xml).unwrap_or(0);
    let mut parser = XmlParser {
        s: xml,
        pos: start,
        options,
        empty_tags: HashSet::new(),
        non_empty_tags: HashSet::new(),
    };
    let tree = parser.parse_full_content()?;
    Ok(XmlReadResult {
        root: RootNode::from(tree),
        empty_tags: parser.empty_tags,
    })
}

// JSON ///////////////////////////////////////////////////////////////////

fn node_from_json_value(value: &Value) -> Result<Node, ReadError> {
    match value {
        Value::Array(items) => {
            if !(2..=4).contains(&items.len()) {
                return Err(ReadError::MalformedJson(format!(
                    "a node must have 2 to 4 entries, found {}",
                    items.len()
                )));
            }
            let name = items[0]
                .as_str()
                .ok_or_else(|| ReadError::MalformedJson("node name must be a string".into()))?;
            let node = match &items[1] {
                Value::String(text) => Node::new_leaf(name, text.clone()),
                Value::Array(children) => {
                    let children = children
                        .iter()
                        .map(node_from_json_value)
                        .collect::<Result<Vec<Node>, ReadError>>()?;
                    Node::new(name, children)
                }
                other => {
                    return Err(ReadError::MalformedJson(format!(
                        "node content must be a string or a list, found {}",
                        other
                    )))
                }
            };
            for extra in &items[2..] {
                match extra {
                    Value::Object(attrs) => {
                        for (k, v) in attrs {
                            node.set_attr(k, json_value_to_string(v));
                        }
                    }
                    Value::Number(n) => {
                        node.force_pos(n.as_u64().map(|p| p as usize));
                    }
                    other => {
                        return Err(ReadError::MalformedJson(format!(
                            "extra node data must be an attribute object or a position, found {}",
                            other
                        )))
                    }
                }
            }
            Ok(node)
        }
        Value::Object(map) => {
            let (name, inner) = map
                .iter()
                .next()
                .ok_or_else(|| ReadError::MalformedJson("empty node object".into()))?;
            node_from_dict_entry(name, inner)
        }
        other => Err(ReadError::MalformedJson(format!(
            "a node must be a list or an object, found {}",
            other
        ))),
    }
}

fn node_from_dict_entry(name: &str, inner: &Value) -> Result<Node, ReadError> {
    if let Value::String(text) = inner {
        return Ok(Node::new_leaf(name, text.clone()));
    }
    let entries: Vec<(String, Value)> = match inner {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        Value::Array(pairs) => pairs
            .iter()
            .map(|pair| match pair.as_array().map(|a| a.as_slice()) {
                Some([Value::String(k), v]) => Ok((k.clone(), v.clone())),
                _ => Err(ReadError::MalformedJson(format!(
                    "child entry must be a [name, value] pair, found {}",
                    pair
                ))),
            })
            .collect::<Result<Vec<(String, Value)>, ReadError>>()?,
        other => {
            return Err(ReadError::MalformedJson(format!(
                "node content must be a string, object or list, found {}",
                other
            )))
        }
    };
    let pos = entries
        .iter()
        .find(|(k, _)| k == "pos__")
        .and_then(|(_, v)| match v {
            Value::String(s) => s.parse::<usize>().ok(),
            Value::Number(n) => n.as_u64().map(|p| p as usize),
            _ => None,
        });
    let attrs: Option<IndexMap<String, String>> = entries
        .iter()
        .find(|(k, _)| k == "attributes__")
        .and_then(|(_, v)| v.as_object())
        .map(|map| {
            map.iter()
                .map(|(k, v)| (k.clone(), json_value_to_string(v)))
                .collect()
        });
    let content = entries.iter().find(|(k, _)| k == "content__");
    let node = match content {
        Some((_, Value::String(text))) => Node::new_leaf(name, text.clone()),
        Some((_, other)) => {
            return Err(ReadError::MalformedJson(format!(
                "leaf content must be a string, found {}",
                other
            )))
        }
        None => {
            let children = entries
                .iter()
                .filter(|(k, _)| !k.ends_with("__"))
                .map(|(k, v)| node_from_dict_entry(k, v))
                .collect::<Result<Vec<Node>, ReadError>>()?;
            Node::new(name, children)
        }
    };
    if let Some(p) = pos {
        node.force_pos(Some(p));
    }
    if let Some(attrs) = attrs {
        if !attrs.is_empty() {
            node.set_attrs(attrs);
        }
    }
    Ok(node)
}

fn json_value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parses a JSON representation of a node-tree, i.e. a JSON document that
/// has been produced by `Node::as_json()`, not arbitrary JSON.
pub fn parse_json(json_str: &str) -> Result<RootNode, ReadError> {
    let value: Value = serde_json::from_str(json_str)?;
    Ok(RootNode::from(node_from_json_value(&value)?))
}

/// Parses either XML, an S-expression or a JSON representation of a tree,
/// detecting the format automatically. All-whitespace input yields `None`.
pub fn deserialize(input: &str) -> Result<Option<RootNode>, ReadError> {
    let trimmed = input.trim_start();
    if trimmed.starts_with('<') {
        parse_xml(input).map(Some)
    } else if trimmed.starts_with('(') {
        parse_sxpr(input).map(Some)
    } else if trimmed.is_empty() {
        Ok(None)
    } else {
        parse_json(input).map(Some).map_err(|_| {
            let snippet: String = trimmed.chars().take(40).collect();
            ReadError::Unrecognized(snippet)
        })
    }
}

#[cfg(test)]
#[path = "read_tests.rs"]
mod read_tests;
