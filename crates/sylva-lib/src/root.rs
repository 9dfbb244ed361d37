//! The root of a finalized node-tree and its global state.
//!
//! Errors are collected centrally by the [`RootNode`] rather than being
//! attached to the nodes on which they occurred: nodes may be dropped or
//! replaced during tree processing, but error messages must not be lost.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::rc::Rc;

use sylva_core::{
    add_source_locations, has_errors, linebreaks, neutral_srcmap_fn, only_errors, Error,
    ErrorCode, SourceMapFn, NO_ERROR, PARSER_STOPPED_BEFORE_END,
};

use crate::node::{Node, NodeId, TreeError, LEAF_PTYPES, ZOMBIE_TAG};

const NOT_YET_READY: &str = "__not_yet_ready__";

/// A [`Node`] that owns the global state of a tree: the error list, the
/// source text and its source mapping, serialization hints, and the name
/// of the current processing stage.
///
/// The root node can be instantiated before the tree is fully parsed,
/// because it already manages errors during parsing. When parsing is
/// finished, the tree is adopted with [`RootNode::swallow`]. `RootNode`
/// dereferences to the adopted [`Node`].
pub struct RootNode {
    node: Node,
    errors: Vec<Error>,
    error_set: HashSet<(ErrorCode, usize)>,
    /// Node identity to indices into the error list.
    error_nodes: HashMap<NodeId, Vec<usize>>,
    /// Source position to the identities of the nodes carrying errors at
    /// that position.
    error_positions: HashMap<usize, HashSet<NodeId>>,
    /// The highest error code that has occurred so far.
    pub error_flag: ErrorCode,
    source: Rc<str>,
    source_mapping: SourceMapFn,
    /// Line-start offsets of the source for O(log n) line/column lookup.
    pub lbreaks: Vec<usize>,

    /// Tag names rendered on a single line by the XML serializer.
    pub inline_tags: HashSet<String>,
    /// Tag names of which only the content is rendered (mixed content).
    pub string_tags: HashSet<String>,
    /// Tag names rendered as empty elements, e.g. `<br/>`.
    pub empty_tags: HashSet<String>,

    /// A name for the document.
    pub docname: String,
    /// Case-insensitive name of the current processing stage, or empty.
    pub stage: String,
    /// Serialization format for the current stage ("default" if unset).
    pub serialization_type: String,

    swallowed: bool,
    data: Option<Box<dyn Any>>,
}

impl Deref for RootNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}

impl Default for RootNode {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Node> for RootNode {
    fn from(node: Node) -> Self {
        let mut root = RootNode::new();
        root.swallow(Some(node), None, None);
        root
    }
}

impl RootNode {
    /// Creates a root that has not yet adopted a tree.
    pub fn new() -> Self {
        RootNode {
            node: Node::new_leaf(NOT_YET_READY, ""),
            errors: Vec::new(),
            error_set: HashSet::new(),
            error_nodes: HashMap::new(),
            error_positions: HashMap::new(),
            error_flag: NO_ERROR,
            source: Rc::from(""),
            source_mapping: neutral_srcmap_fn(Rc::from(""), ""),
            lbreaks: linebreaks(""),
            inline_tags: HashSet::new(),
            string_tags: LEAF_PTYPES.iter().map(|s| s.to_string()).collect(),
            empty_tags: HashSet::new(),
            docname: String::new(),
            stage: String::new(),
            serialization_type: "default".to_string(),
            swallowed: false,
            data: None,
        }
    }

    /// The adopted tree.
    pub fn tree(&self) -> &Node {
        &self.node
    }

    /// The (preprocessed) source text.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn source_mapping(&self) -> &SourceMapFn {
        &self.source_mapping
    }

    pub fn set_source_mapping(&mut self, mapping: SourceMapFn) {
        self.source_mapping = mapping;
    }

    /// Adopts a parsed tree. Must be called exactly once before the tree
    /// is handed out as a finalized root. If `node` is `None`, the root
    /// becomes a zombie and a "parser did not match" error is recorded.
    pub fn swallow(
        &mut self,
        node: Option<Node>,
        source: Option<&str>,
        source_mapping: Option<SourceMapFn>,
    ) -> &mut Self {
        assert!(!self.swallowed, "RootNode::swallow() has already been called");
        let source_text: String = match source {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => node.as_ref().map(|nd| nd.content()).unwrap_or_default(),
        };
        if &*self.source != source_text {
            self.source = Rc::from(source_text.as_str());
            self.lbreaks = linebreaks(&self.source);
        }
        self.source_mapping =
            source_mapping.unwrap_or_else(|| neutral_srcmap_fn(self.source.clone(), ""));
        self.swallowed = true;
        let Some(node) = node else {
            self.node.set_name(ZOMBIE_TAG);
            self.node.with_pos(0);
            let zombie = self.node.clone();
            self.new_error(&zombie, "Parser did not match!", PARSER_STOPPED_BEFORE_END);
            return self;
        };
        // adopt the node's data in place, so that errors recorded against
        // this root before swallowing keep their node identity
        self.node.set_result_raw(node.raw_content());
        self.node.set_name(node.name());
        self.node.force_pos(node.pos_opt());
        if node.has_attr() {
            self.node.set_attrs(node.attrs());
        }
        if let Some(indices) = self.error_nodes.remove(&node.id()) {
            self.error_nodes
                .entry(self.node.id())
                .or_default()
                .extend(indices);
            for ids in self.error_positions.values_mut() {
                if ids.remove(&node.id()) {
                    ids.insert(self.node.id());
                }
            }
        }
        if !self.source.is_empty() {
            add_source_locations(&mut self.errors, &self.source_mapping);
        }
        self
    }

    /// Drops the swallowed tree in favor of the (non-tree) data resulting
    /// from compiling it. The data can be retrieved with
    /// [`RootNode::compiled_data`].
    pub fn continue_with_data(&mut self, data: Box<dyn Any>) {
        self.data = Some(data);
        self.node.set_text("");
        self.node.set_name(":DATA");
    }

    /// The compiled data deposited by [`RootNode::continue_with_data`].
    pub fn compiled_data<T: 'static>(&self) -> Option<&T> {
        self.data.as_ref().and_then(|d| d.downcast_ref())
    }

    // error bookkeeping //////////////////////////////////////////////////

    /// All errors recorded so far, in the order they were added.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// The list of errors, ordered by their position.
    pub fn errors_sorted(&self) -> Vec<Error> {
        let mut errors = self.errors.clone();
        errors.sort_by_key(|e| e.pos());
        errors
    }

    /// Records an error, locating it at a specific node. If `node` is
    /// `None`, the best-fitting leaf is determined from the error's
    /// position by bisection. Identical errors (same code and position)
    /// are recorded only once.
    pub fn add_error(&mut self, node: Option<&Node>, mut error: Error) -> &mut Self {
        if self.error_set.contains(&(error.code(), error.pos())) {
            return self;
        }
        let node: Node = match node {
            Some(node) => {
                assert!(
                    node.is_frozen() || node.pos() <= error.pos(),
                    "wrong error position when processing error: {}\n{} <= {} <= {} ?",
                    error,
                    node.pos(),
                    error.pos(),
                    node.pos() + node.strlen().max(1)
                );
                node.clone()
            }
            None => self.locate_error_node(&error),
        };
        if !self.source.is_empty() {
            let mut single = vec![error];
            add_source_locations(&mut single, &self.source_mapping);
            error = single.pop().expect("vec of one");
        }
        let index = self.errors.len();
        self.error_nodes.entry(node.id()).or_default().push(index);
        if node.pos() <= error.pos() && error.pos() <= node.pos() + node.strlen().max(1) {
            self.error_positions
                .entry(error.pos())
                .or_default()
                .insert(node.id());
        }
        self.error_flag = self.error_flag.max(error.code());
        self.error_set.insert((error.code(), error.pos()));
        self.errors.push(error);
        self
    }

    /// Finds the first leaf from the left that could contain the error,
    /// judging from its position.
    fn locate_error_node(&self, error: &Error) -> Node {
        let mut pos_list: Vec<usize> = Vec::new();
        let mut node_list: Vec<Node> = Vec::new();
        let mut last: Option<Node> = None;
        for nd in self
            .node
            .select_if(Rc::new(|nd: &Node| nd.is_leaf()), false, false, Rc::new(|_| false))
        {
            if nd.pos() <= error.pos() && error.pos() < nd.pos() + nd.strlen() {
                return nd;
            }
            pos_list.push(nd.pos());
            node_list.push(nd.clone());
            last = Some(nd);
        }
        match last {
            None => self.node.clone(),
            Some(last) => {
                node_list.push(last);
                let i = pos_list.partition_point(|&p| p <= error.pos());
                node_list[i].clone()
            }
        }
    }

    /// Records a new error with the given message and code at `node`.
    pub fn new_error(
        &mut self,
        node: &Node,
        message: impl Into<String>,
        code: ErrorCode,
    ) -> &mut Self {
        let error = Error::new(message, node.pos_opt().unwrap_or(0), code);
        self.add_error(Some(node), error)
    }

    /// All errors attached to `node` or to dropped descendants within the
    /// node's position range `[pos, pos + strlen)`.
    pub fn node_errors(&self, node: &Node) -> Vec<Error> {
        let node_id = node.id();
        let start_pos = match node.pos_opt() {
            Some(pos) => pos,
            None => return Vec::new(),
        };
        let end_pos = start_pos + node.strlen().max(1);
        let mut error_node_ids: HashSet<NodeId> = HashSet::new();
        for (&pos, ids) in &self.error_positions {
            if start_pos <= pos && pos < end_pos {
                error_node_ids.extend(ids.iter().copied());
            }
        }
        let mut errors = Vec::new();
        for nid in error_node_ids {
            if nid == node_id {
                self.extend_node_errors(&mut errors, nid);
            } else if node.has_children() {
                let connected = node
                    .select_if(
                        Rc::new(move |nd: &Node| nd.id() == nid),
                        false,
                        false,
                        Rc::new(|_| false),
                    )
                    .next()
                    .is_some();
                if !connected {
                    // the node carrying the error is not part of the tree
                    // anymore; display its errors on this ancestor
                    self.extend_node_errors(&mut errors, nid);
                }
            }
        }
        errors
    }

    fn extend_node_errors(&self, errors: &mut Vec<Error>, nid: NodeId) {
        if let Some(indices) = self.error_nodes.get(&nid) {
            errors.extend(indices.iter().map(|&i| self.errors[i].clone()));
        }
    }

    /// True if errors are attached to `node` itself.
    pub fn has_node_errors(&self, node: &Node) -> bool {
        self.error_nodes.contains_key(&node.id())
    }

    /// Moves all errors from `src` to `dst`. Transformations that drop a
    /// node must relocate its errors this way.
    pub fn transfer_errors(&mut self, src: &Node, dst: &Node) {
        let src_id = src.id();
        let dst_id = dst.id();
        if src_id == dst_id {
            return;
        }
        if let Some(indices) = self.error_nodes.remove(&src_id) {
            self.error_nodes.entry(dst_id).or_default().extend(indices);
            for ids in self.error_positions.values_mut() {
                if ids.remove(&src_id) {
                    ids.insert(dst_id);
                }
            }
        }
    }

    /// Returns `self` if no error with a code of at least `level` has been
    /// recorded, fails otherwise.
    pub fn error_safe(&self, level: ErrorCode) -> Result<&Self, TreeError> {
        if has_errors(&self.errors, level) {
            let rendered: Vec<String> = only_errors(&self.errors, level)
                .map(|e| e.to_string())
                .collect();
            return Err(TreeError::ErrorsPresent(rendered.join("\n")));
        }
        Ok(self)
    }

    /// True if the parser that generated this tree did match, i.e. the
    /// tree has been swallowed and no "parser stopped before end" error
    /// occurred. A match does not imply the absence of other errors.
    pub fn did_match(&self) -> bool {
        self.swallowed
            && !self
                .errors
                .iter()
                .any(|e| e.code() == PARSER_STOPPED_BEFORE_END)
    }

    /// Deep-copies the tree together with its global state, remapping the
    /// error bookkeeping onto the copied nodes. Compiled data is not
    /// copied.
    pub fn clone_tree(&self) -> RootNode {
        let old_ids: Vec<NodeId> = self.node.walk_tree(true, false).map(|nd| nd.id()).collect();
        let duplicate = self.node.deep_clone();
        let new_ids: Vec<NodeId> = duplicate.walk_tree(true, false).map(|nd| nd.id()).collect();
        let id_map: HashMap<NodeId, NodeId> =
            old_ids.into_iter().zip(new_ids).collect();
        RootNode {
            node: duplicate,
            errors: self.errors.clone(),
            error_set: self.error_set.clone(),
            error_nodes: self
                .error_nodes
                .iter()
                .map(|(id, indices)| (*id_map.get(id).unwrap_or(id), indices.clone()))
                .collect(),
            error_positions: self
                .error_positions
                .iter()
                .map(|(pos, ids)| {
                    (
                        *pos,
                        ids.iter().map(|id| *id_map.get(id).unwrap_or(id)).collect(),
                    )
                })
                .collect(),
            error_flag: self.error_flag,
            source: self.source.clone(),
            source_mapping: self.source_mapping.clone(),
            lbreaks: self.lbreaks.clone(),
            inline_tags: self.inline_tags.clone(),
            string_tags: self.string_tags.clone(),
            empty_tags: self.empty_tags.clone(),
            docname: self.docname.clone(),
            stage: self.stage.clone(),
            serialization_type: self.serialization_type.clone(),
            swallowed: self.swallowed,
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read::parse_sxpr;
    use sylva_core::{ERROR, FATAL, WARNING};

    fn sample_root() -> RootNode {
        let root = parse_sxpr(r#"(doc (a "123") (b "456"))"#).unwrap();
        root.with_pos(0);
        root
    }

    #[test]
    fn swallow_adopts_tree_and_source() {
        let root = sample_root();
        assert_eq!(root.name(), "doc");
        assert_eq!(root.content(), "123456");
        assert_eq!(root.source(), "123456");
        assert!(root.did_match());
    }

    #[test]
    #[should_panic(expected = "already been called")]
    fn swallow_twice_fails() {
        let mut root = sample_root();
        root.swallow(Some(Node::new_leaf("x", "")), None, None);
    }

    #[test]
    fn swallow_none_creates_zombie() {
        let mut root = RootNode::new();
        root.swallow(None, Some("source"), None);
        assert_eq!(root.name(), ZOMBIE_TAG);
        assert!(!root.did_match());
        assert_eq!(root.errors().len(), 1);
        assert_eq!(root.errors()[0].code(), PARSER_STOPPED_BEFORE_END);
    }

    #[test]
    fn errors_are_deduplicated() {
        let mut root = sample_root();
        let a = root.get("a").unwrap();
        root.new_error(&a, "problem", ERROR);
        root.new_error(&a, "problem", ERROR);
        assert_eq!(root.errors().len(), 1);
        assert_eq!(root.error_flag, ERROR);
    }

    #[test]
    fn error_flag_tracks_maximum() {
        let mut root = sample_root();
        let a = root.get("a").unwrap();
        let b = root.get("b").unwrap();
        root.new_error(&a, "warn", WARNING);
        assert_eq!(root.error_flag, WARNING);
        root.new_error(&b, "fatal", FATAL);
        assert_eq!(root.error_flag, FATAL);
    }

    #[test]
    fn add_error_without_node_bisects_on_position() {
        let mut root = sample_root();
        root.add_error(None, Error::new("somewhere", 4, ERROR));
        let b = root.get("b").unwrap();
        let attached = root.node_errors(&b);
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].message, "somewhere");
    }

    #[test]
    fn node_errors_include_dropped_descendants() {
        let mut root = sample_root();
        let a = root.get("a").unwrap();
        root.new_error(&a, "on a", ERROR);
        // drop "a" from the tree; its error shows up on the root now
        root.del_item("a").unwrap();
        let tree = root.tree().clone();
        let collected = root.node_errors(&tree);
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].message, "on a");
    }

    #[test]
    fn transfer_errors_relocates() {
        let mut root = sample_root();
        let a = root.get("a").unwrap();
        let b = root.get("b").unwrap();
        root.new_error(&a, "moving", ERROR);
        root.transfer_errors(&a, &b);
        assert!(root.node_errors(&a).is_empty());
        assert_eq!(root.node_errors(&b).len(), 1);
    }

    #[test]
    fn errors_sorted_by_position() {
        let mut root = sample_root();
        let b = root.get("b").unwrap();
        let a = root.get("a").unwrap();
        root.new_error(&b, "later", ERROR);
        root.new_error(&a, "earlier", ERROR);
        let sorted = root.errors_sorted();
        assert_eq!(sorted[0].message, "earlier");
        assert_eq!(sorted[1].message, "later");
    }

    #[test]
    fn error_safe_guards_level() {
        let mut root = sample_root();
        let a = root.get("a").unwrap();
        root.new_error(&a, "just a warning", WARNING);
        assert!(root.error_safe(ERROR).is_ok());
        assert!(root.error_safe(WARNING).is_err());
    }

    #[test]
    fn continue_with_data_replaces_tree() {
        let mut root = sample_root();
        root.continue_with_data(Box::new(42usize));
        assert_eq!(root.compiled_data::<usize>(), Some(&42));
        assert_eq!(root.content(), "");
    }

    #[test]
    fn clone_tree_remaps_error_bookkeeping() {
        let mut root = sample_root();
        let a = root.get("a").unwrap();
        root.new_error(&a, "on a", ERROR);
        let copy = root.clone_tree();
        let copy_a = copy.get("a").unwrap();
        assert_ne!(copy_a, a);
        assert_eq!(copy.node_errors(&copy_a).len(), 1);
        assert_eq!(copy.errors().len(), 1);
    }

    #[test]
    fn source_locations_resolved_for_new_errors() {
        let mut root = sample_root();
        let b = root.get("b").unwrap();
        root.new_error(&b, "oops", ERROR);
        assert_eq!(root.errors()[0].orig_pos, Some(3));
        assert_eq!(root.errors()[0].line, Some(1));
        assert_eq!(root.errors()[0].column, Some(4));
    }
}
