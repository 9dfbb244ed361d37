//! The node-tree data model.
//!
//! [`Node`] is the universal container for parsed documents. A node holds
//! either string content (a *leaf*) or an ordered sequence of child nodes
//! (a *branch*), never both: string runs interleaved with elements are
//! modeled as anonymous `:Text` children. Nodes are cheap reference-counted
//! handles; `clone()` clones the handle, [`Node::deep_clone`] copies the
//! subtree, and `==` compares node identity. Use [`Node::equals`] for
//! structural equality.

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use indexmap::IndexMap;
use thiserror::Error as ThisError;

use crate::criteria::{create_match_function, Criterion, NodeMatchFn, PathMatchFn};

/// Tag name of placeholder nodes inserted during error recovery. A zombie
/// node must not appear in a finalized tree's evaluation.
pub const ZOMBIE_TAG: &str = "ZOMBIE__";

/// Name of nodes capturing insignificant whitespace.
pub const WHITESPACE_PTYPE: &str = ":Whitespace";
/// Name of anonymous plain-text nodes; also used for text runs in
/// XML mixed content.
pub const TOKEN_PTYPE: &str = ":Text";
/// Name for plain text in XML-elements that contain both children and text.
pub const MIXED_CONTENT_TEXT_PTYPE: &str = ":Text";
pub const REGEXP_PTYPE: &str = ":RegExp";
pub const EMPTY_PTYPE: &str = ":EMPTY";
pub const CHAR_REF_PTYPE: &str = ":CharRef";
pub const ENTITY_REF_PTYPE: &str = ":EntityRef";

/// Names of parser-generated leaf nodes.
pub const LEAF_PTYPES: &[&str] = &[
    WHITESPACE_PTYPE,
    TOKEN_PTYPE,
    REGEXP_PTYPE,
    EMPTY_PTYPE,
    CHAR_REF_PTYPE,
    ENTITY_REF_PTYPE,
];

/// Node names that markup operations may split by default.
pub const DIVISIBLES: &[&str] = &[WHITESPACE_PTYPE, TOKEN_PTYPE, REGEXP_PTYPE, EMPTY_PTYPE];

/// Stable identity of a node, derived from its allocation. Used for error
/// bookkeeping and as a match criterion.
pub type NodeId = usize;

/// A path from a root to one of its descendants, root first.
pub type Path = Vec<Node>;

/// Failures of node lookups and child mutations.
#[derive(Debug, ThisError)]
pub enum TreeError {
    #[error("no child matching {0} found")]
    NotFound(String),
    #[error("index {index} out of range [0, {len})")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("cannot assign {given} values to {expected} matching items")]
    ArityMismatch { given: usize, expected: usize },
    #[error("node \"{0}\" does not occur in the tree")]
    NotInTree(String),
    #[error("tree contains errors:\n{0}")]
    ErrorsPresent(String),
}

/// Failures of [`Node::evaluate`].
#[derive(Debug, ThisError)]
pub enum EvalError {
    #[error("no action defined for node name \"{0}\"")]
    NoAction(String),
    #[error("zombie node found in tree")]
    ZombieNode,
    #[error("action for \"{name}\" failed: {message}")]
    ActionFailed { name: String, message: String },
}

/// The result of a node: either leaf text or an ordered sequence of
/// children, never both.
#[derive(Debug, Clone)]
pub enum NodeContent {
    Leaf(String),
    Branch(Vec<Node>),
}

#[derive(Debug)]
struct NodeData {
    name: String,
    content: NodeContent,
    pos: Option<usize>,
    attrs: Option<IndexMap<String, String>>,
    frozen: bool,
}

/// A named tree node carrying either a string leaf or an ordered sequence
/// of children, plus an optional attribute map and a write-once source
/// position.
#[derive(Clone)]
pub struct Node {
    data: Rc<RefCell<NodeData>>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.data) as usize).hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.content())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.borrow();
        match &data.content {
            NodeContent::Leaf(text) => write!(f, "Node({:?}, {:?})", data.name, text),
            NodeContent::Branch(children) => {
                write!(f, "Node({:?}, {:?})", data.name, children)
            }
        }
    }
}

impl Node {
    fn from_data(data: NodeData) -> Node {
        Node {
            data: Rc::new(RefCell::new(data)),
        }
    }

    /// Creates a branch node. An empty child sequence collapses to an
    /// empty leaf.
    pub fn new(name: impl Into<String>, children: Vec<Node>) -> Node {
        let content = if children.is_empty() {
            NodeContent::Leaf(String::new())
        } else {
            NodeContent::Branch(children)
        };
        Node::from_data(NodeData {
            name: name.into(),
            content,
            pos: None,
            attrs: None,
            frozen: false,
        })
    }

    /// Creates a leaf node with the given string content.
    pub fn new_leaf(name: impl Into<String>, text: impl Into<String>) -> Node {
        Node::from_data(NodeData {
            name: name.into(),
            content: NodeContent::Leaf(text.into()),
            pos: None,
            attrs: None,
            frozen: false,
        })
    }

    /// Creates an immutable leaf placeholder. Frozen nodes must not appear
    /// in a finalized tree; see [`tree_sanity_check`].
    pub fn frozen(name: impl Into<String>, text: impl Into<String>) -> Node {
        Node::from_data(NodeData {
            name: name.into(),
            content: NodeContent::Leaf(text.into()),
            pos: None,
            attrs: None,
            frozen: true,
        })
    }

    pub(crate) fn with_content(name: impl Into<String>, content: NodeContent) -> Node {
        match content {
            NodeContent::Leaf(text) => Node::new_leaf(name, text),
            NodeContent::Branch(children) => Node::new(name, children),
        }
    }

    /// A frozen, empty placeholder node.
    pub fn placeholder() -> Node {
        Node::frozen("__PLACEHOLDER__", "")
    }

    /// A frozen node representing the empty parse result.
    pub fn empty_node() -> Node {
        Node::frozen(EMPTY_PTYPE, "")
    }

    // identity and naming ////////////////////////////////////////////////

    /// Stable identity of this node (valid as long as any handle to the
    /// node is alive).
    pub fn id(&self) -> NodeId {
        Rc::as_ptr(&self.data) as usize
    }

    pub fn name(&self) -> String {
        self.data.borrow().name.clone()
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.data.borrow().name == name
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.data.borrow_mut().name = name.into();
    }

    /// True if the node has not been created by a named parser, i.e. its
    /// name is empty or starts with a colon.
    pub fn is_anonymous(&self) -> bool {
        let data = self.data.borrow();
        data.name.is_empty() || data.name.starts_with(':')
    }

    pub fn is_frozen(&self) -> bool {
        self.data.borrow().frozen
    }

    // content ////////////////////////////////////////////////////////////

    pub fn is_leaf(&self) -> bool {
        matches!(self.data.borrow().content, NodeContent::Leaf(_))
    }

    pub fn has_children(&self) -> bool {
        !self.is_leaf()
    }

    /// The child sequence; empty for leaves. Returns handles, not copies.
    pub fn children(&self) -> Vec<Node> {
        match &self.data.borrow().content {
            NodeContent::Leaf(_) => Vec::new(),
            NodeContent::Branch(children) => children.clone(),
        }
    }

    pub fn child_count(&self) -> usize {
        match &self.data.borrow().content {
            NodeContent::Leaf(_) => 0,
            NodeContent::Branch(children) => children.len(),
        }
    }

    pub fn child(&self, index: usize) -> Option<Node> {
        match &self.data.borrow().content {
            NodeContent::Leaf(_) => None,
            NodeContent::Branch(children) => children.get(index).cloned(),
        }
    }

    /// True if the node holds neither text nor children.
    pub fn is_empty(&self) -> bool {
        match &self.data.borrow().content {
            NodeContent::Leaf(text) => text.is_empty(),
            NodeContent::Branch(children) => children.is_empty(),
        }
    }

    /// Length of the result: string length for a leaf, number of children
    /// for a branch. This is the index space used by node splitting.
    pub(crate) fn result_len(&self) -> usize {
        match &self.data.borrow().content {
            NodeContent::Leaf(text) => text.len(),
            NodeContent::Branch(children) => children.len(),
        }
    }

    pub(crate) fn raw_content(&self) -> NodeContent {
        self.data.borrow().content.clone()
    }

    /// A copy of the node's result: the leaf text, or the child handles.
    pub fn result(&self) -> NodeContent {
        self.raw_content()
    }

    pub(crate) fn result_slice(&self, start: usize, end: usize) -> NodeContent {
        match &self.data.borrow().content {
            NodeContent::Leaf(text) => NodeContent::Leaf(text[start..end].to_string()),
            NodeContent::Branch(children) => NodeContent::Branch(children[start..end].to_vec()),
        }
    }

    pub(crate) fn result_slice_from(&self, start: usize) -> NodeContent {
        self.result_slice(start, self.result_len())
    }

    pub(crate) fn result_slice_to(&self, end: usize) -> NodeContent {
        self.result_slice(0, end)
    }

    /// Concatenates all leaf strings in depth-first order.
    pub fn content(&self) -> String {
        let mut buf = String::new();
        self.write_content(&mut buf);
        buf
    }

    fn write_content(&self, buf: &mut String) {
        match &self.data.borrow().content {
            NodeContent::Leaf(text) => buf.push_str(text),
            NodeContent::Branch(children) => {
                for child in children {
                    child.write_content(buf);
                }
            }
        }
    }

    /// Total length of [`Node::content`] without materializing it.
    pub fn strlen(&self) -> usize {
        match &self.data.borrow().content {
            NodeContent::Leaf(text) => text.len(),
            NodeContent::Branch(children) => children.iter().map(|c| c.strlen()).sum(),
        }
    }

    fn assert_mutable(&self) {
        assert!(
            !self.data.borrow().frozen,
            "frozen nodes do not allow re-assignment of results"
        );
    }

    pub(crate) fn set_result_raw(&self, content: NodeContent) {
        let normalized = match content {
            NodeContent::Branch(children) if children.is_empty() => {
                NodeContent::Leaf(String::new())
            }
            other => other,
        };
        self.data.borrow_mut().content = normalized;
    }

    fn repropagate_pos(&self) {
        // children added after parsing inherit their positions from the
        // already assigned position of this node
        if let Some(pos) = self.pos_opt() {
            self.force_pos(None);
            self.with_pos(pos);
        }
    }

    /// Replaces the node's content with a child sequence.
    pub fn set_children(&self, children: Vec<Node>) {
        self.assert_mutable();
        self.set_result_raw(NodeContent::Branch(children));
        self.repropagate_pos();
    }

    /// Replaces the node's content with string content.
    pub fn set_text(&self, text: impl Into<String>) {
        self.assert_mutable();
        self.set_result_raw(NodeContent::Leaf(text.into()));
        self.repropagate_pos();
    }

    /// Replaces the node's result. An already assigned position is
    /// propagated to newly added children, as with [`Node::set_children`].
    pub fn set_result(&self, content: NodeContent) {
        self.assert_mutable();
        self.set_result_raw(content);
        self.repropagate_pos();
    }

    /// Replaces this node's name, content and attributes by those of
    /// another node, so that the parent's child sequence need not change.
    pub fn replace_by(&self, replacement: &Node, merge_attr: bool) {
        if self.pos_opt().is_none() {
            self.force_pos(replacement.pos_opt());
        } else if replacement.pos_opt().is_none() {
            replacement.with_pos(self.pos());
        }
        self.set_name(replacement.name());
        self.set_result(replacement.raw_content());
        if replacement.has_attr() {
            if !merge_attr {
                self.clear_attrs();
            }
            self.update_attrs(replacement.attrs());
        }
    }

    // position ///////////////////////////////////////////////////////////

    /// The node's position in the source text. Panics if the position has
    /// not been initialized; probe with [`Node::pos_opt`].
    pub fn pos(&self) -> usize {
        self.data
            .borrow()
            .pos
            .expect("position value not initialized, use Node::with_pos()")
    }

    pub fn pos_opt(&self) -> Option<usize> {
        self.data.borrow().pos
    }

    pub(crate) fn force_pos(&self, pos: Option<usize>) {
        self.data.borrow_mut().pos = pos;
    }

    /// Initializes the node's position value and recursively the positions
    /// of all descendants whose positions are still unassigned, advancing
    /// by the leaves' string lengths. Idempotent when called again with the
    /// same value; panics when called with a different one.
    pub fn with_pos(&self, pos: usize) -> Node {
        assert!(
            !self.is_frozen(),
            "position values cannot be assigned to frozen nodes"
        );
        if let Some(current) = self.pos_opt() {
            assert!(
                current == pos,
                "position value {} of node {} cannot be reassigned to a different value ({})",
                current,
                self.name(),
                pos
            );
            return self.clone();
        }
        self.force_pos(Some(pos));
        let mut cursor = pos;
        for nd in self.walk_tree(false, false) {
            match nd.pos_opt() {
                None => {
                    nd.force_pos(Some(cursor));
                    if nd.is_leaf() {
                        cursor += nd.strlen();
                    }
                }
                Some(p) => {
                    cursor = p + nd.strlen();
                }
            }
        }
        self.clone()
    }

    // attributes /////////////////////////////////////////////////////////

    /// True if any attributes are present. Never allocates the attribute
    /// map.
    pub fn has_attr(&self) -> bool {
        self.data
            .borrow()
            .attrs
            .as_ref()
            .is_some_and(|attrs| !attrs.is_empty())
    }

    pub fn has_attr_named(&self, name: &str) -> bool {
        self.data
            .borrow()
            .attrs
            .as_ref()
            .is_some_and(|attrs| attrs.contains_key(name))
    }

    /// The value of `name`, or `default` if the attribute does not exist.
    /// Does not allocate the attribute map.
    pub fn get_attr(&self, name: &str, default: &str) -> String {
        self.data
            .borrow()
            .attrs
            .as_ref()
            .and_then(|attrs| attrs.get(name).cloned())
            .unwrap_or_else(|| default.to_string())
    }

    /// A copy of the attribute map (empty if no attributes are present).
    pub fn attrs(&self) -> IndexMap<String, String> {
        self.data.borrow().attrs.clone().unwrap_or_default()
    }

    fn assert_attr_mutable(&self) {
        let data = self.data.borrow();
        assert!(
            !(data.frozen && data.attrs.is_some()),
            "frozen nodes' attributes can only be set once"
        );
    }

    pub fn set_attr(&self, name: impl Into<String>, value: impl Into<String>) {
        self.assert_attr_mutable();
        self.data
            .borrow_mut()
            .attrs
            .get_or_insert_with(IndexMap::new)
            .insert(name.into(), value.into());
    }

    pub fn remove_attr(&self, name: &str) {
        if let Some(attrs) = self.data.borrow_mut().attrs.as_mut() {
            attrs.shift_remove(name);
        }
    }

    pub fn clear_attrs(&self) {
        self.data.borrow_mut().attrs = None;
    }

    pub fn set_attrs(&self, attrs: IndexMap<String, String>) {
        self.assert_attr_mutable();
        self.data.borrow_mut().attrs = Some(attrs);
    }

    pub fn update_attrs<K, V>(&self, attrs: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.assert_attr_mutable();
        let mut data = self.data.borrow_mut();
        let map = data.attrs.get_or_insert_with(IndexMap::new);
        for (k, v) in attrs {
            map.insert(k.into(), v.into());
        }
    }

    /// Adds the given attributes and returns the node, for chaining.
    pub fn with_attr<K, V>(&self, attrs: impl IntoIterator<Item = (K, V)>) -> Node
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut iter = attrs.into_iter().peekable();
        if iter.peek().is_some() {
            self.update_attrs(iter);
        }
        self.clone()
    }

    /// True if `self` and `other` carry the same attributes with the same
    /// values. With `ignore_order` set to false, the attributes must also
    /// appear in the same order.
    pub fn has_equal_attr(&self, other: &Node, ignore_order: bool) -> bool {
        let a = self.attrs();
        let b = other.attrs();
        if ignore_order {
            a == b
        } else {
            a.iter().eq(b.iter())
        }
    }

    // copies /////////////////////////////////////////////////////////////

    /// Copies the entire subtree, including attributes and positions.
    pub fn deep_clone(&self) -> Node {
        let data = self.data.borrow();
        let content = match &data.content {
            NodeContent::Leaf(text) => NodeContent::Leaf(text.clone()),
            NodeContent::Branch(children) => {
                NodeContent::Branch(children.iter().map(|c| c.deep_clone()).collect())
            }
        };
        Node::from_data(NodeData {
            name: data.name.clone(),
            content,
            pos: data.pos,
            attrs: data.attrs.clone(),
            frozen: data.frozen,
        })
    }

    /// Copies only this node; children remain shared handles.
    pub(crate) fn shallow_copy(&self) -> Node {
        let data = self.data.borrow();
        Node::from_data(NodeData {
            name: data.name.clone(),
            content: data.content.clone(),
            pos: data.pos,
            attrs: data.attrs.clone(),
            frozen: data.frozen,
        })
    }

    /// Structural equality: same name, equal attributes, and recursively
    /// equal children or equal string content.
    pub fn equals(&self, other: &Node, ignore_attr_order: bool) -> bool {
        if self.name() != other.name() || !self.has_equal_attr(other, ignore_attr_order) {
            return false;
        }
        match (&self.data.borrow().content, &other.data.borrow().content) {
            (NodeContent::Leaf(a), NodeContent::Leaf(b)) => a == b,
            (NodeContent::Branch(a), NodeContent::Branch(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.equals(y, ignore_attr_order))
            }
            _ => false,
        }
    }

    // child access and mutation //////////////////////////////////////////

    /// The first child matching the criterion, if any.
    pub fn get(&self, criterion: impl Into<Criterion>) -> Option<Node> {
        let mf = create_match_function(criterion.into());
        self.children().into_iter().find(|child| mf(child))
    }

    /// All children matching the criterion.
    pub fn get_all(&self, criterion: impl Into<Criterion>) -> Vec<Node> {
        let mf = create_match_function(criterion.into());
        self.children().into_iter().filter(|c| mf(c)).collect()
    }

    /// True if at least one child matches the criterion.
    pub fn contains(&self, criterion: impl Into<Criterion>) -> bool {
        self.get(criterion).is_some()
    }

    /// Replaces the children matching the criterion by the given values;
    /// the number of matches and values must agree.
    pub fn set_item(&self, criterion: impl Into<Criterion>, values: Vec<Node>) -> Result<(), TreeError> {
        let criterion = criterion.into();
        let mf = create_match_function(criterion.clone());
        let mut children = self.children();
        let indices: Vec<usize> = children
            .iter()
            .enumerate()
            .filter(|(_, c)| mf(c))
            .map(|(i, _)| i)
            .collect();
        if indices.is_empty() {
            return Err(TreeError::NotFound(format!("{:?}", criterion)));
        }
        if indices.len() != values.len() {
            return Err(TreeError::ArityMismatch {
                given: values.len(),
                expected: indices.len(),
            });
        }
        for (i, value) in indices.into_iter().zip(values) {
            children[i] = value;
        }
        self.set_children(children);
        Ok(())
    }

    /// Removes all children matching the criterion.
    pub fn del_item(&self, criterion: impl Into<Criterion>) -> Result<(), TreeError> {
        let criterion = criterion.into();
        let mf = create_match_function(criterion.clone());
        let children = self.children();
        let remaining: Vec<Node> = children.iter().filter(|c| !mf(c)).cloned().collect();
        if remaining.len() == children.len() {
            return Err(TreeError::NotFound(format!("{:?}", criterion)));
        }
        self.set_children(remaining);
        Ok(())
    }

    /// Removes the children with indices in the given range.
    pub fn del_range(&self, range: std::ops::Range<usize>) -> Result<(), TreeError> {
        let children = self.children();
        if range.end > children.len() {
            return Err(TreeError::IndexOutOfRange {
                index: range.end,
                len: children.len(),
            });
        }
        let remaining: Vec<Node> = children
            .iter()
            .enumerate()
            .filter(|(i, _)| !range.contains(i))
            .map(|(_, c)| c.clone())
            .collect();
        self.set_children(remaining);
        Ok(())
    }

    /// Removes the child with the given index.
    pub fn del_child(&self, index: usize) -> Result<(), TreeError> {
        let mut children = self.children();
        if index >= children.len() {
            return Err(TreeError::IndexOutOfRange {
                index,
                len: children.len(),
            });
        }
        children.remove(index);
        self.set_children(children);
        Ok(())
    }

    /// Inserts a node at position `index` among the children.
    pub fn insert_child(&self, index: usize, node: Node) {
        assert!(
            self.has_children() || self.is_empty(),
            "Node::insert_child() called on a leaf node"
        );
        let mut children = self.children();
        let index = index.min(children.len());
        children.insert(index, node);
        self.set_children(children);
    }

    /// Removes `node` from the children. Panics if `node` is not among
    /// them.
    pub fn remove_node(&self, node: &Node) {
        let children = self.children();
        let remaining: Vec<Node> = children.iter().filter(|c| *c != node).cloned().collect();
        assert!(
            remaining.len() < children.len(),
            "Node::remove_node(): node not among children"
        );
        self.set_children(remaining);
    }

    /// The index of the first child matching the criterion.
    pub fn index(&self, criterion: impl Into<Criterion>) -> Result<usize, TreeError> {
        self.index_within(criterion, 0, usize::MAX)
    }

    /// Like [`Node::index`], but restricted to children with indices in
    /// the half-open interval `[start, stop)`.
    pub fn index_within(
        &self,
        criterion: impl Into<Criterion>,
        start: usize,
        stop: usize,
    ) -> Result<usize, TreeError> {
        assert!(start < stop);
        let criterion = criterion.into();
        let mf = create_match_function(criterion.clone());
        for (i, child) in self.children().into_iter().enumerate() {
            if i < start {
                continue;
            }
            if i >= stop {
                break;
            }
            if mf(&child) {
                return Ok(i);
            }
        }
        Err(TreeError::NotFound(format!("{:?}", criterion)))
    }

    /// The indices of all children matching the criterion.
    pub fn indices(&self, criterion: impl Into<Criterion>) -> Vec<usize> {
        let mf = create_match_function(criterion.into());
        self.children()
            .iter()
            .enumerate()
            .filter(|(_, c)| mf(c))
            .map(|(i, _)| i)
            .collect()
    }

    // traversal //////////////////////////////////////////////////////////

    /// Iterates over all nodes of the tree in pre-order.
    pub fn walk_tree(&self, include_root: bool, reverse: bool) -> SelectIter {
        self.select_if(Rc::new(|_| true), include_root, reverse, Rc::new(|_| false))
    }

    /// Iterates over all paths of the tree in pre-order.
    pub fn walk_tree_paths(&self, include_root: bool, reverse: bool) -> SelectPathIter {
        self.select_path_if(
            Rc::new(|_| true),
            include_root,
            reverse,
            Rc::new(|_| false),
        )
    }

    /// Lazy pre-order iterator over all descendants for which `match_fn`
    /// is true. Subtrees whose root satisfies `skip_fn` are not descended
    /// into (their root is still yielded when it matches).
    pub fn select_if(
        &self,
        match_fn: NodeMatchFn,
        include_root: bool,
        reverse: bool,
        skip_fn: NodeMatchFn,
    ) -> SelectIter {
        let mut frames = Vec::new();
        if include_root {
            frames.push(vec![self.clone()].into_iter());
        } else {
            let mut children = self.children();
            if reverse {
                children.reverse();
            }
            frames.push(children.into_iter());
        }
        SelectIter {
            frames,
            match_fn,
            skip_fn,
            reverse,
        }
    }

    /// See [`Node::select_if`]; takes a [`Criterion`] instead of a match
    /// function.
    pub fn select(
        &self,
        criterion: impl Into<Criterion>,
        include_root: bool,
    ) -> SelectIter {
        self.select_if(
            create_match_function(criterion.into()),
            include_root,
            false,
            Rc::new(|_| false),
        )
    }

    /// Iterates over the direct children matching the criterion.
    pub fn select_children(
        &self,
        criterion: impl Into<Criterion>,
        reverse: bool,
    ) -> impl Iterator<Item = Node> {
        let mf = create_match_function(criterion.into());
        let mut children = self.children();
        if reverse {
            children.reverse();
        }
        children.into_iter().filter(move |c| mf(c))
    }

    /// First matching descendant, or `None`.
    pub fn pick_if(
        &self,
        match_fn: NodeMatchFn,
        include_root: bool,
        reverse: bool,
    ) -> Option<Node> {
        self.select_if(match_fn, include_root, reverse, Rc::new(|_| false))
            .next()
    }

    /// First (or last, with `reverse`) descendant matching the criterion,
    /// or `None`.
    pub fn pick(&self, criterion: impl Into<Criterion>, include_root: bool, reverse: bool) -> Option<Node> {
        self.pick_if(create_match_function(criterion.into()), include_root, reverse)
    }

    /// First (or last) child matching the criterion, or `None`.
    pub fn pick_child(&self, criterion: impl Into<Criterion>, reverse: bool) -> Option<Node> {
        self.select_children(criterion, reverse).next()
    }

    /// Like [`Node::select_if`], but yields the full ancestor path
    /// (root-first) to each match. The match function receives the
    /// complete path.
    pub fn select_path_if(
        &self,
        match_fn: PathMatchFn,
        include_root: bool,
        reverse: bool,
        skip_fn: PathMatchFn,
    ) -> SelectPathIter {
        let mut frames = Vec::new();
        if include_root {
            frames.push(vec![self.clone()].into_iter());
        } else {
            let mut children = self.children();
            if reverse {
                children.reverse();
            }
            frames.push(children.into_iter());
        }
        SelectPathIter {
            frames,
            path: if include_root {
                Vec::new()
            } else {
                vec![self.clone()]
            },
            match_fn,
            skip_fn,
            reverse,
        }
    }

    /// See [`Node::select_path_if`].
    pub fn select_path(
        &self,
        criterion: impl Into<crate::criteria::PathCriterion>,
        include_root: bool,
    ) -> SelectPathIter {
        self.select_path_if(
            crate::criteria::create_path_match_function(criterion.into()),
            include_root,
            false,
            Rc::new(|_| false),
        )
    }

    /// First path matching the path-match function, or `None`.
    pub fn pick_path_if(
        &self,
        match_fn: PathMatchFn,
        include_root: bool,
        reverse: bool,
        skip_fn: PathMatchFn,
    ) -> Option<Path> {
        self.select_path_if(match_fn, include_root, reverse, skip_fn).next()
    }

    /// First path matching the criterion, or `None`.
    pub fn pick_path(
        &self,
        criterion: impl Into<crate::criteria::PathCriterion>,
        include_root: bool,
        reverse: bool,
    ) -> Option<Path> {
        self.pick_path_if(
            crate::criteria::create_path_match_function(criterion.into()),
            include_root,
            reverse,
            Rc::new(|_| false),
        )
    }

    /// The leaf descendant covering the given offset within
    /// [`Node::content`], or `None` if the offset lies outside.
    pub fn locate(&self, location: usize) -> Option<Node> {
        let mut end = 0;
        for nd in self.select_if(Rc::new(|nd| nd.is_leaf()), true, false, Rc::new(|_| false)) {
            end += nd.strlen();
            if location < end {
                return Some(nd);
            }
        }
        None
    }

    /// Like [`Node::locate`], but returns the full path to the leaf.
    pub fn locate_path(&self, location: usize) -> Option<Path> {
        let mut end = 0;
        for path in self.select_path_if(
            Rc::new(|path: &[Node]| path.last().is_some_and(|nd| nd.is_leaf())),
            true,
            false,
            Rc::new(|_| false),
        ) {
            end += path.last().unwrap().strlen();
            if location < end {
                return Some(path);
            }
        }
        None
    }

    /// The parent of `node` within the tree rooted in `self`, or `None`.
    pub fn find_parent(&self, node: &Node) -> Option<Node> {
        for nd in self.select_if(Rc::new(|nd| nd.has_children()), true, false, Rc::new(|_| false))
        {
            if nd.children().iter().any(|c| c == node) {
                return Some(nd);
            }
        }
        None
    }

    /// The path from `self` to `node`. Fails if `node` does not occur in
    /// the subtree.
    pub fn reconstruct_path(&self, node: &Node) -> Result<Path, TreeError> {
        fn recursive(current: &Node, node: &Node) -> Option<Path> {
            if current.children().iter().any(|c| c == node) {
                return Some(vec![node.clone(), current.clone()]);
            }
            for child in current.children() {
                if let Some(mut path) = recursive(&child, node) {
                    path.push(current.clone());
                    return Some(path);
                }
            }
            None
        }
        if node == self {
            return Ok(vec![node.clone()]);
        }
        match recursive(self, node) {
            Some(mut path) => {
                path.reverse();
                Ok(path)
            }
            None => Err(TreeError::NotInTree(node.name())),
        }
    }

    /// Picks the minimal subtree covering the two milestone nodes, cloning
    /// nodes at the boundary so that the original tree is not modified.
    pub fn milestone_segment(&self, begin: &Node, end: &Node) -> Result<Node, TreeError> {
        fn index_of(parent: &Node, nd: &Node) -> usize {
            parent
                .children()
                .iter()
                .position(|c| c == nd)
                .expect("path nodes must be parent and child")
        }

        fn cut(path: &[Node], left: bool) -> Node {
            let mut child = path[path.len() - 1].clone();
            let mut tainted = false;
            for i in (1..path.len()).rev() {
                let parent = &path[i - 1];
                let k = index_of(parent, &path[i]);
                let children = parent.children();
                let segment: Vec<Node> = if left {
                    std::iter::once(child.clone())
                        .chain(children[k + 1..].iter().cloned())
                        .collect()
                } else {
                    children[..k]
                        .iter()
                        .cloned()
                        .chain(std::iter::once(child.clone()))
                        .collect()
                };
                if tainted || segment.len() != children.len() {
                    let parent_copy = Node::new(parent.name(), segment);
                    if parent.has_attr() {
                        parent_copy.set_attrs(parent.attrs());
                    }
                    child = parent_copy;
                    tainted = true;
                } else {
                    child = parent.clone();
                }
            }
            child
        }

        let (begin, end) = if begin.pos() > end.pos() {
            (end, begin)
        } else {
            (begin, end)
        };
        let path_a = self.reconstruct_path(begin)?;
        let path_b = self.reconstruct_path(end)?;
        let mut common_ancestor = self.clone();
        let mut depth = 0;
        for (i, (a, b)) in path_a.iter().zip(path_b.iter()).enumerate() {
            if a != b {
                break;
            }
            common_ancestor = a.clone();
            depth = i;
        }
        let left = cut(&path_a[depth..], true);
        let right = cut(&path_b[depth..], false);
        let left_children = left.children();
        let right_children = right.children();
        if left_children == right_children {
            return Ok(common_ancestor);
        }
        let mut i: usize = 1;
        let mut k: isize = right_children.len() as isize;
        if left_children.len() > 1 {
            if let Some(p) = right_children.iter().position(|c| *c == left_children[1]) {
                k = p as isize - 1;
                i = 2;
                while i < left_children.len()
                    && k + (i as isize) >= 0
                    && ((k + i as isize) as usize) < right_children.len()
                    && left_children[i] == right_children[(k + i as isize) as usize]
                {
                    i += 1;
                }
            }
        }
        let tail_start = (k + i as isize).clamp(0, right_children.len() as isize) as usize;
        let merged: Vec<Node> = left_children[..i.min(left_children.len())]
            .iter()
            .cloned()
            .chain(right_children[tail_start..].iter().cloned())
            .collect();
        let new_ca = Node::new(common_ancestor.name(), merged);
        if common_ancestor.has_attr() {
            new_ca.set_attrs(common_ancestor.attrs());
        }
        Ok(new_ca)
    }

    /// Splits the tree into several trees at every path for which the
    /// milestone function is true. The matched node itself is removed.
    pub fn split_if(&self, milestone: PathMatchFn, skip_fn: PathMatchFn) -> Vec<Node> {
        let mut result = Vec::new();
        let mut tail = self.clone();
        let mut msp = self.pick_path_if(milestone.clone(), true, false, skip_fn.clone());
        while let Some(path) = msp {
            if path.len() < 2 {
                return Vec::new();
            }
            let parent = &path[path.len() - 2];
            let i = parent
                .children()
                .iter()
                .position(|c| c == path.last().unwrap())
                .expect("milestone must be a child of its parent");
            parent.del_child(i).expect("index just looked up");
            let (head, new_tail) =
                crate::mapping::full_split(&path[..path.len() - 1], i, true, true);
            result.push(head);
            tail = new_tail;
            msp = if !tail.is_empty() {
                tail.pick_path_if(milestone.clone(), true, false, skip_fn.clone())
            } else {
                None
            };
        }
        result.push(tail);
        result
    }

    /// See [`Node::split_if`].
    pub fn split(&self, milestone: impl Into<crate::criteria::PathCriterion>) -> Vec<Node> {
        self.split_if(
            crate::criteria::create_path_match_function(milestone.into()),
            Rc::new(|_| false),
        )
    }

    // evaluation /////////////////////////////////////////////////////////

    /// Bottom-up evaluation: for each node, the action registered for the
    /// node's name is called with the evaluated children (or, for leaves,
    /// the content string). Falls back to the action registered for `"*"`.
    /// Zombie nodes always fail.
    pub fn evaluate<V>(&self, actions: &EvalActions<V>) -> Result<V, EvalError> {
        let mut path = vec![self.clone()];
        self.evaluate_rec(actions, &mut path)
    }

    fn evaluate_rec<V>(&self, actions: &EvalActions<V>, path: &mut Path) -> Result<V, EvalError> {
        let args = if self.has_children() {
            let mut values = Vec::new();
            for child in self.children() {
                path.push(child.clone());
                let value = child.evaluate_rec(actions, path)?;
                path.pop();
                values.push(value);
            }
            EvalArgs::Children(values)
        } else {
            EvalArgs::Leaf(self.content())
        };
        let name = self.name();
        let action = match actions.map.get(&name) {
            Some(action) => action,
            None if name == ZOMBIE_TAG => return Err(EvalError::ZombieNode),
            None => actions
                .map
                .get("*")
                .ok_or(EvalError::NoAction(name))?,
        };
        action(path, args)
    }
}

/// Arguments handed to an evaluation action: the content string for a
/// leaf, the evaluated child values for a branch.
pub enum EvalArgs<V> {
    Leaf(String),
    Children(Vec<V>),
}

type EvalAction<V> = Rc<dyn Fn(&[Node], EvalArgs<V>) -> Result<V, EvalError>>;

/// A name-keyed table of evaluation actions; see [`Node::evaluate`].
pub struct EvalActions<V> {
    map: IndexMap<String, EvalAction<V>>,
}

impl<V> Default for EvalActions<V> {
    fn default() -> Self {
        EvalActions {
            map: IndexMap::new(),
        }
    }
}

impl<V> EvalActions<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `action` for the node name `name`; `"*"` registers the
    /// fallback action.
    pub fn on(
        mut self,
        name: &str,
        action: impl Fn(&[Node], EvalArgs<V>) -> Result<V, EvalError> + 'static,
    ) -> Self {
        self.map.insert(name.to_string(), Rc::new(action));
        self
    }
}

/// Lazy pre-order node iterator, see [`Node::select_if`].
pub struct SelectIter {
    frames: Vec<std::vec::IntoIter<Node>>,
    match_fn: NodeMatchFn,
    skip_fn: NodeMatchFn,
    reverse: bool,
}

impl Iterator for SelectIter {
    type Item = Node;

    fn next(&mut self) -> Option<Node> {
        loop {
            let frame = self.frames.last_mut()?;
            match frame.next() {
                None => {
                    self.frames.pop();
                }
                Some(nd) => {
                    if nd.has_children() && !(self.skip_fn)(&nd) {
                        let mut children = nd.children();
                        if self.reverse {
                            children.reverse();
                        }
                        self.frames.push(children.into_iter());
                    }
                    if (self.match_fn)(&nd) {
                        return Some(nd);
                    }
                }
            }
        }
    }
}

/// Lazy pre-order path iterator, see [`Node::select_path_if`].
pub struct SelectPathIter {
    frames: Vec<std::vec::IntoIter<Node>>,
    path: Path,
    match_fn: PathMatchFn,
    skip_fn: PathMatchFn,
    reverse: bool,
}

impl Iterator for SelectPathIter {
    type Item = Path;

    fn next(&mut self) -> Option<Path> {
        loop {
            let frame = self.frames.last_mut()?;
            match frame.next() {
                None => {
                    self.frames.pop();
                    self.path.pop();
                }
                Some(nd) => {
                    let mut candidate = self.path.clone();
                    candidate.push(nd.clone());
                    if nd.has_children() && !(self.skip_fn)(&candidate) {
                        let mut children = nd.children();
                        if self.reverse {
                            children.reverse();
                        }
                        self.frames.push(children.into_iter());
                        self.path.push(nd);
                    }
                    if (self.match_fn)(&candidate) {
                        return Some(candidate);
                    }
                }
            }
        }
    }
}

/// Returns the string content of a node, a slice of nodes, or a plain
/// string, restricted to the leaf paths selected by `select` and not
/// ignored by `ignore`.
pub fn content_of(
    segment: &[Node],
    select: &PathMatchFn,
    ignore: &PathMatchFn,
) -> String {
    let mut buf = String::new();
    for root in segment {
        for path in root.select_path_if(select.clone(), true, false, ignore.clone()) {
            let nd = path.last().unwrap();
            if nd.has_children() || ignore(&path) {
                continue;
            }
            buf.push_str(&nd.content());
        }
    }
    buf
}

/// Like [`content_of`], but only counts the length.
pub fn strlen_of(segment: &[Node], select: &PathMatchFn, ignore: &PathMatchFn) -> usize {
    let mut length = 0;
    for root in segment {
        for path in root.select_path_if(select.clone(), true, false, ignore.clone()) {
            let nd = path.last().unwrap();
            if nd.has_children() || ignore(&path) {
                continue;
            }
            length += nd.strlen();
        }
    }
    length
}

/// Sanity check for node-trees: one and the same node must never appear
/// twice in the tree, and frozen placeholder nodes must have been dropped
/// before tree processing is finished.
pub fn tree_sanity_check(tree: &Node) -> bool {
    let mut seen: std::collections::HashSet<NodeId> = std::collections::HashSet::new();
    for node in tree.walk_tree(true, false) {
        if node.is_frozen() || !seen.insert(node.id()) {
            return false;
        }
    }
    true
}

#[cfg(test)]
#[path = "node_tests.rs"]
mod node_tests;
