//! Content mappings, node splitting, and the markup engine.
//!
//! A [`ContentMapping`] relates offsets in a string projection of a tree
//! (the concatenated content of the selected leaves) back to the leaf
//! paths that produced them. On top of the mapping sit the mutation
//! operations: inserting nodes at character positions and wrapping a
//! character range in markup, cutting through the existing hierarchy
//! only where the divisibility rules permit it.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use thiserror::Error as ThisError;

use crate::criteria::{create_path_match_function, PathCriterion, PathMatchFn};
use crate::node::{strlen_of, Node, NodeContent, Path, DIVISIBLES, TOKEN_PTYPE};
use crate::path::find_common_ancestor;

/// Failures of content-mapping lookups and markup operations.
#[derive(Debug, ThisError)]
pub enum MappingError {
    #[error("position {0} lies outside of the mapped content")]
    OutOfRange(usize),
    #[error("node \"{0}\" is not divisible")]
    NotDivisible(String),
    #[error("selector must only match leaf paths, but matched branch path \"{0}\"")]
    NonLeafSelection(String),
    #[error("paths do not belong to the same tree")]
    NoCommonAncestor,
    #[error("the content mapping is empty")]
    EmptyMapping,
}

// chain ids //////////////////////////////////////////////////////////////

const CHAIN_LETTERS: &[u8; 23] = b"ABCDEFGHKLMNPQRSTUVWXYZ";

struct ChainIdGen {
    id: u64,
    step: u64,
    len: usize,
    modulo: u64,
}

impl ChainIdGen {
    fn with_length(chain_length: usize) -> Self {
        assert!(chain_length >= 3);
        let multiplier = 23u64.pow(chain_length as u32 - 3);
        ChainIdGen {
            id: 4231 * multiplier,
            step: 4231 * multiplier,
            len: chain_length,
            modulo: 23u64.pow(chain_length as u32),
        }
    }
}

thread_local! {
    static CHAIN_ID: RefCell<ChainIdGen> = RefCell::new(ChainIdGen::with_length(3));
}

/// Resets the chain-id generator, for deterministic test results.
pub fn reset_chain_id(chain_length: usize) {
    CHAIN_ID.with(|gen| *gen.borrow_mut() = ChainIdGen::with_length(chain_length));
}

/// Generates a unique chain-id for marking the fragments of a split-up
/// node. Ids in different threads may coincide; one tree must not be
/// processed by several threads at the same time anyway.
pub fn gen_chain_id() -> String {
    CHAIN_ID.with(|cell| {
        let mut gen = cell.borrow_mut();
        gen.id = (gen.id + gen.step) % gen.modulo;
        if gen.id == gen.step {
            gen.step = gen.step * 23 - 1;
            gen.id = gen.step;
            gen.len += 1;
            gen.modulo *= 23;
        }
        let mut c = gen.id;
        let mut cid = Vec::new();
        while c > 0 {
            cid.push(CHAIN_LETTERS[(c % 23) as usize]);
            c /= 23;
        }
        while cid.len() < gen.len {
            cid.push(b'A');
        }
        String::from_utf8(cid).expect("chain letters are ascii")
    })
}

// splitting //////////////////////////////////////////////////////////////

fn position_of(parent: &Node, node: &Node) -> usize {
    parent
        .children()
        .iter()
        .position(|c| c == node)
        .expect("node must be a child of its parent")
}

/// Inserts `node` at the given offset into the leaf at the end of the
/// path (or its parent, if the offset falls on a boundary). If the offset
/// falls inside the leaf, the leaf is split, which requires its name to
/// be in the `divisible` set. Returns the parent of the inserted node.
pub fn insert_node(
    leaf_path: &[Node],
    rel_pos: usize,
    node: Node,
    divisible: &HashSet<String>,
) -> Result<Node, MappingError> {
    assert!(!leaf_path.is_empty());
    let leaf = leaf_path.last().unwrap();
    assert!(leaf.is_leaf(), "insert_node() requires a leaf path");
    let leaf_len = leaf.strlen();
    if rel_pos > leaf_len {
        return Err(MappingError::OutOfRange(rel_pos));
    }

    let split_leaf = |leaf: &Node, node: &Node| -> (Node, Node) {
        let content = leaf.content();
        if let Some(leaf_pos) = leaf.pos_opt() {
            node.force_pos(Some(leaf_pos + rel_pos));
            let pred = Node::new_leaf(leaf.name(), &content[..rel_pos]).with_pos(leaf_pos);
            let succ = Node::new_leaf(leaf.name(), &content[rel_pos..])
                .with_pos(node.pos() + node.strlen());
            (pred, succ)
        } else {
            let pred = Node::new_leaf(leaf.name(), &content[..rel_pos]);
            let succ = Node::new_leaf(leaf.name(), &content[rel_pos..]);
            (pred, succ)
        }
    };

    if leaf_path.len() >= 2 {
        let parent = &leaf_path[leaf_path.len() - 2];
        let i = position_of(parent, leaf);
        if rel_pos == 0 {
            parent.insert_child(i, node);
            return Ok(parent.clone());
        }
        if rel_pos == leaf_len {
            parent.insert_child(i + 1, node);
            return Ok(parent.clone());
        }
        if !divisible.contains(&leaf.name()) {
            return Err(MappingError::NotDivisible(leaf.name()));
        }
        let (pred, succ) = split_leaf(leaf, &node);
        let children = parent.children();
        let mut new_children = children[..i].to_vec();
        new_children.extend([pred, node, succ]);
        new_children.extend(children[i + 1..].iter().cloned());
        parent.set_children(new_children);
        Ok(parent.clone())
    } else {
        // the path consists of the leaf only; the leaf becomes a branch
        if rel_pos == 0 {
            node.force_pos(leaf.pos_opt());
            let copy = Node::new_leaf(leaf.name(), leaf.content());
            leaf.set_children(vec![node, copy]);
        } else if rel_pos == leaf_len {
            if let Some(p) = leaf.pos_opt() {
                node.force_pos(Some(p + leaf_len));
            }
            let copy = Node::new_leaf(leaf.name(), leaf.content());
            leaf.set_children(vec![copy, node]);
        } else {
            if !divisible.contains(&leaf.name()) {
                return Err(MappingError::NotDivisible(leaf.name()));
            }
            let (pred, succ) = split_leaf(leaf, &node);
            leaf.set_children(vec![pred, node, succ]);
        }
        Ok(leaf.clone())
    }
}

/// Splits `node` at index `i` (a character offset for leaves, a child
/// index for branches) and inserts the right half after it into
/// `parent`. Returns the index within the parent's children at which the
/// split took place, i.e. where a new node could be inserted exactly at
/// the split location. Named nodes receive the `chain_attr`, if given, on
/// both halves.
pub fn split_node(
    node: &Node,
    parent: &Node,
    i: usize,
    left_biased: bool,
    chain_attr: Option<&(String, String)>,
) -> usize {
    let k = position_of(parent, node) + 1;
    let len = node.result_len();
    if left_biased {
        if i == 0 {
            return k - 1;
        }
        if i == len {
            return k;
        }
    } else {
        if i == len {
            return k;
        }
        if i == 0 {
            return k - 1;
        }
    }
    let right = Node::with_content(node.name(), node.result_slice_from(i));
    if node.has_attr() {
        right.update_attrs(node.attrs());
    }
    if right.has_children() {
        right.force_pos(right.children()[0].pos_opt());
    } else if let Some(p) = node.pos_opt() {
        right.force_pos(Some(p + i));
    }
    node.set_result(node.result_slice_to(i));
    if let Some((key, value)) = chain_attr {
        if !node.is_anonymous() {
            node.set_attr(key.clone(), value.clone());
            right.set_attr(key.clone(), value.clone());
        }
    }
    let children = parent.children();
    let mut new_children = children[..k].to_vec();
    new_children.push(right);
    new_children.extend(children[k..].iter().cloned());
    parent.set_children(new_children);
    k
}

/// Splits the tree along the path, where `i` is the offset of the split
/// within the last node of the path. Returns the index of the split
/// location among the children of the first node of the path. With
/// `greedy`, splits are extended over empty-content siblings to minimize
/// the number of cuts.
pub fn deep_split(
    path: &[Node],
    i: usize,
    left_biased: bool,
    greedy: bool,
    match_fn: &PathMatchFn,
    skip_fn: &PathMatchFn,
    chain_attr_name: &str,
) -> usize {
    let mut i = i;
    let last_index = path.len();
    for idx in 2..=last_index {
        let node = &path[path.len() - idx + 1];
        let parent = &path[path.len() - idx];
        let chain_attr = if chain_attr_name.is_empty() {
            None
        } else {
            Some((chain_attr_name.to_string(), gen_chain_id()))
        };
        i = split_node(node, parent, i, left_biased, chain_attr.as_ref());
        if greedy && idx < last_index {
            let children = parent.children();
            if left_biased {
                if i > 0 && strlen_of(&children[..i], match_fn, skip_fn) == 0 {
                    i = 0;
                }
            } else {
                let l = children.len();
                if i < l && strlen_of(&children[i..], match_fn, skip_fn) == 0 {
                    i = l;
                }
            }
        }
    }
    i
}

/// Like [`deep_split`], but splits the first node of the path as well and
/// returns the two resulting trees. Either tree can be an empty node.
pub fn full_split(path: &[Node], i: usize, left_biased: bool, greedy: bool) -> (Node, Node) {
    let any: PathMatchFn = Rc::new(|_| true);
    let none: PathMatchFn = Rc::new(|_| false);
    let i = deep_split(path, i, left_biased, greedy, &any, &none, "");
    let root = path[0].clone();
    let tail = Node::with_content(root.name(), root.result_slice_from(i));
    root.set_result(root.result_slice_to(i));
    (root, tail)
}

/// Previews a split along the path without mutating the tree (the
/// preview operates on shallow copies). Returns the negative index of the
/// first node in the path from which on all nodes can be split, or need
/// not be split because the split offset lies on their boundary.
/// Anonymous nodes and nodes in the `divisible` set may be split.
pub fn can_split(
    t: &[Node],
    i: usize,
    left_biased: bool,
    greedy: bool,
    match_fn: &PathMatchFn,
    skip_fn: &PathMatchFn,
    divisible: &HashSet<String>,
) -> isize {
    if t.len() <= 1 {
        return 0;
    }

    // work on shallow copies, so that the preview leaves the tree intact
    let t2: Vec<Node> = t.iter().map(|nd| nd.shallow_copy()).collect();
    for k in 1..t2.len() {
        let replaced: Vec<Node> = t2[k - 1]
            .children()
            .iter()
            .map(|nd| if *nd == t[k] { t2[k].clone() } else { nd.clone() })
            .collect();
        t2[k - 1].set_result_raw(NodeContent::Branch(replaced));
    }
    let t = &t2;

    let mut i = i;
    let mut k_final = 0usize;
    let mut broke = false;
    for k in 0..t.len() - 1 {
        k_final = k;
        let node = &t[t.len() - k - 1];
        if i != 0
            && i != node.result_len()
            && !(node.is_anonymous() || divisible.contains(&node.name()))
        {
            broke = true;
            break;
        }
        let parent = &t[t.len() - k - 2];
        i = split_node(node, parent, i, left_biased, None);
        if greedy {
            let children = parent.children();
            if left_biased {
                if i > 0 && strlen_of(&children[..i], match_fn, skip_fn) == 0 {
                    i = 0;
                }
            } else {
                let l = children.len();
                if i < l && strlen_of(&children[i..], match_fn, skip_fn) == 0 {
                    i = l;
                }
            }
        }
    }
    if !broke {
        k_final += 1;
    }
    -(k_final as isize)
}

/// Adds markup to a leaf node, incidentally turning it into a branch:
/// the content range `[start, end)` is wrapped into a node `(name,
/// attrs)`, the rest remains in anonymous text nodes.
pub fn markup_leaf(
    node: &Node,
    start: usize,
    end: usize,
    name: &str,
    attrs: &IndexMap<String, String>,
) {
    assert!(node.is_leaf());
    let content = node.content();
    let seg_1 = Node::new_leaf(TOKEN_PTYPE, &content[..start]);
    seg_1.force_pos(node.pos_opt());
    let seg_2 = Node::new_leaf(name, &content[start..end]).with_attr(attrs.clone());
    seg_2.force_pos(node.pos_opt().map(|p| p + start));
    let seg_3 = Node::new_leaf(TOKEN_PTYPE, &content[end..]);
    seg_3.force_pos(node.pos_opt().map(|p| p + end));
    let children: Vec<Node> = [seg_1, seg_2, seg_3]
        .into_iter()
        .filter(|nd| !nd.is_empty())
        .collect();
    node.set_children(children);
}

/// Wraps the content from offset `i` within the last node of the path up
/// to the very end of the content of the first node of the path into
/// `(name, attrs)` nodes, splitting along the path where permitted.
pub fn markup_right(
    path: &[Node],
    i: usize,
    name: &str,
    attrs: &mut IndexMap<String, String>,
    greedy: bool,
    match_fn: &PathMatchFn,
    skip_fn: &PathMatchFn,
    divisible: &HashSet<String>,
    chain_attr_name: &str,
) {
    assert!(!path.is_empty());
    let len = path.len() as isize;
    let mut k = (can_split(path, i, true, greedy, match_fn, skip_fn, divisible) - 1).max(-len);
    // k is the negative index of the first node to split
    let anchor_idx = (len + k) as usize;
    let i = deep_split(
        &path[anchor_idx..],
        i,
        true,
        greedy,
        match_fn,
        skip_fn,
        chain_attr_name,
    );

    if !chain_attr_name.is_empty() && !attrs.contains_key(chain_attr_name) {
        attrs.insert(chain_attr_name.to_string(), gen_chain_id());
    }

    let anchor = &path[anchor_idx];
    let nd = Node::with_content(name, anchor.result_slice_from(i)).with_attr(attrs.clone());
    if nd.has_children() {
        nd.force_pos(anchor.children()[i].pos_opt());
        let mut children = anchor.children()[..i].to_vec();
        children.push(nd);
        anchor.set_children(children);
    } else if !nd.is_empty() {
        nd.force_pos(anchor.pos_opt().map(|p| p + i));
        let text_node = Node::with_content(TOKEN_PTYPE, anchor.result_slice_to(i));
        text_node.force_pos(anchor.pos_opt());
        let new_children = if text_node.is_empty() {
            vec![nd]
        } else {
            vec![text_node, nd]
        };
        anchor.set_children(new_children);
    }

    k -= 1;
    while -k <= len {
        let idx = (len + k) as usize;
        let a = &path[idx];
        let child_index = position_of(a, &path[idx + 1]) + 1;
        if child_index < a.result_len() {
            let nd =
                Node::with_content(name, a.result_slice_from(child_index)).with_attr(attrs.clone());
            nd.force_pos(a.children()[child_index].pos_opt());
            let mut children = a.children()[..child_index].to_vec();
            children.push(nd);
            a.set_children(children);
        }
        k -= 1;
    }
}

/// Mirror image of [`markup_right`]: wraps the content from the very
/// beginning of the first node of the path up to offset `i` within the
/// last node.
pub fn markup_left(
    path: &[Node],
    i: usize,
    name: &str,
    attrs: &mut IndexMap<String, String>,
    greedy: bool,
    match_fn: &PathMatchFn,
    skip_fn: &PathMatchFn,
    divisible: &HashSet<String>,
    chain_attr_name: &str,
) {
    assert!(!path.is_empty());
    let len = path.len() as isize;
    let mut k = (can_split(path, i, false, greedy, match_fn, skip_fn, divisible) - 1).max(-len);
    let anchor_idx = (len + k) as usize;
    let i = deep_split(
        &path[anchor_idx..],
        i,
        false,
        greedy,
        match_fn,
        skip_fn,
        chain_attr_name,
    );

    if !chain_attr_name.is_empty() && !attrs.contains_key(chain_attr_name) {
        attrs.insert(chain_attr_name.to_string(), gen_chain_id());
    }

    let anchor = &path[anchor_idx];
    let nd = Node::with_content(name, anchor.result_slice_to(i)).with_attr(attrs.clone());
    nd.force_pos(anchor.pos_opt());
    if nd.has_children() {
        let mut children = vec![nd];
        children.extend(anchor.children()[i..].iter().cloned());
        anchor.set_children(children);
    } else if !nd.is_empty() {
        let text_node = Node::with_content(TOKEN_PTYPE, anchor.result_slice_from(i));
        text_node.force_pos(anchor.pos_opt().map(|p| p + i));
        let new_children = if text_node.is_empty() {
            vec![nd]
        } else {
            vec![nd, text_node]
        };
        anchor.set_children(new_children);
    }

    k -= 1;
    while -k <= len {
        let idx = (len + k) as usize;
        let a = &path[idx];
        let child_index = position_of(a, &path[idx + 1]);
        if child_index > 0 {
            let nd =
                Node::with_content(name, a.result_slice_to(child_index)).with_attr(attrs.clone());
            nd.force_pos(a.pos_opt());
            let mut children = vec![nd];
            children.extend(a.children()[child_index..].iter().cloned());
            a.set_children(children);
        }
        k -= 1;
    }
}

// the content mapping ////////////////////////////////////////////////////

/// Location of a content offset: the covering leaf path, the offset
/// relative to the leaf, and the path's index in the mapping.
#[derive(Debug, Clone)]
pub struct ContentLocation {
    pub path: Path,
    pub offset: usize,
    pub index: usize,
}

/// Configuration of a [`ContentMapping`].
pub struct ContentMappingOptions {
    pub select: PathCriterion,
    pub ignore: PathCriterion,
    pub greedy: bool,
    /// Which node names markup with a given name (or any name, under the
    /// key `*`) is permitted to split.
    pub divisibility: IndexMap<String, HashSet<String>>,
    /// If non-empty, all fragments of a split-up node receive this
    /// attribute with a chain-id value identifying them as one chain.
    pub chain_attr_name: String,
    /// Rebuild the affected section of the mapping after every markup.
    pub auto_cleanup: bool,
}

impl Default for ContentMappingOptions {
    fn default() -> Self {
        let mut divisibility = IndexMap::new();
        divisibility.insert(
            "*".to_string(),
            DIVISIBLES.iter().map(|s| s.to_string()).collect(),
        );
        ContentMappingOptions {
            select: PathCriterion::LeafPath,
            ignore: PathCriterion::Never,
            greedy: true,
            divisibility,
            chain_attr_name: String::new(),
            auto_cleanup: true,
        }
    }
}

impl ContentMappingOptions {
    pub fn select(mut self, criterion: impl Into<PathCriterion>) -> Self {
        self.select = criterion.into();
        self
    }

    pub fn ignore(mut self, criterion: impl Into<PathCriterion>) -> Self {
        self.ignore = criterion.into();
        self
    }

    pub fn greedy(mut self, greedy: bool) -> Self {
        self.greedy = greedy;
        self
    }

    /// Replaces the default divisibility set (the `*` key).
    pub fn divisible_names<I: IntoIterator<Item = S>, S: Into<String>>(mut self, names: I) -> Self {
        self.divisibility.insert(
            "*".to_string(),
            names.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Overrides the divisibility set for markup with the given name.
    pub fn divisible_for<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        markup_name: &str,
        names: I,
    ) -> Self {
        self.divisibility.insert(
            markup_name.to_string(),
            names.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn chain_attr_name(mut self, name: &str) -> Self {
        self.chain_attr_name = name.to_string();
        self
    }

    pub fn auto_cleanup(mut self, auto_cleanup: bool) -> Self {
        self.auto_cleanup = auto_cleanup;
        self
    }
}

/// An ordered mapping of the first text position of every selected leaf
/// of a tree to the leaf's path. The flat document can then be searched
/// with plain text operations or regular expressions, and the tree be
/// changed at the found positions, e.g. by adding markup.
pub struct ContentMapping {
    origin: Node,
    raw_select: PathMatchFn,
    ignore_fn: PathMatchFn,
    leaf_select: PathMatchFn,
    greedy: bool,
    divisibility: IndexMap<String, HashSet<String>>,
    chain_attr_name: String,
    pub auto_cleanup: bool,
    content: String,
    pos_list: Vec<usize>,
    path_list: Vec<Path>,
}

impl fmt::Display for ContentMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pos) in self.pos_list.iter().enumerate() {
            let path = &self.path_list[i];
            let mut names: Vec<String> = path[..path.len() - 1].iter().map(|nd| nd.name()).collect();
            let last = crate::serialize::SxprPrinter::new(path.last().unwrap())
                .flatten_threshold(-1)
                .render();
            names.push(last[1..last.len() - 1].to_string());
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{} -> {}", pos, names.join(", "))?;
        }
        Ok(())
    }
}

impl ContentMapping {
    /// Creates a content mapping over all leaves of `origin`.
    pub fn new(origin: &Node) -> ContentMapping {
        ContentMapping::with_options(origin, ContentMappingOptions::default())
            .expect("the default selector only matches leaf paths")
    }

    /// Creates a content mapping with custom options. Fails if the
    /// select criterion matches a non-leaf path.
    pub fn with_options(
        origin: &Node,
        options: ContentMappingOptions,
    ) -> Result<ContentMapping, MappingError> {
        let raw_select = create_path_match_function(options.select);
        let ignore_fn = create_path_match_function(options.ignore);
        let leaf_select: PathMatchFn = {
            let raw_select = raw_select.clone();
            let ignore_fn = ignore_fn.clone();
            Rc::new(move |path: &[Node]| {
                path.last().is_some_and(|nd| nd.is_leaf())
                    && raw_select(path)
                    && !ignore_fn(path)
            })
        };
        let mut mapping = ContentMapping {
            origin: origin.clone(),
            raw_select,
            ignore_fn,
            leaf_select,
            greedy: options.greedy,
            divisibility: options.divisibility,
            chain_attr_name: options.chain_attr_name,
            auto_cleanup: options.auto_cleanup,
            content: String::new(),
            pos_list: Vec::new(),
            path_list: Vec::new(),
        };
        let (content, pos_list, path_list) = mapping.generate_mapping(origin, &[])?;
        mapping.content = content;
        mapping.pos_list = pos_list;
        mapping.path_list = path_list;
        Ok(mapping)
    }

    fn generate_mapping(
        &self,
        origin: &Node,
        stump: &[Node],
    ) -> Result<(String, Vec<usize>, Vec<Path>), MappingError> {
        if (self.ignore_fn)(&[origin.clone()]) {
            return Ok((String::new(), Vec::new(), Vec::new()));
        }
        let violation: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
        let match_fn: PathMatchFn = {
            let raw_select = self.raw_select.clone();
            let ignore_fn = self.ignore_fn.clone();
            let stump: Path = stump.to_vec();
            let violation = violation.clone();
            Rc::new(move |path: &[Node]| {
                let full: Path;
                let p: &[Node] = if stump.is_empty() {
                    path
                } else {
                    full = stump.iter().cloned().chain(path.iter().cloned()).collect();
                    &full
                };
                if p.last().is_some_and(|nd| nd.has_children()) {
                    if raw_select(p) && violation.borrow().is_none() {
                        *violation.borrow_mut() =
                            Some(crate::path::pp_path(p, 0, " <- "));
                    }
                    false
                } else {
                    raw_select(p) && !ignore_fn(p)
                }
            })
        };
        let mut pos = 0usize;
        let mut content = String::new();
        let mut pos_list = Vec::new();
        let mut path_list = Vec::new();
        for path in origin.select_path_if(match_fn, true, false, self.ignore_fn.clone()) {
            let leaf = path.last().unwrap();
            pos_list.push(pos);
            content.push_str(&leaf.content());
            pos += leaf.strlen();
            path_list.push(path);
        }
        if let Some(offender) = violation.borrow_mut().take() {
            return Err(MappingError::NonLeafSelection(offender));
        }
        Ok((content, pos_list, path_list))
    }

    pub fn origin(&self) -> &Node {
        &self.origin
    }

    /// The string content of the selected parts of the tree.
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn pos_list(&self) -> &[usize] {
        &self.pos_list
    }

    pub fn path_list(&self) -> &[Path] {
        &self.path_list
    }

    pub fn path(&self, path_index: usize) -> &Path {
        &self.path_list[path_index]
    }

    pub fn pos(&self, path_index: usize) -> usize {
        self.pos_list[path_index]
    }

    /// The index of the path covering the content position `pos`. With
    /// `left_biased`, a position on a path boundary resolves to the
    /// preceding path.
    pub fn get_path_index(&self, pos: usize, left_biased: bool) -> Result<usize, MappingError> {
        if self.pos_list.is_empty() {
            return Err(MappingError::EmptyMapping);
        }
        if pos > self.content.len() {
            return Err(MappingError::OutOfRange(pos));
        }
        let mut path_index = self.pos_list.partition_point(|&p| p <= pos).saturating_sub(1);
        if left_biased {
            while path_index > 0 && pos == self.pos_list[path_index] {
                path_index -= 1;
            }
        } else {
            let last = self.pos_list.len() - 1;
            let pivot = self.pos_list[path_index];
            while path_index < last && self.pos_list[path_index + 1] == pivot {
                path_index += 1;
            }
        }
        Ok(path_index)
    }

    /// The leaf path covering `pos` plus the offset of `pos` relative to
    /// the leaf.
    pub fn get_path_and_offset(
        &self,
        pos: usize,
        left_biased: bool,
    ) -> Result<ContentLocation, MappingError> {
        let index = self.get_path_index(pos, left_biased)?;
        Ok(ContentLocation {
            path: self.path_list[index].clone(),
            offset: pos - self.pos_list[index],
            index,
        })
    }

    /// All paths from position `start_pos` up to and including position
    /// `end_pos`.
    pub fn iterate_paths(
        &self,
        start_pos: usize,
        end_pos: usize,
        left_biased: bool,
    ) -> Result<Vec<Path>, MappingError> {
        let index_a = self.get_path_index(start_pos, left_biased)?;
        let index_b = self.get_path_index(end_pos, left_biased)?;
        let result = if index_b >= index_a {
            self.path_list[index_a..=index_b].to_vec()
        } else {
            let mut paths = self.path_list[index_b..=index_a].to_vec();
            paths.reverse();
            paths
        };
        Ok(result)
    }

    /// The index of the first (or last, with `reverse`) path that
    /// contains `node`, or `None` if the node is not part of the mapping.
    pub fn get_node_index(&self, node: &Node, reverse: bool) -> Option<usize> {
        let mut leaf = node.clone();
        if reverse {
            while leaf.has_children() {
                let children = leaf.children();
                leaf = children[children.len() - 1].clone();
            }
            (0..self.path_list.len())
                .rev()
                .find(|&i| self.path_list[i].last() == Some(&leaf))
        } else {
            while leaf.has_children() {
                leaf = leaf.children()[0].clone();
            }
            (0..self.path_list.len()).find(|&i| self.path_list[i].last() == Some(&leaf))
        }
    }

    /// The content position of the first character of `node`, or of the
    /// position one past its last character with `reverse`.
    pub fn get_node_position(&self, node: &Node, reverse: bool) -> Option<usize> {
        let i = self.get_node_index(node, reverse)?;
        if reverse {
            Some(self.pos_list[i] + self.path_list[i].last().unwrap().strlen())
        } else {
            Some(self.pos_list[i])
        }
    }

    /// Yields `(node, path_index)` pairs for the nodes matched by the
    /// match function, one result per unique node, searching within each
    /// path from the leaf upward.
    pub fn select_if(
        &self,
        match_fn: crate::criteria::NodeMatchFn,
        start_from: Option<usize>,
        reverse: bool,
    ) -> Vec<(Node, usize)> {
        let l = self.path_list.len();
        if l == 0 {
            return Vec::new();
        }
        let start = start_from.unwrap_or(if reverse { l - 1 } else { 0 });
        let indices: Vec<usize> = if reverse {
            (0..=start).rev().collect()
        } else {
            (start..l).collect()
        };
        let mut result = Vec::new();
        let mut last_node: Option<Node> = None;
        let mut last_k = 0usize;
        for i in indices {
            let path = &self.path_list[i];
            if let Some(nd) = &last_node {
                if path.get(last_k) == Some(nd) {
                    continue;
                }
            }
            let mut matched = false;
            for k in (0..path.len()).rev() {
                if match_fn(&path[k]) {
                    result.push((path[k].clone(), i));
                    last_node = Some(path[k].clone());
                    last_k = k;
                    matched = true;
                    break;
                }
            }
            if !matched {
                last_node = None;
            }
        }
        result
    }

    /// See [`ContentMapping::select_if`].
    pub fn select(
        &self,
        criterion: impl Into<crate::criteria::Criterion>,
        start_from: Option<usize>,
        reverse: bool,
    ) -> Vec<(Node, usize)> {
        self.select_if(
            crate::criteria::create_match_function(criterion.into()),
            start_from,
            reverse,
        )
    }

    /// The first `(node, path_index)` pair matching the criterion.
    pub fn pick(
        &self,
        criterion: impl Into<crate::criteria::Criterion>,
        start_from: Option<usize>,
        reverse: bool,
    ) -> Option<(Node, usize)> {
        self.select(criterion, start_from, reverse).into_iter().next()
    }

    /// Reconstructs the section of the mapping between the given path
    /// indices after the underlying tree has been restructured. The
    /// section is extended to all paths sharing the restructured paths'
    /// common ancestor.
    pub fn rebuild_mapping_slice(
        &mut self,
        first_index: usize,
        last_index: usize,
    ) -> Result<(), MappingError> {
        let mut first_index = first_index;
        let mut last_index = last_index;
        let start_path = self.path_list[first_index].clone();
        let end_path = self.path_list[last_index].clone();
        let (common_ancestor, i) =
            find_common_ancestor(&start_path, &end_path).ok_or(MappingError::NoCommonAncestor)?;
        while first_index > 0 && self.path_list[first_index - 1].get(i) == Some(&common_ancestor) {
            first_index -= 1;
        }
        let last = self.path_list.len() - 1;
        while last_index < last && self.path_list[last_index + 1].get(i) == Some(&common_ancestor) {
            last_index += 1;
        }

        let stump = &start_path[..i];
        let (content, offsets, paths) = self.generate_mapping(&common_ancestor, stump)?;
        let paths: Vec<Path> = paths
            .into_iter()
            .map(|path| {
                let mut full = stump.to_vec();
                full.extend(path);
                full
            })
            .collect();

        let start_pos = self.pos_list[first_index];
        let end_pos =
            self.pos_list[last_index] + self.path_list[last_index].last().unwrap().strlen();
        let offsets: Vec<usize> = offsets.into_iter().map(|off| off + start_pos).collect();

        let followup_offset = match (offsets.last(), paths.last()) {
            (Some(&off), Some(path)) => off + path.last().unwrap().strlen(),
            _ => start_pos,
        };
        let off_tail: Vec<usize> =
            if last_index < self.pos_list.len() - 1 && followup_offset != self.pos_list[last_index + 1] {
                let old_followup = self.pos_list[last_index + 1] as isize;
                let shift = followup_offset as isize - old_followup;
                self.pos_list[last_index + 1..]
                    .iter()
                    .map(|&off| (off as isize + shift) as usize)
                    .collect()
            } else {
                self.pos_list[last_index + 1..].to_vec()
            };

        let mut new_content = String::with_capacity(self.content.len());
        new_content.push_str(&self.content[..start_pos]);
        new_content.push_str(&content);
        new_content.push_str(&self.content[end_pos..]);
        self.content = new_content;

        let mut new_pos_list = self.pos_list[..first_index].to_vec();
        new_pos_list.extend(offsets);
        new_pos_list.extend(off_tail);
        self.pos_list = new_pos_list;

        let mut new_path_list = self.path_list[..first_index].to_vec();
        new_path_list.extend(paths);
        new_path_list.extend(self.path_list[last_index + 1..].iter().cloned());
        self.path_list = new_path_list;

        Ok(())
    }

    /// Like [`ContentMapping::rebuild_mapping_slice`], but the affected
    /// section is given by content positions.
    pub fn rebuild_mapping(&mut self, start_pos: usize, end_pos: usize) -> Result<(), MappingError> {
        let first_index = self.get_path_index(start_pos, false)?;
        let last_index = self.get_path_index(end_pos, false)?;
        self.rebuild_mapping_slice(first_index, last_index)
    }

    /// Inserts `node` at the content position `pos`, splitting the
    /// covering leaf if necessary (and permitted). Returns the parent of
    /// the inserted node and the index of the affected path.
    pub fn insert_node(
        &mut self,
        pos: usize,
        node: Node,
        left_biased: bool,
    ) -> Result<(Node, usize), MappingError> {
        let index = self.get_path_index(pos, left_biased)?;
        let path = self.path_list[index].clone();
        let rel_pos = pos - self.pos_list[index];
        let empty = HashSet::new();
        let divisible = self
            .divisibility
            .get(&node.name())
            .or_else(|| self.divisibility.get("*"))
            .unwrap_or(&empty);
        let parent = insert_node(&path, rel_pos, node, divisible)?;
        self.rebuild_mapping_slice(index, index)?;
        Ok((parent, index))
    }

    /// Marks the span `[start_pos, end_pos)` up by adding one or more
    /// nodes named `name`, cutting through divisible nodes where
    /// necessary. Returns the nearest common ancestor of the span
    /// together with its first path index.
    ///
    /// The positions refer to the string content of the mapping, not to
    /// any serialization of the tree. The content projected by the
    /// mapping is preserved bit for bit; only the structure changes.
    pub fn markup(
        &mut self,
        start_pos: usize,
        end_pos: usize,
        name: &str,
        attrs: &[(&str, &str)],
    ) -> Result<(Node, usize), MappingError> {
        assert!(end_pos >= start_pos);
        let mut attrs: IndexMap<String, String> = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        if start_pos == end_pos {
            let milestone = Node::new_leaf(name, "").with_attr(attrs);
            return self.insert_node(start_pos, milestone, false);
        }

        let location_a = self.get_path_and_offset(start_pos, false)?;
        let path_index = location_a.index;
        let location_b = self.get_path_and_offset(end_pos, true)?;
        let (path_a, pos_a) = (location_a.path, location_a.offset);
        let (path_b, pos_b) = (location_b.path, location_b.offset);
        let (mut common_ancestor, i) =
            find_common_ancestor(&path_a, &path_b).ok_or(MappingError::NoCommonAncestor)?;

        if !self.chain_attr_name.is_empty() && !attrs.contains_key(&self.chain_attr_name) {
            attrs.insert(self.chain_attr_name.clone(), gen_chain_id());
        }

        let empty = HashSet::new();
        let divisible = self
            .divisibility
            .get(name)
            .or_else(|| self.divisibility.get("*"))
            .unwrap_or(&empty)
            .clone();

        if common_ancestor.is_leaf() {
            if !self.chain_attr_name.is_empty() {
                attrs.shift_remove(&self.chain_attr_name);
            }
            markup_leaf(&common_ancestor, pos_a, pos_b, name, &attrs);
            if (!self.greedy || common_ancestor.name().starts_with(':'))
                && i != 0
                && (divisible.contains(&common_ancestor.name()) || common_ancestor.is_anonymous())
            {
                // lift the split wrappers up into the place of the leaf
                for child in common_ancestor.children() {
                    if child.has_name(TOKEN_PTYPE) {
                        child.set_name(common_ancestor.name());
                        child.with_attr(common_ancestor.attrs());
                    } else if !common_ancestor.is_anonymous() {
                        let inner = Node::with_content(common_ancestor.name(), child.raw_content())
                            .with_attr(common_ancestor.attrs());
                        child.set_children(vec![inner]);
                    }
                }
                let ur_ancestor = path_a[i - 1].clone();
                let t = position_of(&ur_ancestor, &common_ancestor);
                let siblings = ur_ancestor.children();
                let mut new_children = siblings[..t].to_vec();
                new_children.extend(common_ancestor.children());
                new_children.extend(siblings[t + 1..].iter().cloned());
                ur_ancestor.set_children(new_children);
                common_ancestor = ur_ancestor;
            }
            if self.auto_cleanup {
                let first = self.get_path_index(start_pos, false)?;
                let last = self.get_path_index(end_pos, true)?;
                self.rebuild_mapping_slice(first, last)?;
            }
            return Ok((common_ancestor, path_index));
        }

        let stump_a = path_a[i..].to_vec();
        let stump_b = path_b[i..].to_vec();

        let q = can_split(
            &stump_a,
            pos_a,
            false,
            self.greedy,
            &self.leaf_select,
            &self.ignore_fn,
            &divisible,
        );
        let r = can_split(
            &stump_b,
            pos_b,
            true,
            self.greedy,
            &self.leaf_select,
            &self.ignore_fn,
            &divisible,
        );

        let mut i_split: isize = -1;
        let mut k_split: isize = -1;
        if q < 0 && (-q) as usize == stump_a.len() - 1 {
            i_split = deep_split(
                &stump_a,
                pos_a,
                false,
                self.greedy,
                &self.leaf_select,
                &self.ignore_fn,
                &self.chain_attr_name,
            ) as isize;
        }
        if r < 0 && (-r) as usize == stump_b.len() - 1 {
            k_split = deep_split(
                &stump_b,
                pos_b,
                true,
                self.greedy,
                &self.leaf_select,
                &self.ignore_fn,
                &self.chain_attr_name,
            ) as isize;
        }

        if i_split >= 0 && k_split >= 0 {
            // both endpoints split cleanly up to the common ancestor
            let (i, k) = (i_split as usize, k_split as usize);
            if !self.chain_attr_name.is_empty() {
                attrs.shift_remove(&self.chain_attr_name);
            }
            let children = common_ancestor.children();
            let nd = Node::new(name, children[i..k].to_vec()).with_attr(attrs.clone());
            nd.force_pos(children.get(i).and_then(|c| c.pos_opt()));
            let mut new_children = children[..i].to_vec();
            new_children.push(nd);
            new_children.extend(children[k..].iter().cloned());
            common_ancestor.set_children(new_children);
        } else if i_split >= 0 {
            let i = i_split as usize;
            let t = position_of(&common_ancestor, &stump_b[1]);
            let children = common_ancestor.children();
            let nd = Node::new(name, children[i..t].to_vec()).with_attr(attrs.clone());
            nd.force_pos(children.get(i).and_then(|c| c.pos_opt()));
            markup_left(
                &stump_b[1..],
                pos_b,
                name,
                &mut attrs,
                self.greedy,
                &self.leaf_select,
                &self.ignore_fn,
                &divisible,
                &self.chain_attr_name,
            );
            let children = common_ancestor.children();
            let mut new_children = children[..i].to_vec();
            new_children.push(nd);
            new_children.extend(children[t..].iter().cloned());
            common_ancestor.set_children(new_children);
        } else if k_split >= 0 {
            let k = k_split as usize;
            let t = position_of(&common_ancestor, &stump_a[1]);
            let children = common_ancestor.children();
            let nd = Node::new(name, children[t + 1..k].to_vec()).with_attr(attrs.clone());
            nd.force_pos(children.get(t + 1).and_then(|c| c.pos_opt()));
            markup_right(
                &stump_a[1..],
                pos_a,
                name,
                &mut attrs,
                self.greedy,
                &self.leaf_select,
                &self.ignore_fn,
                &divisible,
                &self.chain_attr_name,
            );
            let children = common_ancestor.children();
            let mut new_children = children[..t + 1].to_vec();
            new_children.push(nd);
            new_children.extend(children[k..].iter().cloned());
            common_ancestor.set_children(new_children);
        } else {
            let t = position_of(&common_ancestor, &stump_a[1]);
            let u = position_of(&common_ancestor, &stump_b[1]);
            markup_right(
                &stump_a[1..],
                pos_a,
                name,
                &mut attrs,
                self.greedy,
                &self.leaf_select,
                &self.ignore_fn,
                &divisible,
                &self.chain_attr_name,
            );
            markup_left(
                &stump_b[1..],
                pos_b,
                name,
                &mut attrs,
                self.greedy,
                &self.leaf_select,
                &self.ignore_fn,
                &divisible,
                &self.chain_attr_name,
            );
            if u > t + 1 {
                let children = common_ancestor.children();
                let nd = Node::new(name, children[t + 1..u].to_vec()).with_attr(attrs.clone());
                nd.force_pos(children.get(t + 1).and_then(|c| c.pos_opt()));
                let mut new_children = children[..t + 1].to_vec();
                new_children.push(nd);
                new_children.extend(children[u..].iter().cloned());
                common_ancestor.set_children(new_children);
            }
        }

        if self.auto_cleanup {
            let first = self.get_path_index(start_pos, false)?;
            let last = self.get_path_index(end_pos, true)?;
            self.rebuild_mapping_slice(first, last)?;
        }
        Ok((common_ancestor, path_index))
    }
}

#[cfg(test)]
#[path = "mapping_tests.rs"]
mod mapping_tests;
