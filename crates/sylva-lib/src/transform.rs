//! The tree-transformation dispatcher and its rule library.
//!
//! A [`TransformationTable`] maps node names to sequences of rewrite
//! rules. [`traverse`] walks the tree depth-first (children before
//! parents) and applies the applicable rules to the path ending at each
//! node. Special table keys:
//!
//! - `<`  runs before the per-name rules for every node,
//! - `>`  runs after them,
//! - `*`  matches any node not otherwise listed,
//! - `<<<` runs exactly once before the traversal,
//! - `>>>` runs exactly once after it,
//! - `~`  is a synonym for `:Whitespace`.
//!
//! Rules are closures over `(&mut RootNode, &[Node])`; the rule library
//! below provides factories for the usual rewriting steps. Child filters
//! may precede the rules of an entry; they rewrite the child sequence
//! seen during descent without changing the tree.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use indexmap::IndexMap;
use regex::Regex;

use sylva_core::{ErrorCode, AST_TRANSFORM_CRASH, ERROR};

use crate::node::{Node, NodeContent, Path, TOKEN_PTYPE, WHITESPACE_PTYPE};
use crate::root::RootNode;

/// A rewrite rule, applied to the path ending at the current node.
pub type Rule = Rc<dyn Fn(&mut RootNode, &[Node])>;
/// A predicate on the current path.
pub type CondFn = Rc<dyn Fn(&[Node]) -> bool>;
/// A filter rewriting the child sequence seen during descent.
pub type ChildFilter = Rc<dyn Fn(Vec<Node>) -> Vec<Node>>;

/// An entry of a transformation table: either a child filter or a rule.
/// Filters must precede the rules of an entry.
#[derive(Clone)]
pub enum TableEntry {
    Filter(ChildFilter),
    Rule(Rule),
}

impl From<Rule> for TableEntry {
    fn from(rule: Rule) -> Self {
        TableEntry::Rule(rule)
    }
}

/// Wraps a plain function as a [`CondFn`].
pub fn cond(f: impl Fn(&[Node]) -> bool + 'static) -> CondFn {
    Rc::new(f)
}

/// Wraps a plain function as a [`Rule`].
pub fn rule(f: impl Fn(&mut RootNode, &[Node]) + 'static) -> Rule {
    Rc::new(f)
}

/// A name-keyed table of rewrite rules; see the module documentation.
#[derive(Default)]
pub struct TransformationTable {
    table: IndexMap<String, Vec<TableEntry>>,
    cache: RefCell<HashMap<String, (Vec<ChildFilter>, Vec<Rule>)>>,
}

impl TransformationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the rules under the given key. Keys may be
    /// comma-separated lists of node names; `~` stands for
    /// `:Whitespace`.
    pub fn add(self, keys: &str, rules: Vec<Rule>) -> Self {
        self.add_entries(keys, rules.into_iter().map(TableEntry::Rule).collect())
    }

    /// Registers a mixture of filters and rules; the filters must come
    /// first.
    pub fn add_entries(mut self, keys: &str, entries: Vec<TableEntry>) -> Self {
        for key in keys.split(',') {
            let mut key = key.trim().to_string();
            assert!(key != "+", "key \"+\" is obsolete, use \"<\" instead");
            if key == "~" {
                assert!(
                    !self.table.contains_key(WHITESPACE_PTYPE),
                    "\"~\" is a synonym for \":Whitespace\"; do not use both at the same time"
                );
                key = WHITESPACE_PTYPE.to_string();
            }
            self.table.entry(key).or_default().extend(entries.iter().cloned());
        }
        self
    }

    fn split_filters(entries: &[TableEntry]) -> (Vec<ChildFilter>, Vec<Rule>) {
        let mut filters = Vec::new();
        let mut rules = Vec::new();
        let mut rules_started = false;
        for entry in entries {
            match entry {
                TableEntry::Filter(f) => {
                    assert!(!rules_started, "filters must precede the rules of an entry");
                    filters.push(f.clone());
                }
                TableEntry::Rule(r) => {
                    rules_started = true;
                    rules.push(r.clone());
                }
            }
        }
        (filters, rules)
    }

    fn lookup(&self, key: &str) -> (Vec<ChildFilter>, Vec<Rule>) {
        if let Some(cached) = self.cache.borrow().get(key) {
            return cached.clone();
        }
        let (mut filters, pre) = Self::split_filters(
            self.table.get("<").map(Vec::as_slice).unwrap_or(&[]),
        );
        let main_entries = self
            .table
            .get(key)
            .or_else(|| self.table.get("*"))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let (more_filters, main) = Self::split_filters(main_entries);
        let post_entries = self.table.get(">").map(Vec::as_slice).unwrap_or(&[]);
        let (post_filters, post) = Self::split_filters(post_entries);
        assert!(
            post_filters.is_empty(),
            "child filters are not allowed under the key \">\""
        );
        filters.extend(more_filters);
        let mut sequence = pre;
        sequence.extend(main);
        sequence.extend(post);
        self.cache
            .borrow_mut()
            .insert(key.to_string(), (filters.clone(), sequence.clone()));
        (filters, sequence)
    }

    fn once_rules(&self, key: &str) -> Vec<Rule> {
        Self::split_filters(self.table.get(key).map(Vec::as_slice).unwrap_or(&[])).1
    }
}

/// Walks the tree depth-first, children before parent, and applies the
/// rules registered for each node's name.
pub fn traverse(root: &mut RootNode, table: &TransformationTable) {
    fn traverse_recursive(root: &mut RootNode, table: &TransformationTable, path: &mut Path) {
        let node = path.last().expect("path never empty").clone();
        let (filters, sequence) = table.lookup(&node.name());
        let mut children = node.children();
        for filter in &filters {
            children = filter(children);
        }
        for child in children {
            path.push(child);
            traverse_recursive(root, table, path);
            path.pop();
        }
        for call in &sequence {
            call(root, path);
        }
    }

    let tree = root.tree().clone();
    for call in table.once_rules("<<<") {
        call(root, &[tree.clone()]);
    }
    let mut path = vec![tree.clone()];
    traverse_recursive(root, table, &mut path);
    for call in table.once_rules(">>>") {
        call(root, &[tree.clone()]);
    }
}

/// Like [`traverse`], but checks the tree's processing stage against
/// `src_stage` first (case-insensitively) and advances it to `dst_stage`
/// afterwards.
pub fn transformer(
    root: &mut RootNode,
    table: &TransformationTable,
    src_stage: &str,
    dst_stage: &str,
) -> Result<(), String> {
    if !src_stage.is_empty()
        && !root.stage.is_empty()
        && !root.stage.eq_ignore_ascii_case(src_stage)
    {
        return Err(format!(
            "tree in stage \"{}\" expected, but \"{}\" found",
            src_stage, root.stage
        ));
    }
    traverse(root, table);
    root.stage = dst_stage.to_string();
    Ok(())
}

// child filters //////////////////////////////////////////////////////////

/// Hides all children during descent.
pub fn block_children() -> TableEntry {
    TableEntry::Filter(Rc::new(|_| Vec::new()))
}

/// Hides all leaf children during descent.
pub fn block_leaves() -> TableEntry {
    TableEntry::Filter(Rc::new(|children: Vec<Node>| {
        children.into_iter().filter(|c| c.has_children()).collect()
    }))
}

/// Hides all anonymous leaf children during descent.
pub fn block_anonymous_leaves() -> TableEntry {
    TableEntry::Filter(Rc::new(|children: Vec<Node>| {
        children
            .into_iter()
            .filter(|c| c.has_children() || !c.is_anonymous())
            .collect()
    }))
}

// condition helpers //////////////////////////////////////////////////////

pub fn is_single_child(path: &[Node]) -> bool {
    path.len() >= 2 && path[path.len() - 2].child_count() == 1
}

pub fn is_named(path: &[Node]) -> bool {
    path.last().is_some_and(|nd| !nd.is_anonymous())
}

pub fn is_anonymous(path: &[Node]) -> bool {
    path.last().is_some_and(|nd| nd.is_anonymous())
}

pub fn is_anonymous_leaf(path: &[Node]) -> bool {
    path.last().is_some_and(|nd| nd.is_leaf() && nd.is_anonymous())
}

pub fn contains_only_whitespace(path: &[Node]) -> bool {
    path.last()
        .is_some_and(|nd| nd.content().chars().all(|c| c.is_whitespace()))
}

pub fn is_empty(path: &[Node]) -> bool {
    path.last().is_some_and(|nd| nd.is_empty())
}

pub fn has_children(path: &[Node]) -> bool {
    path.last().is_some_and(|nd| nd.has_children())
}

pub fn always(_path: &[Node]) -> bool {
    true
}

pub fn never(_path: &[Node]) -> bool {
    false
}

/// True for leaf nodes whose content is one of `tokens` (or any leaf, if
/// `tokens` is empty).
pub fn is_token(tokens: &[&str]) -> CondFn {
    let tokens: HashSet<String> = tokens.iter().map(|s| s.to_string()).collect();
    Rc::new(move |path: &[Node]| {
        path.last().is_some_and(|nd| {
            nd.is_leaf() && (tokens.is_empty() || tokens.contains(&nd.content()))
        })
    })
}

pub fn is_one_of(names: &[&str]) -> CondFn {
    let names: HashSet<String> = names.iter().map(|s| s.to_string()).collect();
    Rc::new(move |path: &[Node]| path.last().is_some_and(|nd| names.contains(&nd.name())))
}

pub fn not_one_of(names: &[&str]) -> CondFn {
    let inner = is_one_of(names);
    Rc::new(move |path: &[Node]| !inner(path))
}

pub fn is_a(name: &str) -> CondFn {
    let name = name.to_string();
    Rc::new(move |path: &[Node]| path.last().is_some_and(|nd| nd.has_name(&name)))
}

pub fn not_a(name: &str) -> CondFn {
    let inner = is_a(name);
    Rc::new(move |path: &[Node]| !inner(path))
}

pub fn name_matches(pattern: &str) -> CondFn {
    let rx = Regex::new(&format!("^(?:{})$", pattern)).expect("invalid name pattern");
    Rc::new(move |path: &[Node]| path.last().is_some_and(|nd| rx.is_match(&nd.name())))
}

pub fn content_matches(pattern: &str) -> CondFn {
    let rx = Regex::new(&format!("^(?:{})$", pattern)).expect("invalid content pattern");
    Rc::new(move |path: &[Node]| path.last().is_some_and(|nd| rx.is_match(&nd.content())))
}

pub fn has_content(content: &str) -> CondFn {
    let content = content.to_string();
    Rc::new(move |path: &[Node]| path.last().is_some_and(|nd| nd.content() == content))
}

/// True if the attribute exists; with a value given, the value must
/// match, too.
pub fn has_attr(name: &str, value: Option<&str>) -> CondFn {
    let name = name.to_string();
    let value = value.map(|v| v.to_string());
    Rc::new(move |path: &[Node]| {
        path.last().is_some_and(|nd| {
            if name.is_empty() {
                nd.has_attr()
            } else if let Some(v) = &value {
                nd.has_attr_named(&name) && nd.get_attr(&name, "") == *v
            } else {
                nd.has_attr_named(&name)
            }
        })
    })
}

/// True if one of the ancestors (up to `generations` steps upward, the
/// node itself not included) has one of the given names.
pub fn has_ancestor(names: &[&str], generations: usize) -> CondFn {
    let names: HashSet<String> = names.iter().map(|s| s.to_string()).collect();
    Rc::new(move |path: &[Node]| {
        path.iter()
            .rev()
            .skip(1)
            .take(generations)
            .any(|nd| names.contains(&nd.name()))
    })
}

pub fn has_parent(names: &[&str]) -> CondFn {
    has_ancestor(names, 1)
}

pub fn has_child(names: &[&str]) -> CondFn {
    let names: HashSet<String> = names.iter().map(|s| s.to_string()).collect();
    Rc::new(move |path: &[Node]| {
        path.last()
            .is_some_and(|nd| nd.children().iter().any(|c| names.contains(&c.name())))
    })
}

pub fn has_descendant(names: &[&str], generations: usize) -> CondFn {
    let names: HashSet<String> = names.iter().map(|s| s.to_string()).collect();
    Rc::new(move |path: &[Node]| {
        fn search(node: &Node, names: &HashSet<String>, generations: usize) -> bool {
            if generations == 0 {
                return false;
            }
            for child in node.children() {
                if names.contains(&child.name()) || search(&child, names, generations - 1) {
                    return true;
                }
            }
            false
        }
        path.last().is_some_and(|nd| search(nd, &names, generations))
    })
}

pub fn has_sibling(names: &[&str]) -> CondFn {
    let names: HashSet<String> = names.iter().map(|s| s.to_string()).collect();
    Rc::new(move |path: &[Node]| {
        if path.len() < 2 {
            return false;
        }
        let node = &path[path.len() - 1];
        path[path.len() - 2]
            .children()
            .iter()
            .any(|c| c != node && names.contains(&c.name()))
    })
}

pub fn neg(condition: CondFn) -> CondFn {
    Rc::new(move |path: &[Node]| !condition(path))
}

pub fn any_of(conditions: Vec<CondFn>) -> CondFn {
    Rc::new(move |path: &[Node]| conditions.iter().any(|c| c(path)))
}

pub fn all_of(conditions: Vec<CondFn>) -> CondFn {
    Rc::new(move |path: &[Node]| conditions.iter().all(|c| c(path)))
}

// attribute and error plumbing ///////////////////////////////////////////

/// Adds all attributes from the `src` nodes to `dest` and transfers their
/// errors to it. Needed whenever child nodes are merged into or replaced
/// by another node.
pub fn update_attr(dest: &Node, src: &[Node], root: &mut RootNode) {
    for s in src {
        if s != dest && s.has_attr() {
            for (k, v) in s.attrs() {
                if dest.has_attr_named(&k) && dest.get_attr(&k, "") != v {
                    panic!(
                        "conflicting attribute values for key {} when merging {} into {}",
                        k,
                        s.name(),
                        dest.name()
                    );
                }
                dest.set_attr(k, v);
            }
        }
        root.transfer_errors(s, dest);
    }
}

fn replace_by_node(node: &Node, child: &Node, root: &mut RootNode) {
    let nd_name = node.name();
    let ch_name = child.name();
    if nd_name.is_empty() || nd_name.starts_with(':') || !(ch_name.is_empty() || ch_name.starts_with(':')) {
        node.set_name(ch_name);
    }
    node.set_result_raw(child.raw_content());
    update_attr(node, &[child.clone()], root);
}

fn reduce_child_node(node: &Node, child: &Node, root: &mut RootNode) {
    node.set_result_raw(child.raw_content());
    update_attr(node, &[child.clone()], root);
}

// rearranging rules //////////////////////////////////////////////////////

/// Replaces a node having a single child by that child. Attributes are
/// merged, with the child's values taking precedence.
pub fn replace_by_single_child() -> Rule {
    Rc::new(|root, path| {
        let node = path.last().unwrap();
        if node.child_count() == 1 {
            let child = node.children()[0].clone();
            replace_by_node(node, &child, root);
        }
    })
}

/// Replaces a node by its children. Its attributes are dropped. The root
/// itself is only replaced if it has a single child.
pub fn replace_by_children() -> Rule {
    Rc::new(|root, path| {
        if path.len() < 2 {
            let node = path.last().unwrap();
            if node.child_count() == 1 {
                let child = node.children()[0].clone();
                replace_by_node(node, &child, root);
            }
            return;
        }
        let node = &path[path.len() - 1];
        if node.has_children() {
            let parent = &path[path.len() - 2];
            let children = parent.children();
            let i = children
                .iter()
                .position(|c| c == node)
                .expect("path must be connected");
            let mut new_children = children[..i].to_vec();
            new_children.extend(node.children());
            new_children.extend(children[i + 1..].iter().cloned());
            parent.set_result_raw(NodeContent::Branch(new_children));
        }
    })
}

/// Reduces a node having a single child by taking over the child's
/// content, but keeping the node's name. Attributes are merged, with the
/// node's values taking precedence.
pub fn reduce_single_child() -> Rule {
    Rc::new(|root, path| {
        let node = path.last().unwrap();
        if node.child_count() == 1 {
            let child = node.children()[0].clone();
            reduce_child_node(node, &child, root);
        }
    })
}

/// Replaces a node having a single child by the child if the condition
/// holds; reduces the child otherwise.
pub fn replace_or_reduce(condition: CondFn) -> Rule {
    Rc::new(move |root, path| {
        let node = path.last().unwrap();
        if node.child_count() == 1 {
            let child = node.children()[0].clone();
            if condition(path) {
                replace_by_node(node, &child, root);
            } else {
                reduce_child_node(node, &child, root);
            }
        }
    })
}

/// Renames the current node.
pub fn change_name(name: &str) -> Rule {
    let name = name.to_string();
    Rc::new(move |_root, path| {
        path.last().unwrap().set_name(name.clone());
    })
}

/// Renames the children of the current node according to the
/// replacement pairs.
pub fn replace_child_names(replacements: &[(&str, &str)]) -> Rule {
    let replacements: HashMap<String, String> = replacements
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect();
    Rc::new(move |_root, path| {
        for child in path.last().unwrap().children() {
            if let Some(new_name) = replacements.get(&child.name()) {
                child.set_name(new_name.clone());
            }
        }
    })
}

/// Flattens all children fulfilling the condition (anonymous children by
/// default): wherever such a child has children itself, those are
/// inserted in its place. Recursive flattening collapses nested anonymous
/// wrappers entirely.
pub fn flatten(condition: CondFn, recursive: bool) -> Rule {
    fn flatten_impl(
        root: &mut RootNode,
        path: &mut Path,
        condition: &CondFn,
        recursive: bool,
    ) {
        let node = path.last().unwrap().clone();
        if !node.has_children() {
            return;
        }
        let mut new_result: Vec<Node> = Vec::new();
        for child in node.children() {
            path.push(child.clone());
            let matches = child.has_children() && condition(path);
            if matches {
                if recursive {
                    flatten_impl(root, path, condition, recursive);
                }
                new_result.extend(child.children());
                update_attr(&node, &[child.clone()], root);
            } else {
                new_result.push(child.clone());
            }
            path.pop();
        }
        node.set_result_raw(NodeContent::Branch(new_result));
    }
    Rc::new(move |root, path| {
        let mut path = path.to_vec();
        flatten_impl(root, &mut path, &condition, recursive);
    })
}

/// Flattens nested anonymous wrappers recursively.
pub fn flatten_anonymous() -> Rule {
    flatten(Rc::new(is_anonymous), true)
}

/// Collapses the node's subtree to its string content. Attributes of
/// descendants are pulled up.
pub fn collapse() -> Rule {
    Rc::new(|_root, path| {
        let node = path.last().unwrap();
        for descendant in node.select_if(
            Rc::new(|nd: &Node| nd.has_attr()),
            false,
            false,
            Rc::new(|_| false),
        ) {
            node.update_attrs(descendant.attrs());
        }
        node.set_text(node.content());
    })
}

fn fuse_anonymous_leaves(result: Vec<Node>) -> Vec<Node> {
    let mut fused: Vec<Node> = Vec::new();
    let mut i = 0;
    while i < result.len() {
        let nd = result[i].clone();
        if nd.is_leaf() && nd.name().starts_with(':') {
            let mut k = i + 1;
            let mut text = nd.content();
            while k < result.len()
                && result[k].is_leaf()
                && result[k].name().starts_with(':')
            {
                text.push_str(&result[k].content());
                k += 1;
            }
            if k - i > 1 {
                nd.set_text(text);
            }
            fused.push(nd);
            i = k;
        } else {
            fused.push(nd);
            i += 1;
        }
    }
    fused
}

fn fuse(result: &[Node], swallow: Option<&CondFn>) -> NodeContent {
    let mut nodes: Vec<Node> = result.to_vec();
    if let Some(swallow_fn) = swallow {
        for nd in nodes.iter_mut() {
            if swallow_fn(&[nd.clone()]) {
                *nd = Node::new(":Swallowed", vec![nd.clone()]);
            }
        }
    }
    if nodes.iter().all(|nd| nd.is_leaf()) {
        let mut text = String::new();
        for nd in &nodes {
            text.push_str(&nd.content());
        }
        NodeContent::Leaf(text)
    } else {
        let mut flattened: Vec<Node> = Vec::new();
        for nd in nodes {
            if nd.has_children() {
                flattened.extend(nd.children());
            } else {
                let text = Node::new_leaf(TOKEN_PTYPE, nd.content());
                if let Some(p) = nd.pos_opt() {
                    text.with_pos(p);
                }
                flattened.push(text);
            }
        }
        NodeContent::Branch(fuse_anonymous_leaves(flattened))
    }
}

/// Merges adjacent children fulfilling the condition. Leaf content is
/// merged directly; mixed runs keep their branch children, with leaf
/// content wrapped into anonymous text nodes. The merged node is renamed
/// to `preferred_name` (if non-empty and more than one node was merged).
/// Nodes matched by `swallow` are kept intact as a whole.
pub fn merge_adjacent(
    condition: CondFn,
    preferred_name: &str,
    swallow: Option<CondFn>,
) -> Rule {
    let preferred_name = preferred_name.to_string();
    Rc::new(move |root, path| {
        let node = path.last().unwrap();
        let children = node.children();
        if children.is_empty() {
            return;
        }
        let mut new_result: Vec<Node> = Vec::new();
        let mut i = 0;
        while i < children.len() {
            let mut probe = path.to_vec();
            probe.push(children[i].clone());
            if condition(&probe) {
                let k = i;
                i += 1;
                loop {
                    if i >= children.len() {
                        break;
                    }
                    let mut probe = path.to_vec();
                    probe.push(children[i].clone());
                    if !condition(&probe) {
                        break;
                    }
                    i += 1;
                }
                let adjacent = &children[k..i];
                let mut head = adjacent[0].clone();
                if let Some(swallow_fn) = &swallow {
                    if swallow_fn(&[head.clone()]) {
                        let replacement = Node::new_leaf(
                            if preferred_name.is_empty() {
                                head.name()
                            } else {
                                preferred_name.clone()
                            },
                            "",
                        );
                        if let Some(p) = head.pos_opt() {
                            replacement.with_pos(p);
                        }
                        head = replacement;
                    } else if !preferred_name.is_empty() && adjacent.len() > 1 {
                        head.set_name(preferred_name.clone());
                    }
                } else if !preferred_name.is_empty() && adjacent.len() > 1 {
                    head.set_name(preferred_name.clone());
                }
                head.set_result(fuse(adjacent, swallow.as_ref()));
                let tail: Vec<Node> = adjacent[1..]
                    .iter()
                    .filter(|nd| {
                        swallow
                            .as_ref()
                            .map(|sw| !sw(&[(*nd).clone()]))
                            .unwrap_or(true)
                    })
                    .cloned()
                    .collect();
                update_attr(&head, &tail, root);
                new_result.push(head);
            } else {
                new_result.push(children[i].clone());
                i += 1;
            }
        }
        node.set_result_raw(NodeContent::Branch(new_result));
    })
}

/// Merges adjacent anonymous leaves.
pub fn merge_leaves() -> Rule {
    merge_adjacent(Rc::new(is_anonymous_leaf), "", None)
}

// stripping and removal //////////////////////////////////////////////////

fn lstrip_impl(path: &mut Path, condition: &CondFn) {
    loop {
        let node = path.last().unwrap().clone();
        if !node.has_children() {
            return;
        }
        let children = node.children();
        path.push(children[0].clone());
        lstrip_impl(path, condition);
        path.pop();
        let children = node.children();
        let mut i = 0;
        while i < children.len() {
            let mut probe = path.to_vec();
            probe.push(children[i].clone());
            if !condition(&probe) {
                break;
            }
            i += 1;
        }
        if i > 0 {
            node.set_result_raw(NodeContent::Branch(children[i..].to_vec()));
        }
        if i == 0 {
            return;
        }
    }
}

fn rstrip_impl(path: &mut Path, condition: &CondFn) {
    loop {
        let node = path.last().unwrap().clone();
        if !node.has_children() {
            return;
        }
        let children = node.children();
        path.push(children[children.len() - 1].clone());
        rstrip_impl(path, condition);
        path.pop();
        let children = node.children();
        let mut k = children.len();
        while k > 0 {
            let mut probe = path.to_vec();
            probe.push(children[k - 1].clone());
            if !condition(&probe) {
                break;
            }
            k -= 1;
        }
        if k < children.len() {
            node.set_result_raw(NodeContent::Branch(children[..k].to_vec()));
        } else {
            return;
        }
    }
}

/// Recursively removes all leading children fulfilling the condition
/// (whitespace-only children by default).
pub fn lstrip(condition: CondFn) -> Rule {
    Rc::new(move |_root, path| {
        let mut path = path.to_vec();
        lstrip_impl(&mut path, &condition);
    })
}

/// Recursively removes all trailing children fulfilling the condition.
pub fn rstrip(condition: CondFn) -> Rule {
    Rc::new(move |_root, path| {
        let mut path = path.to_vec();
        rstrip_impl(&mut path, &condition);
    })
}

/// Removes leading and trailing children fulfilling the condition.
pub fn strip(condition: CondFn) -> Rule {
    let left = lstrip(condition.clone());
    let right = rstrip(condition);
    Rc::new(move |root, path| {
        left(root, path);
        right(root, path);
    })
}

/// Keeps only the children whose indices fall into the given range.
/// Bounds beyond the number of children are clamped.
pub fn keep_children(range: std::ops::Range<usize>) -> Rule {
    Rc::new(move |_root, path| {
        let node = path.last().unwrap();
        if node.has_children() {
            let children = node.children();
            let start = range.start.min(children.len());
            let end = range.end.min(children.len()).max(start);
            node.set_result_raw(NodeContent::Branch(children[start..end].to_vec()));
        }
    })
}

/// Keeps only the children fulfilling the condition.
pub fn keep_children_if(condition: CondFn) -> Rule {
    Rc::new(move |_root, path| {
        let node = path.last().unwrap();
        if node.has_children() {
            let kept: Vec<Node> = node
                .children()
                .into_iter()
                .filter(|c| {
                    let mut probe = path.to_vec();
                    probe.push(c.clone());
                    condition(&probe)
                })
                .collect();
            node.set_result_raw(NodeContent::Branch(kept));
        }
    })
}

/// Keeps only children with one of the given names.
pub fn keep_nodes(names: &[&str]) -> Rule {
    keep_children_if(is_one_of(names))
}

/// Keeps only children whose content matches the pattern.
pub fn keep_content(pattern: &str) -> Rule {
    keep_children_if(content_matches(pattern))
}

/// Removes all children fulfilling the condition.
pub fn remove_children_if(condition: CondFn) -> Rule {
    keep_children_if(neg(condition))
}

/// Removes all whitespace-only children.
pub fn remove_whitespace() -> Rule {
    remove_children_if(is_one_of(&[WHITESPACE_PTYPE]))
}

/// Removes all empty children.
pub fn remove_empty() -> Rule {
    remove_children_if(Rc::new(is_empty))
}

/// Removes all empty anonymous children.
pub fn remove_anonymous_empty() -> Rule {
    remove_children_if(Rc::new(|path: &[Node]| {
        is_empty(path) && is_anonymous(path)
    }))
}

/// Removes all anonymous leaf children whose content is one of `tokens`
/// (or any, if empty).
pub fn remove_anonymous_tokens(tokens: &[&str]) -> Rule {
    let token_cond = is_token(tokens);
    remove_children_if(Rc::new(move |path: &[Node]| {
        token_cond(path) && is_anonymous(path)
    }))
}

/// Removes children whose content is one of `tokens`.
pub fn remove_tokens(tokens: &[&str]) -> Rule {
    remove_children_if(is_token(tokens))
}

/// Removes children by name.
pub fn remove_children(names: &[&str]) -> Rule {
    remove_children_if(is_one_of(names))
}

/// Removes children whose content matches the pattern.
pub fn remove_content(pattern: &str) -> Rule {
    remove_children_if(content_matches(pattern))
}

/// Removes any leading or trailing run of parser-generated leaves
/// (whitespace, tokens, regexps).
pub fn remove_brackets() -> Rule {
    fn disposable(node: &Node) -> bool {
        crate::node::LEAF_PTYPES.contains(&node.name().as_str())
            || (node.has_name(":Series")
                && node
                    .children()
                    .iter()
                    .all(|c| crate::node::LEAF_PTYPES.contains(&c.name().as_str())))
    }
    Rc::new(|_root, path| {
        let node = path.last().unwrap();
        let children = node.children();
        if children.is_empty() {
            return;
        }
        let mut i = 0;
        while i < children.len() && disposable(&children[i]) {
            i += 1;
        }
        let mut k = children.len();
        while k > 0 && disposable(&children[k - 1]) {
            k -= 1;
        }
        if i <= k {
            node.set_result_raw(NodeContent::Branch(children[i..k].to_vec()));
        } else {
            node.set_result_raw(NodeContent::Branch(Vec::new()));
        }
    })
}

/// Removes the current node from its parent.
pub fn remove() -> Rule {
    Rc::new(|_root, path| {
        if path.len() < 2 {
            return;
        }
        let node = &path[path.len() - 1];
        let parent = &path[path.len() - 2];
        let remaining: Vec<Node> = parent
            .children()
            .into_iter()
            .filter(|c| c != node)
            .collect();
        parent.set_result_raw(NodeContent::Branch(remaining));
    })
}

/// Removes the current node if the condition holds.
pub fn remove_if(condition: CondFn) -> Rule {
    let inner = remove();
    Rc::new(move |root, path| {
        if condition(path) {
            inner(root, path);
        }
    })
}

// content rules //////////////////////////////////////////////////////////

/// Replaces the node's result by the value the function maps it to.
pub fn transform_result(func: impl Fn(NodeContent) -> NodeContent + 'static) -> Rule {
    Rc::new(move |_root, path| {
        let node = path.last().unwrap();
        node.set_result(func(node.result()));
    })
}

/// Replaces the content of the node with the given text.
pub fn replace_content_with(content: &str) -> Rule {
    let content = content.to_string();
    Rc::new(move |_root, path| {
        path.last().unwrap().set_text(content.clone());
    })
}

/// Collapses any whitespace run in the node's content to a single blank.
pub fn normalize_whitespace() -> Rule {
    Rc::new(|_root, path| {
        let node = path.last().unwrap();
        if node.is_leaf() {
            let content = node.content();
            let mut out = String::with_capacity(content.len());
            let mut in_whitespace = false;
            for c in content.chars() {
                if c.is_whitespace() {
                    if !in_whitespace {
                        out.push(' ');
                    }
                    in_whitespace = true;
                } else {
                    out.push(c);
                    in_whitespace = false;
                }
            }
            node.set_text(out);
        }
    })
}

/// Adds the given attributes to the node.
pub fn add_attributes(attributes: &[(&str, &str)]) -> Rule {
    let attributes: Vec<(String, String)> = attributes
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Rc::new(move |_root, path| {
        path.last().unwrap().update_attrs(attributes.clone());
    })
}

/// Removes the given attributes from the node; all of them, if the list
/// is empty.
pub fn del_attributes(attributes: &[&str]) -> Rule {
    let attributes: Vec<String> = attributes.iter().map(|s| s.to_string()).collect();
    Rc::new(move |_root, path| {
        let node = path.last().unwrap();
        if node.has_attr() {
            if attributes.is_empty() {
                node.clear_attrs();
            } else {
                for attr in &attributes {
                    node.remove_attr(attr);
                }
            }
        }
    })
}

/// A parameter-free factory producing fresh leaf nodes.
pub fn node_maker(name: &str, content: &str, attributes: &[(&str, &str)]) -> Rc<dyn Fn() -> Node> {
    let name = name.to_string();
    let content = content.to_string();
    let attributes: Vec<(String, String)> = attributes
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Rc::new(move || {
        let node = Node::new_leaf(name.clone(), content.clone());
        if !attributes.is_empty() {
            node.update_attrs(attributes.clone());
        }
        node
    })
}

/// The child positions with one of the given names.
pub fn positions_of(path: &[Node], names: &[&str]) -> Vec<usize> {
    let names: HashSet<&str> = names.iter().copied().collect();
    path.last()
        .map(|nd| {
            nd.children()
                .iter()
                .enumerate()
                .filter(|(_, c)| names.contains(c.name().as_str()))
                .map(|(i, _)| i)
                .collect()
        })
        .unwrap_or_default()
}

/// The positions between all children.
pub fn delimiter_positions(path: &[Node]) -> Vec<usize> {
    (1..path.last().map(|nd| nd.child_count()).unwrap_or(0)).collect()
}

/// Inserts nodes drawn from the factory at the given child positions.
/// Positions at or beyond the number of children append.
pub fn insert(
    positions: impl Fn(&[Node]) -> Vec<usize> + 'static,
    factory: Rc<dyn Fn() -> Node>,
) -> Rule {
    Rc::new(move |_root, path| {
        let node = path.last().unwrap();
        let mut pos_list = positions(path);
        if pos_list.is_empty() {
            return;
        }
        assert!(
            node.has_children() || node.is_empty(),
            "cannot insert nodes into a leaf node"
        );
        pos_list.sort_unstable_by(|a, b| b.cmp(a));
        let mut children = node.children();
        for n in pos_list {
            let n = n.min(children.len());
            let new_node = factory();
            let text_pos = if n > 0 {
                children[n - 1].pos_opt().map(|p| p + children[n - 1].strlen())
            } else {
                node.pos_opt()
            };
            if let Some(p) = text_pos {
                new_node.with_pos(p);
            }
            children.insert(n, new_node);
        }
        node.set_children(children);
    })
}

/// Adds a delimiter drawn from the factory between all children.
pub fn delimit_children(factory: Rc<dyn Fn() -> Node>) -> Rule {
    insert(delimiter_positions, factory)
}

// diagnostics rules //////////////////////////////////////////////////////

/// Attaches an error with the given message and code to the node
/// unconditionally. `{name}` and `{content}` in the message are replaced
/// by the node's name and content.
pub fn add_error(message: &str, code: ErrorCode) -> Rule {
    let message = message.to_string();
    Rc::new(move |root, path| {
        let node = path.last().unwrap();
        let message = if message.is_empty() {
            "Syntax Error".to_string()
        } else {
            message
                .replace("{name}", &node.name())
                .replace("{content}", &node.content())
        };
        root.new_error(node, message, code);
    })
}

/// Attaches an error if the condition holds.
pub fn error_on(condition: CondFn, message: &str, code: ErrorCode) -> Rule {
    let inner = add_error(message, code);
    Rc::new(move |root, path| {
        if condition(path) {
            inner(root, path);
        }
    })
}

/// Attaches an error if the node has no children.
pub fn assert_has_children() -> Rule {
    error_on(
        Rc::new(|path: &[Node]| !has_children(path)),
        "element \"{name}\" has no children",
        AST_TRANSFORM_CRASH,
    )
}

/// Attaches an error if the node's content does not match the pattern.
pub fn assert_content(pattern: &str) -> Rule {
    let matcher = content_matches(pattern);
    let pattern = pattern.to_string();
    Rc::new(move |root, path| {
        if !matcher(path) {
            let node = path.last().unwrap();
            root.new_error(
                node,
                format!(
                    "element \"{}\" violates {} on {}",
                    node.name(),
                    pattern,
                    node.content()
                ),
                ERROR,
            );
        }
    })
}

/// Attaches errors for children whose names are not among the allowed
/// ones.
pub fn require(child_names: &[&str]) -> Rule {
    let allowed: HashSet<String> = child_names.iter().map(|s| s.to_string()).collect();
    Rc::new(move |root, path| {
        let node = path.last().unwrap().clone();
        for child in node.children() {
            if !allowed.contains(&child.name()) {
                root.new_error(
                    &node,
                    format!(
                        "element \"{}\" is not allowed inside \"{}\"",
                        child.name(),
                        node.name()
                    ),
                    ERROR,
                );
            }
        }
    })
}

/// Attaches errors for children with one of the forbidden names.
pub fn forbid(child_names: &[&str]) -> Rule {
    let forbidden: HashSet<String> = child_names.iter().map(|s| s.to_string()).collect();
    Rc::new(move |root, path| {
        let node = path.last().unwrap().clone();
        for child in node.children() {
            if forbidden.contains(&child.name()) {
                root.new_error(
                    &node,
                    format!(
                        "element \"{}\" cannot be nested inside \"{}\"",
                        child.name(),
                        node.name()
                    ),
                    ERROR,
                );
            }
        }
    })
}

// combinators ////////////////////////////////////////////////////////////

/// Applies the rule only if the condition holds.
pub fn apply_if(inner: Rule, condition: CondFn) -> Rule {
    Rc::new(move |root, path| {
        if condition(path) {
            inner(root, path);
        }
    })
}

/// Applies the rule unless the condition holds.
pub fn apply_unless(inner: Rule, condition: CondFn) -> Rule {
    apply_if(inner, neg(condition))
}

/// Applies `then_rule` if the condition holds, `else_rule` otherwise.
pub fn apply_ifelse(then_rule: Rule, else_rule: Rule, condition: CondFn) -> Rule {
    Rc::new(move |root, path| {
        if condition(path) {
            then_rule(root, path);
        } else {
            else_rule(root, path);
        }
    })
}

/// Runs a complete transformation table on the subtree of the current
/// node.
pub fn traverse_locally(table: Rc<TransformationTable>) -> Rule {
    Rc::new(move |root, path| {
        fn local_recursive(
            root: &mut RootNode,
            table: &TransformationTable,
            path: &mut Path,
        ) {
            let node = path.last().unwrap().clone();
            let (filters, sequence) = table.lookup(&node.name());
            let mut children = node.children();
            for filter in &filters {
                children = filter(children);
            }
            for child in children {
                path.push(child);
                local_recursive(root, table, path);
                path.pop();
            }
            for call in &sequence {
                call(root, path);
            }
        }
        let mut local_path = path.to_vec();
        local_recursive(root, &table, &mut local_path);
    })
}

/// Recursively merges nodes whose descendants are all anonymous leaves
/// into leaves carrying the merged content. Positions, once assigned,
/// remain monotonic.
pub fn merge_treetops(node: &Node) {
    if node.has_children() {
        let mut crunch = true;
        for child in node.children() {
            if child.has_children() {
                merge_treetops(&child);
                crunch = false;
            } else if !child.is_anonymous() {
                crunch = false;
            }
        }
        if crunch {
            node.set_text(node.content());
        }
    }
}

#[cfg(test)]
#[path = "transform_tests.rs"]
mod transform_tests;
