//! Navigation along and between paths.
//!
//! A *path* is the ordered sequence of nodes from a root down to one of
//! its descendants (root first). Since nodes do not carry parent links,
//! paths are the working currency of every algorithm that needs to look
//! upward, sideways, or across subtree boundaries.

use std::rc::Rc;

use crate::criteria::{
    create_match_function, create_path_match_function, Criterion, NodeMatchFn, PathCriterion,
    PathMatchFn,
};
use crate::node::{Node, Path};

/// Yields the names of the nodes along the path.
pub fn path_names(path: &[Node]) -> impl Iterator<Item = String> + '_ {
    path.iter().map(|nd| nd.name())
}

/// Returns the path as a pseudo file-path of node names; paths ending in
/// a branch node get a trailing slash.
pub fn path_str(path: &[Node]) -> String {
    let mut parts = vec![String::new()];
    for node in path {
        let name = node.name();
        debug_assert!(!name.contains('/'), "path_str() requires names without \"/\"");
        parts.push(name);
    }
    if path.last().is_some_and(|nd| nd.has_children()) {
        parts.push(String::new());
    }
    parts.join("/")
}

/// Matches a [`path_str`] against a glob pattern with `*` and `?`
/// wildcards. Patterns that do not start with `/` or `*` are matched
/// against the end of the path.
pub fn match_path_str(path_str: &str, glob_pattern: &str) -> bool {
    let pattern = if glob_pattern.starts_with('/') || glob_pattern.starts_with('*') {
        glob_pattern.to_string()
    } else {
        format!("*/{}", glob_pattern)
    };
    fn glob_match(text: &[u8], pattern: &[u8]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some(b'*'), _) => {
                glob_match(text, &pattern[1..])
                    || (!text.is_empty() && glob_match(&text[1..], pattern))
            }
            (Some(b'?'), Some(_)) => glob_match(&text[1..], &pattern[1..]),
            (Some(&p), Some(&t)) if p == t => glob_match(&text[1..], &pattern[1..]),
            _ => false,
        }
    }
    glob_match(path_str.as_bytes(), pattern.as_bytes())
}

/// Serializes a path as a string of node names; the last `with_content`
/// nodes are shown together with their content.
pub fn pp_path(path: &[Node], with_content: usize, delimiter: &str) -> String {
    let n = path.len().saturating_sub(with_content);
    path.iter()
        .enumerate()
        .map(|(i, nd)| {
            if i >= n {
                format!("{} \"{}\"", nd.name(), nd.content())
            } else {
                nd.name()
            }
        })
        .collect::<Vec<String>>()
        .join(delimiter)
}

/// Checks whether the nodes in the path are immediate descendants of one
/// another.
pub fn path_sanity_check(path: &[Node]) -> bool {
    (1..path.len()).all(|i| path[i - 1].children().iter().any(|c| *c == path[i]))
}

// siblings ///////////////////////////////////////////////////////////////

fn position_of(parent: &Node, node: &Node) -> Option<usize> {
    parent.children().iter().position(|c| c == node)
}

/// Returns the siblings preceding the end of the path that match the
/// criterion, iterated left to right (or right to left with `reverse`).
pub fn pred_siblings(
    path: &[Node],
    criterion: impl Into<Criterion>,
    reverse: bool,
) -> Vec<Node> {
    assert!(path.len() > 1, "the end of the path has no parent and thus no siblings");
    let mf = create_match_function(criterion.into());
    let children = path[path.len() - 2].children();
    let i = position_of(&path[path.len() - 2], &path[path.len() - 1])
        .expect("path must be connected");
    let mut result: Vec<Node> = children[..i].iter().filter(|nd| mf(nd)).cloned().collect();
    if reverse {
        result.reverse();
    }
    result
}

/// Returns the siblings succeeding the end of the path that match the
/// criterion.
pub fn succ_siblings(
    path: &[Node],
    criterion: impl Into<Criterion>,
    reverse: bool,
) -> Vec<Node> {
    assert!(path.len() > 1, "the end of the path has no parent and thus no siblings");
    let mf = create_match_function(criterion.into());
    let children = path[path.len() - 2].children();
    let i = position_of(&path[path.len() - 2], &path[path.len() - 1])
        .expect("path must be connected");
    let mut result: Vec<Node> = children[i + 1..].iter().filter(|nd| mf(nd)).cloned().collect();
    if reverse {
        result.reverse();
    }
    result
}

// stepping through the tree //////////////////////////////////////////////

/// Returns the path of the node preceding the end of the path in
/// pre-order, or `None` at the beginning of the tree.
pub fn prev_path(path: &[Node]) -> Option<Path> {
    let mut node = path.last()?.clone();
    for i in (0..path.len().saturating_sub(1)).rev() {
        let siblings = path[i].children();
        if node != siblings[0] {
            let k = siblings
                .iter()
                .position(|s| *s == node)
                .expect("path must be connected");
            let mut result = path[..i + 1].to_vec();
            result.push(siblings[k - 1].clone());
            return Some(result);
        }
        node = path[i].clone();
    }
    None
}

/// Returns the path of the node succeeding the end of the path in
/// pre-order, or `None` at the end of the tree.
pub fn next_path(path: &[Node]) -> Option<Path> {
    let mut node = path.last()?.clone();
    for i in (0..path.len().saturating_sub(1)).rev() {
        let siblings = path[i].children();
        if node != siblings[siblings.len() - 1] {
            let k = siblings
                .iter()
                .position(|s| *s == node)
                .expect("path must be connected");
            let mut result = path[..i + 1].to_vec();
            result.push(siblings[k + 1].clone());
            return Some(result);
        }
        node = path[i].clone();
    }
    None
}

/// Which child to follow when descending into a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickChild {
    First,
    Last,
}

/// Extends the path by descending `steps` generations (or, with a
/// negative value, down to a leaf), following the first or last child at
/// each level.
pub fn zoom_into_path(path: Option<Path>, pick: PickChild, steps: i64) -> Option<Path> {
    let mut path = path?;
    let mut top = path.last()?.clone();
    let mut steps = steps;
    while top.has_children() && steps != 0 {
        let children = top.children();
        top = match pick {
            PickChild::First => children[0].clone(),
            PickChild::Last => children[children.len() - 1].clone(),
        };
        path.push(top.clone());
        steps -= 1;
    }
    Some(path)
}

/// Extends the path down to a leaf.
pub fn leaf_path(path: Option<Path>, pick: PickChild) -> Option<Path> {
    zoom_into_path(path, pick, -1)
}

/// The path of the leaf following the end of the path in document order.
pub fn next_leaf_path(path: &[Node]) -> Option<Path> {
    leaf_path(next_path(path), PickChild::First)
}

/// The path of the leaf preceding the end of the path in document order.
pub fn prev_leaf_path(path: &[Node]) -> Option<Path> {
    leaf_path(prev_path(path), PickChild::Last)
}

/// Returns up to `length` characters of string content preceding the
/// path (all of it for a negative length).
pub fn foregoing_str(path: &[Node], length: i64) -> String {
    let mut collected = 0usize;
    let mut pieces: Vec<String> = Vec::new();
    let mut current = prev_path(path);
    while let Some(p) = current {
        if length >= 0 && collected >= length as usize {
            break;
        }
        let s = p.last().unwrap().content();
        collected += s.len();
        pieces.push(s);
        current = prev_path(&p);
    }
    pieces.reverse();
    let joined = pieces.concat();
    if length < 0 {
        joined
    } else {
        let skip = joined.len().saturating_sub(length as usize);
        joined[skip..].to_string()
    }
}

/// Returns up to `length` characters of string content succeeding the
/// path (all of it for a negative length).
pub fn ensuing_str(path: &[Node], length: i64) -> String {
    let mut collected = 0usize;
    let mut pieces: Vec<String> = Vec::new();
    let mut current = next_path(path);
    while let Some(p) = current {
        if length >= 0 && collected >= length as usize {
            break;
        }
        let s = p.last().unwrap().content();
        collected += s.len();
        pieces.push(s);
        current = next_path(&p);
    }
    let joined = pieces.concat();
    if length < 0 {
        joined
    } else {
        joined[..joined.len().min(length as usize)].to_string()
    }
}

// continuing the traversal from a given path /////////////////////////////

/// Drives `visitor` over all paths from `start_path` onward (in document
/// order, or backwards with `reverse`), pruning subtrees matched by
/// `skip_fn`. The visitor returns `false` to stop the traversal. Paths of
/// ancestors are visited after their subtrees have been exhausted.
fn visit_paths_from(
    start_path: &[Node],
    include_root: bool,
    reverse: bool,
    skip_fn: &PathMatchFn,
    visitor: &mut dyn FnMut(&[Node]) -> bool,
) {
    fn recursive(
        path: &mut Path,
        reverse: bool,
        skip_fn: &PathMatchFn,
        visitor: &mut dyn FnMut(&[Node]) -> bool,
    ) -> bool {
        if !visitor(path) {
            return false;
        }
        let mut children = path.last().expect("path never empty").children();
        if reverse {
            children.reverse();
        }
        for child in children {
            path.push(child);
            if !skip_fn(path) && !recursive(path, reverse, skip_fn, visitor) {
                return false;
            }
            path.pop();
        }
        true
    }

    let mut path = start_path.to_vec();
    let mut include = include_root;
    while !path.is_empty() {
        if include {
            if !recursive(&mut path, reverse, skip_fn, visitor) {
                return;
            }
        } else {
            include = true;
        }
        let mut node = path.pop().expect("loop guard");
        loop {
            let Some(parent) = path.last() else { break };
            let siblings = parent.children();
            let edge = if reverse { 0 } else { siblings.len() - 1 };
            if node != siblings[edge] {
                break;
            }
            if !visitor(&path) {
                return;
            }
            node = path.pop().expect("loop guard");
        }
        if let Some(parent) = path.last() {
            let siblings = parent.children();
            let i = siblings
                .iter()
                .position(|s| *s == node)
                .expect("path must be connected");
            let next = if reverse { i - 1 } else { i + 1 };
            path.push(siblings[next].clone());
        }
    }
}

/// All paths from `start_path` onward for which the match function is
/// true, continuing across subtree boundaries to the end of the tree.
pub fn select_path_if(
    start_path: &[Node],
    match_fn: PathMatchFn,
    include_root: bool,
    reverse: bool,
    skip_fn: PathMatchFn,
) -> Vec<Path> {
    let mut result = Vec::new();
    visit_paths_from(start_path, include_root, reverse, &skip_fn, &mut |path| {
        if match_fn(path) {
            result.push(path.to_vec());
        }
        true
    });
    result
}

/// See [`select_path_if`].
pub fn select_path(
    start_path: &[Node],
    criterion: impl Into<PathCriterion>,
    include_root: bool,
    reverse: bool,
) -> Vec<Path> {
    select_path_if(
        start_path,
        create_path_match_function(criterion.into()),
        include_root,
        reverse,
        Rc::new(|_| false),
    )
}

/// The first path from `start_path` onward for which the match function
/// is true, or `None`.
pub fn pick_path_if(
    start_path: &[Node],
    match_fn: PathMatchFn,
    include_root: bool,
    reverse: bool,
    skip_fn: PathMatchFn,
) -> Option<Path> {
    let mut result = None;
    visit_paths_from(start_path, include_root, reverse, &skip_fn, &mut |path| {
        if match_fn(path) {
            result = Some(path.to_vec());
            false
        } else {
            true
        }
    });
    result
}

/// See [`pick_path_if`].
pub fn pick_path(
    start_path: &[Node],
    criterion: impl Into<PathCriterion>,
    include_root: bool,
    reverse: bool,
) -> Option<Path> {
    pick_path_if(
        start_path,
        create_path_match_function(criterion.into()),
        include_root,
        reverse,
        Rc::new(|_| false),
    )
}

// matching along the path itself /////////////////////////////////////////

/// Yields the nodes of the path itself that satisfy the match function.
pub fn select_from_path_if(path: &[Node], match_fn: NodeMatchFn, reverse: bool) -> Vec<Node> {
    let mut result: Vec<Node> = path.iter().filter(|nd| match_fn(nd)).cloned().collect();
    if reverse {
        result.reverse();
    }
    result
}

/// Yields the nodes of the path itself that fulfill the criterion.
pub fn select_from_path(
    path: &[Node],
    criterion: impl Into<Criterion>,
    reverse: bool,
) -> Vec<Node> {
    select_from_path_if(path, create_match_function(criterion.into()), reverse)
}

/// The first node of the path that satisfies the match function.
pub fn pick_from_path_if(path: &[Node], match_fn: NodeMatchFn, reverse: bool) -> Option<Node> {
    select_from_path_if(path, match_fn, reverse).into_iter().next()
}

/// The first node of the path that fulfills the criterion.
pub fn pick_from_path(
    path: &[Node],
    criterion: impl Into<Criterion>,
    reverse: bool,
) -> Option<Node> {
    pick_from_path_if(path, create_match_function(criterion.into()), reverse)
}

/// Returns the beginning of the path up to and including the first node
/// matching the criterion (the last one with `greedy`); empty if no node
/// matches.
pub fn path_head_if(path: &[Node], match_fn: NodeMatchFn, greedy: bool) -> Path {
    let mut k = 0;
    for (i, nd) in path.iter().enumerate() {
        if match_fn(nd) {
            k = i + 1;
            if !greedy {
                break;
            }
        }
    }
    path[..k].to_vec()
}

/// See [`path_head_if`].
pub fn path_head(path: &[Node], criterion: impl Into<Criterion>, greedy: bool) -> Path {
    path_head_if(path, create_match_function(criterion.into()), greedy)
}

/// Returns the ending of the path from the last node matching the
/// criterion onward (the first one with `greedy`); empty if no node
/// matches.
pub fn path_tail_if(path: &[Node], match_fn: NodeMatchFn, greedy: bool) -> Path {
    let mut k = path.len();
    for i in (0..path.len()).rev() {
        if match_fn(&path[i]) {
            k = i;
            if !greedy {
                break;
            }
        }
    }
    path[k..].to_vec()
}

/// See [`path_tail_if`].
pub fn path_tail(path: &[Node], criterion: impl Into<Criterion>, greedy: bool) -> Path {
    path_tail_if(path, create_match_function(criterion.into()), greedy)
}

/// Drops the leaf at the end of the path and recursively removes all
/// ancestors that become empty by this.
pub fn drop_leaf(leaf_path: &[Node]) {
    assert!(
        leaf_path.last().is_some_and(|nd| nd.is_leaf()),
        "drop_leaf() requires a path ending in a leaf"
    );
    let tail = path_tail_if(
        leaf_path,
        Rc::new(|nd: &Node| nd.child_count() > 1),
        false,
    );
    if tail.len() > 1 {
        tail[0].remove_node(&tail[1]);
    } else {
        leaf_path[0].set_text("");
    }
}

/// Returns the deepest node appearing at the same position in both paths
/// together with its index, or `None` if the paths have no common root.
pub fn find_common_ancestor(path_a: &[Node], path_b: &[Node]) -> Option<(Node, usize)> {
    let mut result = None;
    for (i, (a, b)) in path_a.iter().zip(path_b.iter()).enumerate() {
        if a != b {
            break;
        }
        if i > 0 {
            let connected_a = path_a[i - 1].children().iter().any(|c| c == a);
            let connected_b = path_b[i - 1].children().iter().any(|c| c == b);
            if !connected_a || !connected_b {
                break;
            }
        }
        result = Some((a.clone(), i));
    }
    result
}

#[cfg(test)]
#[path = "path_tests.rs"]
mod path_tests;
