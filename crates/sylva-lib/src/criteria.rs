//! Matcher synthesis: turning selection criteria into match functions.
//!
//! Every selector in the crate accepts a [`Criterion`] (or
//! [`PathCriterion`]), which is converted into a predicate with
//! [`create_match_function`] / [`create_path_match_function`]:
//!
//! | criterion            | type of match                                 |
//! |----------------------|-----------------------------------------------|
//! | `NodeId`             | node identity (by id handle)                  |
//! | `Node`               | node identity; frozen nodes: value equality   |
//! | name (`&str`)        | equality of node name                         |
//! | several names        | name equals one of the given names            |
//! | `regex::Regex`       | full match of the node's content              |
//! | function             | the function returns true                     |

use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use regex::Regex;

use crate::node::{Node, NodeId};

/// A predicate on nodes.
pub type NodeMatchFn = Rc<dyn Fn(&Node) -> bool>;
/// A predicate on paths.
pub type PathMatchFn = Rc<dyn Fn(&[Node]) -> bool>;

/// A criterion for selecting nodes.
#[derive(Clone)]
pub enum Criterion {
    /// Matches every node.
    Always,
    /// Matches no node.
    Never,
    /// Matches only leaf nodes.
    Leaf,
    /// Matches only branch nodes.
    Branch,
    /// Matches the node itself (identity); for frozen nodes, matches by
    /// value equality instead.
    Node(Node),
    /// Matches the node with the given identity handle.
    Id(NodeId),
    /// Matches nodes with the given name.
    Name(String),
    /// Matches nodes whose name is one of the given names.
    Names(HashSet<String>),
    /// Matches nodes whose content fully matches the pattern.
    Content(Regex),
    /// Matches nodes for which the function returns true.
    Func(NodeMatchFn),
}

impl Criterion {
    pub fn func(f: impl Fn(&Node) -> bool + 'static) -> Criterion {
        Criterion::Func(Rc::new(f))
    }
}

impl fmt::Debug for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criterion::Always => write!(f, "ANY_NODE"),
            Criterion::Never => write!(f, "NO_NODE"),
            Criterion::Leaf => write!(f, "LEAF_NODE"),
            Criterion::Branch => write!(f, "BRANCH_NODE"),
            Criterion::Node(nd) => write!(f, "node {}", nd.name()),
            Criterion::Id(id) => write!(f, "node-id {:#x}", id),
            Criterion::Name(name) => write!(f, "\"{}\"", name),
            Criterion::Names(names) => {
                let mut sorted: Vec<&String> = names.iter().collect();
                sorted.sort();
                write!(f, "{:?}", sorted)
            }
            Criterion::Content(rx) => write!(f, "content ~ /{}/", rx),
            Criterion::Func(_) => write!(f, "<match function>"),
        }
    }
}

impl From<&str> for Criterion {
    fn from(name: &str) -> Self {
        Criterion::Name(name.to_string())
    }
}

impl From<String> for Criterion {
    fn from(name: String) -> Self {
        Criterion::Name(name)
    }
}

impl From<&Node> for Criterion {
    fn from(node: &Node) -> Self {
        Criterion::Node(node.clone())
    }
}

impl From<Node> for Criterion {
    fn from(node: Node) -> Self {
        Criterion::Node(node)
    }
}

impl From<NodeId> for Criterion {
    fn from(id: NodeId) -> Self {
        Criterion::Id(id)
    }
}

impl From<Regex> for Criterion {
    fn from(rx: Regex) -> Self {
        Criterion::Content(rx)
    }
}

impl From<&[&str]> for Criterion {
    fn from(names: &[&str]) -> Self {
        Criterion::Names(names.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Criterion {
    fn from(names: [&str; N]) -> Self {
        Criterion::Names(names.iter().map(|s| s.to_string()).collect())
    }
}

impl From<HashSet<String>> for Criterion {
    fn from(names: HashSet<String>) -> Self {
        Criterion::Names(names)
    }
}

/// Creates a node-match-function for the given criterion.
pub fn create_match_function(criterion: Criterion) -> NodeMatchFn {
    match criterion {
        Criterion::Always => Rc::new(|_| true),
        Criterion::Never => Rc::new(|_| false),
        Criterion::Leaf => Rc::new(|nd: &Node| nd.is_leaf()),
        Criterion::Branch => Rc::new(|nd: &Node| nd.has_children()),
        Criterion::Node(node) => {
            if node.is_frozen() {
                Rc::new(move |nd: &Node| nd.equals(&node, true))
            } else {
                Rc::new(move |nd: &Node| *nd == node)
            }
        }
        Criterion::Id(id) => Rc::new(move |nd: &Node| nd.id() == id),
        Criterion::Name(name) => Rc::new(move |nd: &Node| nd.has_name(&name)),
        Criterion::Names(names) => Rc::new(move |nd: &Node| names.contains(&nd.name())),
        Criterion::Content(rx) => {
            // anchor the pattern so that only full matches of the content count
            let anchored = Regex::new(&format!("^(?:{})$", rx.as_str())).unwrap_or(rx);
            Rc::new(move |nd: &Node| anchored.is_match(&nd.content()))
        }
        Criterion::Func(f) => f,
    }
}

/// A criterion for selecting paths. Node criteria apply to the last node
/// of the path.
#[derive(Clone)]
pub enum PathCriterion {
    /// Matches every path.
    Always,
    /// Matches no path.
    Never,
    /// Matches paths ending in a leaf.
    LeafPath,
    /// Matches paths ending in a branch node.
    BranchPath,
    /// Applies a node criterion to the end of the path.
    End(Criterion),
    /// Matches paths for which the function returns true.
    Func(PathMatchFn),
}

impl PathCriterion {
    pub fn func(f: impl Fn(&[Node]) -> bool + 'static) -> PathCriterion {
        PathCriterion::Func(Rc::new(f))
    }
}

impl fmt::Debug for PathCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathCriterion::Always => write!(f, "ANY_PATH"),
            PathCriterion::Never => write!(f, "NO_PATH"),
            PathCriterion::LeafPath => write!(f, "LEAF_PATH"),
            PathCriterion::BranchPath => write!(f, "BRANCH_PATH"),
            PathCriterion::End(criterion) => write!(f, "path ending in {:?}", criterion),
            PathCriterion::Func(_) => write!(f, "<path match function>"),
        }
    }
}

impl From<Criterion> for PathCriterion {
    fn from(criterion: Criterion) -> Self {
        match criterion {
            Criterion::Always => PathCriterion::Always,
            Criterion::Never => PathCriterion::Never,
            Criterion::Leaf => PathCriterion::LeafPath,
            Criterion::Branch => PathCriterion::BranchPath,
            other => PathCriterion::End(other),
        }
    }
}

impl From<&str> for PathCriterion {
    fn from(name: &str) -> Self {
        PathCriterion::End(Criterion::from(name))
    }
}

impl From<String> for PathCriterion {
    fn from(name: String) -> Self {
        PathCriterion::End(Criterion::from(name))
    }
}

impl From<&Node> for PathCriterion {
    fn from(node: &Node) -> Self {
        PathCriterion::End(Criterion::from(node))
    }
}

impl From<Node> for PathCriterion {
    fn from(node: Node) -> Self {
        PathCriterion::End(Criterion::from(node))
    }
}

impl From<Regex> for PathCriterion {
    fn from(rx: Regex) -> Self {
        PathCriterion::End(Criterion::from(rx))
    }
}

impl<const N: usize> From<[&str; N]> for PathCriterion {
    fn from(names: [&str; N]) -> Self {
        PathCriterion::End(Criterion::from(names))
    }
}

/// Creates a path-match-function for the given criterion.
pub fn create_path_match_function(criterion: PathCriterion) -> PathMatchFn {
    match criterion {
        PathCriterion::Always => Rc::new(|_| true),
        PathCriterion::Never => Rc::new(|_| false),
        PathCriterion::LeafPath => {
            Rc::new(|path: &[Node]| path.last().is_some_and(|nd| nd.is_leaf()))
        }
        PathCriterion::BranchPath => {
            Rc::new(|path: &[Node]| path.last().is_some_and(|nd| nd.has_children()))
        }
        PathCriterion::End(criterion) => {
            let mf = create_match_function(criterion);
            Rc::new(move |path: &[Node]| path.last().is_some_and(|nd| mf(nd)))
        }
        PathCriterion::Func(f) => f,
    }
}

/// Creates a path-match function that matches only and all leaf paths
/// beneath the paths that the criterion matches.
pub fn leaf_paths(criterion: impl Into<PathCriterion>) -> PathMatchFn {
    let match_fn = create_path_match_function(criterion.into());
    Rc::new(move |path: &[Node]| {
        match path.last() {
            Some(nd) if nd.is_leaf() => {}
            _ => return false,
        }
        for i in (1..=path.len()).rev() {
            if match_fn(&path[..i]) {
                return true;
            }
        }
        false
    })
}
