use std::rc::Rc;

use crate::criteria::Criterion;
use crate::node::{tree_sanity_check, EvalActions, EvalArgs, EvalError, Node};
use crate::read::parse_sxpr;

#[test]
fn leaf_and_branch_construction() {
    let leaf = Node::new_leaf("word", "hello");
    assert!(leaf.is_leaf());
    assert_eq!(leaf.content(), "hello");
    assert_eq!(leaf.strlen(), 5);

    let branch = Node::new("pair", vec![Node::new_leaf("a", "1"), Node::new_leaf("b", "2")]);
    assert!(branch.has_children());
    assert_eq!(branch.content(), "12");
    assert_eq!(branch.strlen(), 2);
}

#[test]
fn empty_child_sequence_collapses_to_leaf() {
    let node = Node::new("empty", vec![]);
    assert!(node.is_leaf());
    assert_eq!(node.content(), "");
}

#[test]
fn handles_share_identity_deep_clones_do_not() {
    let node = Node::new_leaf("a", "x");
    let alias = node.clone();
    assert_eq!(node, alias);
    assert_eq!(node.id(), alias.id());
    let copy = node.deep_clone();
    assert_ne!(node, copy);
    assert!(node.equals(&copy, true));
}

#[test]
fn anonymous_names() {
    assert!(Node::new_leaf(":Series", "").is_anonymous());
    assert!(Node::new_leaf("", "").is_anonymous());
    assert!(!Node::new_leaf("phrase", "").is_anonymous());
}

#[test]
fn with_pos_assigns_recursively() {
    let tree = parse_sxpr(r#"(a (b (c "0") (d (e "1") (f "2"))) (g "3"))"#).unwrap();
    tree.with_pos(0);
    let positions: Vec<(String, usize)> = tree
        .walk_tree(true, false)
        .map(|nd| (nd.name(), nd.pos()))
        .collect();
    assert_eq!(
        positions,
        vec![
            ("a".to_string(), 0),
            ("b".to_string(), 0),
            ("c".to_string(), 0),
            ("d".to_string(), 1),
            ("e".to_string(), 1),
            ("f".to_string(), 2),
            ("g".to_string(), 3),
        ]
    );
}

#[test]
fn with_pos_is_idempotent() {
    let node = Node::new_leaf("test", "position");
    node.with_pos(10);
    node.with_pos(10);
    assert_eq!(node.pos(), 10);
}

#[test]
#[should_panic(expected = "cannot be reassigned")]
fn with_pos_rejects_conflicting_reassignment() {
    let node = Node::new_leaf("test", "position");
    node.with_pos(10);
    node.with_pos(11);
}

#[test]
fn attributes_are_lazy_and_ordered() {
    let node = Node::new_leaf("n", "");
    assert!(!node.has_attr());
    assert_eq!(node.get_attr("id", "fallback"), "fallback");
    node.set_attr("animal", "frog");
    node.set_attr("plant", "tree");
    assert!(node.has_attr());
    assert!(node.has_attr_named("animal"));
    let keys: Vec<String> = node.attrs().keys().cloned().collect();
    assert_eq!(keys, vec!["animal", "plant"]);
}

#[test]
fn attribute_equality_ignores_order_unless_told_otherwise() {
    let a = Node::new_leaf("n", "").with_attr([("x", "1"), ("y", "2")]);
    let b = Node::new_leaf("n", "").with_attr([("y", "2"), ("x", "1")]);
    assert!(a.equals(&b, true));
    assert!(!a.has_equal_attr(&b, false));
}

#[test]
fn structural_equality() {
    let a = parse_sxpr(r#"(x (y "1") (z "2"))"#).unwrap();
    let b = parse_sxpr(r#"(x (y "1") (z "2"))"#).unwrap();
    let c = parse_sxpr(r#"(x (y "1") (z "3"))"#).unwrap();
    assert!(a.equals(&b, true));
    assert!(b.equals(&a, true));
    assert!(!a.equals(&c, true));
    assert!(a.equals(&a, true));
}

#[test]
fn child_access_by_criterion() {
    let tree = parse_sxpr(r#"(a (b "X") (X (c "d")) (e (X "F")) (b "Y"))"#).unwrap();
    assert_eq!(tree.get("X").unwrap().content(), "d");
    assert_eq!(tree.get_all("b").len(), 2);
    assert!(tree.contains("e"));
    assert!(!tree.contains("zz"));
    assert_eq!(tree.index("e").unwrap(), 2);
    assert!(tree.index("zz").is_err());
    assert_eq!(tree.indices("b"), vec![0, 3]);
}

#[test]
fn child_mutation() {
    let tree = parse_sxpr(r#"(a (b "1") (c "2") (b "3"))"#).unwrap();
    tree.set_item("c", vec![Node::new_leaf("d", "two")]).unwrap();
    assert_eq!(tree.content(), "1two3");
    tree.del_item("b").unwrap();
    assert_eq!(tree.child_count(), 1);
    assert!(tree.del_item("b").is_err());
    tree.insert_child(0, Node::new_leaf("front", "0"));
    assert_eq!(tree.child(0).unwrap().name(), "front");
    let d = tree.get("d").unwrap();
    tree.remove_node(&d);
    assert_eq!(tree.content(), "0");
}

#[test]
fn set_item_checks_arity() {
    let tree = parse_sxpr(r#"(a (b "1") (b "2"))"#).unwrap();
    let result = tree.set_item("b", vec![Node::new_leaf("c", "x")]);
    assert!(result.is_err());
}

#[test]
fn select_is_preorder_and_lazy() {
    let tree = parse_sxpr(r#"(a (b (c "") (d (e "") (f ""))) (g ""))"#).unwrap();
    let names: Vec<String> = tree
        .select(Criterion::Always, false)
        .map(|nd| nd.name())
        .collect();
    assert_eq!(names, vec!["b", "c", "d", "e", "f", "g"]);
}

#[test]
fn select_by_name_and_set() {
    let tree = parse_sxpr(r#"(a (b "X") (X (c "d")) (e (X "F")))"#).unwrap();
    let x_count = tree.select("X", false).count();
    assert_eq!(x_count, 2);
    let either: Vec<String> = tree
        .select(["X", "b"], false)
        .map(|nd| nd.name())
        .collect();
    assert_eq!(either, vec!["b", "X", "X"]);
    assert!(tree.select("a", false).next().is_none());
    assert!(tree.select("a", true).next().is_some());
}

#[test]
fn select_skips_subtrees() {
    let tree = parse_sxpr(r#"(a (b (x "1")) (c (x "2")))"#).unwrap();
    let found: Vec<String> = tree
        .select_if(
            Rc::new(|nd: &Node| nd.has_name("x")),
            false,
            false,
            Rc::new(|nd: &Node| nd.has_name("b")),
        )
        .map(|nd| nd.content())
        .collect();
    assert_eq!(found, vec!["2"]);
}

#[test]
fn select_reverse_reverses_sibling_order() {
    let tree = parse_sxpr(r#"(a (b "1") (c "2") (d "3"))"#).unwrap();
    let names: Vec<String> = tree
        .select_if(Rc::new(|_| true), false, true, Rc::new(|_| false))
        .map(|nd| nd.name())
        .collect();
    assert_eq!(names, vec!["d", "c", "b"]);
}

#[test]
fn select_path_yields_full_ancestry() {
    let tree = parse_sxpr(r#"(a (b (c "x")))"#).unwrap();
    let path = tree.pick_path("c", false, false).unwrap();
    let names: Vec<String> = path.iter().map(|nd| nd.name()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[test]
fn locate_finds_covering_leaf() {
    let tree = parse_sxpr(r#"(a (b "123") (c (d "45") (e "67")))"#).unwrap();
    assert_eq!(tree.locate(0).unwrap().name(), "b");
    assert_eq!(tree.locate(2).unwrap().name(), "b");
    assert_eq!(tree.locate(3).unwrap().name(), "d");
    assert_eq!(tree.locate(6).unwrap().name(), "e");
    assert!(tree.locate(7).is_none());
}

#[test]
fn locate_on_leaf_returns_leaf() {
    let leaf = Node::new_leaf("w", "abc");
    assert_eq!(leaf.locate(1).unwrap(), leaf);
    assert!(leaf.locate(3).is_none());
}

#[test]
fn find_parent_and_reconstruct_path() {
    let tree = parse_sxpr(r#"(a (b (c "x")) (d "y"))"#).unwrap();
    let c = tree.pick("c", false, false).unwrap();
    assert_eq!(tree.find_parent(&c).unwrap().name(), "b");
    let path = tree.reconstruct_path(&c).unwrap();
    let names: Vec<String> = path.iter().map(|nd| nd.name()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    let stranger = Node::new_leaf("c", "x");
    assert!(tree.reconstruct_path(&stranger).is_err());
}

#[test]
fn replace_by_takes_over_name_content_and_attrs() {
    let tree = parse_sxpr(r#"(a (b "old"))"#).unwrap();
    let b = tree.child(0).unwrap();
    let replacement = Node::new_leaf("c", "new").with_attr([("k", "v")]);
    b.replace_by(&replacement, false);
    assert_eq!(b.name(), "c");
    assert_eq!(b.content(), "new");
    assert_eq!(b.get_attr("k", ""), "v");
}

#[test]
fn evaluate_bottom_up() {
    let tree = parse_sxpr(r#"(plus (number "3") (mul (number "5") (number "4")))"#).unwrap();
    let actions: EvalActions<i64> = EvalActions::new()
        .on("number", |_, args| match args {
            EvalArgs::Leaf(text) => text.parse().map_err(|_| EvalError::ActionFailed {
                name: "number".to_string(),
                message: "not a number".to_string(),
            }),
            _ => unreachable!(),
        })
        .on("plus", |_, args| match args {
            EvalArgs::Children(values) => Ok(values.iter().sum()),
            _ => unreachable!(),
        })
        .on("mul", |_, args| match args {
            EvalArgs::Children(values) => Ok(values.iter().product()),
            _ => unreachable!(),
        });
    assert_eq!(tree.evaluate(&actions).unwrap(), 23);
}

#[test]
fn evaluate_falls_back_to_joker() {
    let tree = parse_sxpr(r#"(doc (word "hi"))"#).unwrap();
    let actions: EvalActions<String> = EvalActions::new().on("*", |_, args| {
        Ok(match args {
            EvalArgs::Leaf(text) => text,
            EvalArgs::Children(values) => values.concat(),
        })
    });
    assert_eq!(tree.evaluate(&actions).unwrap(), "hi");
}

#[test]
fn evaluate_rejects_zombies_and_unknown_names() {
    let zombie = Node::new_leaf(crate::node::ZOMBIE_TAG, "");
    let empty: EvalActions<String> = EvalActions::new();
    assert!(matches!(zombie.evaluate(&empty), Err(EvalError::ZombieNode)));
    let plain = Node::new_leaf("plain", "");
    assert!(matches!(plain.evaluate(&empty), Err(EvalError::NoAction(_))));
}

#[test]
fn frozen_nodes_reject_mutation() {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    let frozen = Node::frozen("placeholder", "text");
    assert!(frozen.is_frozen());
    assert!(catch_unwind(AssertUnwindSafe(|| frozen.set_text("other"))).is_err());
    let frozen2 = Node::frozen("placeholder", "");
    assert!(catch_unwind(AssertUnwindSafe(|| frozen2.with_pos(0))).is_err());
}

#[test]
fn frozen_node_attributes_set_at_most_once() {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    let frozen = Node::frozen("placeholder", "");
    frozen.set_attr("a", "1");
    assert!(catch_unwind(AssertUnwindSafe(|| frozen.set_attr("b", "2"))).is_err());
}

#[test]
fn sanity_check_rejects_shared_nodes_and_frozen_leftovers() {
    let good = parse_sxpr(r#"(a (b "1") (c "2"))"#).unwrap();
    assert!(tree_sanity_check(&good));

    let shared = Node::new_leaf("s", "x");
    let bad = Node::new("a", vec![shared.clone(), shared]);
    assert!(!tree_sanity_check(&bad));

    let with_frozen = Node::new("a", vec![Node::placeholder()]);
    assert!(!tree_sanity_check(&with_frozen));
}

#[test]
fn milestone_segment_copies_boundaries() {
    let tree = parse_sxpr(r#"(a (b "1") (c "2") (d "3") (e "4"))"#).unwrap();
    tree.with_pos(0);
    let c = tree.pick("c", false, false).unwrap();
    let d = tree.pick("d", false, false).unwrap();
    let segment = tree.milestone_segment(&c, &d).unwrap();
    assert_eq!(segment.content(), "23");
    // the original tree is unchanged
    assert_eq!(tree.content(), "1234");
    assert_eq!(tree.child_count(), 4);
}

#[test]
fn split_at_milestones() {
    let tree = parse_sxpr(r#"(doc (p "one") (milestone "") (p "two"))"#).unwrap();
    let parts = tree.split("milestone");
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].content(), "one");
    assert_eq!(parts[1].content(), "two");
}
