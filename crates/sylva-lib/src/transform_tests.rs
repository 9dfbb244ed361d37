use std::cell::RefCell;
use std::rc::Rc;

use sylva_core::{ERROR, WARNING};

use crate::node::{Node, NodeContent};
use crate::read::parse_sxpr;
use crate::root::RootNode;
use crate::transform::*;

fn sxpr(root: &RootNode) -> String {
    crate::serialize::SxprPrinter::new(root.tree())
        .flatten_threshold(-1)
        .render()
}

fn recorder(log: Rc<RefCell<Vec<String>>>, tag: &str) -> Rule {
    let tag = tag.to_string();
    rule(move |_root, path| {
        log.borrow_mut()
            .push(format!("{}:{}", tag, path.last().unwrap().name()));
    })
}

#[test]
fn traversal_is_depth_first_bottom_up() {
    let mut root = parse_sxpr(r#"(a (b (c "1")) (d "2"))"#).unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));
    let table = TransformationTable::new().add("*", vec![recorder(log.clone(), "v")]);
    traverse(&mut root, &table);
    assert_eq!(
        log.borrow().clone(),
        vec!["v:c", "v:b", "v:d", "v:a"]
    );
}

#[test]
fn special_keys_fire_in_documented_order() {
    let mut root = parse_sxpr(r#"(a (b "1"))"#).unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));
    let table = TransformationTable::new()
        .add("<<<", vec![recorder(log.clone(), "once-pre")])
        .add("<", vec![recorder(log.clone(), "pre")])
        .add("b", vec![recorder(log.clone(), "main")])
        .add(">", vec![recorder(log.clone(), "post")])
        .add(">>>", vec![recorder(log.clone(), "once-post")]);
    traverse(&mut root, &table);
    assert_eq!(
        log.borrow().clone(),
        vec![
            "once-pre:a",
            "pre:b",
            "main:b",
            "post:b",
            "pre:a",
            "post:a",
            "once-post:a",
        ]
    );
}

#[test]
fn comma_separated_keys_and_joker() {
    let mut root = parse_sxpr(r#"(a (b "1") (c "2") (d "3"))"#).unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));
    let table = TransformationTable::new()
        .add("b, c", vec![recorder(log.clone(), "named")])
        .add("*", vec![recorder(log.clone(), "other")]);
    traverse(&mut root, &table);
    assert_eq!(
        log.borrow().clone(),
        vec!["named:b", "named:c", "other:d", "other:a"]
    );
}

#[test]
fn whitespace_synonym_key() {
    let mut root = parse_sxpr(r#"(a (:Whitespace " ") (b "1"))"#).unwrap();
    let table = TransformationTable::new().add("~", vec![change_name("ws")]);
    traverse(&mut root, &table);
    assert_eq!(sxpr(&root), r#"(a (ws " ") (b "1"))"#);
}

#[test]
fn filters_hide_children_during_descent() {
    let mut root = parse_sxpr(r#"(a (b (x "1")) (c "2"))"#).unwrap();
    let log = Rc::new(RefCell::new(Vec::new()));
    let table = TransformationTable::new()
        .add_entries("b", vec![block_children(), recorder(log.clone(), "v").into()])
        .add("*", vec![recorder(log.clone(), "v")]);
    traverse(&mut root, &table);
    // x is never visited, but remains in the tree
    assert_eq!(log.borrow().clone(), vec!["v:b", "v:c", "v:a"]);
    assert_eq!(root.content(), "12");
}

#[test]
fn replace_by_single_child_lifts_the_child() {
    let mut root = parse_sxpr(r#"(a (:wrapper (b "1")))"#).unwrap();
    let table = TransformationTable::new().add(":wrapper", vec![replace_by_single_child()]);
    traverse(&mut root, &table);
    assert_eq!(sxpr(&root), r#"(a (b "1"))"#);
}

#[test]
fn reduce_single_child_keeps_the_name() {
    let mut root = parse_sxpr(r#"(i (span `(style "letter-spacing") "m."))"#).unwrap();
    let table = TransformationTable::new().add("i", vec![reduce_single_child()]);
    traverse(&mut root, &table);
    assert_eq!(sxpr(&root), r#"(i `(style "letter-spacing") "m.")"#);
}

#[test]
fn replace_by_single_child_transfers_errors() {
    let mut root = parse_sxpr(r#"(a (:wrapper (b "1")))"#).unwrap();
    root.with_pos(0);
    let wrapper = root.get(":wrapper").unwrap();
    root.new_error(&wrapper, "attached", WARNING);
    let table = TransformationTable::new().add(":wrapper", vec![replace_by_single_child()]);
    traverse(&mut root, &table);
    // the wrapper is gone, but its error now sticks to the surviving node
    let b_path = root.pick_path("b", false, false).unwrap();
    assert_eq!(root.node_errors(b_path.last().unwrap()).len(), 1);
}

#[test]
fn flatten_collapses_anonymous_wrappers() {
    let mut root = parse_sxpr(r#"(t (:s (a "1") (:s (b "2"))) (c "3"))"#).unwrap();
    let table = TransformationTable::new().add("t", vec![flatten_anonymous()]);
    traverse(&mut root, &table);
    assert_eq!(sxpr(&root), r#"(t (a "1") (b "2") (c "3"))"#);
}

#[test]
fn collapse_reduces_subtree_to_string() {
    let mut root = parse_sxpr(
        r#"(place (abbreviation "p.") (page "26") (superscript "b") (mark ",") (page "18"))"#,
    )
    .unwrap();
    let table = TransformationTable::new().add("place", vec![collapse()]);
    traverse(&mut root, &table);
    assert_eq!(sxpr(&root), r#"(place "p.26b,18")"#);
}

#[test]
fn merge_adjacent_fuses_leaf_content() {
    let mut root = parse_sxpr(
        r#"(place (abbreviation "p.") (page "26") (superscript "b") (mark ",") (page "18"))"#,
    )
    .unwrap();
    let table = TransformationTable::new().add(
        "place",
        vec![merge_adjacent(not_one_of(&["superscript", "subscript"]), "", None)],
    );
    traverse(&mut root, &table);
    assert_eq!(
        sxpr(&root),
        r#"(place (abbreviation "p.26") (superscript "b") (mark ",18"))"#
    );
}

#[test]
fn merge_adjacent_can_swallow_nodes_whole() {
    let source = r#"(p (t "In ") (a `(href "www") "Metropolis") (t " steht ") (t "ein ") (t "Haus."))"#;
    let mut root = parse_sxpr(source).unwrap();
    let table = TransformationTable::new().add(
        "p",
        vec![merge_adjacent(is_one_of(&["t", "a"]), "", Some(is_a("a")))],
    );
    traverse(&mut root, &table);
    assert_eq!(
        sxpr(&root),
        r#"(p (t (:Text "In ") (a `(href "www") "Metropolis") (:Text " steht ein Haus.")))"#
    );

    // without swallowing, the link is dissolved into the merged content
    let mut root = parse_sxpr(source).unwrap();
    let table = TransformationTable::new().add(
        "p",
        vec![merge_adjacent(is_one_of(&["t", "a"]), "", None)],
    );
    traverse(&mut root, &table);
    assert_eq!(
        sxpr(&root),
        r#"(p (t `(href "www") "In Metropolis steht ein Haus."))"#
    );
}

#[test]
fn strip_removes_whitespace_fringe() {
    let mut root = parse_sxpr(
        r#"(s (:Whitespace " ") (:Whitespace " ") (w "x") (:Whitespace " "))"#,
    )
    .unwrap();
    let table =
        TransformationTable::new().add("s", vec![strip(Rc::new(contains_only_whitespace))]);
    traverse(&mut root, &table);
    assert_eq!(sxpr(&root), r#"(s (w "x"))"#);
}

#[test]
fn removal_rules() {
    let mut root = parse_sxpr(
        r#"(sum (:Whitespace " ") (number "1") (:Text "+") (number "2") (:empty ""))"#,
    )
    .unwrap();
    let table = TransformationTable::new().add(
        "sum",
        vec![remove_whitespace(), remove_anonymous_tokens(&["+"]), remove_empty()],
    );
    traverse(&mut root, &table);
    assert_eq!(sxpr(&root), r#"(sum (number "1") (number "2"))"#);
}

#[test]
fn remove_brackets_drops_disposable_fringe() {
    let mut root =
        parse_sxpr(r#"(group (:Text "(") (term "x") (:Text ")"))"#).unwrap();
    let table = TransformationTable::new().add("group", vec![remove_brackets()]);
    traverse(&mut root, &table);
    assert_eq!(sxpr(&root), r#"(group (term "x"))"#);
}

#[test]
fn keep_children_by_index_range() {
    let mut root = parse_sxpr(r#"(r (a "1") (b "2") (c "3") (d "4"))"#).unwrap();
    let table = TransformationTable::new().add("r", vec![keep_children(1..3)]);
    traverse(&mut root, &table);
    assert_eq!(sxpr(&root), r#"(r (b "2") (c "3"))"#);

    // out-of-range bounds are clamped
    let mut root = parse_sxpr(r#"(r (a "1") (b "2"))"#).unwrap();
    let table = TransformationTable::new().add("r", vec![keep_children(1..5)]);
    traverse(&mut root, &table);
    assert_eq!(sxpr(&root), r#"(r (b "2"))"#);
}

#[test]
fn transform_result_maps_leaf_content() {
    let mut root = parse_sxpr(r#"(w "abc")"#).unwrap();
    let table = TransformationTable::new().add(
        "w",
        vec![transform_result(|content| match content {
            NodeContent::Leaf(text) => NodeContent::Leaf(text.to_uppercase()),
            branch => branch,
        })],
    );
    traverse(&mut root, &table);
    assert_eq!(root.content(), "ABC");
}

#[test]
fn transform_result_maps_child_sequences() {
    let mut root = parse_sxpr(r#"(r (a "1") (b "2"))"#).unwrap();
    let table = TransformationTable::new().add(
        "r",
        vec![transform_result(|content| match content {
            NodeContent::Branch(mut children) => {
                children.reverse();
                NodeContent::Branch(children)
            }
            leaf => leaf,
        })],
    );
    traverse(&mut root, &table);
    assert_eq!(sxpr(&root), r#"(r (b "2") (a "1"))"#);
}

#[test]
fn keep_and_remove_by_content() {
    let mut root = parse_sxpr(r#"(r (k "ab") (k "zz") (k "ac"))"#).unwrap();
    let table = TransformationTable::new().add("r", vec![keep_content("a.")]);
    traverse(&mut root, &table);
    assert_eq!(sxpr(&root), r#"(r (k "ab") (k "ac"))"#);
}

#[test]
fn attribute_rules() {
    let mut root = parse_sxpr(r#"(x (y "1"))"#).unwrap();
    let table = TransformationTable::new().add(
        "y",
        vec![add_attributes(&[("class", "number"), ("id", "y1")])],
    );
    traverse(&mut root, &table);
    let y = root.get("y").unwrap();
    assert_eq!(y.get_attr("class", ""), "number");

    let table = TransformationTable::new().add("y", vec![del_attributes(&["id"])]);
    traverse(&mut root, &table);
    let y = root.get("y").unwrap();
    assert!(!y.has_attr_named("id"));
    assert!(y.has_attr_named("class"));
}

#[test]
fn rename_rules() {
    let mut root = parse_sxpr(r#"(x (old "1") (other "2"))"#).unwrap();
    let table = TransformationTable::new()
        .add("x", vec![replace_child_names(&[("old", "new")])]);
    traverse(&mut root, &table);
    assert_eq!(sxpr(&root), r#"(x (new "1") (other "2"))"#);
}

#[test]
fn normalize_whitespace_collapses_runs() {
    let mut root = parse_sxpr(r#"(t "a  b")"#).unwrap();
    root.tree().set_text("a  b\t\tc");
    let table = TransformationTable::new().add("t", vec![normalize_whitespace()]);
    traverse(&mut root, &table);
    assert_eq!(root.content(), "a b c");
}

#[test]
fn diagnostics_rules_attach_errors() {
    let mut root = parse_sxpr(r#"(doc (head "h") (rogue "r"))"#).unwrap();
    root.with_pos(0);
    let table = TransformationTable::new().add("doc", vec![require(&["head", "body"])]);
    traverse(&mut root, &table);
    assert_eq!(root.errors().len(), 1);
    assert!(root.errors()[0].message.contains("rogue"));

    let mut root = parse_sxpr(r#"(doc (script "s"))"#).unwrap();
    root.with_pos(0);
    let table = TransformationTable::new().add("doc", vec![forbid(&["script"])]);
    traverse(&mut root, &table);
    assert_eq!(root.errors().len(), 1);

    let mut root = parse_sxpr(r#"(num "x2")"#).unwrap();
    root.with_pos(0);
    let table = TransformationTable::new().add("num", vec![assert_content(r"\d+")]);
    traverse(&mut root, &table);
    assert_eq!(root.errors().len(), 1);

    let mut root = parse_sxpr(r#"(a (zombie "z"))"#).unwrap();
    root.with_pos(0);
    let table = TransformationTable::new().add(
        "zombie",
        vec![add_error("unexpected element {name}", ERROR)],
    );
    traverse(&mut root, &table);
    assert_eq!(root.errors()[0].message, "unexpected element zombie");
}

#[test]
fn conditional_application() {
    let mut root = parse_sxpr(r#"(x (y "1") (y (z "2")))"#).unwrap();
    let table = TransformationTable::new().add(
        "y",
        vec![apply_if(change_name("leafy"), cond(|p| {
            p.last().is_some_and(|nd| nd.is_leaf())
        }))],
    );
    traverse(&mut root, &table);
    assert_eq!(sxpr(&root), r#"(x (leafy "1") (y (z "2")))"#);
}

#[test]
fn insert_and_delimit_children() {
    let mut root = parse_sxpr(r#"(list (item "a") (item "b") (item "c"))"#).unwrap();
    let table = TransformationTable::new().add(
        "list",
        vec![delimit_children(node_maker("comma", ",", &[]))],
    );
    traverse(&mut root, &table);
    assert_eq!(
        sxpr(&root),
        r#"(list (item "a") (comma ",") (item "b") (comma ",") (item "c"))"#
    );
    assert_eq!(root.content(), "a,b,c");
}

#[test]
fn merge_treetops_keeps_positions_monotonic() {
    let root = parse_sxpr(r#"(doc (p (:Text "ab") (:Text "cd")) (q (r "ef")))"#).unwrap();
    root.with_pos(0);
    merge_treetops(root.tree());
    assert_eq!(sxpr(&root), r#"(doc (p "abcd") (q (r "ef")))"#);
    let p = root.get("p").unwrap();
    let q = root.get("q").unwrap();
    assert_eq!(p.pos(), 0);
    assert_eq!(q.pos(), 4);
    assert!(p.pos() + p.strlen() <= q.pos());
}

#[test]
fn transformer_checks_and_advances_stage() {
    let mut root = parse_sxpr(r#"(a (b "1"))"#).unwrap();
    root.stage = "CST".to_string();
    let table = TransformationTable::new().add(":b", vec![]);
    assert!(transformer(&mut root, &table, "cst", "ast").is_ok());
    assert_eq!(root.stage, "ast");
    assert!(transformer(&mut root, &table, "cst", "ast").is_err());
}

#[test]
fn condition_helpers() {
    let root = parse_sxpr(r#"(a (:anon "") (named "x"))"#).unwrap();
    let anon_path = root.pick_path(":anon", false, false).unwrap();
    let named_path = root.pick_path("named", false, false).unwrap();
    assert!(is_anonymous(&anon_path));
    assert!(is_anonymous_leaf(&anon_path));
    assert!(is_named(&named_path));
    assert!(is_empty(&anon_path));
    assert!(!is_empty(&named_path));
    assert!(has_parent(&["a"])(&named_path));
    assert!(has_child(&["named"])(&vec![root.tree().clone()]));
    assert!(has_sibling(&["named"])(&anon_path));
    assert!(name_matches("na.*")(&named_path));
    assert!(content_matches("x")(&named_path));
    assert!(has_content("x")(&named_path));
    assert!(any_of(vec![is_a("nope"), is_a("named")])(&named_path));
    assert!(!all_of(vec![is_a("nope"), is_a("named")])(&named_path));
    assert!(neg(is_a("nope"))(&named_path));
    assert!(!is_single_child(&named_path));
}

#[test]
fn has_descendant_respects_generations() {
    let root = parse_sxpr(r#"(a (b (c (d "x"))))"#).unwrap();
    let path = vec![root.tree().clone()];
    assert!(has_descendant(&["d"], 3)(&path));
    assert!(!has_descendant(&["d"], 2)(&path));
}
