use indoc::indoc;

use crate::config::{reset_config, update_config, AttrErrorPolicy};
use crate::node::Node;
use crate::read::{parse_json, parse_sxpr, parse_xml};
use crate::serialize::{
    flatten_sxpr, flatten_xml, restore_tag_name, xml_tag_name, SerPart, SerializeError,
    SxprPrinter, XmlPrinter,
};
use sylva_core::ERROR;

#[test]
fn sxpr_compact_and_flattened() {
    let tree = parse_sxpr(r#"(root (a "1") (b "2"))"#).unwrap();
    assert_eq!(tree.tree().as_sxpr(), r#"(root (a "1") (b "2"))"#);
}

#[test]
fn sxpr_unflattened() {
    let tree = parse_sxpr(r#"(root (a "1") (b "2"))"#).unwrap();
    let rendered = SxprPrinter::new(tree.tree()).flatten_threshold(0).render();
    assert_eq!(
        rendered,
        indoc! {r#"
            (root
              (a "1")
              (b "2"))"#}
    );
}

#[test]
fn sxpr_non_compact_layout() {
    let tree = parse_sxpr(r#"(a (b "c"))"#).unwrap();
    let rendered = SxprPrinter::new(tree.tree())
        .compact(false)
        .flatten_threshold(0)
        .render();
    assert_eq!(
        rendered,
        indoc! {r#"
            (a
              (b
                "c"
              )
            )"#}
    );
}

#[test]
fn sxpr_renders_attributes() {
    let tree = parse_sxpr(r#"(em `(class "italic") "text")"#).unwrap();
    assert_eq!(tree.tree().as_sxpr(), r#"(em `(class "italic") "text")"#);
}

#[test]
fn sxml_attribute_convention() {
    let tree =
        parse_sxpr(r#"(employee `(branch "Secret Service") `(id "007") "James Bond")"#).unwrap();
    assert_eq!(
        tree.tree().as_sxml(),
        r#"(employee (@ (branch "Secret Service") (id "007")) "James Bond")"#
    );
}

#[test]
fn sxml_level_two_always_emits_attribute_node() {
    let tree = parse_sxpr(r#"(a "x")"#).unwrap();
    let rendered = SxprPrinter::new(tree.tree()).sxml(2).render();
    assert_eq!(rendered, r#"(a (@) "x")"#);
}

#[test]
fn sxpr_quotes_avoid_escaping() {
    let tree = Node::new_leaf("q", r#"say "hi""#);
    assert_eq!(tree.as_sxpr(), r#"(q 'say "hi"')"#);
}

#[test]
fn sxpr_with_src_reports_positions() {
    let tree = parse_sxpr(r#"(a (b "12") (c "3"))"#).unwrap();
    tree.with_pos(0);
    let rendered = SxprPrinter::new(tree.tree())
        .src("")
        .flatten_threshold(-1)
        .render();
    assert_eq!(
        rendered,
        r#"(a `(pos 0) (b `(pos 0) "12") (c `(pos 2) "3"))"#
    );
}

#[test]
fn xml_block_layout() {
    let tree = parse_sxpr(r#"(root (a "1") (b "2"))"#).unwrap();
    let rendered = tree.tree().as_xml().unwrap();
    assert_eq!(
        rendered,
        indoc! {r#"
            <root>
              <a>1</a>
              <b>2</b>
            </root>"#}
    );
    assert_eq!(flatten_xml(&rendered), "<root><a>1</a><b>2</b></root>");
}

#[test]
fn xml_inline_tags() {
    let tree = parse_sxpr(r#"(root (a "1") (b "2"))"#).unwrap();
    let rendered = XmlPrinter::new(tree.tree())
        .inline_tags(["root"])
        .render()
        .unwrap();
    assert_eq!(rendered, "<root><a>1</a><b>2</b></root>");
}

#[test]
fn xml_mixed_content_via_string_tags() {
    let tree = parse_xml(
        r#"<note date="2020-01-01"><to>Tove</to><from>Jani</from>Mixed content</note>"#,
    )
    .unwrap();
    let rendered = XmlPrinter::new(tree.tree())
        .inline_tags(["note"])
        .render()
        .unwrap();
    assert_eq!(
        rendered,
        r#"<note date="2020-01-01"><to>Tove</to><from>Jani</from>Mixed content</note>"#
    );
}

#[test]
fn xml_empty_tags_are_autodetected() {
    let tree = parse_sxpr(r#"(div (br "") (p "text"))"#).unwrap();
    let rendered = tree.tree().as_xml().unwrap();
    assert_eq!(
        rendered,
        indoc! {r#"
            <div>
              <br/>
              <p>text</p>
            </div>"#}
    );
}

#[test]
fn xml_strict_mode_rejects_content_in_empty_tags() {
    let tree = parse_sxpr(r#"(div (p "text"))"#).unwrap();
    let result = XmlPrinter::new(tree.tree()).empty_tags(["p"]).render();
    assert!(matches!(
        result,
        Err(SerializeError::NonEmptyEmptyTag { .. })
    ));
    let tolerant = XmlPrinter::new(tree.tree())
        .empty_tags(["p"])
        .strict_mode(false)
        .render()
        .unwrap();
    assert!(tolerant.contains("<p>text</p>"));
}

#[test]
fn xml_escapes_text_but_keeps_entities() {
    let tree = Node::new("p", vec![Node::new_leaf(":Text", "a & b &amp; <c>")]);
    let rendered = XmlPrinter::new(&tree).inline_tags(["p"]).render().unwrap();
    assert_eq!(rendered, "<p>a &amp; b &amp; &lt;c&gt;</p>");
}

#[test]
fn xml_char_and_entity_references() {
    let tree = Node::new(
        "p",
        vec![
            Node::new_leaf(":Text", "A"),
            Node::new_leaf(":EntityRef", "amp"),
            Node::new_leaf(":CharRef", "61"),
        ],
    );
    let rendered = XmlPrinter::new(&tree).inline_tags(["p"]).render().unwrap();
    assert_eq!(rendered, "<p>A&amp;&#x61;</p>");
}

#[test]
fn xml_anonymous_tag_names_are_sanitized() {
    assert_eq!(xml_tag_name(":Series"), "Series__");
    assert_eq!(restore_tag_name("Series__"), ":Series");
    assert_eq!(restore_tag_name("ANONYMOUS_Series__"), ":Series");
    let tree = Node::new("doc", vec![Node::new_leaf(":Series", "x")]);
    let rendered = XmlPrinter::new(&tree)
        .inline_tags(["doc"])
        .string_tags(Vec::<String>::new())
        .render()
        .unwrap();
    assert_eq!(rendered, "<doc><Series__>x</Series__></doc>");
}

#[test]
fn xml_attribute_policies() {
    reset_config();
    let tree = Node::new_leaf("a", "x").with_attr([("k", "1<2")]);
    assert!(matches!(
        XmlPrinter::new(&tree).render(),
        Err(SerializeError::IllformedAttribute(_))
    ));
    update_config(|c| c.xml_attribute_error_handling = AttrErrorPolicy::Fix);
    assert_eq!(
        XmlPrinter::new(&tree).render().unwrap(),
        r#"<a k="1&lt;2">x</a>"#
    );
    update_config(|c| c.xml_attribute_error_handling = AttrErrorPolicy::Lxml);
    assert_eq!(
        XmlPrinter::new(&tree).render().unwrap(),
        r#"<a k="1?2">x</a>"#
    );
    reset_config();
}

#[test]
fn xml_space_preserve_forces_inline() {
    let tree = parse_sxpr(r#"(pre (code "x"))"#).unwrap();
    let pre = tree.tree();
    pre.set_attr("xml:space", "preserve");
    let rendered = pre.as_xml().unwrap();
    assert_eq!(rendered, r#"<pre xml:space="preserve"><code>x</code></pre>"#);
}

#[test]
fn xml_err_attribute_for_root_errors() {
    let mut root = parse_sxpr(r#"(doc (a "123"))"#).unwrap();
    root.with_pos(0);
    let a = root.get("a").unwrap();
    root.new_error(&a, "broken", ERROR);
    let rendered = root.as_xml().unwrap();
    assert!(rendered.contains("err=\""));
    assert!(rendered.contains("broken"));
    let sxpr = root.as_sxpr();
    assert!(sxpr.contains("`(err"));
}

#[test]
fn flatten_sxpr_behavior() {
    assert_eq!(flatten_sxpr("(a\n    (b\n        c\n    )\n)\n", -1), "(a (b c))");
    let long = "(a\n  (b \"123456789\"))";
    // overstepping the threshold returns the trimmed original
    assert_eq!(flatten_sxpr(long, 5), long.trim());
    assert_eq!(flatten_sxpr(long, 0), long);
}

#[test]
fn json_list_flavor() {
    let node = Node::new_leaf("root", "content").with_attr([("importance", "high")]);
    assert_eq!(
        node.as_json(None, false, true),
        r#"["root","content",{"importance":"high"}]"#
    );
    let letters = parse_sxpr(r#"(letters (a "A") (b "B") (c "C"))"#).unwrap();
    assert_eq!(
        letters.tree().as_json(None, false, true),
        r#"["letters",[["a","A"],["b","B"],["c","C"]]]"#
    );
}

#[test]
fn json_dict_flavor() {
    let letters = parse_sxpr(r#"(letters (a "A") (b "B") (c "C"))"#).unwrap();
    assert_eq!(
        letters.tree().as_json(None, true, false),
        r#"{"letters":{"a":"A","b":"B","c":"C"}}"#
    );
    // duplicate names fall back to lists of pairs
    let dup = parse_sxpr(r#"(letters (a "A") (a "B"))"#).unwrap();
    assert_eq!(
        dup.tree().as_json(None, true, false),
        r#"{"letters":[["a","A"],["a","B"]]}"#
    );
}

#[test]
fn json_round_trip_preserves_structure_and_positions() {
    let tree = parse_sxpr(r#"(letters (a "A") (b (c "B") (d "C")))"#).unwrap();
    tree.with_pos(0);
    let restored = parse_json(&tree.tree().as_json(None, false, true)).unwrap();
    assert!(restored.tree().equals(tree.tree(), true));
    assert_eq!(restored.pos_opt(), Some(0));
    assert_eq!(restored.get("b").unwrap().pos_opt(), Some(1));
}

#[test]
fn json_dict_round_trip() {
    let tree = parse_sxpr(r#"(doc (head `(lang "en") "h") (body "b"))"#).unwrap();
    let json = tree.tree().as_json(None, true, false);
    let restored = parse_json(&json).unwrap();
    assert!(restored.tree().equals(tree.tree(), true));
}

#[test]
fn empty_leaves_round_trip() {
    let tree = parse_sxpr(r#"(a (b "") (c "x"))"#).unwrap();
    let restored = parse_sxpr(&tree.tree().as_sxpr()).unwrap();
    assert!(restored.tree().equals(tree.tree(), true));
    let json_restored = parse_json(&tree.tree().as_json(None, false, true)).unwrap();
    assert!(json_restored.tree().equals(tree.tree(), true));
}

#[test]
fn indented_tree_outline() {
    let tree = parse_sxpr(r#"(A (B "x") (C "y"))"#).unwrap();
    insta::assert_snapshot!(tree.tree().as_tree(), @r#"
    A
      B "x"
      C "y"
    "#);
}

#[test]
fn serialize_dispatch() {
    reset_config();
    let tree = parse_sxpr(r#"(A (B "x"))"#).unwrap();
    assert_eq!(tree.tree().serialize("sxpr").unwrap(), r#"(A (B "x"))"#);
    assert_eq!(
        tree.tree().serialize("default").unwrap(),
        r#"(A (B "x"))"#
    );
    assert_eq!(tree.tree().serialize("xml").unwrap(), "<A>\n  <B>x</B>\n</A>");
    assert_eq!(
        tree.tree().serialize("json").unwrap(),
        r#"["A",[["B","x"]]]"#
    );
    assert!(tree.tree().serialize("nonsense").is_err());
}

#[test]
fn root_serialize_uses_serialization_type() {
    let mut root = parse_sxpr(r#"(A (B "x"))"#).unwrap();
    root.serialization_type = "xml".to_string();
    assert_eq!(root.serialize("").unwrap(), "<A>\n  <B>x</B>\n</A>");
}

#[test]
fn collect_empty_tags_only_for_consistently_empty_names() {
    let tree = parse_sxpr(r#"(r (e "") (f "") (g "X") (e "") (f "X") (g ""))"#).unwrap();
    let empty = tree.tree().collect_empty_tags();
    assert_eq!(empty.len(), 1);
    assert!(empty.contains("e"));
}

#[test]
fn sxpr_mapping_locates_nodes() {
    let tree = parse_sxpr(r#"(root (a "1") (b "2"))"#).unwrap();
    let (serialized, mapping) = SxprPrinter::new(tree.tree()).render_mapped();
    assert_eq!(serialized, r#"(root (a "1") (b "2"))"#);

    let a = tree.get("a").unwrap();
    assert_eq!(mapping.head_total_tail(&a), Some((3, 8, 1)));

    let one = serialized.find('1').unwrap();
    let location = mapping.get_path(one).unwrap();
    assert_eq!(location.path.last().unwrap().name(), "a");
    assert_eq!(location.part, SerPart::Inside);
    assert_eq!(mapping.content_pos(&location).unwrap(), 0);

    let opening = mapping.get_path(0).unwrap();
    assert_eq!(opening.path.last().unwrap().name(), "root");
    assert_eq!(opening.part, SerPart::OpeningTag);

    let closing = mapping.get_path(serialized.len() - 1).unwrap();
    assert_eq!(closing.part, SerPart::ClosingTag);

    assert!(mapping.get_path(serialized.len()).is_err());
}

#[test]
fn xml_mapping_locates_nodes() {
    let tree = parse_sxpr(r#"(root (a "1") (b "2"))"#).unwrap();
    let (serialized, mapping) = XmlPrinter::new(tree.tree())
        .string_tags(Vec::<String>::new())
        .render_mapped()
        .unwrap();
    assert_eq!(serialized, "<root><a>1</a><b>2</b></root>");
    let two = serialized.find('2').unwrap();
    let location = mapping.get_path(two).unwrap();
    assert_eq!(location.path.last().unwrap().name(), "b");
    assert_eq!(mapping.content_pos(&location).unwrap(), 0);
}
