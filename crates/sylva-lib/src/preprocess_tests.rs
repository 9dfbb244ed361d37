use std::collections::HashMap;
use std::rc::Rc;

use sylva_core::{add_source_locations, Error, ERROR};

use crate::preprocess::*;

#[test]
fn token_syntax() {
    let token = make_token("T", "def").unwrap();
    assert_eq!(token, "\u{1b}T\u{1c}def\u{1d}");
    assert_eq!(prettyprint_tokenized(&token), "<T|def>");
    assert!(make_token("no spaces", "x").is_err());
    assert!(make_token("T", "bad\u{1b}arg").is_err());
}

#[test]
fn strip_tokens_restores_arguments() {
    let token = make_token("T", "def").unwrap();
    let tokenized = format!("abc {}", token);
    assert_eq!(strip_tokens(&tokenized), "abc def");
    assert_eq!(strip_tokens("no tokens"), "no tokens");
}

#[test]
fn tokenized_mapping_is_monotonic_and_invertible() {
    // the preprocessor replaces "def" in "abc def" by a token
    let original = "abc def";
    let token = make_token("T", "def").unwrap();
    let tokenized = format!("abc {}", token);
    let map = tokenized_to_original_mapping(&tokenized, original, "source.dsl");

    assert!(map.positions.windows(2).all(|w| w[0] < w[1]));

    // the position of ESC maps to the position of "def" in the original
    let esc_pos = tokenized.find('\u{1b}').unwrap();
    let location = sylva_core::source_map(esc_pos, &map);
    assert_eq!(location.name, "source.dsl");
    assert_eq!(&*location.text, original);
    assert_eq!(location.pos, 4);

    // positions inside the token's name collapse onto the token's start
    let name_pos = esc_pos + 1;
    assert_eq!(sylva_core::source_map(name_pos, &map).pos, 4);

    // positions inside the argument map onto the argument's characters
    let arg_pos = tokenized.find("def").unwrap();
    assert_eq!(sylva_core::source_map(arg_pos, &map).pos, 4);
    assert_eq!(sylva_core::source_map(arg_pos + 2, &map).pos, 6);

    // the mapping is monotonic non-decreasing over the whole text
    let mapped: Vec<usize> = (0..tokenized.len())
        .map(|i| sylva_core::source_map(i, &map).pos)
        .collect();
    assert!(mapped.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn preprocessor_from_tokenizer_resolves_error_locations() {
    let tokenizer: TokenizerFn = Rc::new(|text: &str| {
        let token = make_token("T", "def").unwrap();
        (text.replace("def", &token), Vec::new())
    });
    let preprocessor = make_preprocessor(tokenizer);
    let result = preprocessor("abc def", "doc.dsl");
    assert_eq!(
        prettyprint_tokenized(&result.preprocessed_text),
        "abc <T|def>"
    );
    let mut errors = vec![Error::new("mishap", 6, ERROR)];
    add_source_locations(&mut errors, &result.back_mapping);
    assert_eq!(errors[0].orig_doc, "doc.dsl");
    assert_eq!(errors[0].orig_pos, Some(4));
}

#[test]
fn nil_preprocessor_is_the_identity() {
    let result = nil_preprocessor("text", "doc");
    assert_eq!(result.preprocessed_text, "text");
    assert_eq!((result.back_mapping)(2).pos, 2);
    assert!(result.errors.is_empty());
}

#[test]
fn chained_preprocessors_compose_mappings() {
    // stage 1 replaces "b" by a token, stage 2 replaces "d" by a token
    let stage = |needle: &'static str| -> PreprocessorFn {
        make_preprocessor(Rc::new(move |text: &str| {
            let token = make_token("T", needle).unwrap();
            (text.replace(needle, &token), Vec::new())
        }))
    };
    let chained = chain_preprocessors(vec![stage("b"), stage("d")]);
    let result = chained("abcd", "doc");
    assert_eq!(prettyprint_tokenized(&result.preprocessed_text), "a<T|b>c<T|d>");
    // "c" sits behind both tokens; both mappings must be unwound
    let c_pos = result.preprocessed_text.find('c').unwrap();
    let location = (result.back_mapping)(c_pos);
    assert_eq!(location.name, "doc");
    assert_eq!(location.pos, 2);
}

#[test]
fn include_expansion_with_source_map() {
    let mut files: HashMap<String, String> = HashMap::new();
    files.insert("chapter.dsl".to_string(), "CHAPTER".to_string());
    let find = find_include_fn(r"@include\((?P<name>\w+\.dsl)\)", None, |name| name.to_string());
    let mut read = |name: &str| -> std::io::Result<String> {
        files
            .get(name)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, name))
    };
    let (map, expanded) =
        generate_include_map("main.dsl", "pre @include(chapter.dsl) post", &find, &mut read)
            .unwrap();
    assert_eq!(expanded, "pre CHAPTER post");
    assert!(sylva_core::has_includes(&map));

    // a position in included text maps into the included file
    let chapter_pos = expanded.find("CHAPTER").unwrap();
    let location = sylva_core::srcmap_includes(chapter_pos + 2, &map);
    assert_eq!(location.name, "chapter.dsl");
    assert_eq!(location.pos, 2);

    // a position after the include maps back into the main file
    let post_pos = expanded.find("post").unwrap();
    let location = sylva_core::srcmap_includes(post_pos, &map);
    assert_eq!(location.name, "main.dsl");
    assert_eq!(
        location.pos,
        "pre @include(chapter.dsl) ".len()
    );
}

#[test]
fn nested_includes() {
    let mut files: HashMap<String, String> = HashMap::new();
    files.insert("outer.dsl".to_string(), "[@include(inner.dsl)]".to_string());
    files.insert("inner.dsl".to_string(), "CORE".to_string());
    let find = find_include_fn(r"@include\((?P<name>\w+\.dsl)\)", None, |name| name.to_string());
    let mut read = |name: &str| -> std::io::Result<String> {
        files
            .get(name)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, name))
    };
    let (map, expanded) =
        generate_include_map("main.dsl", "<@include(outer.dsl)>", &find, &mut read).unwrap();
    assert_eq!(expanded, "<[CORE]>");
    let core_pos = expanded.find("CORE").unwrap();
    assert_eq!(
        sylva_core::srcmap_includes(core_pos, &map).name,
        "inner.dsl"
    );
    assert_eq!(
        sylva_core::srcmap_includes(1, &map).name,
        "outer.dsl"
    );
    assert_eq!(sylva_core::srcmap_includes(0, &map).name, "main.dsl");
}

#[test]
fn derived_include_names_resolve_the_file() {
    // the directive names the chapter, the file name is derived from it
    let mut files: HashMap<String, String> = HashMap::new();
    files.insert("intro.dsl".to_string(), "INTRO".to_string());
    let find = find_include_fn(r"@include\((?P<name>\w+)\)", None, |name| {
        format!("{}.dsl", name)
    });
    let mut read = |name: &str| -> std::io::Result<String> {
        files
            .get(name)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, name))
    };
    let (map, expanded) =
        generate_include_map("main.dsl", "<@include(intro)>", &find, &mut read).unwrap();
    assert_eq!(expanded, "<INTRO>");
    let location = sylva_core::srcmap_includes(1, &map);
    assert_eq!(location.name, "intro.dsl");
    assert_eq!(location.pos, 0);
}

#[test]
fn circular_includes_fail() {
    let find = find_include_fn(r"@include\((?P<name>\w+\.dsl)\)", None, |name| name.to_string());
    let mut read = |name: &str| -> std::io::Result<String> {
        assert_eq!(name, "self.dsl");
        Ok("@include(self.dsl)".to_string())
    };
    let result =
        generate_include_map("self.dsl", "@include(self.dsl)", &find, &mut read);
    assert!(matches!(result, Err(PreprocessError::CircularInclude(_))));
}

#[test]
fn unreadable_includes_fail() {
    let find = find_include_fn(r"@include\((?P<name>\w+\.dsl)\)", None, |name| name.to_string());
    let mut read = |_: &str| -> std::io::Result<String> {
        Err(std::io::Error::new(std::io::ErrorKind::NotFound, "missing"))
    };
    let result = generate_include_map("main.dsl", "@include(gone.dsl)", &find, &mut read);
    assert!(matches!(
        result,
        Err(PreprocessError::IncludeNotReadable { .. })
    ));
}

#[test]
fn includes_inside_comments_are_skipped() {
    let find = find_include_fn(
        r"@include\((?P<name>\w+\.dsl)\)",
        Some(r"//[^\n]*"),
        |name| name.to_string(),
    );
    let mut files: HashMap<String, String> = HashMap::new();
    files.insert("real.dsl".to_string(), "REAL".to_string());
    let mut read = |name: &str| -> std::io::Result<String> {
        files
            .get(name)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, name))
    };
    let source = "// @include(fake.dsl)\n@include(real.dsl)";
    let (_, expanded) = generate_include_map("main.dsl", source, &find, &mut read).unwrap();
    assert_eq!(expanded, "// @include(fake.dsl)\nREAL");
}
