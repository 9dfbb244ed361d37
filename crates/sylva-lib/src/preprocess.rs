//! Preprocessing support: token injection and include expansion, with
//! source maps that relate positions in the preprocessed text back to
//! the original source file(s).
//!
//! Preprocessor tokens use three reserved control characters:
//! `\x1b <name> \x1c <argument> \x1d`, where the name matches `\w+` and
//! the argument contains none of the control characters.

use std::rc::Rc;

use indexmap::IndexMap;
use regex::Regex;
use thiserror::Error as ThisError;

use sylva_core::{
    add_source_locations, apply_src_mappings, neutral_srcmap_fn, source_map, srcmap_includes,
    Error, SourceMap, SourceMapFn,
};

pub const BEGIN_TOKEN: char = '\x1b';
pub const TOKEN_DELIMITER: char = '\x1c';
pub const END_TOKEN: char = '\x1d';
pub const RESERVED_TOKEN_CHARS: [char; 3] = [BEGIN_TOKEN, TOKEN_DELIMITER, END_TOKEN];

/// Failures of the preprocessing layer.
#[derive(Debug, ThisError)]
pub enum PreprocessError {
    #[error("circular include of {0} detected")]
    CircularInclude(String),
    #[error("cannot read include file {name}: {reason}")]
    IncludeNotReadable { name: String, reason: String },
    #[error("ill-formed preprocessor token: {0}")]
    MalformedToken(String),
}

/// Result of a preprocessing stage: the original text, the preprocessed
/// text, a mapping of positions in the latter back to source locations,
/// and the errors that occurred while preprocessing.
pub struct PreprocessorResult {
    pub original_text: Rc<str>,
    pub preprocessed_text: String,
    pub back_mapping: SourceMapFn,
    pub errors: Vec<Error>,
}

/// A preprocessor: `(original_text, original_name) -> PreprocessorResult`.
pub type PreprocessorFn = Rc<dyn Fn(&str, &str) -> PreprocessorResult>;

/// A tokenizer merely adds preprocessor tokens to a source text and
/// returns the enriched text plus any errors.
pub type TokenizerFn = Rc<dyn Fn(&str) -> (String, Vec<Error>)>;

/// Turns `name` and `argument` into a preprocessor token that a parser's
/// token recognizer will catch.
pub fn make_token(name: &str, argument: &str) -> Result<String, PreprocessError> {
    let name_ok = !name.is_empty()
        && name.chars().all(|c| c.is_alphanumeric() || c == '_');
    if !name_ok {
        return Err(PreprocessError::MalformedToken(name.to_string()));
    }
    if argument.chars().any(|c| RESERVED_TOKEN_CHARS.contains(&c)) {
        return Err(PreprocessError::MalformedToken(argument.to_string()));
    }
    Ok(format!(
        "{}{}{}{}{}",
        BEGIN_TOKEN, name, TOKEN_DELIMITER, argument, END_TOKEN
    ))
}

/// Returns a pretty-printable version of a document that contains tokens.
pub fn prettyprint_tokenized(tokenized: &str) -> String {
    tokenized
        .replace(BEGIN_TOKEN, "<")
        .replace(TOKEN_DELIMITER, "|")
        .replace(END_TOKEN, ">")
}

/// Replaces all tokens with the token's arguments.
pub fn strip_tokens(tokenized: &str) -> String {
    let rx = Regex::new("\u{1b}\\w+\u{1c}([^\u{1b}\u{1c}\u{1d}]*)\u{1d}").unwrap();
    rx.replace_all(tokenized, "$1").into_owned()
}

/// A preprocessor that does nothing, i.e. just returns the input.
pub fn nil_preprocessor(original_text: &str, original_name: &str) -> PreprocessorResult {
    let original: Rc<str> = Rc::from(original_text);
    PreprocessorResult {
        original_text: original.clone(),
        preprocessed_text: original_text.to_string(),
        back_mapping: neutral_srcmap_fn(original, original_name),
        errors: Vec::new(),
    }
}

/// Generates a source map for positions in a text that has been enriched
/// with token markers back to their original positions. The resulting
/// map has strictly increasing positions and strictly decreasing offsets
/// (tokens only add characters).
pub fn tokenized_to_original_mapping(
    tokenized_text: &str,
    original_text: &str,
    original_name: &str,
) -> SourceMap {
    let mut positions: Vec<usize> = vec![0];
    let mut offsets: Vec<isize> = vec![0];
    let mut o: isize = 0;
    let mut i = tokenized_text.find(BEGIN_TOKEN);
    let mut e: isize = -2;
    while let Some(begin) = i {
        let d = tokenized_text[begin..]
            .find(TOKEN_DELIMITER)
            .map(|x| x + begin)
            .expect("token delimiter missing");
        let end = tokenized_text[begin..]
            .find(END_TOKEN)
            .map(|x| x + begin)
            .expect("token end missing");
        assert!(d < end);
        o -= (d - begin + 2) as isize;
        positions.extend([d + 1, end + 1]);
        offsets.extend([o + 1, o]);
        e = end as isize;
        i = tokenized_text[end + 1..]
            .find(BEGIN_TOKEN)
            .map(|x| x + end + 1);
    }
    if e + 1 < tokenized_text.len() as isize {
        positions.push(tokenized_text.len() + 1);
        offsets.push(*offsets.last().unwrap());
    }

    debug_assert_eq!(positions.len(), offsets.len());
    debug_assert!(positions.windows(2).all(|w| w[0] < w[1]));
    debug_assert!(offsets[..offsets.len().saturating_sub(1)]
        .windows(2)
        .all(|w| w[0] > w[1]));

    let l = positions.len();
    SourceMap {
        original_name: original_name.to_string(),
        positions,
        offsets,
        file_names: vec![original_name.to_string(); l],
        originals: IndexMap::from([(original_name.to_string(), Rc::from(original_text))]),
    }
}

/// Generates a preprocessor function from a "naive" tokenizer, i.e. a
/// function that merely adds preprocessor tokens to a source text.
pub fn make_preprocessor(tokenizer: TokenizerFn) -> PreprocessorFn {
    Rc::new(move |original_text: &str, original_name: &str| {
        let (tokenized_text, errors) = tokenizer(original_text);
        let srcmap = Rc::new(tokenized_to_original_mapping(
            &tokenized_text,
            original_text,
            original_name,
        ));
        let mapping: SourceMapFn = Rc::new(move |pos| source_map(pos, &srcmap));
        PreprocessorResult {
            original_text: Rc::from(original_text),
            preprocessed_text: tokenized_text,
            back_mapping: mapping,
            errors,
        }
    })
}

/// Merges a sequence of preprocessors into a single function. The
/// mapping functions are chained in reverse order of application; errors
/// of every stage are resolved to source locations immediately.
pub fn chain_preprocessors(preprocessors: Vec<PreprocessorFn>) -> PreprocessorFn {
    assert!(!preprocessors.is_empty());
    Rc::new(move |original_text: &str, original_name: &str| {
        let original: Rc<str> = Rc::from(original_text);
        let mut processed = original_text.to_string();
        let mut mapping_chain: Vec<SourceMapFn> = Vec::new();
        let mut error_list: Vec<Error> = Vec::new();
        for prep in &preprocessors {
            let mut result = prep(&processed, original_name);
            if !result.errors.is_empty() {
                let chain: Vec<SourceMapFn> = if mapping_chain.is_empty() {
                    vec![neutral_srcmap_fn(original.clone(), original_name)]
                } else {
                    mapping_chain.iter().rev().cloned().collect()
                };
                let chained: SourceMapFn =
                    Rc::new(move |pos| apply_src_mappings(pos, &chain));
                add_source_locations(&mut result.errors, &chained);
            }
            mapping_chain.push(result.back_mapping);
            error_list.extend(result.errors);
            processed = result.preprocessed_text;
        }
        mapping_chain.reverse();
        let back_mapping: SourceMapFn = Rc::new(move |pos| apply_src_mappings(pos, &mapping_chain));
        PreprocessorResult {
            original_text: original.clone(),
            preprocessed_text: processed,
            back_mapping,
            errors: error_list,
        }
    })
}

// includes ///////////////////////////////////////////////////////////////

/// An include directive found in a text: its beginning, its length, and
/// the name of the included file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeInfo {
    pub begin: usize,
    pub length: usize,
    pub file_name: String,
}

/// A function locating the next include directive at or after `start`.
pub type FindIncludeFn = Rc<dyn Fn(&str, usize) -> Option<IncludeInfo>>;

/// A function fetching the text of an included file by name.
pub type ReadIncludeFn<'a> = dyn FnMut(&str) -> std::io::Result<String> + 'a;

/// Generates a function that finds include directives matching the
/// regular expression `rx`, which must expose the include name in a
/// capture group named `name`. The captured name is passed through
/// `derive_name` to obtain the actual file name, e.g. to append an
/// extension. Includes inside comment spans (matched by `comment_rx`)
/// are skipped.
pub fn find_include_fn(
    rx: &str,
    comment_rx: Option<&str>,
    derive_name: impl Fn(&str) -> String + 'static,
) -> FindIncludeFn {
    let rx = Regex::new(rx).expect("invalid include pattern");
    let comment_rx = comment_rx.map(|c| Regex::new(c).expect("invalid comment pattern"));

    let find_include = move |text: &str, begin: usize| -> Option<IncludeInfo> {
        rx.find_at(text, begin).map(|m| {
            let caps = rx.captures(&text[m.start()..]).expect("find implies captures");
            let name = caps
                .name("name")
                .map(|g| g.as_str())
                .unwrap_or_default();
            IncludeInfo {
                begin: m.start(),
                length: m.end() - m.start(),
                file_name: derive_name(name),
            }
        })
    };

    match comment_rx {
        None => Rc::new(find_include),
        Some(comment_rx) => Rc::new(move |text: &str, begin: usize| {
            let find_comment = |start: usize| -> Option<(usize, usize)> {
                comment_rx.find_at(text, start).map(|m| (m.start(), m.end()))
            };
            let mut comment = find_comment(begin);
            let mut info = find_include(text, begin);
            loop {
                let Some(inc) = &info else { return None };
                // fast-forward past comments preceding the candidate
                while let Some((_, b)) = comment {
                    if b <= inc.begin {
                        comment = find_comment(b);
                    } else {
                        break;
                    }
                }
                match comment {
                    Some((a, b)) if a < inc.begin + inc.length && inc.begin < b => {
                        // the candidate overlaps a comment, search on
                        info = find_include(text, b);
                    }
                    _ => return info,
                }
            }
        }),
    }
}

/// Recursively expands the include directives found by `find_next` and
/// returns the source map of the expansion plus the expanded text.
/// Included texts are fetched through `read`. Circular inclusion fails.
pub fn generate_include_map(
    original_name: &str,
    original_text: &str,
    find_next: &FindIncludeFn,
    read: &mut ReadIncludeFn,
) -> Result<(SourceMap, String), PreprocessError> {
    fn generate(
        source_name: &str,
        source_text: &str,
        find_next: &FindIncludeFn,
        read: &mut ReadIncludeFn,
        open_files: &mut Vec<String>,
    ) -> Result<(SourceMap, String), PreprocessError> {
        if open_files.iter().any(|name| name == source_name) {
            return Err(PreprocessError::CircularInclude(source_name.to_string()));
        }
        open_files.push(source_name.to_string());

        let mut map = SourceMap {
            original_name: source_name.to_string(),
            positions: vec![0],
            offsets: vec![0],
            file_names: vec![source_name.to_string()],
            originals: IndexMap::from([(source_name.to_string(), Rc::from(source_text))]),
        };
        let mut result = String::new();

        let mut original_pointer = 0usize;
        let mut original_offset = 0isize;
        let mut result_pointer = 0usize;
        let mut next = find_next(source_text, 0);
        while let Some(info) = next {
            let source_delta = info.begin - original_pointer;
            original_pointer += source_delta;
            result_pointer += source_delta;
            let included_text = read(&info.file_name).map_err(|err| {
                PreprocessError::IncludeNotReadable {
                    name: info.file_name.clone(),
                    reason: err.to_string(),
                }
            })?;
            let (mut inner_map, inner_text) =
                generate(&info.file_name, &included_text, find_next, read, open_files)?;
            for i in 0..inner_map.positions.len() {
                inner_map.positions[i] += result_pointer;
                inner_map.offsets[i] -= result_pointer as isize;
            }
            if source_delta == 0 {
                map.file_names.pop();
                map.positions.pop();
                map.offsets.pop();
            } else {
                result.push_str(
                    &source_text[original_pointer - source_delta..original_pointer],
                );
            }
            let inner_len = inner_map.positions.len();
            map.file_names
                .extend(inner_map.file_names[..inner_len - 1].iter().cloned());
            map.positions
                .extend(inner_map.positions[..inner_len - 1].iter().copied());
            map.offsets
                .extend(inner_map.offsets[..inner_len - 1].iter().copied());
            for (name, text) in inner_map.originals {
                map.originals.insert(name, text);
            }
            result.push_str(&inner_text);
            result_pointer += inner_text.len();
            map.file_names.push(source_name.to_string());
            map.positions.push(result_pointer);
            original_pointer += info.length;
            original_offset += info.length as isize - inner_text.len() as isize;
            map.offsets.push(original_offset);
            next = find_next(source_text, original_pointer);
        }
        let rest = &source_text[original_pointer..];
        if !rest.is_empty() {
            result.push_str(rest);
            map.positions
                .push(map.positions.last().unwrap() + rest.len());
            map.offsets.push(original_offset);
            map.file_names.push(source_name.to_string());
        }
        open_files.pop();
        Ok((map, result))
    }

    let mut open_files = Vec::new();
    generate(original_name, original_text, find_next, read, &mut open_files)
}

/// Expands includes and returns a preprocessor result whose back-mapping
/// resolves positions into the file each segment stems from.
pub fn preprocess_includes(
    original_name: &str,
    original_text: &str,
    find_next: &FindIncludeFn,
    read: &mut ReadIncludeFn,
) -> Result<PreprocessorResult, PreprocessError> {
    let (include_map, result) =
        generate_include_map(original_name, original_text, find_next, read)?;
    let map = Rc::new(include_map);
    let mapping: SourceMapFn = Rc::new(move |pos| srcmap_includes(pos, &map));
    Ok(PreprocessorResult {
        original_text: Rc::from(original_text),
        preprocessed_text: result,
        back_mapping: mapping,
        errors: Vec::new(),
    })
}

#[cfg(test)]
#[path = "preprocess_tests.rs"]
mod preprocess_tests;
