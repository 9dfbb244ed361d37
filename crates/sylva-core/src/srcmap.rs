//! Source maps: mapping positions between successive transformations of a
//! source text.
//!
//! A [`SourceMap`] is a sorted parallel-array representation: `positions`
//! holds the offsets in the transformed text where the mapping changes,
//! `offsets` the signed value to add to a position in order to recover the
//! position in the mapped (pre-transformation) text, and `file_names` the
//! source file each segment stems from. Lookups are binary searches.

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::Error;
use crate::text::{line_col, linebreaks};

/// A location within an original source text.
#[derive(Debug, Clone)]
pub struct SourceLocation {
    /// Name (or path or uri) of the source file.
    pub name: String,
    /// The source text itself.
    pub text: Rc<str>,
    /// A position within the text.
    pub pos: usize,
}

/// A function mapping a position in a processed text onto the
/// corresponding location in the original source.
pub type SourceMapFn = Rc<dyn Fn(usize) -> SourceLocation>;

/// Sorted parallel-array mapping between a transformed text and the
/// original source location(s).
#[derive(Debug, Clone)]
pub struct SourceMap {
    /// Name of the source the transformed text was derived from.
    pub original_name: String,
    /// Offsets in the transformed text where the mapping changes.
    pub positions: Vec<usize>,
    /// For each segment, the value to add to a transformed position to
    /// recover the original position.
    pub offsets: Vec<isize>,
    /// The source file associated with each segment.
    pub file_names: Vec<String>,
    /// File name to original source text.
    pub originals: IndexMap<String, Rc<str>>,
}

impl SourceMap {
    /// A map with a single neutral segment covering the whole text.
    pub fn neutral(name: &str, text: Rc<str>) -> Self {
        SourceMap {
            original_name: name.to_string(),
            positions: vec![0],
            offsets: vec![0],
            file_names: vec![name.to_string()],
            originals: IndexMap::from([(name.to_string(), text)]),
        }
    }
}

/// Returns true if the map draws from any file other than the one the
/// transformed text was derived from.
pub fn has_includes(map: &SourceMap) -> bool {
    map.file_names.iter().any(|name| *name != map.original_name)
}

fn segment_index(positions: &[usize], position: usize) -> usize {
    let i = positions.partition_point(|&p| p <= position);
    debug_assert!(i > 0, "source maps must start with position 0");
    i
}

/// Maps a position in a (pre-)processed text to its corresponding location
/// in the original document.
///
/// Positions that fell inside a text region removed by the transformation
/// are clamped to the region's boundary.
pub fn source_map(position: usize, map: &SourceMap) -> SourceLocation {
    let i = segment_index(&map.positions, position);
    let name = &map.file_names[i - 1];
    let mut mapped = position as isize + map.offsets[i - 1];
    if i < map.positions.len() {
        mapped = mapped.min(map.positions[i] as isize + map.offsets[i]);
    }
    SourceLocation {
        name: name.clone(),
        text: map.originals[name].clone(),
        pos: mapped.max(0) as usize,
    }
}

/// Like [`source_map`], but without boundary clamping. Used for include
/// maps, where segment borders switch between files rather than cutting
/// out inserted characters.
pub fn srcmap_includes(position: usize, map: &SourceMap) -> SourceLocation {
    let i = segment_index(&map.positions, position);
    let name = &map.file_names[i - 1];
    SourceLocation {
        name: name.clone(),
        text: map.originals[name].clone(),
        pos: (position as isize + map.offsets[i - 1]).max(0) as usize,
    }
}

/// Wraps a [`SourceMap`] into a [`SourceMapFn`].
pub fn srcmap_fn(map: Rc<SourceMap>) -> SourceMapFn {
    Rc::new(move |pos| source_map(pos, &map))
}

/// Generates a source map function that maps every position to itself.
pub fn neutral_srcmap_fn(text: Rc<str>, original_name: &str) -> SourceMapFn {
    let name: String = if original_name.is_empty() {
        "UNKNOWN_FILE".to_string()
    } else {
        original_name.to_string()
    };
    Rc::new(move |pos| SourceLocation {
        name: name.clone(),
        text: text.clone(),
        pos,
    })
}

/// Sequentially applies a number of mapping functions to a source
/// position. In the context of source mapping, the position usually lies
/// in a preprocessed text and `mappings` is the list of reverse mappings
/// in reverse order of application.
pub fn apply_src_mappings(position: usize, mappings: &[SourceMapFn]) -> SourceLocation {
    assert!(!mappings.is_empty());
    let mut location = mappings[0](position);
    for mapping in &mappings[1..] {
        location = mapping(location.pos);
    }
    location
}

/// Fills in the original document, position and line/column values of the
/// given errors in place, using `mapping` to resolve each error's position
/// in the preprocessed text. Errors whose `orig_pos` is already set are
/// left untouched.
pub fn add_source_locations(errors: &mut [Error], mapping: &SourceMapFn) {
    let mut lb_cache: HashMap<String, (Rc<str>, Vec<usize>)> = HashMap::new();
    for err in errors.iter_mut() {
        if err.orig_pos.is_some() {
            continue;
        }
        let location = mapping(err.pos());
        let (text, lbreaks) = lb_cache
            .entry(location.name.clone())
            .or_insert_with(|| (location.text.clone(), linebreaks(&location.text)));
        err.orig_doc = location.name;
        err.orig_pos = Some(location.pos);
        let (line, column) = line_col(lbreaks, location.pos);
        err.line = Some(line);
        err.column = Some(column);
        if location.pos + err.length > text.len() {
            // the error's range must not exceed the text
            err.length = text.len().saturating_sub(location.pos).max(1);
        }
        let (end_line, end_column) = line_col(lbreaks, location.pos + err.length);
        err.end_line = Some(end_line);
        err.end_column = Some(end_column);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ERROR;

    fn sample_map() -> SourceMap {
        // transformed text "abcXYZdef" mapping back to original "abcdef";
        // the region [3, 6) was inserted by the transformation.
        SourceMap {
            original_name: "sample".to_string(),
            positions: vec![0, 4, 7, 10],
            offsets: vec![0, -2, -3, -3],
            file_names: vec!["sample".to_string(); 4],
            originals: IndexMap::from([("sample".to_string(), Rc::from("abcdef"))]),
        }
    }

    #[test]
    fn neutral_fn_is_identity() {
        let mapping = neutral_srcmap_fn(Rc::from("hello"), "greeting.txt");
        let loc = mapping(3);
        assert_eq!(loc.name, "greeting.txt");
        assert_eq!(&*loc.text, "hello");
        assert_eq!(loc.pos, 3);
    }

    #[test]
    fn unnamed_source_gets_placeholder_name() {
        let mapping = neutral_srcmap_fn(Rc::from(""), "");
        assert_eq!(mapping(0).name, "UNKNOWN_FILE");
    }

    #[test]
    fn lookup_clamps_into_removed_regions() {
        let map = sample_map();
        assert_eq!(source_map(0, &map).pos, 0);
        assert_eq!(source_map(3, &map).pos, 3);
        // positions inside the inserted region collapse onto its boundary
        assert_eq!(source_map(4, &map).pos, 2);
        assert_eq!(source_map(8, &map).pos, 5);
    }

    #[test]
    fn chained_mappings_compose() {
        let inner = neutral_srcmap_fn(Rc::from("abcdef"), "inner");
        let map = Rc::new(sample_map());
        let chain = vec![srcmap_fn(map), inner];
        let loc = apply_src_mappings(8, &chain);
        assert_eq!(loc.name, "inner");
        assert_eq!(loc.pos, 5);
    }

    #[test]
    fn source_locations_are_added_once() {
        let mapping = neutral_srcmap_fn(Rc::from("one\ntwo\nthree"), "doc");
        let mut errors = vec![Error::new("mishap", 5, ERROR)];
        add_source_locations(&mut errors, &mapping);
        assert_eq!(errors[0].orig_pos, Some(5));
        assert_eq!(errors[0].orig_doc, "doc");
        assert_eq!(errors[0].line, Some(2));
        assert_eq!(errors[0].column, Some(2));
        // a second pass must not overwrite the resolved location
        let other = neutral_srcmap_fn(Rc::from("completely different"), "other");
        add_source_locations(&mut errors, &other);
        assert_eq!(errors[0].orig_doc, "doc");
    }

    #[test]
    fn error_length_is_clamped_to_text() {
        let mapping = neutral_srcmap_fn(Rc::from("short"), "doc");
        let mut errors = vec![Error::new("overlong", 3, ERROR).with_length(10)];
        add_source_locations(&mut errors, &mapping);
        assert_eq!(errors[0].length, 2);
        assert_eq!(errors[0].end_column, Some(6));
    }
}
