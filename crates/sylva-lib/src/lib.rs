//! Sylva: a runtime tree-engine for DSL parsers and compilers.
//!
//! The crate provides the universal container for parsed documents, a
//! mutable [`Node`] tree with attributes, write-once source positions and
//! centralized error bookkeeping, together with the machinery that makes
//! such trees practical to work with:
//!
//! - serialization to and from S-expressions, SXML, XML and JSON
//!   ([`serialize`], [`read`]),
//! - path navigation and selection by flexible criteria ([`path`],
//!   [`criteria`]),
//! - a content-mapping and markup engine that relates the flat text of a
//!   tree to its hierarchy and inserts markup across existing boundaries
//!   ([`mapping`]),
//! - a depth-first transformation dispatcher with a library of rewrite
//!   rules ([`transform`]),
//! - preprocessor support with source-location mapping ([`preprocess`]).
//!
//! # Example
//!
//! ```
//! use sylva_lib::{parse_sxpr, ContentMapping};
//!
//! let doc = parse_sxpr(r#"(doc "In Berlin steht ein Haus.")"#).unwrap();
//! let mut mapping = ContentMapping::new(doc.tree());
//! let start = mapping.content().find("Berlin").unwrap();
//! mapping.markup(start, start + 6, "place", &[]).unwrap();
//! assert_eq!(doc.content(), "In Berlin steht ein Haus.");
//! assert!(doc.tree().as_sxpr().contains(r#"(place "Berlin")"#));
//! ```

pub mod config;
pub mod criteria;
pub mod mapping;
pub mod node;
pub mod path;
pub mod preprocess;
pub mod read;
pub mod root;
pub mod serialize;
pub mod transform;

pub use criteria::{
    create_match_function, create_path_match_function, leaf_paths, Criterion, NodeMatchFn,
    PathCriterion, PathMatchFn,
};
pub use mapping::{
    can_split, deep_split, full_split, gen_chain_id, insert_node, markup_leaf, markup_left,
    markup_right, reset_chain_id, split_node, ContentLocation, ContentMapping,
    ContentMappingOptions, MappingError,
};
pub use node::{
    content_of, strlen_of, tree_sanity_check, EvalActions, EvalArgs, EvalError, Node,
    NodeContent, NodeId, Path, TreeError, DIVISIBLES, LEAF_PTYPES, TOKEN_PTYPE,
    WHITESPACE_PTYPE, ZOMBIE_TAG,
};
pub use read::{
    deserialize, parse_json, parse_sxml, parse_sxpr, parse_xml, parse_xml_with, ReadError,
    XmlReadOptions, XmlReadResult,
};
pub use root::RootNode;
pub use serialize::{
    flatten_sxpr, flatten_xml, restore_tag_name, xml_tag_name, SerLocation, SerPart,
    SerializationMapping, SerializeError, SxprPrinter, XmlPrinter,
};
pub use transform::{traverse, transformer, TransformationTable};

// the diagnostic and source-location primitives are re-exported for
// convenience, so that dependents rarely need sylva-core directly
pub use sylva_core::{
    canonical_error_strings, has_errors, Error, ErrorCode, ErrorPrinter, SourceLocation,
    SourceMap, SourceMapFn,
};
