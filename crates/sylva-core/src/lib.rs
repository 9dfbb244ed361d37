//! Core diagnostic and source-location data structures for Sylva.
//!
//! This crate carries the pieces of the tree engine that do not depend on
//! the node-tree itself:
//!
//! - [`Error`] and [`ErrorCode`]: diagnostic records with severity bands
//!   and positions in both the preprocessed and the original source.
//! - [`SourceMap`] and [`SourceLocation`]: an invertible mapping between
//!   positions in a transformed text and locations in the original
//!   source file(s).
//! - [`ErrorPrinter`]: renders diagnostics against the source text.
//!
//! # Example
//!
//! ```
//! use sylva_core::{Error, ERROR, has_errors};
//!
//! let error = Error::new("Something went wrong", 123, ERROR);
//! assert_eq!(error.to_string(), "Error (1000): Something went wrong");
//! assert!(has_errors(&[error], ERROR));
//! ```

pub mod error;
pub mod printer;
pub mod srcmap;
pub mod text;

pub use error::{
    canonical_error_strings, has_errors, is_error, is_fatal, is_warning, only_errors, Error,
    ErrorCode, Severity, AST_TRANSFORM_CRASH, CANNOT_VERIFY_TRANSTABLE_WARNING, COMPILER_CRASH,
    ERROR, ERROR_WHILE_RECOVERING_FROM_ERROR, FATAL, HIGHEST, MANDATORY_CONTINUATION, NOTICE,
    NO_ERROR, PARSER_LOOKAHEAD_FAILURE_ONLY, PARSER_STOPPED_BEFORE_END,
    RECURSION_DEPTH_LIMIT_HIT, RESUME_NOTICE, STRUCTURAL_ERROR_IN_AST, TREE_PROCESSING_CRASH,
    UNDEFINED_SYMBOL, UNDEFINED_SYMBOL_IN_TRANSTABLE_WARNING, WARNING,
};
pub use printer::ErrorPrinter;
pub use srcmap::{
    add_source_locations, apply_src_mappings, has_includes, neutral_srcmap_fn, source_map,
    srcmap_fn, srcmap_includes, SourceLocation, SourceMap, SourceMapFn,
};
pub use text::{line_col, linebreaks};
