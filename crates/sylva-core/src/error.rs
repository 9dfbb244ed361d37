//! The diagnostic record and its severity bands.
//!
//! Severity is encoded in the numeric error code:
//!
//! | code        | severity |
//! |-------------|----------|
//! | 0           | no error |
//! | 1..=99      | notice   |
//! | 100..=999   | warning  |
//! | 1000..=9999 | error    |
//! | >= 10000    | fatal    |
//!
//! When a fatal error is present, downstream processing stages must be
//! skipped, because the tree is assumed to be too distorted for further
//! processing.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde_json::json;

/// Numeric error code, which doubles as the severity indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ErrorCode(pub u32);

// severity thresholds

pub const NO_ERROR: ErrorCode = ErrorCode(0);
pub const NOTICE: ErrorCode = ErrorCode(1);
pub const WARNING: ErrorCode = ErrorCode(100);
pub const ERROR: ErrorCode = ErrorCode(1000);
pub const FATAL: ErrorCode = ErrorCode(10000);
pub const HIGHEST: ErrorCode = FATAL;

// notice codes

pub const RESUME_NOTICE: ErrorCode = ErrorCode(50);

// warning codes

pub const UNDEFINED_SYMBOL_IN_TRANSTABLE_WARNING: ErrorCode = ErrorCode(610);
pub const CANNOT_VERIFY_TRANSTABLE_WARNING: ErrorCode = ErrorCode(620);

// error codes

pub const MANDATORY_CONTINUATION: ErrorCode = ErrorCode(1010);
pub const PARSER_LOOKAHEAD_FAILURE_ONLY: ErrorCode = ErrorCode(1030);
pub const PARSER_STOPPED_BEFORE_END: ErrorCode = ErrorCode(1040);
pub const UNDEFINED_SYMBOL: ErrorCode = ErrorCode(1140);
pub const ERROR_WHILE_RECOVERING_FROM_ERROR: ErrorCode = ErrorCode(1301);

// fatal errors

pub const TREE_PROCESSING_CRASH: ErrorCode = ErrorCode(10100);
pub const COMPILER_CRASH: ErrorCode = ErrorCode(10200);
pub const AST_TRANSFORM_CRASH: ErrorCode = ErrorCode(10300);
pub const RECURSION_DEPTH_LIMIT_HIT: ErrorCode = ErrorCode(10400);
pub const STRUCTURAL_ERROR_IN_AST: ErrorCode = ErrorCode(10500);

/// Severity band of an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Notice,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Notice => write!(f, "Notice"),
            Severity::Warning => write!(f, "Warning"),
            Severity::Error => write!(f, "Error"),
            Severity::Fatal => write!(f, "Fatal"),
        }
    }
}

impl ErrorCode {
    pub fn severity(self) -> Severity {
        if self < WARNING {
            Severity::Notice
        } else if self < ERROR {
            Severity::Warning
        } else if self < FATAL {
            Severity::Error
        } else {
            Severity::Fatal
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns true if `code` is merely a notice or a warning.
pub fn is_warning(code: ErrorCode) -> bool {
    code < ERROR
}

/// Returns true if `code` is a proper (or fatal) error, not just a warning.
pub fn is_error(code: ErrorCode) -> bool {
    code >= ERROR
}

/// Returns true if `code` is fatal. Fatal errors are typically raised when
/// a crash occurs at later stages of the processing pipeline (e.g. AST
/// transformation, compiling).
pub fn is_fatal(code: ErrorCode) -> bool {
    code >= FATAL
}

/// A single diagnostic message with its location.
///
/// `pos` always refers to the preprocessed source text, `orig_pos` and
/// `orig_doc` to the source file before preprocessing. Line and column
/// values are 1-based and refer to the original source; they are filled in
/// by [`add_source_locations`](crate::srcmap::add_source_locations).
#[derive(Debug, Clone)]
pub struct Error {
    pub message: String,
    code: ErrorCode,
    pos: usize,
    pub orig_pos: Option<usize>,
    pub orig_doc: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
    /// Length in characters of the faulty passage (at least 1).
    pub length: usize,
    pub end_line: Option<u32>,
    pub end_column: Option<u32>,
    /// Related sub-errors, e.g. the locations a duplicate definition
    /// conflicts with.
    pub related: Vec<Error>,
}

impl Error {
    pub fn new(message: impl Into<String>, pos: usize, code: ErrorCode) -> Self {
        Error {
            message: message.into(),
            code,
            pos,
            orig_pos: None,
            orig_doc: String::new(),
            line: None,
            column: None,
            length: 1,
            end_line: None,
            end_column: None,
            related: Vec::new(),
        }
    }

    pub fn with_length(mut self, length: usize) -> Self {
        assert!(length >= 1);
        self.length = length;
        self
    }

    pub fn with_related(mut self, related: Vec<Error>) -> Self {
        self.related = related;
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Re-anchors the error. Line/column values and the original position
    /// are derived from `pos` and therefore reset by this call.
    pub fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
        self.orig_pos = None;
        self.line = None;
        self.column = None;
        self.end_line = None;
        self.end_column = None;
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Shows the line of the document and the position where the error
    /// occurred.
    pub fn visualize(&self, document: &str) -> String {
        let start = document[..self.pos.min(document.len())]
            .rfind('\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let stop = document[self.pos.min(document.len())..]
            .find('\n')
            .map(|i| i + self.pos)
            .unwrap_or(document.len());
        format!(
            "{}\n{}^\n",
            &document[start..stop],
            " ".repeat(self.pos - start)
        )
    }

    /// Returns the error as a Language-Server-Protocol Diagnostic object.
    ///
    /// Requires that line/column information has been filled in, see
    /// [`add_source_locations`](crate::srcmap::add_source_locations).
    pub fn diagnostic_obj(&self) -> serde_json::Value {
        fn range_obj(err: &Error) -> serde_json::Value {
            json!({
                "start": {
                    "line": err.line.unwrap_or(1) - 1,
                    "character": err.column.unwrap_or(1) - 1,
                },
                "end": {
                    "line": err.end_line.or(err.line).unwrap_or(1) - 1,
                    "character": err.end_column.or(err.column).unwrap_or(1) - 1,
                },
            })
        }
        let severity = match self.severity() {
            Severity::Notice => 3,
            Severity::Warning => 2,
            _ => 1,
        };
        let mut diagnostic = json!({
            "range": range_obj(self),
            "severity": severity,
            "code": self.code.0,
            "source": "sylva",
            "message": self.message,
        });
        if !self.related.is_empty() {
            diagnostic["relatedInformation"] = serde_json::Value::Array(
                self.related
                    .iter()
                    .map(|rel| {
                        json!({
                            "location": {"uri": rel.orig_doc, "range": range_obj(rel)},
                            "message": rel.message,
                        })
                    })
                    .collect(),
            );
        }
        diagnostic
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.pos == other.pos
    }
}

impl Eq for Error {}

impl Hash for Error {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.code, self.pos).hash(state);
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.orig_doc.is_empty() && self.orig_doc != "UNKNOWN_FILE" {
            write!(f, "{}:", self.orig_doc)?;
        }
        if let (Some(line), Some(column)) = (self.line, self.column) {
            write!(f, "{}:{}: ", line, column)?;
        }
        write!(f, "{} ({}): {}", self.severity(), self.code, self.message)
    }
}

/// Returns true if at least one entry in `errors` has at least the given
/// error `level`.
pub fn has_errors(errors: &[Error], level: ErrorCode) -> bool {
    errors.iter().any(|err| err.code >= level)
}

/// Yields only those errors that have at least the given error level.
pub fn only_errors(errors: &[Error], level: ErrorCode) -> impl Iterator<Item = &Error> {
    errors.iter().filter(move |err| err.code >= level)
}

/// Renders the errors in canonical form, i.e.
/// `relative filepath:line:column: severity (code): error string`,
/// which can be parsed by most editors. File paths are given relative to
/// the current working directory where possible.
pub fn canonical_error_strings(errors: &[Error]) -> Vec<String> {
    let cwd = std::env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    errors
        .iter()
        .map(|err| {
            let rendered = err.to_string();
            if !cwd.is_empty() && err.orig_doc.starts_with(&cwd) {
                let rel_path = &err.orig_doc[cwd.len()..];
                match rendered.find(':') {
                    Some(i) => format!("{}{}", rel_path, &rendered[i..]),
                    None => rendered,
                }
            } else {
                rendered
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bands() {
        assert_eq!(ErrorCode(0).severity(), Severity::Notice);
        assert_eq!(RESUME_NOTICE.severity(), Severity::Notice);
        assert_eq!(ErrorCode(100).severity(), Severity::Warning);
        assert_eq!(ErrorCode(999).severity(), Severity::Warning);
        assert_eq!(ErrorCode(1000).severity(), Severity::Error);
        assert_eq!(PARSER_STOPPED_BEFORE_END.severity(), Severity::Error);
        assert_eq!(TREE_PROCESSING_CRASH.severity(), Severity::Fatal);
    }

    #[test]
    fn display_without_location() {
        let error = Error::new("Something went wrong", 123, ERROR);
        assert_eq!(error.to_string(), "Error (1000): Something went wrong");
    }

    #[test]
    fn display_with_location() {
        let mut error = Error::new("bad token", 3, ErrorCode(1010));
        error.orig_doc = "doc.txt".to_string();
        error.line = Some(2);
        error.column = Some(4);
        assert_eq!(error.to_string(), "doc.txt:2:4: Error (1010): bad token");
    }

    #[test]
    fn equality_and_hash_on_code_and_pos() {
        let a = Error::new("first message", 10, ERROR);
        let b = Error::new("completely different message", 10, ERROR);
        let c = Error::new("first message", 11, ERROR);
        assert_eq!(a, b);
        assert_ne!(a, c);
        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn set_pos_clears_derived_fields() {
        let mut error = Error::new("msg", 5, WARNING);
        error.line = Some(1);
        error.column = Some(6);
        error.orig_pos = Some(5);
        error.set_pos(7);
        assert_eq!(error.pos(), 7);
        assert!(error.line.is_none());
        assert!(error.orig_pos.is_none());
    }

    #[test]
    fn has_errors_respects_level() {
        let errors = vec![
            Error::new("a notice", 0, RESUME_NOTICE),
            Error::new("a warning", 2, ErrorCode(120)),
        ];
        assert!(!has_errors(&errors, ERROR));
        assert!(has_errors(&errors, WARNING));
        assert_eq!(only_errors(&errors, WARNING).count(), 1);
    }

    #[test]
    fn visualize_marks_position() {
        let error = Error::new("boom", 4, ERROR);
        assert_eq!(error.visualize("abc def"), "abc def\n    ^\n");
    }
}
