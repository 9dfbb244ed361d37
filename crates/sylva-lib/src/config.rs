//! Thread-local configuration for serialization defaults.
//!
//! The configuration is read at serialization time only. Each thread gets
//! its own copy, so parallel document processing never shares mutable
//! state.

use std::cell::RefCell;

/// Policy for attribute values that are not well-formed XML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttrErrorPolicy {
    /// Serialization fails on ill-formed attribute values.
    #[default]
    Fail,
    /// Ill-formed characters are replaced by character entities.
    Fix,
    /// Ill-formed characters are replaced by question marks.
    Lxml,
    /// Attribute values are emitted verbatim.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// How the XML serializer treats ill-formed attribute values.
    pub xml_attribute_error_handling: AttrErrorPolicy,
    /// Serialization used by `serialize("default")`.
    pub default_serialization: String,
    /// Serialization used by `serialize("ast")`; falls back to the default.
    pub ast_serialization: String,
    /// Serialization used by `serialize("cst")`; falls back to the default.
    pub cst_serialization: String,
    /// Maximum length for flattened S-expressions.
    pub flatten_sxpr_threshold: i32,
    /// Tree size above which S-expressions are rendered compactly.
    pub compact_sxpr_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            xml_attribute_error_handling: AttrErrorPolicy::Fail,
            default_serialization: "sxpr".to_string(),
            ast_serialization: String::new(),
            cst_serialization: String::new(),
            flatten_sxpr_threshold: 92,
            compact_sxpr_threshold: 10,
        }
    }
}

thread_local! {
    static CONFIG: RefCell<Config> = RefCell::new(Config::default());
}

/// Reads a value from the current thread's configuration.
pub fn with_config<T>(f: impl FnOnce(&Config) -> T) -> T {
    CONFIG.with(|config| f(&config.borrow()))
}

/// Updates the current thread's configuration.
pub fn update_config(f: impl FnOnce(&mut Config)) {
    CONFIG.with(|config| f(&mut config.borrow_mut()));
}

/// Resets the current thread's configuration to the defaults.
pub fn reset_config() {
    CONFIG.with(|config| *config.borrow_mut() = Config::default());
}
