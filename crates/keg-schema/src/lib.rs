//! Formula model and on-disk formats shared by the keg crates.

pub mod formula;
pub mod hash;
pub mod types;

// Re-exports
pub use formula::{
    BuildStep, DependencyKind, DependencySpec, Disabled, Formula, FormulaError, FormulaInfo,
    FormulaSet, HeadSpec, Source, SourceLocator, TestAssertion, line_regex,
};
pub use hash::*;
pub use types::*;

/// File name of the receipt written into every installed keg.
pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";
