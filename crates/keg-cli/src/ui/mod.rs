//! Terminal output: a single UI actor fed by cloneable [`Output`] handles.

pub mod actor;
pub mod list;
pub mod output;
pub mod theme;

pub use output::Output;
