//! Command handlers: parse-level arguments in, `anyhow::Result` out.

pub mod completions;
pub mod info;
pub mod install;
pub mod list;
pub mod uninstall;
