pub mod builder;
pub mod config;
pub mod io;
pub mod linker;
pub mod paths;
pub mod process;
pub mod receipt;
pub mod reporter;
pub mod resolver;
pub mod tester;

pub use config::Config;
pub use paths::*;
pub use reporter::{NullReporter, Reporter};

/// User Agent string for source downloads
pub const USER_AGENT: &str = concat!("keg/", env!("CARGO_PKG_VERSION"));
