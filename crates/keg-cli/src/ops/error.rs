//! Domain-specific errors for package operations

use keg_core::builder::BuildError;
use keg_core::io::FetchError;
use keg_core::io::extract::ExtractError;
use keg_core::linker::LinkError;
use keg_core::resolver::ResolveError;
use keg_schema::{FormulaError, PackageName};
use thiserror::Error;

use crate::store::DbError;

/// Process exit codes, one per failure class.
pub mod exit {
    pub const OTHER: u8 = 1;
    pub const RESOLUTION: u8 = 2;
    pub const FETCH: u8 = 3;
    pub const BUILD: u8 = 4;
    pub const LINK_CONFLICT: u8 = 5;
    pub const TEST: u8 = 6;
}

#[derive(Error, Debug)]
pub enum InstallError {
    #[error(transparent)]
    Formula(#[from] FormulaError),

    #[error(transparent)]
    Resolution(#[from] ResolveError),

    #[error("{name}: {source}")]
    Fetch {
        name: PackageName,
        #[source]
        source: FetchError,
    },

    #[error("{name}: failed to unpack source: {source}")]
    Extract {
        name: PackageName,
        #[source]
        source: ExtractError,
    },

    #[error("{name}: {source}")]
    Build {
        name: PackageName,
        #[source]
        source: BuildError,
    },

    #[error("{name}: {source}")]
    Link {
        name: PackageName,
        #[source]
        source: LinkError,
    },

    #[error("{name}: {failed} of {total} test assertion(s) failed")]
    TestFailed {
        name: PackageName,
        failed: usize,
        total: usize,
    },

    #[error("{count} package(s) failed to install")]
    Failed {
        count: usize,
        /// Exit code of the first failure.
        code: u8,
    },

    #[error("{0} is not installed")]
    NotInstalled(String),

    #[error("cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database lock poisoned")]
    Lock,

    #[error("{context}: {message}")]
    Context {
        context: &'static str,
        message: String,
    },

    #[error("{0}")]
    Other(String),
}

impl InstallError {
    /// Create an error with context for better debugging.
    pub fn context(ctx: &'static str, msg: impl std::fmt::Display) -> Self {
        Self::Context {
            context: ctx,
            message: msg.to_string(),
        }
    }

    /// Exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Formula(_) | Self::Resolution(_) => exit::RESOLUTION,
            Self::Fetch { .. } => exit::FETCH,
            Self::Build { .. } => exit::BUILD,
            Self::Link {
                source: LinkError::Conflict { .. },
                ..
            } => exit::LINK_CONFLICT,
            Self::TestFailed { .. } => exit::TEST,
            Self::Failed { code, .. } => *code,
            _ => exit::OTHER,
        }
    }
}

impl From<anyhow::Error> for InstallError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_exit_codes() {
        let name = PackageName::new("redis@5");
        let cycle: InstallError = ResolveError::Cycle {
            path: vec![PackageName::new("a"), PackageName::new("b"), PackageName::new("a")],
        }
        .into();
        assert_eq!(cycle.exit_code(), exit::RESOLUTION);

        let integrity = InstallError::Fetch {
            name: name.clone(),
            source: FetchError::Integrity {
                url: "u".into(),
                expected: "a".into(),
                actual: "b".into(),
            },
        };
        assert_eq!(integrity.exit_code(), exit::FETCH);

        let timeout = InstallError::Build {
            name: name.clone(),
            source: BuildError::Timeout {
                index: 2,
                command: "make".into(),
                limit: Duration::from_secs(1),
            },
        };
        assert_eq!(timeout.exit_code(), exit::BUILD);

        let conflict = InstallError::Link {
            name: name.clone(),
            source: LinkError::Conflict {
                path: PathBuf::from("/k/bin/redis-server"),
                owner: "redis".into(),
            },
        };
        assert_eq!(conflict.exit_code(), exit::LINK_CONFLICT);
        assert!(conflict.to_string().contains("owned by redis"));

        let test = InstallError::TestFailed {
            name,
            failed: 1,
            total: 2,
        };
        assert_eq!(test.exit_code(), exit::TEST);
        assert_eq!(InstallError::Cancelled.exit_code(), exit::OTHER);
    }
}
