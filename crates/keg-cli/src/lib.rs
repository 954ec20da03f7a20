//! keg - build formulas from source into isolated kegs
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]
//!
//! Resolves a formula's dependency graph, fetches and verifies sources,
//! builds each package into a staging directory, moves it into its keg and
//! links it into the shared prefix.
//!
//! # Architecture
//!
//! - **Layered scheduling**: the resolution plan is split into layers; each
//!   layer's packages build concurrently under a semaphore.
//! - **Actor Pattern**: terminal output is serialized through the UI actor.
//! - **One prefix lock**: linking and database writes share a mutex.
//!
//! # Directory Layout
//!
//! ```text
//! ~/.keg/
//! ├── bin/ lib/ ...        # Shared prefix: symlinks into kegs
//! ├── opt/<name>           # Link to the current keg of every formula
//! ├── Cellar/<name>/<ver>/ # Kegs
//! ├── cache/               # Verified source archives, git checkouts
//! ├── formulae/            # Formula definitions (*.toml)
//! ├── logs/                # Per-step build logs
//! ├── tmp/                 # Build scratch directories
//! └── state.db             # SQLite database
//! ```

pub mod cmd;
pub mod ops;
pub mod store;
pub mod ui;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use keg_core::resolver::ResolveError;
use keg_schema::FormulaError;
use tokio_util::sync::CancellationToken;

use crate::ops::{InstallError, Overrides, exit};

#[derive(Debug, Parser)]
#[command(name = "keg")]
#[command(author, version, about = "keg - build formulas from source into isolated kegs")]
pub struct Cli {
    /// Directory holding formula definitions (defaults to $KEG_HOME/formulae)
    #[arg(long, global = true, env = "KEG_FORMULAE")]
    pub formulae: Option<PathBuf>,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build and install formulas with their dependencies
    Install {
        /// Formula name(s)
        #[arg(required = true, value_name = "FORMULA")]
        names: Vec<String>,
        /// Build the requested formulas from their development source
        #[arg(long)]
        head: bool,
        /// Enable a variant on the requested formulas (repeatable)
        #[arg(long = "with", value_name = "VARIANT")]
        with: Vec<String>,
        /// Keep the build directory of failed builds
        #[arg(long)]
        keep_failed: bool,
        /// Parallel jobs passed to build tools
        #[arg(short, long)]
        jobs: Option<usize>,
    },
    /// Remove an installed formula
    Uninstall {
        /// Formula name
        formula: String,
        /// Remove even if other installed formulas depend on it
        #[arg(long)]
        ignore_dependencies: bool,
    },
    /// Run the smoke tests of an installed formula
    Test {
        /// Formula name
        formula: String,
    },
    /// List installed kegs
    List,
    /// Show formula info
    Info {
        /// Formula name
        formula: String,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// Run a parsed command line.
pub async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let mut overrides = Overrides {
        formulae: cli.formulae,
        ..Overrides::default()
    };
    let quiet = cli.quiet;

    match cli.command {
        Commands::Install {
            names,
            head,
            with,
            keep_failed,
            jobs,
        } => {
            overrides.jobs = jobs;
            overrides.keep_failed = keep_failed;
            cmd::install::install(&names, head, &with, &overrides, quiet, cancel).await
        }
        Commands::Uninstall {
            formula,
            ignore_dependencies,
        } => cmd::uninstall::uninstall(&formula, ignore_dependencies, &overrides, quiet).await,
        Commands::Test { formula } => cmd::test::test(&formula, &overrides, quiet).await,
        Commands::List => cmd::list::list(),
        Commands::Info { formula } => cmd::info::info(&formula, &overrides),
        Commands::Completions { shell } => {
            cmd::completions::completions(shell);
            Ok(())
        }
    }
}

/// Process exit code for an error returned by [`run`].
pub fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<InstallError>() {
            return e.exit_code();
        }
        if cause.is::<ResolveError>() || cause.is::<FormulaError>() {
            return exit::RESOLUTION;
        }
    }
    exit::OTHER
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_install_flags() {
        let cli = Cli::parse_from([
            "keg", "install", "redis", "--head", "--with", "tls", "--with", "jemalloc", "-j", "2",
        ]);
        match cli.command {
            Commands::Install {
                names,
                head,
                with,
                jobs,
                keep_failed,
            } => {
                assert_eq!(names, vec!["redis"]);
                assert!(head);
                assert_eq!(with, vec!["tls", "jemalloc"]);
                assert_eq!(jobs, Some(2));
                assert!(!keep_failed);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_formula_dir_and_install_names_parse_together() {
        let cli = Cli::try_parse_from(["keg", "install", "x", "--formulae", "/srv/formulae"])
            .unwrap();
        assert_eq!(cli.formulae, Some(PathBuf::from("/srv/formulae")));
        let Commands::Install { names, .. } = cli.command else {
            panic!("expected install");
        };
        assert_eq!(names, vec!["x"]);

        let cli = Cli::try_parse_from(["keg", "install", "x"]).unwrap();
        assert!(cli.formulae.is_none() || std::env::var_os("KEG_FORMULAE").is_some());
    }

    #[test]
    fn test_exit_code_walks_chain() {
        let err = anyhow::Error::from(InstallError::Failed { count: 2, code: 4 });
        assert_eq!(exit_code(&err), 4);

        let err = anyhow::Error::from(ResolveError::Cycle {
            path: vec![
                keg_schema::PackageName::new("a"),
                keg_schema::PackageName::new("a"),
            ],
        })
        .context("resolving");
        assert_eq!(exit_code(&err), exit::RESOLUTION);

        assert_eq!(exit_code(&anyhow::anyhow!("boom")), exit::OTHER);
    }
}
