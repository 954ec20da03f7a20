//! Shared operation context.
//!
//! Groups the state every command needs (layout, configuration, formulas,
//! cache, linker, database, reporter) to reduce argument fatigue.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context as _, Result};
use keg_core::io::{ArtifactCache, RetryPolicy};
use keg_core::linker::Linker;
use keg_core::{Config, Layout, Reporter};
use keg_schema::FormulaSet;
use tokio_util::sync::CancellationToken;

use super::error::InstallError;
use crate::store::{PrefixLock, StateDb};

/// Command-line overrides applied on top of `config.toml`.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub formulae: Option<PathBuf>,
    pub jobs: Option<usize>,
    pub keep_failed: bool,
}

/// Groups common state used during operations.
#[derive(Clone)]
pub struct Context {
    pub layout: Layout,
    pub config: Config,
    pub formulas: Arc<FormulaSet>,
    pub cache: Arc<ArtifactCache>,
    pub linker: Arc<Linker>,
    /// Guards the state database. Held with the prefix lock while linking.
    pub db: Arc<Mutex<StateDb>>,
    pub reporter: Arc<dyn Reporter>,
    pub cancel: CancellationToken,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("layout", &self.layout)
            .field("config", &self.config)
            .field("formulas", &self.formulas.len())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Build the context from `KEG_HOME`, its config file and `overrides`.
    pub fn load(overrides: &Overrides, reporter: Arc<dyn Reporter>) -> Result<Self> {
        let layout = Layout::from_env().context("Could not determine keg home; set KEG_HOME")?;
        Self::load_at(layout, overrides, reporter)
    }

    /// Build the context for an explicit home directory.
    pub fn load_at(layout: Layout, overrides: &Overrides, reporter: Arc<dyn Reporter>) -> Result<Self> {
        layout
            .ensure_dirs()
            .with_context(|| format!("Failed to create {}", layout.root().display()))?;

        let mut config = Config::load(&layout.config_path())?;
        if let Some(jobs) = overrides.jobs {
            config.jobs = Some(jobs);
        }
        if overrides.keep_failed {
            config.keep_failed_builds = true;
        }

        let formula_dir = overrides
            .formulae
            .clone()
            .unwrap_or_else(|| layout.formula_dir());
        let formulas = if formula_dir.exists() {
            FormulaSet::load_dir(&formula_dir).map_err(InstallError::from)?
        } else {
            tracing::debug!("formula directory {} does not exist", formula_dir.display());
            FormulaSet::new()
        };

        let cache = ArtifactCache::new(
            &layout,
            RetryPolicy {
                attempts: config.fetch_attempts.max(1),
                base_delay: Duration::from_millis(config.fetch_backoff_ms),
            },
        )?;

        let db = StateDb::open_at(&layout.db_path()).context("Failed to open state database")?;

        Ok(Self {
            linker: Arc::new(Linker::new(layout.clone())),
            layout,
            config,
            formulas: Arc::new(formulas),
            cache: Arc::new(cache),
            db: Arc::new(Mutex::new(db)),
            reporter,
            cancel: CancellationToken::new(),
        })
    }

    /// Lock the state database for this process.
    pub fn lock_db(&self) -> Result<MutexGuard<'_, StateDb>, InstallError> {
        self.db.lock().map_err(|_| InstallError::Lock)
    }

    /// Lock the database and the shared prefix against every other thread
    /// and `keg` process. Blocks until both are held.
    pub fn lock_prefix(&self) -> Result<PrefixGuard<'_>, InstallError> {
        let db = self.lock_db()?;
        let lock = PrefixLock::acquire(&self.layout.lock_path())?;
        Ok(PrefixGuard { db, _lock: lock })
    }
}

/// Database access while the shared prefix is locked.
#[derive(Debug)]
pub struct PrefixGuard<'a> {
    db: MutexGuard<'a, StateDb>,
    _lock: PrefixLock,
}

impl Deref for PrefixGuard<'_> {
    type Target = StateDb;

    fn deref(&self) -> &StateDb {
        &self.db
    }
}

impl DerefMut for PrefixGuard<'_> {
    fn deref_mut(&mut self) -> &mut StateDb {
        &mut self.db
    }
}
