use dirs::home_dir;
use std::path::{Path, PathBuf};

/// Returns the keg home directory, or None if the user's home cannot be resolved.
///
/// `KEG_HOME` overrides the default of `~/.keg`.
pub fn try_keg_home() -> Option<PathBuf> {
    if let Some(val) = std::env::var_os("KEG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".keg"))
}

/// On-disk layout rooted at a keg home directory.
///
/// The home directory doubles as the shared prefix: `bin/`, `lib/`, `share/`
/// and friends live directly under it next to `Cellar/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Layout rooted at an explicit directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout rooted at [`try_keg_home`].
    pub fn from_env() -> Option<Self> {
        try_keg_home().map(Self::new)
    }

    /// The keg home directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shared prefix that receives symlinks: the home directory itself.
    pub fn prefix(&self) -> &Path {
        &self.root
    }

    /// `SQLite` database path: ~/.keg/state.db
    pub fn db_path(&self) -> PathBuf {
        self.root.join("state.db")
    }

    /// Cross-process lock on the shared prefix: ~/.keg/.lock
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    /// Optional configuration file: ~/.keg/config.toml
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// Cellar holding every keg: ~/.keg/Cellar
    pub fn cellar(&self) -> PathBuf {
        self.root.join("Cellar")
    }

    /// Directory holding all installed versions of one formula.
    pub fn rack(&self, name: &str) -> PathBuf {
        self.cellar().join(name)
    }

    /// Keg for one formula version: ~/.keg/Cellar/<name>/<pkg_version>
    pub fn keg_path(&self, name: &str, pkg_version: &str) -> PathBuf {
        self.rack(name).join(pkg_version)
    }

    /// Artifact cache: ~/.keg/cache
    pub fn cache_path(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// VCS checkout cache: ~/.keg/cache/git
    pub fn git_cache_path(&self) -> PathBuf {
        self.cache_path().join("git")
    }

    /// Logs directory: ~/.keg/logs
    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Generate a build log directory for a package
    pub fn build_log_dir(&self, package: &str, version: &str) -> PathBuf {
        let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        self.log_dir()
            .join(format!("build-{package}-{version}-{timestamp}"))
    }

    /// Temp path: ~/.keg/tmp (same volume as the Cellar so renames are atomic)
    pub fn tmp_path(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Default formula directory: ~/.keg/formulae
    pub fn formula_dir(&self) -> PathBuf {
        self.root.join("formulae")
    }

    /// Create the directories every command expects to exist.
    ///
    /// # Errors
    ///
    /// Returns an error if any directory cannot be created.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.cellar(),
            self.cache_path(),
            self.log_dir(),
            self.tmp_path(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Extract the filename from a URL.
pub fn filename_from_url(url: &str) -> &str {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    trimmed.split('/').next_back().unwrap_or("")
}
