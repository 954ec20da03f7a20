//! User configuration (`config.toml` in the keg home).
//!
//! Every field is optional; command-line flags override whatever is loaded
//! here.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path of the config file.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or has unknown keys.
    #[error("invalid config {path}: {source}")]
    Parse {
        /// Path of the config file.
        path: String,
        /// Underlying error.
        #[source]
        source: Box<toml::de::Error>,
    },
}

/// Tunables for the install pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Build parallelism passed to build tools as `JOBS`. `None` means CPU count.
    pub jobs: Option<usize>,
    /// Number of packages processed concurrently.
    pub packages: usize,
    /// Per-step timeout in seconds.
    pub step_timeout_secs: u64,
    /// Download attempts for transient failures.
    pub fetch_attempts: u32,
    /// Base delay of the exponential retry backoff, in milliseconds.
    pub fetch_backoff_ms: u64,
    /// Build with a minimal environment instead of the inherited one.
    pub hermetic: bool,
    /// Keep the scratch directory of failed builds for inspection.
    pub keep_failed_builds: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jobs: None,
            packages: 4,
            step_timeout_secs: 3600,
            fetch_attempts: 3,
            fetch_backoff_ms: 200,
            hermetic: false,
            keep_failed_builds: false,
        }
    }
}

impl Config {
    /// Load the configuration at `path`, falling back to defaults when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is unreadable or invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: Box::new(e),
        })
    }

    /// Effective build job count.
    pub fn build_jobs(&self) -> usize {
        self.jobs.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Per-step timeout as a [`Duration`].
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.step_timeout(), Duration::from_secs(3600));
    }

    #[test]
    fn test_partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "jobs = 2\nhermetic = true\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.build_jobs(), 2);
        assert!(cfg.hermetic);
        assert_eq!(cfg.packages, 4);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "parallel = 9\n").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
