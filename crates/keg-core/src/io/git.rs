//! Version-control checkouts for `git` sources.
//!
//! Checkouts live in `cache/git/<key>` where the key is derived from the URL
//! and ref, and are refreshed with a shallow fetch on every use. The resolved
//! commit is returned so the receipt can record exactly what was built.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::process::{self, Exit, Invocation};

/// Default timeout for git operations (10 minutes).
const GIT_TIMEOUT: Duration = Duration::from_secs(600);

/// Failure of a git operation.
#[derive(Error, Debug)]
pub enum GitError {
    /// A git command failed or timed out.
    #[error("git {operation} failed for {url}: {message}")]
    Command {
        /// Which operation (`fetch`, `checkout`, ...).
        operation: &'static str,
        /// Repository URL.
        url: String,
        /// Tail of git's stderr, or the timeout.
        message: String,
    },

    /// Local I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// Whether retrying may help: a failed or timed-out `fetch` usually means
    /// the network or the remote was unavailable.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Command { operation: "fetch", .. })
    }
}

/// Directory name for a checkout of `url` at `reference`.
pub fn checkout_key(url: &str, reference: Option<&str>) -> String {
    let hash = blake3::hash(format!("{url}#{}", reference.unwrap_or("HEAD")).as_bytes());
    hash.to_hex()[..16].to_string()
}

/// Bring `cache_root/<key>` up to date with `url` at `reference` and return
/// the checkout path and the resolved commit.
///
/// Works for branches, tags and commit ids alike: the repository is
/// initialised once, then each call fetches the single ref shallowly and
/// force-checks it out.
///
/// # Errors
///
/// Returns [`GitError`] if any git command fails or times out.
pub fn checkout(
    cache_root: &Path,
    url: &str,
    reference: Option<&str>,
) -> Result<(PathBuf, String), GitError> {
    let dir = cache_root.join(checkout_key(url, reference));
    std::fs::create_dir_all(&dir)?;

    if !dir.join(".git").exists() {
        run_git(&dir, url, "init", &["init", "-q"])?;
        run_git(&dir, url, "remote", &["remote", "add", "origin", url])?;
    }

    let refspec = reference.unwrap_or("HEAD");
    debug!("fetching {url} at {refspec}");
    run_git(&dir, url, "fetch", &["fetch", "-q", "--depth", "1", "origin", refspec])?;
    run_git(&dir, url, "checkout", &["checkout", "-q", "--force", "FETCH_HEAD"])?;
    let revision = run_git(&dir, url, "rev-parse", &["rev-parse", "HEAD"])?;

    Ok((dir, revision.trim().to_string()))
}

/// Runs a git command with a timeout, returning its stdout.
fn run_git(
    dir: &Path,
    url: &str,
    operation: &'static str,
    args: &[&str],
) -> Result<String, GitError> {
    let logs = tempfile::tempdir()?;
    let stdout = logs.path().join("stdout");
    let stderr = logs.path().join("stderr");

    let mut argv = vec!["git".to_string()];
    argv.extend(args.iter().map(|a| (*a).to_string()));
    let env: BTreeMap<String, String> = ["PATH", "HOME", "SSH_AUTH_SOCK", "GIT_SSH_COMMAND"]
        .into_iter()
        .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
        .chain([("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())])
        .collect();

    let exit = process::run(&Invocation {
        args: &argv,
        cwd: dir,
        env: &env,
        stdout: &stdout,
        stderr: &stderr,
        timeout: GIT_TIMEOUT,
    })?;

    match exit {
        Exit::Code(0) => Ok(std::fs::read_to_string(&stdout)?),
        Exit::Code(code) => Err(GitError::Command {
            operation,
            url: url.to_string(),
            message: process::read_last_lines(&stderr, 5)
                .map(|tail| format!("exit {code}: {}", tail.trim()))
                .unwrap_or_else(|_| format!("exit {code}")),
        }),
        Exit::TimedOut => Err(GitError::Command {
            operation,
            url: url.to_string(),
            message: format!("timed out after {} seconds", GIT_TIMEOUT.as_secs()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_checkout_key_depends_on_ref() {
        let a = checkout_key("https://example.com/x.git", None);
        let b = checkout_key("https://example.com/x.git", Some("main"));
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_checkout_local_repository() {
        if which::which("git").is_err() {
            return;
        }
        let upstream = tempfile::tempdir().unwrap();
        let git = |args: &[&str]| {
            let status = Command::new("git")
                .args(["-c", "user.name=keg", "-c", "user.email=keg@example.com"])
                .args(args)
                .current_dir(upstream.path())
                .status()
                .unwrap();
            assert!(status.success());
        };
        git(&["init", "-q", "-b", "main"]);
        std::fs::write(upstream.path().join("README"), "hello").unwrap();
        git(&["add", "README"]);
        git(&["commit", "-q", "-m", "init"]);

        let cache = tempfile::tempdir().unwrap();
        let url = format!("file://{}", upstream.path().display());
        let (dir, revision) = checkout(cache.path(), &url, Some("main")).unwrap();

        assert_eq!(revision.len(), 40);
        assert_eq!(
            std::fs::read_to_string(dir.join("README")).unwrap(),
            "hello"
        );

        // Second checkout reuses the directory.
        let (again, same) = checkout(cache.path(), &url, Some("main")).unwrap();
        assert_eq!(again, dir);
        assert_eq!(same, revision);
    }
}
