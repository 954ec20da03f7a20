//! Smoke tests against an installed keg.
//!
//! Results are advisory: a failing assertion is reported, the installation
//! stays as it is.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use keg_schema::{Formula, PackageName, TestAssertion, line_regex};
use tracing::{debug, warn};

use crate::builder::Placeholders;
use crate::process::{self, Exit, Invocation};

/// Outcome of one assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionResult {
    /// Position in the formula's `test` list.
    pub index: usize,
    /// Human-readable form of the assertion.
    pub description: String,
    /// Whether it held.
    pub passed: bool,
    /// Why it failed; empty on success.
    pub detail: String,
}

/// All assertion results of one package.
#[derive(Debug, Clone)]
pub struct TestReport {
    pub name: PackageName,
    pub version: String,
    pub results: Vec<AssertionResult>,
}

impl TestReport {
    /// Every assertion held (vacuously true without assertions).
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &AssertionResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

/// Run every assertion of `formula` against `keg`.
///
/// Commands run in a fresh `{{testpath}}` directory with the keg's `bin/`
/// first on `PATH`. Relative paths in file assertions are taken from the keg.
///
/// # Errors
///
/// Returns an error only when the scratch directory or log files cannot be
/// created; assertion failures are part of the report.
pub fn run_tests(formula: &Formula, keg: &Path, timeout: Duration) -> std::io::Result<TestReport> {
    let testpath = tempfile::Builder::new().prefix("keg-test-").tempdir()?;
    let logs = tempfile::tempdir()?;

    let mut placeholders = Placeholders::new();
    placeholders
        .set("name", formula.name().as_str())
        .set("version", formula.pkg_version())
        .set("prefix", keg.to_string_lossy())
        .set("bin", keg.join("bin").to_string_lossy())
        .set("testpath", testpath.path().to_string_lossy());

    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    let path = env.get("PATH").cloned().unwrap_or_default();
    env.insert("PATH".into(), format!("{}:{path}", keg.join("bin").display()));
    env.insert("HOME".into(), testpath.path().to_string_lossy().into_owned());

    let mut results = Vec::with_capacity(formula.test.len());
    for (index, assertion) in formula.test.iter().enumerate() {
        let description = assertion.describe();
        debug!("[{}] test {index}: {description}", formula.name());

        let outcome = check(
            assertion,
            &placeholders,
            &Runner {
                cwd: testpath.path(),
                env: &env,
                logs: logs.path(),
                index,
                timeout,
            },
            keg,
        );
        if let Err(detail) = &outcome {
            warn!("{} test {index} failed: {detail}", formula.name());
        }
        results.push(AssertionResult {
            index,
            description,
            passed: outcome.is_ok(),
            detail: outcome.err().unwrap_or_default(),
        });
    }

    Ok(TestReport {
        name: formula.name().clone(),
        version: formula.pkg_version(),
        results,
    })
}

struct Runner<'a> {
    cwd: &'a Path,
    env: &'a BTreeMap<String, String>,
    logs: &'a Path,
    index: usize,
    timeout: Duration,
}

impl Runner<'_> {
    /// Run `argv`, returning combined stdout and stderr on exit 0.
    fn run(&self, argv: &[String]) -> Result<String, String> {
        let stdout = self.logs.join(format!("{:02}.stdout.log", self.index));
        let stderr = self.logs.join(format!("{:02}.stderr.log", self.index));
        let exit = process::run(&Invocation {
            args: argv,
            cwd: self.cwd,
            env: self.env,
            stdout: &stdout,
            stderr: &stderr,
            timeout: self.timeout,
        })
        .map_err(|e| e.to_string())?;

        let mut output = std::fs::read_to_string(&stdout).unwrap_or_default();
        output.push_str(&std::fs::read_to_string(&stderr).unwrap_or_default());

        match exit {
            Exit::Code(0) => Ok(output),
            Exit::Code(code) => Err(format!("exit code {code}: {}", last_lines(&output, 10))),
            Exit::TimedOut => Err(format!("timed out after {}s", self.timeout.as_secs())),
        }
    }
}

fn last_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

fn check(
    assertion: &TestAssertion,
    placeholders: &Placeholders,
    runner: &Runner<'_>,
    keg: &Path,
) -> Result<(), String> {
    let expand_all = |args: &[String]| {
        args.iter()
            .map(|a| placeholders.expand(a))
            .collect::<Result<Vec<_>, _>>()
    };
    let compile = |pattern: &str| line_regex(pattern).map_err(|e| format!("invalid pattern: {e}"));

    match assertion {
        TestAssertion::Run { args } => runner.run(&expand_all(args)?).map(|_| ()),
        TestAssertion::Output { args, pattern } => {
            let re = compile(pattern)?;
            let output = runner.run(&expand_all(args)?)?;
            if re.is_match(&output) {
                Ok(())
            } else {
                Err(format!("output did not match /{pattern}/: {}", last_lines(&output, 10)))
            }
        }
        TestAssertion::FileExists { path } => {
            let path = keg.join(placeholders.expand(path)?);
            if std::fs::symlink_metadata(&path).is_ok() {
                Ok(())
            } else {
                Err(format!("{} does not exist", path.display()))
            }
        }
        TestAssertion::FileContains { path, pattern } => {
            let re = compile(pattern)?;
            let path = keg.join(placeholders.expand(path)?);
            let content =
                std::fs::read_to_string(&path).map_err(|e| format!("{}: {e}", path.display()))?;
            if re.is_match(&content) {
                Ok(())
            } else {
                Err(format!("{} does not match /{pattern}/", path.display()))
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn formula(tests: &str) -> Formula {
        Formula::parse(&format!(
            r#"
[package]
name = "redis@5"
version = "5.0.14"

[source]
url = "https://download.redis.io/releases/redis-5.0.14.tar.gz"
sha256 = "3ea5024766d983249e80d4aa9457c897a9f079957d0fb1f35682df233f997f32"

{tests}
"#
        ))
        .unwrap()
    }

    fn keg() -> tempfile::TempDir {
        let keg = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(keg.path().join("bin")).unwrap();
        std::fs::create_dir_all(keg.path().join("etc")).unwrap();
        let cli = keg.path().join("bin/redis-cli");
        std::fs::write(&cli, "#!/bin/sh\necho \"redis-cli 5.0.14\"\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&cli, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        std::fs::write(keg.path().join("etc/redis.conf"), "daemonize no\n").unwrap();
        keg
    }

    #[test]
    fn test_all_assertions_pass() {
        let keg = keg();
        let f = formula(
            r#"
[[test]]
kind = "output"
args = ["{{bin}}/redis-cli", "--version"]
pattern = "redis-cli 5\\.0\\.14"

[[test]]
kind = "run"
args = ["sh", "-c", "touch {{testpath}}/ok && redis-cli"]

[[test]]
kind = "file-exists"
path = "etc/redis.conf"

[[test]]
kind = "file-contains"
path = "{{prefix}}/etc/redis.conf"
pattern = "^daemonize"
"#,
        );
        let report = run_tests(&f, keg.path(), Duration::from_secs(30)).unwrap();
        assert_eq!(report.results.len(), 4);
        assert!(report.passed(), "{:?}", report.results);
    }

    #[test]
    fn test_failures_are_reported_per_assertion() {
        let keg = keg();
        let f = formula(
            r#"
[[test]]
kind = "run"
args = ["sh", "-c", "echo boom >&2; exit 4"]

[[test]]
kind = "file-exists"
path = "bin/redis-server"

[[test]]
kind = "output"
args = ["redis-cli"]
pattern = "6\\.0"
"#,
        );
        let report = run_tests(&f, keg.path(), Duration::from_secs(30)).unwrap();
        assert!(!report.passed());
        let failed: Vec<usize> = report.failures().map(|r| r.index).collect();
        assert_eq!(failed, vec![0, 1, 2]);
        assert!(report.results[0].detail.contains("exit code 4"));
        assert!(report.results[0].detail.contains("boom"));
    }

    #[test]
    fn test_no_assertions_passes() {
        let keg = keg();
        let report = run_tests(&formula(""), keg.path(), Duration::from_secs(5)).unwrap();
        assert!(report.passed());
        assert!(report.results.is_empty());
    }
}
