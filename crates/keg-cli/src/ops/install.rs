//! Package installation operations.
//!
//! The main entry point is [`install_packages`]: resolve the targets into a
//! plan, then walk it layer by layer. Packages within a layer run
//! concurrently (bounded by `config.packages`); a layer only starts once the
//! previous one has settled, so every build finds its dependencies linked.
//!
//! Per package the pipeline is fetch, unpack, build, link, test. Only the
//! link phase touches the shared prefix, and it runs under the prefix lock
//! so two links never interleave, within this process or across processes.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use keg_core::Reporter;
use keg_core::builder::{self, BuildContext, BuildDirs, BuildSettings};
use keg_core::io::FetchedSource;
use keg_core::io::extract::{self, ExtractError};
use keg_core::receipt::Receipt;
use keg_core::reporter::Phase;
use keg_core::resolver::{PlanEntry, ResolutionPlan, ResolveOptions, resolve};
use keg_core::tester;
use keg_schema::{DependencyKind, PackageName};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::context::Context;
use super::error::InstallError;

/// What the user asked for.
#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    pub targets: Vec<PackageName>,
    /// Build the targets from their development source.
    pub head: bool,
    /// Variants enabled on the targets.
    pub variants: BTreeSet<String>,
}

/// Per-package outcome of an install run.
#[derive(Debug, Default)]
pub struct InstallSummary {
    pub installed: Vec<Receipt>,
    pub already_installed: Vec<PackageName>,
    pub failed: Vec<(PackageName, InstallError)>,
    /// Skipped package and the failed dependency that caused it.
    pub skipped: Vec<(PackageName, PackageName)>,
    /// Installed packages whose smoke tests did not pass.
    pub test_failures: Vec<PackageName>,
}

impl InstallSummary {
    /// Exit code of the first failure, if any.
    pub fn exit_code(&self) -> Option<u8> {
        self.failed.first().map(|(_, e)| e.exit_code())
    }
}

enum Outcome {
    Installed { receipt: Receipt, tests_passed: bool },
    AlreadyInstalled,
}

/// Resolves, builds and installs `request.targets` with their dependencies.
///
/// Returns an error only when resolution fails; per-package failures are
/// collected in the summary so independent packages still complete.
pub async fn install_packages(
    ctx: &Context,
    request: &InstallRequest,
) -> Result<InstallSummary, InstallError> {
    let start_time = Instant::now();

    let options = ResolveOptions {
        head: request.head,
        variants: request.variants.clone(),
    };
    let plan = Arc::new(resolve(&ctx.formulas, &request.targets, &options)?);
    tracing::debug!("resolved plan: {:?}", plan.names());

    let items: Vec<(PackageName, String)> = plan
        .entries()
        .iter()
        .map(|e| (e.name().clone(), e.formula.pkg_version()))
        .collect();
    ctx.reporter.section("Installing");
    ctx.reporter.prepare_pipeline(&items);

    let semaphore = Arc::new(Semaphore::new(ctx.config.packages.max(1)));
    // Failed or skipped package -> the failure at the root of it.
    let mut failed_roots: HashMap<PackageName, PackageName> = HashMap::new();
    let mut summary = InstallSummary::default();

    for layer in plan.layers() {
        let mut set: JoinSet<(PlanEntry, Result<Outcome, InstallError>)> = JoinSet::new();

        for name in layer {
            let Some(entry) = plan.get(name.as_str()).cloned() else {
                continue;
            };
            let version = entry.formula.pkg_version();

            let root = entry
                .dependencies
                .iter()
                .find_map(|(dep, _)| failed_roots.get(dep))
                .cloned();
            if let Some(root) = root {
                ctx.reporter.skipped(&name, &version, &root);
                failed_roots.insert(name.clone(), root.clone());
                summary.skipped.push((name, root));
                continue;
            }

            if ctx.cancel.is_cancelled() {
                ctx.reporter.failed(&name, &version, "cancelled");
                failed_roots.insert(name.clone(), name.clone());
                summary.failed.push((name, InstallError::Cancelled));
                continue;
            }

            let ctx = ctx.clone();
            let plan = Arc::clone(&plan);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = if ctx.cancel.is_cancelled() {
                    Err(InstallError::Cancelled)
                } else {
                    install_one(&ctx, &plan, &entry).await
                };
                (entry, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (entry, result) =
                joined.map_err(|e| InstallError::context("install task panicked", e))?;
            let name = entry.name().clone();
            let version = entry.formula.pkg_version();

            match result {
                Ok(Outcome::Installed {
                    receipt,
                    tests_passed,
                }) => {
                    let detail = if receipt.keg_only {
                        "installed (keg-only)"
                    } else {
                        "installed"
                    };
                    ctx.reporter.done(&name, &version, detail);
                    if !tests_passed {
                        summary.test_failures.push(name);
                    }
                    summary.installed.push(receipt);
                }
                Ok(Outcome::AlreadyInstalled) => {
                    ctx.reporter.done(&name, &version, "already installed");
                    summary.already_installed.push(name);
                }
                Err(e) => {
                    tracing::debug!("{name} failed: {e:?}");
                    ctx.reporter.failed(&name, &version, &e.to_string());
                    failed_roots.insert(name.clone(), name.clone());
                    summary.failed.push((name, e));
                }
            }
        }
    }

    if !summary.installed.is_empty() {
        ctx.reporter.summary(
            summary.installed.len(),
            "install",
            start_time.elapsed().as_secs_f64(),
        );
    }

    Ok(summary)
}

async fn install_one(
    ctx: &Context,
    plan: &ResolutionPlan,
    entry: &PlanEntry,
) -> Result<Outcome, InstallError> {
    let formula = Arc::clone(&entry.formula);
    let name = entry.name().clone();
    let version = formula.pkg_version();
    let variants: Vec<String> = entry.variants.iter().cloned().collect();

    if let Some((_, existing)) = ctx.linker.installed(name.as_str())
        && existing.version == version
        && existing.head == entry.head
        && existing.variants == variants
    {
        return Ok(Outcome::AlreadyInstalled);
    }

    // Fetch
    ctx.reporter.phase(&name, &version, Phase::Fetch);
    let locator = formula.locator(entry.head)?;
    let fetched = ctx
        .cache
        .fetch(&name, &version, &locator, &ctx.reporter)
        .await
        .map_err(|source| InstallError::Fetch {
            name: name.clone(),
            source,
        })?;

    let scratch = tempfile::Builder::new()
        .prefix(&format!("{name}-"))
        .tempdir_in(ctx.layout.tmp_path())?;
    let work_dir = scratch.path().to_path_buf();
    let source_dir = unpack(&fetched, work_dir.join("src"))
        .await?
        .map_err(|source| InstallError::Extract {
            name: name.clone(),
            source,
        })?;

    // Build
    let mut dependencies = Vec::new();
    for dep in plan.build_closure(name.as_str()) {
        let (keg, _) = ctx
            .linker
            .installed(dep.as_str())
            .ok_or_else(|| InstallError::context("dependency is not installed", &dep))?;
        dependencies.push((dep, keg));
    }

    let dirs = BuildDirs {
        stage_dir: work_dir.join("stage"),
        prefix: ctx.layout.keg_path(name.as_str(), &version),
        shared_prefix: ctx.layout.prefix().to_path_buf(),
        log_dir: ctx.layout.build_log_dir(name.as_str(), &version),
        work_dir,
        source_dir,
    };
    let build_ctx = BuildContext::new(
        &formula,
        dirs,
        dependencies,
        &BuildSettings::from_config(&ctx.config),
    )
    .map_err(|source| InstallError::Build {
        name: name.clone(),
        source,
    })?;

    ctx.reporter.phase(&name, &version, Phase::Build);
    let built = {
        let formula = Arc::clone(&formula);
        let reporter = Arc::clone(&ctx.reporter);
        let build_ctx = build_ctx.clone();
        tokio::task::spawn_blocking(move || builder::build(&formula, &build_ctx, &reporter))
            .await
            .map_err(|e| InstallError::context("build task panicked", e))?
    };
    if let Err(source) = built {
        retain_scratch(ctx, scratch, &name);
        return Err(InstallError::Build { name, source });
    }

    // Link
    ctx.reporter.phase(&name, &version, Phase::Link);
    let receipt = Receipt {
        name: name.clone(),
        version: version.clone(),
        head: entry.head,
        source: format!("{} {}", locator.url(), fetched.provenance()),
        variants,
        runtime_dependencies: entry
            .dependencies
            .iter()
            .filter(|(_, kind)| *kind != DependencyKind::Build)
            .map(|(dep, _)| dep.clone())
            .collect(),
        requested: entry.requested,
        keg_only: formula.is_keg_only(),
        installed_at: String::new(),
        files: Vec::new(),
        links: Vec::new(),
    };
    let linked = link(ctx, &name, &build_ctx.dirs.staged_prefix(), receipt).await;
    let receipt = match linked {
        Ok(receipt) => receipt,
        Err(e) => {
            retain_scratch(ctx, scratch, &name);
            return Err(e);
        }
    };
    drop(scratch);

    // Test
    let tests_passed = if formula.test.is_empty() {
        true
    } else {
        ctx.reporter.phase(&name, &version, Phase::Test);
        let keg = ctx.layout.keg_path(name.as_str(), &version);
        let timeout = ctx.config.step_timeout();
        let tested = {
            let formula = Arc::clone(&formula);
            tokio::task::spawn_blocking(move || tester::run_tests(&formula, &keg, timeout))
                .await
                .map_err(|e| InstallError::context("test task panicked", e))?
        };
        match tested {
            Ok(report) => {
                for failure in report.failures() {
                    ctx.reporter.warning(&format!(
                        "{name}: test failed: {} ({})",
                        failure.description, failure.detail
                    ));
                }
                report.passed()
            }
            Err(e) => {
                ctx.reporter
                    .warning(&format!("{name}: could not run tests: {e}"));
                false
            }
        }
    };

    Ok(Outcome::Installed {
        receipt,
        tests_passed,
    })
}

/// Unpack an archive, or copy a checkout without its `.git` directory.
async fn unpack(
    fetched: &FetchedSource,
    dest: PathBuf,
) -> Result<Result<PathBuf, ExtractError>, InstallError> {
    let fetched = fetched.clone();
    tokio::task::spawn_blocking(move || -> Result<PathBuf, ExtractError> {
        match &fetched {
            FetchedSource::Archive { path, filename, .. } => {
                extract::unpack_source(path, filename, &dest)
            }
            FetchedSource::Checkout { path, .. } => {
                std::fs::create_dir_all(&dest)?;
                builder::copy_dir_all(path, &dest)?;
                let git_dir = dest.join(".git");
                if git_dir.exists() {
                    std::fs::remove_dir_all(git_dir)?;
                }
                Ok(dest)
            }
        }
    })
    .await
    .map_err(|e| InstallError::context("unpack task panicked", e))
}

/// Move the stage into the Cellar, link it and record it, all under the
/// prefix lock.
async fn link(
    ctx: &Context,
    name: &PackageName,
    stage: &Path,
    receipt: Receipt,
) -> Result<Receipt, InstallError> {
    let ctx = ctx.clone();
    let name = name.clone();
    let stage = stage.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Receipt, InstallError> {
        let mut db = ctx.lock_prefix()?;
        let receipt = ctx
            .linker
            .install(&stage, receipt)
            .map_err(|source| InstallError::Link {
                name: name.clone(),
                source,
            })?;
        let keg = ctx.layout.keg_path(name.as_str(), &receipt.version);
        db.record_install(&receipt, &keg)?;
        Ok(receipt)
    })
    .await
    .map_err(|e| InstallError::context("link task panicked", e))?
}

fn retain_scratch(ctx: &Context, scratch: TempDir, name: &PackageName) {
    if ctx.config.keep_failed_builds {
        let path = scratch.keep();
        ctx.reporter.info(&format!(
            "{name}: build directory kept at {}",
            path.display()
        ));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ops::{Overrides, exit};
    use keg_core::{Layout, NullReporter};
    use sha2::{Digest, Sha256};
    use std::time::Duration;

    /// A home with `base` (slow build, one layer) and `app` depending on it.
    fn home() -> (tempfile::TempDir, Layout) {
        let tmp = tempfile::tempdir().unwrap();
        let layout = Layout::new(tmp.path().join("home"));
        std::fs::create_dir_all(layout.formula_dir()).unwrap();

        for (name, deps, build) in [
            ("base", "", "sleep 1"),
            ("app", r#"dependencies = ["base"]"#, "true"),
        ] {
            let src = tmp.path().join(format!("{name}.txt"));
            std::fs::write(&src, format!("{name}\n")).unwrap();
            let sha256 = hex::encode(Sha256::digest(std::fs::read(&src).unwrap()));
            let formula = format!(
                r#"{deps}

[package]
name = "{name}"
version = "1.0"

[source]
url = "file://{src}"
sha256 = "{sha256}"

[[steps]]
kind = "run"
args = ["sh", "-c", "{build}"]

[[steps]]
kind = "copy"
from = "{name}.txt"
to = "bin/{name}"

[[steps]]
kind = "copy"
from = "{name}.txt"
to = "share/{name}/README"
"#,
                src = src.display()
            );
            std::fs::write(layout.formula_dir().join(format!("{name}.toml")), formula).unwrap();
        }
        (tmp, layout)
    }

    fn context(layout: &Layout) -> Context {
        Context::load_at(layout.clone(), &Overrides::default(), Arc::new(NullReporter)).unwrap()
    }

    fn request(name: &str) -> InstallRequest {
        InstallRequest {
            targets: vec![PackageName::new(name)],
            ..InstallRequest::default()
        }
    }

    #[tokio::test]
    async fn test_cancel_during_first_layer_stops_dispatch() {
        let (_tmp, layout) = home();
        let ctx = context(&layout);

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        });

        let summary = install_packages(&ctx, &request("app")).await.unwrap();

        // The in-flight build finished and was linked completely.
        assert_eq!(summary.installed.len(), 1);
        let receipt = &summary.installed[0];
        assert_eq!(receipt.name.as_str(), "base");
        assert_eq!(receipt.links, vec!["bin/base", "share/base/README"]);
        for link in &receipt.links {
            assert!(layout.prefix().join(link).exists(), "{link}");
        }

        // The next layer was never started.
        assert_eq!(summary.failed.len(), 1);
        let (name, err) = &summary.failed[0];
        assert_eq!(name.as_str(), "app");
        assert!(matches!(err, InstallError::Cancelled));
        assert!(!layout.rack("app").exists());
        assert!(!layout.prefix().join("bin/app").exists());
        assert_eq!(summary.exit_code(), Some(exit::OTHER));
    }

    #[tokio::test]
    async fn test_cancel_before_start_installs_nothing() {
        let (_tmp, layout) = home();
        let ctx = context(&layout);
        ctx.cancel.cancel();

        let summary = install_packages(&ctx, &request("app")).await.unwrap();

        assert!(summary.installed.is_empty());
        let failed: Vec<&str> = summary.failed.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(failed, vec!["base"]);
        assert!(matches!(summary.failed[0].1, InstallError::Cancelled));
        // The dependent is skipped rather than attempted.
        assert_eq!(summary.skipped.len(), 1);
        assert!(!layout.cellar().join("base").exists());
        assert!(!layout.prefix().join("bin").exists());
    }
}
