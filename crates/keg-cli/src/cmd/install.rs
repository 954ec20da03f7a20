//! Install command

use std::sync::Arc;

use anyhow::Result;
use keg_core::Reporter;
use keg_core::builder::BuildError;
use keg_schema::PackageName;
use tokio_util::sync::CancellationToken;

use crate::ops::{Context, InstallError, InstallRequest, Overrides, install_packages};
use crate::ui::Output;

/// Install one or more formulas with their dependencies.
pub async fn install(
    names: &[String],
    head: bool,
    with: &[String],
    overrides: &Overrides,
    quiet: bool,
    cancel: CancellationToken,
) -> Result<()> {
    let output = Output::new(quiet);
    let mut ctx = Context::load(overrides, Arc::new(output.clone()))?;
    ctx.cancel = cancel;

    let request = InstallRequest {
        targets: names.iter().map(|f| PackageName::new(f)).collect(),
        head,
        variants: with.iter().cloned().collect(),
    };

    let summary = match install_packages(&ctx, &request).await {
        Ok(summary) => summary,
        Err(e) => {
            output.wait();
            return Err(e.into());
        }
    };

    for (name, err) in &summary.failed {
        if let InstallError::Build {
            source:
                BuildError::Step {
                    stderr_tail,
                    log_dir,
                    ..
                },
            ..
        } = err
        {
            if !stderr_tail.is_empty() {
                output.error(&format!("{name}: last lines of stderr:\n{stderr_tail}"));
            }
            output.info(&format!("{name}: build logs in {}", log_dir.display()));
        }
    }
    if !summary.test_failures.is_empty() {
        let names: Vec<&str> = summary.test_failures.iter().map(PackageName::as_str).collect();
        output.warning(&format!(
            "tests failed for {}; the installation was kept",
            names.join(", ")
        ));
    }
    output.wait();

    match summary.exit_code() {
        Some(code) => Err(InstallError::Failed {
            count: summary.failed.len() + summary.skipped.len(),
            code,
        }
        .into()),
        None => Ok(()),
    }
}
