//! Running a formula's smoke tests against its installed keg.

use std::sync::Arc;

use keg_core::Reporter;
use keg_core::reporter::Phase;
use keg_core::tester::{self, TestReport};
use keg_schema::PackageName;

use super::context::Context;
use super::error::InstallError;

/// Run the assertions of `name` against its current keg.
///
/// Every assertion is reported; the error carries the failure count.
pub async fn test_package(ctx: &Context, name: &PackageName) -> Result<TestReport, InstallError> {
    let (keg, receipt) = ctx
        .linker
        .installed(name.as_str())
        .ok_or_else(|| InstallError::NotInstalled(name.to_string()))?;
    let formula = Arc::clone(ctx.formulas.get(name.as_str()).ok_or_else(|| {
        InstallError::Other(format!("no formula found for installed package {name}"))
    })?);

    if formula.pkg_version() != receipt.version {
        ctx.reporter.warning(&format!(
            "{name}: installed {} but the formula is at {}",
            receipt.version,
            formula.pkg_version()
        ));
    }

    ctx.reporter.phase(name, &receipt.version, Phase::Test);
    let timeout = ctx.config.step_timeout();
    let report = tokio::task::spawn_blocking(move || tester::run_tests(&formula, &keg, timeout))
        .await
        .map_err(|e| InstallError::context("test task panicked", e))??;

    for result in &report.results {
        if result.passed {
            ctx.reporter.info(&format!("passed: {}", result.description));
        } else {
            ctx.reporter.warning(&format!(
                "failed: {} ({})",
                result.description, result.detail
            ));
        }
    }

    let failed = report.failures().count();
    if failed > 0 {
        ctx.reporter
            .failed(name, &receipt.version, &format!("{failed} assertion(s) failed"));
        return Err(InstallError::TestFailed {
            name: name.clone(),
            failed,
            total: report.results.len(),
        });
    }

    let detail = if report.results.is_empty() {
        "no assertions"
    } else {
        "tests passed"
    };
    ctx.reporter.done(name, &receipt.version, detail);
    Ok(report)
}
