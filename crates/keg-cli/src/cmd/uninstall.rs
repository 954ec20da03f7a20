//! Uninstall command

use std::sync::Arc;

use anyhow::Result;
use keg_core::Reporter;
use keg_schema::PackageName;

use crate::ops::{Context, Overrides, uninstall_package};
use crate::ui::Output;

/// Remove an installed formula.
pub async fn uninstall(
    formula: &str,
    ignore_dependencies: bool,
    overrides: &Overrides,
    quiet: bool,
) -> Result<()> {
    let output = Output::new(quiet);
    let ctx = Context::load(overrides, Arc::new(output.clone()))?;
    let name = PackageName::new(formula);

    let result = uninstall_package(&ctx, &name, ignore_dependencies).await;
    if let Ok(removed) = &result {
        let links: usize = removed.iter().map(|r| r.links.len()).sum();
        output.success(&format!("Uninstalled {name} ({links} link(s) removed)"));
    }
    output.wait();
    result.map(|_| ()).map_err(Into::into)
}
