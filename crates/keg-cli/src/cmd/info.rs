//! Info command

use std::sync::Arc;

use anyhow::{Result, bail};
use crossterm::style::Stylize;
use keg_core::NullReporter;
use keg_schema::{DependencyKind, DependencySpec};

use crate::ops::{Context, Overrides};

/// Show a formula's metadata and, when installed, its keg.
pub fn info(formula: &str, overrides: &Overrides) -> Result<()> {
    let ctx = Context::load(overrides, Arc::new(NullReporter))?;
    let definition = ctx.formulas.get(formula);
    let installed = ctx.linker.installed(formula);

    if definition.is_none() && installed.is_none() {
        bail!("No formula named '{formula}'");
    }

    let lw = 12;
    println!();
    if let Some(f) = definition {
        println!(
            "  {} {}",
            f.name().as_str().white().bold(),
            f.pkg_version().dark_grey()
        );
        if !f.package.description.is_empty() {
            println!("  {}", f.package.description);
        }
        println!();
        if !f.package.homepage.is_empty() {
            println!("  {:<lw$}{}", "homepage", f.package.homepage);
        }
        if !f.package.license.is_empty() {
            println!("  {:<lw$}{}", "license", f.package.license);
        }
        if let Ok(locator) = f.locator(false) {
            println!("  {:<lw$}{locator}", "source");
        }
        if f.head.is_some() {
            println!("  {:<lw$}available", "head");
        }
        if let Some(reason) = &f.package.keg_only {
            println!("  {:<lw$}{reason}", "keg-only");
        }
        if let Some(disabled) = &f.package.disabled {
            println!("  {:<lw$}{}", "disabled", disabled.because);
        }
        for (label, kind) in [
            ("requires", DependencyKind::Runtime),
            ("build deps", DependencyKind::Build),
            ("optional", DependencyKind::Optional),
        ] {
            let deps: Vec<String> = f
                .dependencies
                .iter()
                .filter(|d| d.kind == kind)
                .map(describe_dependency)
                .collect();
            if !deps.is_empty() {
                println!("  {:<lw$}{}", label, deps.join(", "));
            }
        }
        let variants = f.declared_variants();
        if !variants.is_empty() {
            let list: Vec<&str> = variants.iter().map(String::as_str).collect();
            println!("  {:<lw$}{}", "variants", list.join(", "));
        }
    }

    match installed {
        Some((keg, receipt)) => {
            let date = chrono::DateTime::parse_from_rfc3339(&receipt.installed_at)
                .map(|dt| dt.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            println!();
            println!(
                "  {:<lw$}{} ({} files, {} links), {}",
                "installed",
                receipt.version,
                receipt.files.len(),
                receipt.links.len(),
                date
            );
            println!("  {:<lw$}{}", "keg", keg.display());
            println!("  {:<lw$}{}", "from", receipt.source);
            if !receipt.variants.is_empty() {
                println!("  {:<lw$}{}", "built with", receipt.variants.join(", "));
            }

            let db = ctx.lock_db()?;
            if db.get_keg(formula)?.is_none() {
                println!("  {}", "not recorded in state.db".yellow());
            } else {
                let links = db.links_for(formula)?;
                println!("  {:<lw$}{} file(s) tracked", "state", db.file_count(formula)?);
                for link in links {
                    println!("  {:<lw$}{}", "", link.dark_grey());
                }
            }
        }
        None => {
            println!();
            println!("  {:<lw$}{}", "installed", "no".dark_grey());
        }
    }

    Ok(())
}

fn describe_dependency(dep: &DependencySpec) -> String {
    match &dep.version {
        Some(req) => format!("{} ({req})", dep.name),
        None => dep.name.to_string(),
    }
}
