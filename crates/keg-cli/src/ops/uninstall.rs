//! Package removal.

use keg_core::Reporter;
use keg_core::receipt::Receipt;
use keg_schema::PackageName;

use super::context::Context;
use super::error::InstallError;
use crate::store::DbError;

/// Installed packages whose receipts list `name` as a runtime dependency.
pub fn dependents_of(ctx: &Context, name: &PackageName) -> Vec<PackageName> {
    let Ok(racks) = std::fs::read_dir(ctx.layout.cellar()) else {
        return Vec::new();
    };
    let mut dependents: Vec<PackageName> = racks
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|rack| rack != name.as_str())
        .filter_map(|rack| ctx.linker.installed(&rack))
        .filter(|(_, receipt)| receipt.runtime_dependencies.contains(name))
        .map(|(_, receipt)| receipt.name)
        .collect();
    dependents.sort();
    dependents
}

/// Remove `name`: its links, its keg and its database records.
///
/// Refuses while other installed packages depend on it at runtime, unless
/// `ignore_dependencies` is set.
pub async fn uninstall_package(
    ctx: &Context,
    name: &PackageName,
    ignore_dependencies: bool,
) -> Result<Vec<Receipt>, InstallError> {
    let Some((_, current)) = ctx.linker.installed(name.as_str()) else {
        return Err(InstallError::NotInstalled(name.to_string()));
    };

    let dependents = dependents_of(ctx, name);
    if !dependents.is_empty() && !ignore_dependencies {
        let list: Vec<&str> = dependents.iter().map(PackageName::as_str).collect();
        return Err(InstallError::Other(format!(
            "{name} is required by {}; use --ignore-dependencies to remove it anyway",
            list.join(", ")
        )));
    }

    ctx.reporter.removing(name, &current.version);

    let ctx = ctx.clone();
    let name = name.clone();
    tokio::task::spawn_blocking(move || -> Result<Vec<Receipt>, InstallError> {
        let mut db = ctx.lock_prefix()?;
        let removed = ctx
            .linker
            .uninstall(name.as_str())
            .map_err(|source| InstallError::Link {
                name: name.clone(),
                source,
            })?;
        match db.remove_keg(name.as_str()) {
            Ok(_) | Err(DbError::PackageNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        for receipt in &removed {
            ctx.reporter
                .done(&receipt.name, &receipt.version, "uninstalled");
        }
        Ok(removed)
    })
    .await
    .map_err(|e| InstallError::context("uninstall task panicked", e))?
}
