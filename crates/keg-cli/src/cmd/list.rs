//! List command

use anyhow::{Context, Result};
use keg_core::Layout;

use crate::store::StateDb;
use crate::ui::list::{print_list_footer, print_list_header, print_list_row};

/// List installed kegs
pub fn list() -> Result<()> {
    let layout = Layout::from_env().context("Could not determine keg home; set KEG_HOME")?;
    let db_path = layout.db_path();
    if !db_path.exists() {
        println!();
        println!("  No kegs installed.");
        return Ok(());
    }

    let db = StateDb::open_at(&db_path).context("Failed to open state database")?;
    let kegs = db.list_kegs()?;
    if kegs.is_empty() {
        println!();
        println!("  No kegs installed.");
        println!("  Run 'keg install <formula>' to get started.");
        return Ok(());
    }

    print_list_header();
    for keg in &kegs {
        let date = chrono::DateTime::parse_from_rfc3339(&keg.installed_at)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        print_list_row(&keg.name, &keg.version, keg.keg_only, &date);
    }
    print_list_footer(kegs.len());

    Ok(())
}
