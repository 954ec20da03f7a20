//! List output formatting
//!
//! Column-aligned rendering for `keg list`.

use crossterm::style::Stylize;

use super::theme::Theme;

/// Print column headers for `keg list`
pub fn print_list_header() {
    let theme = Theme::default();
    println!();
    let header = format!(
        "  {:<nw$} {:<vw$} {:<9} {}",
        "name",
        "version",
        "kind",
        "installed",
        nw = theme.layout.name_width,
        vw = theme.layout.version_width,
    );
    println!("{}", header.dark_grey());
}

/// Print a single row for `keg list`
pub fn print_list_row(name: &str, version: &str, keg_only: bool, date: &str) {
    let theme = Theme::default();

    let name_part = format!("{:<width$}", name, width = theme.layout.name_width);
    let version_part = format!("{:<width$}", version, width = theme.layout.version_width);
    let kind = if keg_only { "keg-only" } else { "linked" };

    println!(
        "  {} {} {} {}",
        name_part.with(theme.colors.package_name),
        version_part.with(theme.colors.version),
        format!("{kind:<9}").with(theme.colors.secondary),
        date.with(theme.colors.secondary)
    );
}

/// Print footer for `keg list`
pub fn print_list_footer(count: usize) {
    println!();
    let noun = if count == 1 { "keg" } else { "kegs" };
    println!("{}", format!("  {count} {noun}").dark_grey());
}
