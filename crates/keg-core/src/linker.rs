//! Install linker.
//!
//! Moves a finished stage into its keg (`Cellar/<name>/<version>`) and
//! exposes the keg's files in the shared prefix through relative symlinks,
//! e.g. `bin/redis-server -> ../Cellar/redis@5/5.0.14/bin/redis-server`.
//!
//! Linking is two-phase. A plan is computed and checked for conflicts before
//! anything on disk changes; it is then applied with a journal so that an
//! I/O failure half way through restores the previous state. Ownership of an
//! existing link is read from its target: a link resolving into
//! `Cellar/<name>/...` belongs to `<name>`, anything else is unmanaged.

use std::path::{Component, Path, PathBuf};

use keg_schema::PackageName;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::builder::{copy_dir_all, relative_path};
use crate::paths::Layout;
use crate::receipt::{Receipt, hash_keg_files};

/// Keg subdirectories whose contents are linked into the shared prefix.
pub const LINKABLE_DIRS: &[&str] = &["bin", "sbin", "lib", "include", "share", "etc", "Frameworks"];

/// Owner reported for prefix paths no keg claims.
pub const UNMANAGED: &str = "unmanaged";

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("{} already exists (owned by {owner})", path.display())]
    Conflict { path: PathBuf, owner: String },

    #[error("{0} is not installed")]
    NotInstalled(String),

    #[error("IO error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LinkError + '_ {
    move |source| LinkError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are only supported on unix",
    ))
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// One link the plan will create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedLink {
    /// Absolute path in the shared prefix.
    pub link: PathBuf,
    /// Relative target written into the link.
    pub target: PathBuf,
    /// Target of a same-name link being replaced.
    pub replaces: Option<PathBuf>,
}

/// Conflict-free set of links for one keg.
#[derive(Debug, Clone, Default)]
pub struct LinkPlan {
    /// Links in creation order.
    pub links: Vec<PlannedLink>,
}

enum JournalEntry {
    Dir(PathBuf),
    Link {
        link: PathBuf,
        previous: Option<PathBuf>,
    },
}

/// Moves stages into the Cellar and maintains the shared prefix.
#[derive(Debug, Clone)]
pub struct Linker {
    layout: Layout,
}

impl Linker {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Package owning the symlink at `path`, as `(name, version)`.
    /// `None` for anything that is not a link into the Cellar.
    pub fn link_owner(&self, path: &Path) -> Option<(String, String)> {
        let target = std::fs::read_link(path).ok()?;
        let absolute = normalize(&path.parent()?.join(target));
        let rest = absolute.strip_prefix(self.layout.cellar()).ok()?;
        let mut parts = rest.components();
        let name = parts.next()?.as_os_str().to_string_lossy().into_owned();
        let version = parts.next()?.as_os_str().to_string_lossy().into_owned();
        Some((name, version))
    }

    /// Every keg of `name` that has a receipt, oldest version first.
    pub fn installed_kegs(&self, name: &str) -> Vec<(PathBuf, Receipt)> {
        let Ok(entries) = std::fs::read_dir(self.layout.rack(name)) else {
            return Vec::new();
        };
        let mut kegs: Vec<(PathBuf, Receipt)> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter_map(|p| Receipt::load(&p).ok().map(|r| (p, r)))
            .collect();
        kegs.sort_by(|a, b| {
            keg_schema::Version::new(&a.1.version).cmp(&keg_schema::Version::new(&b.1.version))
        });
        kegs
    }

    /// The current keg of `name`.
    pub fn installed(&self, name: &str) -> Option<(PathBuf, Receipt)> {
        self.installed_kegs(name).pop()
    }

    /// Compute the links `tree` would get once it lives at `keg`.
    ///
    /// `tree` is scanned (it may still be the stage); targets are computed
    /// against `keg`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Conflict`] for the first shared path that exists
    /// and is not a link owned by `name`.
    pub fn plan(&self, name: &PackageName, tree: &Path, keg: &Path) -> Result<LinkPlan, LinkError> {
        let prefix = self.layout.prefix();
        let mut plan = LinkPlan::default();

        for dir in LINKABLE_DIRS {
            let root = tree.join(dir);
            if !root.is_dir() {
                continue;
            }
            for entry in walkdir::WalkDir::new(&root).sort_by_file_name() {
                let entry = entry.map_err(|e| LinkError::Io {
                    path: root.clone(),
                    source: std::io::Error::other(e),
                })?;
                if entry.file_type().is_dir() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(tree) else {
                    continue;
                };

                let link = prefix.join(rel);
                let Some(link_dir) = link.parent() else {
                    continue;
                };
                let target = relative_path(link_dir, &keg.join(rel));

                let replaces = match std::fs::symlink_metadata(&link) {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                    Err(e) => return Err(io_err(&link)(e)),
                    Ok(meta) if meta.file_type().is_symlink() => match self.link_owner(&link) {
                        Some((owner, _)) if owner == name.as_str() => {
                            Some(std::fs::read_link(&link).map_err(io_err(&link))?)
                        }
                        Some((owner, _)) => return Err(LinkError::Conflict { path: link, owner }),
                        None => {
                            return Err(LinkError::Conflict {
                                path: link,
                                owner: UNMANAGED.to_string(),
                            });
                        }
                    },
                    Ok(_) => {
                        return Err(LinkError::Conflict {
                            path: link,
                            owner: UNMANAGED.to_string(),
                        });
                    }
                };

                plan.links.push(PlannedLink {
                    link,
                    target,
                    replaces,
                });
            }
        }

        Ok(plan)
    }

    /// Create every link of `plan`. On failure, links created so far are
    /// removed, replaced links are restored and new directories pruned.
    ///
    /// # Errors
    ///
    /// Returns the I/O error that interrupted the apply.
    pub fn apply(&self, plan: &LinkPlan) -> Result<(), LinkError> {
        Self::apply_with_journal(plan).map(|_| ())
    }

    /// Like [`Linker::apply`], returning the journal so a later failure can
    /// still undo the links.
    fn apply_with_journal(plan: &LinkPlan) -> Result<Vec<JournalEntry>, LinkError> {
        let mut journal = Vec::new();
        match Self::apply_journaled(plan, &mut journal) {
            Ok(()) => Ok(journal),
            Err(e) => {
                warn!("link failed, rolling back {} changes: {e}", journal.len());
                Self::rollback(journal);
                Err(e)
            }
        }
    }

    fn apply_journaled(plan: &LinkPlan, journal: &mut Vec<JournalEntry>) -> Result<(), LinkError> {
        for planned in &plan.links {
            if let Some(parent) = planned.link.parent() {
                let mut missing = Vec::new();
                let mut cursor = Some(parent);
                while let Some(dir) = cursor {
                    if dir.exists() {
                        break;
                    }
                    missing.push(dir.to_path_buf());
                    cursor = dir.parent();
                }
                for dir in missing.into_iter().rev() {
                    std::fs::create_dir(&dir).map_err(io_err(&dir))?;
                    journal.push(JournalEntry::Dir(dir));
                }
            }

            if planned.replaces.is_some() {
                std::fs::remove_file(&planned.link).map_err(io_err(&planned.link))?;
            }
            journal.push(JournalEntry::Link {
                link: planned.link.clone(),
                previous: planned.replaces.clone(),
            });
            symlink(&planned.target, &planned.link).map_err(io_err(&planned.link))?;
        }
        Ok(())
    }

    fn rollback(journal: Vec<JournalEntry>) {
        for entry in journal.into_iter().rev() {
            match entry {
                JournalEntry::Dir(dir) => {
                    let _ = std::fs::remove_dir(&dir);
                }
                JournalEntry::Link { link, previous } => {
                    if std::fs::symlink_metadata(&link).is_ok() {
                        let _ = std::fs::remove_file(&link);
                    }
                    if let Some(previous) = previous {
                        if let Err(e) = symlink(&previous, &link) {
                            warn!("could not restore {}: {e}", link.display());
                        }
                    }
                }
            }
        }
    }

    /// Install a finished stage.
    ///
    /// `receipt` carries the build metadata; its files, links and timestamp
    /// are filled in here and the completed receipt is written into the keg.
    /// Other versions of the same formula are unlinked and removed once the
    /// new keg is in place.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Conflict`] before anything is moved, or an I/O
    /// error after rolling back.
    pub fn install(&self, stage: &Path, mut receipt: Receipt) -> Result<Receipt, LinkError> {
        let name = receipt.name.clone();
        let keg = self.layout.keg_path(name.as_str(), &receipt.version);
        let previous = self.installed_kegs(name.as_str());

        let plan = if receipt.keg_only {
            LinkPlan::default()
        } else {
            self.plan(&name, stage, &keg)?
        };

        // Reinstalling the same version: park the old keg until the new one
        // is linked.
        let parked = if keg.exists() {
            let aside = keg.with_file_name(format!(".{}.previous-{}", receipt.version, std::process::id()));
            std::fs::rename(&keg, &aside).map_err(io_err(&keg))?;
            Some(aside)
        } else {
            None
        };

        let restore = |keg: &Path| {
            let _ = std::fs::remove_dir_all(keg);
            if let Some(aside) = &parked {
                let _ = std::fs::rename(aside, keg);
            }
        };

        if let Err(e) = move_dir(stage, &keg) {
            restore(&keg);
            return Err(io_err(&keg)(e));
        }
        let journal = match Self::apply_with_journal(&plan) {
            Ok(journal) => journal,
            Err(e) => {
                restore(&keg);
                return Err(e);
            }
        };

        let prefix = self.layout.prefix();
        receipt.links = plan
            .links
            .iter()
            .filter_map(|l| l.link.strip_prefix(prefix).ok())
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        receipt.installed_at = chrono::Utc::now().to_rfc3339();
        // Without a receipt nothing could reclaim the links later.
        let recorded = hash_keg_files(&keg).and_then(|files| {
            receipt.files = files;
            receipt.save(&keg)
        });
        if let Err(e) = recorded {
            warn!("could not write receipt for {name}, rolling back {} changes: {e}", journal.len());
            Self::rollback(journal);
            restore(&keg);
            return Err(io_err(&keg)(e));
        }

        for (old_keg, old) in previous {
            let removed = self.remove_links(&old, &old_keg, &receipt.links);
            debug!("removed {removed} stale links of {} {}", old.name, old.version);
            if old_keg != keg {
                std::fs::remove_dir_all(&old_keg).map_err(io_err(&old_keg))?;
            }
        }
        if let Some(aside) = parked {
            std::fs::remove_dir_all(&aside).map_err(io_err(&aside))?;
        }

        self.link_opt(&name, &keg)?;
        info!("installed {} {} ({} links)", name, receipt.version, receipt.links.len());
        Ok(receipt)
    }

    /// Point `opt/<name>` at `keg`.
    fn link_opt(&self, name: &PackageName, keg: &Path) -> Result<(), LinkError> {
        let opt_dir = self.layout.prefix().join("opt");
        std::fs::create_dir_all(&opt_dir).map_err(io_err(&opt_dir))?;
        let link = opt_dir.join(name.as_str());
        if std::fs::symlink_metadata(&link).is_ok() {
            std::fs::remove_file(&link).map_err(io_err(&link))?;
        }
        symlink(&relative_path(&opt_dir, keg), &link).map_err(io_err(&link))
    }

    /// Remove `receipt`'s links that still point into `keg`, except those in
    /// `keep`, pruning directories left empty. Returns how many were removed.
    fn remove_links(&self, receipt: &Receipt, keg: &Path, keep: &[String]) -> usize {
        let prefix = self.layout.prefix();
        let mut removed = 0;
        for rel in receipt.links.iter().filter(|l| !keep.contains(l)) {
            let link = prefix.join(rel);
            let Ok(target) = std::fs::read_link(&link) else {
                continue;
            };
            let Some(parent) = link.parent() else {
                continue;
            };
            if !normalize(&parent.join(target)).starts_with(keg) {
                continue;
            }
            if std::fs::remove_file(&link).is_ok() {
                removed += 1;
                prune_empty_dirs(parent, prefix);
            }
        }
        removed
    }

    /// Remove every keg of `name` and the links pointing into them.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::NotInstalled`] if no keg exists.
    pub fn uninstall(&self, name: &str) -> Result<Vec<Receipt>, LinkError> {
        let kegs = self.installed_kegs(name);
        if kegs.is_empty() {
            return Err(LinkError::NotInstalled(name.to_string()));
        }

        let mut removed = Vec::new();
        for (keg, receipt) in kegs {
            let count = self.remove_links(&receipt, &keg, &[]);
            debug!("unlinked {count} paths for {} {}", receipt.name, receipt.version);
            std::fs::remove_dir_all(&keg).map_err(io_err(&keg))?;
            removed.push(receipt);
        }

        let opt = self.layout.prefix().join("opt").join(name);
        if std::fs::read_link(&opt).is_ok() {
            std::fs::remove_file(&opt).map_err(io_err(&opt))?;
            prune_empty_dirs(&self.layout.prefix().join("opt"), self.layout.prefix());
        }
        let rack = self.layout.rack(name);
        let _ = std::fs::remove_dir(&rack);

        Ok(removed)
    }
}

/// Remove `dir` and its ancestors while they are empty, stopping at `stop`.
fn prune_empty_dirs(dir: &Path, stop: &Path) {
    let mut cursor = Some(dir);
    while let Some(d) = cursor {
        if d == stop || !d.starts_with(stop) {
            break;
        }
        if std::fs::remove_dir(d).is_err() {
            break;
        }
        cursor = d.parent();
    }
}

/// Rename `from` to `to`, copying across filesystems when rename fails.
fn move_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("rename {} failed ({e}), copying", from.display());
            std::fs::create_dir_all(to)?;
            copy_dir_all(from, to)?;
            std::fs::remove_dir_all(from)
        }
    }
}
