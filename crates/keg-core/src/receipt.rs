//! Install receipts.
//!
//! Every keg carries an `INSTALL_RECEIPT.json` recording how it was built and
//! what it contains. The receipt is the source of truth for `keg list` and
//! `keg uninstall` when the state database is missing or stale.

use std::path::{Path, PathBuf};

use keg_schema::{PackageName, RECEIPT_FILE};
use serde::{Deserialize, Serialize};

/// One regular file inside a keg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KegFile {
    /// Path relative to the keg root.
    pub path: String,
    /// BLAKE3 of the contents.
    pub blake3: String,
}

/// Build and link record of one installed keg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Formula name.
    pub name: PackageName,
    /// Package version (with revision suffix when non-zero).
    pub version: String,
    /// Installed from the development source.
    #[serde(default)]
    pub head: bool,
    /// Source provenance: URL and digest, or URL and commit.
    pub source: String,
    /// Variants enabled for this build.
    #[serde(default)]
    pub variants: Vec<String>,
    /// Runtime dependencies at install time.
    #[serde(default)]
    pub runtime_dependencies: Vec<PackageName>,
    /// Installed because the user asked for it, not only as a dependency.
    #[serde(default)]
    pub requested: bool,
    /// Not linked into the shared prefix.
    #[serde(default)]
    pub keg_only: bool,
    /// RFC 3339 install time.
    pub installed_at: String,
    /// Regular files of the keg.
    #[serde(default)]
    pub files: Vec<KegFile>,
    /// Links created in the shared prefix, relative to it.
    #[serde(default)]
    pub links: Vec<String>,
}

impl Receipt {
    /// Path of the receipt inside `keg`.
    pub fn path_in(keg: &Path) -> PathBuf {
        keg.join(RECEIPT_FILE)
    }

    /// Load the receipt of `keg`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or malformed.
    pub fn load(keg: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(Self::path_in(keg))?;
        serde_json::from_slice(&bytes).map_err(std::io::Error::other)
    }

    /// Write the receipt into `keg`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, keg: &Path) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(Self::path_in(keg), json)
    }
}

/// Hash every regular file under `keg`, excluding the receipt itself.
/// Paths are sorted and relative to `keg`.
///
/// # Errors
///
/// Returns an error if a file cannot be read.
pub fn hash_keg_files(keg: &Path) -> std::io::Result<Vec<KegFile>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(keg).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(keg) else {
            continue;
        };
        if rel == Path::new(RECEIPT_FILE) {
            continue;
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update_reader(std::fs::File::open(entry.path())?)?;
        files.push(KegFile {
            path: rel.to_string_lossy().into_owned(),
            blake3: hasher.finalize().to_hex().to_string(),
        });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_save_load() {
        let keg = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(keg.path().join("bin")).unwrap();
        std::fs::write(keg.path().join("bin/redis-server"), b"ELF").unwrap();

        let receipt = Receipt {
            name: PackageName::new("redis@5"),
            version: "5.0.14".into(),
            head: false,
            source: "https://download.redis.io/releases/redis-5.0.14.tar.gz".into(),
            variants: vec![],
            runtime_dependencies: vec![],
            requested: true,
            keg_only: true,
            installed_at: chrono::Utc::now().to_rfc3339(),
            files: hash_keg_files(keg.path()).unwrap(),
            links: vec![],
        };
        receipt.save(keg.path()).unwrap();

        let loaded = Receipt::load(keg.path()).unwrap();
        assert_eq!(loaded, receipt);
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.files[0].path, "bin/redis-server");
        assert_eq!(loaded.files[0].blake3, blake3::hash(b"ELF").to_hex().to_string());

        // The receipt never lists itself.
        assert_eq!(hash_keg_files(keg.path()).unwrap().len(), 1);
    }
}
