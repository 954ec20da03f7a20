//! SQLite state database
//!
//! Tracks installed kegs, their files and the links they own in the shared
//! prefix. Receipts inside each keg remain authoritative; this is the fast
//! index used by `list`, `info` and `uninstall`.

use std::path::Path;

use keg_core::receipt::Receipt;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Package not found: {0}")]
    PackageNotFound(String),
}

/// Installed keg record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KegRecord {
    pub name: String,
    pub version: String,
    pub keg_path: String,
    pub source: String,
    pub keg_only: bool,
    pub requested: bool,
    pub installed_at: String,
}

/// State database for tracking installations
#[derive(Debug)]
pub struct StateDb {
    conn: Connection,
}

impl StateDb {
    /// Open or create the database at `path`.
    pub fn open_at(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), DbError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS kegs (
                name TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                keg_path TEXT NOT NULL,
                source TEXT NOT NULL,
                keg_only INTEGER NOT NULL DEFAULT 0,
                requested INTEGER NOT NULL DEFAULT 0,
                installed_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS keg_files (
                package TEXT NOT NULL REFERENCES kegs(name) ON DELETE CASCADE,
                path TEXT NOT NULL,
                blake3 TEXT NOT NULL,
                PRIMARY KEY (package, path)
            );

            CREATE TABLE IF NOT EXISTS links (
                path TEXT PRIMARY KEY,
                package TEXT NOT NULL REFERENCES kegs(name) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_links_package ON links(package);
            ",
        )?;
        Ok(())
    }

    /// Record a completed install, replacing any earlier record of the name.
    pub fn record_install(&mut self, receipt: &Receipt, keg_path: &Path) -> Result<(), DbError> {
        let tx = self.conn.transaction()?;
        let name = receipt.name.as_str();

        tx.execute("DELETE FROM kegs WHERE name = ?1", params![name])?;
        tx.execute(
            "INSERT INTO kegs (name, version, keg_path, source, keg_only, requested, installed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                name,
                receipt.version,
                keg_path.to_string_lossy(),
                receipt.source,
                receipt.keg_only,
                receipt.requested,
                receipt.installed_at,
            ],
        )?;
        {
            let mut file_stmt =
                tx.prepare("INSERT INTO keg_files (package, path, blake3) VALUES (?1, ?2, ?3)")?;
            for file in &receipt.files {
                file_stmt.execute(params![name, file.path, file.blake3])?;
            }
            let mut link_stmt =
                tx.prepare("INSERT OR REPLACE INTO links (path, package) VALUES (?1, ?2)")?;
            for link in &receipt.links {
                link_stmt.execute(params![link, name])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove a keg record, returning the links it owned.
    pub fn remove_keg(&mut self, name: &str) -> Result<Vec<String>, DbError> {
        let links = self.links_for(name)?;
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM links WHERE package = ?1", params![name])?;
        tx.execute("DELETE FROM keg_files WHERE package = ?1", params![name])?;
        let deleted = tx.execute("DELETE FROM kegs WHERE name = ?1", params![name])?;
        if deleted == 0 {
            return Err(DbError::PackageNotFound(name.to_string()));
        }
        tx.commit()?;
        Ok(links)
    }

    /// Get a keg by name
    pub fn get_keg(&self, name: &str) -> Result<Option<KegRecord>, DbError> {
        self.conn
            .query_row(
                "SELECT name, version, keg_path, source, keg_only, requested, installed_at
                 FROM kegs WHERE name = ?1",
                params![name],
                row_to_keg,
            )
            .optional()
            .map_err(Into::into)
    }

    /// List all installed kegs
    pub fn list_kegs(&self) -> Result<Vec<KegRecord>, DbError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, version, keg_path, source, keg_only, requested, installed_at
             FROM kegs ORDER BY name",
        )?;
        let kegs = stmt.query_map([], row_to_keg)?;
        kegs.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Links owned by a package, relative to the shared prefix
    pub fn links_for(&self, package: &str) -> Result<Vec<String>, DbError> {
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM links WHERE package = ?1 ORDER BY path")?;
        let links = stmt.query_map(params![package], |row| row.get(0))?;
        links.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Number of files recorded for a package
    pub fn file_count(&self, package: &str) -> Result<usize, DbError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM keg_files WHERE package = ?1",
            params![package],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn row_to_keg(row: &rusqlite::Row<'_>) -> rusqlite::Result<KegRecord> {
    Ok(KegRecord {
        name: row.get(0)?,
        version: row.get(1)?,
        keg_path: row.get(2)?,
        source: row.get(3)?,
        keg_only: row.get(4)?,
        requested: row.get(5)?,
        installed_at: row.get(6)?,
    })
}
