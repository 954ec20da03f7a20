//! Shared newtypes used across the keg crates.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;

/// A normalized formula name (e.g. `redis@5`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PackageName(String);

impl PackageName {
    /// Create a new package name, normalizing the input to lowercase.
    pub fn new(name: &str) -> Self {
        Self(name.trim().to_lowercase())
    }

    /// Return the normalized name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a reason when the name cannot be used as a directory component.
    pub fn invalid_reason(&self) -> Option<&'static str> {
        if self.0.is_empty() {
            Some("name is empty")
        } else if self.0 == "." || self.0 == ".." {
            Some("name is a relative path component")
        } else if self.0.contains(['/', '\\']) {
            Some("name contains a path separator")
        } else if self.0.chars().any(char::is_whitespace) {
            Some("name contains whitespace")
        } else {
            None
        }
    }

    /// Environment-variable friendly form: `postgresql@10` becomes `POSTGRESQL_10`.
    pub fn env_key(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl AsRef<std::ffi::OsStr> for PackageName {
    fn as_ref(&self) -> &std::ffi::OsStr {
        self.0.as_ref()
    }
}

impl AsRef<std::path::Path> for PackageName {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.0)
    }
}

impl std::fmt::Display for PackageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Deref for PackageName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for PackageName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other.to_lowercase()
    }
}

impl PartialEq<&str> for PackageName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == other.to_lowercase()
    }
}

impl Borrow<str> for PackageName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PackageName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PackageName {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

impl From<PackageName> for String {
    fn from(name: PackageName) -> Self {
        name.0
    }
}

/// A formula version string, as declared upstream (`5.0.14`, `3.2.3`).
///
/// Versions are stored verbatim. [`Version::semver`] gives a lenient semantic
/// reading used for constraint checks: a leading `v` is dropped and missing
/// minor/patch components are padded with zeros.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version(String);

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self.semver(), other.semver()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Version {
    /// Create a new version from the given string (stored as-is).
    pub fn new(v: &str) -> Self {
        Self(v.trim().to_string())
    }

    /// Return the version string as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lenient semantic-version reading of this version.
    ///
    /// Returns `None` for versions that have more than three numeric
    /// components or are not numeric at all (e.g. `HEAD`).
    pub fn semver(&self) -> Option<semver::Version> {
        let raw = self.0.strip_prefix('v').unwrap_or(&self.0);
        if let Ok(v) = semver::Version::parse(raw) {
            return Some(v);
        }

        let (core, rest) = match raw.find(['-', '+']) {
            Some(idx) => raw.split_at(idx),
            None => (raw, ""),
        };
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() > 3 {
            return None;
        }
        let mut padded = parts;
        while padded.len() < 3 {
            padded.push("0");
        }
        semver::Version::parse(&format!("{}{rest}", padded.join("."))).ok()
    }

    /// The keg directory name for this version and a formula revision:
    /// `5.0.14` with revision 1 becomes `5.0.14_1`.
    pub fn with_revision(&self, revision: u32) -> String {
        if revision == 0 {
            self.0.clone()
        } else {
            format!("{}_{revision}", self.0)
        }
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Deref for Version {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for Version {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Version {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

impl PartialEq<&str> for Version {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
