//! TOML formula definitions
//!
//! A formula describes one installable package: where its source lives, what
//! it depends on, the ordered build steps that populate the install prefix and
//! the assertions that smoke-test the result.
//!
//! Top-level keys such as `dependencies` must come before the first table.
//!
//! ```toml
//! dependencies = ["openssl", { name = "pkg-config", kind = "build" }]
//!
//! [package]
//! name = "redis@5"
//! version = "5.0.14"
//! revision = 1
//! license = "BSD-3-Clause"
//! keg_only = "versioned formula"
//!
//! [source]
//! url = "https://download.redis.io/releases/redis-5.0.14.tar.gz"
//! sha256 = "3ea5024766d983249e80d4aa9457c897a9f079957d0fb1f35682df233f997f32"
//!
//! [[steps]]
//! kind = "run"
//! args = ["make", "install", "PREFIX={{destdir}}{{prefix}}"]
//!
//! [[test]]
//! kind = "run"
//! args = ["{{bin}}/redis-server", "--test-memory", "2"]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::Sha256Digest;
use crate::types::{PackageName, Version};

/// Errors that can occur when loading or validating formulas.
#[derive(Error, Debug)]
pub enum FormulaError {
    /// A formula file could not be read.
    #[error("IO error reading {}: {source}", path.display())]
    Io {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be deserialized into a formula.
    #[error("parse error in {origin}: {source}")]
    Parse {
        /// File path, or `<inline>` for strings.
        origin: String,
        /// Underlying TOML error.
        #[source]
        source: Box<toml::de::Error>,
    },

    /// The formula parsed but violates a schema rule.
    #[error("invalid formula '{name}': {reason}")]
    Invalid {
        /// Formula name (or file name when the name itself is bad).
        name: String,
        /// What is wrong.
        reason: String,
    },

    /// Two files declare the same formula name.
    #[error("formula '{name}' is defined twice ({} and {})", first.display(), second.display())]
    Duplicate {
        /// Conflicting name.
        name: PackageName,
        /// First file declaring it.
        first: PathBuf,
        /// Second file declaring it.
        second: PathBuf,
    },

    /// Several files in a formula directory failed.
    #[error("{} formula file(s) failed to load:\n{}", .0.len(), join_errors(.0))]
    Many(Vec<FormulaError>),
}

fn join_errors(errors: &[FormulaError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl FormulaError {
    fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Identity and metadata of a formula (`[package]` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormulaInfo {
    /// Unique name of the formula.
    pub name: PackageName,
    /// Upstream version.
    pub version: Version,
    /// Packaging revision, bumped when the formula changes but upstream does not.
    #[serde(default)]
    pub revision: u32,
    /// Short human-readable summary.
    #[serde(default)]
    pub description: String,
    /// Project homepage.
    #[serde(default)]
    pub homepage: String,
    /// SPDX license identifier.
    #[serde(default)]
    pub license: String,
    /// When set, the keg is installed but never linked into the shared prefix.
    /// The value is the reason shown to the user.
    #[serde(default)]
    pub keg_only: Option<String>,
    /// Marks the formula as no longer installable.
    #[serde(default)]
    pub disabled: Option<Disabled>,
    /// Serialize the build tool invocation (`JOBS=1`).
    #[serde(default)]
    pub deparallelize: bool,
    /// Named optional build configurations.
    #[serde(default)]
    pub variants: Vec<String>,
}

/// Why and since when a formula is disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disabled {
    /// Date the formula was disabled (free form, usually ISO 8601).
    #[serde(default)]
    pub date: String,
    /// Human-readable reason.
    pub because: String,
}

/// Raw `[source]` table. Exactly one of `url` and `git` must be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Source {
    /// Archive URL (`https://`, `http://`, `file://` or a local path).
    #[serde(default)]
    pub url: Option<String>,
    /// Expected SHA-256 of the archive.
    #[serde(default)]
    pub sha256: Option<Sha256Digest>,
    /// Git repository URL.
    #[serde(default)]
    pub git: Option<String>,
    /// Branch, tag or commit to check out.
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
}

/// Where the source for a build comes from, after validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceLocator {
    /// A checksummed archive.
    Archive {
        /// Download location.
        url: String,
        /// Expected digest.
        sha256: Sha256Digest,
    },
    /// A version-control checkout. Not checksummed; the resolved revision is
    /// recorded instead.
    Git {
        /// Repository URL.
        url: String,
        /// Branch, tag or commit. `None` means the remote default branch.
        reference: Option<String>,
    },
}

impl SourceLocator {
    /// The URL this locator fetches from.
    pub fn url(&self) -> &str {
        match self {
            Self::Archive { url, .. } | Self::Git { url, .. } => url,
        }
    }
}

impl std::fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Archive { url, sha256 } => write!(f, "{url} (sha256 {sha256})"),
            Self::Git {
                url,
                reference: Some(r),
            } => write!(f, "{url}#{r}"),
            Self::Git {
                url,
                reference: None,
            } => write!(f, "{url}"),
        }
    }
}

impl Source {
    fn locator(&self, formula: &str) -> Result<SourceLocator, FormulaError> {
        match (&self.url, &self.git) {
            (Some(_), Some(_)) => Err(FormulaError::invalid(
                formula,
                "[source] must set either 'url' or 'git', not both",
            )),
            (None, None) => Err(FormulaError::invalid(
                formula,
                "[source] requires 'url' or 'git'",
            )),
            (Some(url), None) => {
                let sha256 = self.sha256.clone().ok_or_else(|| {
                    FormulaError::invalid(formula, "[source] url requires a sha256 checksum")
                })?;
                if url.trim().is_empty() {
                    return Err(FormulaError::invalid(formula, "[source] url is empty"));
                }
                Ok(SourceLocator::Archive {
                    url: url.clone(),
                    sha256,
                })
            }
            (None, Some(git)) => {
                if git.trim().is_empty() {
                    return Err(FormulaError::invalid(formula, "[source] git url is empty"));
                }
                Ok(SourceLocator::Git {
                    url: git.clone(),
                    reference: self.reference.clone(),
                })
            }
        }
    }
}

/// Alternative development source (`[head]` table) and its extra dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeadSpec {
    /// Git repository URL.
    pub git: String,
    /// Branch to follow.
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
    /// Dependencies only needed when building from head (e.g. autoconf).
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
}

/// When a dependency is needed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Only needed while building; not linked against at runtime.
    Build,
    /// Needed both to build and to run.
    #[default]
    Runtime,
    /// Included only when its gating variant is enabled.
    Optional,
}

/// A dependency declaration.
///
/// In TOML either a bare name (`"geos"`, a runtime dependency on any
/// version) or a table (`{ name = "gpp", kind = "build" }`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawDependency")]
pub struct DependencySpec {
    /// Target formula.
    pub name: PackageName,
    /// Build-only, runtime or optional.
    pub kind: DependencyKind,
    /// Accepted versions. `None` accepts any version.
    pub version: Option<semver::VersionReq>,
    /// Variant gating an optional dependency. Defaults to `with-<name>`.
    pub variant: Option<String>,
    /// Variants this formula needs enabled on the target.
    pub with: Vec<String>,
}

impl DependencySpec {
    /// A runtime dependency on any version of `name`.
    pub fn runtime(name: &str) -> Self {
        Self {
            name: PackageName::new(name),
            kind: DependencyKind::Runtime,
            version: None,
            variant: None,
            with: Vec::new(),
        }
    }

    /// A build-only dependency on any version of `name`.
    pub fn build(name: &str) -> Self {
        Self {
            kind: DependencyKind::Build,
            ..Self::runtime(name)
        }
    }

    /// The variant that has to be enabled for an optional dependency.
    pub fn gating_variant(&self) -> String {
        self.variant
            .clone()
            .unwrap_or_else(|| format!("with-{}", self.name))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        kind: DependencyKind,
        #[serde(default)]
        version: Option<semver::VersionReq>,
        #[serde(default)]
        variant: Option<String>,
        #[serde(default)]
        with: Vec<String>,
    },
}

impl From<RawDependency> for DependencySpec {
    fn from(raw: RawDependency) -> Self {
        match raw {
            RawDependency::Name(name) => Self::runtime(&name),
            RawDependency::Full {
                name,
                kind,
                version,
                variant,
                with,
            } => Self {
                name: PackageName::new(&name),
                kind,
                version,
                variant,
                with,
            },
        }
    }
}

/// One build step. Steps run strictly in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BuildStep {
    /// Run an external command.
    Run {
        /// Program followed by its arguments.
        args: Vec<String>,
        /// Working directory relative to the source tree.
        #[serde(default)]
        dir: Option<String>,
    },
    /// Set an environment variable for the remaining steps of this build.
    SetEnv {
        /// Variable name.
        key: String,
        /// Value (placeholders allowed).
        value: String,
    },
    /// Copy a file or directory from the source tree into the install prefix.
    Copy {
        /// Path relative to the source tree.
        from: String,
        /// Path relative to the install prefix.
        to: String,
    },
    /// Create a directory (and parents) inside the install prefix.
    Mkdir {
        /// Path relative to the install prefix.
        path: String,
    },
    /// Substitute text inside a file of the source tree.
    Replace {
        /// Path relative to the source tree.
        path: String,
        /// Literal text, or a regular expression when `regex` is set.
        pattern: String,
        /// Replacement text.
        replacement: String,
        /// Treat `pattern` as a regular expression.
        #[serde(default)]
        regex: bool,
    },
}

impl BuildStep {
    /// Short label used in logs and error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Run { args, .. } => args.join(" "),
            Self::SetEnv { key, value } => format!("set {key}={value}"),
            Self::Copy { from, to } => format!("copy {from} -> {to}"),
            Self::Mkdir { path } => format!("mkdir {path}"),
            Self::Replace { path, pattern, .. } => format!("replace '{pattern}' in {path}"),
        }
    }
}

/// One smoke-test assertion run against the installed keg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TestAssertion {
    /// The command must exit with status 0.
    Run {
        /// Program followed by its arguments.
        args: Vec<String>,
    },
    /// The command must exit 0 and its combined output must match `pattern`.
    Output {
        /// Program followed by its arguments.
        args: Vec<String>,
        /// Regular expression.
        pattern: String,
    },
    /// The path must exist.
    FileExists {
        /// Path (placeholders allowed).
        path: String,
    },
    /// The file must exist and its contents must match `pattern`.
    FileContains {
        /// Path (placeholders allowed).
        path: String,
        /// Regular expression.
        pattern: String,
    },
}

impl TestAssertion {
    /// Short label used in reports.
    pub fn describe(&self) -> String {
        match self {
            Self::Run { args } => format!("run {}", args.join(" ")),
            Self::Output { args, pattern } => format!("{} =~ /{pattern}/", args.join(" ")),
            Self::FileExists { path } => format!("exists {path}"),
            Self::FileContains { path, pattern } => format!("{path} =~ /{pattern}/"),
        }
    }
}

/// Complete formula definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Formula {
    /// Identity and metadata.
    pub package: FormulaInfo,
    /// Stable source.
    pub source: Source,
    /// Optional development source.
    #[serde(default)]
    pub head: Option<HeadSpec>,
    /// Environment overrides applied on top of the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Dependency declarations, in declaration order.
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    /// Ordered build steps.
    #[serde(default)]
    pub steps: Vec<BuildStep>,
    /// Smoke-test assertions.
    #[serde(default)]
    pub test: Vec<TestAssertion>,
}

impl Formula {
    /// Parse a formula from a TOML file on disk and validate it.
    ///
    /// # Errors
    ///
    /// Returns `FormulaError::Io` if the file cannot be read,
    /// `FormulaError::Parse` if the TOML is invalid, or
    /// `FormulaError::Invalid` if a schema rule is violated.
    pub fn from_file(path: &Path) -> Result<Self, FormulaError> {
        let content = fs::read_to_string(path).map_err(|source| FormulaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_with_origin(&content, &path.display().to_string())
    }

    /// Parse and validate a formula from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `FormulaError::Parse` or `FormulaError::Invalid`.
    pub fn parse(content: &str) -> Result<Self, FormulaError> {
        Self::parse_with_origin(content, "<inline>")
    }

    fn parse_with_origin(content: &str, origin: &str) -> Result<Self, FormulaError> {
        let formula: Self = toml::from_str(content).map_err(|e| FormulaError::Parse {
            origin: origin.to_string(),
            source: Box::new(e),
        })?;
        formula.validate()?;
        Ok(formula)
    }

    /// The formula name.
    pub fn name(&self) -> &PackageName {
        &self.package.name
    }

    /// Version including the packaging revision (`5.0.14_1`), used as the keg
    /// directory name.
    pub fn pkg_version(&self) -> String {
        self.package.version.with_revision(self.package.revision)
    }

    /// Whether the keg is kept out of the shared prefix.
    pub fn is_keg_only(&self) -> bool {
        self.package.keg_only.is_some()
    }

    /// The locator to fetch, either the stable source or the head source.
    ///
    /// # Errors
    ///
    /// Returns `FormulaError::Invalid` if the `[source]` table is malformed,
    /// or if `head` is requested for a formula without a `[head]` table.
    pub fn locator(&self, head: bool) -> Result<SourceLocator, FormulaError> {
        if head {
            let spec = self.head.as_ref().ok_or_else(|| {
                FormulaError::invalid(self.name().as_str(), "no [head] source declared")
            })?;
            return Ok(SourceLocator::Git {
                url: spec.git.clone(),
                reference: spec.reference.clone(),
            });
        }
        self.source.locator(self.name())
    }

    /// Dependencies in declaration order, followed by head-only ones when
    /// building from head.
    pub fn dependencies_for(&self, head: bool) -> impl Iterator<Item = &DependencySpec> {
        let head_deps: &[DependencySpec] = match (&self.head, head) {
            (Some(h), true) => h.dependencies.as_slice(),
            _ => &[],
        };
        self.dependencies.iter().chain(head_deps)
    }

    /// Declared variants plus the implicit `with-<dep>` gate of every
    /// optional dependency.
    pub fn declared_variants(&self) -> BTreeSet<String> {
        let mut out: BTreeSet<String> = self.package.variants.iter().cloned().collect();
        let head_deps = self.head.iter().flat_map(|h| h.dependencies.iter());
        for dep in self.dependencies.iter().chain(head_deps) {
            if dep.kind == DependencyKind::Optional {
                out.insert(dep.gating_variant());
            }
        }
        out
    }

    /// Check schema rules that serde alone cannot express.
    ///
    /// # Errors
    ///
    /// Returns `FormulaError::Invalid` describing the first violation found.
    pub fn validate(&self) -> Result<(), FormulaError> {
        let name = self.name().as_str();
        if let Some(reason) = self.name().invalid_reason() {
            return Err(FormulaError::invalid(name, reason));
        }
        if self.package.version.as_str().is_empty() {
            return Err(FormulaError::invalid(name, "version is empty"));
        }
        if self.package.version.contains(['/', '\\']) {
            return Err(FormulaError::invalid(name, "version contains a path separator"));
        }

        self.source.locator(name)?;

        let head_deps = self.head.iter().flat_map(|h| h.dependencies.iter());
        for dep in self.dependencies.iter().chain(head_deps) {
            if let Some(reason) = dep.name.invalid_reason() {
                return Err(FormulaError::invalid(
                    name,
                    format!("dependency '{}': {reason}", dep.name),
                ));
            }
            if dep.name == *self.name() {
                return Err(FormulaError::invalid(name, "formula depends on itself"));
            }
            if dep.kind != DependencyKind::Optional && dep.variant.is_some() {
                return Err(FormulaError::invalid(
                    name,
                    format!("dependency '{}': only optional dependencies take a variant", dep.name),
                ));
            }
        }

        for (idx, step) in self.steps.iter().enumerate() {
            let rule = step_rule(step).map_err(str::to_string).and_then(|()| match step {
                BuildStep::Replace {
                    pattern,
                    regex: true,
                    ..
                } => pattern_rule(pattern),
                _ => Ok(()),
            });
            rule.map_err(|reason| {
                FormulaError::invalid(name, format!("step {idx} ({}): {reason}", step.describe()))
            })?;
        }

        for (idx, assertion) in self.test.iter().enumerate() {
            let empty = match assertion {
                TestAssertion::Run { args } | TestAssertion::Output { args, .. } => args.is_empty(),
                TestAssertion::FileExists { path } | TestAssertion::FileContains { path, .. } => {
                    path.is_empty()
                }
            };
            if empty {
                return Err(FormulaError::invalid(
                    name,
                    format!("test assertion {idx} is missing its command or path"),
                ));
            }
            if let TestAssertion::Output { pattern, .. } | TestAssertion::FileContains { pattern, .. } =
                assertion
            {
                pattern_rule(pattern).map_err(|reason| {
                    FormulaError::invalid(name, format!("test assertion {idx}: {reason}"))
                })?;
            }
        }

        Ok(())
    }
}

/// Compile a formula pattern. `^` and `$` anchor at line boundaries.
///
/// # Errors
///
/// Returns the regex compilation error.
pub fn line_regex(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).multi_line(true).build()
}

fn pattern_rule(pattern: &str) -> Result<(), String> {
    line_regex(pattern)
        .map(|_| ())
        .map_err(|e| format!("invalid pattern /{pattern}/: {e}"))
}

fn step_rule(step: &BuildStep) -> Result<(), &'static str> {
    match step {
        BuildStep::Run { args, .. } if args.is_empty() => Err("command is empty"),
        BuildStep::SetEnv { key, .. } if key.is_empty() || key.contains('=') => {
            Err("environment key must be non-empty and contain no '='")
        }
        BuildStep::Copy { from, to } if from.is_empty() || to.is_empty() => {
            Err("copy needs both 'from' and 'to'")
        }
        BuildStep::Mkdir { path } if path.is_empty() => Err("path is empty"),
        BuildStep::Replace { path, pattern, .. } if path.is_empty() || pattern.is_empty() => {
            Err("replace needs 'path' and a non-empty 'pattern'")
        }
        _ => Ok(()),
    }
}

impl std::str::FromStr for Formula {
    type Err = FormulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// All known formulas, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct FormulaSet {
    formulas: BTreeMap<PackageName, Arc<Formula>>,
}

impl FormulaSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from already-validated formulas. Later duplicates replace
    /// earlier ones.
    pub fn from_formulas(formulas: impl IntoIterator<Item = Formula>) -> Self {
        let mut set = Self::new();
        for formula in formulas {
            set.insert(formula);
        }
        set
    }

    /// Load every `*.toml` file in `dir`.
    ///
    /// Every file is attempted; failures are collected and returned together
    /// so that one bad formula does not hide another.
    ///
    /// # Errors
    ///
    /// Returns `FormulaError::Io` if the directory cannot be read, or
    /// `FormulaError::Many` listing every file that failed.
    pub fn load_dir(dir: &Path) -> Result<Self, FormulaError> {
        let entries = fs::read_dir(dir).map_err(|source| FormulaError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        paths.sort();

        let mut set = Self::new();
        let mut origins: BTreeMap<PackageName, PathBuf> = BTreeMap::new();
        let mut errors = Vec::new();

        for path in paths {
            match Formula::from_file(&path) {
                Ok(formula) => {
                    let name = formula.name().clone();
                    if let Some(first) = origins.get(&name) {
                        errors.push(FormulaError::Duplicate {
                            name,
                            first: first.clone(),
                            second: path,
                        });
                        continue;
                    }
                    origins.insert(name, path);
                    set.insert(formula);
                }
                Err(e) => errors.push(e),
            }
        }

        if errors.is_empty() {
            Ok(set)
        } else {
            Err(FormulaError::Many(errors))
        }
    }

    /// Add or replace a formula.
    pub fn insert(&mut self, formula: Formula) {
        self.formulas
            .insert(formula.name().clone(), Arc::new(formula));
    }

    /// Look up a formula by name.
    pub fn get(&self, name: &str) -> Option<&Arc<Formula>> {
        self.formulas.get(&*name.to_lowercase())
    }

    /// Whether a formula with this name is known.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of formulas.
    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }

    /// Iterate formulas in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Formula>> {
        self.formulas.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POSTGIS: &str = r#"
dependencies = [
    { name = "gpp", kind = "build" },
    { name = "pkg-config", kind = "build" },
    "gdal",
    "geos",
    { name = "postgresql@10", version = ">=10, <11" },
    { name = "sfcgal", kind = "optional" },
]

[package]
name = "postgis-postgresql10@3"
version = "3.2.3"
revision = 3
license = "GPL-2.0-or-later"
deparallelize = true

[source]
url = "https://download.osgeo.org/postgis/source/postgis-3.2.3.tar.gz"
sha256 = "1b4d8b5c756e5aba59efbc1833b22efe4d6562778eeca56fa497feb2eb13668c"

[head]
git = "https://git.osgeo.org/gitea/postgis/postgis.git"
ref = "master"
dependencies = [{ name = "autoconf", kind = "build" }]

[env]
PG_CONFIG = "{{dep:postgresql@10}}/bin/pg_config"

[[steps]]
kind = "run"
args = ["./configure", "--with-pgconfig={{dep:postgresql@10}}/bin/pg_config", "--disable-nls"]

[[steps]]
kind = "run"
args = ["make"]

[[steps]]
kind = "run"
args = ["make", "install", "DESTDIR={{destdir}}"]

[[test]]
kind = "output"
args = ["{{bin}}/shp2pgsql", "{{testpath}}/brew.shp"]
pattern = "AddGeometryColumn"
"#;

    #[test]
    fn test_parse_formula() {
        let f = Formula::parse(POSTGIS).unwrap();
        assert_eq!(f.name(), &PackageName::new("postgis-postgresql10@3"));
        assert_eq!(f.pkg_version(), "3.2.3_3");
        assert!(f.package.deparallelize);
        assert_eq!(f.dependencies.len(), 6);
        assert_eq!(f.dependencies[0].kind, DependencyKind::Build);
        assert_eq!(f.dependencies[2], DependencySpec::runtime("gdal"));
        assert!(f.dependencies[4].version.is_some());
        assert_eq!(f.steps.len(), 3);
        assert_eq!(f.test.len(), 1);
        assert!(matches!(
            f.locator(false).unwrap(),
            SourceLocator::Archive { .. }
        ));
    }

    #[test]
    fn test_head_adds_dependencies() {
        let f = Formula::parse(POSTGIS).unwrap();
        assert_eq!(f.dependencies_for(false).count(), 6);
        let head: Vec<_> = f.dependencies_for(true).map(|d| d.name.to_string()).collect();
        assert_eq!(head.last().map(String::as_str), Some("autoconf"));
        assert!(matches!(f.locator(true).unwrap(), SourceLocator::Git { .. }));
    }

    #[test]
    fn test_optional_dependency_declares_variant() {
        let f = Formula::parse(POSTGIS).unwrap();
        assert!(f.declared_variants().contains("with-sfcgal"));
    }

    #[test]
    fn test_url_requires_checksum() {
        let toml = r#"
[package]
name = "redis@5"
version = "5.0.14"

[source]
url = "https://download.redis.io/releases/redis-5.0.14.tar.gz"
"#;
        let err = Formula::parse(toml).unwrap_err();
        assert!(err.to_string().contains("sha256"));
    }

    #[test]
    fn test_bad_checksum_rejected_at_parse() {
        let toml = r#"
[package]
name = "redis@5"
version = "5.0.14"

[source]
url = "https://download.redis.io/releases/redis-5.0.14.tar.gz"
sha256 = "abc123"
"#;
        assert!(matches!(
            Formula::parse(toml),
            Err(FormulaError::Parse { .. })
        ));
    }

    #[test]
    fn test_non_string_dependency_rejected() {
        let toml = r#"
dependencies = [42]

[package]
name = "a"
version = "1.0"

[source]
git = "https://example.com/a.git"
"#;
        assert!(matches!(
            Formula::parse(toml),
            Err(FormulaError::Parse { .. })
        ));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let toml = r#"
dependencies = ["a"]

[package]
name = "a"
version = "1.0"

[source]
git = "https://example.com/a.git"
"#;
        let err = Formula::parse(toml).unwrap_err();
        assert!(err.to_string().contains("depends on itself"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        // `dependencies` after `[source]` lands inside the source table.
        let toml = r#"
[package]
name = "a"
version = "1.0"

[source]
git = "https://example.com/a.git"
dependencies = ["b"]
"#;
        assert!(matches!(
            Formula::parse(toml),
            Err(FormulaError::Parse { .. })
        ));

        let typo = "[package]\nname = \"a\"\nversion = \"1.0\"\nkegonly = \"x\"\n\n[source]\ngit = \"https://example.com/a.git\"\n";
        assert!(Formula::parse(typo).is_err());
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        let base = "[package]\nname = \"a\"\nversion = \"1.0\"\n\n[source]\ngit = \"https://example.com/a.git\"\n";
        let replace = format!(
            "{base}\n[[steps]]\nkind = \"replace\"\npath = \"Makefile\"\npattern = \"(unclosed\"\nreplacement = \"\"\nregex = true\n"
        );
        let err = Formula::parse(&replace).unwrap_err();
        assert!(err.to_string().contains("invalid pattern"), "{err}");

        // The same text is fine as a literal.
        let literal = replace.replace("regex = true\n", "");
        assert!(Formula::parse(&literal).is_ok());

        let assertion = format!(
            "{base}\n[[test]]\nkind = \"file-contains\"\npath = \"etc/a.conf\"\npattern = \"[z-a]\"\n"
        );
        let err = Formula::parse(&assertion).unwrap_err();
        assert!(err.to_string().contains("test assertion 0"), "{err}");
    }

    #[test]
    fn test_line_regex_anchors_per_line() {
        let re = line_regex("^bind .*$").unwrap();
        assert!(re.is_match("# comment\nbind 127.0.0.1\nport 6379\n"));
    }

    #[test]
    fn test_empty_run_step_rejected() {
        let toml = r#"
[package]
name = "a"
version = "1.0"

[source]
git = "https://example.com/a.git"

[[steps]]
kind = "run"
args = []
"#;
        let err = Formula::parse(toml).unwrap_err();
        assert!(err.to_string().contains("step 0"));
    }

    #[test]
    fn test_load_dir_collects_every_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.toml"), POSTGIS).unwrap();
        std::fs::write(dir.path().join("bad1.toml"), "not toml {{{").unwrap();
        std::fs::write(
            dir.path().join("bad2.toml"),
            "[package]\nname = \"x\"\nversion = \"1\"\n[source]\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "ignored").unwrap();

        match FormulaSet::load_dir(dir.path()) {
            Err(FormulaError::Many(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected Many, got {other:?}"),
        }
    }

    #[test]
    fn test_load_dir_detects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.toml"), POSTGIS).unwrap();
        std::fs::write(dir.path().join("b.toml"), POSTGIS).unwrap();
        let err = FormulaSet::load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn test_set_lookup_is_case_insensitive() {
        let set = FormulaSet::from_formulas([Formula::parse(POSTGIS).unwrap()]);
        assert!(set.contains("PostGIS-PostgreSQL10@3"));
        assert_eq!(set.len(), 1);
    }
}
