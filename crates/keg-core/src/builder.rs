//! Build orchestration.
//!
//! Runs a formula's steps, strictly in order, against an unpacked source
//! tree. Builds are configured for their final keg path (`{{prefix}}`) and
//! install under a staging root (`{{destdir}}`), the way `make install
//! DESTDIR=...` works. The linker later moves `<destdir><prefix>` into the
//! Cellar, so paths compiled into the build stay valid.
//!
//! ## Environment contract
//!
//! Each command sees exactly the environment assembled here, in three layers
//! (later layers win):
//!
//! 1. Base: the inherited environment, or in hermetic mode only
//!    `PATH`, `HOME`, `TERM`, `LANG` and `SOURCE_DATE_EPOCH`.
//! 2. Dependencies:
//!
//! | Variable | Value |
//! |---|---|
//! | `PREFIX` | Final keg path |
//! | `DESTDIR` | Staging root; files for the keg go under `$DESTDIR$PREFIX` |
//! | `JOBS` / `MAKEFLAGS` | Job count (`1` / `-j1` when deparallelized) |
//! | `DEP_<NAME>` | Per-dependency keg path (name uppercased, punctuation to underscores) |
//! | `PATH` | Each dependency's `bin/` prepended |
//! | `CFLAGS` / `CPPFLAGS` | `-I` flags for each dependency's `include/` |
//! | `LDFLAGS` | `-L` flags for each dependency's `lib/` |
//! | `CPATH`, `LIBRARY_PATH` | Colon-separated include and library paths |
//! | `PKG_CONFIG_PATH` | Colon-separated `lib/pkgconfig` paths |
//!
//! 3. Formula: the `[env]` table, placeholders expanded.
//!
//! `set-env` steps add an overlay that applies to the remaining steps of the
//! same build only.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use keg_schema::{BuildStep, Formula, PackageName, line_regex};
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use crate::Reporter;
use crate::config::Config;
use crate::process::{self, Exit, Invocation};

/// Fixed epoch for `SOURCE_DATE_EPOCH` in hermetic builds.
const SOURCE_DATE_EPOCH: &str = "0";

/// Lines of stdout/stderr kept in a step failure.
const TAIL_LINES: usize = 20;

/// Build failures. Each carries enough context to diagnose without the logs.
#[derive(Error, Debug)]
pub enum BuildError {
    /// A step exited non-zero or could not be carried out.
    #[error("step {index} failed (exit code {code}): {command}")]
    Step {
        /// Zero-based index of the failing step.
        index: usize,
        /// Command line or step description.
        command: String,
        /// Exit code (127 when the command could not be spawned).
        code: i32,
        /// Last lines of stdout.
        stdout_tail: String,
        /// Last lines of stderr.
        stderr_tail: String,
        /// Directory holding the full per-step logs.
        log_dir: PathBuf,
    },

    /// A step ran past its deadline and was killed.
    #[error("step {index} timed out after {}s: {command}", limit.as_secs())]
    Timeout {
        /// Zero-based index of the step.
        index: usize,
        /// Command line.
        command: String,
        /// Configured limit.
        limit: Duration,
    },

    /// The build environment could not be assembled.
    #[error("invalid build environment: {0}")]
    Environment(String),

    /// A step wrote into the final keg path instead of under the staging root.
    #[error("build wrote into {} directly; install under $DESTDIR", path.display())]
    OutsideStage {
        /// The keg path that appeared during the build.
        path: PathBuf,
    },

    /// Local I/O failure outside of any step.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_:@.+-]+)\s*\}\}").unwrap_or_else(|e| panic!("placeholder regex: {e}"))
});

/// `{{key}}` substitutions for step arguments, paths and env values.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    values: BTreeMap<String, String>,
}

impl Placeholders {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace one value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Expand every placeholder in `template`.
    ///
    /// # Errors
    ///
    /// Returns the name of the first unknown placeholder.
    pub fn expand(&self, template: &str) -> Result<String, String> {
        let mut unknown = None;
        let out = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            if let Some(v) = self.values.get(key) {
                v.clone()
            } else {
                unknown.get_or_insert_with(|| key.to_string());
                String::new()
            }
        });
        match unknown {
            Some(key) => Err(format!("unknown placeholder '{{{{{key}}}}}' in '{template}'")),
            None => Ok(out.into_owned()),
        }
    }
}

/// Knobs shared by every build of a run.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Job count for non-deparallelized formulas.
    pub jobs: usize,
    /// Start from a minimal environment instead of the inherited one.
    pub hermetic: bool,
    /// Per-step wall-clock limit.
    pub step_timeout: Duration,
}

impl BuildSettings {
    /// Settings derived from the user configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            jobs: config.build_jobs(),
            hermetic: config.hermetic,
            step_timeout: config.step_timeout(),
        }
    }
}

/// Directories of one build.
#[derive(Debug, Clone)]
pub struct BuildDirs {
    /// Scratch root, exposed as `{{buildpath}}`.
    pub work_dir: PathBuf,
    /// Unpacked source tree; `run` steps default to it.
    pub source_dir: PathBuf,
    /// Staging root, exposed as `{{destdir}}`.
    pub stage_dir: PathBuf,
    /// Final keg path, exposed as `{{prefix}}`. Nothing is written there
    /// during the build.
    pub prefix: PathBuf,
    /// Shared prefix, the base of `{{var}}`, `{{etc}}` and `{{opt:<name>}}`.
    pub shared_prefix: PathBuf,
    /// Per-step stdout/stderr logs.
    pub log_dir: PathBuf,
}

impl BuildDirs {
    /// Where the keg's files are staged: `<stage_dir><prefix>`.
    pub fn staged_prefix(&self) -> PathBuf {
        let rel: PathBuf = self
            .prefix
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        self.stage_dir.join(rel)
    }

    fn opt_path(&self, name: &str) -> PathBuf {
        self.shared_prefix.join("opt").join(name)
    }
}

/// Everything one package build needs. Created at build start.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Formula name.
    pub name: PackageName,
    /// Package version (with revision).
    pub version: String,
    /// Working directories.
    pub dirs: BuildDirs,
    /// Keg paths of the dependencies visible to this build.
    pub dependencies: Vec<(PackageName, PathBuf)>,
    /// Effective job count.
    pub jobs: usize,
    /// Per-step limit.
    pub step_timeout: Duration,
    /// Merged environment: base, then dependencies, then formula.
    pub env: BTreeMap<String, String>,
}

impl BuildContext {
    /// Assemble the context and its environment.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::Environment`] if a formula env value uses an
    /// unknown placeholder.
    pub fn new(
        formula: &Formula,
        dirs: BuildDirs,
        dependencies: Vec<(PackageName, PathBuf)>,
        settings: &BuildSettings,
    ) -> Result<Self, BuildError> {
        let jobs = if formula.package.deparallelize {
            1
        } else {
            settings.jobs.max(1)
        };

        let mut ctx = Self {
            name: formula.name().clone(),
            version: formula.pkg_version(),
            dirs,
            dependencies,
            jobs,
            step_timeout: settings.step_timeout,
            env: BTreeMap::new(),
        };

        ctx.env = base_env(settings.hermetic, &ctx.dirs.work_dir);
        ctx.inject_dependencies();

        let placeholders = ctx.placeholders();
        for (key, value) in &formula.env {
            let value = placeholders
                .expand(value)
                .map_err(BuildError::Environment)?;
            ctx.env.insert(key.clone(), value);
        }

        Ok(ctx)
    }

    fn inject_dependencies(&mut self) {
        let env = &mut self.env;
        env.insert("PREFIX".into(), path_str(&self.dirs.prefix));
        env.insert("DESTDIR".into(), path_str(&self.dirs.stage_dir));
        env.insert("JOBS".into(), self.jobs.to_string());
        env.insert("MAKEFLAGS".into(), format!("-j{}", self.jobs));

        let mut bin_dirs = Vec::new();
        let mut include_paths = Vec::new();
        let mut library_paths = Vec::new();
        let mut pkg_config_paths = Vec::new();

        for (name, keg) in &self.dependencies {
            env.insert(format!("DEP_{}", name.env_key()), path_str(keg));

            if keg.join("bin").is_dir() {
                bin_dirs.push(path_str(&keg.join("bin")));
            }
            if keg.join("include").is_dir() {
                include_paths.push(path_str(&keg.join("include")));
            }
            if keg.join("lib").is_dir() {
                library_paths.push(path_str(&keg.join("lib")));
            }
            if keg.join("lib/pkgconfig").is_dir() {
                pkg_config_paths.push(path_str(&keg.join("lib/pkgconfig")));
            }
        }

        prepend(env, "PATH", &bin_dirs, ":");
        let cflags: Vec<String> = include_paths.iter().map(|p| format!("-I{p}")).collect();
        let ldflags: Vec<String> = library_paths.iter().map(|p| format!("-L{p}")).collect();
        prepend(env, "CFLAGS", &cflags, " ");
        prepend(env, "CPPFLAGS", &cflags, " ");
        prepend(env, "LDFLAGS", &ldflags, " ");
        prepend(env, "CPATH", &include_paths, ":");
        prepend(env, "LIBRARY_PATH", &library_paths, ":");
        prepend(env, "PKG_CONFIG_PATH", &pkg_config_paths, ":");
    }

    /// Placeholder values available to build steps.
    pub fn placeholders(&self) -> Placeholders {
        let mut p = Placeholders::new();
        p.set("name", self.name.as_str())
            .set("version", self.version.as_str())
            .set("prefix", path_str(&self.dirs.prefix))
            .set("destdir", path_str(&self.dirs.stage_dir))
            .set("opt_prefix", path_str(&self.dirs.opt_path(self.name.as_str())))
            .set("var", path_str(&self.dirs.shared_prefix.join("var")))
            .set("etc", path_str(&self.dirs.shared_prefix.join("etc")))
            .set("buildpath", path_str(&self.dirs.work_dir))
            .set("jobs", self.jobs.to_string());
        for (name, keg) in &self.dependencies {
            p.set(format!("dep:{name}"), path_str(keg));
            p.set(format!("opt:{name}"), path_str(&self.dirs.opt_path(name.as_str())));
        }
        p
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn prepend(env: &mut BTreeMap<String, String>, key: &str, values: &[String], sep: &str) {
    if values.is_empty() {
        return;
    }
    let mut joined = values.join(sep);
    if let Some(existing) = env.get(key).filter(|v| !v.is_empty()) {
        joined.push_str(sep);
        joined.push_str(existing);
    }
    env.insert(key.to_string(), joined);
}

fn base_env(hermetic: bool, home: &Path) -> BTreeMap<String, String> {
    if !hermetic {
        return std::env::vars().collect();
    }
    BTreeMap::from([
        ("PATH".to_string(), "/usr/bin:/bin:/usr/sbin:/sbin".to_string()),
        ("HOME".to_string(), path_str(home)),
        ("TERM".to_string(), "dumb".to_string()),
        ("LANG".to_string(), "en_US.UTF-8".to_string()),
        ("SOURCE_DATE_EPOCH".to_string(), SOURCE_DATE_EPOCH.to_string()),
    ])
}

/// Run every step of `formula` in order, stopping at the first failure.
///
/// After success, absolute symlinks pointing into the staged prefix or the
/// final keg path are rewritten as relative links.
///
/// # Errors
///
/// Returns [`BuildError::Step`] or [`BuildError::Timeout`] for the first
/// failing step; later steps are not run.
pub fn build<R: Reporter>(formula: &Formula, ctx: &BuildContext, reporter: &R) -> Result<(), BuildError> {
    let staged = ctx.dirs.staged_prefix();
    std::fs::create_dir_all(&staged)?;
    std::fs::create_dir_all(&ctx.dirs.log_dir)?;
    let keg_existed = ctx.dirs.prefix.exists();

    let placeholders = ctx.placeholders();
    let mut overlay: BTreeMap<String, String> = BTreeMap::new();
    let total = formula.steps.len();

    info!("building {} {} ({} steps, jobs={})", ctx.name, ctx.version, total, ctx.jobs);

    for (index, step) in formula.steps.iter().enumerate() {
        let label = step.describe();
        reporter.build_step(&ctx.name, &ctx.version, index, total, &label);
        debug!("[{}] step {index}: {label}", ctx.name);

        let fail = |code: i32, reason: String| BuildError::Step {
            index,
            command: label.clone(),
            code,
            stdout_tail: String::new(),
            stderr_tail: reason,
            log_dir: ctx.dirs.log_dir.clone(),
        };

        match step {
            BuildStep::Run { args, dir } => {
                let argv = args
                    .iter()
                    .map(|a| placeholders.expand(a))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| fail(1, e))?;
                let cwd = match dir {
                    Some(d) => {
                        let d = placeholders.expand(d).map_err(|e| fail(1, e))?;
                        ctx.dirs.source_dir.join(d)
                    }
                    None => ctx.dirs.source_dir.clone(),
                };
                let mut env = ctx.env.clone();
                env.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
                run_command(index, &argv, &cwd, &env, ctx)?;
            }
            BuildStep::SetEnv { key, value } => {
                let value = placeholders.expand(value).map_err(|e| fail(1, e))?;
                overlay.insert(key.clone(), value);
            }
            BuildStep::Copy { from, to } => {
                let from = placeholders.expand(from).map_err(|e| fail(1, e))?;
                let to = placeholders.expand(to).map_err(|e| fail(1, e))?;
                copy_into_stage(ctx, &from, &to).map_err(|e| fail(1, e))?;
            }
            BuildStep::Mkdir { path } => {
                let path = placeholders.expand(path).map_err(|e| fail(1, e))?;
                let target = stage_target(&ctx.dirs, &path).map_err(|e| fail(1, e))?;
                std::fs::create_dir_all(target).map_err(|e| fail(1, e.to_string()))?;
            }
            BuildStep::Replace {
                path,
                pattern,
                replacement,
                regex,
            } => {
                let path = placeholders.expand(path).map_err(|e| fail(1, e))?;
                let replacement = placeholders.expand(replacement).map_err(|e| fail(1, e))?;
                let file = ctx.dirs.source_dir.join(path);
                replace_in_file(&file, pattern, &replacement, *regex).map_err(|e| fail(1, e))?;
            }
        }
    }

    if !keg_existed && ctx.dirs.prefix.exists() {
        std::fs::remove_dir_all(&ctx.dirs.prefix)?;
        return Err(BuildError::OutsideStage {
            path: ctx.dirs.prefix.clone(),
        });
    }

    fix_absolute_symlinks(&staged, &staged)?;
    fix_absolute_symlinks(&ctx.dirs.prefix, &staged)?;
    Ok(())
}

fn run_command(
    index: usize,
    argv: &[String],
    cwd: &Path,
    env: &BTreeMap<String, String>,
    ctx: &BuildContext,
) -> Result<(), BuildError> {
    let stdout = ctx.dirs.log_dir.join(format!("{index:02}.stdout.log"));
    let stderr = ctx.dirs.log_dir.join(format!("{index:02}.stderr.log"));
    let command = argv.join(" ");

    let exit = process::run(&Invocation {
        args: argv,
        cwd,
        env,
        stdout: &stdout,
        stderr: &stderr,
        timeout: ctx.step_timeout,
    })?;

    match exit {
        Exit::Code(0) => Ok(()),
        Exit::Code(code) => Err(BuildError::Step {
            index,
            command,
            code,
            stdout_tail: process::read_last_lines(&stdout, TAIL_LINES).unwrap_or_default(),
            stderr_tail: process::read_last_lines(&stderr, TAIL_LINES).unwrap_or_default(),
            log_dir: ctx.dirs.log_dir.clone(),
        }),
        Exit::TimedOut => Err(BuildError::Timeout {
            index,
            command,
            limit: ctx.step_timeout,
        }),
    }
}

/// Join a relative path onto `base`, refusing to climb out of it.
fn within(base: &Path, rel: &Path) -> Result<PathBuf, String> {
    if rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(format!("path '{}' escapes {}", rel.display(), base.display()));
    }
    Ok(base.join(rel))
}

/// Resolve a destination of a built-in step inside the staged prefix.
///
/// Relative paths are keg-relative. Absolute paths must name the keg
/// (`{{prefix}}/...`) or the staging root and are mapped into the stage.
fn stage_target(dirs: &BuildDirs, path: &str) -> Result<PathBuf, String> {
    let staged = dirs.staged_prefix();
    let path = Path::new(path);
    if !path.is_absolute() {
        return within(&staged, path);
    }
    if let Ok(rest) = path.strip_prefix(&dirs.stage_dir) {
        return within(&dirs.stage_dir, rest);
    }
    match path.strip_prefix(&dirs.prefix) {
        Ok(rest) => within(&staged, rest),
        Err(_) => Err(format!(
            "path '{}' is outside {}",
            path.display(),
            dirs.prefix.display()
        )),
    }
}

/// `to` ending in `/` names a directory that receives `from` under its own name.
fn copy_into_stage(ctx: &BuildContext, from: &str, to: &str) -> Result<(), String> {
    let src = ctx.dirs.source_dir.join(from);
    if !src.exists() {
        return Err(format!("{} does not exist", src.display()));
    }
    let mut dest = stage_target(&ctx.dirs, to)?;
    if to.ends_with('/') {
        let name = src
            .file_name()
            .ok_or_else(|| format!("cannot copy {}", src.display()))?;
        dest = dest.join(name);
    }

    if src.is_dir() {
        std::fs::create_dir_all(&dest).map_err(|e| e.to_string())?;
        copy_dir_all(&src, &dest).map_err(|e| e.to_string())
    } else {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::copy(&src, &dest)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

fn replace_in_file(file: &Path, pattern: &str, replacement: &str, regex: bool) -> Result<(), String> {
    let content = std::fs::read_to_string(file).map_err(|e| format!("{}: {e}", file.display()))?;
    let updated = if regex {
        let re = line_regex(pattern).map_err(|e| e.to_string())?;
        if !re.is_match(&content) {
            return Err(format!("pattern /{pattern}/ not found in {}", file.display()));
        }
        re.replace_all(&content, replacement).into_owned()
    } else {
        if !content.contains(pattern) {
            return Err(format!("'{pattern}' not found in {}", file.display()));
        }
        content.replace(pattern, replacement)
    };
    std::fs::write(file, updated).map_err(|e| format!("{}: {e}", file.display()))
}

/// Walk `new_root` and convert absolute symlinks that point into `old_prefix`
/// into relative symlinks under `new_root`.
///
/// Build systems often create absolute links that reference `$PREFIX`
/// during `make install`. Rewriting them keeps the tree relocatable.
///
/// # Errors
///
/// Returns an error if rewriting a symlink fails.
pub fn fix_absolute_symlinks(old_prefix: &Path, new_root: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(new_root)
        .into_iter()
        .filter_map(std::result::Result::ok)
    {
        let path = entry.path();
        if !entry.path_is_symlink() {
            continue;
        }
        let Ok(target) = std::fs::read_link(path) else {
            continue;
        };
        if !target.is_absolute() {
            continue;
        }

        let Ok(suffix) = target.strip_prefix(old_prefix) else {
            continue;
        };

        let new_target = new_root.join(suffix);
        let Some(link_dir) = path.parent() else {
            continue;
        };

        let relative = relative_path(link_dir, &new_target);
        std::fs::remove_file(path)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(&relative, path)?;
    }

    Ok(())
}

/// Compute a relative path from `from_dir` to `to_path`.
///
/// Example: `relative_path("/a/b/c", "/a/b/d/e")` returns `"../d/e"`.
pub fn relative_path(from_dir: &Path, to_path: &Path) -> PathBuf {
    let from_components: Vec<_> = from_dir.components().collect();
    let to_components: Vec<_> = to_path.components().collect();

    let common_len = from_components
        .iter()
        .zip(to_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result = PathBuf::new();
    for _ in common_len..from_components.len() {
        result.push("..");
    }
    for part in &to_components[common_len..] {
        result.push(part);
    }
    result
}

/// Recursively copy a directory tree from `src` to `dst`.
///
/// # Errors
///
/// Returns an error if any file or directory cannot be copied.
pub fn copy_dir_all(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> std::io::Result<()> {
    fs_extra::dir::copy(
        src,
        dst,
        &fs_extra::dir::CopyOptions::new()
            .content_only(true)
            .overwrite(true),
    )
    .map_err(|e| std::io::Error::other(format!("Copy failed: {e}")))?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::NullReporter;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        dirs: BuildDirs,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let dirs = BuildDirs {
            work_dir: root.clone(),
            source_dir: root.join("src"),
            stage_dir: root.join("stage"),
            prefix: root.join("home/Cellar/hello/1.0"),
            shared_prefix: root.join("home"),
            log_dir: root.join("logs"),
        };
        std::fs::create_dir_all(&dirs.source_dir).unwrap();
        Fixture { _tmp: tmp, dirs }
    }

    fn settings() -> BuildSettings {
        BuildSettings {
            jobs: 4,
            hermetic: true,
            step_timeout: Duration::from_secs(30),
        }
    }

    fn formula(extra: &str) -> Formula {
        Formula::parse(&format!(
            r#"
[package]
name = "hello"
version = "1.0"

[source]
git = "https://example.com/hello.git"

{extra}
"#
        ))
        .unwrap()
    }

    fn sh(script: &str) -> String {
        format!(
            "[[steps]]\nkind = \"run\"\nargs = [\"sh\", \"-c\", {}]\n",
            toml::Value::String(script.to_string())
        )
    }

    fn run(formula: &Formula, fx: &Fixture) -> Result<BuildContext, BuildError> {
        let ctx = BuildContext::new(formula, fx.dirs.clone(), Vec::new(), &settings())?;
        build(formula, &ctx, &NullReporter)?;
        Ok(ctx)
    }

    #[test]
    fn test_first_failure_aborts_remaining_steps() {
        let fx = fixture();
        let steps = [
            sh("touch {{buildpath}}/one"),
            sh("echo broken >&2; exit 2"),
            sh("touch {{buildpath}}/three"),
        ]
        .concat();
        let err = run(&formula(&steps), &fx).unwrap_err();

        match err {
            BuildError::Step {
                index,
                code,
                stderr_tail,
                ..
            } => {
                assert_eq!(index, 1);
                assert_eq!(code, 2);
                assert_eq!(stderr_tail, "broken");
            }
            other => panic!("expected step failure, got {other:?}"),
        }
        assert!(fx.dirs.work_dir.join("one").exists());
        assert!(!fx.dirs.work_dir.join("three").exists());
    }

    #[test]
    fn test_prefix_is_keg_path_and_output_lands_under_destdir() {
        let fx = fixture();
        let f = formula(&sh(
            "mkdir -p $DESTDIR$PREFIX/bin && echo {{prefix}} > {{destdir}}{{prefix}}/bin/where",
        ));
        run(&f, &fx).unwrap();

        let staged = fx.dirs.staged_prefix();
        assert!(staged.starts_with(&fx.dirs.stage_dir));
        assert!(staged.ends_with("home/Cellar/hello/1.0"));
        assert_eq!(
            std::fs::read_to_string(staged.join("bin/where")).unwrap().trim(),
            fx.dirs.prefix.display().to_string()
        );
        assert!(!fx.dirs.prefix.exists(), "nothing is written to the keg while building");
    }

    #[test]
    fn test_writing_into_the_keg_directly_fails() {
        let fx = fixture();
        let f = formula(&sh("mkdir -p {{prefix}}/bin && touch {{prefix}}/bin/hello"));
        match run(&f, &fx).unwrap_err() {
            BuildError::OutsideStage { path } => assert_eq!(path, fx.dirs.prefix),
            other => panic!("expected OutsideStage, got {other:?}"),
        }
        assert!(!fx.dirs.prefix.exists());
    }

    #[test]
    fn test_built_paths_survive_the_move_into_the_cellar() {
        use crate::linker::Linker;
        use crate::paths::Layout;
        use crate::receipt::Receipt;

        let mut fx = fixture();
        let layout = Layout::new(fx.dirs.shared_prefix.clone());
        layout.ensure_dirs().unwrap();
        fx.dirs.prefix = layout.keg_path("redis", "5.0.14");

        let f = formula(&sh(
            "mkdir -p $DESTDIR$PREFIX/etc && echo \"dir {{var}}/db/redis/ {{prefix}}\" > $DESTDIR$PREFIX/etc/redis.conf",
        ));
        let ctx = run(&f, &fx).unwrap();

        let receipt = Receipt {
            name: PackageName::new("redis"),
            version: "5.0.14".to_string(),
            head: false,
            source: "file:///src/redis-5.0.14.tar.gz".to_string(),
            variants: vec![],
            runtime_dependencies: vec![],
            requested: true,
            keg_only: false,
            installed_at: String::new(),
            files: vec![],
            links: vec![],
        };
        Linker::new(layout.clone())
            .install(&ctx.dirs.staged_prefix(), receipt)
            .unwrap();

        let conf = std::fs::read_to_string(fx.dirs.prefix.join("etc/redis.conf")).unwrap();
        assert_eq!(
            conf.trim(),
            format!(
                "dir {}/var/db/redis/ {}",
                layout.root().display(),
                fx.dirs.prefix.display()
            )
        );
        assert!(fx.dirs.prefix.is_dir());
        assert!(!ctx.dirs.staged_prefix().exists(), "the stage was moved into the Cellar");
    }

    #[test]
    fn test_set_env_applies_to_later_steps() {
        let fx = fixture();
        let steps = [
            sh("test -z \"$GREETING\""),
            "[[steps]]\nkind = \"set-env\"\nkey = \"GREETING\"\nvalue = \"{{name}}-{{version}}\"\n"
                .to_string(),
            sh("test \"$GREETING\" = hello-1.0"),
        ]
        .concat();
        run(&formula(&steps), &fx).unwrap();
    }

    #[test]
    fn test_formula_env_overrides_base() {
        let fx = fixture();
        let extra = format!("[env]\nLANG = \"C\"\n\n{}", sh("test \"$LANG\" = C"));
        run(&formula(&extra), &fx).unwrap();
    }

    #[test]
    fn test_deparallelize_forces_one_job() {
        let fx = fixture();
        let extra = sh("test \"$JOBS\" = 1 && test \"$MAKEFLAGS\" = -j1 && test {{jobs}} = 1");
        let mut f = formula(&extra);
        f.package.deparallelize = true;
        run(&f, &fx).unwrap();
    }

    #[test]
    fn test_dependency_injection() {
        let fx = fixture();
        let dep = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dep.path().join("bin")).unwrap();
        std::fs::create_dir_all(dep.path().join("include")).unwrap();
        let tool = dep.path().join("bin/dep-tool");
        std::fs::write(&tool, "#!/bin/sh\necho from-dep\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let f = formula(&sh(
            "dep-tool > {{buildpath}}/out && test \"$DEP_OPENSSL_3\" = {{dep:openssl@3}}",
        ));
        let deps = vec![(PackageName::new("openssl@3"), dep.path().to_path_buf())];
        let ctx = BuildContext::new(&f, fx.dirs.clone(), deps, &settings()).unwrap();
        assert!(ctx.env["CFLAGS"].starts_with("-I"));
        assert_eq!(
            ctx.placeholders().expand("{{opt:openssl@3}}").unwrap(),
            fx.dirs.shared_prefix.join("opt/openssl@3").display().to_string()
        );
        build(&f, &ctx, &NullReporter).unwrap();
        assert_eq!(
            std::fs::read_to_string(fx.dirs.work_dir.join("out")).unwrap(),
            "from-dep\n"
        );
    }

    #[test]
    fn test_unknown_placeholder_fails_step() {
        let fx = fixture();
        let err = run(&formula(&sh("echo {{nope}}")), &fx).unwrap_err();
        assert!(matches!(err, BuildError::Step { index: 0, .. }));
    }

    #[test]
    fn test_missing_command_reports_127() {
        let fx = fixture();
        let f = formula("[[steps]]\nkind = \"run\"\nargs = [\"no-such-build-tool\"]\n");
        match run(&f, &fx).unwrap_err() {
            BuildError::Step { code, .. } => assert_eq!(code, 127),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_copy_mkdir_replace() {
        let fx = fixture();
        std::fs::write(fx.dirs.source_dir.join("redis.conf"), "daemonize no\ndir ./\n").unwrap();
        let extra = r#"
[[steps]]
kind = "replace"
path = "redis.conf"
pattern = "dir ./"
replacement = "dir {{var}}/db/redis/"

[[steps]]
kind = "replace"
path = "redis.conf"
pattern = "^daemonize \\w+$"
replacement = "daemonize yes"
regex = true

[[steps]]
kind = "mkdir"
path = "{{prefix}}/share/redis"

[[steps]]
kind = "copy"
from = "redis.conf"
to = "etc/"
"#;
        run(&formula(extra), &fx).unwrap();
        let staged = fx.dirs.staged_prefix();
        assert!(staged.join("share/redis").is_dir());
        let conf = std::fs::read_to_string(staged.join("etc/redis.conf")).unwrap();
        assert_eq!(
            conf,
            format!(
                "daemonize yes\ndir {}/var/db/redis/\n",
                fx.dirs.shared_prefix.display()
            )
        );
    }

    #[test]
    fn test_regex_anchors_match_per_line() {
        let fx = fixture();
        std::fs::write(
            fx.dirs.source_dir.join("redis.conf"),
            "# bind 10.0.0.1\nbind 127.0.0.1 ::1\nport 6379\n",
        )
        .unwrap();
        let extra = r#"
[[steps]]
kind = "replace"
path = "redis.conf"
pattern = "^bind .*$"
replacement = "bind 127.0.0.1 ::1 -::*"
regex = true
"#;
        run(&formula(extra), &fx).unwrap();
        assert_eq!(
            std::fs::read_to_string(fx.dirs.source_dir.join("redis.conf")).unwrap(),
            "# bind 10.0.0.1\nbind 127.0.0.1 ::1 -::*\nport 6379\n"
        );
    }

    #[test]
    fn test_builtin_steps_cannot_write_outside_the_keg() {
        let fx = fixture();
        let extra = "[[steps]]\nkind = \"mkdir\"\npath = \"/tmp/keg-outside\"\n";
        assert!(matches!(
            run(&formula(extra), &fx).unwrap_err(),
            BuildError::Step { index: 0, .. }
        ));
    }

    #[test]
    fn test_replace_without_match_fails() {
        let fx = fixture();
        std::fs::write(fx.dirs.source_dir.join("Makefile"), "CC=gcc\n").unwrap();
        let extra = "[[steps]]\nkind = \"replace\"\npath = \"Makefile\"\npattern = \"CC=clang\"\nreplacement = \"x\"\n";
        assert!(matches!(
            run(&formula(extra), &fx).unwrap_err(),
            BuildError::Step { index: 0, .. }
        ));
    }

    #[test]
    fn test_mkdir_cannot_escape_stage() {
        let fx = fixture();
        let extra = "[[steps]]\nkind = \"mkdir\"\npath = \"../outside\"\n";
        assert!(run(&formula(extra), &fx).is_err());
        assert!(!fx.dirs.work_dir.join("outside").exists());
    }

    #[test]
    fn test_step_timeout() {
        let fx = fixture();
        let f = formula(&sh("sleep 20"));
        let mut s = settings();
        s.step_timeout = Duration::from_millis(200);
        let ctx = BuildContext::new(&f, fx.dirs.clone(), Vec::new(), &s).unwrap();
        match build(&f, &ctx, &NullReporter).unwrap_err() {
            BuildError::Timeout { index, .. } => assert_eq!(index, 0),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_absolute_stage_links_become_relative() {
        let fx = fixture();
        let f = formula(&sh(
            "cd $DESTDIR$PREFIX && mkdir -p bin && touch bin/bzgrep bin/bzip2 \
             && ln -s {{prefix}}/bin/bzgrep bin/bzegrep \
             && ln -s $DESTDIR$PREFIX/bin/bzip2 bin/bunzip2",
        ));
        run(&f, &fx).unwrap();
        let staged = fx.dirs.staged_prefix();
        let link = std::fs::read_link(staged.join("bin/bzegrep")).unwrap();
        assert_eq!(link, PathBuf::from("bzgrep"));
        let link = std::fs::read_link(staged.join("bin/bunzip2")).unwrap();
        assert_eq!(link, PathBuf::from("bzip2"));
    }

    #[test]
    fn test_relative_path_cross_dir() {
        let result = relative_path(Path::new("/a/b/lib"), Path::new("/a/b/bin/tool"));
        assert_eq!(result, PathBuf::from("../bin/tool"));
    }

    #[test]
    fn test_placeholder_expansion() {
        let mut p = Placeholders::new();
        p.set("prefix", "/opt/keg/Cellar/redis@5/5.0.14");
        assert_eq!(
            p.expand("PREFIX={{ prefix }}").unwrap(),
            "PREFIX=/opt/keg/Cellar/redis@5/5.0.14"
        );
        assert!(p.expand("{{missing}}").is_err());
        assert_eq!(p.expand("no braces").unwrap(), "no braces");
    }
}
