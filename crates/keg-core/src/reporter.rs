//! Reporter trait for dependency injection
//!
//! Core logic reports progress and status through this trait without being
//! coupled to a specific terminal implementation.

use keg_schema::PackageName;

/// Pipeline phase a package is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Downloading or checking out sources.
    Fetch,
    /// Running build steps.
    Build,
    /// Moving into the Cellar and linking into the shared prefix.
    Link,
    /// Running smoke-test assertions.
    Test,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fetch => "fetch",
            Self::Build => "build",
            Self::Link => "link",
            Self::Test => "test",
        };
        f.write_str(s)
    }
}

pub trait Reporter: Send + Sync {
    /// Indicates a new section has started (e.g. "Resolving", "Installing").
    fn section(&self, title: &str);

    /// Reserve space for the packages of a plan, in order.
    fn prepare_pipeline(&self, packages: &[(PackageName, String)]);

    /// A package entered a new phase.
    fn phase(&self, name: &PackageName, version: &str, phase: Phase);

    /// Updates the progress of a download.
    fn downloading(&self, name: &PackageName, version: &str, current: u64, total: Option<u64>);

    /// A build step started (`index` is zero-based).
    fn build_step(&self, name: &PackageName, version: &str, index: usize, total: usize, label: &str);

    /// Updates the state of a package to 'removing'.
    fn removing(&self, name: &PackageName, version: &str);

    /// Marks a package operation as successfully completed.
    fn done(&self, name: &PackageName, version: &str, detail: &str);

    /// Marks a package operation as failed with a specific reason.
    fn failed(&self, name: &PackageName, version: &str, reason: &str);

    /// A package was not attempted because a dependency failed.
    fn skipped(&self, name: &PackageName, version: &str, failed_dependency: &PackageName);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a success message.
    fn success(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);

    /// Log an error message.
    fn error(&self, msg: &str);

    /// Display a final summary of multiple operations.
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn section(&self, title: &str) {
        (**self).section(title);
    }
    fn prepare_pipeline(&self, packages: &[(PackageName, String)]) {
        (**self).prepare_pipeline(packages);
    }
    fn phase(&self, name: &PackageName, version: &str, phase: Phase) {
        (**self).phase(name, version, phase);
    }
    fn downloading(&self, name: &PackageName, version: &str, current: u64, total: Option<u64>) {
        (**self).downloading(name, version, current, total);
    }
    fn build_step(&self, name: &PackageName, version: &str, index: usize, total: usize, label: &str) {
        (**self).build_step(name, version, index, total, label);
    }
    fn removing(&self, name: &PackageName, version: &str) {
        (**self).removing(name, version);
    }
    fn done(&self, name: &PackageName, version: &str, detail: &str) {
        (**self).done(name, version, detail);
    }
    fn failed(&self, name: &PackageName, version: &str, reason: &str) {
        (**self).failed(name, version, reason);
    }
    fn skipped(&self, name: &PackageName, version: &str, failed_dependency: &PackageName) {
        (**self).skipped(name, version, failed_dependency);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn success(&self, msg: &str) {
        (**self).success(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn error(&self, msg: &str) {
        (**self).error(msg);
    }
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        (**self).summary(count, action, elapsed_secs);
    }
}

/// A no-op reporter for silent operations (e.g., testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn section(&self, _: &str) {}
    fn prepare_pipeline(&self, _: &[(PackageName, String)]) {}
    fn phase(&self, _: &PackageName, _: &str, _: Phase) {}
    fn downloading(&self, _: &PackageName, _: &str, _: u64, _: Option<u64>) {}
    fn build_step(&self, _: &PackageName, _: &str, _: usize, _: usize, _: &str) {}
    fn removing(&self, _: &PackageName, _: &str) {}
    fn done(&self, _: &PackageName, _: &str, _: &str) {}
    fn failed(&self, _: &PackageName, _: &str, _: &str) {}
    fn skipped(&self, _: &PackageName, _: &str, _: &PackageName) {}
    fn info(&self, _: &str) {}
    fn success(&self, _: &str) {}
    fn warning(&self, _: &str) {}
    fn error(&self, _: &str) {}
    fn summary(&self, _: usize, _: &str, _: f64) {}
}
