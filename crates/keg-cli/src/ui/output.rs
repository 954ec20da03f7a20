//! Unified UI output interface.
//!
//! Commands and the install pipeline talk to the terminal through [`Output`],
//! which forwards every call to the UI actor.

use std::sync::{Arc, mpsc};

use keg_core::Reporter;
use keg_core::reporter::Phase;
use keg_schema::PackageName;

use super::actor::{UiActor, UiEvent};

/// A cloneable handle for sending UI events to the terminal actor.
#[derive(Debug, Clone)]
pub struct Output {
    sender: mpsc::Sender<UiEvent>,
    _actor: Arc<UiActor>,
}

impl Output {
    pub fn new(quiet: bool) -> Self {
        let actor = UiActor::spawn(quiet);
        Self {
            sender: actor.sender(),
            _actor: Arc::new(actor),
        }
    }

    fn send(&self, event: UiEvent) {
        let _ = self.sender.send(event);
    }

    /// Block until all pending UI events are processed.
    pub fn wait(&self) {
        let (tx, rx) = mpsc::channel();
        self.send(UiEvent::Sync(tx));
        let _ = rx.recv();
    }
}

impl Reporter for Output {
    fn section(&self, title: &str) {
        self.send(UiEvent::PrintHeader {
            title: title.to_string(),
        });
    }

    fn prepare_pipeline(&self, packages: &[(PackageName, String)]) {
        self.send(UiEvent::PreparePipeline {
            items: packages.to_vec(),
        });
    }

    fn phase(&self, name: &PackageName, version: &str, phase: Phase) {
        self.send(UiEvent::Phase {
            name: name.clone(),
            version: version.to_string(),
            phase,
        });
    }

    fn downloading(&self, name: &PackageName, version: &str, current: u64, total: Option<u64>) {
        self.send(UiEvent::Downloading {
            name: name.clone(),
            version: version.to_string(),
            current,
            total,
        });
    }

    fn build_step(&self, name: &PackageName, _version: &str, index: usize, total: usize, label: &str) {
        self.send(UiEvent::BuildStep {
            name: name.clone(),
            index,
            total,
            label: label.to_string(),
        });
    }

    fn removing(&self, name: &PackageName, version: &str) {
        self.send(UiEvent::Removing {
            name: name.clone(),
            version: version.to_string(),
        });
    }

    fn done(&self, name: &PackageName, version: &str, detail: &str) {
        self.send(UiEvent::Done {
            name: name.clone(),
            version: version.to_string(),
            detail: detail.to_string(),
        });
    }

    fn failed(&self, name: &PackageName, version: &str, reason: &str) {
        self.send(UiEvent::Failed {
            name: name.clone(),
            version: version.to_string(),
            reason: reason.to_string(),
        });
    }

    fn skipped(&self, name: &PackageName, version: &str, failed_dependency: &PackageName) {
        self.send(UiEvent::Skipped {
            name: name.clone(),
            version: version.to_string(),
            dependency: failed_dependency.clone(),
        });
    }

    fn info(&self, msg: &str) {
        self.send(UiEvent::Info(msg.to_string()));
    }

    fn success(&self, msg: &str) {
        self.send(UiEvent::Success(msg.to_string()));
    }

    fn warning(&self, msg: &str) {
        self.send(UiEvent::Warning(msg.to_string()));
    }

    fn error(&self, msg: &str) {
        self.send(UiEvent::Error(msg.to_string()));
    }

    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        self.send(UiEvent::Summary {
            count,
            action: action.to_string(),
            elapsed_secs,
        });
    }
}
