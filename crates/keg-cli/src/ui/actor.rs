//! UI Actor - Single-threaded event processing
//!
//! Pipeline tasks run concurrently but stdout is serial. Every UI operation
//! is sent to one thread that owns the terminal, so lines from parallel
//! builds never interleave mid-line.

use std::collections::HashSet;
use std::sync::mpsc;
use std::thread;

use crossterm::style::Stylize;
use keg_core::reporter::Phase;
use keg_schema::PackageName;

use super::theme::{Theme, format_size};

/// Events that can be sent to the UI actor
#[derive(Debug)]
pub enum UiEvent {
    PrintHeader {
        title: String,
    },
    PreparePipeline {
        items: Vec<(PackageName, String)>,
    },
    Phase {
        name: PackageName,
        version: String,
        phase: Phase,
    },
    Downloading {
        name: PackageName,
        version: String,
        current: u64,
        total: Option<u64>,
    },
    BuildStep {
        name: PackageName,
        index: usize,
        total: usize,
        label: String,
    },
    Removing {
        name: PackageName,
        version: String,
    },
    Done {
        name: PackageName,
        version: String,
        detail: String,
    },
    Failed {
        name: PackageName,
        version: String,
        reason: String,
    },
    Skipped {
        name: PackageName,
        version: String,
        dependency: PackageName,
    },
    Info(String),
    Success(String),
    Warning(String),
    Error(String),
    Summary {
        count: usize,
        action: String,
        elapsed_secs: f64,
    },
    /// Synchronize UI state (wait for all pending renders)
    Sync(mpsc::Sender<()>),
    Shutdown,
}

/// Handle to the UI actor thread
#[derive(Debug)]
pub struct UiActor {
    sender: mpsc::Sender<UiEvent>,
    handle: Option<thread::JoinHandle<()>>,
}

impl UiActor {
    /// Spawn a new UI actor thread. In quiet mode only failures, warnings
    /// and errors are printed.
    pub fn spawn(quiet: bool) -> Self {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::spawn(move || run_event_loop(&receiver, quiet));
        Self {
            sender,
            handle: Some(handle),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<UiEvent> {
        self.sender.clone()
    }
}

impl Drop for UiActor {
    fn drop(&mut self) {
        let _ = self.sender.send(UiEvent::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn pkg(theme: &Theme, name: &PackageName, version: &str) -> String {
    format!(
        "{} {}",
        format!("{:<w$}", name.as_str(), w = theme.layout.name_width).with(theme.colors.package_name),
        format!("{version:<w$}", w = theme.layout.version_width).with(theme.colors.secondary)
    )
}

fn run_event_loop(receiver: &mpsc::Receiver<UiEvent>, quiet: bool) {
    let theme = Theme::default();
    let icons = &theme.icons;
    let mut downloaded: HashSet<PackageName> = HashSet::new();

    while let Ok(event) = receiver.recv() {
        match event {
            UiEvent::PrintHeader { title } if !quiet => {
                println!();
                println!("{}", title.bold());
            }
            UiEvent::PreparePipeline { items } if !quiet => {
                for (name, version) in &items {
                    println!("  {} {}", icons.active.dark_grey(), pkg(&theme, name, version));
                }
                println!();
            }
            UiEvent::Phase {
                name,
                version,
                phase,
            } if !quiet => {
                println!(
                    "  {} {} {}",
                    icons.active.with(theme.colors.warning),
                    pkg(&theme, &name, &version),
                    phase.to_string().dark_grey()
                );
            }
            UiEvent::Downloading {
                name,
                version,
                current,
                total,
            } if !quiet => {
                let finished = total.is_some_and(|t| current >= t);
                if finished && downloaded.insert(name.clone()) {
                    println!(
                        "  {} {} {}",
                        icons.active.dark_grey(),
                        pkg(&theme, &name, &version),
                        format!("fetched {}", format_size(current)).dark_grey()
                    );
                }
            }
            UiEvent::BuildStep {
                name,
                index,
                total,
                label,
            } if !quiet => {
                println!(
                    "    {} {}",
                    format!("{name} [{}/{total}]", index + 1).dark_grey(),
                    label
                );
            }
            UiEvent::Removing { name, version } if !quiet => {
                println!(
                    "  {} {} {}",
                    icons.active.with(theme.colors.warning),
                    pkg(&theme, &name, &version),
                    "removing".dark_grey()
                );
            }
            UiEvent::Done {
                name,
                version,
                detail,
            } if !quiet => {
                println!(
                    "  {} {} {}",
                    icons.success.with(theme.colors.success),
                    pkg(&theme, &name, &version),
                    detail.with(theme.colors.success)
                );
            }
            UiEvent::Failed {
                name,
                version,
                reason,
            } => {
                println!(
                    "  {} {} {}",
                    icons.error.with(theme.colors.error),
                    pkg(&theme, &name, &version),
                    reason.with(theme.colors.error)
                );
            }
            UiEvent::Skipped {
                name,
                version,
                dependency,
            } => {
                println!(
                    "  {} {} {}",
                    icons.skipped.dark_grey(),
                    pkg(&theme, &name, &version),
                    format!("skipped ({dependency} failed)").dark_grey()
                );
            }
            UiEvent::Info(msg) if !quiet => {
                println!("  {} {msg}", icons.info);
            }
            UiEvent::Success(msg) if !quiet => {
                println!();
                println!("  {} {}", icons.success.with(theme.colors.success), msg.bold());
            }
            UiEvent::Warning(msg) => {
                println!("  {} {}", icons.warning.with(theme.colors.warning), msg);
            }
            UiEvent::Error(msg) => {
                eprintln!("  {} {}", icons.error.with(theme.colors.error), msg.red());
            }
            UiEvent::Summary {
                count,
                action,
                elapsed_secs,
            } if !quiet => {
                println!();
                println!(
                    "  {} {}",
                    icons.success.with(theme.colors.success),
                    format!("{} {count}, elapsed {elapsed_secs:.1}s", action.to_uppercase()).bold()
                );

                // JSON result line for CI
                let result_json = serde_json::json!({
                    "operation": action,
                    "count": count,
                    "elapsed": elapsed_secs
                });
                println!("\nRESULT {result_json}");
            }
            UiEvent::Sync(tx) => {
                // All previous events are processed because of sequential mpsc
                let _ = tx.send(());
            }
            UiEvent::Shutdown => break,
            _ => {}
        }
    }
}
