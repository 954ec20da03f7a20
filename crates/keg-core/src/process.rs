//! External command execution with an explicit environment and a deadline.
//!
//! Every command runs with a cleared environment populated from the caller's
//! map, in its own process group, with stdout and stderr redirected to files.
//! On timeout the whole group is killed so that children spawned by `make`
//! or a configure script do not outlive the step.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Exit code reported for commands that cannot be spawned.
pub const SPAWN_FAILURE_EXIT: i32 = 127;

/// One command invocation.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    /// Program followed by its arguments.
    pub args: &'a [String],
    /// Working directory.
    pub cwd: &'a Path,
    /// Complete environment of the child.
    pub env: &'a BTreeMap<String, String>,
    /// File receiving stdout.
    pub stdout: &'a Path,
    /// File receiving stderr.
    pub stderr: &'a Path,
    /// Wall-clock limit.
    pub timeout: Duration,
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The process exited (signals map to `128 + signo`).
    Code(i32),
    /// The deadline passed and the process group was killed.
    TimedOut,
}

impl Exit {
    /// Whether the command exited with status 0.
    pub fn success(self) -> bool {
        self == Self::Code(0)
    }
}

/// Locate `program` on the `PATH` of the child environment.
fn resolve_program(program: &str, env: &BTreeMap<String, String>, cwd: &Path) -> Option<PathBuf> {
    if program.contains('/') {
        let candidate = cwd.join(program);
        return candidate.is_file().then_some(candidate);
    }
    let path = env.get("PATH").map(String::as_str).unwrap_or_default();
    which::which_in(program, Some(path), cwd).ok()
}

/// Run a command to completion or until its deadline.
///
/// Commands that cannot be found or spawned are reported as exit code
/// [`SPAWN_FAILURE_EXIT`] with the reason written to the stderr file.
///
/// # Errors
///
/// Returns an error only if the log files cannot be created or waiting on
/// the child fails.
pub fn run(inv: &Invocation<'_>) -> std::io::Result<Exit> {
    let stdout = File::create(inv.stdout)?;
    let stderr = File::create(inv.stderr)?;

    let Some((program, rest)) = inv.args.split_first() else {
        std::fs::write(inv.stderr, "empty command\n")?;
        return Ok(Exit::Code(SPAWN_FAILURE_EXIT));
    };

    let Some(resolved) = resolve_program(program, inv.env, inv.cwd) else {
        std::fs::write(inv.stderr, format!("{program}: command not found\n"))?;
        return Ok(Exit::Code(SPAWN_FAILURE_EXIT));
    };

    let mut cmd = Command::new(&resolved);
    cmd.args(rest)
        .current_dir(inv.cwd)
        .env_clear()
        .envs(inv.env)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning {} in {}", inv.args.join(" "), inv.cwd.display());
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            std::fs::write(inv.stderr, format!("{program}: {e}\n"))?;
            return Ok(Exit::Code(SPAWN_FAILURE_EXIT));
        }
    };

    if let Some(status) = child.wait_timeout(inv.timeout)? {
        return Ok(Exit::Code(exit_code(status)));
    }

    warn!(
        "{} timed out after {}s, killing process group",
        program,
        inv.timeout.as_secs()
    );
    kill_group(child.id());
    let _ = child.kill();
    let _ = child.wait();
    Ok(Exit::TimedOut)
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the child was started with
    // process_group(0) so its pid is the group id and it has not been reaped.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

/// Read the last N lines from a file efficiently.
///
/// Seeks to near the end and reads a fixed-size tail buffer so that huge
/// build logs are never loaded whole.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn read_last_lines(path: &Path, n: usize) -> std::io::Result<String> {
    use std::io::{Read, Seek, SeekFrom};

    const TAIL_SIZE: u64 = 16 * 1024;

    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();

    let seek_pos = file_len.saturating_sub(TAIL_SIZE);
    file.seek(SeekFrom::Start(seek_pos))?;

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let buffer = String::from_utf8_lossy(&bytes);

    // If we seeked mid-file, skip the first (partial) line
    let content = if seek_pos > 0 {
        buffer.find('\n').map_or(&*buffer, |idx| &buffer[idx + 1..])
    } else {
        &*buffer
    };

    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].join("\n"))
}
