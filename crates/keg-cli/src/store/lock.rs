//! Cross-process lock on the shared prefix.
//!
//! Two `keg` processes against the same home must not plan and apply links
//! at the same time. The lock is an `flock` on `KEG_HOME/.lock`, released
//! when the guard is dropped or the process exits.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info};

/// Exclusive hold on the prefix lock file.
#[derive(Debug)]
pub struct PrefixLock {
    file: File,
    path: PathBuf,
}

impl PrefixLock {
    /// Block until the lock at `path` is held exclusively.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or locked.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        if file.try_lock_exclusive().is_err() {
            info!("waiting for another keg process to release {}", path.display());
            file.lock_exclusive()?;
        }
        debug!("acquired {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PrefixLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("failed to release {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_second_holder_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");

        let first = PrefixLock::acquire(&path).unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let waiter = {
            let path = path.clone();
            let acquired = Arc::clone(&acquired);
            std::thread::spawn(move || {
                let _second = PrefixLock::acquire(&path).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(200));
        assert!(!acquired.load(Ordering::SeqCst), "lock must be exclusive");

        drop(first);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_lock_file_is_created_and_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lock");
        drop(PrefixLock::acquire(&path).unwrap());
        assert!(path.is_file());
        drop(PrefixLock::acquire(&path).unwrap());
    }
}
