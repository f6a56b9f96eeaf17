//! Per-clone advisory lock.
//!
//! Every operation that reads and writes the mirror or a workspace holds
//! `<git-common-dir>/trellis/lock` for its duration. The lock only keeps
//! two `trl` processes in one clone apart; clones never share it, and
//! cross-clone safety comes from git refusing non-fast-forward pushes.
//!
//! The holder writes `pid <n>` into the file so a waiter that times out can
//! say who it was waiting for. The content is informational only; the
//! `flock` is what excludes.

use crate::error::ErrorCode;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const FIRST_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{} is held{} after waiting {waited:?}", .path.display(), holder_suffix(.holder.as_deref()))]
    Timeout {
        path: PathBuf,
        waited: Duration,
        /// What the holder wrote into the lock file, if readable.
        holder: Option<String>,
    },

    #[error("lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn holder_suffix(holder: Option<&str>) -> String {
    holder.map_or_else(String::new, |h| format!(" by {h}"))
}

impl LockError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::Io { .. } => ErrorCode::StoreWriteFailed,
        }
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct MirrorLock {
    file: File,
    path: PathBuf,
}

impl MirrorLock {
    /// Take the lock at `path`, polling with backoff for up to `timeout`.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] if another process still holds it, or
    /// [`LockError::Io`] if the file cannot be created.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        let start = Instant::now();
        let mut backoff = FIRST_BACKOFF;
        while file.try_lock_exclusive().is_err() {
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited,
                    holder: read_holder(&mut file),
                });
            }
            thread::sleep(backoff.min(timeout.saturating_sub(waited)));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        stamp_holder(&mut file).map_err(io_err)?;
        debug!(path = %path.display(), waited = ?start.elapsed(), "lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MirrorLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

fn stamp_holder(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "pid {}", std::process::id())?;
    file.flush()
}

fn read_holder(file: &mut File) -> Option<String> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn acquire_creates_parents_and_records_the_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trellis").join("lock");
        let lock = MirrorLock::acquire(&path, Duration::from_millis(50)).unwrap();
        assert_eq!(lock.path(), path.as_path());
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, format!("pid {}\n", std::process::id()));
        drop(lock);
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn second_acquire_times_out_naming_the_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let _guard = MirrorLock::acquire(&path, Duration::from_millis(50)).unwrap();
        let err = MirrorLock::acquire(&path, Duration::from_millis(20)).unwrap_err();

        match &err {
            LockError::Timeout { path: p, holder, .. } => {
                assert_eq!(p, &path);
                assert_eq!(holder.as_deref(), Some(format!("pid {}", std::process::id()).as_str()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(err.code(), ErrorCode::LockContention);
        assert!(err.to_string().contains("held by pid"));
        assert!(err.hint().is_some());
    }

    #[test]
    fn waiter_gets_the_lock_once_the_holder_drops_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock");
        let held = Arc::new(Barrier::new(2));

        let holder_path = path.clone();
        let holder_held = Arc::clone(&held);
        let handle = thread::spawn(move || {
            let guard = MirrorLock::acquire(&holder_path, Duration::from_millis(200)).unwrap();
            holder_held.wait();
            thread::sleep(Duration::from_millis(30));
            drop(guard);
        });

        held.wait();
        let lock = MirrorLock::acquire(&path, Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
        drop(lock);
    }
}
