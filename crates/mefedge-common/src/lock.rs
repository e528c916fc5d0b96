//! Process-singleton lock.
//!
//! A named lock file under `/run` holding `pid\nreason`. Acquisition is
//! a non-blocking exclusive `flock`, so at most one install, upgrade,
//! effect or recovery flow runs on the node at a time.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::CommonError;

const LOCK_MODE: u32 = 0o600;

/// Held process-singleton lock. Released on [`SingletonLock::unlock`]
/// or drop.
#[derive(Debug)]
pub struct SingletonLock {
    path: PathBuf,
    file: Option<File>,
}

impl SingletonLock {
    /// Acquire the named lock, recording why it is held.
    ///
    /// A pre-existing lock file that fails the owner/permission check
    /// is removed before opening. On contention the holder's recorded
    /// `pid\nreason` is surfaced in the error.
    pub fn lock(path: impl Into<PathBuf>, reason: &str) -> Result<Self, CommonError> {
        let path = path.into();
        remove_if_untrusted(&path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(LOCK_MODE)
            .open(&path)?;

        if !try_flock_exclusive(&file)? {
            let (pid, reason) = read_holder(&file);
            tracing::warn!(pid, reason = %reason, "singleton lock already held");
            return Err(CommonError::AlreadyHeld { pid, reason });
        }

        let mut file = file;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}\n{}", std::process::id(), reason)?;
        file.sync_all()?;

        tracing::info!(path = %path.display(), reason, "singleton lock acquired");
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Release the advisory lock. Safe to call more than once.
    pub fn unlock(&mut self) {
        if let Some(file) = self.file.take() {
            let fd = file.as_raw_fd();
            // SAFETY: fd is valid for the lifetime of `file`.
            unsafe {
                libc::flock(fd, libc::LOCK_UN);
            }
            tracing::info!(path = %self.path.display(), "singleton lock released");
        }
    }

    /// Overwrite the recorded reason, e.g. with a failure description
    /// left behind for the operator.
    pub fn record_reason(&mut self, reason: &str) -> Result<(), CommonError> {
        if let Some(file) = self.file.as_mut() {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            write!(file, "{}\n{}", std::process::id(), reason)?;
            file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Non-blocking exclusive flock. Ok(false) means another process holds it.
fn try_flock_exclusive(file: &File) -> Result<bool, CommonError> {
    let fd = file.as_raw_fd();
    // SAFETY: flock is a standard POSIX call on a valid descriptor.
    let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err.into())
}

/// Drop a lock file owned by someone else or with loose permissions.
fn remove_if_untrusted(path: &Path) {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };
    let loose = meta.permissions().mode() & 0o077 != 0;
    let foreign = meta.uid() != unsafe { libc::getuid() };
    if !meta.is_file() || loose || foreign {
        tracing::warn!(path = %path.display(), "removing untrusted lock file");
        let _ = fs::remove_file(path);
    }
}

fn read_holder(file: &File) -> (u32, String) {
    let mut contents = String::new();
    let mut f = file;
    let _ = f.seek(SeekFrom::Start(0));
    let _ = f.read_to_string(&mut contents);
    let mut lines = contents.lines();
    let pid = lines.next().and_then(|l| l.parse().ok()).unwrap_or(0);
    let reason = lines.next().unwrap_or("unknown").to_string();
    (pid, reason)
}
