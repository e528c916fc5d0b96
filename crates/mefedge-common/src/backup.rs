//! Primary/backup file discipline.
//!
//! Every persisted security artifact exists at a primary path with a
//! `.backup` sibling. Writes land on the primary first via an atomic
//! rename, then refresh the backup. Reads prefer the primary and fall
//! back to (and repair from) the backup, so a crash at any point of a
//! write leaves at least one complete copy on disk.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::error::CommonError;
use crate::paths::backup_path;

/// Write `bytes` to `p` and its `.backup` sibling.
///
/// Order: temp file in the same directory → fsync → rename over `p` →
/// copy to `p.backup` → fsync. If the process dies after the rename
/// the backup is stale; the next read repairs it.
pub fn write_with_backup(p: &Path, bytes: &[u8]) -> Result<(), CommonError> {
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_sibling(p);
    {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, p)?;

    let bkp = backup_path(p);
    {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&bkp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    sync_parent(p);
    Ok(())
}

/// Read `p`, falling back to `p.backup`.
///
/// `valid` decides whether a loaded copy is acceptable (e.g. parses as
/// PEM). A good backup is copied back over a missing or invalid
/// primary before returning.
pub fn read_with_backup_validated<F>(p: &Path, valid: F) -> Result<Vec<u8>, CommonError>
where
    F: Fn(&[u8]) -> bool,
{
    let primary = fs::read(p).ok().filter(|b| valid(b));
    if let Some(bytes) = primary {
        repair_if_diverged(p, &bytes);
        return Ok(bytes);
    }

    let bkp = backup_path(p);
    let fallback = fs::read(&bkp).ok().filter(|b| valid(b));
    match fallback {
        Some(bytes) => {
            tracing::warn!(path = %p.display(), "primary missing or invalid, restoring from backup");
            // Repair the primary through the same atomic path.
            let tmp = tmp_sibling(p);
            fs::write(&tmp, &bytes)?;
            fs::rename(&tmp, p)?;
            Ok(bytes)
        }
        None => Err(CommonError::ContentMissing(p.display().to_string())),
    }
}

/// Read with no content validation beyond readability.
pub fn read_with_backup(p: &Path) -> Result<Vec<u8>, CommonError> {
    read_with_backup_validated(p, |_| true)
}

/// Remove both the primary and its backup. Missing files are fine.
pub fn remove_with_backup(p: &Path) -> Result<(), CommonError> {
    for path in [p.to_path_buf(), backup_path(p)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// True if either the primary or the backup exists.
pub fn exists_with_backup(p: &Path) -> bool {
    p.exists() || backup_path(p).exists()
}

fn repair_if_diverged(p: &Path, primary: &[u8]) {
    let bkp = backup_path(p);
    let stale = match fs::read(&bkp) {
        Ok(b) => b != primary,
        Err(_) => true,
    };
    if stale {
        tracing::warn!(path = %p.display(), "backup diverged from primary, rewriting");
        if let Err(e) = fs::write(&bkp, primary) {
            tracing::error!(error = %e, path = %bkp.display(), "backup repair failed");
        }
    }
}

fn tmp_sibling(p: &Path) -> std::path::PathBuf {
    let mut os = p.as_os_str().to_owned();
    os.push(".tmp");
    std::path::PathBuf::from(os)
}

fn sync_parent(p: &Path) {
    if let Some(parent) = p.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
