//! Upgrade prepare phase.
//!
//! Verifies the package against its digest manifest, checks disk
//! space (additive when extract and install share a partition),
//! unpacks into the staging slot and copies the current config
//! forward. The active slot is untouched; a failure here is fully
//! recoverable.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use mefedge_common::exec;
use mefedge_common::paths::PathLayout;

use crate::error::LifecycleError;
use crate::slots::{SlotManager, STAGING_SLOT};

const MANIFEST_FILE: &str = "package.sha256";

#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    pub pkg_dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_backup_dir: PathBuf,
}

pub struct Preparer {
    layout: PathLayout,
}

impl Preparer {
    pub fn new(layout: PathLayout) -> Self {
        Preparer { layout }
    }

    pub fn run(&self, opts: &UpgradeOptions) -> Result<(), LifecycleError> {
        verify_package(&opts.pkg_dir)?;
        self.check_disk_space(&opts.pkg_dir)?;

        let staging = self.layout.slot_dir(STAGING_SLOT);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        unpack(&opts.pkg_dir, &staging)?;

        // staging must carry a parseable version before effect will touch it
        let slots = SlotManager::new(self.layout.clone());
        let version = slots.read_version(STAGING_SLOT)?;

        self.backup_config()?;
        tracing::info!(version = %version.inner_version, "upgrade prepared");
        Ok(())
    }

    /// Extract and install cost are additive when the package and the
    /// install root live on the same partition.
    fn check_disk_space(&self, pkg_dir: &Path) -> Result<(), LifecycleError> {
        let pkg_bytes = dir_size(pkg_dir)?;
        let same_partition = device_of(pkg_dir) == device_of(self.layout.root());
        let needed = if same_partition {
            pkg_bytes * 2
        } else {
            pkg_bytes
        };
        let available = available_bytes(self.layout.root())?;
        if available < needed {
            return Err(LifecycleError::DiskFull { needed, available });
        }
        Ok(())
    }

    fn backup_config(&self) -> Result<(), LifecycleError> {
        backup_config(&self.layout)
    }
}

/// Snapshot the whole config tree (DB included) into the backup
/// directory. Runs before and after every slot change.
pub(crate) fn backup_config(layout: &PathLayout) -> Result<(), LifecycleError> {
    let src = layout.config_root();
    let dst = layout.config_backup_dir();
    if dst.exists() {
        fs::remove_dir_all(&dst)?;
    }
    if src.is_dir() {
        copy_dir_recursive(&src, &dst)?;
    }
    Ok(())
}

/// Check every file listed in the digest manifest. A package without a
/// manifest, or with any mismatching digest, is rejected.
pub fn verify_package(pkg_dir: &Path) -> Result<(), LifecycleError> {
    let manifest = pkg_dir.join(MANIFEST_FILE);
    let text = fs::read_to_string(&manifest)
        .map_err(|_| LifecycleError::VerifyPackage(format!("missing {MANIFEST_FILE}")))?;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((expected, file)) = line.split_once("  ") else {
            return Err(LifecycleError::VerifyPackage(format!(
                "malformed manifest line: {line}"
            )));
        };
        let path = pkg_dir.join(file.trim());
        let bytes = fs::read(&path).map_err(|_| {
            LifecycleError::VerifyPackage(format!("listed file missing: {}", file.trim()))
        })?;
        let actual = hex(&Sha256::digest(&bytes));
        if actual != expected.to_ascii_lowercase() {
            return Err(LifecycleError::VerifyPackage(format!(
                "digest mismatch for {}",
                file.trim()
            )));
        }
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Unpack the package: a directory is copied, a tarball goes through
/// tar.
fn unpack(pkg: &Path, dst: &Path) -> Result<(), LifecycleError> {
    if pkg.is_dir() {
        copy_dir_recursive(pkg, dst)?;
        return Ok(());
    }
    fs::create_dir_all(dst)?;
    let pkg_s = pkg.to_string_lossy();
    let dst_s = dst.to_string_lossy();
    let out = exec::run("tar", &["-xf", &pkg_s, "-C", &dst_s])?;
    if !out.status_ok {
        return Err(LifecycleError::VerifyPackage(format!(
            "unpack failed: {}",
            out.stderr.trim()
        )));
    }
    Ok(())
}

pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), LifecycleError> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let ty = entry.file_type()?;
        if ty.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if ty.is_file() {
            fs::copy(entry.path(), target)?;
        }
        // sockets/fifos in a package are an error elsewhere; symlinks
        // are resolved by fs::copy above
    }
    Ok(())
}

fn dir_size(dir: &Path) -> Result<u64, LifecycleError> {
    if dir.is_file() {
        return Ok(fs::metadata(dir)?.len());
    }
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        if ty.is_dir() {
            total += dir_size(&entry.path())?;
        } else if ty.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

fn device_of(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).map(|m| m.dev()).unwrap_or(0)
}

/// Free bytes on the filesystem holding `path`.
fn available_bytes(path: &Path) -> Result<u64, LifecycleError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| LifecycleError::Param("path contains NUL".into()))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated string and stat is a
    // zeroed out-parameter of the right type.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(LifecycleError::Common(std::io::Error::last_os_error().into()));
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}
