//! Recovery after an interrupted install or upgrade, plus the log
//! repair flow.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use mefedge_common::paths::PathLayout;
use mefedge_common::registry::ConfigRegistry;

use crate::error::LifecycleError;
use crate::slots::{SlotManager, SLOT_A, SLOT_B, STAGING_SLOT};
use crate::upgrade::copy_dir_recursive;

/// Run log files beyond this size are rotated aside.
const MAX_LOG_BYTES: u64 = 50 * 1024 * 1024;

pub struct RecoveryFlow {
    layout: PathLayout,
}

impl RecoveryFlow {
    pub fn new(layout: PathLayout) -> Self {
        RecoveryFlow { layout }
    }

    /// Bring the tree back to a consistent idle state: drop staging
    /// leftovers, restore missing config from the backup snapshot and
    /// repair the software symlink.
    pub fn run(&self, registry: &ConfigRegistry) -> Result<(), LifecycleError> {
        let slots = SlotManager::new(self.layout.clone());
        slots.remove_slot(STAGING_SLOT)?;

        self.restore_config()?;
        self.repair_symlink(&slots)?;

        registry.clear_active_alarms()?;
        tracing::info!("recovery complete");
        Ok(())
    }

    fn restore_config(&self) -> Result<(), LifecycleError> {
        let backup = self.layout.config_backup_dir();
        let config = self.layout.config_root();
        if !backup.is_dir() {
            return Ok(());
        }
        if !config.is_dir() {
            tracing::warn!("config tree missing, restoring from backup snapshot");
            copy_dir_recursive(&backup, &config)?;
        }
        Ok(())
    }

    /// If the symlink is gone or dangling, point it at any slot that
    /// still carries a valid version file.
    fn repair_symlink(&self, slots: &SlotManager) -> Result<(), LifecycleError> {
        if let Ok(active) = slots.active_slot() {
            if slots.read_version(&active).is_ok() {
                return Ok(());
            }
        }
        for slot in [SLOT_A, SLOT_B] {
            if slots.read_version(slot).is_ok() {
                tracing::warn!(slot, "software symlink repaired");
                return slots.flip_to(slot);
            }
        }
        Err(LifecycleError::EffectFailed(
            "no slot with a valid version file remains".into(),
        ))
    }
}

/// Repair the log tree: owner-only permissions and rotation of
/// oversized files.
pub fn recover_logs(log_dir: &Path) -> Result<usize, LifecycleError> {
    recover_logs_with_limit(log_dir, MAX_LOG_BYTES)
}

fn recover_logs_with_limit(log_dir: &Path, max_bytes: u64) -> Result<usize, LifecycleError> {
    if !log_dir.is_dir() {
        return Err(LifecycleError::Common(
            mefedge_common::error::CommonError::PathNotExist(log_dir.display().to_string()),
        ));
    }
    let mut repaired = 0;
    set_mode(log_dir, 0o700);
    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            repaired += recover_logs_with_limit(&path, max_bytes)?;
            continue;
        }
        set_mode(&path, 0o600);
        let len = entry.metadata()?.len();
        if len > max_bytes {
            let mut rotated = path.as_os_str().to_owned();
            rotated.push(".1");
            fs::rename(&path, &rotated)?;
            fs::write(&path, b"")?;
            set_mode(&path, 0o600);
            tracing::info!(file = %path.display(), size = len, "oversized log rotated");
            repaired += 1;
        }
    }
    Ok(repaired)
}

fn set_mode(path: &Path, mode: u32) {
    if let Ok(meta) = fs::metadata(path) {
        let mut perms = meta.permissions();
        if perms.mode() & 0o7777 != mode {
            perms.set_mode(mode);
            let _ = fs::set_permissions(path, perms);
        }
    }
}
