//! A/B software slots and the atomic symlink flip.
//!
//! `<root>/software` always points at one canonical slot. An upgrade
//! stages into `software_staging`, effect renames it to the inactive
//! canonical name and swaps the symlink in one rename, so readers see
//! either the old tree or the new one, never a half state.

use std::fs;
use std::os::unix::fs as unix_fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use mefedge_common::exec;
use mefedge_common::paths::{PathLayout, COMPONENTS};

use crate::error::LifecycleError;

pub const SLOT_A: &str = "software_A";
pub const SLOT_B: &str = "software_B";
pub const STAGING_SLOT: &str = "software_staging";

const VERSION_FILE: &str = "version.xml";

/// Contents of a slot's `version.xml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "version")]
pub struct VersionInfo {
    #[serde(rename = "innerVersion")]
    pub inner_version: String,
    #[serde(rename = "pkgName")]
    pub pkg_name: String,
}

pub struct SlotManager {
    layout: PathLayout,
}

impl SlotManager {
    pub fn new(layout: PathLayout) -> Self {
        SlotManager { layout }
    }

    pub fn layout(&self) -> &PathLayout {
        &self.layout
    }

    pub fn slot_path(&self, slot: &str) -> PathBuf {
        self.layout.slot_dir(slot)
    }

    /// Name of the slot the `software` symlink currently resolves to.
    pub fn active_slot(&self) -> Result<String, LifecycleError> {
        let target = fs::read_link(self.layout.software_link())?;
        target
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| LifecycleError::Param("software symlink has no slot name".into()))
    }

    pub fn other_slot(slot: &str) -> &'static str {
        if slot == SLOT_A {
            SLOT_B
        } else {
            SLOT_A
        }
    }

    // ── version file ──

    pub fn read_version(&self, slot: &str) -> Result<VersionInfo, LifecycleError> {
        let path = self.slot_path(slot).join(VERSION_FILE);
        let text = fs::read_to_string(&path)
            .map_err(|_| LifecycleError::Xml(format!("missing {}", path.display())))?;
        quick_xml::de::from_str(&text).map_err(|e| LifecycleError::Xml(e.to_string()))
    }

    pub fn write_version(&self, slot: &str, info: &VersionInfo) -> Result<(), LifecycleError> {
        let xml = quick_xml::se::to_string(info).map_err(|e| LifecycleError::Xml(e.to_string()))?;
        let path = self.slot_path(slot).join(VERSION_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, xml)?;
        Ok(())
    }

    // ── symlink flip ──

    /// Point `software` at `slot`. Refuses a slot without a parseable
    /// version file. The switch itself is a rename, so concurrent
    /// readers see one complete target or the other.
    pub fn flip_to(&self, slot: &str) -> Result<(), LifecycleError> {
        self.read_version(slot)?;

        let link = self.layout.software_link();
        let staged = link.with_extension("swap");
        let _ = fs::remove_file(&staged);
        unix_fs::symlink(self.slot_path(slot), &staged)?;
        fs::rename(&staged, &link)?;
        tracing::info!(slot, "software symlink flipped");
        Ok(())
    }

    // ── slot removal and immutability ──

    /// Remove a slot tree, clearing immutable flags first.
    pub fn remove_slot(&self, slot: &str) -> Result<(), LifecycleError> {
        let path = self.slot_path(slot);
        if !path.exists() {
            return Ok(());
        }
        unset_immutable(&path);
        fs::remove_dir_all(&path)?;
        tracing::info!(slot, "slot removed");
        Ok(())
    }

    /// Mark a slot immutable except each component's `var` subtree.
    pub fn protect_slot(&self, slot: &str) {
        let path = self.slot_path(slot);
        set_immutable(&path);
        for comp in COMPONENTS {
            unset_immutable(&path.join(comp).join("var"));
        }
    }
}

// chattr may be absent or the filesystem may not support attributes;
// both are non-fatal.
fn set_immutable(path: &Path) {
    run_chattr("+i", path);
}

fn unset_immutable(path: &Path) {
    run_chattr("-i", path);
}

fn run_chattr(flag: &str, path: &Path) {
    if !path.exists() {
        return;
    }
    let p = path.to_string_lossy();
    match exec::run("chattr", &["-R", flag, &p]) {
        Ok(out) if !out.status_ok => {
            tracing::debug!(path = %p, flag, stderr = %out.stderr.trim(), "chattr refused");
        }
        Err(e) => {
            tracing::debug!(path = %p, flag, error = %e, "chattr unavailable");
        }
        Ok(_) => {}
    }
}
