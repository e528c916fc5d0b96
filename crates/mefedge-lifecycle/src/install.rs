//! First-time installation.
//!
//! Prepares the five component trees, copies the package payload into
//! slot A, initializes the registry DB, captures the node serial and
//! registers the default net configuration.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use mefedge_common::exec;
use mefedge_common::paths::{PathLayout, COMPONENTS, EDGECORE_PIPE};
use mefedge_common::registry::{ConfigRegistry, NetManagerConfig};

use crate::error::LifecycleError;
use crate::slots::{SlotManager, SLOT_A};
use crate::upgrade::copy_dir_recursive;

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub pkg_dir: PathBuf,
    pub allow_tmpfs: bool,
}

/// Per-component preparation hooks. Defaults cover the regular
/// components; edge-core overrides the config step for its key pipe.
pub trait ComponentPrep {
    fn component(&self) -> &'static str;

    fn prepare_software_dir(&self, layout: &PathLayout, slot: &str) -> Result<(), LifecycleError> {
        for sub in ["bin", "scripts", "var"] {
            fs::create_dir_all(layout.slot_dir(slot).join(self.component()).join(sub))?;
        }
        Ok(())
    }

    fn prepare_config_dirs(&self, layout: &PathLayout) -> Result<(), LifecycleError> {
        let comp = self.component();
        fs::create_dir_all(layout.inner_certs_dir(comp))?;
        fs::create_dir_all(layout.image_certs_dir(comp))?;
        fs::create_dir_all(layout.kmc_dir(comp))?;
        Ok(())
    }

    fn prepare_log_dirs(&self, log_root: &Path) -> Result<(), LifecycleError> {
        fs::create_dir_all(log_root.join(self.component()))?;
        Ok(())
    }

    fn set_owner_and_mode(&self, layout: &PathLayout) -> Result<(), LifecycleError> {
        let dir = layout.config_dir(self.component());
        let mut perms = fs::metadata(&dir)?.permissions();
        perms.set_mode(0o700);
        fs::set_permissions(&dir, perms)?;
        Ok(())
    }
}

struct DefaultPrep(&'static str);

impl ComponentPrep for DefaultPrep {
    fn component(&self) -> &'static str {
        self.0
    }
}

struct EdgeCorePrep;

impl ComponentPrep for EdgeCorePrep {
    fn component(&self) -> &'static str {
        "edge_core"
    }

    /// edge-core additionally gets a default config whose TLS key path
    /// is the named pipe, so the plaintext key never lands on disk.
    fn prepare_config_dirs(&self, layout: &PathLayout) -> Result<(), LifecycleError> {
        let comp = self.component();
        fs::create_dir_all(layout.inner_certs_dir(comp))?;
        fs::create_dir_all(layout.image_certs_dir(comp))?;
        fs::create_dir_all(layout.kmc_dir(comp))?;

        let cfg = layout.config_dir(comp).join("edgecore.json");
        if !cfg.exists() {
            let doc = serde_json::json!({
                "edged": { "tlsPrivateKeyFile": EDGECORE_PIPE }
            });
            fs::write(cfg, serde_json::to_vec_pretty(&doc).unwrap_or_default())?;
        }
        Ok(())
    }
}

fn component_preps() -> Vec<Box<dyn ComponentPrep>> {
    COMPONENTS
        .iter()
        .copied()
        .map(|comp| -> Box<dyn ComponentPrep> {
            if comp == "edge_core" {
                Box::new(EdgeCorePrep)
            } else {
                Box::new(DefaultPrep(comp))
            }
        })
        .collect()
}

pub struct Installer {
    layout: PathLayout,
    serial_source: Box<dyn Fn() -> String + Send + Sync>,
}

impl Installer {
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Installer {
            layout: PathLayout::new(install_dir),
            serial_source: Box::new(dmidecode_serial),
        }
    }

    pub fn with_serial_source(
        mut self,
        source: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.serial_source = Box::new(source);
        self
    }

    pub fn run(&self, opts: &InstallOptions) -> Result<ConfigRegistry, LifecycleError> {
        ensure_not_tmpfs(self.layout.root(), opts.allow_tmpfs)?;

        for prep in component_preps() {
            prep.prepare_software_dir(&self.layout, SLOT_A)?;
            prep.prepare_config_dirs(&self.layout)?;
            prep.set_owner_and_mode(&self.layout)?;
        }
        fs::create_dir_all(self.layout.config_backup_dir())?;
        fs::create_dir_all(self.layout.model_download_dir())?;
        fs::create_dir_all(self.layout.model_active_dir())?;

        copy_dir_recursive(&opts.pkg_dir, &self.layout.slot_dir(SLOT_A))?;

        let slots = SlotManager::new(self.layout.clone());
        let version = slots.read_version(SLOT_A)?;
        slots.flip_to(SLOT_A)?;

        let registry = ConfigRegistry::open(&self.layout.db_file(), &self.layout.config_root())?;
        registry.seed_alarm_config(&[
            ("EffectFailed", "critical"),
            ("DiskFull", "major"),
            ("RotationAbandoned", "major"),
            ("CertNearExpiry", "minor"),
        ])?;

        let serial = (self.serial_source)();
        registry.set_node_info("serial_number", &serial)?;
        registry.set_node_info("inner_version", &version.inner_version)?;
        registry.set_net_config(&NetManagerConfig::default())?;

        tracing::info!(
            version = %version.inner_version,
            serial = %serial,
            "installation complete"
        );
        Ok(registry)
    }
}

fn dmidecode_serial() -> String {
    match exec::run("dmidecode", &["-s", "system-serial-number"]) {
        Ok(out) if out.status_ok && !out.stdout.trim().is_empty() => out.stdout.trim().to_string(),
        _ => {
            tracing::warn!("could not read system serial, using placeholder");
            "unknown".to_string()
        }
    }
}

/// Refuse to install onto tmpfs unless explicitly allowed; everything
/// under the root would vanish on reboot.
fn ensure_not_tmpfs(root: &Path, allow: bool) -> Result<(), LifecycleError> {
    if allow {
        return Ok(());
    }
    let mounts = match fs::read_to_string("/proc/mounts") {
        Ok(m) => m,
        Err(_) => return Ok(()),
    };
    let root = root
        .canonicalize()
        .unwrap_or_else(|_| root.to_path_buf());

    let mut best: Option<(&str, &str)> = None;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_dev), Some(mount), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if root.starts_with(mount) {
            match best {
                Some((prev, _)) if prev.len() >= mount.len() => {}
                _ => best = Some((mount, fstype)),
            }
        }
    }
    if let Some((mount, fstype)) = best {
        if fstype == "tmpfs" {
            return Err(LifecycleError::Param(format!(
                "install root is on tmpfs mount {mount}; pass --allow-tmpfs to override"
            )));
        }
    }
    Ok(())
}
