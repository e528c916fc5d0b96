//! Install-tree layout.
//!
//! All on-disk locations derive from a single install root so tests
//! can point the whole agent at a temp directory.

use std::path::{Path, PathBuf};

/// The five managed components, in install order.
pub const COMPONENTS: [&str; 5] = [
    "edge_installer",
    "edge_om",
    "edge_main",
    "edge_core",
    "device_plugin",
];

/// Component that owns the registry DB.
pub const DB_COMPONENT: &str = "edge_main";

/// File name of the registry DB.
pub const DB_FILE: &str = "mef-main.db";

/// Name of the process-singleton lock file under /run.
pub const SINGLETON_LOCK_NAME: &str = "edge-installer.lock";

/// Named pipe used to hand the plaintext TLS key to edge-core.
pub const EDGECORE_PIPE: &str = "/run/edgecore.pipe";

/// Resolves every path the agent touches under one install root.
#[derive(Debug, Clone)]
pub struct PathLayout {
    root: PathBuf,
}

impl PathLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `software` symlink that selects the active slot.
    pub fn software_link(&self) -> PathBuf {
        self.root.join("software")
    }

    /// Parent directory of the two software slots.
    pub fn slots_dir(&self) -> PathBuf {
        self.root.join("MEFEdge")
    }

    /// A named software slot, `software_A` or `software_B`.
    pub fn slot_dir(&self, name: &str) -> PathBuf {
        self.slots_dir().join(name)
    }

    /// Root of the per-component config tree.
    pub fn config_root(&self) -> PathBuf {
        self.root.join("config")
    }

    /// Per-component config namespace.
    pub fn config_dir(&self, component: &str) -> PathBuf {
        self.config_root().join(component)
    }

    /// Inner (node-to-node) cert directory of a component.
    pub fn inner_certs_dir(&self, component: &str) -> PathBuf {
        self.config_dir(component).join("inner_certs")
    }

    /// Image-registry cert directory of a component.
    pub fn image_certs_dir(&self, component: &str) -> PathBuf {
        self.config_dir(component).join("image_certs")
    }

    /// Key-store file pair of a component.
    pub fn kmc_dir(&self, component: &str) -> PathBuf {
        self.config_dir(component).join("kmc")
    }

    pub fn kmc_primary(&self, component: &str) -> PathBuf {
        self.kmc_dir(component).join("primary.ks")
    }

    pub fn kmc_standby(&self, component: &str) -> PathBuf {
        self.kmc_dir(component).join("standby.ks")
    }

    /// The registry DB file, owned by edge_main.
    pub fn db_file(&self) -> PathBuf {
        self.config_dir(DB_COMPONENT).join(DB_FILE)
    }

    /// Config backup directory copied forward across upgrades.
    pub fn config_backup_dir(&self) -> PathBuf {
        self.root.join("config_backup")
    }

    /// Download tree for inactive model files.
    pub fn model_download_dir(&self) -> PathBuf {
        self.root.join("model").join("download")
    }

    /// Active tree for effective model files.
    pub fn model_active_dir(&self) -> PathBuf {
        self.root.join("model").join("active")
    }

    /// Version file inside a slot.
    pub fn version_file(&self, slot: &str) -> PathBuf {
        self.slot_dir(slot).join("version.xml")
    }
}

/// Sibling backup path for any persisted file (`p` → `p.backup`).
pub fn backup_path(p: &Path) -> PathBuf {
    let mut os = p.as_os_str().to_owned();
    os.push(".backup");
    PathBuf::from(os)
}
