//! Factory reset flow.
//!
//! Drops everything the node accumulated after install: trust
//! material, model files, alarms, the net-manager binding and the
//! config backup snapshot. The software tree and the install-time
//! configuration stay; the node comes back as if freshly installed
//! and unbound from any cloud controller.

use std::fs;

use mefedge_certstore::{CertFileStore, CertName};
use mefedge_common::paths::PathLayout;
use mefedge_common::registry::{ConfigRegistry, NetManagerConfig};

use crate::error::LifecycleError;
use crate::supervisor::ServiceSupervisor;

pub struct ResetFlow {
    layout: PathLayout,
}

impl ResetFlow {
    pub fn new(layout: PathLayout) -> Self {
        ResetFlow { layout }
    }

    pub fn run(
        &self,
        registry: &ConfigRegistry,
        certs: &CertFileStore,
        supervisor: &dyn ServiceSupervisor,
    ) -> Result<(), LifecycleError> {
        for name in CertName::ALL {
            certs.remove_all(name)?;
        }
        for tree in [
            self.layout.model_download_dir(),
            self.layout.model_active_dir(),
        ] {
            if tree.exists() {
                fs::remove_dir_all(&tree)?;
            }
            fs::create_dir_all(&tree)?;
        }

        registry.clear_active_alarms()?;
        registry.set_net_config(&NetManagerConfig::default())?;

        let backup = self.layout.config_backup_dir();
        if backup.exists() {
            fs::remove_dir_all(&backup)?;
        }

        // Services reload with the emptied trust material.
        supervisor.restart("all")?;
        tracing::info!("factory reset complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MockSupervisor {
        calls: Mutex<Vec<String>>,
    }

    impl MockSupervisor {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ServiceSupervisor for MockSupervisor {
        fn update_service_files(&self, _: &Path, _: &Path) -> Result<(), LifecycleError> {
            Ok(())
        }
        fn register_all(&self) -> Result<(), LifecycleError> {
            Ok(())
        }
        fn check_all_active(&self) -> Result<bool, LifecycleError> {
            Ok(true)
        }
        fn restart(&self, target: &str) -> Result<(), LifecycleError> {
            self.calls.lock().unwrap().push(format!("restart:{target}"));
            Ok(())
        }
    }

    #[test]
    fn reset_clears_certs_models_and_binding() {
        let dir = tempdir().unwrap();
        let layout = PathLayout::new(dir.path());
        let registry = ConfigRegistry::open_in_memory(&layout.config_root()).unwrap();
        registry.create_tables().unwrap();
        registry
            .set_net_config(&NetManagerConfig {
                ip: "10.0.0.5".into(),
                port: 8443,
                ..NetManagerConfig::default()
            })
            .unwrap();

        let certs = CertFileStore::new(dir.path().join("certs"));
        certs.write_ca(CertName::Northern, b"pem").unwrap();
        let model = layout.model_active_dir().join("u").join("m.om");
        fs::create_dir_all(model.parent().unwrap()).unwrap();
        fs::write(&model, b"weights").unwrap();

        let supervisor = MockSupervisor::default();
        ResetFlow::new(layout.clone())
            .run(&registry, &certs, &supervisor)
            .unwrap();

        assert!(!certs.has_ca(CertName::Northern));
        assert!(!model.exists());
        let cfg = registry.net_config().unwrap().unwrap();
        assert!(cfg.ip.is_empty());
        assert!(supervisor.calls().iter().any(|c| c == "restart:all"));
    }

    #[test]
    fn reset_is_idempotent() {
        let dir = tempdir().unwrap();
        let layout = PathLayout::new(dir.path());
        let registry = ConfigRegistry::open_in_memory(&layout.config_root()).unwrap();
        registry.create_tables().unwrap();
        let certs = CertFileStore::new(dir.path().join("certs"));
        let supervisor = MockSupervisor::default();

        let flow = ResetFlow::new(layout);
        flow.run(&registry, &certs, &supervisor).unwrap();
        flow.run(&registry, &certs, &supervisor).unwrap();
    }
}
