//! Upgrade effect phase.
//!
//! Turns a prepared staging slot into the active one: alarm cleanup,
//! canonical rename, symlink flip, old-slot removal, service unit
//! update and reconcile, config smoothing, re-backup and immutable
//! protection. A failure after the flip tries to restart services
//! against whatever the symlink points at; if that also fails the
//! EffectFailed alarm is raised.

use std::fs;
use std::path::PathBuf;

use mefedge_common::paths::PathLayout;
use mefedge_common::registry::ConfigRegistry;

use crate::error::LifecycleError;
use crate::migrate::{builtin_migrators, run_chain};
use crate::slots::{SlotManager, VersionInfo, STAGING_SLOT};
use crate::supervisor::ServiceSupervisor;
use crate::upgrade::backup_config;

#[derive(Debug, Clone)]
pub struct EffectOptions {
    pub log_dir: PathBuf,
    pub log_backup_dir: PathBuf,
}

pub struct EffectFlow<'a> {
    layout: PathLayout,
    registry: &'a ConfigRegistry,
    supervisor: &'a dyn ServiceSupervisor,
}

impl<'a> EffectFlow<'a> {
    pub fn new(
        layout: PathLayout,
        registry: &'a ConfigRegistry,
        supervisor: &'a dyn ServiceSupervisor,
    ) -> Self {
        EffectFlow {
            layout,
            registry,
            supervisor,
        }
    }

    pub fn run(&self, opts: &EffectOptions) -> Result<(), LifecycleError> {
        let slots = SlotManager::new(self.layout.clone());
        let staging = slots.slot_path(STAGING_SLOT);
        if !staging.exists() {
            return Err(LifecycleError::EffectFailed(
                "no prepared upgrade to effect".into(),
            ));
        }

        self.registry.clear_active_alarms()?;

        let old_slot = slots.active_slot()?;
        let new_slot = SlotManager::other_slot(&old_slot);
        let old_version = slots.read_version(&old_slot)?;

        // canonical rename of the staging slot
        slots.remove_slot(new_slot)?;
        fs::rename(&staging, slots.slot_path(new_slot))?;
        let new_version = slots.read_version(new_slot)?;

        // decide up front whether services were running under the old
        // version; inactive units stay stopped after the swap
        let was_active = self.supervisor.check_all_active().unwrap_or(false);

        slots.flip_to(new_slot)?;

        if let Err(e) = self.post_flip(
            &slots,
            &old_slot,
            new_slot,
            &old_version,
            &new_version,
            was_active,
            opts,
        ) {
            tracing::error!(error = %e, "effect failed after symlink flip, restarting services");
            if self.supervisor.restart("all").is_err() {
                let _ = self.registry.raise_alarm("EffectFailed");
            }
            return Err(e);
        }

        tracing::info!(
            from = %old_version.inner_version,
            to = %new_version.inner_version,
            slot = new_slot,
            "upgrade effected"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn post_flip(
        &self,
        slots: &SlotManager,
        old_slot: &str,
        new_slot: &str,
        old_version: &VersionInfo,
        new_version: &VersionInfo,
        was_active: bool,
        opts: &EffectOptions,
    ) -> Result<(), LifecycleError> {
        slots.remove_slot(old_slot)?;

        self.supervisor
            .update_service_files(&opts.log_dir, &opts.log_backup_dir)?;
        self.supervisor.register_all()?;
        if was_active {
            self.supervisor.restart("all")?;
        } else {
            tracing::info!("units were inactive before the upgrade, skipping restart");
        }

        run_chain(
            self.registry,
            &builtin_migrators(),
            &old_version.inner_version,
            &new_version.inner_version,
        )?;
        self.registry
            .set_node_info("inner_version", &new_version.inner_version)?;

        backup_config(&self.layout)?;
        slots.protect_slot(new_slot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::{SLOT_A, SLOT_B};
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct MockSupervisor {
        calls: Mutex<Vec<String>>,
        active: bool,
        fail_register: bool,
        fail_restart: bool,
    }

    impl MockSupervisor {
        fn new(active: bool) -> Self {
            MockSupervisor {
                calls: Mutex::new(Vec::new()),
                active,
                fail_register: false,
                fail_restart: false,
            }
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ServiceSupervisor for MockSupervisor {
        fn update_service_files(&self, _: &Path, _: &Path) -> Result<(), LifecycleError> {
            self.record("update_files");
            Ok(())
        }
        fn register_all(&self) -> Result<(), LifecycleError> {
            self.record("register");
            if self.fail_register {
                return Err(LifecycleError::EffectFailed("register refused".into()));
            }
            Ok(())
        }
        fn check_all_active(&self) -> Result<bool, LifecycleError> {
            self.record("check_active");
            Ok(self.active)
        }
        fn restart(&self, target: &str) -> Result<(), LifecycleError> {
            self.record(&format!("restart:{target}"));
            if self.fail_restart {
                return Err(LifecycleError::EffectFailed("restart refused".into()));
            }
            Ok(())
        }
    }

    fn seed(layout: &PathLayout, active_version: &str, staged_version: &str) -> SlotManager {
        let slots = SlotManager::new(layout.clone());
        fs::create_dir_all(slots.slot_path(SLOT_A)).unwrap();
        slots
            .write_version(
                SLOT_A,
                &VersionInfo {
                    inner_version: active_version.into(),
                    pkg_name: format!("MEF-Edge-{active_version}.tar.gz"),
                },
            )
            .unwrap();
        slots.flip_to(SLOT_A).unwrap();

        fs::create_dir_all(slots.slot_path(STAGING_SLOT)).unwrap();
        slots
            .write_version(
                STAGING_SLOT,
                &VersionInfo {
                    inner_version: staged_version.into(),
                    pkg_name: format!("MEF-Edge-{staged_version}.tar.gz"),
                },
            )
            .unwrap();
        slots
    }

    fn options(root: &Path) -> EffectOptions {
        EffectOptions {
            log_dir: root.join("log"),
            log_backup_dir: root.join("log-backup"),
        }
    }

    #[test]
    fn effect_flips_and_removes_previous_slot() {
        let dir = tempdir().unwrap();
        let layout = PathLayout::new(dir.path().join("root"));
        let slots = seed(&layout, "1.0.0", "2.0.0");
        let registry = ConfigRegistry::open_in_memory(&layout.config_root()).unwrap();
        let sup = MockSupervisor::new(true);

        EffectFlow::new(layout.clone(), &registry, &sup)
            .run(&options(dir.path()))
            .unwrap();

        assert_eq!(slots.active_slot().unwrap(), SLOT_B);
        assert_eq!(slots.read_version(SLOT_B).unwrap().inner_version, "2.0.0");
        assert!(!slots.slot_path(SLOT_A).exists());
        assert!(!slots.slot_path(STAGING_SLOT).exists());
        assert_eq!(
            registry.node_info("inner_version").unwrap().unwrap(),
            "2.0.0"
        );
        assert!(sup.calls().contains(&"restart:all".to_string()));
    }

    #[test]
    fn inactive_units_are_not_restarted() {
        let dir = tempdir().unwrap();
        let layout = PathLayout::new(dir.path().join("root"));
        seed(&layout, "1.0.0", "2.0.0");
        let registry = ConfigRegistry::open_in_memory(&layout.config_root()).unwrap();
        let sup = MockSupervisor::new(false);

        EffectFlow::new(layout, &registry, &sup)
            .run(&options(dir.path()))
            .unwrap();

        assert!(!sup.calls().iter().any(|c| c.starts_with("restart")));
    }

    #[test]
    fn effect_without_prepare_is_refused() {
        let dir = tempdir().unwrap();
        let layout = PathLayout::new(dir.path().join("root"));
        let registry = ConfigRegistry::open_in_memory(&layout.config_root()).unwrap();
        let sup = MockSupervisor::new(true);

        let err = EffectFlow::new(layout, &registry, &sup)
            .run(&options(dir.path()))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::EffectFailed(_)));
    }

    #[test]
    fn failure_after_flip_raises_alarm_when_restart_fails() {
        let dir = tempdir().unwrap();
        let layout = PathLayout::new(dir.path().join("root"));
        seed(&layout, "1.0.0", "2.0.0");
        let registry = ConfigRegistry::open_in_memory(&layout.config_root()).unwrap();
        let mut sup = MockSupervisor::new(true);
        sup.fail_register = true;
        sup.fail_restart = true;

        let err = EffectFlow::new(layout, &registry, &sup)
            .run(&options(dir.path()))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::EffectFailed(_)));
        assert_eq!(registry.active_alarm_count().unwrap(), 1);
    }

    #[test]
    fn effect_clears_stale_alarms_first() {
        let dir = tempdir().unwrap();
        let layout = PathLayout::new(dir.path().join("root"));
        seed(&layout, "1.0.0", "2.0.0");
        let registry = ConfigRegistry::open_in_memory(&layout.config_root()).unwrap();
        registry.raise_alarm("DiskFull").unwrap();
        let sup = MockSupervisor::new(true);

        EffectFlow::new(layout, &registry, &sup)
            .run(&options(dir.path()))
            .unwrap();
        assert_eq!(registry.active_alarm_count().unwrap(), 0);
    }
}
