//! Service supervisor contract and the systemd implementation.
//!
//! The effect flow drives services only through this trait; tests and
//! non-systemd hosts plug in their own implementation.

use std::fs;
use std::path::{Path, PathBuf};

use mefedge_common::exec;
use mefedge_common::paths::{PathLayout, COMPONENTS};

use crate::error::LifecycleError;

pub trait ServiceSupervisor {
    /// Rewrite unit files so they point at the current software link
    /// and the given log locations.
    fn update_service_files(
        &self,
        log_dir: &Path,
        log_backup_dir: &Path,
    ) -> Result<(), LifecycleError>;

    /// Make all units known to the init system.
    fn register_all(&self) -> Result<(), LifecycleError>;

    /// Whether every unit is currently active.
    fn check_all_active(&self) -> Result<bool, LifecycleError>;

    /// Restart one unit, or every unit for target `all`.
    fn restart(&self, target: &str) -> Result<(), LifecycleError>;
}

pub struct SystemdSupervisor {
    layout: PathLayout,
    unit_dir: PathBuf,
}

impl SystemdSupervisor {
    pub fn new(layout: PathLayout, unit_dir: impl Into<PathBuf>) -> Self {
        SystemdSupervisor {
            layout,
            unit_dir: unit_dir.into(),
        }
    }

    fn unit_name(component: &str) -> String {
        format!("{}.service", component.replace('_', "-"))
    }

    fn unit_body(&self, component: &str, log_dir: &Path, log_backup_dir: &Path) -> String {
        let bin = self
            .layout
            .software_link()
            .join(component)
            .join("bin")
            .join(component);
        format!(
            "[Unit]\n\
             Description=MEF Edge {component}\n\
             After=network-online.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={}\n\
             Environment=LOG_DIR={}\n\
             Environment=LOG_BACKUP_DIR={}\n\
             Restart=on-failure\n\
             RestartSec=5\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            bin.display(),
            log_dir.display(),
            log_backup_dir.display(),
        )
    }

    fn systemctl(args: &[&str]) -> Result<exec::ExecOutput, LifecycleError> {
        Ok(exec::run("systemctl", args)?)
    }
}

impl ServiceSupervisor for SystemdSupervisor {
    fn update_service_files(
        &self,
        log_dir: &Path,
        log_backup_dir: &Path,
    ) -> Result<(), LifecycleError> {
        fs::create_dir_all(&self.unit_dir)?;
        for comp in COMPONENTS {
            let unit = self.unit_dir.join(Self::unit_name(comp));
            fs::write(&unit, self.unit_body(comp, log_dir, log_backup_dir))?;
        }
        Ok(())
    }

    fn register_all(&self) -> Result<(), LifecycleError> {
        let out = Self::systemctl(&["daemon-reload"])?;
        if !out.status_ok {
            return Err(LifecycleError::EffectFailed(format!(
                "daemon-reload: {}",
                out.stderr.trim()
            )));
        }
        for comp in COMPONENTS {
            let unit = Self::unit_name(comp);
            let out = Self::systemctl(&["enable", &unit])?;
            if !out.status_ok {
                return Err(LifecycleError::EffectFailed(format!(
                    "enable {unit}: {}",
                    out.stderr.trim()
                )));
            }
        }
        Ok(())
    }

    fn check_all_active(&self) -> Result<bool, LifecycleError> {
        for comp in COMPONENTS {
            let unit = Self::unit_name(comp);
            let out = Self::systemctl(&["is-active", "--quiet", &unit])?;
            if !out.status_ok {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn restart(&self, target: &str) -> Result<(), LifecycleError> {
        let units: Vec<String> = if target == "all" {
            COMPONENTS.iter().map(|c| Self::unit_name(c)).collect()
        } else {
            vec![Self::unit_name(target)]
        };
        for unit in units {
            let out = Self::systemctl(&["restart", &unit])?;
            if !out.status_ok {
                return Err(LifecycleError::EffectFailed(format!(
                    "restart {unit}: {}",
                    out.stderr.trim()
                )));
            }
        }
        Ok(())
    }
}
