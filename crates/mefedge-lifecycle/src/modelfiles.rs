//! Model-file manager.
//!
//! Downloaded model files wait under the download tree as
//! `<uuid>/<name>`; activation moves the whole uuid directory into the
//! active tree, deactivation moves it back and delete clears both.

use std::fs;
use std::path::PathBuf;

use serde::Serialize;

use mefedge_common::paths::PathLayout;
use mefedge_common::validate::{Checker, FILE_NAME_RE, UUID_RE};

use crate::error::LifecycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Inactive,
    Active,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelFileEntry {
    pub uuid: String,
    pub name: String,
    pub status: ModelStatus,
    pub path: PathBuf,
}

pub struct ModelFileManager {
    download: PathBuf,
    active: PathBuf,
}

impl ModelFileManager {
    pub fn new(layout: &PathLayout) -> Self {
        ModelFileManager {
            download: layout.model_download_dir(),
            active: layout.model_active_dir(),
        }
    }

    fn validate(uuid: &str, name: &str) -> Result<(), LifecycleError> {
        Checker::new("uuid", uuid)
            .required()
            .matches(&UUID_RE)
            .finish()
            .map_err(|_| LifecycleError::Param(format!("invalid uuid: {uuid}")))?;
        Checker::new("name", name)
            .required()
            .max_len(255)
            .matches(&FILE_NAME_RE)
            .finish()
            .map_err(|_| LifecycleError::Param(format!("invalid file name: {name}")))
    }

    /// Move a downloaded model into the active tree. Already-active is
    /// a no-op so retried commands converge.
    pub fn activate(&self, uuid: &str, name: &str) -> Result<ModelFileEntry, LifecycleError> {
        Self::validate(uuid, name)?;
        let src = self.download.join(uuid);
        let dst = self.active.join(uuid);

        if dst.join(name).is_file() {
            return Ok(self.entry(uuid, name, ModelStatus::Active));
        }
        if !src.join(name).is_file() {
            return Err(LifecycleError::Param(format!(
                "model {uuid}/{name} not found in download tree"
            )));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src, &dst)?;
        tracing::info!(uuid, name, "model file activated");
        Ok(self.entry(uuid, name, ModelStatus::Active))
    }

    pub fn deactivate(&self, uuid: &str, name: &str) -> Result<ModelFileEntry, LifecycleError> {
        Self::validate(uuid, name)?;
        let src = self.active.join(uuid);
        let dst = self.download.join(uuid);

        if dst.join(name).is_file() {
            return Ok(self.entry(uuid, name, ModelStatus::Inactive));
        }
        if !src.join(name).is_file() {
            return Err(LifecycleError::Param(format!(
                "model {uuid}/{name} not found in active tree"
            )));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src, &dst)?;
        tracing::info!(uuid, name, "model file deactivated");
        Ok(self.entry(uuid, name, ModelStatus::Inactive))
    }

    /// Remove a model from both trees.
    pub fn delete(&self, uuid: &str) -> Result<(), LifecycleError> {
        Checker::new("uuid", uuid)
            .required()
            .matches(&UUID_RE)
            .finish()
            .map_err(|_| LifecycleError::Param(format!("invalid uuid: {uuid}")))?;
        for tree in [&self.download, &self.active] {
            let dir = tree.join(uuid);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }
        tracing::info!(uuid, "model file deleted");
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ModelFileEntry>, LifecycleError> {
        let mut entries = Vec::new();
        self.scan(&self.download, ModelStatus::Inactive, &mut entries)?;
        self.scan(&self.active, ModelStatus::Active, &mut entries)?;
        Ok(entries)
    }

    fn scan(
        &self,
        tree: &PathBuf,
        status: ModelStatus,
        out: &mut Vec<ModelFileEntry>,
    ) -> Result<(), LifecycleError> {
        if !tree.is_dir() {
            return Ok(());
        }
        for uuid_dir in fs::read_dir(tree)? {
            let uuid_dir = uuid_dir?;
            if !uuid_dir.file_type()?.is_dir() {
                continue;
            }
            let uuid = uuid_dir.file_name().to_string_lossy().to_string();
            for file in fs::read_dir(uuid_dir.path())? {
                let file = file?;
                if file.file_type()?.is_file() {
                    out.push(ModelFileEntry {
                        uuid: uuid.clone(),
                        name: file.file_name().to_string_lossy().to_string(),
                        status,
                        path: file.path(),
                    });
                }
            }
        }
        Ok(())
    }

    fn entry(&self, uuid: &str, name: &str, status: ModelStatus) -> ModelFileEntry {
        let tree = match status {
            ModelStatus::Inactive => &self.download,
            ModelStatus::Active => &self.active,
        };
        ModelFileEntry {
            uuid: uuid.to_string(),
            name: name.to_string(),
            status,
            path: tree.join(uuid).join(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const UUID: &str = "3e9c7f1a-2b4d-4e5f-8a9b-0c1d2e3f4a5b";

    fn manager() -> (tempfile::TempDir, ModelFileManager) {
        let dir = tempdir().unwrap();
        let layout = PathLayout::new(dir.path());
        (dir, ModelFileManager::new(&layout))
    }

    fn seed_download(m: &ModelFileManager, uuid: &str, name: &str) {
        let dir = m.download.join(uuid);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), b"weights").unwrap();
    }

    #[test]
    fn activate_moves_into_active_tree() {
        let (_dir, m) = manager();
        seed_download(&m, UUID, "model.om");

        let entry = m.activate(UUID, "model.om").unwrap();
        assert_eq!(entry.status, ModelStatus::Active);
        assert!(entry.path.is_file());
        assert!(!m.download.join(UUID).exists());

        // retried activation is a no-op
        m.activate(UUID, "model.om").unwrap();
    }

    #[test]
    fn deactivate_moves_back() {
        let (_dir, m) = manager();
        seed_download(&m, UUID, "model.om");
        m.activate(UUID, "model.om").unwrap();

        let entry = m.deactivate(UUID, "model.om").unwrap();
        assert_eq!(entry.status, ModelStatus::Inactive);
        assert!(m.download.join(UUID).join("model.om").is_file());
    }

    #[test]
    fn delete_clears_both_trees() {
        let (_dir, m) = manager();
        seed_download(&m, UUID, "model.om");
        m.delete(UUID).unwrap();
        assert!(m.list().unwrap().is_empty());
    }

    #[test]
    fn bad_uuid_is_rejected() {
        let (_dir, m) = manager();
        assert!(matches!(
            m.activate("not-a-uuid", "model.om"),
            Err(LifecycleError::Param(_))
        ));
    }

    #[test]
    fn path_traversal_name_is_rejected() {
        let (_dir, m) = manager();
        assert!(matches!(
            m.activate(UUID, "../../etc/passwd"),
            Err(LifecycleError::Param(_))
        ));
    }

    #[test]
    fn list_reports_both_trees() {
        let (_dir, m) = manager();
        seed_download(&m, UUID, "a.om");
        seed_download(&m, "4e9c7f1a-2b4d-4e5f-8a9b-0c1d2e3f4a5b", "b.om");
        m.activate(UUID, "a.om").unwrap();

        let list = m.list().unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.iter().any(|e| e.status == ModelStatus::Active));
        assert!(list.iter().any(|e| e.status == ModelStatus::Inactive));
    }
}
