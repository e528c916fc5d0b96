//! On-disk layout for certificate artifacts.
//!
//! Each managed name owns a directory holding its root CA, optional
//! CRL and optional service cert/key pair. Every file goes through the
//! primary-plus-backup layer, and a size cap rejects oversized uploads
//! before they reach disk.

use std::fs;
use std::path::{Path, PathBuf};

use mefedge_common::backup;
use mefedge_common::error::CommonError;

use crate::error::CertStoreError;
use crate::names::CertName;

/// Upper bound for any single certificate artifact.
pub const MAX_ARTIFACT_BYTES: usize = 20 * 1024 * 1024;

const CA_FILE: &str = "ca.crt";
const CA_TEMP_FILE: &str = "ca.crt.new";
const CRL_FILE: &str = "ca.crl";
const SERVICE_CERT_FILE: &str = "service.crt";
const SERVICE_KEY_FILE: &str = "service.key";

#[derive(Debug, Clone)]
pub struct CertFileStore {
    root: PathBuf,
}

impl CertFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CertFileStore { root: root.into() }
    }

    pub fn dir(&self, name: CertName) -> PathBuf {
        self.root.join(name.as_str())
    }

    // ── root CA ──

    pub fn write_ca(&self, name: CertName, pem: &[u8]) -> Result<(), CertStoreError> {
        self.write(name, CA_FILE, pem)
    }

    pub fn read_ca(&self, name: CertName) -> Result<Vec<u8>, CertStoreError> {
        self.read(name, CA_FILE)
    }

    pub fn remove_ca(&self, name: CertName) -> Result<(), CertStoreError> {
        self.remove(name, CA_FILE)
    }

    pub fn has_ca(&self, name: CertName) -> bool {
        backup::exists_with_backup(&self.path(name, CA_FILE))
    }

    // ── rotation temp CA ──
    //
    // During a rotation the incoming CA sits next to the active one
    // until the switch-over completes. Its presence is the signal that
    // readers must see both.

    pub fn write_temp_ca(&self, name: CertName, pem: &[u8]) -> Result<(), CertStoreError> {
        self.write(name, CA_TEMP_FILE, pem)
    }

    pub fn read_temp_ca(&self, name: CertName) -> Result<Vec<u8>, CertStoreError> {
        self.read(name, CA_TEMP_FILE)
    }

    pub fn has_temp_ca(&self, name: CertName) -> bool {
        backup::exists_with_backup(&self.path(name, CA_TEMP_FILE))
    }

    /// Make the pending CA the active one.
    pub fn promote_temp_ca(&self, name: CertName) -> Result<(), CertStoreError> {
        let pem = self.read(name, CA_TEMP_FILE)?;
        self.write(name, CA_FILE, &pem)?;
        self.remove(name, CA_TEMP_FILE)
    }

    pub fn remove_temp_ca(&self, name: CertName) -> Result<(), CertStoreError> {
        self.remove(name, CA_TEMP_FILE)
    }

    // ── CRL ──

    pub fn write_crl(&self, name: CertName, pem: &[u8]) -> Result<(), CertStoreError> {
        self.write(name, CRL_FILE, pem)
    }

    pub fn read_crl(&self, name: CertName) -> Result<Vec<u8>, CertStoreError> {
        self.read(name, CRL_FILE)
    }

    pub fn remove_crl(&self, name: CertName) -> Result<(), CertStoreError> {
        self.remove(name, CRL_FILE)
    }

    pub fn has_crl(&self, name: CertName) -> bool {
        backup::exists_with_backup(&self.path(name, CRL_FILE))
    }

    // ── service cert and wrapped key ──

    pub fn write_service_pair(
        &self,
        name: CertName,
        cert_pem: &[u8],
        wrapped_key: &[u8],
    ) -> Result<(), CertStoreError> {
        self.write(name, SERVICE_CERT_FILE, cert_pem)?;
        self.write(name, SERVICE_KEY_FILE, wrapped_key)
    }

    pub fn read_service_cert(&self, name: CertName) -> Result<Vec<u8>, CertStoreError> {
        self.read(name, SERVICE_CERT_FILE)
    }

    pub fn read_service_key(&self, name: CertName) -> Result<Vec<u8>, CertStoreError> {
        self.read(name, SERVICE_KEY_FILE)
    }

    pub fn has_service_pair(&self, name: CertName) -> bool {
        backup::exists_with_backup(&self.path(name, SERVICE_CERT_FILE))
            && backup::exists_with_backup(&self.path(name, SERVICE_KEY_FILE))
    }

    pub fn remove_service_pair(&self, name: CertName) -> Result<(), CertStoreError> {
        self.remove(name, SERVICE_CERT_FILE)?;
        self.remove(name, SERVICE_KEY_FILE)
    }

    /// Drop everything stored under a name.
    pub fn remove_all(&self, name: CertName) -> Result<(), CertStoreError> {
        for file in [
            CA_FILE,
            CA_TEMP_FILE,
            CRL_FILE,
            SERVICE_CERT_FILE,
            SERVICE_KEY_FILE,
        ] {
            self.remove(name, file)?;
        }
        Ok(())
    }

    // ── plumbing ──

    fn path(&self, name: CertName, file: &str) -> PathBuf {
        self.dir(name).join(file)
    }

    fn write(&self, name: CertName, file: &str, bytes: &[u8]) -> Result<(), CertStoreError> {
        if bytes.len() > MAX_ARTIFACT_BYTES {
            return Err(CertStoreError::TooLarge(bytes.len()));
        }
        let p = self.path(name, file);
        ensure_dir(p.parent())?;
        backup::write_with_backup(&p, bytes)?;
        Ok(())
    }

    fn read(&self, name: CertName, file: &str) -> Result<Vec<u8>, CertStoreError> {
        let p = self.path(name, file);
        match backup::read_with_backup(&p) {
            Ok(bytes) if bytes.len() > MAX_ARTIFACT_BYTES => {
                Err(CertStoreError::TooLarge(bytes.len()))
            }
            Ok(bytes) => Ok(bytes),
            Err(CommonError::ContentMissing(_)) => Err(CertStoreError::NotFound(format!(
                "{}/{file}",
                name.as_str()
            ))),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, name: CertName, file: &str) -> Result<(), CertStoreError> {
        backup::remove_with_backup(&self.path(name, file))?;
        Ok(())
    }
}

fn ensure_dir(dir: Option<&Path>) -> Result<(), CertStoreError> {
    if let Some(dir) = dir {
        fs::create_dir_all(dir).map_err(CommonError::from)?;
    }
    Ok(())
}
