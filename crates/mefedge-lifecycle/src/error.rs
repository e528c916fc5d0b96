//! Lifecycle error kinds.

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("another lifecycle phase is in progress: {current}")]
    Phase { current: String },

    #[error("package verification failed: {0}")]
    VerifyPackage(String),

    #[error("not enough disk space: need {needed} bytes, {available} available")]
    DiskFull { needed: u64, available: u64 },

    #[error("migration to {version} failed: {reason}")]
    MigrationFailed { version: String, reason: String },

    #[error("effect failed: {0}")]
    EffectFailed(String),

    #[error("invalid parameter: {0}")]
    Param(String),

    #[error("version file: {0}")]
    Xml(String),

    #[error(transparent)]
    Certmgr(#[from] mefedge_certmgr::CertmgrError),

    #[error(transparent)]
    Store(#[from] mefedge_certstore::CertStoreError),

    #[error("key store: {0}")]
    KeyStore(#[from] mefedge_keystore::KeyStoreError),

    #[error(transparent)]
    Common(#[from] mefedge_common::error::CommonError),
}

impl From<std::io::Error> for LifecycleError {
    fn from(e: std::io::Error) -> Self {
        LifecycleError::Common(e.into())
    }
}
