//! Lifecycle-engine error kinds with their wire codes.

use mefedge_common::error::RespCode;

#[derive(Debug, thiserror::Error)]
pub enum CertmgrError {
    #[error("invalid parameter: {0}")]
    Param(String),

    #[error("issuance failed: {0}")]
    Issue(String),

    #[error("rotation abandoned after {attempts} attempts for {name}")]
    RotationAbandoned { name: String, attempts: u32 },

    #[error(transparent)]
    Store(#[from] mefedge_certstore::CertStoreError),

    #[error("key store: {0}")]
    KeyStore(#[from] mefedge_keystore::KeyStoreError),

    #[error(transparent)]
    Common(#[from] mefedge_common::error::CommonError),
}

impl CertmgrError {
    /// Numeric code reported to the cloud side.
    pub fn code(&self) -> RespCode {
        use mefedge_certstore::CertStoreError as S;
        match self {
            CertmgrError::Param(_) => RespCode::ParamInvalid,
            CertmgrError::Issue(_) => RespCode::IssueSrvCert,
            CertmgrError::RotationAbandoned { .. } => RespCode::Internal,
            CertmgrError::Store(S::NotFound(_)) => RespCode::GetRootCa,
            CertmgrError::Store(S::TooLarge(_)) => RespCode::ParamInvalid,
            CertmgrError::Store(S::Parse(_)) | CertmgrError::Store(S::Extension(_)) => {
                RespCode::CertTypeError
            }
            CertmgrError::Store(_) => RespCode::SaveCa,
            CertmgrError::KeyStore(_) => RespCode::Internal,
            CertmgrError::Common(_) => RespCode::Internal,
        }
    }
}
