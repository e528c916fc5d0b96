//! Key-store error kinds. Each carries a stable numeric code so the
//! cause survives the component boundary in logs.

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("key store not initialized (code {})", KeyStoreError::NotInit.code())]
    NotInit,

    #[error("unknown domain {domain} (code {})", KeyStoreError::InvalidDomain { domain: *domain }.code())]
    InvalidDomain { domain: u32 },

    #[error("parameter check failed: {0}")]
    ParamCheck(String),

    #[error("key store init failed: {0}")]
    Init(String),

    #[error("internal key store error: {0}")]
    Internal(String),
}

impl KeyStoreError {
    pub fn code(&self) -> u32 {
        match self {
            KeyStoreError::NotInit => 4001,
            KeyStoreError::InvalidDomain { .. } => 4002,
            KeyStoreError::ParamCheck(_) => 4003,
            KeyStoreError::Init(_) => 4004,
            KeyStoreError::Internal(_) => 4099,
        }
    }
}
