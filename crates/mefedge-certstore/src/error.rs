//! Certificate-store error kinds.

#[derive(Debug, thiserror::Error)]
pub enum CertStoreError {
    #[error("certificate parse failed: {0}")]
    Parse(String),

    #[error("certificate extension check failed: {0}")]
    Extension(String),

    #[error("public key too weak: {0}")]
    KeyWeak(String),

    #[error("certificate outside its validity window: {0}")]
    Expired(String),

    #[error("certificate is revoked: serial {0}")]
    Revoked(String),

    #[error("chain not trusted: {0}")]
    ChainNotTrusted(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("artifact too large: {0} bytes")]
    TooLarge(usize),

    #[error("key store: {0}")]
    KeyStore(#[from] mefedge_keystore::KeyStoreError),

    #[error(transparent)]
    Common(#[from] mefedge_common::error::CommonError),
}
