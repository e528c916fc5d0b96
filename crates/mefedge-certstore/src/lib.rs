//! Certificate, CRL and service-key artifacts.
//!
//! Everything the node persists for TLS trust goes through this crate:
//! the parse-and-validate pipeline applied to ingested certificates,
//! CRL validation against the matching root, backup-layer persistence
//! and the encrypted service-key PEM wrapping.

mod crl;
mod error;
mod files;
mod keywrap;
mod names;
mod validate;

pub use crl::{validate_crl, CrlInfo};
pub use error::CertStoreError;
pub use files::{CertFileStore, MAX_ARTIFACT_BYTES};
pub use keywrap::{unwrap_service_key, wrap_service_key};
pub use names::CertName;
pub use validate::{
    parse_cert_info, validate_ca_pem, validate_cert_pem, verify_issued_by, CertInfo,
    NEAR_EXPIRY_WARN_DAYS,
};
