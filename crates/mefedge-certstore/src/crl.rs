//! CRL validation against the matching root CA.

use chrono::{DateTime, TimeZone, Utc};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::CertificateRevocationList;

use crate::error::CertStoreError;

const CRL_PEM_LABEL: &str = "X509 CRL";

/// Parsed summary of an accepted CRL.
#[derive(Debug, Clone, PartialEq)]
pub struct CrlInfo {
    pub issuer: String,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    pub revoked_serials: Vec<String>,
}

impl CrlInfo {
    pub fn is_revoked(&self, serial: &str) -> bool {
        self.revoked_serials.iter().any(|s| s == serial)
    }
}

/// Validate a CRL, PEM or raw DER, against the root it claims to come
/// from.
///
/// Accepts only a CRL whose window covers the current time, whose
/// issuer DN matches the root subject and whose signature verifies
/// with the root key.
pub fn validate_crl(crl_raw: &[u8], root_pem: &[u8]) -> Result<CrlInfo, CertStoreError> {
    let der = crl_der(crl_raw)?;
    let (_, crl) = CertificateRevocationList::from_der(&der)
        .map_err(|e| CertStoreError::Parse(format!("crl parse: {e}")))?;

    let (_, root_parsed) = parse_x509_pem(root_pem)
        .map_err(|e| CertStoreError::Parse(format!("root pem decode: {e}")))?;
    let root = root_parsed
        .parse_x509()
        .map_err(|e| CertStoreError::Parse(format!("root x509 parse: {e}")))?;

    let now = Utc::now().timestamp();
    let this_update = crl.last_update().timestamp();
    if now < this_update {
        return Err(CertStoreError::Expired("crl not yet in effect".into()));
    }
    let next_update = crl.next_update().map(|t| t.timestamp());
    if let Some(next) = next_update {
        if now >= next {
            return Err(CertStoreError::Expired("crl past nextUpdate".into()));
        }
    }

    if crl.issuer() != root.subject() {
        return Err(CertStoreError::ChainNotTrusted(
            "crl issuer does not match root subject".into(),
        ));
    }
    crl.verify_signature(root.public_key())
        .map_err(|_| CertStoreError::ChainNotTrusted("crl signature does not verify".into()))?;

    let revoked_serials = crl
        .iter_revoked_certificates()
        .map(|r| r.raw_serial_as_string())
        .collect();

    Ok(CrlInfo {
        issuer: crl.issuer().to_string(),
        this_update: ts(this_update),
        next_update: next_update.map(ts),
        revoked_serials,
    })
}

// Cloud sides differ on the encoding they push; armored CRLs carry the
// `X509 CRL` label, anything else is taken as DER.
fn crl_der(raw: &[u8]) -> Result<Vec<u8>, CertStoreError> {
    let trimmed = raw
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map_or(&raw[raw.len()..], |start| &raw[start..]);
    if !trimmed.starts_with(b"-----BEGIN") {
        return Ok(raw.to_vec());
    }
    let (_, pem) = parse_x509_pem(trimmed)
        .map_err(|e| CertStoreError::Parse(format!("crl pem decode: {e}")))?;
    if pem.label != CRL_PEM_LABEL {
        return Err(CertStoreError::Parse(format!(
            "unexpected crl pem label: {}",
            pem.label
        )));
    }
    Ok(pem.contents)
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}
