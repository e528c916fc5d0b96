//! Parse-and-validate pipeline for ingested certificates.
//!
//! Order matters: decode, algorithm allow-list, version, CA
//! extensions, key strength, validity window, then chain verification
//! against the installed root of the same name.

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::X509Version;

use crate::error::CertStoreError;

/// A warning is logged when a cert expires within this many days.
pub const NEAR_EXPIRY_WARN_DAYS: i64 = 100;

const MIN_RSA_BITS: usize = 3072;
const MIN_ECDSA_BITS: usize = 256;
const TEN_YEARS_DAYS: i64 = 3650;

/// Signature algorithm OIDs rejected on ingest (MD2/MD5/SHA-1 family).
const WEAK_SIG_OIDS: [&str; 6] = [
    "1.2.840.113549.1.1.2", // md2WithRSAEncryption
    "1.2.840.113549.1.1.3", // md4WithRSAEncryption
    "1.2.840.113549.1.1.4", // md5WithRSAEncryption
    "1.2.840.113549.1.1.5", // sha1WithRSAEncryption
    "1.2.840.10045.4.1",    // ecdsa-with-SHA1
    "1.2.840.10040.4.3",    // dsa-with-SHA1
];

/// Parsed summary of a validated certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct CertInfo {
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
    pub fingerprint_sha256: String,
}

/// Run the full pipeline on a PEM certificate.
///
/// When `issuer_pem` is given the cert must chain to it; a root CA
/// validates against itself.
pub fn validate_cert_pem(
    pem_bytes: &[u8],
    issuer_pem: Option<&[u8]>,
) -> Result<CertInfo, CertStoreError> {
    let (_, pem) = parse_x509_pem(pem_bytes)
        .map_err(|e| CertStoreError::Parse(format!("pem decode: {e}")))?;
    if pem.label != "CERTIFICATE" {
        return Err(CertStoreError::Parse(format!(
            "unexpected pem label: {}",
            pem.label
        )));
    }
    let cert = pem
        .parse_x509()
        .map_err(|e| CertStoreError::Parse(format!("x509 parse: {e}")))?;

    check_signature_algorithm(&cert)?;
    check_version(&cert)?;
    if cert.is_ca() {
        check_ca_extensions(&cert)?;
    }
    check_key_strength(&cert)?;
    check_validity(&cert)?;

    if let Some(issuer_pem) = issuer_pem {
        verify_issued_by(pem_bytes, issuer_pem)?;
    }

    Ok(info_from(&cert, &pem.contents))
}

/// Validate an imported root CA: the full pipeline plus the CA
/// extension requirements and a self-signature check.
pub fn validate_ca_pem(pem_bytes: &[u8]) -> Result<CertInfo, CertStoreError> {
    let (_, pem) = parse_x509_pem(pem_bytes)
        .map_err(|e| CertStoreError::Parse(format!("pem decode: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| CertStoreError::Parse(format!("x509 parse: {e}")))?;

    if !cert.is_ca() {
        return Err(CertStoreError::Extension(
            "not a CA certificate (BasicConstraints)".into(),
        ));
    }
    check_signature_algorithm(&cert)?;
    check_version(&cert)?;
    check_ca_extensions(&cert)?;
    check_key_strength(&cert)?;
    check_validity(&cert)?;

    cert.verify_signature(None)
        .map_err(|_| CertStoreError::ChainNotTrusted("CA self-signature invalid".into()))?;

    Ok(info_from(&cert, &pem.contents))
}

/// Verify that `cert_pem` was signed by `issuer_pem`.
pub fn verify_issued_by(cert_pem: &[u8], issuer_pem: &[u8]) -> Result<(), CertStoreError> {
    let (_, pem) = parse_x509_pem(cert_pem)
        .map_err(|e| CertStoreError::Parse(format!("pem decode: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| CertStoreError::Parse(format!("x509 parse: {e}")))?;

    let (_, issuer_parsed) = parse_x509_pem(issuer_pem)
        .map_err(|e| CertStoreError::Parse(format!("issuer pem decode: {e}")))?;
    let issuer = issuer_parsed
        .parse_x509()
        .map_err(|e| CertStoreError::Parse(format!("issuer x509 parse: {e}")))?;

    if cert.issuer() != issuer.subject() {
        return Err(CertStoreError::ChainNotTrusted(
            "issuer DN does not match root subject".into(),
        ));
    }
    cert.verify_signature(Some(issuer.public_key()))
        .map_err(|_| CertStoreError::ChainNotTrusted("signature does not verify".into()))
}

fn check_signature_algorithm(cert: &X509Certificate<'_>) -> Result<(), CertStoreError> {
    let oid = cert.signature_algorithm.algorithm.to_id_string();
    if WEAK_SIG_OIDS.contains(&oid.as_str()) {
        return Err(CertStoreError::Parse(format!(
            "weak signature algorithm: {oid}"
        )));
    }
    Ok(())
}

fn check_version(cert: &X509Certificate<'_>) -> Result<(), CertStoreError> {
    if cert.version() != X509Version::V3 {
        return Err(CertStoreError::Extension(
            "certificate must be X.509 v3".into(),
        ));
    }
    Ok(())
}

fn check_ca_extensions(cert: &X509Certificate<'_>) -> Result<(), CertStoreError> {
    let key_usage = cert
        .key_usage()
        .map_err(|e| CertStoreError::Extension(format!("key usage: {e}")))?;
    let cert_sign = key_usage.map(|ku| ku.value.key_cert_sign()).unwrap_or(false);
    if !cert_sign {
        return Err(CertStoreError::Extension(
            "CA keyUsage does not include keyCertSign".into(),
        ));
    }
    Ok(())
}

fn check_key_strength(cert: &X509Certificate<'_>) -> Result<(), CertStoreError> {
    let spki = cert.public_key();
    let parsed = spki
        .parsed()
        .map_err(|e| CertStoreError::Parse(format!("public key: {e}")))?;
    match parsed {
        PublicKey::RSA(rsa) => {
            let bits = rsa.key_size();
            if bits < MIN_RSA_BITS {
                return Err(CertStoreError::KeyWeak(format!(
                    "RSA key {bits} bits, minimum {MIN_RSA_BITS}"
                )));
            }
        }
        PublicKey::EC(ec) => {
            let bits = ec.key_size();
            if bits < MIN_ECDSA_BITS {
                return Err(CertStoreError::KeyWeak(format!(
                    "EC key {bits} bits, minimum {MIN_ECDSA_BITS}"
                )));
            }
        }
        _ => {
            return Err(CertStoreError::KeyWeak(
                "unsupported public key type".into(),
            ))
        }
    }
    Ok(())
}

fn check_validity(cert: &X509Certificate<'_>) -> Result<(), CertStoreError> {
    let now = Utc::now().timestamp();
    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();

    if now < not_before {
        return Err(CertStoreError::Expired("not yet valid".into()));
    }
    if now >= not_after {
        return Err(CertStoreError::Expired("past notAfter".into()));
    }

    let days_left = (not_after - now) / 86_400;
    if days_left < NEAR_EXPIRY_WARN_DAYS {
        tracing::warn!(days_left, "certificate approaching expiry");
    }
    let span_days = (not_after - not_before) / 86_400;
    if span_days > TEN_YEARS_DAYS {
        tracing::warn!(span_days, "certificate validity exceeds ten years");
    }
    Ok(())
}

fn info_from(cert: &X509Certificate<'_>, der: &[u8]) -> CertInfo {
    let mut hasher = Sha256::new();
    hasher.update(der);
    let fingerprint = hex_lower(&hasher.finalize());

    CertInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial_number: cert.raw_serial_as_string(),
        not_before: ts(cert.validity().not_before.timestamp()),
        not_after: ts(cert.validity().not_after.timestamp()),
        is_ca: cert.is_ca(),
        fingerprint_sha256: fingerprint,
    }
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parse a certificate without running the validation pipeline; used
/// by read-only queries.
pub fn parse_cert_info(pem_bytes: &[u8]) -> Result<CertInfo, CertStoreError> {
    let (_, pem) = parse_x509_pem(pem_bytes)
        .map_err(|e| CertStoreError::Parse(format!("pem decode: {e}")))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| CertStoreError::Parse(format!("x509 parse: {e}")))?;
    Ok(info_from(&cert, &pem.contents))
}
