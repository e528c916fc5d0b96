//! Root CA import/delete, CSR issuance and CA rotation.
//!
//! Issuing CAs are ECDSA P-256 generated with `rcgen`; their private
//! keys live on disk only inside the key-store wrapping. All writes to
//! one certificate name serialize on that name's lock; different names
//! proceed in parallel.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::{fs, str};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};

use mefedge_certstore::{
    parse_cert_info, validate_ca_pem, validate_crl, unwrap_service_key, wrap_service_key,
    CertFileStore, CertInfo, CertName, CertStoreError, CrlInfo, MAX_ARTIFACT_BYTES,
};
use mefedge_common::validate::{Checker, CSR_RE};
use mefedge_keystore::KeyStore;

use crate::error::CertmgrError;
use crate::rotation::{run_rotation, RotationOutcome, RotationSteps, MAX_ROTATION_ATTEMPTS};

/// Validity of certificates issued from a CSR.
pub const SERVICE_CERT_LIFETIME_DAYS: i64 = 365 * 5;

/// Validity of generated issuing CAs.
const CA_LIFETIME_DAYS: i64 = 3650;

/// A certificate issued from a CSR. The private key stays with the
/// requester; only the signed chain comes back.
#[derive(Debug, Clone)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub ca_pem: String,
    pub fingerprint: String,
    pub expires: DateTime<Utc>,
}

pub struct CertEngine {
    files: CertFileStore,
    keys: Arc<KeyStore>,
    key_domain: u32,
    ca_locks: [Mutex<()>; CertName::ALL.len()],
    recheck: AtomicBool,
}

impl CertEngine {
    pub fn new(files: CertFileStore, keys: Arc<KeyStore>, key_domain: u32) -> Self {
        CertEngine {
            files,
            keys,
            key_domain,
            ca_locks: Default::default(),
            recheck: AtomicBool::new(false),
        }
    }

    pub fn files(&self) -> &CertFileStore {
        &self.files
    }

    fn ca_lock(&self, name: CertName) -> &Mutex<()> {
        let idx = CertName::ALL
            .iter()
            .position(|n| *n == name)
            .unwrap_or_default();
        &self.ca_locks[idx]
    }

    // ── monitor hand-off ──

    /// Advisory flag the monitor polls; set after any trust change.
    pub fn signal_recheck(&self) {
        self.recheck.store(true, Ordering::SeqCst);
    }

    pub fn take_recheck(&self) -> bool {
        self.recheck.swap(false, Ordering::SeqCst)
    }

    // ── root CA ──

    /// Validate and install a base64-encoded root CA.
    pub fn import_root_ca(&self, name: CertName, b64: &str) -> Result<CertInfo, CertmgrError> {
        Checker::new("caContent", b64)
            .required()
            .max_len(MAX_ARTIFACT_BYTES)
            .finish()
            .map_err(|_| CertmgrError::Param("caContent".into()))?;
        let pem = B64
            .decode(b64.trim())
            .map_err(|e| CertmgrError::Param(format!("caContent base64: {e}")))?;
        let info = validate_ca_pem(&pem)?;

        let _guard = lock(self.ca_lock(name));
        self.files.write_ca(name, &pem)?;
        self.signal_recheck();
        tracing::info!(cert = %name, subject = %info.subject, "root CA imported");
        Ok(info)
    }

    /// Remove a root CA and everything that trusted it. Service certs
    /// issued under this root are invalid once the anchor is gone, so
    /// their pair is dropped with it.
    pub fn delete_root_ca(&self, name: CertName) -> Result<(), CertmgrError> {
        let _guard = lock(self.ca_lock(name));
        if !self.files.has_ca(name) {
            return Err(CertStoreError::NotFound(name.to_string()).into());
        }
        self.files.remove_all(name)?;
        self.signal_recheck();
        tracing::info!(cert = %name, "root CA deleted with dependent artifacts");
        Ok(())
    }

    /// Read the installed root. `ws_client` during a rotation returns
    /// old and new concatenated, recognized by the staged file being
    /// on disk.
    pub fn query_ca(&self, name: CertName) -> Result<Vec<u8>, CertmgrError> {
        let mut pem = self.files.read_ca(name)?;
        if name == CertName::WsClient && self.files.has_temp_ca(name) {
            pem.extend_from_slice(&self.files.read_temp_ca(name)?);
        }
        Ok(pem)
    }

    pub fn cert_info(&self, name: CertName) -> Result<CertInfo, CertmgrError> {
        let pem = self.files.read_ca(name)?;
        Ok(parse_cert_info(&pem)?)
    }

    // ── CRL ──

    pub fn import_crl(&self, name: CertName, b64: &str) -> Result<CrlInfo, CertmgrError> {
        let raw = B64
            .decode(b64.trim())
            .map_err(|e| CertmgrError::Param(format!("crlContent base64: {e}")))?;
        if raw.len() > MAX_ARTIFACT_BYTES {
            return Err(CertStoreError::TooLarge(raw.len()).into());
        }

        // The root read and the CRL write must see the same CA, so the
        // whole sequence sits under the per-name lock.
        let _guard = lock(self.ca_lock(name));
        let root = self.files.read_ca(name)?;
        let info = validate_crl(&raw, &root)?;
        self.files.write_crl(name, &raw)?;
        tracing::info!(cert = %name, revoked = info.revoked_serials.len(), "CRL imported");
        Ok(info)
    }

    pub fn query_crl(&self, name: CertName) -> Result<Vec<u8>, CertmgrError> {
        Ok(self.files.read_crl(name)?)
    }

    // ── issuance ──

    /// Make sure this name has a generated issuing CA with its wrapped
    /// key on disk. Externally imported roots cannot issue.
    pub fn ensure_issuing_ca(&self, name: CertName) -> Result<(), CertmgrError> {
        let _guard = lock(self.ca_lock(name));
        if self.files.has_ca(name) && self.files.has_service_pair(name) {
            return Ok(());
        }
        let (ca_pem, key_pem) = generate_ca(name)?;
        let wrapped = wrap_service_key(&self.keys, self.key_domain, key_pem.as_bytes())?;
        self.files.write_ca(name, ca_pem.as_bytes())?;
        self.files
            .write_service_pair(name, ca_pem.as_bytes(), &wrapped)?;
        tracing::info!(cert = %name, "issuing CA generated");
        Ok(())
    }

    /// Sign a CSR under the issuing CA of this name. Issuance for one
    /// name serializes; different names run concurrently.
    pub fn issue_service_cert(
        &self,
        name: CertName,
        csr_pem: &str,
    ) -> Result<IssuedCert, CertmgrError> {
        Checker::new("csrContent", csr_pem)
            .required()
            .max_len(MAX_ARTIFACT_BYTES)
            .matches(&CSR_RE)
            .finish()
            .map_err(|_| CertmgrError::Param("csrContent".into()))?;

        let _guard = lock(self.ca_lock(name));
        let (ca_cert, ca_key, ca_pem) = self.load_issuer(name)?;

        // from_pem verifies the CSR self-signature.
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| CertmgrError::Issue(format!("csr parse: {e}")))?;

        let not_before = Utc::now();
        let expires = not_before + Duration::days(SERVICE_CERT_LIFETIME_DAYS);
        csr.params.not_before = offset(not_before);
        csr.params.not_after = offset(expires);
        csr.params.is_ca = IsCa::ExplicitNoCa;

        let cert = csr
            .signed_by(&ca_cert, &ca_key)
            .map_err(|e| CertmgrError::Issue(format!("sign: {e}")))?;

        let cert_pem = cert.pem();
        let fingerprint = parse_cert_info(cert_pem.as_bytes())?.fingerprint_sha256;
        tracing::info!(cert = %name, fingerprint = %fingerprint, "service certificate issued");
        Ok(IssuedCert {
            cert_pem,
            ca_pem,
            fingerprint,
            expires,
        })
    }

    fn load_issuer(
        &self,
        name: CertName,
    ) -> Result<(rcgen::Certificate, KeyPair, String), CertmgrError> {
        let ca_pem_bytes = self.files.read_ca(name)?;
        let wrapped = self
            .files
            .read_service_key(name)
            .map_err(|_| CertmgrError::Issue(format!("no issuing key for {name}")))?;
        let key_pem = unwrap_service_key(&self.keys, self.key_domain, &wrapped)?;

        let ca_pem = str::from_utf8(&ca_pem_bytes)
            .map_err(|e| CertmgrError::Issue(format!("ca pem utf8: {e}")))?
            .to_string();
        let key_pem = String::from_utf8(key_pem)
            .map_err(|e| CertmgrError::Issue(format!("key pem utf8: {e}")))?;

        let key =
            KeyPair::from_pem(&key_pem).map_err(|e| CertmgrError::Issue(format!("key: {e}")))?;
        // Recreate the issuer certificate object from its stored PEM so
        // signed_by() can reference it.
        let params = CertificateParams::from_ca_cert_pem(&ca_pem)
            .map_err(|e| CertmgrError::Issue(format!("ca params: {e}")))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| CertmgrError::Issue(format!("ca rebuild: {e}")))?;
        Ok((cert, key, ca_pem))
    }

    // ── rotation ──

    /// Rotate the issuing CA of a name through the state machine. On
    /// abandonment the old CA stays active and the error surfaces.
    pub fn rotate_ca(&self, name: CertName) -> Result<(), CertmgrError> {
        let mut steps = EngineRotation {
            engine: self,
            staged_key: None,
        };
        match run_rotation(name, &mut steps, MAX_ROTATION_ATTEMPTS) {
            RotationOutcome::Completed => {
                self.signal_recheck();
                Ok(())
            }
            RotationOutcome::Abandoned { attempts } => Err(CertmgrError::RotationAbandoned {
                name: name.to_string(),
                attempts,
            }),
        }
    }

    // ── CA exchange ──

    /// Write every installed root CA into `dir` as `<name>.crt`.
    pub fn export_cas(&self, dir: &Path) -> Result<usize, CertmgrError> {
        fs::create_dir_all(dir).map_err(mefedge_common::error::CommonError::from)?;
        let mut count = 0;
        for name in CertName::ALL {
            if !self.files.has_ca(name) {
                continue;
            }
            let pem = self.files.read_ca(name)?;
            fs::write(dir.join(format!("{name}.crt")), pem)
                .map_err(mefedge_common::error::CommonError::from)?;
            count += 1;
        }
        Ok(count)
    }

    /// Install every `<name>.crt` found in `dir`, each through the full
    /// validation pipeline.
    pub fn import_cas(&self, dir: &Path) -> Result<usize, CertmgrError> {
        let mut count = 0;
        for name in CertName::ALL {
            let p = dir.join(format!("{name}.crt"));
            if !p.is_file() {
                continue;
            }
            let pem = fs::read(&p).map_err(mefedge_common::error::CommonError::from)?;
            validate_ca_pem(&pem)?;
            let _guard = lock(self.ca_lock(name));
            self.files.write_ca(name, &pem)?;
            count += 1;
        }
        self.signal_recheck();
        Ok(count)
    }
}

/// Rotation steps bound to the engine. The replacement key is held in
/// memory between prepare and post-update; only the staged certificate
/// touches disk, which is what readers key the overlay off.
struct EngineRotation<'a> {
    engine: &'a CertEngine,
    staged_key: Option<(String, String)>,
}

impl RotationSteps for EngineRotation<'_> {
    fn prepare(&mut self, name: CertName) -> Result<(), CertmgrError> {
        let (ca_pem, key_pem) = generate_ca(name)?;
        self.engine.files.write_temp_ca(name, ca_pem.as_bytes())?;
        self.staged_key = Some((ca_pem, key_pem));
        Ok(())
    }

    fn notify(&mut self, name: CertName) -> Result<(), CertmgrError> {
        // Consumers watch the artifact tree; the staged write above is
        // their cue. Nothing further to push from here.
        tracing::debug!(cert = %name, "staged CA visible to consumers");
        Ok(())
    }

    fn post_update(&mut self, name: CertName) -> Result<(), CertmgrError> {
        let (ca_pem, key_pem) = self
            .staged_key
            .take()
            .ok_or_else(|| CertmgrError::Issue("rotation promoted before prepare".into()))?;
        let wrapped =
            wrap_service_key(&self.engine.keys, self.engine.key_domain, key_pem.as_bytes())?;
        self.engine.files.promote_temp_ca(name)?;
        self.engine
            .files
            .write_service_pair(name, ca_pem.as_bytes(), &wrapped)?;
        Ok(())
    }

    fn cleanup(&mut self, name: CertName) {
        self.staged_key = None;
        if let Err(e) = self.engine.files.remove_temp_ca(name) {
            tracing::warn!(cert = %name, error = %e, "failed to remove staged CA");
        }
    }
}

fn generate_ca(name: CertName) -> Result<(String, String), CertmgrError> {
    let key = KeyPair::generate().map_err(|e| CertmgrError::Issue(e.to_string()))?;
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, format!("mef-edge {name} ca"));
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = Utc::now();
    params.not_before = offset(now);
    params.not_after = offset(now + Duration::days(CA_LIFETIME_DAYS));
    let cert = params
        .self_signed(&key)
        .map_err(|e| CertmgrError::Issue(e.to_string()))?;
    Ok((cert.pem(), key.serialize_pem()))
}

fn offset(t: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(t.timestamp())
        .unwrap_or_else(|_| time::OffsetDateTime::now_utc())
}

fn lock(m: &Mutex<()>) -> std::sync::MutexGuard<'_, ()> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine() -> (tempfile::TempDir, CertEngine) {
        let dir = tempdir().unwrap();
        let keys = Arc::new(
            KeyStore::init(&dir.path().join("primary.ks"), &dir.path().join("standby.ks"))
                .unwrap(),
        );
        let files = CertFileStore::new(dir.path().join("certs"));
        (dir, CertEngine::new(files, keys, 2))
    }

    fn csr(cn: &str) -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![cn.to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    #[test]
    fn import_query_delete_root_ca() {
        let (_dir, eng) = engine();
        let (ca_pem, _) = generate_ca(CertName::Northern).unwrap();
        let b64 = B64.encode(ca_pem.as_bytes());

        let info = eng.import_root_ca(CertName::Northern, &b64).unwrap();
        assert!(info.is_ca);
        assert!(eng.take_recheck());

        let stored = eng.query_ca(CertName::Northern).unwrap();
        assert_eq!(stored, ca_pem.as_bytes());

        eng.delete_root_ca(CertName::Northern).unwrap();
        assert!(eng.query_ca(CertName::Northern).is_err());
    }

    #[test]
    fn delete_missing_root_is_not_found() {
        let (_dir, eng) = engine();
        assert!(matches!(
            eng.delete_root_ca(CertName::Image),
            Err(CertmgrError::Store(CertStoreError::NotFound(_)))
        ));
    }

    #[test]
    fn bad_base64_is_param_error() {
        let (_dir, eng) = engine();
        assert!(matches!(
            eng.import_root_ca(CertName::Image, "!!not-base64!!"),
            Err(CertmgrError::Param(_))
        ));
    }

    #[test]
    fn issue_from_csr_chains_to_local_ca() {
        let (_dir, eng) = engine();
        eng.ensure_issuing_ca(CertName::Inner).unwrap();

        let issued = eng
            .issue_service_cert(CertName::Inner, &csr("edge-node-1"))
            .unwrap();
        assert!(issued.cert_pem.contains("BEGIN CERTIFICATE"));
        assert_eq!(issued.fingerprint.len(), 64);

        mefedge_certstore::verify_issued_by(issued.cert_pem.as_bytes(), issued.ca_pem.as_bytes())
            .unwrap();
    }

    #[test]
    fn issue_without_key_fails() {
        let (_dir, eng) = engine();
        let (ca_pem, _) = generate_ca(CertName::Software).unwrap();
        eng.import_root_ca(CertName::Software, &B64.encode(ca_pem.as_bytes()))
            .unwrap();
        assert!(matches!(
            eng.issue_service_cert(CertName::Software, &csr("x")),
            Err(CertmgrError::Issue(_))
        ));
    }

    #[test]
    fn malformed_csr_rejected_before_issuing() {
        let (_dir, eng) = engine();
        eng.ensure_issuing_ca(CertName::Inner).unwrap();
        assert!(matches!(
            eng.issue_service_cert(CertName::Inner, "garbage"),
            Err(CertmgrError::Param(_))
        ));
    }

    #[test]
    fn ws_client_overlay_during_rotation() {
        let (_dir, eng) = engine();
        eng.ensure_issuing_ca(CertName::WsClient).unwrap();
        let old = eng.query_ca(CertName::WsClient).unwrap();

        eng.files.write_temp_ca(CertName::WsClient, b"NEWPEM").unwrap();
        let overlay = eng.query_ca(CertName::WsClient).unwrap();
        assert!(overlay.starts_with(&old));
        assert!(overlay.ends_with(b"NEWPEM"));

        // once the staged file is gone only one chain is served
        eng.files.remove_temp_ca(CertName::WsClient).unwrap();
        assert_eq!(eng.query_ca(CertName::WsClient).unwrap(), old);
    }

    #[test]
    fn rotation_replaces_ca_and_clears_staging() {
        let (_dir, eng) = engine();
        eng.ensure_issuing_ca(CertName::WsClient).unwrap();
        let old = eng.query_ca(CertName::WsClient).unwrap();

        eng.rotate_ca(CertName::WsClient).unwrap();
        let new = eng.query_ca(CertName::WsClient).unwrap();
        assert_ne!(old, new);
        assert!(!eng.files.has_temp_ca(CertName::WsClient));

        // issuance still works under the rotated CA
        eng.issue_service_cert(CertName::WsClient, &csr("c")).unwrap();
    }

    #[test]
    fn exchange_round_trip() {
        let (dir, eng) = engine();
        eng.ensure_issuing_ca(CertName::Inner).unwrap();
        eng.ensure_issuing_ca(CertName::Nginx).unwrap();

        let out = dir.path().join("export");
        assert_eq!(eng.export_cas(&out).unwrap(), 2);

        let (_dir2, other) = engine();
        assert_eq!(other.import_cas(&out).unwrap(), 2);
        assert!(other.files.has_ca(CertName::Inner));
        assert!(other.files.has_ca(CertName::Nginx));
    }

    #[test]
    fn crl_requires_installed_root() {
        let (_dir, eng) = engine();
        assert!(eng.import_crl(CertName::Northern, &B64.encode(b"x")).is_err());
    }

    // base64 of a self-signed root and of a DER CRL it signed
    fn root_with_crl() -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "crl root");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let now = Utc::now();
        params.not_before = offset(now - Duration::hours(1));
        params.not_after = offset(now + Duration::days(365));
        let cert = params.self_signed(&key).unwrap();

        let t = time::OffsetDateTime::now_utc();
        let crl = rcgen::CertificateRevocationListParams {
            this_update: t - time::Duration::hours(1),
            next_update: t + time::Duration::days(30),
            crl_number: rcgen::SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs: vec![],
            key_identifier_method: rcgen::KeyIdMethod::Sha256,
        }
        .signed_by(&cert, &key)
        .unwrap();

        (
            B64.encode(cert.pem().as_bytes()),
            B64.encode(crl.der().as_ref()),
        )
    }

    #[test]
    fn crl_import_accepts_der() {
        let (_dir, eng) = engine();
        let (ca_b64, crl_b64) = root_with_crl();
        eng.import_root_ca(CertName::Northern, &ca_b64).unwrap();

        let info = eng.import_crl(CertName::Northern, &crl_b64).unwrap();
        assert!(info.revoked_serials.is_empty());
        assert!(eng.query_crl(CertName::Northern).is_ok());
    }

    #[test]
    fn crl_never_outlives_its_root() {
        let (_dir, eng) = engine();
        let (ca_b64, crl_b64) = root_with_crl();

        // A CRL import racing a root deletion must not leave a CRL on
        // disk with no anchor, whichever side wins.
        for _ in 0..20 {
            eng.import_root_ca(CertName::Image, &ca_b64).unwrap();
            std::thread::scope(|s| {
                s.spawn(|| {
                    let _ = eng.import_crl(CertName::Image, &crl_b64);
                });
                s.spawn(|| {
                    let _ = eng.delete_root_ca(CertName::Image);
                });
            });
            let has_ca = eng.query_ca(CertName::Image).is_ok();
            let has_crl = eng.query_crl(CertName::Image).is_ok();
            assert!(has_ca || !has_crl, "crl kept after its root was deleted");
            let _ = eng.delete_root_ca(CertName::Image);
        }
    }
}
