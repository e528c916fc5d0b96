//! Periodic certificate check.
//!
//! One scheduling task walks every installed certificate, rotates the
//! issuing CAs that are inside the renewal margin and drives the
//! working-key rotation. A compare-and-swap flag keeps two passes from
//! overlapping; the engine's advisory flag pulls the next pass forward
//! after a trust change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mefedge_certstore::{CertName, NEAR_EXPIRY_WARN_DAYS};
use mefedge_keystore::KeyStore;

use crate::engine::CertEngine;
use crate::error::CertmgrError;

pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 3600;

/// How often the advisory flag is polled between full passes.
const RECHECK_POLL_SECS: u64 = 5;

pub struct CertMonitor {
    engine: Arc<CertEngine>,
    keys: Arc<KeyStore>,
    key_domain: u32,
    margin_days: i64,
    checking: AtomicBool,
}

impl CertMonitor {
    pub fn new(engine: Arc<CertEngine>, keys: Arc<KeyStore>, key_domain: u32) -> Self {
        CertMonitor {
            engine,
            keys,
            key_domain,
            margin_days: NEAR_EXPIRY_WARN_DAYS,
            checking: AtomicBool::new(false),
        }
    }

    pub fn with_margin_days(mut self, days: i64) -> Self {
        self.margin_days = days;
        self
    }

    /// One full pass. Returns the number of rotated CAs, or zero when
    /// another pass already holds the flag.
    pub fn check_once(&self) -> usize {
        if self
            .checking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("certificate check already running, skipping");
            return 0;
        }

        let mut rotated = 0;
        for name in CertName::ALL {
            match self.check_one(name) {
                Ok(true) => rotated += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(cert = %name, error = %e, "certificate check failed");
                }
            }
        }

        if let Err(e) = self.keys.check_and_update(self.key_domain, self.margin_days) {
            tracing::error!(error = %e, "working-key check failed");
        }

        self.checking.store(false, Ordering::SeqCst);
        rotated
    }

    fn check_one(&self, name: CertName) -> Result<bool, CertmgrError> {
        if !self.engine.files().has_ca(name) {
            return Ok(false);
        }
        let info = self.engine.cert_info(name)?;
        let days_left = (info.not_after - Utc::now()).num_days();
        if days_left > self.margin_days {
            return Ok(false);
        }
        if !self.engine.files().has_service_pair(name) {
            // Imported root, nothing local to renew with. The operator
            // has to re-import.
            tracing::warn!(cert = %name, days_left, "imported root near expiry");
            return Ok(false);
        }
        tracing::info!(cert = %name, days_left, "certificate inside renewal margin, rotating");
        self.engine.rotate_ca(name)?;
        Ok(true)
    }

    /// Scheduling loop. Runs until the shutdown channel flips to true.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(interval);
        let mut poll = tokio::time::interval(Duration::from_secs(RECHECK_POLL_SECS));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.check_once();
                }
                _ = poll.tick() => {
                    if self.engine.take_recheck() {
                        self.check_once();
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("certificate monitor stopping");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mefedge_certstore::{wrap_service_key, CertFileStore};
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<CertEngine>, Arc<KeyStore>) {
        let dir = tempdir().unwrap();
        let keys = Arc::new(
            KeyStore::init(&dir.path().join("primary.ks"), &dir.path().join("standby.ks"))
                .unwrap(),
        );
        let files = CertFileStore::new(dir.path().join("certs"));
        let engine = Arc::new(CertEngine::new(files, keys.clone(), 2));
        (dir, engine, keys)
    }

    fn install_expiring_ca(engine: &CertEngine, keys: &KeyStore, name: CertName, days: i64) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, format!("{name} ca"));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign];
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(days);
        let cert = params.self_signed(&key).unwrap();

        let wrapped = wrap_service_key(keys, 2, key.serialize_pem().as_bytes()).unwrap();
        engine.files().write_ca(name, cert.pem().as_bytes()).unwrap();
        engine
            .files()
            .write_service_pair(name, cert.pem().as_bytes(), &wrapped)
            .unwrap();
    }

    #[test]
    fn fresh_ca_is_left_alone() {
        let (_dir, engine, keys) = setup();
        install_expiring_ca(&engine, &keys, CertName::Inner, 900);
        let monitor = CertMonitor::new(engine.clone(), keys, 2);
        assert_eq!(monitor.check_once(), 0);
    }

    #[test]
    fn near_expiry_ca_is_rotated() {
        let (_dir, engine, keys) = setup();
        install_expiring_ca(&engine, &keys, CertName::Inner, 10);
        let before = engine.cert_info(CertName::Inner).unwrap();

        let monitor = CertMonitor::new(engine.clone(), keys, 2);
        assert_eq!(monitor.check_once(), 1);

        let after = engine.cert_info(CertName::Inner).unwrap();
        assert!(after.not_after > before.not_after);
    }

    #[test]
    fn imported_root_is_only_warned() {
        let (_dir, engine, keys) = setup();
        install_expiring_ca(&engine, &keys, CertName::Northern, 10);
        engine.files().remove_service_pair(CertName::Northern).unwrap();

        let monitor = CertMonitor::new(engine.clone(), keys, 2);
        assert_eq!(monitor.check_once(), 0);
        assert!(engine.files().has_ca(CertName::Northern));
    }

    #[test]
    fn overlapping_pass_is_skipped() {
        let (_dir, engine, keys) = setup();
        let monitor = CertMonitor::new(engine, keys, 2);
        monitor.checking.store(true, Ordering::SeqCst);
        assert_eq!(monitor.check_once(), 0);
    }
}
