//! Net-manager configuration flow.
//!
//! Switching to MEF mode installs the cloud root CA, drops the trust
//! material that belonged to the previous connection and stores the
//! access token encrypted. Plaintext tokens exist only in memory.

use std::sync::Arc;

use mefedge_certmgr::CertEngine;
use mefedge_certstore::CertName;
use mefedge_common::registry::{ConfigRegistry, NetManagerConfig, NetType};
use mefedge_common::validate::{Checker, IPV4_RE};
use mefedge_keystore::KeyStore;

use crate::error::LifecycleError;

#[derive(Debug, Clone, Default)]
pub struct NetConfigUpdate {
    pub net_type: Option<NetType>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub with_om: Option<bool>,
    pub token: Option<String>,
    pub cloud_ca_b64: Option<String>,
}

pub struct NetConfigManager {
    registry: Arc<ConfigRegistry>,
    engine: Arc<CertEngine>,
    keys: Arc<KeyStore>,
    key_domain: u32,
}

impl NetConfigManager {
    pub fn new(
        registry: Arc<ConfigRegistry>,
        engine: Arc<CertEngine>,
        keys: Arc<KeyStore>,
        key_domain: u32,
    ) -> Self {
        NetConfigManager {
            registry,
            engine,
            keys,
            key_domain,
        }
    }

    /// Current config with the token ciphertext stripped; safe to hand
    /// to the cloud side.
    pub fn get(&self) -> Result<NetManagerConfig, LifecycleError> {
        let mut cfg = self.registry.net_config()?.unwrap_or_default();
        cfg.token_cipher.clear();
        Ok(cfg)
    }

    /// Decrypt the stored token. Only the transport setup calls this.
    pub fn token(&self) -> Result<Option<String>, LifecycleError> {
        let cfg = self.registry.net_config()?.unwrap_or_default();
        if cfg.token_cipher.is_empty() {
            return Ok(None);
        }
        let plain = self.keys.decrypt(self.key_domain, &cfg.token_cipher)?;
        String::from_utf8(plain)
            .map(Some)
            .map_err(|_| LifecycleError::Param("stored token is not utf-8".into()))
    }

    pub fn set(&self, update: NetConfigUpdate) -> Result<NetManagerConfig, LifecycleError> {
        let mut cfg = self.registry.net_config()?.unwrap_or_default();

        if let Some(ip) = &update.ip {
            Checker::new("ip", ip)
                .required()
                .max_len(64)
                .matches(&IPV4_RE)
                .finish()
                .map_err(|_| LifecycleError::Param(format!("invalid ip: {ip}")))?;
            cfg.ip = ip.clone();
        }
        if let Some(port) = update.port {
            if port == 0 {
                return Err(LifecycleError::Param("port must be non-zero".into()));
            }
            cfg.port = port;
        }
        if let Some(with_om) = update.with_om {
            cfg.with_om = with_om;
        }
        if let Some(net_type) = update.net_type {
            cfg.net_type = net_type;
        }

        if cfg.net_type == NetType::Mef {
            if cfg.ip.is_empty() || cfg.port == 0 {
                return Err(LifecycleError::Param(
                    "MEF mode requires ip and port".into(),
                ));
            }
            self.switch_to_mef(&update)?;
        }

        if let Some(token) = &update.token {
            if token.is_empty() {
                return Err(LifecycleError::Param("token must not be empty".into()));
            }
            cfg.token_cipher = self.keys.encrypt(self.key_domain, token.as_bytes())?;
        }

        self.registry.set_net_config(&cfg)?;
        tracing::info!(net_type = ?cfg.net_type, ip = %cfg.ip, port = cfg.port, "net config updated");

        cfg.token_cipher.clear();
        Ok(cfg)
    }

    /// MEF switch-over: install the cloud CA and drop the ws-client
    /// pair and the OM-facing CA so the next connection re-enrolls.
    fn switch_to_mef(&self, update: &NetConfigUpdate) -> Result<(), LifecycleError> {
        if let Some(ca) = &update.cloud_ca_b64 {
            self.engine.import_root_ca(CertName::Northern, ca)?;
        }
        let files = self.engine.files();
        files.remove_service_pair(CertName::WsClient)?;
        files.remove_ca(CertName::WsClient)?;
        files.remove_all(CertName::Inner)?;
        Ok(())
    }
}
