//! Subcommand handlers.
//!
//! Each function wires the crates together for one verb, takes the
//! singleton lock where the verb mutates node state, and maps failures
//! to a non-zero exit through `anyhow`.

use std::fs;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::Context;

use mefedge_certmgr::CertEngine;
use mefedge_certstore::{unwrap_service_key, CertFileStore, CertName};
use mefedge_common::lock::SingletonLock;
use mefedge_common::paths::{PathLayout, EDGECORE_PIPE, SINGLETON_LOCK_NAME};
use mefedge_common::registry::{ConfigRegistry, NetType};
use mefedge_keystore::KeyStore;
use mefedge_lifecycle::install::{InstallOptions, Installer};
use mefedge_lifecycle::netconfig::{NetConfigManager, NetConfigUpdate};
use mefedge_lifecycle::recovery::{recover_logs, RecoveryFlow};
use mefedge_lifecycle::reset::ResetFlow;
use mefedge_lifecycle::upgrade::{Preparer, UpgradeOptions};
use mefedge_lifecycle::{effect, LifecyclePhase, PhaseGuard, PhaseTracker, SystemdSupervisor};

/// Key-store domain sealing certificate private keys.
pub const CERT_KEY_DOMAIN: u32 = 2;

/// Key-store domain sealing the cloud access token.
pub const NET_KEY_DOMAIN: u32 = 3;

/// Component whose config tree carries the key store and managed certs.
pub const OWNER_COMPONENT: &str = "edge_om";

const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

pub fn open_keystore(layout: &PathLayout) -> anyhow::Result<Arc<KeyStore>> {
    let store = KeyStore::init(
        &layout.kmc_primary(OWNER_COMPONENT),
        &layout.kmc_standby(OWNER_COMPONENT),
    )
    .context("open key store")?;
    Ok(Arc::new(store))
}

pub fn open_registry(layout: &PathLayout) -> anyhow::Result<ConfigRegistry> {
    ConfigRegistry::open(&layout.db_file(), &layout.config_root()).context("open registry")
}

pub fn cert_engine(layout: &PathLayout, keys: Arc<KeyStore>) -> CertEngine {
    let files = CertFileStore::new(layout.config_dir(OWNER_COMPONENT).join("certs"));
    CertEngine::new(files, keys, CERT_KEY_DOMAIN)
}

fn take_lock(reason: &str) -> anyhow::Result<SingletonLock> {
    SingletonLock::lock(Path::new("/run").join(SINGLETON_LOCK_NAME), reason)
        .context("another lifecycle operation is in progress")
}

/// In-process phase exclusivity; the flock above covers other
/// processes.
fn enter_phase(phase: LifecyclePhase) -> anyhow::Result<PhaseGuard<'static>> {
    static TRACKER: OnceLock<PhaseTracker> = OnceLock::new();
    let guard = TRACKER.get_or_init(PhaseTracker::new).begin(phase)?;
    Ok(guard)
}

pub fn install(layout: &PathLayout, pkg_dir: PathBuf, allow_tmpfs: bool) -> anyhow::Result<()> {
    let mut lock = take_lock("install")?;
    let _phase = enter_phase(LifecyclePhase::Installing)?;

    let installer = Installer::new(layout.root());
    let result = installer.run(&InstallOptions {
        pkg_dir,
        allow_tmpfs,
    });
    if let Err(err) = &result {
        let _ = lock.record_reason(&format!("install failed: {err}"));
    }
    result.context("install")?;

    // Seed the key store so first boot does not race its creation.
    open_keystore(layout)?.finalize();
    println!("install complete");
    Ok(())
}

pub fn upgrade_prepare(
    layout: &PathLayout,
    pkg_dir: PathBuf,
    log_dir: PathBuf,
    log_backup_dir: PathBuf,
) -> anyhow::Result<()> {
    let mut lock = take_lock("upgrade")?;
    let _phase = enter_phase(LifecyclePhase::Upgrading)?;
    let result = Preparer::new(layout.clone()).run(&UpgradeOptions {
        pkg_dir,
        log_dir,
        log_backup_dir,
    });
    if let Err(err) = &result {
        let _ = lock.record_reason(&format!("upgrade failed: {err}"));
    }
    result.context("upgrade")?;
    println!("upgrade staged; run with --mode effect to apply");
    Ok(())
}

pub fn upgrade_effect(
    layout: &PathLayout,
    log_dir: PathBuf,
    log_backup_dir: PathBuf,
) -> anyhow::Result<()> {
    let mut lock = take_lock("effect")?;
    let _phase = enter_phase(LifecyclePhase::Effecting)?;
    let registry = open_registry(layout)?;
    let supervisor = SystemdSupervisor::new(layout.clone(), SYSTEMD_UNIT_DIR);
    let flow = effect::EffectFlow::new(layout.clone(), &registry, &supervisor);
    let result = flow.run(&effect::EffectOptions {
        log_dir,
        log_backup_dir,
    });
    if let Err(err) = &result {
        let _ = lock.record_reason(&format!("effect failed: {err}"));
    }
    result.context("effect")?;
    println!("upgrade effected");
    Ok(())
}

pub fn recovery(layout: &PathLayout) -> anyhow::Result<()> {
    let _lock = take_lock("recovery")?;
    let _phase = enter_phase(LifecyclePhase::Recovering)?;
    let registry = open_registry(layout)?;
    RecoveryFlow::new(layout.clone())
        .run(&registry)
        .context("recovery")?;
    println!("recovery complete");
    Ok(())
}

pub fn reset(layout: &PathLayout) -> anyhow::Result<()> {
    let mut lock = take_lock("reset")?;
    let _phase = enter_phase(LifecyclePhase::Effecting)?;
    let registry = open_registry(layout)?;
    let certs = CertFileStore::new(layout.config_dir(OWNER_COMPONENT).join("certs"));
    let supervisor = SystemdSupervisor::new(layout.clone(), SYSTEMD_UNIT_DIR);
    let result = ResetFlow::new(layout.clone()).run(&registry, &certs, &supervisor);
    if let Err(err) = &result {
        let _ = lock.record_reason(&format!("reset failed: {err}"));
    }
    result.context("reset")?;
    println!("factory reset complete");
    Ok(())
}

pub fn exchange_certs(
    layout: &PathLayout,
    import: Option<PathBuf>,
    export: Option<PathBuf>,
) -> anyhow::Result<()> {
    let keys = open_keystore(layout)?;
    let engine = cert_engine(layout, keys);
    match (import, export) {
        (Some(dir), None) => {
            let count = engine.import_cas(&dir).context("import certificates")?;
            println!("imported {count} certificate(s)");
        }
        (None, Some(dir)) => {
            let count = engine.export_cas(&dir).context("export certificates")?;
            println!("exported {count} certificate(s)");
        }
        _ => anyhow::bail!("exactly one of --import or --export is required"),
    }
    Ok(())
}

/// Write the edge-core TLS private key down its named pipe. The open
/// blocks until edge-core is reading on the other end.
pub fn prepare_edgecore(layout: &PathLayout) -> anyhow::Result<()> {
    let keys = open_keystore(layout)?;
    let files = CertFileStore::new(layout.config_dir(OWNER_COMPONENT).join("certs"));
    let wrapped = files
        .read_service_key(CertName::Inner)
        .context("no edge-core service key on disk")?;
    let key_pem = unwrap_service_key(&keys, CERT_KEY_DOMAIN, &wrapped).context("unseal key")?;

    let pipe = Path::new(EDGECORE_PIPE);
    fs::set_permissions(pipe, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("pipe missing: {}", pipe.display()))?;
    let mut out = fs::OpenOptions::new()
        .write(true)
        .open(pipe)
        .context("open key pipe")?;
    out.write_all(&key_pem).context("write key pipe")?;
    tracing::info!("edge-core key delivered");
    Ok(())
}

pub fn recover_log(log_dir: &Path) -> anyhow::Result<()> {
    let repaired = recover_logs(log_dir).context("recover logs")?;
    println!("repaired {repaired} entr(ies)");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn net_config(
    layout: &PathLayout,
    net_type: Option<String>,
    ip: Option<String>,
    port: Option<u16>,
    with_om: Option<bool>,
    token: Option<String>,
    cloud_ca: Option<String>,
) -> anyhow::Result<()> {
    let keys = open_keystore(layout)?;
    let engine = Arc::new(cert_engine(layout, keys.clone()));
    let registry = Arc::new(open_registry(layout)?);
    let manager = NetConfigManager::new(registry, engine, keys, NET_KEY_DOMAIN);

    let is_update = net_type.is_some()
        || ip.is_some()
        || port.is_some()
        || with_om.is_some()
        || token.is_some()
        || cloud_ca.is_some();
    let cfg = if is_update {
        let net_type = match net_type.as_deref() {
            None => None,
            Some("FD") => Some(NetType::Fd),
            Some("MEF") => Some(NetType::Mef),
            Some(other) => anyhow::bail!("unknown net type: {other}"),
        };
        manager
            .set(NetConfigUpdate {
                net_type,
                ip,
                port,
                with_om,
                token,
                cloud_ca_b64: cloud_ca,
            })
            .context("update net config")?
    } else {
        manager.get().context("read net config")?
    };
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}
