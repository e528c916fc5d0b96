//! Version migration chain.
//!
//! Each migrator is labelled by the smallest version that needs it and
//! reshapes the config registry in place. The chain walks forward from
//! the installed version, short-circuits on the first failure, and
//! every step is idempotent so a re-run after a crash is harmless.

use serde_json::{json, Value};

use mefedge_common::paths::EDGECORE_PIPE;
use mefedge_common::registry::ConfigRegistry;

use crate::error::LifecycleError;

const EDGE_CORE: &str = "edge_core";
const EDGE_CORE_CFG: &str = "edgecore.json";
const SYSTEM_RESERVED_CFG: &str = "system_reserved.json";

pub struct Migrator {
    /// Smallest version that requires this migration.
    pub version: &'static str,
    pub name: &'static str,
    pub apply: fn(&ConfigRegistry) -> Result<(), LifecycleError>,
}

/// Built-in chain, ordered by target version.
pub fn builtin_migrators() -> Vec<Migrator> {
    vec![
        Migrator {
            version: "1.0.1",
            name: "edge-core key path to named pipe",
            apply: migrate_pipe_key_path,
        },
        Migrator {
            version: "1.1.0",
            name: "fold system-reserved quotas into edged config",
            apply: migrate_system_reserved,
        },
        Migrator {
            version: "1.2.0",
            name: "seed alarm-config table",
            apply: migrate_alarm_table,
        },
        Migrator {
            version: "1.3.0",
            name: "move kubelet-style fields under edged",
            apply: migrate_edged_fields,
        },
        Migrator {
            version: "1.4.0",
            name: "convert edged root directory",
            apply: migrate_root_dir,
        },
    ]
}

/// Apply every migrator with `from < version ≤ to`, in version order.
/// Returns how many ran.
pub fn run_chain(
    registry: &ConfigRegistry,
    migrators: &[Migrator],
    from: &str,
    to: &str,
) -> Result<usize, LifecycleError> {
    let from_v = parse_version(from);
    let to_v = parse_version(to);
    let mut applied = 0;
    for m in migrators {
        let v = parse_version(m.version);
        if v <= from_v || v > to_v {
            continue;
        }
        tracing::info!(version = m.version, migration = m.name, "applying migration");
        (m.apply)(registry).map_err(|e| LifecycleError::MigrationFailed {
            version: m.version.to_string(),
            reason: e.to_string(),
        })?;
        applied += 1;
    }
    Ok(applied)
}

fn parse_version(v: &str) -> Vec<u64> {
    v.split(['.', '-'])
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

fn load_edgecore(registry: &ConfigRegistry) -> Value {
    registry
        .read_json(EDGE_CORE, EDGE_CORE_CFG)
        .unwrap_or_else(|_| json!({}))
}

// ── migrators ──

fn migrate_pipe_key_path(registry: &ConfigRegistry) -> Result<(), LifecycleError> {
    let mut cfg = load_edgecore(registry);
    cfg["edged"]["tlsPrivateKeyFile"] = json!(EDGECORE_PIPE);
    registry.write_json(EDGE_CORE, EDGE_CORE_CFG, &cfg)?;
    Ok(())
}

fn migrate_system_reserved(registry: &ConfigRegistry) -> Result<(), LifecycleError> {
    let reserved: Value = match registry.read_json(EDGE_CORE, SYSTEM_RESERVED_CFG) {
        Ok(v) => v,
        Err(_) => return Ok(()), // nothing to fold
    };
    let mut cfg = load_edgecore(registry);
    if cfg["edged"]["systemReserved"].is_object() {
        return Ok(());
    }
    cfg["edged"]["systemReserved"] = json!({
        "cpu": reserved.get("cpu").cloned().unwrap_or(Value::Null),
        "memory": reserved.get("memory").cloned().unwrap_or(Value::Null),
    });
    registry.write_json(EDGE_CORE, EDGE_CORE_CFG, &cfg)?;
    Ok(())
}

fn migrate_alarm_table(registry: &ConfigRegistry) -> Result<(), LifecycleError> {
    registry.create_tables()?;
    registry.seed_alarm_config(&[
        ("EffectFailed", "critical"),
        ("DiskFull", "major"),
        ("RotationAbandoned", "major"),
        ("CertNearExpiry", "minor"),
    ])?;
    Ok(())
}

fn migrate_edged_fields(registry: &ConfigRegistry) -> Result<(), LifecycleError> {
    let mut cfg = load_edgecore(registry);
    let moved = [
        "tlsCaFile",
        "tlsCertFile",
        "hostnameOverride",
        "cgroupDriver",
        "nodeIP",
    ];
    for key in moved {
        if let Some(v) = cfg.as_object_mut().and_then(|o| o.remove(key)) {
            cfg["edged"][key] = v;
        }
    }
    if let Some(serial) = cfg
        .as_object_mut()
        .and_then(|o| o.remove("serialNumber"))
    {
        cfg["edged"]["nodeLabels"]["serialNumber"] = serial;
    }
    registry.write_json(EDGE_CORE, EDGE_CORE_CFG, &cfg)?;
    Ok(())
}

fn migrate_root_dir(registry: &ConfigRegistry) -> Result<(), LifecycleError> {
    let mut cfg = load_edgecore(registry);
    if cfg["edged"]["rootDirectory"] == json!("/var/lib/kubelet") {
        cfg["edged"]["rootDirectory"] = json!("/var/lib/edged");
        registry.write_json(EDGE_CORE, EDGE_CORE_CFG, &cfg)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry() -> (tempfile::TempDir, ConfigRegistry) {
        let dir = tempdir().unwrap();
        let reg = ConfigRegistry::open_in_memory(dir.path()).unwrap();
        (dir, reg)
    }

    fn seed_legacy(reg: &ConfigRegistry) {
        reg.write_json(
            EDGE_CORE,
            EDGE_CORE_CFG,
            &json!({
                "tlsCaFile": "/old/ca.crt",
                "hostnameOverride": "node-7",
                "serialNumber": "SN-7",
                "edged": { "rootDirectory": "/var/lib/kubelet" }
            }),
        )
        .unwrap();
        reg.write_json(EDGE_CORE, SYSTEM_RESERVED_CFG, &json!({"cpu": "500m", "memory": "1Gi"}))
            .unwrap();
    }

    #[test]
    fn full_chain_reshapes_config() {
        let (_dir, reg) = registry();
        seed_legacy(&reg);

        let n = run_chain(&reg, &builtin_migrators(), "1.0.0", "1.4.0").unwrap();
        assert_eq!(n, 5);

        let cfg: Value = reg.read_json(EDGE_CORE, EDGE_CORE_CFG).unwrap();
        assert_eq!(cfg["edged"]["tlsPrivateKeyFile"], json!(EDGECORE_PIPE));
        assert_eq!(cfg["edged"]["systemReserved"]["cpu"], json!("500m"));
        assert_eq!(cfg["edged"]["tlsCaFile"], json!("/old/ca.crt"));
        assert_eq!(cfg["edged"]["nodeLabels"]["serialNumber"], json!("SN-7"));
        assert_eq!(cfg["edged"]["rootDirectory"], json!("/var/lib/edged"));
        assert!(cfg.get("tlsCaFile").is_none());
        assert!(reg.has_alarm_config("EffectFailed").unwrap());
    }

    #[test]
    fn chain_is_idempotent() {
        let (_dir, reg) = registry();
        seed_legacy(&reg);

        run_chain(&reg, &builtin_migrators(), "1.0.0", "1.4.0").unwrap();
        let once: Value = reg.read_json(EDGE_CORE, EDGE_CORE_CFG).unwrap();

        run_chain(&reg, &builtin_migrators(), "1.0.0", "1.4.0").unwrap();
        let twice: Value = reg.read_json(EDGE_CORE, EDGE_CORE_CFG).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn only_versions_in_window_run() {
        let (_dir, reg) = registry();
        seed_legacy(&reg);
        let n = run_chain(&reg, &builtin_migrators(), "1.1.0", "1.2.0").unwrap();
        assert_eq!(n, 1);

        let cfg: Value = reg.read_json(EDGE_CORE, EDGE_CORE_CFG).unwrap();
        // the 1.0.1 pipe migration must not have run
        assert!(cfg["edged"].get("tlsPrivateKeyFile").is_none());
    }

    #[test]
    fn failure_short_circuits() {
        let (_dir, reg) = registry();
        fn boom(_: &ConfigRegistry) -> Result<(), LifecycleError> {
            Err(LifecycleError::Param("bad state".into()))
        }
        fn never(_: &ConfigRegistry) -> Result<(), LifecycleError> {
            panic!("must not run");
        }
        let chain = vec![
            Migrator { version: "1.1.0", name: "boom", apply: boom },
            Migrator { version: "1.2.0", name: "after", apply: never },
        ];
        let err = run_chain(&reg, &chain, "1.0.0", "2.0.0").unwrap_err();
        assert!(matches!(err, LifecycleError::MigrationFailed { ref version, .. } if version == "1.1.0"));
    }
}
