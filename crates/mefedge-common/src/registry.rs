//! Config registry: per-component JSON namespaces plus the embedded
//! relational store (`mef-main.db`).
//!
//! The DB is only ever opened by one process (the lock file guards
//! writers); within the process a single connection behind a mutex is
//! enough for the low write rate.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backup::{read_with_backup_validated, write_with_backup};
use crate::error::CommonError;

/// Persistent net-manager configuration row.
///
/// `token` is ciphertext produced by the key store; plaintext never
/// reaches this struct.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NetManagerConfig {
    pub net_type: NetType,
    pub ip: String,
    pub port: u16,
    pub with_om: bool,
    #[serde(default)]
    pub token_cipher: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NetType {
    #[serde(rename = "FD")]
    Fd,
    #[serde(rename = "MEF")]
    Mef,
}

impl Default for NetManagerConfig {
    fn default() -> Self {
        Self {
            net_type: NetType::Fd,
            ip: String::new(),
            port: 0,
            with_om: true,
            token_cipher: Vec::new(),
        }
    }
}

/// Handle over the registry DB and the JSON config tree.
#[derive(Debug)]
pub struct ConfigRegistry {
    conn: Mutex<Connection>,
    config_root: PathBuf,
}

impl ConfigRegistry {
    /// Open (or create) the registry DB and bind the JSON config root.
    pub fn open(db_path: &Path, config_root: &Path) -> Result<Self, CommonError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        let registry = Self {
            conn: Mutex::new(conn),
            config_root: config_root.to_path_buf(),
        };
        registry.create_tables()?;
        Ok(registry)
    }

    /// In-memory registry for tests.
    pub fn open_in_memory(config_root: &Path) -> Result<Self, CommonError> {
        let conn = Connection::open_in_memory()?;
        let registry = Self {
            conn: Mutex::new(conn),
            config_root: config_root.to_path_buf(),
        };
        registry.create_tables()?;
        Ok(registry)
    }

    /// Create the tables install depends on. Idempotent.
    pub fn create_tables(&self) -> Result<(), CommonError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS node_info (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS net_config (
                 id     INTEGER PRIMARY KEY CHECK (id = 1),
                 config TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS alarm_config (
                 alarm_id  TEXT PRIMARY KEY,
                 severity  TEXT NOT NULL,
                 enabled   INTEGER NOT NULL DEFAULT 1
             );
             CREATE TABLE IF NOT EXISTS alarm_active (
                 alarm_id   TEXT NOT NULL,
                 raised_at  TEXT NOT NULL
             );",
        )?;
        Ok(())
    }

    // ── node_info ───────────────────────────────────────────────────

    pub fn set_node_info(&self, key: &str, value: &str) -> Result<(), CommonError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        conn.execute(
            "INSERT INTO node_info (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn node_info(&self, key: &str) -> Result<Option<String>, CommonError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let value = conn
            .query_row(
                "SELECT value FROM node_info WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    // ── net_config ──────────────────────────────────────────────────

    pub fn set_net_config(&self, config: &NetManagerConfig) -> Result<(), CommonError> {
        let json = serde_json::to_string(config)
            .map_err(|e| CommonError::ParamInvalid(e.to_string()))?;
        let conn = self.conn.lock().expect("registry mutex poisoned");
        conn.execute(
            "INSERT INTO net_config (id, config) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET config = excluded.config",
            params![json],
        )?;
        Ok(())
    }

    pub fn net_config(&self) -> Result<Option<NetManagerConfig>, CommonError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let json: Option<String> = conn
            .query_row("SELECT config FROM net_config WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        match json {
            Some(j) => Ok(Some(
                serde_json::from_str(&j).map_err(|e| CommonError::ParamInvalid(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    // ── alarms ──────────────────────────────────────────────────────

    pub fn seed_alarm_config(&self, rows: &[(&str, &str)]) -> Result<(), CommonError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        for (id, severity) in rows {
            conn.execute(
                "INSERT OR IGNORE INTO alarm_config (alarm_id, severity) VALUES (?1, ?2)",
                params![id, severity],
            )?;
        }
        Ok(())
    }

    pub fn raise_alarm(&self, alarm_id: &str) -> Result<(), CommonError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        conn.execute(
            "INSERT INTO alarm_active (alarm_id, raised_at) VALUES (?1, ?2)",
            params![alarm_id, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Clear all active alarm rows; the effect flow runs this before
    /// the slot swap.
    pub fn clear_active_alarms(&self) -> Result<usize, CommonError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let n = conn.execute("DELETE FROM alarm_active", [])?;
        Ok(n)
    }

    pub fn active_alarm_count(&self) -> Result<usize, CommonError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM alarm_active", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn has_alarm_config(&self, alarm_id: &str) -> Result<bool, CommonError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM alarm_config WHERE alarm_id = ?1",
            params![alarm_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    // ── JSON namespaces ─────────────────────────────────────────────

    /// Path of a component's JSON document.
    pub fn json_path(&self, component: &str, file: &str) -> PathBuf {
        self.config_root.join(component).join(file)
    }

    /// Read a component JSON document through the backup layer.
    pub fn read_json<T: DeserializeOwned>(
        &self,
        component: &str,
        file: &str,
    ) -> Result<T, CommonError> {
        let path = self.json_path(component, file);
        let bytes = read_with_backup_validated(&path, |b| {
            serde_json::from_slice::<serde_json::Value>(b).is_ok()
        })?;
        serde_json::from_slice(&bytes).map_err(|e| CommonError::ParamInvalid(e.to_string()))
    }

    /// Write a component JSON document through the backup layer.
    pub fn write_json<T: Serialize>(
        &self,
        component: &str,
        file: &str,
        value: &T,
    ) -> Result<(), CommonError> {
        let path = self.json_path(component, file);
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| CommonError::ParamInvalid(e.to_string()))?;
        write_with_backup(&path, &json)
    }

    /// Run a closure against the raw connection. Migrators use this to
    /// reshape tables.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, CommonError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        Ok(f(&conn)?)
    }
}
