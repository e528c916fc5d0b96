//! Working-key storage and the sealing format.
//!
//! Ciphertext layout: `key_id (u32 LE) || nonce (12) || aes-gcm body`.
//! Old keys stay decrypt-only ("inactive") after rotation so material
//! sealed before a rotation still opens.

use std::fs;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::KeyStoreError;

/// Working keys are rotated after this many days by default.
pub const DEFAULT_KEY_LIFETIME_DAYS: i64 = 180;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 4 + NONCE_LEN;
const STORE_MODE: u32 = 0o600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum KeyStatus {
    Active,
    Inactive,
}

#[derive(Serialize, Deserialize)]
struct WorkingKey {
    id: u32,
    #[serde(with = "b64")]
    material: Vec<u8>,
    created_at: DateTime<Utc>,
    status: KeyStatus,
}

impl Drop for WorkingKey {
    fn drop(&mut self) {
        self.material.zeroize();
    }
}

#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    version: u16,
    domains: std::collections::BTreeMap<u32, Vec<WorkingKey>>,
}

mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

struct Inner {
    file: StoreFile,
    /// XOR mask applied to key material while resident.
    mask: [u8; KEY_LEN],
    finalized: bool,
}

/// Process-wide encrypt/decrypt service bound to a primary + standby
/// key-store file pair.
pub struct KeyStore {
    primary: PathBuf,
    standby: PathBuf,
    lifetime_days: i64,
    inner: Mutex<Inner>,
}

impl KeyStore {
    /// Bind the store to its file pair, loading existing keys or
    /// creating empty stores.
    pub fn init(primary: &Path, standby: &Path) -> Result<Self, KeyStoreError> {
        for path in [primary, standby] {
            let parent = path
                .parent()
                .ok_or_else(|| KeyStoreError::Init(format!("bad store path: {}", path.display())))?;
            fs::create_dir_all(parent)
                .map_err(|e| KeyStoreError::Init(format!("create store dir: {e}")))?;
        }

        let file = load_newer(primary, standby)?;
        let mut mask = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut mask);

        let mut inner = Inner {
            file,
            mask,
            finalized: false,
        };
        apply_mask(&mut inner);

        let store = Self {
            primary: primary.to_path_buf(),
            standby: standby.to_path_buf(),
            lifetime_days: DEFAULT_KEY_LIFETIME_DAYS,
            inner: Mutex::new(inner),
        };
        store.persist_locked(&store.inner.lock().expect("keystore mutex poisoned"))?;
        Ok(store)
    }

    /// Seal `plain` under `domain`. Empty input is a parameter error.
    pub fn encrypt(&self, domain: u32, plain: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        if plain.is_empty() {
            return Err(KeyStoreError::ParamCheck("empty plaintext".into()));
        }
        let mut inner = self.inner.lock().expect("keystore mutex poisoned");
        check_live(&inner)?;
        refresh_mask(&mut inner);
        self.ensure_active_key(&mut inner, domain)?;

        let (id, key) = unmasked_active(&inner, domain)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let body = cipher
            .encrypt(&nonce, plain)
            .map_err(|_| KeyStoreError::Internal("encrypt failed".into()))?;
        drop_key(key);

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Open ciphertext sealed by [`KeyStore::encrypt`].
    pub fn decrypt(&self, domain: u32, cipher_bytes: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        if cipher_bytes.len() <= HEADER_LEN {
            return Err(KeyStoreError::ParamCheck("ciphertext too short".into()));
        }
        let mut inner = self.inner.lock().expect("keystore mutex poisoned");
        check_live(&inner)?;
        refresh_mask(&mut inner);

        let id = u32::from_le_bytes(cipher_bytes[..4].try_into().expect("header len"));
        let nonce = Nonce::from_slice(&cipher_bytes[4..HEADER_LEN]);
        let body = &cipher_bytes[HEADER_LEN..];

        let key = unmasked_by_id(&inner, domain, id)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plain = cipher
            .decrypt(nonce, body)
            .map_err(|_| KeyStoreError::Internal("decrypt failed".into()));
        drop_key(key);
        plain
    }

    /// Rotate the working key if it is within `days_in_advance` days of
    /// the end of its lifetime. Returns true if a rotation happened.
    pub fn check_and_update(&self, domain: u32, days_in_advance: i64) -> Result<bool, KeyStoreError> {
        let mut inner = self.inner.lock().expect("keystore mutex poisoned");
        check_live(&inner)?;
        self.ensure_active_key(&mut inner, domain)?;

        let due = {
            let keys = inner.file.domains.get(&domain).expect("domain ensured");
            let active = keys
                .iter()
                .find(|k| k.status == KeyStatus::Active)
                .expect("active key ensured");
            let expires = active.created_at + Duration::days(self.lifetime_days);
            Utc::now() + Duration::days(days_in_advance) >= expires
        };
        if !due {
            return Ok(false);
        }

        self.rotate(&mut inner, domain)?;
        tracing::info!(domain, "working key rotated");
        Ok(true)
    }

    /// Close the store. Idempotent; later operations fail `NotInit`.
    pub fn finalize(&self) {
        let mut inner = self.inner.lock().expect("keystore mutex poisoned");
        if inner.finalized {
            return;
        }
        for keys in inner.file.domains.values_mut() {
            for k in keys {
                k.material.zeroize();
            }
        }
        inner.finalized = true;
    }

    fn ensure_active_key(&self, inner: &mut Inner, domain: u32) -> Result<(), KeyStoreError> {
        let has_active = inner
            .file
            .domains
            .get(&domain)
            .map(|keys| keys.iter().any(|k| k.status == KeyStatus::Active))
            .unwrap_or(false);
        if has_active {
            return Ok(());
        }
        self.rotate(inner, domain)
    }

    /// Generate a fresh active key for `domain`, demoting any current
    /// active key, and persist both stores.
    fn rotate(&self, inner: &mut Inner, domain: u32) -> Result<(), KeyStoreError> {
        let next_id = inner
            .file
            .domains
            .get(&domain)
            .and_then(|keys| keys.iter().map(|k| k.id).max())
            .map(|id| id + 1)
            .unwrap_or(1);

        let mut material = vec![0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut material);
        xor_in_place(&mut material, &inner.mask);

        let keys = inner.file.domains.entry(domain).or_default();
        for k in keys.iter_mut() {
            if k.status == KeyStatus::Active {
                k.status = KeyStatus::Inactive;
            }
        }
        keys.push(WorkingKey {
            id: next_id,
            material,
            created_at: Utc::now(),
            status: KeyStatus::Active,
        });

        self.persist_locked(inner)
    }

    /// Rewrite both store files with unmasked key material.
    fn persist_locked(&self, inner: &Inner) -> Result<(), KeyStoreError> {
        let mut plain = StoreFile {
            version: 1,
            domains: Default::default(),
        };
        for (domain, keys) in &inner.file.domains {
            let out = keys
                .iter()
                .map(|k| {
                    let mut material = k.material.clone();
                    xor_in_place(&mut material, &inner.mask);
                    WorkingKey {
                        id: k.id,
                        material,
                        created_at: k.created_at,
                        status: k.status,
                    }
                })
                .collect();
            plain.domains.insert(*domain, out);
        }
        let json = serde_json::to_vec(&plain)
            .map_err(|e| KeyStoreError::Internal(format!("serialize store: {e}")))?;
        for path in [&self.primary, &self.standby] {
            write_store_file(path, &json)
                .map_err(|e| KeyStoreError::Internal(format!("write store: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for KeyStore {
    fn drop(&mut self) {
        self.finalize();
    }
}

fn check_live(inner: &Inner) -> Result<(), KeyStoreError> {
    if inner.finalized {
        return Err(KeyStoreError::NotInit);
    }
    Ok(())
}

/// Regenerate the in-memory mask, re-masking all resident material.
fn refresh_mask(inner: &mut Inner) {
    let mut next = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut next);
    let old = inner.mask;
    for keys in inner.file.domains.values_mut() {
        for k in keys.iter_mut() {
            xor_in_place(&mut k.material, &old);
            xor_in_place(&mut k.material, &next);
        }
    }
    inner.mask = next;
}

fn apply_mask(inner: &mut Inner) {
    let mask = inner.mask;
    for keys in inner.file.domains.values_mut() {
        for k in keys.iter_mut() {
            xor_in_place(&mut k.material, &mask);
        }
    }
}

fn unmasked_active(inner: &Inner, domain: u32) -> Result<(u32, Vec<u8>), KeyStoreError> {
    let keys = inner
        .file
        .domains
        .get(&domain)
        .ok_or(KeyStoreError::InvalidDomain { domain })?;
    let active = keys
        .iter()
        .find(|k| k.status == KeyStatus::Active)
        .ok_or(KeyStoreError::InvalidDomain { domain })?;
    let mut material = active.material.clone();
    xor_in_place(&mut material, &inner.mask);
    Ok((active.id, material))
}

fn unmasked_by_id(inner: &Inner, domain: u32, id: u32) -> Result<Vec<u8>, KeyStoreError> {
    let keys = inner
        .file
        .domains
        .get(&domain)
        .ok_or(KeyStoreError::InvalidDomain { domain })?;
    let key = keys
        .iter()
        .find(|k| k.id == id)
        .ok_or_else(|| KeyStoreError::Internal(format!("no working key with id {id}")))?;
    let mut material = key.material.clone();
    xor_in_place(&mut material, &inner.mask);
    Ok(material)
}

fn drop_key(mut key: Vec<u8>) {
    key.zeroize();
}

fn xor_in_place(buf: &mut [u8], mask: &[u8; KEY_LEN]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= mask[i % KEY_LEN];
    }
}

/// Prefer whichever store file parses; primary wins a tie.
fn load_newer(primary: &Path, standby: &Path) -> Result<StoreFile, KeyStoreError> {
    for path in [primary, standby] {
        if let Ok(bytes) = fs::read(path) {
            match serde_json::from_slice::<StoreFile>(&bytes) {
                Ok(file) => return Ok(file),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "key store file unreadable");
                }
            }
        }
    }
    Ok(StoreFile::default())
}

fn write_store_file(path: &Path, json: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let tmp = path.with_extension("ks.tmp");
    {
        let mut f = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(STORE_MODE)
            .open(&tmp)?;
        f.write_all(json)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)
}
