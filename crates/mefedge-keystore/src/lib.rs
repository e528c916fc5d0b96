//! Domain-keyed encrypt/decrypt service.
//!
//! Byte buffers are sealed under a numeric domain id with AES-256-GCM
//! working keys. The working keys live in two on-disk key stores
//! (primary + standby) that are never exposed to callers; in memory
//! they are held behind a rotating XOR mask and zeroized on drop.

mod error;
mod store;

pub use error::KeyStoreError;
pub use store::{KeyStore, DEFAULT_KEY_LIFETIME_DAYS};
