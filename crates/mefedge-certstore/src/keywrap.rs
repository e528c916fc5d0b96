//! Service private keys never touch disk in the clear. On disk they
//! are legacy-encrypted PEM: the key's own tag plus `Proc-Type` and
//! `DEK-Info` headers, with the body holding the working-key-store
//! ciphertext of the DER key. Callers keep handling opaque text files.

use mefedge_keystore::KeyStore;
use pem::Pem;

use crate::error::CertStoreError;

const PROC_TYPE: &str = "Proc-Type";
const PROC_TYPE_ENCRYPTED: &str = "4,ENCRYPTED";
const DEK_INFO: &str = "DEK-Info";
// The working-key store seals with AES-256-GCM and embeds its own
// key id and nonce in the body, so the header carries no IV.
const DEK_INFO_VALUE: &str = "AES-256-GCM,KMC";
const DEFAULT_TAG: &str = "PRIVATE KEY";

/// Encrypt a plaintext private key (PEM, or raw DER) under the given
/// key domain.
pub fn wrap_service_key(
    store: &KeyStore,
    domain: u32,
    key: &[u8],
) -> Result<Vec<u8>, CertStoreError> {
    let (tag, der) = match pem::parse(key) {
        Ok(block) => (block.tag().to_string(), block.contents().to_vec()),
        Err(_) => (DEFAULT_TAG.to_string(), key.to_vec()),
    };
    let cipher = store.encrypt(domain, &der)?;

    let mut block = Pem::new(tag, cipher);
    for (k, v) in [(PROC_TYPE, PROC_TYPE_ENCRYPTED), (DEK_INFO, DEK_INFO_VALUE)] {
        block
            .headers_mut()
            .add(k, v)
            .map_err(|e| CertStoreError::Parse(format!("wrapped key headers: {e}")))?;
    }
    Ok(pem::encode(&block).into_bytes())
}

/// Recover the plaintext private-key PEM from a wrapped block.
pub fn unwrap_service_key(
    store: &KeyStore,
    domain: u32,
    wrapped: &[u8],
) -> Result<Vec<u8>, CertStoreError> {
    let block =
        pem::parse(wrapped).map_err(|e| CertStoreError::Parse(format!("wrapped key pem: {e}")))?;
    if block.headers().get(PROC_TYPE) != Some(PROC_TYPE_ENCRYPTED) {
        return Err(CertStoreError::Parse(
            "service key file is not encrypted".into(),
        ));
    }
    let der = store.decrypt(domain, block.contents())?;
    let plain = Pem::new(block.tag().to_string(), der);
    Ok(pem::encode(&plain).into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempdir().unwrap();
        let ks = KeyStore::init(&dir.path().join("primary.ks"), &dir.path().join("standby.ks"))
            .unwrap();
        (dir, ks)
    }

    #[test]
    fn wrap_then_unwrap_restores_key() {
        let (_dir, ks) = store();
        let key = rcgen::KeyPair::generate().unwrap();
        let key_pem = key.serialize_pem();

        let wrapped = wrap_service_key(&ks, 2, key_pem.as_bytes()).unwrap();
        let plain = unwrap_service_key(&ks, 2, &wrapped).unwrap();

        // Same tag, same DER, and rcgen can load the result.
        let restored = pem::parse(&plain).unwrap();
        let original = pem::parse(key_pem.as_bytes()).unwrap();
        assert_eq!(restored.tag(), original.tag());
        assert_eq!(restored.contents(), original.contents());
        rcgen::KeyPair::from_pem(std::str::from_utf8(&plain).unwrap()).unwrap();
    }

    #[test]
    fn wrapped_form_carries_encryption_headers() {
        let (_dir, ks) = store();
        let key = rcgen::KeyPair::generate().unwrap();
        let wrapped = wrap_service_key(&ks, 2, key.serialize_pem().as_bytes()).unwrap();

        let text = String::from_utf8(wrapped.clone()).unwrap();
        assert!(text.contains("Proc-Type: 4,ENCRYPTED"));
        assert!(text.contains("DEK-Info:"));

        // The body is ciphertext of the DER key, not of the PEM text.
        let block = pem::parse(&wrapped).unwrap();
        let der = ks.decrypt(2, block.contents()).unwrap();
        assert_eq!(der, key.serialize_der());
    }

    #[test]
    fn wrong_domain_fails() {
        let (_dir, ks) = store();
        let wrapped = wrap_service_key(&ks, 2, b"secret").unwrap();
        assert!(unwrap_service_key(&ks, 3, &wrapped).is_err());
    }

    #[test]
    fn unwrapping_plaintext_is_rejected() {
        let (_dir, ks) = store();
        assert!(matches!(
            unwrap_service_key(&ks, 2, b"garbage"),
            Err(CertStoreError::Parse(_))
        ));
        // A well-formed but unencrypted key must also be refused.
        let key = rcgen::KeyPair::generate().unwrap();
        assert!(matches!(
            unwrap_service_key(&ks, 2, key.serialize_pem().as_bytes()),
            Err(CertStoreError::Parse(_))
        ));
    }
}
