use anyhow::{anyhow, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::{DeviceFingerprint, KeyMetadata};
use crate::storage::CredentialStore;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Device-bound authenticated cipher for token values.
///
/// Output layout: `nonce (12) || ciphertext || tag (16)`.
pub struct TokenCipher {
    key: Zeroizing<[u8; 32]>,
    metadata: KeyMetadata,
}

impl TokenCipher {
    /// Re-derive the key from stored metadata, or create and persist fresh
    /// metadata on first use. Errors when the stored key check does not match
    /// this device.
    pub fn load_or_init(
        store: &mut dyn CredentialStore,
        fingerprint: &DeviceFingerprint,
        iterations: u32,
        now_ms: u64,
    ) -> Result<Self> {
        let metadata = match store.load_key_metadata()? {
            Some(existing) => existing,
            None => {
                let fresh = KeyMetadata::generate(fingerprint, iterations, now_ms)?;
                store.save_key_metadata(&fresh)?;
                log::info!(
                    "initialized token key metadata ({} iterations)",
                    fresh.iterations
                );
                fresh
            }
        };
        Self::from_metadata(fingerprint, metadata)
    }

    pub fn from_metadata(fingerprint: &DeviceFingerprint, metadata: KeyMetadata) -> Result<Self> {
        let key = metadata.unlock(fingerprint)?;
        Ok(Self { key, metadata })
    }

    pub fn metadata(&self) -> &KeyMetadata {
        &self.metadata
    }

    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key[..]));
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| anyhow!("token encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, sealed: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(anyhow!("token ciphertext truncated"));
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key[..]));
        let clear = cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: body, aad })
            .map_err(|_| anyhow!("token decryption failed"))?;
        Ok(Zeroizing::new(clear))
    }

    pub fn encrypt_str(&self, plaintext: &str, aad: &[u8]) -> Result<Vec<u8>> {
        self.encrypt(plaintext.as_bytes(), aad)
    }

    pub fn decrypt_str(&self, sealed: &[u8], aad: &[u8]) -> Result<String> {
        let clear = self.decrypt(sealed, aad)?;
        let text = std::str::from_utf8(&clear)
            .map_err(|_| anyhow!("decrypted token is not valid utf-8"))?;
        Ok(text.to_string())
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MIN_KDF_ITERATIONS;
    use crate::storage::InMemoryCredentialStore;

    fn cipher() -> TokenCipher {
        let fp = DeviceFingerprint::new(b"devsecret:test", "device-1").unwrap();
        let meta = KeyMetadata::generate(&fp, MIN_KDF_ITERATIONS, 0).unwrap();
        TokenCipher::from_metadata(&fp, meta).unwrap()
    }

    #[test]
    fn round_trip_various_inputs() {
        let cipher = cipher();
        for input in ["", "a", "eyJhbGciOiJIUzI1NiJ9.payload.sig", "emoji ✨ and ünïcode"] {
            let sealed = cipher.encrypt_str(input, b"tok_1").unwrap();
            assert_eq!(cipher.decrypt_str(&sealed, b"tok_1").unwrap(), input);
        }
    }

    #[test]
    fn nonce_is_prepended_and_fresh() {
        let cipher = cipher();
        let a = cipher.encrypt_str("same", b"aad").unwrap();
        let b = cipher.encrypt_str("same", b"aad").unwrap();
        assert_eq!(a.len(), NONCE_LEN + 4 + TAG_LEN);
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn tampering_and_wrong_aad_fail() {
        let cipher = cipher();
        let mut sealed = cipher.encrypt_str("secret", b"tok_1").unwrap();
        assert!(cipher.decrypt_str(&sealed, b"tok_2").is_err());
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.decrypt_str(&sealed, b"tok_1").is_err());
        assert!(cipher.decrypt(&[0u8; 8], b"tok_1").is_err());
    }

    #[test]
    fn load_or_init_persists_metadata_not_key() {
        let mut store = InMemoryCredentialStore::default();
        let fp = DeviceFingerprint::new(b"devsecret:test", "device-1").unwrap();
        let first = TokenCipher::load_or_init(&mut store, &fp, MIN_KDF_ITERATIONS, 42).unwrap();
        let sealed = first.encrypt_str("value", b"id").unwrap();

        let stored = store.load_key_metadata().unwrap().expect("metadata stored");
        assert_eq!(&stored, first.metadata());
        assert_eq!(stored.created_at_ms, 42);

        let second = TokenCipher::load_or_init(&mut store, &fp, 50_000, 99).unwrap();
        assert_eq!(second.metadata().iterations, MIN_KDF_ITERATIONS);
        assert_eq!(second.decrypt_str(&sealed, b"id").unwrap(), "value");
    }

    #[test]
    fn other_device_is_refused_before_any_use() {
        let mut store = InMemoryCredentialStore::default();
        let fp = DeviceFingerprint::new(b"devsecret:test", "device-1").unwrap();
        TokenCipher::load_or_init(&mut store, &fp, MIN_KDF_ITERATIONS, 0).unwrap();
        let stored = store.load_key_metadata().unwrap();

        let other_fp = DeviceFingerprint::new(b"devsecret:other", "device-1").unwrap();
        let err = TokenCipher::load_or_init(&mut store, &other_fp, MIN_KDF_ITERATIONS, 0)
            .unwrap_err();
        assert!(err.to_string().contains("key check failed"));
        assert_eq!(store.load_key_metadata().unwrap(), stored);
    }
}
