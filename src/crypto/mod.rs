use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use zeroize::Zeroizing;

pub mod cipher;

pub use cipher::TokenCipher;

pub const KDF_ALG_PBKDF2_SHA256: &str = "pbkdf2-sha256";
pub const AEAD_ALG_CHACHA20POLY1305: &str = "chacha20poly1305";
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;
pub const MIN_KDF_ITERATIONS: u32 = 1_000;

const SECRET_PREFIX: &str = "devsecret:";
const KEY_CHECK_LABEL: &[u8] = b"token-guard key check v1";

/// Random per-install secret standing in for a hardware keystore.
///
/// Stored hex-encoded in a 0600 file; only ever used as key-derivation input.
pub struct DeviceSecret {
    bytes: Zeroizing<[u8; 32]>,
}

impl DeviceSecret {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(&mut *bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..]
    }

    /// Read the secret at `path`, creating it on first use. Two processes
    /// racing on an empty path both end up with whichever file won.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(existing) = Self::read(path)? {
            return Ok(existing);
        }
        let fresh = Self::generate();
        if fresh.write_new(path)? {
            log::info!("created device secret at {}", path.display());
            return Ok(fresh);
        }
        Self::read(path)?
            .ok_or_else(|| anyhow!("device secret {} vanished during creation", path.display()))
    }

    fn read(path: &Path) -> Result<Option<Self>> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => Zeroizing::new(contents),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(anyhow!(
                    "failed to read device secret {}: {}",
                    path.display(),
                    err
                ))
            }
        };
        let encoded = contents
            .trim()
            .strip_prefix(SECRET_PREFIX)
            .ok_or_else(|| anyhow!("device secret {} is malformed", path.display()))?;
        let decoded = Zeroizing::new(
            hex::decode(encoded)
                .map_err(|_| anyhow!("device secret {} is malformed", path.display()))?,
        );
        if decoded.len() != 32 {
            return Err(anyhow!(
                "device secret {} must hold 32 bytes (got {})",
                path.display(),
                decoded.len()
            ));
        }
        let mut bytes = Zeroizing::new([0u8; 32]);
        bytes.copy_from_slice(&decoded);
        Ok(Some(Self { bytes }))
    }

    /// Returns false when another writer created the file first.
    fn write_new(&self, path: &Path) -> Result<bool> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| anyhow!("failed to create {}: {}", parent.display(), e))?;
        }

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = match options.open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => {
                return Err(anyhow!(
                    "failed to create device secret {}: {}",
                    path.display(),
                    err
                ))
            }
        };

        let line = Zeroizing::new(format!("{}{}\n", SECRET_PREFIX, hex::encode(&self.bytes[..])));
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| anyhow!("failed to write device secret {}: {}", path.display(), e))?;
        Ok(true)
    }
}

impl std::fmt::Debug for DeviceSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeviceSecret(<redacted>)")
    }
}

/// Stable, hashed composite of device attributes used as KDF password.
pub struct DeviceFingerprint {
    digest: Zeroizing<[u8; 32]>,
}

impl DeviceFingerprint {
    pub fn new(device_secret: &[u8], device_id: &str) -> Result<Self> {
        if device_secret.is_empty() {
            return Err(anyhow!("device secret cannot be empty"));
        }
        if device_id.trim().is_empty() {
            return Err(anyhow!("device id cannot be empty"));
        }
        let mut hasher = Sha256::new();
        for part in [
            device_secret,
            device_id.trim().as_bytes(),
            std::env::consts::OS.as_bytes(),
            std::env::consts::ARCH.as_bytes(),
        ] {
            hasher.update((part.len() as u32).to_le_bytes());
            hasher.update(part);
        }
        Ok(Self {
            digest: Zeroizing::new(hasher.finalize().into()),
        })
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.digest
    }
}

impl std::fmt::Debug for DeviceFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DeviceFingerprint(<redacted>)")
    }
}

/// Everything needed to re-derive and verify the token key. Never the key
/// itself.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyMetadata {
    pub salt: [u8; 32],
    pub kdf_algorithm: String,
    pub aead_algorithm: String,
    pub iterations: u32,
    pub created_at_ms: u64,
    /// Domain-separated digest of the derived key.
    pub key_check: [u8; 32],
}

impl KeyMetadata {
    /// Fresh salt and parameters, bound to the key `fingerprint` derives.
    pub fn generate(
        fingerprint: &DeviceFingerprint,
        iterations: u32,
        created_at_ms: u64,
    ) -> Result<Self> {
        if iterations < MIN_KDF_ITERATIONS {
            return Err(anyhow!(
                "kdf iterations must be >= {} (got {})",
                MIN_KDF_ITERATIONS,
                iterations
            ));
        }
        let mut salt = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let mut metadata = Self {
            salt,
            kdf_algorithm: KDF_ALG_PBKDF2_SHA256.to_string(),
            aead_algorithm: AEAD_ALG_CHACHA20POLY1305.to_string(),
            iterations,
            created_at_ms,
            key_check: [0u8; 32],
        };
        let key = derive_key(fingerprint, &metadata)?;
        metadata.key_check = key_check(&key);
        Ok(metadata)
    }

    pub fn ensure_supported(&self) -> Result<()> {
        if self.kdf_algorithm != KDF_ALG_PBKDF2_SHA256 {
            return Err(anyhow!(
                "unsupported key derivation algorithm: {}",
                self.kdf_algorithm
            ));
        }
        if self.aead_algorithm != AEAD_ALG_CHACHA20POLY1305 {
            return Err(anyhow!(
                "unsupported token cipher algorithm: {}",
                self.aead_algorithm
            ));
        }
        if self.iterations < MIN_KDF_ITERATIONS {
            return Err(anyhow!("corrupt key metadata: iteration count too low"));
        }
        Ok(())
    }

    /// Derive the key and confirm it is the one this metadata was created
    /// with. A different device secret or device id fails here.
    pub fn unlock(&self, fingerprint: &DeviceFingerprint) -> Result<Zeroizing<[u8; 32]>> {
        let key = derive_key(fingerprint, self)?;
        if key_check(&key) != self.key_check {
            return Err(anyhow!(
                "token key check failed: the credential store belongs to another device"
            ));
        }
        Ok(key)
    }
}

/// PBKDF2-HMAC-SHA256 over the device fingerprint with the persisted salt.
pub fn derive_key(
    fingerprint: &DeviceFingerprint,
    metadata: &KeyMetadata,
) -> Result<Zeroizing<[u8; 32]>> {
    metadata.ensure_supported()?;
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(
        fingerprint.as_bytes(),
        &metadata.salt,
        metadata.iterations,
        &mut *key,
    );
    Ok(key)
}

fn key_check(key: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KEY_CHECK_LABEL);
    hasher.update(key);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(device_id: &str) -> DeviceFingerprint {
        DeviceFingerprint::new(b"devsecret:abc", device_id).unwrap()
    }

    #[test]
    fn device_secret_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("guard.device.secret");
        let first = DeviceSecret::load_or_create(&path).unwrap();
        let second = DeviceSecret::load_or_create(&path).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());

        let stored = fs::read_to_string(&path).unwrap();
        assert!(stored.starts_with(SECRET_PREFIX));
        assert_eq!(stored.trim().len(), SECRET_PREFIX.len() + 64);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn malformed_secret_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.secret");
        for contents in ["\n", "devsecret:zz\n", "devsecret:abcd\n", "0123456789abcdef"] {
            fs::write(&path, contents).unwrap();
            assert!(DeviceSecret::load_or_create(&path).is_err(), "{:?}", contents);
        }
    }

    #[test]
    fn derivation_is_deterministic_per_device() {
        let meta = KeyMetadata::generate(&fingerprint("phone-1"), MIN_KDF_ITERATIONS, 0).unwrap();
        let k1 = derive_key(&fingerprint("phone-1"), &meta).unwrap();
        let k2 = derive_key(&fingerprint("phone-1"), &meta).unwrap();
        let k3 = derive_key(&fingerprint("phone-2"), &meta).unwrap();
        assert_eq!(*k1, *k2);
        assert_ne!(*k1, *k3);
    }

    #[test]
    fn fresh_salt_changes_key() {
        let fp = fingerprint("phone-1");
        let a = KeyMetadata::generate(&fp, MIN_KDF_ITERATIONS, 0).unwrap();
        let b = KeyMetadata::generate(&fp, MIN_KDF_ITERATIONS, 0).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.key_check, b.key_check);
        assert_ne!(*derive_key(&fp, &a).unwrap(), *derive_key(&fp, &b).unwrap());
    }

    #[test]
    fn unlock_requires_the_creating_device() {
        let meta = KeyMetadata::generate(&fingerprint("phone-1"), MIN_KDF_ITERATIONS, 0).unwrap();
        let key = meta.unlock(&fingerprint("phone-1")).unwrap();
        assert_eq!(*key, *derive_key(&fingerprint("phone-1"), &meta).unwrap());
        assert!(meta.unlock(&fingerprint("phone-2")).is_err());

        let other_secret = DeviceFingerprint::new(b"devsecret:xyz", "phone-1").unwrap();
        assert!(meta.unlock(&other_secret).is_err());

        let mut tampered = meta.clone();
        tampered.key_check[0] ^= 0xff;
        assert!(tampered.unlock(&fingerprint("phone-1")).is_err());
    }

    #[test]
    fn weak_or_unknown_metadata_rejected() {
        let fp = fingerprint("phone-1");
        assert!(KeyMetadata::generate(&fp, 10, 0).is_err());
        let mut meta = KeyMetadata::generate(&fp, MIN_KDF_ITERATIONS, 0).unwrap();
        meta.kdf_algorithm = "md5".to_string();
        assert!(derive_key(&fp, &meta).is_err());
        assert!(meta.unlock(&fp).is_err());
    }
}
