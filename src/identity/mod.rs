//! Process-wide device identity (spec §3 "DeviceIdentity").
//!
//! A long-lived Ed25519 keypair whose `publicId` is the hex-encoded
//! SHA-256 of the public key. Generated once per install and persisted;
//! every later process load reuses the same identity so peers can
//! recognize this device across restarts.

use std::path::{Path, PathBuf};

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::sha256_hex;
use crate::error::{Error, Result};

/// Number of leading hex characters of a `publicId` used as a short form
/// where transport payload size forbids the full 64-character value
/// (spec §3, §GLOSSARY "Prefix id").
pub const PREFIX_LEN: usize = 8;

/// Long-lived keypair plus its derived `publicId`.
#[derive(Clone)]
pub struct DeviceIdentity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    public_id: String,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("public_id", &self.public_id)
            .finish()
    }
}

impl DeviceIdentity {
    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        let public_id = sha256_hex(verifying_key.as_bytes());
        Self {
            signing_key,
            verifying_key,
            public_id,
        }
    }

    /// Full 64-character hex `publicId`.
    pub fn public_id(&self) -> &str {
        &self.public_id
    }

    /// First [`PREFIX_LEN`] hex characters of the `publicId`.
    pub fn public_id_prefix(&self) -> &str {
        &self.public_id[..PREFIX_LEN]
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn sign(&self, message: &[u8]) -> ed25519_dalek::Signature {
        use ed25519_dalek::Signer;
        self.signing_key.sign(message)
    }
}

/// Where a [`DeviceIdentity`]'s private key material is persisted. The
/// core only needs "create once, reuse forever" semantics; the embedding
/// application may supply a platform keystore instead of the default
/// file-backed one.
pub trait IdentityStore: Send + Sync {
    fn load(&self) -> Result<Option<[u8; 32]>>;
    fn save(&self, secret: &[u8; 32]) -> Result<()>;
}

/// Default identity store: a single file containing the 32-byte Ed25519
/// seed, created with owner-only permissions on unix.
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<[u8; 32]>> {
        if !Path::new(&self.path).exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.path)?;
        if bytes.len() != 32 {
            return Err(Error::CryptoFailure(
                "identity file has unexpected length".into(),
            ));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes);
        Ok(Some(seed))
    }

    fn save(&self, secret: &[u8; 32]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, secret)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&self.path, perms)?;
        }
        Ok(())
    }
}

/// Create or load the process identity from `store` (spec §4.1
/// `identity_init`).
pub fn identity_init(store: &dyn IdentityStore) -> Result<DeviceIdentity> {
    let seed = match store.load()? {
        Some(seed) => seed,
        None => {
            let mut seed = Zeroizing::new([0u8; 32]);
            OsRng.fill_bytes(&mut *seed);
            store.save(&seed)?;
            *seed
        }
    };
    let signing_key = SigningKey::from_bytes(&seed);
    Ok(DeviceIdentity::from_signing_key(signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemoryStore {
        cell: std::sync::Mutex<Option<[u8; 32]>>,
    }

    impl IdentityStore for MemoryStore {
        fn load(&self) -> Result<Option<[u8; 32]>> {
            Ok(*self.cell.lock().unwrap())
        }
        fn save(&self, secret: &[u8; 32]) -> Result<()> {
            *self.cell.lock().unwrap() = Some(*secret);
            Ok(())
        }
    }

    #[test]
    fn identity_is_stable_across_reload() {
        let store = MemoryStore {
            cell: std::sync::Mutex::new(None),
        };
        let first = identity_init(&store).unwrap();
        let second = identity_init(&store).unwrap();
        assert_eq!(first.public_id(), second.public_id());
    }

    #[test]
    fn public_id_is_64_hex_chars() {
        let store = MemoryStore {
            cell: std::sync::Mutex::new(None),
        };
        let identity = identity_init(&store).unwrap();
        assert_eq!(identity.public_id().len(), 64);
        assert!(identity.public_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn prefix_is_first_eight_chars() {
        let store = MemoryStore {
            cell: std::sync::Mutex::new(None),
        };
        let identity = identity_init(&store).unwrap();
        assert_eq!(identity.public_id_prefix(), &identity.public_id()[..8]);
    }

    #[test]
    fn file_store_round_trips_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        let store = FileIdentityStore::new(&path);
        let a = identity_init(&store).unwrap();
        let b = identity_init(&store).unwrap();
        assert_eq!(a.public_id(), b.public_id());
    }
}
