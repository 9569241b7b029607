//! In-memory keystore holding signing keys behind passphrases.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use ed25519_dalek::{Signer as _, SigningKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{Identity, IdentityError, IdentityResult, Signature, Signer};

/// Access to locally held identities.
pub trait IdentityManager: Send + Sync {
    /// Generate a new key pair protected by `passphrase`. The identity starts locked.
    fn create_new_identity(&self, passphrase: &str) -> IdentityResult<Identity>;

    /// All identities held locally.
    fn get_identities(&self) -> Vec<Identity>;

    /// Look up a held identity by address.
    fn get_identity(&self, address: &str) -> IdentityResult<Identity>;

    fn has_identity(&self, address: &str) -> bool;

    /// Unlock the identity so its signer can sign.
    fn unlock(&self, address: &str, passphrase: &str) -> IdentityResult<()>;

    /// Signer for `identity`; signing fails while the identity is locked.
    fn signer(&self, identity: &Identity) -> IdentityResult<Arc<dyn Signer>>;
}

struct KeyEntry {
    signing_key: SigningKey,
    passphrase_digest: [u8; 32],
    unlocked: bool,
}

type Entries = Arc<Mutex<HashMap<String, KeyEntry>>>;

fn lock(entries: &Entries) -> MutexGuard<'_, HashMap<String, KeyEntry>> {
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn digest(passphrase: &str) -> [u8; 32] {
    Sha256::digest(passphrase.as_bytes()).into()
}

/// Keystore keeping key pairs in process memory.
///
/// Passphrases are stored as SHA-256 digests only.
#[derive(Clone, Default)]
pub struct Keystore {
    entries: Entries,
}

impl Keystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an existing key pair, locked behind `passphrase`.
    pub fn import(&self, signing_key: SigningKey, passphrase: &str) -> Identity {
        let identity = Identity::from_verifying_key(&signing_key.verifying_key());
        lock(&self.entries).insert(
            identity.address.clone(),
            KeyEntry {
                signing_key,
                passphrase_digest: digest(passphrase),
                unlocked: false,
            },
        );
        identity
    }

    /// Relock every identity.
    pub fn lock_all(&self) {
        for entry in lock(&self.entries).values_mut() {
            entry.unlocked = false;
        }
    }
}

impl IdentityManager for Keystore {
    fn create_new_identity(&self, passphrase: &str) -> IdentityResult<Identity> {
        let identity = self.import(SigningKey::generate(&mut OsRng), passphrase);
        info!(identity = %identity, "Created new identity");
        Ok(identity)
    }

    fn get_identities(&self) -> Vec<Identity> {
        let mut identities: Vec<_> = lock(&self.entries)
            .keys()
            .map(|address| Identity::from_address(address.clone()))
            .collect();
        identities.sort();
        identities
    }

    fn get_identity(&self, address: &str) -> IdentityResult<Identity> {
        if self.has_identity(address) {
            Ok(Identity::from_address(address))
        } else {
            Err(IdentityError::NotFound(address.to_string()))
        }
    }

    fn has_identity(&self, address: &str) -> bool {
        lock(&self.entries).contains_key(address)
    }

    fn unlock(&self, address: &str, passphrase: &str) -> IdentityResult<()> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .get_mut(address)
            .ok_or_else(|| IdentityError::UnlockFailed(address.to_string()))?;

        if entry.passphrase_digest != digest(passphrase) {
            warn!(identity = %address, "Unlock rejected: wrong passphrase");
            return Err(IdentityError::UnlockFailed(address.to_string()));
        }

        entry.unlocked = true;
        debug!(identity = %address, "Identity unlocked");
        Ok(())
    }

    fn signer(&self, identity: &Identity) -> IdentityResult<Arc<dyn Signer>> {
        if !self.has_identity(&identity.address) {
            return Err(IdentityError::NotFound(identity.address.clone()));
        }
        Ok(Arc::new(KeystoreSigner {
            identity: identity.clone(),
            entries: Arc::clone(&self.entries),
        }))
    }
}

struct KeystoreSigner {
    identity: Identity,
    entries: Entries,
}

impl Signer for KeystoreSigner {
    fn identity(&self) -> &Identity {
        &self.identity
    }

    fn sign(&self, message: &[u8]) -> IdentityResult<Signature> {
        let entries = lock(&self.entries);
        let entry = entries
            .get(&self.identity.address)
            .ok_or_else(|| IdentityError::NotFound(self.identity.address.clone()))?;
        if !entry.unlocked {
            return Err(IdentityError::Locked(self.identity.address.clone()));
        }
        Ok(Signature(entry.signing_key.sign(message).to_bytes().to_vec()))
    }
}
