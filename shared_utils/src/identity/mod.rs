//! Cryptographic identities of network participants.
//!
//! An [`Identity`] is an address derived from an ed25519 verifying key, so a
//! signature can be checked against a claimed identity without a key lookup.
//! Private keys live in the [`keystore`]; everything else only ever holds an
//! `Identity` value and, where it needs to sign, an `Arc<dyn Signer>`.

mod cache;
mod keystore;
mod registry;
mod selector;

use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use cache::{FileIdentityCache, IdentityCache};
pub use keystore::{IdentityManager, Keystore};
pub use registry::{IdentityRegistry, MemoryIdentityRegistry};
pub use selector::{IdentityChoice, IdentitySelector};

const ADDRESS_PREFIX: &str = "0x";

/// Result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;

/// Errors raised by the identity subsystem.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Address is not present in the keystore
    #[error("Identity not found: {0}")]
    NotFound(String),

    /// Wrong passphrase or keystore failure
    #[error("Failed to unlock identity {0}")]
    UnlockFailed(String),

    /// No identity was remembered from a previous run
    #[error("No cached identity")]
    NoCachedIdentity,

    /// Identity registry refused or failed the registration
    #[error("Identity registration failed: {0}")]
    RegistrationFailed(String),

    /// Signing was requested for an identity that is still locked
    #[error("Identity is locked: {0}")]
    Locked(String),

    /// Address does not encode a verifying key
    #[error("Invalid identity address: {0}")]
    InvalidAddress(String),

    /// Signature does not match the message and identity
    #[error("Invalid signature")]
    InvalidSignature,

    /// Identity cache could not be read or written
    #[error("Identity cache error: {0}")]
    Cache(String),
}

/// Address of a network participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub address: String,
}

impl Identity {
    /// Wrap an address without validating it.
    pub fn from_address(address: impl Into<String>) -> Self {
        Identity {
            address: address.into(),
        }
    }

    /// Derive the identity owning `key`.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Identity {
            address: format!("{}{}", ADDRESS_PREFIX, hex::encode(key.to_bytes())),
        }
    }

    /// Recover the verifying key encoded in the address.
    pub fn verifying_key(&self) -> IdentityResult<VerifyingKey> {
        let encoded = self
            .address
            .strip_prefix(ADDRESS_PREFIX)
            .ok_or_else(|| IdentityError::InvalidAddress(self.address.clone()))?;
        let bytes = hex::decode(encoded)
            .map_err(|_| IdentityError::InvalidAddress(self.address.clone()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidAddress(self.address.clone()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|_| IdentityError::InvalidAddress(self.address.clone()))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Detached ed25519 signature bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

/// Signing capability bound to one identity.
pub trait Signer: Send + Sync {
    /// Identity this signer signs for.
    fn identity(&self) -> &Identity;

    /// Sign `message`; fails while the identity is locked.
    fn sign(&self, message: &[u8]) -> IdentityResult<Signature>;
}

/// Check that `signature` over `message` was produced by `identity`.
pub fn verify(identity: &Identity, message: &[u8], signature: &Signature) -> IdentityResult<()> {
    let key = identity.verifying_key()?;
    let signature =
        DalekSignature::from_slice(&signature.0).map_err(|_| IdentityError::InvalidSignature)?;
    key.verify(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}
