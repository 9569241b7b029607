//! Network-wide registry of known identities.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::info;

use super::{verify, Identity, IdentityError, IdentityResult, Signer};

/// Registry peers consult before trusting an identity.
#[async_trait]
pub trait IdentityRegistry: Send + Sync {
    /// Register `identity`, proving ownership with `signer`.
    async fn register_identity(&self, identity: &Identity, signer: &dyn Signer)
        -> IdentityResult<()>;

    async fn is_registered(&self, identity: &Identity) -> bool;
}

/// Message signed to prove ownership of an identity at registration.
pub fn registration_message(identity: &Identity) -> Vec<u8> {
    format!("register:{}", identity.address).into_bytes()
}

/// Process-local identity registry.
#[derive(Debug, Default)]
pub struct MemoryIdentityRegistry {
    registered: Mutex<HashSet<Identity>>,
}

impl MemoryIdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityRegistry for MemoryIdentityRegistry {
    async fn register_identity(
        &self,
        identity: &Identity,
        signer: &dyn Signer,
    ) -> IdentityResult<()> {
        let message = registration_message(identity);
        let proof = signer
            .sign(&message)
            .map_err(|e| IdentityError::RegistrationFailed(e.to_string()))?;
        verify(identity, &message, &proof)
            .map_err(|e| IdentityError::RegistrationFailed(e.to_string()))?;

        self.registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(identity.clone());
        info!(identity = %identity, "Identity registered");
        Ok(())
    }

    async fn is_registered(&self, identity: &Identity) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityManager, Keystore};

    #[tokio::test]
    async fn registers_owned_identity() {
        let keystore = Keystore::new();
        let identity = keystore.create_new_identity("pass").unwrap();
        keystore.unlock(&identity.address, "pass").unwrap();
        let signer = keystore.signer(&identity).unwrap();

        let registry = MemoryIdentityRegistry::new();
        assert!(!registry.is_registered(&identity).await);
        registry
            .register_identity(&identity, signer.as_ref())
            .await
            .unwrap();
        assert!(registry.is_registered(&identity).await);
    }

    #[tokio::test]
    async fn rejects_foreign_signer() {
        let keystore = Keystore::new();
        let owner = keystore.create_new_identity("pass").unwrap();
        let other = keystore.create_new_identity("pass").unwrap();
        keystore.unlock(&other.address, "pass").unwrap();
        let foreign = keystore.signer(&other).unwrap();

        let registry = MemoryIdentityRegistry::new();
        let err = registry
            .register_identity(&owner, foreign.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::RegistrationFailed(_)));
        assert!(!registry.is_registered(&owner).await);
    }
}
