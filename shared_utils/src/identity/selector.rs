//! Chooses which identity the node runs as.

use std::sync::Arc;
use tracing::{info, warn};

use super::{Identity, IdentityCache, IdentityError, IdentityManager, IdentityRegistry, IdentityResult};

/// How the node should pick its identity at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityChoice {
    /// A specific identity already in the keystore.
    Existing { address: String },
    /// Whatever the previous run used, or a fresh one when nothing is remembered.
    Last,
    /// Always create and register a new identity.
    New,
}

impl IdentityChoice {
    /// `Existing` when an address is configured, `Last` otherwise.
    pub fn from_address(address: Option<&str>) -> Self {
        match address {
            Some(address) if !address.is_empty() => IdentityChoice::Existing {
                address: address.to_string(),
            },
            _ => IdentityChoice::Last,
        }
    }
}

/// Resolves, unlocks and remembers the node identity.
pub struct IdentitySelector {
    manager: Arc<dyn IdentityManager>,
    registry: Arc<dyn IdentityRegistry>,
    cache: Arc<dyn IdentityCache>,
}

impl IdentitySelector {
    pub fn new(
        manager: Arc<dyn IdentityManager>,
        registry: Arc<dyn IdentityRegistry>,
        cache: Arc<dyn IdentityCache>,
    ) -> Self {
        Self {
            manager,
            registry,
            cache,
        }
    }

    /// Unlock a keystore identity and remember it. Never registers.
    pub fn use_existing(&self, address: &str, passphrase: &str) -> IdentityResult<Identity> {
        let identity = self.manager.get_identity(address)?;
        self.manager.unlock(&identity.address, passphrase)?;
        self.cache.store_identity(&identity)?;

        info!(identity = %identity, "Using existing identity");
        Ok(identity)
    }

    /// Unlock the identity remembered from the previous run.
    ///
    /// The cached address is trusted as is; a stale entry surfaces as an
    /// unlock failure.
    pub fn use_last(&self, passphrase: &str) -> IdentityResult<Identity> {
        let identity = self
            .cache
            .get_identity()?
            .ok_or(IdentityError::NoCachedIdentity)?;
        self.manager.unlock(&identity.address, passphrase)?;

        info!(identity = %identity, "Using last identity");
        Ok(identity)
    }

    /// Create, unlock and register a new identity, then remember it.
    pub async fn use_new(&self, passphrase: &str) -> IdentityResult<Identity> {
        let identity = self.manager.create_new_identity(passphrase)?;
        self.manager.unlock(&identity.address, passphrase)?;

        let signer = self.manager.signer(&identity)?;
        self.registry
            .register_identity(&identity, signer.as_ref())
            .await
            .map_err(|e| match e {
                IdentityError::RegistrationFailed(_) => e,
                other => IdentityError::RegistrationFailed(other.to_string()),
            })?;
        self.cache.store_identity(&identity)?;

        info!(identity = %identity, "Using new identity");
        Ok(identity)
    }

    /// Apply `choice`. `Last` falls back to a new identity when nothing is cached.
    pub async fn select(&self, choice: &IdentityChoice, passphrase: &str) -> IdentityResult<Identity> {
        match choice {
            IdentityChoice::Existing { address } => self.use_existing(address, passphrase),
            IdentityChoice::New => self.use_new(passphrase).await,
            IdentityChoice::Last => match self.use_last(passphrase) {
                Err(IdentityError::NoCachedIdentity) => {
                    warn!("No remembered identity, creating a new one");
                    self.use_new(passphrase).await
                }
                other => other,
            },
        }
    }
}
