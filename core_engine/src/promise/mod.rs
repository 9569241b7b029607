//! Payment promises.
//!
//! Consumers run a [`PromiseIssuer`] per session that periodically signs and
//! sends cumulative promises over the dialog. Providers run a
//! [`PromiseProcessor`] per session that validates them. Whether real or
//! no-op engines are used is decided once, from [`PromiseSettings`].

mod issuer;
mod processor;

use async_trait::async_trait;
use mesh_dialog::{Dialog, DialogError, SessionId, SignedPromise};
use shared_utils::config::PromiseConfig;
use shared_utils::identity::{Identity, IdentityError, Signer};
use shared_utils::market::ServiceProposal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use issuer::{NoopPromiseIssuer, SigningPromiseIssuer};
pub use processor::{NoopPromiseProcessor, PromiseStats, ValidatingPromiseProcessor};

/// Result type for promise operations.
pub type PromiseResult<T> = Result<T, PromiseError>;

/// Promise error types. None of them end a session on their own.
#[derive(Debug, Error)]
pub enum PromiseError {
    #[error("Promise regressed: last sequence {last_sequence}, got {sequence}")]
    Regression { last_sequence: u64, sequence: u64 },

    #[error("Invalid promise signature: {0}")]
    InvalidSignature(String),

    #[error("Promise is for session {0}")]
    WrongSession(SessionId),

    #[error("Insufficient balance: {available} available, {required} required")]
    InsufficientBalance { available: u64, required: u64 },

    #[error("Balance lookup failed: {0}")]
    Balance(String),

    /// Provider refused the promise
    #[error("Promise rejected: {0}")]
    Rejected(String),

    #[error("Promise engine not started")]
    NotStarted,

    #[error("Promise engine already started")]
    AlreadyStarted,

    #[error("Dialog error: {0}")]
    Dialog(#[from] DialogError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// Consumer side: keeps promising payment while the session is active.
#[async_trait]
pub trait PromiseIssuer: Send + Sync {
    async fn start(&self, proposal: &ServiceProposal) -> PromiseResult<()>;

    /// Halt issuance. Safe to call when not started.
    async fn stop(&self) -> PromiseResult<()>;

    fn is_running(&self) -> bool;
}

/// Provider side: validates promises for one session.
pub trait PromiseProcessor: Send + Sync {
    fn start(&self, proposal: &ServiceProposal) -> PromiseResult<()>;

    fn stop(&self) -> PromiseResult<()>;

    fn process(&self, promise: &SignedPromise) -> PromiseResult<()>;
}

/// Balance available to an identity.
#[async_trait]
pub trait BalanceProvider: Send + Sync {
    async fn balance(&self, identity: &Identity) -> PromiseResult<u64>;
}

/// Same balance for everybody.
#[derive(Debug, Clone, Copy)]
pub struct FixedBalance(pub u64);

#[async_trait]
impl BalanceProvider for FixedBalance {
    async fn balance(&self, _identity: &Identity) -> PromiseResult<u64> {
        Ok(self.0)
    }
}

/// Selects and builds promise engines.
#[derive(Clone)]
pub struct PromiseSettings {
    pub check_enabled: bool,
    /// Time between promise increments
    pub interval: Duration,
    pub balance: Arc<dyn BalanceProvider>,
}

impl PromiseSettings {
    /// Promise checking disabled.
    pub fn disabled() -> Self {
        Self {
            check_enabled: false,
            interval: Duration::from_secs(60),
            balance: Arc::new(FixedBalance(0)),
        }
    }

    pub fn from_config(config: &PromiseConfig, balance: Arc<dyn BalanceProvider>) -> Self {
        Self {
            check_enabled: config.check_enabled,
            interval: config.issue_interval(),
            balance,
        }
    }

    /// Issuer for a consumer session.
    pub fn issuer(
        &self,
        signer: Arc<dyn Signer>,
        dialog: Arc<dyn Dialog>,
        session_id: SessionId,
    ) -> Arc<dyn PromiseIssuer> {
        if !self.check_enabled {
            return Arc::new(NoopPromiseIssuer::default());
        }
        Arc::new(SigningPromiseIssuer::new(
            signer,
            dialog,
            session_id,
            Arc::clone(&self.balance),
            self.interval,
        ))
    }

    /// Processor for a provider session.
    pub fn processor(&self, session_id: SessionId, consumer: Identity) -> Arc<dyn PromiseProcessor> {
        if !self.check_enabled {
            return Arc::new(NoopPromiseProcessor::default());
        }
        Arc::new(ValidatingPromiseProcessor::new(session_id, consumer))
    }
}
