//! Provider-side session management.
//!
//! A session is one negotiated tunnel instance between a consumer and this
//! provider. Sessions live only in memory, in the [`SessionRegistry`] of the
//! service instance that created them.

mod handler;
mod negotiator;
mod registry;

use mesh_dialog::SessionId;
use shared_utils::identity::Identity;
use std::time::SystemTime;
use thiserror::Error;

use crate::promise::PromiseError;

pub use handler::SessionDialogHandler;
pub use negotiator::{ConfigNegotiator, DestroyCallback, Negotiated};
pub use registry::{IdGenerator, SessionRegistry};

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Session error types
#[derive(Debug, Error)]
pub enum SessionError {
    /// No live or recently destroyed session has this ID
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    /// The service could not produce a configuration for the consumer
    #[error("Config negotiation failed: {0}")]
    ConfigNegotiationFailed(String),

    /// Inserting would overwrite a live session
    #[error("Session ID collision: {0}")]
    Collision(SessionId),

    /// Could not find an unused ID
    #[error("Session IDs exhausted after {0} attempts")]
    IdExhausted(usize),

    /// Registry was shut down
    #[error("Session registry closed")]
    RegistryClosed,

    /// Request names a proposal this instance does not serve
    #[error("Invalid proposal: {0}")]
    InvalidProposal(u64),

    /// Session belongs to another consumer
    #[error("Session {0} is owned by another consumer")]
    Forbidden(SessionId),

    /// The requesting dialog closed before the session was committed
    #[error("Dialog closed")]
    DialogClosed,

    /// Promise processor failed to start
    #[error("Promise error: {0}")]
    Promise(#[from] PromiseError),
}

/// One active consumer/provider tunnel instance.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    /// Consumer on the dialog that created the session
    pub consumer: Identity,
    pub proposal_id: u64,
    /// Negotiated configuration as sent to the consumer
    pub config: Vec<u8>,
    pub created_at: SystemTime,
}

impl Session {
    pub fn new(id: SessionId, consumer: Identity, proposal_id: u64, config: Vec<u8>) -> Self {
        Session {
            id,
            consumer,
            proposal_id,
            config,
            created_at: SystemTime::now(),
        }
    }
}
