//! Consumer-side connections.
//!
//! A [`ConnectionManager`] drives one outbound tunnel at a time. The data
//! plane of each service type is a [`TunnelProcess`] built by that type's
//! [`ConnectionFactory`]; it reports state and statistics through `watch`
//! channels, which only ever hold the latest value.

mod manager;

use async_trait::async_trait;
use mesh_dialog::{DialogError, ErrorCode, SessionId};
use shared_utils::identity::{Identity, IdentityError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::watch;

use crate::location::IpResolver;
use crate::nat::NatError;
use crate::promise::PromiseError;
use crate::services::engine::EngineError;

pub use manager::{ConnectParams, ConnectionManager};

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Connection errors; each Connect stage has its own variant.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Already connected")]
    AlreadyConnected,

    #[error("Not connected")]
    NotConnected,

    #[error("Consumer identity unusable: {0}")]
    Identity(#[from] IdentityError),

    #[error("Proposal has no usable contact")]
    NoContact,

    #[error("Unsupported service type: {0}")]
    UnsupportedService(String),

    #[error("Dialog failed: {0}")]
    Dialog(#[from] DialogError),

    #[error("Session create refused ({code:?}): {message}")]
    SessionCreate { code: ErrorCode, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Promise issuer failed: {0}")]
    Promise(#[from] PromiseError),

    #[error("NAT traversal failed: {0}")]
    Nat(#[from] NatError),

    #[error("Tunnel failed: {0}")]
    Tunnel(String),

    #[error("Tunnel engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid service configuration: {0}")]
    Config(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connect cancelled")]
    Cancelled,
}

/// Externally visible state of a [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    Connecting,
    Connected { session_id: SessionId },
    Disconnecting,
    Reconnecting,
}

/// Events reported by a tunnel process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Traffic counters of the current tunnel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub started_at: Option<SystemTime>,
}

/// What a tunnel process needs to start.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub session_id: SessionId,
    pub provider_id: Identity,
    /// Negotiated service configuration bytes
    pub config: Vec<u8>,
    /// Provider address learned through hole punching
    pub punched_peer: Option<SocketAddr>,
}

/// Consumer-side data plane of one connection.
#[async_trait]
pub trait TunnelProcess: Send + Sync {
    /// Consumer parameters sent along with the session create request.
    fn consumer_config(&self) -> ConnectionResult<Vec<u8>>;

    async fn start(&self, options: ConnectOptions) -> ConnectionResult<()>;

    /// Resolves once the tunnel has gone down.
    async fn wait(&self) -> ConnectionResult<()>;

    async fn stop(&self) -> ConnectionResult<()>;
}

/// Builds tunnel processes for one service type.
pub trait ConnectionFactory: Send + Sync {
    fn create(
        &self,
        state: watch::Sender<TunnelState>,
        statistics: watch::Sender<Statistics>,
        ip_resolver: Arc<dyn IpResolver>,
    ) -> ConnectionResult<Arc<dyn TunnelProcess>>;
}
