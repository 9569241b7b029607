//! MeshTunnel node engine
//!
//! Provider side: service instances advertised through discovery, accepting
//! sessions over dialogs. Consumer side: one connection manager per outbound
//! tunnel. Both are assembled from configuration in [`bootstrap`].

pub mod bootstrap;
pub mod connection;
pub mod discovery;
pub mod location;
pub mod nat;
pub mod promise;
pub mod service;
pub mod services;
pub mod session;

pub use bootstrap::Node;
pub use connection::{ConnectParams, ConnectionError, ConnectionManager, ConnectionStatus};
pub use service::{Manager, ManagerState, ServiceError, ServiceRunner};
pub use session::{SessionError, SessionRegistry};
