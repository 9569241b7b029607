//! MeshTunnel dialog protocol
//!
//! Authenticated request/response channels between a consumer and a
//! provider, relayed through a broker. Providers wait for dialogs on a
//! discovery address derived from (broker, identity, service type);
//! consumers open one dialog per provider they want to talk to.

pub mod creator;
pub mod dialog;
pub mod messages;
pub mod transport;
pub mod waiter;

/// Re-export common types for convenience
pub use creator::{BrokerDialogCreator, DialogCreator};
pub use dialog::{ChannelDialog, Dialog, RequestHandler};
pub use messages::{
    ErrorCode, PingTarget, Promise, Request, RequestKind, Response, SessionCreateRequest,
    SessionCreatedResponse, SessionId, SignedPromise,
};
pub use transport::{Broker, DialogError, DialogResult, DiscoveryAddress};
pub use waiter::{DialogHandler, DialogWaiter};
