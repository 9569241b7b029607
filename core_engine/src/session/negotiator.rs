use mesh_dialog::SessionId;

use super::SessionResult;
use crate::services::ServiceConfiguration;

/// Runs once when the session is destroyed; releases what negotiation reserved.
pub type DestroyCallback = Box<dyn FnOnce() + Send>;

/// Configuration for the consumer plus its cleanup hook.
pub type Negotiated = (ServiceConfiguration, Option<DestroyCallback>);

/// Produces service configuration for a new session.
///
/// Implemented per service type. `consumer_config` is the opaque payload the
/// consumer's connection factory sent along with the create request.
pub trait ConfigNegotiator: Send + Sync {
    fn provide_config(
        &self,
        session_id: &SessionId,
        consumer_config: &[u8],
    ) -> SessionResult<Negotiated>;
}
