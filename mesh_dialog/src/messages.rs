//! Dialog Message Definitions
//!
//! Requests and responses exchanged over a dialog once it is established.
//! Service configuration travels as opaque bytes; only the service-specific
//! connection factory on the consumer side decodes it.

use serde::{Deserialize, Serialize};
use shared_utils::identity::{Identity, IdentityResult, Signature, Signer};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Identifier of one consumer/provider session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub String);

impl SessionId {
    /// Fresh random identifier (UUID v4).
    pub fn random() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        SessionId(value.to_string())
    }
}

/// Address a peer can be punched at.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingTarget {
    pub address: SocketAddr,
}

/// Consumer's request to open a session on a proposal.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionCreateRequest {
    /// Proposal the consumer picked
    pub proposal_id: u64,

    /// Service specific consumer parameters (e.g. WireGuard public key)
    pub consumer_config: Vec<u8>,

    /// Where the consumer can be punched, when NAT traversal is wanted
    pub ping_target: Option<PingTarget>,
}

/// Provider's answer to a successful session create.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionCreatedResponse {
    pub session_id: SessionId,

    /// Negotiated service configuration
    pub config: Vec<u8>,

    /// Where the provider can be punched
    pub ping_target: Option<PingTarget>,
}

/// Payment commitment for one session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Promise {
    pub session_id: SessionId,
    pub consumer: Identity,
    /// Strictly increasing per session
    pub sequence: u64,
    /// Cumulative amount promised so far
    pub amount: u64,
    pub issued_at_ms: u64,
}

impl Promise {
    /// Canonical bytes covered by the promise signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        format!(
            "promise:{}:{}:{}:{}:{}",
            self.session_id, self.consumer, self.sequence, self.amount, self.issued_at_ms
        )
        .into_bytes()
    }

    pub fn sign(self, signer: &dyn Signer) -> IdentityResult<SignedPromise> {
        let signature = signer.sign(&self.signing_bytes())?;
        Ok(SignedPromise {
            promise: self,
            signature,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignedPromise {
    pub promise: Promise,
    pub signature: Signature,
}

/// Discriminant used to register request handlers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    SessionCreate,
    SessionDestroy,
    Promise,
    PingTarget,
}

/// Request sent over a dialog
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Request {
    /// Open a session on a proposal
    SessionCreate(SessionCreateRequest),

    /// Tear down a session
    SessionDestroy { session_id: SessionId },

    /// Next payment promise for a session
    Promise(SignedPromise),

    /// Publish a (new) punch target for a session
    PingTarget {
        session_id: SessionId,
        target: PingTarget,
    },
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::SessionCreate(_) => RequestKind::SessionCreate,
            Request::SessionDestroy { .. } => RequestKind::SessionDestroy,
            Request::Promise(_) => RequestKind::Promise,
            Request::PingTarget { .. } => RequestKind::PingTarget,
        }
    }
}

/// Error codes carried in `Response::Error`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No handler registered for the request kind
    Unhandled,
    /// Proposal does not belong to the serving instance
    InvalidProposal,
    ConfigNegotiationFailed,
    SessionNotFound,
    /// Promise rejected; the session carries on
    InvalidPromise,
    /// Request is well-formed but refers to someone else's session
    Forbidden,
    Internal,
}

/// Response sent over a dialog
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Response {
    SessionCreated(SessionCreatedResponse),
    SessionDestroyed,
    Ack,
    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bincode::{deserialize, serialize};

    #[test]
    fn test_serialize_deserialize_request() {
        let request = Request::SessionCreate(SessionCreateRequest {
            proposal_id: 7,
            consumer_config: br#"{"public_key":"abc"}"#.to_vec(),
            ping_target: Some(PingTarget {
                address: "192.0.2.10:40000".parse().unwrap(),
            }),
        });

        let serialized = serialize(&request).expect("Failed to serialize request");
        let deserialized: Request =
            deserialize(&serialized).expect("Failed to deserialize request");

        assert_eq!(deserialized.kind(), RequestKind::SessionCreate);
        match deserialized {
            Request::SessionCreate(create) => {
                assert_eq!(create.proposal_id, 7);
                assert_eq!(create.consumer_config, br#"{"public_key":"abc"}"#.to_vec());
                assert_eq!(
                    create.ping_target.map(|t| t.address.port()),
                    Some(40000)
                );
            }
            _ => panic!("Deserialized to wrong variant"),
        }
    }

    #[test]
    fn test_promise_signing_bytes_cover_fields() {
        let promise = Promise {
            session_id: SessionId::from("s-1"),
            consumer: Identity::from_address("0xc"),
            sequence: 1,
            amount: 100,
            issued_at_ms: 5,
        };
        let mut bumped = promise.clone();
        bumped.amount = 101;

        assert_ne!(promise.signing_bytes(), bumped.signing_bytes());
    }

    #[test]
    fn test_random_session_ids_differ() {
        assert_ne!(SessionId::random(), SessionId::random());
    }
}
