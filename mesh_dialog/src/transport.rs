//! Dialog Transport Layer
//!
//! Error types, discovery addresses, the signed envelope codec and the
//! in-process broker relay that carries envelopes between peers.

use serde::{Deserialize, Serialize};
use shared_utils::identity::{self, Identity, IdentityError, Signature, Signer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::messages::{Request, Response};

/// Largest encoded envelope accepted from a peer
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Buffered frames per direction of a dialog
const CHANNEL_CAPACITY: usize = 64;

/// Result type for dialog operations
pub type DialogResult<T> = Result<T, DialogError>;

/// Error type for dialog operations
#[derive(Error, Debug)]
pub enum DialogError {
    /// Nobody is waiting on the address, or the peer did not answer in time
    #[error("Dialog unreachable: {0}")]
    Unreachable(String),

    /// Peer failed signature or registry checks
    #[error("Unauthorized peer: {0}")]
    UnauthorizedPeer(String),

    /// Request got no response in time
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Malformed discovery address or contact
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Another waiter is already bound to the address
    #[error("Address already in use: {0}")]
    AddressInUse(String),

    /// Dialog was closed by either side
    #[error("Dialog closed")]
    Closed,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Signing or signature verification failed
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Where a provider waits for dialogs: `{broker}/{identity}/{service_type}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveryAddress {
    broker: String,
    identity: Identity,
    service_type: String,
}

impl DiscoveryAddress {
    pub fn new(
        broker: impl Into<String>,
        identity: &Identity,
        service_type: impl Into<String>,
    ) -> DialogResult<Self> {
        let address = DiscoveryAddress {
            broker: broker.into(),
            identity: identity.clone(),
            service_type: service_type.into(),
        };

        if address.broker.is_empty()
            || address.identity.address.is_empty()
            || address.service_type.is_empty()
        {
            return Err(DialogError::InvalidAddress(address.to_string()));
        }
        if address.identity.address.contains('/') || address.service_type.contains('/') {
            return Err(DialogError::InvalidAddress(address.to_string()));
        }

        Ok(address)
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }
}

impl fmt::Display for DiscoveryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.broker, self.identity, self.service_type)
    }
}

impl FromStr for DiscoveryAddress {
    type Err = DialogError;

    fn from_str(s: &str) -> DialogResult<Self> {
        // The broker part may itself contain slashes (nats://host:port)
        let mut parts = s.rsplitn(3, '/');
        let service_type = parts.next().unwrap_or_default();
        let identity = parts.next().unwrap_or_default();
        let broker = parts.next().unwrap_or_default();

        DiscoveryAddress::new(broker, &Identity::from_address(identity), service_type)
            .map_err(|_| DialogError::InvalidAddress(s.to_string()))
    }
}

/// What travels inside an envelope.
#[derive(Serialize, Deserialize, Debug)]
pub(crate) enum Frame {
    /// First frame of a dialog, sent by the initiator
    Hello {
        consumer: Identity,
        provider: Identity,
    },
    /// Provider accepted the dialog
    Accept,
    /// Provider refused the dialog
    Reject { reason: String },
    Request(Request),
    Response(Response),
    Close,
}

/// Signed wire unit.
#[derive(Serialize, Deserialize, Debug)]
struct Envelope {
    sender: Identity,
    correlation_id: u64,
    body: Vec<u8>,
    signature: Signature,
}

fn signed_bytes(correlation_id: u64, body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(8 + body.len());
    message.extend_from_slice(&correlation_id.to_be_bytes());
    message.extend_from_slice(body);
    message
}

/// Encode and sign `frame` as `signer`.
pub(crate) fn seal(signer: &dyn Signer, correlation_id: u64, frame: &Frame) -> DialogResult<Vec<u8>> {
    let body = bincode::serialize(frame)?;
    let signature = signer.sign(&signed_bytes(correlation_id, &body))?;

    let envelope = Envelope {
        sender: signer.identity().clone(),
        correlation_id,
        body,
        signature,
    };
    Ok(bincode::serialize(&envelope)?)
}

/// Decode an envelope and verify its signature against the claimed sender.
pub(crate) fn open(bytes: &[u8]) -> DialogResult<(Identity, u64, Frame)> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(DialogError::Protocol(format!(
            "Frame too large: {} bytes",
            bytes.len()
        )));
    }

    let envelope: Envelope = bincode::deserialize(bytes)?;
    identity::verify(
        &envelope.sender,
        &signed_bytes(envelope.correlation_id, &envelope.body),
        &envelope.signature,
    )
    .map_err(|_| DialogError::UnauthorizedPeer(format!("bad signature from {}", envelope.sender)))?;

    let frame = bincode::deserialize(&envelope.body)?;
    Ok((envelope.sender, envelope.correlation_id, frame))
}

/// One end of a relayed byte channel.
pub struct Connection {
    pub(crate) inbound: mpsc::Receiver<Vec<u8>>,
    pub(crate) outbound: mpsc::Sender<Vec<u8>>,
}

impl Connection {
    /// Two connected ends.
    pub(crate) fn pair() -> (Connection, Connection) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Connection {
                inbound: a_rx,
                outbound: b_tx,
            },
            Connection {
                inbound: b_rx,
                outbound: a_tx,
            },
        )
    }
}

/// In-process broker relay.
///
/// Providers bind discovery addresses; consumers connect to them. Cloning
/// shares the same relay.
#[derive(Clone, Default)]
pub struct Broker {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<Connection>>>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accepting connections for `address`.
    pub fn bind(&self, address: &DiscoveryAddress) -> DialogResult<mpsc::Receiver<Connection>> {
        let key = address.to_string();
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(existing) = listeners.get(&key) {
            if !existing.is_closed() {
                return Err(DialogError::AddressInUse(key));
            }
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        listeners.insert(key.clone(), tx);
        debug!(address = %key, "Broker address bound");
        Ok(rx)
    }

    /// Stop accepting connections for `address`. Unknown addresses are ignored.
    pub fn unbind(&self, address: &DiscoveryAddress) {
        let key = address.to_string();
        let removed = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&key);
        if removed.is_some() {
            debug!(address = %key, "Broker address unbound");
        }
    }

    /// Whether a live listener is bound to `address`.
    pub fn is_bound(&self, address: &DiscoveryAddress) -> bool {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&address.to_string())
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Open a relayed connection to whoever is bound to `address`.
    pub async fn connect(&self, address: &DiscoveryAddress) -> DialogResult<Connection> {
        let key = address.to_string();
        let listener = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
            .cloned()
            .ok_or_else(|| DialogError::Unreachable(key.clone()))?;

        let (local, remote) = Connection::pair();
        listener
            .send(remote)
            .await
            .map_err(|_| DialogError::Unreachable(key))?;
        Ok(local)
    }
}
