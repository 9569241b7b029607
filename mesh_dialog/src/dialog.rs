//! Established dialogs.
//!
//! A [`ChannelDialog`] owns one relayed connection. A reader task verifies
//! every inbound envelope against the peer identity, completes pending
//! requests and dispatches inbound requests to the handler registered for
//! their kind.

use async_trait::async_trait;
use shared_utils::identity::{Identity, Signer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::messages::{ErrorCode, Request, RequestKind, Response};
use crate::transport::{self, Connection, DialogError, DialogResult, Frame};

/// Serves one kind of inbound request.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

/// Authenticated request/response channel with one peer.
#[async_trait]
pub trait Dialog: Send + Sync {
    /// Identity on the other end.
    fn peer_id(&self) -> &Identity;

    /// Send a request and wait for its response.
    async fn request(&self, request: Request) -> DialogResult<Response>;

    /// Install the handler for inbound requests of `kind`, replacing any previous one.
    fn respond(&self, kind: RequestKind, handler: Arc<dyn RequestHandler>);

    /// Run `observer` once the dialog closes, from either side.
    /// Runs immediately if the dialog is already closed.
    fn on_close(&self, observer: Box<dyn FnOnce() + Send>);

    fn is_closed(&self) -> bool;

    /// Close the dialog and notify the peer. Idempotent.
    async fn close(&self) -> DialogResult<()>;
}

type Observers = Vec<Box<dyn FnOnce() + Send>>;

struct Shared {
    signer: Arc<dyn Signer>,
    peer: Identity,
    outbound: mpsc::Sender<Vec<u8>>,
    request_timeout: Duration,
    next_id: AtomicU64,
    closed: AtomicBool,
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    handlers: Mutex<HashMap<RequestKind, Arc<dyn RequestHandler>>>,
    observers: Mutex<Observers>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    async fn send(&self, correlation_id: u64, frame: &Frame) -> DialogResult<()> {
        let bytes = transport::seal(self.signer.as_ref(), correlation_id, frame)?;
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| DialogError::Closed)
    }

    /// Mark closed and release everything tied to the dialog.
    /// Returns false if it was already closed.
    fn shut(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        // Dropping the senders fails every outstanding request with `Closed`
        lock(&self.pending).clear();
        lock(&self.handlers).clear();

        let observers = std::mem::take(&mut *lock(&self.observers));
        for observer in observers {
            observer();
        }
        true
    }

    async fn dispatch(self: Arc<Self>, correlation_id: u64, request: Request) {
        let kind = request.kind();
        let handler = lock(&self.handlers).get(&kind).cloned();

        let response = match handler {
            Some(handler) => handler.handle(request).await,
            None => {
                debug!(peer = %self.peer, kind = ?kind, "No handler for request");
                Response::error(ErrorCode::Unhandled, format!("{:?} not handled", kind))
            }
        };

        if let Err(e) = self.send(correlation_id, &Frame::Response(response)).await {
            debug!(peer = %self.peer, "Failed to send response: {}", e);
        }
    }
}

/// Dialog over a broker-relayed connection.
pub struct ChannelDialog {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelDialog {
    /// Wrap a connection whose handshake already completed.
    pub(crate) fn spawn(
        connection: Connection,
        signer: Arc<dyn Signer>,
        peer: Identity,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let Connection {
            mut inbound,
            outbound,
        } = connection;

        let shared = Arc::new(Shared {
            signer,
            peer,
            outbound,
            request_timeout,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        });

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            while let Some(bytes) = inbound.recv().await {
                let (sender, correlation_id, frame) = match transport::open(&bytes) {
                    Ok(opened) => opened,
                    Err(e) => {
                        warn!(peer = %reader_shared.peer, "Dropping invalid frame: {}", e);
                        continue;
                    }
                };
                if sender != reader_shared.peer {
                    warn!(peer = %reader_shared.peer, sender = %sender, "Dropping frame from foreign sender");
                    continue;
                }

                match frame {
                    Frame::Request(request) => {
                        tokio::spawn(Arc::clone(&reader_shared).dispatch(correlation_id, request));
                    }
                    Frame::Response(response) => {
                        let waiter = lock(&reader_shared.pending).remove(&correlation_id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(response);
                            }
                            None => debug!(
                                peer = %reader_shared.peer,
                                correlation_id, "Late or unknown response dropped"
                            ),
                        }
                    }
                    Frame::Close => break,
                    other => {
                        warn!(peer = %reader_shared.peer, "Unexpected frame: {:?}", other);
                    }
                }
            }

            if reader_shared.shut() {
                debug!(peer = %reader_shared.peer, "Dialog closed by peer");
            }
        });

        Arc::new(ChannelDialog {
            shared,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub(crate) async fn send_frame(&self, correlation_id: u64, frame: &Frame) -> DialogResult<()> {
        self.shared.send(correlation_id, frame).await
    }
}

#[async_trait]
impl Dialog for ChannelDialog {
    fn peer_id(&self) -> &Identity {
        &self.shared.peer
    }

    async fn request(&self, request: Request) -> DialogResult<Response> {
        if self.is_closed() {
            return Err(DialogError::Closed);
        }

        let correlation_id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(correlation_id, tx);

        let kind = request.kind();
        if let Err(e) = self
            .shared
            .send(correlation_id, &Frame::Request(request))
            .await
        {
            lock(&self.shared.pending).remove(&correlation_id);
            return Err(e);
        }

        match timeout(self.shared.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DialogError::Closed),
            Err(_) => {
                lock(&self.shared.pending).remove(&correlation_id);
                Err(DialogError::Timeout(format!(
                    "{:?} to {} got no response within {:?}",
                    kind, self.shared.peer, self.shared.request_timeout
                )))
            }
        }
    }

    fn respond(&self, kind: RequestKind, handler: Arc<dyn RequestHandler>) {
        if self.is_closed() {
            return;
        }
        lock(&self.shared.handlers).insert(kind, handler);
    }

    fn on_close(&self, observer: Box<dyn FnOnce() + Send>) {
        {
            let mut observers = lock(&self.shared.observers);
            if !self.is_closed() {
                observers.push(observer);
                return;
            }
        }
        observer();
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> DialogResult<()> {
        if self.is_closed() {
            return Ok(());
        }

        // Best effort: the peer may already be gone
        let _ = self.shared.send(0, &Frame::Close).await;

        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        if self.shared.shut() {
            debug!(peer = %self.shared.peer, "Dialog closed");
        }
        Ok(())
    }
}

impl Drop for ChannelDialog {
    fn drop(&mut self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        self.shared.shut();
    }
}
