//! Provider side: waits for dialogs on a discovery address.

use async_trait::async_trait;
use shared_utils::identity::{IdentityRegistry, Signer};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::dialog::{ChannelDialog, Dialog};
use crate::transport::{self, Broker, Connection, DialogError, DialogResult, DiscoveryAddress, Frame};

/// Takes ownership of each accepted dialog.
#[async_trait]
pub trait DialogHandler: Send + Sync {
    /// Install request handlers on `dialog`. An error closes the dialog.
    async fn handle(&self, dialog: Arc<dyn Dialog>) -> DialogResult<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Dialogs accepted so far. Once `stopped`, late handshakes are refused.
#[derive(Default)]
struct Accepted {
    dialogs: Vec<Arc<ChannelDialog>>,
    stopped: bool,
}

/// Accepts authenticated dialogs for one running service instance.
pub struct DialogWaiter {
    address: DiscoveryAddress,
    broker: Broker,
    signer: Arc<dyn Signer>,
    registry: Arc<dyn IdentityRegistry>,
    timeout: Duration,
    accepted: Arc<Mutex<Accepted>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl DialogWaiter {
    pub fn new(
        address: DiscoveryAddress,
        broker: Broker,
        signer: Arc<dyn Signer>,
        registry: Arc<dyn IdentityRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            address,
            broker,
            signer,
            registry,
            timeout,
            accepted: Arc::new(Mutex::new(Accepted::default())),
            accept_task: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &DiscoveryAddress {
        &self.address
    }

    /// Bind the discovery address and hand every accepted dialog to `handler`.
    pub fn serve(&self, handler: Arc<dyn DialogHandler>) -> DialogResult<()> {
        let mut incoming = self.broker.bind(&self.address)?;
        info!(address = %self.address, "Waiting for dialogs");

        let address = self.address.clone();
        let signer = Arc::clone(&self.signer);
        let registry = Arc::clone(&self.registry);
        let accepted = Arc::clone(&self.accepted);
        let handshake_timeout = self.timeout;

        let task = tokio::spawn(async move {
            while let Some(connection) = incoming.recv().await {
                let signer = Arc::clone(&signer);
                let registry = Arc::clone(&registry);
                let accepted = Arc::clone(&accepted);
                let handler = Arc::clone(&handler);
                let address = address.clone();

                // One task per dialog; a slow handshake must not stall the accept loop
                tokio::spawn(async move {
                    let (dialog, correlation_id) = match accept(
                        connection,
                        &address,
                        signer,
                        registry.as_ref(),
                        handshake_timeout,
                    )
                    .await
                    {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(address = %address, "Dialog rejected: {}", e);
                            return;
                        }
                    };

                    let stopped = {
                        let mut accepted = lock(&accepted);
                        if !accepted.stopped {
                            accepted.dialogs.retain(|d| !d.is_closed());
                            accepted.dialogs.push(Arc::clone(&dialog));
                        }
                        accepted.stopped
                    };
                    if stopped {
                        debug!(address = %address, peer = %dialog.peer_id(), "Waiter stopped during handshake");
                        let reject = Frame::Reject {
                            reason: "provider stopped".to_string(),
                        };
                        let _ = dialog.send_frame(correlation_id, &reject).await;
                        let _ = dialog.close().await;
                        return;
                    }

                    // Handlers go in before the initiator learns the dialog is up
                    let peer = dialog.peer_id().clone();
                    let outcome = match handler.handle(dialog.clone()).await {
                        Ok(()) => dialog.send_frame(correlation_id, &Frame::Accept).await,
                        Err(e) => {
                            let reject = Frame::Reject {
                                reason: e.to_string(),
                            };
                            let _ = dialog.send_frame(correlation_id, &reject).await;
                            Err(e)
                        }
                    };

                    match outcome {
                        Ok(()) => debug!(address = %address, peer = %peer, "Dialog accepted"),
                        Err(e) => {
                            warn!(address = %address, peer = %peer, "Dialog setup failed: {}", e);
                            let _ = dialog.close().await;
                        }
                    }
                });
            }
        });

        *lock(&self.accept_task) = Some(task);
        Ok(())
    }

    /// Dialogs currently open.
    pub fn open_dialogs(&self) -> usize {
        lock(&self.accepted)
            .dialogs
            .iter()
            .filter(|d| !d.is_closed())
            .count()
    }

    /// Unbind the address and close every accepted dialog. Handshakes still
    /// in flight are rejected. Idempotent.
    pub async fn stop(&self) -> DialogResult<()> {
        self.broker.unbind(&self.address);
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }

        let dialogs: Vec<_> = {
            let mut accepted = lock(&self.accepted);
            accepted.stopped = true;
            accepted.dialogs.drain(..).collect()
        };
        for dialog in dialogs {
            if let Err(e) = dialog.close().await {
                debug!(peer = %dialog.peer_id(), "Error closing dialog: {}", e);
            }
        }

        info!(address = %self.address, "Stopped waiting for dialogs");
        Ok(())
    }
}

impl Drop for DialogWaiter {
    fn drop(&mut self) {
        self.broker.unbind(&self.address);
        if let Some(task) = lock(&self.accept_task).take() {
            task.abort();
        }
    }
}

/// Verify the initiator. The accept frame is sent once handlers are installed.
async fn accept(
    mut connection: Connection,
    address: &DiscoveryAddress,
    signer: Arc<dyn Signer>,
    registry: &dyn IdentityRegistry,
    handshake_timeout: Duration,
) -> DialogResult<(Arc<ChannelDialog>, u64)> {
    let bytes = timeout(handshake_timeout, connection.inbound.recv())
        .await
        .map_err(|_| DialogError::Timeout("no hello from initiator".to_string()))?
        .ok_or(DialogError::Closed)?;

    let (sender, correlation_id, frame) = transport::open(&bytes)?;
    let consumer = match frame {
        Frame::Hello { consumer, provider } => {
            if consumer != sender {
                return Err(DialogError::UnauthorizedPeer(format!(
                    "{} signed a hello for {}",
                    sender, consumer
                )));
            }
            if &provider != address.identity() {
                let reject = Frame::Reject {
                    reason: format!("wrong provider {}", provider),
                };
                let _ = connection
                    .outbound
                    .send(transport::seal(signer.as_ref(), correlation_id, &reject)?)
                    .await;
                return Err(DialogError::InvalidAddress(provider.to_string()));
            }
            consumer
        }
        other => {
            return Err(DialogError::Protocol(format!(
                "expected hello, got {:?}",
                other
            )))
        }
    };

    if !registry.is_registered(&consumer).await {
        let reject = Frame::Reject {
            reason: "identity not registered".to_string(),
        };
        let _ = connection
            .outbound
            .send(transport::seal(signer.as_ref(), correlation_id, &reject)?)
            .await;
        return Err(DialogError::UnauthorizedPeer(consumer.to_string()));
    }

    let dialog = ChannelDialog::spawn(connection, signer, consumer, handshake_timeout);
    Ok((dialog, correlation_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creator::{BrokerDialogCreator, DialogCreator};
    use shared_utils::identity::{Identity, IdentityManager, IdentityResult, Keystore};
    use shared_utils::market::{Contact, CONTACT_TYPE_BROKER};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Registry that holds every lookup until released.
    #[derive(Default)]
    struct GatedRegistry {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl IdentityRegistry for GatedRegistry {
        async fn register_identity(&self, _identity: &Identity, _signer: &dyn Signer) -> IdentityResult<()> {
            Ok(())
        }

        async fn is_registered(&self, _identity: &Identity) -> bool {
            self.entered.notify_one();
            self.release.notified().await;
            true
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        handled: AtomicUsize,
    }

    #[async_trait]
    impl DialogHandler for CountingHandler {
        async fn handle(&self, _dialog: Arc<dyn Dialog>) -> DialogResult<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn signer(keystore: &Keystore) -> Arc<dyn Signer> {
        let identity = keystore.create_new_identity("pass").unwrap();
        keystore.unlock(&identity.address, "pass").unwrap();
        keystore.signer(&identity).unwrap()
    }

    #[tokio::test]
    async fn test_handshake_in_flight_at_stop_is_rejected() {
        let keystore = Keystore::new();
        let provider = signer(&keystore);
        let consumer = signer(&keystore);
        let broker = Broker::new();
        let registry = Arc::new(GatedRegistry::default());
        let address = DiscoveryAddress::new("test-broker", provider.identity(), "noop").unwrap();

        let waiter = DialogWaiter::new(
            address.clone(),
            broker.clone(),
            Arc::clone(&provider),
            registry.clone(),
            Duration::from_secs(2),
        );
        let handler = Arc::new(CountingHandler::default());
        waiter.serve(handler.clone()).unwrap();

        let creator = BrokerDialogCreator::new(broker, Duration::from_secs(2));
        let contact = Contact {
            contact_type: CONTACT_TYPE_BROKER.to_string(),
            address: address.to_string(),
        };
        let provider_id = provider.identity().clone();
        let opening = tokio::spawn(async move { creator.create(consumer, &provider_id, &contact).await });

        registry.entered.notified().await;
        waiter.stop().await.unwrap();
        registry.release.notify_one();

        let opened = opening.await.unwrap();
        assert!(opened.is_err());
        assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
        assert_eq!(waiter.open_dialogs(), 0);
    }
}
