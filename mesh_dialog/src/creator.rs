//! Consumer side: opens dialogs to providers.

use async_trait::async_trait;
use shared_utils::identity::{Identity, Signer};
use shared_utils::market::{Contact, CONTACT_TYPE_BROKER};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::dialog::{ChannelDialog, Dialog};
use crate::transport::{self, Broker, DialogError, DialogResult, DiscoveryAddress, Frame};

/// Opens an authenticated dialog to a provider.
#[async_trait]
pub trait DialogCreator: Send + Sync {
    /// Open a dialog as `consumer` to `provider_id`, reached through `contact`.
    async fn create(
        &self,
        consumer: Arc<dyn Signer>,
        provider_id: &Identity,
        contact: &Contact,
    ) -> DialogResult<Arc<dyn Dialog>>;
}

/// Dialog creator relaying through a [`Broker`].
pub struct BrokerDialogCreator {
    broker: Broker,
    timeout: Duration,
}

impl BrokerDialogCreator {
    pub fn new(broker: Broker, timeout: Duration) -> Self {
        Self { broker, timeout }
    }
}

#[async_trait]
impl DialogCreator for BrokerDialogCreator {
    async fn create(
        &self,
        consumer: Arc<dyn Signer>,
        provider_id: &Identity,
        contact: &Contact,
    ) -> DialogResult<Arc<dyn Dialog>> {
        if contact.contact_type != CONTACT_TYPE_BROKER {
            return Err(DialogError::InvalidAddress(format!(
                "unsupported contact type {}",
                contact.contact_type
            )));
        }
        let address: DiscoveryAddress = contact.address.parse()?;
        if address.identity() != provider_id {
            return Err(DialogError::InvalidAddress(format!(
                "contact {} does not belong to {}",
                contact.address, provider_id
            )));
        }

        let mut connection = self.broker.connect(&address).await?;

        let hello = Frame::Hello {
            consumer: consumer.identity().clone(),
            provider: provider_id.clone(),
        };
        connection
            .outbound
            .send(transport::seal(consumer.as_ref(), 0, &hello)?)
            .await
            .map_err(|_| DialogError::Unreachable(address.to_string()))?;

        let bytes = timeout(self.timeout, connection.inbound.recv())
            .await
            .map_err(|_| {
                DialogError::Unreachable(format!("{} did not answer in {:?}", address, self.timeout))
            })?
            .ok_or_else(|| DialogError::Unreachable(address.to_string()))?;

        let (sender, _, frame) = transport::open(&bytes)?;
        if &sender != provider_id {
            return Err(DialogError::UnauthorizedPeer(format!(
                "expected {}, answered by {}",
                provider_id, sender
            )));
        }

        match frame {
            Frame::Accept => {
                debug!(provider = %provider_id, address = %address, "Dialog established");
                let dialog: Arc<dyn Dialog> = ChannelDialog::spawn(
                    connection,
                    consumer,
                    provider_id.clone(),
                    self.timeout,
                );
                Ok(dialog)
            }
            Frame::Reject { reason } => Err(DialogError::UnauthorizedPeer(reason)),
            other => Err(DialogError::Protocol(format!(
                "expected accept, got {:?}",
                other
            ))),
        }
    }
}
