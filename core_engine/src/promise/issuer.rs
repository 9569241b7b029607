use async_trait::async_trait;
use mesh_dialog::{Dialog, ErrorCode, Promise, Request, Response, SessionId};
use shared_utils::identity::Signer;
use shared_utils::market::ServiceProposal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BalanceProvider, PromiseError, PromiseIssuer, PromiseResult};

/// Issuer used when promise checking is disabled.
#[derive(Debug, Default)]
pub struct NoopPromiseIssuer {
    running: AtomicBool,
}

#[async_trait]
impl PromiseIssuer for NoopPromiseIssuer {
    async fn start(&self, _proposal: &ServiceProposal) -> PromiseResult<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> PromiseResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Signs a cumulative promise every interval and sends it to the provider.
pub struct SigningPromiseIssuer {
    signer: Arc<dyn Signer>,
    dialog: Arc<dyn Dialog>,
    session_id: SessionId,
    balance: Arc<dyn BalanceProvider>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl SigningPromiseIssuer {
    pub fn new(
        signer: Arc<dyn Signer>,
        dialog: Arc<dyn Dialog>,
        session_id: SessionId,
        balance: Arc<dyn BalanceProvider>,
        interval: Duration,
    ) -> Self {
        Self {
            signer,
            dialog,
            session_id,
            balance,
            interval,
            running: Mutex::new(None),
        }
    }

    fn take_running(&self) -> Option<Running> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

async fn issue(
    signer: &dyn Signer,
    dialog: &dyn Dialog,
    session_id: &SessionId,
    sequence: u64,
    amount: u64,
) -> PromiseResult<()> {
    let promise = Promise {
        session_id: session_id.clone(),
        consumer: signer.identity().clone(),
        sequence,
        amount,
        issued_at_ms: now_ms(),
    }
    .sign(signer)?;

    match dialog.request(Request::Promise(promise)).await? {
        Response::Ack => Ok(()),
        Response::Error {
            code: ErrorCode::InvalidPromise,
            message,
        } => Err(PromiseError::Rejected(message)),
        other => {
            debug!(session_id = %session_id, "Unexpected promise response: {:?}", other);
            Ok(())
        }
    }
}

#[async_trait]
impl PromiseIssuer for SigningPromiseIssuer {
    async fn start(&self, proposal: &ServiceProposal) -> PromiseResult<()> {
        if self.is_running() {
            return Err(PromiseError::AlreadyStarted);
        }

        let price = proposal.payment.price_per_interval;
        let available = self.balance.balance(self.signer.identity()).await?;
        if available < price {
            return Err(PromiseError::InsufficientBalance {
                available,
                required: price,
            });
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let signer = Arc::clone(&self.signer);
        let dialog = Arc::clone(&self.dialog);
        let session_id = self.session_id.clone();
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut sequence = 0u64;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        sequence += 1;
                        let amount = price.saturating_mul(sequence);
                        match issue(signer.as_ref(), dialog.as_ref(), &session_id, sequence, amount).await {
                            Ok(()) => debug!(session_id = %session_id, sequence, amount, "Promise sent"),
                            // Reported, never fatal for the session
                            Err(e) => warn!(session_id = %session_id, sequence, "Promise not accepted: {}", e),
                        }
                    }
                }
            }
        });

        *self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Running { cancel, task });
        info!(session_id = %self.session_id, price, "Promise issuer started");
        Ok(())
    }

    async fn stop(&self) -> PromiseResult<()> {
        if let Some(running) = self.take_running() {
            running.cancel.cancel();
            let _ = running.task.await;
            info!(session_id = %self.session_id, "Promise issuer stopped");
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }
}

impl Drop for SigningPromiseIssuer {
    fn drop(&mut self) {
        if let Some(running) = self.take_running() {
            running.cancel.cancel();
            running.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::FixedBalance;
    use mesh_dialog::{DialogResult, RequestHandler, RequestKind, SignedPromise};
    use shared_utils::identity::{Identity, IdentityManager, Keystore};

    /// Acknowledges every request and keeps the promises it saw.
    struct RecordingDialog {
        peer: Identity,
        promises: Mutex<Vec<SignedPromise>>,
    }

    impl Default for RecordingDialog {
        fn default() -> Self {
            Self {
                peer: Identity::from_address("0xp"),
                promises: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Dialog for RecordingDialog {
        fn peer_id(&self) -> &Identity {
            &self.peer
        }

        async fn request(&self, request: Request) -> DialogResult<Response> {
            if let Request::Promise(promise) = request {
                self.promises.lock().unwrap().push(promise);
            }
            Ok(Response::Ack)
        }

        fn respond(&self, _kind: RequestKind, _handler: Arc<dyn RequestHandler>) {}

        fn on_close(&self, _observer: Box<dyn FnOnce() + Send>) {}

        fn is_closed(&self) -> bool {
            false
        }

        async fn close(&self) -> DialogResult<()> {
            Ok(())
        }
    }

    fn signer() -> Arc<dyn Signer> {
        let keystore = Keystore::new();
        let identity = keystore.create_new_identity("pass").unwrap();
        keystore.unlock(&identity.address, "pass").unwrap();
        keystore.signer(&identity).unwrap()
    }

    fn proposal(price: u64) -> ServiceProposal {
        let mut proposal = ServiceProposal::new("0xp", "noop");
        proposal.payment.price_per_interval = price;
        proposal
    }

    #[tokio::test]
    async fn issues_increasing_promises_until_stopped() {
        let dialog = Arc::new(RecordingDialog::default());
        let issuer = SigningPromiseIssuer::new(
            signer(),
            dialog.clone(),
            SessionId::from("s-1"),
            Arc::new(FixedBalance(1_000)),
            Duration::from_millis(10),
        );

        issuer.start(&proposal(100)).await.unwrap();
        assert!(issuer.is_running());
        tokio::time::sleep(Duration::from_millis(60)).await;
        issuer.stop().await.unwrap();
        assert!(!issuer.is_running());

        let sent = dialog.promises.lock().unwrap().clone();
        assert!(sent.len() >= 2);
        for (i, promise) in sent.iter().enumerate() {
            assert_eq!(promise.promise.sequence, i as u64 + 1);
            assert_eq!(promise.promise.amount, 100 * (i as u64 + 1));
        }

        // Nothing more once stopped
        let count = sent.len();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(dialog.promises.lock().unwrap().len(), count);
    }

    #[tokio::test]
    async fn start_requires_balance() {
        let issuer = SigningPromiseIssuer::new(
            signer(),
            Arc::new(RecordingDialog::default()),
            SessionId::from("s-1"),
            Arc::new(FixedBalance(10)),
            Duration::from_millis(10),
        );

        let err = issuer.start(&proposal(100)).await.unwrap_err();
        assert!(matches!(err, PromiseError::InsufficientBalance { .. }));
        assert!(!issuer.is_running());
    }

    #[tokio::test]
    async fn noop_issuer_tracks_running() {
        let issuer = NoopPromiseIssuer::default();
        issuer.start(&proposal(0)).await.unwrap();
        assert!(issuer.is_running());
        issuer.stop().await.unwrap();
        assert!(!issuer.is_running());
    }
}
