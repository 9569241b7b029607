use mesh_dialog::{SessionId, SignedPromise};
use shared_utils::identity::{self, Identity};
use shared_utils::market::ServiceProposal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{PromiseError, PromiseProcessor, PromiseResult};

/// Processor used when promise checking is disabled; accepts everything.
#[derive(Debug, Default)]
pub struct NoopPromiseProcessor {
    running: AtomicBool,
}

impl PromiseProcessor for NoopPromiseProcessor {
    fn start(&self, _proposal: &ServiceProposal) -> PromiseResult<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> PromiseResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn process(&self, _promise: &SignedPromise) -> PromiseResult<()> {
        Ok(())
    }
}

/// Counters of processed promises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromiseStats {
    pub accepted: u64,
    pub rejected: u64,
    pub last_sequence: u64,
    /// Highest cumulative amount accepted
    pub last_amount: u64,
}

#[derive(Default)]
struct State {
    running: bool,
    stats: PromiseStats,
}

/// Checks signature and monotonic progression of a session's promises.
pub struct ValidatingPromiseProcessor {
    session_id: SessionId,
    consumer: Identity,
    state: Mutex<State>,
}

impl ValidatingPromiseProcessor {
    pub fn new(session_id: SessionId, consumer: Identity) -> Self {
        Self {
            session_id,
            consumer,
            state: Mutex::new(State::default()),
        }
    }

    pub fn stats(&self) -> PromiseStats {
        self.lock().stats
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn validate(&self, stats: &PromiseStats, signed: &SignedPromise) -> PromiseResult<()> {
        let promise = &signed.promise;
        if promise.session_id != self.session_id {
            return Err(PromiseError::WrongSession(promise.session_id.clone()));
        }
        if promise.consumer != self.consumer {
            return Err(PromiseError::InvalidSignature(format!(
                "issued by {} instead of {}",
                promise.consumer, self.consumer
            )));
        }
        identity::verify(&self.consumer, &promise.signing_bytes(), &signed.signature)
            .map_err(|e| PromiseError::InvalidSignature(e.to_string()))?;

        if promise.sequence <= stats.last_sequence || promise.amount < stats.last_amount {
            return Err(PromiseError::Regression {
                last_sequence: stats.last_sequence,
                sequence: promise.sequence,
            });
        }
        Ok(())
    }
}

impl PromiseProcessor for ValidatingPromiseProcessor {
    fn start(&self, proposal: &ServiceProposal) -> PromiseResult<()> {
        let mut state = self.lock();
        if state.running {
            return Err(PromiseError::AlreadyStarted);
        }
        state.running = true;
        info!(
            session_id = %self.session_id,
            price = proposal.payment.price_per_interval,
            "Promise processor started"
        );
        Ok(())
    }

    fn stop(&self) -> PromiseResult<()> {
        let mut state = self.lock();
        if state.running {
            state.running = false;
            debug!(session_id = %self.session_id, accepted = state.stats.accepted, "Promise processor stopped");
        }
        Ok(())
    }

    fn process(&self, signed: &SignedPromise) -> PromiseResult<()> {
        let mut state = self.lock();
        if !state.running {
            return Err(PromiseError::NotStarted);
        }

        match self.validate(&state.stats, signed) {
            Ok(()) => {
                state.stats.accepted += 1;
                state.stats.last_sequence = signed.promise.sequence;
                state.stats.last_amount = signed.promise.amount;
                debug!(
                    session_id = %self.session_id,
                    sequence = signed.promise.sequence,
                    amount = signed.promise.amount,
                    "Promise accepted"
                );
                Ok(())
            }
            Err(e) => {
                state.stats.rejected += 1;
                warn!(session_id = %self.session_id, "Promise rejected: {}", e);
                Err(e)
            }
        }
    }
}
