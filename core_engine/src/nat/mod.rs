//! NAT hole punching.
//!
//! Each side publishes its [`PingTarget`] to the other, through the session
//! create exchange or a `PingTarget` dialog request, and then both punch at
//! the counterpart until a reciprocal ping arrives or the timeout expires.

mod udp;

use async_trait::async_trait;
use mesh_dialog::{PingTarget, SessionId};
use shared_utils::config::NatConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

pub use udp::UdpNatPinger;

/// Result type for NAT traversal.
pub type NatResult<T> = Result<T, NatError>;

#[derive(Debug, Error)]
pub enum NatError {
    #[error("NAT traversal failed: {0}")]
    NatTraversalFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ping codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Punch timing.
#[derive(Debug, Clone)]
pub struct NatSettings {
    pub bind_address: String,
    /// Overall bound on one punch, including waiting for the peer
    pub timeout: Duration,
    pub max_attempts: u32,
    /// Delay after the first ping; doubles after every attempt
    pub initial_spacing: Duration,
}

impl NatSettings {
    pub fn from_config(config: &NatConfig) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            timeout: config.timeout(),
            max_attempts: config.max_attempts,
            initial_spacing: config.initial_spacing(),
        }
    }
}

impl Default for NatSettings {
    fn default() -> Self {
        Self::from_config(&NatConfig::default())
    }
}

/// Opens a direct path to a peer.
#[async_trait]
pub trait NatPinger: Send + Sync {
    /// Where this side can be punched, if it listens at all.
    fn local_target(&self) -> Option<PingTarget>;

    /// Ping `target` until the peer answers. Returns the address the
    /// peer's pings came from.
    async fn punch(&self, session_id: &SessionId, target: PingTarget) -> NatResult<SocketAddr>;
}

/// Rendezvous for targets that arrive separately from the request that
/// needs them.
pub struct TargetExchange {
    targets: watch::Sender<HashMap<SessionId, PingTarget>>,
}

impl Default for TargetExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetExchange {
    pub fn new() -> Self {
        let (targets, _) = watch::channel(HashMap::new());
        Self { targets }
    }

    /// Record the counterpart's target for `session_id`.
    pub fn publish(&self, session_id: SessionId, target: PingTarget) {
        debug!(session_id = %session_id, target = %target.address, "Ping target published");
        self.targets.send_modify(|targets| {
            targets.insert(session_id, target);
        });
    }

    /// Wait for the counterpart's target.
    pub async fn wait(&self, session_id: &SessionId, timeout: Duration) -> NatResult<PingTarget> {
        let mut rx = self.targets.subscribe();
        let found = tokio::time::timeout(timeout, async {
            rx.wait_for(|targets| targets.contains_key(session_id))
                .await
                .ok()
                .and_then(|targets| targets.get(session_id).copied())
        })
        .await;

        match found {
            Ok(Some(target)) => Ok(target),
            Ok(None) => Err(NatError::NatTraversalFailed("target exchange closed".into())),
            Err(_) => Err(NatError::NatTraversalFailed(format!(
                "no ping target for session {} within {:?}",
                session_id, timeout
            ))),
        }
    }

    /// Forget the target for a finished session.
    pub fn remove(&self, session_id: &SessionId) {
        self.targets.send_if_modified(|targets| targets.remove(session_id).is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn target(port: u16) -> PingTarget {
        PingTarget {
            address: SocketAddr::from(([127, 0, 0, 1], port)),
        }
    }

    #[tokio::test]
    async fn wait_returns_target_published_later() {
        let exchange = Arc::new(TargetExchange::new());
        let publisher = exchange.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(SessionId::from("s-1"), target(4000));
        });

        let found = exchange
            .wait(&SessionId::from("s-1"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(found, target(4000));
    }

    #[tokio::test]
    async fn wait_times_out_without_counterpart() {
        let exchange = TargetExchange::new();
        exchange.publish(SessionId::from("other"), target(4000));

        let err = exchange
            .wait(&SessionId::from("s-1"), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, NatError::NatTraversalFailed(_)));
    }
}
