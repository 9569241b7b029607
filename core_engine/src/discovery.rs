//! Proposal discovery.

use async_trait::async_trait;
use shared_utils::market::ServiceProposal;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Discovery unavailable: {0}")]
    Unavailable(String),
}

/// Where providers advertise their proposals.
#[async_trait]
pub trait ProposalRegistry: Send + Sync {
    /// Publish or refresh a proposal.
    async fn publish(&self, proposal: &ServiceProposal) -> DiscoveryResult<()>;

    async fn unpublish(&self, proposal: &ServiceProposal) -> DiscoveryResult<()>;
}

type ProposalKey = (String, u64);

fn key(proposal: &ServiceProposal) -> ProposalKey {
    (proposal.provider_id.clone(), proposal.id)
}

struct Listing {
    proposal: ServiceProposal,
    refreshed_at: Instant,
}

/// Process-local discovery.
#[derive(Default)]
pub struct MemoryDiscovery {
    listings: Mutex<HashMap<ProposalKey, Listing>>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Proposals currently listed, optionally filtered by service type.
    pub fn find(&self, service_type: Option<&str>) -> Vec<ServiceProposal> {
        let listings = self
            .listings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut found: Vec<_> = listings
            .values()
            .filter(|l| service_type.is_none_or(|t| l.proposal.service_type == t))
            .map(|l| l.proposal.clone())
            .collect();
        found.sort_by(|a, b| (&a.provider_id, a.id).cmp(&(&b.provider_id, b.id)));
        found
    }

    /// When the proposal was last published, if it is listed.
    pub fn refreshed_at(&self, proposal: &ServiceProposal) -> Option<Instant> {
        self.listings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key(proposal))
            .map(|l| l.refreshed_at)
    }
}

#[async_trait]
impl ProposalRegistry for MemoryDiscovery {
    async fn publish(&self, proposal: &ServiceProposal) -> DiscoveryResult<()> {
        self.listings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                key(proposal),
                Listing {
                    proposal: proposal.clone(),
                    refreshed_at: Instant::now(),
                },
            );
        debug!(
            provider = %proposal.provider_id,
            service_type = %proposal.service_type,
            proposal_id = proposal.id,
            "Proposal published"
        );
        Ok(())
    }

    async fn unpublish(&self, proposal: &ServiceProposal) -> DiscoveryResult<()> {
        self.listings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&key(proposal));
        debug!(
            provider = %proposal.provider_id,
            proposal_id = proposal.id,
            "Proposal unpublished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_find_unpublish() {
        let discovery = MemoryDiscovery::new();
        let mut noop = ServiceProposal::new("0xp", "noop");
        noop.id = 1;
        let mut wg = ServiceProposal::new("0xp", "wireguard");
        wg.id = 2;

        discovery.publish(&noop).await.unwrap();
        discovery.publish(&wg).await.unwrap();
        assert_eq!(discovery.find(None).len(), 2);
        assert_eq!(discovery.find(Some("wireguard")), vec![wg.clone()]);

        discovery.unpublish(&wg).await.unwrap();
        assert!(discovery.find(Some("wireguard")).is_empty());
        assert!(discovery.refreshed_at(&noop).is_some());
    }
}
