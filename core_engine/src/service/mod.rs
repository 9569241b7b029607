//! Provider-side service orchestration.
//!
//! A [`ServiceRegistry`] maps service types to factories. Each running
//! service instance is driven by one [`Manager`], and a [`ServiceRunner`]
//! supervises the managers of a node.

mod manager;
mod registry;
mod runner;

use async_trait::async_trait;
use shared_utils::config::ServerAddressPolicy;
use shared_utils::identity::Identity;
use shared_utils::market::{Location, PaymentRate, ServiceProposal};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::discovery::DiscoveryError;
use crate::location::{IpResolver, LocationError, LocationResolver};
use crate::nat::NatError;
use crate::services::engine::EngineError;
use crate::session::ConfigNegotiator;
use mesh_dialog::DialogError;

pub use manager::{Manager, ManagerState, ProviderContext};
pub use registry::ServiceRegistry;
pub use runner::ServiceRunner;

/// Result type for service lifecycle operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Service lifecycle errors. Start failures are reported after rollback.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Unknown service type: {0}")]
    UnknownType(String),

    #[error("Location resolution failed: {0}")]
    Location(#[from] LocationError),

    #[error("Service factory failed: {0}")]
    Factory(String),

    #[error("Dialog error: {0}")]
    Dialog(#[from] DialogError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("NAT error: {0}")]
    Nat(#[from] NatError),

    #[error("Tunnel engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Service process failed: {0}")]
    Process(String),

    #[error("Start cancelled")]
    Cancelled,

    #[error("Service {0} is already running")]
    AlreadyRunning(String),

    #[error("Service {0} is not running")]
    NotRunning(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Provider-side tunnel process of one service instance.
#[async_trait]
pub trait Service: Send + Sync {
    async fn start(&self, provider_id: &Identity) -> ServiceResult<()>;

    /// Resolves once the service has stopped.
    async fn wait(&self) -> ServiceResult<()>;

    async fn stop(&self) -> ServiceResult<()>;

    /// Negotiator handed to the session handler of this instance.
    fn config_negotiator(&self) -> Arc<dyn ConfigNegotiator>;
}

/// Parameters for creating a service instance.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub provider_id: Identity,
    pub payment: PaymentRate,
    /// Advertise NAT hole punching on the proposal
    pub nat_traversal: bool,
}

impl ServiceOptions {
    pub fn new(provider_id: Identity) -> Self {
        Self {
            provider_id,
            payment: PaymentRate {
                price_per_interval: 0,
                interval_secs: 60,
            },
            nat_traversal: false,
        }
    }
}

/// Builds a service instance and the proposal advertising it.
#[async_trait]
pub trait ServiceFactory: Send + Sync {
    async fn create(
        &self,
        options: &ServiceOptions,
    ) -> ServiceResult<(Arc<dyn Service>, ServiceProposal)>;
}

/// Where the provider is, as far as proposals are concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLocation {
    pub public_ip: IpAddr,
    pub outbound_ip: IpAddr,
    pub location: Location,
}

/// Resolve addresses and country.
pub async fn resolve_location(
    ips: &dyn IpResolver,
    locations: &dyn LocationResolver,
) -> ServiceResult<ResolvedLocation> {
    let public_ip = ips.public_ip().await?;
    let outbound_ip = ips.outbound_ip().await?;
    let country = locations.resolve_country(public_ip).await?;
    if country.is_empty() {
        warn!(ip = %public_ip, "Country unknown, proposal will carry no location");
    }
    Ok(ResolvedLocation {
        public_ip,
        outbound_ip,
        location: Location { country },
    })
}

/// How to pick the address consumers connect to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressPolicy {
    /// Node runs in an isolated local network
    pub localnet: bool,
    pub policy: ServerAddressPolicy,
}

/// Address handed to consumers for a listener on `port`.
///
/// When the public and outbound addresses agree there is nothing to choose.
/// Otherwise the policy decides; `Auto` trusts the outbound address only on
/// localnet, where the public one is meaningless.
pub fn select_server_ip(resolved: &ResolvedLocation, port: u16, policy: AddressPolicy) -> IpAddr {
    let (public_ip, outbound_ip) = (resolved.public_ip, resolved.outbound_ip);
    if public_ip == outbound_ip {
        return public_ip;
    }

    let use_outbound = match policy.policy {
        ServerAddressPolicy::Public => false,
        ServerAddressPolicy::Outbound => true,
        ServerAddressPolicy::Auto => policy.localnet,
    };

    if use_outbound {
        warn!(
            public_ip = %public_ip,
            outbound_ip = %outbound_ip,
            "Public IP does not match the local IP, using {} for the service",
            outbound_ip
        );
        outbound_ip
    } else {
        warn!(
            public_ip = %public_ip,
            outbound_ip = %outbound_ip,
            "Public IP does not match the local IP, port forwarding is probably needed: {}:{} -> {}:{}",
            public_ip,
            port,
            outbound_ip,
            port
        );
        public_ip
    }
}

/// Proposal skeleton shared by every service type.
pub fn base_proposal(
    service_type: &str,
    options: &ServiceOptions,
    resolved: &ResolvedLocation,
) -> ServiceProposal {
    let mut proposal = ServiceProposal::new(options.provider_id.address.clone(), service_type);
    proposal.location = resolved.location.clone();
    proposal.payment = options.payment.clone();
    proposal.nat_traversal = options.nat_traversal;
    proposal
}
