//! IP and location resolution used when building proposals.

use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::net::UdpSocket;

/// Result type for resolver operations.
pub type LocationResult<T> = Result<T, LocationError>;

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("IP resolution failed: {0}")]
    Ip(String),

    #[error("Location lookup failed: {0}")]
    Lookup(String),
}

/// Resolves the node's addresses.
#[async_trait]
pub trait IpResolver: Send + Sync {
    /// Address the rest of the internet sees.
    async fn public_ip(&self) -> LocationResult<IpAddr>;

    /// Address of the interface used for outbound traffic.
    async fn outbound_ip(&self) -> LocationResult<IpAddr>;
}

/// Maps an address to a country code.
#[async_trait]
pub trait LocationResolver: Send + Sync {
    async fn resolve_country(&self, ip: IpAddr) -> LocationResult<String>;
}

/// Fixed answers, for tests and for nodes with known addresses.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    pub public: IpAddr,
    pub outbound: IpAddr,
    pub country: String,
}

impl StaticResolver {
    pub fn new(public: IpAddr, outbound: IpAddr, country: impl Into<String>) -> Self {
        Self {
            public,
            outbound,
            country: country.into(),
        }
    }

    /// Loopback everywhere, unknown country.
    pub fn loopback() -> Self {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self::new(ip, ip, "")
    }
}

#[async_trait]
impl IpResolver for StaticResolver {
    async fn public_ip(&self) -> LocationResult<IpAddr> {
        Ok(self.public)
    }

    async fn outbound_ip(&self) -> LocationResult<IpAddr> {
        Ok(self.outbound)
    }
}

#[async_trait]
impl LocationResolver for StaticResolver {
    async fn resolve_country(&self, _ip: IpAddr) -> LocationResult<String> {
        Ok(self.country.clone())
    }
}

/// Finds the outbound address from the local routing table.
///
/// Without an external echo service the public address is assumed to equal
/// the outbound one.
#[derive(Debug, Clone)]
pub struct LocalIpResolver {
    route_target: SocketAddr,
}

impl Default for LocalIpResolver {
    fn default() -> Self {
        Self {
            route_target: SocketAddr::from(([8, 8, 8, 8], 53)),
        }
    }
}

#[async_trait]
impl IpResolver for LocalIpResolver {
    async fn public_ip(&self) -> LocationResult<IpAddr> {
        self.outbound_ip().await
    }

    async fn outbound_ip(&self) -> LocationResult<IpAddr> {
        // Connecting a UDP socket sends nothing; it only selects a route
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| LocationError::Ip(e.to_string()))?;
        socket
            .connect(self.route_target)
            .await
            .map_err(|e| LocationError::Ip(e.to_string()))?;
        socket
            .local_addr()
            .map(|addr| addr.ip())
            .map_err(|e| LocationError::Ip(e.to_string()))
    }
}
