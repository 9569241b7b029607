//! OpenVPN-style service.
//!
//! The provider generates a CA certificate and a static TLS key once per
//! service instance and hands both to every consumer together with the
//! server address. The OpenVPN daemon itself is run by the tunnel engine.

use async_trait::async_trait;
use mesh_dialog::SessionId;
use rand::RngCore;
use rand::rngs::OsRng;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa};
use serde::{Deserialize, Serialize};
use shared_utils::config::OpenvpnSettings;
use shared_utils::identity::Identity;
use shared_utils::market::ServiceProposal;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::engine::{TunnelEngine, TunnelSpec};
use super::{ServiceConfiguration, SERVICE_TYPE_OPENVPN};
use crate::connection::{
    ConnectOptions, ConnectionError, ConnectionFactory, ConnectionResult, Statistics,
    TunnelProcess, TunnelState,
};
use crate::location::{IpResolver, LocationResolver};
use crate::service::{
    base_proposal, resolve_location, select_server_ip, AddressPolicy, Service, ServiceError,
    ServiceFactory, ServiceOptions, ServiceResult,
};
use crate::session::{ConfigNegotiator, Negotiated, SessionResult};

/// Everything a consumer needs to reach the OpenVPN server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VpnConfig {
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub remote_protocol: String,
    pub tls_preshared_key: String,
    pub ca_certificate: String,
}

/// Listener settings of the OpenVPN server.
#[derive(Debug, Clone)]
pub struct OpenvpnOptions {
    pub port: u16,
    pub protocol: String,
    pub address_policy: AddressPolicy,
}

impl OpenvpnOptions {
    pub fn new(settings: &OpenvpnSettings, address_policy: AddressPolicy) -> Self {
        Self {
            port: settings.port,
            protocol: settings.protocol.clone(),
            address_policy,
        }
    }
}

/// PEM encoded TLS material of one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPrimitives {
    pub ca_certificate: String,
    pub tls_preshared_key: String,
}

pub trait TlsPrimitivesSource: Send + Sync {
    fn primitives(&self, country: &str, provider_id: &Identity) -> ServiceResult<TlsPrimitives>;
}

/// Fresh self-signed CA and random static key.
pub struct GeneratedTlsPrimitives;

const STATIC_KEY_LEN: usize = 256;

fn static_key_pem() -> String {
    let mut key = [0u8; STATIC_KEY_LEN];
    OsRng.fill_bytes(&mut key);

    let mut pem = String::from("-----BEGIN OpenVPN Static key V1-----\n");
    for line in key.chunks(16) {
        pem.push_str(&line.iter().map(|b| format!("{:02x}", b)).collect::<String>());
        pem.push('\n');
    }
    pem.push_str("-----END OpenVPN Static key V1-----\n");
    pem
}

impl TlsPrimitivesSource for GeneratedTlsPrimitives {
    fn primitives(&self, country: &str, provider_id: &Identity) -> ServiceResult<TlsPrimitives> {
        let mut params = CertificateParams::new(vec![provider_id.address.clone()]);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, provider_id.address.as_str());
        params
            .distinguished_name
            .push(DnType::OrganizationName, "MeshTunnel node operator");
        if !country.is_empty() {
            params.distinguished_name.push(DnType::CountryName, country);
        }

        let ca = Certificate::from_params(params)
            .map_err(|e| ServiceError::Factory(format!("Failed to generate CA: {}", e)))?;
        let ca_certificate = ca
            .serialize_pem()
            .map_err(|e| ServiceError::Factory(format!("Failed to serialize CA: {}", e)))?;

        Ok(TlsPrimitives {
            ca_certificate,
            tls_preshared_key: static_key_pem(),
        })
    }
}

/// Hands out the same server config to every session.
pub struct OpenvpnNegotiator {
    config: VpnConfig,
}

impl ConfigNegotiator for OpenvpnNegotiator {
    fn provide_config(&self, session_id: &SessionId, _consumer_config: &[u8]) -> SessionResult<Negotiated> {
        debug!(session_id = %session_id, remote = %self.config.remote_ip, "OpenVPN config provided");
        Ok((ServiceConfiguration::Openvpn(self.config.clone()), None))
    }
}

pub struct OpenvpnService {
    engine: Arc<dyn TunnelEngine>,
    config: VpnConfig,
    stopped: CancellationToken,
}

impl OpenvpnService {
    fn tunnel_spec(&self) -> TunnelSpec {
        TunnelSpec::new("openvpn-server")
            .param("port", self.config.remote_port)
            .param("protocol", &self.config.remote_protocol)
            .param("ca_certificate", &self.config.ca_certificate)
            .param("tls_preshared_key", &self.config.tls_preshared_key)
    }
}

#[async_trait]
impl Service for OpenvpnService {
    async fn start(&self, provider_id: &Identity) -> ServiceResult<()> {
        self.engine.up(&self.tunnel_spec()).await?;
        info!(
            provider = %provider_id,
            port = self.config.remote_port,
            protocol = %self.config.remote_protocol,
            "OpenVPN service started"
        );
        Ok(())
    }

    async fn wait(&self) -> ServiceResult<()> {
        self.stopped.cancelled().await;
        Ok(())
    }

    async fn stop(&self) -> ServiceResult<()> {
        if self.stopped.is_cancelled() {
            return Ok(());
        }
        let result = self.engine.down(&self.tunnel_spec()).await;
        self.stopped.cancel();
        result?;
        info!("OpenVPN service stopped");
        Ok(())
    }

    fn config_negotiator(&self) -> Arc<dyn ConfigNegotiator> {
        Arc::new(OpenvpnNegotiator {
            config: self.config.clone(),
        })
    }
}

pub struct OpenvpnServiceFactory {
    options: OpenvpnOptions,
    ips: Arc<dyn IpResolver>,
    locations: Arc<dyn LocationResolver>,
    tls: Arc<dyn TlsPrimitivesSource>,
    engine: Arc<dyn TunnelEngine>,
}

impl OpenvpnServiceFactory {
    pub fn new(
        options: OpenvpnOptions,
        ips: Arc<dyn IpResolver>,
        locations: Arc<dyn LocationResolver>,
        tls: Arc<dyn TlsPrimitivesSource>,
        engine: Arc<dyn TunnelEngine>,
    ) -> Self {
        Self {
            options,
            ips,
            locations,
            tls,
            engine,
        }
    }
}

#[async_trait]
impl ServiceFactory for OpenvpnServiceFactory {
    async fn create(
        &self,
        options: &ServiceOptions,
    ) -> ServiceResult<(Arc<dyn Service>, ServiceProposal)> {
        let resolved = resolve_location(self.ips.as_ref(), self.locations.as_ref()).await?;
        let primitives = self
            .tls
            .primitives(&resolved.location.country, &options.provider_id)?;
        let remote_ip = select_server_ip(&resolved, self.options.port, self.options.address_policy);

        let mut proposal = base_proposal(SERVICE_TYPE_OPENVPN, options, &resolved);
        proposal.service_definition = serde_json::json!({
            "protocol": self.options.protocol,
            "port": self.options.port,
        });

        let service = OpenvpnService {
            engine: Arc::clone(&self.engine),
            config: VpnConfig {
                remote_ip,
                remote_port: self.options.port,
                remote_protocol: self.options.protocol.clone(),
                tls_preshared_key: primitives.tls_preshared_key,
                ca_certificate: primitives.ca_certificate,
            },
            stopped: CancellationToken::new(),
        };
        Ok((Arc::new(service), proposal))
    }
}

/// Consumer side OpenVPN client.
pub struct OpenvpnConnection {
    engine: Arc<dyn TunnelEngine>,
    state: watch::Sender<TunnelState>,
    statistics: watch::Sender<Statistics>,
    spec: Mutex<Option<TunnelSpec>>,
    stopped: CancellationToken,
}

#[async_trait]
impl TunnelProcess for OpenvpnConnection {
    fn consumer_config(&self) -> ConnectionResult<Vec<u8>> {
        // The server config does not depend on the consumer
        Ok(Vec::new())
    }

    async fn start(&self, options: ConnectOptions) -> ConnectionResult<()> {
        let config = match ServiceConfiguration::from_bytes(&options.config) {
            Ok(ServiceConfiguration::Openvpn(config)) => config,
            Ok(other) => {
                return Err(ConnectionError::Config(format!(
                    "expected openvpn configuration, got {}",
                    other.service_type()
                )));
            }
            Err(e) => return Err(ConnectionError::Config(e.to_string())),
        };

        self.state.send_replace(TunnelState::Connecting);
        let spec = TunnelSpec::new(format!("openvpn-{}", options.session_id))
            .param("remote_ip", config.remote_ip)
            .param("remote_port", config.remote_port)
            .param("remote_protocol", &config.remote_protocol)
            .param("ca_certificate", &config.ca_certificate)
            .param("tls_preshared_key", &config.tls_preshared_key);
        self.engine.up(&spec).await?;
        *self.spec.lock().unwrap_or_else(|p| p.into_inner()) = Some(spec);

        self.statistics.send_replace(Statistics {
            started_at: Some(SystemTime::now()),
            ..Statistics::default()
        });
        self.state.send_replace(TunnelState::Connected);
        Ok(())
    }

    async fn wait(&self) -> ConnectionResult<()> {
        self.stopped.cancelled().await;
        Ok(())
    }

    async fn stop(&self) -> ConnectionResult<()> {
        let spec = self.spec.lock().unwrap_or_else(|p| p.into_inner()).take();
        let result = match spec {
            Some(spec) => self.engine.down(&spec).await,
            None => Ok(()),
        };
        self.stopped.cancel();
        self.state.send_replace(TunnelState::Disconnected);
        result.map_err(ConnectionError::from)
    }
}

pub struct OpenvpnConnectionFactory {
    engine: Arc<dyn TunnelEngine>,
}

impl OpenvpnConnectionFactory {
    pub fn new(engine: Arc<dyn TunnelEngine>) -> Self {
        Self { engine }
    }
}

impl ConnectionFactory for OpenvpnConnectionFactory {
    fn create(
        &self,
        state: watch::Sender<TunnelState>,
        statistics: watch::Sender<Statistics>,
        _ip_resolver: Arc<dyn IpResolver>,
    ) -> ConnectionResult<Arc<dyn TunnelProcess>> {
        Ok(Arc::new(OpenvpnConnection {
            engine: Arc::clone(&self.engine),
            state,
            statistics,
            spec: Mutex::new(None),
            stopped: CancellationToken::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::StaticResolver;
    use crate::services::engine::CommandEngine;

    fn options(localnet: bool) -> OpenvpnOptions {
        OpenvpnOptions {
            port: 1194,
            protocol: "udp".into(),
            address_policy: AddressPolicy {
                localnet,
                ..AddressPolicy::default()
            },
        }
    }

    #[test]
    fn generated_primitives_are_pem() {
        let primitives = GeneratedTlsPrimitives
            .primitives("LT", &Identity::from_address("0xprovider"))
            .unwrap();

        assert!(primitives.ca_certificate.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(primitives.tls_preshared_key.starts_with("-----BEGIN OpenVPN Static key V1-----"));
        // 16 lines of 16 bytes
        assert_eq!(primitives.tls_preshared_key.lines().count(), 18);
    }

    #[tokio::test]
    async fn negotiated_config_carries_server_details() {
        let resolver = Arc::new(StaticResolver::new(
            "203.0.113.1".parse().unwrap(),
            "192.168.1.10".parse().unwrap(),
            "LT",
        ));
        let factory = OpenvpnServiceFactory::new(
            options(true),
            resolver.clone(),
            resolver,
            Arc::new(GeneratedTlsPrimitives),
            Arc::new(CommandEngine::default()),
        );

        let (service, proposal) = factory
            .create(&ServiceOptions::new(Identity::from_address("0xprovider")))
            .await
            .unwrap();
        assert_eq!(proposal.service_type, "openvpn");
        assert_eq!(proposal.service_definition["port"], 1194);

        let (config, on_destroy) = service
            .config_negotiator()
            .provide_config(&SessionId::from("s-1"), b"")
            .unwrap();
        assert!(on_destroy.is_none());
        match config {
            ServiceConfiguration::Openvpn(vpn) => {
                assert_eq!(vpn.remote_ip, "192.168.1.10".parse::<IpAddr>().unwrap());
                assert_eq!(vpn.remote_port, 1194);
                assert!(vpn.ca_certificate.contains("CERTIFICATE"));
            }
            other => panic!("unexpected config {:?}", other),
        }
    }

    #[tokio::test]
    async fn connection_rejects_foreign_config() {
        let (state_tx, state_rx) = watch::channel(TunnelState::Idle);
        let (stats_tx, _stats_rx) = watch::channel(Statistics::default());
        let connection = OpenvpnConnectionFactory::new(Arc::new(CommandEngine::default()))
            .create(state_tx, stats_tx, Arc::new(StaticResolver::loopback()))
            .unwrap();

        let err = connection
            .start(ConnectOptions {
                session_id: SessionId::from("s-1"),
                provider_id: Identity::from_address("0xp"),
                config: ServiceConfiguration::Noop.to_bytes().unwrap(),
                punched_peer: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Config(_)));
        assert_eq!(*state_rx.borrow(), TunnelState::Idle);
    }
}
