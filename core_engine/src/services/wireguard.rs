//! WireGuard-style service.
//!
//! Each session gets its own peer address from the provider's subnet. The
//! consumer sends its public key with the create request; the address is
//! returned to the pool when the session is destroyed.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use curve25519_dalek::montgomery::MontgomeryPoint;
use mesh_dialog::SessionId;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use shared_utils::config::WireguardSettings;
use shared_utils::identity::Identity;
use shared_utils::market::ServiceProposal;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{TunnelEngine, TunnelSpec};
use super::{ServiceConfiguration, SERVICE_TYPE_WIREGUARD};
use crate::connection::{
    ConnectOptions, ConnectionError, ConnectionFactory, ConnectionResult, Statistics,
    TunnelProcess, TunnelState,
};
use crate::location::{IpResolver, LocationResolver};
use crate::service::{
    base_proposal, resolve_location, select_server_ip, AddressPolicy, Service, ServiceError,
    ServiceFactory, ServiceOptions, ServiceResult,
};
use crate::session::{ConfigNegotiator, DestroyCallback, Negotiated, SessionError, SessionResult};

/// Smallest prefix accepted; larger pools are pointless per provider
const MIN_PREFIX: u8 = 16;

/// What the consumer needs to add the provider as its peer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WireguardConfig {
    pub provider_public_key: String,
    pub endpoint: SocketAddr,
    /// Consumer tunnel address with prefix, e.g. `10.182.0.2/24`
    pub consumer_address: String,
    pub gateway: Ipv4Addr,
}

/// Consumer parameters sent with the create request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConsumerParams {
    pub public_key: String,
}

/// X25519 key pair, base64 encoded the way WireGuard tools print keys.
#[derive(Clone)]
pub struct KeyPair {
    private: [u8; 32],
    public: [u8; 32],
}

impl KeyPair {
    /// Random key pair, clamped like `wg genkey` output.
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        OsRng.fill_bytes(&mut private);
        private[0] &= 248;
        private[31] &= 127;
        private[31] |= 64;
        Self::from_private(private)
    }

    /// Key pair for an existing private key.
    pub fn from_private(private: [u8; 32]) -> Self {
        Self {
            private,
            public: MontgomeryPoint::mul_base_clamped(private).to_bytes(),
        }
    }

    pub fn public_key(&self) -> String {
        BASE64.encode(self.public)
    }

    pub fn private_key(&self) -> String {
        BASE64.encode(self.private)
    }
}

fn decode_key(key: &str) -> Option<[u8; 32]> {
    BASE64.decode(key).ok()?.try_into().ok()
}

struct AllocatorState {
    network: Ipv4Addr,
    available: VecDeque<Ipv4Addr>,
}

/// Sequential IPv4 allocator over a CIDR block. The first host address is
/// kept for the provider.
#[derive(Clone)]
pub struct SubnetAllocator {
    inner: Arc<Mutex<AllocatorState>>,
    gateway: Ipv4Addr,
    prefix: u8,
}

fn parse_cidr(cidr: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.trim().parse().ok()?;
    let prefix: u8 = prefix.trim().parse().ok()?;
    (prefix <= 32).then_some((addr, prefix))
}

impl SubnetAllocator {
    /// Create an allocator from a CIDR string (e.g. "10.182.0.0/24").
    pub fn new(cidr: &str) -> ServiceResult<Self> {
        let (addr, prefix) = parse_cidr(cidr)
            .ok_or_else(|| ServiceError::Factory(format!("invalid subnet {cidr}")))?;
        if !(MIN_PREFIX..=30).contains(&prefix) {
            return Err(ServiceError::Factory(format!(
                "subnet {cidr} must have a prefix between /{MIN_PREFIX} and /30"
            )));
        }

        let mask = u32::MAX << (32 - prefix);
        let network = u32::from(addr) & mask;
        let broadcast = network | !mask;
        let gateway = Ipv4Addr::from(network + 1);
        let available: VecDeque<Ipv4Addr> = (network + 2..broadcast).map(Ipv4Addr::from).collect();

        if available.is_empty() {
            return Err(ServiceError::Factory(format!(
                "subnet {cidr} has no room for consumers"
            )));
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(AllocatorState {
                network: Ipv4Addr::from(network),
                available,
            })),
            gateway,
            prefix,
        })
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix
    }

    pub fn available(&self) -> usize {
        self.lock().available.len()
    }

    fn lock(&self) -> MutexGuard<'_, AllocatorState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns None once the pool is exhausted.
    pub fn allocate(&self) -> Option<IpLease> {
        self.lock().available.pop_front().map(|addr| IpLease {
            allocator: self.clone(),
            addr,
        })
    }

    fn release(&self, addr: Ipv4Addr) {
        let mask = u32::MAX << (32 - self.prefix);
        let mut state = self.lock();
        if u32::from(addr) & mask == u32::from(state.network) {
            state.available.push_back(addr);
        } else {
            warn!(%addr, "Attempted to release IP outside of pool");
        }
    }
}

/// Address returned to the allocator when dropped.
pub struct IpLease {
    allocator: SubnetAllocator,
    addr: Ipv4Addr,
}

impl IpLease {
    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }
}

impl Drop for IpLease {
    fn drop(&mut self) {
        self.allocator.release(self.addr);
    }
}

/// A consumer admitted to the provider interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub public_key: String,
    pub address: Ipv4Addr,
}

type Peers = Arc<Mutex<HashMap<SessionId, Peer>>>;

fn lock_peers(peers: &Peers) -> MutexGuard<'_, HashMap<SessionId, Peer>> {
    peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct WireguardNegotiator {
    allocator: SubnetAllocator,
    public_key: String,
    endpoint: SocketAddr,
    peers: Peers,
}

impl ConfigNegotiator for WireguardNegotiator {
    fn provide_config(&self, session_id: &SessionId, consumer_config: &[u8]) -> SessionResult<Negotiated> {
        let params: ConsumerParams = serde_json::from_slice(consumer_config)
            .map_err(|e| SessionError::ConfigNegotiationFailed(format!("bad consumer config: {}", e)))?;
        if decode_key(&params.public_key).is_none() {
            return Err(SessionError::ConfigNegotiationFailed(
                "consumer public key is not a base64 X25519 key".into(),
            ));
        }

        let lease = self.allocator.allocate().ok_or_else(|| {
            SessionError::ConfigNegotiationFailed("peer address pool exhausted".into())
        })?;
        let address = lease.addr();

        lock_peers(&self.peers).insert(
            session_id.clone(),
            Peer {
                public_key: params.public_key,
                address,
            },
        );
        debug!(session_id = %session_id, %address, "WireGuard peer admitted");

        let config = WireguardConfig {
            provider_public_key: self.public_key.clone(),
            endpoint: self.endpoint,
            consumer_address: format!("{}/{}", address, self.allocator.prefix_len()),
            gateway: self.allocator.gateway(),
        };

        let peers = Arc::clone(&self.peers);
        let session_id = session_id.clone();
        let on_destroy: DestroyCallback = Box::new(move || {
            lock_peers(&peers).remove(&session_id);
            drop(lease);
            debug!(session_id = %session_id, "WireGuard peer removed");
        });

        Ok((ServiceConfiguration::Wireguard(config), Some(on_destroy)))
    }
}

pub struct WireguardService {
    engine: Arc<dyn TunnelEngine>,
    keys: KeyPair,
    listen_port: u16,
    endpoint: SocketAddr,
    allocator: SubnetAllocator,
    peers: Peers,
    stopped: CancellationToken,
}

impl WireguardService {
    fn tunnel_spec(&self) -> TunnelSpec {
        TunnelSpec::new("wg-provider")
            .param("listen_port", self.listen_port)
            .param("private_key", self.keys.private_key())
            .param(
                "address",
                format!("{}/{}", self.allocator.gateway(), self.allocator.prefix_len()),
            )
    }
}

#[async_trait]
impl Service for WireguardService {
    async fn start(&self, provider_id: &Identity) -> ServiceResult<()> {
        self.engine.up(&self.tunnel_spec()).await?;
        info!(
            provider = %provider_id,
            endpoint = %self.endpoint,
            public_key = %self.keys.public_key(),
            "WireGuard service started"
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
        info!(peers = lock_peers(&self.peers).len(), "WireGuard service stopped");
        Ok(())
    }

    fn config_negotiator(&self) -> Arc<dyn ConfigNegotiator> {
        Arc::new(WireguardNegotiator {
            allocator: self.allocator.clone(),
            public_key: self.keys.public_key(),
            endpoint: self.endpoint,
            peers: Arc::clone(&self.peers),
        })
    }
}

pub struct WireguardServiceFactory {
    settings: WireguardSettings,
    address_policy: AddressPolicy,
    ips: Arc<dyn IpResolver>,
    locations: Arc<dyn LocationResolver>,
    engine: Arc<dyn TunnelEngine>,
}

impl WireguardServiceFactory {
    pub fn new(
        settings: WireguardSettings,
        address_policy: AddressPolicy,
        ips: Arc<dyn IpResolver>,
        locations: Arc<dyn LocationResolver>,
        engine: Arc<dyn TunnelEngine>,
    ) -> Self {
        Self {
            settings,
            address_policy,
            ips,
            locations,
            engine,
        }
    }
}

#[async_trait]
impl ServiceFactory for WireguardServiceFactory {
    async fn create(
        &self,
        options: &ServiceOptions,
    ) -> ServiceResult<(Arc<dyn Service>, ServiceProposal)> {
        let allocator = SubnetAllocator::new(&self.settings.subnet)?;
        let resolved = resolve_location(self.ips.as_ref(), self.locations.as_ref()).await?;
        let server_ip = select_server_ip(&resolved, self.settings.listen_port, self.address_policy);
        let endpoint = SocketAddr::new(server_ip, self.settings.listen_port);

        let mut proposal = base_proposal(SERVICE_TYPE_WIREGUARD, options, &resolved);
        proposal.service_definition = serde_json::json!({ "listen_port": self.settings.listen_port });

        let service = WireguardService {
            engine: Arc::clone(&self.engine),
            keys: KeyPair::generate(),
            listen_port: self.settings.listen_port,
            endpoint,
            allocator,
            peers: Arc::new(Mutex::new(HashMap::new())),
            stopped: CancellationToken::new(),
        };
        Ok((Arc::new(service), proposal))
    }
}

/// Consumer side WireGuard interface.
pub struct WireguardConnection {
    keys: KeyPair,
    engine: Arc<dyn TunnelEngine>,
    state: watch::Sender<TunnelState>,
    statistics: watch::Sender<Statistics>,
    spec: Mutex<Option<TunnelSpec>>,
    stopped: CancellationToken,
}

#[async_trait]
impl TunnelProcess for WireguardConnection {
    fn consumer_config(&self) -> ConnectionResult<Vec<u8>> {
        serde_json::to_vec(&ConsumerParams {
            public_key: self.keys.public_key(),
        })
        .map_err(|e| ConnectionError::Config(e.to_string()))
    }

    async fn start(&self, options: ConnectOptions) -> ConnectionResult<()> {
        let config = match ServiceConfiguration::from_bytes(&options.config) {
            Ok(ServiceConfiguration::Wireguard(config)) => config,
            Ok(other) => {
                return Err(ConnectionError::Config(format!(
                    "expected wireguard configuration, got {}",
                    other.service_type()
                )));
            }
            Err(e) => return Err(ConnectionError::Config(e.to_string())),
        };
        if decode_key(&config.provider_public_key).is_none() {
            return Err(ConnectionError::Config("provider public key is malformed".into()));
        }

        self.state.send_replace(TunnelState::Connecting);
        let mut spec = TunnelSpec::new(format!("wg-{}", options.session_id))
            .param("private_key", self.keys.private_key())
            .param("address", &config.consumer_address)
            .param("peer_public_key", &config.provider_public_key)
            .param("endpoint", config.endpoint)
            .param("gateway", config.gateway);
        if let Some(peer) = options.punched_peer {
            spec = spec.param("punched_peer", peer);
        }
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

pub struct WireguardConnectionFactory {
    engine: Arc<dyn TunnelEngine>,
}

impl WireguardConnectionFactory {
    pub fn new(engine: Arc<dyn TunnelEngine>) -> Self {
        Self { engine }
    }
}

impl ConnectionFactory for WireguardConnectionFactory {
    fn create(
        &self,
        state: watch::Sender<TunnelState>,
        statistics: watch::Sender<Statistics>,
        _ip_resolver: Arc<dyn IpResolver>,
    ) -> ConnectionResult<Arc<dyn TunnelProcess>> {
        Ok(Arc::new(WireguardConnection {
            keys: KeyPair::generate(),
            engine: Arc::clone(&self.engine),
            state,
            statistics,
            spec: Mutex::new(None),
            stopped: CancellationToken::new(),
        }))
    }
}
