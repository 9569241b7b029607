//! Node assembly from configuration.
//!
//! Every registry the node uses is constructed here and handed down
//! explicitly; nothing is process-global.

use mesh_dialog::{Broker, BrokerDialogCreator};
use shared_utils::config::Config;
use shared_utils::identity::{
    FileIdentityCache, Identity, IdentityChoice, IdentityManager, IdentityResult,
    IdentitySelector, Keystore, MemoryIdentityRegistry, Signer,
};
use shared_utils::market::PaymentRate;
use std::sync::Arc;
use tracing::{info, warn};

use crate::connection::ConnectionManager;
use crate::discovery::MemoryDiscovery;
use crate::location::{IpResolver, LocalIpResolver, LocationResolver, StaticResolver};
use crate::nat::{NatResult, NatSettings, UdpNatPinger};
use crate::promise::{FixedBalance, PromiseSettings};
use crate::service::{
    AddressPolicy, ProviderContext, ServiceOptions, ServiceRegistry, ServiceRunner,
};
use crate::services::engine::{CommandEngine, TunnelEngine};
use crate::services::noop::{NoopConnectionFactory, NoopServiceFactory};
use crate::services::openvpn::{
    GeneratedTlsPrimitives, OpenvpnConnectionFactory, OpenvpnOptions, OpenvpnServiceFactory,
};
use crate::services::wireguard::{WireguardConnectionFactory, WireguardServiceFactory};
use crate::services::{SERVICE_TYPE_NOOP, SERVICE_TYPE_OPENVPN, SERVICE_TYPE_WIREGUARD};

/// Balance assumed for consumers when no ledger is attached.
const DEFAULT_BALANCE: u64 = u64::MAX;

/// Shared collaborators of one node process.
pub struct Node {
    config: Config,
    keystore: Arc<Keystore>,
    identities: Arc<MemoryIdentityRegistry>,
    broker: Broker,
    discovery: Arc<MemoryDiscovery>,
    ips: Arc<dyn IpResolver>,
    locations: Arc<dyn LocationResolver>,
    engine: Arc<dyn TunnelEngine>,
    promises: PromiseSettings,
}

impl Node {
    /// Node resolving its address from the routing table.
    pub fn new(config: Config) -> Self {
        Self::with_resolvers(
            config,
            Arc::new(LocalIpResolver::default()),
            Arc::new(StaticResolver::loopback()),
        )
    }

    pub fn with_resolvers(
        config: Config,
        ips: Arc<dyn IpResolver>,
        locations: Arc<dyn LocationResolver>,
    ) -> Self {
        let engine: Arc<dyn TunnelEngine> = Arc::new(CommandEngine::new(&config.provider.engine));
        let promises =
            PromiseSettings::from_config(&config.promises, Arc::new(FixedBalance(DEFAULT_BALANCE)));
        Self {
            keystore: Arc::new(Keystore::new()),
            identities: Arc::new(MemoryIdentityRegistry::new()),
            broker: Broker::new(),
            discovery: Arc::new(MemoryDiscovery::new()),
            ips,
            locations,
            engine,
            promises,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn discovery(&self) -> &Arc<MemoryDiscovery> {
        &self.discovery
    }

    /// Resolve and unlock an identity, returning it with its signer.
    pub async fn select_identity(
        &self,
        choice: &IdentityChoice,
    ) -> IdentityResult<(Identity, Arc<dyn Signer>)> {
        let selector = IdentitySelector::new(
            self.keystore.clone(),
            self.identities.clone(),
            Arc::new(FileIdentityCache::new(self.config.identity_cache_path())),
        );
        let identity = selector
            .select(choice, &self.config.identity.passphrase)
            .await?;
        let signer = self.keystore.signer(&identity)?;
        Ok((identity, signer))
    }

    fn address_policy(&self) -> AddressPolicy {
        AddressPolicy {
            localnet: self.config.network.localnet,
            policy: self.config.network.server_address_policy,
        }
    }

    /// Service registry holding a factory for every known service type.
    pub fn service_registry(&self) -> ServiceRegistry {
        let registry = ServiceRegistry::new();
        registry.register(
            SERVICE_TYPE_NOOP,
            Arc::new(NoopServiceFactory::new(self.ips.clone(), self.locations.clone())),
        );
        registry.register(
            SERVICE_TYPE_OPENVPN,
            Arc::new(OpenvpnServiceFactory::new(
                OpenvpnOptions::new(&self.config.provider.openvpn, self.address_policy()),
                self.ips.clone(),
                self.locations.clone(),
                Arc::new(GeneratedTlsPrimitives),
                self.engine.clone(),
            )),
        );
        registry.register(
            SERVICE_TYPE_WIREGUARD,
            Arc::new(WireguardServiceFactory::new(
                self.config.provider.wireguard.clone(),
                self.address_policy(),
                self.ips.clone(),
                self.locations.clone(),
                self.engine.clone(),
            )),
        );
        registry
    }

    /// Runner for services provided as `signer`.
    pub fn service_runner(&self, signer: Arc<dyn Signer>) -> ServiceRunner {
        let nat = self
            .config
            .nat
            .enabled
            .then(|| NatSettings::from_config(&self.config.nat));
        let context = ProviderContext {
            broker: self.broker.clone(),
            broker_address: self.config.network.broker_address.clone(),
            signer,
            identities: self.identities.clone(),
            discovery: self.discovery.clone(),
            promises: self.promises.clone(),
            nat,
            ip_resolver: self.ips.clone(),
            dialog_timeout: self.config.consumer.dialog_timeout(),
            refresh_interval: self.config.provider.proposal_refresh_interval(),
        };
        ServiceRunner::new(Arc::new(self.service_registry()), context)
    }

    /// Options for a service instance of `provider_id`.
    pub fn service_options(&self, provider_id: Identity) -> ServiceOptions {
        let mut options = ServiceOptions::new(provider_id);
        options.payment = PaymentRate {
            price_per_interval: self.config.promises.price_per_interval,
            interval_secs: self.config.promises.issue_interval_secs,
        };
        options.nat_traversal = self.config.nat.enabled;
        options
    }

    /// Start every configured service type. Services that fail to start are
    /// logged and skipped.
    pub async fn start_configured(&self, runner: &ServiceRunner, provider_id: &Identity) -> usize {
        let mut started = 0;
        for service_type in &self.config.provider.services {
            match runner
                .start(service_type, self.service_options(provider_id.clone()))
                .await
            {
                Ok(_) => started += 1,
                Err(e) => warn!(service_type = %service_type, "Service not started: {}", e),
            }
        }
        info!(started, configured = self.config.provider.services.len(), "Services started");
        started
    }

    /// Consumer connection manager with every service type registered.
    pub async fn connection_manager(&self) -> NatResult<ConnectionManager> {
        let dialogs = Arc::new(BrokerDialogCreator::new(
            self.broker.clone(),
            self.config.consumer.dialog_timeout(),
        ));
        let mut manager = ConnectionManager::new(
            dialogs,
            self.promises.clone(),
            self.config.consumer.connect_timeout(),
        );

        if self.config.nat.enabled {
            let settings = NatSettings::from_config(&self.config.nat);
            let timeout = settings.timeout;
            let advertise = self.ips.outbound_ip().await.ok();
            let pinger = UdpNatPinger::bind(settings, advertise).await?;
            manager = manager.with_pinger(Arc::new(pinger), timeout);
        }

        manager.register(SERVICE_TYPE_NOOP, Arc::new(NoopConnectionFactory));
        manager.register(
            SERVICE_TYPE_OPENVPN,
            Arc::new(OpenvpnConnectionFactory::new(self.engine.clone())),
        );
        manager.register(
            SERVICE_TYPE_WIREGUARD,
            Arc::new(WireguardConnectionFactory::new(self.engine.clone())),
        );
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn node(dir: &std::path::Path) -> Node {
        let mut config = Config::default();
        config.identity.keystore_dir = dir.to_path_buf();
        config.identity.passphrase = "pass".into();
        config.provider.services = vec!["noop".into()];
        config.nat.enabled = false;
        Node::with_resolvers(
            config,
            Arc::new(StaticResolver::loopback()),
            Arc::new(StaticResolver::loopback()),
        )
    }

    #[tokio::test]
    async fn new_identity_is_registered_and_cached() {
        let dir = tempdir().unwrap();
        let node = node(dir.path());

        let (identity, signer) = node.select_identity(&IdentityChoice::New).await.unwrap();
        assert_eq!(signer.identity(), &identity);
        assert!(node.config().identity_cache_path().exists());

        // Same process: the remembered identity is still in the keystore
        let (again, _) = node.select_identity(&IdentityChoice::Last).await.unwrap();
        assert_eq!(again, identity);
    }

    #[test]
    fn registry_knows_every_service_type() {
        let dir = tempdir().unwrap();
        let node = node(dir.path());
        assert_eq!(
            node.service_registry().types(),
            vec!["noop".to_string(), "openvpn".to_string(), "wireguard".to_string()]
        );
    }

    #[tokio::test]
    async fn configured_services_start_and_stop() {
        let dir = tempdir().unwrap();
        let node = node(dir.path());
        let (identity, signer) = node.select_identity(&IdentityChoice::New).await.unwrap();

        let runner = node.service_runner(signer);
        assert_eq!(node.start_configured(&runner, &identity).await, 1);
        assert_eq!(node.discovery().find(Some("noop")).len(), 1);

        runner.kill_all().await.unwrap();
        assert!(node.discovery().find(None).is_empty());
    }
}
