//! Service without a data plane, used for testing sessions end to end.

use async_trait::async_trait;
use mesh_dialog::SessionId;
use shared_utils::identity::Identity;
use shared_utils::market::ServiceProposal;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ServiceConfiguration, SERVICE_TYPE_NOOP};
use crate::connection::{
    ConnectOptions, ConnectionError, ConnectionFactory, ConnectionResult, Statistics,
    TunnelProcess, TunnelState,
};
use crate::location::{IpResolver, LocationResolver};
use crate::service::{
    base_proposal, resolve_location, Service, ServiceFactory, ServiceOptions, ServiceResult,
};
use crate::session::{ConfigNegotiator, Negotiated, SessionResult};

pub struct NoopNegotiator;

impl ConfigNegotiator for NoopNegotiator {
    fn provide_config(&self, session_id: &SessionId, _consumer_config: &[u8]) -> SessionResult<Negotiated> {
        debug!(session_id = %session_id, "Noop config provided");
        Ok((ServiceConfiguration::Noop, None))
    }
}

#[derive(Default)]
pub struct NoopService {
    stopped: CancellationToken,
}

#[async_trait]
impl Service for NoopService {
    async fn start(&self, provider_id: &Identity) -> ServiceResult<()> {
        info!(provider = %provider_id, "Noop service started");
        Ok(())
    }

    async fn wait(&self) -> ServiceResult<()> {
        self.stopped.cancelled().await;
        Ok(())
    }

    async fn stop(&self) -> ServiceResult<()> {
        self.stopped.cancel();
        info!("Noop service stopped");
        Ok(())
    }

    fn config_negotiator(&self) -> Arc<dyn ConfigNegotiator> {
        Arc::new(NoopNegotiator)
    }
}

pub struct NoopServiceFactory {
    ips: Arc<dyn IpResolver>,
    locations: Arc<dyn LocationResolver>,
}

impl NoopServiceFactory {
    pub fn new(ips: Arc<dyn IpResolver>, locations: Arc<dyn LocationResolver>) -> Self {
        Self { ips, locations }
    }
}

#[async_trait]
impl ServiceFactory for NoopServiceFactory {
    async fn create(
        &self,
        options: &ServiceOptions,
    ) -> ServiceResult<(Arc<dyn Service>, ServiceProposal)> {
        let resolved = resolve_location(self.ips.as_ref(), self.locations.as_ref()).await?;
        let proposal = base_proposal(SERVICE_TYPE_NOOP, options, &resolved);
        Ok((Arc::new(NoopService::default()), proposal))
    }
}

/// Consumer side: reports Connected right away.
pub struct NoopConnection {
    state: watch::Sender<TunnelState>,
    statistics: watch::Sender<Statistics>,
    stopped: CancellationToken,
}

#[async_trait]
impl TunnelProcess for NoopConnection {
    fn consumer_config(&self) -> ConnectionResult<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn start(&self, options: ConnectOptions) -> ConnectionResult<()> {
        match ServiceConfiguration::from_bytes(&options.config) {
            Ok(ServiceConfiguration::Noop) => {}
            Ok(other) => {
                return Err(ConnectionError::Config(format!(
                    "expected noop configuration, got {}",
                    other.service_type()
                )));
            }
            Err(e) => return Err(ConnectionError::Config(e.to_string())),
        }

        self.state.send_replace(TunnelState::Connecting);
        self.statistics.send_replace(Statistics {
            started_at: Some(SystemTime::now()),
            ..Statistics::default()
        });
        self.state.send_replace(TunnelState::Connected);
        debug!(session_id = %options.session_id, "Noop tunnel up");
        Ok(())
    }

    async fn wait(&self) -> ConnectionResult<()> {
        self.stopped.cancelled().await;
        Ok(())
    }

    async fn stop(&self) -> ConnectionResult<()> {
        self.stopped.cancel();
        self.state.send_replace(TunnelState::Disconnected);
        Ok(())
    }
}

pub struct NoopConnectionFactory;

impl ConnectionFactory for NoopConnectionFactory {
    fn create(
        &self,
        state: watch::Sender<TunnelState>,
        statistics: watch::Sender<Statistics>,
        _ip_resolver: Arc<dyn IpResolver>,
    ) -> ConnectionResult<Arc<dyn TunnelProcess>> {
        Ok(Arc::new(NoopConnection {
            state,
            statistics,
            stopped: CancellationToken::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::StaticResolver;

    #[tokio::test]
    async fn factory_builds_located_proposal() {
        let resolver = Arc::new(StaticResolver::new(
            "203.0.113.5".parse().unwrap(),
            "203.0.113.5".parse().unwrap(),
            "LT",
        ));
        let factory = NoopServiceFactory::new(resolver.clone(), resolver);
        let (service, proposal) = factory
            .create(&ServiceOptions::new(Identity::from_address("0xp")))
            .await
            .unwrap();

        assert_eq!(proposal.service_type, "noop");
        assert_eq!(proposal.provider_id, "0xp");
        assert_eq!(proposal.location.country, "LT");

        let (config, on_destroy) = service
            .config_negotiator()
            .provide_config(&SessionId::from("s-1"), b"")
            .unwrap();
        assert_eq!(config, ServiceConfiguration::Noop);
        assert!(on_destroy.is_none());
    }

    #[tokio::test]
    async fn connection_reports_state() {
        let (state_tx, state_rx) = watch::channel(TunnelState::Idle);
        let (stats_tx, stats_rx) = watch::channel(Statistics::default());
        let connection = NoopConnectionFactory
            .create(state_tx, stats_tx, Arc::new(StaticResolver::loopback()))
            .unwrap();

        connection
            .start(ConnectOptions {
                session_id: SessionId::from("s-1"),
                provider_id: Identity::from_address("0xp"),
                config: ServiceConfiguration::Noop.to_bytes().unwrap(),
                punched_peer: None,
            })
            .await
            .unwrap();
        assert_eq!(*state_rx.borrow(), TunnelState::Connected);
        assert!(stats_rx.borrow().started_at.is_some());

        connection.stop().await.unwrap();
        connection.wait().await.unwrap();
        assert_eq!(*state_rx.borrow(), TunnelState::Disconnected);
    }
}
