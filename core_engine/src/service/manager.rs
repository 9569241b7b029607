//! Lifecycle of one running service instance.

use mesh_dialog::{Broker, DialogWaiter, DiscoveryAddress};
use shared_utils::identity::{IdentityRegistry, Signer};
use shared_utils::market::{Contact, ServiceProposal, CONTACT_TYPE_BROKER};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Service, ServiceError, ServiceFactory, ServiceOptions, ServiceResult};
use crate::discovery::ProposalRegistry;
use crate::location::IpResolver;
use crate::nat::{NatPinger, NatSettings, UdpNatPinger};
use crate::promise::PromiseSettings;
use crate::session::{SessionDialogHandler, SessionRegistry};

/// Collaborators shared by every service instance of a node.
#[derive(Clone)]
pub struct ProviderContext {
    pub broker: Broker,
    pub broker_address: String,
    pub signer: Arc<dyn Signer>,
    pub identities: Arc<dyn IdentityRegistry>,
    pub discovery: Arc<dyn ProposalRegistry>,
    pub promises: PromiseSettings,
    /// Provider-side punching; `None` when NAT traversal is disabled
    pub nat: Option<NatSettings>,
    pub ip_resolver: Arc<dyn IpResolver>,
    pub dialog_timeout: Duration,
    pub refresh_interval: Duration,
}

/// Service instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    NotRunning,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Resources acquired so far by a start in progress.
#[derive(Default)]
struct Acquired {
    service: Option<Arc<dyn Service>>,
    service_started: bool,
    sessions: Option<Arc<SessionRegistry>>,
    waiter: Option<DialogWaiter>,
    published: Option<ServiceProposal>,
}

impl Acquired {
    /// Undo a failed start, newest resource first.
    async fn release(self, discovery: &dyn ProposalRegistry) {
        if let Some(proposal) = &self.published {
            if let Err(e) = discovery.unpublish(proposal).await {
                warn!(proposal_id = proposal.id, "Rollback unpublish failed: {}", e);
            }
        }
        if let Some(waiter) = &self.waiter {
            if let Err(e) = waiter.stop().await {
                warn!("Rollback dialog waiter stop failed: {}", e);
            }
        }
        if let Some(sessions) = &self.sessions {
            sessions.close();
        }
        if let (Some(service), true) = (&self.service, self.service_started) {
            if let Err(e) = service.stop().await {
                warn!("Rollback service stop failed: {}", e);
            }
        }
    }
}

struct Running {
    proposal: ServiceProposal,
    service: Arc<dyn Service>,
    sessions: Arc<SessionRegistry>,
    waiter: DialogWaiter,
    tasks: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Running {
    async fn shutdown(self, discovery: &dyn ProposalRegistry) -> ServiceResult<()> {
        self.tasks.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }

        let mut first_error = None;
        if let Err(e) = discovery.unpublish(&self.proposal).await {
            warn!(proposal_id = self.proposal.id, "Unpublish failed: {}", e);
            first_error.get_or_insert(ServiceError::from(e));
        }
        if let Err(e) = self.waiter.stop().await {
            warn!("Dialog waiter stop failed: {}", e);
            first_error.get_or_insert(ServiceError::from(e));
        }
        let destroyed = self.sessions.close();
        if let Err(e) = self.service.stop().await {
            warn!("Service stop failed: {}", e);
            first_error.get_or_insert(e);
        }

        info!(
            service_type = %self.proposal.service_type,
            proposal_id = self.proposal.id,
            sessions = destroyed,
            "Service stopped"
        );
        first_error.map_or(Ok(()), Err)
    }
}

/// Drives one service instance through start and stop.
pub struct Manager {
    service_type: String,
    context: ProviderContext,
    state: watch::Sender<ManagerState>,
    cancel_start: Mutex<CancellationToken>,
    running: Mutex<Option<Running>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Manager {
    pub fn new(service_type: impl Into<String>, context: ProviderContext) -> Self {
        let (state, _) = watch::channel(ManagerState::NotRunning);
        Self {
            service_type: service_type.into(),
            context,
            state,
            cancel_start: Mutex::new(CancellationToken::new()),
            running: Mutex::new(None),
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn state(&self) -> ManagerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ManagerState> {
        self.state.subscribe()
    }

    /// Proposal published while Running.
    pub fn proposal(&self) -> Option<ServiceProposal> {
        lock(&self.running).as_ref().map(|r| r.proposal.clone())
    }

    /// Session registry of the running instance.
    pub fn sessions(&self) -> Option<Arc<SessionRegistry>> {
        lock(&self.running).as_ref().map(|r| Arc::clone(&r.sessions))
    }

    /// Start the instance. On failure every acquired resource is released
    /// and the manager is back to NotRunning.
    pub async fn start(
        &self,
        factory: Arc<dyn ServiceFactory>,
        options: ServiceOptions,
        proposal_id: u64,
    ) -> ServiceResult<()> {
        let token = CancellationToken::new();
        let mut current = ManagerState::NotRunning;
        let begun = self.state.send_if_modified(|state| {
            current = *state;
            if *state == ManagerState::NotRunning {
                *lock(&self.cancel_start) = token.clone();
                *state = ManagerState::Starting;
                true
            } else {
                false
            }
        });
        if !begun {
            return Err(match current {
                ManagerState::Stopped => ServiceError::InvalidState(format!(
                    "{} instance already stopped",
                    self.service_type
                )),
                _ => ServiceError::AlreadyRunning(self.service_type.clone()),
            });
        }
        info!(service_type = %self.service_type, proposal_id, "Starting service");

        let mut acquired = Acquired::default();
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(ServiceError::Cancelled),
            result = self.bring_up(factory, &options, proposal_id, &mut acquired) => result,
        };

        let outcome = match outcome {
            Ok(()) => self.enter_running(&token, acquired),
            Err(e) => Err((e, acquired)),
        };

        match outcome {
            Ok(()) => {
                info!(service_type = %self.service_type, proposal_id, "Service running");
                Ok(())
            }
            Err((e, acquired)) => {
                warn!(service_type = %self.service_type, "Service start failed: {}", e);
                acquired.release(self.context.discovery.as_ref()).await;
                self.state.send_replace(ManagerState::NotRunning);
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
        factory: Arc<dyn ServiceFactory>,
        options: &ServiceOptions,
        proposal_id: u64,
        acquired: &mut Acquired,
    ) -> ServiceResult<()> {
        let (service, mut proposal) = factory.create(options).await?;
        acquired.service = Some(Arc::clone(&service));

        service.start(&options.provider_id).await?;
        acquired.service_started = true;

        proposal.id = proposal_id;
        proposal.nat_traversal = proposal.nat_traversal && self.context.nat.is_some();

        let pinger = match &self.context.nat {
            Some(settings) if proposal.nat_traversal => {
                let advertise = self.context.ip_resolver.outbound_ip().await.ok();
                let pinger: Arc<dyn NatPinger> =
                    Arc::new(UdpNatPinger::bind(settings.clone(), advertise).await?);
                Some((pinger, settings.timeout))
            }
            _ => None,
        };

        let sessions = Arc::new(SessionRegistry::new());
        acquired.sessions = Some(Arc::clone(&sessions));

        let address = DiscoveryAddress::new(
            self.context.broker_address.clone(),
            &options.provider_id,
            proposal.service_type.clone(),
        )?;
        proposal.set_contact(Contact {
            contact_type: CONTACT_TYPE_BROKER.to_string(),
            address: address.to_string(),
        });

        let mut handler = SessionDialogHandler::new(
            proposal.clone(),
            service.config_negotiator(),
            Arc::clone(&sessions),
            self.context.promises.clone(),
        );
        if let Some((pinger, timeout)) = pinger {
            handler = handler.with_pinger(pinger, timeout);
        }

        let waiter = DialogWaiter::new(
            address,
            self.context.broker.clone(),
            Arc::clone(&self.context.signer),
            Arc::clone(&self.context.identities),
            self.context.dialog_timeout,
        );
        waiter.serve(Arc::new(handler))?;
        acquired.waiter = Some(waiter);

        self.context.discovery.publish(&proposal).await?;
        acquired.published = Some(proposal);
        Ok(())
    }

    /// Commit a completed start unless a stop got in first.
    fn enter_running(
        &self,
        token: &CancellationToken,
        acquired: Acquired,
    ) -> Result<(), (ServiceError, Acquired)> {
        let service_started = acquired.service_started;
        let parts = (acquired.service, acquired.sessions, acquired.waiter, acquired.published);
        let (service, sessions, waiter, proposal) = match parts {
            (Some(service), Some(sessions), Some(waiter), Some(proposal)) => {
                (service, sessions, waiter, proposal)
            }
            (service, sessions, waiter, published) => {
                return Err((
                    ServiceError::InvalidState("start completed without resources".into()),
                    Acquired {
                        service,
                        service_started,
                        sessions,
                        waiter,
                        published,
                    },
                ));
            }
        };

        let mut running = lock(&self.running);
        let committed = self.state.send_if_modified(|state| {
            if *state == ManagerState::Starting && !token.is_cancelled() {
                *state = ManagerState::Running;
                true
            } else {
                false
            }
        });
        if !committed {
            drop(running);
            return Err((
                ServiceError::Cancelled,
                Acquired {
                    service: Some(service),
                    service_started,
                    sessions: Some(sessions),
                    waiter: Some(waiter),
                    published: Some(proposal),
                },
            ));
        }

        let tasks = CancellationToken::new();
        let handles = vec![
            self.spawn_refresh(proposal.clone(), tasks.clone()),
            spawn_service_watch(Arc::clone(&service), self.service_type.clone(), tasks.clone()),
        ];
        *running = Some(Running {
            proposal,
            service,
            sessions,
            waiter,
            tasks,
            handles,
        });
        Ok(())
    }

    fn spawn_refresh(&self, proposal: ServiceProposal, tasks: CancellationToken) -> JoinHandle<()> {
        let discovery = Arc::clone(&self.context.discovery);
        let period = self.context.refresh_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately; the proposal was just published
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = tasks.cancelled() => break,
                    _ = interval.tick() => {
                        match discovery.publish(&proposal).await {
                            Ok(()) => debug!(proposal_id = proposal.id, "Proposal refreshed"),
                            Err(e) => warn!(proposal_id = proposal.id, "Proposal refresh failed: {}", e),
                        }
                    }
                }
            }
        })
    }

    /// Stop the instance. Cancels a start in progress; idempotent once
    /// stopped or never started.
    pub async fn stop(&self) -> ServiceResult<()> {
        let mut cancelled = false;
        self.state.send_if_modified(|state| {
            if *state == ManagerState::Starting {
                lock(&self.cancel_start).cancel();
                cancelled = true;
            }
            false
        });

        if cancelled {
            info!(service_type = %self.service_type, "Cancelling service start");
            let mut rx = self.state.subscribe();
            let settled = rx
                .wait_for(|state| *state != ManagerState::Starting)
                .await
                .map(|state| *state);
            if !matches!(settled, Ok(ManagerState::Running)) {
                return Ok(());
            }
        }

        let stopping = self.state.send_if_modified(|state| {
            if *state == ManagerState::Running {
                *state = ManagerState::Stopping;
                true
            } else {
                false
            }
        });
        if !stopping {
            debug!(service_type = %self.service_type, state = ?self.state(), "Nothing to stop");
            return Ok(());
        }

        let running = lock(&self.running).take();
        let result = match running {
            Some(running) => running.shutdown(self.context.discovery.as_ref()).await,
            None => Ok(()),
        };
        self.state.send_replace(ManagerState::Stopped);
        result
    }
}

/// Log a service that exits on its own while the instance is running.
fn spawn_service_watch(
    service: Arc<dyn Service>,
    service_type: String,
    tasks: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tasks.cancelled() => {}
            result = service.wait() => match result {
                Ok(()) => warn!(service_type = %service_type, "Service exited while running"),
                Err(e) => error!(service_type = %service_type, "Service failed: {}", e),
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DiscoveryResult, MemoryDiscovery};
    use crate::location::StaticResolver;
    use crate::services::noop::NoopServiceFactory;
    use async_trait::async_trait;
    use shared_utils::identity::{Identity, IdentityManager, Keystore, MemoryIdentityRegistry};
    use tokio::sync::Notify;

    /// Discovery that parks the first publish until released.
    struct GatedDiscovery {
        inner: MemoryDiscovery,
        entered: Notify,
        release: Notify,
        fail: bool,
    }

    impl GatedDiscovery {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryDiscovery::new(),
                entered: Notify::new(),
                release: Notify::new(),
                fail,
            })
        }
    }

    #[async_trait]
    impl ProposalRegistry for GatedDiscovery {
        async fn publish(&self, proposal: &ServiceProposal) -> DiscoveryResult<()> {
            self.entered.notify_one();
            self.release.notified().await;
            if self.fail {
                return Err(crate::discovery::DiscoveryError::Unavailable("down".into()));
            }
            self.inner.publish(proposal).await
        }

        async fn unpublish(&self, proposal: &ServiceProposal) -> DiscoveryResult<()> {
            self.inner.unpublish(proposal).await
        }
    }

    fn provider() -> (Identity, Arc<dyn Signer>) {
        let keystore = Keystore::new();
        let identity = keystore.create_new_identity("pass").unwrap();
        keystore.unlock(&identity.address, "pass").unwrap();
        let signer = keystore.signer(&identity).unwrap();
        (identity, signer)
    }

    fn context(discovery: Arc<dyn ProposalRegistry>, signer: Arc<dyn Signer>) -> ProviderContext {
        ProviderContext {
            broker: Broker::new(),
            broker_address: "broker.local".into(),
            signer,
            identities: Arc::new(MemoryIdentityRegistry::new()),
            discovery,
            promises: PromiseSettings::disabled(),
            nat: None,
            ip_resolver: Arc::new(StaticResolver::loopback()),
            dialog_timeout: Duration::from_secs(2),
            refresh_interval: Duration::from_secs(60),
        }
    }

    fn noop_factory() -> Arc<dyn ServiceFactory> {
        let resolver = Arc::new(StaticResolver::loopback());
        Arc::new(NoopServiceFactory::new(resolver.clone(), resolver))
    }

    #[tokio::test]
    async fn start_publishes_and_stop_cleans_up() {
        let (identity, signer) = provider();
        let discovery = Arc::new(MemoryDiscovery::new());
        let ctx = context(discovery.clone(), signer);
        let broker = ctx.broker.clone();
        let manager = Manager::new("noop", ctx);

        manager
            .start(noop_factory(), ServiceOptions::new(identity.clone()), 1)
            .await
            .unwrap();
        assert_eq!(manager.state(), ManagerState::Running);

        let proposal = manager.proposal().unwrap();
        assert_eq!(proposal.id, 1);
        assert_eq!(discovery.find(Some("noop")), vec![proposal.clone()]);
        let address: DiscoveryAddress = proposal.broker_contact().unwrap().parse().unwrap();
        assert_eq!(address.identity(), &identity);
        assert!(broker.is_bound(&address));

        manager.stop().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert!(discovery.find(None).is_empty());
        assert!(!broker.is_bound(&address));

        // Idempotent, and a stopped instance stays stopped
        manager.stop().await.unwrap();
        assert!(matches!(
            manager
                .start(noop_factory(), ServiceOptions::new(identity), 2)
                .await,
            Err(ServiceError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (identity, signer) = provider();
        let manager = Manager::new("noop", context(Arc::new(MemoryDiscovery::new()), signer));
        manager
            .start(noop_factory(), ServiceOptions::new(identity.clone()), 1)
            .await
            .unwrap();

        assert!(matches!(
            manager.start(noop_factory(), ServiceOptions::new(identity), 2).await,
            Err(ServiceError::AlreadyRunning(_))
        ));
        assert_eq!(manager.proposal().unwrap().id, 1);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_during_start_rolls_back() {
        let (identity, signer) = provider();
        let discovery = GatedDiscovery::new(false);
        let ctx = context(discovery.clone(), signer);
        let broker = ctx.broker.clone();
        let manager = Arc::new(Manager::new("noop", ctx));

        let starting = {
            let manager = manager.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                manager
                    .start(noop_factory(), ServiceOptions::new(identity), 1)
                    .await
            })
        };

        // Waiter is bound by the time publish is reached
        discovery.entered.notified().await;
        let address = DiscoveryAddress::new("broker.local", &identity, "noop").unwrap();
        assert!(broker.is_bound(&address));

        manager.stop().await.unwrap();
        assert!(matches!(starting.await.unwrap(), Err(ServiceError::Cancelled)));
        assert_eq!(manager.state(), ManagerState::NotRunning);
        assert!(!broker.is_bound(&address));
        assert!(discovery.inner.find(None).is_empty());
        assert!(manager.proposal().is_none());
    }

    #[tokio::test]
    async fn publish_failure_releases_waiter() {
        let (identity, signer) = provider();
        let discovery = GatedDiscovery::new(true);
        let ctx = context(discovery.clone(), signer);
        let broker = ctx.broker.clone();
        let manager = Arc::new(Manager::new("noop", ctx));

        let starting = {
            let manager = manager.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                manager
                    .start(noop_factory(), ServiceOptions::new(identity), 1)
                    .await
            })
        };
        discovery.entered.notified().await;
        discovery.release.notify_one();

        assert!(matches!(starting.await.unwrap(), Err(ServiceError::Discovery(_))));
        assert_eq!(manager.state(), ManagerState::NotRunning);
        let address = DiscoveryAddress::new("broker.local", &identity, "noop").unwrap();
        assert!(!broker.is_bound(&address));
    }
}
