//! Consumer connection lifecycle.

use async_trait::async_trait;
use mesh_dialog::{
    Dialog, DialogCreator, ErrorCode, Request, RequestHandler, RequestKind, Response,
    SessionCreateRequest, SessionCreatedResponse, SessionId,
};
use shared_utils::identity::{Identity, Signer};
use shared_utils::market::{ServiceProposal, CONTACT_TYPE_BROKER};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ConnectOptions, ConnectionError, ConnectionFactory, ConnectionResult, ConnectionStatus,
    Statistics, TunnelProcess, TunnelState,
};
use crate::location::IpResolver;
use crate::nat::{NatPinger, TargetExchange};
use crate::promise::{PromiseIssuer, PromiseSettings};

/// Per-connect options.
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    /// Skip hole punching even when the proposal offers it
    pub disable_nat: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resources of one connection, acquired stage by stage.
#[derive(Default)]
struct Acquired {
    process: Option<Arc<dyn TunnelProcess>>,
    tunnel_state: Option<watch::Receiver<TunnelState>>,
    tunnel_stats: Option<watch::Receiver<Statistics>>,
    dialog: Option<Arc<dyn Dialog>>,
    session_id: Option<SessionId>,
    issuer: Option<Arc<dyn PromiseIssuer>>,
}

impl Acquired {
    /// Tear down in reverse order of acquisition. Never fails; problems are logged.
    async fn release(self) {
        if let Some(process) = &self.process {
            if let Err(e) = process.stop().await {
                warn!("Tunnel stop failed: {}", e);
            }
        }
        if let Some(issuer) = &self.issuer {
            if let Err(e) = issuer.stop().await {
                warn!("Promise issuer stop failed: {}", e);
            }
        }
        if let Some(dialog) = &self.dialog {
            if let Some(session_id) = &self.session_id {
                destroy_session(dialog.as_ref(), session_id).await;
            }
            if let Err(e) = dialog.close().await {
                debug!("Dialog close failed: {}", e);
            }
        }
    }
}

/// Ask the provider to drop the session. The provider reclaims it on
/// dialog close anyway, so failures only get logged.
async fn destroy_session(dialog: &dyn Dialog, session_id: &SessionId) {
    let request = Request::SessionDestroy {
        session_id: session_id.clone(),
    };
    match dialog.request(request).await {
        Ok(Response::SessionDestroyed) => debug!(session_id = %session_id, "Session destroyed"),
        Ok(other) => warn!(session_id = %session_id, "Session destroy refused: {:?}", other),
        Err(e) => warn!(session_id = %session_id, "Session destroy not delivered: {}", e),
    }
}

struct Active {
    session_id: SessionId,
    resources: Acquired,
    relays: CancellationToken,
}

/// Feeds ping targets sent by the provider into the exchange.
struct PingTargetHandler {
    targets: Arc<TargetExchange>,
}

#[async_trait]
impl RequestHandler for PingTargetHandler {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::PingTarget { session_id, target } => {
                self.targets.publish(session_id, target);
                Response::Ack
            }
            other => Response::error(
                ErrorCode::Unhandled,
                format!("unexpected {:?} request", other.kind()),
            ),
        }
    }
}

#[derive(Clone)]
struct Punching {
    pinger: Arc<dyn NatPinger>,
    timeout: Duration,
}

struct Inner {
    dialogs: Arc<dyn DialogCreator>,
    factories: RwLock<HashMap<String, Arc<dyn ConnectionFactory>>>,
    promises: PromiseSettings,
    punching: Option<Punching>,
    connect_timeout: Duration,
    status: watch::Sender<ConnectionStatus>,
    statistics: watch::Sender<Statistics>,
    cancel_connect: Mutex<CancellationToken>,
    active: Mutex<Option<Active>>,
}

/// Drives at most one outbound connection.
///
/// Status and statistics are published on `watch` channels: readers see the
/// latest value and a slow reader never holds up the tunnel.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        dialogs: Arc<dyn DialogCreator>,
        promises: PromiseSettings,
        connect_timeout: Duration,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::NotConnected);
        let (statistics, _) = watch::channel(Statistics::default());
        Self {
            inner: Arc::new(Inner {
                dialogs,
                factories: RwLock::new(HashMap::new()),
                promises,
                punching: None,
                connect_timeout,
                status,
                statistics,
                cancel_connect: Mutex::new(CancellationToken::new()),
                active: Mutex::new(None),
            }),
        }
    }

    /// Punch through NAT for proposals that offer it. Call before the
    /// manager is cloned.
    pub fn with_pinger(mut self, pinger: Arc<dyn NatPinger>, timeout: Duration) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.punching = Some(Punching { pinger, timeout }),
            None => warn!("Connection manager already shared, pinger not installed"),
        }
        self
    }

    /// Register the consumer side of a service type.
    pub fn register(&self, service_type: impl Into<String>, factory: Arc<dyn ConnectionFactory>) {
        self.inner
            .factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(service_type.into(), factory);
    }

    fn factory(&self, service_type: &str) -> ConnectionResult<Arc<dyn ConnectionFactory>> {
        self.inner
            .factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(service_type)
            .cloned()
            .ok_or_else(|| ConnectionError::UnsupportedService(service_type.to_string()))
    }

    /// Current status. Never blocks.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn statistics(&self) -> Statistics {
        *self.inner.statistics.borrow()
    }

    pub fn subscribe_statistics(&self) -> watch::Receiver<Statistics> {
        self.inner.statistics.subscribe()
    }

    /// Whether a promise issuer is running for the current connection.
    pub fn is_issuing(&self) -> bool {
        lock(&self.inner.active)
            .as_ref()
            .and_then(|active| active.resources.issuer.as_ref())
            .is_some_and(|issuer| issuer.is_running())
    }

    /// Connect to the provider of `proposal` as `consumer`.
    ///
    /// Returns once the tunnel reports it is up. Any failing stage unwinds
    /// what was acquired before it and leaves the manager NotConnected.
    pub async fn connect(
        &self,
        consumer: Arc<dyn Signer>,
        proposal: &ServiceProposal,
        params: ConnectParams,
        ip_resolver: Arc<dyn IpResolver>,
    ) -> ConnectionResult<SessionId> {
        let token = CancellationToken::new();
        let begun = self.inner.status.send_if_modified(|status| {
            if *status == ConnectionStatus::NotConnected {
                *lock(&self.inner.cancel_connect) = token.clone();
                *status = ConnectionStatus::Connecting;
                true
            } else {
                false
            }
        });
        if !begun {
            return Err(ConnectionError::AlreadyConnected);
        }
        info!(
            consumer = %consumer.identity(),
            provider = %proposal.provider_id,
            service_type = %proposal.service_type,
            "Connecting"
        );

        let mut acquired = Acquired::default();
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(ConnectionError::Cancelled),
            result = self.establish(consumer, proposal, &params, ip_resolver, &mut acquired) => result,
        };

        let outcome = match outcome {
            Ok(session_id) => self.commit(&token, session_id, acquired),
            Err(e) => Err((e, acquired)),
        };

        match outcome {
            Ok(session_id) => {
                info!(session_id = %session_id, provider = %proposal.provider_id, "Connected");
                Ok(session_id)
            }
            Err((e, acquired)) => {
                warn!(provider = %proposal.provider_id, "Connect failed: {}", e);
                acquired.release().await;
                self.inner.statistics.send_replace(Statistics::default());
                self.inner.status.send_replace(ConnectionStatus::NotConnected);
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        consumer: Arc<dyn Signer>,
        proposal: &ServiceProposal,
        params: &ConnectParams,
        ip_resolver: Arc<dyn IpResolver>,
        acquired: &mut Acquired,
    ) -> ConnectionResult<SessionId> {
        let contact = proposal
            .contacts
            .iter()
            .find(|c| c.contact_type == CONTACT_TYPE_BROKER)
            .ok_or(ConnectionError::NoContact)?;
        let provider_id = Identity::from_address(proposal.provider_id.clone());
        let factory = self.factory(&proposal.service_type)?;

        // The tunnel is built first: its consumer parameters go into the create request
        let (state_tx, state_rx) = watch::channel(TunnelState::Idle);
        let (stats_tx, stats_rx) = watch::channel(Statistics::default());
        let process = factory.create(state_tx, stats_tx, ip_resolver)?;
        acquired.process = Some(Arc::clone(&process));
        acquired.tunnel_state = Some(state_rx.clone());
        acquired.tunnel_stats = Some(stats_rx);
        let consumer_config = process.consumer_config()?;

        let dialog = self
            .inner
            .dialogs
            .create(Arc::clone(&consumer), &provider_id, contact)
            .await?;
        acquired.dialog = Some(Arc::clone(&dialog));

        let punching = match &self.inner.punching {
            Some(punching) if proposal.nat_traversal && !params.disable_nat => {
                let targets = Arc::new(TargetExchange::new());
                dialog.respond(
                    RequestKind::PingTarget,
                    Arc::new(PingTargetHandler {
                        targets: Arc::clone(&targets),
                    }),
                );
                Some((punching.clone(), targets))
            }
            _ => None,
        };

        let created = create_session(
            dialog.as_ref(),
            SessionCreateRequest {
                proposal_id: proposal.id,
                consumer_config,
                ping_target: punching.as_ref().and_then(|(p, _)| p.pinger.local_target()),
            },
        )
        .await?;
        let session_id = created.session_id.clone();
        acquired.session_id = Some(session_id.clone());
        debug!(session_id = %session_id, "Session created");

        let issuer = self
            .inner
            .promises
            .issuer(Arc::clone(&consumer), Arc::clone(&dialog), session_id.clone());
        acquired.issuer = Some(Arc::clone(&issuer));
        issuer.start(proposal).await?;

        let punched_peer = match punching {
            Some((punching, targets)) => {
                let target = match created.ping_target {
                    Some(target) => target,
                    None => targets.wait(&session_id, punching.timeout).await?,
                };
                targets.remove(&session_id);
                Some(punching.pinger.punch(&session_id, target).await?)
            }
            None => None,
        };

        process
            .start(ConnectOptions {
                session_id: session_id.clone(),
                provider_id,
                config: created.config,
                punched_peer,
            })
            .await?;

        wait_until_up(state_rx, self.inner.connect_timeout).await?;
        Ok(session_id)
    }

    /// Publish Connected and start relaying, unless a disconnect got in first.
    fn commit(
        &self,
        token: &CancellationToken,
        session_id: SessionId,
        mut acquired: Acquired,
    ) -> Result<SessionId, (ConnectionError, Acquired)> {
        let (Some(tunnel_state), Some(tunnel_stats)) =
            (acquired.tunnel_state.take(), acquired.tunnel_stats.take())
        else {
            return Err((
                ConnectionError::Tunnel("tunnel channels missing".into()),
                acquired,
            ));
        };

        let mut active = lock(&self.inner.active);
        let connected = ConnectionStatus::Connected {
            session_id: session_id.clone(),
        };
        let committed = self.inner.status.send_if_modified(|status| {
            if *status == ConnectionStatus::Connecting && !token.is_cancelled() {
                *status = connected;
                true
            } else {
                false
            }
        });
        if !committed {
            return Err((ConnectionError::Cancelled, acquired));
        }

        let relays = CancellationToken::new();
        spawn_state_relay(
            Arc::downgrade(&self.inner),
            session_id.clone(),
            tunnel_state,
            relays.clone(),
        );
        spawn_statistics_relay(
            self.inner.statistics.clone(),
            tunnel_stats,
            relays.clone(),
        );

        *active = Some(Active {
            session_id: session_id.clone(),
            resources: acquired,
            relays,
        });
        Ok(session_id)
    }

    /// Tear the connection down. A connect in progress is cancelled and
    /// rolls back on its own.
    pub async fn disconnect(&self) -> ConnectionResult<()> {
        let mut current = ConnectionStatus::NotConnected;
        let begun = self.inner.status.send_if_modified(|status| {
            current = status.clone();
            match current {
                ConnectionStatus::NotConnected | ConnectionStatus::Disconnecting => false,
                ConnectionStatus::Connecting => {
                    lock(&self.inner.cancel_connect).cancel();
                    false
                }
                ConnectionStatus::Connected { .. } | ConnectionStatus::Reconnecting => {
                    *status = ConnectionStatus::Disconnecting;
                    true
                }
            }
        });

        if !begun {
            return match current {
                ConnectionStatus::NotConnected => Err(ConnectionError::NotConnected),
                _ => {
                    // Connect rollback or another disconnect finishes the job
                    let mut rx = self.inner.status.subscribe();
                    let _ = rx
                        .wait_for(|status| *status == ConnectionStatus::NotConnected)
                        .await;
                    Ok(())
                }
            };
        }

        let active = lock(&self.inner.active).take();
        if let Some(active) = active {
            info!(session_id = %active.session_id, "Disconnecting");
            active.relays.cancel();
            active.resources.release().await;
        }
        self.inner.statistics.send_replace(Statistics::default());
        self.inner.status.send_replace(ConnectionStatus::NotConnected);
        info!("Disconnected");
        Ok(())
    }
}

async fn create_session(
    dialog: &dyn Dialog,
    request: SessionCreateRequest,
) -> ConnectionResult<SessionCreatedResponse> {
    match dialog.request(Request::SessionCreate(request)).await? {
        Response::SessionCreated(created) => Ok(created),
        Response::Error { code, message } => Err(ConnectionError::SessionCreate { code, message }),
        other => Err(ConnectionError::Protocol(format!(
            "unexpected session create response {:?}",
            other
        ))),
    }
}

async fn wait_until_up(
    mut state: watch::Receiver<TunnelState>,
    timeout: Duration,
) -> ConnectionResult<()> {
    let settled = tokio::time::timeout(timeout, async {
        state
            .wait_for(|s| matches!(s, TunnelState::Connected | TunnelState::Disconnected))
            .await
            .map(|s| *s)
    })
    .await;

    match settled {
        Ok(Ok(TunnelState::Connected)) => Ok(()),
        Ok(Ok(_)) => Err(ConnectionError::Tunnel("tunnel went down while connecting".into())),
        Ok(Err(_)) => Err(ConnectionError::Tunnel("tunnel process went away".into())),
        Err(_) => Err(ConnectionError::Timeout(format!(
            "tunnel not up within {:?}",
            timeout
        ))),
    }
}

/// Mirror tunnel events into the manager status. A tunnel that drops on its
/// own takes the connection down with it.
fn spawn_state_relay(
    inner: Weak<Inner>,
    session_id: SessionId,
    mut tunnel_state: watch::Receiver<TunnelState>,
    relays: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = relays.cancelled() => break,
                changed = tunnel_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *tunnel_state.borrow_and_update();
                    let Some(inner) = inner.upgrade() else { break };

                    match state {
                        TunnelState::Reconnecting => {
                            inner.status.send_if_modified(|status| {
                                if matches!(status, ConnectionStatus::Connected { .. }) {
                                    *status = ConnectionStatus::Reconnecting;
                                    true
                                } else {
                                    false
                                }
                            });
                        }
                        TunnelState::Connected => {
                            inner.status.send_if_modified(|status| {
                                if *status == ConnectionStatus::Reconnecting {
                                    *status = ConnectionStatus::Connected { session_id: session_id.clone() };
                                    true
                                } else {
                                    false
                                }
                            });
                        }
                        TunnelState::Disconnected => {
                            warn!(session_id = %session_id, "Tunnel went down");
                            let manager = ConnectionManager { inner };
                            if let Err(e) = manager.disconnect().await {
                                debug!(session_id = %session_id, "Cleanup after tunnel loss: {}", e);
                            }
                            break;
                        }
                        TunnelState::Idle | TunnelState::Connecting => {}
                    }
                }
            }
        }
    });
}

fn spawn_statistics_relay(
    statistics: watch::Sender<Statistics>,
    mut tunnel_stats: watch::Receiver<Statistics>,
    relays: CancellationToken,
) {
    tokio::spawn(async move {
        // Snapshot taken before the relay started
        statistics.send_replace(*tunnel_stats.borrow_and_update());
        loop {
            tokio::select! {
                _ = relays.cancelled() => break,
                changed = tunnel_stats.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    statistics.send_replace(*tunnel_stats.borrow_and_update());
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::StaticResolver;
    use crate::services::noop::NoopConnectionFactory;
    use crate::services::ServiceConfiguration;
    use mesh_dialog::{DialogError, DialogResult};
    use shared_utils::identity::{IdentityManager, Keystore};
    use shared_utils::market::Contact;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider double answering over an in-memory dialog.
    struct ScriptedDialog {
        peer: Identity,
        create: Mutex<Option<Response>>,
        destroys: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl Dialog for ScriptedDialog {
        fn peer_id(&self) -> &Identity {
            &self.peer
        }

        async fn request(&self, request: Request) -> DialogResult<Response> {
            match request {
                Request::SessionCreate(_) => lock(&self.create).clone().ok_or(DialogError::Closed),
                Request::SessionDestroy { .. } => {
                    self.destroys.fetch_add(1, Ordering::SeqCst);
                    Ok(Response::SessionDestroyed)
                }
                _ => Ok(Response::Ack),
            }
        }

        fn respond(&self, _kind: RequestKind, _handler: Arc<dyn RequestHandler>) {}

        fn on_close(&self, _observer: Box<dyn FnOnce() + Send>) {}

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst) > 0
        }

        async fn close(&self) -> DialogResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ScriptedCreator {
        dialog: Arc<ScriptedDialog>,
    }

    #[async_trait]
    impl DialogCreator for ScriptedCreator {
        async fn create(
            &self,
            _consumer: Arc<dyn Signer>,
            _provider_id: &Identity,
            _contact: &Contact,
        ) -> DialogResult<Arc<dyn Dialog>> {
            let dialog: Arc<dyn Dialog> = self.dialog.clone();
            Ok(dialog)
        }
    }

    fn created(config: ServiceConfiguration) -> Response {
        Response::SessionCreated(SessionCreatedResponse {
            session_id: SessionId::from("s-1"),
            config: config.to_bytes().unwrap(),
            ping_target: None,
        })
    }

    fn setup(create: Response) -> (ConnectionManager, Arc<ScriptedDialog>, Arc<dyn Signer>, ServiceProposal) {
        let dialog = Arc::new(ScriptedDialog {
            peer: Identity::from_address("0xprovider"),
            create: Mutex::new(Some(create)),
            destroys: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        });
        let manager = ConnectionManager::new(
            Arc::new(ScriptedCreator {
                dialog: dialog.clone(),
            }),
            PromiseSettings::disabled(),
            Duration::from_secs(1),
        );
        manager.register("noop", Arc::new(NoopConnectionFactory));

        let keystore = Keystore::new();
        let identity = keystore.create_new_identity("pass").unwrap();
        keystore.unlock(&identity.address, "pass").unwrap();
        let signer = keystore.signer(&identity).unwrap();

        let mut proposal = ServiceProposal::new("0xprovider", "noop");
        proposal.set_contact(Contact {
            contact_type: CONTACT_TYPE_BROKER.into(),
            address: "broker.local/0xprovider/noop".into(),
        });
        (manager, dialog, signer, proposal)
    }

    fn resolver() -> Arc<dyn IpResolver> {
        Arc::new(StaticResolver::loopback())
    }

    #[tokio::test]
    async fn connect_and_disconnect() {
        let (manager, dialog, signer, proposal) = setup(created(ServiceConfiguration::Noop));

        let session_id = manager
            .connect(signer, &proposal, ConnectParams::default(), resolver())
            .await
            .unwrap();
        assert_eq!(
            manager.status(),
            ConnectionStatus::Connected {
                session_id: session_id.clone()
            }
        );
        assert!(manager.is_issuing());

        manager.disconnect().await.unwrap();
        assert_eq!(manager.status(), ConnectionStatus::NotConnected);
        assert!(!manager.is_issuing());
        assert_eq!(dialog.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(dialog.closed.load(Ordering::SeqCst), 1);

        assert!(matches!(
            manager.disconnect().await,
            Err(ConnectionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn second_connect_is_rejected() {
        let (manager, _dialog, signer, proposal) = setup(created(ServiceConfiguration::Noop));
        let session_id = manager
            .connect(signer.clone(), &proposal, ConnectParams::default(), resolver())
            .await
            .unwrap();

        assert!(matches!(
            manager
                .connect(signer, &proposal, ConnectParams::default(), resolver())
                .await,
            Err(ConnectionError::AlreadyConnected)
        ));
        assert_eq!(manager.status(), ConnectionStatus::Connected { session_id });
        manager.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn refused_create_unwinds() {
        let (manager, dialog, signer, proposal) = setup(Response::error(
            ErrorCode::ConfigNegotiationFailed,
            "pool exhausted",
        ));

        let result = manager
            .connect(signer, &proposal, ConnectParams::default(), resolver())
            .await;
        assert!(matches!(
            result,
            Err(ConnectionError::SessionCreate {
                code: ErrorCode::ConfigNegotiationFailed,
                ..
            })
        ));
        assert_eq!(manager.status(), ConnectionStatus::NotConnected);
        // No session to destroy, dialog closed
        assert_eq!(dialog.destroys.load(Ordering::SeqCst), 0);
        assert_eq!(dialog.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tunnel_start_failure_destroys_session() {
        // Noop tunnel refuses a WireGuard configuration
        let wireguard = ServiceConfiguration::Wireguard(crate::services::WireguardConfig {
            provider_public_key: "key".into(),
            endpoint: "127.0.0.1:51820".parse().unwrap(),
            consumer_address: "10.0.0.2/24".into(),
            gateway: "10.0.0.1".parse().unwrap(),
        });
        let (manager, dialog, signer, proposal) = setup(created(wireguard));

        let result = manager
            .connect(signer, &proposal, ConnectParams::default(), resolver())
            .await;
        assert!(matches!(result, Err(ConnectionError::Config(_))));
        assert_eq!(manager.status(), ConnectionStatus::NotConnected);
        assert_eq!(dialog.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(dialog.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_contact_or_factory() {
        let (manager, _dialog, signer, mut proposal) = setup(created(ServiceConfiguration::Noop));

        let mut unknown = proposal.clone();
        unknown.service_type = "openvpn".into();
        assert!(matches!(
            manager
                .connect(signer.clone(), &unknown, ConnectParams::default(), resolver())
                .await,
            Err(ConnectionError::UnsupportedService(_))
        ));

        proposal.contacts.clear();
        assert!(matches!(
            manager
                .connect(signer, &proposal, ConnectParams::default(), resolver())
                .await,
            Err(ConnectionError::NoContact)
        ));
        assert_eq!(manager.status(), ConnectionStatus::NotConnected);
    }

    #[tokio::test]
    async fn tunnel_loss_disconnects() {
        let (manager, dialog, signer, proposal) = setup(created(ServiceConfiguration::Noop));
        let mut status = manager.subscribe_status();
        manager
            .connect(signer, &proposal, ConnectParams::default(), resolver())
            .await
            .unwrap();

        // Stop the tunnel behind the manager's back
        let process = lock(&manager.inner.active)
            .as_ref()
            .and_then(|active| active.resources.process.clone())
            .unwrap();
        process.stop().await.unwrap();

        status
            .wait_for(|s| *s == ConnectionStatus::NotConnected)
            .await
            .unwrap();
        assert_eq!(dialog.closed.load(Ordering::SeqCst), 1);
    }
}
