//! Provider handling of session requests on accepted dialogs.

use async_trait::async_trait;
use mesh_dialog::{
    Dialog, DialogHandler, DialogResult, ErrorCode, PingTarget, Request, RequestHandler,
    RequestKind, Response, SessionCreateRequest, SessionCreatedResponse, SessionId, SignedPromise,
};
use shared_utils::identity::Identity;
use shared_utils::market::ServiceProposal;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ConfigNegotiator, DestroyCallback, Session, SessionError, SessionRegistry};
use crate::nat::{NatPinger, TargetExchange};
use crate::promise::PromiseSettings;

const REQUEST_KINDS: [RequestKind; 4] = [
    RequestKind::SessionCreate,
    RequestKind::SessionDestroy,
    RequestKind::Promise,
    RequestKind::PingTarget,
];

#[derive(Clone)]
struct Punching {
    pinger: Arc<dyn NatPinger>,
    targets: Arc<TargetExchange>,
    /// Bound on waiting for a consumer target sent after the create
    timeout: Duration,
}

/// Installs session request handlers on every dialog a service instance accepts.
pub struct SessionDialogHandler {
    proposal: ServiceProposal,
    negotiator: Arc<dyn ConfigNegotiator>,
    sessions: Arc<SessionRegistry>,
    promises: PromiseSettings,
    punching: Option<Punching>,
}

impl SessionDialogHandler {
    pub fn new(
        proposal: ServiceProposal,
        negotiator: Arc<dyn ConfigNegotiator>,
        sessions: Arc<SessionRegistry>,
        promises: PromiseSettings,
    ) -> Self {
        Self {
            proposal,
            negotiator,
            sessions,
            promises,
            punching: None,
        }
    }

    /// Punch towards consumers that ask for NAT traversal.
    pub fn with_pinger(mut self, pinger: Arc<dyn NatPinger>, timeout: Duration) -> Self {
        self.punching = Some(Punching {
            pinger,
            targets: Arc::new(TargetExchange::new()),
            timeout,
        });
        self
    }
}

#[async_trait]
impl DialogHandler for SessionDialogHandler {
    async fn handle(&self, dialog: Arc<dyn Dialog>) -> DialogResult<()> {
        let requests = Arc::new(SessionRequests {
            consumer: dialog.peer_id().clone(),
            proposal: self.proposal.clone(),
            negotiator: Arc::clone(&self.negotiator),
            sessions: Arc::clone(&self.sessions),
            promises: self.promises.clone(),
            punching: self.punching.clone(),
            owned: Mutex::new(Owned::default()),
        });

        for kind in REQUEST_KINDS {
            dialog.respond(kind, requests.clone());
        }

        // Sessions do not outlive the dialog that created them
        let on_close = Arc::clone(&requests);
        dialog.on_close(Box::new(move || on_close.destroy_owned()));

        debug!(consumer = %dialog.peer_id(), proposal_id = self.proposal.id, "Session handlers installed");
        Ok(())
    }
}

/// Sessions created on one dialog. Set to `closed` once the dialog is gone.
#[derive(Default)]
struct Owned {
    ids: HashSet<SessionId>,
    closed: bool,
}

/// Request handlers bound to one dialog.
struct SessionRequests {
    consumer: Identity,
    proposal: ServiceProposal,
    negotiator: Arc<dyn ConfigNegotiator>,
    sessions: Arc<SessionRegistry>,
    promises: PromiseSettings,
    punching: Option<Punching>,
    owned: Mutex<Owned>,
}

impl SessionRequests {
    fn owned(&self) -> MutexGuard<'_, Owned> {
        self.owned.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Undo a create that failed before the session became visible.
    fn abandon(&self, id: &SessionId, on_destroy: Option<DestroyCallback>) {
        self.sessions.release(id);
        if let Some(on_destroy) = on_destroy {
            on_destroy();
        }
    }

    fn create(&self, request: SessionCreateRequest) -> Response {
        if request.proposal_id != self.proposal.id {
            return Response::error(
                ErrorCode::InvalidProposal,
                SessionError::InvalidProposal(request.proposal_id).to_string(),
            );
        }

        if self.owned().closed {
            return Response::error(ErrorCode::Internal, SessionError::DialogClosed.to_string());
        }

        let id = match self.sessions.reserve() {
            Ok(id) => id,
            Err(e) => return Response::error(ErrorCode::Internal, e.to_string()),
        };

        let (config, on_destroy) = match self.negotiator.provide_config(&id, &request.consumer_config) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                warn!(session_id = %id, consumer = %self.consumer, "Config negotiation failed: {}", e);
                self.abandon(&id, None);
                let message = match e {
                    SessionError::ConfigNegotiationFailed(message) => message,
                    other => other.to_string(),
                };
                return Response::error(ErrorCode::ConfigNegotiationFailed, message);
            }
        };

        let config = match config.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.abandon(&id, on_destroy);
                return Response::error(ErrorCode::Internal, e.to_string());
            }
        };

        let processor = self.promises.processor(id.clone(), self.consumer.clone());
        if let Err(e) = processor.start(&self.proposal) {
            self.abandon(&id, on_destroy);
            return Response::error(ErrorCode::Internal, SessionError::from(e).to_string());
        }

        let session = Session::new(id.clone(), self.consumer.clone(), self.proposal.id, config.clone());
        if let Err(e) = self.sessions.insert(session, processor, on_destroy) {
            return Response::error(ErrorCode::Internal, e.to_string());
        }
        // The dialog may have closed while the session was negotiated
        let orphaned = {
            let mut owned = self.owned();
            if !owned.closed {
                owned.ids.insert(id.clone());
            }
            owned.closed
        };
        if orphaned {
            warn!(session_id = %id, consumer = %self.consumer, "Dialog closed during create, destroying session");
            if let Err(e) = self.sessions.destroy(&id) {
                debug!(session_id = %id, "Session already gone: {}", e);
            }
            return Response::error(ErrorCode::Internal, SessionError::DialogClosed.to_string());
        }

        let ping_target = self.punching.as_ref().and_then(|p| p.pinger.local_target());
        if let Some(punching) = &self.punching {
            if request.ping_target.is_some() || self.proposal.nat_traversal {
                self.spawn_punch(punching.clone(), id.clone(), request.ping_target);
            }
        }

        Response::SessionCreated(SessionCreatedResponse {
            session_id: id,
            config,
            ping_target,
        })
    }

    /// Punch in the background; a session that cannot be reached is destroyed.
    fn spawn_punch(&self, punching: Punching, id: SessionId, target: Option<PingTarget>) {
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let target = match target {
                Some(target) => Ok(target),
                None => punching.targets.wait(&id, punching.timeout).await,
            };
            let punched = match target {
                Ok(target) => punching.pinger.punch(&id, target).await,
                Err(e) => Err(e),
            };
            punching.targets.remove(&id);

            if let Err(e) = punched {
                warn!(session_id = %id, "Destroying unreachable session: {}", e);
                if let Err(e) = sessions.destroy(&id) {
                    debug!(session_id = %id, "Session already gone: {}", e);
                }
            }
        });
    }

    /// Ownership check shared by requests naming an existing session.
    fn check_owner(&self, id: &SessionId) -> Option<Response> {
        match self.sessions.find(id) {
            Some(session) if session.consumer != self.consumer => Some(Response::error(
                ErrorCode::Forbidden,
                SessionError::Forbidden(id.clone()).to_string(),
            )),
            _ => None,
        }
    }

    fn destroy(&self, id: SessionId) -> Response {
        if let Some(forbidden) = self.check_owner(&id) {
            return forbidden;
        }

        match self.sessions.destroy(&id) {
            Ok(_) => {
                self.owned().ids.remove(&id);
                Response::SessionDestroyed
            }
            Err(e @ SessionError::NotFound(_)) => {
                Response::error(ErrorCode::SessionNotFound, e.to_string())
            }
            Err(e) => Response::error(ErrorCode::Internal, e.to_string()),
        }
    }

    fn promise(&self, promise: SignedPromise) -> Response {
        let id = &promise.promise.session_id;
        let Some((session, processor)) = self.sessions.find_with_processor(id) else {
            return Response::error(
                ErrorCode::SessionNotFound,
                SessionError::NotFound(id.clone()).to_string(),
            );
        };
        if session.consumer != self.consumer {
            return Response::error(
                ErrorCode::Forbidden,
                SessionError::Forbidden(id.clone()).to_string(),
            );
        }

        match processor.process(&promise) {
            Ok(()) => Response::Ack,
            // Not fatal: the session carries on
            Err(e) => Response::error(ErrorCode::InvalidPromise, e.to_string()),
        }
    }

    fn ping_target(&self, id: SessionId, target: PingTarget) -> Response {
        if !self.sessions.contains(&id) {
            return Response::error(
                ErrorCode::SessionNotFound,
                SessionError::NotFound(id).to_string(),
            );
        }
        if let Some(forbidden) = self.check_owner(&id) {
            return forbidden;
        }

        match &self.punching {
            Some(punching) => {
                punching.targets.publish(id, target);
                Response::Ack
            }
            None => Response::error(ErrorCode::Unhandled, "NAT traversal disabled"),
        }
    }

    fn destroy_owned(&self) {
        let owned: Vec<SessionId> = {
            let mut owned = self.owned();
            owned.closed = true;
            owned.ids.drain().collect()
        };
        for id in owned {
            match self.sessions.destroy(&id) {
                Ok(true) => info!(session_id = %id, consumer = %self.consumer, "Session destroyed with its dialog"),
                Ok(false) | Err(SessionError::NotFound(_)) => {}
                Err(e) => warn!(session_id = %id, "Failed to destroy session: {}", e),
            }
        }
    }
}

#[async_trait]
impl RequestHandler for SessionRequests {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::SessionCreate(create) => self.create(create),
            Request::SessionDestroy { session_id } => self.destroy(session_id),
            Request::Promise(promise) => self.promise(promise),
            Request::PingTarget { session_id, target } => self.ping_target(session_id, target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ServiceConfiguration;
    use crate::session::{Negotiated, SessionResult};
    use mesh_dialog::DialogResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Dialog double that keeps the installed handlers and observers.
    struct LocalDialog {
        peer: Identity,
        handlers: Mutex<Vec<(RequestKind, Arc<dyn RequestHandler>)>>,
        observers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    }

    impl LocalDialog {
        fn new(peer: &str) -> Arc<Self> {
            Arc::new(Self {
                peer: Identity::from_address(peer),
                handlers: Mutex::new(Vec::new()),
                observers: Mutex::new(Vec::new()),
            })
        }

        async fn send(&self, request: Request) -> Response {
            let kind = request.kind();
            let handler = self
                .handlers
                .lock()
                .unwrap()
                .iter()
                .find(|(k, _)| *k == kind)
                .map(|(_, h)| h.clone())
                .unwrap();
            handler.handle(request).await
        }

        fn drop_connection(&self) {
            for observer in self.observers.lock().unwrap().drain(..) {
                observer();
            }
        }
    }

    #[async_trait]
    impl Dialog for LocalDialog {
        fn peer_id(&self) -> &Identity {
            &self.peer
        }

        async fn request(&self, _request: Request) -> DialogResult<Response> {
            Ok(Response::Ack)
        }

        fn respond(&self, kind: RequestKind, handler: Arc<dyn RequestHandler>) {
            self.handlers.lock().unwrap().push((kind, handler));
        }

        fn on_close(&self, observer: Box<dyn FnOnce() + Send>) {
            self.observers.lock().unwrap().push(observer);
        }

        fn is_closed(&self) -> bool {
            false
        }

        async fn close(&self) -> DialogResult<()> {
            self.drop_connection();
            Ok(())
        }
    }

    /// Counts destroy callbacks; fails when told to.
    struct CountingNegotiator {
        fail: bool,
        released: Arc<AtomicUsize>,
    }

    impl ConfigNegotiator for CountingNegotiator {
        fn provide_config(&self, _id: &SessionId, _consumer_config: &[u8]) -> SessionResult<Negotiated> {
            if self.fail {
                return Err(SessionError::ConfigNegotiationFailed("no capacity".into()));
            }
            let released = self.released.clone();
            let on_destroy: DestroyCallback = Box::new(move || {
                released.fetch_add(1, Ordering::SeqCst);
            });
            Ok((ServiceConfiguration::Noop, Some(on_destroy)))
        }
    }

    struct Fixture {
        sessions: Arc<SessionRegistry>,
        released: Arc<AtomicUsize>,
        handler: SessionDialogHandler,
    }

    fn fixture(fail: bool) -> Fixture {
        let sessions = Arc::new(SessionRegistry::new());
        let released = Arc::new(AtomicUsize::new(0));
        let mut proposal = ServiceProposal::new("0xprovider", "noop");
        proposal.id = 7;
        let handler = SessionDialogHandler::new(
            proposal,
            Arc::new(CountingNegotiator {
                fail,
                released: released.clone(),
            }),
            sessions.clone(),
            PromiseSettings::disabled(),
        );
        Fixture {
            sessions,
            released,
            handler,
        }
    }

    fn create_request(proposal_id: u64) -> Request {
        Request::SessionCreate(SessionCreateRequest {
            proposal_id,
            consumer_config: Vec::new(),
            ping_target: None,
        })
    }

    async fn created(dialog: &LocalDialog) -> SessionId {
        match dialog.send(create_request(7)).await {
            Response::SessionCreated(created) => created.session_id,
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[tokio::test]
    async fn create_then_destroy_runs_callback_once() {
        let f = fixture(false);
        let dialog = LocalDialog::new("0xconsumer");
        f.handler.handle(dialog.clone()).await.unwrap();

        let id = created(&dialog).await;
        assert_eq!(f.sessions.len(), 1);

        let destroy = Request::SessionDestroy { session_id: id.clone() };
        assert!(matches!(dialog.send(destroy.clone()).await, Response::SessionDestroyed));
        // Repeat destroy is a success
        assert!(matches!(dialog.send(destroy).await, Response::SessionDestroyed));
        assert_eq!(f.released.load(Ordering::SeqCst), 1);
        assert!(f.sessions.is_empty());
    }

    #[tokio::test]
    async fn negotiation_failure_leaves_no_session() {
        let f = fixture(true);
        let dialog = LocalDialog::new("0xconsumer");
        f.handler.handle(dialog.clone()).await.unwrap();

        let response = dialog.send(create_request(7)).await;
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::ConfigNegotiationFailed,
                ..
            }
        ));
        assert!(f.sessions.is_empty());
    }

    #[tokio::test]
    async fn wrong_proposal_is_rejected() {
        let f = fixture(false);
        let dialog = LocalDialog::new("0xconsumer");
        f.handler.handle(dialog.clone()).await.unwrap();

        assert!(matches!(
            dialog.send(create_request(8)).await,
            Response::Error {
                code: ErrorCode::InvalidProposal,
                ..
            }
        ));
        assert!(f.sessions.is_empty());
    }

    #[tokio::test]
    async fn destroy_unknown_session_is_not_found() {
        let f = fixture(false);
        let dialog = LocalDialog::new("0xconsumer");
        f.handler.handle(dialog.clone()).await.unwrap();

        let response = dialog
            .send(Request::SessionDestroy {
                session_id: SessionId::from("never-issued"),
            })
            .await;
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::SessionNotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn other_consumer_cannot_destroy() {
        let f = fixture(false);
        let owner = LocalDialog::new("0xowner");
        let other = LocalDialog::new("0xother");
        f.handler.handle(owner.clone()).await.unwrap();
        f.handler.handle(other.clone()).await.unwrap();

        let id = created(&owner).await;
        let response = other.send(Request::SessionDestroy { session_id: id }).await;
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::Forbidden,
                ..
            }
        ));
        assert_eq!(f.sessions.len(), 1);
    }

    #[tokio::test]
    async fn closing_dialog_destroys_its_sessions() {
        let f = fixture(false);
        let dialog = LocalDialog::new("0xconsumer");
        let bystander = LocalDialog::new("0xbystander");
        f.handler.handle(dialog.clone()).await.unwrap();
        f.handler.handle(bystander.clone()).await.unwrap();

        created(&dialog).await;
        created(&dialog).await;
        let kept = created(&bystander).await;

        dialog.close().await.unwrap();
        assert_eq!(f.sessions.len(), 1);
        assert!(f.sessions.contains(&kept));
        assert_eq!(f.released.load(Ordering::SeqCst), 2);
    }

    /// Drops the consumer's dialog while its session is being negotiated.
    struct ClosingNegotiator {
        dialog: Mutex<Option<Arc<LocalDialog>>>,
        released: Arc<AtomicUsize>,
    }

    impl ConfigNegotiator for ClosingNegotiator {
        fn provide_config(&self, _id: &SessionId, _consumer_config: &[u8]) -> SessionResult<Negotiated> {
            if let Some(dialog) = self.dialog.lock().unwrap().take() {
                dialog.drop_connection();
            }
            let released = self.released.clone();
            let on_destroy: DestroyCallback = Box::new(move || {
                released.fetch_add(1, Ordering::SeqCst);
            });
            Ok((ServiceConfiguration::Noop, Some(on_destroy)))
        }
    }

    #[tokio::test]
    async fn dialog_closed_during_create_leaves_no_session() {
        let sessions = Arc::new(SessionRegistry::new());
        let released = Arc::new(AtomicUsize::new(0));
        let dialog = LocalDialog::new("0xconsumer");
        let mut proposal = ServiceProposal::new("0xprovider", "noop");
        proposal.id = 7;
        let handler = SessionDialogHandler::new(
            proposal,
            Arc::new(ClosingNegotiator {
                dialog: Mutex::new(Some(dialog.clone())),
                released: released.clone(),
            }),
            sessions.clone(),
            PromiseSettings::disabled(),
        );
        handler.handle(dialog.clone()).await.unwrap();

        let response = dialog.send(create_request(7)).await;
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::Internal,
                ..
            }
        ));
        assert!(sessions.is_empty());
        assert_eq!(released.load(Ordering::SeqCst), 1);

        // Later creates on the dead dialog are refused outright
        assert!(matches!(dialog.send(create_request(7)).await, Response::Error { .. }));
        assert!(sessions.is_empty());
    }
}
