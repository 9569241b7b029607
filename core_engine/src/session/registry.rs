//! In-memory authority for active sessions.

use mesh_dialog::SessionId;
use shared_utils::identity::Identity;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::{DestroyCallback, Session, SessionError, SessionResult};
use crate::promise::PromiseProcessor;

/// Produces candidate session IDs.
pub type IdGenerator = Box<dyn Fn() -> SessionId + Send + Sync>;

/// Fresh IDs tried before allocation gives up
const MAX_ID_ATTEMPTS: usize = 16;

/// Destroyed IDs remembered for idempotent destroy and to prevent reuse
const MAX_TOMBSTONES: usize = 10_000;

struct Entry {
    session: Session,
    processor: Arc<dyn PromiseProcessor>,
    on_destroy: Option<DestroyCallback>,
}

impl Entry {
    /// Stop promise processing, then release negotiated resources.
    fn teardown(self) {
        if let Err(e) = self.processor.stop() {
            warn!(session_id = %self.session.id, "Failed to stop promise processor: {}", e);
        }
        if let Some(on_destroy) = self.on_destroy {
            on_destroy();
        }
    }
}

#[derive(Default)]
struct State {
    sessions: HashMap<SessionId, Entry>,
    /// Allocated but not yet inserted; invisible to lookups
    reserved: HashSet<SessionId>,
    tombstones: HashSet<SessionId>,
    tombstone_order: VecDeque<SessionId>,
    closed: bool,
}

impl State {
    fn is_taken(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id) || self.reserved.contains(id) || self.tombstones.contains(id)
    }

    fn bury(&mut self, id: SessionId) {
        if self.tombstones.insert(id.clone()) {
            self.tombstone_order.push_back(id);
        }
        while self.tombstone_order.len() > MAX_TOMBSTONES {
            if let Some(oldest) = self.tombstone_order.pop_front() {
                self.tombstones.remove(&oldest);
            }
        }
    }
}

/// Thread-safe mapping from session ID to session.
///
/// Every operation runs under one lock, so a session is either fully
/// visible or absent. Creation is two-phase: [`reserve`](Self::reserve) an
/// ID, negotiate, then [`insert`](Self::insert) or [`release`](Self::release).
pub struct SessionRegistry {
    state: Mutex<State>,
    generate_id: IdGenerator,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_id_generator(Box::new(SessionId::random))
    }

    /// Registry drawing IDs from `generate_id`.
    pub fn with_id_generator(generate_id: IdGenerator) -> Self {
        Self {
            state: Mutex::new(State::default()),
            generate_id,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve a fresh ID, retrying on collision with any live, reserved or
    /// destroyed one.
    pub fn reserve(&self) -> SessionResult<SessionId> {
        let mut state = self.lock();
        if state.closed {
            return Err(SessionError::RegistryClosed);
        }

        for attempt in 1..=MAX_ID_ATTEMPTS {
            let id = (self.generate_id)();
            if state.is_taken(&id) {
                warn!(session_id = %id, attempt, "Generated session ID already in use, retrying");
                continue;
            }
            state.reserved.insert(id.clone());
            return Ok(id);
        }

        Err(SessionError::IdExhausted(MAX_ID_ATTEMPTS))
    }

    /// Give back a reserved ID after a failed create.
    pub fn release(&self, id: &SessionId) {
        self.lock().reserved.remove(id);
    }

    /// Make a session visible.
    ///
    /// A collision with a live session is an internal fault: the new entry
    /// is torn down and the existing one is left untouched.
    pub fn insert(
        &self,
        session: Session,
        processor: Arc<dyn PromiseProcessor>,
        on_destroy: Option<DestroyCallback>,
    ) -> SessionResult<()> {
        let entry = Entry {
            session,
            processor,
            on_destroy,
        };
        let id = entry.session.id.clone();

        let mut state = self.lock();
        state.reserved.remove(&id);

        let rejection = if state.closed {
            Some(SessionError::RegistryClosed)
        } else if state.sessions.contains_key(&id) || state.tombstones.contains(&id) {
            error!(session_id = %id, "Session ID collision on insert");
            Some(SessionError::Collision(id.clone()))
        } else {
            None
        };

        if let Some(err) = rejection {
            drop(state);
            entry.teardown();
            return Err(err);
        }

        info!(session_id = %id, consumer = %entry.session.consumer, "Session created");
        state.sessions.insert(id, entry);
        Ok(())
    }

    pub fn find(&self, id: &SessionId) -> Option<Session> {
        self.lock().sessions.get(id).map(|e| e.session.clone())
    }

    /// Session and its promise processor.
    pub fn find_with_processor(
        &self,
        id: &SessionId,
    ) -> Option<(Session, Arc<dyn PromiseProcessor>)> {
        self.lock()
            .sessions
            .get(id)
            .map(|e| (e.session.clone(), Arc::clone(&e.processor)))
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.lock().sessions.contains_key(id)
    }

    /// IDs of live sessions owned by `consumer`.
    pub fn sessions_of(&self, consumer: &Identity) -> Vec<SessionId> {
        self.lock()
            .sessions
            .values()
            .filter(|e| &e.session.consumer == consumer)
            .map(|e| e.session.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy a session.
    ///
    /// Returns `Ok(true)` if it was live and `Ok(false)` if it had already
    /// been destroyed. Promise processing stops before the entry disappears;
    /// the destroy callback runs after, outside the lock.
    pub fn destroy(&self, id: &SessionId) -> SessionResult<bool> {
        let entry = {
            let mut state = self.lock();
            let Some(entry) = state.sessions.get(id) else {
                if state.tombstones.contains(id) {
                    debug!(session_id = %id, "Session already destroyed");
                    return Ok(false);
                }
                return Err(SessionError::NotFound(id.clone()));
            };

            if let Err(e) = entry.processor.stop() {
                warn!(session_id = %id, "Failed to stop promise processor: {}", e);
            }
            let entry = state.sessions.remove(id);
            state.bury(id.clone());
            entry
        };

        if let Some(on_destroy) = entry.and_then(|e| e.on_destroy) {
            on_destroy();
        }
        info!(session_id = %id, "Session destroyed");
        Ok(true)
    }

    /// Destroy every live session and refuse new ones. Returns how many were destroyed.
    pub fn close(&self) -> usize {
        let entries: Vec<Entry> = {
            let mut state = self.lock();
            state.closed = true;
            state.reserved.clear();
            let entries: Vec<Entry> = state.sessions.drain().map(|(_, e)| e).collect();
            for entry in &entries {
                state.bury(entry.session.id.clone());
            }
            entries
        };

        let count = entries.len();
        for entry in entries {
            debug!(session_id = %entry.session.id, "Destroying session on shutdown");
            entry.teardown();
        }
        if count > 0 {
            info!(count, "Destroyed remaining sessions");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::promise::{NoopPromiseProcessor, PromiseResult};
    use mesh_dialog::SignedPromise;
    use shared_utils::market::ServiceProposal;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Records whether it was stopped.
    #[derive(Default)]
    struct RecordingProcessor {
        stopped: AtomicBool,
    }

    impl PromiseProcessor for RecordingProcessor {
        fn start(&self, _proposal: &ServiceProposal) -> PromiseResult<()> {
            Ok(())
        }

        fn stop(&self) -> PromiseResult<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn process(&self, _promise: &SignedPromise) -> PromiseResult<()> {
            Ok(())
        }
    }

    fn session(id: &SessionId) -> Session {
        Session::new(id.clone(), Identity::from_address("0xc"), 1, b"{}".to_vec())
    }

    fn noop() -> Arc<dyn PromiseProcessor> {
        Arc::new(NoopPromiseProcessor::default())
    }

    fn sequence(ids: &[&str]) -> IdGenerator {
        let ids: Vec<SessionId> = ids.iter().map(|id| SessionId::from(*id)).collect();
        let next = AtomicUsize::new(0);
        Box::new(move || {
            let i = next.fetch_add(1, Ordering::SeqCst);
            ids[i.min(ids.len() - 1)].clone()
        })
    }

    #[test]
    fn test_reserve_insert_find() {
        let registry = SessionRegistry::new();
        let id = registry.reserve().unwrap();

        // Reserved IDs stay invisible until inserted
        assert!(registry.find(&id).is_none());

        registry.insert(session(&id), noop(), None).unwrap();
        assert_eq!(registry.find(&id).unwrap().id, id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reserve_retries_on_collision() {
        let registry = SessionRegistry::with_id_generator(sequence(&["a", "a", "b"]));

        let first = registry.reserve().unwrap();
        let second = registry.reserve().unwrap();
        assert_eq!(first, SessionId::from("a"));
        assert_eq!(second, SessionId::from("b"));
    }

    #[test]
    fn test_reserve_gives_up() {
        let registry = SessionRegistry::with_id_generator(sequence(&["a"]));
        registry.reserve().unwrap();
        assert!(matches!(
            registry.reserve(),
            Err(SessionError::IdExhausted(_))
        ));
    }

    #[test]
    fn test_insert_collision_never_overwrites() {
        let registry = SessionRegistry::new();
        let id = SessionId::from("dup");
        registry.insert(session(&id), noop(), None).unwrap();

        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        let rejected = Arc::new(RecordingProcessor::default());
        let err = registry
            .insert(
                Session::new(id.clone(), Identity::from_address("0xother"), 1, Vec::new()),
                rejected.clone(),
                Some(Box::new(move || flag.store(true, Ordering::SeqCst))),
            )
            .unwrap_err();

        assert!(matches!(err, SessionError::Collision(_)));
        assert_eq!(registry.find(&id).unwrap().consumer.address, "0xc");
        assert!(rejected.stopped.load(Ordering::SeqCst));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let registry = SessionRegistry::new();
        let id = registry.reserve().unwrap();
        let processor = Arc::new(RecordingProcessor::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry
            .insert(
                session(&id),
                processor.clone(),
                Some(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        assert!(registry.destroy(&id).unwrap());
        assert!(processor.stopped.load(Ordering::SeqCst));
        assert!(!registry.destroy(&id).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_destroy_unknown_session() {
        let registry = SessionRegistry::new();
        assert!(matches!(
            registry.destroy(&SessionId::from("never")),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn test_destroyed_ids_are_not_reused() {
        let registry = SessionRegistry::with_id_generator(sequence(&["a", "a", "b"]));
        let id = registry.reserve().unwrap();
        registry.insert(session(&id), noop(), None).unwrap();
        registry.destroy(&id).unwrap();

        assert_eq!(registry.reserve().unwrap(), SessionId::from("b"));
    }

    #[test]
    fn test_close_destroys_everything() {
        let registry = SessionRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let id = registry.reserve().unwrap();
            let counter = calls.clone();
            registry
                .insert(
                    session(&id),
                    noop(),
                    Some(Box::new(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })),
                )
                .unwrap();
        }

        assert_eq!(registry.close(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
        assert!(matches!(
            registry.reserve(),
            Err(SessionError::RegistryClosed)
        ));
    }

    #[test]
    fn test_sessions_of_consumer() {
        let registry = SessionRegistry::new();
        let id = registry.reserve().unwrap();
        registry.insert(session(&id), noop(), None).unwrap();

        assert_eq!(
            registry.sessions_of(&Identity::from_address("0xc")),
            vec![id]
        );
        assert!(registry
            .sessions_of(&Identity::from_address("0xother"))
            .is_empty());
    }
}
