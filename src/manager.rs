//! Process-wide registry of IQR sessions with opt-in idle expiry.

use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classification::ClassificationStore;
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::index::LshNearestNeighborsIndex;
use crate::ranker::RelevanceRanker;
use crate::session::{IqrSession, SessionConfig, SessionState};

/// Namespace reported in [`Error::NotFound`] for unknown session ids.
pub const SESSION_NAMESPACE: &str = "iqr-session";

/// Settings for an [`IqrSessionManager`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct ManagerConfig {
    /// Applied to every session the manager creates.
    pub session: SessionConfig,
    /// Idle sessions are only ever expired when this is set.
    pub expiration_enabled: bool,
    /// Period of the background reaper.
    pub reap_interval_seconds: u64,
    /// How many closed or expired ids are remembered, so that lookups report
    /// them as unavailable rather than unknown.
    pub retired_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            expiration_enabled: false,
            reap_interval_seconds: 30,
            retired_capacity: 4096,
        }
    }
}

impl ManagerConfig {
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        if self.reap_interval_seconds == 0 {
            return Err(Error::InvalidConfig(
                "reap_interval_seconds must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Bounded memory of ids that left the registry, oldest forgotten first.
#[derive(Debug, Default)]
struct Retired {
    order: VecDeque<String>,
    states: HashMap<String, SessionState>,
}

impl Retired {
    fn insert(&mut self, id: String, state: SessionState, capacity: usize) {
        if capacity == 0 {
            return;
        }
        if self.states.insert(id.clone(), state).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > capacity {
            if let Some(old) = self.order.pop_front() {
                self.states.remove(&old);
            }
        }
    }
}

struct SessionSink {
    store: Arc<dyn ClassificationStore>,
    type_label: String,
}

/// Registry of live sessions.
///
/// The id → session map sits behind one `RwLock`, held only for lookups and
/// membership changes; session work happens under each session's own locks.
pub struct IqrSessionManager {
    sessions: RwLock<HashMap<String, Arc<IqrSession>>>,
    retired: Mutex<Retired>,
    config: ManagerConfig,
    clock: Arc<dyn Clock>,
    sink: Option<SessionSink>,
}

impl std::fmt::Debug for IqrSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IqrSessionManager")
            .field("sessions", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

impl IqrSessionManager {
    pub fn new(config: ManagerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ManagerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sessions: RwLock::new(HashMap::new()),
            retired: Mutex::new(Retired::default()),
            config,
            clock,
            sink: None,
        })
    }

    /// Have every session created from now on store its refine results in
    /// `store` under `type_label`.
    pub fn with_classification_store(
        mut self,
        store: Arc<dyn ClassificationStore>,
        type_label: impl Into<String>,
    ) -> Self {
        self.sink = Some(SessionSink {
            store,
            type_label: type_label.into(),
        });
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Create a session under a fresh v4 UUID.
    pub fn create_session(
        &self,
        index: Arc<LshNearestNeighborsIndex>,
        ranker: Arc<dyn RelevanceRanker>,
    ) -> Result<Arc<IqrSession>> {
        self.create_session_with_id(Uuid::new_v4().to_string(), index, ranker)
    }

    /// Create a session under a caller-chosen id. Ids of live or retired
    /// sessions cannot be reused.
    pub fn create_session_with_id(
        &self,
        id: impl Into<String>,
        index: Arc<LshNearestNeighborsIndex>,
        ranker: Arc<dyn RelevanceRanker>,
    ) -> Result<Arc<IqrSession>> {
        let id = id.into();
        let mut session = IqrSession::new(
            id.clone(),
            index,
            ranker,
            self.config.session.clone(),
            Arc::clone(&self.clock),
        );
        if let Some(sink) = &self.sink {
            session =
                session.with_classification_store(Arc::clone(&sink.store), sink.type_label.clone());
        }
        let session = Arc::new(session);

        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) || self.retired.lock().states.contains_key(&id) {
            return Err(Error::InvalidState(format!("session id {id} is already in use")));
        }
        sessions.insert(id.clone(), Arc::clone(&session));
        info!(session = %id, live = sessions.len(), "session created");
        Ok(session)
    }

    fn unavailable(id: &str, state: SessionState) -> Error {
        Error::SessionUnavailable {
            session: id.to_string(),
            state: state.to_string(),
        }
    }

    /// Look up a live session and refresh its last access.
    ///
    /// Unknown ids fail with [`Error::NotFound`]; closed or expired ones with
    /// [`Error::SessionUnavailable`].
    pub fn get(&self, id: &str) -> Result<Arc<IqrSession>> {
        let session = self.sessions.read().get(id).cloned();
        match session {
            Some(session) => {
                session.touch()?;
                Ok(session)
            }
            None => match self.retired.lock().states.get(id) {
                Some(&state) => Err(Self::unavailable(id, state)),
                None => Err(Error::not_found(SESSION_NAMESPACE, id)),
            },
        }
    }

    /// Close a session and drop it from the registry.
    pub fn close(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.write();
        let Some(session) = sessions.remove(id) else {
            drop(sessions);
            return match self.retired.lock().states.get(id) {
                Some(&state) => Err(Self::unavailable(id, state)),
                None => Err(Error::not_found(SESSION_NAMESPACE, id)),
            };
        };
        if session.close().is_err() {
            debug!(session = %id, state = %session.state(), "session was already terminal");
        }
        self.retire(id.to_string(), session.state());
        Ok(())
    }

    fn retire(&self, id: String, state: SessionState) {
        self.retired
            .lock()
            .insert(id, state, self.config.retired_capacity);
    }

    /// Expire and evict every session idle longer than its TTL. Sessions with
    /// a call in flight are skipped. Does nothing unless expiration is
    /// enabled. Returns the evicted ids.
    pub fn reap_expired(&self) -> Vec<String> {
        if !self.config.expiration_enabled {
            return Vec::new();
        }
        let now = self.clock.now();
        let mut evicted = Vec::new();
        {
            let mut sessions = self.sessions.write();
            sessions.retain(|id, session| {
                if !session.expire_if_idle(now) {
                    return true;
                }
                evicted.push((id.clone(), session.state()));
                false
            });
            // An id is always either registered or retired.
            for (id, state) in &evicted {
                self.retire(id.clone(), *state);
            }
        }
        let ids: Vec<String> = evicted.into_iter().map(|(id, _)| id).collect();
        if !ids.is_empty() {
            info!(reaped = ids.len(), live = self.len(), "reaped idle sessions");
        }
        ids
    }

    /// Run [`reap_expired`](Self::reap_expired) every `reap_interval` on a
    /// background thread until the returned handle is dropped.
    ///
    /// The thread holds only a weak reference, so it also stops once the
    /// manager itself is gone.
    pub fn spawn_reaper(self: &Arc<Self>) -> Result<ReaperHandle> {
        let (stop, stopped) = mpsc::channel::<()>();
        let manager: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.reap_interval();
        let thread = std::thread::Builder::new()
            .name("iqr-reaper".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match manager.upgrade() {
                        Some(manager) => {
                            manager.reap_expired();
                        }
                        None => break,
                    },
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| Error::InvalidState(format!("failed to spawn reaper thread: {e}")))?;
        debug!(interval_secs = interval.as_secs(), "reaper started");
        Ok(ReaperHandle {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    /// Close every session. Used at teardown; returns how many were closed.
    pub fn drain(&self) -> usize {
        let mut sessions = self.sessions.write();
        let count = sessions.len();
        for (id, session) in sessions.drain() {
            let _ = session.close();
            self.retire(id, session.state());
        }
        drop(sessions);
        info!(closed = count, "session manager drained");
        count
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of live sessions, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Stops the background reaper when dropped.
#[derive(Debug)]
pub struct ReaperHandle {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("reaper thread panicked");
            }
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
