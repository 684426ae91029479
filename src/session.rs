//! Interactive query refinement sessions.
//!
//! A session walks `Created → Initialized → Refining → {Expired | Closed}`.
//! It is seeded by a nearest-neighbour query, then repeatedly refined from
//! positive and negative examples chosen by a user. Each session carries two
//! small locks: one for its lifecycle (state, in-flight count, last access)
//! and one for its feedback data. Ranking runs with neither held.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::classification::{Classification, ClassificationElement, ClassificationStore};
use crate::clock::Clock;
use crate::descriptor::{DescriptorElement, Vector};
use crate::error::{Error, Result};
use crate::index::{LshNearestNeighborsIndex, INDEX_NAMESPACE};
use crate::ranker::{RefineBudget, RelevanceRanker};

/// Label written for the relevance score when refine results are stored.
pub const POSITIVE_LABEL: &str = "positive";
/// Label written for `1 - score` when refine results are stored.
pub const NEGATIVE_LABEL: &str = "negative";

/// Per-session settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct SessionConfig {
    /// Idle time after which the reaper may expire the session.
    pub ttl_seconds: u64,
    /// Neighbours fetched per positive example when growing the candidate
    /// pool during refine.
    pub pool_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 30 * 60,
            pool_size: 200,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::InvalidConfig("pool_size must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Created,
    Initialized,
    Refining,
    Expired,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Expired | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Created => "created",
            SessionState::Initialized => "initialized",
            SessionState::Refining => "refining",
            SessionState::Expired => "expired",
            SessionState::Closed => "closed",
        })
    }
}

/// One entry of a session ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedId {
    pub uuid: String,
    /// Relevance in `[0, 1]`.
    pub score: f64,
}

#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
    busy: usize,
    last_access: Instant,
}

#[derive(Debug, Default)]
struct Feedback {
    seed: Option<Arc<Vector>>,
    positives: BTreeSet<String>,
    negatives: BTreeSet<String>,
    pool: BTreeSet<String>,
    ranking: Vec<RankedId>,
    /// Bumped by `reset` so a refine that straddles it is discarded.
    generation: u64,
}

struct ResultSink {
    store: Arc<dyn ClassificationStore>,
    type_label: String,
}

/// Relevance-feedback session bound to one index and one ranker.
pub struct IqrSession {
    id: String,
    created_at: Instant,
    config: SessionConfig,
    index: Arc<LshNearestNeighborsIndex>,
    ranker: Arc<dyn RelevanceRanker>,
    clock: Arc<dyn Clock>,
    sink: Option<ResultSink>,
    lifecycle: Mutex<Lifecycle>,
    feedback: Mutex<Feedback>,
}

/// Marks a session in-flight until dropped.
struct BusyGuard<'a> {
    session: &'a IqrSession,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut lc = self.session.lifecycle.lock();
        lc.busy = lc.busy.saturating_sub(1);
        lc.last_access = self.session.clock.now();
    }
}

impl IqrSession {
    pub fn new(
        id: impl Into<String>,
        index: Arc<LshNearestNeighborsIndex>,
        ranker: Arc<dyn RelevanceRanker>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            id: id.into(),
            created_at: now,
            config,
            index,
            ranker,
            clock,
            sink: None,
            lifecycle: Mutex::new(Lifecycle {
                state: SessionState::Created,
                busy: 0,
                last_access: now,
            }),
            feedback: Mutex::new(Feedback::default()),
        }
    }

    /// Write every refine result to `store` under `(type_label, uuid)` as
    /// `{positive: s, negative: 1 - s}`.
    pub fn with_classification_store(
        mut self,
        store: Arc<dyn ClassificationStore>,
        type_label: impl Into<String>,
    ) -> Self {
        self.sink = Some(ResultSink {
            store,
            type_label: type_label.into(),
        });
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<LshNearestNeighborsIndex> {
        &self.index
    }

    /// Current state. Readable in every state, including terminal ones, and
    /// does not count as an access.
    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    pub fn last_access(&self) -> Instant {
        self.lifecycle.lock().last_access
    }

    pub fn is_busy(&self) -> bool {
        self.lifecycle.lock().busy > 0
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn unavailable(&self, state: SessionState) -> Error {
        Error::SessionUnavailable {
            session: self.id.clone(),
            state: state.to_string(),
        }
    }

    fn enter(&self) -> Result<BusyGuard<'_>> {
        let mut lc = self.lifecycle.lock();
        if lc.state.is_terminal() {
            return Err(self.unavailable(lc.state));
        }
        lc.busy += 1;
        lc.last_access = self.clock.now();
        Ok(BusyGuard { session: self })
    }

    /// Refresh the last access without doing anything else.
    pub(crate) fn touch(&self) -> Result<()> {
        self.enter().map(drop)
    }

    fn require_state(&self, allowed: &[SessionState], op: &str) -> Result<SessionState> {
        let state = self.lifecycle.lock().state;
        if state.is_terminal() {
            return Err(self.unavailable(state));
        }
        if !allowed.contains(&state) {
            return Err(Error::InvalidState(format!(
                "cannot {op} session {} in state {state}",
                self.id
            )));
        }
        Ok(state)
    }

    fn set_state(&self, state: SessionState) -> Result<()> {
        let mut lc = self.lifecycle.lock();
        if lc.state.is_terminal() {
            return Err(self.unavailable(lc.state));
        }
        lc.state = state;
        Ok(())
    }

    /// Move to a terminal state and drop the feedback data. Returns `false` if
    /// the session was already terminal.
    fn terminate(&self, state: SessionState) -> bool {
        {
            let mut lc = self.lifecycle.lock();
            if lc.state.is_terminal() {
                return false;
            }
            lc.state = state;
        }
        *self.feedback.lock() = Feedback::default();
        true
    }

    /// Expire the session if it is idle past its TTL at `now`. A session with
    /// a call in flight is never expired. Returns whether the session is now
    /// terminal.
    pub(crate) fn expire_if_idle(&self, now: Instant) -> bool {
        {
            let mut lc = self.lifecycle.lock();
            if lc.state.is_terminal() {
                return true;
            }
            if lc.busy > 0 || now.saturating_duration_since(lc.last_access) <= self.config.ttl() {
                return false;
            }
            lc.state = SessionState::Expired;
        }
        *self.feedback.lock() = Feedback::default();
        info!(session = %self.id, "session expired");
        true
    }

    /// Close the session. Later calls fail with [`Error::SessionUnavailable`].
    /// Sessions are closed through [`IqrSessionManager::close`] so the
    /// registry drops them in the same step.
    ///
    /// [`IqrSessionManager::close`]: crate::manager::IqrSessionManager::close
    pub(crate) fn close(&self) -> Result<()> {
        if !self.terminate(SessionState::Closed) {
            return Err(self.unavailable(self.state()));
        }
        info!(session = %self.id, "session closed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    /// Seed the session: `query` becomes the first positive example and the
    /// ranking starts as its `n` nearest neighbours, scored `1 - distance`.
    pub fn initialize(&self, query: &DescriptorElement, n: usize) -> Result<Vec<RankedId>> {
        let _guard = self.enter()?;
        let mut fb = self.feedback.lock();
        self.require_state(&[SessionState::Created], "initialize")?;

        let vector = query.vector()?;
        let ranking: Vec<RankedId> = self
            .index
            .nn(vector.view(), n)?
            .into_iter()
            .map(|nb| RankedId {
                uuid: nb.uuid,
                score: nb.distance.closeness() as f64,
            })
            .collect();

        fb.seed = Some(vector);
        fb.pool = ranking.iter().map(|r| r.uuid.clone()).collect();
        fb.ranking = ranking.clone();
        self.set_state(SessionState::Initialized)?;

        info!(
            session = %self.id,
            query = query.uuid(),
            seeded = ranking.len(),
            "session initialized"
        );
        Ok(ranking)
    }

    // ------------------------------------------------------------------
    // Feedback
    // ------------------------------------------------------------------

    fn require_indexed(&self, uuid: &str) -> Result<()> {
        if self.index.contains(uuid) {
            Ok(())
        } else {
            Err(Error::not_found(INDEX_NAMESPACE, uuid))
        }
    }

    /// Mark `uuid` relevant. Fails with [`Error::Conflict`] if it is currently
    /// a negative example.
    pub fn add_positive(&self, uuid: &str) -> Result<()> {
        let _guard = self.enter()?;
        self.require_indexed(uuid)?;
        let mut fb = self.feedback.lock();
        if fb.negatives.contains(uuid) {
            return Err(Error::Conflict {
                uuid: uuid.to_string(),
            });
        }
        fb.positives.insert(uuid.to_string());
        Ok(())
    }

    /// Mark `uuid` not relevant. Fails with [`Error::Conflict`] if it is
    /// currently a positive example.
    pub fn add_negative(&self, uuid: &str) -> Result<()> {
        let _guard = self.enter()?;
        self.require_indexed(uuid)?;
        let mut fb = self.feedback.lock();
        if fb.positives.contains(uuid) {
            return Err(Error::Conflict {
                uuid: uuid.to_string(),
            });
        }
        fb.negatives.insert(uuid.to_string());
        Ok(())
    }

    /// Returns whether `uuid` was a positive example.
    pub fn remove_positive(&self, uuid: &str) -> Result<bool> {
        let _guard = self.enter()?;
        Ok(self.feedback.lock().positives.remove(uuid))
    }

    /// Returns whether `uuid` was a negative example.
    pub fn remove_negative(&self, uuid: &str) -> Result<bool> {
        let _guard = self.enter()?;
        Ok(self.feedback.lock().negatives.remove(uuid))
    }

    /// Apply a batch of feedback at once: drop `un_positive` and `un_negative`
    /// from their sets, then add `new_positive` and `new_negative`.
    ///
    /// The whole batch is checked first; on error nothing changes.
    pub fn adjudicate(
        &self,
        new_positive: &[&str],
        new_negative: &[&str],
        un_positive: &[&str],
        un_negative: &[&str],
    ) -> Result<()> {
        let _guard = self.enter()?;
        for uuid in new_positive.iter().chain(new_negative) {
            self.require_indexed(uuid)?;
        }
        if let Some(both) = new_positive.iter().find(|u| new_negative.contains(*u)) {
            return Err(Error::Conflict {
                uuid: both.to_string(),
            });
        }

        let mut fb = self.feedback.lock();
        let stays_negative = |u: &&&str| fb.negatives.contains(**u) && !un_negative.contains(*u);
        if let Some(conflict) = new_positive.iter().find(stays_negative) {
            return Err(Error::Conflict {
                uuid: conflict.to_string(),
            });
        }
        let stays_positive = |u: &&&str| fb.positives.contains(**u) && !un_positive.contains(*u);
        if let Some(conflict) = new_negative.iter().find(stays_positive) {
            return Err(Error::Conflict {
                uuid: conflict.to_string(),
            });
        }

        for uuid in un_positive {
            fb.positives.remove(*uuid);
        }
        for uuid in un_negative {
            fb.negatives.remove(*uuid);
        }
        fb.positives.extend(new_positive.iter().map(|u| u.to_string()));
        fb.negatives.extend(new_negative.iter().map(|u| u.to_string()));
        debug!(
            session = %self.id,
            positives = fb.positives.len(),
            negatives = fb.negatives.len(),
            "adjudicated"
        );
        Ok(())
    }

    pub fn positives(&self) -> Result<Vec<String>> {
        let _guard = self.enter()?;
        Ok(self.feedback.lock().positives.iter().cloned().collect())
    }

    pub fn negatives(&self) -> Result<Vec<String>> {
        let _guard = self.enter()?;
        Ok(self.feedback.lock().negatives.iter().cloned().collect())
    }

    // ------------------------------------------------------------------
    // Refine
    // ------------------------------------------------------------------

    fn example_vectors(&self, ids: &BTreeSet<String>) -> Result<Vec<Arc<Vector>>> {
        let mut vectors = Vec::with_capacity(ids.len());
        for uuid in ids {
            match self.index.descriptor(uuid) {
                Ok(element) => vectors.push(element.vector()?),
                // Removed from the index since it was adjudicated.
                Err(Error::NotFound { .. }) => {
                    debug!(session = %self.id, uuid = %uuid, "example no longer indexed")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(vectors)
    }

    /// Store `{positive: s, negative: 1 - s}` for every ranked id.
    fn write_back(sink: &ResultSink, ranking: &[RankedId]) -> Result<()> {
        for r in ranking {
            let result: Classification = [
                (POSITIVE_LABEL.to_string(), r.score),
                (NEGATIVE_LABEL.to_string(), 1.0 - r.score),
            ]
            .into_iter()
            .collect();
            ClassificationElement::new(
                Arc::clone(&sink.store),
                sink.type_label.as_str(),
                r.uuid.as_str(),
            )
            .set_classification(result)?;
        }
        Ok(())
    }

    /// Re-rank the candidate pool from the current examples.
    ///
    /// The pool grows by the `pool_size` nearest neighbours of every positive
    /// example. Ranking honours `budget`; on cancellation or timeout the
    /// previous ranking is kept.
    pub fn refine(&self, budget: &RefineBudget) -> Result<Vec<RankedId>> {
        let _guard = self.enter()?;
        let (seed, positive_ids, negative_ids, mut pool, generation) = {
            let fb = self.feedback.lock();
            self.require_state(&[SessionState::Initialized, SessionState::Refining], "refine")?;
            (
                fb.seed.clone(),
                fb.positives.clone(),
                fb.negatives.clone(),
                fb.pool.clone(),
                fb.generation,
            )
        };

        let mut positives: Vec<Arc<Vector>> = seed.into_iter().collect();
        positives.extend(self.example_vectors(&positive_ids)?);
        let negatives = self.example_vectors(&negative_ids)?;
        if positives.is_empty() {
            return Err(Error::InvalidState(format!(
                "session {} has no positive examples to refine from",
                self.id
            )));
        }

        for example in &positives {
            budget.check()?;
            for nb in self.index.nn(example.view(), self.config.pool_size)? {
                pool.insert(nb.uuid);
            }
        }
        let candidates: Vec<DescriptorElement> = pool
            .iter()
            .filter_map(|uuid| self.index.descriptor(uuid).ok())
            .collect();

        let scores = self.ranker.rank(&positives, &negatives, &candidates, budget)?;
        let mut ranking: Vec<RankedId> = scores
            .into_iter()
            .map(|(uuid, score)| RankedId { uuid, score })
            .collect();
        ranking.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.uuid.cmp(&b.uuid)));

        let mut fb = self.feedback.lock();
        {
            let mut lc = self.lifecycle.lock();
            if lc.state.is_terminal() {
                return Err(self.unavailable(lc.state));
            }
            if fb.generation != generation {
                return Err(Error::InvalidState(format!(
                    "session {} was reset during refine",
                    self.id
                )));
            }
            // Held across the write-back so close and reset wait for the commit.
            if let Some(sink) = &self.sink {
                Self::write_back(sink, &ranking)?;
            }
            lc.state = SessionState::Refining;
        }
        fb.pool = candidates.iter().map(|e| e.uuid().to_string()).collect();
        fb.ranking = ranking.clone();

        info!(
            session = %self.id,
            positives = positives.len(),
            negatives = negatives.len(),
            pool = fb.pool.len(),
            "session refined"
        );
        Ok(ranking)
    }

    /// The current ranking, best first.
    pub fn ranking(&self) -> Result<Vec<RankedId>> {
        let _guard = self.enter()?;
        Ok(self.feedback.lock().ranking.clone())
    }

    /// The first `n` entries of the current ranking.
    pub fn top(&self, n: usize) -> Result<Vec<RankedId>> {
        let _guard = self.enter()?;
        Ok(self.feedback.lock().ranking.iter().take(n).cloned().collect())
    }

    /// Forget the seed, examples, pool and ranking; back to `Created`.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.enter()?;
        let mut fb = self.feedback.lock();
        let generation = fb.generation + 1;
        *fb = Feedback {
            generation,
            ..Feedback::default()
        };
        self.set_state(SessionState::Created)?;
        info!(session = %self.id, "session reset");
        Ok(())
    }
}

impl fmt::Debug for IqrSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lc = self.lifecycle.lock();
        f.debug_struct("IqrSession")
            .field("id", &self.id)
            .field("state", &lc.state)
            .field("busy", &lc.busy)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::MemoryClassificationStore;
    use crate::clock::ManualClock;
    use crate::descriptor::DescriptorElementFactory;
    use crate::hash::HyperplaneFunctor;
    use crate::ranker::{CancelToken, KernelRanker};
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Fixture {
        factory: DescriptorElementFactory,
        index: Arc<LshNearestNeighborsIndex>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let factory = DescriptorElementFactory::in_memory();
        let functor = HyperplaneFunctor::random(3, 8, &mut StdRng::seed_from_u64(3)).unwrap();
        let index = LshNearestNeighborsIndex::builder()
            .functor(Arc::new(functor))
            .build()
            .unwrap();
        let points = [
            ("a", [1.0, 0.0, 0.0]),
            ("b", [0.9, 0.1, 0.0]),
            ("c", [0.0, 1.0, 0.0]),
            ("d", [0.0, 0.9, 0.1]),
            ("e", [0.0, 0.0, 1.0]),
        ];
        let elements = points
            .iter()
            .map(|(id, v)| factory.create("t", id, array![v[0], v[1], v[2]]).unwrap())
            .collect::<Vec<_>>();
        index.build_index(elements).unwrap();
        Fixture {
            factory,
            index: Arc::new(index),
            clock: Arc::new(ManualClock::new()),
        }
    }

    fn session(fx: &Fixture) -> IqrSession {
        IqrSession::new(
            "s1",
            Arc::clone(&fx.index),
            Arc::new(KernelRanker::default()),
            SessionConfig::default(),
            fx.clock.clone(),
        )
    }

    fn query(fx: &Fixture) -> DescriptorElement {
        fx.factory.create("q", "query", array![1.0, 0.05, 0.0]).unwrap()
    }

    #[test]
    fn test_state_transitions() {
        let fx = fixture();
        let s = session(&fx);
        assert_eq!(s.state(), SessionState::Created);

        let seeded = s.initialize(&query(&fx), 3).unwrap();
        assert_eq!(seeded.len(), 3);
        assert_eq!(seeded[0].uuid, "a");
        assert_eq!(s.state(), SessionState::Initialized);

        assert!(matches!(
            s.initialize(&query(&fx), 3),
            Err(Error::InvalidState(_))
        ));

        s.add_negative("e").unwrap();
        s.refine(&RefineBudget::unlimited()).unwrap();
        assert_eq!(s.state(), SessionState::Refining);

        s.reset().unwrap();
        assert_eq!(s.state(), SessionState::Created);
        assert!(s.ranking().unwrap().is_empty());
    }

    #[test]
    fn test_refine_before_initialize_fails() {
        let fx = fixture();
        let s = session(&fx);
        let err = s.refine(&RefineBudget::unlimited()).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)), "got: {err:?}");
    }

    #[test]
    fn test_refine_ranks_positive_side_first() {
        let fx = fixture();
        let s = session(&fx);
        s.initialize(&query(&fx), 2).unwrap();
        s.add_positive("b").unwrap();
        s.add_negative("c").unwrap();
        s.add_negative("e").unwrap();

        let ranking = s.refine(&RefineBudget::unlimited()).unwrap();
        assert_eq!(ranking.len(), 5);
        assert!(ranking.windows(2).all(|w| w[0].score >= w[1].score));
        let first_two: BTreeSet<&str> = ranking[..2].iter().map(|r| r.uuid.as_str()).collect();
        assert_eq!(first_two, ["a", "b"].into_iter().collect());
        assert_eq!(s.top(1).unwrap()[0].uuid, ranking[0].uuid);
    }

    #[test]
    fn test_conflict_and_recovery() {
        let fx = fixture();
        let s = session(&fx);
        s.add_positive("a").unwrap();
        let err = s.add_negative("a").unwrap_err();
        assert!(matches!(err, Error::Conflict { ref uuid } if uuid == "a"));

        assert!(s.remove_positive("a").unwrap());
        s.add_negative("a").unwrap();
        assert_eq!(s.negatives().unwrap(), vec!["a".to_string()]);
        assert!(s.positives().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_example_rejected() {
        let fx = fixture();
        let s = session(&fx);
        assert!(matches!(
            s.add_positive("zzz"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_adjudicate_is_all_or_nothing() {
        let fx = fixture();
        let s = session(&fx);
        s.add_negative("c").unwrap();

        let err = s.adjudicate(&["a", "c"], &["e"], &[], &[]).unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert!(s.positives().unwrap().is_empty());

        s.adjudicate(&["a", "c"], &["e"], &[], &["c"]).unwrap();
        assert_eq!(s.positives().unwrap(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(s.negatives().unwrap(), vec!["e".to_string()]);

        assert!(s.adjudicate(&["b"], &["b"], &[], &[]).is_err());
    }

    #[test]
    fn test_closed_session_is_unavailable() {
        let fx = fixture();
        let s = session(&fx);
        s.close().unwrap();
        assert_eq!(s.state(), SessionState::Closed);
        assert!(matches!(
            s.add_positive("a"),
            Err(Error::SessionUnavailable { .. })
        ));
        assert!(matches!(s.close(), Err(Error::SessionUnavailable { .. })));
    }

    #[test]
    fn test_expiry_respects_ttl() {
        let fx = fixture();
        let s = session(&fx);
        let ttl = s.config().ttl();

        fx.clock.advance(ttl);
        assert!(!s.expire_if_idle(fx.clock.now()));
        s.ranking().unwrap();

        fx.clock.advance(ttl + Duration::from_secs(1));
        assert!(s.expire_if_idle(fx.clock.now()));
        assert!(matches!(s.ranking(), Err(Error::SessionUnavailable { .. })));
    }

    #[test]
    fn test_busy_session_not_expired() {
        let fx = fixture();
        let s = session(&fx);
        let guard = s.enter().unwrap();
        fx.clock.advance(s.config().ttl() * 2);
        assert!(!s.expire_if_idle(fx.clock.now()));
        drop(guard);
        assert!(!s.expire_if_idle(fx.clock.now()));
        fx.clock.advance(s.config().ttl() * 2);
        assert!(s.expire_if_idle(fx.clock.now()));
    }

    #[test]
    fn test_cancelled_refine_keeps_ranking() {
        let fx = fixture();
        let s = session(&fx);
        let seeded = s.initialize(&query(&fx), 3).unwrap();

        let token = CancelToken::new();
        token.cancel();
        let err = s
            .refine(&RefineBudget::unlimited().with_cancel(token))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(s.ranking().unwrap(), seeded);
        assert_eq!(s.state(), SessionState::Initialized);
    }

    /// Closes or resets its session from inside `rank`.
    #[derive(Debug)]
    struct InterruptingRanker {
        session: Mutex<Option<Arc<IqrSession>>>,
        reset: bool,
    }

    impl RelevanceRanker for InterruptingRanker {
        fn rank(
            &self,
            positives: &[Arc<Vector>],
            negatives: &[Arc<Vector>],
            pool: &[DescriptorElement],
            budget: &RefineBudget,
        ) -> Result<Vec<(String, f64)>> {
            if let Some(session) = self.session.lock().take() {
                if self.reset {
                    session.reset().unwrap();
                } else {
                    session.close().unwrap();
                }
            }
            KernelRanker::default().rank(positives, negatives, pool, budget)
        }
    }

    #[test]
    fn test_interrupted_refine_stores_nothing() {
        for reset in [false, true] {
            let fx = fixture();
            let store = Arc::new(MemoryClassificationStore::new());
            let ranker = Arc::new(InterruptingRanker {
                session: Mutex::new(None),
                reset,
            });
            let s = Arc::new(
                IqrSession::new(
                    "s1",
                    Arc::clone(&fx.index),
                    ranker.clone(),
                    SessionConfig::default(),
                    fx.clock.clone(),
                )
                .with_classification_store(store.clone(), "iqr"),
            );
            s.initialize(&query(&fx), 2).unwrap();
            *ranker.session.lock() = Some(Arc::clone(&s));

            let err = s.refine(&RefineBudget::unlimited()).unwrap_err();
            if reset {
                assert!(matches!(err, Error::InvalidState(_)), "got: {err:?}");
                assert_eq!(s.state(), SessionState::Created);
                assert!(s.ranking().unwrap().is_empty());
            } else {
                assert!(matches!(err, Error::SessionUnavailable { .. }), "got: {err:?}");
                assert_eq!(s.state(), SessionState::Closed);
            }
            assert!(store.is_empty(), "refine that lost the race stored results");
        }
    }

    #[test]
    fn test_results_written_to_classification_store() {
        let fx = fixture();
        let store = Arc::new(MemoryClassificationStore::new());
        let s = session(&fx).with_classification_store(store.clone(), "iqr");
        s.initialize(&query(&fx), 2).unwrap();
        let ranking = s.refine(&RefineBudget::unlimited()).unwrap();

        assert_eq!(store.len(), ranking.len());
        let top = store.get("iqr", &ranking[0].uuid).unwrap();
        assert!((top[POSITIVE_LABEL] + top[NEGATIVE_LABEL] - 1.0).abs() < 1e-12);
        assert!((top[POSITIVE_LABEL] - ranking[0].score).abs() < 1e-12);
    }
}
