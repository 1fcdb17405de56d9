//! StateMachine: table lookup plus a versioned conditional update.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use crate::error::TransitionError;
use crate::table::{Symbol, TransitionTable};

/// An entity whose current state in one dimension can be read.
///
/// An entity may implement this for several state types (a host has both a
/// connectivity status and an administrative resource state).
pub trait Stateful<S> {
    fn current_state(&self) -> S;
}

/// Persistence seam for a state machine.
///
/// `update_state` must apply `current -> next` as a single conditional write
/// keyed on the entity's snapshot (id, state, version and any extra
/// predicate fields), returning `true` only if exactly one row matched.
/// It must not touch fields unrelated to the transition.
pub trait StateDao<S, E> {
    type Entity;
    type Context;
    type Error;

    fn update_state(
        &self,
        current: S,
        event: E,
        next: S,
        entity: &Self::Entity,
        ctx: &Self::Context,
    ) -> Result<bool, Self::Error>;
}

/// Observer notified around every attempted transition.
pub trait StateListener<S, E, V>: Send + Sync {
    fn pre_transition(&self, _from: S, _event: E, _to: S, _entity: &V) {}

    /// Called after the store answered. `committed` is false on a lost race.
    fn post_transition(&self, from: S, event: E, to: S, entity: &V, committed: bool);
}

/// A named transition table with listeners.
pub struct StateMachine<S, E, V> {
    name: &'static str,
    table: TransitionTable<S, E>,
    listeners: RwLock<Vec<Arc<dyn StateListener<S, E, V>>>>,
}

impl<S: Symbol, E: Symbol, V: Stateful<S>> StateMachine<S, E, V> {
    pub fn new(name: &'static str, table: TransitionTable<S, E>) -> Self {
        Self {
            name,
            table,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn table(&self) -> &TransitionTable<S, E> {
        &self.table
    }

    pub fn next_state(&self, from: S, event: E) -> Option<S> {
        self.table.next_state(from, event)
    }

    pub fn register_listener(&self, listener: Arc<dyn StateListener<S, E, V>>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Apply `event` to the caller's snapshot of `entity`.
    ///
    /// Returns `Ok(true)` if the transition committed and `Ok(false)` if the
    /// persisted row no longer matches the snapshot. An undefined
    /// `(state, event)` pair fails before the DAO is consulted.
    pub fn transit<D>(
        &self,
        entity: &V,
        event: E,
        ctx: &D::Context,
        dao: &D,
    ) -> Result<bool, TransitionError<D::Error>>
    where
        D: StateDao<S, E, Entity = V>,
    {
        let current = entity.current_state();
        let Some(next) = self.table.next_state(current, event) else {
            warn!(machine = self.name, state = ?current, ?event, "no transition defined");
            return Err(TransitionError::NoTransition {
                machine: self.name,
                state: format!("{current:?}"),
                event: format!("{event:?}"),
            });
        };

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in &listeners {
            listener.pre_transition(current, event, next, entity);
        }

        let committed = dao
            .update_state(current, event, next, entity, ctx)
            .map_err(TransitionError::Store)?;

        if committed {
            debug!(
                machine = self.name,
                from = ?current,
                to = ?next,
                ?event,
                "transition committed"
            );
        } else {
            debug!(
                machine = self.name,
                from = ?current,
                ?event,
                "stale snapshot, transition not applied"
            );
        }

        for listener in &listeners {
            listener.post_transition(current, event, next, entity, committed);
        }
        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, Mutex};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Phase {
        Idle,
        Busy,
        Done,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Signal {
        Begin,
        Finish,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Job {
        id: u32,
        phase: Phase,
        updated: u64,
    }

    impl Stateful<Phase> for Job {
        fn current_state(&self) -> Phase {
            self.phase
        }
    }

    /// In-memory DAO with the same conditional-update contract as the real store.
    #[derive(Default)]
    struct MemDao {
        rows: Mutex<HashMap<u32, Job>>,
        writes: AtomicUsize,
    }

    impl MemDao {
        fn insert(&self, job: Job) {
            self.rows.lock().unwrap().insert(job.id, job);
        }

        fn get(&self, id: u32) -> Job {
            self.rows.lock().unwrap()[&id].clone()
        }
    }

    impl StateDao<Phase, Signal> for MemDao {
        type Entity = Job;
        type Context = ();
        type Error = std::io::Error;

        fn update_state(
            &self,
            current: Phase,
            _event: Signal,
            next: Phase,
            entity: &Job,
            _ctx: &(),
        ) -> Result<bool, std::io::Error> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let mut rows = self.rows.lock().unwrap();
            match rows.get_mut(&entity.id) {
                Some(row) if row.phase == current && row.updated == entity.updated => {
                    row.phase = next;
                    row.updated += 1;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    struct FailingDao;

    impl StateDao<Phase, Signal> for FailingDao {
        type Entity = Job;
        type Context = ();
        type Error = std::io::Error;

        fn update_state(
            &self,
            _: Phase,
            _: Signal,
            _: Phase,
            _: &Job,
            _: &(),
        ) -> Result<bool, std::io::Error> {
            Err(std::io::Error::other("connection reset"))
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(Phase, Phase, bool)>>,
    }

    impl StateListener<Phase, Signal, Job> for Recorder {
        fn post_transition(
            &self,
            from: Phase,
            _event: Signal,
            to: Phase,
            _entity: &Job,
            committed: bool,
        ) {
            self.seen.lock().unwrap().push((from, to, committed));
        }
    }

    fn machine() -> StateMachine<Phase, Signal, Job> {
        StateMachine::new(
            "job",
            TransitionTable::new()
                .with(Phase::Idle, Signal::Begin, Phase::Busy)
                .with(Phase::Busy, Signal::Finish, Phase::Done),
        )
    }

    fn job() -> Job {
        Job {
            id: 1,
            phase: Phase::Idle,
            updated: 3,
        }
    }

    #[test]
    fn committed_transition_bumps_version_by_one() {
        let dao = MemDao::default();
        dao.insert(job());

        assert!(machine().transit(&job(), Signal::Begin, &(), &dao).unwrap());
        let row = dao.get(1);
        assert_eq!(row.phase, Phase::Busy);
        assert_eq!(row.updated, 4);
    }

    #[test]
    fn stale_snapshot_returns_false_and_leaves_row() {
        let dao = MemDao::default();
        dao.insert(job());
        let m = machine();

        assert!(m.transit(&job(), Signal::Begin, &(), &dao).unwrap());
        // Same snapshot again: the row moved on.
        assert!(!m.transit(&job(), Signal::Begin, &(), &dao).unwrap());
        assert_eq!(dao.get(1).updated, 4);
    }

    #[test]
    fn undefined_transition_never_reaches_the_store() {
        let dao = MemDao::default();
        dao.insert(job());

        let err = machine().transit(&job(), Signal::Finish, &(), &dao).unwrap_err();
        assert!(err.is_no_transition());
        assert!(!err.is_retriable());
        assert_eq!(dao.writes.load(Ordering::SeqCst), 0);
        assert_eq!(dao.get(1), job());
    }

    #[test]
    fn store_failure_is_retriable() {
        let err = machine()
            .transit(&job(), Signal::Begin, &(), &FailingDao)
            .unwrap_err();
        assert!(err.is_retriable());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn concurrent_attempts_on_one_snapshot_have_one_winner() {
        let dao = Arc::new(MemDao::default());
        dao.insert(job());
        let m = Arc::new(machine());
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (dao, m, barrier) = (dao.clone(), m.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    m.transit(&job(), Signal::Begin, &(), dao.as_ref()).unwrap()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(dao.get(1).updated, 4);
    }

    #[test]
    fn listeners_see_commits_and_lost_races() {
        let dao = MemDao::default();
        dao.insert(job());
        let m = machine();
        let recorder = Arc::new(Recorder::default());
        m.register_listener(recorder.clone());

        m.transit(&job(), Signal::Begin, &(), &dao).unwrap();
        m.transit(&job(), Signal::Begin, &(), &dao).unwrap();

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![(Phase::Idle, Phase::Busy, true), (Phase::Idle, Phase::Busy, false)]
        );
    }
}
