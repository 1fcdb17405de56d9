//! Transition tables: `(current state, event) -> next state`.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Bound shared by state and event enums.
pub trait Symbol: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Symbol for T where T: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

/// Deterministic mapping from `(state, event)` to the next state.
///
/// Edges keep their insertion order per source state, so the reflective
/// queries return stable results.
#[derive(Debug, Clone)]
pub struct TransitionTable<S, E> {
    edges: HashMap<S, Vec<(E, S)>>,
    len: usize,
}

impl<S: Symbol, E: Symbol> Default for TransitionTable<S, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Symbol, E: Symbol> TransitionTable<S, E> {
    pub fn new() -> Self {
        Self {
            edges: HashMap::new(),
            len: 0,
        }
    }

    /// Add `from --event--> to`. Returns the old target if the edge is redefined.
    pub fn add(&mut self, from: S, event: E, to: S) -> Option<S> {
        let edges = self.edges.entry(from).or_default();
        if let Some(edge) = edges.iter_mut().find(|(e, _)| *e == event) {
            return Some(std::mem::replace(&mut edge.1, to));
        }
        edges.push((event, to));
        self.len += 1;
        None
    }

    /// Builder form of [`add`](Self::add).
    pub fn with(mut self, from: S, event: E, to: S) -> Self {
        self.add(from, event, to);
        self
    }

    pub fn next_state(&self, from: S, event: E) -> Option<S> {
        self.edges
            .get(&from)?
            .iter()
            .find(|(e, _)| *e == event)
            .map(|(_, to)| *to)
    }

    /// Events accepted in `from`.
    pub fn possible_events(&self, from: S) -> Vec<E> {
        self.edges
            .get(&from)
            .map(|edges| edges.iter().map(|(e, _)| *e).collect())
            .unwrap_or_default()
    }

    /// Distinct states reachable from `from` in one step.
    pub fn next_states(&self, from: S) -> Vec<S> {
        let mut states = Vec::new();
        for (_, to) in self.edges.get(&from).into_iter().flatten() {
            if !states.contains(to) {
                states.push(*to);
            }
        }
        states
    }

    /// States from which `event` leads to `to`.
    pub fn from_states(&self, to: S, event: E) -> Vec<S> {
        self.edges
            .iter()
            .filter(|(_, edges)| edges.iter().any(|(e, t)| *e == event && *t == to))
            .map(|(from, _)| *from)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
