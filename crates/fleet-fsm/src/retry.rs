//! Bounded re-read / re-decide loops around a transition.

use tracing::debug;

/// Result of one read-decide-transition round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The transition committed.
    Committed(T),
    /// A fresh read shows the request no longer applies; stop without writing.
    Moot(T),
    /// The snapshot was stale; read again.
    Stale,
}

/// Final outcome of a retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Committed(T),
    Moot(T),
    /// Every round lost its race.
    Exhausted { attempts: u32 },
}

/// Run `round` until it commits, becomes moot, or `max_attempts` rounds lose.
///
/// Errors returned by `round` end the loop immediately. `round` receives the
/// 1-based attempt number and must perform its own fresh read.
pub fn retry_transition<T, Er>(
    max_attempts: u32,
    mut round: impl FnMut(u32) -> Result<Attempt<T>, Er>,
) -> Result<RetryOutcome<T>, Er> {
    let attempts = max_attempts.max(1);
    for attempt in 1..=attempts {
        match round(attempt)? {
            Attempt::Committed(value) => return Ok(RetryOutcome::Committed(value)),
            Attempt::Moot(value) => return Ok(RetryOutcome::Moot(value)),
            Attempt::Stale => debug!(attempt, "lost transition race, re-reading"),
        }
    }
    Ok(RetryOutcome::Exhausted { attempts })
}
