//! Bounded retry of backend writes.
//!
//! Handlers make exactly one backend attempt and return; a failed write is
//! parked in a [`WriteQueue`] and retried once per device-loop cycle until it
//! succeeds or the [`RetryPolicy`] budget runs out. The outcome of every
//! attempt is a [`SyncState`]:
//!
//! | Outcome | Meaning |
//! |---|---|
//! | `Applied` | The backend accepted the write. |
//! | `Pending` | The write failed and will be retried next cycle. |
//! | `Stale` | The budget is exhausted; the target stays updated but the hardware no longer tracks it. |

use std::collections::BTreeMap;
use std::fmt::Debug;

use lablink_types::{LabError, SyncState};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Defines how many times a backend write is attempted before it is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one made by the handler.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run `op` back to back until it succeeds or the budget is spent,
    /// returning the last error.
    ///
    /// Used for writes that later commands depend on and that therefore
    /// cannot be deferred.
    pub fn run<T>(&self, mut op: impl FnMut() -> Result<T, LabError>) -> Result<T, LabError> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    debug!(attempt, error = %err, "backend write failed, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone)]
struct PendingWrite<V> {
    value: V,
    attempts: u32,
}

/// Deferred writes keyed by `K` (typically `(channel, property)`).
///
/// A newer write to the same key replaces an older pending one, so only the
/// latest target is ever retried.
#[derive(Debug, Clone)]
pub struct WriteQueue<K, V> {
    policy: RetryPolicy,
    pending: BTreeMap<K, PendingWrite<V>>,
}

impl<K, V> WriteQueue<K, V>
where
    K: Ord + Copy + Debug,
    V: Copy + Debug,
{
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending: BTreeMap::new(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Make the first attempt for a fresh write.
    ///
    /// Non-transient errors are returned to the caller; transient ones park
    /// the write and report `Pending` (or `Stale` for a one-shot budget).
    pub fn submit(
        &mut self,
        key: K,
        value: V,
        apply: impl FnOnce(V) -> Result<(), LabError>,
    ) -> Result<SyncState, LabError> {
        self.pending.remove(&key);
        match apply(value) {
            Ok(()) => Ok(SyncState::Applied),
            Err(err) if err.is_transient() => Ok(self.record_failure(key, value, 1, &err)),
            Err(err) => Err(err),
        }
    }

    /// Retry every parked write once.
    ///
    /// Returns the outcome for each key attempted so the caller can update the
    /// sync tag of the affected channel.
    pub fn retry(&mut self, mut apply: impl FnMut(K, V) -> Result<(), LabError>) -> Vec<(K, SyncState)> {
        let due = std::mem::take(&mut self.pending);
        due.into_iter()
            .map(|(key, write)| {
                let state = match apply(key, write.value) {
                    Ok(()) => {
                        debug!(?key, attempts = write.attempts + 1, "deferred write applied");
                        SyncState::Applied
                    }
                    Err(err) => self.record_failure(key, write.value, write.attempts + 1, &err),
                };
                (key, state)
            })
            .collect()
    }

    /// Drop a parked write, e.g. after an explicit stop.
    pub fn cancel(&mut self, key: &K) {
        self.pending.remove(key);
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn record_failure(&mut self, key: K, value: V, attempts: u32, err: &LabError) -> SyncState {
        if attempts >= self.policy.max_attempts || !err.is_transient() {
            warn!(?key, ?value, attempts, error = %err, "backend write abandoned, target is stale");
            SyncState::Stale
        } else {
            debug!(?key, attempts, error = %err, "backend write failed, will retry");
            self.pending.insert(key, PendingWrite { value, attempts });
            SyncState::Pending
        }
    }
}

/// Last write outcome per key, so one property's `Pending` or `Stale` tag is
/// not hidden by a later successful write to another.
///
/// Only non-`Applied` outcomes are kept.
#[derive(Debug, Clone)]
pub struct SyncTags<K> {
    tags: BTreeMap<K, SyncState>,
}

impl<K: Ord + Copy> SyncTags<K> {
    pub fn new() -> Self {
        Self { tags: BTreeMap::new() }
    }

    pub fn record(&mut self, key: K, state: SyncState) {
        match state {
            SyncState::Applied => {
                self.tags.remove(&key);
            }
            other => {
                self.tags.insert(key, other);
            }
        }
    }

    pub fn get(&self, key: &K) -> SyncState {
        self.tags.get(key).copied().unwrap_or(SyncState::Applied)
    }

    /// Worst outcome among the keys matching `filter`.
    pub fn worst_where(&self, filter: impl Fn(&K) -> bool) -> SyncState {
        self.tags
            .iter()
            .filter(|(key, _)| filter(key))
            .fold(SyncState::Applied, |acc, (_, state)| acc.worst(*state))
    }

    pub fn worst(&self) -> SyncState {
        self.worst_where(|_| true)
    }
}

impl<K: Ord + Copy> Default for SyncTags<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fault() -> LabError {
        LabError::backend("test", "timeout")
    }

    #[test]
    fn first_attempt_success_is_applied() -> Result<(), LabError> {
        let mut queue = WriteQueue::new(RetryPolicy::default());
        let state = queue.submit(0usize, 1.0f64, |_| Ok(()))?;
        assert_eq!(state, SyncState::Applied);
        assert!(queue.is_empty());
        Ok(())
    }

    #[test]
    fn transient_failure_is_retried_until_applied() -> Result<(), LabError> {
        let mut queue = WriteQueue::new(RetryPolicy::new(5));
        assert_eq!(queue.submit(3usize, 2.5f64, |_| Err(fault()))?, SyncState::Pending);
        assert!(queue.is_pending(&3));

        let outcome = queue.retry(|_, _| Err(fault()));
        assert_eq!(outcome, vec![(3, SyncState::Pending)]);

        let mut seen = None;
        let outcome = queue.retry(|key, value| {
            seen = Some((key, value));
            Ok(())
        });
        assert_eq!(outcome, vec![(3, SyncState::Applied)]);
        assert_eq!(seen, Some((3, 2.5)));
        assert!(queue.is_empty());
        Ok(())
    }

    #[test]
    fn budget_exhaustion_marks_stale_after_five_attempts() -> Result<(), LabError> {
        let mut queue = WriteQueue::new(RetryPolicy::default());
        let mut attempts = 1;
        queue.submit(0usize, 1.0f64, |_| Err(fault()))?;
        let mut last = SyncState::Pending;
        while !queue.is_empty() {
            let outcome = queue.retry(|_, _| Err(fault()));
            attempts += 1;
            last = outcome[0].1;
        }
        assert_eq!(attempts, 5);
        assert_eq!(last, SyncState::Stale);
        Ok(())
    }

    #[test]
    fn validation_errors_are_not_parked() {
        let mut queue: WriteQueue<usize, f64> = WriteQueue::new(RetryPolicy::default());
        let result = queue.submit(0, 1.0, |v| Err(LabError::out_of_range("x", v, 0.0, 0.5)));
        assert!(matches!(result, Err(LabError::OutOfRange { .. })));
        assert!(queue.is_empty());
    }

    #[test]
    fn newer_write_replaces_pending_one() -> Result<(), LabError> {
        let mut queue = WriteQueue::new(RetryPolicy::default());
        queue.submit(0usize, 1.0f64, |_| Err(fault()))?;
        queue.submit(0usize, 2.0f64, |_| Err(fault()))?;
        assert_eq!(queue.len(), 1);
        let mut retried = Vec::new();
        queue.retry(|_, v| {
            retried.push(v);
            Ok(())
        });
        assert_eq!(retried, vec![2.0]);
        Ok(())
    }

    #[test]
    fn tags_keep_the_worst_outcome_per_key() {
        let mut tags = SyncTags::new();
        tags.record((0usize, 'v'), SyncState::Stale);
        tags.record((0usize, 'p'), SyncState::Applied);
        tags.record((1usize, 'p'), SyncState::Pending);
        assert_eq!(tags.worst_where(|(ch, _)| *ch == 0), SyncState::Stale);
        assert_eq!(tags.worst_where(|(ch, _)| *ch == 2), SyncState::Applied);
        assert_eq!(tags.worst(), SyncState::Stale);

        tags.record((0usize, 'v'), SyncState::Applied);
        assert_eq!(tags.get(&(0, 'v')), SyncState::Applied);
        assert_eq!(tags.worst(), SyncState::Pending);
    }

    #[test]
    fn run_retries_immediately_and_returns_last_error() {
        let policy = RetryPolicy::new(3);
        let mut calls = 0;
        let result: Result<(), LabError> = policy.run(|| {
            calls += 1;
            Err(fault())
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);

        let mut calls = 0;
        let value = policy.run(|| {
            calls += 1;
            if calls < 2 { Err(fault()) } else { Ok(7) }
        });
        assert_eq!(value, Ok(7));
    }
}
