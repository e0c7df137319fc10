//! [`LoopHealth`] – device loop liveness monitor.
//!
//! Every device loop records a heartbeat after each completed step. A loop is
//! *stale* when it has not completed a step within its deadline, which
//! usually means a backend call is blocking. Reporting only: nothing is
//! restarted.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

/// Health state reported for a single device loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// The loop completed a step within its deadline.
    Healthy,
    /// The loop has not completed a step within its deadline.
    Stale,
}

struct Entry {
    last_step: Instant,
    deadline: Duration,
}

/// Tracks heartbeats from device loops.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use lablink_runtime::health::{LoopHealth, LoopState};
///
/// let mut health = LoopHealth::new();
/// health.register("smaract", Duration::from_secs(1));
/// health.heartbeat("smaract");
///
/// assert_eq!(health.state("smaract"), LoopState::Healthy);
/// ```
#[derive(Default)]
pub struct LoopHealth {
    loops: BTreeMap<String, Entry>,
}

impl LoopHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `device` with the given step `deadline`, starting healthy.
    ///
    /// Re-registering resets the deadline.
    pub fn register(&mut self, device: &str, deadline: Duration) {
        self.loops.insert(
            device.to_string(),
            Entry {
                last_step: Instant::now(),
                deadline,
            },
        );
    }

    pub fn unregister(&mut self, device: &str) {
        self.loops.remove(device);
    }

    /// Record a completed step. No-ops for unknown devices.
    pub fn heartbeat(&mut self, device: &str) {
        if let Some(entry) = self.loops.get_mut(device) {
            entry.last_step = Instant::now();
        }
    }

    /// Unknown devices count as stale.
    pub fn state(&self, device: &str) -> LoopState {
        match self.loops.get(device) {
            Some(entry) if entry.last_step.elapsed() <= entry.deadline => LoopState::Healthy,
            _ => LoopState::Stale,
        }
    }

    /// Names of all stale loops, sorted.
    pub fn stale(&self) -> Vec<String> {
        self.loops
            .iter()
            .filter(|(_, entry)| entry.last_step.elapsed() > entry.deadline)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn heartbeat_resets_deadline() {
        let mut health = LoopHealth::new();
        health.register("rf", Duration::from_millis(20));
        tokio::time::advance(Duration::from_millis(15)).await;
        health.heartbeat("rf");
        tokio::time::advance(Duration::from_millis(15)).await;
        assert_eq!(health.state("rf"), LoopState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_loop_goes_stale() {
        let mut health = LoopHealth::new();
        health.register("fast", Duration::from_millis(20));
        health.register("slow", Duration::from_secs(60));
        tokio::time::advance(Duration::from_millis(30)).await;
        assert_eq!(health.stale(), vec!["fast".to_string()]);
        assert_eq!(health.state("slow"), LoopState::Healthy);
    }

    #[test]
    fn unknown_device_is_stale() {
        let mut health = LoopHealth::new();
        assert_eq!(health.state("ghost"), LoopState::Stale);
        health.register("ghost", Duration::from_secs(1));
        health.unregister("ghost");
        assert!(health.stale().is_empty());
    }
}
