//! Process-wide lifecycle phase.
//!
//! At most one phase other than idle exists at a time. The tracker
//! enforces it in-process; across processes the singleton lock in
//! `mefedge_common::lock` does the same job.

use std::fmt;
use std::sync::Mutex;

use crate::error::LifecycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Idle,
    Installing,
    Upgrading,
    Effecting,
    Recovering,
}

impl LifecyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecyclePhase::Idle => "idle",
            LifecyclePhase::Installing => "installing",
            LifecyclePhase::Upgrading => "upgrading",
            LifecyclePhase::Effecting => "effecting",
            LifecyclePhase::Recovering => "recovering",
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub struct PhaseTracker {
    current: Mutex<Option<LifecyclePhase>>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> LifecyclePhase {
        self.lock().unwrap_or(LifecyclePhase::Idle)
    }

    /// Enter a phase. Fails when any non-idle phase is in progress.
    pub fn begin(&self, phase: LifecyclePhase) -> Result<PhaseGuard<'_>, LifecycleError> {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(active) = *current {
            return Err(LifecycleError::Phase {
                current: active.to_string(),
            });
        }
        *current = Some(phase);
        tracing::info!(phase = %phase, "lifecycle phase entered");
        Ok(PhaseGuard { tracker: self })
    }

    fn lock(&self) -> Option<LifecyclePhase> {
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Returns the tracker to idle on drop, including on error paths.
#[derive(Debug)]
pub struct PhaseGuard<'a> {
    tracker: &'a PhaseTracker,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        let mut current = self
            .tracker
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(phase) = current.take() {
            tracing::info!(phase = %phase, "lifecycle phase left");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_phase_at_a_time() {
        let tracker = PhaseTracker::new();
        let guard = tracker.begin(LifecyclePhase::Upgrading).unwrap();
        assert_eq!(tracker.current(), LifecyclePhase::Upgrading);

        let err = tracker.begin(LifecyclePhase::Installing).unwrap_err();
        assert!(matches!(err, LifecycleError::Phase { .. }));

        drop(guard);
        assert_eq!(tracker.current(), LifecyclePhase::Idle);
        tracker.begin(LifecyclePhase::Installing).unwrap();
    }

    #[test]
    fn guard_releases_on_early_return() {
        let tracker = PhaseTracker::new();
        fn failing(t: &PhaseTracker) -> Result<(), LifecycleError> {
            let _guard = t.begin(LifecyclePhase::Recovering)?;
            Err(LifecycleError::Param("boom".into()))
        }
        assert!(failing(&tracker).is_err());
        assert_eq!(tracker.current(), LifecyclePhase::Idle);
    }
}
