//! Rotation state machine.
//!
//! A rotation walks steady → prepared → rotating → post-update and
//! back to steady. Any step failure retries the whole pass; after the
//! attempt bound the rotation is abandoned, cleanup removes the staged
//! material and the old certificate stays active.

use mefedge_certstore::CertName;

use crate::error::CertmgrError;

/// Retry bound before a rotation is abandoned.
pub const MAX_ROTATION_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    Steady,
    Prepared,
    Rotating,
    PostUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    Completed,
    Abandoned { attempts: u32 },
}

/// The three effectful steps of a rotation, plus cleanup on abandon.
/// Split out so the driver can be exercised without touching disk.
pub trait RotationSteps {
    /// Generate the new material and write it to the staging paths.
    fn prepare(&mut self, name: CertName) -> Result<(), CertmgrError>;

    /// Tell consumers to pick up the staged material. While this is in
    /// flight both old and new chains are served.
    fn notify(&mut self, name: CertName) -> Result<(), CertmgrError>;

    /// Promote the staged material and drop the old artifacts.
    fn post_update(&mut self, name: CertName) -> Result<(), CertmgrError>;

    /// Remove staged material after an abandoned rotation.
    fn cleanup(&mut self, name: CertName);
}

/// Drive one rotation to completion or abandonment.
pub fn run_rotation(
    name: CertName,
    steps: &mut dyn RotationSteps,
    max_attempts: u32,
) -> RotationOutcome {
    let mut attempts = 0;
    while attempts < max_attempts {
        attempts += 1;
        match run_pass(name, steps) {
            Ok(()) => {
                tracing::info!(cert = %name, attempts, "rotation completed");
                return RotationOutcome::Completed;
            }
            Err(e) => {
                tracing::warn!(cert = %name, attempts, error = %e, "rotation pass failed");
            }
        }
    }
    steps.cleanup(name);
    tracing::error!(cert = %name, attempts, "rotation abandoned, keeping old certificate");
    RotationOutcome::Abandoned { attempts }
}

fn run_pass(name: CertName, steps: &mut dyn RotationSteps) -> Result<(), CertmgrError> {
    steps.prepare(name)?;
    tracing::debug!(cert = %name, phase = ?RotationPhase::Prepared, "rotation staged");
    steps.notify(name)?;
    tracing::debug!(cert = %name, phase = ?RotationPhase::Rotating, "consumers notified");
    steps.post_update(name)?;
    tracing::debug!(cert = %name, phase = ?RotationPhase::PostUpdate, "staged material promoted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Script {
        prepare_failures: u32,
        notify_failures: u32,
        prepared: u32,
        notified: u32,
        promoted: u32,
        cleaned: u32,
    }

    impl Script {
        fn new() -> Self {
            Script {
                prepare_failures: 0,
                notify_failures: 0,
                prepared: 0,
                notified: 0,
                promoted: 0,
                cleaned: 0,
            }
        }
    }

    impl RotationSteps for Script {
        fn prepare(&mut self, _name: CertName) -> Result<(), CertmgrError> {
            self.prepared += 1;
            if self.prepare_failures > 0 {
                self.prepare_failures -= 1;
                return Err(CertmgrError::Issue("staged write failed".into()));
            }
            Ok(())
        }

        fn notify(&mut self, _name: CertName) -> Result<(), CertmgrError> {
            self.notified += 1;
            if self.notify_failures > 0 {
                self.notify_failures -= 1;
                return Err(CertmgrError::Issue("consumer unreachable".into()));
            }
            Ok(())
        }

        fn post_update(&mut self, _name: CertName) -> Result<(), CertmgrError> {
            self.promoted += 1;
            Ok(())
        }

        fn cleanup(&mut self, _name: CertName) {
            self.cleaned += 1;
        }
    }

    #[test]
    fn clean_pass_completes_first_try() {
        let mut s = Script::new();
        let out = run_rotation(CertName::Inner, &mut s, MAX_ROTATION_ATTEMPTS);
        assert_eq!(out, RotationOutcome::Completed);
        assert_eq!((s.prepared, s.notified, s.promoted, s.cleaned), (1, 1, 1, 0));
    }

    #[test]
    fn transient_failure_is_retried() {
        let mut s = Script::new();
        s.notify_failures = 1;
        let out = run_rotation(CertName::Inner, &mut s, MAX_ROTATION_ATTEMPTS);
        assert_eq!(out, RotationOutcome::Completed);
        assert_eq!(s.prepared, 2);
        assert_eq!(s.promoted, 1);
        assert_eq!(s.cleaned, 0);
    }

    #[test]
    fn persistent_failure_abandons_after_bound() {
        let mut s = Script::new();
        s.prepare_failures = u32::MAX;
        let out = run_rotation(CertName::WsClient, &mut s, MAX_ROTATION_ATTEMPTS);
        assert_eq!(
            out,
            RotationOutcome::Abandoned {
                attempts: MAX_ROTATION_ATTEMPTS
            }
        );
        assert_eq!(s.prepared, MAX_ROTATION_ATTEMPTS);
        assert_eq!(s.promoted, 0);
        assert_eq!(s.cleaned, 1);
    }
}
