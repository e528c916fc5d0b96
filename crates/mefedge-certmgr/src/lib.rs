//! Certificate lifecycle engine.
//!
//! Coordinates root CA import/delete, CSR-based service cert issuance,
//! CRL import and the rotation state machine, with a periodic monitor
//! and a filesystem observer fanning change events out to registered
//! consumers.

mod engine;
mod error;
mod monitor;
mod observer;
mod rotation;

pub use engine::{CertEngine, IssuedCert, SERVICE_CERT_LIFETIME_DAYS};
pub use error::CertmgrError;
pub use monitor::{CertMonitor, DEFAULT_CHECK_INTERVAL_SECS};
pub use observer::{CertObserver, ChangeEvent};
pub use rotation::{run_rotation, RotationOutcome, RotationPhase, RotationSteps, MAX_ROTATION_ATTEMPTS};
