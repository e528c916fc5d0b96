//! Node lifecycle controller.
//!
//! Install, upgrade (prepare + effect), recovery and reset flows over
//! the A/B software slots, plus the pieces they drive: version
//! migration chain, service supervisor contract, net-config flow and
//! the model-file manager.

pub mod effect;
pub mod error;
pub mod install;
pub mod migrate;
pub mod modelfiles;
pub mod netconfig;
pub mod phase;
pub mod recovery;
pub mod reset;
pub mod slots;
pub mod supervisor;
pub mod upgrade;

pub use error::LifecycleError;
pub use phase::{LifecyclePhase, PhaseGuard, PhaseTracker};
pub use slots::{SlotManager, VersionInfo, SLOT_A, SLOT_B, STAGING_SLOT};
pub use supervisor::{ServiceSupervisor, SystemdSupervisor};
