//! Shared building blocks for the edge agent: install-tree paths,
//! response codes, the file backup discipline, the process-singleton
//! lock, subprocess execution with timeouts, the config registry and
//! input validation combinators.

pub mod backup;
pub mod error;
pub mod exec;
pub mod lock;
pub mod paths;
pub mod registry;
pub mod validate;
