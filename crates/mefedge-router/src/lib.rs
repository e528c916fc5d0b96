//! Message router between the cloud transport and local modules.
//!
//! Normalizes the dual-form envelope, keeps the operation-log ring
//! that attributes responses to their original requests, synthesizes
//! node/pod status replies and dispatches normalized messages to the
//! registered operation handlers.

pub mod dispatch;
pub mod handlers;
pub mod message;
pub mod normalize;
pub mod oplog;
pub mod status;

mod error;

pub use dispatch::{Dispatcher, RespMsg};
pub use error::RouterError;
pub use handlers::HandlerCtx;
pub use message::Message;
pub use oplog::{OpLog, OPLOG_RING_CAPACITY};
