//! Router error kinds. Handlers never surface these to the transport;
//! they are folded into a `RespMsg` at the dispatch boundary.

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("no upstream peer captured yet")]
    NoPeer,

    #[error("no handler for ({operation}, {resource})")]
    HandlerMissing { operation: String, resource: String },

    #[error("handler exceeded its deadline")]
    Deadline,

    #[error(transparent)]
    Common(#[from] mefedge_common::error::CommonError),
}
