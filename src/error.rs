use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("invalid address: {0}")]
    Addr(#[from] std::net::AddrParseError),

    #[error("{0} - command timed out")]
    Timeout(&'static str),

    /// The remote peer answered with an error payload.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("{0} - unexpected response")]
    UnexpectedResponse(&'static str),

    #[error("unknown message type {0:#x}")]
    UnknownType(u8),

    /// Returned by a `TransportHook` that does not know the message type, so
    /// the next hook gets a chance to decode it.
    #[error("hook does not handle message type {0:#x}")]
    HookUnknownType(u8),

    #[error("local vnode handler not found")]
    HandlerNotFound,

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("cannot ask for {requested} successors, ring tracks at most {max}")]
    LookupLimit { requested: usize, max: usize },

    #[error("exhausted all remote vnodes while joining: {0}")]
    Join(String),

    #[error("vnode {0} has no more successors")]
    NoSuccessors(String),

    #[error("too many forward hops while looking up {0}")]
    ForwardLoop(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("internal error: {0}")]
    Internal(String),
}
