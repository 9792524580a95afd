use crate::identifier::Identifier;
use crate::reactor::FlowId;

/// A `Result` carrying the crate's `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong inside the ring core. None of these are fatal: the node logs them
/// and keeps serving events.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("message field of {0} bytes does not fit its length prefix")]
    MessageTooLarge(usize),

    #[error("no peer is associated with flow {0}")]
    UnknownPeer(FlowId),

    #[error("no route: {0}")]
    NoRoute(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("peer {0:?} is already in the directory")]
    DuplicatePeer(Identifier),

    #[error("node has not joined a ring")]
    NotJoined,

    #[error("invalid address")]
    AddrParse(#[from] std::net::AddrParseError),
}

impl Error {
    pub(crate) fn malformed<S: Into<String>>(reason: S) -> Self {
        Error::MalformedMessage(reason.into())
    }
}
