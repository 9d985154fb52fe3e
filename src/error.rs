use std::io;

/// Errors surfaced by [`FcgiInterface`](crate::FcgiInterface) construction
/// and [`accept_requests`](crate::FcgiInterface::accept_requests).
#[derive(Debug, thiserror::Error)]
pub enum InterfaceError {
    #[error("another FastCGI interface already exists in this process")]
    AlreadyRunning,
    #[error("max_connections must be greater than zero")]
    ZeroConnectionLimit,
    #[error("max_requests_per_connection must be greater than zero")]
    ZeroRequestLimit,
    #[error("FCGI_WEB_SERVER_ADDRS contains an unparseable address: '{0}'")]
    InvalidAddressList(String),
    #[error("the interface is corrupt and must be dropped")]
    Corrupt,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io operation failed")]
    Io(#[from] io::Error),
}

/// A violated bookkeeping invariant in the request store.
///
/// Any of these indicates that shared state can no longer be trusted; the
/// interface reacts by entering the corrupt state.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("request id 0 is reserved for management records")]
    NullRequestId,
    #[error("request inserted for a connection the store does not track")]
    UnknownConnection,
    #[error("request count for a connection underflowed")]
    CountUnderflow,
}

/// The 16-bit FastCGI request id space was exhausted.
#[derive(Debug, thiserror::Error)]
#[error("all 65535 request ids are in use")]
pub struct IdExhausted;
