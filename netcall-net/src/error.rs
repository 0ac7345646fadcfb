use netcall_core::RemoteError;
use thiserror::Error;

use crate::socket::Transport;

pub type Result<T> = core::result::Result<T, Error>;

/// Enumeration of errors that may occur during network operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("would block")]
    WouldBlock,
    #[error("timed out")]
    TimedOut,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("socket not connected")]
    SocketNotConnected,
    #[error("address already in use: {0}")]
    AddressInUse(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("transport unavailable: {0}")]
    TransportUnavailable(Transport),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("no endpoint bound or connected")]
    NotReady,
    #[error("future already resolved")]
    AlreadyResolved,
    #[error("shut down")]
    ShutDown,

    /// Error raised by the remote side of a call.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    #[error("other: {0}")]
    Other(String),

    #[error("core error: {0}")]
    CoreError(#[from] netcall_core::Error),
    #[cfg(feature = "zmq_transport")]
    #[error("zmq error: {0}")]
    ZmqError(#[from] zmq::Error),
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Error::Other(format!("lock poisoned: {}", e))
    }
}
