// Error kinds surfaced by the bus, per the reserved-address error taxonomy.
//
// The socket core and transports still hand back `std::io::Error` (that's
// what `mio`/`std::net` give us); `From<io::Error>` folds those into
// `O2Error::Socket` at the boundary so everything above the socket core
// deals in one enum.

use std::io;

use thiserror::Error;

pub type O2Result<T> = Result<T, O2Error>;

#[derive(Debug, Error)]
pub enum O2Error {
    #[error("generic failure: {0}")]
    Generic(String),

    #[error("service '{0}' already exists")]
    ServiceExists(String),

    #[error("no such service: {0}")]
    NoService(String),

    #[error("out of memory")]
    NoMemory,

    #[error("already running")]
    AlreadyRunning,

    #[error("bad process or service name: {0}")]
    BadName(String),

    #[error("bad type tag: {0}")]
    BadType(String),

    #[error("bad arguments")]
    BadArgs,

    #[error("tcp connection closed")]
    TcpHup,

    #[error("could not resolve hostname: {0}")]
    HostnameResolve(String),

    #[error("tcp connect failed: {0}")]
    TcpConnect(String),

    #[error("no clock reference yet")]
    NoClock,

    #[error("no handler registered")]
    NoHandler,

    #[error("invalid message")]
    InvalidMsg,

    #[error("send failed: {0}")]
    SendFail(String),

    #[error("bad service name: {0}")]
    BadServiceName(String),

    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("not initialized")]
    NotInitialized,

    #[error("would block")]
    Blocked,

    #[error("no discovery port available")]
    NoPort,

    #[error("no network available")]
    NoNetwork,
}

impl O2Error {
    pub fn generic(msg: impl Into<String>) -> O2Error {
        O2Error::Generic(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts_to_socket_variant() {
        let io_err = io::Error::new(io::ErrorKind::Other, "boom");
        let err: O2Error = io_err.into();
        assert!(matches!(err, O2Error::Socket(_)));
    }

    #[test]
    fn display_carries_context() {
        let err = O2Error::NoService("/foo".to_string());
        assert_eq!(err.to_string(), "no such service: /foo");
    }
}
