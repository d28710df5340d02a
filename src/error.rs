use std::io;

use quinn::{ConnectionError, ReadError, WriteError};

/// A tunnel error.
///
/// Wire and handshake problems have their own variants; transport failures are passed through
/// from the QUIC stack or the OS.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("key error: {0}")]
    Key(#[from] rcgen::Error),

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("incomplete read: expected {expected} bytes, got {got}")]
    IncompleteRead { expected: usize, got: usize },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("cannot resolve {0}")]
    Resolution(String),

    #[error("cannot parse packet: {0}")]
    Parse(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no addresses found")]
    NoAddrs,

    #[error("peer key mismatch")]
    PeerKeyMismatch,
}

impl Error {
    /// Whether this error is a normal end of session rather than a failure.
    ///
    /// Peers going away, idle timeouts and local closes all end a session cleanly; loops stop
    /// quietly on these.
    pub fn is_graceful_close(&self) -> bool {
        match self {
            Error::Connection(e) => graceful_connection_error(e),
            Error::Io(e) => e
                .get_ref()
                .and_then(|inner| {
                    if let Some(e) = inner.downcast_ref::<ReadError>() {
                        Some(matches!(e, ReadError::ConnectionLost(c) if graceful_connection_error(c)))
                    } else if let Some(e) = inner.downcast_ref::<WriteError>() {
                        Some(matches!(e, WriteError::ConnectionLost(c) if graceful_connection_error(c)))
                    } else {
                        None
                    }
                })
                .unwrap_or(false),
            _ => false,
        }
    }

    pub(crate) fn auth(reason: impl Into<String>) -> Self {
        Error::Auth(reason.into())
    }
}

fn graceful_connection_error(e: &ConnectionError) -> bool {
    matches!(
        e,
        ConnectionError::ApplicationClosed(_)
            | ConnectionError::LocallyClosed
            | ConnectionError::TimedOut
    )
}
