//! Error types for the tunnel.

use std::io;

use thiserror::Error;

use crate::proxy::socks5::reply;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the tunnel.
///
/// Only [`Error::Startup`] is fatal to the process; every other variant
/// terminates the single connection it was raised for.
#[derive(Error, Debug)]
pub enum Error {
    /// Binding or listening on the configured address failed
    #[error("failed to start listener on {addr}: {source}")]
    Startup {
        /// Address the listener tried to bind
        addr: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Malformed handshake bytes
    #[error("protocol error: {0}")]
    Protocol(String),

    /// SOCKS version byte was not 0x05
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// Client offered no method we accept
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    /// Request command other than CONNECT
    #[error("unsupported command: 0x{0:02x}")]
    UnsupportedCommand(u8),

    /// Request address type outside IPv4/domain/IPv6
    #[error("unsupported address type: 0x{0:02x}")]
    UnsupportedAddressType(u8),

    /// Could not reach the requested target
    #[error("failed to reach {target}: {source}")]
    Dial {
        /// Requested destination
        target: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Could not reach the configured peer agent
    #[error("peer agent {addr} unreachable: {source}")]
    PeerUnreachable {
        /// Peer agent address
        addr: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Peer agent answered the tunneled CONNECT with a failure status
    #[error("peer agent rejected request with status 0x{0:02x}")]
    PeerRejected(u8),

    /// I/O failure on an established socket
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    /// Handshake did not reach relay within the configured deadline
    #[error("handshake timeout after {0}ms")]
    HandshakeTimeout(u64),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// SOCKS5 status byte to send to the client, if this error still allows
    /// a reply.
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            Error::UnsupportedCommand(_) => Some(reply::COMMAND_NOT_SUPPORTED),
            Error::UnsupportedAddressType(_) => Some(reply::ADDRESS_TYPE_NOT_SUPPORTED),
            Error::Dial { source, .. } => Some(reply::code_for_io_error(source)),
            Error::PeerUnreachable { .. } => Some(reply::GENERAL_FAILURE),
            _ => None,
        }
    }

    /// Check if this error must abort the process
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Startup { .. })
    }

    /// Check if this error came from malformed or unsupported handshake bytes
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::VersionMismatch { .. }
                | Error::NoAcceptableMethod
                | Error::UnsupportedCommand(_)
                | Error::UnsupportedAddressType(_)
        )
    }

    /// Check if this error came from a failed dial
    pub fn is_dial_error(&self) -> bool {
        matches!(
            self,
            Error::Dial { .. } | Error::PeerUnreachable { .. } | Error::PeerRejected(_)
        )
    }
}
