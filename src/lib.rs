//! # s5tunnel
//!
//! A two-sided SOCKS5 tunnel built on a single-threaded readiness reactor.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Binary (local | server)                │
//! ├─────────────────────────────────────────────────────────┤
//! │  Reactor (listener, waker, dispatch, handshake sweep)   │
//! ├─────────────────────────────────────────────────────────┤
//! │  Connection Registry (ids, live count, buffer pool)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Connection Stages (Greeting, ConnectRequest, Relay)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  SOCKS5 Codec (RFC 1928 frames, reply codes)            │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The local agent accepts SOCKS5 clients and forwards each connection to a
//! peer server agent, which dials the requested target. Both roles share the
//! same reactor and connection core; only the ConnectRequest stage differs.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod error;
pub mod proxy;
pub mod reactor;

pub use error::{Error, Result};
pub use reactor::{start, ProxyConfig, ProxyConfigFile, Reactor, ReactorHandle, Role};

/// SOCKS protocol version spoken on both hops
pub const SOCKS_VERSION: u8 = proxy::socks5::SOCKS_VERSION;

/// Default local-role listen port
pub const DEFAULT_LOCAL_PORT: u16 = 1080;

/// Default server-role listen port
pub const DEFAULT_SERVER_PORT: u16 = 9000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports_validate() {
        assert_eq!(SOCKS_VERSION, 0x05);
        assert!(ProxyConfig::local(DEFAULT_LOCAL_PORT, "127.0.0.1", DEFAULT_SERVER_PORT)
            .validate()
            .is_ok());
        assert!(ProxyConfig::server(DEFAULT_SERVER_PORT).validate().is_ok());
    }
}
