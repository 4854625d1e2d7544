//! Per-connection SOCKS5 pipeline.
//!
//! A [`Connection`] starts in the handshake stages, which negotiate the
//! SOCKS5 greeting and connect request, and then switches for good into the
//! relay stage, which copies bytes blindly between its two sockets.
//!
//! ```text
//!  application ──SOCKS5──▶ local agent ══SOCKS5 tunnel══▶ server agent ──TCP──▶ target
//!                          (Greeting, ConnectRequest,     (Greeting, ConnectRequest,
//!                           PeerReply, Relay)              Relay)
//! ```

pub mod connection;
pub mod handshake;
pub mod relay;
pub mod socks5;

pub use connection::{Connection, ConnectionId, Endpoint, Mode, Progress, Readiness, Side, Stage};
pub use relay::{RelayState, RELAY_BUFFER_SIZE};
