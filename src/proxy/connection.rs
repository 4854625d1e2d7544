//! One client's end-to-end tunnel: the socket pair, the active stage and
//! the teardown path.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use crate::error::{Error, Result};
use crate::proxy::handshake::{self, PeerReply};
use crate::proxy::relay::{self, RelayState};
use crate::reactor::ProxyMetrics;

/// Process-unique connection identifier.
pub type ConnectionId = u64;

/// Which half of the socket pair an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Socket accepted from the application (local) or the local agent (server)
    Source,
    /// Socket dialed to the peer agent (local) or the target (server)
    Dest,
}

/// Deployment role of the agent running a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Accepts from applications and tunnels to a fixed peer agent
    Local,
    /// Accepts tunnel connections and dials real targets
    Server,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Local => f.write_str("local"),
            Mode::Server => f.write_str("server"),
        }
    }
}

/// Readiness flags observed for one socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data, end of stream or an error is waiting to be read
    pub readable: bool,
    /// The send buffer has room
    pub writable: bool,
}

impl Readiness {
    /// Collapse a multiplexer event. Hang-ups and errors count as readable so
    /// the next read surfaces them.
    pub fn from_event(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed(),
        }
    }
}

/// Encode a connection id and side into a multiplexer token.
///
/// Ids start at 1, so tokens 0 and 1 stay free for the listener and waker.
pub fn token_for(id: ConnectionId, side: Side) -> Token {
    let base = (id as usize) << 1;
    match side {
        Side::Source => Token(base),
        Side::Dest => Token(base | 1),
    }
}

/// Inverse of [`token_for`].
pub fn decode_token(token: Token) -> (ConnectionId, Side) {
    let side = if token.0 & 1 == 0 { Side::Source } else { Side::Dest };
    ((token.0 >> 1) as ConnectionId, side)
}

/// Buffers a connection owns; recycled through the registry's pool.
#[derive(Debug, Default)]
pub struct ConnectionBuffers {
    pub(crate) inbound: BytesMut,
    pub(crate) source_out: BytesMut,
    pub(crate) dest_out: BytesMut,
}

impl ConnectionBuffers {
    pub(crate) fn clear(&mut self) {
        self.inbound.clear();
        self.source_out.clear();
        self.dest_out.clear();
    }
}

/// One half-connection: a non-blocking socket, its registered interest and
/// the bytes queued for writing to it.
pub struct Endpoint {
    pub(crate) stream: TcpStream,
    token: Token,
    interest: Option<Interest>,
    pub(crate) outbound: BytesMut,
}

impl Endpoint {
    /// Wrap a connected non-blocking stream.
    pub fn new(stream: TcpStream, token: Token, outbound: BytesMut) -> Self {
        Self {
            stream,
            token,
            interest: None,
            outbound,
        }
    }

    /// Interest currently registered with the multiplexer.
    pub fn interest(&self) -> Option<Interest> {
        self.interest
    }

    /// Write queued bytes until drained or the socket would block.
    ///
    /// Returns `true` when nothing is left queued.
    pub fn flush(&mut self) -> io::Result<bool> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.outbound.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Read one chunk of at most `chunk.len()` bytes and append it to `buf`.
    ///
    /// Returns `Ok(None)` when the socket would block and `Ok(Some(0))` at
    /// end of stream. Fails if `buf` would grow past `limit`.
    pub fn read_some(&mut self, buf: &mut BytesMut, chunk: &mut [u8], limit: usize) -> io::Result<Option<usize>> {
        loop {
            match self.stream.read(chunk) {
                Ok(n) => {
                    if buf.len() + n > limit {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "handshake data exceeds buffer limit",
                        ));
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    return Ok(Some(n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Register, reregister or deregister so the multiplexer reports exactly
    /// `interest`.
    pub fn set_interest(&mut self, registry: &Registry, interest: Option<Interest>) -> io::Result<()> {
        if interest == self.interest {
            return Ok(());
        }
        match (self.interest, interest) {
            (None, Some(wanted)) => registry.register(&mut self.stream, self.token, wanted)?,
            (Some(_), Some(wanted)) => registry.reregister(&mut self.stream, self.token, wanted)?,
            (Some(_), None) => registry.deregister(&mut self.stream)?,
            (None, None) => {}
        }
        self.interest = interest;
        Ok(())
    }

    fn close(&mut self, registry: &Registry) {
        let _ = self.set_interest(registry, None);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Protocol state machine position. Transitions only move forward:
/// `Greeting -> ConnectRequest -> [PeerReply ->] Relay`.
pub enum Stage {
    /// Waiting for the method negotiation header
    Greeting,
    /// Waiting for the connect request
    ConnectRequest,
    /// Local role only: request forwarded, waiting for the peer agent
    PeerReply(PeerReply),
    /// Terminal blind byte copy
    Relay(RelayState),
}

impl Stage {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Greeting => "greeting",
            Stage::ConnectRequest => "connect-request",
            Stage::PeerReply(_) => "peer-reply",
            Stage::Relay(_) => "relay",
        }
    }

    /// Whether the connection is still negotiating.
    pub fn is_handshake(&self) -> bool {
        !matches!(self, Stage::Relay(_))
    }
}

/// Outcome of delivering one readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Keep the connection registered
    Continue,
    /// Both directions finished cleanly; release the connection
    Done,
}

/// What a stage needs from the reactor while handling an event.
pub struct StageContext<'a> {
    /// Multiplexer the connection's sockets are registered with
    pub registry: &'a Registry,
    /// Bound on synchronous dials made by the stage
    pub dial_timeout: Option<Duration>,
    /// Shared read buffer
    pub scratch: &'a mut [u8],
    /// Counters updated as the stage progresses
    pub metrics: &'a ProxyMetrics,
}

/// One client's tunnel.
pub struct Connection {
    id: ConnectionId,
    mode: Mode,
    pub(crate) stage: Stage,
    pub(crate) source: Endpoint,
    pub(crate) dest: Option<Endpoint>,
    /// Handshake bytes read from source but not yet consumed.
    pub(crate) inbound: BytesMut,
    /// Outbound buffer for a destination dialed later (server role).
    pub(crate) dest_buffer: BytesMut,
    peer_addr: SocketAddr,
    created_at: Instant,
    closed: bool,
}

impl Connection {
    /// Build a connection in the `Greeting` stage. `dest` is present from the
    /// start in local mode.
    pub fn new(
        id: ConnectionId,
        mode: Mode,
        source: Endpoint,
        dest: Option<Endpoint>,
        inbound: BytesMut,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            id,
            mode,
            stage: Stage::Greeting,
            source,
            dest,
            inbound,
            dest_buffer: BytesMut::new(),
            peer_addr,
            created_at: Instant::now(),
            closed: false,
        }
    }

    /// Connection ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Role this connection runs in.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Active stage.
    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    /// Address of the accepted socket's remote end.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether teardown already ran.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the handshake has been running longer than `timeout`.
    pub fn handshake_expired(&self, timeout: Duration, now: Instant) -> bool {
        self.stage.is_handshake() && now.duration_since(self.created_at) >= timeout
    }

    /// Deadline by which the handshake must reach relay.
    pub fn handshake_deadline(&self, timeout: Duration) -> Option<Instant> {
        self.stage.is_handshake().then(|| self.created_at + timeout)
    }

    /// Deliver a readiness event for one side to the active stage, then
    /// bring multiplexer interest in line with the new state.
    pub fn on_ready(&mut self, side: Side, ready: Readiness, ctx: &mut StageContext<'_>) -> Result<Progress> {
        if self.closed {
            return Ok(Progress::Done);
        }

        let progress = match self.stage {
            Stage::Relay(_) => relay::on_ready(self, side, ready, ctx)?,
            _ => handshake::on_ready(self, side, ready, ctx)?,
        };

        if progress == Progress::Continue {
            self.refresh_interest(ctx.registry)?;
        }
        Ok(progress)
    }

    /// Register the interest each socket needs for the active stage.
    pub fn refresh_interest(&mut self, registry: &Registry) -> Result<()> {
        let (source, dest) = match &self.stage {
            Stage::Greeting | Stage::ConnectRequest => {
                let source = with_writable(Some(Interest::READABLE), &self.source);
                let dest = self.dest.as_ref().and_then(|dest| with_writable(None, dest));
                (source, dest)
            }
            Stage::PeerReply(_) => {
                let source = with_writable(None, &self.source);
                let dest = self
                    .dest
                    .as_ref()
                    .and_then(|dest| with_writable(Some(Interest::READABLE), dest));
                (source, dest)
            }
            Stage::Relay(state) => {
                let dest = self
                    .dest
                    .as_ref()
                    .ok_or_else(|| Error::protocol("relay without destination"))?;
                relay::interests(state, &self.source, dest)
            }
        };

        self.source.set_interest(registry, source)?;
        if let Some(endpoint) = self.dest.as_mut() {
            endpoint.set_interest(registry, dest)?;
        }
        Ok(())
    }

    /// Close both sockets. Returns `false` if the connection was already
    /// closed, so callers can keep accounting exact.
    pub fn close(&mut self, registry: &Registry) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.source.close(registry);
        if let Some(dest) = self.dest.as_mut() {
            dest.close(registry);
        }
        true
    }

    /// Hand back the buffers for reuse. Only meaningful after [`close`].
    ///
    /// [`close`]: Connection::close
    pub(crate) fn take_buffers(&mut self) -> ConnectionBuffers {
        ConnectionBuffers {
            inbound: std::mem::take(&mut self.inbound),
            source_out: std::mem::take(&mut self.source.outbound),
            dest_out: match self.dest.as_mut() {
                Some(dest) => std::mem::take(&mut dest.outbound),
                None => std::mem::take(&mut self.dest_buffer),
            },
        }
    }
}

fn with_writable(base: Option<Interest>, endpoint: &Endpoint) -> Option<Interest> {
    if endpoint.outbound.is_empty() {
        return base;
    }
    Some(match base {
        Some(interest) => interest | Interest::WRITABLE,
        None => Interest::WRITABLE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        for id in [1u64, 2, 77, 1 << 20] {
            assert_eq!(decode_token(token_for(id, Side::Source)), (id, Side::Source));
            assert_eq!(decode_token(token_for(id, Side::Dest)), (id, Side::Dest));
        }
    }

    #[test]
    fn test_tokens_avoid_reserved() {
        assert!(token_for(1, Side::Source).0 >= 2);
        assert_ne!(token_for(1, Side::Source), token_for(1, Side::Dest));
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Greeting.name(), "greeting");
        assert!(Stage::ConnectRequest.is_handshake());
        assert!(!Stage::Relay(RelayState::default()).is_handshake());
    }
}
