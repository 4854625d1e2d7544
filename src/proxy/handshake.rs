//! SOCKS5 handshake stages.
//!
//! Every stage buffers partial input and only acts once a complete protocol
//! unit has arrived; an event may therefore leave the stage unchanged.
//! Sockets are read one chunk at a time and parsed in between, so a stage
//! never pulls in more than it needs. Whatever follows the last handshake
//! unit stays in the kernel until relay reads it.

use bytes::{Buf, BytesMut};

use crate::error::{Error, Result};
use crate::proxy::connection::{
    token_for, Connection, Endpoint, Mode, Progress, Readiness, Side, Stage, StageContext,
};
use crate::proxy::relay::{self, RelayState};
use crate::proxy::socks5::{
    self, reply, CMD_CONNECT, METHOD_NO_ACCEPTABLE, METHOD_NO_AUTH, NO_AUTH_SELECTION,
    SOCKS_VERSION, TUNNEL_METHODS,
};

/// Upper bound on unparsed bytes buffered before a handshake unit completes.
pub const MAX_HANDSHAKE_BUFFER: usize = 64 * 1024;

/// Read size while negotiating.
const HANDSHAKE_CHUNK: usize = 1024;

/// Local-role state while the peer agent answers the forwarded request.
#[derive(Debug, Default)]
pub struct PeerReply {
    selected: bool,
    buf: BytesMut,
}

pub(crate) fn on_ready(conn: &mut Connection, side: Side, ready: Readiness, ctx: &mut StageContext<'_>) -> Result<Progress> {
    if ready.writable {
        match side {
            Side::Source => {
                conn.source.flush()?;
            }
            Side::Dest => {
                if let Some(dest) = conn.dest.as_mut() {
                    dest.flush()?;
                }
            }
        }
    }

    if !ready.readable {
        return Ok(Progress::Continue);
    }

    let client_turn =
        side == Side::Source && matches!(conn.stage, Stage::Greeting | Stage::ConnectRequest);
    let peer_turn = side == Side::Dest && matches!(conn.stage, Stage::PeerReply(_));

    let result = if client_turn {
        on_client_readable(conn, ctx)
    } else if peer_turn {
        on_peer_readable(conn, ctx)
    } else {
        Ok(Progress::Continue)
    };

    // Once relay has started the client already holds its reply.
    if let Err(err) = &result {
        if conn.stage.is_handshake() {
            reject(conn, side, err);
        }
    }
    result
}

/// Best-effort failure reply to the client before teardown.
fn reject(conn: &mut Connection, side: Side, err: &Error) {
    let code = match (side, err) {
        (_, Error::PeerRejected(_)) => None,
        (Side::Dest, _) => Some(reply::GENERAL_FAILURE),
        (Side::Source, err) => err.reply_code(),
    };
    if let Some(code) = code {
        socks5::encode_reply(code, None, &mut conn.source.outbound);
    }
    let _ = conn.source.flush();
}

fn on_client_readable(conn: &mut Connection, ctx: &mut StageContext<'_>) -> Result<Progress> {
    let mut chunk = [0u8; HANDSHAKE_CHUNK];
    loop {
        let read = conn
            .source
            .read_some(&mut conn.inbound, &mut chunk, MAX_HANDSHAKE_BUFFER)?;

        if let Some(progress) = advance_client(conn, ctx)? {
            return Ok(progress);
        }

        match read {
            None => return Ok(Progress::Continue),
            Some(0) => {
                return Err(Error::protocol(format!(
                    "client closed during {}",
                    conn.stage.name()
                )))
            }
            Some(_) => {}
        }
    }
}

/// Consume every complete unit in the inbound buffer. Returns `Some` once
/// the connect request has been handled and the client stage is over.
fn advance_client(conn: &mut Connection, ctx: &mut StageContext<'_>) -> Result<Option<Progress>> {
    loop {
        match conn.stage {
            Stage::Greeting => {
                let Some((greeting, used)) = socks5::parse_greeting(&conn.inbound)? else {
                    return Ok(None);
                };
                conn.inbound.advance(used);

                if !greeting.offers_no_auth() {
                    conn.source
                        .outbound
                        .extend_from_slice(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE]);
                    return Err(Error::NoAcceptableMethod);
                }

                conn.source.outbound.extend_from_slice(&NO_AUTH_SELECTION);
                conn.source.flush()?;
                conn.stage = Stage::ConnectRequest;
                tracing::trace!("connection {}: method negotiated", conn.id());
            }
            Stage::ConnectRequest => {
                let Some((request, used)) = socks5::parse_request(&conn.inbound)? else {
                    return Ok(None);
                };
                if request.command != CMD_CONNECT {
                    return Err(Error::UnsupportedCommand(request.command));
                }
                let progress = match conn.mode() {
                    Mode::Server => connect_target(conn, request.target, used, ctx)?,
                    Mode::Local => forward_request(conn, used)?,
                };
                return Ok(Some(progress));
            }
            _ => return Ok(Some(Progress::Continue)),
        }
    }
}

/// Server role: dial the requested target and answer the client.
fn connect_target(
    conn: &mut Connection,
    target: socks5::TargetAddr,
    used: usize,
    ctx: &mut StageContext<'_>,
) -> Result<Progress> {
    conn.inbound.advance(used);

    let stream = target
        .dial(ctx.dial_timeout)
        .map_err(|source| Error::Dial {
            target: target.to_string(),
            source,
        })?;
    stream.set_nonblocking(true)?;
    stream.set_nodelay(true)?;
    let bound = stream.local_addr().ok();

    let dest = Endpoint::new(
        mio::net::TcpStream::from_std(stream),
        token_for(conn.id(), Side::Dest),
        std::mem::take(&mut conn.dest_buffer),
    );
    conn.dest = Some(dest);

    socks5::encode_reply(reply::SUCCEEDED, bound, &mut conn.source.outbound);
    tracing::debug!("connection {}: connected to {}", conn.id(), target);

    enter_relay(conn, ctx)
}

/// Local role: the peer agent is already dialed; tunnel the request to it
/// behind our own no-auth greeting.
fn forward_request(conn: &mut Connection, used: usize) -> Result<Progress> {
    let dest = conn
        .dest
        .as_mut()
        .ok_or_else(|| Error::protocol("local connection without peer socket"))?;

    socks5::encode_greeting(&TUNNEL_METHODS, &mut dest.outbound);
    dest.outbound.extend_from_slice(&conn.inbound[..used]);
    conn.inbound.advance(used);
    dest.flush()?;

    conn.stage = Stage::PeerReply(PeerReply::default());
    tracing::trace!("connection {}: request forwarded to peer agent", conn.id());
    Ok(Progress::Continue)
}

/// Local role: consume the peer's method selection and connect reply, and
/// pass the reply through to the client untouched.
fn on_peer_readable(conn: &mut Connection, ctx: &mut StageContext<'_>) -> Result<Progress> {
    let mut chunk = [0u8; HANDSHAKE_CHUNK];
    loop {
        let Stage::PeerReply(state) = &mut conn.stage else {
            return Ok(Progress::Continue);
        };
        let dest = conn
            .dest
            .as_mut()
            .ok_or_else(|| Error::protocol("local connection without peer socket"))?;

        let read = dest.read_some(&mut state.buf, &mut chunk, MAX_HANDSHAKE_BUFFER)?;

        if let Some(status) = take_peer_reply(state, &mut conn.source.outbound)? {
            if status != reply::SUCCEEDED {
                return Err(Error::PeerRejected(status));
            }
            return enter_relay(conn, ctx);
        }

        match read {
            None => return Ok(Progress::Continue),
            Some(0) => return Err(Error::protocol("peer agent closed before replying")),
            Some(_) => {}
        }
    }
}

/// Parse the peer's selection and reply out of `state`. Once the reply is
/// complete it is queued for the client, followed by anything the target
/// already sent, and its status is returned.
fn take_peer_reply(state: &mut PeerReply, client_out: &mut BytesMut) -> Result<Option<u8>> {
    if !state.selected {
        match socks5::parse_selection(&state.buf)? {
            Some((METHOD_NO_AUTH, used)) => {
                state.buf.advance(used);
                state.selected = true;
            }
            Some((method, _)) => {
                return Err(Error::protocol(format!(
                    "peer agent selected method 0x{:02x}",
                    method
                )))
            }
            None => return Ok(None),
        }
    }

    let Some((peer_reply, used)) = socks5::parse_reply(&state.buf)? else {
        return Ok(None);
    };

    client_out.extend_from_slice(&state.buf[..used]);
    state.buf.advance(used);
    if peer_reply.status == reply::SUCCEEDED {
        client_out.extend_from_slice(&state.buf.split());
    }
    Ok(Some(peer_reply.status))
}

/// Switch to the terminal relay stage. Client bytes pipelined behind the
/// request are queued for the destination ahead of anything read later.
fn enter_relay(conn: &mut Connection, ctx: &mut StageContext<'_>) -> Result<Progress> {
    if let Some(dest) = conn.dest.as_mut() {
        dest.outbound.extend_from_slice(&conn.inbound);
        ctx.metrics.add_bytes_upstream(conn.inbound.len() as u64);
    }
    conn.inbound.clear();
    conn.stage = Stage::Relay(RelayState::default());

    ctx.metrics.increment_handshakes();
    tracing::debug!("connection {}: relay established", conn.id());

    relay::pump_all(conn, ctx)
}
