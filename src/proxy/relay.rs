//! Terminal relay stage: blind bidirectional copy with backpressure.
//!
//! Each direction moves bytes from one endpoint into the other endpoint's
//! outbound queue. A direction never reads while that queue holds unflushed
//! bytes, so a slow receiver stalls its sender instead of growing memory.

use std::io::{self, Read};
use std::net::Shutdown;

use mio::Interest;

use crate::error::{Error, Result};
use crate::proxy::connection::{Connection, Endpoint, Progress, Readiness, Side, Stage, StageContext};

/// Default size of the per-read scratch buffer.
pub const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Progress of one copy direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HalfState {
    /// The reading side returned end of stream
    pub read_closed: bool,
    /// The writing side was shut down after a full flush
    pub write_shut: bool,
}

/// Both copy directions of an established tunnel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayState {
    /// source -> dest
    pub upstream: HalfState,
    /// dest -> source
    pub downstream: HalfState,
}

impl RelayState {
    /// Both directions reached end of stream and were flushed.
    pub fn is_finished(&self) -> bool {
        self.upstream.write_shut && self.downstream.write_shut
    }
}

/// Copy from `from` into `to` until `from` would block, `to` cannot accept
/// more, or end of stream has been propagated.
///
/// Returns the number of bytes read from `from` during this call.
pub fn pump(from: &mut Endpoint, to: &mut Endpoint, half: &mut HalfState, scratch: &mut [u8]) -> io::Result<u64> {
    let mut copied = 0u64;
    loop {
        if !to.flush()? {
            return Ok(copied);
        }

        if half.read_closed {
            if !half.write_shut {
                match to.stream.shutdown(Shutdown::Write) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                    Err(e) => return Err(e),
                }
                half.write_shut = true;
            }
            return Ok(copied);
        }

        match from.stream.read(scratch) {
            Ok(0) => half.read_closed = true,
            Ok(n) => {
                to.outbound.extend_from_slice(&scratch[..n]);
                copied += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(copied),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Interest each endpoint needs for the current relay state.
pub fn interests(state: &RelayState, source: &Endpoint, dest: &Endpoint) -> (Option<Interest>, Option<Interest>) {
    let source_interest = combine(
        !state.upstream.read_closed && dest.outbound.is_empty(),
        !source.outbound.is_empty(),
    );
    let dest_interest = combine(
        !state.downstream.read_closed && source.outbound.is_empty(),
        !dest.outbound.is_empty(),
    );
    (source_interest, dest_interest)
}

fn combine(readable: bool, writable: bool) -> Option<Interest> {
    match (readable, writable) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Handle a readiness event on a relaying connection.
pub(crate) fn on_ready(conn: &mut Connection, side: Side, ready: Readiness, ctx: &mut StageContext<'_>) -> Result<Progress> {
    let upstream = match side {
        Side::Source => ready.readable,
        Side::Dest => ready.writable,
    };
    let downstream = match side {
        Side::Source => ready.writable,
        Side::Dest => ready.readable,
    };
    run(conn, upstream, downstream, ctx)
}

/// Drive both directions once; used right after the handshake so bytes
/// already buffered on either side are not left waiting for a new event.
pub(crate) fn pump_all(conn: &mut Connection, ctx: &mut StageContext<'_>) -> Result<Progress> {
    run(conn, true, true, ctx)
}

fn run(conn: &mut Connection, upstream: bool, downstream: bool, ctx: &mut StageContext<'_>) -> Result<Progress> {
    let id = conn.id();
    let Stage::Relay(state) = &mut conn.stage else {
        return Ok(Progress::Continue);
    };
    let source = &mut conn.source;
    let dest = conn
        .dest
        .as_mut()
        .ok_or_else(|| Error::protocol("relay without destination"))?;

    if upstream {
        let n = pump(source, dest, &mut state.upstream, ctx.scratch)?;
        ctx.metrics.add_bytes_upstream(n);
    }
    if downstream {
        let n = pump(dest, source, &mut state.downstream, ctx.scratch)?;
        ctx.metrics.add_bytes_downstream(n);
    }

    if state.is_finished() {
        tracing::debug!("connection {}: both directions closed", id);
        Ok(Progress::Done)
    } else {
        Ok(Progress::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::{Duration, Instant};

    use bytes::BytesMut;
    use mio::Token;

    /// Loopback pair: a blocking far end and a non-blocking endpoint.
    fn pair(token: usize) -> (TcpStream, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let far = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (near, _) = listener.accept().unwrap();
        near.set_nonblocking(true).unwrap();
        let near = mio::net::TcpStream::from_std(near);
        (far, Endpoint::new(near, Token(token), BytesMut::new()))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn pump_until(
        source: &mut Endpoint,
        dest: &mut Endpoint,
        half: &mut HalfState,
        done: impl Fn(&HalfState, &Endpoint) -> bool,
    ) {
        let mut scratch = vec![0u8; RELAY_BUFFER_SIZE];
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done(half, dest) {
            assert!(Instant::now() < deadline, "relay made no progress");
            pump(source, dest, half, &mut scratch).unwrap();
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_multi_chunk_copy_in_order() {
        let (mut client, mut source) = pair(2);
        let (mut target, mut dest) = pair(3);
        let payload = pattern(RELAY_BUFFER_SIZE * 7 + 123);

        let expected = payload.clone();
        let writer = thread::spawn(move || {
            client.write_all(&payload).unwrap();
            client.shutdown(Shutdown::Write).unwrap();
        });
        let reader = thread::spawn(move || {
            let mut received = Vec::new();
            target.read_to_end(&mut received).unwrap();
            received
        });

        let mut half = HalfState::default();
        pump_until(&mut source, &mut dest, &mut half, |h, _| h.write_shut);

        writer.join().unwrap();
        assert_eq!(reader.join().unwrap(), expected);
    }

    #[test]
    fn test_eof_shuts_down_peer_write_side() {
        let (mut client, mut source) = pair(2);
        let (mut target, mut dest) = pair(3);

        client.write_all(b"hello").unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let mut half = HalfState::default();
        pump_until(&mut source, &mut dest, &mut half, |h, _| h.write_shut);
        assert!(half.read_closed);

        let mut received = Vec::new();
        target.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"hello");
    }

    #[test]
    fn test_backpressure_stops_reading_until_drained() {
        let (mut client, mut source) = pair(2);
        let (mut target, mut dest) = pair(3);
        let total = 32 * 1024 * 1024;

        // Keep send-side kernel buffering well below the payload size. The
        // target's receive buffer must not shrink after connect.
        socket2::SockRef::from(&dest.stream).set_send_buffer_size(4096).unwrap();

        let writer = thread::spawn(move || {
            client.write_all(&pattern(total)).unwrap();
            client.shutdown(Shutdown::Write).unwrap();
        });

        // Target never reads, so dest eventually refuses writes.
        let mut half = HalfState::default();
        pump_until(&mut source, &mut dest, &mut half, |_, d| !d.outbound.is_empty());

        let mut scratch = vec![0u8; RELAY_BUFFER_SIZE];
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            thread::sleep(Duration::from_millis(50));
            let read = pump(&mut source, &mut dest, &mut half, &mut scratch).unwrap();
            if read == 0 && !dest.outbound.is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "dest never saturated");
        }

        // Saturated: repeated pumps read nothing from the source.
        let state = RelayState {
            upstream: half,
            downstream: HalfState::default(),
        };
        let (source_interest, dest_interest) = interests(&state, &source, &dest);
        assert_eq!(dest_interest.map(|i| i.is_writable()), Some(true));
        assert!(source_interest.map_or(true, |i| !i.is_readable()));
        assert_eq!(pump(&mut source, &mut dest, &mut half, &mut scratch).unwrap(), 0);

        let reader = thread::spawn(move || {
            let mut received = Vec::with_capacity(total);
            target.read_to_end(&mut received).unwrap();
            received
        });

        pump_until(&mut source, &mut dest, &mut half, |h, _| h.write_shut);
        writer.join().unwrap();

        let received = reader.join().unwrap();
        assert_eq!(received.len(), total);
        assert!(received == pattern(total), "bytes lost or reordered");
    }

    #[test]
    fn test_interests_follow_queues() {
        let (_client, source) = pair(2);
        let (_target, mut dest) = pair(3);
        let state = RelayState::default();

        let (s, d) = interests(&state, &source, &dest);
        assert_eq!(s, Some(Interest::READABLE));
        assert_eq!(d, Some(Interest::READABLE));

        dest.outbound.extend_from_slice(b"pending");
        let (s, d) = interests(&state, &source, &dest);
        assert_eq!(s, None);
        assert_eq!(d, Some(Interest::READABLE | Interest::WRITABLE));

        let closed = RelayState {
            upstream: HalfState {
                read_closed: true,
                write_shut: true,
            },
            downstream: HalfState {
                read_closed: true,
                write_shut: true,
            },
        };
        assert!(closed.is_finished());
    }
}
