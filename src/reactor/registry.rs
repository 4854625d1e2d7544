//! Connection identity, live-connection accounting and buffer reuse.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;
use mio::Registry;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::proxy::connection::{token_for, ConnectionBuffers};
use crate::proxy::socks5::TargetAddr;
use crate::proxy::{Connection, ConnectionId, Endpoint, Mode, Side};
use crate::reactor::config::Role;
use crate::reactor::ProxyMetrics;

/// Released connections whose buffers are kept for reuse.
pub const POOL_CAPACITY: usize = 20;

/// Creates and releases connections.
///
/// The id counter and the live count are atomics, so diagnostics may read
/// them from other threads while the reactor thread is the single writer.
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    role: Role,
    peer: Option<TargetAddr>,
    dial_timeout: Option<Duration>,
    metrics: Arc<ProxyMetrics>,
    pool: Mutex<Vec<ConnectionBuffers>>,
}

impl ConnectionRegistry {
    /// Create a registry for the given role.
    pub fn new(role: Role, dial_timeout: Option<Duration>, metrics: Arc<ProxyMetrics>) -> Self {
        let peer = match &role {
            Role::Local {
                peer_host,
                peer_port,
            } => Some(match peer_host.parse() {
                Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, *peer_port)),
                Err(_) => TargetAddr::Domain(peer_host.clone(), *peer_port),
            }),
            Role::Server => None,
        };

        Self {
            next_id: AtomicU64::new(1),
            role,
            peer,
            dial_timeout,
            metrics,
            pool: Mutex::new(Vec::with_capacity(POOL_CAPACITY)),
        }
    }

    /// Build a connection around a freshly accepted socket and start its
    /// handshake.
    ///
    /// In the local role this also dials the peer agent synchronously; if
    /// that fails the accepted socket is closed and no stage is started.
    pub fn obtain(&self, stream: TcpStream, peer_addr: SocketAddr, registry: &Registry) -> Result<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.metrics.increment_connections();

        let mut buffers = self.pool.lock().pop().unwrap_or_default();
        let source = Endpoint::new(
            stream,
            token_for(id, Side::Source),
            std::mem::take(&mut buffers.source_out),
        );

        let mode = self.role.mode();
        let dest = match (&self.peer, mode) {
            (Some(peer), Mode::Local) => match self.dial_peer(id, peer, &mut buffers) {
                Ok(dest) => Some(dest),
                Err(e) => {
                    // Dropping `source` closes the accepted socket.
                    drop(source);
                    self.metrics.decrement_connections();
                    self.recycle(buffers);
                    return Err(e);
                }
            },
            _ => None,
        };

        let mut conn = Connection::new(
            id,
            mode,
            source,
            dest,
            std::mem::take(&mut buffers.inbound),
            peer_addr,
        );
        if mode == Mode::Server {
            conn.dest_buffer = std::mem::take(&mut buffers.dest_out);
        }

        tracing::debug!("connection {}: accepted from {} ({})", id, peer_addr, mode);

        if let Err(e) = conn.refresh_interest(registry) {
            self.release(&mut conn, registry);
            return Err(e);
        }
        Ok(conn)
    }

    fn dial_peer(&self, id: ConnectionId, peer: &TargetAddr, buffers: &mut ConnectionBuffers) -> Result<Endpoint> {
        let stream = peer
            .dial(self.dial_timeout)
            .and_then(|stream| {
                stream.set_nonblocking(true)?;
                stream.set_nodelay(true)?;
                Ok(stream)
            })
            .map_err(|source| Error::PeerUnreachable {
                addr: peer.to_string(),
                source,
            })?;

        Ok(Endpoint::new(
            TcpStream::from_std(stream),
            token_for(id, Side::Dest),
            std::mem::take(&mut buffers.dest_out),
        ))
    }

    /// Close both sockets, return the buffers to the pool and decrement the
    /// live count. A second call for the same connection does nothing and
    /// returns `false`.
    pub fn release(&self, conn: &mut Connection, registry: &Registry) -> bool {
        if !conn.close(registry) {
            return false;
        }
        self.metrics.decrement_connections();
        self.recycle(conn.take_buffers());
        tracing::trace!("connection {}: released", conn.id());
        true
    }

    fn recycle(&self, mut buffers: ConnectionBuffers) {
        let mut pool = self.pool.lock();
        if pool.len() < POOL_CAPACITY {
            buffers.clear();
            pool.push(buffers);
        }
    }

    /// Number of live connections.
    pub fn live_connections(&self) -> u64 {
        self.metrics.active_connections()
    }

    /// Next id to be assigned.
    pub fn peek_next_id(&self) -> ConnectionId {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Buffers currently parked for reuse.
    pub fn pooled(&self) -> usize {
        self.pool.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{TcpListener, TcpStream as StdStream};

    use mio::Poll;

    use crate::proxy::Stage;

    fn accepted() -> (StdStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, addr) = listener.accept().unwrap();
        stream.set_nonblocking(true).unwrap();
        (client, TcpStream::from_std(stream), addr)
    }

    fn server_registry() -> (ConnectionRegistry, Arc<ProxyMetrics>) {
        let metrics = Arc::new(ProxyMetrics::new());
        (
            ConnectionRegistry::new(Role::Server, None, Arc::clone(&metrics)),
            metrics,
        )
    }

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let poll = Poll::new().unwrap();
        let (registry, _) = server_registry();

        let mut ids = Vec::new();
        let mut keep = Vec::new();
        for _ in 0..5 {
            let (client, stream, addr) = accepted();
            let conn = registry.obtain(stream, addr, poll.registry()).unwrap();
            ids.push(conn.id());
            keep.push((client, conn));
        }

        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(registry.live_connections(), 5);
        assert_eq!(registry.peek_next_id(), 6);
    }

    #[test]
    fn test_obtain_starts_handshake() {
        let poll = Poll::new().unwrap();
        let (registry, _) = server_registry();
        let (_client, stream, addr) = accepted();

        let conn = registry.obtain(stream, addr, poll.registry()).unwrap();
        assert!(matches!(conn.stage(), Stage::Greeting));
        assert!(conn.dest.is_none());
        assert_eq!(
            conn.source.interest().map(|i| i.is_readable()),
            Some(true)
        );
    }

    #[test]
    fn test_release_is_idempotent() {
        let poll = Poll::new().unwrap();
        let (registry, metrics) = server_registry();
        let (_client, stream, addr) = accepted();

        let mut conn = registry.obtain(stream, addr, poll.registry()).unwrap();
        assert_eq!(registry.live_connections(), 1);

        assert!(registry.release(&mut conn, poll.registry()));
        assert!(!registry.release(&mut conn, poll.registry()));
        assert!(conn.is_closed());
        assert_eq!(registry.live_connections(), 0);
        assert_eq!(metrics.total_connections(), 1);
        assert_eq!(registry.pooled(), 1);
    }

    #[test]
    fn test_release_closes_client_socket() {
        use std::io::Read;

        let poll = Poll::new().unwrap();
        let (registry, _) = server_registry();
        let (mut client, stream, addr) = accepted();

        let mut conn = registry.obtain(stream, addr, poll.registry()).unwrap();
        registry.release(&mut conn, poll.registry());
        drop(conn);

        client
            .set_read_timeout(Some(std::time::Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn test_local_role_dials_peer() {
        let poll = Poll::new().unwrap();
        let peer = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer_port = peer.local_addr().unwrap().port();

        let metrics = Arc::new(ProxyMetrics::new());
        let registry = ConnectionRegistry::new(
            Role::Local {
                peer_host: "127.0.0.1".into(),
                peer_port,
            },
            Some(Duration::from_secs(2)),
            metrics,
        );

        let (_client, stream, addr) = accepted();
        let conn = registry.obtain(stream, addr, poll.registry()).unwrap();
        assert!(conn.dest.is_some());
        assert!(peer.accept().is_ok());
    }

    #[test]
    fn test_local_role_peer_unreachable() {
        let poll = Poll::new().unwrap();
        let closed_port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let metrics = Arc::new(ProxyMetrics::new());
        let registry = ConnectionRegistry::new(
            Role::Local {
                peer_host: "127.0.0.1".into(),
                peer_port: closed_port,
            },
            Some(Duration::from_secs(2)),
            Arc::clone(&metrics),
        );

        let (_client, stream, addr) = accepted();
        let Err(err) = registry.obtain(stream, addr, poll.registry()) else {
            panic!("obtain must fail when the peer agent is down");
        };
        assert!(matches!(err, Error::PeerUnreachable { .. }));
        assert_eq!(registry.live_connections(), 0);
        assert_eq!(metrics.total_connections(), 1);
    }

    #[test]
    fn test_pool_is_bounded() {
        let poll = Poll::new().unwrap();
        let (registry, _) = server_registry();

        let mut conns = Vec::new();
        for _ in 0..POOL_CAPACITY + 5 {
            let (client, stream, addr) = accepted();
            conns.push((client, registry.obtain(stream, addr, poll.registry()).unwrap()));
        }
        for (_, conn) in conns.iter_mut() {
            registry.release(conn, poll.registry());
        }

        assert_eq!(registry.pooled(), POOL_CAPACITY);
        assert_eq!(registry.live_connections(), 0);
    }
}
