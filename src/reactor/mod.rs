//! Reactor Module.
//!
//! A single-threaded readiness loop that owns the listening socket, the
//! multiplexer and every live connection:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Reactor                             │
//! │  ┌──────────────┐    ┌─────────────────┐    ┌─────────────┐  │
//! │  │   Listener   │───▶│ ConnectionRegistry│──▶│ Connections │  │
//! │  │  (Token 0)   │    │ ids, live count, │    │ id -> conn  │  │
//! │  └──────────────┘    │ buffer pool      │    └──────┬──────┘  │
//! │                      └─────────────────┘           │         │
//! │  ┌──────────────┐                                  ▼         │
//! │  │    Waker     │    token -> (id, side) -> stage readiness  │
//! │  │  (Token 1)   │                                            │
//! │  └──────────────┘                                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every stage transition, buffer copy and registry mutation happens on the
//! reactor thread. Only [`ReactorHandle`] crosses threads.

pub mod config;
mod metrics;
mod registry;

pub use config::{ProxyConfig, ProxyConfigFile, Role};
pub use metrics::{MetricsSnapshot, ProxyMetrics};
pub use registry::ConnectionRegistry;

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Error, Result};
use crate::proxy::connection::{decode_token, StageContext};
use crate::proxy::{Connection, ConnectionId, Progress, Readiness};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// Pending-connection queue length requested from the OS.
const LISTEN_BACKLOG: i32 = 1024;

/// Delay before draining the listener again after a failed accept.
const ACCEPT_RETRY: Duration = Duration::from_millis(50);

/// Thread-safe handle for stopping a reactor and reading its metrics.
#[derive(Clone)]
pub struct ReactorHandle {
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<ProxyMetrics>,
}

impl ReactorHandle {
    /// Ask the reactor to release every connection and return from `run`.
    pub fn shutdown(&self) -> io::Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.waker.wake()
    }

    /// Live metrics of the reactor.
    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }
}

/// Main reactor instance.
pub struct Reactor {
    config: ProxyConfig,
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    connections: HashMap<ConnectionId, Connection>,
    metrics: Arc<ProxyMetrics>,
    waker: Arc<Waker>,
    shutdown: Arc<AtomicBool>,
    scratch: Vec<u8>,
    /// Set while the listener may still hold sockets a failed accept left behind
    accept_retry_at: Option<Instant>,
}

/// Bind the configured address and run the reactor until shut down.
pub fn start(config: ProxyConfig) -> Result<()> {
    Reactor::bind(config)?.run()
}

impl Reactor {
    /// Create the multiplexer and bind the listening socket.
    ///
    /// Any failure here is a [`Error::Startup`].
    pub fn bind(config: ProxyConfig) -> Result<Self> {
        config.validate()?;

        let bind_address = config.bind_address();
        let startup = |source: io::Error| Error::Startup {
            addr: bind_address.clone(),
            source,
        };

        let addr = bind_address
            .to_socket_addrs()
            .map_err(startup)?
            .next()
            .ok_or_else(|| startup(io::Error::new(io::ErrorKind::InvalidInput, "no address to bind")))?;

        let poll = Poll::new().map_err(startup)?;
        let mut listener = listen(addr).map_err(startup)?;
        let local_addr = listener.local_addr().map_err(startup)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(startup)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(startup)?);

        let metrics = Arc::new(ProxyMetrics::new());
        let registry = ConnectionRegistry::new(
            config.role.clone(),
            config.dial_timeout,
            Arc::clone(&metrics),
        );

        tracing::info!("{} agent listening on {}", config.role.mode(), local_addr);
        if let Some(peer) = config.role.peer_address() {
            tracing::info!("Tunneling to peer agent {}", peer);
        }

        Ok(Self {
            scratch: vec![0u8; config.relay_buffer_size],
            config,
            poll,
            listener,
            local_addr,
            registry,
            connections: HashMap::new(),
            metrics,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            accept_retry_at: None,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for other threads.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            waker: Arc::clone(&self.waker),
            shutdown: Arc::clone(&self.shutdown),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Reactor metrics.
    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run the event loop. Returns only after [`ReactorHandle::shutdown`].
    pub fn run(mut self) -> Result<()> {
        let mut events = Events::with_capacity(self.config.max_events);

        loop {
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() != io::ErrorKind::Interrupted {
                    tracing::warn!("Poll error: {}", e);
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_all(),
                    WAKER => {}
                    token => self.dispatch(token, Readiness::from_event(event)),
                }
            }

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if self.accept_retry_at.map_or(false, |at| Instant::now() >= at) {
                self.accept_all();
            }
            self.expire_handshakes();
        }

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.release(id, None);
        }
        tracing::info!("{} agent on {} stopped", self.config.role.mode(), self.local_addr);
        Ok(())
    }

    /// Accept every pending socket.
    ///
    /// The listener is edge-triggered, so an accept that fails for lack of
    /// resources schedules another drain instead of waiting for a new client.
    fn accept_all(&mut self) {
        self.accept_retry_at = None;
        loop {
            let (stream, peer_addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    tracing::debug!("Accept error: {}", e);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Accept error: {}; retrying in {:?}", e, ACCEPT_RETRY);
                    self.accept_retry_at = Some(Instant::now() + ACCEPT_RETRY);
                    return;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("set_nodelay for {} failed: {}", peer_addr, e);
            }

            match self.registry.obtain(stream, peer_addr, self.poll.registry()) {
                Ok(conn) => {
                    self.connections.insert(conn.id(), conn);
                }
                Err(e) => {
                    self.record_failure(&e);
                    tracing::warn!("Dropping connection from {}: {}", peer_addr, e);
                }
            }
        }
    }

    /// Route one readiness event to the connection that owns the token.
    fn dispatch(&mut self, token: Token, ready: Readiness) {
        let (id, side) = decode_token(token);
        let Some(conn) = self.connections.get_mut(&id) else {
            // Already released earlier in this batch.
            return;
        };

        let mut ctx = StageContext {
            registry: self.poll.registry(),
            dial_timeout: self.config.dial_timeout,
            scratch: &mut self.scratch,
            metrics: &self.metrics,
        };

        match conn.on_ready(side, ready, &mut ctx) {
            Ok(Progress::Continue) => {}
            Ok(Progress::Done) => self.release(id, None),
            Err(e) => self.release(id, Some(e)),
        }
    }

    /// Poll timeout covering both the handshake sweep and a pending accept
    /// retry.
    fn poll_timeout(&self) -> Option<Duration> {
        let retry = self
            .accept_retry_at
            .map(|at| at.saturating_duration_since(Instant::now()));
        match (self.next_timeout(), retry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        let limit = self.config.handshake_timeout?;
        let now = Instant::now();
        self.connections
            .values()
            .filter_map(|conn| conn.handshake_deadline(limit))
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    fn expire_handshakes(&mut self) {
        let Some(limit) = self.config.handshake_timeout else {
            return;
        };
        let now = Instant::now();
        let expired: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|conn| conn.handshake_expired(limit, now))
            .map(|conn| conn.id())
            .collect();

        for id in expired {
            self.release(id, Some(Error::HandshakeTimeout(limit.as_millis() as u64)));
        }
    }

    /// Tear a connection down, logging why if it failed.
    fn release(&mut self, id: ConnectionId, error: Option<Error>) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };

        match &error {
            Some(e) => {
                self.record_failure(e);
                tracing::debug!(
                    "connection {}: closed in {} stage: {}",
                    id,
                    conn.stage().name(),
                    e
                );
            }
            None => tracing::debug!("connection {}: closed", id),
        }

        self.registry.release(&mut conn, self.poll.registry());
    }

    fn record_failure(&self, error: &Error) {
        if error.is_protocol_error() {
            self.metrics.increment_protocol_errors();
        } else if error.is_dial_error() {
            self.metrics.increment_dial_failures();
        } else if matches!(error, Error::HandshakeTimeout(_)) {
            self.metrics.increment_handshake_timeouts();
        } else {
            self.metrics.increment_socket_errors();
        }
    }
}

/// Non-blocking listener with address reuse and an explicit backlog.
fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(TcpListener::from_std(socket.into()))
}
