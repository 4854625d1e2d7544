//! Proxy metrics collection.
//!
//! Aggregate counters only; safe to read from any thread while the reactor
//! thread updates them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Proxy metrics collector.
pub struct ProxyMetrics {
    /// Reactor start time
    start_time: Instant,
    /// Total connections accepted
    total_connections: AtomicU64,
    /// Current live connections
    active_connections: AtomicU64,
    /// Connections that reached relay
    handshakes_completed: AtomicU64,
    /// Malformed or unsupported handshakes
    protocol_errors: AtomicU64,
    /// Failed dials to a target or the peer agent
    dial_failures: AtomicU64,
    /// I/O failures on established sockets
    socket_errors: AtomicU64,
    /// Handshakes torn down by the deadline
    handshake_timeouts: AtomicU64,
    /// Bytes copied source -> dest
    bytes_upstream: AtomicU64,
    /// Bytes copied dest -> source
    bytes_downstream: AtomicU64,
}

impl ProxyMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            handshakes_completed: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            socket_errors: AtomicU64::new(0),
            handshake_timeouts: AtomicU64::new(0),
            bytes_upstream: AtomicU64::new(0),
            bytes_downstream: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Increment completed handshake count.
    pub fn increment_handshakes(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment protocol error count.
    pub fn increment_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment dial failure count.
    pub fn increment_dial_failures(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment socket error count.
    pub fn increment_socket_errors(&self) {
        self.socket_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment handshake timeout count.
    pub fn increment_handshake_timeouts(&self) {
        self.handshake_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Add bytes to the upstream counter.
    pub fn add_bytes_upstream(&self, bytes: u64) {
        if bytes > 0 {
            self.bytes_upstream.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// Add bytes to the downstream counter.
    pub fn add_bytes_downstream(&self, bytes: u64) {
        if bytes > 0 {
            self.bytes_downstream.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get live connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            handshakes_completed: self.handshakes_completed.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            socket_errors: self.socket_errors.load(Ordering::Relaxed),
            handshake_timeouts: self.handshake_timeouts.load(Ordering::Relaxed),
            bytes_upstream: self.bytes_upstream.load(Ordering::Relaxed),
            bytes_downstream: self.bytes_downstream.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"s5tunnel Metrics
================
Uptime: {} seconds

Connections:
  Total:     {}
  Active:    {}
  Relaying:  {}

Traffic:
  Upstream:   {} bytes
  Downstream: {} bytes

Errors:
  Protocol:   {}
  Dial:       {}
  Socket:     {}
  Timeouts:   {}
"#,
            snapshot.uptime_secs,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.handshakes_completed,
            snapshot.bytes_upstream,
            snapshot.bytes_downstream,
            snapshot.protocol_errors,
            snapshot.dial_failures,
            snapshot.socket_errors,
            snapshot.handshake_timeouts,
        )
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Seconds since the reactor started
    pub uptime_secs: u64,
    /// Connections accepted
    pub total_connections: u64,
    /// Connections not yet released
    pub active_connections: u64,
    /// Connections that reached relay
    pub handshakes_completed: u64,
    /// Malformed or unsupported handshakes
    pub protocol_errors: u64,
    /// Failed target or peer dials
    pub dial_failures: u64,
    /// I/O failures on established sockets
    pub socket_errors: u64,
    /// Handshakes torn down by the deadline
    pub handshake_timeouts: u64,
    /// Bytes copied source -> dest
    pub bytes_upstream: u64,
    /// Bytes copied dest -> source
    pub bytes_downstream: u64,
}

impl MetricsSnapshot {
    /// Share of accepted connections that reached relay.
    pub fn handshake_success_rate(&self) -> f64 {
        if self.total_connections == 0 {
            0.0
        } else {
            self.handshakes_completed as f64 / self.total_connections as f64
        }
    }

    /// Calculate throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_upstream + self.bytes_downstream) as f64 / self.uptime_secs as f64
        }
    }
}
