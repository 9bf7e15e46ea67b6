// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! Transport statistics.
//!
//! Byte counters live on each connection and are read on demand; a
//! connector folds the counters of closed connections into an accumulator
//! so aggregate numbers survive endpoint turnover. A [`StatsRegistry`]
//! hands out one [`StatsScope`] per live connection for management-side
//! enumeration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Result, TransportError};

// ============================================================================
// Per-connection counters
// ============================================================================

/// Byte counters for one live connection. Updated by the reader and writer
/// threads, read by anyone.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
}

impl ConnectionStats {
    /// Record bytes pulled off the socket.
    pub fn add_read_bytes(&self, n: u64) {
        self.read_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Record bytes pushed to the socket.
    pub fn add_written_bytes(&self, n: u64) {
        self.written_bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            written_bytes: self.written_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one connection's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectionStatsSnapshot {
    /// Bytes read from the socket
    pub read_bytes: u64,

    /// Bytes written to the socket
    pub written_bytes: u64,
}

// ============================================================================
// Closed-connection accumulator
// ============================================================================

/// Running totals of connections that have already closed.
#[derive(Debug, Default)]
pub struct ClosedConnectionStats {
    connections: AtomicU64,
    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
}

impl ClosedConnectionStats {
    /// Fold one closed connection's final counters into the totals.
    pub fn add(&self, snapshot: ConnectionStatsSnapshot) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.read_bytes
            .fetch_add(snapshot.read_bytes, Ordering::Relaxed);
        self.written_bytes
            .fetch_add(snapshot.written_bytes, Ordering::Relaxed);
    }

    fn fold_into(&self, stats: &mut EndpointStats) {
        stats.closed_connections += self.connections.load(Ordering::Relaxed);
        stats.read_bytes += self.read_bytes.load(Ordering::Relaxed);
        stats.written_bytes += self.written_bytes.load(Ordering::Relaxed);
    }
}

// ============================================================================
// Aggregate endpoint stats
// ============================================================================

/// On-demand aggregate over a connector's live and closed connections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Connections currently established
    pub active_connections: u64,

    /// Connections closed since the connector was created
    pub closed_connections: u64,

    /// Bytes read across all connections, live and closed
    pub read_bytes: u64,

    /// Bytes written across all connections, live and closed
    pub written_bytes: u64,
}

impl EndpointStats {
    /// Build an aggregate from the closed-connection totals plus the
    /// snapshots of the currently active connections.
    pub fn aggregate(
        closed: &ClosedConnectionStats,
        active: impl Iterator<Item = ConnectionStatsSnapshot>,
    ) -> Self {
        let mut stats = EndpointStats::default();
        closed.fold_into(&mut stats);
        for snapshot in active {
            stats.active_connections += 1;
            stats.read_bytes += snapshot.read_bytes;
            stats.written_bytes += snapshot.written_bytes;
        }
        stats
    }
}

// ============================================================================
// Stats registry and scopes
// ============================================================================

/// Description of one registered connection scope.
#[derive(Clone, Debug)]
pub struct ScopeInfo {
    /// Remote host
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Local port of the socket
    pub local_port: u16,
}

/// Registry of per-connection stats scopes.
///
/// One registry per connector; each live connection holds one scope and
/// closes it during the close cascade.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    scopes: Mutex<HashMap<u64, ScopeInfo>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl StatsRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a scope for a new connection. Fails once the registry is
    /// closed, which makes the connect path roll the socket back.
    pub fn create_connection_scope(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        local_port: u16,
    ) -> Result<StatsScope> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Stats("stats registry is closed".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.scopes.lock().insert(
            id,
            ScopeInfo {
                host: host.to_string(),
                port,
                local_port,
            },
        );
        Ok(StatsScope {
            id,
            registry: Arc::downgrade(self),
            closed: AtomicBool::new(false),
        })
    }

    /// Currently registered scopes.
    pub fn active_scopes(&self) -> Vec<ScopeInfo> {
        self.scopes.lock().values().cloned().collect()
    }

    /// Number of currently registered scopes.
    pub fn scope_count(&self) -> usize {
        self.scopes.lock().len()
    }

    /// Refuse new scopes. Existing scopes still deregister normally.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Handle to one registered connection scope; deregisters on close or drop.
#[derive(Debug)]
pub struct StatsScope {
    id: u64,
    registry: Weak<StatsRegistry>,
    closed: AtomicBool,
}

impl StatsScope {
    /// Deregister the scope. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.scopes.lock().remove(&self.id);
        }
    }
}

impl Drop for StatsScope {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// Tests
// ============================================================================
