// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! Application-facing connection seam.
//!
//! The transport owns sockets and threads; the application owns protocol
//! state. They meet at two interfaces:
//!
//! * [`Connection`] — implemented by the application. The reader thread
//!   delivers inbound batches through it, the writer thread pulls outbound
//!   chunks from it, and the close cascade closes it exactly once.
//! * [`TransportContext`] — handed to the application at creation time.
//!   Through it the application wakes the writer when data becomes
//!   available, resumes a paused reader, and asks the transport to close
//!   or restart.
//!
//! The context holds only a weak reference to the endpoint, so an
//! application that outlives its connection can keep calling into the
//! context; the calls become no-ops.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::addr::SocketAddress;
use crate::chunk::ChunkList;
use crate::error::Result;
use crate::stats::{ConnectionStats, ConnectionStatsSnapshot};

/// Milliseconds since the Unix epoch; the clock handed to [`Connection::examine`].
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Connection
// ============================================================================

/// Application-side protocol state for one established connection.
///
/// All methods are invoked from transport threads. `process_chunks` runs on
/// the reader thread and `retrieve_chunks`/`examine` on the writer thread,
/// so an implementation needs interior synchronization only where those two
/// sides share state. `close` may race with any of them and must be
/// idempotent.
pub trait Connection: Send + Sync {
    /// Both I/O threads are about to run. Called once, after the
    /// connection is fully attached and before any other method.
    fn start(&self) {}

    /// Consume one inbound batch. Blocking here is the backpressure
    /// mechanism: the reader does not issue the next socket read until this
    /// returns, and a `false` return pauses reading entirely until the
    /// application calls [`TransportContext::read_resumed`].
    fn process_chunks(&self, chunks: ChunkList) -> Result<bool>;

    /// Hand the writer the next batch to send, or `None` when nothing is
    /// pending. Called only after the application has signalled
    /// [`TransportContext::chunks_available`], and repeatedly until it
    /// returns `None`.
    fn retrieve_chunks(&self) -> Option<ChunkList>;

    /// Periodic housekeeping on the writer thread (heartbeats, timeouts).
    /// Returns the next wall-clock deadline in epoch millis at which the
    /// writer should call again, or `None` for no deadline.
    fn examine(&self, now: u64) -> Option<u64>;

    /// Release protocol state. Invoked exactly once by the close cascade.
    fn close(&self);
}

/// Creates one [`Connection`] per established socket.
pub trait ConnectionFactory: Send + Sync {
    /// Build the application connection for a freshly established socket.
    /// An error here aborts the connect and rolls the socket back.
    fn create_connection(&self, context: TransportContext) -> Result<Arc<dyn Connection>>;

    /// Specialize this factory for one partition key, or `None` when the
    /// factory does not distinguish stripes. A connector with a configured
    /// stripe forks once at start and uses the result for every
    /// connection it creates.
    fn fork(&self, _stripe: &str) -> Option<Arc<dyn ConnectionFactory>> {
        None
    }
}

// ============================================================================
// TransportContext
// ============================================================================

/// Endpoint operations the context forwards to.
pub(crate) trait TransportHooks: Send + Sync {
    fn chunks_available(&self);
    fn read_resumed(&self);
    fn close(&self);
    fn mark_for_immediate_restart(&self);
}

/// Application handle into the transport for one connection.
#[derive(Clone)]
pub struct TransportContext {
    hooks: Weak<dyn TransportHooks>,
    remote: SocketAddress,
    local_port: u16,
    stripe: Option<String>,
    stats: Arc<ConnectionStats>,
    properties: Arc<Mutex<HashMap<String, String>>>,
}

impl TransportContext {
    pub(crate) fn new(
        hooks: Weak<dyn TransportHooks>,
        remote: SocketAddress,
        local_port: u16,
        stripe: Option<String>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        Self {
            hooks,
            remote,
            local_port,
            stripe,
            stats,
            properties: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Remote peer of this connection.
    pub fn remote_address(&self) -> &SocketAddress {
        &self.remote
    }

    /// Local port of the underlying socket.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Partition key configured on the connector, if any.
    pub fn stripe(&self) -> Option<&str> {
        self.stripe.as_deref()
    }

    /// Byte counters of this connection.
    pub fn stats(&self) -> ConnectionStatsSnapshot {
        self.stats.snapshot()
    }

    /// Attach a free-form property, visible to every clone of this
    /// context (connection descriptions, auth principals and the like).
    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.lock().insert(key.into(), value.into());
    }

    /// Look up a free-form property.
    pub fn property(&self, key: &str) -> Option<String> {
        self.properties.lock().get(key).cloned()
    }

    /// Tell the writer thread that [`Connection::retrieve_chunks`] now has
    /// data. Cheap and safe to call from any thread, including the reader
    /// thread mid-`process_chunks`.
    pub fn chunks_available(&self) {
        if let Some(hooks) = self.hooks.upgrade() {
            hooks.chunks_available();
        }
    }

    /// Resume reading after [`Connection::process_chunks`] returned `false`.
    pub fn read_resumed(&self) {
        if let Some(hooks) = self.hooks.upgrade() {
            hooks.read_resumed();
        }
    }

    /// Close this connection. The connector's reconnect policy decides what
    /// happens next.
    pub fn close(&self) {
        if let Some(hooks) = self.hooks.upgrade() {
            hooks.close();
        }
    }

    /// Close this connection and skip reconnect pacing for the next attempt,
    /// for protocol-level redirects where the peer asked us to come back
    /// immediately.
    pub fn mark_for_immediate_restart(&self) {
        if let Some(hooks) = self.hooks.upgrade() {
            hooks.mark_for_immediate_restart();
        }
    }
}

impl std::fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportContext")
            .field("remote", &self.remote)
            .field("local_port", &self.local_port)
            .field("stripe", &self.stripe)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
