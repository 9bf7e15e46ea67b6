// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! Connection endpoint: lifecycle of one socket connection.
//!
//! An endpoint pairs one socket with one application connection and the
//! two threads that serve them. Its state advances monotonically:
//!
//! ```text
//!   NEW -> STARTED -> CONNECTING -> CONNECTED -> STOPPED
//!                \________________\_____________^
//! ```
//!
//! STOPPED is terminal and reachable from every state. Exactly one caller
//! wins the STARTED -> CONNECTING transition and performs the connect;
//! everyone else blocks in [`ConnectionEndpoint::wait_connected`] until
//! the winner publishes an outcome.
//!
//! The per-socket [`ConnectionData`] is published exactly once, is
//! immutable afterwards, and is cleared exactly once by the close
//! cascade. The cascade releases resources outermost-first: application
//! connection, stats scope, closed-stats accounting, then the socket
//! itself; a failure in one step never skips the others.

use std::io::{Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex};

use crate::addr::SocketAddress;
use crate::chunk::ChunkPool;
use crate::config::TransportSettings;
use crate::connection::{Connection, ConnectionFactory, TransportContext, TransportHooks};
use crate::error::{Result, TransportError};
use crate::reader::{reader_loop, ReaderGate};
use crate::source::{AddressSource, SocketInfo};
use crate::stats::{ClosedConnectionStats, ConnectionStats, StatsRegistry, StatsScope};
use crate::stream::StreamControl;
use crate::writer::{writer_loop, WriterSignal};

/// How often a connect-race loser rechecks for a stopped endpoint while
/// the winner is still connecting.
const CONNECT_WAIT_SLICE: Duration = Duration::from_secs(1);

// ============================================================================
// State
// ============================================================================

/// Endpoint lifecycle state; transitions only move right.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    New,
    Started,
    Connecting,
    Connected,
    Stopped,
}

// ============================================================================
// ConnectionData
// ============================================================================

/// Everything attached to one established socket. Published once by the
/// connect winner, consumed by the close cascade.
pub struct ConnectionData {
    /// Remote peer
    pub remote: SocketAddress,

    /// Local port of the socket
    pub local_port: u16,

    /// The application connection served by the I/O threads
    pub connection: Arc<dyn Connection>,

    /// Byte counters updated by the I/O threads
    pub stats: Arc<ConnectionStats>,

    /// Producer-to-writer wakeup flag
    pub writer_signal: WriterSignal,

    /// Reader pause/resume latch
    pub reader_gate: ReaderGate,

    scope: StatsScope,
    control: StreamControl,
    read_half: Mutex<Option<Box<dyn Read + Send>>>,
    write_half: Mutex<Option<Box<dyn Write + Send>>>,
}

impl std::fmt::Debug for ConnectionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionData")
            .field("remote", &self.remote)
            .field("local_port", &self.local_port)
            .finish_non_exhaustive()
    }
}

impl ConnectionData {
    /// Hand the read half to the reader thread. Yields once.
    pub fn take_reader(&self) -> Option<Box<dyn Read + Send>> {
        self.read_half.lock().take()
    }

    /// Hand the write half to the writer thread. Yields once.
    pub fn take_writer(&self) -> Option<Box<dyn Write + Send>> {
        self.write_half.lock().take()
    }
}

// ============================================================================
// ConnectionEndpoint
// ============================================================================

/// Listener invoked exactly once when the endpoint stops.
pub type CloseListener = Box<dyn FnOnce(&Arc<ConnectionEndpoint>) + Send>;

/// Shared machinery an endpoint is born with; one per connector.
#[derive(Clone)]
pub struct EndpointContext {
    pub factory: Arc<dyn ConnectionFactory>,
    pub pool: Arc<ChunkPool>,
    pub registry: Arc<StatsRegistry>,
    pub closed_stats: Arc<ClosedConnectionStats>,
    pub settings: TransportSettings,
    pub stripe: Option<String>,
}

/// One socket connection from establishment to close.
pub struct ConnectionEndpoint {
    context: EndpointContext,
    state: Mutex<ConnectionState>,
    state_changed: Condvar,
    data: ArcSwapOption<ConnectionData>,
    close_listener: Mutex<Option<CloseListener>>,
    restart_hint: AtomicBool,
    weak_self: Weak<ConnectionEndpoint>,
}

impl ConnectionEndpoint {
    pub fn new(context: EndpointContext) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            context,
            state: Mutex::new(ConnectionState::New),
            state_changed: Condvar::new(),
            data: ArcSwapOption::empty(),
            close_listener: Mutex::new(None),
            restart_hint: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.context.settings
    }

    pub fn pool(&self) -> &Arc<ChunkPool> {
        &self.context.pool
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Stopped
    }

    /// Currently published connection data, if connected.
    pub fn data(&self) -> Option<Arc<ConnectionData>> {
        self.data.load_full()
    }

    /// Install the close listener. Must be set before the endpoint can
    /// stop, or the notification is lost.
    pub fn set_close_listener(&self, listener: CloseListener) {
        *self.close_listener.lock() = Some(listener);
    }

    /// Whether the application asked for the next reconnect to skip
    /// pacing. Reading consumes the hint.
    pub fn take_restart_hint(&self) -> bool {
        self.restart_hint.swap(false, Ordering::AcqRel)
    }

    // ------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------

    /// NEW -> STARTED. Returns `false` if the endpoint moved on already.
    pub fn start(&self) -> bool {
        self.advance(ConnectionState::New, ConnectionState::Started)
    }

    /// STARTED -> CONNECTING. Exactly one caller wins; the winner must
    /// follow up with [`make_connected`] or [`close`].
    ///
    /// [`make_connected`]: ConnectionEndpoint::make_connected
    /// [`close`]: ConnectionEndpoint::close
    pub fn make_connecting(&self) -> bool {
        self.advance(ConnectionState::Started, ConnectionState::Connecting)
    }

    fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state != from {
            return false;
        }
        *state = to;
        self.state_changed.notify_all();
        true
    }

    /// Block until the connect race publishes an outcome. Returns `true`
    /// when the endpoint reached CONNECTED, `false` on STOPPED or timeout.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state < ConnectionState::Connected {
            if self
                .state_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        *state == ConnectionState::Connected
    }

    // ------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------

    /// Attach an established socket: register stats, create the
    /// application connection, split the stream, publish the data, move
    /// to CONNECTED, and start the connection.
    ///
    /// Any failure rolls everything back in close-cascade order and stops
    /// the endpoint, so a socket never leaks half-attached.
    pub fn make_connected(self: &Arc<Self>, info: SocketInfo) -> Result<Arc<ConnectionData>> {
        let SocketInfo {
            stream,
            control,
            remote,
            local_port,
        } = info;

        let scope = match self.context.registry.create_connection_scope(
            &remote.host,
            remote.port,
            local_port,
        ) {
            Ok(scope) => scope,
            Err(e) => {
                control.shutdown();
                self.close();
                return Err(e);
            }
        };

        let stats = Arc::new(ConnectionStats::default());
        let hooks: Weak<dyn TransportHooks> = self.weak_self.clone() as _;
        let transport_context = TransportContext::new(
            hooks,
            remote.clone(),
            local_port,
            self.context.stripe.clone(),
            stats.clone(),
        );
        let connection = match self.context.factory.create_connection(transport_context) {
            Ok(connection) => connection,
            Err(e) => {
                scope.close();
                control.shutdown();
                self.close();
                return Err(e);
            }
        };

        let halves = match stream.split() {
            Ok(halves) => halves,
            Err(e) => {
                isolated("closing connection", || connection.close());
                scope.close();
                control.shutdown();
                self.close();
                return Err(e);
            }
        };

        let data = Arc::new(ConnectionData {
            remote,
            local_port,
            connection,
            stats,
            writer_signal: WriterSignal::new(),
            reader_gate: ReaderGate::new(),
            scope,
            control,
            read_half: Mutex::new(Some(halves.reader)),
            write_half: Mutex::new(Some(halves.writer)),
        });

        let mut state = self.state.lock();
        if *state != ConnectionState::Connecting {
            // Stopped while we were connecting; unwind the attachment
            drop(state);
            self.run_close_cascade(&data);
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "endpoint stopped during connect",
            )));
        }
        self.data.store(Some(data.clone()));
        *state = ConnectionState::Connected;
        self.state_changed.notify_all();
        drop(state);

        data.connection.start();
        Ok(data)
    }

    /// Join the connect race. The STARTED -> CONNECTING winner pulls the
    /// next socket from `source` and attaches it; every other caller
    /// blocks in [`wait_connected`] until the winner publishes an
    /// outcome. Returns the published data, or `None` once the endpoint
    /// is stopped.
    ///
    /// [`wait_connected`]: ConnectionEndpoint::wait_connected
    pub fn connect_via(self: &Arc<Self>, source: &dyn AddressSource) -> Option<Arc<ConnectionData>> {
        if self.make_connecting() {
            let Some(info) = source.next_socket() else {
                self.close();
                return None;
            };
            match self.make_connected(info) {
                Ok(data) => Some(data),
                Err(e) => {
                    // Already rolled back and stopped
                    log::warn!("Cannot attach connection: {}", e);
                    None
                }
            }
        } else {
            loop {
                if self.wait_connected(CONNECT_WAIT_SLICE) {
                    return self.data();
                }
                if self.is_closed() {
                    return None;
                }
            }
        }
    }

    /// Serve the endpoint to completion: the writer on its own thread,
    /// the reader on the calling thread. Both race the connect through
    /// [`connect_via`], so the thread pair is in place before any
    /// traffic flows and the loser picks up the winner's outcome.
    /// Returns when the connection has fully closed.
    ///
    /// [`connect_via`]: ConnectionEndpoint::connect_via
    pub fn run(self: &Arc<Self>, source: Arc<dyn AddressSource>) {
        self.start();
        let writer = {
            let endpoint = self.clone();
            let source = source.clone();
            thread::Builder::new()
                .name("mdwire-writer".into())
                .spawn(move || {
                    if let Some(data) = endpoint.connect_via(&*source) {
                        writer_loop(&endpoint, &data);
                    }
                    endpoint.close();
                })
        };
        match writer {
            Ok(handle) => {
                if let Some(data) = self.connect_via(&*source) {
                    reader_loop(self, &data);
                }
                self.close();
                let _ = handle.join();
            }
            Err(e) => {
                log::error!("Cannot spawn writer thread: {}", e);
                self.close();
            }
        }
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Stop the endpoint. Idempotent; the first caller runs the close
    /// cascade and the close listener, everyone else returns immediately.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Stopped {
                return;
            }
            *state = ConnectionState::Stopped;
            self.state_changed.notify_all();
        }

        if let Some(data) = self.data.swap(None) {
            self.run_close_cascade(&data);
            log::info!("Disconnected from {}", data.remote);
        }

        let listener = self.close_listener.lock().take();
        if let (Some(listener), Some(this)) = (listener, self.weak_self.upgrade()) {
            isolated("close listener", || listener(&this));
        }
    }

    /// Release one connection's resources outermost-first. Each step is
    /// isolated so a failure cannot skip the ones after it.
    fn run_close_cascade(&self, data: &Arc<ConnectionData>) {
        // Wake the I/O threads first so they observe the stop
        data.writer_signal.wake();
        data.reader_gate.resume();

        isolated("closing connection", || data.connection.close());
        data.scope.close();
        self.context.closed_stats.add(data.stats.snapshot());
        data.control.shutdown();
    }
}

impl TransportHooks for ConnectionEndpoint {
    fn chunks_available(&self) {
        if let Some(data) = self.data.load_full() {
            data.writer_signal.available();
        }
    }

    fn read_resumed(&self) {
        if let Some(data) = self.data.load_full() {
            data.reader_gate.resume();
        }
    }

    fn close(&self) {
        ConnectionEndpoint::close(self);
    }

    fn mark_for_immediate_restart(&self) {
        self.restart_hint.store(true, Ordering::Release);
        ConnectionEndpoint::close(self);
    }
}

fn isolated(what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("Panic while {}", what);
    }
}

// ============================================================================
// Tests
// ============================================================================
