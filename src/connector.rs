// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! Client and server connectors.
//!
//! A connector is the long-lived object the application holds: it owns
//! the reconnect (or accept) policy, the chunk pool, and the aggregate
//! statistics, and it turns sockets into endpoints.
//!
//! The client connector runs one worker thread. Each pass creates a fresh
//! endpoint and runs it against the shared address source; the worker
//! doubles as the reader thread, racing the endpoint's writer thread for
//! the connect, until the connection closes and the pass repeats. The
//! address source outlives endpoints, so per-address pacing carries
//! across reconnects. Stopping closes the source, which aborts any wait
//! the worker is in.
//!
//! The server connector runs one acceptor thread and one thread per
//! accepted connection. Accepted endpoints live in a registry map; each
//! endpoint's close listener removes it, and stop closes whatever is
//! left.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::acceptor::ConnectionAcceptor;
use crate::addr::SocketAddress;
use crate::chunk::ChunkPool;
use crate::config::{ClientConfig, ServerConfig};
use crate::connection::ConnectionFactory;
use crate::endpoint::{ConnectionEndpoint, EndpointContext};
use crate::error::Result;
use crate::pacing::ReconnectPacer;
use crate::source::{AddressSource, ClientAddressSource, ServerAddressSource, SocketInfo};
use crate::stats::{ClosedConnectionStats, EndpointStats, StatsRegistry};
use crate::stream::{tune_socket, StreamControl, TcpByteStream};

// ============================================================================
// ClientConnector
// ============================================================================

/// Maintains one outbound connection to an address list, reconnecting
/// for as long as it is active.
pub struct ClientConnector {
    config: ClientConfig,
    factory: Arc<dyn ConnectionFactory>,
    pool: Arc<ChunkPool>,
    registry: Arc<StatsRegistry>,
    closed_stats: Arc<ClosedConnectionStats>,
    active: AtomicBool,
    source: Mutex<Option<Arc<ClientAddressSource>>>,
    endpoint: Mutex<Option<Arc<ConnectionEndpoint>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ClientConnector {
    pub fn new(config: ClientConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        let pool = ChunkPool::new(config.settings.chunk_size, config.settings.pool_capacity);
        Arc::new(Self {
            config,
            factory,
            pool,
            registry: StatsRegistry::new(),
            closed_stats: Arc::new(ClosedConnectionStats::default()),
            active: AtomicBool::new(false),
            source: Mutex::new(None),
            endpoint: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Begin connecting. Idempotent while active; a stopped connector can
    /// be started again with fresh pacing state.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let source = match ClientAddressSource::new(self.config.clone()) {
            Ok(source) => source,
            Err(e) => {
                self.active.store(false, Ordering::Release);
                return Err(e);
            }
        };
        *self.source.lock() = Some(source.clone());

        let connector = self.clone();
        let worker = thread::Builder::new()
            .name(format!("mdwire-client-{}", self.config.address))
            .spawn(move || connector.worker_loop(source))
            .map_err(crate::error::TransportError::from)?;
        *self.worker.lock() = Some(worker);
        log::info!("Started connecting to \"{}\"", self.config.address);
        Ok(())
    }

    /// Stop reconnecting and close the current connection. Blocks until
    /// the worker thread has exited.
    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(source) = self.source.lock().take() {
            source.close();
        }
        if let Some(endpoint) = self.endpoint.lock().take() {
            endpoint.close();
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        log::info!("Stopped connecting to \"{}\"", self.config.address);
    }

    /// Skip pacing for the next reconnect attempt.
    pub fn mark_for_immediate_restart(&self) {
        if let Some(source) = self.source.lock().as_ref() {
            source.mark_for_immediate_restart();
        }
    }

    /// Endpoint of the current connection, if any.
    pub fn current_endpoint(&self) -> Option<Arc<ConnectionEndpoint>> {
        self.endpoint.lock().clone()
    }

    /// Aggregate statistics over all connections, live and closed.
    pub fn stats(&self) -> EndpointStats {
        let active = self
            .current_endpoint()
            .and_then(|endpoint| endpoint.data())
            .map(|data| data.stats.snapshot());
        EndpointStats::aggregate(&self.closed_stats, active.into_iter())
    }

    /// Management view of live connections.
    pub fn registry(&self) -> &Arc<StatsRegistry> {
        &self.registry
    }

    fn endpoint_context(&self) -> EndpointContext {
        // A striped connector lets the factory specialize itself once
        let factory = self
            .config
            .stripe
            .as_deref()
            .and_then(|stripe| self.factory.fork(stripe))
            .unwrap_or_else(|| self.factory.clone());
        EndpointContext {
            factory,
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            closed_stats: self.closed_stats.clone(),
            settings: self.config.settings.clone(),
            stripe: self.config.stripe.clone(),
        }
    }

    /// One endpoint per pass; the worker thread doubles as the reader
    /// thread of the live connection.
    fn worker_loop(self: &Arc<Self>, source: Arc<ClientAddressSource>) {
        while self.is_active() {
            let endpoint = ConnectionEndpoint::new(self.endpoint_context());
            *self.endpoint.lock() = Some(endpoint.clone());
            {
                // Forward the application's restart request to the source
                // the moment the endpoint closes
                let source = source.clone();
                endpoint.set_close_listener(Box::new(move |endpoint| {
                    if endpoint.take_restart_hint() {
                        source.mark_for_immediate_restart();
                    }
                }));
            }
            endpoint.run(source.clone());
        }
        if let Some(endpoint) = self.endpoint.lock().take() {
            endpoint.close();
        }
    }
}

// ============================================================================
// ServerConnector
// ============================================================================

/// Accepted endpoints, keyed for removal by the close listener.
#[derive(Default)]
struct EndpointMap {
    endpoints: Mutex<HashMap<u64, Arc<ConnectionEndpoint>>>,
    next_id: AtomicU64,
}

impl EndpointMap {
    fn insert(&self, endpoint: Arc<ConnectionEndpoint>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.endpoints.lock().insert(id, endpoint);
        id
    }

    fn remove(&self, id: u64) {
        self.endpoints.lock().remove(&id);
    }

    fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    fn drain(&self) -> Vec<Arc<ConnectionEndpoint>> {
        self.endpoints.lock().drain().map(|(_, e)| e).collect()
    }

    fn snapshot(&self) -> Vec<Arc<ConnectionEndpoint>> {
        self.endpoints.lock().values().cloned().collect()
    }
}

/// Accepts inbound connections and serves each on its own thread.
pub struct ServerConnector {
    config: ServerConfig,
    factory: Arc<dyn ConnectionFactory>,
    pool: Arc<ChunkPool>,
    registry: Arc<StatsRegistry>,
    closed_stats: Arc<ClosedConnectionStats>,
    endpoints: Arc<EndpointMap>,
    active: AtomicBool,
    acceptor: Mutex<Option<Arc<ConnectionAcceptor>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ServerConnector {
    pub fn new(config: ServerConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        let pool = ChunkPool::new(config.settings.chunk_size, config.settings.pool_capacity);
        Arc::new(Self {
            config,
            factory,
            pool,
            registry: StatsRegistry::new(),
            closed_stats: Arc::new(ClosedConnectionStats::default()),
            endpoints: Arc::new(EndpointMap::default()),
            active: AtomicBool::new(false),
            acceptor: Mutex::new(None),
            worker: Mutex::new(None),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Start listening. The first bind happens synchronously so callers
    /// can observe the listening port; if the port is busy the acceptor
    /// thread keeps retrying on its own.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let acceptor = Arc::new(ConnectionAcceptor::new(
            self.config.bind_address,
            self.config.port,
            self.config.backlog,
        ));
        let bound = acceptor.bind().is_ok();
        *self.acceptor.lock() = Some(acceptor.clone());

        let connector = self.clone();
        let worker = thread::Builder::new()
            .name(format!("mdwire-server-{}", self.config.port))
            .spawn(move || connector.acceptor_loop(acceptor, bound))
            .map_err(crate::error::TransportError::from)?;
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    /// Stop listening and close every accepted connection. Blocks until
    /// the acceptor thread has exited; per-connection threads finish on
    /// their own once their endpoints are closed.
    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(acceptor) = self.acceptor.lock().take() {
            acceptor.close();
        }
        for endpoint in self.endpoints.drain() {
            endpoint.close();
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        log::info!("Stopped listening on port {}", self.config.port);
    }

    /// Actual listening port, once bound.
    pub fn local_port(&self) -> u16 {
        self.acceptor
            .lock()
            .as_ref()
            .map(|a| a.local_port())
            .unwrap_or(0)
    }

    /// Number of currently served connections.
    pub fn connection_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Aggregate statistics over all connections, live and closed.
    pub fn stats(&self) -> EndpointStats {
        let active = self
            .endpoints
            .snapshot()
            .into_iter()
            .filter_map(|endpoint| endpoint.data())
            .map(|data| data.stats.snapshot())
            .collect::<Vec<_>>();
        EndpointStats::aggregate(&self.closed_stats, active.into_iter())
    }

    /// Management view of live connections.
    pub fn registry(&self) -> &Arc<StatsRegistry> {
        &self.registry
    }

    fn acceptor_loop(self: &Arc<Self>, acceptor: Arc<ConnectionAcceptor>, mut bound: bool) {
        let mut bind_pacer = ReconnectPacer::new(self.config.bind_retry_delay);
        while !bound {
            if !bind_pacer.sleep_before_attempt(&|| !self.is_active()) {
                return;
            }
            match acceptor.bind() {
                Ok(()) => bound = true,
                Err(e) => log::warn!("Cannot listen on port {}: {}", self.config.port, e),
            }
        }

        acceptor.accept_loop(|stream, peer| self.adopt(stream, peer));
    }

    /// Turn one accepted socket into a served endpoint.
    fn adopt(self: &Arc<Self>, stream: TcpStream, peer: std::net::SocketAddr) {
        let max = self.config.max_connections;
        if max != 0 && self.endpoints.len() >= max {
            log::warn!("Rejecting connection from {}: connection limit {}", peer, max);
            return; // dropping the stream resets it
        }
        if let Err(e) = tune_socket(&stream, &self.config.settings) {
            log::warn!("Cannot tune socket from {}: {}", peer, e);
        }
        let control = match StreamControl::new(&stream) {
            Ok(control) => control,
            Err(e) => {
                log::warn!("Cannot adopt connection from {}: {}", peer, e);
                return;
            }
        };
        let info = SocketInfo {
            local_port: control.local_port(),
            control,
            remote: SocketAddress::new(peer.ip().to_string(), peer.port()),
            stream: Box::new(TcpByteStream::new(stream)),
        };

        let endpoint = ConnectionEndpoint::new(EndpointContext {
            factory: self.factory.clone(),
            pool: self.pool.clone(),
            registry: self.registry.clone(),
            closed_stats: self.closed_stats.clone(),
            settings: self.config.settings.clone(),
            stripe: None,
        });
        let id = self.endpoints.insert(endpoint.clone());
        {
            let endpoints = self.endpoints.clone();
            endpoint.set_close_listener(Box::new(move |_| endpoints.remove(id)));
        }
        log::info!("Accepted connection from {}", peer);
        let source = ServerAddressSource::new(info);
        let spawn = {
            let endpoint = endpoint.clone();
            thread::Builder::new()
                .name(format!("mdwire-conn-{}", peer))
                .spawn(move || endpoint.run(source))
        };
        if let Err(e) = spawn {
            log::error!("Cannot spawn connection thread for {}: {}", peer, e);
            endpoint.close();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
