// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! Socket sources.
//!
//! An [`AddressSource`] hands the connector worker one established socket
//! at a time and owns all the policy of getting there. The client source
//! walks its address list: resolve, shuffle, prefer local addresses,
//! pace attempts per address, tunnel through a proxy, and wrap in TLS
//! when configured. One call to [`AddressSource::next_socket`] may block
//! through pacing delays and connect attempts for as long as it takes;
//! closing the source aborts the waits.
//!
//! The source outlives individual endpoints so pacing state survives
//! reconnects. Only one worker thread calls `next_socket` at a time.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::addr::{is_local_address, parse_address_list, SocketAddress};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::pacing::{PacerMap, ReconnectPacer};
use crate::proxy;
use crate::stream::{connect_tcp, ByteStream, StreamControl, TcpByteStream};

/// Bound on one TCP connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// AddressSource
// ============================================================================

/// One established socket, ready for the endpoint to adopt.
pub struct SocketInfo {
    /// The stream to split between the I/O threads
    pub stream: Box<dyn ByteStream>,

    /// Out-of-band shutdown handle to the raw socket
    pub control: StreamControl,

    /// Remote peer as configured (host name preserved for logs)
    pub remote: SocketAddress,

    /// Local port of the established socket
    pub local_port: u16,
}

/// Produces established sockets for a connector worker.
pub trait AddressSource: Send + Sync {
    /// Block until the next socket is established, or return `None` once
    /// the source is closed.
    fn next_socket(&self) -> Option<SocketInfo>;

    /// Abort any wait in progress and make `next_socket` return `None`
    /// from now on.
    fn close(&self);

    /// Skip pacing for the next attempt cycle.
    fn mark_for_immediate_restart(&self) {}
}

// ============================================================================
// ClientAddressSource
// ============================================================================

/// One connect target: the (possibly resolved) address plus the configured
/// host name, kept for SNI and logging.
#[derive(Clone, Debug)]
struct Candidate {
    address: SocketAddress,
    host_name: String,
}

struct SourceState {
    candidates: Vec<Candidate>,
    cursor: usize,
    pacers: PacerMap,
    resolve_pacer: ReconnectPacer,
}

/// Address source that walks a configured address list.
pub struct ClientAddressSource {
    config: ClientConfig,
    configured: Vec<SocketAddress>,
    state: Mutex<SourceState>,
    closed: AtomicBool,
    restart_requested: AtomicBool,
    #[cfg(feature = "tls")]
    tls: Option<crate::tls::TlsConnector>,
}

impl ClientAddressSource {
    /// Parse the address list and prepare the connect pipeline. Fails fast
    /// on an unparsable list or TLS configuration.
    pub fn new(config: ClientConfig) -> Result<Arc<Self>> {
        let configured = parse_address_list(&config.address, config.default_port)?;
        #[cfg(not(feature = "tls"))]
        if config.tls_enabled {
            return Err(crate::error::TransportError::Factory(
                "TLS requested but the \"tls\" feature is not compiled in".into(),
            ));
        }
        #[cfg(feature = "tls")]
        let tls = match (&config.tls, config.tls_enabled) {
            (Some(tls_config), true) => Some(crate::tls::TlsConnector::new(tls_config)?),
            (None, true) => Some(crate::tls::TlsConnector::new(&Default::default())?),
            _ => None,
        };
        let delay = config.reconnect_delay;
        Ok(Arc::new(Self {
            config,
            configured,
            state: Mutex::new(SourceState {
                candidates: Vec::new(),
                cursor: 0,
                pacers: PacerMap::new(delay),
                resolve_pacer: ReconnectPacer::new(delay),
            }),
            closed: AtomicBool::new(false),
            restart_requested: AtomicBool::new(false),
            #[cfg(feature = "tls")]
            tls,
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Build a fresh candidate cycle: resolve each configured host, expand
    /// to its addresses, dedupe, shuffle, then move addresses of local
    /// interfaces to the front without disturbing their relative order.
    ///
    /// Resolution happens here even when a proxy is configured, so
    /// multi-address hosts keep their per-address pacing and local
    /// priority behind the tunnel. An unresolvable host stays in the
    /// cycle verbatim; with a proxy the proxy gets a chance to resolve
    /// it, without one the connect attempt reports the failure in its
    /// turn.
    fn resolve_candidates(&self) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for configured in &self.configured {
            match (configured.host.as_str(), configured.port).to_socket_addrs() {
                Ok(addrs) => {
                    for addr in addrs {
                        candidates.push(Candidate {
                            address: SocketAddress::new(addr.ip().to_string(), addr.port()),
                            host_name: configured.host.clone(),
                        });
                    }
                }
                Err(e) => {
                    log::warn!("Cannot resolve {}: {}", configured, e);
                    candidates.push(Candidate {
                        address: configured.clone(),
                        host_name: configured.host.clone(),
                    });
                }
            }
        }

        dedupe_candidates(&mut candidates);
        fastrand::shuffle(&mut candidates);
        // Stable: locals first, shuffle order preserved within each group
        candidates.sort_by_key(|c| !is_local_address(&c.address.host));
        candidates
    }

    /// Establish one socket to `candidate`: TCP (directly or to the
    /// proxy), CONNECT tunnel, TLS handshake.
    fn connect_candidate(&self, candidate: &Candidate) -> Result<SocketInfo> {
        let (tcp_target, via_proxy) = match &self.config.proxy_host {
            Some(proxy_host) => (
                resolve_one(proxy_host, self.config.proxy_port)?,
                true,
            ),
            None => (
                resolve_one(&candidate.address.host, candidate.address.port)?,
                false,
            ),
        };

        let mut socket = connect_tcp(&tcp_target, CONNECT_TIMEOUT, &self.config.settings)?;
        if via_proxy {
            proxy::establish_tunnel(&mut socket, &candidate.address)?;
        }

        let control = StreamControl::new(&socket)?;
        let local_port = control.local_port();

        #[cfg(feature = "tls")]
        let stream: Box<dyn ByteStream> = match &self.tls {
            Some(connector) => Box::new(connector.handshake(socket, &candidate.host_name)?),
            None => Box::new(TcpByteStream::new(socket)),
        };
        #[cfg(not(feature = "tls"))]
        let stream: Box<dyn ByteStream> = Box::new(TcpByteStream::new(socket));

        Ok(SocketInfo {
            stream,
            control,
            remote: candidate.address.clone(),
            local_port,
        })
    }
}

impl AddressSource for ClientAddressSource {
    fn next_socket(&self) -> Option<SocketInfo> {
        let closed = || self.is_closed();
        loop {
            if self.is_closed() {
                return None;
            }
            let mut state = self.state.lock();
            if self.restart_requested.swap(false, Ordering::AcqRel) {
                state.resolve_pacer.reset();
                state.pacers.clear();
                state.cursor = state.candidates.len();
            }

            if state.cursor >= state.candidates.len() {
                if !state.resolve_pacer.sleep_before_attempt(&closed) {
                    return None;
                }
                state.candidates = self.resolve_candidates();
                state.cursor = 0;
                if state.candidates.is_empty() {
                    log::warn!("No addresses to connect to in \"{}\"", self.config.address);
                    continue;
                }
            }

            let candidate = state.candidates[state.cursor].clone();
            state.cursor += 1;

            if !state.pacers.pacer(&candidate.address).sleep_before_attempt(&closed) {
                return None;
            }
            drop(state);

            log::info!("Connecting to {}", candidate.address);
            match self.connect_candidate(&candidate) {
                Ok(info) => {
                    log::info!(
                        "Connected to {} (local port {})",
                        info.remote,
                        info.local_port
                    );
                    return Some(info);
                }
                Err(e) => {
                    if !self.is_closed() {
                        log::warn!("Cannot connect to {}: {}", candidate.address, e);
                    }
                }
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn mark_for_immediate_restart(&self) {
        self.restart_requested.store(true, Ordering::Release);
    }
}

// ============================================================================
// ServerAddressSource
// ============================================================================

/// Source over a single already-accepted socket. The first `next_socket`
/// call yields it; every later call reports the source closed.
pub struct ServerAddressSource {
    info: Mutex<Option<SocketInfo>>,
}

impl ServerAddressSource {
    pub fn new(info: SocketInfo) -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(Some(info)),
        })
    }
}

impl AddressSource for ServerAddressSource {
    fn next_socket(&self) -> Option<SocketInfo> {
        self.info.lock().take()
    }

    fn close(&self) {
        // Dropping an unclaimed socket closes it
        self.info.lock().take();
    }
}

fn dedupe_candidates(candidates: &mut Vec<Candidate>) {
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|c| seen.insert(c.address.clone()));
}

/// Resolve a host to its first address.
fn resolve_one(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs.next().ok_or_else(|| {
        crate::error::TransportError::InvalidAddress(format!(
            "no addresses for \"{}\"",
            host
        ))
    })
}

// ============================================================================
// Tests
// ============================================================================
