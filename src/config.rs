// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! Transport configuration.
//!
//! [`ClientConfig`] drives outbound connectors (address list, proxy, TLS,
//! reconnect pacing), [`ServerConfig`] drives the acceptor side, and
//! [`TransportSettings`] carries the knobs shared by both: chunk sizing,
//! the reader aggregation threshold, the writer park ceiling, and socket
//! options.

use std::net::IpAddr;
use std::time::Duration;

use crate::chunk::{DEFAULT_CHUNK_SIZE, DEFAULT_POOL_CAPACITY};

// ============================================================================
// Shared settings
// ============================================================================

/// Knobs shared by client and server connectors.
#[derive(Clone, Debug)]
pub struct TransportSettings {
    /// Capacity of each pooled chunk
    pub chunk_size: usize,

    /// Free chunks retained by the pool
    pub pool_capacity: usize,

    /// Upper bound on the bytes one inbound delivery may carry; a batch
    /// is handed to the application no later than this size even if the
    /// socket still has buffered data
    pub aggregation_size: usize,

    /// Upper bound on one writer park; the loop wakes at least this often
    /// to re-check for close even with no deadline activity
    pub max_park_time: Duration,

    /// Enable TCP_NODELAY
    pub nodelay: bool,

    /// Enable TCP keep-alive probes
    pub keepalive: bool,

    /// Keep-alive probe interval
    pub keepalive_interval: Duration,

    /// SO_SNDBUF (0 = OS default)
    pub socket_send_buffer: usize,

    /// SO_RCVBUF (0 = OS default)
    pub socket_recv_buffer: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            aggregation_size: 64 * 1024,
            max_park_time: Duration::from_secs(60),
            nodelay: true,
            keepalive: true,
            keepalive_interval: Duration::from_secs(30),
            socket_send_buffer: 0,
            socket_recv_buffer: 0,
        }
    }
}

// ============================================================================
// Client configuration
// ============================================================================

/// Configuration for an outbound (client) connector.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Address list: `host1[:port1],host2[:port2],...`
    pub address: String,

    /// Default port for entries lacking one (0 = take the last entry's port)
    pub default_port: u16,

    /// HTTP proxy host; when set, every connect tunnels through CONNECT
    pub proxy_host: Option<String>,

    /// HTTP proxy port
    pub proxy_port: u16,

    /// Base delay between attempts to one address, and between resolve cycles
    pub reconnect_delay: Duration,

    /// Partition key handed to the connection factory for per-connection
    /// specialization
    pub stripe: Option<String>,

    /// Wrap connections in client-role TLS
    pub tls_enabled: bool,

    /// TLS configuration; required when `tls_enabled` is set
    #[cfg(feature = "tls")]
    pub tls: Option<crate::tls::TlsConfig>,

    /// Shared transport knobs
    pub settings: TransportSettings,
}

impl ClientConfig {
    /// Create a config for one address list with a default port.
    pub fn new(address: impl Into<String>, default_port: u16) -> Self {
        Self {
            address: address.into(),
            default_port,
            proxy_host: None,
            proxy_port: 80,
            reconnect_delay: Duration::from_secs(10),
            stripe: None,
            tls_enabled: false,
            #[cfg(feature = "tls")]
            tls: None,
            settings: TransportSettings::default(),
        }
    }

    /// Builder: route every connect through an HTTP proxy.
    pub fn with_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy_host = Some(host.into());
        self.proxy_port = port;
        self
    }

    /// Builder: set the reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Builder: set the partition key.
    pub fn with_stripe(mut self, stripe: impl Into<String>) -> Self {
        self.stripe = Some(stripe.into());
        self
    }

    /// Builder: enable TLS with the given configuration.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, tls: crate::tls::TlsConfig) -> Self {
        self.tls_enabled = true;
        self.tls = Some(tls);
        self
    }

    /// Builder: replace the shared transport settings.
    pub fn with_settings(mut self, settings: TransportSettings) -> Self {
        self.settings = settings;
        self
    }
}

// ============================================================================
// Server configuration
// ============================================================================

/// Configuration for an accepting (server) connector.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind (None = all interfaces)
    pub bind_address: Option<IpAddr>,

    /// Listen port (0 = ephemeral, discoverable via `local_port`)
    pub port: u16,

    /// Listen backlog
    pub backlog: u32,

    /// Delay between bind attempts when the port is not yet available
    pub bind_retry_delay: Duration,

    /// Maximum simultaneous connections (0 = unlimited)
    pub max_connections: usize,

    /// Shared transport knobs
    pub settings: TransportSettings,
}

impl ServerConfig {
    /// Create a config listening on `port`.
    pub fn new(port: u16) -> Self {
        Self {
            bind_address: None,
            port,
            backlog: 128,
            bind_retry_delay: Duration::from_secs(10),
            max_connections: 0,
            settings: TransportSettings::default(),
        }
    }

    /// Builder: bind a specific address instead of all interfaces.
    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = Some(address);
        self
    }

    /// Builder: cap simultaneous connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder: replace the shared transport settings.
    pub fn with_settings(mut self, settings: TransportSettings) -> Self {
        self.settings = settings;
        self
    }
}
