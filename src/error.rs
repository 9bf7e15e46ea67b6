// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! Error types for the transport layer.

use std::fmt;
use std::io;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur in the transport layer.
///
/// Connect-path errors (`Io`, `Proxy`, `Tls`) are transient by design: the
/// attempt is logged, the socket is discarded and the next attempt is paced.
/// Only the close cascade treats errors as connection-fatal, and even then
/// the failure stays local to one endpoint.
#[derive(Debug)]
pub enum TransportError {
    /// Underlying socket I/O error
    Io(io::Error),

    /// Malformed address-list string
    InvalidAddress(String),

    /// HTTP proxy refused or garbled the CONNECT handshake
    Proxy(String),

    /// TLS handshake or session error
    #[cfg(feature = "tls")]
    Tls(rustls::Error),

    /// Peer closed the connection (EOF on read)
    ClosedByPeer,

    /// Application connection factory failed
    Factory(String),

    /// Stats scope could not be allocated
    Stats(String),
}

impl TransportError {
    /// True for errors that represent a normal remote close rather than a fault.
    pub fn is_closed_by_peer(&self) -> bool {
        matches!(self, Self::ClosedByPeer)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::InvalidAddress(s) => write!(f, "invalid address: {}", s),
            Self::Proxy(s) => write!(f, "HTTP proxy error: {}", s),
            #[cfg(feature = "tls")]
            Self::Tls(e) => write!(f, "TLS error: {}", e),
            Self::ClosedByPeer => write!(f, "connection closed by peer"),
            Self::Factory(s) => write!(f, "connection factory error: {}", s),
            Self::Stats(s) => write!(f, "stats error: {}", s),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            #[cfg(feature = "tls")]
            Self::Tls(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(feature = "tls")]
impl From<rustls::Error> for TransportError {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e)
    }
}
