// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! Blocking TCP transport for market-data distribution.
//!
//! This crate moves opaque chunked byte streams between a publish/subscribe
//! protocol layer and TCP sockets. It owns sockets, threads, reconnect
//! policy, and backpressure; the protocol layer owns framing and message
//! semantics behind the [`Connection`] trait.
//!
//! ```text
//!   application protocol layer
//!        ^  process_chunks            |  retrieve_chunks
//!        |                           v
//!   +---------+   +----------------------+   +---------+
//!   | reader  |-->|  ConnectionEndpoint  |<--| writer  |   2 threads per
//!   | thread  |   |  (state machine)     |   | thread  |   connection
//!   +---------+   +----------------------+   +---------+
//!        ^                                        |
//!        +------------- TCP socket <--------------+
//!
//!   ClientConnector: address list -> resolve -> shuffle -> pace -> connect
//!                    (optional HTTP CONNECT proxy, optional TLS)
//!   ServerConnector: bind -> accept -> one endpoint per inbound socket
//! ```
//!
//! Everything is blocking: one reader and one writer thread per
//! connection, one thread per acceptor. Backpressure is pull-based at
//! both ends; the transport never buffers more than the batch in flight.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mdwire::{ClientConfig, ClientConnector, ConnectionFactory, TransportContext};
//! # use mdwire::{Connection, Result};
//! # struct MyFactory;
//! # impl ConnectionFactory for MyFactory {
//! #     fn create_connection(&self, _: TransportContext) -> Result<Arc<dyn Connection>> {
//! #         unimplemented!()
//! #     }
//! # }
//!
//! # fn main() -> Result<()> {
//! let config = ClientConfig::new("feed1.example.com,feed2.example.com:7400", 0);
//! let connector = ClientConnector::new(config, Arc::new(MyFactory));
//! connector.start()?;
//! // ... connector reconnects on its own until stopped
//! connector.stop();
//! # Ok(())
//! # }
//! ```

pub mod acceptor;
pub mod addr;
pub mod chunk;
pub mod config;
pub mod connection;
pub mod connector;
pub mod endpoint;
pub mod error;
pub mod pacing;
pub mod proxy;
pub mod reader;
pub mod source;
pub mod stats;
pub mod stream;
#[cfg(feature = "tls")]
pub mod tls;
pub mod writer;

pub use addr::{parse_address_list, SocketAddress};
pub use chunk::{Chunk, ChunkList, ChunkPool};
pub use config::{ClientConfig, ServerConfig, TransportSettings};
pub use connection::{Connection, ConnectionFactory, TransportContext};
pub use connector::{ClientConnector, ServerConnector};
pub use endpoint::{ConnectionEndpoint, ConnectionState};
pub use error::{Result, TransportError};
pub use stats::EndpointStats;
#[cfg(feature = "tls")]
pub use tls::{InsecureVerifier, TlsConfig};
