// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! Reader thread: gate and loop.
//!
//! The reader owns the read half of the stream and delivers inbound bytes
//! to the application one batch at a time. Backpressure is pull-based at
//! two levels: the next socket read is not issued until `process_chunks`
//! returns, and a `false` return closes the [`ReaderGate`] until the
//! application calls `read_resumed`. Nothing is buffered beyond the batch
//! being assembled.
//!
//! Every read delivers immediately. A blocking `Read` cannot tell whether
//! more bytes are already buffered, and holding a filled chunk back while
//! a further read blocks would stall payloads that end exactly on a chunk
//! boundary. The aggregation threshold caps how much one delivery may
//! carry, never how little.

use std::io::Read;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::chunk::ChunkList;
use crate::endpoint::{ConnectionData, ConnectionEndpoint};
use crate::error::TransportError;

// ============================================================================
// ReaderGate
// ============================================================================

/// Pause/resume latch between the application and the reader thread.
#[derive(Debug)]
pub struct ReaderGate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Default for ReaderGate {
    fn default() -> Self {
        Self {
            open: Mutex::new(true),
            cond: Condvar::new(),
        }
    }
}

impl ReaderGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate; the reader blocks before its next socket read.
    pub fn pause(&self) {
        *self.open.lock() = false;
    }

    /// Reopen the gate, releasing a blocked reader.
    pub fn resume(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    /// Block while the gate is closed. The close cascade calls [`resume`]
    /// too, so a paused reader always gets released; it re-checks the
    /// endpoint state on wakeup.
    ///
    /// [`resume`]: ReaderGate::resume
    pub fn wait_open(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cond.wait(&mut open);
        }
    }
}

// ============================================================================
// Reader loop
// ============================================================================

/// Body of the reader thread for one connection.
///
/// Runs until EOF, an I/O error, or close, then closes the endpoint.
/// The endpoint's socket shutdown unblocks a read in progress.
pub fn reader_loop(endpoint: &Arc<ConnectionEndpoint>, data: &Arc<ConnectionData>) {
    let mut reader = match data.take_reader() {
        Some(reader) => reader,
        None => return,
    };
    let pool = endpoint.pool();
    let read_cap = endpoint
        .settings()
        .aggregation_size
        .min(pool.chunk_size())
        .max(1);

    while !endpoint.is_closed() {
        data.reader_gate.wait_open();
        if endpoint.is_closed() {
            break;
        }

        let mut chunk = pool.acquire();
        match reader.read(&mut chunk.buf_mut()[..read_cap]) {
            Ok(0) => {
                pool.recycle(chunk);
                if !endpoint.is_closed() {
                    log::info!("Connection to {}: {}", data.remote, TransportError::ClosedByPeer);
                }
                break;
            }
            Ok(n) => {
                chunk.set_len(n);
                let mut batch = ChunkList::new();
                batch.push(chunk);
                deliver(endpoint, data, batch);
            }
            Err(e) => {
                pool.recycle(chunk);
                if !endpoint.is_closed() {
                    log::warn!("Cannot read from {}: {}", data.remote, e);
                }
                break;
            }
        }
    }
    endpoint.close();
}

/// Hand one batch to the application; a `false` or an error pauses or
/// closes respectively. A `ClosedByPeer` error is the application
/// reporting an orderly protocol-level goodbye, not a fault.
fn deliver(endpoint: &Arc<ConnectionEndpoint>, data: &Arc<ConnectionData>, batch: ChunkList) {
    data.stats.add_read_bytes(batch.total_len() as u64);
    match data.connection.process_chunks(batch) {
        Ok(true) => {}
        Ok(false) => data.reader_gate.pause(),
        Err(e) => {
            if !endpoint.is_closed() {
                if e.is_closed_by_peer() {
                    log::info!("Connection to {}: {}", data.remote, e);
                } else {
                    log::warn!("Connection to {} rejected inbound data: {}", data.remote, e);
                }
            }
            endpoint.close();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_gate_starts_open() {
        let gate = ReaderGate::new();
        let start = Instant::now();
        gate.wait_open();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_gate_blocks_until_resumed() {
        let gate = Arc::new(ReaderGate::new());
        gate.pause();
        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || {
                let start = Instant::now();
                gate.wait_open();
                start.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(100));
        gate.resume();
        let elapsed = waiter.join().unwrap();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_resume_is_idempotent() {
        let gate = ReaderGate::new();
        gate.resume();
        gate.resume();
        gate.wait_open();
    }
}
