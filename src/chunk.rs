// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 mdwire.io

//! Pooled fixed-capacity byte chunks.
//!
//! The reader fills one [`Chunk`] per socket read and batches chunks into a
//! [`ChunkList`] before handing them to the application connection; the
//! writer streams retrieved chunks to the socket and recycles them. The
//! [`ChunkPool`] keeps a lock-free free list so steady-state I/O does not
//! allocate.

use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

/// Default chunk capacity in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Default number of chunks retained by the pool.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

// ============================================================================
// Chunk
// ============================================================================

/// A fixed-capacity byte buffer with a fill length.
pub struct Chunk {
    buf: Box<[u8]>,
    len: usize,
}

impl Chunk {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Filled portion of the chunk.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Whole backing buffer, for filling by a socket read.
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Set the fill length after a read. Panics if beyond capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.buf.len());
        self.len = len;
    }

    /// Number of filled bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no bytes are filled.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backing capacity.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// True when the fill length equals the capacity.
    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Copy `data` into a fresh chunk, growing past the pool capacity if
    /// needed. Intended for tests and small control payloads.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut chunk = Chunk::with_capacity(data.len().max(DEFAULT_CHUNK_SIZE));
        chunk.buf[..data.len()].copy_from_slice(data);
        chunk.len = data.len();
        chunk
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("len", &self.len)
            .field("capacity", &self.buf.len())
            .finish()
    }
}

// ============================================================================
// ChunkList
// ============================================================================

/// An ordered batch of chunks.
#[derive(Debug, Default)]
pub struct ChunkList {
    chunks: Vec<Chunk>,
    total_len: usize,
}

impl ChunkList {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, accumulating the total byte count.
    pub fn push(&mut self, chunk: Chunk) {
        self.total_len += chunk.len();
        self.chunks.push(chunk);
    }

    /// Number of chunks in the batch.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// True when the batch holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total filled bytes across all chunks.
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    /// Iterate the chunks in order.
    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    /// Concatenate all chunk payloads. Allocates; intended for consumers
    /// that need contiguous bytes, not for the transport fast path.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk.as_slice());
        }
        out
    }

    fn drain(&mut self) -> Vec<Chunk> {
        self.total_len = 0;
        std::mem::take(&mut self.chunks)
    }
}

// ============================================================================
// ChunkPool
// ============================================================================

/// Lock-free pool of uniform chunks.
///
/// `acquire` pops from the free list or allocates; `recycle` pushes back,
/// silently dropping chunks beyond the retention capacity or of a foreign
/// size.
pub struct ChunkPool {
    chunk_size: usize,
    free: ArrayQueue<Chunk>,
}

impl ChunkPool {
    /// Create a pool of `chunk_size`-byte chunks retaining up to
    /// `pool_capacity` free chunks.
    pub fn new(chunk_size: usize, pool_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            chunk_size,
            free: ArrayQueue::new(pool_capacity.max(1)),
        })
    }

    /// Chunk capacity handed out by this pool.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Take a cleared chunk from the pool, allocating if the pool is empty.
    pub fn acquire(&self) -> Chunk {
        match self.free.pop() {
            Some(mut chunk) => {
                chunk.len = 0;
                chunk
            }
            None => Chunk::with_capacity(self.chunk_size),
        }
    }

    /// Return a chunk to the pool.
    pub fn recycle(&self, chunk: Chunk) {
        if chunk.capacity() == self.chunk_size {
            let _ = self.free.push(chunk);
        }
    }

    /// Return all chunks of a batch to the pool.
    pub fn recycle_list(&self, mut list: ChunkList) {
        for chunk in list.drain() {
            self.recycle(chunk);
        }
    }
}

impl Default for ChunkPool {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            free: ArrayQueue::new(DEFAULT_POOL_CAPACITY),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
