// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, OnceLock},
};

use crossbeam::queue::SegQueue;

/// Number of idle buffers kept by [`BufferPool::shared()`].
const SHARED_MAX_IDLE: usize = 32;

/// A pool of reusable byte buffers.
///
/// Buffers are rented with [`BufferPool::rent()`] and handed back
/// automatically when the returned [`PooledBuffer`] is dropped, on every
/// exit path of the renting code.
#[derive(Debug)]
pub struct BufferPool {
    idle: SegQueue<Vec<u8>>,
    max_idle: usize,
}

impl BufferPool {
    /// A pool that keeps at most `max_idle` returned buffers around.
    #[must_use]
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: SegQueue::new(),
            max_idle,
        }
    }

    /// The process-wide pool shared by all clients.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<BufferPool>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Arc::new(Self::new(SHARED_MAX_IDLE))))
    }

    /// Rents a zero-filled buffer of exactly `len` bytes.
    #[must_use]
    pub fn rent(self: &Arc<Self>, len: usize) -> PooledBuffer {
        let mut buf = self.idle.pop().unwrap_or_default();
        buf.clear();
        buf.resize(len, 0);
        PooledBuffer {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Number of buffers currently waiting for reuse.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    // Concurrent returns may briefly exceed `max_idle` by a few buffers.
    fn give_back(&self, buf: Vec<u8>) {
        if self.idle.len() < self.max_idle {
            self.idle.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(SHARED_MAX_IDLE)
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .finish_non_exhaustive()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}
