// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference-counted pool of fixed-size auxiliary buffers (QP-delta maps) shared between the
//! look-ahead worker and the encode thread.
//!
//! A [`PooledBuffer`] is a counted reference to one block of the pool. Cloning it takes another
//! reference, dropping it releases one. The block goes back to the free list when the last
//! reference is gone, so a block can never be handed out again while somebody still reads it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use thiserror::Error;

use crate::utils::lock;
use crate::utils::wait;

/// Default number of blocks when no look-ahead depth is known.
pub const CUTREE_BUFFER_NUM: usize = 8;

/// Alignment of the simulated bus addresses of the blocks.
const BUS_ALIGNMENT: u64 = 4096;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("the buffer pool has been closed")]
    Closed,
    #[error("no free buffer left in the pool")]
    Exhausted,
}

pub type PoolResult<T> = Result<T, PoolError>;

struct PoolState {
    ref_counts: Vec<u32>,
    free: VecDeque<usize>,
    closed: bool,
    peak_in_use: usize,
}

impl PoolState {
    fn in_use(&self) -> usize {
        self.ref_counts.len() - self.free.len()
    }
}

struct PoolInner {
    state: Mutex<PoolState>,
    /// Signaled when a block returns to the free list or the pool is closed.
    available: Condvar,
    blocks: Box<[RwLock<Box<[u8]>>]>,
    block_size: usize,
    bus_base: u64,
}

impl PoolInner {
    fn take_free(self: &Arc<Self>, state: &mut PoolState) -> Option<PooledBuffer> {
        let index = state.free.pop_front()?;

        debug_assert_eq!(state.ref_counts[index], 0);
        state.ref_counts[index] = 1;
        state.peak_in_use = state.peak_in_use.max(state.in_use());

        log::trace!("acquired pool buffer {} ({} in use)", index, state.in_use());

        Some(PooledBuffer {
            index,
            pool: Arc::clone(self),
        })
    }

    fn add_ref(&self, index: usize) {
        let mut state = lock(&self.state);
        debug_assert!(state.ref_counts[index] > 0);
        state.ref_counts[index] += 1;
    }

    fn release(&self, index: usize) {
        let mut state = lock(&self.state);
        let count = &mut state.ref_counts[index];

        // A live handle always accounts for one reference.
        debug_assert!(*count > 0);
        *count = count.saturating_sub(1);

        if *count == 0 {
            state.free.push_back(index);
            log::trace!("pool buffer {} returned ({} in use)", index, state.in_use());
            drop(state);
            self.available.notify_one();
        }
    }
}

/// A counted reference to one block of a [`BufferPool`].
pub struct PooledBuffer {
    index: usize,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Index of the block inside its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Address of the block as seen by the hardware.
    pub fn bus_address(&self) -> u64 {
        let stride = (self.pool.block_size as u64).next_multiple_of(BUS_ALIGNMENT);
        self.pool.bus_base + self.index as u64 * stride
    }

    pub fn len(&self) -> usize {
        self.pool.block_size
    }

    pub fn is_empty(&self) -> bool {
        self.pool.block_size == 0
    }

    /// Maps the block for reading.
    pub fn map(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.pool.blocks[self.index]
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Maps the block for writing.
    pub fn map_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.pool.blocks[self.index]
            .write()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Number of references currently held on this block, this one included.
    pub fn ref_count(&self) -> u32 {
        lock(&self.pool.state).ref_counts[self.index]
    }
}

impl Clone for PooledBuffer {
    fn clone(&self) -> Self {
        self.pool.add_ref(self.index);
        Self {
            index: self.index,
            pool: Arc::clone(&self.pool),
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("index", &self.index)
            .field("bus_address", &format_args!("{:#x}", self.bus_address()))
            .finish()
    }
}

/// A fixed-capacity pool of equally sized blocks.
///
/// The pool is cheap to clone; all clones refer to the same blocks.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a new pool.
    ///
    /// # Arguments
    ///
    /// * `capacity` - number of blocks in the pool.
    /// * `block_size` - size in bytes of every block.
    /// * `bus_base` - bus address of the first block, as reported by the memory allocator.
    pub fn new(capacity: usize, block_size: usize, bus_base: u64) -> Self {
        let capacity = capacity.max(1);
        let blocks = (0..capacity)
            .map(|_| RwLock::new(vec![0u8; block_size].into_boxed_slice()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    ref_counts: vec![0; capacity],
                    free: (0..capacity).collect(),
                    closed: false,
                    peak_in_use: 0,
                }),
                available: Condvar::new(),
                blocks,
                block_size,
                bus_base,
            }),
        }
    }

    /// Gets a free block, waiting for one to be released if the pool is exhausted. Fails only
    /// once the pool is closed.
    pub fn acquire(&self) -> PoolResult<PooledBuffer> {
        let mut state = lock(&self.inner.state);
        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(buffer) = self.inner.take_free(&mut state) {
                return Ok(buffer);
            }
            state = wait(&self.inner.available, state);
        }
    }

    /// Gets a free block without waiting.
    pub fn try_acquire(&self) -> PoolResult<PooledBuffer> {
        let mut state = lock(&self.inner.state);
        if state.closed {
            return Err(PoolError::Closed);
        }
        self.inner
            .take_free(&mut state)
            .ok_or(PoolError::Exhausted)
    }

    /// Takes an additional reference on `buffer`.
    pub fn add_ref(&self, buffer: &PooledBuffer) -> PooledBuffer {
        buffer.clone()
    }

    /// Releases one reference on `buffer`.
    pub fn release(&self, buffer: PooledBuffer) {
        drop(buffer)
    }

    /// Closes the pool. Threads waiting in [`BufferPool::acquire`] are woken up and fail.
    /// Outstanding buffers stay valid until released.
    pub fn close(&self) {
        lock(&self.inner.state).closed = true;
        self.inner.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    pub fn capacity(&self) -> usize {
        self.inner.blocks.len()
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    pub fn num_free(&self) -> usize {
        lock(&self.inner.state).free.len()
    }

    pub fn num_in_use(&self) -> usize {
        lock(&self.inner.state).in_use()
    }

    /// Highest number of blocks that were in use at the same time.
    pub fn peak_in_use(&self) -> usize {
        lock(&self.inner.state).peak_in_use
    }
}

/// Layout of a QP-delta block: `num_ctbs` signed bytes holding the integer deltas computed by the
/// look-ahead, followed by `num_ctbs` little-endian `i16` fixed-point deltas read by the hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QpDeltaLayout {
    pub num_ctbs: usize,
}

impl QpDeltaLayout {
    pub fn new(num_ctbs: usize) -> Self {
        Self { num_ctbs }
    }

    pub fn block_size(&self) -> usize {
        self.num_ctbs * 3
    }

    /// Writes the look-ahead deltas. CTBs missing from `deltas` get no delta.
    pub fn write_lookahead(&self, block: &mut [u8], deltas: &[i8]) {
        let n = self.num_ctbs.min(deltas.len());
        let (head, tail) = block[..self.num_ctbs].split_at_mut(n);
        for (dst, src) in head.iter_mut().zip(deltas) {
            *dst = *src as u8;
        }
        tail.fill(0);
    }

    pub fn read_lookahead(&self, block: &[u8]) -> Vec<i8> {
        block[..self.num_ctbs].iter().map(|b| *b as i8).collect()
    }

    /// Writes the hardware deltas. CTBs missing from `deltas` get no delta and extra deltas are
    /// ignored.
    pub fn write_hw(&self, block: &mut [u8], deltas: &[i16]) {
        let n = self.num_ctbs.min(deltas.len());
        let region = &mut block[self.num_ctbs..self.num_ctbs * 3];
        let (head, tail) = region.split_at_mut(n * 2);
        LittleEndian::write_i16_into(&deltas[..n], head);
        tail.fill(0);
    }

    pub fn read_hw(&self, block: &[u8]) -> Vec<i16> {
        let mut deltas = vec![0i16; self.num_ctbs];
        LittleEndian::read_i16_into(&block[self.num_ctbs..self.num_ctbs * 3], &mut deltas);
        deltas
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn acquire_until_exhausted() {
        let pool = BufferPool::new(2, 16, 0x1000_0000);

        let a = pool.acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert_ne!(a.index(), b.index());
        assert_ne!(a.bus_address(), b.bus_address());
        assert_eq!(pool.try_acquire().unwrap_err(), PoolError::Exhausted);

        pool.release(a);
        assert_eq!(pool.num_free(), 1);
        let c = pool.try_acquire().unwrap();
        assert_eq!(pool.num_in_use(), 2);
        drop((b, c));
        assert_eq!(pool.num_free(), 2);
        assert_eq!(pool.peak_in_use(), 2);
    }

    #[test]
    fn block_returns_on_last_release() {
        let pool = BufferPool::new(1, 8, 0);

        let first = pool.acquire().unwrap();
        let second = pool.add_ref(&first);
        assert_eq!(first.ref_count(), 2);

        drop(first);
        assert_eq!(second.ref_count(), 1);
        assert_eq!(pool.try_acquire().unwrap_err(), PoolError::Exhausted);

        drop(second);
        assert_eq!(pool.num_free(), 1);
    }

    #[test]
    fn acquire_waits_for_release() {
        let pool = BufferPool::new(1, 8, 0);
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|b| b.index()))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(held);

        assert_eq!(waiter.join().unwrap(), Ok(0));
    }

    #[test]
    fn close_wakes_waiters() {
        let pool = BufferPool::new(1, 8, 0);
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|b| b.index()))
        };

        thread::sleep(Duration::from_millis(20));
        pool.close();
        assert_eq!(waiter.join().unwrap(), Err(PoolError::Closed));

        // Outstanding buffers remain usable after closing.
        held.map_mut()[0] = 42;
        assert_eq!(held.map()[0], 42);
    }

    #[test]
    fn concurrent_holders_never_share_a_block() {
        const CAPACITY: usize = 3;
        const THREADS: usize = 6;
        const ITERATIONS: usize = 200;

        let pool = BufferPool::new(CAPACITY, 4, 0);
        let owned = Arc::new((0..CAPACITY).map(|_| AtomicBool::new(false)).collect::<Vec<_>>());

        let workers = (0..THREADS)
            .map(|t| {
                let pool = pool.clone();
                let owned = Arc::clone(&owned);
                thread::spawn(move || {
                    for i in 0..ITERATIONS {
                        let buffer = pool.acquire().unwrap();
                        let was_owned = owned[buffer.index()].swap(true, Ordering::SeqCst);
                        assert!(!was_owned, "block handed out twice");

                        buffer.map_mut()[0] = t as u8;
                        if i % 3 == 0 {
                            let extra = buffer.clone();
                            assert_eq!(extra.ref_count(), 2);
                            thread::yield_now();
                            drop(extra);
                        }
                        assert_eq!(buffer.map()[0], t as u8);
                        assert_eq!(buffer.ref_count(), 1);

                        owned[buffer.index()].store(false, Ordering::SeqCst);
                        drop(buffer);
                    }
                })
            })
            .collect::<Vec<_>>();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(pool.num_free(), CAPACITY);
        assert!(pool.peak_in_use() <= CAPACITY);
    }

    #[test]
    fn qp_delta_layout() {
        let layout = QpDeltaLayout::new(4);
        let mut block = vec![0u8; layout.block_size()];

        layout.write_lookahead(&mut block, &[-3, 0, 2, 7]);
        layout.write_hw(&mut block, &[-48, 0, 32, -1]);

        assert_eq!(layout.read_lookahead(&block), vec![-3, 0, 2, 7]);
        assert_eq!(layout.read_hw(&block), vec![-48, 0, 32, -1]);
        assert_eq!(&block[4..6], &[0xd0, 0xff]);
    }

    #[test]
    fn short_deltas_clear_the_remaining_ctbs() {
        let layout = QpDeltaLayout::new(4);
        let mut block = vec![0x55u8; layout.block_size()];

        layout.write_lookahead(&mut block, &[-3]);
        layout.write_hw(&mut block, &[-48, 16]);
        assert_eq!(layout.read_lookahead(&block), vec![-3, 0, 0, 0]);
        assert_eq!(layout.read_hw(&block), vec![-48, 16, 0, 0]);

        layout.write_hw(&mut block, &[1, 2, 3, 4, 5]);
        assert_eq!(layout.read_hw(&block), vec![1, 2, 3, 4]);
    }
}
