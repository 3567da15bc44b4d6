// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility types used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

use std::collections::VecDeque;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::BlockingMode;

/// Locks `mutex`, recovering the guard if another thread panicked while holding it. None of the
/// structures guarded in this crate can be left logically inconsistent by a panic between two
/// statements, so the data is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Waits on `condvar`, with the same poisoning policy as [`lock`].
pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(|e| e.into_inner())
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A FIFO queue shared between threads, bounded to `capacity` items.
///
/// The queue owns its mutex and condition variables: producers wait while it is full, consumers
/// wait while it is empty. Closing the queue wakes everybody; pushes then fail while pops keep
/// returning the remaining items until the queue is empty.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Pushes `item` at the back of the queue. In blocking mode, waits for a free slot; in
    /// non-blocking mode a full queue hands the item back. A closed queue always hands the item
    /// back.
    pub fn push(&self, item: T, mode: BlockingMode) -> Result<(), T> {
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return Err(item);
            }
            if state.items.len() < self.capacity {
                break;
            }
            if mode == BlockingMode::NonBlocking {
                return Err(item);
            }
            state = wait(&self.not_full, state);
        }

        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();

        Ok(())
    }

    /// Pops the oldest item. In blocking mode, waits until an item is available or the queue is
    /// closed and empty, in which case `None` is returned.
    pub fn pop(&self, mode: BlockingMode) -> Option<T> {
        let mut state = lock(&self.state);
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed || mode == BlockingMode::NonBlocking {
                return None;
            }
            state = wait(&self.not_empty, state);
        }
    }

    /// Blocks until a push would not have to wait. Returns `false` if the queue got closed.
    pub fn wait_for_room(&self) -> bool {
        let mut state = lock(&self.state);
        while !state.closed && state.items.len() >= self.capacity {
            state = wait(&self.not_full, state);
        }
        !state.closed
    }

    /// Removes and returns every queued item.
    pub fn drain(&self) -> Vec<T> {
        let items = lock(&self.state).items.drain(..).collect();
        self.not_full.notify_all();
        items
    }

    /// Closes the queue and wakes up all waiters.
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
