// src/core/connection/streams.rs

//! The per-connection stream-id pool: a bounded free-list pairing every
//! in-flight request with exactly one id.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Allocates multiplexing stream ids. The free-list is guarded by a mutex
/// held only for a push or a pop; the outstanding counter is what the rest
/// of the driver observes.
#[derive(Debug)]
pub struct StreamIdPool {
    free: Mutex<Vec<i16>>,
    capacity: usize,
    outstanding: AtomicUsize,
}

impl StreamIdPool {
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity <= i16::MAX as usize + 1);
        // Lower ids first, matching the order servers log them in.
        let free: Vec<i16> = (0..capacity).rev().map(|id| id as i16).collect();
        Self {
            free: Mutex::new(free),
            capacity,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Claims an id, or `None` when the connection is saturated.
    pub fn borrow(&self) -> Option<i16> {
        let id = self.free.lock().pop()?;
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Some(id)
    }

    /// Returns an id once its response arrived, its request failed to send,
    /// or the connection died.
    pub fn release(&self, id: i16) {
        let mut free = self.free.lock();
        debug_assert!(!free.contains(&id));
        free.push(id);
        drop(free);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn has_free(&self) -> bool {
        self.outstanding() < self.capacity
    }
}
