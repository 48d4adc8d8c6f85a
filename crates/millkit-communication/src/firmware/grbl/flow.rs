//! Character-counting flow control
//!
//! Tracks every frame sent but not yet acknowledged, in send order. GRBL
//! replies strictly FIFO, so each `ok`/`error` releases the oldest frame.

use millkit_core::ProtocolError;
use std::collections::VecDeque;

/// In-flight frame accounting against a fixed receive buffer
#[derive(Debug, Clone)]
pub struct CharacterCounter<T> {
    capacity: usize,
    in_flight: usize,
    frames: VecDeque<(T, usize)>,
}

impl<T> CharacterCounter<T> {
    /// Create a counter for a buffer of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_flight: 0,
            frames: VecDeque::new(),
        }
    }

    /// Buffer size
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes sent but not acknowledged
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Bytes still free
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_flight)
    }

    /// Number of unacknowledged frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// No frames in flight
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Check if a frame of `len` bytes fits now
    pub fn has_room(&self, len: usize) -> bool {
        self.in_flight + len <= self.capacity
    }

    /// Record a sent frame
    pub fn push(&mut self, tag: T, len: usize) -> Result<(), ProtocolError> {
        if !self.has_room(len) {
            return Err(ProtocolError::BufferFull {
                needed: len,
                available: self.available(),
            });
        }
        self.in_flight += len;
        self.frames.push_back((tag, len));
        Ok(())
    }

    /// Release the oldest frame
    pub fn pop(&mut self) -> Option<(T, usize)> {
        let (tag, len) = self.frames.pop_front()?;
        self.in_flight -= len;
        Some((tag, len))
    }

    /// Forget every frame
    pub fn clear(&mut self) {
        self.frames.clear();
        self.in_flight = 0;
    }
}
