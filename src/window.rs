//! Fixed-capacity sliding windows for adaptive control.

use std::collections::VecDeque;

/// A FIFO window that evicts its oldest entry once capacity is reached.
///
/// The step controllers keep three of these: recent step outcomes (capacity
/// 5), recent scores for learning-rate annealing (capacity 20), and recent
/// scores for plateau detection (capacity 200).
#[derive(Debug, Clone)]
pub struct BoundedWindow<T> {
    buf: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedWindow<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "window capacity must be positive");
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.buf.len() == self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() == self.capacity
    }

    /// Oldest retained entry.
    pub fn front(&self) -> Option<&T> {
        self.buf.front()
    }

    /// Most recent entry.
    pub fn back(&self) -> Option<&T> {
        self.buf.back()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl BoundedWindow<bool> {
    /// Fraction of `true` entries among those retained.
    pub fn success_ratio(&self) -> f32 {
        if self.buf.is_empty() {
            return 0.0;
        }
        let hits = self.buf.iter().filter(|&&v| v).count();
        hits as f32 / self.buf.len() as f32
    }
}
