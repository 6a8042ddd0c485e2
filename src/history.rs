//! Fixed-capacity observation history.
//!
//! After [`HistoryBuffer::reset`] the buffer is empty. The first insertion
//! fills every slot with that observation, so a window is always exactly
//! `capacity` observations long. Later insertions overwrite the oldest slot.

use std::collections::VecDeque;

/// Ring of the last `capacity` observations, oldest first.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    capacity: usize,
    width: usize,
    slots: VecDeque<Vec<f32>>,
}

impl HistoryBuffer {
    /// Create an empty buffer of `capacity` observations of `width` elements.
    ///
    /// `capacity` must be at least 1.
    pub fn new(capacity: usize, width: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            width,
            slots: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Whether nothing has been inserted since the last reset.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop all observations.
    pub fn reset(&mut self) {
        self.slots.clear();
    }

    /// Append an observation.
    ///
    /// # Panics
    ///
    /// Panics if `obs.len()` differs from the buffer width.
    pub fn insert(&mut self, obs: &[f32]) {
        assert_eq!(obs.len(), self.width, "observation width mismatch");
        if self.slots.is_empty() {
            self.slots.extend(std::iter::repeat(obs.to_vec()).take(self.capacity));
            return;
        }
        if let Some(mut oldest) = self.slots.pop_front() {
            oldest.copy_from_slice(obs);
            self.slots.push_back(oldest);
        }
    }

    /// The observations oldest → newest, or `None` before the first insertion.
    pub fn window(&self) -> Option<impl Iterator<Item = &[f32]>> {
        if self.slots.is_empty() {
            return None;
        }
        Some(self.slots.iter().map(Vec::as_slice))
    }

    /// The window flattened into one `capacity * width` vector, oldest first.
    pub fn flattened(&self) -> Option<Vec<f32>> {
        let window = self.window()?;
        let mut out = Vec::with_capacity(self.capacity * self.width);
        for obs in window {
            out.extend_from_slice(obs);
        }
        Some(out)
    }
}
