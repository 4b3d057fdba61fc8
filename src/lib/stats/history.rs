use ringbuffer::{AllocRingBuffer, RingBuffer};

use super::types::HistoryPoint;

/// Fixed-capacity history in insertion order, oldest evicted first.
pub struct HistoryRing {
    points: AllocRingBuffer<HistoryPoint>,
    truncated: bool,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: AllocRingBuffer::new(capacity.max(1)),
            truncated: false,
        }
    }

    /// Rebuilds a ring from persisted points, keeping the newest ones if they do not fit.
    pub fn from_points(capacity: usize, points: Vec<HistoryPoint>, truncated: bool) -> Self {
        let mut ring = Self::new(capacity);
        for point in points {
            ring.push(point);
        }
        ring.truncated |= truncated;
        ring
    }

    pub fn push(&mut self, point: HistoryPoint) {
        if self.points.is_full() {
            self.truncated = true;
        }
        self.points.push(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.points.capacity()
    }

    /// Whether points were ever evicted since the last clear.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn oldest(&self) -> Option<&HistoryPoint> {
        self.points.front()
    }

    pub fn newest(&self) -> Option<&HistoryPoint> {
        self.points.back()
    }

    /// Whether every point at or after `start` is still held in memory.
    pub fn covers(&self, start: f64) -> bool {
        if !self.truncated {
            return true;
        }
        self.oldest().is_some_and(|oldest| oldest.ts <= start)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryPoint> {
        self.points.iter()
    }

    pub fn since(&self, start: f64) -> Vec<HistoryPoint> {
        self.points
            .iter()
            .filter(|point| point.ts >= start)
            .copied()
            .collect()
    }

    pub fn to_vec(&self) -> Vec<HistoryPoint> {
        self.points.to_vec()
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.truncated = false;
    }
}

impl std::fmt::Debug for HistoryRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryRing")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("truncated", &self.truncated)
            .finish()
    }
}
