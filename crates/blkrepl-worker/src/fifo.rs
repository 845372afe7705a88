//! Fixed-size ring of per-tick corrections used by the resync rate controller.

/// Circular buffer of planned corrections with a running total.
///
/// `total()` always equals the sum of the slots; every mutator keeps the
/// two in step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FifoBuffer {
    values: Vec<i64>,
    head: usize,
    total: i64,
}

impl FifoBuffer {
    /// Ring of `size` zero slots.
    pub fn new(size: usize) -> Self {
        Self {
            values: vec![0; size],
            head: 0,
            total: 0,
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True for a zero-length ring.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Running total of all slots.
    pub fn total(&self) -> i64 {
        self.total
    }

    /// Sum recomputed from the slots.
    pub fn sum(&self) -> i64 {
        self.values.iter().sum()
    }

    /// Set every slot to `value`.
    pub fn set(&mut self, value: i64) {
        self.values.iter_mut().for_each(|v| *v = value);
        self.total = value * self.values.len() as i64;
    }

    /// Add `value` to every slot.
    pub fn add_val(&mut self, value: i64) {
        self.values.iter_mut().for_each(|v| *v += value);
        self.total += value * self.values.len() as i64;
    }

    /// Replace the head slot with `value`, advance the head, and return
    /// what the slot held. A zero-length ring returns `value` unchanged.
    pub fn push(&mut self, value: i64) -> i64 {
        if self.values.is_empty() {
            return value;
        }
        let old = std::mem::replace(&mut self.values[self.head], value);
        self.head += 1;
        if self.head >= self.values.len() {
            self.head = 0;
        }
        self.total += value - old;
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_returns_oldest() {
        let mut f = FifoBuffer::new(3);
        f.add_val(5);
        assert_eq!(f.total(), 15);
        assert_eq!(f.push(0), 5);
        assert_eq!(f.push(1), 5);
        assert_eq!(f.push(2), 5);
        assert_eq!(f.push(3), 0);
        assert_eq!(f.total(), 6);
        assert_eq!(f.total(), f.sum());
    }

    #[test]
    fn test_set_resets_total() {
        let mut f = FifoBuffer::new(4);
        f.add_val(-3);
        f.push(9);
        f.set(0);
        assert_eq!(f.total(), 0);
        assert_eq!(f.sum(), 0);
    }

    #[test]
    fn test_empty_ring() {
        let mut f = FifoBuffer::new(0);
        assert!(f.is_empty());
        f.add_val(7);
        assert_eq!(f.total(), 0);
        assert_eq!(f.push(4), 4);
        assert_eq!(f.total(), 0);
    }
}
