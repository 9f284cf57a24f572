use tracing::warn;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const MAX_BATCH_SIZE: usize = 5000;

/// Records per flush, always within `1..=MAX_BATCH_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSize(usize);

impl BatchSize {
    pub const MAX: BatchSize = BatchSize(MAX_BATCH_SIZE);

    pub fn new(size: usize) -> Option<Self> {
        (1..=MAX_BATCH_SIZE).contains(&size).then_some(Self(size))
    }

    /// Pulls an out-of-range request back into bounds.
    pub fn clamped(size: usize) -> Self {
        let clamped = size.clamp(1, MAX_BATCH_SIZE);
        if clamped != size {
            warn!(requested = size, using = clamped, "batch size out of range");
        }
        Self(clamped)
    }

    pub fn get(&self) -> usize {
        self.0
    }
}

impl Default for BatchSize {
    fn default() -> Self {
        Self(DEFAULT_BATCH_SIZE)
    }
}

/// Groups items into batches of a fixed size.
#[derive(Debug)]
pub struct Batcher<T> {
    capacity: usize,
    buffer: Vec<T>,
}

impl<T> Batcher<T> {
    pub fn new(size: BatchSize) -> Self {
        Self {
            capacity: size.get(),
            buffer: Vec::with_capacity(size.get()),
        }
    }

    /// Buffers `item`, handing back a full batch once the buffer reaches capacity.
    pub fn add(&mut self, item: T) -> Option<Vec<T>> {
        self.buffer.push(item);
        if self.buffer.len() >= self.capacity {
            Some(std::mem::replace(
                &mut self.buffer,
                Vec::with_capacity(self.capacity),
            ))
        } else {
            None
        }
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Final partial batch, if any. Consumes the batcher.
    pub fn drain(self) -> Option<Vec<T>> {
        (!self.buffer.is_empty()).then_some(self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushes_when_full_and_drains_remainder() {
        let mut batcher = Batcher::new(BatchSize::new(3).unwrap());
        assert_eq!(batcher.add(1), None);
        assert_eq!(batcher.add(2), None);
        assert_eq!(batcher.add(3), Some(vec![1, 2, 3]));
        assert_eq!(batcher.pending(), 0);
        assert_eq!(batcher.add(4), None);
        assert_eq!(batcher.drain(), Some(vec![4]));
    }

    #[test]
    fn empty_drain_yields_nothing() {
        let mut batcher = Batcher::new(BatchSize::new(2).unwrap());
        assert_eq!(batcher.add("a"), None);
        assert_eq!(batcher.add("b"), Some(vec!["a", "b"]));
        assert_eq!(batcher.drain(), None);
    }

    #[test]
    fn batch_size_bounds() {
        assert_eq!(BatchSize::new(0), None);
        assert_eq!(BatchSize::new(5001), None);
        assert_eq!(BatchSize::new(1).map(|b| b.get()), Some(1));
        assert_eq!(BatchSize::clamped(0).get(), 1);
        assert_eq!(BatchSize::clamped(10_000), BatchSize::MAX);
        assert_eq!(BatchSize::default().get(), 1000);
    }
}
