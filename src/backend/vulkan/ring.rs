//! Per-frame uniform sub-allocation.
//!
//! Each uniform update takes a fresh aligned slice of one host-visible buffer
//! and the slice offset becomes the dynamic offset of the draw. The cursor
//! rewinds when a new frame begins, after the previous frame's fence.

/// Offset of a uniform update inside the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RingAllocation {
    pub offset: u64,
    pub size: u64,
}

/// Bump allocator over a fixed-capacity buffer
#[derive(Debug)]
pub(crate) struct RingCursor {
    capacity: u64,
    alignment: u64,
    offset: u64,
    exhausted: bool,
}

impl RingCursor {
    pub const DEFAULT_CAPACITY: u64 = 4 * 1024 * 1024;

    /// `alignment` is rounded up to a power of two
    pub fn new(capacity: u64, alignment: u64) -> Self {
        Self {
            capacity,
            alignment: alignment.max(1).next_power_of_two(),
            offset: 0,
            exhausted: false,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.offset
    }

    /// Take `size` bytes, or `None` when the frame ran out of space.
    ///
    /// The first failure of a frame is logged.
    pub fn allocate(&mut self, size: u64) -> Option<RingAllocation> {
        let offset = align_up(self.offset, self.alignment);
        if size == 0 || offset + size > self.capacity {
            if !self.exhausted {
                log::error!(
                    "Uniform ring exhausted: {} of {} bytes used, {} requested",
                    self.offset,
                    self.capacity,
                    size
                );
                self.exhausted = true;
            }
            return None;
        }
        self.offset = offset + size;
        Some(RingAllocation { offset, size })
    }

    pub fn reset(&mut self) {
        self.offset = 0;
        self.exhausted = false;
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_allocations_are_aligned() {
        let mut ring = RingCursor::new(4096, 256);
        let a = ring.allocate(144).unwrap();
        let b = ring.allocate(272).unwrap();
        let c = ring.allocate(272).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 256);
        assert_eq!(c.offset, 768);
        assert_eq!(ring.used(), 1040);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(3, 4)]
    #[case(64, 64)]
    #[case(100, 128)]
    fn test_alignment_is_power_of_two(#[case] requested: u64, #[case] expected: u64) {
        let mut ring = RingCursor::new(1024, requested);
        ring.allocate(1).unwrap();
        assert_eq!(ring.allocate(1).unwrap().offset, expected);
    }

    #[test]
    fn test_exhaustion_and_reset() {
        let mut ring = RingCursor::new(512, 256);
        assert!(ring.allocate(256).is_some());
        assert!(ring.allocate(256).is_some());
        assert!(ring.allocate(1).is_none());
        assert!(ring.allocate(1).is_none());

        ring.reset();
        assert_eq!(ring.used(), 0);
        assert_eq!(ring.allocate(16).unwrap().offset, 0);
    }

    #[test]
    fn test_zero_sized_update_is_rejected() {
        let mut ring = RingCursor::new(512, 256);
        assert!(ring.allocate(0).is_none());
    }
}
