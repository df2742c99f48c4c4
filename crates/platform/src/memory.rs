//! Aligned buffer allocation.
//!
//! The tile engine never touches a global heap. Every buffer it needs (one
//! scratch region per pyramid layer, one staging buffer per flush) comes from
//! an [`AlignedAllocator`] handed to it at construction. On hardware this is
//! a pool carved out of DMA-capable SRAM or SDRAM; on the host it is
//! [`HeapAllocator`].
//!
//! Allocators take `&self` so one instance can be shared between the task
//! producing flush buffers and the task writing (and then freeing) them.

/// Error returned when an allocation cannot be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AllocError {
    /// Bytes requested.
    pub requested: usize,
    /// Bytes still available in the pool when the request was made.
    pub available: usize,
}

impl core::fmt::Display for AllocError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "allocation of {} bytes failed ({} available)",
            self.requested, self.available
        )
    }
}

/// Pool of aligned byte buffers with a fixed budget.
pub trait AlignedAllocator {
    /// Owned buffer handed out by this allocator.
    type Buffer: AsRef<[u8]> + AsMut<[u8]>;

    /// Allocate `size` zeroed bytes whose start address is a multiple of
    /// `alignment` (a power of two; 0 is treated as 1).
    fn allocate(&self, size: usize, alignment: usize) -> Result<Self::Buffer, AllocError>;

    /// Return a buffer to the pool.
    fn free(&self, buffer: Self::Buffer);

    /// Bytes that can still be allocated.
    fn available(&self) -> usize;
}

impl<T: AlignedAllocator + ?Sized> AlignedAllocator for &T {
    type Buffer = T::Buffer;

    fn allocate(&self, size: usize, alignment: usize) -> Result<Self::Buffer, AllocError> {
        (**self).allocate(size, alignment)
    }

    fn free(&self, buffer: Self::Buffer) {
        (**self).free(buffer);
    }

    fn available(&self) -> usize {
        (**self).available()
    }
}

// ---------------------------------------------------------------------------
// Host allocator
// ---------------------------------------------------------------------------

#[cfg(any(test, feature = "std"))]
pub use heap::{HeapAllocator, HeapBuffer};

#[cfg(any(test, feature = "std"))]
mod heap {
    extern crate std;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::vec;
    use std::vec::Vec;

    use super::{AlignedAllocator, AllocError};

    /// Aligned buffer backed by an over-sized `Vec<u8>`.
    ///
    /// The aligned window starts `start` bytes into `raw`. Moving the buffer
    /// moves only the `Vec` header, so the window keeps its alignment.
    #[derive(Debug)]
    pub struct HeapBuffer {
        raw: Vec<u8>,
        start: usize,
        len: usize,
    }

    impl AsRef<[u8]> for HeapBuffer {
        fn as_ref(&self) -> &[u8] {
            let end = self.start.saturating_add(self.len);
            self.raw.get(self.start..end).unwrap_or_default()
        }
    }

    impl AsMut<[u8]> for HeapBuffer {
        fn as_mut(&mut self) -> &mut [u8] {
            let end = self.start.saturating_add(self.len);
            self.raw.get_mut(self.start..end).unwrap_or_default()
        }
    }

    /// Global-heap allocator with a byte budget.
    ///
    /// The budget is accounted on the requested size only; the alignment
    /// padding is not charged. Buffers must come back through
    /// [`AlignedAllocator::free`] for their bytes to be credited again.
    #[derive(Debug)]
    pub struct HeapAllocator {
        budget: usize,
        used: AtomicUsize,
        peak: AtomicUsize,
    }

    impl HeapAllocator {
        /// Create an allocator that hands out at most `budget` bytes at once.
        #[must_use]
        pub fn new(budget: usize) -> Self {
            Self {
                budget,
                used: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        /// Bytes currently allocated.
        pub fn used(&self) -> usize {
            self.used.load(Ordering::Acquire)
        }

        /// Highest value [`used`](Self::used) has reached.
        pub fn peak(&self) -> usize {
            self.peak.load(Ordering::Acquire)
        }

        /// Total budget.
        pub fn budget(&self) -> usize {
            self.budget
        }
    }

    impl AlignedAllocator for HeapAllocator {
        type Buffer = HeapBuffer;

        fn allocate(&self, size: usize, alignment: usize) -> Result<HeapBuffer, AllocError> {
            let alignment = alignment.max(1);
            let fail = || AllocError {
                requested: size,
                available: self.available(),
            };
            if !alignment.is_power_of_two() {
                return Err(fail());
            }

            let budget = self.budget;
            let reserved = self
                .used
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                    used.checked_add(size).filter(|&total| total <= budget)
                })
                .map_err(|_| fail())?;
            self.peak
                .fetch_max(reserved.saturating_add(size), Ordering::AcqRel);

            let raw = vec![0u8; size.saturating_add(alignment)];
            let start = raw.as_ptr().align_offset(alignment);
            if start >= alignment {
                self.used.fetch_sub(size, Ordering::AcqRel);
                return Err(fail());
            }
            Ok(HeapBuffer {
                raw,
                start,
                len: size,
            })
        }

        fn free(&self, buffer: HeapBuffer) {
            let len = buffer.len;
            drop(buffer);
            // Saturate so a foreign buffer cannot wrap the counter.
            let _ = self
                .used
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                    Some(used.saturating_sub(len))
                });
        }

        fn available(&self) -> usize {
            self.budget.saturating_sub(self.used())
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::arithmetic_side_effects
)]
mod tests {
    use super::*;

    #[test]
    fn heap_buffers_are_aligned_and_zeroed() {
        let alloc = HeapAllocator::new(64 * 1024);
        for align in [1usize, 4, 32, 512, 4096] {
            let buf = alloc.allocate(2048, align).unwrap();
            assert_eq!(buf.as_ref().len(), 2048);
            assert_eq!(buf.as_ref().as_ptr() as usize % align, 0, "align {align}");
            assert!(buf.as_ref().iter().all(|&b| b == 0));
            alloc.free(buf);
        }
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn heap_allocator_enforces_budget() {
        let alloc = HeapAllocator::new(4096);
        let a = alloc.allocate(3000, 32).unwrap();
        let err = alloc.allocate(2000, 32).unwrap_err();
        assert_eq!(err, AllocError { requested: 2000, available: 1096 });
        alloc.free(a);
        assert_eq!(alloc.available(), 4096);
        assert!(alloc.allocate(4096, 32).is_ok());
    }

    #[test]
    fn heap_allocator_tracks_peak_usage() {
        let alloc = HeapAllocator::new(10_000);
        let a = alloc.allocate(1000, 8).unwrap();
        let b = alloc.allocate(3000, 8).unwrap();
        alloc.free(a);
        alloc.free(b);
        assert_eq!(alloc.used(), 0);
        assert_eq!(alloc.peak(), 4000);
    }

    #[test]
    fn heap_allocator_rejects_non_power_of_two_alignment() {
        let alloc = HeapAllocator::new(4096);
        assert!(alloc.allocate(16, 3).is_err());
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn shared_reference_is_an_allocator() {
        fn take<A: AlignedAllocator>(a: A) -> usize {
            a.available()
        }
        let alloc = HeapAllocator::new(512);
        assert_eq!(take(&alloc), 512);
        assert_eq!(take(&&alloc), 512);
    }

    #[test]
    fn heap_buffer_is_writable() {
        let alloc = HeapAllocator::new(64);
        let mut buf = alloc.allocate(8, 8).unwrap();
        buf.as_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buf.as_ref(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
