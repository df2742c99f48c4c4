//! Property-based tests for unit alignment.
//! Verifies invariants hold for ALL inputs, not just fixed examples.

#![allow(clippy::unwrap_used)]
#![allow(clippy::arithmetic_side_effects)]
#![allow(clippy::cast_possible_truncation)]

use platform::is_unit_aligned;

proptest::proptest! {
    /// Any whole number of units at any unit boundary is aligned.
    #[test]
    fn unit_multiples_are_aligned(exp in 0u32..16, start in 0u32..4096, units in 0usize..64) {
        let unit = 1u32 << exp;
        let address = start.saturating_mul(unit);
        if address / unit == start {
            assert!(is_unit_aligned(address, units * unit as usize, unit));
        }
    }

    /// Shifting the address or the length off a boundary breaks alignment.
    #[test]
    fn off_by_less_than_a_unit_is_rejected(exp in 1u32..16, start in 0u32..1024, skew in 1u32..u32::MAX) {
        let unit = 1u32 << exp;
        let skew = skew % unit;
        if skew != 0 {
            let address = start * unit;
            assert!(!is_unit_aligned(address + skew, unit as usize, unit));
            assert!(!is_unit_aligned(address, (unit + skew) as usize, unit));
        }
    }

    /// Zero and non-power-of-two units never align anything.
    #[test]
    fn bad_units_never_align(unit in 0u32..=u32::MAX, address in 0u32..=u32::MAX) {
        if !unit.is_power_of_two() {
            assert!(!is_unit_aligned(address, 0, unit));
        }
    }
}

#[cfg(feature = "std")]
mod heap {
    use platform::{AlignedAllocator, HeapAllocator};

    proptest::proptest! {
        /// Every buffer starts on the requested alignment and the budget
        /// is credited back in full.
        #[test]
        fn buffers_are_aligned_and_returned(sizes in proptest::collection::vec(1usize..512, 1..16), exp in 0u32..7) {
            let align = 1usize << exp;
            let alloc = HeapAllocator::new(16 * 512);
            let mut buffers = Vec::new();
            for &size in &sizes {
                let mut buf = alloc.allocate(size, align).unwrap();
                assert_eq!(buf.as_mut().len(), size);
                assert_eq!(buf.as_ref().as_ptr() as usize % align, 0);
                buffers.push(buf);
            }
            assert_eq!(alloc.used(), sizes.iter().sum::<usize>());
            for buf in buffers {
                alloc.free(buf);
            }
            assert_eq!(alloc.used(), 0);
        }
    }
}
