//! Virtual-to-physical unit translation.
//!
//! Storage is written as a sequence of flushes, one per tick with a due
//! layer, each holding the due layers' tile buffers coarsest first. A layer's
//! units are therefore scattered: to find unit `n` of layer `k`, count every
//! byte any layer flushed before the flush that carries it, then add its
//! position inside that flush.
//!
//! ```text
//! U = 4, L = 3 (periods 4, 2, 1)
//! tick:     1    2        3    4
//! flush:   [2]  [2][1]   [2]  [2][1][0]
//! unit:     0    1  2     3    4  5  6
//! ```

use crate::layer::LayerTable;

/// Physical unit index (byte address / `U`) of unit `unit_offset` of `layer`.
///
/// `layer` is clamped to the coarsest layer and `unit_offset` to the layer's
/// last unit. Units a final flush wrote ahead of their period are not
/// reachable through this mapping.
pub fn unit_address(table: &LayerTable, layer: u32, unit_offset: u32) -> u32 {
    let Some(target) = table.clamped(layer) else {
        return 0;
    };
    let unit = u64::from(table.unit_size());
    let offset = u64::from(unit_offset.min(target.layer_buffer_units.saturating_sub(1)));
    let period = u64::from(target.period);
    let units_per_flush = u64::from(target.tile_buffer_units);

    // Safety: every value is bounded by the u32 recording size checked in
    // PyramidConfig::validate(); divisors are non-zero layer geometry.
    #[allow(clippy::arithmetic_side_effects)]
    let bytes = {
        // `position` is the unit's slot in the flush after tick `ticks`,
        // where 0 means the last slot of the flush on tick `ticks` itself.
        let index = offset + 1;
        let ticks = period * index / units_per_flush;
        let position = period * index % units_per_flush;

        let mut bytes: u64 = table
            .layers()
            .iter()
            .map(|l| ticks / u64::from(l.period) * u64::from(l.tile_buffer_size))
            .sum();

        if position == 0 {
            // Last unit of the flush on tick `ticks`: step back over that
            // tick's flushes from the target down to layer 0.
            for l in table.layers().iter().take(target.index as usize + 1) {
                if ticks % u64::from(l.period) == 0 {
                    bytes -= u64::from(l.tile_buffer_size);
                }
            }
            bytes + (units_per_flush - 1) * unit
        } else {
            // Inside the flush on tick `ticks + 1`: skip the coarser layers
            // written ahead of the target on that tick.
            for l in table.layers().iter().skip(target.index as usize + 1) {
                if (ticks + 1) % u64::from(l.period) == 0 {
                    bytes += u64::from(l.tile_buffer_size);
                }
            }
            bytes + (position - 1) * unit
        }
    };

    u32::try_from(bytes.checked_div(unit).unwrap_or(0)).unwrap_or(u32::MAX)
}

/// Storage byte address of unit `unit_offset` of `layer` (clamped as in
/// [`unit_address`]).
pub fn byte_address(table: &LayerTable, layer: u32, unit_offset: u32) -> u32 {
    unit_address(table, layer, unit_offset).saturating_mul(table.unit_size())
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation
)]
mod tests {
    use super::*;
    use crate::config::PyramidConfig;

    fn table(unit_size: u32, layer_count: u32, tiles_per_layer: u32) -> LayerTable {
        LayerTable::new(&PyramidConfig {
            unit_size,
            layer_count,
            tiles_per_layer,
            event_queue_depth: 1,
            write_enabled: true,
        })
        .unwrap()
    }

    #[test]
    fn small_pyramid_matches_the_drawn_layout() {
        // U = 4, L = 3, T = 8: periods 4, 2, 1.
        let t = table(4, 3, 8);
        assert_eq!(unit_address(&t, 2, 0), 0);
        assert_eq!(unit_address(&t, 2, 1), 1);
        assert_eq!(unit_address(&t, 1, 0), 2);
        assert_eq!(unit_address(&t, 2, 2), 3);
        assert_eq!(unit_address(&t, 2, 3), 4);
        assert_eq!(unit_address(&t, 1, 1), 5);
        assert_eq!(unit_address(&t, 0, 0), 6);
    }

    #[test]
    fn multi_unit_flushes_are_contiguous() {
        // U = 16, L = 6: layer 5 tile is 32 bytes, two units per flush.
        let t = table(16, 6, 32);
        let a = unit_address(&t, 5, 0);
        let b = unit_address(&t, 5, 1);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        // Layer 4 follows layer 5 inside the first flush.
        assert_eq!(unit_address(&t, 4, 0), 2);
        // Second flush starts after the three units of the first.
        assert_eq!(unit_address(&t, 5, 2), 3);
    }

    #[test]
    fn out_of_range_inputs_are_clamped() {
        let t = table(16, 3, 16);
        let last = t.layer(2).unwrap().layer_buffer_units - 1;
        assert_eq!(unit_address(&t, 2, 10_000), unit_address(&t, 2, last));
        assert_eq!(unit_address(&t, 9, 0), unit_address(&t, 2, 0));
    }

    #[test]
    fn byte_address_scales_by_unit() {
        let t = table(4, 3, 8);
        assert_eq!(byte_address(&t, 0, 0), 6 * 4);
        assert_eq!(byte_address(&t, 0, 1), 13 * 4);
    }

    #[test]
    fn every_unit_of_a_full_recording_is_distinct_and_in_bounds() {
        let t = table(16, 5, 64);
        let total = (t.recording_size() / 16) as u32;
        let mut seen = std::vec![false; total as usize];
        for layer in t.layers() {
            for offset in 0..layer.layer_buffer_units {
                let unit = unit_address(&t, layer.index, offset);
                assert!(unit < total, "layer {} unit {offset} -> {unit}", layer.index);
                assert!(!seen[unit as usize], "layer {} unit {offset} collides", layer.index);
                seen[unit as usize] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }
}
