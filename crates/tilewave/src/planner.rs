//! Zoom query planning.
//!
//! A display shows `display_width` points of one layer. The layer follows
//! from the zoom factor, and the window is placed so the focus point (at
//! `focus_progress` through the layer) sits `focus_sample_offset` points from
//! the window's left edge. Windows that would run off either end of the
//! layer are shifted back inside it at full width.
//!
//! The window's units are then split wherever the layer's data jumps to a
//! later flush, each piece is translated to its physical address, and
//! pieces that turn out to be adjacent in storage are merged.

use core::ops::Range;

use heapless::Vec;

use crate::error::TileError;
use crate::layer::LayerTable;
use crate::translate::unit_address;

/// Most read requests one plan can carry.
///
/// On a layer whose flushes are a single unit each (layer 0 of the default
/// config) every unit of the window is its own read, so windows there are
/// limited to about this many units.
pub const MAX_READ_REQUESTS: usize = 64;

/// Parameters of a zoom read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomQuery {
    /// Focus position through the layer, `0.0..=1.0` (clamped).
    pub focus_progress: f64,
    /// Bits per point. Must be a power-of-two number of bytes.
    pub point_bit_depth: u32,
    /// Display column that should show the focus point.
    pub focus_sample_offset: u32,
    /// Points the display shows.
    pub display_width: u32,
    /// Decimation factor; selects layer `floor(log2(zoom_factor))`.
    pub zoom_factor: u32,
}

/// One aligned storage read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReadRequest {
    /// Storage byte address.
    pub address: u32,
    /// Bytes to read (a multiple of the unit size).
    pub size: u32,
    /// Physical unit index, `address / U`.
    pub unit: u32,
    /// Where the bytes go in the caller's read buffer.
    pub buffer_offset: u32,
}

/// Reads that together cover a display window, in window order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPlan {
    /// Layer the window was taken from.
    pub layer: u32,
    /// Bytes per point.
    pub point_size: u32,
    /// First point of the window, counted from the start of the layer.
    pub window_start: u32,
    /// Points in the window.
    pub window_len: u32,
    /// Byte offset of the window's first point in the concatenated reads.
    pub first_sample_offset: u32,
    requests: Vec<ReadRequest, MAX_READ_REQUESTS>,
}

impl ReadPlan {
    fn empty(layer: u32, point_size: u32) -> Self {
        Self {
            layer,
            point_size,
            window_start: 0,
            window_len: 0,
            first_sample_offset: 0,
            requests: Vec::new(),
        }
    }

    /// Reads to issue, in order.
    pub fn requests(&self) -> &[ReadRequest] {
        &self.requests
    }

    /// `true` if there is nothing to read.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Size of the read buffer the plan fills.
    pub fn total_bytes(&self) -> usize {
        self.requests.iter().map(|r| r.size as usize).sum()
    }

    /// The window's bytes inside the read buffer.
    pub fn window_bytes(&self) -> Range<usize> {
        let start = self.first_sample_offset as usize;
        let len = (self.window_len as usize).saturating_mul(self.point_size as usize);
        start..start.saturating_add(len)
    }
}

/// Plan the reads for a zoom query.
///
/// A zero display width, or a layer holding fewer bytes than one point,
/// gives an empty plan.
///
/// Fails with [`TileError::PlanOverflow`] when the window crosses more than
/// [`MAX_READ_REQUESTS`] non-adjacent runs of storage. Only fine layers hit
/// this: with the default config, layer 0 stores one 2 KiB unit per flush,
/// so a 16-bit window there must stay under roughly 64 K points. Narrow the
/// window or zoom out and retry.
pub fn plan_zoom_read(table: &LayerTable, query: &ZoomQuery) -> Result<ReadPlan, TileError> {
    let layer = table.layer_for_zoom(query.zoom_factor);
    if query.point_bit_depth % 8 != 0 || query.focus_progress.is_nan() {
        return Err(TileError::InvalidQuery);
    }
    let point_size = query.point_bit_depth / 8;
    if !point_size.is_power_of_two() {
        return Err(TileError::InvalidQuery);
    }
    let Some(target) = table.layer(layer) else {
        return Ok(ReadPlan::empty(layer, point_size));
    };
    let total = target.layer_buffer_size.checked_div(point_size).unwrap_or(0);
    if query.display_width == 0 || total == 0 {
        return Ok(ReadPlan::empty(layer, point_size));
    }

    let width = query.display_width.min(total);
    let focus = focus_point(query.focus_progress, total);
    let mut begin = focus.saturating_sub(query.focus_sample_offset.min(width));
    if begin.saturating_add(width) > total {
        begin = total.saturating_sub(width);
    }

    let unit = u64::from(table.unit_size());
    let ps = u64::from(point_size);
    // Safety: begin + width <= total, so every byte offset is within the
    // layer buffer, which fits u32; unit is non-zero.
    #[allow(clippy::arithmetic_side_effects, clippy::cast_possible_truncation)]
    let (unit_offset, unit_count, first_sample_offset) = {
        let first_byte = u64::from(begin) * ps;
        let end_byte = first_byte + u64::from(width) * ps;
        let unit_offset = first_byte / unit;
        let unit_end = end_byte.div_ceil(unit);
        (
            unit_offset as u32,
            (unit_end - unit_offset) as u32,
            (first_byte % unit) as u32,
        )
    };

    let requests = plan_unit_range(table, layer, unit_offset, unit_count)?;

    #[cfg(feature = "tracing")]
    tracing::trace!(
        layer,
        begin,
        width,
        requests = requests.len(),
        "zoom read planned"
    );

    Ok(ReadPlan {
        layer,
        point_size,
        window_start: begin,
        window_len: width,
        first_sample_offset,
        requests,
    })
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn focus_point(progress: f64, total: u32) -> u32 {
    let progress = progress.clamp(0.0, 1.0);
    // Saturating float-to-int cast; progress is in [0, 1].
    #[allow(clippy::arithmetic_side_effects)]
    let point = (progress * f64::from(total)) as u32;
    point.min(total)
}

/// Reads covering `unit_count` units of `layer` starting at virtual unit
/// `unit_offset`, clipped to the layer.
pub fn plan_unit_range(
    table: &LayerTable,
    layer: u32,
    unit_offset: u32,
    unit_count: u32,
) -> Result<Vec<ReadRequest, MAX_READ_REQUESTS>, TileError> {
    let mut requests: Vec<ReadRequest, MAX_READ_REQUESTS> = Vec::new();
    let Some(target) = table.clamped(layer) else {
        return Ok(requests);
    };
    let unit = table.unit_size();
    let per_flush = target.tile_buffer_units;
    let end = unit_offset
        .saturating_add(unit_count)
        .min(target.layer_buffer_units);

    let mut offset = unit_offset;
    let mut buffer_offset = 0u32;
    while offset < end {
        // Safety: offset < end <= layer_buffer_units; per_flush and unit are
        // non-zero; all byte counts stay within the u32 recording size.
        #[allow(clippy::arithmetic_side_effects)]
        let (run, physical) = (
            (per_flush - offset % per_flush).min(end - offset),
            unit_address(table, target.index, offset),
        );
        #[allow(clippy::arithmetic_side_effects)]
        let size = run * unit;

        let merged = match requests.last_mut() {
            #[allow(clippy::arithmetic_side_effects)]
            Some(last) if last.unit + last.size / unit == physical => {
                last.size = last.size.saturating_add(size);
                true
            }
            _ => false,
        };
        if !merged {
            requests
                .push(ReadRequest {
                    address: physical.saturating_mul(unit),
                    size,
                    unit: physical,
                    buffer_offset,
                })
                .map_err(|_| TileError::PlanOverflow {
                    max: MAX_READ_REQUESTS,
                })?;
        }
        buffer_offset = buffer_offset.saturating_add(size);
        offset = offset.saturating_add(run);
    }
    Ok(requests)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
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

    fn query(progress: f64, focus: u32, width: u32, zoom: u32) -> ZoomQuery {
        ZoomQuery {
            focus_progress: progress,
            point_bit_depth: 8,
            focus_sample_offset: focus,
            display_width: width,
            zoom_factor: zoom,
        }
    }

    fn req(address: u32, size: u32, unit: u32, buffer_offset: u32) -> ReadRequest {
        ReadRequest {
            address,
            size,
            unit,
            buffer_offset,
        }
    }

    #[test]
    fn unaligned_window_splits_across_flushes() {
        // U = 4, L = 3, T = 8; layer 2 has 32 one-byte points.
        let t = table(4, 3, 8);
        let plan = plan_zoom_read(&t, &query(0.5, 3, 6, 4)).unwrap();
        assert_eq!(plan.layer, 2);
        assert_eq!(plan.window_start, 13);
        assert_eq!(plan.window_len, 6);
        assert_eq!(plan.first_sample_offset, 1);
        assert_eq!(plan.requests(), &[req(16, 4, 4, 0), req(28, 4, 7, 4)]);
        assert_eq!(plan.total_bytes(), 8);
        assert_eq!(plan.window_bytes(), 1..7);
    }

    #[test]
    fn adjacent_pieces_merge_into_one_read() {
        let t = table(4, 3, 8);
        let plan = plan_zoom_read(&t, &query(0.0, 0, 8, 4)).unwrap();
        assert_eq!(plan.requests(), &[req(0, 8, 0, 0)]);
    }

    #[test]
    fn window_is_shifted_inside_the_layer_at_full_width() {
        let t = table(4, 3, 8);
        let right = plan_zoom_read(&t, &query(1.0, 2, 8, 4)).unwrap();
        assert_eq!(right.window_start, 24);
        assert_eq!(right.window_len, 8);
        assert_eq!(right.requests(), &[req(40, 8, 10, 0)]);

        let left = plan_zoom_read(&t, &query(0.1, 7, 8, 4)).unwrap();
        assert_eq!(left.window_start, 0);
        assert_eq!(left.window_len, 8);
    }

    #[test]
    fn focus_offset_past_the_width_is_clamped() {
        let t = table(4, 3, 8);
        let plan = plan_zoom_read(&t, &query(0.5, 100, 8, 4)).unwrap();
        assert_eq!(plan.window_start, 8);
        assert_eq!(plan.requests(), &[req(12, 8, 3, 0)]);
    }

    #[test]
    fn wide_points_on_a_multi_unit_layer() {
        // U = 16, L = 6, T = 32; layer 5 holds 256 four-byte points.
        let t = table(16, 6, 32);
        let q = ZoomQuery {
            point_bit_depth: 32,
            ..query(0.25, 4, 16, 32)
        };
        let plan = plan_zoom_read(&t, &q).unwrap();
        assert_eq!(plan.layer, 5);
        assert_eq!(plan.window_start, 60);
        assert_eq!(
            plan.requests(),
            &[req(416, 16, 26, 0), req(496, 32, 31, 16), req(544, 16, 34, 48)]
        );
    }

    #[test]
    fn zero_width_gives_an_empty_plan() {
        let t = table(4, 3, 8);
        let plan = plan_zoom_read(&t, &query(0.5, 0, 0, 4)).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.total_bytes(), 0);
    }

    #[test]
    fn width_larger_than_the_layer_is_capped() {
        let t = table(4, 3, 8);
        let q = ZoomQuery {
            point_bit_depth: 16,
            ..query(0.5, 2, 100, 1)
        };
        let plan = plan_zoom_read(&t, &q).unwrap();
        assert_eq!(plan.layer, 0);
        assert_eq!(plan.window_len, 4);
        assert_eq!(plan.requests(), &[req(24, 4, 6, 0), req(52, 4, 13, 4)]);
    }

    #[test]
    fn bad_bit_depth_and_nan_progress_are_rejected() {
        let t = table(4, 3, 8);
        for bits in [0, 12, 24] {
            let q = ZoomQuery {
                point_bit_depth: bits,
                ..query(0.5, 0, 4, 1)
            };
            assert_eq!(plan_zoom_read(&t, &q), Err(TileError::InvalidQuery), "bits {bits}");
        }
        assert_eq!(
            plan_zoom_read(&t, &query(f64::NAN, 0, 4, 1)),
            Err(TileError::InvalidQuery)
        );
    }

    #[test]
    fn planning_is_repeatable() {
        let t = table(16, 6, 32);
        let q = query(0.37, 5, 40, 8);
        assert_eq!(plan_zoom_read(&t, &q), plan_zoom_read(&t, &q));
    }

    #[test]
    fn wide_layer_zero_window_on_the_default_config_overflows() {
        let t = LayerTable::new(&PyramidConfig::default()).unwrap();
        let q = ZoomQuery {
            focus_progress: 0.5,
            point_bit_depth: 16,
            focus_sample_offset: 35_000,
            display_width: 70_000,
            zoom_factor: 1,
        };
        assert_eq!(
            plan_zoom_read(&t, &q),
            Err(TileError::PlanOverflow { max: MAX_READ_REQUESTS })
        );

        // 60 000 points span at most 60 units, one read each.
        let narrower = ZoomQuery {
            display_width: 60_000,
            focus_sample_offset: 30_000,
            ..q
        };
        let plan = plan_zoom_read(&t, &narrower).unwrap();
        assert_eq!(plan.layer, 0);
        assert!(plan.requests().len() <= MAX_READ_REQUESTS);
        assert!(plan.total_bytes() >= 120_000);
    }

    #[test]
    fn too_many_pieces_overflow_the_plan() {
        // Layer 0 of U = 4, L = 3 has one unit per flush, none adjacent.
        let t = table(4, 3, 4096);
        let err = plan_unit_range(&t, 0, 0, 200).unwrap_err();
        assert_eq!(err, TileError::PlanOverflow { max: MAX_READ_REQUESTS });
    }
}
