//! Pyramid geometry.
//!
//! Layer `i` stores tiles of `2^i` bytes. Its scratch buffer holds at least
//! one storage unit, so fine layers (tile smaller than a unit) accumulate
//! several ticks before flushing, while coarse layers flush every tick:
//!
//! ```text
//! U = 16, L = 6
//! layer  tile  tile buffer  period (ticks between flushes)
//!   0      1       16          16
//!   1      2       16           8
//!   2      4       16           4
//!   3      8       16           2
//!   4     16       16           1
//!   5     32       32           1
//! ```
//!
//! Every flush tick of layer `i` is also a flush tick of every layer above
//! it, so the layer 0 period is the length of the whole flush schedule.

use heapless::Vec;

use crate::config::{PyramidConfig, MAX_LAYERS};
use crate::error::ConfigError;
use crate::slicer::FlushKind;

/// Geometry of one pyramid layer. All sizes in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Layer {
    /// Position in the pyramid, 0 = finest.
    pub index: u32,
    /// Bytes appended per tick: `2^index`.
    pub tile_size: u32,
    /// Scratch region flushed as one piece: `max(U, tile_size)`.
    pub tile_buffer_size: u32,
    /// Bytes the layer holds over a full recording: `tile_size * T`.
    pub layer_buffer_size: u32,
    /// Ticks between flushes: `tile_buffer_size / tile_size`.
    pub period: u32,
    /// `tile_buffer_size` in units.
    pub tile_buffer_units: u32,
    /// `layer_buffer_size` in units.
    pub layer_buffer_units: u32,
}

impl Layer {
    #[allow(clippy::arithmetic_side_effects)] // Safety: validate() bounds (2^L - 1) * T by u32::MAX; unit and tile are non-zero powers of two
    fn new(index: u32, unit_size: u32, tiles_per_layer: u32) -> Self {
        let tile_size = 1u32 << index;
        let tile_buffer_size = unit_size.max(tile_size);
        let layer_buffer_size = tile_size * tiles_per_layer;
        Self {
            index,
            tile_size,
            tile_buffer_size,
            layer_buffer_size,
            period: tile_buffer_size / tile_size,
            tile_buffer_units: tile_buffer_size / unit_size,
            layer_buffer_units: layer_buffer_size / unit_size,
        }
    }

    /// Decimation relative to layer 0: `2^index`.
    pub fn zoom_factor(&self) -> u32 {
        self.tile_size
    }

    /// `true` if this layer flushes on `period` (1-based schedule position).
    pub fn is_due(&self, period: u32, kind: FlushKind) -> bool {
        kind == FlushKind::Final || period.checked_rem(self.period) == Some(0)
    }
}

/// Every layer of a configured pyramid, finest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerTable {
    unit_size: u32,
    tiles_per_layer: u32,
    layers: Vec<Layer, MAX_LAYERS>,
}

impl LayerTable {
    /// Validate `config` and derive the layer geometry.
    pub fn new(config: &PyramidConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        #[allow(clippy::cast_possible_truncation)] // MAX_LAYERS is 16
        let max = MAX_LAYERS as u32;
        let mut layers = Vec::new();
        for index in 0..config.layer_count {
            layers
                .push(Layer::new(index, config.unit_size, config.tiles_per_layer))
                .map_err(|_| ConfigError::TooManyLayers {
                    requested: config.layer_count,
                    max,
                })?;
        }
        Ok(Self {
            unit_size: config.unit_size,
            tiles_per_layer: config.tiles_per_layer,
            layers,
        })
    }

    /// Storage unit size `U`.
    pub fn unit_size(&self) -> u32 {
        self.unit_size
    }

    /// Tiles per layer `T`, which is also the number of ticks in a full
    /// recording.
    pub fn tiles_per_layer(&self) -> u32 {
        self.tiles_per_layer
    }

    /// Number of layers `L`.
    pub fn layer_count(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)] // at most MAX_LAYERS
        let count = self.layers.len() as u32;
        count
    }

    /// All layers, finest first.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Layer `index`, if it exists.
    pub fn layer(&self, index: u32) -> Option<&Layer> {
        self.layers.get(index as usize)
    }

    /// Layer `index`, clamped to the coarsest layer.
    pub(crate) fn clamped(&self, index: u32) -> Option<&Layer> {
        self.layer(index).or_else(|| self.layers.last())
    }

    /// Length of the flush schedule in ticks (the layer 0 period).
    pub fn period_max(&self) -> u32 {
        self.layers.first().map_or(1, |l| l.period)
    }

    /// Bytes per frame handed to the slicer (the coarsest layer's tile).
    pub fn frame_size(&self) -> u32 {
        self.layers.last().map_or(0, |l| l.tile_size)
    }

    /// Decimation of `layer` (clamped) relative to layer 0.
    pub fn zoom_factor(&self, layer: u32) -> u32 {
        self.clamped(layer).map_or(1, Layer::zoom_factor)
    }

    /// Layer that serves a display zoom of `zoom` (floor log2, clamped).
    pub fn layer_for_zoom(&self, zoom: u32) -> u32 {
        let top = self.layer_count().saturating_sub(1);
        zoom.checked_ilog2().unwrap_or(0).min(top)
    }

    /// Bytes in a fully written recording.
    pub fn recording_size(&self) -> u64 {
        self.layers
            .iter()
            .map(|l| u64::from(l.layer_buffer_size))
            .sum()
    }

    /// Scratch bytes the slicer allocates: one tile buffer per layer plus
    /// the frame-sized working buffer.
    pub fn scratch_bytes(&self) -> u64 {
        let tile_buffers: u64 = self
            .layers
            .iter()
            .map(|l| u64::from(l.tile_buffer_size))
            .sum();
        tile_buffers.saturating_add(u64::from(self.frame_size()))
    }

    /// Storage bytes written once `ticks` periodic ticks have been flushed.
    /// Ticks past the end of the recording are ignored.
    pub fn bytes_flushed_after(&self, ticks: u32) -> u64 {
        let ticks = ticks.min(self.tiles_per_layer);
        self.layers
            .iter()
            .map(|l| {
                let flushes = ticks.checked_div(l.period).unwrap_or(0);
                u64::from(flushes).saturating_mul(u64::from(l.tile_buffer_size))
            })
            .sum()
    }

    /// Layers flushed on `period`, in storage order (coarsest first).
    pub fn due_layers(&self, period: u32, kind: FlushKind) -> impl Iterator<Item = &Layer> {
        self.layers
            .iter()
            .rev()
            .filter(move |l| l.is_due(period, kind))
    }

    /// Size of the contiguous flush buffer for `period`.
    pub fn flush_size(&self, period: u32, kind: FlushKind) -> u32 {
        self.due_layers(period, kind)
            .fold(0u32, |acc, l| acc.saturating_add(l.tile_buffer_size))
    }
}

impl core::fmt::Display for LayerTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(
            f,
            "| layer | zoom | tile | tile buffer | period | tile units | layer buffer | layer units |"
        )?;
        writeln!(
            f,
            "|------:|-----:|-----:|------------:|-------:|-----------:|-------------:|------------:|"
        )?;
        for l in &self.layers {
            writeln!(
                f,
                "| {} | {} | {} | {} | {} | {} | {} | {} |",
                l.index,
                l.zoom_factor(),
                l.tile_size,
                l.tile_buffer_size,
                l.period,
                l.tile_buffer_units,
                l.layer_buffer_size,
                l.layer_buffer_units
            )?;
        }
        writeln!(f)?;
        writeln!(f, "unit size:      {} bytes", self.unit_size)?;
        writeln!(f, "frame size:     {} bytes", self.frame_size())?;
        writeln!(f, "period max:     {} ticks", self.period_max())?;
        writeln!(f, "scratch:        {} bytes", self.scratch_bytes())?;
        write!(f, "full recording: {} bytes", self.recording_size())
    }
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

    fn table(unit_size: u32, layer_count: u32, tiles_per_layer: u32) -> LayerTable {
        LayerTable::new(&PyramidConfig {
            unit_size,
            layer_count,
            tiles_per_layer,
            event_queue_depth: 4,
            write_enabled: true,
        })
        .unwrap()
    }

    #[test]
    fn default_geometry() {
        let t = LayerTable::new(&PyramidConfig::default()).unwrap();
        assert_eq!(t.layer_count(), 12);
        assert_eq!(t.period_max(), 2048);
        assert_eq!(t.frame_size(), 2048);

        let l0 = t.layer(0).unwrap();
        assert_eq!(l0.tile_buffer_size, 2048);
        assert_eq!(l0.layer_buffer_size, 1 << 20);
        assert_eq!(l0.layer_buffer_units, 512);

        let top = t.layer(11).unwrap();
        assert_eq!(top.tile_size, 2048);
        assert_eq!(top.period, 1);
        assert_eq!(top.tile_buffer_units, 1);
    }

    #[test]
    fn layers_past_the_unit_size_flush_every_tick() {
        let t = table(16, 7, 64);
        let l6 = t.layer(6).unwrap();
        assert_eq!(l6.tile_size, 64);
        assert_eq!(l6.tile_buffer_size, 64);
        assert_eq!(l6.tile_buffer_units, 4);
        assert_eq!(l6.period, 1);
        assert_eq!(t.frame_size(), 64);
    }

    #[test]
    fn period_halves_with_each_layer_until_one() {
        let t = table(16, 7, 64);
        let periods: std::vec::Vec<u32> = t.layers().iter().map(|l| l.period).collect();
        assert_eq!(periods, [16, 8, 4, 2, 1, 1, 1]);
    }

    #[test]
    fn due_layers_come_coarsest_first() {
        let t = table(16, 5, 64);
        let due: std::vec::Vec<u32> = t.due_layers(4, FlushKind::Periodic).map(|l| l.index).collect();
        assert_eq!(due, [4, 3, 2]);
        let all: std::vec::Vec<u32> = t.due_layers(3, FlushKind::Final).map(|l| l.index).collect();
        assert_eq!(all, [4, 3, 2, 1, 0]);
        assert_eq!(t.flush_size(4, FlushKind::Periodic), 48);
        assert_eq!(t.flush_size(1, FlushKind::Periodic), 16);
    }

    #[test]
    fn full_recording_matches_schedule_total() {
        for (u, l, tiles) in [(16, 5, 64), (16, 7, 32), (8, 3, 8), (2048, 12, 1 << 20)] {
            let t = table(u, l, tiles);
            assert_eq!(t.bytes_flushed_after(tiles), t.recording_size(), "U={u} L={l}");
            assert_eq!(t.bytes_flushed_after(u32::MAX), t.recording_size());
            assert_eq!(t.recording_size(), ((1u64 << l) - 1) * u64::from(tiles));
        }
    }

    #[test]
    fn bytes_flushed_counts_each_layer_flush() {
        let t = table(16, 5, 64);
        // Tick 4: layer 4 x4, layer 3 x2, layer 2 x1.
        assert_eq!(t.bytes_flushed_after(4), 16 * (4 + 2 + 1));
        assert_eq!(t.bytes_flushed_after(0), 0);
    }

    #[test]
    fn scratch_covers_every_tile_buffer_and_the_frame() {
        let t = table(16, 7, 64);
        assert_eq!(t.scratch_bytes(), 16 * 5 + 32 + 64 + 64);
    }

    #[test]
    fn zoom_maps_to_floor_log2_clamped() {
        let t = table(16, 5, 64);
        assert_eq!(t.layer_for_zoom(0), 0);
        assert_eq!(t.layer_for_zoom(1), 0);
        assert_eq!(t.layer_for_zoom(3), 1);
        assert_eq!(t.layer_for_zoom(8), 3);
        assert_eq!(t.layer_for_zoom(1 << 20), 4);
        assert_eq!(t.zoom_factor(2), 4);
        assert_eq!(t.zoom_factor(99), 16);
    }

    #[test]
    fn display_renders_one_row_per_layer() {
        let t = table(16, 3, 16);
        let text = t.to_string();
        assert!(text.starts_with("| layer |"));
        assert!(text.contains("| 0 | 1 | 1 | 16 | 16 | 1 | 16 | 1 |"));
        assert!(text.contains("| 2 | 4 | 4 | 16 | 4 | 1 | 64 | 4 |"));
        assert!(text.contains("full recording: 112 bytes"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = PyramidConfig {
            unit_size: 24,
            ..PyramidConfig::default()
        };
        assert!(LayerTable::new(&config).is_err());
    }
}
