//! Pyramid configuration.
//!
//! One [`PyramidConfig`] is supplied when the engine is built and never
//! changes afterwards. It deserialises from JSON (the xtask reads it from a
//! file); any field left out takes its [`Default`] value.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Most layers a pyramid may have. Layer tables and flush entry lists are
/// fixed-capacity arrays of this size.
pub const MAX_LAYERS: usize = 16;

/// Start-address alignment of every buffer the engine allocates (one Cortex-M7
/// cache line, so staged flush buffers can go straight to DMA).
pub const BUFFER_ALIGNMENT: usize = 32;

/// Pyramid parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(default)]
pub struct PyramidConfig {
    /// Minimum aligned storage I/O size in bytes (power of two).
    pub unit_size: u32,
    /// Number of pyramid layers.
    pub layer_count: u32,
    /// Tiles each layer holds over a full recording. Also the number of
    /// ticks a recording lasts.
    pub tiles_per_layer: u32,
    /// Flush descriptors allowed in flight between the slicer and the
    /// storage writer.
    pub event_queue_depth: u32,
    /// Stage flush buffers for storage. `false` slices without writing.
    pub write_enabled: bool,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            unit_size: 2048,
            layer_count: 12,
            tiles_per_layer: 1 << 20,
            event_queue_depth: 8,
            write_enabled: true,
        }
    }
}

impl PyramidConfig {
    /// Check the parameters without touching an allocator.
    ///
    /// The scratch budget is checked later, by [`crate::Slicer::new`], since
    /// it depends on the allocator.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.unit_size.is_power_of_two() {
            return Err(ConfigError::UnitSizeNotPowerOfTwo {
                unit_size: self.unit_size,
            });
        }
        if self.layer_count == 0 {
            return Err(ConfigError::NoLayers);
        }
        #[allow(clippy::cast_possible_truncation)] // MAX_LAYERS is 16
        let max = MAX_LAYERS as u32;
        if self.layer_count > max {
            return Err(ConfigError::TooManyLayers {
                requested: self.layer_count,
                max,
            });
        }
        if self.tiles_per_layer == 0 || self.tiles_per_layer.checked_rem(self.unit_size) != Some(0) {
            return Err(ConfigError::TilesNotUnitMultiple {
                tiles_per_layer: self.tiles_per_layer,
                unit_size: self.unit_size,
            });
        }
        let required = self.recording_size();
        if required > u64::from(u32::MAX) {
            return Err(ConfigError::CapacityOverflow { required });
        }
        if self.event_queue_depth == 0 {
            return Err(ConfigError::QueueDepth {
                requested: 0,
                max: u32::MAX,
            });
        }
        Ok(())
    }

    /// Bytes in a fully written recording: `(2^L - 1) * T`.
    pub(crate) fn recording_size(&self) -> u64 {
        let tiles = (1u64 << self.layer_count.min(63)).saturating_sub(1);
        tiles.saturating_mul(u64::from(self.tiles_per_layer))
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

    fn small() -> PyramidConfig {
        PyramidConfig {
            unit_size: 16,
            layer_count: 4,
            tiles_per_layer: 64,
            event_queue_depth: 2,
            write_enabled: true,
        }
    }

    #[test]
    fn default_config_is_valid_and_fits_u32() {
        let config = PyramidConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.recording_size(), 4095 * (1 << 20));
    }

    #[test]
    fn unit_size_must_be_power_of_two() {
        for unit_size in [0, 3, 2000, 3072] {
            let config = PyramidConfig { unit_size, ..small() };
            assert_eq!(
                config.validate(),
                Err(ConfigError::UnitSizeNotPowerOfTwo { unit_size })
            );
        }
    }

    #[test]
    fn layer_count_bounds() {
        let config = PyramidConfig { layer_count: 0, ..small() };
        assert_eq!(config.validate(), Err(ConfigError::NoLayers));

        let config = PyramidConfig { layer_count: 17, ..small() };
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooManyLayers { requested: 17, max: 16 })
        );
    }

    #[test]
    fn tiles_must_fill_whole_units() {
        for tiles_per_layer in [0, 8, 65] {
            let config = PyramidConfig { tiles_per_layer, ..small() };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::TilesNotUnitMultiple { .. })
            ));
        }
    }

    #[test]
    fn oversized_recording_is_rejected() {
        let config = PyramidConfig {
            layer_count: 13,
            ..PyramidConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CapacityOverflow { required }) if required == 8191 * (1 << 20)
        ));
    }

    #[test]
    fn zero_queue_depth_is_rejected() {
        let config = PyramidConfig { event_queue_depth: 0, ..small() };
        assert!(matches!(config.validate(), Err(ConfigError::QueueDepth { .. })));
    }

    #[test]
    fn missing_json_fields_take_defaults() {
        let config: PyramidConfig =
            serde_json::from_str(r#"{ "layer_count": 4, "write_enabled": false }"#).unwrap();
        assert_eq!(config.layer_count, 4);
        assert!(!config.write_enabled);
        assert_eq!(config.unit_size, 2048);
        assert_eq!(config.event_queue_depth, 8);
    }
}
