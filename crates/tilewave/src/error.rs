//! Error types for the tile engine.
//!
//! - [`ConfigError`]: pyramid parameters rejected at initialisation (fatal).
//! - [`TileError`]: everything the engine itself can report at run time.
//! - [`PipelineError`]: a [`TileError`] or a storage error passed through
//!   unmodified from the [`platform::BlockStorage`] collaborator.

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Invalid pyramid parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// The I/O unit size is zero or not a power of two.
    UnitSizeNotPowerOfTwo {
        /// Rejected unit size in bytes
        unit_size: u32,
    },
    /// `layer_count` is zero.
    NoLayers,
    /// More layers than the fixed layer table can hold.
    TooManyLayers {
        /// Requested layer count
        requested: u32,
        /// Compile-time maximum
        max: u32,
    },
    /// `tiles_per_layer` is zero or not a multiple of the unit size, so
    /// layer 0 would not fill whole units.
    TilesNotUnitMultiple {
        /// Rejected tile count
        tiles_per_layer: u32,
        /// Configured unit size
        unit_size: u32,
    },
    /// A full recording would not fit the 32-bit storage address space.
    CapacityOverflow {
        /// Bytes a full recording needs
        required: u64,
    },
    /// Queue depth is zero or exceeds the channel capacity.
    QueueDepth {
        /// Requested depth
        requested: u32,
        /// Capacity available
        max: u32,
    },
    /// The allocator cannot hold every layer's scratch buffer.
    ScratchExceedsBudget {
        /// Scratch bytes required
        required: u64,
        /// Bytes the allocator reported available
        available: u64,
    },
}

impl core::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnitSizeNotPowerOfTwo { unit_size } => {
                write!(f, "unit size {unit_size} is not a power of two")
            }
            Self::NoLayers => f.write_str("layer count must be at least 1"),
            Self::TooManyLayers { requested, max } => {
                write!(f, "{requested} layers requested, at most {max} supported")
            }
            Self::TilesNotUnitMultiple {
                tiles_per_layer,
                unit_size,
            } => write!(
                f,
                "tiles per layer ({tiles_per_layer}) must be a non-zero multiple of the unit size ({unit_size})"
            ),
            Self::CapacityOverflow { required } => {
                write!(f, "full recording needs {required} bytes, beyond 32-bit addressing")
            }
            Self::QueueDepth { requested, max } => {
                write!(f, "queue depth {requested} outside 1..={max}")
            }
            Self::ScratchExceedsBudget {
                required,
                available,
            } => write!(
                f,
                "layer scratch needs {required} bytes, allocator has {available}"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// TileError
// ---------------------------------------------------------------------------

/// Run-time engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TileError {
    /// Invalid configuration.
    Config(ConfigError),
    /// Frame length does not match the per-tick quantum. Resend a correctly
    /// sized frame; engine state is unchanged.
    BufferOverrun {
        /// Bytes expected
        expected: usize,
        /// Bytes supplied
        actual: usize,
    },
    /// The allocator could not stage a flush buffer. Retry the same frame
    /// once the storage writer has released its backlog; engine state is
    /// unchanged.
    OutOfMemory {
        /// Bytes requested
        requested: usize,
    },
    /// Every layer is full, or the final flush has been issued. Call
    /// `reset()` to start a new recording.
    RecordingFull,
    /// The flush queue already holds `event_queue_depth` descriptors, or
    /// stayed that way past the recorder's wait limit. The frame was not
    /// ingested.
    QueueFull,
    /// Zoom query parameters are unusable (bit depth not a power-of-two
    /// number of bytes, NaN progress).
    InvalidQuery,
    /// The read window needs more physical reads than a plan can hold.
    PlanOverflow {
        /// Plan capacity
        max: usize,
    },
}

impl From<ConfigError> for TileError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl core::fmt::Display for TileError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {e}"),
            Self::BufferOverrun { expected, actual } => {
                write!(f, "frame is {actual} bytes, expected {expected}")
            }
            Self::OutOfMemory { requested } => {
                write!(f, "out of memory staging a {requested} byte flush")
            }
            Self::RecordingFull => f.write_str("recording is full or finished"),
            Self::QueueFull => f.write_str("flush queue full, frame dropped"),
            Self::InvalidQuery => f.write_str("invalid zoom query"),
            Self::PlanOverflow { max } => write!(f, "read plan exceeds {max} requests"),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// Error from the storage-facing parts of the engine.
#[derive(Debug)]
pub enum PipelineError<E> {
    /// I/O error from the [`platform::BlockStorage`] implementation.
    Storage(E),
    /// Engine error.
    Engine(TileError),
}

impl<E> From<TileError> for PipelineError<E> {
    fn from(e: TileError) -> Self {
        Self::Engine(e)
    }
}

impl<E: core::fmt::Display> core::fmt::Display for PipelineError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::Engine(e) => write!(f, "{e}"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn config_error_converts_into_tile_error() {
        let e: TileError = ConfigError::NoLayers.into();
        assert_eq!(e, TileError::Config(ConfigError::NoLayers));
    }

    #[test]
    fn display_messages_carry_the_numbers() {
        let e = TileError::BufferOverrun {
            expected: 2048,
            actual: 100,
        };
        assert_eq!(e.to_string(), "frame is 100 bytes, expected 2048");

        let e = ConfigError::UnitSizeNotPowerOfTwo { unit_size: 3000 };
        assert!(e.to_string().contains("3000"));
    }

    #[test]
    fn pipeline_error_wraps_both_sides() {
        let e: PipelineError<&str> = TileError::QueueFull.into();
        assert!(matches!(e, PipelineError::Engine(TileError::QueueFull)));
        let e: PipelineError<&str> = PipelineError::Storage("card removed");
        assert_eq!(e.to_string(), "storage error: card removed");
    }
}
