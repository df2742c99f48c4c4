//! Online pyramid slicing.
//!
//! Each tick takes one frame (the coarsest layer's tile), stores it in the
//! coarsest layer's scratch buffer, halves it, stores the result in the next
//! layer down, and so on to layer 0. Layers whose period ends on this tick
//! are then copied, coarsest first, into one contiguous buffer that the
//! storage writer appends at [`FlushDescriptor::address`].
//!
//! A tick runs in a fixed order:
//!
//! 1. compute the due layers and the flush size
//! 2. allocate the flush buffer (on failure nothing has changed yet)
//! 3. write and downsample every layer's tile
//! 4. copy due layers into the flush buffer and reset their cursors

use heapless::Vec;
use platform::AlignedAllocator;

use crate::config::{PyramidConfig, BUFFER_ALIGNMENT, MAX_LAYERS};
use crate::downsample;
use crate::error::{ConfigError, TileError};
use crate::layer::LayerTable;
use crate::rate::RateEstimator;

/// Why a tick flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlushKind {
    /// Only layers whose period ends on this tick.
    Periodic,
    /// Every layer, ending the recording.
    Final,
}

/// Where one layer's tile buffer sits inside a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlushEntry {
    /// Layer index
    pub layer: u32,
    /// Storage byte address of this layer's bytes
    pub address: u32,
    /// Bytes (the layer's tile buffer size)
    pub size: u32,
}

/// Output of a tick that flushed at least one layer.
#[derive(Debug)]
pub struct FlushDescriptor<B> {
    /// Storage byte address the contiguous buffer must be written at.
    pub address: u32,
    /// Bytes in the contiguous buffer.
    pub size: u32,
    /// Contiguous copy of every flushed layer, coarsest first. `None` when
    /// writes are disabled. Return it to the allocator once written.
    pub data: Option<B>,
    /// Schedule position of the tick (1-based).
    pub period: u32,
    /// Number of layers flushed.
    pub mark: u32,
    /// Periodic or final flush.
    pub kind: FlushKind,
    /// `true` on the flush that closes the recording (final flush, or the
    /// tick that filled every layer).
    pub last: bool,
    /// Per-layer breakdown, in storage order.
    pub entries: Vec<FlushEntry, MAX_LAYERS>,
}

impl<B: AsRef<[u8]>> FlushDescriptor<B> {
    /// The staged bytes, if writes are enabled.
    pub fn bytes(&self) -> Option<&[u8]> {
        self.data
            .as_ref()
            .and_then(|d| d.as_ref().get(..self.size as usize))
    }
}

struct LayerScratch<B> {
    buffer: B,
    offset: usize,
}

/// Owns every layer's scratch buffer and cursor and turns frames into flushes.
pub struct Slicer<A: AlignedAllocator> {
    config: PyramidConfig,
    table: LayerTable,
    allocator: A,
    scratch: Vec<LayerScratch<A::Buffer>, MAX_LAYERS>,
    work: A::Buffer,
    period: u32,
    ticks: u32,
    write_address: u32,
    closed: bool,
    rate: RateEstimator,
}

impl<A: AlignedAllocator> Slicer<A> {
    /// Build the layer table and allocate its scratch buffers from
    /// `allocator`.
    ///
    /// Fails with [`ConfigError::ScratchExceedsBudget`] if the allocator
    /// cannot hold every scratch buffer; anything already allocated is
    /// returned to it.
    pub fn new(config: PyramidConfig, allocator: A) -> Result<Self, TileError> {
        let table = LayerTable::new(&config)?;
        let required = table.scratch_bytes();
        let budget_error = |available: usize| ConfigError::ScratchExceedsBudget {
            required,
            available: u64::try_from(available).unwrap_or(u64::MAX),
        };
        if u64::try_from(allocator.available()).unwrap_or(u64::MAX) < required {
            return Err(budget_error(allocator.available()).into());
        }

        let work = allocator
            .allocate(table.frame_size() as usize, BUFFER_ALIGNMENT)
            .map_err(|e| budget_error(e.available))?;
        let mut scratch: Vec<LayerScratch<A::Buffer>, MAX_LAYERS> = Vec::new();
        for layer in table.layers() {
            let buffer = match allocator.allocate(layer.tile_buffer_size as usize, BUFFER_ALIGNMENT) {
                Ok(buffer) => buffer,
                Err(e) => {
                    allocator.free(work);
                    for s in scratch {
                        allocator.free(s.buffer);
                    }
                    return Err(budget_error(e.available).into());
                }
            };
            if let Err(rejected) = scratch.push(LayerScratch { buffer, offset: 0 }) {
                allocator.free(rejected.buffer);
            }
        }

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "slicer ready: {} layers, frame {} bytes, scratch {} bytes",
            table.layer_count(),
            table.frame_size(),
            required
        );
        #[cfg(feature = "tracing")]
        tracing::debug!(
            layers = table.layer_count(),
            frame = table.frame_size(),
            scratch = required,
            "slicer ready"
        );

        Ok(Self {
            config,
            table,
            allocator,
            scratch,
            work,
            period: 1,
            ticks: 0,
            write_address: 0,
            closed: false,
            rate: RateEstimator::new(),
        })
    }

    /// Configuration the slicer was built with.
    pub fn config(&self) -> &PyramidConfig {
        &self.config
    }

    /// Layer geometry.
    pub fn table(&self) -> &LayerTable {
        &self.table
    }

    /// The allocator scratch and flush buffers come from.
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Bytes every frame must have.
    pub fn frame_size(&self) -> usize {
        self.table.frame_size() as usize
    }

    /// Schedule position of the next tick (1-based, wraps at
    /// [`LayerTable::period_max`]).
    pub fn period(&self) -> u32 {
        self.period
    }

    /// Ticks ingested since the last reset.
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Storage address the next flush will be written at.
    pub fn write_address(&self) -> u32 {
        self.write_address
    }

    /// `true` once the recording is full or finished.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Tick-rate estimate.
    pub fn rate(&self) -> &RateEstimator {
        &self.rate
    }

    /// Tick-rate estimate, for feeding timestamps.
    pub fn rate_mut(&mut self) -> &mut RateEstimator {
        &mut self.rate
    }

    /// Ingest one frame, flushing the layers whose period ends.
    pub fn ingest_frame(
        &mut self,
        frame: &[u8],
    ) -> Result<Option<FlushDescriptor<A::Buffer>>, TileError> {
        self.tick(frame, FlushKind::Periodic)
    }

    /// Ingest the last frame of a recording and flush every layer.
    pub fn ingest_final_frame(
        &mut self,
        frame: &[u8],
    ) -> Result<Option<FlushDescriptor<A::Buffer>>, TileError> {
        self.tick(frame, FlushKind::Final)
    }

    /// Run one tick.
    ///
    /// Returns `Ok(None)` when no layer is due. On `BufferOverrun`,
    /// `OutOfMemory` and `RecordingFull` no state has changed and the same
    /// frame may be offered again.
    ///
    /// A final flush writes each layer's whole tile buffer, including the
    /// part past its cursor that this cycle has not filled.
    pub fn tick(
        &mut self,
        frame: &[u8],
        kind: FlushKind,
    ) -> Result<Option<FlushDescriptor<A::Buffer>>, TileError> {
        if self.closed {
            return Err(TileError::RecordingFull);
        }
        let frame_size = self.frame_size();
        if frame.len() != frame_size {
            return Err(TileError::BufferOverrun {
                expected: frame_size,
                actual: frame.len(),
            });
        }

        let period = self.period;
        let flush_size = self.table.flush_size(period, kind);

        let mut staging = if self.config.write_enabled && flush_size > 0 {
            match self.allocator.allocate(flush_size as usize, BUFFER_ALIGNMENT) {
                Ok(buffer) => Some(buffer),
                Err(e) => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!(
                        "flush staging failed: {} bytes requested, {} available",
                        e.requested,
                        e.available
                    );
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        requested = e.requested,
                        available = e.available,
                        period,
                        "flush staging failed"
                    );
                    return Err(TileError::OutOfMemory {
                        requested: e.requested,
                    });
                }
            }
        } else {
            None
        };

        self.slice(frame);

        let mut entries = Vec::new();
        let mut cursor = 0usize;
        for (layer, scratch) in self.table.layers().iter().zip(self.scratch.iter_mut()).rev() {
            if !layer.is_due(period, kind) {
                continue;
            }
            let size = layer.tile_buffer_size as usize;
            let end = cursor.saturating_add(size);
            if let Some(buffer) = staging.as_mut() {
                let dst = buffer.as_mut().get_mut(cursor..end);
                let src = scratch.buffer.as_ref().get(..size);
                if let (Some(dst), Some(src)) = (dst, src) {
                    dst.copy_from_slice(src);
                }
            }
            scratch.offset = 0;
            // Cannot overflow: at most one entry per layer.
            let _ = entries.push(FlushEntry {
                layer: layer.index,
                address: self
                    .write_address
                    .saturating_add(u32::try_from(cursor).unwrap_or(u32::MAX)),
                size: layer.tile_buffer_size,
            });
            cursor = end;
        }

        self.ticks = self.ticks.saturating_add(1);
        self.period = period
            .checked_rem(self.table.period_max())
            .unwrap_or(0)
            .saturating_add(1);
        let last = kind == FlushKind::Final || self.ticks >= self.table.tiles_per_layer();
        self.closed = last;

        if entries.is_empty() {
            return Ok(None);
        }

        #[allow(clippy::cast_possible_truncation)] // at most MAX_LAYERS
        let mark = entries.len() as u32;
        let address = self.write_address;
        self.write_address = self.write_address.saturating_add(flush_size);

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "flush period {} mark {}: {} bytes at {}",
            period,
            mark,
            flush_size,
            address
        );
        #[cfg(feature = "tracing")]
        tracing::debug!(period, mark, address, size = flush_size, last, "flush");

        Ok(Some(FlushDescriptor {
            address,
            size: flush_size,
            data: staging,
            period,
            mark,
            kind,
            last,
            entries,
        }))
    }

    /// Store the frame in the coarsest layer and each successive half in the
    /// layer below.
    fn slice(&mut self, frame: &[u8]) {
        let work = self.work.as_mut();
        if let Some(dst) = work.get_mut(..frame.len()) {
            dst.copy_from_slice(frame);
        }
        for (layer, scratch) in self.table.layers().iter().zip(self.scratch.iter_mut()).rev() {
            let tile = layer.tile_size as usize;
            // The schedule resets every cursor before its buffer fills.
            let end = scratch.offset.saturating_add(tile);
            let src = work.get(..tile);
            let dst = scratch.buffer.as_mut().get_mut(scratch.offset..end);
            if let (Some(src), Some(dst)) = (src, dst) {
                dst.copy_from_slice(src);
            }
            scratch.offset = end;

            if layer.index == 0 {
                break;
            }
            if let Some(k) = work.get_mut(..tile).and_then(downsample::halve_in_place) {
                #[cfg(feature = "defmt")]
                defmt::debug!("layer {}: unusable mean at sample {}, rest zeroed", layer.index, k);
                #[cfg(feature = "tracing")]
                tracing::debug!(layer = layer.index, sample = k, "unusable mean, rest of tile zeroed");
                #[cfg(not(any(feature = "defmt", feature = "tracing")))]
                let _ = k;
            }
        }
    }

    /// Start a new recording: period back to 1, write address and every
    /// layer cursor back to 0, scratch zeroed, rate estimate cleared.
    pub fn reset(&mut self) {
        for scratch in &mut self.scratch {
            scratch.buffer.as_mut().fill(0);
            scratch.offset = 0;
        }
        self.period = 1;
        self.ticks = 0;
        self.write_address = 0;
        self.closed = false;
        self.rate.reset();
    }

    /// Return a flush buffer to the allocator.
    pub fn release(&self, descriptor: FlushDescriptor<A::Buffer>) {
        if let Some(data) = descriptor.data {
            self.allocator.free(data);
        }
    }

    /// Free every scratch buffer and hand the allocator back.
    pub fn shutdown(self) -> A {
        let Self {
            allocator,
            scratch,
            work,
            ..
        } = self;
        allocator.free(work);
        for s in scratch {
            allocator.free(s.buffer);
        }
        allocator
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    clippy::float_cmp
)]
mod tests {
    use super::*;
    use platform::HeapAllocator;

    fn config(unit_size: u32, layer_count: u32, tiles_per_layer: u32) -> PyramidConfig {
        PyramidConfig {
            unit_size,
            layer_count,
            tiles_per_layer,
            event_queue_depth: 4,
            write_enabled: true,
        }
    }

    fn frame_of(value: f32, bytes: usize) -> std::vec::Vec<u8> {
        core::iter::repeat(value.to_le_bytes())
            .take(bytes / 4)
            .flatten()
            .collect()
    }

    #[test]
    fn scenario_a_all_layers_flush_at_period_rollover() {
        let alloc = HeapAllocator::new(1 << 20);
        let mut slicer = Slicer::new(config(2048, 4, 4096), &alloc).unwrap();
        assert_eq!(slicer.table().period_max(), 2048);
        let frame = [0u8; 8];

        let mut last = None;
        for _ in 0..2048 {
            if let Some(d) = slicer.ingest_frame(&frame).unwrap() {
                if let Some(prev) = last.replace(d) {
                    slicer.release(prev);
                }
            }
        }
        let d = last.unwrap();
        assert_eq!(d.period, 2048);
        assert_eq!(d.mark, 4);
        assert_eq!(d.size, 4 * 2048);
        assert_eq!(slicer.period(), 1);
        slicer.release(d);
    }

    #[test]
    fn quiet_ticks_return_none_and_allocate_nothing() {
        let alloc = HeapAllocator::new(1 << 16);
        let mut slicer = Slicer::new(config(64, 3, 128), &alloc).unwrap();
        // frame = 4 bytes; periods 64, 32, 16
        let before = alloc.used();
        for _ in 0..15 {
            assert!(slicer.ingest_frame(&[0u8; 4]).unwrap().is_none());
        }
        assert_eq!(alloc.used(), before);
        let d = slicer.ingest_frame(&[0u8; 4]).unwrap().unwrap();
        assert_eq!(d.mark, 1);
        assert_eq!(d.entries[0].layer, 2);
        slicer.release(d);
    }

    #[test]
    fn wrong_frame_size_is_reported_without_advancing() {
        let alloc = HeapAllocator::new(1 << 16);
        let mut slicer = Slicer::new(config(16, 4, 32), &alloc).unwrap();
        let err = slicer.ingest_frame(&[0u8; 7]).unwrap_err();
        assert_eq!(err, TileError::BufferOverrun { expected: 8, actual: 7 });
        assert_eq!(slicer.ticks(), 0);
        assert_eq!(slicer.period(), 1);
    }

    #[test]
    fn descriptor_carries_layers_coarsest_first_at_running_addresses() {
        let alloc = HeapAllocator::new(1 << 16);
        let mut slicer = Slicer::new(config(16, 5, 64), &alloc).unwrap();
        // frame = 16 bytes; periods 16, 8, 4, 2, 1
        let frame = frame_of(1.0, 16);
        let mut address = 0;
        for tick in 1..=4u32 {
            let d = slicer.ingest_frame(&frame).unwrap().unwrap();
            assert_eq!(d.address, address);
            assert_eq!(d.period, tick);
            address += d.size;
            if tick == 4 {
                let layers: std::vec::Vec<u32> = d.entries.iter().map(|e| e.layer).collect();
                assert_eq!(layers, [4, 3, 2]);
                assert_eq!(d.entries[1].address, d.address + 16);
            }
            slicer.release(d);
        }
        assert_eq!(slicer.write_address(), 16 * (4 + 2 + 1));
        assert_eq!(
            u64::from(slicer.write_address()),
            slicer.table().bytes_flushed_after(4)
        );
    }

    #[test]
    fn lower_layers_hold_pairwise_means() {
        let alloc = HeapAllocator::new(1 << 16);
        let mut slicer = Slicer::new(config(8, 4, 16), &alloc).unwrap();
        // frame = 8 bytes: two samples. Layer 2 stores them, layer 1 their mean.
        let mut frame = std::vec::Vec::new();
        frame.extend_from_slice(&2.0f32.to_le_bytes());
        frame.extend_from_slice(&6.0f32.to_le_bytes());
        let d = slicer.ingest_frame(&frame).unwrap().unwrap();
        // periods 8, 4, 2, 1: only layer 3 is due on tick 1.
        assert_eq!(d.mark, 1);
        slicer.release(d);
        let d = slicer.ingest_frame(&frame).unwrap().unwrap();
        // tick 2: layers 3 (8 bytes) and 2 (two 4-byte tiles).
        let bytes = d.bytes().unwrap();
        let layer2 = &bytes[8..16];
        let mean = f32::from_le_bytes(layer2[..4].try_into().unwrap());
        assert_eq!(mean, 4.0);
        slicer.release(d);
    }

    #[test]
    fn out_of_memory_leaves_state_untouched_and_retry_succeeds() {
        // frame = 16 bytes; layer 4 flushes every tick.
        let cfg = config(16, 5, 32);
        let table = LayerTable::new(&cfg).unwrap();
        // Room for the scratch only; the first flush cannot be staged.
        let alloc = HeapAllocator::new(table.scratch_bytes() as usize);
        let mut slicer = Slicer::new(cfg, &alloc).unwrap();
        let frame = [0u8; 16];
        let err = slicer.ingest_frame(&frame).unwrap_err();
        assert!(matches!(err, TileError::OutOfMemory { requested: 16 }));
        assert_eq!(slicer.ticks(), 0);
        assert_eq!(slicer.period(), 1);
        assert_eq!(slicer.write_address(), 0);
        let alloc = slicer.shutdown();
        assert_eq!(alloc.used(), 0);

        let bigger = HeapAllocator::new(table.scratch_bytes() as usize + 64);
        let mut slicer = Slicer::new(cfg, &bigger).unwrap();
        let d = slicer.ingest_frame(&frame).unwrap().unwrap();
        assert_eq!(d.size, 16);
        slicer.release(d);
    }

    #[test]
    fn scratch_larger_than_budget_is_a_config_error() {
        let alloc = HeapAllocator::new(100);
        let err = Slicer::new(config(64, 4, 128), &alloc).err().unwrap();
        assert_eq!(
            err,
            TileError::Config(ConfigError::ScratchExceedsBudget {
                required: 4 * 64 + 8,
                available: 100,
            })
        );
        assert_eq!(alloc.used(), 0);
    }

    #[test]
    fn dry_run_produces_descriptors_without_data() {
        let alloc = HeapAllocator::new(1 << 16);
        let cfg = PyramidConfig {
            write_enabled: false,
            ..config(16, 3, 32)
        };
        let mut slicer = Slicer::new(cfg, &alloc).unwrap();
        let scratch = alloc.used();
        for _ in 0..4 {
            if let Some(d) = slicer.ingest_frame(&[0u8; 4]).unwrap() {
                assert!(d.data.is_none());
                assert!(d.bytes().is_none());
                assert!(d.size > 0);
            }
        }
        assert_eq!(alloc.used(), scratch);
    }

    #[test]
    fn recording_closes_when_full_and_reopens_on_reset() {
        let alloc = HeapAllocator::new(1 << 16);
        let mut slicer = Slicer::new(config(16, 3, 16), &alloc).unwrap();
        let frame = [0u8; 4];
        let mut last = false;
        for _ in 0..16 {
            if let Some(d) = slicer.ingest_frame(&frame).unwrap() {
                last = d.last;
                slicer.release(d);
            }
        }
        assert!(last);
        assert!(slicer.is_closed());
        assert_eq!(slicer.ingest_frame(&frame).unwrap_err(), TileError::RecordingFull);
        assert_eq!(u64::from(slicer.write_address()), slicer.table().recording_size());

        slicer.reset();
        assert!(!slicer.is_closed());
        assert_eq!(slicer.period(), 1);
        assert_eq!(slicer.write_address(), 0);
        assert!(slicer.ingest_frame(&frame).is_ok());
    }

    #[test]
    fn final_flush_empties_every_layer_and_closes() {
        let alloc = HeapAllocator::new(1 << 16);
        let mut slicer = Slicer::new(config(16, 3, 32), &alloc).unwrap();
        let frame = [0u8; 4];
        for _ in 0..3 {
            if let Some(d) = slicer.ingest_frame(&frame).unwrap() {
                slicer.release(d);
            }
        }
        let d = slicer.ingest_final_frame(&frame).unwrap().unwrap();
        assert_eq!(d.kind, FlushKind::Final);
        assert_eq!(d.mark, 3);
        assert!(d.last);
        slicer.release(d);
        assert_eq!(slicer.ingest_frame(&frame).unwrap_err(), TileError::RecordingFull);
    }

    #[test]
    fn shutdown_returns_every_byte() {
        let alloc = HeapAllocator::new(1 << 16);
        let slicer = Slicer::new(config(16, 4, 32), &alloc).unwrap();
        assert!(alloc.used() > 0);
        slicer.shutdown();
        assert_eq!(alloc.used(), 0);
    }
}
