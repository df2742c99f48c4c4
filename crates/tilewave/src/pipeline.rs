//! Recorder → storage hand-off and plan execution.
//!
//! ```text
//! frames → Recorder (Slicer) → Channel<FlushDescriptor, N> → FlushWriter → BlockStorage
//!                                                                  ↓
//!                                                         buffer freed to allocator
//! ```
//!
//! The recorder owns the slicer and is the only producer. At most
//! `event_queue_depth` descriptors wait in the channel at once: `record`
//! waits for the writer to catch up (optionally for at most a set time),
//! `try_record` refuses the frame instead.
//! The allocator is shared by reference so the writer can free each flush
//! buffer once it is on storage.

use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use embassy_time::{with_timeout, Duration, Instant};
use platform::{AlignedAllocator, BlockStorage};

use crate::error::{ConfigError, PipelineError, TileError};
use crate::planner::ReadPlan;
use crate::slicer::{FlushDescriptor, FlushKind, Slicer};

/// Channel carrying flush descriptors from a [`Recorder`] to a [`FlushWriter`].
pub type FlushChannel<M, B, const N: usize> = Channel<M, FlushDescriptor<B>, N>;

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Producer side: slices frames and queues their flushes.
pub struct Recorder<'ch, M: RawMutex, A: AlignedAllocator, const N: usize> {
    slicer: Slicer<A>,
    channel: &'ch FlushChannel<M, A::Buffer, N>,
    depth: usize,
    wait_limit: Option<Duration>,
}

impl<'ch, M: RawMutex, A: AlignedAllocator, const N: usize> Recorder<'ch, M, A, N> {
    /// Wrap `slicer`, queueing into `channel`.
    ///
    /// Fails if the configured queue depth exceeds the channel capacity `N`.
    pub fn new(
        slicer: Slicer<A>,
        channel: &'ch FlushChannel<M, A::Buffer, N>,
    ) -> Result<Self, TileError> {
        let requested = slicer.config().event_queue_depth;
        let max = u32::try_from(N).unwrap_or(u32::MAX);
        if requested == 0 || requested > max {
            return Err(ConfigError::QueueDepth { requested, max }.into());
        }
        Ok(Self {
            slicer,
            channel,
            depth: requested as usize,
            wait_limit: None,
        })
    }

    /// Give up on a full queue after `limit`: `record` and `finish` then
    /// return [`TileError::QueueFull`] without ingesting the frame.
    ///
    /// Timing out needs an embassy-time timer queue in the final binary.
    pub fn with_wait_limit(mut self, limit: Duration) -> Self {
        self.wait_limit = Some(limit);
        self
    }

    /// The wrapped slicer.
    pub fn slicer(&self) -> &Slicer<A> {
        &self.slicer
    }

    /// The wrapped slicer, mutably (for `reset`).
    pub fn slicer_mut(&mut self) -> &mut Slicer<A> {
        &mut self.slicer
    }

    /// Unwrap the slicer.
    pub fn into_slicer(self) -> Slicer<A> {
        self.slicer
    }

    /// Ingest a frame, waiting while the queue is at its configured depth.
    ///
    /// The wait is unbounded unless a limit was set with
    /// [`with_wait_limit`](Self::with_wait_limit).
    ///
    /// On `OutOfMemory` nothing was ingested; retry the same frame once the
    /// writer has freed some buffers.
    pub async fn record(&mut self, frame: &[u8]) -> Result<(), TileError> {
        self.submit(frame, FlushKind::Periodic).await
    }

    /// Ingest the last frame and queue a flush of every layer.
    pub async fn finish(&mut self, frame: &[u8]) -> Result<(), TileError> {
        self.submit(frame, FlushKind::Final).await
    }

    async fn submit(&mut self, frame: &[u8], kind: FlushKind) -> Result<(), TileError> {
        if !self.wait_for_room().await {
            #[cfg(feature = "defmt")]
            defmt::warn!("flush queue stayed full, dropped frame at tick {}", self.slicer.ticks());
            #[cfg(feature = "tracing")]
            tracing::warn!(tick = self.slicer.ticks(), "flush queue stayed full, dropped frame");
            return Err(TileError::QueueFull);
        }
        if let Some(descriptor) = self.slicer.tick(frame, kind)? {
            self.channel.send(descriptor).await;
        }
        self.slicer.rate_mut().record(Instant::now());
        Ok(())
    }

    /// `false` if the wait limit ran out with the queue still full.
    async fn wait_for_room(&self) -> bool {
        let room = async {
            while self.channel.len() >= self.depth {
                yield_now().await;
            }
        };
        match self.wait_limit {
            Some(limit) => with_timeout(limit, room).await.is_ok(),
            None => {
                room.await;
                true
            }
        }
    }

    /// Ingest a frame without waiting.
    ///
    /// Returns [`TileError::QueueFull`] before touching any state if the
    /// queue is at its configured depth; the frame is dropped by the caller.
    pub fn try_record(&mut self, frame: &[u8]) -> Result<(), TileError> {
        if self.channel.len() >= self.depth {
            #[cfg(feature = "defmt")]
            defmt::warn!("flush queue full, dropped frame at tick {}", self.slicer.ticks());
            #[cfg(feature = "tracing")]
            tracing::warn!(tick = self.slicer.ticks(), "flush queue full, dropped frame");
            return Err(TileError::QueueFull);
        }
        if let Some(descriptor) = self.slicer.tick(frame, FlushKind::Periodic)? {
            // Single producer and len < depth <= N: the channel has room.
            if let Err(TrySendError::Full(descriptor)) = self.channel.try_send(descriptor) {
                self.slicer.release(descriptor);
                return Err(TileError::QueueFull);
            }
        }
        self.slicer.rate_mut().record(Instant::now());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FlushWriter
// ---------------------------------------------------------------------------

/// Counters kept by a [`FlushWriter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WriterStats {
    /// Flushes written to storage.
    pub flushes: u32,
    /// Bytes written to storage.
    pub bytes: u64,
    /// Descriptors without data (writes disabled).
    pub skipped: u32,
}

/// Consumer side: writes each flush at its address and frees its buffer.
pub struct FlushWriter<S, A> {
    storage: S,
    allocator: A,
    stats: WriterStats,
}

impl<S: BlockStorage, A: AlignedAllocator> FlushWriter<S, A> {
    /// Writer appending to `storage`, freeing buffers to `allocator`.
    pub fn new(storage: S, allocator: A) -> Self {
        Self {
            storage,
            allocator,
            stats: WriterStats::default(),
        }
    }

    /// Write one descriptor. The buffer is freed whether or not the write
    /// succeeds.
    pub async fn write(
        &mut self,
        descriptor: FlushDescriptor<A::Buffer>,
    ) -> Result<(), PipelineError<S::Error>> {
        let FlushDescriptor {
            address,
            size,
            data,
            ..
        } = descriptor;
        let Some(data) = data else {
            self.stats.skipped = self.stats.skipped.saturating_add(1);
            return Ok(());
        };

        let result = match data.as_ref().get(..size as usize) {
            Some(bytes) => self
                .storage
                .write(address, bytes)
                .await
                .map_err(PipelineError::Storage),
            None => Err(PipelineError::Engine(TileError::BufferOverrun {
                expected: size as usize,
                actual: data.as_ref().len(),
            })),
        };
        self.allocator.free(data);
        result?;

        self.stats.flushes = self.stats.flushes.saturating_add(1);
        self.stats.bytes = self.stats.bytes.saturating_add(u64::from(size));
        Ok(())
    }

    /// Write descriptors from `channel` until the one that closes the
    /// recording.
    ///
    /// After the first failed write nothing more is written, but every
    /// descriptor up to and including the closing one is still received and
    /// its buffer freed, so a waiting [`Recorder`] keeps moving. The first
    /// error is returned once the closing descriptor arrives.
    pub async fn drain<M: RawMutex, const N: usize>(
        &mut self,
        channel: &FlushChannel<M, A::Buffer, N>,
    ) -> Result<WriterStats, PipelineError<S::Error>> {
        let mut failed = None;
        loop {
            let descriptor = channel.receive().await;
            let last = descriptor.last;
            if failed.is_some() {
                self.discard(descriptor);
            } else if let Err(e) = self.write(descriptor).await {
                #[cfg(feature = "defmt")]
                defmt::warn!("flush write failed, discarding until the final flush");
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    flushes = self.stats.flushes,
                    queued = channel.len(),
                    "flush write failed, discarding until the final flush"
                );
                failed = Some(e);
            }
            if last {
                break;
            }
        }
        match failed {
            Some(e) => Err(e),
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    flushes = self.stats.flushes,
                    bytes = self.stats.bytes,
                    "recording drained"
                );
                Ok(self.stats)
            }
        }
    }

    /// Free every descriptor queued in `channel` right now without writing
    /// it. Returns how many were dropped.
    ///
    /// For a producer that stopped before queueing its closing flush, where
    /// [`drain`](Self::drain) would wait forever.
    pub fn discard_pending<M: RawMutex, const N: usize>(
        &mut self,
        channel: &FlushChannel<M, A::Buffer, N>,
    ) -> u32 {
        let mut dropped = 0u32;
        while let Ok(descriptor) = channel.try_receive() {
            self.discard(descriptor);
            dropped = dropped.saturating_add(1);
        }
        dropped
    }

    fn discard(&mut self, descriptor: FlushDescriptor<A::Buffer>) {
        if let Some(data) = descriptor.data {
            self.allocator.free(data);
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// The underlying storage.
    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Unwrap the storage.
    pub fn into_storage(self) -> S {
        self.storage
    }
}

// ---------------------------------------------------------------------------
// Plan execution
// ---------------------------------------------------------------------------

/// Issue every request of `plan`, each into its region of `dest`.
///
/// Returns the bytes read; the display window is then
/// `dest[plan.window_bytes()]`. Storage errors are returned unmodified and
/// nothing is retried.
pub async fn read_plan<S: BlockStorage>(
    storage: &mut S,
    plan: &ReadPlan,
    dest: &mut [u8],
) -> Result<usize, PipelineError<S::Error>> {
    let total = plan.total_bytes();
    if dest.len() < total {
        return Err(TileError::BufferOverrun {
            expected: total,
            actual: dest.len(),
        }
        .into());
    }
    for request in plan.requests() {
        let start = request.buffer_offset as usize;
        let end = start.saturating_add(request.size as usize);
        let Some(region) = dest.get_mut(start..end) else {
            return Err(TileError::BufferOverrun {
                expected: end,
                actual: total,
            }
            .into());
        };
        storage
            .read(request.address, region)
            .await
            .map_err(PipelineError::Storage)?;
    }
    Ok(total)
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
    use crate::planner::{plan_zoom_read, ZoomQuery};
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use platform::mocks::{MemBlockStorage, MemStorageError, StorageOp};
    use platform::{HeapAllocator, HeapBuffer};

    fn config(depth: u32) -> PyramidConfig {
        // frame = 16 bytes; periods 16, 8, 4, 2, 1
        PyramidConfig {
            unit_size: 16,
            layer_count: 5,
            tiles_per_layer: 32,
            event_queue_depth: depth,
            write_enabled: true,
        }
    }

    #[test]
    fn depth_larger_than_channel_is_rejected() {
        let alloc = HeapAllocator::new(1 << 16);
        let channel: FlushChannel<NoopRawMutex, HeapBuffer, 2> = Channel::new();
        let slicer = Slicer::new(config(3), &alloc).unwrap();
        let err = Recorder::new(slicer, &channel).err().unwrap();
        assert_eq!(
            err,
            TileError::Config(ConfigError::QueueDepth { requested: 3, max: 2 })
        );
    }

    #[test]
    fn try_record_refuses_before_touching_state() {
        let alloc = HeapAllocator::new(1 << 16);
        let channel: FlushChannel<NoopRawMutex, HeapBuffer, 4> = Channel::new();
        let slicer = Slicer::new(config(2), &alloc).unwrap();
        let mut recorder = Recorder::new(slicer, &channel).unwrap();

        recorder.try_record(&[0u8; 16]).unwrap();
        recorder.try_record(&[0u8; 16]).unwrap();
        assert_eq!(channel.len(), 2);
        let used = alloc.used();

        assert_eq!(recorder.try_record(&[0u8; 16]), Err(TileError::QueueFull));
        assert_eq!(recorder.slicer().ticks(), 2);
        assert_eq!(recorder.slicer().period(), 3);
        assert_eq!(alloc.used(), used);

        let d = channel.try_receive().unwrap();
        recorder.slicer().release(d);
        recorder.try_record(&[0u8; 16]).unwrap();
        assert_eq!(recorder.slicer().ticks(), 3);
    }

    #[tokio::test]
    async fn writer_appends_flushes_and_frees_buffers() {
        let alloc = HeapAllocator::new(1 << 16);
        let channel: FlushChannel<NoopRawMutex, HeapBuffer, 4> = Channel::new();
        let slicer = Slicer::new(config(4), &alloc).unwrap();
        let scratch = alloc.used();
        let mut recorder = Recorder::new(slicer, &channel).unwrap();
        let mut writer = FlushWriter::new(MemBlockStorage::new(16, 1024), &alloc);

        for _ in 0..3 {
            recorder.record(&[1u8; 16]).await.unwrap();
        }
        recorder.finish(&[2u8; 16]).await.unwrap();
        let stats = writer.drain(&channel).await.unwrap();

        // Ticks 1..3 flush 16, 32, 16 bytes; the final tick flushes all five layers.
        assert_eq!(stats.flushes, 4);
        assert_eq!(stats.bytes, 16 + 32 + 16 + 80);
        assert_eq!(alloc.used(), scratch);
        assert_eq!(
            writer.storage_mut().ops()[..2],
            [
                StorageOp::Write { address: 0, len: 16 },
                StorageOp::Write { address: 16, len: 32 },
            ]
        );
    }

    #[tokio::test]
    async fn storage_errors_pass_through_and_still_free() {
        let alloc = HeapAllocator::new(1 << 16);
        let mut slicer = Slicer::new(config(1), &alloc).unwrap();
        let scratch = alloc.used();
        let d = slicer.ingest_frame(&[0u8; 16]).unwrap().unwrap();

        let mut storage = MemBlockStorage::new(16, 1024);
        storage.fail_next();
        let mut writer = FlushWriter::new(storage, &alloc);
        let err = writer.write(d).await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage(MemStorageError::Injected)));
        assert_eq!(alloc.used(), scratch);
        assert_eq!(writer.stats().flushes, 0);
    }

    #[tokio::test]
    async fn failed_drain_frees_every_queued_buffer() {
        let alloc = HeapAllocator::new(1 << 16);
        let channel: FlushChannel<NoopRawMutex, HeapBuffer, 4> = Channel::new();
        let slicer = Slicer::new(config(4), &alloc).unwrap();
        let scratch = alloc.used();
        let mut recorder = Recorder::new(slicer, &channel).unwrap();
        for _ in 0..3 {
            recorder.try_record(&[1u8; 16]).unwrap();
        }
        recorder.finish(&[2u8; 16]).await.unwrap();
        assert_eq!(channel.len(), 4);
        assert!(alloc.used() > scratch);

        let mut storage = MemBlockStorage::new(16, 1024);
        storage.fail_next();
        let mut writer = FlushWriter::new(storage, &alloc);
        let err = writer.drain(&channel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage(MemStorageError::Injected)));
        assert_eq!(channel.len(), 0);
        assert_eq!(alloc.used(), scratch);
        assert_eq!(writer.stats().flushes, 0);
    }

    #[tokio::test]
    async fn failed_writer_keeps_a_waiting_recorder_moving() {
        let alloc = HeapAllocator::new(1 << 16);
        let channel: FlushChannel<NoopRawMutex, HeapBuffer, 1> = Channel::new();
        let slicer = Slicer::new(config(1), &alloc).unwrap();
        let scratch = alloc.used();
        let mut recorder = Recorder::new(slicer, &channel).unwrap();
        let mut storage = MemBlockStorage::new(16, 1024);
        storage.fail_next();
        let mut writer = FlushWriter::new(storage, &alloc);

        let produce = async {
            for tick in 0..31u8 {
                recorder.record(&[tick; 16]).await.unwrap();
            }
            recorder.finish(&[31u8; 16]).await.unwrap();
        };
        let ((), drained) = embassy_futures::join::join(produce, writer.drain(&channel)).await;

        assert!(matches!(
            drained,
            Err(PipelineError::Storage(MemStorageError::Injected))
        ));
        assert_eq!(recorder.slicer().ticks(), 32);
        assert_eq!(alloc.used(), scratch);
    }

    #[test]
    fn pending_descriptors_are_dropped_without_a_final_flush() {
        let alloc = HeapAllocator::new(1 << 16);
        let channel: FlushChannel<NoopRawMutex, HeapBuffer, 4> = Channel::new();
        let slicer = Slicer::new(config(4), &alloc).unwrap();
        let scratch = alloc.used();
        let mut recorder = Recorder::new(slicer, &channel).unwrap();
        recorder.try_record(&[0u8; 16]).unwrap();
        recorder.try_record(&[0u8; 16]).unwrap();

        let mut writer = FlushWriter::new(MemBlockStorage::new(16, 1024), &alloc);
        assert_eq!(writer.discard_pending(&channel), 2);
        assert_eq!(writer.discard_pending(&channel), 0);
        assert_eq!(channel.len(), 0);
        assert_eq!(alloc.used(), scratch);
        assert!(writer.storage_mut().ops().is_empty());
    }

    #[tokio::test]
    async fn wait_limit_turns_a_stuck_queue_into_queue_full() {
        let alloc = HeapAllocator::new(1 << 16);
        let channel: FlushChannel<NoopRawMutex, HeapBuffer, 1> = Channel::new();
        let slicer = Slicer::new(config(1), &alloc).unwrap();
        let mut recorder = Recorder::new(slicer, &channel)
            .unwrap()
            .with_wait_limit(Duration::from_millis(5));
        recorder.try_record(&[0u8; 16]).unwrap();
        let used = alloc.used();

        assert_eq!(recorder.record(&[0u8; 16]).await, Err(TileError::QueueFull));
        assert_eq!(recorder.slicer().ticks(), 1);
        assert_eq!(alloc.used(), used);

        let d = channel.try_receive().unwrap();
        recorder.slicer().release(d);
        recorder.record(&[0u8; 16]).await.unwrap();
        assert_eq!(recorder.slicer().ticks(), 2);
    }

    #[tokio::test]
    async fn dry_run_descriptors_are_counted_as_skipped() {
        let alloc = HeapAllocator::new(1 << 16);
        let cfg = PyramidConfig {
            write_enabled: false,
            ..config(2)
        };
        let channel: FlushChannel<NoopRawMutex, HeapBuffer, 2> = Channel::new();
        let mut recorder = Recorder::new(Slicer::new(cfg, &alloc).unwrap(), &channel).unwrap();
        let mut writer = FlushWriter::new(MemBlockStorage::new(16, 1024), &alloc);
        recorder.finish(&[0u8; 16]).await.unwrap();
        let stats = writer.drain(&channel).await.unwrap();
        assert_eq!(stats, WriterStats { flushes: 0, bytes: 0, skipped: 1 });
        assert!(writer.storage_mut().ops().is_empty());
    }

    #[tokio::test]
    async fn read_plan_fills_each_request_region() {
        let alloc = HeapAllocator::new(1 << 16);
        let channel: FlushChannel<NoopRawMutex, HeapBuffer, 8> = Channel::new();
        let slicer = Slicer::new(config(8), &alloc).unwrap();
        let table = slicer.table().clone();
        let mut recorder = Recorder::new(slicer, &channel).unwrap();
        let mut writer = FlushWriter::new(MemBlockStorage::new(16, 1024), &alloc);
        for tick in 0..31u8 {
            recorder.record(&[tick; 16]).await.unwrap();
            while let Ok(d) = channel.try_receive() {
                writer.write(d).await.unwrap();
            }
        }
        recorder.finish(&[31u8; 16]).await.unwrap();
        writer.drain(&channel).await.unwrap();

        // Layer 4 stores each frame verbatim: point n is frame n.
        let query = ZoomQuery {
            focus_progress: 0.5,
            point_bit_depth: 8,
            focus_sample_offset: 8,
            display_width: 40,
            zoom_factor: 16,
        };
        let plan = plan_zoom_read(&table, &query).unwrap();
        assert_eq!(plan.layer, 4);
        let mut dest = [0u8; 64];
        let n = read_plan(writer.storage_mut(), &plan, &mut dest).await.unwrap();
        assert_eq!(n, plan.total_bytes());
        let window = &dest[plan.window_bytes()];
        assert_eq!(window.len(), 40);
        for (i, &b) in window.iter().enumerate() {
            let point = plan.window_start as usize + i;
            assert_eq!(usize::from(b), point / 16, "point {point}");
        }
    }

    #[tokio::test]
    async fn read_plan_rejects_a_short_destination() {
        let table = crate::layer::LayerTable::new(&config(1)).unwrap();
        let query = ZoomQuery {
            focus_progress: 0.0,
            point_bit_depth: 8,
            focus_sample_offset: 0,
            display_width: 32,
            zoom_factor: 16,
        };
        let plan = plan_zoom_read(&table, &query).unwrap();
        let mut storage = MemBlockStorage::new(16, 1024);
        let mut dest = [0u8; 8];
        let err = read_plan(&mut storage, &plan, &mut dest).await.unwrap_err();
        assert!(matches!(err, PipelineError::Engine(TileError::BufferOverrun { .. })));
        assert!(storage.ops().is_empty());
    }
}
