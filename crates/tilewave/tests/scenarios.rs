//! Behavioural scenarios: schedule rollover, degenerate samples, zoom window
//! placement, and allocator pressure through the full pipeline.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::arithmetic_side_effects)]
#![allow(clippy::indexing_slicing)]
#![allow(clippy::float_cmp)]
#![allow(clippy::cast_possible_truncation)]

use embassy_futures::join::join;
use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use platform::mocks::MemBlockStorage;
use platform::{HeapAllocator, HeapBuffer};
use tilewave::{
    plan_zoom_read, FlushChannel, FlushKind, FlushWriter, LayerTable, PyramidConfig, Recorder,
    Slicer, TileError, ZoomQuery,
};

fn samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

fn frame(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[test]
fn every_layer_flushes_together_at_period_rollover() {
    let alloc = HeapAllocator::new(1 << 20);
    let config = PyramidConfig {
        unit_size: 2048,
        layer_count: 4,
        tiles_per_layer: 8192,
        event_queue_depth: 1,
        write_enabled: true,
    };
    let mut slicer = Slicer::new(config, &alloc).unwrap();
    let period_max = slicer.table().period_max();
    let frame = vec![0u8; slicer.frame_size()];

    for cycle in 0..2 {
        let mut marks = Vec::new();
        for _ in 0..period_max {
            if let Some(d) = slicer.ingest_frame(&frame).unwrap() {
                marks.push((d.period, d.mark));
                slicer.release(d);
            }
        }
        // Layers flush every 256, 512, 1024 and 2048 ticks.
        assert_eq!(marks.len(), 8, "cycle {cycle}");
        assert_eq!(marks.last(), Some(&(2048, 4)));
        assert_eq!(marks[0], (256, 1));
        assert_eq!(marks[1], (512, 2));
        assert_eq!(marks[3], (1024, 3));
    }
}

#[test]
fn non_finite_mean_zeroes_the_rest_of_the_tile() {
    // U = 64, L = 6: frame = 8 samples, layer 4 holds 4-sample tiles.
    let alloc = HeapAllocator::new(1 << 16);
    let config = PyramidConfig {
        unit_size: 64,
        layer_count: 6,
        tiles_per_layer: 64,
        event_queue_depth: 1,
        write_enabled: true,
    };
    let mut slicer = Slicer::new(config, &alloc).unwrap();
    let input = frame(&[1.0, 3.0, 5.0, 7.0, f32::MAX, f32::MAX, 2.0, 2.0]);
    let d = slicer.ingest_final_frame(&input).unwrap().unwrap();
    assert_eq!(d.kind, FlushKind::Final);
    let bytes = d.bytes().unwrap();

    let region = |layer: u32| {
        let e = d.entries.iter().find(|e| e.layer == layer).unwrap();
        let start = (e.address - d.address) as usize;
        &bytes[start..start + e.size as usize]
    };
    // Layer 5 keeps the raw frame, overflow included.
    assert_eq!(samples(&region(5)[..32])[4], f32::MAX);
    // Layer 4: means before the overflow survive, everything from it on is zero.
    assert_eq!(samples(&region(4)[..16]), [2.0, 6.0, 0.0, 0.0]);
    // Layer 3 averages layer 4's tile.
    assert_eq!(samples(&region(3)[..8]), [4.0, 0.0]);
    slicer.release(d);
}

#[test]
fn zoom_window_stays_centred_on_the_focus_until_an_edge() {
    let table = LayerTable::new(&PyramidConfig::default()).unwrap();
    let query = |progress: f64| ZoomQuery {
        focus_progress: progress,
        point_bit_depth: 16,
        focus_sample_offset: 500,
        display_width: 1000,
        zoom_factor: 1,
    };
    // Layer 0 holds 1 MiB of 16-bit points.
    let total = 1u32 << 19;

    let centred = plan_zoom_read(&table, &query(0.5)).unwrap();
    assert_eq!(centred.window_start + 500, total / 2);
    assert_eq!(centred.window_len, 1000);

    let left = plan_zoom_read(&table, &query(0.0001)).unwrap();
    assert_eq!(left.window_start, 0);
    assert_eq!(left.window_len, 1000);

    let right = plan_zoom_read(&table, &query(1.0)).unwrap();
    assert_eq!(right.window_start, total - 1000);
    assert_eq!(right.window_len, 1000);

    for plan in [&centred, &left, &right] {
        assert!(!plan.is_empty());
        assert!(plan.total_bytes() >= plan.window_bytes().end);
        assert!(plan.requests().iter().all(|r| r.address % 2048 == 0 && r.size % 2048 == 0));
    }
}

#[tokio::test]
async fn out_of_memory_ticks_are_retried_once_the_writer_catches_up() {
    // U = 64, L = 6; largest flush is all six 64-byte tile buffers.
    let config = PyramidConfig {
        unit_size: 64,
        layer_count: 6,
        tiles_per_layer: 128,
        event_queue_depth: 8,
        write_enabled: true,
    };
    let table = LayerTable::new(&config).unwrap();
    let scratch = table.scratch_bytes() as usize;
    let alloc = HeapAllocator::new(scratch + 6 * 64);

    let channel: FlushChannel<NoopRawMutex, HeapBuffer, 8> = Channel::new();
    let mut recorder = Recorder::new(Slicer::new(config, &alloc).unwrap(), &channel).unwrap();
    let storage = MemBlockStorage::new(64, table.recording_size() as usize);
    let mut writer = FlushWriter::new(storage, &alloc);

    let mut retries = 0u32;
    let frame = vec![0u8; table.frame_size() as usize];
    let produce = async {
        for _ in 0..table.tiles_per_layer() {
            loop {
                match recorder.record(&frame).await {
                    Ok(()) => break,
                    Err(TileError::OutOfMemory { .. }) => {
                        retries += 1;
                        yield_now().await;
                    }
                    Err(e) => panic!("unexpected {e}"),
                }
            }
        }
    };
    let ((), stats) = join(produce, writer.drain(&channel)).await;
    let stats = stats.unwrap();

    assert!(retries > 0);
    assert_eq!(stats.bytes, table.recording_size());
    assert_eq!(recorder.slicer().ticks(), table.tiles_per_layer());
    assert_eq!(alloc.used(), scratch);
    assert!(alloc.peak() <= alloc.budget());
}

#[test]
fn full_queue_drops_frames_without_losing_sync() {
    let alloc = HeapAllocator::new(1 << 16);
    let config = PyramidConfig {
        unit_size: 16,
        layer_count: 5,
        tiles_per_layer: 64,
        event_queue_depth: 3,
        write_enabled: true,
    };
    let channel: FlushChannel<NoopRawMutex, HeapBuffer, 4> = Channel::new();
    let mut recorder = Recorder::new(Slicer::new(config, &alloc).unwrap(), &channel).unwrap();

    let mut dropped = 0;
    for _ in 0..10 {
        match recorder.try_record(&[0u8; 16]) {
            Ok(()) => {}
            Err(TileError::QueueFull) => dropped += 1,
            Err(e) => panic!("unexpected {e}"),
        }
    }
    // Layer 4 flushes every tick, so the queue fills after three frames.
    assert_eq!(dropped, 7);
    assert_eq!(recorder.slicer().ticks(), 3);
    let addresses: Vec<u32> = core::iter::from_fn(|| channel.try_receive().ok())
        .map(|d| {
            let a = d.address;
            recorder.slicer().release(d);
            a
        })
        .collect();
    assert_eq!(addresses, [0, 16, 48]);
}
