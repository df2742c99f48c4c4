//! Criterion benchmarks for the tile engine.
//!
//! Run: cargo bench -p tilewave --bench tilewave
//!
//! Results show:
//!   slice_cycle/*    : one full flush schedule (periodMax ticks) per layer count
//!   unit_address     : translator cost across a whole layer
//!   plan_zoom/*      : read planning per zoom factor
//!   read_window_file : plan + aligned reads of one window from a real file

#![allow(
    clippy::unwrap_used, // benchmark helpers use unwrap for brevity
    clippy::expect_used,
    clippy::panic,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    missing_docs, // criterion_group! macro generates undocumented items
)]

use std::hint::black_box;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use embassy_futures::join::join;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use platform::storage_local::LocalBlockStorage;
use platform::{HeapAllocator, HeapBuffer};
use tempfile::TempDir;
use tilewave::{
    plan_zoom_read, read_plan, unit_address, FlushChannel, FlushWriter, LayerTable, PyramidConfig,
    Recorder, Slicer, ZoomQuery,
};
use tokio::runtime::Builder;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(layer_count: u32, tiles_per_layer: u32) -> PyramidConfig {
    PyramidConfig {
        unit_size: 2048,
        layer_count,
        tiles_per_layer,
        event_queue_depth: 4,
        write_enabled: true,
    }
}

fn waveform(bytes: usize, phase: usize) -> Vec<u8> {
    (0..bytes / 4)
        .flat_map(|i| (((phase + i) as f32) * 0.003).sin().to_le_bytes())
        .collect()
}

/// Record a full pyramid into a temp file and hand back its directory.
fn build_recording(cfg: PyramidConfig) -> (TempDir, std::path::PathBuf) {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("bench.tw");
    let rt = Builder::new_current_thread().enable_all().build().unwrap();
    rt.block_on(async {
        let alloc = HeapAllocator::new(4 << 20);
        let channel: FlushChannel<NoopRawMutex, HeapBuffer, 4> = Channel::new();
        let mut recorder = Recorder::new(Slicer::new(cfg, &alloc).unwrap(), &channel).unwrap();
        let mut writer = FlushWriter::new(LocalBlockStorage::create(&path).unwrap(), &alloc);
        let frame_size = recorder.slicer().frame_size();
        let produce = async {
            for tick in 0..cfg.tiles_per_layer as usize {
                recorder.record(&waveform(frame_size, tick * frame_size)).await.unwrap();
            }
        };
        let ((), stats) = join(produce, writer.drain(&channel)).await;
        stats.unwrap();
        writer.into_storage().sync().unwrap();
    });
    (tmp, path)
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_slice_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("slice_cycle");
    group.measurement_time(Duration::from_secs(10));

    for layer_count in [8u32, 12] {
        let alloc = HeapAllocator::new(16 << 20);
        let mut slicer = Slicer::new(config(layer_count, 1 << 20), &alloc).unwrap();
        let frame = waveform(slicer.frame_size(), 0);
        let ticks = slicer.table().period_max();

        group.bench_with_input(BenchmarkId::new("layers", layer_count), &ticks, |b, &ticks| {
            b.iter(|| {
                for _ in 0..ticks {
                    if let Some(d) = slicer.ingest_frame(black_box(&frame)).unwrap() {
                        slicer.release(d);
                    }
                }
                if slicer.is_closed() {
                    slicer.reset();
                }
            });
        });
    }
    group.finish();
}

fn bench_unit_address(c: &mut Criterion) {
    let table = LayerTable::new(&PyramidConfig::default()).unwrap();
    c.bench_function("unit_address", |b| {
        b.iter(|| {
            let mut acc = 0u32;
            for layer in table.layers() {
                for n in (0..layer.layer_buffer_units).step_by(97) {
                    acc ^= unit_address(&table, layer.index, black_box(n));
                }
            }
            acc
        });
    });
}

fn bench_plan_zoom(c: &mut Criterion) {
    let table = LayerTable::new(&PyramidConfig::default()).unwrap();
    let mut group = c.benchmark_group("plan_zoom");

    for zoom in [1u32, 16, 256, 2048] {
        let query = ZoomQuery {
            focus_progress: 0.37,
            point_bit_depth: 32,
            focus_sample_offset: 200,
            display_width: 400,
            zoom_factor: zoom,
        };
        group.bench_with_input(BenchmarkId::new("zoom", zoom), &query, |b, query| {
            b.iter(|| plan_zoom_read(&table, black_box(query)).unwrap());
        });
    }
    group.finish();
}

fn bench_read_window(c: &mut Criterion) {
    let rt = Builder::new_current_thread().enable_all().build().unwrap();
    let cfg = config(8, 4096);
    let table = LayerTable::new(&cfg).unwrap();
    let (_tmp, path) = build_recording(cfg);

    let query = ZoomQuery {
        focus_progress: 0.5,
        point_bit_depth: 32,
        focus_sample_offset: 400,
        display_width: 800,
        zoom_factor: 4,
    };
    let plan = plan_zoom_read(&table, &query).unwrap();

    c.bench_function("read_window_file", |b| {
        b.to_async(&rt).iter(|| {
            let path = path.clone();
            let plan = plan.clone();
            async move {
                let mut dest = vec![0u8; plan.total_bytes()];
                let mut storage = LocalBlockStorage::open(&path).unwrap();
                read_plan(&mut storage, &plan, &mut dest).await.unwrap()
            }
        });
    });
}

criterion_group!(
    benches,
    bench_slice_cycle,
    bench_unit_address,
    bench_plan_zoom,
    bench_read_window
);
criterion_main!(benches);
