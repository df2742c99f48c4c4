//! End-to-end: synthetic waveform → Recorder → FlushWriter → storage →
//! every unit of every layer read back through the address translator.
//!
//! Runs against the in-memory mock and against a real file.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::arithmetic_side_effects)]
#![allow(clippy::indexing_slicing)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

use embassy_futures::join::join;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use platform::mocks::MemBlockStorage;
use platform::storage_local::LocalBlockStorage;
use platform::{BlockStorage, HeapAllocator, HeapBuffer};
use tempfile::TempDir;
use tilewave::downsample::halve_in_place;
use tilewave::{
    byte_address, plan_zoom_read, read_plan, FlushChannel, FlushWriter, LayerTable,
    PyramidConfig, Recorder, Slicer, ZoomQuery,
};

// U = 64, L = 6: tiles 1..32 bytes, frame = 8 samples, periods 64, 32, 16, 8, 4, 2.
fn config() -> PyramidConfig {
    PyramidConfig {
        unit_size: 64,
        layer_count: 6,
        tiles_per_layer: 256,
        event_queue_depth: 2,
        write_enabled: true,
    }
}

fn frames(table: &LayerTable) -> Vec<Vec<u8>> {
    let samples = table.frame_size() as usize / 4;
    (0..table.tiles_per_layer())
        .map(|tick| {
            (0..samples)
                .flat_map(|i| {
                    let t = (tick as usize * samples + i) as f32;
                    (t * 0.01).sin().to_le_bytes()
                })
                .collect()
        })
        .collect()
}

/// Each layer's byte stream, built tick by tick the way the slicer fills it.
fn expected_layers(table: &LayerTable, frames: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let mut layers = vec![Vec::new(); table.layer_count() as usize];
    for frame in frames {
        let mut work = frame.clone();
        for layer in table.layers().iter().rev() {
            let tile = layer.tile_size as usize;
            layers[layer.index as usize].extend_from_slice(&work[..tile]);
            halve_in_place(&mut work[..tile]);
        }
    }
    layers
}

async fn record<S: BlockStorage>(storage: S, frames: &[Vec<u8>]) -> S {
    let alloc = HeapAllocator::new(64 * 1024);
    let channel: FlushChannel<NoopRawMutex, HeapBuffer, 4> = Channel::new();
    let slicer = Slicer::new(config(), &alloc).unwrap();
    let mut recorder = Recorder::new(slicer, &channel).unwrap();
    let mut writer = FlushWriter::new(storage, &alloc);

    let produce = async {
        for frame in frames {
            recorder.record(frame).await.unwrap();
        }
    };
    let ((), stats) = join(produce, writer.drain(&channel)).await;
    let stats = stats.unwrap();

    let table = recorder.slicer().table();
    assert_eq!(stats.bytes, table.recording_size());
    assert!(recorder.slicer().is_closed());
    writer.into_storage()
}

async fn verify<S: BlockStorage>(storage: &mut S, table: &LayerTable, expected: &[Vec<u8>]) {
    let u = table.unit_size() as usize;
    let mut unit = vec![0u8; u];
    for layer in table.layers() {
        let stream = &expected[layer.index as usize];
        assert_eq!(stream.len(), layer.layer_buffer_size as usize);
        for n in 0..layer.layer_buffer_units {
            let address = byte_address(table, layer.index, n);
            storage.read(address, &mut unit).await.unwrap();
            let start = n as usize * u;
            assert_eq!(
                unit.as_slice(),
                &stream[start..start + u],
                "layer {} unit {n} at {address}",
                layer.index
            );
        }
    }
}

#[tokio::test]
async fn every_unit_reads_back_from_memory() {
    let table = LayerTable::new(&config()).unwrap();
    let frames = frames(&table);
    let expected = expected_layers(&table, &frames);
    let capacity = table.recording_size() as usize;

    let mut storage = record(MemBlockStorage::new(64, capacity), &frames).await;
    assert_eq!(storage.units_written(), capacity / 64);
    verify(&mut storage, &table, &expected).await;
}

#[tokio::test]
async fn every_unit_reads_back_from_a_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("waveform.tw");
    let table = LayerTable::new(&config()).unwrap();
    let frames = frames(&table);
    let expected = expected_layers(&table, &frames);

    let mut storage = record(LocalBlockStorage::create(&path).unwrap(), &frames).await;
    storage.sync().unwrap();
    assert_eq!(storage.size_bytes().unwrap(), table.recording_size());

    let mut reopened = LocalBlockStorage::open(&path).unwrap();
    verify(&mut reopened, &table, &expected).await;
}

#[tokio::test]
async fn zoom_window_matches_the_layer_stream() {
    let table = LayerTable::new(&config()).unwrap();
    let frames = frames(&table);
    let expected = expected_layers(&table, &frames);
    let mut storage =
        record(MemBlockStorage::new(64, table.recording_size() as usize), &frames).await;

    for (zoom, progress, focus, width) in [(32, 0.5, 20, 40), (8, 0.0, 0, 100), (4, 0.93, 70, 90)] {
        let query = ZoomQuery {
            focus_progress: progress,
            point_bit_depth: 32,
            focus_sample_offset: focus,
            display_width: width,
            zoom_factor: zoom,
        };
        let plan = plan_zoom_read(&table, &query).unwrap();
        let mut dest = vec![0u8; plan.total_bytes()];
        read_plan(&mut storage, &plan, &mut dest).await.unwrap();

        let stream = &expected[plan.layer as usize];
        let start = plan.window_start as usize * 4;
        let window = &dest[plan.window_bytes()];
        assert_eq!(window, &stream[start..start + window.len()], "zoom {zoom}");
    }
}
