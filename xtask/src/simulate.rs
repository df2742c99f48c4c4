//! xtask simulate: record a synthetic waveform through the full pipeline
//! into a file, then plan and read one zoom window back.
//!
//! The waveform is a slow sine sweep with a little deterministic noise, so
//! coarse layers show the envelope and fine layers the detail.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use colored::Colorize;
use embassy_futures::block_on;
use embassy_futures::join::join;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use platform::storage_local::LocalBlockStorage;
use platform::{HeapAllocator, HeapBuffer};
use tilewave::{
    plan_zoom_read, read_plan, FlushChannel, FlushWriter, LayerTable, PyramidConfig, Recorder,
    Slicer, WriterStats, ZoomQuery,
};

use crate::layers::load_config;

/// Capacity of the flush channel; `event_queue_depth` may not exceed it.
const CHANNEL_CAPACITY: usize = 16;

#[derive(clap::Args)]
pub struct Args {
    /// Output recording file
    #[arg(long, default_value = "target/simulate.tw")]
    out: PathBuf,
    /// JSON pyramid config (default: a 2 MiB demo recording)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Stop after this many frames and finish with a final flush
    #[arg(long)]
    frames: Option<u32>,
    /// Allocator budget in KiB for scratch and flush buffers
    #[arg(long, default_value_t = 1024)]
    budget_kib: usize,
    /// Zoom factor of the read-back window
    #[arg(long, default_value_t = 16)]
    zoom: u32,
    /// Focus position, 0.0..=1.0
    #[arg(long, default_value_t = 0.5)]
    progress: f64,
    /// Points in the read-back window
    #[arg(long, default_value_t = 320)]
    width: u32,
    /// Bits per point when reading back
    #[arg(long, default_value_t = 32)]
    bits: u32,
}

/// Small enough to simulate in a moment: U = 2048, L = 8, T = 8192.
fn demo_config() -> PyramidConfig {
    PyramidConfig {
        layer_count: 8,
        tiles_per_layer: 8192,
        ..PyramidConfig::default()
    }
}

/// Entry point called from main.rs
pub fn run(args: &Args) -> Result<()> {
    let config = match args.config.as_deref() {
        Some(path) => load_config(Some(path))?,
        None => demo_config(),
    };
    let table = LayerTable::new(&config).map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;
    let frames = args
        .frames
        .map_or(table.tiles_per_layer(), |n| n.clamp(1, table.tiles_per_layer()));

    println!();
    println!("{}", "🌊 Simulating recording...".cyan().bold());
    println!();
    println!(
        "  {} frames of {} bytes → {}",
        frames,
        table.frame_size(),
        args.out.display()
    );

    let start = Instant::now();
    let alloc = HeapAllocator::new(args.budget_kib.saturating_mul(1024));
    let stats = block_on(record(&config, &alloc, &args.out, frames))?;
    println!(
        "{}",
        format!(
            "  ✓ {} flushes, {} bytes in {:.2}s (peak allocator use {} bytes)",
            stats.flushes,
            stats.bytes,
            start.elapsed().as_secs_f64(),
            alloc.peak()
        )
        .green()
    );
    println!();

    let query = ZoomQuery {
        focus_progress: args.progress,
        point_bit_depth: args.bits,
        focus_sample_offset: args.width / 2,
        display_width: args.width,
        zoom_factor: args.zoom,
    };
    read_back(&table, &args.out, &query)
}

async fn record(
    config: &PyramidConfig,
    alloc: &HeapAllocator,
    out: &Path,
    frames: u32,
) -> Result<WriterStats> {
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let storage = LocalBlockStorage::create(out)
        .with_context(|| format!("Failed to create {}", out.display()))?;

    let channel: FlushChannel<NoopRawMutex, HeapBuffer, CHANNEL_CAPACITY> = Channel::new();
    let slicer = Slicer::new(*config, alloc).map_err(|e| anyhow::anyhow!("{e}"))?;
    let mut recorder =
        Recorder::new(slicer, &channel).map_err(|e| anyhow::anyhow!("{e}"))?;
    let mut writer = FlushWriter::new(storage, alloc);

    let frame_size = recorder.slicer().frame_size();
    let produce = async {
        let mut frame = vec![0u8; frame_size];
        for tick in 0..frames {
            synth_frame(&mut frame, tick);
            let result = if tick.saturating_add(1) == frames {
                recorder.finish(&frame).await
            } else {
                recorder.record(&frame).await
            };
            result.map_err(|e| anyhow::anyhow!("frame {tick}: {e}"))?;
        }
        Ok::<(), anyhow::Error>(())
    };

    let (produced, drained) = join(produce, writer.drain(&channel)).await;
    produced?;
    let stats = drained.map_err(|e| anyhow::anyhow!("write failed: {e}"))?;

    let rate = recorder.slicer().rate();
    if let Some(avg) = rate.average() {
        tracing::info!(
            ticks_per_sec = avg,
            samples = rate.samples(),
            "slicing rate"
        );
    }
    let mut storage = writer.into_storage();
    storage.sync().context("Failed to sync recording")?;
    Ok(stats)
}

fn read_back(table: &LayerTable, path: &Path, query: &ZoomQuery) -> Result<()> {
    let plan = plan_zoom_read(table, query).map_err(|e| anyhow::anyhow!("zoom query: {e}"))?;
    println!(
        "{}",
        format!(
            "  Zoom {} → layer {}: points {}..{} in {} read(s), {} bytes",
            query.zoom_factor,
            plan.layer,
            plan.window_start,
            plan.window_start.saturating_add(plan.window_len),
            plan.requests().len(),
            plan.total_bytes()
        )
        .cyan()
    );
    for r in plan.requests() {
        println!(
            "   {}",
            format!("unit {:>6} @ {:>10}  {:>6} bytes", r.unit, r.address, r.size).dimmed()
        );
    }

    let mut storage = LocalBlockStorage::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut dest = vec![0u8; plan.total_bytes()];
    block_on(read_plan(&mut storage, &plan, &mut dest))
        .map_err(|e| anyhow::anyhow!("read failed: {e}"))?;

    let window = dest
        .get(plan.window_bytes())
        .context("window outside read buffer")?;
    if plan.point_size == 4 {
        let (min, max) = window
            .chunks_exact(4)
            .filter_map(|c| c.try_into().ok().map(f32::from_le_bytes))
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });
        println!(
            "{}",
            format!("  ✓ window read: min {min:.4}, max {max:.4}").green()
        );
    } else {
        println!(
            "{}",
            format!("  ✓ window read: {} bytes", window.len()).green()
        );
    }
    println!();
    Ok(())
}

/// Fill `frame` with the samples of tick `tick`.
fn synth_frame(frame: &mut [u8], tick: u32) {
    let samples_per_frame = frame.len() / 4;
    let base = u64::from(tick).saturating_mul(samples_per_frame as u64);
    let mut noise = u32::try_from(base & 0xffff_ffff).unwrap_or(0) | 1;
    for (i, chunk) in frame.chunks_exact_mut(4).enumerate() {
        #[allow(clippy::cast_precision_loss)] // sample index only drives the phase
        let t = base.saturating_add(i as u64) as f32;
        // xorshift32
        noise ^= noise.wrapping_shl(13);
        noise ^= noise.wrapping_shr(17);
        noise ^= noise.wrapping_shl(5);
        #[allow(clippy::cast_precision_loss)]
        let jitter = noise.wrapping_shr(8) as f32 / 16_777_216.0 - 0.5;
        let envelope = (t * 1.0e-5).sin();
        let value = envelope * (t * 0.02).sin() + 0.05 * jitter;
        chunk.copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn short_simulation_writes_and_reads_back() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("sim.tw");
        let config = PyramidConfig {
            unit_size: 64,
            layer_count: 6,
            tiles_per_layer: 128,
            event_queue_depth: 4,
            write_enabled: true,
        };
        let table = LayerTable::new(&config).unwrap();
        let alloc = HeapAllocator::new(64 * 1024);
        let stats = block_on(record(&config, &alloc, &out, 128)).unwrap();
        assert_eq!(stats.bytes, table.recording_size());

        let query = ZoomQuery {
            focus_progress: 0.5,
            point_bit_depth: 32,
            focus_sample_offset: 10,
            display_width: 20,
            zoom_factor: 4,
        };
        read_back(&table, &out, &query).unwrap();
    }

    #[test]
    fn synthetic_samples_stay_in_range() {
        let mut frame = vec![0u8; 256];
        for tick in [0, 1, 999, u32::MAX] {
            synth_frame(&mut frame, tick);
            for c in frame.chunks_exact(4) {
                let v = f32::from_le_bytes(c.try_into().unwrap());
                assert!(v.is_finite() && v.abs() <= 1.1, "{v}");
            }
        }
    }
}
