//! Multi-resolution waveform tiles on block storage
//!
//! Records a continuous `f32` sample stream as a pyramid of layers, each at
//! half the sample density of the one above, onto storage that only takes
//! whole aligned units. Any zoom level and scroll position can then be read
//! back with a handful of aligned reads.
//!
//! ```text
//! frames → Slicer → FlushDescriptor → FlushWriter → BlockStorage
//!                                                        ↑
//! zoom query → plan_zoom_read → unit_address → read_plan ┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: [`PyramidConfig`] and its validation
//! - [`layer`]: [`LayerTable`], the derived per-layer geometry
//! - [`downsample`]: pairwise-mean decimation
//! - [`slicer`]: [`Slicer`], frame ingestion and flush scheduling
//! - [`translate`]: virtual-to-physical unit mapping
//! - [`planner`]: zoom query → aligned read requests
//! - [`pipeline`]: bounded recorder/writer hand-off, plan execution
//! - [`rate`]: tick-rate estimate
//!
//! # Features
//!
//! - `std`: host implementations from `platform`
//! - `defmt`: on-target logging and `defmt::Format` derives
//! - `tracing`: host logging

// ── Lint policy ─────────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)] // no .unwrap() in production code
#![deny(clippy::expect_used)] // no .expect() in production code
#![deny(clippy::panic)] // no panic!() in production code
#![deny(unused_must_use)]
// all Results must be handled
// ────────────────────────────────────────────────────────────────────────────
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(unsafe_code)]
#![warn(clippy::print_stdout)] // prefer tracing/defmt over println! in lib code
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod downsample;
pub mod error;
pub mod layer;
pub mod pipeline;
pub mod planner;
pub mod rate;
pub mod slicer;
pub mod translate;

pub use config::{PyramidConfig, BUFFER_ALIGNMENT, MAX_LAYERS};
pub use error::{ConfigError, PipelineError, TileError};
pub use layer::{Layer, LayerTable};
pub use pipeline::{read_plan, FlushChannel, FlushWriter, Recorder, WriterStats};
pub use planner::{plan_unit_range, plan_zoom_read, ReadPlan, ReadRequest, ZoomQuery, MAX_READ_REQUESTS};
pub use rate::RateEstimator;
pub use slicer::{FlushDescriptor, FlushEntry, FlushKind, Slicer};
pub use translate::{byte_address, unit_address};
