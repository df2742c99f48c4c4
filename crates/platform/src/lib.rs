//! Collaborator abstractions for the tile waveform engine
//!
//! The engine (`tilewave` crate) needs exactly two things from the system it
//! runs on: somewhere to get aligned buffers from, and somewhere to put
//! bytes. This crate defines those seams and their host implementations.
//!
//! ```text
//! Application (xtask simulate / firmware recorder task)
//!         ↓
//! tilewave (pyramid, slicer, address translation, read planning)
//!         ↓
//! platform (this crate - BlockStorage, AlignedAllocator)
//!         ↓
//! NorFlash / SDMMC driver, memory pool
//! ```
//!
//! # Features
//!
//! - `std`: host implementations ([`storage_local`], [`HeapAllocator`], [`mocks`])
//! - `defmt`: `defmt::Format` derives for on-target logging

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
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::print_stdout)] // prefer tracing/defmt over println! in lib code
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(async_fn_in_trait)] // Embassy no_std: single-threaded, Send bounds not needed

pub mod memory;
pub mod mocks;
pub mod storage;
#[cfg(any(test, feature = "std"))]
pub mod storage_local;

pub use memory::{AlignedAllocator, AllocError};
#[cfg(any(test, feature = "std"))]
pub use memory::{HeapAllocator, HeapBuffer};
pub use storage::{is_unit_aligned, BlockStorage, NorFlashStorage, NorFlashStorageError};
