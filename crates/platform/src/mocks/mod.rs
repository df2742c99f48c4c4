//! Mock implementations for testing
//!
//! [`MemBlockStorage`] keeps the whole medium in a `Vec<u8>`, enforces the
//! unit alignment rule real flash would, and records every operation so
//! tests can assert on the exact I/O pattern the engine produced.

#![cfg(any(test, feature = "std"))]

extern crate std;

use std::vec;
use std::vec::Vec;

use crate::storage::{is_unit_aligned, BlockStorage};

/// One I/O operation seen by [`MemBlockStorage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageOp {
    /// `write(address, len)`
    Write {
        /// Byte address
        address: u32,
        /// Length in bytes
        len: usize,
    },
    /// `read(address, len)`
    Read {
        /// Byte address
        address: u32,
        /// Length in bytes
        len: usize,
    },
}

/// Error returned by [`MemBlockStorage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemStorageError {
    /// Address or length is not a whole number of units.
    Misaligned {
        /// Byte address of the rejected operation
        address: u32,
        /// Length of the rejected operation
        len: usize,
    },
    /// The operation runs past the configured capacity.
    OutOfBounds {
        /// Byte address of the rejected operation
        address: u32,
        /// Length of the rejected operation
        len: usize,
    },
    /// Injected by [`MemBlockStorage::fail_next`].
    Injected,
}

impl core::fmt::Display for MemStorageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Misaligned { address, len } => {
                write!(f, "misaligned I/O: {len} bytes at {address}")
            }
            Self::OutOfBounds { address, len } => {
                write!(f, "I/O out of bounds: {len} bytes at {address}")
            }
            Self::Injected => f.write_str("injected failure"),
        }
    }
}

/// In-memory block storage
pub struct MemBlockStorage {
    unit: u32,
    bytes: Vec<u8>,
    ops: Vec<StorageOp>,
    written: Vec<bool>,
    fail_next: bool,
}

impl MemBlockStorage {
    /// Create a zero-filled medium of `capacity` bytes with I/O unit `unit`.
    #[must_use]
    pub fn new(unit: u32, capacity: usize) -> Self {
        let units = capacity.checked_div(unit as usize).unwrap_or(0);
        Self {
            unit,
            bytes: vec![0u8; capacity],
            ops: Vec::new(),
            written: vec![false; units],
            fail_next: false,
        }
    }

    /// Raw contents
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Every operation so far, in call order
    pub fn ops(&self) -> &[StorageOp] {
        &self.ops
    }

    /// Forget the recorded operations (contents are kept).
    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    /// Number of units written at least once.
    pub fn units_written(&self) -> usize {
        self.written.iter().filter(|&&w| w).count()
    }

    /// `true` if the unit at `index` has been written.
    pub fn unit_written(&self, index: usize) -> bool {
        self.written.get(index).copied().unwrap_or(false)
    }

    /// Make the next operation fail with [`MemStorageError::Injected`].
    pub fn fail_next(&mut self) {
        self.fail_next = true;
    }

    fn check(&mut self, address: u32, len: usize) -> Result<core::ops::Range<usize>, MemStorageError> {
        if core::mem::take(&mut self.fail_next) {
            return Err(MemStorageError::Injected);
        }
        if !is_unit_aligned(address, len, self.unit) {
            return Err(MemStorageError::Misaligned { address, len });
        }
        let start = address as usize;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(MemStorageError::OutOfBounds { address, len })?;
        Ok(start..end)
    }
}

impl BlockStorage for MemBlockStorage {
    type Error = MemStorageError;

    async fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error> {
        self.ops.push(StorageOp::Write {
            address,
            len: data.len(),
        });
        let range = self.check(address, data.len())?;
        let first = range.start.checked_div(self.unit as usize).unwrap_or(0);
        let count = data.len().checked_div(self.unit as usize).unwrap_or(0);
        if let Some(dst) = self.bytes.get_mut(range) {
            dst.copy_from_slice(data);
        }
        for flag in self.written.iter_mut().skip(first).take(count) {
            *flag = true;
        }
        Ok(())
    }

    async fn read(&mut self, address: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        self.ops.push(StorageOp::Read {
            address,
            len: dest.len(),
        });
        let range = self.check(address, dest.len())?;
        if let Some(src) = self.bytes.get(range) {
            dest.copy_from_slice(src);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_storage_round_trip_and_op_log() {
        let mut storage = MemBlockStorage::new(16, 256);
        storage.write(32, &[9u8; 32]).await.unwrap();
        let mut buf = [0u8; 16];
        storage.read(48, &mut buf).await.unwrap();
        assert_eq!(buf, [9u8; 16]);
        assert_eq!(
            storage.ops(),
            &[
                StorageOp::Write { address: 32, len: 32 },
                StorageOp::Read { address: 48, len: 16 },
            ]
        );
        assert_eq!(storage.units_written(), 2);
        assert!(storage.unit_written(2));
        assert!(!storage.unit_written(4));
    }

    #[tokio::test]
    async fn mem_storage_rejects_misaligned_io() {
        let mut storage = MemBlockStorage::new(16, 256);
        let err = storage.write(8, &[0u8; 16]).await.unwrap_err();
        assert_eq!(err, MemStorageError::Misaligned { address: 8, len: 16 });
        let mut buf = [0u8; 10];
        assert!(storage.read(0, &mut buf).await.is_err());
    }

    #[tokio::test]
    async fn mem_storage_rejects_out_of_bounds() {
        let mut storage = MemBlockStorage::new(16, 64);
        let err = storage.write(48, &[0u8; 32]).await.unwrap_err();
        assert_eq!(err, MemStorageError::OutOfBounds { address: 48, len: 32 });
    }

    #[tokio::test]
    async fn mem_storage_injected_failure_is_one_shot() {
        let mut storage = MemBlockStorage::new(16, 64);
        storage.fail_next();
        assert_eq!(storage.write(0, &[0u8; 16]).await, Err(MemStorageError::Injected));
        assert!(storage.write(0, &[0u8; 16]).await.is_ok());
    }
}
