//! Block storage abstraction for the recording medium.
//!
//! Flash and SD media only accept I/O in fixed-size, aligned units. The
//! engine never asks for anything else: every address it produces is a
//! multiple of the configured unit size, and every buffer length is a whole
//! number of units. Implementations may rely on that and reject the rest.
//!
//! There is no file-system layer here. An address is a plain byte offset
//! from the start of the medium (or of the file backing it on the host).

use embedded_storage_async::nor_flash::NorFlash;

/// Byte-addressed storage accessed in whole, aligned I/O units.
pub trait BlockStorage {
    /// Error type
    type Error: core::fmt::Debug;

    /// Write `data` starting at byte `address`.
    fn write(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> impl core::future::Future<Output = Result<(), Self::Error>>;

    /// Fill `dest` with the bytes starting at byte `address`.
    fn read(
        &mut self,
        address: u32,
        dest: &mut [u8],
    ) -> impl core::future::Future<Output = Result<(), Self::Error>>;
}

impl<T: BlockStorage> BlockStorage for &mut T {
    type Error = T::Error;

    async fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error> {
        (**self).write(address, data).await
    }

    async fn read(&mut self, address: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        (**self).read(address, dest).await
    }
}

/// `true` when `address` and `len` are both whole multiples of `unit`.
///
/// `unit` must be a power of two; zero is never aligned.
#[must_use]
pub fn is_unit_aligned(address: u32, len: usize, unit: u32) -> bool {
    if unit == 0 || !unit.is_power_of_two() {
        return false;
    }
    let mask = unit.wrapping_sub(1);
    // usize -> u64 is lossless on every supported target.
    let len_mask = u64::from(mask);
    address & mask == 0 && (len as u64) & len_mask == 0
}

// ---------------------------------------------------------------------------
// NorFlash adapter
// ---------------------------------------------------------------------------

/// [`BlockStorage`] over any async [`NorFlash`] device.
///
/// Erasing is the owner's responsibility: the adapter issues plain program
/// and read operations at the addresses it is given, so the target range must
/// already be erased (or the medium must not need it, as with SD cards behind
/// a flash translation layer).
pub struct NorFlashStorage<F> {
    flash: F,
    base: u32,
}

impl<F: NorFlash> NorFlashStorage<F> {
    /// Wrap `flash`, placing storage address 0 at device offset `base`.
    pub fn new(flash: F, base: u32) -> Self {
        Self { flash, base }
    }

    /// Release the wrapped device.
    pub fn into_inner(self) -> F {
        self.flash
    }

    fn device_offset(&self, address: u32) -> Result<u32, NorFlashStorageError<F::Error>> {
        self.base
            .checked_add(address)
            .ok_or(NorFlashStorageError::OutOfBounds { address })
    }
}

/// Error from [`NorFlashStorage`].
#[derive(Debug)]
pub enum NorFlashStorageError<E> {
    /// `base + address` does not fit the device address space.
    OutOfBounds {
        /// The storage address that overflowed.
        address: u32,
    },
    /// The flash driver reported an error.
    Flash(E),
}

impl<E: core::fmt::Debug> core::fmt::Display for NorFlashStorageError<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::OutOfBounds { address } => write!(f, "address {address} outside flash window"),
            #[allow(clippy::use_debug)] // driver errors only guarantee Debug
            Self::Flash(e) => write!(f, "flash error: {e:?}"),
        }
    }
}

impl<F: NorFlash> BlockStorage for NorFlashStorage<F> {
    type Error = NorFlashStorageError<F::Error>;

    async fn write(&mut self, address: u32, data: &[u8]) -> Result<(), Self::Error> {
        let offset = self.device_offset(address)?;
        self.flash
            .write(offset, data)
            .await
            .map_err(NorFlashStorageError::Flash)
    }

    async fn read(&mut self, address: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        let offset = self.device_offset(address)?;
        self.flash
            .read(offset, dest)
            .await
            .map_err(NorFlashStorageError::Flash)
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation
)]
mod tests {
    use super::*;
    use embedded_storage_async::nor_flash::{ErrorType, NorFlashErrorKind, ReadNorFlash};

    /// 4 KiB RAM-backed flash with 256-byte program granularity.
    struct RamFlash {
        bytes: Vec<u8>,
    }

    impl ErrorType for RamFlash {
        type Error = NorFlashErrorKind;
    }

    impl ReadNorFlash for RamFlash {
        const READ_SIZE: usize = 1;

        async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            let end = start + bytes.len();
            if end > self.bytes.len() {
                return Err(NorFlashErrorKind::OutOfBounds);
            }
            bytes.copy_from_slice(&self.bytes[start..end]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.bytes.len()
        }
    }

    impl NorFlash for RamFlash {
        const WRITE_SIZE: usize = 256;
        const ERASE_SIZE: usize = 4096;

        async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            self.bytes[from as usize..to as usize].fill(0xFF);
            Ok(())
        }

        async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            let end = start + bytes.len();
            if end > self.bytes.len() {
                return Err(NorFlashErrorKind::OutOfBounds);
            }
            if start % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
                return Err(NorFlashErrorKind::NotAligned);
            }
            self.bytes[start..end].copy_from_slice(bytes);
            Ok(())
        }
    }

    #[test]
    fn unit_alignment_checks_address_and_length() {
        assert!(is_unit_aligned(0, 2048, 2048));
        assert!(is_unit_aligned(4096, 6144, 2048));
        assert!(!is_unit_aligned(100, 2048, 2048));
        assert!(!is_unit_aligned(2048, 100, 2048));
        assert!(!is_unit_aligned(0, 0, 0));
        assert!(!is_unit_aligned(0, 12, 12));
    }

    #[tokio::test]
    async fn nor_flash_adapter_round_trips_at_base_offset() {
        let flash = RamFlash { bytes: vec![0xFF; 4096] };
        let mut storage = NorFlashStorage::new(flash, 1024);
        let data = [0xA5u8; 512];
        storage.write(256, &data).await.unwrap();
        let mut back = [0u8; 512];
        storage.read(256, &mut back).await.unwrap();
        assert_eq!(back, data);

        let flash = storage.into_inner();
        assert_eq!(flash.bytes[1280], 0xA5);
        assert_eq!(flash.bytes[1279], 0xFF);
    }

    #[tokio::test]
    async fn nor_flash_adapter_surfaces_driver_errors() {
        let flash = RamFlash { bytes: vec![0xFF; 4096] };
        let mut storage = NorFlashStorage::new(flash, 0);
        let err = storage.write(0, &[0u8; 100]).await.unwrap_err();
        assert!(matches!(err, NorFlashStorageError::Flash(NorFlashErrorKind::NotAligned)));
    }

    #[tokio::test]
    async fn nor_flash_adapter_rejects_address_overflow() {
        let flash = RamFlash { bytes: vec![0xFF; 4096] };
        let mut storage = NorFlashStorage::new(flash, u32::MAX);
        let mut buf = [0u8; 4];
        let err = storage.read(1, &mut buf).await.unwrap_err();
        assert!(matches!(err, NorFlashStorageError::OutOfBounds { address: 1 }));
    }
}
