//! Pairwise-mean decimation of little-endian `f32` tiles.

use core::num::FpCategory;

/// Bytes per sample.
pub const SAMPLE_BYTES: usize = 4;

/// A mean is kept only if it is a normal number or exactly zero.
fn is_usable(value: f32) -> bool {
    matches!(value.classify(), FpCategory::Normal | FpCategory::Zero)
}

fn read_sample(bytes: &[u8]) -> f32 {
    let mut raw = [0u8; SAMPLE_BYTES];
    if let Some(src) = bytes.get(..SAMPLE_BYTES) {
        raw.copy_from_slice(src);
    }
    f32::from_le_bytes(raw)
}

/// Halve `tile` in place.
///
/// Sample `k` of the first half becomes the mean of samples `2k` and `2k+1`.
/// If a mean is infinite, NaN or subnormal, it and every later sample of the
/// first half are zeroed and `Some(k)` is returned. A tile holding fewer than
/// two samples is left unchanged.
///
/// The second half of `tile` keeps stale input; callers only use the first
/// `tile.len() / 2` bytes afterwards.
pub fn halve_in_place(tile: &mut [u8]) -> Option<usize> {
    let pairs = tile.len().checked_div(2 * SAMPLE_BYTES).unwrap_or(0);
    for k in 0..pairs {
        // Safety: k < pairs, so 2k+1 samples and k samples both lie inside tile.
        #[allow(clippy::arithmetic_side_effects)]
        let (src, dst) = (k * 2 * SAMPLE_BYTES, k * SAMPLE_BYTES);
        let pair = tile.get(src..).unwrap_or_default();
        let a = read_sample(pair);
        let b = read_sample(pair.get(SAMPLE_BYTES..).unwrap_or_default());
        #[allow(clippy::arithmetic_side_effects)] // f32 arithmetic does not panic
        let mean = (a + b) / 2.0;

        if !is_usable(mean) {
            #[allow(clippy::arithmetic_side_effects)] // pairs * SAMPLE_BYTES <= tile.len() / 2
            let end = pairs * SAMPLE_BYTES;
            if let Some(rest) = tile.get_mut(dst..end) {
                rest.fill(0);
            }
            return Some(k);
        }
        // dst <= src: the pair has been read before it can be overwritten.
        if let Some(out) = tile.get_mut(dst..dst.saturating_add(SAMPLE_BYTES)) {
            out.copy_from_slice(&mean.to_le_bytes());
        }
    }
    None
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    clippy::float_cmp
)]
mod tests {
    use super::*;

    fn tile(samples: &[f32]) -> std::vec::Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn samples(bytes: &[u8]) -> std::vec::Vec<f32> {
        bytes
            .chunks_exact(SAMPLE_BYTES)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn pairs_are_averaged_into_the_first_half() {
        let mut t = tile(&[1.0, 3.0, -2.0, 2.0, 10.0, 20.0, 0.5, 0.25]);
        assert_eq!(halve_in_place(&mut t), None);
        assert_eq!(samples(&t[..16]), [2.0, 0.0, 15.0, 0.375]);
    }

    #[test]
    fn overflowing_mean_zeroes_the_rest_of_the_half() {
        let mut t = tile(&[
            4.0,
            6.0,
            f32::MAX,
            f32::MAX,
            1.0,
            1.0,
            8.0,
            8.0,
        ]);
        assert_eq!(halve_in_place(&mut t), Some(1));
        assert_eq!(samples(&t[..16]), [5.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn nan_input_is_rejected() {
        let mut t = tile(&[f32::NAN, 1.0, 2.0, 2.0]);
        assert_eq!(halve_in_place(&mut t), Some(0));
        assert_eq!(samples(&t[..8]), [0.0, 0.0]);
    }

    #[test]
    fn subnormal_mean_is_rejected_but_zero_is_kept() {
        let tiny = f32::MIN_POSITIVE;
        let mut t = tile(&[0.0, 0.0, tiny, 0.0, 3.0, 3.0]);
        assert_eq!(halve_in_place(&mut t), Some(1));
        assert_eq!(samples(&t[..12]), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn short_tiles_are_left_alone() {
        let mut t = tile(&[7.0]);
        assert_eq!(halve_in_place(&mut t), None);
        assert_eq!(samples(&t), [7.0]);

        let mut bytes = [1u8, 2, 3];
        assert_eq!(halve_in_place(&mut bytes), None);
        assert_eq!(bytes, [1, 2, 3]);
    }
}
