//! Exact and perceptual fingerprints for raw image bytes.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage};
use sha2::{Digest, Sha256};

use crate::types::{ContentHash, Fingerprint, MemoryError, MemoryResult, PerceptualHash};

/// Side length of the grayscale image fed to the DCT.
const DCT_SIZE: usize = 32;

/// Side length of the low-frequency block kept from the DCT.
const LOW_FREQ_SIZE: usize = 8;

/// Compute both identities for an encoded image.
pub fn fingerprint(bytes: &[u8]) -> MemoryResult<Fingerprint> {
    let img = decode(bytes)?;
    let (width, height) = img.dimensions();
    Ok(Fingerprint {
        content_hash: content_hash(bytes),
        perceptual_hash: perceptual_hash(&img),
        width,
        height,
    })
}

/// Decode raw bytes, guessing the format from its magic number.
pub fn decode(bytes: &[u8]) -> MemoryResult<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| MemoryError::InvalidImage(e.to_string()))
}

/// Decode a base64 upload into raw image bytes.
pub fn decode_base64(data: &str) -> MemoryResult<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| MemoryError::InvalidImage(format!("Invalid base64: {e}")))
}

/// SHA-256 over the raw bytes.
pub fn content_hash(bytes: &[u8]) -> ContentHash {
    let digest = Sha256::digest(bytes);
    ContentHash::from_hex(format!("{digest:x}"))
}

/// DCT perceptual hash.
///
/// The image is reduced to a 32x32 grayscale square, transformed with a 2-D
/// DCT-II, and the top-left 8x8 block of low frequencies is thresholded
/// against its median. Bits are packed row-major, most significant first.
pub fn perceptual_hash(img: &DynamicImage) -> PerceptualHash {
    let gray = image::imageops::resize(
        &img.to_luma8(),
        DCT_SIZE as u32,
        DCT_SIZE as u32,
        FilterType::Lanczos3,
    );
    let coefficients = low_frequency_dct(&gray);

    let mut sorted = coefficients;
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    let median = (sorted[mid - 1] + sorted[mid]) / 2.0;

    let bits = coefficients
        .iter()
        .fold(0u64, |acc, &c| (acc << 1) | u64::from(c > median));
    PerceptualHash(bits)
}

/// Separable DCT-II, computing only the low-frequency rows and columns.
fn low_frequency_dct(gray: &GrayImage) -> [f64; LOW_FREQ_SIZE * LOW_FREQ_SIZE] {
    let n = DCT_SIZE as f64;
    let mut cosines = [[0.0f64; DCT_SIZE]; LOW_FREQ_SIZE];
    for (k, row) in cosines.iter_mut().enumerate() {
        for (i, c) in row.iter_mut().enumerate() {
            *c = (std::f64::consts::PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n)).cos();
        }
    }

    // Transform along y for every column.
    let mut partial = [[0.0f64; DCT_SIZE]; LOW_FREQ_SIZE];
    for (v, out_row) in partial.iter_mut().enumerate() {
        for (x, out) in out_row.iter_mut().enumerate() {
            *out = (0..DCT_SIZE)
                .map(|y| f64::from(gray.get_pixel(x as u32, y as u32).0[0]) * cosines[v][y])
                .sum();
        }
    }

    let mut result = [0.0f64; LOW_FREQ_SIZE * LOW_FREQ_SIZE];
    for v in 0..LOW_FREQ_SIZE {
        for u in 0..LOW_FREQ_SIZE {
            result[v * LOW_FREQ_SIZE + u] = (0..DCT_SIZE)
                .map(|x| partial[v][x] * cosines[u][x])
                .sum();
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn noise_image(seed: u32, size: u32) -> GrayImage {
        let mut state = seed;
        ImageBuffer::from_fn(size, size, |_, _| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            Luma([(state >> 16) as u8])
        })
    }

    fn encode(img: &GrayImage, format: image::ImageFormat) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(img.clone())
            .write_to(&mut buf, format)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_content_hash_known_vector() {
        assert_eq!(
            content_hash(b"abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_content_hash_sensitive_to_any_bit() {
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let png = encode(&noise_image(7, 64), image::ImageFormat::Png);
        let a = fingerprint(&png).unwrap();
        let b = fingerprint(&png).unwrap();
        assert_eq!(a, b);
        assert_eq!((a.width, a.height), (64, 64));
    }

    #[test]
    fn test_same_pixels_different_encoding() {
        let img = noise_image(42, 32);
        let png = fingerprint(&encode(&img, image::ImageFormat::Png)).unwrap();
        let bmp = fingerprint(&encode(&img, image::ImageFormat::Bmp)).unwrap();
        assert_ne!(png.content_hash, bmp.content_hash);
        assert_eq!(png.perceptual_hash.distance(bmp.perceptual_hash), 0);
    }

    #[test]
    fn test_inverted_image_is_far() {
        let img = noise_image(99, 32);
        let mut inverted = img.clone();
        image::imageops::invert(&mut inverted);
        let a = perceptual_hash(&DynamicImage::ImageLuma8(img));
        let b = perceptual_hash(&DynamicImage::ImageLuma8(inverted));
        assert!(a.distance(b) > 32, "distance {}", a.distance(b));
    }

    #[test]
    fn test_invalid_bytes() {
        let err = fingerprint(b"definitely not an image").unwrap_err();
        assert!(matches!(err, MemoryError::InvalidImage(_)));
    }

    #[test]
    fn test_decode_base64() {
        let png = encode(&noise_image(1, 8), image::ImageFormat::Png);
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(&png);
        assert_eq!(decode_base64(&encoded).unwrap(), png);
        assert!(matches!(
            decode_base64("%%%"),
            Err(MemoryError::InvalidImage(_))
        ));
    }
}
