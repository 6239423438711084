use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::DynamicImage;
use img_hash::HasherConfig;
use sha2::{Digest, Sha256};

/// Hex SHA-256 of the raw bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Gradient hash of a 64px thumbnail, `hash_size` x `hash_size` bits, base64 encoded.
///
/// Returns `None` if the thumbnail cannot be handed to the hasher.
pub fn perceptual_hash(img: &DynamicImage, hash_size: u32) -> Option<String> {
    // thumbnail() preserves aspect ratio and is much cheaper than hashing full size
    let thumbnail = img.thumbnail(64, 64);

    let hasher = HasherConfig::new()
        .hash_size(hash_size, hash_size)
        .to_hasher();

    // img_hash is built against an older image crate; convert via raw pixels
    let rgba = thumbnail.to_rgba8();
    let (width, height) = rgba.dimensions();
    let img_hash_image = img_hash::image::RgbaImage::from_raw(width, height, rgba.into_raw())?;

    let hash = hasher.hash_image(&img_hash::image::DynamicImage::ImageRgba8(img_hash_image));
    Some(BASE64.encode(hash.as_bytes()))
}

pub fn decode_hash(hash: &str) -> Option<Vec<u8>> {
    BASE64.decode(hash).ok()
}

/// Bitwise Hamming distance. Hashes of different lengths never match.
pub fn hamming_distance(a: &[u8], b: &[u8]) -> u32 {
    if a.len() != b.len() {
        return u32::MAX;
    }
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}
