//! Stateless kernels for Zstandard compression and decompression.
//!
//! Used for the codebook payload of the side artifact and by the in-process
//! reference codec. Every buffer carries its uncompressed length up front so a
//! truncated or mismatched stream is detected on decode. This module is a
//! panic-free wrapper around the `zstd` crate.

use std::io::Write;

use crate::error::GsvqError;

/// Size of the little-endian uncompressed-length header.
const SIZE_HEADER_LEN: usize = 8;
/// Upper bound on the buffer reserved from an untrusted size header.
const MAX_PREALLOCATION: usize = 64 * 1024 * 1024;

/// Compresses `input_bytes` at `level`, prefixing the uncompressed size.
pub fn encode(input_bytes: &[u8], level: i32) -> Result<Vec<u8>, GsvqError> {
    if input_bytes.is_empty() {
        return Ok(Vec::new());
    }

    let mut output_buf = Vec::with_capacity(input_bytes.len() / 2 + SIZE_HEADER_LEN);
    output_buf.extend_from_slice(&(input_bytes.len() as u64).to_le_bytes());

    let mut encoder = zstd::stream::Encoder::new(&mut output_buf, level)
        .map_err(|e| GsvqError::ZstdError(e.to_string()))?;
    encoder
        .write_all(input_bytes)
        .map_err(|e| GsvqError::ZstdError(e.to_string()))?;
    // `finish` is essential to finalize the Zstd frame.
    encoder
        .finish()
        .map_err(|e| GsvqError::ZstdError(e.to_string()))?;

    Ok(output_buf)
}

/// Reverses `encode`, checking the decompressed size against the header.
pub fn decode(input_bytes: &[u8]) -> Result<Vec<u8>, GsvqError> {
    if input_bytes.is_empty() {
        return Ok(Vec::new());
    }
    if input_bytes.len() < SIZE_HEADER_LEN {
        return Err(GsvqError::ZstdError(
            "Input stream too short to contain size header.".to_string(),
        ));
    }

    let (len_bytes, compressed_data) = input_bytes.split_at(SIZE_HEADER_LEN);
    let mut len_buf = [0u8; SIZE_HEADER_LEN];
    len_buf.copy_from_slice(len_bytes);
    let uncompressed_len = u64::from_le_bytes(len_buf) as usize;

    let mut decompressed_data = Vec::with_capacity(uncompressed_len.min(MAX_PREALLOCATION));
    zstd::stream::copy_decode(compressed_data, &mut decompressed_data)
        .map_err(|e| GsvqError::ZstdError(e.to_string()))?;

    if decompressed_data.len() != uncompressed_len {
        return Err(GsvqError::ZstdError(format!(
            "Decompressed size does not match header. Expected {}, got {}.",
            uncompressed_len,
            decompressed_data.len()
        )));
    }

    Ok(decompressed_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zstd_roundtrip_float_payload() {
        let values: Vec<f32> = (0..1024).map(|i| (i % 7) as f32 * 0.25).collect();
        let original_bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();

        let compressed_bytes = encode(&original_bytes, 3).unwrap();
        assert!(compressed_bytes.len() < original_bytes.len());

        let decompressed_bytes = decode(&compressed_bytes).unwrap();
        assert_eq!(original_bytes, decompressed_bytes);
    }

    #[test]
    fn test_zstd_empty_input_is_empty_output() {
        assert!(encode(&[], 3).unwrap().is_empty());
        assert!(decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_zstd_decompress_invalid_data() {
        let result = decode(&[1, 2, 3, 4, 5]);
        assert!(matches!(result, Err(GsvqError::ZstdError(_))));

        let mut valid = encode(&[42u8; 100], 1).unwrap();
        // Claim a different uncompressed length.
        valid[0] = 99;
        assert!(matches!(decode(&valid), Err(GsvqError::ZstdError(_))));
    }
}
