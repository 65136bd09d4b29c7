//! Compression used by the capture format.
//!
//! Version 5 captures LZ4-compress every record payload on its own
//! (size-prepended). Version 4 captures wrap the whole record stream in a
//! single zstd stream; see [`zstd_reader`] and [`zstd_writer`].

use crate::config::MAX_FRAME_SIZE;
use crate::error::{ProxyError, Result};
use std::io::{BufReader, Read, Write};

/// Maximum output size for decompression, aligned with the frame limit
const MAX_DECOMPRESSION_SIZE: usize = MAX_FRAME_SIZE;

/// zstd level used when writing version 4 captures
const ZSTD_LEVEL: i32 = 3;

/// LZ4-compresses one record payload, prepending the uncompressed size
pub fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

/// Decompresses one size-prepended LZ4 record payload
///
/// The claimed output size is checked before anything is allocated.
///
/// # Errors
/// Returns `ProxyError::DecompressionFailure` if decompression fails or the
/// output would exceed the frame limit.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(ProxyError::DecompressionFailure);
    }

    let claimed_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if claimed_size > MAX_DECOMPRESSION_SIZE {
        return Err(ProxyError::DecompressionFailure);
    }

    lz4_flex::decompress_size_prepended(data).map_err(|_| ProxyError::DecompressionFailure)
}

/// Streaming zstd decoder over a whole version 4 record stream.
pub fn zstd_reader<R: Read>(inner: R) -> Result<zstd::stream::Decoder<'static, BufReader<R>>> {
    zstd::stream::Decoder::new(inner).map_err(|_| ProxyError::DecompressionFailure)
}

/// Streaming zstd encoder for writing a version 4 record stream.
pub fn zstd_writer<W: Write>(inner: W) -> Result<zstd::stream::Encoder<'static, W>> {
    zstd::stream::Encoder::new(inner, ZSTD_LEVEL).map_err(|_| ProxyError::CompressionFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_lz4_compression_roundtrip() {
        let original = b"\x00\x00\x00\x3aa level chunk payload with repeated repeated bytes";
        let compressed = compress(original);
        let decompressed = decompress(&compressed).unwrap();
        assert_eq!(original.as_slice(), decompressed.as_slice());
    }

    #[test]
    fn test_lz4_size_limit_enforcement() {
        let claimed_size = (MAX_DECOMPRESSION_SIZE + 1) as u32;
        let mut malicious = claimed_size.to_le_bytes().to_vec();
        malicious.extend_from_slice(&[0u8; 16]);

        let result = decompress(&malicious);
        assert!(matches!(result, Err(ProxyError::DecompressionFailure)));
    }

    #[test]
    fn test_lz4_short_input_rejection() {
        let result = decompress(&[0x2b, 0x60]);
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_compressed_data() {
        let malformed = vec![0x10, 0x00, 0x00, 0x00, 0xff, 0xff, 0xff];
        assert!(decompress(&malformed).is_err());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_zstd_stream_helpers() {
        let mut enc = zstd_writer(Vec::new()).unwrap();
        enc.write_all(b"first").unwrap();
        enc.write_all(b"second").unwrap();
        let bytes = enc.finish().unwrap();

        let mut dec = zstd_reader(bytes.as_slice()).unwrap();
        let mut out = String::new();
        dec.read_to_string(&mut out).unwrap();
        assert_eq!(out, "firstsecond");
    }

    #[test]
    fn test_zstd_reader_rejects_garbage() {
        let mut out = Vec::new();
        let read = zstd_reader(&b"not a zstd stream"[..]).and_then(|mut dec| {
            dec.read_to_end(&mut out)
                .map_err(|_| ProxyError::DecompressionFailure)
        });
        assert!(read.is_err());
    }
}
