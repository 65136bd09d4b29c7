#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_relay::utils::compression::{compress, decompress, zstd_reader};
use std::io::Read;

fuzz_target!(|data: &[u8]| {
    let compressed = compress(data);
    assert_eq!(decompress(&compressed).ok().as_deref(), Some(data));

    // Claimed sizes in malformed input must be bounded
    let _ = decompress(data);

    if let Ok(dec) = zstd_reader(data) {
        let mut out = Vec::new();
        let _ = dec.take(1 << 20).read_to_end(&mut out);
    }
});
