#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_relay::replay::pcap2::Pcap2Reader;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let Ok(mut reader) = Pcap2Reader::new(Cursor::new(data.to_vec())) else {
        return;
    };
    for _ in 0..256 {
        match reader.read_record() {
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    let _ = reader.read_back();
});
