#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use packet_relay::core::codec::{Frame, FrameCodec};
use packet_relay::core::pool::PacketPool;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let pool = PacketPool::standard();
    let mut codec = FrameCodec::with_max_frame_size(1 << 20);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        let packet = pool.decode_lossy(&frame);
        let _ = pool.encode(&packet);
    }

    if let Ok(frame) = Frame::from_bytes(data) {
        let _ = pool.decode(&frame);
    }
});
