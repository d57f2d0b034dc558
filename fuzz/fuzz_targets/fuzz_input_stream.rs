#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use strand_proto::InputStream;

mod utils;

// The first byte picks the sequence of reads; the rest is the stream.
fuzz_target!(|data: &[u8]| {
    let data = utils::capped(data);
    let Some((&ops, rest)) = data.split_first() else {
        return;
    };
    let mut stream = InputStream::new(Bytes::copy_from_slice(rest));
    for shift in 0..4 {
        let before = stream.remaining();
        let result = match (ops >> (shift * 2)) & 0b11 {
            0 => stream.read_size().map(drop),
            1 => stream.read_string().map(drop),
            2 => stream.read_blob().map(drop),
            _ => stream.read_i32().map(drop),
        };
        assert!(stream.remaining() <= before);
        if result.is_err() {
            break;
        }
    }
});
