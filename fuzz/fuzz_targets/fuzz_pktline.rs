//! Fuzz target for pkt-line parsing.
//!
//! The reader must reject malformed framing with an error, never a panic,
//! and every frame it accepts must encode back to the bytes it came from.

#![no_main]

use gitway_git::{PktLine, PktLineReader};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let mut reader = PktLineReader::new(Cursor::new(data));
    let mut consumed = 0usize;

    // Bounded so crafted input cannot spin forever.
    for _ in 0..100 {
        match reader.read() {
            Ok(Some(pkt)) => {
                let encoded = pkt.encode().expect("decoded frame re-encodes");
                // Length prefixes may use either hex case.
                assert!(data[consumed..consumed + encoded.len()].eq_ignore_ascii_case(&encoded));
                consumed += encoded.len();
                if let PktLine::Data(payload) = pkt {
                    assert!(payload.len() <= gitway_git::pktline::MAX_DATA_LEN);
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
});
