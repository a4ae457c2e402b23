#![no_main]

use libfuzzer_sys::fuzz_target;
use ptsentry::proto::{read_frame, Message};
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    // Collector side: arbitrary bytes must never panic the decoder
    let mut cursor = Cursor::new(data);
    while let Ok(payload) = read_frame(&mut cursor) {
        let _ = Message::decode(&payload);
    }
});
