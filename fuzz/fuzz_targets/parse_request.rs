#![no_main]
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use sluice_parse::{parse_request, serialize_request};

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let bytes = Bytes::copy_from_slice(data);
    if let Some(request) = parse_request(&bytes) {
        // Whatever parses must serialize without panicking.
        let _ = serialize_request(&request);
    }
});
