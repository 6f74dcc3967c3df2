#![no_main]
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use sluice_parse::{parse_response, serialize_response};

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let bytes = Bytes::copy_from_slice(data);
    if let Some(response) = parse_response(&bytes) {
        let _ = serialize_response(&response);
    }
});
