#![no_main]
use libfuzzer_sys::fuzz_target;
use sluice_sdp::{MediaKind, SessionDescription};

fuzz_target!(|data: &[u8]| {
    let text = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(_) => return,
    };
    if let Ok(sdp) = SessionDescription::parse(text) {
        // Rewrites over arbitrary valid input must stay panic-free.
        let steered = sdp
            .with_connection_address("198.51.100.1")
            .with_media_port(MediaKind::Audio, 35000);
        let _ = steered.to_body();
    }
});
