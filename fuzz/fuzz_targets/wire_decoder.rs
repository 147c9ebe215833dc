#![no_main]

use hilvan::wire;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoding must reject malformed input without panicking, and anything
    // it accepts must re-encode to the same bytes
    if let Ok(frames) = wire::decode(data) {
        let encoded = wire::encode(&frames).expect("decoded frames re-encode");
        assert_eq!(encoded, data);
    }
});
