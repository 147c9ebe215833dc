#![no_main]

use hilvan::log_capture::LogRecord;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // This should not panic regardless of input
    let _ = LogRecord::decode(data);
});
