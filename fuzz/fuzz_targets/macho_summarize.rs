#![no_main]
use libfuzzer_sys::fuzz_target;

use machscope::DecodeConfig;

fuzz_target!(|data: &[u8]| {
    let _ = machscope::analysis::summarize_bytes(data, &DecodeConfig::default());
});
