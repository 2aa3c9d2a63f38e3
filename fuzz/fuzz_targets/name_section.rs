#![no_main]

use libfuzzer_sys::fuzz_target;
use rastreo::symbols::{check_compatibility, parse_function_names, InstrVersion};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must decode to a result, never a panic
    let _ = parse_function_names(data);
    let _ = check_compatibility(data, InstrVersion::CURRENT);
});
