#![no_main]

use libfuzzer_sys::fuzz_target;
use timewarp::cli::{parse_duration, split_commands};
use timewarp::signals::parse_signal;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // None of the option parsers may panic on any input
        let _ = parse_duration(input);
        let _ = parse_signal(input);

        let args: Vec<String> = input.split(' ').map(str::to_string).collect();
        if let Ok(groups) = split_commands(&args) {
            assert!(groups.iter().all(|g| !g.is_empty()));
        }
    }
});
