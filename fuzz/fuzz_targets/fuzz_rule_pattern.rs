#![no_main]

use libfuzzer_sys::fuzz_target;
use refseal_core::pattern::RulePattern;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(pattern) = RulePattern::parse(s) {
            // Display form must re-parse to the same pattern
            let reparsed = RulePattern::parse(&pattern.to_string()).unwrap();
            assert_eq!(reparsed, pattern);

            // Matching must not panic on arbitrary candidates
            let _ = pattern.matches_ref(s);
            let _ = pattern.matches_path(s);
        }
    }
});
