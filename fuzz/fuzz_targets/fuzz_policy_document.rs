#![no_main]

use libfuzzer_sys::fuzz_target;
use refseal_policy::PolicyDocument;

fuzz_target!(|data: &[u8]| {
    if let Ok(document) = serde_json::from_slice::<PolicyDocument>(data) {
        // Validation should reject or accept, never panic
        if document.validate().is_ok() {
            // A valid document keeps every rule's threshold satisfiable
            for rule in &document.rules {
                assert!(rule.threshold >= 1);
                assert!(rule.threshold as usize <= rule.authorized.len());
            }
        }

        // Round-trip through JSON
        let reserialized = serde_json::to_vec(&document).unwrap();
        let document2: PolicyDocument = serde_json::from_slice(&reserialized).unwrap();
        assert_eq!(document, document2);
    }
});
