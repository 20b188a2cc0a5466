#![no_main]

use libfuzzer_sys::fuzz_target;
use refseal_rsl::RslEntry;

fuzz_target!(|data: &[u8]| {
    if let Ok(entry) = serde_json::from_slice::<RslEntry>(data) {
        // Payload and chain hash derivation must not panic
        if let Ok(payload) = entry.payload() {
            assert!(!payload.is_empty());
        }
        let _ = entry.entry_hash();

        // Chain checks on arbitrary entries must error, never panic
        let _ = entry.check_chain(None);
        let _ = entry.check_chain(Some(&entry));

        // Round-trip through JSON
        let reserialized = serde_json::to_vec(&entry).unwrap();
        let entry2: RslEntry = serde_json::from_slice(&reserialized).unwrap();
        assert_eq!(entry, entry2);
    }
});
