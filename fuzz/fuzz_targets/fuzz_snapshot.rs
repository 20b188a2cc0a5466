#![no_main]

use libfuzzer_sys::fuzz_target;
use refseal_core::snapshot::Snapshot;

fuzz_target!(|data: &[u8]| {
    if let Ok(snapshot) = serde_json::from_slice::<Snapshot>(data) {
        // Payload derivation and diffing must not panic
        let _ = snapshot.payload();
        let changed = snapshot.changed_paths(None);
        assert_eq!(changed.len(), snapshot.files.len());
        let _ = snapshot.changed_paths(Some(&snapshot));
    }
});
