//! Property-based tests for refseal-core using proptest
//!
//! These tests verify invariants that should hold for all valid inputs.

use proptest::prelude::*;
use refseal_core::{
    pattern::RulePattern,
    principal::{Key, KeyMaterial, Principal},
    types::{KeyId, ObjectId, Signature},
    MemStore, RecordStore,
};

// ============================================
// Arbitrary Implementations
// ============================================

fn arb_object_id() -> impl Strategy<Value = ObjectId> {
    any::<[u8; 32]>().prop_map(ObjectId::new)
}

fn arb_key_id() -> impl Strategy<Value = KeyId> {
    any::<[u8; 32]>().prop_map(KeyId::new)
}

fn arb_signature() -> impl Strategy<Value = Signature> {
    any::<[u8; 64]>().prop_map(Signature::new)
}

fn arb_key() -> impl Strategy<Value = Key> {
    prop_oneof![
        "[A-F0-9]{8,40}".prop_map(Key::from_fingerprint),
        arb_key_id().prop_map(|id| Key {
            id,
            material: KeyMaterial::Fingerprint {
                fingerprint: id.to_hex(),
            },
        }),
    ]
}

fn arb_principal() -> impl Strategy<Value = Principal> {
    ("[a-zA-Z][a-zA-Z0-9-]{0,20}", prop::collection::vec(arb_key(), 1..4)).prop_map(
        |(id, keys)| {
            let mut iter = keys.into_iter();
            let first = iter.next().expect("at least one key");
            let mut principal = Principal::new(id, first);
            for key in iter {
                principal.add_key(key);
            }
            principal
        },
    )
}

// ============================================
// Serialization round-trips
// ============================================

proptest! {
    #[test]
    fn prop_object_id_hex_roundtrip(id in arb_object_id()) {
        let hex = id.to_hex();
        prop_assert_eq!(ObjectId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn prop_signature_serde_roundtrip(sig in arb_signature()) {
        let json = serde_json::to_string(&sig).unwrap();
        let recovered: Signature = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(recovered, sig);
    }

    #[test]
    fn prop_principal_serde_roundtrip(principal in arb_principal()) {
        let json = serde_json::to_string(&principal).unwrap();
        let recovered: Principal = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(recovered, principal);
    }

    #[test]
    fn prop_principal_holds_all_its_keys(principal in arb_principal()) {
        for key in &principal.keys {
            prop_assert!(principal.holds_key(&key.id));
        }
    }
}

// ============================================
// Content addressing
// ============================================

proptest! {
    #[test]
    fn prop_store_put_is_idempotent_and_content_addressed(
        bytes in prop::collection::vec(any::<u8>(), 0..512)
    ) {
        let store = MemStore::new();
        let first = store.put(&bytes).unwrap();
        let second = store.put(&bytes).unwrap();
        prop_assert_eq!(first, second);
        prop_assert_eq!(store.get(&first).unwrap(), bytes);
    }

    #[test]
    fn prop_distinct_content_distinct_address(
        a in prop::collection::vec(any::<u8>(), 0..128),
        b in prop::collection::vec(any::<u8>(), 0..128),
    ) {
        prop_assume!(a != b);
        let store = MemStore::new();
        prop_assert_ne!(store.put(&a).unwrap(), store.put(&b).unwrap());
    }
}

// ============================================
// Pattern parsing
// ============================================

proptest! {
    #[test]
    fn prop_pattern_display_roundtrip(glob in "[a-z/*][a-z0-9/*.-]{0,30}") {
        for scheme in ["ref", "path"] {
            let raw = format!("{}:{}", scheme, glob);
            if let Ok(pattern) = RulePattern::parse(&raw) {
                let reparsed = RulePattern::parse(&pattern.to_string()).unwrap();
                prop_assert_eq!(reparsed, pattern);
            }
        }
    }

    #[test]
    fn prop_schemes_never_cross_match(name in "[a-z][a-z0-9/.-]{0,30}") {
        let ref_pattern = RulePattern::parse(&format!("ref:{}", name)).unwrap();
        let path_pattern = RulePattern::parse(&format!("path:{}", name)).unwrap();
        prop_assert!(!ref_pattern.matches_path(&name));
        prop_assert!(!path_pattern.matches_ref(&name));
    }
}
