//! Principals, key material, and the unified verify contract
//!
//! A principal is an identity holding one or more keys. Key material comes
//! in two forms: a raw asymmetric key carried inline, or a fingerprint
//! resolved through an external keyring. Both verify through the same
//! fail-closed contract.

use serde::{Deserialize, Serialize};

use crate::crypto::{sha256_multi, Keyring, PublicKey};
use crate::types::{KeyId, Signature};

/// Key material, in one of the two supported reference forms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum KeyMaterial {
    /// Raw compressed asymmetric key carried inline
    Raw { public_key: PublicKey },

    /// Externally-issued credential, resolved by fingerprint at verify time
    Fingerprint { fingerprint: String },
}

/// A public key reference with its derived ID
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// Derived identifier (hash of the material)
    pub id: KeyId,

    /// The key material itself
    pub material: KeyMaterial,
}

impl Key {
    /// Wrap a raw public key
    pub fn from_public_key(public_key: PublicKey) -> Self {
        Self {
            id: public_key.key_id(),
            material: KeyMaterial::Raw { public_key },
        }
    }

    /// Wrap an external fingerprint reference
    pub fn from_fingerprint(fingerprint: impl Into<String>) -> Self {
        let fingerprint = fingerprint.into();
        let id = KeyId::new(sha256_multi(&[b"fingerprint:", fingerprint.as_bytes()]));
        Self {
            id,
            material: KeyMaterial::Fingerprint { fingerprint },
        }
    }
}

/// An identity with one or more associated public keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Unique ID within the owning document
    pub id: String,

    /// Associated keys
    pub keys: Vec<Key>,
}

impl Principal {
    /// Create a principal with a single key
    pub fn new(id: impl Into<String>, key: Key) -> Self {
        Self {
            id: id.into(),
            keys: vec![key],
        }
    }

    /// Add a key if not already present
    pub fn add_key(&mut self, key: Key) {
        if !self.keys.iter().any(|k| k.id == key.id) {
            self.keys.push(key);
        }
    }

    /// Remove a key by ID
    pub fn remove_key(&mut self, key_id: &KeyId) {
        self.keys.retain(|k| &k.id != key_id);
    }

    /// Whether this principal holds the given key
    pub fn holds_key(&self, key_id: &KeyId) -> bool {
        self.keys.iter().any(|k| &k.id == key_id)
    }
}

/// The verify capability: `verify(key, message, signature) -> bool`
///
/// Wraps the two key-material forms behind one contract. Any lookup
/// failure or malformed signature yields false; errors never escape as
/// success.
#[derive(Debug, Clone, Default)]
pub struct SignatureVerifier {
    keyring: Keyring,
}

impl SignatureVerifier {
    /// Verifier with no external keyring (raw keys only)
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifier resolving fingerprints through the given keyring
    pub fn with_keyring(keyring: Keyring) -> Self {
        Self { keyring }
    }

    /// Verify `signature` over `message` for the given key
    pub fn verify(&self, key: &Key, message: &[u8], signature: &Signature) -> bool {
        let public_key = match &key.material {
            KeyMaterial::Raw { public_key } => *public_key,
            KeyMaterial::Fingerprint { fingerprint } => match self.keyring.resolve(fingerprint) {
                Some(pk) => *pk,
                None => return false,
            },
        };
        public_key.verify(message, signature).is_ok()
    }

    /// Verify against any of a principal's keys
    pub fn verify_principal(
        &self,
        principal: &Principal,
        message: &[u8],
        signature: &Signature,
    ) -> bool {
        principal
            .keys
            .iter()
            .any(|key| self.verify(key, message, signature))
    }

    /// Find the key (by ID) among a principal's keys that verifies
    pub fn verifying_key_id(
        &self,
        principal: &Principal,
        message: &[u8],
        signature: &Signature,
    ) -> Option<KeyId> {
        principal
            .keys
            .iter()
            .find(|key| self.verify(key, message, signature))
            .map(|key| key.id)
    }
}
