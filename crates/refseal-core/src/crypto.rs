//! Cryptographic wrapper for refseal
//!
//! Signature algebra is an external capability: this module wraps k256
//! ECDSA verification and an externally-resolved fingerprint keyring into
//! the single verify contract used by the rest of the engine. Lookup
//! failures and malformed signatures verify as false, never as success.

use std::collections::BTreeMap;
use std::path::Path;

use k256::ecdsa::{
    signature::{Signer, Verifier},
    Signature as K256Signature, SigningKey, VerifyingKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::types::{hex_bytes_33, KeyId, Signature};

/// Compressed public key (33 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "hex_bytes_33")] pub [u8; 33]);

impl PublicKey {
    /// Create a new PublicKey from compressed bytes
    pub fn new(bytes: [u8; 33]) -> Self {
        Self(bytes)
    }

    /// Get the compressed bytes
    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Create from hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 33];
        hex::decode_to_slice(s.trim(), &mut bytes).map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Compute the KeyId (SHA256 hash of the compressed key)
    pub fn key_id(&self) -> KeyId {
        KeyId::new(sha256(&self.0))
    }

    /// Verify a signature over `message` against this public key
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let verifying_key = VerifyingKey::from_sec1_bytes(&self.0)
            .map_err(|e| Error::Crypto(format!("invalid public key: {}", e)))?;

        let sig = K256Signature::from_slice(signature.as_bytes())
            .map_err(|e| Error::Crypto(format!("invalid signature format: {}", e)))?;

        verifying_key
            .verify(message, &sig)
            .map_err(|_| Error::Crypto("signature verification failed".to_string()))
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Secret signing key (32 bytes), zeroized on drop
///
/// Only the CLI glue and tests ever hold one of these; the engine proper
/// verifies and never signs.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    /// Create from raw scalar bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self> {
        // Reject scalars k256 cannot load so sign() cannot fail later
        SigningKey::from_bytes(&bytes.into())
            .map_err(|e| Error::Crypto(format!("invalid secret key: {}", e)))?;
        Ok(Self(bytes))
    }

    /// Create from hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes).map_err(|e| Error::Crypto(e.to_string()))?;
        Self::from_bytes(bytes)
    }

    /// Load from a file containing the hex-encoded scalar
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_hex(&content)
    }

    /// Generate a fresh random key
    pub fn generate<R: k256::elliptic_curve::rand_core::CryptoRngCore>(rng: &mut R) -> Self {
        let signing_key = SigningKey::random(rng);
        Self(signing_key.to_bytes().into())
    }

    /// Derive the compressed public key
    pub fn public_key(&self) -> Result<PublicKey> {
        let signing_key = SigningKey::from_bytes(&self.0.into())
            .map_err(|e| Error::Crypto(format!("invalid secret key: {}", e)))?;
        let encoded = signing_key.verifying_key().to_sec1_bytes();
        let bytes: [u8; 33] = encoded
            .as_ref()
            .try_into()
            .map_err(|_| Error::Crypto("unexpected public key encoding".to_string()))?;
        Ok(PublicKey::new(bytes))
    }

    /// KeyId of the corresponding public key
    pub fn key_id(&self) -> Result<KeyId> {
        Ok(self.public_key()?.key_id())
    }

    /// Sign `message` with this key
    pub fn sign(&self, message: &[u8]) -> Result<Signature> {
        let signing_key = SigningKey::from_bytes(&self.0.into())
            .map_err(|e| Error::Crypto(format!("invalid secret key: {}", e)))?;
        let sig: K256Signature = signing_key.sign(message);
        let bytes: [u8; 64] = sig
            .to_bytes()
            .as_slice()
            .try_into()
            .map_err(|_| Error::Crypto("unexpected signature encoding".to_string()))?;
        Ok(Signature::new(bytes))
    }

    /// Hex encoding of the secret scalar, for key files
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Keyring resolving externally-issued credential fingerprints to keys
///
/// Analogous to a GPG keyring: entries are registered out of band and
/// looked up by fingerprint string at verification time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Keyring {
    /// Fingerprint -> public key
    pub entries: BTreeMap<String, PublicKey>,
}

impl Keyring {
    /// Create an empty keyring
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fingerprint
    pub fn add(&mut self, fingerprint: impl Into<String>, key: PublicKey) {
        self.entries.insert(fingerprint.into(), key);
    }

    /// Resolve a fingerprint to its key, if registered
    pub fn resolve(&self, fingerprint: &str) -> Option<&PublicKey> {
        self.entries.get(fingerprint)
    }

    /// Load from a JSON file; a missing file is an empty keyring
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save to a JSON file (atomic temp-file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

/// Hash data using SHA256
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash multiple pieces of data using SHA256
pub fn sha256_multi(data: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for d in data {
        hasher.update(d);
    }
    hasher.finalize().into()
}
