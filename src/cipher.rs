//! Authenticated encryption of incident narratives.
//!
//! Reports are padded to a fixed block multiple so ciphertext length does not
//! fingerprint the narrative, then sealed with XChaCha20-Poly1305 under a
//! fresh random 192-bit nonce. The payload header (version, algorithm, key id)
//! is bound as associated data.

use crate::auth::Authorized;
use crate::codec::{EncryptedPayload, ALG_XCHACHA20_POLY1305, NONCE_LEN};
use crate::error::ReportError;
use crate::token::IdempotencyToken;
use blake2::digest::{consts::U32, Digest};
use blake2::Blake2b;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Report key length in bytes.
pub const KEY_LEN: usize = 32;

const LEN_PREFIX: usize = 4;
const SUBKEY_DOMAIN: &[u8] = b"INCIDENT_LEDGER_TOKEN_SUBKEY_V1";

/// Errors raised by key providers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("key I/O error: {0}")]
    /// Underlying filesystem failure.
    Io(String),
    #[error("key decode error: {0}")]
    /// Hex or base64 decoding failure.
    Decode(String),
    #[error("unexpected key length: {0}")]
    /// Key material had the wrong length.
    InvalidLength(usize),
    #[error("unknown report key id {0:08x}")]
    /// No key is held for the requested identifier.
    UnknownKey(u32),
}

/// Symmetric key protecting report narratives.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ReportKey {
    id: u32,
    bytes: [u8; KEY_LEN],
}

impl ReportKey {
    /// Wraps key bytes, deriving the key id from a SHA-256 fingerprint.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let digest = Sha256::digest(bytes);
        let id = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        Self { id, bytes }
    }

    /// Parses a hex-encoded key.
    pub fn from_hex(input: &str) -> Result<Self, KeyError> {
        let decoded = Zeroizing::new(
            hex::decode(input.trim()).map_err(|err| KeyError::Decode(err.to_string()))?,
        );
        let bytes: [u8; KEY_LEN] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidLength(decoded.len()))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Non-secret key identifier carried in every payload.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Hex encoding of the key material, for export to a key file.
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.bytes))
    }

    fn token_subkey(&self) -> Zeroizing<[u8; 32]> {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(SUBKEY_DOMAIN);
        hasher.update(self.bytes);
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&hasher.finalize());
        out
    }
}

impl fmt::Debug for ReportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReportKey(id={:08x})", self.id)
    }
}

/// External key-management collaborator.
///
/// The core never generates or stores long-term keys; it asks the provider
/// for the active key when encrypting and for a key by id when decrypting.
pub trait KeyProvider: Send + Sync {
    /// Key used for new submissions.
    fn active_key(&self) -> Result<ReportKey, KeyError>;

    /// Key previously used under `key_id`.
    fn key_by_id(&self, key_id: u32) -> Result<ReportKey, KeyError>;
}

/// Key provider holding a fixed set of keys in memory.
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    active: u32,
    keys: HashMap<u32, ReportKey>,
}

impl StaticKeyProvider {
    /// Provider with a single active key.
    pub fn new(active: ReportKey) -> Self {
        let id = active.id();
        let mut keys = HashMap::new();
        keys.insert(id, active);
        Self { active: id, keys }
    }

    /// Adds a retired key that can still decrypt older reports.
    pub fn with_retired(mut self, key: ReportKey) -> Self {
        self.keys.entry(key.id()).or_insert(key);
        self
    }

    /// Loads a single hex key from a file.
    pub fn from_hex_file(path: &Path) -> Result<Self, KeyError> {
        let contents =
            Zeroizing::new(fs::read_to_string(path).map_err(|err| KeyError::Io(err.to_string()))?);
        Ok(Self::new(ReportKey::from_hex(&contents)?))
    }
}

impl KeyProvider for StaticKeyProvider {
    fn active_key(&self) -> Result<ReportKey, KeyError> {
        self.keys
            .get(&self.active)
            .cloned()
            .ok_or(KeyError::UnknownKey(self.active))
    }

    fn key_by_id(&self, key_id: u32) -> Result<ReportKey, KeyError> {
        self.keys
            .get(&key_id)
            .cloned()
            .ok_or(KeyError::UnknownKey(key_id))
    }
}

/// Seals and opens report payloads.
#[derive(Debug, Clone)]
pub struct ReportCipher {
    pad_block: usize,
}

impl ReportCipher {
    /// Cipher padding plaintext to multiples of `pad_block` bytes.
    pub fn new(pad_block: usize) -> Self {
        Self {
            pad_block: pad_block.max(1),
        }
    }

    fn pad(&self, plaintext: &str) -> Zeroizing<Vec<u8>> {
        let body = plaintext.as_bytes();
        let used = LEN_PREFIX + body.len();
        let total = used.div_ceil(self.pad_block) * self.pad_block;
        let mut out = Zeroizing::new(Vec::with_capacity(total));
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        out.resize(total, 0);
        out
    }

    /// Idempotency token for `plaintext` under `key`.
    pub fn token_for(&self, plaintext: &str, key: &ReportKey) -> IdempotencyToken {
        let padded = self.pad(plaintext);
        IdempotencyToken::derive(&key.token_subkey(), key.id(), &padded)
    }

    /// Encrypts a report under a fresh random nonce.
    pub fn encrypt(
        &self,
        plaintext: &str,
        key: &ReportKey,
    ) -> Result<EncryptedPayload, ReportError> {
        let padded = self.pad(plaintext);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let mut payload = EncryptedPayload {
            algorithm: ALG_XCHACHA20_POLY1305,
            key_id: key.id(),
            nonce,
            ciphertext: Vec::new(),
        };
        let aead = XChaCha20Poly1305::new(Key::from_slice(&key.bytes));
        payload.ciphertext = aead
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &padded,
                    aad: &payload.associated_data(),
                },
            )
            .map_err(|_| ReportError::Validation("report could not be encrypted".into()))?;
        Ok(payload)
    }

    /// Decrypts a payload for a caller the authorization policy has approved.
    ///
    /// Fails with [`ReportError::IntegrityViolation`] when the tag does not
    /// verify or the header names a different key; no partial plaintext is
    /// ever returned.
    pub fn decrypt(
        &self,
        payload: &EncryptedPayload,
        _authorized: &Authorized,
        key: &ReportKey,
    ) -> Result<String, ReportError> {
        if payload.key_id != key.id() {
            return Err(ReportError::IntegrityViolation);
        }
        let aead = XChaCha20Poly1305::new(Key::from_slice(&key.bytes));
        let padded = Zeroizing::new(
            aead.decrypt(
                XNonce::from_slice(&payload.nonce),
                Payload {
                    msg: &payload.ciphertext,
                    aad: &payload.associated_data(),
                },
            )
            .map_err(|_| ReportError::IntegrityViolation)?,
        );
        unpad(&padded)
    }
}

fn unpad(padded: &[u8]) -> Result<String, ReportError> {
    if padded.len() < LEN_PREFIX {
        return Err(ReportError::MalformedRecord("padding header missing".into()));
    }
    let len = u32::from_be_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
    let body = padded
        .get(LEN_PREFIX..LEN_PREFIX + len)
        .ok_or_else(|| ReportError::MalformedRecord("padding length out of range".into()))?;
    String::from_utf8(body.to_vec())
        .map_err(|_| ReportError::MalformedRecord("report is not valid UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authorized;
    use crate::codec::{decode, encode};
    use proptest::prelude::*;

    fn key(byte: u8) -> ReportKey {
        ReportKey::from_bytes([byte; KEY_LEN])
    }

    #[test]
    fn roundtrip_and_fresh_nonces() {
        let cipher = ReportCipher::new(256);
        let k = key(3);
        let a = cipher.encrypt("theft at warehouse 4", &k).unwrap();
        let b = cipher.encrypt("theft at warehouse 4", &k).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
        let ok = Authorized::for_tests();
        assert_eq!(cipher.decrypt(&a, &ok, &k).unwrap(), "theft at warehouse 4");
    }

    #[test]
    fn ciphertext_length_is_padded() {
        let cipher = ReportCipher::new(256);
        let k = key(3);
        let short = cipher.encrypt("a", &k).unwrap();
        let longer = cipher.encrypt(&"b".repeat(200), &k).unwrap();
        assert_eq!(short.ciphertext.len(), longer.ciphertext.len());
        assert_eq!(short.ciphertext.len(), 256 + crate::codec::TAG_LEN);
    }

    #[test]
    fn wrong_key_is_integrity_failure() {
        let cipher = ReportCipher::new(64);
        let payload = cipher.encrypt("report", &key(1)).unwrap();
        let mut forged = key(2);
        forged.id = payload.key_id;
        let result = cipher.decrypt(&payload, &Authorized::for_tests(), &forged);
        assert_eq!(result, Err(ReportError::IntegrityViolation));
    }

    #[test]
    fn header_is_authenticated() {
        let cipher = ReportCipher::new(64);
        let k = key(5);
        let mut payload = cipher.encrypt("report", &k).unwrap();
        payload.nonce[0] ^= 1;
        assert_eq!(
            cipher.decrypt(&payload, &Authorized::for_tests(), &k),
            Err(ReportError::IntegrityViolation)
        );
    }

    #[test]
    fn provider_serves_retired_keys() {
        let provider = StaticKeyProvider::new(key(1)).with_retired(key(2));
        assert_eq!(provider.active_key().unwrap().id(), key(1).id());
        assert_eq!(provider.key_by_id(key(2).id()).unwrap().id(), key(2).id());
        assert_eq!(
            provider.key_by_id(0).unwrap_err(),
            KeyError::UnknownKey(0)
        );
        assert!(ReportKey::from_hex("abcd").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn body_bit_flip_is_integrity_violation(text in ".{1,200}", bit in 0usize..8192) {
            let cipher = ReportCipher::new(128);
            let k = key(9);
            let mut bytes = encode(&cipher.encrypt(&text, &k).unwrap());
            // nonce starts after version, algorithm and key id
            let nonce_at = 6;
            let len_field = nonce_at + NONCE_LEN..nonce_at + NONCE_LEN + 4;
            let mut bit = nonce_at * 8 + bit % ((bytes.len() - nonce_at) * 8);
            if len_field.contains(&(bit / 8)) {
                bit += 32;
            }
            bytes[bit / 8] ^= 1 << (bit % 8);
            let payload = decode(&bytes).unwrap();
            prop_assert_eq!(
                cipher.decrypt(&payload, &Authorized::for_tests(), &k),
                Err(ReportError::IntegrityViolation)
            );
        }

        #[test]
        fn header_bit_flip_is_rejected(text in ".{1,200}", bit in 0usize..48) {
            let cipher = ReportCipher::new(128);
            let k = key(9);
            let mut bytes = encode(&cipher.encrypt(&text, &k).unwrap());
            bytes[bit / 8] ^= 1 << (bit % 8);
            let outcome = decode(&bytes)
                .map_err(ReportError::from)
                .and_then(|payload| cipher.decrypt(&payload, &Authorized::for_tests(), &k));
            if bit < 16 {
                // version and algorithm bytes
                prop_assert!(matches!(outcome, Err(ReportError::MalformedRecord(_))));
            } else {
                prop_assert_eq!(outcome, Err(ReportError::IntegrityViolation));
            }
        }

        #[test]
        fn padded_roundtrip(text in ".{0,300}") {
            let cipher = ReportCipher::new(256);
            let k = key(4);
            let payload = cipher.encrypt(&text, &k).unwrap();
            prop_assert_eq!(cipher.decrypt(&payload, &Authorized::for_tests(), &k).unwrap(), text);
        }
    }
}
