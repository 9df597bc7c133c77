//! Decryption authorization: ed25519 signed grants checked against an allowlist.
//!
//! A grant names one report, an expiry, and the grantee key, signed by that
//! key. [`GrantPolicy`] admits a grant when the key is allowlisted and not
//! revoked, the grant names the requested report, it has not expired, and the
//! signature verifies.

use crate::codec::ReportId;
use crate::error::ReportError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use zeroize::Zeroizing;

/// Domain tag prefixed to every signed grant message.
pub const GRANT_DOMAIN: &[u8] = b"incident-ledger.grant.v1";

/// Credential presented to decrypt a specific report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecryptionAuthorization {
    /// Report the grant applies to.
    pub report_id: String,
    /// Base64 ed25519 public key of the grant holder.
    pub public_key: String,
    /// Unix seconds after which the grant is void (0 = no expiry).
    pub expires_at: u64,
    /// Base64 ed25519 signature over [`signing_message`].
    pub signature: String,
}

/// Canonical bytes signed by a grant.
pub fn signing_message(report_id: &str, expires_at: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(GRANT_DOMAIN.len() + report_id.len() + 9);
    msg.extend_from_slice(GRANT_DOMAIN);
    msg.extend_from_slice(report_id.as_bytes());
    msg.push(0);
    msg.extend_from_slice(&expires_at.to_le_bytes());
    msg
}

/// Why an authorization was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Key or signature could not be decoded.
    Malformed,
    /// Key is not on the allowlist.
    UnknownKey,
    /// Key has been revoked.
    Revoked,
    /// Grant names a different report.
    WrongReport,
    /// Grant has expired.
    Expired,
    /// Signature did not verify.
    BadSignature,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Malformed => "malformed credential",
            Self::UnknownKey => "key not authorized",
            Self::Revoked => "key revoked",
            Self::WrongReport => "grant does not cover this report",
            Self::Expired => "grant expired",
            Self::BadSignature => "signature verification failed",
        };
        f.write_str(text)
    }
}

/// Policy seam consulted before any decryption.
pub trait AuthorizationPolicy: Send + Sync {
    /// Approves or refuses `authorization` for `report_id`.
    fn check(
        &self,
        report_id: &ReportId,
        authorization: &DecryptionAuthorization,
    ) -> Result<(), DenyReason>;
}

/// Proof that a policy approved decryption of one report.
///
/// Only [`authorize`] constructs it, so the cipher cannot be asked to decrypt
/// without a policy decision.
#[derive(Debug)]
pub struct Authorized {
    report_id: Option<ReportId>,
}

impl Authorized {
    /// Report the approval covers.
    pub fn report_id(&self) -> Option<&ReportId> {
        self.report_id.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self { report_id: None }
    }
}

/// Runs `policy` and converts a refusal into [`ReportError::AuthorizationDenied`].
pub fn authorize(
    policy: &dyn AuthorizationPolicy,
    report_id: &ReportId,
    authorization: &DecryptionAuthorization,
) -> Result<Authorized, ReportError> {
    policy
        .check(report_id, authorization)
        .map_err(|reason| ReportError::AuthorizationDenied(reason.to_string()))?;
    Ok(Authorized {
        report_id: Some(report_id.clone()),
    })
}

/// Allowlist-backed grant policy.
#[derive(Debug, Clone)]
pub struct GrantPolicy {
    allowed: HashSet<[u8; 32]>,
    revoked: HashSet<[u8; 32]>,
    clock: fn() -> u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AllowListFile {
    allowed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    revoked: Vec<String>,
}

/// Errors surfaced while loading an allowlist.
#[derive(Debug, Clone, Error)]
pub enum PolicyError {
    #[error("policy I/O error: {0}")]
    /// Filesystem failure.
    Io(String),
    #[error("policy parse error: {0}")]
    /// JSON or key decoding failure.
    Parse(String),
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl GrantPolicy {
    /// Policy admitting the given keys.
    pub fn new(allowed: impl IntoIterator<Item = VerifyingKey>) -> Self {
        Self {
            allowed: allowed.into_iter().map(|k| k.to_bytes()).collect(),
            revoked: HashSet::new(),
            clock: unix_now,
        }
    }

    /// Overrides the clock used for expiry checks.
    pub fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = clock;
        self
    }

    /// Revokes a key; grants it signed are refused from now on.
    pub fn revoke(&mut self, key: &VerifyingKey) {
        self.revoked.insert(key.to_bytes());
    }

    /// Loads `{ "allowed": [...], "revoked": [...] }` with base64 keys.
    pub fn from_allowlist_path(path: &Path) -> Result<Self, PolicyError> {
        let contents = fs::read_to_string(path).map_err(|err| PolicyError::Io(err.to_string()))?;
        let parsed: AllowListFile =
            serde_json::from_str(&contents).map_err(|err| PolicyError::Parse(err.to_string()))?;
        let decode_all = |entries: &[String]| -> Result<HashSet<[u8; 32]>, PolicyError> {
            entries
                .iter()
                .map(|entry| {
                    decode_public_key_base64(entry)
                        .map(|k| k.to_bytes())
                        .map_err(|err| PolicyError::Parse(err.to_string()))
                })
                .collect()
        };
        Ok(Self {
            allowed: decode_all(&parsed.allowed)?,
            revoked: decode_all(&parsed.revoked)?,
            clock: unix_now,
        })
    }

    /// Adds `key` to the allowlist file at `path`, creating it if missing.
    pub fn append_to_allowlist(path: &Path, key: &VerifyingKey) -> Result<(), PolicyError> {
        let mut file = match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str::<AllowListFile>(&contents)
                .map_err(|err| PolicyError::Parse(err.to_string()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => AllowListFile::default(),
            Err(err) => return Err(PolicyError::Io(err.to_string())),
        };
        let encoded = encode_public_key_base64(key);
        if !file.allowed.contains(&encoded) {
            file.allowed.push(encoded);
        }
        let data =
            serde_json::to_vec_pretty(&file).map_err(|err| PolicyError::Parse(err.to_string()))?;
        fs::write(path, data).map_err(|err| PolicyError::Io(err.to_string()))
    }
}

impl AuthorizationPolicy for GrantPolicy {
    fn check(
        &self,
        report_id: &ReportId,
        authorization: &DecryptionAuthorization,
    ) -> Result<(), DenyReason> {
        let key = decode_public_key_base64(&authorization.public_key)
            .map_err(|_| DenyReason::Malformed)?;
        let key_bytes = key.to_bytes();
        if self.revoked.contains(&key_bytes) {
            return Err(DenyReason::Revoked);
        }
        if !self.allowed.contains(&key_bytes) {
            return Err(DenyReason::UnknownKey);
        }
        if authorization.report_id != report_id.as_str() {
            return Err(DenyReason::WrongReport);
        }
        if authorization.expires_at != 0 && authorization.expires_at <= (self.clock)() {
            return Err(DenyReason::Expired);
        }
        let signature = decode_signature_base64(&authorization.signature)
            .map_err(|_| DenyReason::Malformed)?;
        let message = signing_message(&authorization.report_id, authorization.expires_at);
        key.verify(&message, &signature)
            .map_err(|_| DenyReason::BadSignature)
    }
}

/// Describes how an ed25519 grant key should be obtained.
#[derive(Debug, Clone)]
pub enum Ed25519KeySource {
    /// Deterministic key derived from an `ed25519://` seed string.
    Seed(String),
    /// Load the secret key material from the provided file path.
    File(PathBuf),
    /// Freshly generated random key.
    Random,
}

impl Ed25519KeySource {
    /// Parses a `--key` argument into a concrete key source.
    pub fn from_spec(spec: Option<&str>) -> Self {
        match spec {
            Some(value) if value.starts_with("ed25519://") => {
                Self::Seed(value.trim_start_matches("ed25519://").to_string())
            }
            Some(value) if !value.is_empty() => Self::File(PathBuf::from(value)),
            _ => Self::Random,
        }
    }
}

/// Errors reported while loading or decoding key material.
#[derive(Debug, Clone, Error)]
pub enum SigningKeyError {
    #[error("key I/O error: {0}")]
    /// Underlying filesystem failure.
    Io(String),
    #[error("key decode error: {0}")]
    /// Base64, hex, or ed25519 parsing failure.
    Decode(String),
    #[error("unexpected key length: {0}")]
    /// Buffer did not match the expected secret-key length.
    InvalidLength(usize),
}

/// Loads or derives a signing key according to `source`.
pub fn load_signing_key(source: &Ed25519KeySource) -> Result<SigningKey, SigningKeyError> {
    let secret = match source {
        Ed25519KeySource::Seed(seed) => derive_key_from_seed(seed),
        Ed25519KeySource::File(path) => load_key_from_file(path)?,
        Ed25519KeySource::Random => Zeroizing::new(SigningKey::generate(&mut OsRng).to_bytes()),
    };
    Ok(SigningKey::from_bytes(&secret))
}

fn derive_key_from_seed(seed: &str) -> Zeroizing<[u8; SECRET_KEY_LENGTH]> {
    let digest = Sha512::digest(seed.as_bytes());
    let mut secret = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
    secret.copy_from_slice(&digest[..SECRET_KEY_LENGTH]);
    secret
}

fn load_key_from_file(path: &Path) -> Result<Zeroizing<[u8; SECRET_KEY_LENGTH]>, SigningKeyError> {
    let contents = Zeroizing::new(fs::read(path).map_err(|err| SigningKeyError::Io(err.to_string()))?);
    if contents.len() == SECRET_KEY_LENGTH {
        return bytes_to_secret(&contents);
    }
    let text = std::str::from_utf8(&contents)
        .map_err(|err| SigningKeyError::Decode(err.to_string()))?
        .trim();
    if text.len() == SECRET_KEY_LENGTH * 2 && text.chars().all(|c| c.is_ascii_hexdigit()) {
        let decoded =
            Zeroizing::new(hex::decode(text).map_err(|err| SigningKeyError::Decode(err.to_string()))?);
        return bytes_to_secret(&decoded);
    }
    let decoded = Zeroizing::new(
        BASE64
            .decode(text)
            .map_err(|err| SigningKeyError::Decode(err.to_string()))?,
    );
    bytes_to_secret(&decoded)
}

fn bytes_to_secret(bytes: &[u8]) -> Result<Zeroizing<[u8; SECRET_KEY_LENGTH]>, SigningKeyError> {
    if bytes.len() != SECRET_KEY_LENGTH {
        return Err(SigningKeyError::InvalidLength(bytes.len()));
    }
    let mut secret = Zeroizing::new([0u8; SECRET_KEY_LENGTH]);
    secret.copy_from_slice(bytes);
    Ok(secret)
}

/// Encodes a public key as base64.
pub fn encode_public_key_base64(verifying: &VerifyingKey) -> String {
    BASE64.encode(verifying.to_bytes())
}

/// Decodes a base64 public key.
pub fn decode_public_key_base64(input: &str) -> Result<VerifyingKey, SigningKeyError> {
    let bytes = BASE64
        .decode(input.trim())
        .map_err(|err| SigningKeyError::Decode(err.to_string()))?;
    VerifyingKey::try_from(bytes.as_slice()).map_err(|err| SigningKeyError::Decode(err.to_string()))
}

fn decode_signature_base64(input: &str) -> Result<Signature, SigningKeyError> {
    let bytes = BASE64
        .decode(input.trim())
        .map_err(|err| SigningKeyError::Decode(err.to_string()))?;
    Signature::from_slice(&bytes).map_err(|err| SigningKeyError::Decode(err.to_string()))
}

/// Issues signed grants from a key holder's signing key.
pub struct GrantIssuer {
    signing: SigningKey,
}

impl GrantIssuer {
    /// Issuer backed by `signing`.
    pub fn new(signing: SigningKey) -> Self {
        Self { signing }
    }

    /// Verifying key to place on the allowlist.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Signs a grant for `report_id` valid until `expires_at` (0 = no expiry).
    pub fn issue(&self, report_id: &ReportId, expires_at: u64) -> DecryptionAuthorization {
        let message = signing_message(report_id.as_str(), expires_at);
        let signature = self.signing.sign(&message);
        DecryptionAuthorization {
            report_id: report_id.to_string(),
            public_key: encode_public_key_base64(&self.verifying_key()),
            expires_at,
            signature: BASE64.encode(signature.to_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn issuer(seed: &str) -> GrantIssuer {
        let key = load_signing_key(&Ed25519KeySource::from_spec(Some(&format!("ed25519://{seed}"))))
            .unwrap();
        GrantIssuer::new(key)
    }

    fn id(value: &str) -> ReportId {
        ReportId::new(value).unwrap()
    }

    fn fixed_clock() -> u64 {
        1_000
    }

    #[test]
    fn valid_grant_is_accepted() {
        let holder = issuer("investigator");
        let policy = GrantPolicy::new([holder.verifying_key()]);
        let grant = holder.issue(&id("R1"), 0);
        assert!(authorize(&policy, &id("R1"), &grant).is_ok());
    }

    #[test]
    fn refusals_are_typed() {
        let holder = issuer("investigator");
        let stranger = issuer("stranger");
        let mut policy = GrantPolicy::new([holder.verifying_key()]).with_clock(fixed_clock);

        assert_eq!(
            policy.check(&id("R1"), &stranger.issue(&id("R1"), 0)),
            Err(DenyReason::UnknownKey)
        );
        assert_eq!(
            policy.check(&id("R2"), &holder.issue(&id("R1"), 0)),
            Err(DenyReason::WrongReport)
        );
        assert_eq!(
            policy.check(&id("R1"), &holder.issue(&id("R1"), 999)),
            Err(DenyReason::Expired)
        );
        assert!(policy.check(&id("R1"), &holder.issue(&id("R1"), 1_001)).is_ok());

        let mut forged = holder.issue(&id("R1"), 5_000);
        forged.expires_at = 0;
        assert_eq!(policy.check(&id("R1"), &forged), Err(DenyReason::BadSignature));

        policy.revoke(&holder.verifying_key());
        assert_eq!(
            policy.check(&id("R1"), &holder.issue(&id("R1"), 0)),
            Err(DenyReason::Revoked)
        );
    }

    #[test]
    fn denial_message_does_not_echo_credentials() {
        let holder = issuer("investigator");
        let policy = GrantPolicy::new(Vec::new());
        let grant = holder.issue(&id("R1"), 0);
        let err = authorize(&policy, &id("R1"), &grant).unwrap_err();
        let text = err.to_string();
        assert!(matches!(err, ReportError::AuthorizationDenied(_)));
        assert!(!text.contains(&grant.signature));
        assert!(!text.contains(&grant.public_key));
    }

    #[test]
    fn allowlist_file_roundtrip() {
        let mut path = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        path.push(format!("incident_allowlist_{nanos}.json"));
        let holder = issuer("investigator");
        GrantPolicy::append_to_allowlist(&path, &holder.verifying_key()).unwrap();
        GrantPolicy::append_to_allowlist(&path, &holder.verifying_key()).unwrap();
        let policy = GrantPolicy::from_allowlist_path(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(policy.allowed.len(), 1);
        assert!(policy.check(&id("R3"), &holder.issue(&id("R3"), 0)).is_ok());
    }

    #[test]
    fn seed_keys_are_deterministic() {
        assert_eq!(
            issuer("a").verifying_key().to_bytes(),
            issuer("a").verifying_key().to_bytes()
        );
        assert_ne!(
            issuer("a").verifying_key().to_bytes(),
            issuer("b").verifying_key().to_bytes()
        );
    }
}
