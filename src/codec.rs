//! Storage encoding for encrypted report payloads and ledger records.
//!
//! Payload layout (all integers big-endian):
//!
//! ```text
//! version (1) | algorithm (1) | key_id (4) | nonce (24) | ct_len (4) | ciphertext||tag
//! ```
//!
//! Records travel between the ledger and the core as `incident-ledger.report.v1`
//! JSON documents carrying the payload bytes in base64. The record schema is the
//! only durable external format and carries no sender field.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Current payload layout version.
pub const PAYLOAD_VERSION: u8 = 1;
/// Algorithm identifier for XChaCha20-Poly1305.
pub const ALG_XCHACHA20_POLY1305: u8 = 1;
/// Nonce length carried in the payload header.
pub const NONCE_LEN: usize = 24;
/// Authentication tag length appended to the ciphertext.
pub const TAG_LEN: usize = 16;
/// Schema identifier embedded in every record document.
pub const SCHEMA_REPORT: &str = "incident-ledger.report.v1";

const HEADER_LEN: usize = 1 + 1 + 4 + NONCE_LEN + 4;
const MAX_REPORT_ID_LEN: usize = 128;

/// Errors produced while decoding payloads or records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("payload truncated: need {needed} bytes, have {actual}")]
    /// Input shorter than the fixed header or the declared ciphertext.
    Truncated {
        /// Minimum byte count required.
        needed: usize,
        /// Bytes available.
        actual: usize,
    },
    #[error("unsupported payload version {0}")]
    /// Unknown layout version tag.
    UnsupportedVersion(u8),
    #[error("unsupported algorithm {0}")]
    /// Unknown algorithm identifier.
    UnsupportedAlgorithm(u8),
    #[error("length mismatch: declared {declared}, actual {actual}")]
    /// Trailing bytes after the declared ciphertext.
    LengthMismatch {
        /// Ciphertext length declared in the header.
        declared: usize,
        /// Ciphertext bytes present.
        actual: usize,
    },
    #[error("invalid schema: expected {expected}, found {found}")]
    /// Record schema identifier did not match.
    InvalidSchema {
        /// Expected schema identifier.
        expected: &'static str,
        /// Encountered schema identifier.
        found: String,
    },
    #[error("invalid report id: {0}")]
    /// Report identifier empty, too long, or not printable ASCII.
    InvalidReportId(String),
    #[error("decode error: {0}")]
    /// JSON or base64 decoding failed.
    Decode(String),
}

/// Ledger-assigned report identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReportId(String);

impl ReportId {
    /// Validates and wraps an identifier.
    pub fn new(value: impl Into<String>) -> Result<Self, CodecError> {
        let value = value.into();
        if value.is_empty()
            || value.len() > MAX_REPORT_ID_LEN
            || !value.bytes().all(|b| b.is_ascii_graphic())
        {
            return Err(CodecError::InvalidReportId(value));
        }
        Ok(Self(value))
    }

    /// Borrowed string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ReportId {
    type Error = CodecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ReportId> for String {
    fn from(id: ReportId) -> Self {
        id.0
    }
}

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ReportId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.trim())
    }
}

/// Ciphertext plus the non-secret metadata needed to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// Algorithm identifier.
    pub algorithm: u8,
    /// Identifier of the report key used for encryption.
    pub key_id: u32,
    /// Per-record random nonce.
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with the authentication tag appended.
    pub ciphertext: Vec<u8>,
}

impl EncryptedPayload {
    /// Additional authenticated data binding the header fields.
    pub fn associated_data(&self) -> [u8; 6] {
        let mut aad = [0u8; 6];
        aad[0] = PAYLOAD_VERSION;
        aad[1] = self.algorithm;
        aad[2..].copy_from_slice(&self.key_id.to_be_bytes());
        aad
    }
}

/// Serializes a payload into its storage encoding.
pub fn encode(payload: &EncryptedPayload) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.ciphertext.len());
    out.push(PAYLOAD_VERSION);
    out.push(payload.algorithm);
    out.extend_from_slice(&payload.key_id.to_be_bytes());
    out.extend_from_slice(&payload.nonce);
    out.extend_from_slice(&(payload.ciphertext.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload.ciphertext);
    out
}

/// Parses the storage encoding back into a payload.
pub fn decode(bytes: &[u8]) -> Result<EncryptedPayload, CodecError> {
    if bytes.len() < HEADER_LEN {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN,
            actual: bytes.len(),
        });
    }
    if bytes[0] != PAYLOAD_VERSION {
        return Err(CodecError::UnsupportedVersion(bytes[0]));
    }
    let algorithm = bytes[1];
    if algorithm != ALG_XCHACHA20_POLY1305 {
        return Err(CodecError::UnsupportedAlgorithm(algorithm));
    }
    let key_id = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&bytes[6..6 + NONCE_LEN]);
    let len_at = 6 + NONCE_LEN;
    let declared = u32::from_be_bytes([
        bytes[len_at],
        bytes[len_at + 1],
        bytes[len_at + 2],
        bytes[len_at + 3],
    ]) as usize;
    let body = &bytes[HEADER_LEN..];
    if body.len() < declared {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN + declared,
            actual: bytes.len(),
        });
    }
    if body.len() != declared {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: body.len(),
        });
    }
    if declared < TAG_LEN {
        return Err(CodecError::Truncated {
            needed: HEADER_LEN + TAG_LEN,
            actual: bytes.len(),
        });
    }
    Ok(EncryptedPayload {
        algorithm,
        key_id,
        nonce,
        ciphertext: body.to_vec(),
    })
}

/// A report as committed to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRecord {
    /// Ledger-assigned identifier.
    pub report_id: ReportId,
    /// Encrypted narrative.
    pub payload: EncryptedPayload,
    /// Block height at which the ledger accepted the record.
    pub submitted_at_block: u64,
}

/// Machine-readable record document exchanged with the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReportRecordJson {
    /// Schema identifier (`incident-ledger.report.v1`).
    pub schema: String,
    /// Ledger-assigned identifier.
    pub report_id: String,
    /// Base64 storage encoding of the encrypted payload.
    pub encrypted_payload: String,
    /// Block height at which the ledger accepted the record.
    pub submitted_at_block: u64,
}

impl ReportRecordJson {
    /// Builds the document from opaque payload bytes as held by a ledger.
    pub fn from_stored(report_id: &str, payload: &[u8], submitted_at_block: u64) -> Self {
        Self {
            schema: SCHEMA_REPORT.to_string(),
            report_id: report_id.to_string(),
            encrypted_payload: BASE64.encode(payload),
            submitted_at_block,
        }
    }

    /// Serializes the document to JSON bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Plain struct of strings and integers; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

impl ReportRecord {
    /// Converts the record into its JSON document form.
    pub fn to_json(&self) -> ReportRecordJson {
        ReportRecordJson::from_stored(
            self.report_id.as_str(),
            &encode(&self.payload),
            self.submitted_at_block,
        )
    }

    /// Parses and validates a JSON record document.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let doc: ReportRecordJson =
            serde_json::from_slice(bytes).map_err(|err| CodecError::Decode(err.to_string()))?;
        if doc.schema != SCHEMA_REPORT {
            return Err(CodecError::InvalidSchema {
                expected: SCHEMA_REPORT,
                found: doc.schema,
            });
        }
        let raw = BASE64
            .decode(doc.encrypted_payload.as_bytes())
            .map_err(|err| CodecError::Decode(err.to_string()))?;
        Ok(Self {
            report_id: ReportId::new(doc.report_id)?,
            payload: decode(&raw)?,
            submitted_at_block: doc.submitted_at_block,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> EncryptedPayload {
        EncryptedPayload {
            algorithm: ALG_XCHACHA20_POLY1305,
            key_id: 0xdead_beef,
            nonce: [7u8; NONCE_LEN],
            ciphertext: vec![1u8; 48],
        }
    }

    #[test]
    fn rejects_bad_version_and_algorithm() {
        let mut bytes = encode(&sample());
        bytes[0] = 2;
        assert_eq!(decode(&bytes), Err(CodecError::UnsupportedVersion(2)));
        let mut bytes = encode(&sample());
        bytes[1] = 9;
        assert_eq!(decode(&bytes), Err(CodecError::UnsupportedAlgorithm(9)));
    }

    #[test]
    fn rejects_wrong_lengths() {
        let bytes = encode(&sample());
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(CodecError::Truncated { .. })
        ));
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(matches!(
            decode(&longer),
            Err(CodecError::LengthMismatch { .. })
        ));
        assert!(matches!(decode(&[1, 1]), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn record_json_has_no_sender_field() {
        let record = ReportRecord {
            report_id: ReportId::new("R1").unwrap(),
            payload: sample(),
            submitted_at_block: 42,
        };
        let bytes = record.to_json().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(
            keys.len(),
            4,
            "unexpected fields in stored record: {keys:?}"
        );
        assert!(value.get("from").is_none());
        assert_eq!(ReportRecord::from_json_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn record_rejects_foreign_schema() {
        let mut doc = ReportRecordJson::from_stored("R1", &encode(&sample()), 1);
        doc.schema = "other.v1".into();
        assert!(matches!(
            ReportRecord::from_json_bytes(&doc.to_bytes()),
            Err(CodecError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn report_id_validation() {
        assert!(ReportId::new("").is_err());
        assert!(ReportId::new("has space").is_err());
        assert!(ReportId::new("x".repeat(129)).is_err());
        assert_eq!("  R7 ".parse::<ReportId>().unwrap().as_str(), "R7");
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            key_id in any::<u32>(),
            nonce in proptest::array::uniform24(any::<u8>()),
            ciphertext in proptest::collection::vec(any::<u8>(), TAG_LEN..512),
        ) {
            let payload = EncryptedPayload {
                algorithm: ALG_XCHACHA20_POLY1305,
                key_id,
                nonce,
                ciphertext,
            };
            prop_assert_eq!(decode(&encode(&payload)).unwrap(), payload);
        }
    }
}
