#![deny(missing_docs)]

//! # incident_ledger
//!
//! **incident_ledger** commits free-text incident narratives to an
//! append-only ledger without tying them to their author, and lets an
//! authorized investigator read them back later.
//!
//! A submission is padded, sealed with XChaCha20-Poly1305 under a fresh
//! random nonce, and broadcast through a [`LedgerClient`] that signs with a
//! relayer account of its own. The stored record is
//! `{ report_id, encrypted_payload, submitted_at_block }` and nothing else.
//!
//! ## Guarantees
//!
//! * **Exactly-once commitment.** Every submission carries an
//!   [`IdempotencyToken`] derived from the report content under a key-bound
//!   subkey. Resends after lost acknowledgements, concurrent duplicates and
//!   reorganized receipts all collapse to one ledger record.
//! * **Bounded retry.** Transient ledger failures back off exponentially up
//!   to [`RetryPolicy::max_retries`]; permanent rejections surface at once.
//! * **Finality.** [`SubmissionManager`] reports success only after the
//!   configured confirmation depth.
//! * **Authenticated decryption.** Any bit flip in a stored nonce or
//!   ciphertext yields [`ReportError::IntegrityViolation`]; decryption runs
//!   only after an [`AuthorizationPolicy`] has approved a signed grant.
//!
//! ## Usage
//!
//! ```rust
//! use ed25519_dalek::SigningKey;
//! use incident_ledger::{
//!     GrantIssuer, GrantPolicy, IncidentReporter, MemoryLedger, ReportKey, ReporterConfig,
//!     StaticKeyProvider,
//! };
//! use std::sync::Arc;
//!
//! # let rt = tokio::runtime::Runtime::new().unwrap();
//! # rt.block_on(async {
//! let investigator = GrantIssuer::new(SigningKey::from_bytes(&[9u8; 32]));
//! let config = ReporterConfig {
//!     poll_interval_ms: 1,
//!     ..ReporterConfig::default()
//! };
//! let reporter = IncidentReporter::new(
//!     config,
//!     Arc::new(MemoryLedger::with_auto_advance(1)),
//!     Arc::new(StaticKeyProvider::new(ReportKey::from_bytes([1u8; 32]))),
//!     Arc::new(GrantPolicy::new([investigator.verifying_key()])),
//! );
//!
//! let id = reporter.submit_incident_report("theft at warehouse 4").await.unwrap();
//! let grant = investigator.issue(&id, 0);
//! let text = reporter.get_decrypted_report(&id, &grant).await.unwrap();
//! assert_eq!(text, "theft at warehouse 4");
//! # });
//! ```

pub mod auth;
pub mod cipher;
pub mod codec;
pub mod config;
pub mod error;
pub mod ledger;
mod reporter;
pub mod retrieval;
mod retry;
pub mod submission;
mod token;

pub use auth::{
    authorize, decode_public_key_base64, encode_public_key_base64, load_signing_key,
    AuthorizationPolicy, Authorized, DecryptionAuthorization, DenyReason, Ed25519KeySource,
    GrantIssuer, GrantPolicy, PolicyError, SigningKeyError,
};
pub use cipher::{KeyError, KeyProvider, ReportCipher, ReportKey, StaticKeyProvider};
pub use codec::{CodecError, EncryptedPayload, ReportId, ReportRecord, ReportRecordJson};
pub use config::{ConfigError, ReporterConfig};
pub use error::{LedgerError, ReportError};
pub use ledger::file::{FileLedger, FileLedgerError};
pub use ledger::memory::MemoryLedger;
pub use ledger::{LedgerClient, Receipt, ReceiptStatus, TxHandle};
pub use reporter::IncidentReporter;
pub use retrieval::RetrievalManager;
pub use retry::RetryPolicy;
pub use submission::{
    CancelOutcome, SubmissionAttempt, SubmissionManager, SubmissionStatus, TokenStatus,
};
pub use token::IdempotencyToken;
