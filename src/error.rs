//! Error taxonomy shared by the submission and retrieval paths.

use crate::cipher::KeyError;
use crate::codec::CodecError;
use crate::ledger::TxHandle;
use crate::token::IdempotencyToken;
use thiserror::Error;

/// Failures reported by a [`LedgerClient`](crate::ledger::LedgerClient).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("transient ledger failure: {0}")]
    /// Network timeout, busy node, or another condition worth retrying.
    Transient(String),
    #[error("ledger rejected transaction: {0}")]
    /// The ledger refused the request (validation failure, insufficient funds).
    Rejected(String),
    #[error("not found on ledger")]
    /// The requested record, receipt or token is absent.
    NotFound,
}

impl LedgerError {
    /// Returns true when the failure should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors surfaced by the public report operations.
///
/// Every public operation resolves to a value or one of these variants.
/// Submissions whose ledger-side fate is unknown carry the idempotency token
/// so the caller can re-query status later.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error("invalid report: {0}")]
    /// Empty or oversized plaintext. Never retried.
    Validation(String),
    #[error("transient network error: {0}")]
    /// Transient ledger failure that was not retried (status queries).
    TransientNetwork(String),
    #[error("ledger rejected report: {0}")]
    /// Permanent rejection by the ledger.
    LedgerRejected(String),
    #[error("decryption not authorized: {0}")]
    /// The supplied authorization does not satisfy the policy.
    AuthorizationDenied(String),
    #[error("report failed integrity verification")]
    /// The authenticated-encryption tag did not verify.
    IntegrityViolation,
    #[error("report {0} not found")]
    /// No record exists under the requested identifier.
    NotFound(String),
    #[error("malformed record: {0}")]
    /// The stored bytes do not match the record schema.
    MalformedRecord(String),
    #[error("{} timed out", describe_target(.token))]
    /// Retries or the confirmation deadline were exhausted.
    TimedOut {
        /// Token of the affected submission, if this was a submission.
        token: Option<IdempotencyToken>,
        /// Transaction that may still commit, if one was broadcast.
        tx: Option<TxHandle>,
    },
    #[error("submission {token} cancelled")]
    /// The caller cancelled the submission before it resolved.
    Cancelled {
        /// Token of the cancelled submission.
        token: IdempotencyToken,
        /// Transaction that may still commit, if one was broadcast.
        tx: Option<TxHandle>,
    },
    #[error("key provider error: {0}")]
    /// The key-management collaborator failed.
    Key(#[from] KeyError),
}

fn describe_target(token: &Option<IdempotencyToken>) -> String {
    match token {
        Some(token) => format!("submission {token}"),
        None => "ledger read".to_string(),
    }
}

impl From<CodecError> for ReportError {
    fn from(err: CodecError) -> Self {
        Self::MalformedRecord(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_errors_map_to_malformed_record() {
        let err: ReportError = CodecError::UnsupportedVersion(9).into();
        assert!(matches!(err, ReportError::MalformedRecord(_)));
    }

    #[test]
    fn timed_out_read_has_readable_message() {
        let err = ReportError::TimedOut {
            token: None,
            tx: None,
        };
        assert_eq!(err.to_string(), "ledger read timed out");
        assert!(LedgerError::Transient("busy".into()).is_transient());
        assert!(!LedgerError::NotFound.is_transient());
    }
}
