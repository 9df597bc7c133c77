//! Narrow interface to the append-only ledger.
//!
//! The core depends on exactly three operations: `send`, `poll_receipt` and
//! `call`. Concrete bindings sign transactions with a relayer account of their
//! own, so no author identity reaches the ledger through this seam.

use crate::codec::ReportId;
use crate::error::LedgerError;
use crate::token::IdempotencyToken;
use async_trait::async_trait;
use std::fmt;

/// Durable JSON-persisted single-host ledger.
pub mod file;
/// In-process ledger with fault injection.
pub mod memory;

/// Read method returning the record stored under a report id (UTF-8 args).
pub const METHOD_GET_REPORT: &str = "getReport";
/// Read method returning the record committed under an idempotency token
/// (32 raw token bytes as args).
pub const METHOD_REPORT_BY_TOKEN: &str = "getReportByToken";

/// Opaque handle identifying a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxHandle(pub String);

impl fmt::Display for TxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inclusion state of a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// Known to the ledger but not yet in a block.
    Pending,
    /// Included; the ledger assigned `report_id` at height `block`.
    Included {
        /// Ledger-assigned identifier.
        report_id: ReportId,
        /// Inclusion height.
        block: u64,
    },
    /// Executed but reverted by ledger validation.
    Reverted(String),
    /// No longer known (evicted or reorganized away).
    Dropped,
}

/// Receipt returned by [`LedgerClient::poll_receipt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Inclusion state.
    pub status: ReceiptStatus,
    /// Blocks at or above the inclusion block (0 unless included).
    pub confirmations: u64,
}

/// Ledger binding consumed by the report managers.
///
/// `send` must be idempotent per token: once a transaction carrying `token`
/// has been accepted, later sends with the same token return the handle of
/// that transaction instead of creating a second record.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Broadcasts `tx_payload` tagged with `token`.
    async fn send(
        &self,
        tx_payload: &[u8],
        token: &IdempotencyToken,
    ) -> Result<TxHandle, LedgerError>;

    /// Reports inclusion status and confirmation depth of `tx`.
    async fn poll_receipt(&self, tx: &TxHandle) -> Result<Receipt, LedgerError>;

    /// Invokes a read-only method; absent records yield [`LedgerError::NotFound`].
    async fn call(&self, method: &str, args: &[u8]) -> Result<Vec<u8>, LedgerError>;
}
