use crate::codec::{ReportId, ReportRecordJson};
use crate::error::LedgerError;
use crate::ledger::{
    LedgerClient, Receipt, ReceiptStatus, TxHandle, METHOD_GET_REPORT, METHOD_REPORT_BY_TOKEN,
};
use crate::token::IdempotencyToken;
use async_trait::async_trait;
use blake2::digest::{consts::U32, Digest};
use blake2::Blake2b;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct StoredRecord {
    payload: Vec<u8>,
    block: u64,
    tx: TxHandle,
}

#[derive(Debug, Clone)]
struct TxEntry {
    token: IdempotencyToken,
    report_id: String,
    block: u64,
}

#[derive(Debug, Default)]
struct Faults {
    send_transient: u32,
    call_transient: u32,
    poll_transient: u32,
    lost_acks: u32,
    reject_next: Option<String>,
    revert_next: Option<String>,
    drop_next_receipt: bool,
}

#[derive(Debug, Default)]
struct State {
    height: u64,
    next_id: u64,
    auto_advance: u64,
    send_calls: u64,
    records: BTreeMap<String, StoredRecord>,
    by_token: HashMap<IdempotencyToken, TxHandle>,
    txs: HashMap<TxHandle, TxEntry>,
    reverted: HashMap<TxHandle, String>,
    faults: Faults,
}

/// In-process ledger with scripted faults.
///
/// Each accepted transaction lands in a new block. Confirmations grow as the
/// height advances, either manually via [`MemoryLedger::advance`] or by
/// `auto_advance` blocks on every receipt poll.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
}

impl MemoryLedger {
    /// Empty ledger that never advances on its own.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty ledger that mines `blocks` new blocks on every receipt poll.
    pub fn with_auto_advance(blocks: u64) -> Self {
        let ledger = Self::default();
        ledger.lock().auto_advance = blocks;
        ledger
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Mines `blocks` empty blocks.
    pub fn advance(&self, blocks: u64) {
        let mut state = self.lock();
        state.height += blocks;
    }

    /// Current block height.
    pub fn height(&self) -> u64 {
        self.lock().height
    }

    /// The next `n` sends fail transiently without committing.
    pub fn fail_sends(&self, n: u32) {
        self.lock().faults.send_transient = n;
    }

    /// The next `n` read calls fail transiently.
    pub fn fail_calls(&self, n: u32) {
        self.lock().faults.call_transient = n;
    }

    /// The next `n` receipt polls fail transiently.
    pub fn fail_polls(&self, n: u32) {
        self.lock().faults.poll_transient = n;
    }

    /// The next `n` sends commit but report a transient failure to the caller.
    pub fn lose_acks(&self, n: u32) {
        self.lock().faults.lost_acks = n;
    }

    /// The next send is rejected permanently.
    pub fn reject_next_send(&self, reason: impl Into<String>) {
        self.lock().faults.reject_next = Some(reason.into());
    }

    /// The next accepted transaction reverts instead of producing a record.
    pub fn revert_next_send(&self, reason: impl Into<String>) {
        self.lock().faults.revert_next = Some(reason.into());
    }

    /// The next receipt poll reports the polled transaction as reorganized away.
    pub fn drop_next_receipt(&self) {
        self.lock().faults.drop_next_receipt = true;
    }

    /// Number of committed records.
    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    /// Number of `send` invocations observed, including failed ones.
    pub fn send_count(&self) -> u64 {
        self.lock().send_calls
    }

    /// Stored record document as the ledger would return it.
    pub fn raw_record(&self, report_id: &str) -> Option<Vec<u8>> {
        let state = self.lock();
        state
            .records
            .get(report_id)
            .map(|rec| ReportRecordJson::from_stored(report_id, &rec.payload, rec.block).to_bytes())
    }

    /// Flips one bit of a stored payload. Returns false if absent or out of range.
    pub fn tamper(&self, report_id: &str, bit: usize) -> bool {
        let mut state = self.lock();
        match state.records.get_mut(report_id) {
            Some(rec) if bit / 8 < rec.payload.len() => {
                rec.payload[bit / 8] ^= 1 << (bit % 8);
                true
            }
            _ => false,
        }
    }

    fn tx_handle(token: &IdempotencyToken, height: u64) -> TxHandle {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(b"MEMORY_LEDGER_TX");
        hasher.update(token.as_bytes());
        hasher.update(height.to_be_bytes());
        TxHandle(format!("0x{}", hex::encode(hasher.finalize())))
    }

    fn lookup_token(state: &State, token: &IdempotencyToken) -> Option<Vec<u8>> {
        let tx = state.by_token.get(token)?;
        let entry = state.txs.get(tx)?;
        let rec = state.records.get(&entry.report_id)?;
        Some(ReportRecordJson::from_stored(&entry.report_id, &rec.payload, rec.block).to_bytes())
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn send(
        &self,
        tx_payload: &[u8],
        token: &IdempotencyToken,
    ) -> Result<TxHandle, LedgerError> {
        let mut state = self.lock();
        state.send_calls += 1;
        if let Some(reason) = state.faults.reject_next.take() {
            return Err(LedgerError::Rejected(reason));
        }
        if state.faults.send_transient > 0 {
            state.faults.send_transient -= 1;
            return Err(LedgerError::Transient("node busy".into()));
        }
        let existing = state.by_token.get(token).cloned();
        let handle = match existing {
            Some(existing) => existing,
            None => {
                state.height += 1;
                let block = state.height;
                let handle = Self::tx_handle(token, block);
                if let Some(reason) = state.faults.revert_next.take() {
                    state.reverted.insert(handle.clone(), reason);
                    return Ok(handle);
                }
                state.next_id += 1;
                let report_id = format!("R{}", state.next_id);
                state.records.insert(
                    report_id.clone(),
                    StoredRecord {
                        payload: tx_payload.to_vec(),
                        block,
                        tx: handle.clone(),
                    },
                );
                state.txs.insert(
                    handle.clone(),
                    TxEntry {
                        token: *token,
                        report_id,
                        block,
                    },
                );
                state.by_token.insert(*token, handle.clone());
                handle
            }
        };
        if state.faults.lost_acks > 0 {
            state.faults.lost_acks -= 1;
            return Err(LedgerError::Transient("acknowledgement lost".into()));
        }
        Ok(handle)
    }

    async fn poll_receipt(&self, tx: &TxHandle) -> Result<Receipt, LedgerError> {
        let mut state = self.lock();
        if state.faults.poll_transient > 0 {
            state.faults.poll_transient -= 1;
            return Err(LedgerError::Transient("receipt poll timed out".into()));
        }
        if let Some(reason) = state.reverted.get(tx) {
            return Ok(Receipt {
                status: ReceiptStatus::Reverted(reason.clone()),
                confirmations: 0,
            });
        }
        let advance = state.auto_advance;
        state.height += advance;
        if std::mem::take(&mut state.faults.drop_next_receipt) {
            if let Some(entry) = state.txs.remove(tx) {
                state.records.remove(&entry.report_id);
                state.by_token.remove(&entry.token);
            }
            return Ok(Receipt {
                status: ReceiptStatus::Dropped,
                confirmations: 0,
            });
        }
        let Some(entry) = state.txs.get(tx) else {
            return Ok(Receipt {
                status: ReceiptStatus::Dropped,
                confirmations: 0,
            });
        };
        let report_id = ReportId::new(entry.report_id.clone())
            .map_err(|err| LedgerError::Rejected(err.to_string()))?;
        Ok(Receipt {
            status: ReceiptStatus::Included {
                report_id,
                block: entry.block,
            },
            confirmations: state.height.saturating_sub(entry.block) + 1,
        })
    }

    async fn call(&self, method: &str, args: &[u8]) -> Result<Vec<u8>, LedgerError> {
        let mut state = self.lock();
        if state.faults.call_transient > 0 {
            state.faults.call_transient -= 1;
            return Err(LedgerError::Transient("node unavailable".into()));
        }
        match method {
            METHOD_GET_REPORT => {
                let id = std::str::from_utf8(args)
                    .map_err(|_| LedgerError::Rejected("report id is not UTF-8".into()))?;
                let rec = state.records.get(id).ok_or(LedgerError::NotFound)?;
                debug_assert!(state.txs.contains_key(&rec.tx));
                Ok(ReportRecordJson::from_stored(id, &rec.payload, rec.block).to_bytes())
            }
            METHOD_REPORT_BY_TOKEN => {
                let token = IdempotencyToken::from_slice(args)
                    .ok_or_else(|| LedgerError::Rejected("token must be 32 bytes".into()))?;
                Self::lookup_token(&state, &token).ok_or(LedgerError::NotFound)
            }
            other => Err(LedgerError::Rejected(format!("unknown method {other}"))),
        }
    }
}
