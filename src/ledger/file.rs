use crate::codec::{ReportId, ReportRecordJson};
use crate::error::LedgerError;
use crate::ledger::{
    LedgerClient, Receipt, ReceiptStatus, TxHandle, METHOD_GET_REPORT, METHOD_REPORT_BY_TOKEN,
};
use crate::token::IdempotencyToken;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use blake2::digest::{consts::U32, Digest};
use blake2::Blake2b;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

const SCHEMA_FILE_LEDGER: &str = "incident-ledger.file-ledger.v1";
const REPORT_ID_BYTES: usize = 8;

/// Errors raised while opening a [`FileLedger`].
#[derive(Debug, Clone, Error)]
pub enum FileLedgerError {
    #[error("ledger file I/O error: {0}")]
    /// Filesystem failure.
    Io(String),
    #[error("ledger file parse error: {0}")]
    /// The state document could not be parsed.
    Parse(String),
    #[error("invalid ledger file schema: {0}")]
    /// The state document carries an unexpected schema tag.
    InvalidSchema(String),
    #[error("block period must be positive")]
    /// A zero block period was requested.
    ZeroBlockPeriod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileRecord {
    payload: String,
    block: u64,
    tx: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileTx {
    report_id: String,
    token: String,
    block: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileState {
    schema: String,
    genesis_ms: u64,
    last_height: u64,
    next_id: u64,
    records: BTreeMap<String, FileRecord>,
    tokens: BTreeMap<String, String>,
    txs: BTreeMap<String, FileTx>,
}

impl FileState {
    fn fresh(genesis_ms: u64) -> Self {
        Self {
            schema: SCHEMA_FILE_LEDGER.to_string(),
            genesis_ms,
            last_height: 0,
            next_id: 0,
            records: BTreeMap::new(),
            tokens: BTreeMap::new(),
            txs: BTreeMap::new(),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Single-host ledger persisted as one JSON document.
///
/// Block height is synthetic: one block per `block_period` of wall-clock
/// time since the file was created, never decreasing. Every mutation rewrites
/// the document through a temp file and rename. File access runs on tokio's
/// blocking pool.
#[derive(Debug, Clone)]
pub struct FileLedger {
    store: Arc<Store>,
}

#[derive(Debug)]
struct Store {
    path: PathBuf,
    block_period_ms: u64,
    guard: Mutex<()>,
}

impl FileLedger {
    /// Opens `path`, creating an empty ledger if the file does not exist.
    pub fn open(path: impl AsRef<Path>, block_period: Duration) -> Result<Self, FileLedgerError> {
        let block_period_ms = block_period.as_millis() as u64;
        if block_period_ms == 0 {
            return Err(FileLedgerError::ZeroBlockPeriod);
        }
        let store = Store {
            path: path.as_ref().to_path_buf(),
            block_period_ms,
            guard: Mutex::new(()),
        };
        if store.path.exists() {
            store.read_state()?;
        } else {
            store.write_state(&FileState::fresh(now_ms()))?;
        }
        Ok(Self {
            store: Arc::new(store),
        })
    }

    /// Location of the state document.
    pub fn path(&self) -> &Path {
        &self.store.path
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Store) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|err| LedgerError::Transient(format!("ledger worker failed: {err}")))?
    }
}

impl Store {
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_state(&self) -> Result<FileState, FileLedgerError> {
        let contents =
            fs::read_to_string(&self.path).map_err(|err| FileLedgerError::Io(err.to_string()))?;
        let state: FileState = serde_json::from_str(&contents)
            .map_err(|err| FileLedgerError::Parse(err.to_string()))?;
        if state.schema != SCHEMA_FILE_LEDGER {
            return Err(FileLedgerError::InvalidSchema(state.schema));
        }
        Ok(state)
    }

    fn write_state(&self, state: &FileState) -> Result<(), FileLedgerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| FileLedgerError::Io(err.to_string()))?;
        }
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        let contents = serde_json::to_string_pretty(state)
            .map_err(|err| FileLedgerError::Parse(err.to_string()))?;
        fs::write(&tmp_path, contents).map_err(|err| FileLedgerError::Io(err.to_string()))?;
        fs::rename(&tmp_path, &self.path).map_err(|err| FileLedgerError::Io(err.to_string()))
    }

    fn tick(&self, state: &mut FileState) -> u64 {
        let elapsed = now_ms().saturating_sub(state.genesis_ms);
        let height = elapsed / self.block_period_ms + 1;
        state.last_height = state.last_height.max(height);
        state.last_height
    }

    fn report_id_for(token: &IdempotencyToken, seq: u64) -> String {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(b"FILE_LEDGER_REPORT_ID");
        hasher.update(token.as_bytes());
        hasher.update(seq.to_be_bytes());
        hex::encode(&hasher.finalize()[..REPORT_ID_BYTES])
    }

    fn tx_handle_for(token: &IdempotencyToken, block: u64) -> String {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(b"FILE_LEDGER_TX");
        hasher.update(token.as_bytes());
        hasher.update(block.to_be_bytes());
        format!("0x{}", hex::encode(hasher.finalize()))
    }

    fn document(report_id: &str, record: &FileRecord) -> Result<Vec<u8>, LedgerError> {
        let payload = BASE64
            .decode(record.payload.as_bytes())
            .map_err(|err| LedgerError::Rejected(format!("corrupt ledger entry: {err}")))?;
        Ok(ReportRecordJson::from_stored(report_id, &payload, record.block).to_bytes())
    }

    fn send(&self, tx_payload: &[u8], token: &IdempotencyToken) -> Result<TxHandle, LedgerError> {
        let _guard = self.lock();
        let mut state = self.read_state().map_err(to_ledger_error)?;
        let token_hex = token.to_hex();
        if let Some(existing) = state.tokens.get(&token_hex) {
            return Ok(TxHandle(existing.clone()));
        }
        let block = self.tick(&mut state);
        state.next_id += 1;
        let report_id = Self::report_id_for(token, state.next_id);
        let tx = Self::tx_handle_for(token, block);
        state.records.insert(
            report_id.clone(),
            FileRecord {
                payload: BASE64.encode(tx_payload),
                block,
                tx: tx.clone(),
            },
        );
        state.txs.insert(
            tx.clone(),
            FileTx {
                report_id: report_id.clone(),
                token: token_hex.clone(),
                block,
            },
        );
        state.tokens.insert(token_hex, tx.clone());
        self.write_state(&state).map_err(to_ledger_error)?;
        debug!(module = "FILE_LEDGER", evt = "APPEND", report_id = %report_id, block);
        Ok(TxHandle(tx))
    }

    fn poll_receipt(&self, tx: &TxHandle) -> Result<Receipt, LedgerError> {
        let _guard = self.lock();
        let mut state = self.read_state().map_err(to_ledger_error)?;
        let before = state.last_height;
        let height = self.tick(&mut state);
        if height != before {
            self.write_state(&state).map_err(to_ledger_error)?;
        }
        let Some(entry) = state.txs.get(&tx.0) else {
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
            confirmations: height.saturating_sub(entry.block) + 1,
        })
    }

    fn call(&self, method: &str, args: &[u8]) -> Result<Vec<u8>, LedgerError> {
        let _guard = self.lock();
        let state = self.read_state().map_err(to_ledger_error)?;
        match method {
            METHOD_GET_REPORT => {
                let id = std::str::from_utf8(args)
                    .map_err(|_| LedgerError::Rejected("report id is not UTF-8".into()))?;
                let record = state.records.get(id).ok_or(LedgerError::NotFound)?;
                Self::document(id, record)
            }
            METHOD_REPORT_BY_TOKEN => {
                let token = IdempotencyToken::from_slice(args)
                    .ok_or_else(|| LedgerError::Rejected("token must be 32 bytes".into()))?;
                let tx = state
                    .tokens
                    .get(&token.to_hex())
                    .ok_or(LedgerError::NotFound)?;
                let entry = state.txs.get(tx).ok_or(LedgerError::NotFound)?;
                let record = state
                    .records
                    .get(&entry.report_id)
                    .ok_or(LedgerError::NotFound)?;
                Self::document(&entry.report_id, record)
            }
            other => Err(LedgerError::Rejected(format!("unknown method {other}"))),
        }
    }
}

fn to_ledger_error(err: FileLedgerError) -> LedgerError {
    match err {
        FileLedgerError::Io(msg) => LedgerError::Transient(msg),
        other => LedgerError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl LedgerClient for FileLedger {
    async fn send(
        &self,
        tx_payload: &[u8],
        token: &IdempotencyToken,
    ) -> Result<TxHandle, LedgerError> {
        let payload = tx_payload.to_vec();
        let token = *token;
        self.blocking(move |store| store.send(&payload, &token)).await
    }

    async fn poll_receipt(&self, tx: &TxHandle) -> Result<Receipt, LedgerError> {
        let tx = tx.clone();
        self.blocking(move |store| store.poll_receipt(&tx)).await
    }

    async fn call(&self, method: &str, args: &[u8]) -> Result<Vec<u8>, LedgerError> {
        let method = method.to_string();
        let args = args.to_vec();
        self.blocking(move |store| store.call(&method, &args)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ReportRecord;

    fn temp_path(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let mut dir = std::env::temp_dir();
        dir.push(format!("incident_file_ledger_{label}_{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir.join("ledger.json")
    }

    fn payload() -> Vec<u8> {
        let mut bytes = vec![1u8, 1, 0, 0, 0, 9];
        bytes.extend_from_slice(&[5u8; 24]);
        bytes.extend_from_slice(&20u32.to_be_bytes());
        bytes.extend_from_slice(&[9u8; 20]);
        bytes
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let path = temp_path("reopen");
        let token = IdempotencyToken::from_bytes([3u8; 32]);
        let tx = {
            let ledger = FileLedger::open(&path, Duration::from_millis(10)).unwrap();
            ledger.send(&payload(), &token).await.unwrap()
        };
        let ledger = FileLedger::open(&path, Duration::from_millis(10)).unwrap();
        assert_eq!(ledger.send(&payload(), &token).await.unwrap(), tx);
        let receipt = ledger.poll_receipt(&tx).await.unwrap();
        let ReceiptStatus::Included { report_id, .. } = receipt.status else {
            panic!("expected inclusion");
        };
        let doc = ledger
            .call(METHOD_GET_REPORT, report_id.as_str().as_bytes())
            .await
            .unwrap();
        let record = ReportRecord::from_json_bytes(&doc).unwrap();
        assert_eq!(record.report_id, report_id);
        let by_token = ledger
            .call(METHOD_REPORT_BY_TOKEN, token.as_bytes())
            .await
            .unwrap();
        assert_eq!(by_token, doc);
        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn height_advances_with_wall_clock() {
        let path = temp_path("height");
        let ledger = FileLedger::open(&path, Duration::from_millis(5)).unwrap();
        let tx = ledger
            .send(&payload(), &IdempotencyToken::from_bytes([8u8; 32]))
            .await
            .unwrap();
        let first = ledger.poll_receipt(&tx).await.unwrap().confirmations;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let later = ledger.poll_receipt(&tx).await.unwrap().confirmations;
        assert!(first >= 1);
        assert!(later > first);
        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[tokio::test]
    async fn unknown_entries() {
        let path = temp_path("unknown");
        let ledger = FileLedger::open(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(
            ledger.call(METHOD_GET_REPORT, b"missing").await,
            Err(LedgerError::NotFound)
        );
        let receipt = ledger
            .poll_receipt(&TxHandle("0xfeed".into()))
            .await
            .unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Dropped);
        assert!(FileLedger::open(&path, Duration::ZERO).is_err());
        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_appends_stay_consistent() {
        let path = temp_path("concurrent");
        let ledger = FileLedger::open(&path, Duration::from_millis(10)).unwrap();
        let tasks: Vec<_> = (0..16u8)
            .map(|n| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .send(&payload(), &IdempotencyToken::from_bytes([n; 32]))
                        .await
                })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        let reopened = FileLedger::open(&path, Duration::from_millis(10)).unwrap();
        for n in 0..16u8 {
            let token = IdempotencyToken::from_bytes([n; 32]);
            assert!(reopened
                .call(METHOD_REPORT_BY_TOKEN, token.as_bytes())
                .await
                .is_ok());
        }
        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn rejects_foreign_documents() {
        let path = temp_path("schema");
        fs::write(&path, r#"{"schema":"other","genesis_ms":0,"last_height":0,"next_id":0,"records":{},"tokens":{},"txs":{}}"#).unwrap();
        assert!(matches!(
            FileLedger::open(&path, Duration::from_secs(1)),
            Err(FileLedgerError::InvalidSchema(_))
        ));
        fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
