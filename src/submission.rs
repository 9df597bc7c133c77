//! Idempotent, retrying commitment of encrypted reports.
//!
//! Each distinct idempotency token owns at most one in-flight attempt. A
//! spawned driver task walks the attempt through
//! `Pending -> Broadcast -> Confirmed | Rejected | TimedOut | Cancelled` and
//! publishes every transition on a `watch` channel; callers submitting the
//! same content subscribe to the existing attempt instead of broadcasting
//! again. The table entry is removed once the attempt resolves.

use crate::cipher::{KeyProvider, ReportCipher};
use crate::codec::{encode, ReportId, ReportRecord};
use crate::config::ReporterConfig;
use crate::error::{LedgerError, ReportError};
use crate::ledger::{LedgerClient, ReceiptStatus, TxHandle, METHOD_REPORT_BY_TOKEN};
use crate::token::IdempotencyToken;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, warn};

/// Lifecycle state of a submission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionStatus {
    /// Encrypted and waiting to be accepted by the ledger.
    Pending,
    /// Accepted by the ledger; waiting for finality depth.
    Broadcast {
        /// Transaction carrying the record.
        tx: TxHandle,
        /// Confirmations observed so far.
        confirmations: u64,
    },
    /// Final: the record is committed at the required depth.
    Confirmed {
        /// Ledger-assigned identifier.
        report_id: ReportId,
        /// Inclusion height.
        submitted_at_block: u64,
        /// Confirmations at resolution.
        confirmations: u64,
    },
    /// Final: the ledger refused the record permanently.
    Rejected {
        /// Ledger-supplied reason.
        reason: String,
    },
    /// Final: retries or the caller's deadline ran out.
    TimedOut {
        /// Transaction that may still commit.
        tx: Option<TxHandle>,
    },
    /// Final: the caller cancelled local tracking.
    Cancelled {
        /// Transaction that may still commit.
        tx: Option<TxHandle>,
    },
}

impl SubmissionStatus {
    /// True for states an attempt never leaves.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Broadcast { .. })
    }
}

/// Snapshot of one submission attempt.
#[derive(Debug, Clone)]
pub struct SubmissionAttempt {
    /// Token collapsing duplicate submissions.
    pub token: IdempotencyToken,
    /// Encoded payload; every resend carries these exact bytes.
    pub payload: Arc<[u8]>,
    /// Current lifecycle state.
    pub status: SubmissionStatus,
    /// Most recent broadcast transaction, if any.
    pub tx: Option<TxHandle>,
    /// Last ledger error observed.
    pub last_error: Option<String>,
    /// Retries consumed so far.
    pub retry_count: u32,
    /// Number of `send` calls issued.
    pub sends: u32,
}

/// Result of [`SubmissionManager::cancel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Nothing reached the ledger; the submission is fully withdrawn.
    Stopped,
    /// Local tracking stopped, but a transaction may still commit.
    /// `tx` is `None` when a send was issued whose outcome never arrived.
    AlreadyBroadcast {
        /// Transaction that may still commit.
        tx: Option<TxHandle>,
    },
    /// No attempt with this token is in flight.
    NotInFlight,
}

/// Answer to [`SubmissionManager::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    /// An attempt is being driven locally.
    InFlight(SubmissionStatus),
    /// Not in flight; the ledger holds a record under this token.
    Committed {
        /// Ledger-assigned identifier.
        report_id: ReportId,
        /// Inclusion height.
        submitted_at_block: u64,
    },
    /// Not in flight and unknown to the ledger.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Run,
    Cancel,
    Deadline,
}

struct InFlight {
    generation: u64,
    status: watch::Receiver<SubmissionAttempt>,
    stop: watch::Sender<Stop>,
    waiters: usize,
}

impl InFlight {
    fn request_stop(&self, reason: Stop) {
        self.stop.send_if_modified(|current| {
            if *current == Stop::Run {
                *current = reason;
                true
            } else {
                false
            }
        });
    }
}

type AttemptTable = Arc<Mutex<HashMap<IdempotencyToken, InFlight>>>;

fn lock_table(table: &AttemptTable) -> MutexGuard<'_, HashMap<IdempotencyToken, InFlight>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A caller waiting on an attempt. The attempt keeps running while at least
/// one waiter remains; the last one to leave stops it.
struct Waiter {
    token: IdempotencyToken,
    generation: u64,
    table: AttemptTable,
    status: watch::Receiver<SubmissionAttempt>,
    joined: bool,
}

impl Waiter {
    /// Detaches from the attempt. Returns true if no waiters remain, in
    /// which case the attempt has been asked to stop or already resolved.
    fn leave(&mut self) -> bool {
        if !std::mem::take(&mut self.joined) {
            return false;
        }
        let mut table = lock_table(&self.table);
        let Some(entry) = table
            .get_mut(&self.token)
            .filter(|entry| entry.generation == self.generation)
        else {
            return true;
        };
        entry.waiters = entry.waiters.saturating_sub(1);
        if entry.waiters > 0 {
            return false;
        }
        entry.request_stop(Stop::Deadline);
        true
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.leave();
    }
}

/// Drives encrypted reports to finality on the ledger.
pub struct SubmissionManager {
    config: Arc<ReporterConfig>,
    ledger: Arc<dyn LedgerClient>,
    keys: Arc<dyn KeyProvider>,
    cipher: ReportCipher,
    table: AttemptTable,
    generations: AtomicU64,
}

impl SubmissionManager {
    /// Manager bound to a ledger client and a key provider.
    pub fn new(
        config: ReporterConfig,
        ledger: Arc<dyn LedgerClient>,
        keys: Arc<dyn KeyProvider>,
    ) -> Self {
        let cipher = ReportCipher::new(config.pad_block);
        Self {
            config: Arc::new(config),
            ledger,
            keys,
            cipher,
            table: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    fn validate(&self, plaintext: &str) -> Result<(), ReportError> {
        if plaintext.trim().is_empty() {
            return Err(ReportError::Validation("report is empty".into()));
        }
        if plaintext.len() > self.config.max_report_bytes {
            return Err(ReportError::Validation(format!(
                "report is {} bytes; limit is {}",
                plaintext.len(),
                self.config.max_report_bytes
            )));
        }
        Ok(())
    }

    /// Token a submission of `plaintext` would use under the active key.
    pub fn token_for(&self, plaintext: &str) -> Result<IdempotencyToken, ReportError> {
        self.validate(plaintext)?;
        let key = self.keys.active_key()?;
        Ok(self.cipher.token_for(plaintext, &key))
    }

    /// Submits a report under the configured confirmation timeout.
    pub async fn submit(&self, plaintext: &str) -> Result<ReportId, ReportError> {
        self.submit_with_timeout(plaintext, self.config.confirmation_timeout())
            .await
    }

    /// Submits a report, giving up after `timeout`.
    ///
    /// The deadline applies to this caller only. When it passes the caller
    /// gets [`ReportError::TimedOut`] carrying the token and any broadcast
    /// transaction, while other callers joined on the same content keep
    /// waiting; the attempt itself stops once its last caller has left.
    /// [`SubmissionManager::status`] can re-query the token later.
    pub async fn submit_with_timeout(
        &self,
        plaintext: &str,
        timeout: Duration,
    ) -> Result<ReportId, ReportError> {
        self.validate(plaintext)?;
        let key = self.keys.active_key()?;
        let token = self.cipher.token_for(plaintext, &key);
        let mut waiter = self.join_or_start(token, || {
            let payload = self.cipher.encrypt(plaintext, &key)?;
            Ok(Arc::from(encode(&payload)))
        })?;
        if let Ok(attempt) = time::timeout(timeout, wait_terminal(&mut waiter.status)).await {
            return resolve(attempt);
        }
        if waiter.leave() {
            return resolve(wait_terminal(&mut waiter.status).await);
        }
        let tx = waiter.status.borrow().tx.clone();
        debug!(module = "SUBMIT", evt = "DETACH", token = %token, tx = ?tx);
        Err(ReportError::TimedOut {
            token: Some(token),
            tx,
        })
    }

    fn join_or_start<F>(
        &self,
        token: IdempotencyToken,
        seal: F,
    ) -> Result<Waiter, ReportError>
    where
        F: FnOnce() -> Result<Arc<[u8]>, ReportError>,
    {
        let mut table = lock_table(&self.table);
        if let Some(entry) = table.get_mut(&token) {
            entry.waiters += 1;
            debug!(module = "SUBMIT", evt = "JOIN", token = %token, waiters = entry.waiters);
            return Ok(Waiter {
                token,
                generation: entry.generation,
                table: self.table.clone(),
                status: entry.status.clone(),
                joined: true,
            });
        }
        let payload = seal()?;
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let attempt = SubmissionAttempt {
            token,
            payload: payload.clone(),
            status: SubmissionStatus::Pending,
            tx: None,
            last_error: None,
            retry_count: 0,
            sends: 0,
        };
        let (status_tx, status_rx) = watch::channel(attempt.clone());
        let (stop_tx, stop_rx) = watch::channel(Stop::Run);
        table.insert(
            token,
            InFlight {
                generation,
                status: status_rx.clone(),
                stop: stop_tx,
                waiters: 1,
            },
        );
        info!(
            module = "SUBMIT",
            evt = "START",
            token = %token,
            payload_bytes = payload.len()
        );
        let driver = Driver {
            config: self.config.clone(),
            ledger: self.ledger.clone(),
            table: self.table.clone(),
            attempt,
            status: status_tx,
            stop: stop_rx,
        };
        tokio::spawn(driver.run());
        Ok(Waiter {
            token,
            generation,
            table: self.table.clone(),
            status: status_rx,
            joined: true,
        })
    }

    fn signal(
        &self,
        token: &IdempotencyToken,
        reason: Stop,
    ) -> Option<watch::Receiver<SubmissionAttempt>> {
        let table = lock_table(&self.table);
        let entry = table.get(token)?;
        entry.request_stop(reason);
        Some(entry.status.clone())
    }

    /// Stops local tracking of an in-flight submission.
    ///
    /// Cancellation cannot retract a transaction the ledger may already hold;
    /// the outcome states whether anything was sent.
    pub async fn cancel(&self, token: &IdempotencyToken) -> CancelOutcome {
        let Some(mut rx) = self.signal(token, Stop::Cancel) else {
            return CancelOutcome::NotInFlight;
        };
        let outcome = cancel_outcome(&wait_terminal(&mut rx).await);
        info!(module = "SUBMIT", evt = "CANCEL", token = %token, outcome = ?outcome);
        outcome
    }

    /// Current state of the submission identified by `token`.
    ///
    /// In-flight attempts answer locally. Otherwise the ledger is asked once,
    /// without retry, whether it holds a record under the token.
    pub async fn status(&self, token: &IdempotencyToken) -> Result<TokenStatus, ReportError> {
        if let Some(attempt) = self.attempt(token) {
            return Ok(TokenStatus::InFlight(attempt.status));
        }
        match self.ledger.call(METHOD_REPORT_BY_TOKEN, token.as_bytes()).await {
            Ok(bytes) => {
                let record = ReportRecord::from_json_bytes(&bytes)?;
                Ok(TokenStatus::Committed {
                    report_id: record.report_id,
                    submitted_at_block: record.submitted_at_block,
                })
            }
            Err(LedgerError::NotFound) => Ok(TokenStatus::Unknown),
            Err(LedgerError::Transient(msg)) => Err(ReportError::TransientNetwork(msg)),
            Err(LedgerError::Rejected(msg)) => Err(ReportError::LedgerRejected(msg)),
        }
    }

    /// Snapshot of the in-flight attempt for `token`, if any.
    pub fn attempt(&self, token: &IdempotencyToken) -> Option<SubmissionAttempt> {
        let table = lock_table(&self.table);
        table.get(token).map(|entry| entry.status.borrow().clone())
    }

    /// Number of attempts currently in flight.
    pub fn in_flight(&self) -> usize {
        lock_table(&self.table).len()
    }
}

async fn wait_terminal(rx: &mut watch::Receiver<SubmissionAttempt>) -> SubmissionAttempt {
    if let Ok(attempt) = rx.wait_for(|attempt| attempt.status.is_terminal()).await {
        return attempt.clone();
    }
    // Driver gone; report whatever it published last.
    rx.borrow().clone()
}

/// What a cancel reports for the state the attempt ended in.
fn cancel_outcome(attempt: &SubmissionAttempt) -> CancelOutcome {
    match &attempt.status {
        SubmissionStatus::Cancelled { tx } | SubmissionStatus::TimedOut { tx } => {
            if tx.is_none() && attempt.sends == 0 {
                CancelOutcome::Stopped
            } else {
                CancelOutcome::AlreadyBroadcast {
                    tx: tx.clone().or_else(|| attempt.tx.clone()),
                }
            }
        }
        SubmissionStatus::Confirmed { .. } => CancelOutcome::AlreadyBroadcast {
            tx: attempt.tx.clone(),
        },
        // The ledger refused it; nothing can commit.
        SubmissionStatus::Rejected { .. } => CancelOutcome::Stopped,
        // Driver vanished mid-flight.
        SubmissionStatus::Pending | SubmissionStatus::Broadcast { .. } if attempt.sends == 0 => {
            CancelOutcome::Stopped
        }
        SubmissionStatus::Pending | SubmissionStatus::Broadcast { .. } => {
            CancelOutcome::AlreadyBroadcast {
                tx: attempt.tx.clone(),
            }
        }
    }
}

fn resolve(attempt: SubmissionAttempt) -> Result<ReportId, ReportError> {
    let token = attempt.token;
    match attempt.status {
        SubmissionStatus::Confirmed { report_id, .. } => Ok(report_id),
        SubmissionStatus::Rejected { reason } => Err(ReportError::LedgerRejected(reason)),
        SubmissionStatus::TimedOut { tx } => Err(ReportError::TimedOut {
            token: Some(token),
            tx,
        }),
        SubmissionStatus::Cancelled { tx } => Err(ReportError::Cancelled { token, tx }),
        // Driver vanished without resolving; fate unknown.
        SubmissionStatus::Pending | SubmissionStatus::Broadcast { .. } => {
            Err(ReportError::TimedOut {
                token: Some(token),
                tx: attempt.tx,
            })
        }
    }
}

async fn stop_requested(stop: &mut watch::Receiver<Stop>) -> Stop {
    let reason = stop.wait_for(|s| *s != Stop::Run).await.map(|r| *r).ok();
    match reason {
        Some(reason) => reason,
        None => std::future::pending().await,
    }
}

/// Runs `fut` unless a stop is requested first.
async fn guarded<T>(
    stop: &mut watch::Receiver<Stop>,
    fut: impl Future<Output = T>,
) -> Result<T, Stop> {
    let current = *stop.borrow();
    if current != Stop::Run {
        return Err(current);
    }
    tokio::select! {
        out = fut => Ok(out),
        reason = stop_requested(stop) => Err(reason),
    }
}

enum Step {
    Continue,
    Done(SubmissionStatus),
}

struct Driver {
    config: Arc<ReporterConfig>,
    ledger: Arc<dyn LedgerClient>,
    table: AttemptTable,
    attempt: SubmissionAttempt,
    status: watch::Sender<SubmissionAttempt>,
    stop: watch::Receiver<Stop>,
}

impl Driver {
    async fn run(mut self) {
        let status = loop {
            let step = if self.attempt.tx.is_none() {
                self.broadcast().await
            } else {
                self.confirm().await
            };
            match step {
                Ok(Step::Continue) => continue,
                Ok(Step::Done(status)) => break status,
                Err(reason) => break self.stopped(reason),
            }
        };
        self.finish(status);
    }

    fn publish(&mut self, status: SubmissionStatus) {
        self.attempt.status = status;
        self.status.send_replace(self.attempt.clone());
    }

    fn stopped(&self, reason: Stop) -> SubmissionStatus {
        let tx = self.attempt.tx.clone();
        match reason {
            Stop::Cancel => SubmissionStatus::Cancelled { tx },
            Stop::Deadline | Stop::Run => SubmissionStatus::TimedOut { tx },
        }
    }

    fn finish(mut self, status: SubmissionStatus) {
        let token = self.attempt.token;
        match &status {
            SubmissionStatus::Confirmed {
                report_id,
                submitted_at_block,
                confirmations,
            } => info!(
                module = "SUBMIT",
                evt = "CONFIRMED",
                token = %token,
                report_id = %report_id,
                block = submitted_at_block,
                confirmations
            ),
            SubmissionStatus::Rejected { reason } => {
                warn!(module = "SUBMIT", evt = "REJECTED", token = %token, reason = %reason)
            }
            SubmissionStatus::TimedOut { tx } => warn!(
                module = "SUBMIT",
                evt = "TIMEOUT",
                token = %token,
                tx = ?tx,
                retries = self.attempt.retry_count
            ),
            SubmissionStatus::Cancelled { tx } => {
                info!(module = "SUBMIT", evt = "STOPPED", token = %token, tx = ?tx)
            }
            SubmissionStatus::Pending | SubmissionStatus::Broadcast { .. } => {}
        }
        self.publish(status);
        lock_table(&self.table).remove(&token);
    }

    /// Records a transient failure; `None` once retries are exhausted.
    fn consume_retry(&mut self, err: &LedgerError) -> Option<Duration> {
        self.attempt.last_error = Some(err.to_string());
        if self.attempt.retry_count >= self.config.retry.max_retries {
            return None;
        }
        self.attempt.retry_count += 1;
        let delay = self.config.retry.delay_for_attempt(self.attempt.retry_count);
        debug!(
            module = "SUBMIT",
            evt = "RETRY",
            token = %self.attempt.token,
            attempt = self.attempt.retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %err
        );
        Some(delay)
    }

    async fn backoff(&mut self, err: &LedgerError) -> Result<Step, Stop> {
        match self.consume_retry(err) {
            Some(delay) => {
                self.status.send_replace(self.attempt.clone());
                guarded(&mut self.stop, time::sleep(delay)).await?;
                Ok(Step::Continue)
            }
            None => Ok(Step::Done(SubmissionStatus::TimedOut {
                tx: self.attempt.tx.clone(),
            })),
        }
    }

    async fn broadcast(&mut self) -> Result<Step, Stop> {
        self.publish(SubmissionStatus::Pending);
        // A stop seen here means nothing was sent.
        let current = *self.stop.borrow();
        if current != Stop::Run {
            return Err(current);
        }
        self.attempt.sends += 1;
        let sent = guarded(
            &mut self.stop,
            self.ledger.send(&self.attempt.payload, &self.attempt.token),
        )
        .await?;
        match sent {
            Ok(tx) => {
                info!(
                    module = "SUBMIT",
                    evt = "BROADCAST",
                    token = %self.attempt.token,
                    tx = %tx,
                    send = self.attempt.sends
                );
                self.attempt.tx = Some(tx.clone());
                self.publish(SubmissionStatus::Broadcast {
                    tx,
                    confirmations: 0,
                });
                Ok(Step::Continue)
            }
            Err(err) if err.is_transient() => self.backoff(&err).await,
            Err(LedgerError::Rejected(reason)) => Ok(Step::Done(SubmissionStatus::Rejected { reason })),
            Err(LedgerError::NotFound) | Err(LedgerError::Transient(_)) => {
                Ok(Step::Done(SubmissionStatus::Rejected {
                    reason: "ledger did not recognise the transaction".into(),
                }))
            }
        }
    }

    async fn confirm(&mut self) -> Result<Step, Stop> {
        let Some(tx) = self.attempt.tx.clone() else {
            return Ok(Step::Continue);
        };
        let polled = guarded(&mut self.stop, self.ledger.poll_receipt(&tx)).await?;
        let receipt = match polled {
            Ok(receipt) => receipt,
            Err(err) if err.is_transient() => return self.backoff(&err).await,
            Err(LedgerError::Rejected(reason)) => {
                return Ok(Step::Done(SubmissionStatus::Rejected { reason }))
            }
            Err(err) => {
                return self.reorged(&tx, err.to_string()).await;
            }
        };
        match receipt.status {
            ReceiptStatus::Pending => {
                self.publish(SubmissionStatus::Broadcast {
                    tx,
                    confirmations: 0,
                });
            }
            ReceiptStatus::Included { report_id, block } => {
                let required = self.config.required_confirmations.max(1);
                if receipt.confirmations >= required {
                    return Ok(Step::Done(SubmissionStatus::Confirmed {
                        report_id,
                        submitted_at_block: block,
                        confirmations: receipt.confirmations,
                    }));
                }
                self.publish(SubmissionStatus::Broadcast {
                    tx,
                    confirmations: receipt.confirmations,
                });
            }
            ReceiptStatus::Reverted(reason) => {
                return Ok(Step::Done(SubmissionStatus::Rejected { reason }));
            }
            ReceiptStatus::Dropped => {
                return self.reorged(&tx, "receipt dropped".into()).await;
            }
        }
        guarded(&mut self.stop, time::sleep(self.config.poll_interval())).await?;
        Ok(Step::Continue)
    }

    /// The ledger forgot `tx`; resend under the same token.
    async fn reorged(&mut self, tx: &TxHandle, reason: String) -> Result<Step, Stop> {
        warn!(
            module = "SUBMIT",
            evt = "REORG",
            token = %self.attempt.token,
            tx = %tx,
            reason = %reason
        );
        self.attempt.tx = None;
        self.backoff(&LedgerError::Transient(reason)).await
    }
}
