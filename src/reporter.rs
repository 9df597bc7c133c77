//! Public surface: submit a narrative, read it back with a grant.

use crate::auth::{AuthorizationPolicy, DecryptionAuthorization};
use crate::cipher::KeyProvider;
use crate::codec::ReportId;
use crate::config::ReporterConfig;
use crate::error::ReportError;
use crate::ledger::LedgerClient;
use crate::retrieval::RetrievalManager;
use crate::submission::{CancelOutcome, SubmissionManager, TokenStatus};
use crate::token::IdempotencyToken;
use std::sync::Arc;
use std::time::Duration;

/// Incident reporting front end over one ledger binding.
///
/// The ledger client signs with its own relayer account; nothing about the
/// author is passed in here or stored with the record.
pub struct IncidentReporter {
    submissions: SubmissionManager,
    retrievals: RetrievalManager,
}

impl IncidentReporter {
    /// Wires both managers to the same ledger and key provider.
    pub fn new(
        config: ReporterConfig,
        ledger: Arc<dyn LedgerClient>,
        keys: Arc<dyn KeyProvider>,
        policy: Arc<dyn AuthorizationPolicy>,
    ) -> Self {
        let retrievals = RetrievalManager::new(&config, ledger.clone(), keys.clone(), policy);
        let submissions = SubmissionManager::new(config, ledger, keys);
        Self {
            submissions,
            retrievals,
        }
    }

    /// Encrypts and commits `message`, returning the ledger-assigned id.
    pub async fn submit_incident_report(&self, message: &str) -> Result<ReportId, ReportError> {
        self.submissions.submit(message).await
    }

    /// Like [`IncidentReporter::submit_incident_report`] with a per-call deadline.
    pub async fn submit_with_timeout(
        &self,
        message: &str,
        timeout: Duration,
    ) -> Result<ReportId, ReportError> {
        self.submissions.submit_with_timeout(message, timeout).await
    }

    /// Decrypts a committed report for the holder of `authorization`.
    pub async fn get_decrypted_report(
        &self,
        report_id: &ReportId,
        authorization: &DecryptionAuthorization,
    ) -> Result<String, ReportError> {
        self.retrievals.retrieve(report_id, authorization).await
    }

    /// Token a submission of `message` will carry.
    pub fn token_for(&self, message: &str) -> Result<IdempotencyToken, ReportError> {
        self.submissions.token_for(message)
    }

    /// Re-queries a submission by token.
    pub async fn status(&self, token: &IdempotencyToken) -> Result<TokenStatus, ReportError> {
        self.submissions.status(token).await
    }

    /// Stops tracking an in-flight submission.
    pub async fn cancel(&self, token: &IdempotencyToken) -> CancelOutcome {
        self.submissions.cancel(token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{GrantIssuer, GrantPolicy};
    use crate::cipher::{ReportKey, StaticKeyProvider, KEY_LEN};
    use crate::codec::ReportRecordJson;
    use crate::ledger::memory::MemoryLedger;
    use crate::retry::RetryPolicy;
    use ed25519_dalek::SigningKey;
    use proptest::prelude::*;

    fn setup() -> (IncidentReporter, Arc<MemoryLedger>, GrantIssuer, GrantIssuer) {
        let ledger = Arc::new(MemoryLedger::with_auto_advance(1));
        let keys = StaticKeyProvider::new(ReportKey::from_bytes([42u8; KEY_LEN]));
        let investigator = GrantIssuer::new(SigningKey::from_bytes(&[7u8; 32]));
        let stranger = GrantIssuer::new(SigningKey::from_bytes(&[8u8; 32]));
        let policy = GrantPolicy::new([investigator.verifying_key()]);
        let config = ReporterConfig {
            required_confirmations: 2,
            poll_interval_ms: 1,
            retry: RetryPolicy {
                max_retries: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 4,
                multiplier: 2.0,
            },
            ..ReporterConfig::default()
        };
        let reporter =
            IncidentReporter::new(config, ledger.clone(), Arc::new(keys), Arc::new(policy));
        (reporter, ledger, investigator, stranger)
    }

    #[tokio::test]
    async fn warehouse_theft_scenario() {
        let (reporter, _ledger, investigator, stranger) = setup();
        let id = reporter
            .submit_incident_report("theft at warehouse 4")
            .await
            .unwrap();
        assert_eq!(id.as_str(), "R1");

        let valid = investigator.issue(&id, 0);
        assert_eq!(
            reporter.get_decrypted_report(&id, &valid).await.unwrap(),
            "theft at warehouse 4"
        );

        let invalid = stranger.issue(&id, 0);
        assert!(matches!(
            reporter.get_decrypted_report(&id, &invalid).await,
            Err(ReportError::AuthorizationDenied(_))
        ));

        let missing = ReportId::new("R_nonexistent").unwrap();
        let valid_missing = investigator.issue(&missing, 0);
        assert!(matches!(
            reporter.get_decrypted_report(&missing, &valid_missing).await,
            Err(ReportError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stored_record_carries_no_author_metadata() {
        let (reporter, ledger, _, _) = setup();
        let id = reporter
            .submit_incident_report("supervisor falsified logs")
            .await
            .unwrap();
        let raw = ledger.raw_record(id.as_str()).unwrap();
        let doc: ReportRecordJson = serde_json::from_slice(&raw).unwrap();
        assert_eq!(doc.report_id, "R1");
        let text = String::from_utf8(raw).unwrap();
        assert!(!text.contains("supervisor"));
        assert!(!text.contains("relayer"));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        let mut fields: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        fields.sort();
        assert_eq!(
            fields,
            ["encrypted_payload", "report_id", "schema", "submitted_at_block"]
        );
    }

    #[tokio::test]
    async fn resubmission_returns_same_id_and_status_requery() {
        let (reporter, ledger, _, _) = setup();
        let token = reporter.token_for("broken guard rail").unwrap();
        let first = reporter.submit_incident_report("broken guard rail").await.unwrap();
        let second = reporter.submit_incident_report("broken guard rail").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(ledger.record_count(), 1);
        assert_eq!(
            reporter.status(&token).await.unwrap(),
            TokenStatus::Committed {
                report_id: first,
                submitted_at_block: 1
            }
        );
        assert_eq!(reporter.cancel(&token).await, CancelOutcome::NotInFlight);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn submitted_reports_decrypt_to_the_original(text in ".{0,200}[a-z]") {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let (reporter, _ledger, investigator, _) = setup();
            let recovered = runtime.block_on(async {
                let id = reporter.submit_incident_report(&text).await?;
                reporter
                    .get_decrypted_report(&id, &investigator.issue(&id, 0))
                    .await
            });
            prop_assert_eq!(recovered, Ok(text));
        }
    }
}
