//! Authorized read path: check, fetch, decode, decrypt.

use crate::auth::{authorize, AuthorizationPolicy, DecryptionAuthorization};
use crate::cipher::{KeyError, KeyProvider, ReportCipher};
use crate::codec::{ReportId, ReportRecord};
use crate::config::ReporterConfig;
use crate::error::{LedgerError, ReportError};
use crate::ledger::{LedgerClient, METHOD_GET_REPORT};
use crate::retry::{retry_transient, RetryPolicy};
use std::sync::Arc;
use tracing::{info, warn};

/// Fetches committed reports and decrypts them for authorized callers.
///
/// Retrieval never mutates ledger state. Transient read failures are retried
/// with the configured backoff; an absent record fails immediately.
pub struct RetrievalManager {
    retry: RetryPolicy,
    ledger: Arc<dyn LedgerClient>,
    keys: Arc<dyn KeyProvider>,
    policy: Arc<dyn AuthorizationPolicy>,
    cipher: ReportCipher,
}

impl RetrievalManager {
    /// Manager bound to a ledger, key provider and authorization policy.
    pub fn new(
        config: &ReporterConfig,
        ledger: Arc<dyn LedgerClient>,
        keys: Arc<dyn KeyProvider>,
        policy: Arc<dyn AuthorizationPolicy>,
    ) -> Self {
        Self {
            retry: config.retry.clone(),
            ledger,
            keys,
            policy,
            cipher: ReportCipher::new(config.pad_block),
        }
    }

    /// Fetches and validates the record stored under `report_id`.
    pub async fn fetch(&self, report_id: &ReportId) -> Result<ReportRecord, ReportError> {
        let ledger = &self.ledger;
        let args = report_id.as_str().as_bytes();
        let bytes = retry_transient(&self.retry, "getReport", move || async move {
            ledger.call(METHOD_GET_REPORT, args).await
        })
        .await
        .map_err(|err| match err {
            LedgerError::NotFound => ReportError::NotFound(report_id.to_string()),
            LedgerError::Rejected(msg) => ReportError::LedgerRejected(msg),
            LedgerError::Transient(_) => ReportError::TimedOut {
                token: None,
                tx: None,
            },
        })?;
        let record = ReportRecord::from_json_bytes(&bytes)?;
        if &record.report_id != report_id {
            return Err(ReportError::MalformedRecord(format!(
                "ledger returned record {} for {}",
                record.report_id, report_id
            )));
        }
        Ok(record)
    }

    /// Returns the plaintext of `report_id` if `authorization` satisfies the policy.
    pub async fn retrieve(
        &self,
        report_id: &ReportId,
        authorization: &DecryptionAuthorization,
    ) -> Result<String, ReportError> {
        let approved = match authorize(self.policy.as_ref(), report_id, authorization) {
            Ok(approved) => approved,
            Err(err) => {
                warn!(module = "RETRIEVE", evt = "DENIED", report_id = %report_id, error = %err);
                return Err(err);
            }
        };
        let record = self.fetch(report_id).await?;
        let key = match self.keys.key_by_id(record.payload.key_id) {
            Ok(key) => key,
            // The key id is authenticated header data; an id no provider
            // issued means the stored payload was altered.
            Err(KeyError::UnknownKey(key_id)) => {
                warn!(
                    module = "RETRIEVE",
                    evt = "UNKNOWN_KEY",
                    report_id = %report_id,
                    key_id = key_id
                );
                return Err(ReportError::IntegrityViolation);
            }
            Err(err) => return Err(err.into()),
        };
        let plaintext = self.cipher.decrypt(&record.payload, &approved, &key);
        match &plaintext {
            Ok(_) => info!(
                module = "RETRIEVE",
                evt = "DECRYPTED",
                report_id = %report_id,
                block = record.submitted_at_block
            ),
            Err(err) => warn!(
                module = "RETRIEVE",
                evt = "FAILED",
                report_id = %report_id,
                error = %err
            ),
        }
        plaintext
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{GrantIssuer, GrantPolicy};
    use crate::cipher::{ReportKey, StaticKeyProvider, KEY_LEN};
    use crate::codec::encode;
    use crate::ledger::memory::MemoryLedger;
    use crate::token::IdempotencyToken;
    use ed25519_dalek::SigningKey;

    struct Fixture {
        ledger: Arc<MemoryLedger>,
        manager: RetrievalManager,
        issuer: GrantIssuer,
        outsider: GrantIssuer,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let key = ReportKey::from_bytes([11u8; KEY_LEN]);
        let issuer = GrantIssuer::new(SigningKey::from_bytes(&[1u8; 32]));
        let outsider = GrantIssuer::new(SigningKey::from_bytes(&[2u8; 32]));
        let policy = GrantPolicy::new([issuer.verifying_key()]);
        let mut config = ReporterConfig::default();
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 2;
        config.retry.max_retries = 2;
        let manager = RetrievalManager::new(
            &config,
            ledger.clone(),
            Arc::new(StaticKeyProvider::new(key)),
            Arc::new(policy),
        );
        Fixture {
            ledger,
            manager,
            issuer,
            outsider,
        }
    }

    async fn store(ledger: &MemoryLedger, text: &str) -> ReportId {
        let key = ReportKey::from_bytes([11u8; KEY_LEN]);
        let payload = ReportCipher::new(256).encrypt(text, &key).unwrap();
        let token = ReportCipher::new(256).token_for(text, &key);
        ledger.send(&encode(&payload), &token).await.unwrap();
        ReportId::new(format!("R{}", ledger.record_count())).unwrap()
    }

    #[tokio::test]
    async fn authorized_retrieval_returns_plaintext() {
        let fx = fixture();
        let id = store(&fx.ledger, "theft at warehouse 4").await;
        let grant = fx.issuer.issue(&id, 0);
        assert_eq!(
            fx.manager.retrieve(&id, &grant).await.unwrap(),
            "theft at warehouse 4"
        );
    }

    #[tokio::test]
    async fn unauthorized_retrieval_is_denied() {
        let fx = fixture();
        let id = store(&fx.ledger, "theft at warehouse 4").await;
        let grant = fx.outsider.issue(&id, 0);
        assert!(matches!(
            fx.manager.retrieve(&id, &grant).await,
            Err(ReportError::AuthorizationDenied(_))
        ));
        let other = ReportId::new("R77").unwrap();
        let wrong_report = fx.issuer.issue(&other, 0);
        assert!(matches!(
            fx.manager.retrieve(&id, &wrong_report).await,
            Err(ReportError::AuthorizationDenied(_))
        ));
    }

    #[tokio::test]
    async fn missing_record_is_not_retried() {
        let fx = fixture();
        let id = ReportId::new("R_nonexistent").unwrap();
        let grant = fx.issuer.issue(&id, 0);
        assert_eq!(
            fx.manager.retrieve(&id, &grant).await,
            Err(ReportError::NotFound("R_nonexistent".into()))
        );
    }

    #[tokio::test]
    async fn transient_reads_are_retried_then_time_out() {
        let fx = fixture();
        let id = store(&fx.ledger, "door propped open").await;
        let grant = fx.issuer.issue(&id, 0);
        fx.ledger.fail_calls(2);
        assert_eq!(
            fx.manager.retrieve(&id, &grant).await.unwrap(),
            "door propped open"
        );
        fx.ledger.fail_calls(10);
        assert_eq!(
            fx.manager.retrieve(&id, &grant).await,
            Err(ReportError::TimedOut {
                token: None,
                tx: None
            })
        );
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_integrity_violation() {
        let fx = fixture();
        let id = store(&fx.ledger, "door propped open").await;
        let grant = fx.issuer.issue(&id, 0);
        // Nonce, ciphertext body, tag.
        for bit in [8 * 10 + 1, 8 * 100, 8 * 300 + 7] {
            assert!(fx.ledger.tamper(id.as_str(), bit));
            assert_eq!(
                fx.manager.retrieve(&id, &grant).await,
                Err(ReportError::IntegrityViolation)
            );
            assert!(fx.ledger.tamper(id.as_str(), bit));
        }
        assert!(fx.ledger.tamper(id.as_str(), 0));
        assert!(matches!(
            fx.manager.retrieve(&id, &grant).await,
            Err(ReportError::MalformedRecord(_))
        ));
    }

    #[tokio::test]
    async fn tampered_key_id_is_integrity_violation() {
        let fx = fixture();
        let id = store(&fx.ledger, "door propped open").await;
        let grant = fx.issuer.issue(&id, 0);
        for bit in [16, 8 * 3 + 5, 47] {
            assert!(fx.ledger.tamper(id.as_str(), bit));
            assert_eq!(
                fx.manager.retrieve(&id, &grant).await,
                Err(ReportError::IntegrityViolation)
            );
            assert!(fx.ledger.tamper(id.as_str(), bit));
        }
    }

    #[tokio::test]
    async fn denied_grant_reveals_nothing_about_the_record() {
        let fx = fixture();
        let missing = ReportId::new("R999").unwrap();
        assert!(matches!(
            fx.manager
                .retrieve(&missing, &fx.outsider.issue(&missing, 0))
                .await,
            Err(ReportError::AuthorizationDenied(_))
        ));

        let id = store(&fx.ledger, "door propped open").await;
        assert!(fx.ledger.tamper(id.as_str(), 0));
        fx.ledger.fail_calls(10);
        assert!(matches!(
            fx.manager.retrieve(&id, &fx.outsider.issue(&id, 0)).await,
            Err(ReportError::AuthorizationDenied(_))
        ));
    }

    #[tokio::test]
    async fn token_lookup_and_id_lookup_agree() {
        let fx = fixture();
        let id = store(&fx.ledger, "loose railing").await;
        let record = fx.manager.fetch(&id).await.unwrap();
        assert_eq!(record.report_id, id);
        let stray = IdempotencyToken::from_bytes([0u8; 32]);
        assert_eq!(
            fx.ledger
                .call(crate::ledger::METHOD_REPORT_BY_TOKEN, stray.as_bytes())
                .await,
            Err(LedgerError::NotFound)
        );
    }
}
