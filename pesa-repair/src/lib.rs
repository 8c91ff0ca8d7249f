#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Forward-only repair of idempotency metadata.
//!
//! Two operations: backfilling a missing record for a POSTED journal,
//! and completing a stale IN_PROGRESS record whose journal made it to
//! POSTED. Both write only to `idempotency_records` and `events`;
//! `ledger_journals` and `ledger_lines` are never touched.

use std::env;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use pesa_amount::HashEntry;
use pesa_amount::format_amount;
use pesa_amount::payload_hash;
use pesa_amount::scope_hash;
use pesa_engine::Receipt;
use pesa_engine::ReceiptEntry;
use pesa_ledger::Event;
use pesa_ledger::IdempotencyRecord;
use pesa_ledger::IdempotencyStatus;
use pesa_ledger::JournalState;
use pesa_ledger::LedgerJournal;
use pesa_ledger::LedgerLine;
use pesa_ledger::LedgerStore;
use pesa_ledger::StoreError;
use thiserror::Error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

pub const EVENT_REPAIR_EXECUTED: &str = "REPAIR_EXECUTED";
pub const EVENT_STATE_REPAIRED: &str = "STATE_REPAIRED";

pub type RepairResult<T> = Result<T, RepairError>;

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("journal {0} is not POSTED")]
    JournalNotPosted(String),
    #[error("idempotency record already exists for journal {0}")]
    RecordAlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for RepairError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(what) => RepairError::NotFound(what),
            other => RepairError::Storage(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RepairConfig {
    /// Records IN_PROGRESS for longer than this are candidates for
    /// completion.
    pub stale_cutoff_secs: i64,
    pub idempotency_ttl_days: i64,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            stale_cutoff_secs: 300,
            idempotency_ttl_days: 90,
        }
    }
}

impl RepairConfig {
    /// Reads `PESA_STALE_CUTOFF_SECS` and `PESA_IDEMPOTENCY_TTL_DAYS`,
    /// falling back to defaults on absent or unparsable values.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = env::var("PESA_STALE_CUTOFF_SECS")
            && let Ok(secs) = raw.parse::<i64>()
            && secs > 0
        {
            config.stale_cutoff_secs = secs;
        }
        if let Ok(raw) = env::var("PESA_IDEMPOTENCY_TTL_DAYS")
            && let Ok(days) = raw.parse::<i64>()
            && days > 0
        {
            config.idempotency_ttl_days = days;
        }
        config
    }
}

pub struct RepairService {
    store: Arc<dyn LedgerStore>,
    config: RepairConfig,
}

impl RepairService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_config(store, RepairConfig::default())
    }

    pub fn with_config(store: Arc<dyn LedgerStore>, config: RepairConfig) -> Self {
        Self { store, config }
    }

    /// Reconstructs the COMPLETED idempotency record for a POSTED
    /// journal that lost its record. Refuses for non-POSTED journals and
    /// when a record already exists under the recomputed scope.
    pub async fn backfill_idempotency(&self, journal_id: &str) -> RepairResult<IdempotencyRecord> {
        let journal = self.store.get_journal(journal_id).await?;
        if journal.state != JournalState::Posted {
            return Err(RepairError::JournalNotPosted(journal_id.to_string()));
        }

        let scope = scope_hash(
            &journal.initiator_actor_type,
            &journal.initiator_actor_id,
            journal.txn_type.as_str(),
            &journal.idempotency_key,
        );
        if self.store.lookup_by_scope_hash(&scope).await?.is_some() {
            return Err(RepairError::RecordAlreadyExists(journal_id.to_string()));
        }

        let lines = self.store.list_lines(journal_id).await?;
        let receipt = reconstruct_receipt(&journal, &lines);
        let result_json = serde_json::to_string(&receipt)
            .map_err(|error| RepairError::Internal(format!("receipt serialization: {error}")))?;
        // The original command description is not recoverable from the
        // journal; the backfilled payload hash uses an empty one. A
        // client retry carrying a description then conflicts instead of
        // replaying, which keeps the at-most-once guarantee.
        let payload = payload_hash(&hash_entries(&lines), &journal.currency, "");

        let now = Utc::now();
        let record = self
            .store
            .insert_idempotency(IdempotencyRecord {
                record_id: Uuid::new_v4().to_string(),
                scope_hash: scope,
                payload_hash: payload,
                result_json,
                status: IdempotencyStatus::Completed,
                created_at: now,
                expires_at: now + Duration::days(self.config.idempotency_ttl_days),
            })
            .await?;

        self.emit(
            EVENT_REPAIR_EXECUTED,
            "LEDGER_JOURNAL",
            journal_id,
            &journal.correlation_id,
            serde_json::json!({
                "journal_id": journal_id,
                "record_id": record.record_id,
            }),
        )
        .await;
        info!(journal_id, record_id = %record.record_id, "idempotency record backfilled");
        Ok(record)
    }

    /// Completes IN_PROGRESS records older than the stale cutoff whose
    /// journal exists and is POSTED. Records that fail the check are
    /// left untouched for the next sweep.
    pub async fn complete_stale(&self, now: DateTime<Utc>) -> RepairResult<Vec<IdempotencyRecord>> {
        let cutoff = now - Duration::seconds(self.config.stale_cutoff_secs);
        let stale = self.store.list_stale_in_progress(cutoff).await?;

        let mut repaired = Vec::new();
        for record in stale {
            let Some(journal_id) = referenced_journal(&record) else {
                warn!(record_id = %record.record_id, "stale record has no journal reference");
                continue;
            };
            let journal = match self.store.get_journal(&journal_id).await {
                Ok(journal) => journal,
                Err(StoreError::NotFound(_)) => {
                    warn!(record_id = %record.record_id, journal_id, "referenced journal absent");
                    continue;
                }
                Err(error) => return Err(error.into()),
            };
            if journal.state != JournalState::Posted {
                warn!(record_id = %record.record_id, journal_id, "referenced journal not POSTED");
                continue;
            }

            let mut result: serde_json::Value = serde_json::from_str(&record.result_json)
                .unwrap_or_else(|_| serde_json::json!({}));
            if !result.is_object() {
                result = serde_json::json!({});
            }
            result["journal_id"] = serde_json::Value::String(journal_id.clone());
            result["state"] = serde_json::Value::String("POSTED".into());

            let updated = self
                .store
                .update_idempotency_result(
                    &record.record_id,
                    result.to_string(),
                    IdempotencyStatus::Completed,
                )
                .await?;
            self.emit(
                EVENT_STATE_REPAIRED,
                "IDEMPOTENCY_RECORD",
                &updated.record_id,
                &journal.correlation_id,
                serde_json::json!({
                    "record_id": updated.record_id,
                    "journal_id": journal_id,
                }),
            )
            .await;
            info!(record_id = %updated.record_id, journal_id, "stale record completed");
            repaired.push(updated);
        }
        Ok(repaired)
    }

    async fn emit(
        &self,
        name: &str,
        entity_type: &str,
        entity_id: &str,
        correlation_id: &str,
        payload: serde_json::Value,
    ) {
        let event = Event {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            correlation_id: correlation_id.to_string(),
            causation_id: None,
            actor_type: "SYSTEM".into(),
            actor_id: "repair".into(),
            schema_version: 1,
            payload_json: payload,
            created_at: Utc::now(),
        };
        if let Err(error) = self.store.append_event(event).await {
            warn!(%error, "failed to record repair event");
        }
    }
}

fn reconstruct_receipt(journal: &LedgerJournal, lines: &[LedgerLine]) -> Receipt {
    Receipt {
        journal_id: journal.id.clone(),
        state: JournalState::Posted,
        entries: lines
            .iter()
            .map(|line| ReceiptEntry {
                account_id: line.account_id.clone(),
                entry_type: line.entry_type,
                amount: format_amount(line.amount),
                description: None,
            })
            .collect(),
        created_at: journal.created_at,
        correlation_id: journal.correlation_id.clone(),
        txn_type: journal.txn_type,
        currency: journal.currency.clone(),
    }
}

fn referenced_journal(record: &IdempotencyRecord) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(&record.result_json).ok()?;
    value
        .get("journal_id")
        .and_then(|id| id.as_str())
        .map(str::to_string)
}

fn hash_entries(lines: &[LedgerLine]) -> Vec<HashEntry> {
    lines
        .iter()
        .map(|line| HashEntry {
            account_id: line.account_id.clone(),
            entry_type: line.entry_type.as_str().to_string(),
            amount: line.amount,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pesa_ledger::Account;
    use pesa_ledger::AccountType;
    use pesa_ledger::AuditRecord;
    use pesa_ledger::BalanceDelta;
    use pesa_ledger::EntryType;
    use pesa_ledger::EventFilter;
    use pesa_ledger::InMemoryLedgerStore;
    use pesa_ledger::JournalBundle;
    use pesa_ledger::OwnerType;
    use pesa_ledger::TxnType;
    use pretty_assertions::assert_eq;

    async fn seed_account(store: &InMemoryLedgerStore, id: &str, account_type: AccountType) {
        store
            .insert_account(Account {
                id: id.into(),
                owner_type: OwnerType::Customer,
                owner_id: format!("owner-{id}"),
                account_type,
                currency: "BBD".into(),
                created_at: Utc::now(),
            })
            .await
            .expect("insert account");
    }

    /// Commits a POSTED deposit journal whose idempotency record carries
    /// an unrelated scope hash, leaving the journal's own scope without
    /// a record.
    async fn commit_orphaned_journal(
        store: &InMemoryLedgerStore,
        journal_id: &str,
        prev_hash: &str,
        state: JournalState,
    ) -> LedgerJournal {
        let now = Utc::now();
        let journal = LedgerJournal {
            id: journal_id.into(),
            txn_type: TxnType::Deposit,
            currency: "BBD".into(),
            correlation_id: format!("corr-{journal_id}"),
            idempotency_key: format!("key-{journal_id}"),
            state,
            initiator_actor_type: "AGENT".into(),
            initiator_actor_id: "agent-1".into(),
            prev_hash: prev_hash.into(),
            hash: format!("hash-{journal_id}"),
            created_at: now,
        };
        store
            .insert_journal_bundle(JournalBundle {
                journal: journal.clone(),
                lines: vec![
                    LedgerLine {
                        id: format!("{journal_id}-dr"),
                        journal_id: journal_id.into(),
                        account_id: "clearing-1".into(),
                        entry_type: EntryType::Dr,
                        amount: 10_000,
                        created_at: now,
                    },
                    LedgerLine {
                        id: format!("{journal_id}-cr"),
                        journal_id: journal_id.into(),
                        account_id: "wallet-1".into(),
                        entry_type: EntryType::Cr,
                        amount: 10_000,
                        created_at: now,
                    },
                ],
                balance_deltas: vec![
                    BalanceDelta {
                        account_id: "clearing-1".into(),
                        currency: "BBD".into(),
                        delta_cents: -10_000,
                    },
                    BalanceDelta {
                        account_id: "wallet-1".into(),
                        currency: "BBD".into(),
                        delta_cents: 10_000,
                    },
                ],
                events: Vec::new(),
                audit: AuditRecord {
                    id: format!("aud-{journal_id}"),
                    action: "DEPOSIT_POSTED".into(),
                    actor_type: "AGENT".into(),
                    actor_id: "agent-1".into(),
                    target_type: "LEDGER_JOURNAL".into(),
                    target_id: journal_id.into(),
                    before_json: None,
                    after_json: None,
                    correlation_id: format!("corr-{journal_id}"),
                    created_at: now,
                },
                idempotency: IdempotencyRecord {
                    record_id: format!("rec-unrelated-{journal_id}"),
                    scope_hash: format!("scope-unrelated-{journal_id}"),
                    payload_hash: "payload-unrelated".into(),
                    result_json: "{}".into(),
                    status: IdempotencyStatus::Completed,
                    created_at: now,
                    expires_at: now + Duration::days(90),
                },
            })
            .await
            .expect("bundle commits");
        journal
    }

    #[tokio::test]
    async fn backfill_reconstructs_a_completed_record() {
        let store = Arc::new(InMemoryLedgerStore::new());
        seed_account(&store, "wallet-1", AccountType::Wallet).await;
        seed_account(&store, "clearing-1", AccountType::BankClearing).await;
        let journal =
            commit_orphaned_journal(&store, "jrn-1", "", JournalState::Posted).await;

        let repair = RepairService::new(store.clone());
        let record = repair
            .backfill_idempotency("jrn-1")
            .await
            .expect("backfill succeeds");

        assert_eq!(record.status, IdempotencyStatus::Completed);
        let receipt: Receipt =
            serde_json::from_str(&record.result_json).expect("receipt parses");
        assert_eq!(receipt.journal_id, "jrn-1");
        assert_eq!(receipt.state, JournalState::Posted);
        assert_eq!(receipt.entries.len(), 2);
        assert_eq!(receipt.correlation_id, journal.correlation_id);

        let expected_scope = scope_hash("AGENT", "agent-1", "DEPOSIT", "key-jrn-1");
        assert_eq!(record.scope_hash, expected_scope);

        let events = store
            .list_events(EventFilter {
                name: Some(EVENT_REPAIR_EXECUTED.into()),
                entity_id: Some("jrn-1".into()),
                ..Default::default()
            })
            .await
            .expect("events");
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn backfill_refuses_existing_record_and_non_posted_journal() {
        let store = Arc::new(InMemoryLedgerStore::new());
        seed_account(&store, "wallet-1", AccountType::Wallet).await;
        seed_account(&store, "clearing-1", AccountType::BankClearing).await;
        commit_orphaned_journal(&store, "jrn-1", "", JournalState::Posted).await;
        commit_orphaned_journal(&store, "jrn-2", "hash-jrn-1", JournalState::Reversed).await;

        let repair = RepairService::new(store.clone());
        repair
            .backfill_idempotency("jrn-1")
            .await
            .expect("first backfill succeeds");
        let err = repair
            .backfill_idempotency("jrn-1")
            .await
            .expect_err("second backfill refused");
        assert!(matches!(err, RepairError::RecordAlreadyExists(_)));

        let err = repair
            .backfill_idempotency("jrn-2")
            .await
            .expect_err("non-POSTED journal refused");
        assert!(matches!(err, RepairError::JournalNotPosted(_)));

        let err = repair
            .backfill_idempotency("jrn-ghost")
            .await
            .expect_err("unknown journal refused");
        assert!(matches!(err, RepairError::NotFound(_)));
    }

    #[tokio::test]
    async fn stale_in_progress_record_is_completed() {
        let store = Arc::new(InMemoryLedgerStore::new());
        seed_account(&store, "wallet-1", AccountType::Wallet).await;
        seed_account(&store, "clearing-1", AccountType::BankClearing).await;
        commit_orphaned_journal(&store, "jrn-1", "", JournalState::Posted).await;

        let now = Utc::now();
        store
            .insert_idempotency(IdempotencyRecord {
                record_id: "rec-stale".into(),
                scope_hash: "scope-stale".into(),
                payload_hash: "payload-stale".into(),
                result_json: "{\"journal_id\":\"jrn-1\",\"state\":\"IN_PROGRESS\"}".into(),
                status: IdempotencyStatus::InProgress,
                created_at: now - Duration::minutes(10),
                expires_at: now + Duration::days(90),
            })
            .await
            .expect("seed stale record");

        let repair = RepairService::new(store.clone());
        let repaired = repair.complete_stale(now).await.expect("sweep succeeds");
        assert_eq!(repaired.len(), 1);
        assert_eq!(repaired[0].status, IdempotencyStatus::Completed);

        let result: serde_json::Value =
            serde_json::from_str(&repaired[0].result_json).expect("result parses");
        assert_eq!(result["state"], "POSTED");
        assert_eq!(result["journal_id"], "jrn-1");

        let events = store
            .list_events(EventFilter {
                name: Some(EVENT_STATE_REPAIRED.into()),
                entity_id: Some("rec-stale".into()),
                ..Default::default()
            })
            .await
            .expect("events");
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn sweep_skips_fresh_missing_and_unposted_cases() {
        let store = Arc::new(InMemoryLedgerStore::new());
        seed_account(&store, "wallet-1", AccountType::Wallet).await;
        seed_account(&store, "clearing-1", AccountType::BankClearing).await;
        commit_orphaned_journal(&store, "jrn-rev", "", JournalState::Reversed).await;

        let now = Utc::now();
        for (id, age_minutes, result_json) in [
            // Too fresh to be stale.
            ("rec-fresh", 1, "{\"journal_id\":\"jrn-rev\"}"),
            // Journal reference missing entirely.
            ("rec-no-ref", 10, "{}"),
            // Journal absent from the ledger.
            ("rec-ghost", 10, "{\"journal_id\":\"jrn-ghost\"}"),
            // Journal exists but is not POSTED.
            ("rec-unposted", 10, "{\"journal_id\":\"jrn-rev\"}"),
        ] {
            store
                .insert_idempotency(IdempotencyRecord {
                    record_id: id.into(),
                    scope_hash: format!("scope-{id}"),
                    payload_hash: "payload".into(),
                    result_json: result_json.into(),
                    status: IdempotencyStatus::InProgress,
                    created_at: now - Duration::minutes(age_minutes),
                    expires_at: now + Duration::days(90),
                })
                .await
                .expect("seed record");
        }

        let repair = RepairService::new(store.clone());
        let repaired = repair.complete_stale(now).await.expect("sweep succeeds");
        assert!(repaired.is_empty());

        for scope in ["scope-rec-fresh", "scope-rec-no-ref", "scope-rec-ghost", "scope-rec-unposted"] {
            let record = store
                .lookup_by_scope_hash(scope)
                .await
                .expect("lookup")
                .expect("record kept");
            assert_eq!(record.status, IdempotencyStatus::InProgress);
        }
    }

    #[tokio::test]
    async fn repair_never_touches_journals_or_lines() {
        let store = Arc::new(InMemoryLedgerStore::new());
        seed_account(&store, "wallet-1", AccountType::Wallet).await;
        seed_account(&store, "clearing-1", AccountType::BankClearing).await;
        commit_orphaned_journal(&store, "jrn-1", "", JournalState::Posted).await;

        let journals_before = store.journals_ordered(None, None).await.expect("journals");
        let lines_before = store.list_lines("jrn-1").await.expect("lines");

        let now = Utc::now();
        store
            .insert_idempotency(IdempotencyRecord {
                record_id: "rec-stale".into(),
                scope_hash: "scope-stale".into(),
                payload_hash: "payload".into(),
                result_json: "{\"journal_id\":\"jrn-1\",\"state\":\"IN_PROGRESS\"}".into(),
                status: IdempotencyStatus::InProgress,
                created_at: now - Duration::minutes(10),
                expires_at: now + Duration::days(90),
            })
            .await
            .expect("seed record");

        let repair = RepairService::new(store.clone());
        repair.backfill_idempotency("jrn-1").await.expect("backfill");
        repair.complete_stale(now).await.expect("sweep");

        assert_eq!(
            store.journals_ordered(None, None).await.expect("journals"),
            journals_before
        );
        assert_eq!(store.list_lines("jrn-1").await.expect("lines"), lines_before);
    }
}
