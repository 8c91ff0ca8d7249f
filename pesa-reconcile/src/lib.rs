#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Reconciliation and integrity verification.
//!
//! Both subsystems read ledger truth and only ever write runs, findings,
//! and events. Neither touches a balance, a journal, or a line — even
//! for CRITICAL findings, surfacing is the whole job.

use std::sync::Arc;

use chrono::Utc;
use pesa_amount::HashEntry;
use pesa_amount::format_amount;
use pesa_amount::journal_hash;
use pesa_ledger::Event;
use pesa_ledger::FindingStatus;
use pesa_ledger::LedgerLine;
use pesa_ledger::LedgerStore;
use pesa_ledger::ReconciliationFinding;
use pesa_ledger::ReconciliationRun;
use pesa_ledger::RunStatus;
use pesa_ledger::Severity;
use pesa_ledger::StoreError;
use thiserror::Error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

pub const EVENT_RECONCILIATION_MISMATCH: &str = "RECONCILIATION_MISMATCH";
pub const EVENT_INTEGRITY_CHECK_FAILED: &str = "INTEGRITY_CHECK_FAILED";

/// Sentinel stored in a finding's `discrepancy` field when the hash
/// chain, not a balance, diverged.
pub const HASH_MISMATCH: &str = "HASH_MISMATCH";

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

/// Severity ladder over the absolute discrepancy in cents.
#[must_use]
pub fn classify_severity(discrepancy_cents: i64) -> Severity {
    let magnitude = discrepancy_cents.unsigned_abs();
    if magnitude >= 100_000 {
        Severity::Critical
    } else if magnitude >= 10_000 {
        Severity::High
    } else if magnitude >= 100 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub run: ReconciliationRun,
    pub findings: Vec<ReconciliationFinding>,
}

/// Compares computed balances (Σ CR − Σ DR over lines) against the
/// materialized rows, one account at a time.
pub struct Reconciler {
    store: Arc<dyn LedgerStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn run_once(&self) -> ReconcileResult<ReconcileReport> {
        let run = self
            .store
            .create_run(ReconciliationRun {
                id: Uuid::new_v4().to_string(),
                started_at: Utc::now(),
                finished_at: None,
                status: RunStatus::Running,
                accounts_checked: 0,
                mismatches_found: 0,
                summary_json: serde_json::json!({ "kind": "balance" }),
            })
            .await?;

        match self.scan(&run.id).await {
            Ok((accounts_checked, findings)) => {
                let run = self
                    .store
                    .finish_run(
                        &run.id,
                        RunStatus::Completed,
                        accounts_checked,
                        findings.len() as u64,
                        serde_json::json!({
                            "kind": "balance",
                            "accounts_checked": accounts_checked,
                            "mismatches_found": findings.len(),
                        }),
                        Utc::now(),
                    )
                    .await?;
                info!(
                    run_id = %run.id,
                    accounts_checked,
                    mismatches = findings.len(),
                    "reconciliation run completed"
                );
                Ok(ReconcileReport { run, findings })
            }
            Err(error) => {
                // The failed run keeps its error in summary_json; the
                // original error still propagates to the caller.
                let _ = self
                    .store
                    .finish_run(
                        &run.id,
                        RunStatus::Failed,
                        0,
                        0,
                        serde_json::json!({ "kind": "balance", "error": error.to_string() }),
                        Utc::now(),
                    )
                    .await;
                Err(error)
            }
        }
    }

    async fn scan(
        &self,
        run_id: &str,
    ) -> ReconcileResult<(u64, Vec<ReconciliationFinding>)> {
        let mut findings = Vec::new();
        let account_ids = self.store.list_account_ids().await?;
        for account_id in &account_ids {
            let account = self.store.get_account(account_id).await?;
            let computed = self.store.sum_lines(account_id).await?;
            let materialized = self.store.get_balance(account_id).await?;
            let discrepancy = computed - materialized;
            if discrepancy == 0 {
                continue;
            }

            let severity = classify_severity(discrepancy);
            warn!(
                account_id = %account_id,
                expected = computed,
                actual = materialized,
                ?severity,
                "materialized balance diverges from ledger"
            );
            let finding = self
                .store
                .insert_finding(ReconciliationFinding {
                    id: Uuid::new_v4().to_string(),
                    run_id: run_id.to_string(),
                    account_id: account_id.clone(),
                    currency: account.currency.clone(),
                    expected_balance: format_amount(computed),
                    actual_balance: format_amount(materialized),
                    discrepancy: format_amount(discrepancy),
                    severity,
                    status: FindingStatus::Open,
                })
                .await?;
            self.store
                .append_event(mismatch_event(
                    EVENT_RECONCILIATION_MISMATCH,
                    "ACCOUNT",
                    account_id,
                    serde_json::json!({
                        "run_id": run_id,
                        "account_id": account_id,
                        "currency": account.currency,
                        "discrepancy": finding.discrepancy,
                        "severity": severity,
                    }),
                ))
                .await?;
            findings.push(finding);
        }
        Ok((account_ids.len() as u64, findings))
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub run: ReconciliationRun,
    pub journals_checked: u64,
    pub findings: Vec<ReconciliationFinding>,
}

/// Walks the journal chain in `(created_at ASC, id ASC)` order,
/// rehashing each journal from its observed fields and the previous
/// *computed* hash. Read-only over ledger tables.
pub struct IntegrityVerifier {
    store: Arc<dyn LedgerStore>,
}

impl IntegrityVerifier {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn verify(&self) -> ReconcileResult<IntegrityReport> {
        let run = self
            .store
            .create_run(ReconciliationRun {
                id: Uuid::new_v4().to_string(),
                started_at: Utc::now(),
                finished_at: None,
                status: RunStatus::Running,
                accounts_checked: 0,
                mismatches_found: 0,
                summary_json: serde_json::json!({ "kind": "integrity" }),
            })
            .await?;

        let journals = self.store.journals_ordered(None, None).await?;
        let mut findings = Vec::new();
        let mut prev = String::new();
        for journal in &journals {
            let lines = self.store.list_lines(&journal.id).await?;
            let recomputed = journal_hash(
                &prev,
                &journal.id,
                &journal.currency,
                journal.txn_type.as_str(),
                &hash_entries(&lines),
            );

            if journal.prev_hash != prev || journal.hash != recomputed {
                warn!(journal_id = %journal.id, "hash chain mismatch");
                let finding = self
                    .store
                    .insert_finding(ReconciliationFinding {
                        id: Uuid::new_v4().to_string(),
                        run_id: run.id.clone(),
                        account_id: journal.id.clone(),
                        currency: journal.currency.clone(),
                        expected_balance: recomputed.clone(),
                        actual_balance: journal.hash.clone(),
                        discrepancy: HASH_MISMATCH.into(),
                        severity: Severity::Critical,
                        status: FindingStatus::Open,
                    })
                    .await?;
                self.store
                    .append_event(mismatch_event(
                        EVENT_INTEGRITY_CHECK_FAILED,
                        "LEDGER_JOURNAL",
                        &journal.id,
                        serde_json::json!({
                            "run_id": run.id,
                            "journal_id": journal.id,
                            "expected_hash": recomputed,
                            "stored_hash": journal.hash,
                        }),
                    ))
                    .await?;
                findings.push(finding);
            }

            prev = recomputed;
        }

        let status = RunStatus::Completed;
        let run = self
            .store
            .finish_run(
                &run.id,
                status,
                journals.len() as u64,
                findings.len() as u64,
                serde_json::json!({
                    "kind": "integrity",
                    "journals_checked": journals.len(),
                    "mismatches_found": findings.len(),
                }),
                Utc::now(),
            )
            .await?;
        info!(
            run_id = %run.id,
            journals_checked = journals.len(),
            mismatches = findings.len(),
            "integrity walk completed"
        );
        Ok(IntegrityReport {
            run,
            journals_checked: journals.len() as u64,
            findings,
        })
    }
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

fn mismatch_event(
    name: &str,
    entity_type: &str,
    entity_id: &str,
    payload: serde_json::Value,
) -> Event {
    Event {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        entity_type: entity_type.to_string(),
        entity_id: entity_id.to_string(),
        correlation_id: Uuid::new_v4().to_string(),
        causation_id: None,
        actor_type: "SYSTEM".into(),
        actor_id: "reconciliation".into(),
        schema_version: 1,
        payload_json: payload,
        created_at: Utc::now(),
    }
}
