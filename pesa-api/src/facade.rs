use std::sync::Arc;

use pesa_amount::parse_amount;
use pesa_approvals::ApprovalService;
use pesa_approvals::ApprovalsResult;
use pesa_approvals::Decision;
use pesa_approvals::SubmitRequest;
use pesa_engine::EngineConfig;
use pesa_engine::PostingCommand;
use pesa_engine::PostingEngine;
use pesa_engine::Receipt;
use pesa_ledger::ApprovalRequest;
use pesa_ledger::EntrySpec;
use pesa_ledger::EntryType;
use pesa_ledger::IdempotencyRecord;
use pesa_ledger::LedgerStore;
use pesa_ledger::TxnType;
use pesa_reconcile::IntegrityReport;
use pesa_reconcile::IntegrityVerifier;
use pesa_reconcile::ReconcileReport;
use pesa_reconcile::ReconcileResult;
use pesa_reconcile::Reconciler;
use pesa_repair::RepairConfig;
use pesa_repair::RepairResult;
use pesa_repair::RepairService;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::ErrorBody;

/// One posting leg on the wire: amount is a decimal string, entry type
/// the literal `DR`/`CR` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryBody {
    pub account_id: String,
    pub entry_type: EntryType,
    pub amount: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostTransactionRequest {
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub actor_type: String,
    pub actor_id: String,
    pub txn_type: TxnType,
    pub currency: String,
    pub entries: Vec<EntryBody>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission_version_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceBody {
    pub account_id: String,
    pub balance: String,
}

/// Wires the posting engine and its guard subsystems over one shared
/// store. The `post_transaction`/`get_balance` pair is the public wire
/// surface; the remaining operations are operator entry points invoked
/// by schedulers and admin tooling.
pub struct PesaFacade {
    engine: PostingEngine,
    reconciler: Reconciler,
    verifier: IntegrityVerifier,
    repair: RepairService,
    approvals: ApprovalService,
    store: Arc<dyn LedgerStore>,
}

impl PesaFacade {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_config(store, EngineConfig::default(), RepairConfig::default())
    }

    /// Environment-driven construction (`PESA_*` variables).
    pub fn from_env(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_config(store, EngineConfig::from_env(), RepairConfig::from_env())
    }

    pub fn with_config(
        store: Arc<dyn LedgerStore>,
        engine_config: EngineConfig,
        repair_config: RepairConfig,
    ) -> Self {
        Self {
            engine: PostingEngine::with_config(store.clone(), engine_config),
            reconciler: Reconciler::new(store.clone()),
            verifier: IntegrityVerifier::new(store.clone()),
            repair: RepairService::with_config(store.clone(), repair_config),
            approvals: ApprovalService::new(store.clone()),
            store,
        }
    }

    /// `POST /post` equivalent: returns the receipt or the error
    /// envelope, always carrying the correlation id.
    pub async fn post_transaction(
        &self,
        request: PostTransactionRequest,
    ) -> Result<Receipt, ErrorBody> {
        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let command = build_command(request, &correlation_id)?;
        info!(
            correlation_id = %correlation_id,
            txn_type = command.txn_type.as_str(),
            "posting command accepted"
        );
        self.engine
            .post_transaction(command)
            .await
            .map_err(|error| ErrorBody::from_engine(&error, Some(&correlation_id)))
    }

    /// `GET balance?account_id=…` equivalent.
    pub async fn get_balance(&self, account_id: &str) -> Result<BalanceBody, ErrorBody> {
        if account_id.trim().is_empty() {
            return Err(ErrorBody::missing_field("account_id", None));
        }
        self.engine
            .get_balance(account_id)
            .await
            .map(|balance| BalanceBody {
                account_id: account_id.to_string(),
                balance,
            })
            .map_err(|error| ErrorBody::from_engine(&error, None))
    }

    // Background and operator entry points.

    pub async fn run_reconciliation(&self) -> ReconcileResult<ReconcileReport> {
        self.reconciler.run_once().await
    }

    pub async fn verify_integrity(&self) -> ReconcileResult<IntegrityReport> {
        self.verifier.verify().await
    }

    pub async fn backfill_idempotency(&self, journal_id: &str) -> RepairResult<IdempotencyRecord> {
        self.repair.backfill_idempotency(journal_id).await
    }

    pub async fn complete_stale_postings(&self) -> RepairResult<Vec<IdempotencyRecord>> {
        self.repair.complete_stale(chrono::Utc::now()).await
    }

    /// TTL sweeper for the idempotency table; purged scopes become
    /// re-insertable.
    pub async fn purge_expired_idempotency(&self) -> Result<usize, ErrorBody> {
        self.store
            .purge_expired(chrono::Utc::now())
            .await
            .map_err(|error| ErrorBody::new(error.to_string(), 500, "INTERNAL_ERROR"))
    }

    pub async fn submit_approval(&self, request: SubmitRequest) -> ApprovalsResult<ApprovalRequest> {
        self.approvals.submit(request).await
    }

    pub async fn decide_approval(
        &self,
        approval_id: &str,
        checker_staff_id: &str,
        decision: Decision,
        reason: Option<String>,
    ) -> ApprovalsResult<ApprovalRequest> {
        self.approvals
            .decide(approval_id, checker_staff_id, decision, reason)
            .await
    }

    pub async fn cancel_approval(
        &self,
        approval_id: &str,
        maker_staff_id: &str,
    ) -> ApprovalsResult<ApprovalRequest> {
        self.approvals.cancel(approval_id, maker_staff_id).await
    }
}

fn build_command(
    request: PostTransactionRequest,
    correlation_id: &str,
) -> Result<PostingCommand, ErrorBody> {
    if request.entries.is_empty() {
        return Err(ErrorBody::missing_field("entries", Some(correlation_id)));
    }

    let mut entries = Vec::with_capacity(request.entries.len());
    for entry in request.entries {
        let amount = parse_amount(&entry.amount)
            .map_err(|_| ErrorBody::malformed_amount(&entry.amount, Some(correlation_id)))?;
        entries.push(EntrySpec {
            account_id: entry.account_id,
            entry_type: entry.entry_type,
            amount,
            description: entry.description,
        });
    }

    Ok(PostingCommand {
        idempotency_key: request.idempotency_key,
        correlation_id: correlation_id.to_string(),
        actor_type: request.actor_type,
        actor_id: request.actor_id,
        txn_type: request.txn_type,
        currency: request.currency,
        entries,
        description: request.description,
        fee_version_id: request.fee_version_id,
        commission_version_id: request.commission_version_id,
    })
}
