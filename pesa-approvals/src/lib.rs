#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Maker–checker gating for sensitive operations.
//!
//! A maker submits a PENDING request; a different staff member approves
//! or rejects it. The proposer-and-decider-must-differ rule is enforced
//! here and again by the store, mirroring a database CHECK constraint.

use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use pesa_ledger::ApprovalRequest;
use pesa_ledger::ApprovalState;
use pesa_ledger::AuditRecord;
use pesa_ledger::LedgerStore;
use pesa_ledger::OverdraftFacility;
use pesa_ledger::OverdraftState;
use pesa_ledger::StoreError;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const TYPE_REVERSAL: &str = "REVERSAL";
pub const TYPE_MANUAL_ADJUSTMENT: &str = "MANUAL_ADJUSTMENT";
pub const TYPE_FEE_MATRIX_CHANGE: &str = "FEE_MATRIX_CHANGE";
pub const TYPE_OVERDRAFT_FACILITY: &str = "OVERDRAFT_FACILITY";

pub type ApprovalsResult<T> = Result<T, ApprovalsError>;

#[derive(Debug, Error)]
pub enum ApprovalsError {
    #[error("approval request not found: {0}")]
    NotFound(String),
    #[error("maker and checker must differ")]
    SelfApproval,
    #[error("approval request {0} is not pending")]
    NotPending(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<StoreError> for ApprovalsError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(what) => ApprovalsError::NotFound(what),
            StoreError::MakerCheckerViolation(_) => ApprovalsError::SelfApproval,
            StoreError::InvalidTransition(what) => ApprovalsError::NotPending(what),
            other => ApprovalsError::Storage(other.to_string()),
        }
    }
}

/// Payload required in `after_json` for `OVERDRAFT_FACILITY` requests;
/// approval activates exactly this facility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverdraftGrant {
    pub account_id: String,
    pub limit_cents: i64,
    pub effective_from: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub type_key: String,
    pub maker_staff_id: String,
    pub before_json: Option<serde_json::Value>,
    pub after_json: Option<serde_json::Value>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

pub struct ApprovalService {
    store: Arc<dyn LedgerStore>,
}

impl ApprovalService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn submit(&self, request: SubmitRequest) -> ApprovalsResult<ApprovalRequest> {
        if request.type_key.trim().is_empty() {
            return Err(ApprovalsError::Validation("type_key must be provided".into()));
        }
        if request.maker_staff_id.trim().is_empty() {
            return Err(ApprovalsError::Validation(
                "maker_staff_id must be provided".into(),
            ));
        }
        if request.type_key == TYPE_OVERDRAFT_FACILITY {
            // Fail bad grants at submission, not at decision time.
            parse_grant(request.after_json.as_ref())?;
        }

        let pending = self
            .store
            .insert_approval(ApprovalRequest {
                id: Uuid::new_v4().to_string(),
                type_key: request.type_key,
                maker_staff_id: request.maker_staff_id,
                checker_staff_id: None,
                state: ApprovalState::Pending,
                before_json: request.before_json,
                after_json: request.after_json,
                reason: request.reason,
                created_at: Utc::now(),
                decided_at: None,
            })
            .await?;
        info!(approval_id = %pending.id, type_key = %pending.type_key, "approval submitted");
        Ok(pending)
    }

    pub async fn decide(
        &self,
        approval_id: &str,
        checker_staff_id: &str,
        decision: Decision,
        reason: Option<String>,
    ) -> ApprovalsResult<ApprovalRequest> {
        let pending = self.store.get_approval(approval_id).await?;
        if pending.state != ApprovalState::Pending {
            return Err(ApprovalsError::NotPending(approval_id.to_string()));
        }
        if pending.maker_staff_id == checker_staff_id {
            return Err(ApprovalsError::SelfApproval);
        }

        let decided = self
            .store
            .update_approval(ApprovalRequest {
                checker_staff_id: Some(checker_staff_id.to_string()),
                state: match decision {
                    Decision::Approve => ApprovalState::Approved,
                    Decision::Reject => ApprovalState::Rejected,
                },
                reason: reason.or(pending.reason.clone()),
                decided_at: Some(Utc::now()),
                ..pending.clone()
            })
            .await?;

        if decided.state == ApprovalState::Approved
            && decided.type_key == TYPE_OVERDRAFT_FACILITY
        {
            self.activate_overdraft(&decided).await?;
        }

        self.audit_decision(&pending, &decided, checker_staff_id).await?;
        info!(
            approval_id = %decided.id,
            state = ?decided.state,
            checker = checker_staff_id,
            "approval decided"
        );
        Ok(decided)
    }

    pub async fn cancel(
        &self,
        approval_id: &str,
        maker_staff_id: &str,
    ) -> ApprovalsResult<ApprovalRequest> {
        let pending = self.store.get_approval(approval_id).await?;
        if pending.state != ApprovalState::Pending {
            return Err(ApprovalsError::NotPending(approval_id.to_string()));
        }
        if pending.maker_staff_id != maker_staff_id {
            return Err(ApprovalsError::Validation(
                "only the maker may cancel a pending request".into(),
            ));
        }

        let cancelled = self
            .store
            .update_approval(ApprovalRequest {
                state: ApprovalState::Cancelled,
                decided_at: Some(Utc::now()),
                ..pending.clone()
            })
            .await?;
        self.audit_decision(&pending, &cancelled, maker_staff_id).await?;
        Ok(cancelled)
    }

    async fn activate_overdraft(&self, decided: &ApprovalRequest) -> ApprovalsResult<()> {
        let grant = parse_grant(decided.after_json.as_ref())?;
        self.store
            .insert_overdraft(OverdraftFacility {
                id: Uuid::new_v4().to_string(),
                account_id: grant.account_id,
                limit_cents: grant.limit_cents,
                state: OverdraftState::Active,
                effective_from: grant.effective_from,
                expires_at: grant.expires_at,
            })
            .await?;
        Ok(())
    }

    async fn audit_decision(
        &self,
        before: &ApprovalRequest,
        after: &ApprovalRequest,
        actor_id: &str,
    ) -> ApprovalsResult<()> {
        let action = match after.state {
            ApprovalState::Approved => "APPROVAL_APPROVED",
            ApprovalState::Rejected => "APPROVAL_REJECTED",
            ApprovalState::Cancelled => "APPROVAL_CANCELLED",
            ApprovalState::Pending => "APPROVAL_UPDATED",
        };
        self.store
            .append_audit(AuditRecord {
                id: Uuid::new_v4().to_string(),
                action: action.into(),
                actor_type: "STAFF".into(),
                actor_id: actor_id.to_string(),
                target_type: "APPROVAL_REQUEST".into(),
                target_id: after.id.clone(),
                before_json: serde_json::to_value(before).ok(),
                after_json: serde_json::to_value(after).ok(),
                correlation_id: after.id.clone(),
                created_at: Utc::now(),
            })
            .await?;
        Ok(())
    }
}

fn parse_grant(after_json: Option<&serde_json::Value>) -> ApprovalsResult<OverdraftGrant> {
    let value = after_json.ok_or_else(|| {
        ApprovalsError::Validation("overdraft requests require after_json".into())
    })?;
    serde_json::from_value(value.clone()).map_err(|error| {
        ApprovalsError::Validation(format!("overdraft grant is malformed: {error}"))
    })
}
