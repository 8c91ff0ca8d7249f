#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Domain types and the `LedgerStore` contract for the posting core.
//!
//! The store owns every persisted table: journals, lines, materialized
//! balances, idempotency records, events, audit rows, overdraft
//! facilities, reconciliation runs/findings, and approval requests.
//! Journals, lines, events, and audit rows are append-only; nothing ever
//! updates or deletes them after insert.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

mod memory;

pub use memory::InMemoryLedgerStore;

pub type AccountId = String;
pub type JournalId = String;
pub type LineId = String;
pub type RecordId = String;
pub type RunId = String;
pub type ApprovalId = String;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("scope hash already exists: {0}")]
    DuplicateScopeHash(String),
    #[error("concurrent write conflict: {0}")]
    ConcurrentWriteConflict(String),
    #[error("journal does not balance: {0}")]
    UnbalancedJournal(String),
    #[error("currency mismatch: {0}")]
    CurrencyMismatch(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("maker and checker must differ: {0}")]
    MakerCheckerViolation(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OwnerType {
    Customer,
    Agent,
    Merchant,
    Business,
    Platform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountType {
    Wallet,
    CashFloat,
    FeeRevenue,
    CommissionPayable,
    Suspense,
    BankClearing,
}

impl AccountType {
    /// Whether debits against this account are bounded by its balance
    /// plus any overdraft. Platform accounts (clearing, suspense,
    /// revenue, payables) book value entering or leaving the system and
    /// may swing negative.
    #[must_use]
    pub fn requires_funds_check(self) -> bool {
        matches!(self, AccountType::Wallet | AccountType::CashFloat)
    }
}

/// Accounts are registered once and never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub owner_type: OwnerType,
    pub owner_id: String,
    pub account_type: AccountType,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnType {
    #[serde(rename = "DEPOSIT")]
    Deposit,
    #[serde(rename = "WITHDRAWAL")]
    Withdrawal,
    #[serde(rename = "P2P")]
    P2p,
    #[serde(rename = "PAYMENT")]
    Payment,
    #[serde(rename = "B2B")]
    B2b,
    #[serde(rename = "FLOAT_TOPUP")]
    FloatTopup,
    #[serde(rename = "FLOAT_WITHDRAWAL")]
    FloatWithdrawal,
    #[serde(rename = "REVERSAL")]
    Reversal,
    #[serde(rename = "ADJUSTMENT")]
    Adjustment,
}

impl TxnType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TxnType::Deposit => "DEPOSIT",
            TxnType::Withdrawal => "WITHDRAWAL",
            TxnType::P2p => "P2P",
            TxnType::Payment => "PAYMENT",
            TxnType::B2b => "B2B",
            TxnType::FloatTopup => "FLOAT_TOPUP",
            TxnType::FloatWithdrawal => "FLOAT_WITHDRAWAL",
            TxnType::Reversal => "REVERSAL",
            TxnType::Adjustment => "ADJUSTMENT",
        }
    }
}

/// `IN_PROGRESS` exists only on the idempotency record, never on a
/// journal: a journal row is written only once the posting is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JournalState {
    Posted,
    Reversed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntryType {
    #[serde(rename = "DR")]
    Dr,
    #[serde(rename = "CR")]
    Cr,
}

impl EntryType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::Dr => "DR",
            EntryType::Cr => "CR",
        }
    }
}

/// Immutable after insert. `initiator_actor_type` is carried alongside
/// the actor id so a lost idempotency record can be reconstructed from
/// the journal alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerJournal {
    pub id: JournalId,
    pub txn_type: TxnType,
    pub currency: String,
    pub correlation_id: String,
    pub idempotency_key: String,
    pub state: JournalState,
    pub initiator_actor_type: String,
    pub initiator_actor_id: String,
    pub prev_hash: String,
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

/// Immutable after insert. Amounts are signed cents; builders only ever
/// produce positive magnitudes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerLine {
    pub id: LineId,
    pub journal_id: JournalId,
    pub account_id: AccountId,
    pub entry_type: EntryType,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// A requested posting leg before it becomes a ledger line. Template
/// builders produce these; the engine turns them into `LedgerLine`s at
/// commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySpec {
    pub account_id: AccountId,
    pub entry_type: EntryType,
    pub amount: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Materialized per-account total. Derivable truth is Σ(CR) − Σ(DR) over
/// the account's ledger lines; reconciliation compares the two.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
    pub account_id: AccountId,
    pub currency: String,
    pub balance_cents: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverdraftState {
    Pending,
    Active,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverdraftFacility {
    pub id: String,
    pub account_id: AccountId,
    pub limit_cents: i64,
    pub state: OverdraftState,
    pub effective_from: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OverdraftFacility {
    /// Effective only while ACTIVE and inside the validity window.
    #[must_use]
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.state == OverdraftState::Active && self.effective_from <= now && now < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    InProgress,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, IdempotencyStatus::Completed | IdempotencyStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub record_id: RecordId,
    pub scope_hash: String,
    pub payload_hash: String,
    pub result_json: String,
    pub status: IdempotencyStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Append-only event stream row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub entity_id: String,
    pub correlation_id: String,
    pub causation_id: Option<String>,
    pub actor_type: String,
    pub actor_id: String,
    pub schema_version: u32,
    pub payload_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit row with before/after snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub action: String,
    pub actor_type: String,
    pub actor_id: String,
    pub target_type: String,
    pub target_id: String,
    pub before_json: Option<serde_json::Value>,
    pub after_json: Option<serde_json::Value>,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub accounts_checked: u64,
    pub mismatches_found: u64,
    pub summary_json: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingStatus {
    Open,
    Resolved,
}

/// Balances are reported as decimal strings so wire consumers never see
/// raw cents; `discrepancy` is either a signed decimal string or the
/// literal `HASH_MISMATCH` for integrity findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationFinding {
    pub id: String,
    pub run_id: RunId,
    pub account_id: AccountId,
    pub currency: String,
    pub expected_balance: String,
    pub actual_balance: String,
    pub discrepancy: String,
    pub severity: Severity,
    pub status: FindingStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub type_key: String,
    pub maker_staff_id: String,
    pub checker_staff_id: Option<String>,
    pub state: ApprovalState,
    pub before_json: Option<serde_json::Value>,
    pub after_json: Option<serde_json::Value>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    /// The maker=checker CHECK-constraint equivalent.
    pub fn validate_separation(&self) -> StoreResult<()> {
        match &self.checker_staff_id {
            Some(checker) if checker == &self.maker_staff_id => Err(
                StoreError::MakerCheckerViolation(self.maker_staff_id.clone()),
            ),
            _ => Ok(()),
        }
    }
}

/// Signed balance adjustment applied with a journal commit: CR adds,
/// DR subtracts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceDelta {
    pub account_id: AccountId,
    pub currency: String,
    pub delta_cents: i64,
}

/// Everything a posting commits in one atomic step. Either all of it
/// becomes visible or none of it does.
#[derive(Debug, Clone)]
pub struct JournalBundle {
    pub journal: LedgerJournal,
    pub lines: Vec<LedgerLine>,
    pub balance_deltas: Vec<BalanceDelta>,
    pub events: Vec<Event>,
    pub audit: AuditRecord,
    pub idempotency: IdempotencyRecord,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub name: Option<String>,
    pub entity_id: Option<String>,
    pub correlation_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub action: Option<String>,
    pub target_id: Option<String>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Account directory.
    async fn insert_account(&self, account: Account) -> StoreResult<Account>;
    async fn get_account(&self, account_id: &str) -> StoreResult<Account>;
    async fn list_account_ids(&self) -> StoreResult<Vec<AccountId>>;

    // Journals and balances.
    async fn insert_journal_bundle(&self, bundle: JournalBundle) -> StoreResult<()>;
    async fn get_balance(&self, account_id: &str) -> StoreResult<i64>;
    async fn list_lines(&self, journal_id: &str) -> StoreResult<Vec<LedgerLine>>;
    async fn get_journal(&self, journal_id: &str) -> StoreResult<LedgerJournal>;
    async fn get_journal_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> StoreResult<Option<LedgerJournal>>;
    /// Hash of the most recently committed journal, or `""` when the
    /// ledger is empty.
    async fn latest_journal_hash(&self) -> StoreResult<String>;
    /// Journals inside the optional time window in
    /// `(created_at ASC, id ASC)` order for integrity walks.
    async fn journals_ordered(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<LedgerJournal>>;
    /// Σ(CR) − Σ(DR) over every committed line of the account.
    async fn sum_lines(&self, account_id: &str) -> StoreResult<i64>;

    // Overdraft facilities.
    async fn insert_overdraft(&self, facility: OverdraftFacility) -> StoreResult<OverdraftFacility>;
    async fn active_overdraft(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<OverdraftFacility>>;

    // Idempotency records.
    async fn lookup_by_scope_hash(
        &self,
        scope_hash: &str,
    ) -> StoreResult<Option<IdempotencyRecord>>;
    async fn insert_idempotency(&self, record: IdempotencyRecord) -> StoreResult<IdempotencyRecord>;
    async fn update_idempotency_result(
        &self,
        record_id: &str,
        result_json: String,
        status: IdempotencyStatus,
    ) -> StoreResult<IdempotencyRecord>;
    async fn list_stale_in_progress(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<IdempotencyRecord>>;
    /// Drops records past their `expires_at`; purged scope hashes become
    /// re-insertable.
    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;

    // Event stream and audit log.
    async fn append_event(&self, event: Event) -> StoreResult<Event>;
    async fn list_events(&self, filter: EventFilter) -> StoreResult<Vec<Event>>;
    async fn append_audit(&self, record: AuditRecord) -> StoreResult<AuditRecord>;
    async fn list_audit(&self, filter: AuditFilter) -> StoreResult<Vec<AuditRecord>>;

    // Reconciliation runs and findings.
    async fn create_run(&self, run: ReconciliationRun) -> StoreResult<ReconciliationRun>;
    async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        accounts_checked: u64,
        mismatches_found: u64,
        summary_json: serde_json::Value,
        finished_at: DateTime<Utc>,
    ) -> StoreResult<ReconciliationRun>;
    async fn insert_finding(
        &self,
        finding: ReconciliationFinding,
    ) -> StoreResult<ReconciliationFinding>;
    async fn list_findings(&self, run_id: &str) -> StoreResult<Vec<ReconciliationFinding>>;

    // Approval requests.
    async fn insert_approval(&self, request: ApprovalRequest) -> StoreResult<ApprovalRequest>;
    async fn update_approval(&self, request: ApprovalRequest) -> StoreResult<ApprovalRequest>;
    async fn get_approval(&self, approval_id: &str) -> StoreResult<ApprovalRequest>;
}
