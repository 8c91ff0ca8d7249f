use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::Account;
use crate::AccountId;
use crate::ApprovalRequest;
use crate::ApprovalState;
use crate::AuditFilter;
use crate::AuditRecord;
use crate::EntryType;
use crate::Event;
use crate::EventFilter;
use crate::IdempotencyRecord;
use crate::IdempotencyStatus;
use crate::JournalBundle;
use crate::LedgerJournal;
use crate::LedgerLine;
use crate::LedgerStore;
use crate::OverdraftFacility;
use crate::ReconciliationFinding;
use crate::ReconciliationRun;
use crate::RunStatus;
use crate::StoreError;
use crate::StoreResult;
use crate::WalletBalance;

/// In-memory `LedgerStore`. A single mutex over the whole state gives
/// `insert_journal_bundle` its all-or-nothing guarantee: validation runs
/// first, and the writes that follow cannot interleave with anything.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    accounts: HashMap<AccountId, Account>,
    journals: HashMap<String, LedgerJournal>,
    journal_order: Vec<String>,
    lines: Vec<LedgerLine>,
    balances: HashMap<AccountId, WalletBalance>,
    overdrafts: Vec<OverdraftFacility>,
    idempotency: HashMap<String, IdempotencyRecord>,
    events: Vec<Event>,
    audit: Vec<AuditRecord>,
    runs: HashMap<String, ReconciliationRun>,
    findings: Vec<ReconciliationFinding>,
    approvals: HashMap<String, ApprovalRequest>,
}

impl State {
    fn latest_hash(&self) -> String {
        self.journal_order
            .last()
            .and_then(|id| self.journals.get(id))
            .map(|journal| journal.hash.clone())
            .unwrap_or_default()
    }

    fn validate_bundle(&self, bundle: &JournalBundle) -> StoreResult<()> {
        let journal = &bundle.journal;
        if self.journals.contains_key(&journal.id) {
            return Err(StoreError::Validation(format!(
                "journal {} already exists",
                journal.id
            )));
        }
        if bundle.lines.is_empty() {
            return Err(StoreError::Validation(format!(
                "journal {} has no lines",
                journal.id
            )));
        }

        let mut debits = 0_i64;
        let mut credits = 0_i64;
        for line in &bundle.lines {
            if line.journal_id != journal.id {
                return Err(StoreError::Validation(format!(
                    "line {} does not belong to journal {}",
                    line.id, journal.id
                )));
            }
            let account = self
                .accounts
                .get(&line.account_id)
                .ok_or_else(|| StoreError::NotFound(format!("account {}", line.account_id)))?;
            if account.currency != journal.currency {
                return Err(StoreError::CurrencyMismatch(format!(
                    "account {} holds {}, journal {} posts {}",
                    account.id, account.currency, journal.id, journal.currency
                )));
            }
            match line.entry_type {
                EntryType::Dr => debits += line.amount,
                EntryType::Cr => credits += line.amount,
            }
        }
        if debits != credits {
            return Err(StoreError::UnbalancedJournal(format!(
                "journal {}: DR {debits} != CR {credits}",
                journal.id
            )));
        }

        let expected_prev = self.latest_hash();
        if journal.prev_hash != expected_prev {
            return Err(StoreError::ConcurrentWriteConflict(format!(
                "journal {} carries prev_hash {:?}, chain head is {:?}",
                journal.id, journal.prev_hash, expected_prev
            )));
        }

        if self.idempotency.contains_key(&bundle.idempotency.scope_hash) {
            return Err(StoreError::DuplicateScopeHash(
                bundle.idempotency.scope_hash.clone(),
            ));
        }

        Ok(())
    }

    fn apply_bundle(&mut self, bundle: JournalBundle) {
        let JournalBundle {
            journal,
            lines,
            balance_deltas,
            events,
            audit,
            idempotency,
        } = bundle;

        for delta in balance_deltas {
            let balance = self
                .balances
                .entry(delta.account_id.clone())
                .or_insert_with(|| WalletBalance {
                    account_id: delta.account_id.clone(),
                    currency: delta.currency.clone(),
                    balance_cents: 0,
                });
            balance.balance_cents += delta.delta_cents;
        }

        self.journal_order.push(journal.id.clone());
        self.journals.insert(journal.id.clone(), journal);
        self.lines.extend(lines);
        self.events.extend(events);
        self.audit.push(audit);
        self.idempotency
            .insert(idempotency.scope_hash.clone(), idempotency);
    }
}

impl InMemoryLedgerStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutates a committed journal in place. Only for tamper-detection
    /// tests; the production trait has no such operation.
    #[cfg(feature = "test-hooks")]
    pub async fn tamper_journal<F>(&self, journal_id: &str, mutate: F) -> StoreResult<()>
    where
        F: FnOnce(&mut LedgerJournal),
    {
        let mut state = self.state.lock().await;
        let journal = state
            .journals
            .get_mut(journal_id)
            .ok_or_else(|| StoreError::NotFound(format!("journal {journal_id}")))?;
        mutate(journal);
        Ok(())
    }

    /// Mutates a committed line in place. Only for tamper-detection
    /// tests.
    #[cfg(feature = "test-hooks")]
    pub async fn tamper_line<F>(&self, journal_id: &str, index: usize, mutate: F) -> StoreResult<()>
    where
        F: FnOnce(&mut LedgerLine),
    {
        let mut state = self.state.lock().await;
        let line = state
            .lines
            .iter_mut()
            .filter(|line| line.journal_id == journal_id)
            .nth(index)
            .ok_or_else(|| StoreError::NotFound(format!("line {index} of {journal_id}")))?;
        mutate(line);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn insert_account(&self, account: Account) -> StoreResult<Account> {
        let mut state = self.state.lock().await;
        if state.accounts.contains_key(&account.id) {
            return Err(StoreError::Validation(format!(
                "account {} already exists",
                account.id
            )));
        }
        state.accounts.insert(account.id.clone(), account.clone());
        Ok(account)
    }

    async fn get_account(&self, account_id: &str) -> StoreResult<Account> {
        let state = self.state.lock().await;
        state
            .accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("account {account_id}")))
    }

    async fn list_account_ids(&self) -> StoreResult<Vec<AccountId>> {
        let state = self.state.lock().await;
        let mut ids: Vec<AccountId> = state.accounts.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn insert_journal_bundle(&self, bundle: JournalBundle) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.validate_bundle(&bundle)?;
        state.apply_bundle(bundle);
        Ok(())
    }

    async fn get_balance(&self, account_id: &str) -> StoreResult<i64> {
        let state = self.state.lock().await;
        // A missing materialized row reads as zero; the row is created on
        // first write.
        Ok(state
            .balances
            .get(account_id)
            .map(|balance| balance.balance_cents)
            .unwrap_or(0))
    }

    async fn list_lines(&self, journal_id: &str) -> StoreResult<Vec<LedgerLine>> {
        let state = self.state.lock().await;
        Ok(state
            .lines
            .iter()
            .filter(|line| line.journal_id == journal_id)
            .cloned()
            .collect())
    }

    async fn get_journal(&self, journal_id: &str) -> StoreResult<LedgerJournal> {
        let state = self.state.lock().await;
        state
            .journals
            .get(journal_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("journal {journal_id}")))
    }

    async fn get_journal_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> StoreResult<Option<LedgerJournal>> {
        let state = self.state.lock().await;
        Ok(state
            .journals
            .values()
            .find(|journal| journal.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn latest_journal_hash(&self) -> StoreResult<String> {
        let state = self.state.lock().await;
        Ok(state.latest_hash())
    }

    async fn journals_ordered(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<LedgerJournal>> {
        let state = self.state.lock().await;
        let mut journals: Vec<LedgerJournal> = state
            .journals
            .values()
            .filter(|journal| {
                from.is_none_or(|from| journal.created_at >= from)
                    && to.is_none_or(|to| journal.created_at <= to)
            })
            .cloned()
            .collect();
        journals.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(journals)
    }

    async fn sum_lines(&self, account_id: &str) -> StoreResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .lines
            .iter()
            .filter(|line| line.account_id == account_id)
            .map(|line| match line.entry_type {
                EntryType::Cr => line.amount,
                EntryType::Dr => -line.amount,
            })
            .sum())
    }

    async fn insert_overdraft(&self, facility: OverdraftFacility) -> StoreResult<OverdraftFacility> {
        let mut state = self.state.lock().await;
        if !state.accounts.contains_key(&facility.account_id) {
            return Err(StoreError::NotFound(format!(
                "account {}",
                facility.account_id
            )));
        }
        state.overdrafts.push(facility.clone());
        Ok(facility)
    }

    async fn active_overdraft(
        &self,
        account_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<OverdraftFacility>> {
        let state = self.state.lock().await;
        Ok(state
            .overdrafts
            .iter()
            .filter(|facility| facility.account_id == account_id && facility.is_effective(now))
            .max_by_key(|facility| facility.limit_cents)
            .cloned())
    }

    async fn lookup_by_scope_hash(
        &self,
        scope_hash: &str,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        let state = self.state.lock().await;
        Ok(state.idempotency.get(scope_hash).cloned())
    }

    async fn insert_idempotency(&self, record: IdempotencyRecord) -> StoreResult<IdempotencyRecord> {
        let mut state = self.state.lock().await;
        if state.idempotency.contains_key(&record.scope_hash) {
            return Err(StoreError::DuplicateScopeHash(record.scope_hash.clone()));
        }
        state
            .idempotency
            .insert(record.scope_hash.clone(), record.clone());
        Ok(record)
    }

    async fn update_idempotency_result(
        &self,
        record_id: &str,
        result_json: String,
        status: IdempotencyStatus,
    ) -> StoreResult<IdempotencyRecord> {
        if !status.is_terminal() {
            return Err(StoreError::InvalidTransition(
                "idempotency records only transition to COMPLETED or FAILED".into(),
            ));
        }
        let mut state = self.state.lock().await;
        let record = state
            .idempotency
            .values_mut()
            .find(|record| record.record_id == record_id)
            .ok_or_else(|| StoreError::NotFound(format!("idempotency record {record_id}")))?;
        if record.status.is_terminal() {
            return Err(StoreError::InvalidTransition(format!(
                "idempotency record {record_id} is already terminal"
            )));
        }
        record.result_json = result_json;
        record.status = status;
        Ok(record.clone())
    }

    async fn list_stale_in_progress(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<IdempotencyRecord>> {
        let state = self.state.lock().await;
        let mut stale: Vec<IdempotencyRecord> = state
            .idempotency
            .values()
            .filter(|record| {
                record.status == IdempotencyStatus::InProgress && record.created_at < cutoff
            })
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(stale)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        let before = state.idempotency.len();
        state.idempotency.retain(|_, record| record.expires_at > now);
        Ok(before - state.idempotency.len())
    }

    async fn append_event(&self, event: Event) -> StoreResult<Event> {
        let mut state = self.state.lock().await;
        state.events.push(event.clone());
        Ok(event)
    }

    async fn list_events(&self, filter: EventFilter) -> StoreResult<Vec<Event>> {
        let state = self.state.lock().await;
        let mut events: Vec<Event> = state
            .events
            .iter()
            .filter(|event| {
                filter.name.as_ref().is_none_or(|name| &event.name == name)
                    && filter
                        .entity_id
                        .as_ref()
                        .is_none_or(|entity| &event.entity_id == entity)
                    && filter
                        .correlation_id
                        .as_ref()
                        .is_none_or(|correlation| &event.correlation_id == correlation)
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit
            && events.len() > limit
        {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn append_audit(&self, record: AuditRecord) -> StoreResult<AuditRecord> {
        let mut state = self.state.lock().await;
        state.audit.push(record.clone());
        Ok(record)
    }

    async fn list_audit(&self, filter: AuditFilter) -> StoreResult<Vec<AuditRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<AuditRecord> = state
            .audit
            .iter()
            .filter(|record| {
                filter
                    .action
                    .as_ref()
                    .is_none_or(|action| &record.action == action)
                    && filter
                        .target_id
                        .as_ref()
                        .is_none_or(|target| &record.target_id == target)
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit
            && records.len() > limit
        {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn create_run(&self, run: ReconciliationRun) -> StoreResult<ReconciliationRun> {
        let mut state = self.state.lock().await;
        if state.runs.contains_key(&run.id) {
            return Err(StoreError::Validation(format!(
                "reconciliation run {} already exists",
                run.id
            )));
        }
        state.runs.insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        accounts_checked: u64,
        mismatches_found: u64,
        summary_json: serde_json::Value,
        finished_at: DateTime<Utc>,
    ) -> StoreResult<ReconciliationRun> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::NotFound(format!("reconciliation run {run_id}")))?;
        if run.status != RunStatus::Running {
            return Err(StoreError::InvalidTransition(format!(
                "reconciliation run {run_id} already finished"
            )));
        }
        run.status = status;
        run.accounts_checked = accounts_checked;
        run.mismatches_found = mismatches_found;
        run.summary_json = summary_json;
        run.finished_at = Some(finished_at);
        Ok(run.clone())
    }

    async fn insert_finding(
        &self,
        finding: ReconciliationFinding,
    ) -> StoreResult<ReconciliationFinding> {
        let mut state = self.state.lock().await;
        if !state.runs.contains_key(&finding.run_id) {
            return Err(StoreError::NotFound(format!(
                "reconciliation run {}",
                finding.run_id
            )));
        }
        state.findings.push(finding.clone());
        Ok(finding)
    }

    async fn list_findings(&self, run_id: &str) -> StoreResult<Vec<ReconciliationFinding>> {
        let state = self.state.lock().await;
        Ok(state
            .findings
            .iter()
            .filter(|finding| finding.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn insert_approval(&self, request: ApprovalRequest) -> StoreResult<ApprovalRequest> {
        request.validate_separation()?;
        let mut state = self.state.lock().await;
        if state.approvals.contains_key(&request.id) {
            return Err(StoreError::Validation(format!(
                "approval request {} already exists",
                request.id
            )));
        }
        state.approvals.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    async fn update_approval(&self, request: ApprovalRequest) -> StoreResult<ApprovalRequest> {
        request.validate_separation()?;
        let mut state = self.state.lock().await;
        let existing = state
            .approvals
            .get_mut(&request.id)
            .ok_or_else(|| StoreError::NotFound(format!("approval request {}", request.id)))?;
        if existing.state != ApprovalState::Pending {
            return Err(StoreError::InvalidTransition(format!(
                "approval request {} is already decided",
                request.id
            )));
        }
        *existing = request.clone();
        Ok(request)
    }

    async fn get_approval(&self, approval_id: &str) -> StoreResult<ApprovalRequest> {
        let state = self.state.lock().await;
        state
            .approvals
            .get(approval_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("approval request {approval_id}")))
    }
}
