#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The serialized double-entry posting engine.
//!
//! Every posting runs under an exclusive per-scope lock — scope being
//! `(actor_type, actor_id, currency)` — so two debits from the same
//! wallet can never both observe a sufficient balance. The hash chain has
//! a single global append point, so the fetch-latest-hash/insert pair
//! additionally runs under a short commit lock shared by all scopes.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;
use pesa_amount::HashEntry;
use pesa_amount::format_amount;
use pesa_amount::journal_hash;
use pesa_amount::payload_hash;
use pesa_amount::scope_hash;
use pesa_ledger::AuditRecord;
use pesa_ledger::BalanceDelta;
use pesa_ledger::EntrySpec;
use pesa_ledger::EntryType;
use pesa_ledger::Event;
use pesa_ledger::IdempotencyRecord;
use pesa_ledger::IdempotencyStatus;
use pesa_ledger::JournalBundle;
use pesa_ledger::JournalState;
use pesa_ledger::LedgerJournal;
use pesa_ledger::LedgerLine;
use pesa_ledger::LedgerStore;
use pesa_ledger::StoreError;
use pesa_ledger::TxnType;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

pub const EVENT_TXN_POSTED: &str = "TXN_POSTED";
pub const EVENT_TXN_COMPLETED: &str = "TXN_COMPLETED";

const COMMIT_ATTEMPTS: u32 = 3;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("idempotency key reused with a different payload")]
    DuplicateIdempotencyConflict,
    #[error("a posting with this idempotency key is still in progress")]
    IdempotencyInProgress,
    #[error("cross-currency entries are not allowed: {0}")]
    CrossCurrencyNotAllowed(String),
    #[error("journal does not balance: {0}")]
    UnbalancedJournal(String),
    #[error("insufficient funds on {account_id}: required {required}, available {available}")]
    InsufficientFunds {
        account_id: String,
        required: i64,
        available: i64,
    },
    #[error("entry amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("missing required field: {0}")]
    MissingRequiredField(&'static str),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(what) => EngineError::NotFound(what),
            StoreError::UnbalancedJournal(what) => EngineError::UnbalancedJournal(what),
            StoreError::CurrencyMismatch(what) => EngineError::CrossCurrencyNotAllowed(what),
            other => EngineError::Internal(other.to_string()),
        }
    }
}

/// A posting command as accepted from the API surface. Amounts inside
/// `entries` are already cents; the wire layer parses decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingCommand {
    pub idempotency_key: String,
    pub correlation_id: String,
    pub actor_type: String,
    pub actor_id: String,
    pub txn_type: TxnType,
    pub currency: String,
    pub entries: Vec<EntrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_version_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission_version_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptEntry {
    pub account_id: String,
    pub entry_type: EntryType,
    pub amount: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The stored result of a successful posting. Replays return this
/// verbatim from the idempotency record; no new rows appear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub journal_id: String,
    pub state: JournalState,
    pub entries: Vec<ReceiptEntry>,
    pub created_at: DateTime<Utc>,
    pub correlation_id: String,
    pub txn_type: TxnType,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub idempotency_ttl_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl_days: 90,
        }
    }
}

impl EngineConfig {
    /// Reads `PESA_IDEMPOTENCY_TTL_DAYS`, falling back to the default on
    /// absent or unparsable values.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = env::var("PESA_IDEMPOTENCY_TTL_DAYS")
            && let Ok(days) = raw.parse::<i64>()
            && days > 0
        {
            config.idempotency_ttl_days = days;
        }
        config
    }
}

/// Keyed mutex table: one async mutex per posting scope, created on
/// first use. Guards are drop-released, so a panicking task cannot leak
/// a held scope.
#[derive(Default)]
struct ScopeLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ScopeLocks {
    fn lock_for(&self, scope_key: &str) -> EngineResult<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| EngineError::Internal("scope lock table poisoned".into()))?;
        Ok(locks.entry(scope_key.to_string()).or_default().clone())
    }
}

pub struct PostingEngine {
    store: Arc<dyn LedgerStore>,
    scope_locks: ScopeLocks,
    commit_lock: Mutex<()>,
    config: EngineConfig,
}

impl PostingEngine {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: Arc<dyn LedgerStore>, config: EngineConfig) -> Self {
        Self {
            store,
            scope_locks: ScopeLocks::default(),
            commit_lock: Mutex::new(()),
            config,
        }
    }

    /// Post one balanced journal with at-most-once effect for the
    /// command's `(actor, txn_type, idempotency_key)` scope.
    pub async fn post_transaction(&self, cmd: PostingCommand) -> EngineResult<Receipt> {
        validate_presence(&cmd)?;

        let scope = scope_hash(
            &cmd.actor_type,
            &cmd.actor_id,
            cmd.txn_type.as_str(),
            &cmd.idempotency_key,
        );
        let payload = payload_hash(
            &hash_entries(&cmd.entries),
            &cmd.currency,
            cmd.description.as_deref().unwrap_or_default(),
        );

        let scope_key = format!("{}|{}|{}", cmd.actor_type, cmd.actor_id, cmd.currency);
        let scope_lock = self.scope_locks.lock_for(&scope_key)?;
        let _scope_guard = scope_lock.lock().await;

        if let Some(record) = self.store.lookup_by_scope_hash(&scope).await? {
            return self.replay(record, &payload);
        }

        self.validate_entries(&cmd).await?;
        self.check_funds(&cmd).await?;
        self.commit(cmd, scope, payload).await
    }

    /// Balance of a registered account as a decimal string.
    pub async fn get_balance(&self, account_id: &str) -> EngineResult<String> {
        self.store.get_account(account_id).await?;
        let cents = self.store.get_balance(account_id).await?;
        Ok(format_amount(cents))
    }

    fn replay(&self, record: IdempotencyRecord, payload: &str) -> EngineResult<Receipt> {
        if record.payload_hash != *payload {
            return Err(EngineError::DuplicateIdempotencyConflict);
        }
        match record.status {
            IdempotencyStatus::Completed => serde_json::from_str(&record.result_json)
                .map_err(|error| {
                    EngineError::Internal(format!(
                        "stored receipt for {} is unreadable: {error}",
                        record.record_id
                    ))
                }),
            IdempotencyStatus::InProgress => Err(EngineError::IdempotencyInProgress),
            IdempotencyStatus::Failed => Err(EngineError::Internal(format!(
                "posting {} previously failed terminally",
                record.record_id
            ))),
        }
    }

    async fn validate_entries(&self, cmd: &PostingCommand) -> EngineResult<()> {
        let mut debits = 0_i64;
        let mut credits = 0_i64;
        for entry in &cmd.entries {
            if entry.amount <= 0 {
                return Err(EngineError::InvalidAmount(entry.amount));
            }
            let account = self.store.get_account(&entry.account_id).await?;
            if account.currency != cmd.currency {
                return Err(EngineError::CrossCurrencyNotAllowed(format!(
                    "account {} holds {}, command posts {}",
                    account.id, account.currency, cmd.currency
                )));
            }
            match entry.entry_type {
                EntryType::Dr => debits += entry.amount,
                EntryType::Cr => credits += entry.amount,
            }
        }
        if debits != credits {
            return Err(EngineError::UnbalancedJournal(format!(
                "DR {debits} != CR {credits}"
            )));
        }
        Ok(())
    }

    async fn check_funds(&self, cmd: &PostingCommand) -> EngineResult<()> {
        let mut debits_by_account: BTreeMap<&str, i64> = BTreeMap::new();
        for entry in &cmd.entries {
            if entry.entry_type == EntryType::Dr {
                *debits_by_account.entry(entry.account_id.as_str()).or_insert(0) += entry.amount;
            }
        }

        let now = Utc::now();
        for (account_id, required) in debits_by_account {
            let account = self.store.get_account(account_id).await?;
            if !account.account_type.requires_funds_check() {
                continue;
            }
            let balance = self.store.get_balance(account_id).await?;
            // No facility means a zero limit; a missing row is not an
            // error here, but real store failures propagate.
            let overdraft = self
                .store
                .active_overdraft(account_id, now)
                .await?
                .map(|facility| facility.limit_cents)
                .unwrap_or(0);
            if balance + overdraft < required {
                return Err(EngineError::InsufficientFunds {
                    account_id: account_id.to_string(),
                    required,
                    available: balance + overdraft,
                });
            }
        }
        Ok(())
    }

    async fn commit(
        &self,
        cmd: PostingCommand,
        scope: String,
        payload: String,
    ) -> EngineResult<Receipt> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let _commit_guard = self.commit_lock.lock().await;
            let prev_hash = self.store.latest_journal_hash().await?;
            let (bundle, receipt) = self.build_bundle(&cmd, &scope, &payload, &prev_hash)?;

            match self.store.insert_journal_bundle(bundle).await {
                Ok(()) => {
                    info!(
                        journal_id = %receipt.journal_id,
                        txn_type = cmd.txn_type.as_str(),
                        correlation_id = %cmd.correlation_id,
                        "posting committed"
                    );
                    return Ok(receipt);
                }
                Err(StoreError::ConcurrentWriteConflict(reason)) if attempt < COMMIT_ATTEMPTS => {
                    tracing::warn!(attempt, %reason, "hash chain moved, retrying commit");
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    fn build_bundle(
        &self,
        cmd: &PostingCommand,
        scope: &str,
        payload: &str,
        prev_hash: &str,
    ) -> EngineResult<(JournalBundle, Receipt)> {
        let now = Utc::now();
        let journal_id = Uuid::new_v4().to_string();

        let lines: Vec<LedgerLine> = cmd
            .entries
            .iter()
            .map(|entry| LedgerLine {
                id: Uuid::new_v4().to_string(),
                journal_id: journal_id.clone(),
                account_id: entry.account_id.clone(),
                entry_type: entry.entry_type,
                amount: entry.amount,
                created_at: now,
            })
            .collect();

        let hash = journal_hash(
            prev_hash,
            &journal_id,
            &cmd.currency,
            cmd.txn_type.as_str(),
            &hash_entries(&cmd.entries),
        );

        let mut deltas: BTreeMap<String, i64> = BTreeMap::new();
        for entry in &cmd.entries {
            let delta = match entry.entry_type {
                EntryType::Cr => entry.amount,
                EntryType::Dr => -entry.amount,
            };
            *deltas.entry(entry.account_id.clone()).or_insert(0) += delta;
        }
        let balance_deltas: Vec<BalanceDelta> = deltas
            .into_iter()
            .map(|(account_id, delta_cents)| BalanceDelta {
                account_id,
                currency: cmd.currency.clone(),
                delta_cents,
            })
            .collect();

        let receipt = Receipt {
            journal_id: journal_id.clone(),
            state: JournalState::Posted,
            entries: cmd
                .entries
                .iter()
                .map(|entry| ReceiptEntry {
                    account_id: entry.account_id.clone(),
                    entry_type: entry.entry_type,
                    amount: format_amount(entry.amount),
                    description: entry.description.clone(),
                })
                .collect(),
            created_at: now,
            correlation_id: cmd.correlation_id.clone(),
            txn_type: cmd.txn_type,
            currency: cmd.currency.clone(),
        };
        let result_json = serde_json::to_string(&receipt)
            .map_err(|error| EngineError::Internal(format!("receipt serialization: {error}")))?;

        let journal = LedgerJournal {
            id: journal_id.clone(),
            txn_type: cmd.txn_type,
            currency: cmd.currency.clone(),
            correlation_id: cmd.correlation_id.clone(),
            idempotency_key: cmd.idempotency_key.clone(),
            state: JournalState::Posted,
            initiator_actor_type: cmd.actor_type.clone(),
            initiator_actor_id: cmd.actor_id.clone(),
            prev_hash: prev_hash.to_string(),
            hash,
            created_at: now,
        };

        let event = |name: &str| Event {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            entity_type: "LEDGER_JOURNAL".into(),
            entity_id: journal_id.clone(),
            correlation_id: cmd.correlation_id.clone(),
            causation_id: Some(journal_id.clone()),
            actor_type: cmd.actor_type.clone(),
            actor_id: cmd.actor_id.clone(),
            schema_version: 1,
            payload_json: serde_json::json!({
                "journal_id": journal_id.as_str(),
                "txn_type": cmd.txn_type.as_str(),
                "currency": cmd.currency.as_str(),
            }),
            created_at: now,
        };
        let events = vec![event(EVENT_TXN_POSTED), event(EVENT_TXN_COMPLETED)];

        let audit = AuditRecord {
            id: Uuid::new_v4().to_string(),
            action: format!("{}_POSTED", cmd.txn_type.as_str()),
            actor_type: cmd.actor_type.clone(),
            actor_id: cmd.actor_id.clone(),
            target_type: "LEDGER_JOURNAL".into(),
            target_id: journal_id.clone(),
            before_json: None,
            after_json: serde_json::to_value(&receipt).ok(),
            correlation_id: cmd.correlation_id.clone(),
            created_at: now,
        };

        let idempotency = IdempotencyRecord {
            record_id: Uuid::new_v4().to_string(),
            scope_hash: scope.to_string(),
            payload_hash: payload.to_string(),
            result_json,
            status: IdempotencyStatus::Completed,
            created_at: now,
            expires_at: now + Duration::days(self.config.idempotency_ttl_days),
        };

        let bundle = JournalBundle {
            journal,
            lines,
            balance_deltas,
            events,
            audit,
            idempotency,
        };
        Ok((bundle, receipt))
    }
}

fn hash_entries(entries: &[EntrySpec]) -> Vec<HashEntry> {
    entries
        .iter()
        .map(|entry| HashEntry {
            account_id: entry.account_id.clone(),
            entry_type: entry.entry_type.as_str().to_string(),
            amount: entry.amount,
        })
        .collect()
}

fn validate_presence(cmd: &PostingCommand) -> EngineResult<()> {
    if cmd.idempotency_key.trim().is_empty() {
        return Err(EngineError::MissingRequiredField("idempotency_key"));
    }
    if cmd.correlation_id.trim().is_empty() {
        return Err(EngineError::MissingRequiredField("correlation_id"));
    }
    if cmd.actor_type.trim().is_empty() {
        return Err(EngineError::MissingRequiredField("actor_type"));
    }
    if cmd.actor_id.trim().is_empty() {
        return Err(EngineError::MissingRequiredField("actor_id"));
    }
    if cmd.currency.trim().is_empty() {
        return Err(EngineError::MissingRequiredField("currency"));
    }
    if cmd.entries.is_empty() {
        return Err(EngineError::MissingRequiredField("entries"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pesa_ledger::Account;
    use pesa_ledger::AccountType;
    use pesa_ledger::EventFilter;
    use pesa_ledger::InMemoryLedgerStore;
    use pesa_ledger::OverdraftFacility;
    use pesa_ledger::OverdraftState;
    use pesa_ledger::OwnerType;
    use pretty_assertions::assert_eq;

    async fn seed_account(
        store: &InMemoryLedgerStore,
        id: &str,
        account_type: AccountType,
        currency: &str,
    ) {
        store
            .insert_account(Account {
                id: id.into(),
                owner_type: OwnerType::Customer,
                owner_id: format!("owner-{id}"),
                account_type,
                currency: currency.into(),
                created_at: Utc::now(),
            })
            .await
            .expect("insert account");
    }

    async fn engine_with_wallets() -> (Arc<InMemoryLedgerStore>, PostingEngine) {
        let store = Arc::new(InMemoryLedgerStore::new());
        seed_account(&store, "wallet-1", AccountType::Wallet, "BBD").await;
        seed_account(&store, "wallet-2", AccountType::Wallet, "BBD").await;
        seed_account(&store, "float-1", AccountType::CashFloat, "BBD").await;
        seed_account(&store, "clearing-1", AccountType::BankClearing, "BBD").await;
        let engine = PostingEngine::new(store.clone());
        (store, engine)
    }

    fn p2p_cmd(key: &str, amount: i64) -> PostingCommand {
        PostingCommand {
            idempotency_key: key.into(),
            correlation_id: format!("corr-{key}"),
            actor_type: "CUSTOMER".into(),
            actor_id: "cust-1".into(),
            txn_type: TxnType::P2p,
            currency: "BBD".into(),
            entries: pesa_templates::p2p("wallet-1", "wallet-2", amount).expect("template"),
            description: Some("p2p transfer".into()),
            fee_version_id: None,
            commission_version_id: None,
        }
    }

    /// Two postings: a float top-up from clearing, then a cash deposit
    /// into the wallet.
    async fn fund_wallet(engine: &PostingEngine, wallet: &str, amount: i64) {
        let topup = PostingCommand {
            idempotency_key: format!("topup-{wallet}-{amount}"),
            correlation_id: format!("corr-topup-{wallet}"),
            actor_type: "AGENT".into(),
            actor_id: "agent-1".into(),
            txn_type: TxnType::FloatTopup,
            currency: "BBD".into(),
            entries: pesa_templates::float_topup("clearing-1", "float-1", amount)
                .expect("template"),
            description: Some("float topup".into()),
            fee_version_id: None,
            commission_version_id: None,
        };
        engine.post_transaction(topup).await.expect("topup posts");

        let deposit = PostingCommand {
            idempotency_key: format!("fund-{wallet}-{amount}"),
            correlation_id: format!("corr-fund-{wallet}"),
            actor_type: "AGENT".into(),
            actor_id: "agent-1".into(),
            txn_type: TxnType::Deposit,
            currency: "BBD".into(),
            entries: pesa_templates::deposit("float-1", wallet, amount).expect("template"),
            description: Some("cash deposit".into()),
            fee_version_id: None,
            commission_version_id: None,
        };
        engine.post_transaction(deposit).await.expect("funding posts");
    }

    #[tokio::test]
    async fn posting_commits_journal_events_audit_and_balances() {
        let (store, engine) = engine_with_wallets().await;
        fund_wallet(&engine, "wallet-1", 10_000).await;

        let receipt = engine
            .post_transaction(p2p_cmd("txn-1", 2_500))
            .await
            .expect("posting succeeds");
        assert_eq!(receipt.state, JournalState::Posted);
        assert_eq!(receipt.currency, "BBD");

        assert_eq!(engine.get_balance("wallet-1").await.expect("balance"), "75.00");
        assert_eq!(engine.get_balance("wallet-2").await.expect("balance"), "25.00");

        let posted = store
            .list_events(EventFilter {
                name: Some(EVENT_TXN_POSTED.into()),
                entity_id: Some(receipt.journal_id.clone()),
                ..Default::default()
            })
            .await
            .expect("events");
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].causation_id.as_deref(), Some(receipt.journal_id.as_str()));

        let completed = store
            .list_events(EventFilter {
                name: Some(EVENT_TXN_COMPLETED.into()),
                entity_id: Some(receipt.journal_id.clone()),
                ..Default::default()
            })
            .await
            .expect("events");
        assert_eq!(completed.len(), 1);

        let audit = store
            .list_audit(pesa_ledger::AuditFilter {
                action: Some("P2P_POSTED".into()),
                ..Default::default()
            })
            .await
            .expect("audit");
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn replay_returns_stored_receipt_without_new_rows() {
        let (store, engine) = engine_with_wallets().await;
        fund_wallet(&engine, "wallet-1", 100_000).await;

        let first = engine
            .post_transaction(p2p_cmd("storm-001", 5_000))
            .await
            .expect("first posting");
        let replay = engine
            .post_transaction(p2p_cmd("storm-001", 5_000))
            .await
            .expect("replay succeeds");
        assert_eq!(first, replay);

        assert_eq!(engine.get_balance("wallet-1").await.expect("balance"), "950.00");
        // Two funding journals plus one p2p journal; the replay added
        // nothing.
        assert_eq!(
            store.journals_ordered(None, None).await.expect("journals").len(),
            3
        );
    }

    #[tokio::test]
    async fn same_key_different_payload_conflicts_and_commits_nothing() {
        let (store, engine) = engine_with_wallets().await;
        fund_wallet(&engine, "wallet-1", 50_000).await;

        engine
            .post_transaction(p2p_cmd("key-K", 10_000))
            .await
            .expect("first posting");
        let err = engine
            .post_transaction(p2p_cmd("key-K", 20_000))
            .await
            .expect_err("conflicting payload rejected");
        assert!(matches!(err, EngineError::DuplicateIdempotencyConflict));

        assert_eq!(engine.get_balance("wallet-1").await.expect("balance"), "400.00");
        assert_eq!(
            store.journals_ordered(None, None).await.expect("journals").len(),
            3
        );
    }

    #[tokio::test]
    async fn cross_currency_and_unbalanced_commands_are_rejected() {
        let (store, engine) = engine_with_wallets().await;
        seed_account(&store, "wallet-usd", AccountType::Wallet, "USD").await;
        fund_wallet(&engine, "wallet-1", 10_000).await;

        let mut cross = p2p_cmd("txn-cross", 1_000);
        cross.entries[1].account_id = "wallet-usd".into();
        let err = engine
            .post_transaction(cross)
            .await
            .expect_err("cross currency rejected");
        assert!(matches!(err, EngineError::CrossCurrencyNotAllowed(_)));

        let mut unbalanced = p2p_cmd("txn-unbalanced", 1_000);
        unbalanced.entries[0].amount = 900;
        let err = engine
            .post_transaction(unbalanced)
            .await
            .expect_err("unbalanced rejected");
        assert!(matches!(err, EngineError::UnbalancedJournal(_)));

        let mut zeroed = p2p_cmd("txn-zero", 1_000);
        zeroed.entries[0].amount = 0;
        zeroed.entries[1].amount = 0;
        let err = engine
            .post_transaction(zeroed)
            .await
            .expect_err("zero amount rejected");
        assert!(matches!(err, EngineError::InvalidAmount(0)));
    }

    #[tokio::test]
    async fn insufficient_funds_respects_overdraft_facilities() {
        let (store, engine) = engine_with_wallets().await;
        fund_wallet(&engine, "wallet-1", 1_000).await;

        let err = engine
            .post_transaction(p2p_cmd("txn-over", 6_000))
            .await
            .expect_err("over balance rejected");
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));

        let now = Utc::now();
        store
            .insert_overdraft(OverdraftFacility {
                id: "od-1".into(),
                account_id: "wallet-1".into(),
                limit_cents: 5_000,
                state: OverdraftState::Active,
                effective_from: now - Duration::hours(1),
                expires_at: now + Duration::hours(1),
            })
            .await
            .expect("insert facility");

        engine
            .post_transaction(p2p_cmd("txn-over-2", 6_000))
            .await
            .expect("overdraft covers the debit");
        assert_eq!(engine.get_balance("wallet-1").await.expect("balance"), "-50.00");
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let (_, engine) = engine_with_wallets().await;
        let mut cmd = p2p_cmd("txn-missing", 1_000);
        cmd.entries[1].account_id = "wallet-ghost".into();
        let err = engine
            .post_transaction(cmd)
            .await
            .expect_err("missing account rejected");
        assert!(matches!(err, EngineError::NotFound(_)));

        let err = engine
            .get_balance("wallet-ghost")
            .await
            .expect_err("missing account balance rejected");
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn missing_fields_are_rejected_up_front() {
        let (_, engine) = engine_with_wallets().await;
        let mut cmd = p2p_cmd("txn-1", 1_000);
        cmd.idempotency_key = "  ".into();
        let err = engine
            .post_transaction(cmd)
            .await
            .expect_err("blank key rejected");
        assert!(matches!(
            err,
            EngineError::MissingRequiredField("idempotency_key")
        ));

        let mut cmd = p2p_cmd("txn-2", 1_000);
        cmd.entries.clear();
        let err = engine
            .post_transaction(cmd)
            .await
            .expect_err("no entries rejected");
        assert!(matches!(err, EngineError::MissingRequiredField("entries")));
    }

    #[tokio::test]
    async fn hash_chain_links_consecutive_journals() {
        let (store, engine) = engine_with_wallets().await;
        fund_wallet(&engine, "wallet-1", 10_000).await;
        engine
            .post_transaction(p2p_cmd("txn-a", 1_000))
            .await
            .expect("posting");
        engine
            .post_transaction(p2p_cmd("txn-b", 1_000))
            .await
            .expect("posting");

        let journals = store.journals_ordered(None, None).await.expect("journals");
        assert_eq!(journals.len(), 4);
        assert_eq!(journals[0].prev_hash, "");
        for pair in journals.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].hash);
        }
    }

    #[tokio::test]
    async fn persisted_in_progress_record_blocks_the_scope() {
        let (store, engine) = engine_with_wallets().await;
        fund_wallet(&engine, "wallet-1", 10_000).await;

        let cmd = p2p_cmd("txn-crashed", 1_000);
        let scope = scope_hash(
            &cmd.actor_type,
            &cmd.actor_id,
            cmd.txn_type.as_str(),
            &cmd.idempotency_key,
        );
        let payload = payload_hash(
            &hash_entries(&cmd.entries),
            &cmd.currency,
            cmd.description.as_deref().unwrap_or_default(),
        );
        let now = Utc::now();
        store
            .insert_idempotency(IdempotencyRecord {
                record_id: "rec-crashed".into(),
                scope_hash: scope,
                payload_hash: payload,
                result_json: "{\"state\":\"IN_PROGRESS\"}".into(),
                status: IdempotencyStatus::InProgress,
                created_at: now,
                expires_at: now + Duration::days(90),
            })
            .await
            .expect("seed record");

        let err = engine
            .post_transaction(cmd)
            .await
            .expect_err("in-progress record blocks");
        assert!(matches!(err, EngineError::IdempotencyInProgress));
    }
}
