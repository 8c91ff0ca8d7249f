#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Pure journal-entry builders, one per transaction type.
//!
//! Builders only produce balanced entry lists; they never touch balances,
//! idempotency records, or events. Zero and negative amounts are rejected
//! here because no transaction type has a business meaning for them.

use pesa_ledger::EntrySpec;
use pesa_ledger::EntryType;
use pesa_ledger::LedgerLine;
use thiserror::Error;

pub type TemplateResult<T> = Result<T, TemplateError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("amount must be positive, got {0}")]
    NonPositiveAmount(i64),
    #[error("entries do not balance: DR {debits} != CR {credits}")]
    Unbalanced { debits: i64, credits: i64 },
    #[error("nothing to reverse")]
    EmptyReversal,
}

fn ensure_positive(amount: i64) -> TemplateResult<i64> {
    if amount <= 0 {
        return Err(TemplateError::NonPositiveAmount(amount));
    }
    Ok(amount)
}

fn pair(
    debit_account: &str,
    credit_account: &str,
    amount: i64,
    description: &str,
) -> TemplateResult<Vec<EntrySpec>> {
    let amount = ensure_positive(amount)?;
    Ok(vec![
        EntrySpec {
            account_id: debit_account.into(),
            entry_type: EntryType::Dr,
            amount,
            description: Some(description.into()),
        },
        EntrySpec {
            account_id: credit_account.into(),
            entry_type: EntryType::Cr,
            amount,
            description: Some(description.into()),
        },
    ])
}

/// Σ(DR) must equal Σ(CR). Every builder output satisfies this; callers
/// composing entry lists by hand run it before posting.
pub fn assert_balanced(entries: &[EntrySpec]) -> TemplateResult<()> {
    let (debits, credits) = entries
        .iter()
        .fold((0_i64, 0_i64), |(d, c), entry| match entry.entry_type {
            EntryType::Dr => (d + entry.amount, c),
            EntryType::Cr => (d, c + entry.amount),
        });
    if debits != credits {
        return Err(TemplateError::Unbalanced { debits, credits });
    }
    Ok(())
}

/// Cash in: the agent's float funds the customer wallet.
pub fn deposit(
    agent_float: &str,
    customer_wallet: &str,
    amount: i64,
) -> TemplateResult<Vec<EntrySpec>> {
    pair(agent_float, customer_wallet, amount, "cash deposit")
}

/// Cash out: the customer wallet funds the agent's float.
pub fn withdrawal(
    customer_wallet: &str,
    agent_float: &str,
    amount: i64,
) -> TemplateResult<Vec<EntrySpec>> {
    pair(customer_wallet, agent_float, amount, "cash withdrawal")
}

pub fn p2p(
    sender_wallet: &str,
    receiver_wallet: &str,
    amount: i64,
) -> TemplateResult<Vec<EntrySpec>> {
    pair(sender_wallet, receiver_wallet, amount, "p2p transfer")
}

pub fn payment(
    customer_wallet: &str,
    merchant_wallet: &str,
    amount: i64,
) -> TemplateResult<Vec<EntrySpec>> {
    pair(customer_wallet, merchant_wallet, amount, "merchant payment")
}

pub fn b2b(payer_wallet: &str, payee_wallet: &str, amount: i64) -> TemplateResult<Vec<EntrySpec>> {
    pair(payer_wallet, payee_wallet, amount, "b2b transfer")
}

/// Agent buys float: bank clearing funds the float account.
pub fn float_topup(
    bank_clearing: &str,
    agent_float: &str,
    amount: i64,
) -> TemplateResult<Vec<EntrySpec>> {
    pair(bank_clearing, agent_float, amount, "float topup")
}

/// Agent cashes float back out to the bank.
pub fn float_withdrawal(
    agent_float: &str,
    bank_clearing: &str,
    amount: i64,
) -> TemplateResult<Vec<EntrySpec>> {
    pair(agent_float, bank_clearing, amount, "float withdrawal")
}

/// Manual adjustment between an account and suspense. Gated by
/// maker–checker upstream.
pub fn adjustment(
    debit_account: &str,
    credit_account: &str,
    amount: i64,
    reason: &str,
) -> TemplateResult<Vec<EntrySpec>> {
    pair(debit_account, credit_account, amount, reason)
}

/// Reversal swaps every DR with CR, preserving accounts and amounts, so
/// applying it after the original nets every account back to its prior
/// balance.
pub fn reversal_of(lines: &[LedgerLine]) -> TemplateResult<Vec<EntrySpec>> {
    if lines.is_empty() {
        return Err(TemplateError::EmptyReversal);
    }
    Ok(lines
        .iter()
        .map(|line| EntrySpec {
            account_id: line.account_id.clone(),
            entry_type: match line.entry_type {
                EntryType::Dr => EntryType::Cr,
                EntryType::Cr => EntryType::Dr,
            },
            amount: line.amount,
            description: Some(format!("reversal of {}", line.journal_id)),
        })
        .collect())
}

/// Appends a balanced fee leg: the payer wallet funds fee revenue.
pub fn with_fee(
    mut entries: Vec<EntrySpec>,
    payer_wallet: &str,
    fee_revenue: &str,
    fee_amount: i64,
) -> TemplateResult<Vec<EntrySpec>> {
    entries.extend(pair(payer_wallet, fee_revenue, fee_amount, "transaction fee")?);
    Ok(entries)
}

/// Appends a balanced commission leg: fee revenue funds the agent's
/// commission payable.
pub fn with_commission(
    mut entries: Vec<EntrySpec>,
    fee_revenue: &str,
    commission_payable: &str,
    commission_amount: i64,
) -> TemplateResult<Vec<EntrySpec>> {
    entries.extend(pair(
        fee_revenue,
        commission_payable,
        commission_amount,
        "agent commission",
    )?);
    Ok(entries)
}
