#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Exact-decimal minor-unit arithmetic and the canonical SHA-256
//! fingerprints shared by the posting engine, the idempotency store, and
//! the integrity verifier.
//!
//! Monetary amounts are signed integer cents. The wire form is a decimal
//! string `[-]d+(.dd)?`; nothing else parses. Floating point is never used.

use serde_json::Value;
use serde_json::json;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

pub type AmountResult<T> = Result<T, AmountError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("malformed amount: {0}")]
    Malformed(String),
    #[error("amount out of range: {0}")]
    OutOfRange(String),
}

/// Parse a decimal string of the form `[-]d+(.dd)?` into signed cents.
///
/// The fractional part, when present, must be exactly two digits. Any
/// other shape is rejected rather than coerced.
pub fn parse_amount(input: &str) -> AmountResult<i64> {
    let (negative, digits) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input),
    };

    let (whole, fraction) = match digits.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (digits, None),
    };

    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AmountError::Malformed(input.to_string()));
    }
    if let Some(fraction) = fraction
        && (fraction.len() != 2 || !fraction.bytes().all(|b| b.is_ascii_digit()))
    {
        return Err(AmountError::Malformed(input.to_string()));
    }

    let whole_value: i64 = whole
        .parse()
        .map_err(|_| AmountError::OutOfRange(input.to_string()))?;
    let fraction_value: i64 = match fraction {
        Some(fraction) => fraction
            .parse()
            .map_err(|_| AmountError::Malformed(input.to_string()))?,
        None => 0,
    };

    let magnitude = whole_value
        .checked_mul(100)
        .and_then(|cents| cents.checked_add(fraction_value))
        .ok_or_else(|| AmountError::OutOfRange(input.to_string()))?;

    if negative {
        Ok(-magnitude)
    } else {
        Ok(magnitude)
    }
}

/// Render signed cents as a decimal string with exactly two fractional
/// digits and a `-` prefix for negative values.
pub fn format_amount(cents: i64) -> String {
    let magnitude = (cents as i128).unsigned_abs();
    let whole = magnitude / 100;
    let fraction = magnitude % 100;
    if cents < 0 {
        format!("-{whole}.{fraction:02}")
    } else {
        format!("{whole}.{fraction:02}")
    }
}

fn hex_digest(hasher: Sha256) -> String {
    format!("{:x}", hasher.finalize())
}

/// Canonical scope fingerprint:
/// `SHA-256(actor_type "|" actor_id "|" txn_type "|" idempotency_key)`.
pub fn scope_hash(
    actor_type: &str,
    actor_id: &str,
    txn_type: &str,
    idempotency_key: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(actor_type.as_bytes());
    hasher.update(b"|");
    hasher.update(actor_id.as_bytes());
    hasher.update(b"|");
    hasher.update(txn_type.as_bytes());
    hasher.update(b"|");
    hasher.update(idempotency_key.as_bytes());
    hex_digest(hasher)
}

/// A single entry as seen by the canonical hashers. Amounts are cents;
/// `entry_type` is the literal `DR`/`CR` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashEntry {
    pub account_id: String,
    pub entry_type: String,
    pub amount: i64,
}

fn canonical_entry_value(entry: &HashEntry) -> Value {
    // serde_json maps are ordered by key byte sequence, which is exactly
    // the code-point order the canonical form requires.
    json!({
        "account_id": entry.account_id,
        "amount": format_amount(entry.amount),
        "entry_type": entry.entry_type,
    })
}

/// Canonical payload fingerprint over `{entries, currency, description}`.
///
/// Entries are sorted by `(account_id, entry_type)` so the hash is
/// invariant under caller-side reordering; keys sort by code point and the
/// JSON carries no whitespace.
pub fn payload_hash(entries: &[HashEntry], currency: &str, description: &str) -> String {
    let mut sorted: Vec<&HashEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| {
        (a.account_id.as_str(), a.entry_type.as_str())
            .cmp(&(b.account_id.as_str(), b.entry_type.as_str()))
    });

    let body = json!({
        "currency": currency,
        "description": description,
        "entries": sorted.iter().map(|entry| canonical_entry_value(entry)).collect::<Vec<_>>(),
    });

    let mut hasher = Sha256::new();
    hasher.update(body.to_string().as_bytes());
    hex_digest(hasher)
}

/// Canonical journal fingerprint: `SHA-256(prev_hash || J′)` where `J′`
/// encodes the journal id, currency, transaction type, and the lines
/// sorted by `(account_id, entry_type, amount)`. The genesis journal uses
/// an empty `prev_hash`.
pub fn journal_hash(
    prev_hash: &str,
    journal_id: &str,
    currency: &str,
    txn_type: &str,
    lines: &[HashEntry],
) -> String {
    let mut sorted: Vec<&HashEntry> = lines.iter().collect();
    sorted.sort_by(|a, b| {
        (a.account_id.as_str(), a.entry_type.as_str(), a.amount)
            .cmp(&(b.account_id.as_str(), b.entry_type.as_str(), b.amount))
    });

    let body = json!({
        "currency": currency,
        "journal_id": journal_id,
        "ledger_lines": sorted
            .iter()
            .map(|line| json!([line.account_id, line.entry_type, format_amount(line.amount)]))
            .collect::<Vec<_>>(),
        "txn_type": txn_type,
    });

    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(body.to_string().as_bytes());
    hex_digest(hasher)
}
