#![deny(clippy::print_stdout, clippy::print_stderr)]

//! The synchronous contract surface of the posting core.
//!
//! This crate owns the wire shapes — snake_case JSON, decimal-string
//! amounts, RFC 3339 timestamps — and the machine-readable error
//! envelope. HTTP routing itself lives with the embedding service; the
//! facade here is what its handlers call.

mod error;
mod facade;

pub use error::ErrorBody;
pub use facade::BalanceBody;
pub use facade::EntryBody;
pub use facade::PesaFacade;
pub use facade::PostTransactionRequest;
