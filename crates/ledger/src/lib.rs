//! Ledger domain (accounts, transactions, double-entry postings).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns. Every
//! function here mutates values in memory; the infrastructure layer decides
//! which unit of work the result is persisted in.

pub mod account;
pub mod hold;
pub mod posting;
pub mod transaction;

pub use account::{Account, AccountParts, AccountRole, AccountStatus, Capture, Release};
pub use hold::{authorize_hold, release_hold};
pub use posting::{EntryLine, Posting, TransactionEntry, apply_cashback, settle_inbound};
pub use transaction::{NewTransaction, Transaction, TransactionStatus, TransactionType};
