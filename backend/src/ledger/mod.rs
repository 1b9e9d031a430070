//! # Credit ledger
//!
//! Balances and per-job debits. The job core only ever asks two things of
//! the ledger: whether a user can afford a kind before it is submitted, and
//! to charge a completed job exactly once when its artifact is downloaded.
//!
//! ## Sub-modules:
//! - `sqlite`: the rusqlite-backed implementation.
//! - `billing`: the glue that debits a job under the job's own lock.

pub mod billing;
pub mod sqlite;

use crate::error::CoreResult;

pub use sqlite::SqliteLedger;

/// Outcome of a balance check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreditCheck {
    pub sufficient: bool,
    pub current_balance: i64,
}

pub trait CreditLedger: Send + Sync {
    fn check(&self, user: &str, cost: i64) -> CoreResult<CreditCheck>;

    /// Charges `cost` for `job_id` and returns the balance afterwards.
    ///
    /// Fails with `DuplicateDebit` if the job has already been charged and
    /// with `InsufficientCredits` if the balance would go negative. A failed
    /// debit changes nothing.
    fn debit(&self, user: &str, cost: i64, job_id: &str) -> CoreResult<i64>;

    fn balance(&self, user: &str) -> CoreResult<i64>;

    /// Whether `job_id` has already been charged.
    fn is_settled(&self, job_id: &str) -> CoreResult<bool>;
}
