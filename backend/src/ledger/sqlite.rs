use crate::db::Database;
use crate::error::{CoreError, CoreResult};
use crate::ledger::{CreditCheck, CreditLedger};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

/// Ledger stored in the `accounts` and `credit_transactions` tables.
///
/// Accounts are opened lazily with `default_credits` the first time a user
/// is seen.
#[derive(Clone)]
pub struct SqliteLedger {
    db: Database,
    default_credits: i64,
}

impl SqliteLedger {
    pub fn new(db: Database, default_credits: i64) -> Self {
        Self {
            db,
            default_credits,
        }
    }

    fn ensure_account(&self, conn: &Connection, user: &str) -> CoreResult<i64> {
        conn.execute(
            "INSERT OR IGNORE INTO accounts (user_id, balance) VALUES (?1, ?2)",
            params![user, self.default_credits],
        )?;
        let balance = conn.query_row(
            "SELECT balance FROM accounts WHERE user_id = ?1",
            params![user],
            |row| row.get(0),
        )?;
        Ok(balance)
    }
}

impl CreditLedger for SqliteLedger {
    fn check(&self, user: &str, cost: i64) -> CoreResult<CreditCheck> {
        if cost < 0 {
            return Err(CoreError::Validation("cost must not be negative".into()));
        }
        let current_balance = self.balance(user)?;
        Ok(CreditCheck {
            sufficient: current_balance >= cost,
            current_balance,
        })
    }

    fn debit(&self, user: &str, cost: i64, job_id: &str) -> CoreResult<i64> {
        if cost < 0 {
            return Err(CoreError::Validation("cost must not be negative".into()));
        }
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let balance = self.ensure_account(&tx, user)?;

            let already: Option<i64> = tx
                .query_row(
                    "SELECT id FROM credit_transactions WHERE job_id = ?1",
                    params![job_id],
                    |row| row.get(0),
                )
                .optional()?;
            if already.is_some() {
                return Err(CoreError::DuplicateDebit(job_id.to_string()));
            }
            if balance < cost {
                return Err(CoreError::InsufficientCredits { balance, cost });
            }

            tx.execute(
                "UPDATE accounts SET balance = balance - ?1 WHERE user_id = ?2",
                params![cost, user],
            )?;
            tx.execute(
                "INSERT INTO credit_transactions (user_id, job_id, cost, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![user, job_id, cost, Utc::now().to_rfc3339()],
            )?;
            tx.commit()?;
            Ok(balance - cost)
        })
    }

    fn balance(&self, user: &str) -> CoreResult<i64> {
        self.db.with_conn(|conn| self.ensure_account(conn, user))
    }

    fn is_settled(&self, job_id: &str) -> CoreResult<bool> {
        self.db.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT id FROM credit_transactions WHERE job_id = ?1",
                    params![job_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn ledger() -> SqliteLedger {
        SqliteLedger::new(Database::open_in_memory().unwrap(), 50)
    }

    #[test]
    fn new_accounts_start_with_default_credits() {
        let ledger = ledger();
        assert_eq!(ledger.balance("alice").unwrap(), 50);
        assert_eq!(
            ledger.check("alice", 60).unwrap(),
            CreditCheck {
                sufficient: false,
                current_balance: 50
            }
        );
        assert!(ledger.check("alice", 50).unwrap().sufficient);
    }

    #[test]
    fn debit_is_idempotent_per_job() {
        let ledger = ledger();
        assert_eq!(ledger.debit("alice", 15, "job-1").unwrap(), 35);
        assert!(ledger.is_settled("job-1").unwrap());

        assert_matches!(
            ledger.debit("alice", 15, "job-1"),
            Err(CoreError::DuplicateDebit(id)) if id == "job-1"
        );
        assert_eq!(ledger.balance("alice").unwrap(), 35);
    }

    #[test]
    fn debit_never_goes_negative() {
        let ledger = ledger();
        ledger.debit("bob", 45, "job-1").unwrap();
        assert_matches!(
            ledger.debit("bob", 10, "job-2"),
            Err(CoreError::InsufficientCredits {
                balance: 5,
                cost: 10
            })
        );
        assert_eq!(ledger.balance("bob").unwrap(), 5);
        assert!(!ledger.is_settled("job-2").unwrap());
    }

    #[test]
    fn negative_cost_is_rejected() {
        let ledger = ledger();
        assert_matches!(ledger.check("carol", -1), Err(CoreError::Validation(_)));
        assert_matches!(ledger.debit("carol", -1, "job-1"), Err(CoreError::Validation(_)));
    }
}
