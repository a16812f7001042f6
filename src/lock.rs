use sea_orm::{
    ConnectionTrait, DatabaseTransaction, DbBackend, Statement, TransactionTrait, Value,
};

use crate::config::AdvisoryLockStrategy;
use crate::error::ClosureTableError;

/// Engine transaction, optionally guarded by a PostgreSQL advisory lock.
///
/// Every multi-statement closure rewrite runs inside one of these so a
/// failure at any step rolls back the whole rewrite. The lock is
/// transaction-scoped, so PostgreSQL drops it at commit or rollback, even
/// when the transaction was aborted by a failed statement.
pub struct LockedTransaction {
    txn: DatabaseTransaction,
    locked: bool,
}

impl LockedTransaction {
    pub async fn acquire<C>(
        strategy: &AdvisoryLockStrategy,
        db: &C,
    ) -> Result<Self, ClosureTableError>
    where
        C: TransactionTrait,
    {
        let txn = db
            .begin()
            .await
            .map_err(ClosureTableError::TransactionFailure)?;

        // SQLite serializes writers on its own.
        let key = match strategy {
            AdvisoryLockStrategy::Namespaced(key)
                if txn.get_database_backend() == DbBackend::Postgres =>
            {
                Some(key.as_str())
            }
            _ => None,
        };

        if let Some(key) = key {
            if let Err(err) = acquire_lock(&txn, key).await {
                let _ = txn.rollback().await;
                return Err(err.into_transaction_failure());
            }
        }

        Ok(Self {
            txn,
            locked: key.is_some(),
        })
    }

    pub fn connection(&self) -> &DatabaseTransaction {
        &self.txn
    }

    /// Whether an advisory lock is held for the lifetime of this transaction.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub async fn commit(self) -> Result<(), ClosureTableError> {
        self.txn
            .commit()
            .await
            .map_err(ClosureTableError::TransactionFailure)
    }

    pub async fn rollback(self) -> Result<(), ClosureTableError> {
        self.txn
            .rollback()
            .await
            .map_err(ClosureTableError::TransactionFailure)
    }

    /// Commit when `result` is `Ok`, roll back otherwise.
    ///
    /// Storage errors raised inside the transaction surface as
    /// [`ClosureTableError::TransactionFailure`].
    pub async fn finish<T>(
        self,
        result: Result<T, ClosureTableError>,
    ) -> Result<T, ClosureTableError> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.rollback().await;
                Err(err.into_transaction_failure())
            }
        }
    }
}

async fn acquire_lock(txn: &DatabaseTransaction, key: &str) -> Result<(), ClosureTableError> {
    txn.execute(Statement::from_sql_and_values(
        DbBackend::Postgres,
        "SELECT pg_advisory_xact_lock(hashtext($1), 0)",
        vec![Value::from(key)],
    ))
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdvisoryLockKey;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult, Transaction};

    #[tokio::test]
    async fn postgres_lock_is_scoped_to_the_transaction() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 1,
            }])
            .into_connection();
        let strategy = AdvisoryLockStrategy::Namespaced(AdvisoryLockKey::new("nodes"));

        let guard = LockedTransaction::acquire(&strategy, &db).await.unwrap();
        assert!(guard.is_locked());
        guard.rollback().await.unwrap();

        let log = db.into_transaction_log();
        assert_eq!(
            log,
            [Transaction::many([
                Statement::from_string(DatabaseBackend::Postgres, "BEGIN"),
                Statement::from_sql_and_values(
                    DatabaseBackend::Postgres,
                    "SELECT pg_advisory_xact_lock(hashtext($1), 0)",
                    [Value::from("nodes")],
                ),
                Statement::from_string(DatabaseBackend::Postgres, "ROLLBACK"),
            ])]
        );
    }

    #[tokio::test]
    async fn sqlite_never_takes_the_lock() {
        let db = MockDatabase::new(DatabaseBackend::Sqlite).into_connection();
        let strategy = AdvisoryLockStrategy::Namespaced(AdvisoryLockKey::new("nodes"));

        let guard = LockedTransaction::acquire(&strategy, &db).await.unwrap();
        assert!(!guard.is_locked());
        guard.commit().await.unwrap();
    }
}
