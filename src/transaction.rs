//! Transaction boundary around a unit of work.

use crate::audit::{AuditLog, AuditTag};
use crate::db::Connection;
use crate::error::DbError;
use futures::future::BoxFuture;
use tracing::{info, warn};

/// How a unit of work ended.
#[derive(Debug, Clone)]
pub enum TransactionOutcome {
    Committed,
    RolledBack { error: DbError },
}

/// Commits on success, rolls back on failure, and audits the outcome.
///
/// Holds no connection; it operates on whatever connection it is given.
#[derive(Debug, Clone, Default)]
pub struct Transactional {
    audit: AuditLog,
}

impl Transactional {
    pub fn new(audit: AuditLog) -> Self {
        Self { audit }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Run `work` inside `BEGIN` .. `COMMIT`/`ROLLBACK` on `conn`.
    ///
    /// The unit's error is returned unchanged after the rollback. If the
    /// commit itself fails the transaction is rolled back and the commit
    /// error is returned. A failed `BEGIN` is audited as a rollback; `work`
    /// does not run.
    pub async fn run<C, T, F>(&self, operation: &str, conn: &mut C, work: F) -> Result<T, DbError>
    where
        C: Connection,
        F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, Result<T, DbError>>,
    {
        if let Err(e) = conn.begin().await {
            self.record(operation, TransactionOutcome::RolledBack { error: e.clone() });
            return Err(e);
        }

        let result = match work(&mut *conn).await {
            Ok(value) => match conn.commit().await {
                Ok(()) => Ok(value),
                Err(e) => {
                    rollback_quietly(operation, conn).await;
                    Err(e)
                }
            },
            Err(e) => {
                rollback_quietly(operation, conn).await;
                Err(e)
            }
        };

        let outcome = match &result {
            Ok(_) => TransactionOutcome::Committed,
            Err(e) => TransactionOutcome::RolledBack { error: e.clone() },
        };
        self.record(operation, outcome);
        result
    }

    fn record(&self, operation: &str, outcome: TransactionOutcome) {
        match outcome {
            TransactionOutcome::Committed => {
                info!(operation, "Transaction committed");
                self.audit.record(AuditTag::Commit, operation, None);
            }
            TransactionOutcome::RolledBack { error } => {
                warn!(operation, error = %error, "Transaction rolled back");
                self.audit
                    .record(AuditTag::Rollback, operation, Some(error.to_string()));
            }
        }
    }
}

async fn rollback_quietly<C: Connection>(operation: &str, conn: &mut C) {
    if let Err(e) = conn.rollback().await {
        warn!(operation, error = %e, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Connector, MockConnector, Query, Record, Target};

    #[tokio::test]
    async fn test_commit_on_success() {
        let mock = MockConnector::new().with_result(
            "UPDATE users SET email = ? WHERE id = ?",
            vec![],
        );
        let stats = mock.stats();
        let audit = AuditLog::memory();
        let tx = Transactional::new(audit.clone());
        let mut conn = mock.connect(&Target::new("users.db")).await.unwrap();

        let rows = tx
            .run("update_user_email", &mut conn, |conn| {
                Box::pin(async move {
                    conn.execute(
                        &Query::new("UPDATE users SET email = ? WHERE id = ?")
                            .bind("crawford@example.com")
                            .bind(1),
                    )
                    .await
                })
            })
            .await
            .unwrap();

        assert!(rows.is_empty());
        assert_eq!(stats.begins(), 1);
        assert_eq!(stats.commits(), 1);
        assert_eq!(stats.rollbacks(), 0);
        assert_eq!(audit.count(AuditTag::Commit), 1);
        assert_eq!(audit.count(AuditTag::Rollback), 0);
        assert!(audit.lines()[0].ends_with("COMMIT update_user_email"));
    }

    #[tokio::test]
    async fn test_rollback_on_error_returns_original_error() {
        let mock = MockConnector::new().with_failure(
            "INSERT INTO users (email) VALUES (?)",
            DbError::Fatal("UNIQUE constraint failed: users.email".to_string()),
        );
        let stats = mock.stats();
        let audit = AuditLog::memory();
        let tx = Transactional::new(audit.clone());
        let mut conn = mock.connect(&Target::new("users.db")).await.unwrap();

        let err = tx
            .run("insert_user", &mut conn, |conn| {
                Box::pin(async move {
                    conn.execute(&Query::new("INSERT INTO users (email) VALUES (?)").bind("a@b.c"))
                        .await
                })
            })
            .await
            .unwrap_err();

        match err {
            DbError::Fatal(msg) => assert_eq!(msg, "UNIQUE constraint failed: users.email"),
            other => panic!("Expected original Fatal error, got {:?}", other),
        }
        assert_eq!(stats.commits(), 0);
        assert_eq!(stats.rollbacks(), 1);
        assert_eq!(audit.count(AuditTag::Rollback), 1);
        assert!(audit.lines()[0]
            .ends_with("ROLLBACK insert_user: Fatal error: UNIQUE constraint failed: users.email"));
    }

    #[tokio::test]
    async fn test_commit_failure_rolls_back() {
        let mock = MockConnector::new()
            .with_result("SELECT 1", vec![Record::new().with("v", 1)])
            .with_commit_failure(DbError::Transient("database is locked".to_string()));
        let stats = mock.stats();
        let audit = AuditLog::memory();
        let tx = Transactional::new(audit.clone());
        let mut conn = mock.connect(&Target::new("users.db")).await.unwrap();

        let err = tx
            .run("read", &mut conn, |conn| {
                Box::pin(async move { conn.execute(&Query::new("SELECT 1")).await })
            })
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(stats.commits(), 1);
        assert_eq!(stats.rollbacks(), 1);
        assert_eq!(audit.count(AuditTag::Commit), 0);
        assert_eq!(audit.count(AuditTag::Rollback), 1);
    }

    #[tokio::test]
    async fn test_begin_failure_is_audited_and_skips_work() {
        let mock = MockConnector::new()
            .with_result("SELECT 1", vec![])
            .with_begin_failure(DbError::Transient("database is locked".to_string()));
        let stats = mock.stats();
        let audit = AuditLog::memory();
        let tx = Transactional::new(audit.clone());
        let mut conn = mock.connect(&Target::new("users.db")).await.unwrap();

        let err = tx
            .run("read", &mut conn, |conn| {
                Box::pin(async move { conn.execute(&Query::new("SELECT 1")).await })
            })
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(stats.executions(), 0);
        assert_eq!(stats.commits(), 0);
        assert_eq!(audit.count(AuditTag::Rollback), 1);
        assert!(audit.lines()[0].ends_with("ROLLBACK read: Transient error: database is locked"));
    }

    #[tokio::test]
    async fn test_stateless_across_invocations() {
        let mock = MockConnector::new().with_result("SELECT 1", vec![]);
        let stats = mock.stats();
        let audit = AuditLog::memory();
        let tx = Transactional::new(audit.clone());
        let mut conn = mock.connect(&Target::new("users.db")).await.unwrap();

        for _ in 0..3 {
            tx.run("read", &mut conn, |conn| {
                Box::pin(async move { conn.execute(&Query::new("SELECT 1")).await })
            })
            .await
            .unwrap();
        }

        assert_eq!(stats.begins(), 3);
        assert_eq!(stats.commits(), 3);
        assert_eq!(audit.count(AuditTag::Commit), 3);
    }
}
