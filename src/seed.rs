//! Load users from CSV into `user_data`.
//!
//! The whole load is one unit of work: schema bootstrap, duplicate checks and
//! inserts commit together or not at all.

use crate::db::{init_schema, Connection, Connector, Query};
use crate::error::DbError;
use crate::pipeline::DataAccess;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const FIND_BY_EMAIL: &str = "SELECT email FROM user_data WHERE email = ?";
const INSERT_USER: &str = "INSERT INTO user_data (user_id, name, email, age) VALUES (?, ?, ?, ?)";

/// One CSV record, matched by header name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserRow {
    pub name: String,
    pub email: String,
    pub age: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SeedReport {
    pub parsed: usize,
    pub inserted: usize,
    pub skipped: usize,
}

/// Parse every record up front so a malformed file never opens a transaction.
pub fn parse_users<R: Read>(reader: R) -> Result<Vec<UserRow>, DbError> {
    let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut rows = Vec::new();
    for record in csv_reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

/// Insert users whose email is not already present, each with a new v4 id.
pub async fn seed_users<K, R>(access: &DataAccess<K>, reader: R) -> Result<SeedReport, DbError>
where
    K: Connector,
    R: Read,
{
    let rows = Arc::new(parse_users(reader)?);
    let parsed = rows.len();

    let (inserted, skipped) = access
        .run("seed_users", move |conn| {
            let rows = rows.clone();
            Box::pin(async move {
                init_schema(conn).await?;
                let mut inserted = 0usize;
                let mut skipped = 0usize;
                for row in rows.iter() {
                    let existing = conn
                        .execute(&Query::new(FIND_BY_EMAIL).bind(row.email.as_str()))
                        .await?;
                    if !existing.is_empty() {
                        skipped += 1;
                        continue;
                    }
                    let insert = Query::new(INSERT_USER)
                        .bind(Uuid::new_v4().to_string())
                        .bind(row.name.as_str())
                        .bind(row.email.as_str())
                        .bind(row.age);
                    conn.execute(&insert).await?;
                    inserted += 1;
                }
                Ok((inserted, skipped))
            })
        })
        .await?;

    info!(parsed, inserted, skipped, "Seeded user_data");
    Ok(SeedReport {
        parsed,
        inserted,
        skipped,
    })
}

pub async fn seed_users_from_path<K: Connector>(
    access: &DataAccess<K>,
    path: impl AsRef<Path>,
) -> Result<SeedReport, DbError> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .map_err(|e| DbError::Fatal(format!("cannot open {}: {}", path.display(), e)))?;
    seed_users(access, file).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLog, AuditTag};
    use crate::db::{MockConnector, SqliteConnector, Target, Value};
    use crate::retry::RetryPolicy;
    use std::time::Duration;
    use tempfile::TempDir;

    const USERS_CSV: &str = "name,email,age\n\
        Dan Altenwerth Jr.,Molly59@gmail.com,67\n\
        Glenda Wisozk,Miriam21@gmail.com,119\n\
        Daniel Fahey IV,Delia.Lesch11@hotmail.com,49\n";

    fn sqlite_access(temp_dir: &TempDir, audit: &AuditLog) -> DataAccess<SqliteConnector> {
        let path = temp_dir.path().join("users.db");
        DataAccess::new(SqliteConnector::new(), Target::new(path.to_string_lossy().to_string()))
            .with_audit(audit.clone())
            .with_retry(RetryPolicy::new(3, Duration::from_millis(10)))
    }

    #[test]
    fn test_parse_users_trims_fields() {
        let rows = parse_users("name, email ,age\n Ada , ada@example.com , 36 \n".as_bytes()).unwrap();
        assert_eq!(
            rows,
            vec![UserRow {
                name: "Ada".to_string(),
                email: "ada@example.com".to_string(),
                age: 36,
            }]
        );
    }

    #[test]
    fn test_parse_users_rejects_bad_age() {
        let err = parse_users("name,email,age\nAda,ada@example.com,old\n".as_bytes()).unwrap_err();
        match err {
            DbError::Fatal(msg) => assert!(msg.starts_with("CSV error")),
            other => panic!("Expected Fatal error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_seed_inserts_then_skips_existing() {
        let temp_dir = TempDir::new().unwrap();
        let audit = AuditLog::memory();
        let access = sqlite_access(&temp_dir, &audit);

        let first = seed_users(&access, USERS_CSV.as_bytes()).await.unwrap();
        assert_eq!(
            first,
            SeedReport {
                parsed: 3,
                inserted: 3,
                skipped: 0
            }
        );

        let second = seed_users(&access, USERS_CSV.as_bytes()).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 3);

        let count = access
            .execute(&Query::new("SELECT COUNT(*) AS n FROM user_data"))
            .await
            .unwrap();
        assert_eq!(count.first().and_then(|r| r.get("n")), Some(&Value::Integer(3)));
        assert_eq!(audit.count(AuditTag::Commit), 3);
    }

    #[tokio::test]
    async fn test_seed_skips_duplicate_within_file() {
        let temp_dir = TempDir::new().unwrap();
        let access = sqlite_access(&temp_dir, &AuditLog::memory());
        let csv = "name,email,age\nAda,ada@example.com,36\nAda L.,ada@example.com,37\n";

        let report = seed_users(&access, csv.as_bytes()).await.unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_malformed_csv_never_touches_the_database() {
        let mock = MockConnector::new();
        let stats = mock.stats();
        let access = DataAccess::new(mock, Target::new("users.db"));

        let err = seed_users(&access, "name,email\nAda\n".as_bytes()).await.unwrap_err();

        assert!(matches!(err, DbError::Fatal(_)));
        assert_eq!(stats.acquired(), 0);
    }

    #[tokio::test]
    async fn test_failed_insert_rolls_back_whole_load() {
        let temp_dir = TempDir::new().unwrap();
        let audit = AuditLog::memory();
        let access = sqlite_access(&temp_dir, &audit);
        access
            .execute(&Query::new(
                "CREATE TABLE user_data (user_id TEXT PRIMARY KEY, name TEXT NOT NULL, \
                 email TEXT NOT NULL, age INTEGER NOT NULL CHECK (age < 100))",
            ))
            .await
            .unwrap();

        // The second row violates the age check after the first was inserted.
        let err = seed_users(&access, USERS_CSV.as_bytes()).await.unwrap_err();
        assert!(matches!(err, DbError::Fatal(_)));

        let rows = access
            .fold_rows(&Query::new("SELECT email FROM user_data"), 0usize, |n, _| n + 1)
            .await
            .unwrap();
        assert_eq!(rows, 0);
        assert_eq!(audit.count(AuditTag::Rollback), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let access = sqlite_access(&temp_dir, &AuditLog::memory());
        let err = seed_users_from_path(&access, temp_dir.path().join("missing.csv"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Fatal(_)));
    }
}
