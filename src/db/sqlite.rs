//! SQLite connector backed by sqlx.

use super::{Connection, Connector, Query, Record, Target, Value};
use crate::error::DbError;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sqlx::query::Query as SqlxQuery;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Column, ConnectOptions, Connection as _, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Opens one SQLite connection per scope.
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    busy_timeout: Duration,
    create_if_missing: bool,
}

impl SqliteConnector {
    pub fn new() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5000),
            create_if_missing: true,
        }
    }

    /// How long SQLite waits on a locked database before reporting `SQLITE_BUSY`.
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    /// Fail acquisition instead of creating a missing database file.
    pub fn must_exist(mut self) -> Self {
        self.create_if_missing = false;
        self
    }

    fn options(&self, target: &Target) -> Result<SqliteConnectOptions, DbError> {
        let options = SqliteConnectOptions::from_str(&target.to_url())
            .map_err(|e| DbError::connection(target, e))?
            .create_if_missing(self.create_if_missing)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(self.busy_timeout)
            .synchronous(SqliteSynchronous::Normal)
            .disable_statement_logging();
        Ok(options)
    }
}

impl Default for SqliteConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    type Conn = SqliteSession;

    async fn connect(&self, target: &Target) -> Result<SqliteSession, DbError> {
        let conn = self
            .options(target)?
            .connect()
            .await
            .map_err(|e| DbError::connection(target, e))?;
        debug!(target = %target, "Connected to database");
        Ok(SqliteSession {
            conn,
            target: target.clone(),
        })
    }
}

/// An open SQLite connection.
#[derive(Debug)]
pub struct SqliteSession {
    conn: SqliteConnection,
    target: Target,
}

impl SqliteSession {
    pub fn target(&self) -> &Target {
        &self.target
    }

    async fn run_control(&mut self, statement: &str) -> Result<(), DbError> {
        sqlx::query(statement).execute(&mut self.conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Connection for SqliteSession {
    fn fetch<'c>(&'c mut self, query: &'c Query) -> BoxStream<'c, Result<Record, DbError>> {
        debug!(query = %query.text(), params = query.params().len(), "Executing SQL query");
        bind_params(sqlx::query(query.text()), query.params())
            .fetch(&mut self.conn)
            .map(|row| row.map_err(DbError::from).and_then(|row| decode_row(&row)))
            .boxed()
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        self.run_control("BEGIN").await
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.run_control("COMMIT").await
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.run_control("ROLLBACK").await
    }

    async fn close(self) -> Result<(), DbError> {
        let target = self.target;
        self.conn.close().await?;
        debug!(target = %target, "Connection closed");
        Ok(())
    }
}

fn bind_params<'q>(
    mut query: SqlxQuery<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [Value],
) -> SqlxQuery<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<i64>),
            Value::Integer(i) => query.bind(*i),
            Value::Real(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.as_str()),
            Value::Blob(b) => query.bind(b.as_slice()),
        };
    }
    query
}

/// Decode by the storage class of each value, not the declared column type.
fn decode_row(row: &SqliteRow) -> Result<Record, DbError> {
    let mut record = Record::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let raw = row.try_get_raw(idx)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" | "BOOLEAN" => Value::Integer(row.try_get_unchecked::<i64, _>(idx)?),
                "REAL" => Value::Real(row.try_get_unchecked::<f64, _>(idx)?),
                "BLOB" => Value::Blob(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
                _ => Value::Text(row.try_get_unchecked::<String, _>(idx)?),
            }
        };
        record.push(column.name(), value);
    }
    Ok(record)
}
