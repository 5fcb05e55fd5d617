//! Database access primitives.
//!
//! This module provides:
//! - `Connector` / `Connection` traits, the seam every layer above is written against
//! - SQLite implementation backed by sqlx
//! - Mock connector for tests without a database file
//! - Schema bootstrap

use crate::error::DbError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use std::fmt;

pub mod migrations;
pub mod mock;
pub mod sqlite;
pub mod types;

pub use migrations::init_schema;
pub use mock::{MockConnector, MockStats};
pub use sqlite::{SqliteConnector, SqliteSession};
pub use types::{Query, Record, ResultSet, Target, Value};

/// Opens sessions against a [`Target`].
///
/// Implementations must map every acquisition failure to [`DbError::Connection`].
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    type Conn: Connection + 'static;

    async fn connect(&self, target: &Target) -> Result<Self::Conn, DbError>;
}

/// A single, exclusively owned database session.
///
/// Dropping a connection releases it. `close` releases it explicitly and
/// reports errors from the shutdown handshake.
#[async_trait]
pub trait Connection: Send + Sized {
    /// Stream the rows produced by `query`.
    fn fetch<'c>(&'c mut self, query: &'c Query) -> BoxStream<'c, Result<Record, DbError>>;

    /// Execute `query` and collect every row.
    async fn execute(&mut self, query: &Query) -> Result<ResultSet, DbError> {
        let rows: Vec<Record> = self.fetch(query).try_collect().await?;
        Ok(ResultSet::new(rows))
    }

    async fn begin(&mut self) -> Result<(), DbError>;

    async fn commit(&mut self) -> Result<(), DbError>;

    async fn rollback(&mut self) -> Result<(), DbError>;

    async fn close(self) -> Result<(), DbError>;
}
