//! Scoped connection acquisition with guaranteed release.
//!
//! A [`ScopedConnection`] owns its connection outright. Leaving the scope
//! normally or with an error closes it through [`ScopedConnection::finish`];
//! dropping the guard (for example when the surrounding future is cancelled)
//! releases it through the connection's own `Drop`. Ownership makes a second
//! release impossible.

use crate::db::{Connection, Connector, Target};
use crate::error::DbError;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, warn};

/// Acquires connections to one target.
#[derive(Debug)]
pub struct ConnectionScope<K> {
    connector: Arc<K>,
    target: Target,
}

impl<K> Clone for ConnectionScope<K> {
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            target: self.target.clone(),
        }
    }
}

impl<K: Connector> ConnectionScope<K> {
    pub fn new(connector: Arc<K>, target: Target) -> Self {
        Self { connector, target }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Open a connection. Fails with [`DbError::Connection`] if the target
    /// cannot be reached.
    pub async fn acquire(&self) -> Result<ScopedConnection<K::Conn>, DbError> {
        let conn = self.connector.connect(&self.target).await?;
        debug!(target = %self.target, "Connection scope opened");
        Ok(ScopedConnection {
            conn,
            target: self.target.clone(),
        })
    }

    /// Run `work` with a freshly acquired connection and release it afterwards.
    ///
    /// If acquisition fails, `work` never runs. Errors raised by `work` are
    /// returned unchanged after the connection is closed.
    pub async fn run<T, F>(&self, work: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(&'c mut K::Conn) -> BoxFuture<'c, Result<T, DbError>>,
    {
        let mut scoped = self.acquire().await?;
        let result = work(scoped.conn_mut()).await;
        scoped.finish(result).await
    }
}

/// A connection held for the duration of a scope.
#[derive(Debug)]
pub struct ScopedConnection<C: Connection> {
    conn: C,
    target: Target,
}

impl<C: Connection> ScopedConnection<C> {
    pub fn conn_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Close the connection, then hand back `result`.
    ///
    /// A close failure never masks the block's own error. After a successful
    /// block the work has already been committed, so a close failure is
    /// logged rather than reported.
    pub async fn finish<T>(self, result: Result<T, DbError>) -> Result<T, DbError> {
        let target = self.target;
        if let Err(e) = self.conn.close().await {
            warn!(target = %target, error = %e, "Failed to close connection cleanly");
        }
        debug!(target = %target, ok = result.is_ok(), "Connection scope closed");
        result
    }
}
