//! Synchronous facade over the async chain.
//!
//! Drives [`DataAccess`] on a private current-thread runtime so callers
//! without an executor can use the same scope, transaction, retry and cache
//! behaviour. Must not be used from inside another tokio runtime.

use crate::db::{Connector, Query, ResultSet};
use crate::error::DbError;
use crate::pipeline::DataAccess;
use crate::runner::QueryRunner;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

#[derive(Debug)]
pub struct BlockingDataAccess<K: Connector> {
    runtime: Runtime,
    access: Arc<DataAccess<K>>,
}

impl<K: Connector + 'static> BlockingDataAccess<K> {
    pub fn new(access: DataAccess<K>) -> Result<Self, DbError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DbError::Fatal(format!("failed to start runtime: {}", e)))?;
        Ok(Self {
            runtime,
            access: Arc::new(access),
        })
    }

    pub fn access(&self) -> &DataAccess<K> {
        &self.access
    }

    pub fn execute(&self, query: &Query) -> Result<ResultSet, DbError> {
        self.runtime.block_on(self.access.execute(query))
    }

    pub fn run<T, F>(&self, operation: &str, work: F) -> Result<T, DbError>
    where
        F: for<'c> Fn(&'c mut K::Conn) -> BoxFuture<'c, Result<T, DbError>>,
    {
        self.runtime.block_on(self.access.run(operation, work))
    }

    /// Queries still overlap on the private runtime; the call blocks until
    /// all of them are done.
    pub fn run_all(&self, queries: Vec<Query>) -> Result<Vec<ResultSet>, DbError> {
        let runner = QueryRunner::new(self.access.clone());
        self.runtime.block_on(runner.run_all(queries))
    }
}
