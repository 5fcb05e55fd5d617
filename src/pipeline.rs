//! The composed data-access chain.
//!
//! Every call goes through the same fixed order:
//!
//! ```text
//! cache (optional short-circuit)
//!   └─ retry            one fresh attempt per transient failure
//!        └─ transaction BEGIN .. COMMIT / ROLLBACK, audited
//!             └─ scope  connection acquired and released per attempt
//! ```
//!
//! Retry sits outside the transaction so that a rolled-back transaction is
//! never reused by the next attempt.

use crate::audit::AuditLog;
use crate::cache::QueryCache;
use crate::config::Config;
use crate::db::{Connection, Connector, Query, Record, ResultSet, SqliteConnector, Target, Value};
use crate::error::DbError;
use crate::retry::RetryPolicy;
use crate::scope::ConnectionScope;
use crate::transaction::Transactional;
use futures::future::BoxFuture;
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug)]
pub struct DataAccess<K: Connector> {
    scope: ConnectionScope<K>,
    retry: RetryPolicy,
    transactional: Transactional,
    cache: Option<Arc<QueryCache>>,
}

impl<K: Connector> DataAccess<K> {
    /// Default retry policy, no audit sink, no cache.
    pub fn new(connector: K, target: Target) -> Self {
        Self {
            scope: ConnectionScope::new(Arc::new(connector), target),
            retry: RetryPolicy::default(),
            transactional: Transactional::default(),
            cache: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        let audit = self.transactional.audit().clone();
        self.retry = retry.with_audit(audit);
        self
    }

    /// Route transaction outcomes and retry attempts to `audit`.
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.retry = self.retry.with_audit(audit.clone());
        self.transactional = Transactional::new(audit);
        self
    }

    pub fn with_cache(mut self, cache: Arc<QueryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn target(&self) -> &Target {
        self.scope.target()
    }

    pub fn scope(&self) -> &ConnectionScope<K> {
        &self.scope
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn audit(&self) -> &AuditLog {
        self.transactional.audit()
    }

    pub fn cache(&self) -> Option<&Arc<QueryCache>> {
        self.cache.as_ref()
    }

    /// Run `work` through retry → transaction → scope.
    ///
    /// `work` is invoked once per attempt, each time with a new connection
    /// inside a new transaction, so it must not carry state between calls.
    /// A committed unit may have written anything, so it empties the cache.
    pub async fn run<T, F>(&self, operation: &str, work: F) -> Result<T, DbError>
    where
        F: for<'c> Fn(&'c mut K::Conn) -> BoxFuture<'c, Result<T, DbError>>,
    {
        let value = self.run_chain(operation, work).await?;
        self.invalidate_cache(operation);
        Ok(value)
    }

    async fn run_chain<T, F>(&self, operation: &str, work: F) -> Result<T, DbError>
    where
        F: for<'c> Fn(&'c mut K::Conn) -> BoxFuture<'c, Result<T, DbError>>,
    {
        let scope = &self.scope;
        let transactional = &self.transactional;
        let work = &work;
        self.retry
            .run(operation, move || async move {
                let mut scoped = scope.acquire().await?;
                let result = transactional
                    .run(operation, scoped.conn_mut(), work)
                    .await;
                scoped.finish(result).await
            })
            .await
    }

    /// Execute one query.
    ///
    /// Read-only statements consult the cache first when one is attached.
    /// Every other statement always reaches the database, and once it commits
    /// the cache is emptied.
    pub async fn execute(&self, query: &Query) -> Result<ResultSet, DbError> {
        match &self.cache {
            Some(cache) if query.is_read_only() => {
                cache
                    .get_or_compute_async(query, self.execute_uncached(query))
                    .await
            }
            Some(_) => {
                let rows = self.execute_uncached(query).await?;
                self.invalidate_cache(query.text());
                Ok(rows)
            }
            None => self.execute_uncached(query).await,
        }
    }

    fn invalidate_cache(&self, operation: &str) {
        if let Some(cache) = &self.cache {
            debug!(operation, "Write committed, clearing query cache");
            cache.clear();
        }
    }

    async fn execute_uncached(&self, query: &Query) -> Result<ResultSet, DbError> {
        info!(query = %query, "Executing SQL query");
        let shared = Arc::new(query.clone());
        self.run_chain(query.text(), move |conn| {
            let query = shared.clone();
            Box::pin(async move { conn.execute(&query).await })
        })
        .await
    }

    /// Stream the rows of `query` to `on_batch` in batches of `batch_size`.
    ///
    /// Rows are read once, outside a transaction and without retries: a batch
    /// already handed to the caller cannot be taken back. Returns the number of
    /// rows delivered.
    pub async fn stream_batches<F>(
        &self,
        query: &Query,
        batch_size: usize,
        mut on_batch: F,
    ) -> Result<usize, DbError>
    where
        F: FnMut(Vec<Record>),
    {
        let batch_size = batch_size.max(1);
        debug!(query = %query, batch_size, "Streaming query in batches");
        let mut scoped = self.scope.acquire().await?;
        let result = async {
            let mut batches = scoped.conn_mut().fetch(query).chunks(batch_size);
            let mut delivered = 0usize;
            while let Some(batch) = batches.next().await {
                let batch = batch.into_iter().collect::<Result<Vec<_>, _>>()?;
                delivered += batch.len();
                on_batch(batch);
            }
            Ok::<usize, DbError>(delivered)
        }
        .await;
        scoped.finish(result).await
    }

    /// Fold over the rows of `query` without materialising the result.
    pub async fn fold_rows<A, F>(&self, query: &Query, init: A, mut fold: F) -> Result<A, DbError>
    where
        F: FnMut(A, &Record) -> A,
    {
        let mut scoped = self.scope.acquire().await?;
        let result = scoped
            .conn_mut()
            .fetch(query)
            .try_fold(init, |acc, record| {
                let acc = fold(acc, &record);
                async move { Ok::<A, DbError>(acc) }
            })
            .await;
        scoped.finish(result).await
    }
}

impl DataAccess<SqliteConnector> {
    /// SQLite access configured from `config`: retry policy, audit sink,
    /// cache TTL and busy timeout.
    pub fn from_config(config: &Config) -> std::io::Result<Self> {
        let audit = match &config.audit_log_path {
            Some(path) => AuditLog::file(path)?,
            None => AuditLog::memory(),
        };
        let connector = SqliteConnector::new().with_busy_timeout(config.busy_timeout);
        Ok(
            DataAccess::new(connector, Target::new(config.database_path.clone()))
                .with_audit(audit)
                .with_retry(RetryPolicy::new(
                    config.retry_max_attempts,
                    config.retry_delay,
                ))
                .with_cache(Arc::new(QueryCache::new(config.cache_ttl))),
        )
    }
}

/// Execute `text` with `params` against `target` using the default chain.
pub async fn execute(
    target: &Target,
    text: &str,
    params: Vec<Value>,
) -> Result<ResultSet, DbError> {
    DataAccess::new(SqliteConnector::new(), target.clone())
        .execute(&Query::with_params(text, params))
        .await
}
