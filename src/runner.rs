//! Concurrent execution of independent queries.
//!
//! Results come back in input order whatever order the queries finish in.
//! Every query runs through the full [`DataAccess`] chain and therefore holds
//! its own connection; nothing is shared between in-flight queries.

use crate::db::{Connector, Query, ResultSet};
use crate::error::DbError;
use crate::pipeline::DataAccess;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// What happens to the rest of the batch when one query fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Let every query finish, then report the first failure in input order.
    #[default]
    FailTogether,
    /// Cancel outstanding queries as soon as one fails.
    FailFast,
}

/// Where the queries run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    /// Interleaved on the calling task.
    #[default]
    Cooperative,
    /// One tokio task per query on the runtime's worker pool.
    Spawned,
}

#[derive(Debug)]
pub struct QueryRunner<K: Connector> {
    access: Arc<DataAccess<K>>,
    max_in_flight: usize,
    failure: FailurePolicy,
    schedule: Schedule,
}

impl<K: Connector + 'static> QueryRunner<K> {
    pub fn new(access: Arc<DataAccess<K>>) -> Self {
        Self {
            access,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            failure: FailurePolicy::default(),
            schedule: Schedule::default(),
        }
    }

    /// Upper bound on queries (and therefore connections) in flight at once.
    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn failure_policy(mut self, failure: FailurePolicy) -> Self {
        self.failure = failure;
        self
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Run every query; the i-th result belongs to the i-th query.
    pub async fn run_all(&self, queries: Vec<Query>) -> Result<Vec<ResultSet>, DbError> {
        info!(
            count = queries.len(),
            max_in_flight = self.max_in_flight,
            schedule = ?self.schedule,
            failure = ?self.failure,
            "Running queries concurrently"
        );
        match self.schedule {
            Schedule::Cooperative => self.run_cooperative(queries).await,
            Schedule::Spawned => self.run_spawned(queries).await,
        }
    }

    async fn run_cooperative(&self, queries: Vec<Query>) -> Result<Vec<ResultSet>, DbError> {
        let mut slots = Slots::new(queries.len());
        let access = &self.access;
        let mut completions = stream::iter(queries.into_iter().enumerate())
            .map(|(index, query)| async move { (index, access.execute(&query).await) })
            .buffer_unordered(self.max_in_flight);

        while let Some((index, outcome)) = completions.next().await {
            if let Some(err) = slots.accept(index, outcome, self.failure) {
                // Dropping the stream cancels whatever is still running.
                return Err(err);
            }
        }
        slots.finish()
    }

    async fn run_spawned(&self, queries: Vec<Query>) -> Result<Vec<ResultSet>, DbError> {
        let mut slots = Slots::new(queries.len());
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut tasks = JoinSet::new();

        for (index, query) in queries.into_iter().enumerate() {
            let access = self.access.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (index, access.execute(&query).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = match joined {
                Ok(completed) => completed,
                Err(e) => (
                    slots.len(),
                    Err(DbError::Fatal(format!("query task failed: {}", e))),
                ),
            };
            if let Some(err) = slots.accept(index, outcome, self.failure) {
                tasks.abort_all();
                return Err(err);
            }
        }
        slots.finish()
    }
}

/// Collects results by input position and remembers the earliest failure.
struct Slots {
    results: Vec<Option<ResultSet>>,
    first_error: Option<(usize, DbError)>,
}

impl Slots {
    fn new(count: usize) -> Self {
        Self {
            results: vec![None; count],
            first_error: None,
        }
    }

    fn len(&self) -> usize {
        self.results.len()
    }

    /// Record one completion. Returns the error when the batch should stop now.
    fn accept(
        &mut self,
        index: usize,
        outcome: Result<ResultSet, DbError>,
        failure: FailurePolicy,
    ) -> Option<DbError> {
        match outcome {
            Ok(rows) => {
                if let Some(slot) = self.results.get_mut(index) {
                    *slot = Some(rows);
                }
                None
            }
            Err(err) => {
                warn!(index, error = %err, "Query in batch failed");
                if failure == FailurePolicy::FailFast {
                    return Some(err);
                }
                let earlier = match &self.first_error {
                    Some((first, _)) => index < *first,
                    None => true,
                };
                if earlier {
                    self.first_error = Some((index, err));
                }
                None
            }
        }
    }

    fn finish(self) -> Result<Vec<ResultSet>, DbError> {
        if let Some((_, err)) = self.first_error {
            return Err(err);
        }
        self.results
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| DbError::Fatal(format!("query {} produced no result", index)))
            })
            .collect()
    }
}
