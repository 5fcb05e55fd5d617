//! Mock connector for testing without a database file.

use super::{Connection, Connector, Query, Record, ResultSet, Target};
use crate::error::DbError;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counters shared by a [`MockConnector`] and every connection it hands out.
#[derive(Debug, Default)]
pub struct MockStats {
    acquired: AtomicUsize,
    released: AtomicUsize,
    open: AtomicUsize,
    peak_open: AtomicUsize,
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    executions: AtomicUsize,
    completed: Mutex<Vec<String>>,
}

impl MockStats {
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Highest number of connections held at the same time.
    pub fn peak_open(&self) -> usize {
        self.peak_open.load(Ordering::SeqCst)
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Query texts in the order their executions finished.
    pub fn completion_order(&self) -> Vec<String> {
        self.completed.lock().clone()
    }
}

#[derive(Debug, Default)]
struct Script {
    results: HashMap<String, ResultSet>,
    delays: HashMap<String, Duration>,
    failures: HashMap<String, VecDeque<DbError>>,
    begin_failures: VecDeque<DbError>,
    commit_failures: VecDeque<DbError>,
    connect_failure: Option<String>,
}

/// Connector that serves scripted results and records what happened.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    script: Arc<Mutex<Script>>,
    stats: Arc<MockStats>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `rows` for every execution of `text`.
    pub fn with_result(self, text: &str, rows: Vec<Record>) -> Self {
        self.script
            .lock()
            .results
            .insert(text.to_string(), ResultSet::new(rows));
        self
    }

    /// Sleep before answering `text`, simulating a slow round trip.
    pub fn with_delay(self, text: &str, delay: Duration) -> Self {
        self.script.lock().delays.insert(text.to_string(), delay);
        self
    }

    /// Fail the next execution of `text` with `error`. Queued failures are
    /// consumed in order before the scripted result is served.
    pub fn with_failure(self, text: &str, error: DbError) -> Self {
        self.script
            .lock()
            .failures
            .entry(text.to_string())
            .or_default()
            .push_back(error);
        self
    }

    /// Fail the next `BEGIN` with `error`.
    pub fn with_begin_failure(self, error: DbError) -> Self {
        self.script.lock().begin_failures.push_back(error);
        self
    }

    /// Fail the next commit with `error`.
    pub fn with_commit_failure(self, error: DbError) -> Self {
        self.script.lock().commit_failures.push_back(error);
        self
    }

    /// Refuse every acquisition.
    pub fn unreachable(self, message: &str) -> Self {
        self.script.lock().connect_failure = Some(message.to_string());
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Conn = MockConnection;

    async fn connect(&self, target: &Target) -> Result<MockConnection, DbError> {
        if let Some(message) = self.script.lock().connect_failure.clone() {
            return Err(DbError::connection(target, message));
        }
        self.stats.acquired.fetch_add(1, Ordering::SeqCst);
        let open = self.stats.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_open.fetch_max(open, Ordering::SeqCst);
        Ok(MockConnection {
            script: self.script.clone(),
            release: ReleaseToken {
                stats: self.stats.clone(),
            },
        })
    }
}

/// Counts the release when dropped, so every exit path is observed exactly once.
#[derive(Debug)]
struct ReleaseToken {
    stats: Arc<MockStats>,
}

impl Drop for ReleaseToken {
    fn drop(&mut self) {
        self.stats.open.fetch_sub(1, Ordering::SeqCst);
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockConnection {
    script: Arc<Mutex<Script>>,
    release: ReleaseToken,
}

impl MockConnection {
    async fn respond(&self, text: &str) -> Result<ResultSet, DbError> {
        let delay = self.script.lock().delays.get(text).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let stats = &self.release.stats;
        stats.executions.fetch_add(1, Ordering::SeqCst);
        let outcome = {
            let mut script = self.script.lock();
            match script.failures.get_mut(text).and_then(|queue| queue.pop_front()) {
                Some(error) => Err(error),
                None => script
                    .results
                    .get(text)
                    .cloned()
                    .ok_or_else(|| DbError::Fatal(format!("no such table for query: {}", text))),
            }
        };
        stats.completed.lock().push(text.to_string());
        outcome
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn fetch<'c>(&'c mut self, query: &'c Query) -> BoxStream<'c, Result<Record, DbError>> {
        stream::once(self.respond(query.text()))
            .flat_map(|outcome| match outcome {
                Ok(rows) => stream::iter(rows.rows().to_vec().into_iter().map(Ok)).boxed(),
                Err(e) => stream::once(async move { Err(e) }).boxed(),
            })
            .boxed()
    }

    async fn execute(&mut self, query: &Query) -> Result<ResultSet, DbError> {
        self.respond(query.text()).await
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        self.release.stats.begins.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().begin_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.release.stats.commits.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().commit_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.release.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(self) -> Result<(), DbError> {
        drop(self.release);
        Ok(())
    }
}
