pub mod audit;
pub mod blocking;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod retry;
pub mod runner;
pub mod scope;
pub mod seed;
pub mod transaction;

pub use audit::{AuditEntry, AuditLog, AuditTag};
pub use blocking::BlockingDataAccess;
pub use cache::{CacheKey, Lookup, QueryCache};
pub use config::{Config, ConfigError};
pub use db::{
    init_schema, Connection, Connector, MockConnector, Query, Record, ResultSet, SqliteConnector,
    Target, Value,
};
pub use error::DbError;
pub use pipeline::{execute, DataAccess};
pub use retry::RetryPolicy;
pub use runner::{FailurePolicy, QueryRunner, Schedule};
pub use scope::{ConnectionScope, ScopedConnection};
pub use seed::{seed_users, SeedReport};
pub use transaction::{TransactionOutcome, Transactional};
