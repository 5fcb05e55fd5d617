//! Schema bootstrap.

use super::{Connection, Query};
use crate::error::DbError;
use tracing::info;

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Apply the bundled schema. Every statement is idempotent.
pub async fn init_schema<C: Connection>(conn: &mut C) -> Result<(), DbError> {
    info!("Running database migrations...");

    for statement in schema_statements() {
        conn.execute(&Query::new(statement)).await?;
    }

    info!("Migrations completed successfully");
    Ok(())
}

fn schema_statements() -> impl Iterator<Item = &'static str> {
    SCHEMA_SQL
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
}
