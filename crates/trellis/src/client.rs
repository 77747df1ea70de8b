//! Boundary trait for the underlying database driver.

use async_trait::async_trait;

use crate::error::DbError;

/// Minimal capability the coordinator needs from a database connection.
///
/// One implementation instance maps to one physical connection, owned by
/// exactly one task at a time; the coordinator never shares a client
/// across tasks. Nested `begin`/`commit`/`rollback` calls are the
/// adapter's concern — the Postgres adapter maps them to savepoints.
///
/// Errors must come back as [`DbError`] with the kind already resolved
/// (serialization conflict, deadlock, uniqueness violation, or other) so
/// the retry engine stays driver-agnostic.
#[async_trait(?Send)]
pub trait DatabaseClient {
    /// Open a transaction, or a nested level of one.
    async fn begin(&self) -> Result<(), DbError>;

    /// Commit the innermost open transaction level.
    async fn commit(&self) -> Result<(), DbError>;

    /// Roll back the innermost open transaction level.
    async fn rollback(&self) -> Result<(), DbError>;

    /// Run a single statement, returning the affected row count.
    async fn execute(&self, statement: &str) -> Result<u64, DbError>;
}
