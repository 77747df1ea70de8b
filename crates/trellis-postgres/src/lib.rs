//! PostgreSQL implementation of the trellis `DatabaseClient`.
//!
//! This crate adapts a single sqlx [`PgConnection`] to the coordination
//! layer's boundary trait.
//!
//! # Features
//!
//! - SQLSTATE-based error classification (`40001` serialization
//!   failure, `40P01` deadlock, `23505` unique violation)
//! - Savepoint-backed nesting: the coordinator calls plain
//!   `begin`/`commit`/`rollback` at every nesting level and this client
//!   maps inner levels to `SAVEPOINT`/`RELEASE`/`ROLLBACK TO`
//! - Single-connection ownership, matching the coordinator's
//!   one-connection-per-task discipline — no pool
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::rc::Rc;
//! use trellis::ConnectionContext;
//! use trellis_postgres::PgClient;
//!
//! let client = PgClient::connect("postgres://localhost/mydb").await?;
//! let ctx = Rc::new(ConnectionContext::new(client));
//!
//! ctx.run_transaction(|scope| { ... }).await?;
//! ```

use std::cell::{Cell, RefCell};

use async_trait::async_trait;
use sqlx::postgres::PgConnection;
use sqlx::{Connection, Executor};
use trellis::{DatabaseClient, DbError, ErrorKind};

/// A single PostgreSQL connection speaking the trellis client protocol.
///
/// Owned by one task at a time, like the `ConnectionContext` that wraps
/// it. Interior mutability is `RefCell`, not a lock: concurrent use from
/// two tasks is a caller bug, not something this type defends against.
pub struct PgClient {
    conn: RefCell<PgConnection>,
    /// Transaction levels currently open on this connection; level 1 is
    /// the real transaction, levels above it are savepoints.
    open_levels: Cell<u32>,
}

impl PgClient {
    /// Connect to the given `postgres://` URL.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let conn = PgConnection::connect(url).await.map_err(map_sqlx_error)?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an already-established connection.
    pub fn from_connection(conn: PgConnection) -> Self {
        Self {
            conn: RefCell::new(conn),
            open_levels: Cell::new(0),
        }
    }

    /// Give the underlying connection back, e.g. to close it cleanly.
    pub fn into_connection(self) -> PgConnection {
        self.conn.into_inner()
    }

    fn savepoint(level: u32) -> String {
        format!("trellis_sp_{level}")
    }

    async fn run(&self, sql: &str) -> Result<u64, DbError> {
        let mut conn = self.conn.borrow_mut();
        conn.execute(sql)
            .await
            .map(|done| done.rows_affected())
            .map_err(map_sqlx_error)
    }
}

#[async_trait(?Send)]
impl DatabaseClient for PgClient {
    async fn begin(&self) -> Result<(), DbError> {
        let level = self.open_levels.get();
        if level == 0 {
            self.run("BEGIN").await?;
        } else {
            self.run(&format!("SAVEPOINT {}", Self::savepoint(level)))
                .await?;
        }
        self.open_levels.set(level + 1);
        Ok(())
    }

    async fn commit(&self) -> Result<(), DbError> {
        let level = self.open_levels.get();
        if level <= 1 {
            self.run("COMMIT").await?;
        } else {
            self.run(&format!("RELEASE SAVEPOINT {}", Self::savepoint(level - 1)))
                .await?;
        }
        self.open_levels.set(level.saturating_sub(1));
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DbError> {
        let level = self.open_levels.get();
        let result = if level <= 1 {
            self.run("ROLLBACK").await
        } else {
            self.run(&format!(
                "ROLLBACK TO SAVEPOINT {}",
                Self::savepoint(level - 1)
            ))
            .await
        };
        // Even a failed rollback closes our bookkeeping for this level;
        // the connection is unusable anyway if ROLLBACK itself errors.
        self.open_levels.set(level.saturating_sub(1));
        result.map(|_| ())
    }

    async fn execute(&self, statement: &str) -> Result<u64, DbError> {
        self.run(statement).await
    }
}

/// Map an sqlx error to the coordination layer's taxonomy.
fn map_sqlx_error(error: sqlx::Error) -> DbError {
    let (kind, message) = match &error {
        sqlx::Error::Database(db) => {
            let kind = match db.code().as_deref() {
                Some(code) => classify_sqlstate(code),
                None if db.is_unique_violation() => ErrorKind::UniqueViolation,
                None => ErrorKind::Other,
            };
            (kind, db.message().to_owned())
        }
        // IO, protocol, decode, timeout errors: nothing the retry
        // engine should touch.
        other => (ErrorKind::Other, other.to_string()),
    };
    DbError::with_source(kind, message, error)
}

fn classify_sqlstate(code: &str) -> ErrorKind {
    match code {
        "40001" => ErrorKind::SerializationFailure,
        "40P01" => ErrorKind::Deadlock,
        "23505" => ErrorKind::UniqueViolation,
        _ => ErrorKind::Other,
    }
}
