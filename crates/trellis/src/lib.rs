//! # Trellis
//!
//! A transaction coordination layer that sits between application code
//! and a SQL database client, providing two intertwined guarantees:
//!
//! - **Transparent conflict retry** — operations that fail from
//!   transient multi-writer conflicts (serialization failures,
//!   deadlocks, unique-key races) are re-run without replaying
//!   already-durable side effects.
//! - **Deferred on-complete callbacks** — code inside a transaction can
//!   register callbacks that run exactly once, in deterministic order,
//!   only after the *outermost* enclosing transaction settles — even
//!   when those callbacks open further transactions of their own.
//!
//! ## Architecture
//!
//! ```text
//! Application code
//!     │
//!     ▼ run_transaction(body) / run_with_retry(op) / execute(stmt)
//! ConnectionContext ── per-connection state: chain head, open depth
//!     │
//!     ├─► RetryCoordinator   classify ─► policy ─► retry / fail
//!     │
//!     ├─► CallbackChain      begin link ─► append ─► drain (innermost first)
//!     │
//!     ▼ begin / execute / commit / rollback
//! DatabaseClient (e.g. trellis-postgres)
//! ```
//!
//! ## Key invariants
//!
//! 1. **One connection, one task** — no internal locking; every
//!    concurrent task gets its own [`ConnectionContext`].
//! 2. **Nested scopes never retry** — retrying while an enclosing
//!    transaction is open would replay statements it already issued.
//! 3. **The chain drains once** — after the outermost scope settles,
//!    success or failure, and never from inside the retry loop.
//! 4. **Innermost first** — a nested scope's callbacks run before its
//!    ancestor's.
//!
//! ## Example
//!
//! ```ignore
//! use std::rc::Rc;
//! use trellis::ConnectionContext;
//! use trellis_postgres::PgClient;
//!
//! let client = PgClient::connect(&database_url).await?;
//! let ctx = Rc::new(ConnectionContext::new(client));
//!
//! let paid = ctx
//!     .run_transaction(|scope| {
//!         Box::pin(async move {
//!             scope.execute("UPDATE accounts SET balance = balance - 10 WHERE id = 1").await?;
//!             scope.execute("UPDATE accounts SET balance = balance + 10 WHERE id = 2").await?;
//!             scope.on_complete(|_handle| {
//!                 Box::pin(async move {
//!                     // Runs once, after the outermost COMMIT.
//!                     println!("transfer settled");
//!                     Ok(())
//!                 })
//!             });
//!             Ok(true)
//!         })
//!     })
//!     .await?;
//! ```
//!
//! ## What this is not
//!
//! Trellis is **not** a query planner, **not** a connection pool, and
//! does **not** implement transaction isolation — isolation belongs to
//! the database, and this layer only reacts to the errors isolation
//! violations produce.

// Core modules
mod chain;
mod client;
mod config;
mod context;
mod error;
mod retry;

// Re-export the coordinator entry point
pub use context::ConnectionContext;

// Re-export chain types (callback registration surface)
pub use chain::{Callback, LinkHandle};

// Re-export the driver boundary
pub use client::DatabaseClient;

// Re-export configuration
pub use config::Config;

// Re-export error types and classification
pub use error::{DbError, ErrorKind, RetryLimitExceeded};
pub use retry::classify;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use futures::future::LocalBoxFuture;
