//! # Bank Transfer Demo
//!
//! Two accounts, one transfer, and a deferred notification that only
//! fires after the outermost transaction commits. Run a few copies of
//! this against the same database to watch serialization conflicts
//! self-heal.
//!
//! ```sh
//! DATABASE_URL=postgres://localhost/trellis_demo cargo run -p transfer-demo
//! ```

use std::rc::Rc;

use anyhow::{Context, Result};
use trellis::ConnectionContext;
use trellis_postgres::PgClient;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS accounts (
    id      BIGINT PRIMARY KEY,
    balance BIGINT NOT NULL CHECK (balance >= 0)
)";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let url = std::env::var("DATABASE_URL").context("DATABASE_URL is not set")?;
    let client = PgClient::connect(&url).await?;
    let ctx = Rc::new(ConnectionContext::new(client));

    // Schema and seed rows, retried like any standalone statement.
    ctx.execute(SCHEMA).await?;
    ctx.execute("INSERT INTO accounts (id, balance) VALUES (1, 100), (2, 0) ON CONFLICT (id) DO NOTHING")
        .await?;

    let moved = ctx
        .run_transaction(|scope| {
            Box::pin(async move {
                let debited = scope
                    .execute("UPDATE accounts SET balance = balance - 10 WHERE id = 1")
                    .await?;
                anyhow::ensure!(debited == 1, "debit account is missing");

                scope
                    .execute("UPDATE accounts SET balance = balance + 10 WHERE id = 2")
                    .await?;

                // Deferred until the outermost COMMIT; a conflicting
                // attempt that gets rolled back never reaches this.
                scope.on_complete(|handle| {
                    Box::pin(async move {
                        tracing::info!("transfer settled, auditing");
                        handle
                            .context()
                            .run_transaction(|audit| {
                                Box::pin(async move {
                                    audit
                                        .execute(
                                            "INSERT INTO accounts (id, balance) VALUES (99, 0) \
                                             ON CONFLICT (id) DO NOTHING",
                                        )
                                        .await?;
                                    Ok(())
                                })
                            })
                            .await?;
                        Ok(())
                    })
                });

                Ok(10i64)
            })
        })
        .await?;

    tracing::info!(amount = moved, "transfer complete");
    Ok(())
}
