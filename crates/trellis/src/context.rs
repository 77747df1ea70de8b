//! Per-connection coordinator: the transaction scope state machine.
//!
//! A [`ConnectionContext`] owns one database connection and the two
//! pieces of per-connection mutable state the coordinator needs: the
//! current chain head and the open-transaction depth. It is deliberately
//! lock-free — `Cell`/`RefCell`, never a mutex — and therefore must be
//! owned by a single task; give each concurrent task its own connection.
//!
//! [`ConnectionContext::run_transaction`] drives one (possibly nested)
//! scope through begin → body → commit, retrying the whole sequence on
//! transient conflicts and draining the deferred-callback chain exactly
//! once after the outermost scope settles, success or failure.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::chain::{self, ChainLink, LinkHandle};
use crate::client::DatabaseClient;
use crate::config::Config;
use crate::retry::{RetryState, Step};

/// Coordinator state for one physical database connection.
///
/// Wrap it in an `Rc` to use it — bodies and callbacks receive handles
/// holding clones of that `Rc`, which is what lets a callback open a
/// fresh transaction on the same connection while the chain drains.
pub struct ConnectionContext {
    client: Box<dyn DatabaseClient>,
    /// Head of the deferred-callback chain, or `None` between outermost
    /// transactions.
    head: RefCell<Option<Rc<ChainLink>>>,
    /// Transactions begun and not yet settled on this connection.
    depth: Cell<u32>,
    config: Config,
}

impl ConnectionContext {
    pub fn new(client: impl DatabaseClient + 'static) -> Self {
        Self::with_config(client, Config::default())
    }

    pub fn with_config(client: impl DatabaseClient + 'static, config: Config) -> Self {
        Self {
            client: Box::new(client),
            head: RefCell::new(None),
            depth: Cell::new(0),
            config,
        }
    }

    /// How many transactions are currently open on this connection.
    pub fn open_transaction_depth(&self) -> u32 {
        self.depth.get()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn chain_head(&self) -> Option<Rc<ChainLink>> {
        self.head.borrow().clone()
    }

    pub(crate) fn set_chain_head(&self, head: Option<Rc<ChainLink>>) {
        *self.head.borrow_mut() = head;
    }

    /// Run `body` inside a transaction with conflict retry and deferred
    /// on-complete callbacks.
    ///
    /// The body receives a [`LinkHandle`] for registering callbacks and
    /// opening nested transactions. The whole begin → body → commit
    /// sequence retries on transient conflicts when no enclosing
    /// transaction is open; nested scopes never retry on their own and
    /// instead surface the error to their outermost scope. However the
    /// scope ends, the callback chain is drained exactly once before
    /// this returns, and a callback error is never fed back into the
    /// retry loop.
    ///
    /// The body may run several times; side effects outside the
    /// transaction must be idempotent or deferred via
    /// [`LinkHandle::on_complete`].
    pub async fn run_transaction<T, F>(self: &Rc<Self>, mut body: F) -> anyhow::Result<T>
    where
        T: 'static,
        F: FnMut(LinkHandle) -> LocalBoxFuture<'static, anyhow::Result<T>>,
    {
        let mut retry = RetryState::new();
        let mut last_link: Option<Rc<ChainLink>> = None;

        let outcome = loop {
            match self.attempt(&mut body, &mut last_link).await {
                Ok(value) => break Ok(value),
                Err(error) => match retry.next(error, self.depth.get(), &self.config) {
                    Step::Retry => continue,
                    Step::Fail(error) => break Err(error),
                },
            }
        };

        // Exactly once, on every exit path. If begin failed on every
        // attempt no link was ever created and there is nothing to
        // drain. On the failure path the head was already cleared, so
        // the drain settles the chain pointer without running anything.
        let drained = match &last_link {
            Some(link) => chain::drain_chain(self, link).await,
            None => Ok(false),
        };

        let value = outcome?;
        drained?;
        Ok(value)
    }

    /// One begin → body → commit attempt. On failure the transaction is
    /// rolled back and the chain head cleared before the error is handed
    /// to the retry policy.
    async fn attempt<T, F>(
        self: &Rc<Self>,
        body: &mut F,
        last_link: &mut Option<Rc<ChainLink>>,
    ) -> anyhow::Result<T>
    where
        T: 'static,
        F: FnMut(LinkHandle) -> LocalBoxFuture<'static, anyhow::Result<T>>,
    {
        self.client.begin().await?;
        // Depth counts open transactions, so classification after our
        // own rollback sees only the enclosing scopes.
        self.depth.set(self.depth.get() + 1);

        let link = ChainLink::begin(self);
        *last_link = Some(Rc::clone(&link));

        let result = match body(LinkHandle::new(Rc::clone(self), link)).await {
            Ok(value) => self
                .client
                .commit()
                .await
                .map(|()| value)
                .map_err(anyhow::Error::from),
            Err(error) => Err(error),
        };

        match result {
            Ok(value) => {
                self.depth.set(self.depth.get() - 1);
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = self.client.rollback().await {
                    // The original failure is the interesting one.
                    tracing::warn!(error = %rollback_error, "rollback failed after transaction error");
                }
                self.depth.set(self.depth.get() - 1);
                self.set_chain_head(None);
                Err(error)
            }
        }
    }

    /// Run an arbitrary operation under the same retry policy as a full
    /// transaction: unbounded for serialization failures and deadlocks,
    /// bounded for unique violations, and disabled entirely while any
    /// transaction is open on this connection.
    pub async fn run_with_retry<T, F>(self: &Rc<Self>, mut op: F) -> anyhow::Result<T>
    where
        T: 'static,
        F: FnMut() -> LocalBoxFuture<'static, anyhow::Result<T>>,
    {
        let mut retry = RetryState::new();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => match retry.next(error, self.depth.get(), &self.config) {
                    Step::Retry => continue,
                    Step::Fail(error) => return Err(error),
                },
            }
        }
    }

    /// Run a single statement with retry, so isolated lock conflicts
    /// outside any explicit transaction self-heal the same way full
    /// transactions do.
    pub async fn execute(self: &Rc<Self>, statement: &str) -> anyhow::Result<u64> {
        let ctx = Rc::clone(self);
        let statement = statement.to_owned();
        self.run_with_retry(move || {
            let ctx = Rc::clone(&ctx);
            let statement = statement.clone();
            Box::pin(async move {
                ctx.client
                    .execute(&statement)
                    .await
                    .map_err(anyhow::Error::from)
            })
        })
        .await
    }
}
