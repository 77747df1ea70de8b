//! Deferred-callback chains.
//!
//! Every transaction scope owns one [`ChainLink`]: an insertion-ordered
//! batch of on-complete callbacks plus a back-reference to the link that
//! was active when the scope began. Nested scopes therefore stack into a
//! singly linked chain; the link with no `previous` is the only one
//! allowed to drain, and it drains the whole chain newest link first.
//!
//! The chain looks like this after `c1` nests `c2` nests `c3`:
//!
//! ```text
//! ctx.head ──► link(c3) ──previous──► link(c2) ──previous──► link(c1) ──► None
//! ```
//!
//! Only `link(c1)` may drain, and the walk starts at `ctx.head`, so
//! `c3`'s callbacks run first and `c1`'s last.
//!
//! Two rules keep re-entrancy sound:
//!
//! - a link is `locked` while its callbacks run, and a transaction begun
//!   while the head is locked starts its own independent chain instead
//!   of appending to one that is mid-drain;
//! - callbacks are executed by live index, not from a snapshot, so a
//!   callback that registers another callback on its own link still gets
//!   that late registration executed in the same pass.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::context::ConnectionContext;

/// A boxed on-complete callback.
///
/// Receives a fresh [`LinkHandle`] for the link it was registered on, so
/// it can register further callbacks on that link or open new
/// transactions through [`LinkHandle::context`].
pub type Callback = Box<dyn FnOnce(LinkHandle) -> LocalBoxFuture<'static, anyhow::Result<()>>>;

/// One transaction scope's batch of deferred callbacks.
pub struct ChainLink {
    /// The link that was active when this one was created. Immutable for
    /// the life of the link; `None` marks the outermost link of a chain.
    previous: Option<Rc<ChainLink>>,
    /// Executed slots are taken, never removed, so indices stay stable
    /// while a drain pass and late registrations interleave.
    callbacks: RefCell<Vec<Option<Callback>>>,
    /// True only while this link's callbacks are being drained.
    locked: Cell<bool>,
}

impl ChainLink {
    /// Create the link for a scope that is beginning and install it as
    /// the connection's current head.
    ///
    /// A head that is locked is mid-drain; continuing its chain would let
    /// a transaction opened from inside a callback re-enter a drain that
    /// is already running, so such a scope starts a chain of its own.
    pub(crate) fn begin(ctx: &Rc<ConnectionContext>) -> Rc<ChainLink> {
        let previous = ctx.chain_head().filter(|head| !head.locked.get());
        let link = Rc::new(ChainLink {
            previous,
            callbacks: RefCell::new(Vec::new()),
            locked: Cell::new(false),
        });
        ctx.set_chain_head(Some(Rc::clone(&link)));
        link
    }

    pub(crate) fn push(&self, callback: Callback) {
        self.callbacks.borrow_mut().push(Some(callback));
    }

    /// Whether this link heads its chain and may therefore drain it.
    pub(crate) fn is_outermost(&self) -> bool {
        self.previous.is_none()
    }
}

/// Handle to the chain link of the innermost enclosing transaction
/// scope. Passed to transaction bodies and to every callback as it runs.
#[derive(Clone)]
pub struct LinkHandle {
    ctx: Rc<ConnectionContext>,
    link: Rc<ChainLink>,
}

impl LinkHandle {
    pub(crate) fn new(ctx: Rc<ConnectionContext>, link: Rc<ChainLink>) -> Self {
        Self { ctx, link }
    }

    /// Register a callback to run once the outermost enclosing
    /// transaction settles.
    ///
    /// May be called repeatedly; callbacks on one link run in insertion
    /// order. Registering from inside a callback currently draining on
    /// this same link is fine — the new callback runs in the same pass.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(LinkHandle) -> LocalBoxFuture<'static, anyhow::Result<()>> + 'static,
    {
        self.link.push(Box::new(callback));
    }

    /// The connection this scope runs on, e.g. to open a nested
    /// transaction.
    pub fn context(&self) -> &Rc<ConnectionContext> {
        &self.ctx
    }

    /// Run a statement through the connection's retry wrapper.
    ///
    /// Inside a transaction the open-depth gate makes this equivalent to
    /// a plain `execute`; from a draining callback of an outermost scope
    /// it retries like any standalone statement.
    pub async fn execute(&self, statement: &str) -> anyhow::Result<u64> {
        self.ctx.execute(statement).await
    }
}

/// Drain the chain headed by `link`, executing every pending callback.
///
/// Returns `Ok(false)` without side effects when `link` is not the
/// outermost link of its chain — only the outermost scope drains. The
/// walk starts from the connection's current head, which may sit deeper
/// than `link` when further nested scopes were opened after `link` was
/// created.
///
/// Whatever happens, the connection's head is cleared exactly once
/// before returning; a callback error is re-raised after that cleanup.
pub(crate) async fn drain_chain(
    ctx: &Rc<ConnectionContext>,
    link: &Rc<ChainLink>,
) -> anyhow::Result<bool> {
    if !link.is_outermost() {
        return Ok(false);
    }
    let walk = walk_chain(ctx).await;
    ctx.set_chain_head(None);
    walk.map(|()| true)
}

async fn walk_chain(ctx: &Rc<ConnectionContext>) -> anyhow::Result<()> {
    let mut current = ctx.chain_head();
    while let Some(link) = current {
        link.locked.set(true);
        run_callbacks(ctx, &link).await?;
        current = link.previous.clone();
    }
    Ok(())
}

/// Execute one link's callbacks in insertion order, by live index.
async fn run_callbacks(ctx: &Rc<ConnectionContext>, link: &Rc<ChainLink>) -> anyhow::Result<()> {
    let mut index = 0;
    loop {
        let callback = {
            let mut callbacks = link.callbacks.borrow_mut();
            if index >= callbacks.len() {
                break;
            }
            callbacks[index].take()
        };
        index += 1;
        if let Some(callback) = callback {
            callback(LinkHandle::new(Rc::clone(ctx), Rc::clone(link))).await?;
        }
    }
    Ok(())
}
