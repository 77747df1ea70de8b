//! Testing utilities for the trellis coordination layer.
//!
//! [`ScriptedClient`] is an in-memory [`DatabaseClient`] that records
//! every operation and fails on cue. Clones share state, so tests keep a
//! handle for scripting and assertions while the coordinator owns
//! another:
//!
//! ```ignore
//! let client = ScriptedClient::new();
//! let ctx = Rc::new(ConnectionContext::new(client.clone()));
//!
//! client.fail_next_execute(conflict(ErrorKind::Deadlock));
//! ctx.run_transaction(|scope| { ... }).await?;
//! assert_eq!(client.begins(), 2); // one conflict, one retry
//! ```

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use async_trait::async_trait;
use trellis::{DatabaseClient, DbError, ErrorKind};

/// A database operation observed by [`ScriptedClient`], in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Begin,
    Commit,
    Rollback,
    Execute(String),
}

#[derive(Default)]
struct State {
    log: RefCell<Vec<Op>>,
    begin_faults: RefCell<VecDeque<DbError>>,
    commit_faults: RefCell<VecDeque<DbError>>,
    rollback_faults: RefCell<VecDeque<DbError>>,
    execute_faults: RefCell<VecDeque<DbError>>,
}

/// Scripted in-memory database client.
///
/// Each operation is appended to the log *before* any scripted fault is
/// raised, so attempt counts include failed calls.
#[derive(Clone, Default)]
pub struct ScriptedClient {
    state: Rc<State>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `begin` call with `error`. Queued faults are
    /// consumed FIFO, one per call.
    pub fn fail_next_begin(&self, error: DbError) {
        self.state.begin_faults.borrow_mut().push_back(error);
    }

    pub fn fail_next_commit(&self, error: DbError) {
        self.state.commit_faults.borrow_mut().push_back(error);
    }

    pub fn fail_next_rollback(&self, error: DbError) {
        self.state.rollback_faults.borrow_mut().push_back(error);
    }

    pub fn fail_next_execute(&self, error: DbError) {
        self.state.execute_faults.borrow_mut().push_back(error);
    }

    /// Queue `count` execute faults of the same kind.
    pub fn fail_next_executes(&self, kind: ErrorKind, count: usize) {
        for _ in 0..count {
            self.fail_next_execute(conflict(kind));
        }
    }

    /// Every operation seen so far, in order.
    pub fn ops(&self) -> Vec<Op> {
        self.state.log.borrow().clone()
    }

    pub fn begins(&self) -> usize {
        self.count(|op| matches!(op, Op::Begin))
    }

    pub fn commits(&self) -> usize {
        self.count(|op| matches!(op, Op::Commit))
    }

    pub fn rollbacks(&self) -> usize {
        self.count(|op| matches!(op, Op::Rollback))
    }

    pub fn executes(&self) -> usize {
        self.count(|op| matches!(op, Op::Execute(_)))
    }

    fn count(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.state.log.borrow().iter().filter(|op| pred(op)).count()
    }

    fn observe(&self, op: Op, faults: &RefCell<VecDeque<DbError>>) -> Result<(), DbError> {
        self.state.log.borrow_mut().push(op);
        match faults.borrow_mut().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait(?Send)]
impl DatabaseClient for ScriptedClient {
    async fn begin(&self) -> Result<(), DbError> {
        self.observe(Op::Begin, &self.state.begin_faults)
    }

    async fn commit(&self) -> Result<(), DbError> {
        self.observe(Op::Commit, &self.state.commit_faults)
    }

    async fn rollback(&self) -> Result<(), DbError> {
        self.observe(Op::Rollback, &self.state.rollback_faults)
    }

    async fn execute(&self, statement: &str) -> Result<u64, DbError> {
        self.observe(
            Op::Execute(statement.to_owned()),
            &self.state.execute_faults,
        )
        .map(|()| 1)
    }
}

/// A [`DbError`] of the given kind with a driver-flavored message.
pub fn conflict(kind: ErrorKind) -> DbError {
    let message = match kind {
        ErrorKind::SerializationFailure => {
            "could not serialize access due to concurrent update"
        }
        ErrorKind::Deadlock => "deadlock detected",
        ErrorKind::UniqueViolation => "duplicate key value violates unique constraint",
        ErrorKind::Other => "connection reset by peer",
    };
    DbError::new(kind, message)
}
