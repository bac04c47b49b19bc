//! Graph store abstraction.
//!
//! The store is single-writer and multi-reader. Transactions are bound to the thread that began
//! them. Every mutation made inside a write transaction is reported synchronously to the
//! registered [`ChangeListener`]s; listeners also take part in commit and abort.

use std::sync::Arc;

use oxigraph::model::{GraphName, NamedNode, Term};

use crate::core::{Action, Statement};
use crate::error::Result;

pub mod memory;

pub use memory::MemoryGraphStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnMode {
    Read,
    Write,
}

/// Storage partition a store instance serves
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Partition {
    #[default]
    Primary,
    /// Auxiliary partition; not projected into the views
    Secondary,
}

/// Statement pattern for [`GraphStore::find`]; `None` matches anything
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pattern {
    pub subject: Option<NamedNode>,
    pub predicate: Option<NamedNode>,
    pub object: Option<Term>,
    pub graph: Option<GraphName>,
}

impl Pattern {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn subject(mut self, subject: &NamedNode) -> Self {
        self.subject = Some(subject.clone());
        self
    }

    pub fn predicate(mut self, predicate: &NamedNode) -> Self {
        self.predicate = Some(predicate.clone());
        self
    }

    pub fn object(mut self, object: impl Into<Term>) -> Self {
        self.object = Some(object.into());
        self
    }

    pub fn graph(mut self, graph: impl Into<GraphName>) -> Self {
        self.graph = Some(graph.into());
        self
    }

    pub fn matches(&self, statement: &Statement) -> bool {
        self.subject.as_ref().map_or(true, |s| *s == statement.subject)
            && self.predicate.as_ref().map_or(true, |p| *p == statement.predicate)
            && self.object.as_ref().map_or(true, |o| *o == statement.object)
            && self.graph.as_ref().map_or(true, |g| *g == statement.graph)
    }
}

/// Observer of write transactions.
///
/// All callbacks run on the thread holding the write transaction. `before_commit` receives the
/// store so the listener can read the in-transaction state; an error aborts the commit.
pub trait ChangeListener: Send + Sync {
    fn on_begin(&self, _partition: Partition) {}

    fn on_change(&self, action: Action, statement: &Statement);

    fn before_commit(&self, _store: &dyn GraphStore) -> Result<()> {
        Ok(())
    }

    fn on_abort(&self) {}
}

pub trait GraphStore: Send + Sync {
    /// Start a transaction on the current thread. A write transaction waits for the previous
    /// writer to finish.
    fn begin(&self, mode: TxnMode) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn abort(&self) -> Result<()>;

    /// Whether the current thread holds a transaction
    fn is_in_transaction(&self) -> bool;

    /// Mode of the current thread's transaction
    fn transaction_mode(&self) -> Option<TxnMode>;

    fn partition(&self) -> Partition;

    /// Add a statement; `false` when it was already present
    fn add(&self, statement: &Statement) -> Result<bool>;

    /// Remove a statement; `false` when it was absent
    fn remove(&self, statement: &Statement) -> Result<bool>;

    fn find(&self, pattern: &Pattern) -> Result<Vec<Statement>>;

    fn contains(&self, statement: &Statement) -> Result<bool> {
        let pattern = Pattern {
            subject: Some(statement.subject.clone()),
            predicate: Some(statement.predicate.clone()),
            object: Some(statement.object.clone()),
            graph: Some(statement.graph.clone()),
        };
        Ok(!self.find(&pattern)?.is_empty())
    }

    /// Distinct subjects having `predicate` with `object`
    fn subjects_with(&self, predicate: &NamedNode, object: &Term) -> Result<Vec<NamedNode>> {
        let mut subjects = Vec::new();
        for statement in self.find(&Pattern::any().predicate(predicate).object(object.clone()))? {
            if !subjects.contains(&statement.subject) {
                subjects.push(statement.subject);
            }
        }
        Ok(subjects)
    }

    fn register_listener(&self, listener: Arc<dyn ChangeListener>);
}
