//! Core data structures shared by the store, the transaction log and the view projection

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use oxigraph::model::{GraphName, NamedNode, Term};

pub mod syntax;
pub mod vocab;

/// A single fact in the graph store.
///
/// Subject and predicate are always IRIs; the object may be any term. Identity is value equality
/// of all four parts.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Statement {
    pub graph: GraphName,
    pub subject: NamedNode,
    pub predicate: NamedNode,
    pub object: Term,
}

impl Statement {
    pub fn new(
        subject: NamedNode,
        predicate: NamedNode,
        object: impl Into<Term>,
        graph: impl Into<GraphName>,
    ) -> Self {
        Self { graph: graph.into(), subject, predicate, object: object.into() }
    }

    /// Statement in the default graph
    pub fn in_default_graph(subject: NamedNode, predicate: NamedNode, object: impl Into<Term>) -> Self {
        Self::new(subject, predicate, object, GraphName::DefaultGraph)
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&syntax::format_statement(self))
    }
}

/// Kind of statement mutation observed inside a write transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Add,
    Delete,
}

/// Identity and commit message of the caller that submitted a write.
///
/// Captured when the write is submitted and carried with the task to the worker thread.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallerContext {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub commit_message: Option<String>,
}

impl CallerContext {
    pub fn new(user_id: &str, user_name: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            user_name: Some(user_name.to_string()),
            commit_message: None,
        }
    }

    /// Context used for writes issued by the system itself
    pub fn system() -> Self {
        Self::default()
    }

    pub fn with_commit_message(mut self, message: &str) -> Self {
        self.commit_message = Some(message.to_string());
        self
    }
}

/// Metadata attached to a transaction record when the write transaction starts
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordMetadata {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub commit_message: Option<String>,
    /// milliseconds since epoch
    pub timestamp: u64,
}

/// Current wall-clock time in milliseconds since epoch
pub fn current_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
