use std::collections::HashSet;

use crate::core::{Action, RecordMetadata, Statement};
use crate::error::Result;

/// Fold one change into a net delta: an add cancels a pending delete of the same statement and
/// vice versa, so no statement ends up in both sets.
pub fn apply_change(
    added: &mut HashSet<Statement>,
    deleted: &mut HashSet<Statement>,
    action: Action,
    statement: &Statement,
) {
    let (target, opposite) = match action {
        Action::Add => (added, deleted),
        Action::Delete => (deleted, added),
    };
    if !opposite.remove(statement) {
        target.insert(statement.clone());
    }
}

/// One committed write transaction: who made it, when, and the net statement delta.
///
/// A statement never appears in both `added` and `deleted`; an add cancels a pending delete of
/// the same statement and vice versa.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionRecord {
    pub start_timestamp: u64,
    pub commit_timestamp: u64,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub commit_message: Option<String>,
    pub added: HashSet<Statement>,
    pub deleted: HashSet<Statement>,
}

impl TransactionRecord {
    pub fn new(metadata: &RecordMetadata) -> Self {
        Self {
            start_timestamp: metadata.timestamp,
            user_id: metadata.user_id.clone(),
            user_name: metadata.user_name.clone(),
            commit_message: metadata.commit_message.clone(),
            ..Self::default()
        }
    }

    pub fn on_add(&mut self, statement: &Statement) {
        apply_change(&mut self.added, &mut self.deleted, Action::Add, statement);
    }

    pub fn on_delete(&mut self, statement: &Statement) {
        apply_change(&mut self.added, &mut self.deleted, Action::Delete, statement);
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }

    /// Metadata as seen by a replaying listener; the timestamp is the commit time
    pub fn metadata(&self) -> RecordMetadata {
        RecordMetadata {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            commit_message: self.commit_message.clone(),
            timestamp: self.commit_timestamp,
        }
    }

    /// Append a commit message, skipping one that is already part of the record's message
    pub fn append_commit_message(&mut self, message: &str) {
        match &mut self.commit_message {
            Some(existing) if existing.split("; ").any(|m| m == message) => {}
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(message);
            }
            None => self.commit_message = Some(message.to_string()),
        }
    }

    /// Deleted statements in a stable order
    pub fn sorted_deleted(&self) -> Vec<&Statement> {
        sorted(&self.deleted)
    }

    /// Added statements in a stable order
    pub fn sorted_added(&self) -> Vec<&Statement> {
        sorted(&self.added)
    }

    /// Feed the record to a listener: metadata, then deletes, then adds
    pub fn replay(&self, listener: &mut dyn RecordListener) -> Result<()> {
        listener.on_begin(&self.metadata())?;
        for statement in self.sorted_deleted() {
            listener.on_delete(statement)?;
        }
        for statement in self.sorted_added() {
            listener.on_add(statement)?;
        }
        listener.on_commit()
    }
}

fn sorted(statements: &HashSet<Statement>) -> Vec<&Statement> {
    let mut keyed: Vec<(String, &Statement)> =
        statements.iter().map(|s| (s.to_string(), s)).collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.into_iter().map(|(_, s)| s).collect()
}

/// Receives a transaction record read back from the log
pub trait RecordListener {
    fn on_begin(&mut self, metadata: &RecordMetadata) -> Result<()>;
    fn on_delete(&mut self, statement: &Statement) -> Result<()>;
    fn on_add(&mut self, statement: &Statement) -> Result<()>;
    fn on_commit(&mut self) -> Result<()>;
}

/// Listener that simply collects what it is given
#[derive(Debug, Default)]
pub struct CollectingListener {
    pub metadata: Option<RecordMetadata>,
    pub deleted: Vec<Statement>,
    pub added: Vec<Statement>,
    pub committed: bool,
}

impl RecordListener for CollectingListener {
    fn on_begin(&mut self, metadata: &RecordMetadata) -> Result<()> {
        self.metadata = Some(metadata.clone());
        Ok(())
    }

    fn on_delete(&mut self, statement: &Statement) -> Result<()> {
        self.deleted.push(statement.clone());
        Ok(())
    }

    fn on_add(&mut self, statement: &Statement) -> Result<()> {
        self.added.push(statement.clone());
        Ok(())
    }

    fn on_commit(&mut self) -> Result<()> {
        self.committed = true;
        Ok(())
    }
}
