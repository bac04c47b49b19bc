//! In-memory graph store with snapshot reads and a single writer.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::{self, ThreadId};

use oxigraph::model::NamedNode;

use crate::core::{Action, Statement};
use crate::error::{Error, Result};
use crate::store::{ChangeListener, GraphStore, Partition, Pattern, TxnMode};

#[derive(Clone, Debug, Default)]
struct Dataset {
    statements: HashSet<Statement>,
    by_subject: HashMap<NamedNode, HashSet<Statement>>,
}

impl Dataset {
    fn insert(&mut self, statement: Statement) {
        self.by_subject.entry(statement.subject.clone()).or_default().insert(statement.clone());
        self.statements.insert(statement);
    }

    fn delete(&mut self, statement: &Statement) {
        if let Some(statements) = self.by_subject.get_mut(&statement.subject) {
            statements.remove(statement);
            if statements.is_empty() {
                self.by_subject.remove(&statement.subject);
            }
        }
        self.statements.remove(statement);
    }

    fn find<'a>(&'a self, pattern: &'a Pattern) -> Box<dyn Iterator<Item = &'a Statement> + 'a> {
        match &pattern.subject {
            Some(subject) => match self.by_subject.get(subject) {
                Some(statements) => Box::new(statements.iter().filter(move |s| pattern.matches(s))),
                None => Box::new(std::iter::empty()),
            },
            None => Box::new(self.statements.iter().filter(move |s| pattern.matches(s))),
        }
    }
}

/// Transaction state of one thread
struct ActiveTxn {
    mode: TxnMode,
    base: Arc<Dataset>,
    added: HashSet<Statement>,
    removed: HashSet<Statement>,
}

impl ActiveTxn {
    fn contains(&self, statement: &Statement) -> bool {
        self.added.contains(statement)
            || (self.base.statements.contains(statement) && !self.removed.contains(statement))
    }
}

/// Snapshot-isolated, single-writer in-memory [`GraphStore`].
///
/// Readers see the dataset as of their `begin` (or the latest committed state outside a
/// transaction). A write transaction keeps its changes as an overlay on its base snapshot and
/// publishes a new snapshot on commit.
pub struct MemoryGraphStore {
    current: RwLock<Arc<Dataset>>,
    txns: Mutex<HashMap<ThreadId, ActiveTxn>>,
    writer: Mutex<Option<ThreadId>>,
    writer_released: Condvar,
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
    partition: Partition,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::with_partition(Partition::Primary)
    }

    pub fn with_partition(partition: Partition) -> Self {
        Self {
            current: RwLock::new(Arc::new(Dataset::default())),
            txns: Mutex::new(HashMap::new()),
            writer: Mutex::new(None),
            writer_released: Condvar::new(),
            listeners: RwLock::new(Vec::new()),
            partition,
        }
    }

    /// Number of committed statements
    pub fn len(&self) -> usize {
        self.snapshot().statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<Dataset> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn txns(&self) -> Result<MutexGuard<'_, HashMap<ThreadId, ActiveTxn>>> {
        self.txns.lock().map_err(|_| Error::Store("transaction table poisoned".into()))
    }

    fn listeners(&self) -> Vec<Arc<dyn ChangeListener>> {
        self.listeners.read().map(|listeners| listeners.iter().cloned().collect()).unwrap_or_default()
    }

    fn acquire_writer(&self) -> Result<()> {
        let me = thread::current().id();
        let mut writer = self.writer.lock().map_err(|_| Error::Store("writer lock poisoned".into()))?;
        while writer.is_some() {
            writer = self
                .writer_released
                .wait(writer)
                .map_err(|_| Error::Store("writer lock poisoned".into()))?;
        }
        *writer = Some(me);
        Ok(())
    }

    fn release_writer(&self) {
        if let Ok(mut writer) = self.writer.lock() {
            *writer = None;
        }
        self.writer_released.notify_one();
    }

    /// Apply a mutation to the current thread's write transaction, then notify the listeners
    fn mutate(&self, action: Action, statement: &Statement) -> Result<bool> {
        let changed = {
            let mut txns = self.txns()?;
            let txn = match txns.get_mut(&thread::current().id()) {
                Some(txn) if txn.mode == TxnMode::Write => txn,
                _ => return Err(Error::Store("Not in a write transaction".into())),
            };
            let present = txn.contains(statement);
            match action {
                Action::Add if !present => {
                    if !txn.removed.remove(statement) {
                        txn.added.insert(statement.clone());
                    }
                    true
                }
                Action::Delete if present => {
                    if !txn.added.remove(statement) {
                        txn.removed.insert(statement.clone());
                    }
                    true
                }
                _ => false,
            }
        };
        if changed {
            for listener in self.listeners() {
                listener.on_change(action, statement);
            }
        }
        Ok(changed)
    }

    fn discard_write(&self) {
        for listener in self.listeners() {
            listener.on_abort();
        }
        self.release_writer();
    }
}

impl Default for MemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphStore for MemoryGraphStore {
    fn begin(&self, mode: TxnMode) -> Result<()> {
        let me = thread::current().id();
        if self.txns()?.contains_key(&me) {
            return Err(Error::Store("Transaction already active on this thread".into()));
        }
        if mode == TxnMode::Write {
            self.acquire_writer()?;
        }
        let txn = ActiveTxn {
            mode,
            base: self.snapshot(),
            added: HashSet::new(),
            removed: HashSet::new(),
        };
        self.txns()?.insert(me, txn);
        if mode == TxnMode::Write {
            for listener in self.listeners() {
                listener.on_begin(self.partition);
            }
        }
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let me = thread::current().id();
        match self.transaction_mode() {
            None => return Err(Error::Store("No active transaction".into())),
            Some(TxnMode::Read) => {
                self.txns()?.remove(&me);
                return Ok(());
            }
            Some(TxnMode::Write) => {}
        }

        for listener in self.listeners() {
            if let Err(err) = listener.before_commit(self) {
                self.txns()?.remove(&me);
                self.discard_write();
                return Err(err);
            }
        }

        let txn = self.txns()?.remove(&me);
        if let Some(txn) = txn {
            if !txn.added.is_empty() || !txn.removed.is_empty() {
                let mut next = (*txn.base).clone();
                for statement in &txn.removed {
                    next.delete(statement);
                }
                for statement in txn.added {
                    next.insert(statement);
                }
                match self.current.write() {
                    Ok(mut current) => *current = Arc::new(next),
                    Err(poisoned) => *poisoned.into_inner() = Arc::new(next),
                }
            }
        }
        self.release_writer();
        Ok(())
    }

    fn abort(&self) -> Result<()> {
        let txn = self.txns()?.remove(&thread::current().id());
        match txn {
            Some(txn) if txn.mode == TxnMode::Write => {
                self.discard_write();
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(Error::Store("No active transaction".into())),
        }
    }

    fn is_in_transaction(&self) -> bool {
        self.transaction_mode().is_some()
    }

    fn transaction_mode(&self) -> Option<TxnMode> {
        self.txns.lock().ok()?.get(&thread::current().id()).map(|txn| txn.mode)
    }

    fn partition(&self) -> Partition {
        self.partition
    }

    fn add(&self, statement: &Statement) -> Result<bool> {
        self.mutate(Action::Add, statement)
    }

    fn remove(&self, statement: &Statement) -> Result<bool> {
        self.mutate(Action::Delete, statement)
    }

    fn find(&self, pattern: &Pattern) -> Result<Vec<Statement>> {
        let txns = self.txns()?;
        match txns.get(&thread::current().id()) {
            Some(txn) => {
                let mut found: Vec<Statement> = txn
                    .base
                    .find(pattern)
                    .filter(|s| !txn.removed.contains(*s))
                    .cloned()
                    .collect();
                found.extend(txn.added.iter().filter(|s| pattern.matches(s)).cloned());
                Ok(found)
            }
            None => {
                drop(txns);
                let snapshot = self.snapshot();
                let found = snapshot.find(pattern).cloned().collect();
                Ok(found)
            }
        }
    }

    fn register_listener(&self, listener: Arc<dyn ChangeListener>) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxigraph::model::Literal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn statement(subject: &str, value: &str) -> Statement {
        Statement::in_default_graph(
            NamedNode::new(format!("http://example.org/{}", subject)).unwrap(),
            NamedNode::new("http://example.org/value").unwrap(),
            Literal::new_simple_literal(value),
        )
    }

    #[derive(Default)]
    struct Counting {
        changes: AtomicUsize,
        aborts: AtomicUsize,
    }

    impl ChangeListener for Counting {
        fn on_change(&self, _action: Action, _statement: &Statement) {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_abort(&self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_commit_publishes_snapshot() {
        let store = MemoryGraphStore::new();
        store.begin(TxnMode::Write).unwrap();
        assert!(store.add(&statement("a", "1")).unwrap());
        assert!(!store.add(&statement("a", "1")).unwrap());
        assert_eq!(store.len(), 0);
        store.commit().unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.contains(&statement("a", "1")).unwrap());
    }

    #[test]
    fn test_abort_discards_changes_and_notifies() {
        let store = MemoryGraphStore::new();
        let listener = Arc::new(Counting::default());
        store.register_listener(listener.clone());

        store.begin(TxnMode::Write).unwrap();
        store.add(&statement("a", "1")).unwrap();
        store.remove(&statement("a", "1")).unwrap();
        store.add(&statement("b", "2")).unwrap();
        store.abort().unwrap();

        assert!(store.is_empty());
        assert_eq!(listener.changes.load(Ordering::SeqCst), 3);
        assert_eq!(listener.aborts.load(Ordering::SeqCst), 1);
        assert!(!store.is_in_transaction());
    }

    #[test]
    fn test_read_transaction_keeps_its_snapshot() {
        let store = Arc::new(MemoryGraphStore::new());
        store.begin(TxnMode::Read).unwrap();

        let writer = Arc::clone(&store);
        thread::spawn(move || {
            writer.begin(TxnMode::Write).unwrap();
            writer.add(&statement("a", "1")).unwrap();
            writer.commit().unwrap();
        })
        .join()
        .unwrap();

        assert!(store.find(&Pattern::any()).unwrap().is_empty());
        assert!(store.add(&statement("b", "2")).is_err());
        store.commit().unwrap();
        assert_eq!(store.find(&Pattern::any()).unwrap().len(), 1);
    }

    #[test]
    fn test_find_by_subject_sees_overlay() {
        let store = MemoryGraphStore::new();
        store.begin(TxnMode::Write).unwrap();
        store.add(&statement("a", "1")).unwrap();
        store.add(&statement("a", "2")).unwrap();
        store.commit().unwrap();

        store.begin(TxnMode::Write).unwrap();
        store.remove(&statement("a", "1")).unwrap();
        store.add(&statement("a", "3")).unwrap();
        let subject = NamedNode::new("http://example.org/a").unwrap();
        let found = store.find(&Pattern::any().subject(&subject)).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.contains(&statement("a", "3")));
        assert!(!found.contains(&statement("a", "1")));
        store.commit().unwrap();
    }

    #[test]
    fn test_nested_begin_is_rejected() {
        let store = MemoryGraphStore::new();
        store.begin(TxnMode::Read).unwrap();
        assert!(store.begin(TxnMode::Write).is_err());
        assert_eq!(store.transaction_mode(), Some(TxnMode::Read));
        store.abort().unwrap();
    }
}
