//! Commit-time fan-out of a write transaction to the transaction log, the change tracker and
//! the view projection.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, error};

use crate::core::{current_millis, Action, CallerContext, RecordMetadata, Statement};
use crate::error::Result;
use crate::store::{ChangeListener, GraphStore, Partition};
use crate::transactions::fatal::{critical, ProcessTerminator, Terminator};
use crate::transactions::log::LocalTransactionLog;
use crate::transactions::tracker::{ChangeTracker, TrackedChanges, TrackingMode};

/// Secondary projection fed with the changes of each write transaction before it commits
pub trait Projection: Send + Sync {
    fn update(&self, store: &dyn GraphStore, changes: &TrackedChanges) -> Result<()>;
}

/// Listener registered on the graph store.
///
/// Changes only reach the tracker. On commit the pipeline takes the tracked changes, updates the
/// projection (failures are logged and do not block the commit) and writes the same delta as the
/// log record. A log failure terminates the process.
pub struct CommitPipeline {
    log: Option<Arc<LocalTransactionLog>>,
    tracker: Option<ChangeTracker>,
    projection: Option<Arc<dyn Projection>>,
    terminator: Arc<dyn Terminator>,
}

impl Default for CommitPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitPipeline {
    pub fn new() -> Self {
        Self { log: None, tracker: None, projection: None, terminator: Arc::new(ProcessTerminator) }
    }

    /// Add a transaction log; the record needs the exact delta, so the tracker switches to
    /// full-delta mode
    pub fn with_log(mut self, log: Arc<LocalTransactionLog>) -> Self {
        self.tracker = Some(ChangeTracker::new(TrackingMode::FullDelta));
        self.log = Some(log);
        self
    }

    /// Add a projection; tracks touched entities unless a tracker was configured already
    pub fn with_projection(mut self, projection: Arc<dyn Projection>) -> Self {
        if self.tracker.is_none() {
            self.tracker = Some(ChangeTracker::new(TrackingMode::TouchedEntities));
        }
        self.projection = Some(projection);
        self
    }

    pub fn with_terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = terminator;
        self
    }

    pub fn log(&self) -> Option<&Arc<LocalTransactionLog>> {
        self.log.as_ref()
    }

    pub fn terminator(&self) -> Arc<dyn Terminator> {
        Arc::clone(&self.terminator)
    }

    /// Identify the caller whose work runs next in the current transaction
    pub fn on_metadata(&self, context: &CallerContext) {
        if let Some(log) = &self.log {
            critical(self.terminator.as_ref(), log.on_metadata(context));
        }
    }
}

impl ChangeListener for CommitPipeline {
    fn on_begin(&self, partition: Partition) {
        if let Some(log) = &self.log {
            let metadata = RecordMetadata { timestamp: current_millis(), ..RecordMetadata::default() };
            critical(self.terminator.as_ref(), log.on_begin(&metadata));
        }
        if let Some(tracker) = &self.tracker {
            tracker.begin(partition);
        }
    }

    fn on_change(&self, action: Action, statement: &Statement) {
        if let Some(tracker) = &self.tracker {
            tracker.on_change(action, statement);
        }
    }

    fn before_commit(&self, store: &dyn GraphStore) -> Result<()> {
        let changes = match &self.tracker {
            Some(tracker) => tracker.take(),
            None => TrackedChanges::Touched(Default::default()),
        };
        if let Some(projection) = &self.projection {
            if !changes.is_empty() && store.partition() == Partition::Primary {
                let start = Instant::now();
                if let Err(err) = projection.update(store, &changes) {
                    error!("Failed to update the views: {}", err);
                }
                debug!("Projection update took {}ms", start.elapsed().as_millis());
            }
        }
        if let Some(log) = &self.log {
            if let TrackedChanges::Delta { added, removed } = &changes {
                for statement in removed {
                    critical(self.terminator.as_ref(), log.on_delete(statement));
                }
                for statement in added {
                    critical(self.terminator.as_ref(), log.on_add(statement));
                }
            }
            critical(self.terminator.as_ref(), log.on_commit());
        }
        Ok(())
    }

    fn on_abort(&self) {
        if let Some(log) = &self.log {
            log.on_abort();
        }
        if let Some(tracker) = &self.tracker {
            tracker.discard();
        }
    }
}
