//! Per-transaction record of what a write transaction touched.

use std::collections::HashSet;
use std::sync::Mutex;

use log::warn;
use oxigraph::model::NamedNode;

use crate::core::{Action, Statement};
use crate::store::Partition;
use crate::transactions::record::apply_change;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TrackingMode {
    /// Exact added and removed statements
    FullDelta,
    /// Only the subjects of mutated statements
    #[default]
    TouchedEntities,
}

/// Changes of one write transaction, handed out once at commit
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackedChanges {
    Delta { added: HashSet<Statement>, removed: HashSet<Statement> },
    Touched(HashSet<NamedNode>),
}

impl TrackedChanges {
    pub fn is_empty(&self) -> bool {
        match self {
            TrackedChanges::Delta { added, removed } => added.is_empty() && removed.is_empty(),
            TrackedChanges::Touched(subjects) => subjects.is_empty(),
        }
    }

    /// Distinct subjects of the changed statements
    pub fn subjects(&self) -> HashSet<NamedNode> {
        match self {
            TrackedChanges::Delta { added, removed } => {
                added.iter().chain(removed.iter()).map(|s| s.subject.clone()).collect()
            }
            TrackedChanges::Touched(subjects) => subjects.clone(),
        }
    }
}

#[derive(Default)]
struct TrackerState {
    active: bool,
    ignored: bool,
    added: HashSet<Statement>,
    removed: HashSet<Statement>,
    subjects: HashSet<NamedNode>,
}

pub struct ChangeTracker {
    mode: TrackingMode,
    state: Mutex<TrackerState>,
}

impl ChangeTracker {
    pub fn new(mode: TrackingMode) -> Self {
        Self { mode, state: Mutex::new(TrackerState::default()) }
    }

    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    /// Reset for a new write transaction. Secondary partitions are not tracked in
    /// touched-entity mode.
    pub fn begin(&self, partition: Partition) {
        if let Ok(mut state) = self.state.lock() {
            *state = TrackerState {
                active: true,
                ignored: self.mode == TrackingMode::TouchedEntities
                    && partition == Partition::Secondary,
                ..TrackerState::default()
            };
        }
    }

    pub fn on_change(&self, action: Action, statement: &Statement) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if !state.active {
            warn!("Change outside of a tracked transaction: {}", statement);
            return;
        }
        if state.ignored {
            return;
        }
        match self.mode {
            TrackingMode::TouchedEntities => {
                state.subjects.insert(statement.subject.clone());
            }
            TrackingMode::FullDelta => {
                let TrackerState { added, removed, .. } = &mut *state;
                apply_change(added, removed, action, statement);
            }
        }
    }

    /// Hand out the changes of the current transaction; the tracker is inactive afterwards
    pub fn take(&self) -> TrackedChanges {
        let state = match self.state.lock() {
            Ok(mut state) => std::mem::take(&mut *state),
            Err(_) => TrackerState::default(),
        };
        match self.mode {
            TrackingMode::FullDelta => {
                TrackedChanges::Delta { added: state.added, removed: state.removed }
            }
            TrackingMode::TouchedEntities => TrackedChanges::Touched(state.subjects),
        }
    }

    pub fn discard(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = TrackerState::default();
        }
    }
}
