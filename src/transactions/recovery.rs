//! Rebuilding a graph store from the transaction log.

use std::time::Instant;

use log::{error, info};

use crate::core::{RecordMetadata, Statement};
use crate::error::{Error, Result};
use crate::store::{GraphStore, Pattern, TxnMode};
use crate::transactions::log::LocalTransactionLog;
use crate::transactions::record::RecordListener;

const PROGRESS_INTERVAL: u64 = 1000;

/// Applies each replayed record as one write transaction
struct StoreReplayer<'a> {
    store: &'a dyn GraphStore,
}

impl RecordListener for StoreReplayer<'_> {
    fn on_begin(&mut self, _metadata: &RecordMetadata) -> Result<()> {
        self.store.begin(TxnMode::Write)
    }

    fn on_delete(&mut self, statement: &Statement) -> Result<()> {
        self.store.remove(statement).map(|_| ())
    }

    fn on_add(&mut self, statement: &Statement) -> Result<()> {
        self.store.add(statement).map(|_| ())
    }

    fn on_commit(&mut self) -> Result<()> {
        self.store.commit()
    }
}

/// Replay the whole log into an empty store. Returns the number of records applied; a store that
/// already holds data is left untouched.
pub fn restore(log: &LocalTransactionLog, store: &dyn GraphStore) -> Result<u64> {
    let size = log.size();
    if size == 0 {
        return Ok(0);
    }
    if !store.find(&Pattern::any())?.is_empty() {
        info!("Store is not empty, skipping restore from the transaction log");
        return Ok(0);
    }

    info!("Restoring {} transactions from {}", size, log.directory().display());
    let start = Instant::now();
    let mut replayer = StoreReplayer { store };
    for index in 0..size {
        if let Err(err) = log.read(index, &mut replayer) {
            if store.is_in_transaction() {
                let _ = store.abort();
            }
            error!("Failed to restore transaction {}: {}", index, err);
            return Err(Error::Recovery { index, source: Box::new(err) });
        }
        if (index + 1) % PROGRESS_INTERVAL == 0 {
            info!("Restored {} of {} transactions", index + 1, size);
        }
    }
    info!("Restored {} transactions in {}ms", size, start.elapsed().as_millis());
    Ok(size)
}
