//! The view projection as a commit-time [`Projection`].

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use log::{debug, error, info};
use oxigraph::model::NamedNode;

use crate::error::{Error, Result};
use crate::store::GraphStore;
use crate::transactions::{Projection, TrackedChanges};
use crate::views::accessor::AccessorTable;
use crate::views::client::ViewStoreClient;
use crate::views::definition::ViewsConfig;
use crate::views::materialized::MaterializedViews;
use crate::views::updater::ViewUpdater;

/// Keeps the view tables in line with the graph.
///
/// Every commit updates the rows of the touched entities in one SQL transaction, with a savepoint
/// per entity: an entity that fails is rolled back and logged, the others are kept. The
/// materialized views of the touched views are refreshed afterwards.
pub struct ViewProjection {
    client: Mutex<ViewStoreClient>,
    config: ViewsConfig,
    accessors: AccessorTable,
    materialized: MaterializedViews,
    resource_root: String,
}

impl ViewProjection {
    pub fn open(
        path: impl AsRef<Path>,
        config: ViewsConfig,
        max_join_items: usize,
        resource_root: &str,
    ) -> Result<Self> {
        let client = ViewStoreClient::open(path, &config)?;
        let accessors = AccessorTable::build(&config);
        let materialized = MaterializedViews::build(&config, client.model(), max_join_items);
        materialized.ensure(client.connection())?;
        Ok(Self {
            client: Mutex::new(client),
            config,
            accessors,
            materialized,
            resource_root: resource_root.to_string(),
        })
    }

    pub fn config(&self) -> &ViewsConfig {
        &self.config
    }

    pub fn materialized(&self) -> &MaterializedViews {
        &self.materialized
    }

    fn client(&self) -> Result<MutexGuard<'_, ViewStoreClient>> {
        self.client.lock().map_err(|_| Error::Store("View store client lock poisoned".into()))
    }

    /// Update the rows of `subjects`; returns the (lowercase) names of the views touched
    pub fn update_subjects<'a>(
        &self,
        store: &dyn GraphStore,
        subjects: impl IntoIterator<Item = &'a NamedNode>,
    ) -> Result<BTreeSet<String>> {
        let client = self.client()?;
        let updater = ViewUpdater::new(store, &client, &self.config, &self.accessors, &self.resource_root);
        let mut subjects: Vec<&NamedNode> = subjects.into_iter().collect();
        subjects.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        let mut touched = BTreeSet::new();
        let mut tx = client.connection().unchecked_transaction()?;
        for subject in subjects {
            let mut savepoint = tx.savepoint()?;
            match updater.update_subject(subject) {
                Ok(views) => {
                    savepoint.commit()?;
                    touched.extend(views.iter().map(|v| v.to_lowercase()));
                }
                Err(err) => {
                    savepoint.rollback()?;
                    error!("Error updating the views for {}: {}", subject.as_str(), err);
                }
            }
        }
        tx.commit()?;
        self.materialized.refresh(client.connection(), &touched)?;
        Ok(touched)
    }

    /// Rebuild one view from the graph
    pub fn recreate_view(&self, store: &dyn GraphStore, view: &str) -> Result<usize> {
        let definition = self
            .config
            .view(view)
            .ok_or_else(|| Error::InvalidRequest(format!("View not supported: {}", view)))?;
        let client = self.client()?;
        let updater = ViewUpdater::new(store, &client, &self.config, &self.accessors, &self.resource_root);
        let tx = client.connection().unchecked_transaction()?;
        let count = updater.recreate_index_for_view(definition)?;
        tx.commit()?;
        self.materialized.refresh(client.connection(), &BTreeSet::from([definition.table_name()]))?;
        Ok(count)
    }

    /// Rebuild every view from the graph
    pub fn recreate_all(&self, store: &dyn GraphStore) -> Result<usize> {
        let start = Instant::now();
        let client = self.client()?;
        let updater = ViewUpdater::new(store, &client, &self.config, &self.accessors, &self.resource_root);
        let tx = client.connection().unchecked_transaction()?;
        // join tables can be shared by two views, so all tables are emptied before any insert
        for view in &self.config.views {
            client.truncate_view_tables(&view.name)?;
        }
        let mut total = 0;
        for view in &self.config.views {
            total += updater.insert_view(view)?;
        }
        tx.commit()?;
        self.materialized.refresh_all(client.connection())?;
        info!("Recreated {} views with {} rows in {}ms", self.config.views.len(), total, start.elapsed().as_millis());
        Ok(total)
    }
}

impl Projection for ViewProjection {
    fn update(&self, store: &dyn GraphStore, changes: &TrackedChanges) -> Result<()> {
        let start = Instant::now();
        let subjects = changes.subjects();
        let touched = self.update_subjects(store, subjects.iter())?;
        debug!(
            "Updated {} entities in views {:?} in {}ms",
            subjects.len(),
            touched,
            start.elapsed().as_millis()
        );
        Ok(())
    }
}
