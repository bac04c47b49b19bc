//! Derivation of view rows from the graph.

use std::collections::{BTreeSet, HashSet};
use std::time::Instant;

use log::{debug, info};
use oxigraph::model::{GraphName, NamedNode, Term};
use rusqlite::types::Value as SqlValue;

use crate::core::vocab;
use crate::error::{Error, Result};
use crate::store::{GraphStore, Pattern};
use crate::views::accessor::{term_text, AccessorKind, AccessorTable};
use crate::views::client::{RowValues, ViewStoreClient};
use crate::views::definition::{ColumnType, JoinView, ViewColumn, ViewDefinition, ViewsConfig};

const BATCH_SIZE: usize = 1000;

pub struct ViewUpdater<'a> {
    store: &'a dyn GraphStore,
    client: &'a ViewStoreClient,
    config: &'a ViewsConfig,
    accessors: &'a AccessorTable,
    resource_root: &'a str,
}

impl<'a> ViewUpdater<'a> {
    pub fn new(
        store: &'a dyn GraphStore,
        client: &'a ViewStoreClient,
        config: &'a ViewsConfig,
        accessors: &'a AccessorTable,
        resource_root: &'a str,
    ) -> Self {
        Self { store, client, config, accessors, resource_root }
    }

    fn objects(&self, subject: &NamedNode, predicate: &NamedNode) -> Result<Vec<Term>> {
        let pattern = Pattern::any().subject(subject).predicate(predicate).graph(GraphName::DefaultGraph);
        let mut objects: Vec<Term> = self.store.find(&pattern)?.into_iter().map(|s| s.object).collect();
        objects.sort_by_cached_key(ToString::to_string);
        Ok(objects)
    }

    /// Terms reached from `subject` along the column's predicate path
    pub fn retrieve_values(&self, subject: &NamedNode, column: &ViewColumn) -> Result<Vec<Term>> {
        let mut nodes = vec![Term::NamedNode(subject.clone())];
        for predicate in column.path() {
            let mut next = Vec::new();
            for node in &nodes {
                if let Term::NamedNode(node) = node {
                    for object in self.objects(node, &predicate)? {
                        if !next.contains(&object) {
                            next.push(object);
                        }
                    }
                }
            }
            nodes = next;
        }
        Ok(nodes)
    }

    pub fn label(&self, node: &NamedNode) -> Result<Option<String>> {
        Ok(self.objects(node, &vocab::rdfs_label())?.first().and_then(term_text))
    }

    fn types(&self, subject: &NamedNode) -> Result<Vec<String>> {
        Ok(self
            .objects(subject, &vocab::rdf_type())?
            .into_iter()
            .filter_map(|t| match t {
                Term::NamedNode(node) => Some(node.into_string()),
                _ => None,
            })
            .collect())
    }

    fn is_deleted(&self, subject: &NamedNode) -> Result<bool> {
        Ok(!self.objects(subject, &vocab::date_deleted())?.is_empty())
    }

    /// Label of a term used as a Term/TermSet value; recorded in the label table
    fn term_label(&self, term: &Term, column: &ViewColumn) -> Result<Option<String>> {
        match term {
            Term::NamedNode(node) => {
                let label = self.label(node)?.unwrap_or_else(|| node.as_str().to_string());
                self.client.add_label(node.as_str(), column.rdf_type.as_deref().unwrap_or(""), &label)?;
                Ok(Some(label))
            }
            other => Ok(term_text(other)),
        }
    }

    fn collection(&self, subject: &NamedNode) -> Result<String> {
        let location = subject.as_str().strip_prefix(self.resource_root).ok_or_else(|| {
            Error::InvalidRequest(format!(
                "Resource identifier {} does not start with {}",
                subject.as_str(),
                self.resource_root
            ))
        })?;
        let segment = location.split('/').next().unwrap_or_default();
        urlencoding::decode(segment)
            .map(|decoded| decoded.into_owned())
            .map_err(|e| Error::InvalidRequest(format!("Invalid collection name {}: {}", segment, e)))
    }

    /// Main-table values of an entity; every column is present, absent values are NULL
    fn row_values(&self, view: &ViewDefinition, subject: &NamedNode) -> Result<RowValues> {
        let mut row: RowValues = vec![
            ("id".to_string(), SqlValue::Text(subject.as_str().to_string())),
            ("label".to_string(), self.label(subject)?.map_or(SqlValue::Null, SqlValue::Text)),
        ];
        if view.is_resource_view() {
            row.push(("collection".to_string(), SqlValue::Text(self.collection(subject)?)));
        }
        for column in view.scalar_columns() {
            let Some(accessor) = self.accessors.column(&view.name, &column.name) else {
                continue;
            };
            let values = self.retrieve_values(subject, column)?;
            let value = match values.first() {
                Some(term) => {
                    let label = match accessor.kind {
                        AccessorKind::Term => self.term_label(term, column)?,
                        _ => None,
                    };
                    accessor.encode(term, label.as_deref()).unwrap_or(SqlValue::Null)
                }
                None => SqlValue::Null,
            };
            row.push((accessor.sql_column.clone(), value));
        }
        Ok(row)
    }

    fn set_values(&self, subject: &NamedNode, column: &ViewColumn) -> Result<BTreeSet<String>> {
        let mut values = BTreeSet::new();
        for term in self.retrieve_values(subject, column)? {
            let value = match column.column_type {
                ColumnType::TermSet => self.term_label(&term, column)?,
                _ => term_text(&term),
            };
            if let Some(value) = value {
                values.insert(value);
            }
        }
        Ok(values)
    }

    fn linked_ids(&self, subject: &NamedNode, join: &JoinView) -> Result<BTreeSet<String>> {
        let relation = NamedNode::new_unchecked(join.on.as_str());
        let ids = if join.reverse {
            self.store
                .subjects_with(&relation, &Term::NamedNode(subject.clone()))?
                .into_iter()
                .map(NamedNode::into_string)
                .collect()
        } else {
            self.objects(subject, &relation)?
                .into_iter()
                .filter_map(|t| match t {
                    Term::NamedNode(node) => Some(node.into_string()),
                    _ => None,
                })
                .collect()
        };
        Ok(ids)
    }

    /// Bring every view showing `subject` in line with the graph. Returns the names of the views
    /// that were touched.
    pub fn update_subject(&self, subject: &NamedNode) -> Result<Vec<String>> {
        let types = self.types(subject)?;
        if types.is_empty() {
            debug!("Subject {} has no type", subject.as_str());
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let deleted = self.is_deleted(subject)?;
        let mut touched: Vec<String> = Vec::new();
        for view in &self.config.views {
            if !types.iter().any(|t| view.has_type(t)) {
                continue;
            }
            let id = subject.as_str();
            if deleted {
                debug!("Deleting entity {} from view {}", id, view.name);
                self.client.delete_row(&view.name, id)?;
            } else {
                debug!("Updating entity {} in view {}", id, view.name);
                self.client.upsert_row(&view.name, &self.row_values(view, subject)?)?;
                for column in view.set_columns() {
                    let values = self.set_values(subject, column)?;
                    self.client.update_values(&view.name, id, &column.name, &values)?;
                }
                for join in &view.join {
                    let ids = self.linked_ids(subject, join)?;
                    self.client.update_links(&view.name, id, &join.view, &ids)?;
                }
            }
            touched.push(view.name.clone());
        }
        debug!("Updating subject {} took {}ms", subject.as_str(), start.elapsed().as_millis());
        Ok(touched)
    }

    /// Rebuild all tables of `view` from the graph in batches
    pub fn recreate_index_for_view(&self, view: &ViewDefinition) -> Result<usize> {
        self.client.truncate_view_tables(&view.name)?;
        self.insert_view(view)
    }

    /// Insert the rows of every entity of `view` into its emptied tables. Links already present
    /// in a shared join table are kept.
    pub fn insert_view(&self, view: &ViewDefinition) -> Result<usize> {
        let start = Instant::now();
        let mut seen = HashSet::new();
        let mut entities = Vec::new();
        for type_iri in &view.types {
            let type_term = Term::NamedNode(NamedNode::new_unchecked(type_iri.as_str()));
            for subject in self.store.subjects_with(&vocab::rdf_type(), &type_term)? {
                if seen.insert(subject.clone()) {
                    entities.push(subject);
                }
            }
        }
        entities.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        let mut total = 0;
        for chunk in entities.chunks(BATCH_SIZE) {
            let mut rows = Vec::with_capacity(chunk.len());
            let mut values: Vec<Vec<(String, String)>> = vec![Vec::new(); view.set_columns().count()];
            let mut links: Vec<Vec<(String, String)>> = vec![Vec::new(); view.join.len()];
            for subject in chunk {
                if self.is_deleted(subject)? {
                    continue;
                }
                let id = subject.as_str().to_string();
                rows.push(self.row_values(view, subject)?);
                for (i, column) in view.set_columns().enumerate() {
                    for value in self.set_values(subject, column)? {
                        values[i].push((id.clone(), value));
                    }
                }
                for (i, join) in view.join.iter().enumerate() {
                    for other in self.linked_ids(subject, join)? {
                        links[i].push((id.clone(), other));
                    }
                }
            }
            total += self.client.insert_rows(&view.name, &rows)?;
            for (column, pairs) in view.set_columns().zip(&values) {
                self.client.insert_values(&view.name, &column.name, pairs)?;
            }
            for (join, pairs) in view.join.iter().zip(&links) {
                self.client.insert_links(&view.name, &join.view, pairs)?;
            }
        }
        info!(
            "Inserted {} rows for view {} in {}ms",
            total,
            view.name,
            start.elapsed().as_millis()
        );
        Ok(total)
    }
}
