//! Materialized denormalizations of set columns and joins.
//!
//! Each materialized view is a table `mv_*` filled from a plain SQL view `mv_*_def`. Refreshing
//! deletes the rows the definition no longer produces and inserts the missing ones, inside one
//! transaction. A unique index over the natural key is created together with the table.

use std::collections::BTreeSet;

use log::{debug, info};
use rusqlite::Connection;

use crate::error::Result;
use crate::views::definition::{ViewDefinition, ViewsConfig};
use crate::views::schema::table_columns;
use crate::views::table::{id_column, SchemaModel};

/// Materialization of the set columns of `view`
pub fn set_view_name(view: &ViewDefinition) -> String {
    format!("mv_{}", view.table_name())
}

/// Materialization of the entities of `joined` linked to `view`
pub fn join_view_name(view: &ViewDefinition, joined: &ViewDefinition) -> String {
    format!("mv_{}_join_{}", view.table_name(), joined.table_name())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaterializedView {
    pub name: String,
    /// Lowercase name of the view this denormalizes
    pub view: String,
    /// Lowercase names of every view whose tables the definition reads
    pub sources: Vec<String>,
    pub columns: Vec<String>,
    /// Columns of the unique index
    pub key: Vec<String>,
    pub definition: String,
}

impl MaterializedView {
    pub fn definition_name(&self) -> String {
        format!("{}_def", self.name)
    }

    /// Root entity column
    pub fn id_column(&self) -> String {
        id_column(&self.view)
    }

    /// `mv_<view>`: the view's ids with every combination of set column values
    fn for_sets(view: &ViewDefinition, model: &SchemaModel) -> Option<Self> {
        let tables = model.view(&view.name)?;
        if tables.properties.is_empty() {
            return None;
        }
        let table = view.table_name();
        let id = id_column(&view.name);
        let mut columns = vec![id.clone()];
        let mut select = vec![format!("v.id as {}", id)];
        let mut joins = Vec::new();
        for (i, (column, property)) in tables.properties.iter().enumerate() {
            select.push(format!("coalesce(i{0}.{1}, '') as {1}", i, column));
            joins.push(format!(
                "left join {0} i{1} on v.id = i{1}.{2}",
                property.name, i, id
            ));
            columns.push(column.clone());
        }
        let name = set_view_name(view);
        let definition = format!(
            "select {} from {} v {}",
            select.join(", "),
            table,
            joins.join(" ")
        );
        Some(Self {
            name,
            sources: vec![table.clone()],
            view: table,
            key: columns.clone(),
            columns,
            definition,
        })
    }

    /// `mv_<view>_join_<joined>`: linked rows with the included scalar columns of the joined
    /// view, at most `max_items` per root entity
    fn for_join(
        view: &ViewDefinition,
        joined: &ViewDefinition,
        include: &[String],
        model: &SchemaModel,
        max_items: usize,
    ) -> Option<Self> {
        let join = model.view(&view.name)?.joins.get(&joined.name.to_lowercase())?;
        let (own, other) = (join.own_column.clone(), join.other_column.clone());
        let mut included: Vec<String> = vec!["label".to_string()];
        for column in include {
            let lower = column.to_lowercase();
            let scalar = joined.find_column(column).map_or(false, |c| !c.column_type.is_set());
            if scalar && !included.contains(&lower) {
                included.push(lower);
            }
        }
        let mut columns = vec![own.clone(), other.clone()];
        columns.extend(included.iter().cloned());
        let inner_columns: Vec<String> = included.iter().map(|c| format!("j.{0} as {0}", c)).collect();
        let definition = format!(
            "select {cols} from ( select jt.{own} as {own}, jt.{other} as {other}, {inner}, \
             row_number() over ( partition by jt.{own} order by jt.{other} ) as rn \
             from {join_table} jt join {joined_table} j on j.id = jt.{other} ) where rn <= {max}",
            cols = columns.join(", "),
            own = own,
            other = other,
            inner = inner_columns.join(", "),
            join_table = join.table.name,
            joined_table = joined.table_name(),
            max = max_items,
        );
        Some(Self {
            name: join_view_name(view, joined),
            view: view.table_name(),
            sources: vec![view.table_name(), joined.table_name()],
            key: vec![own, other],
            columns,
            definition,
        })
    }
}

/// All materialized views of a configuration
#[derive(Clone, Debug, Default)]
pub struct MaterializedViews {
    views: Vec<MaterializedView>,
}

impl MaterializedViews {
    pub fn build(config: &ViewsConfig, model: &SchemaModel, max_join_items: usize) -> Self {
        let mut views = Vec::new();
        for view in &config.views {
            views.extend(MaterializedView::for_sets(view, model));
            for join in &view.join {
                if let Some(joined) = config.view(&join.view) {
                    views.extend(MaterializedView::for_join(
                        view,
                        joined,
                        &join.include,
                        model,
                        max_join_items.max(1),
                    ));
                }
            }
        }
        Self { views }
    }

    pub fn all(&self) -> &[MaterializedView] {
        &self.views
    }

    pub fn get(&self, name: &str) -> Option<&MaterializedView> {
        self.views.iter().find(|mv| mv.name == name)
    }

    /// Create the definitions and the tables; a table whose columns no longer match its
    /// definition is recreated. New and recreated tables are filled from their definition.
    pub fn ensure(&self, conn: &Connection) -> Result<()> {
        let tx = conn.unchecked_transaction()?;
        for mv in &self.views {
            let definition = mv.definition_name();
            tx.execute_batch(&format!(
                "drop view if exists {0}; create view {0} as {1};",
                definition, mv.definition
            ))?;
            let existing: Vec<String> =
                table_columns(&tx, &mv.name)?.into_iter().map(|(name, _)| name).collect();
            if !existing.is_empty() && existing != mv.columns {
                info!("Definition of {} changed, recreating it", mv.name);
                tx.execute_batch(&format!("drop table {}", mv.name))?;
            }
            if existing.is_empty() || existing != mv.columns {
                tx.execute_batch(&format!(
                    "create table {0} as select * from {1} where 0; \
                     create unique index {0}_key on {0} ( {2} ); \
                     create index {0}_{3}_idx on {0} ( {3} );",
                    mv.name,
                    definition,
                    mv.key.join(", "),
                    mv.id_column()
                ))?;
                Self::refresh_view(&tx, mv)?;
                info!("Materialized view {} created", mv.name);
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Refresh, in one transaction, the materialized views reading any of the given (lowercase)
    /// views
    pub fn refresh(&self, conn: &Connection, views: &BTreeSet<String>) -> Result<()> {
        let selected: Vec<&MaterializedView> = self
            .views
            .iter()
            .filter(|mv| mv.sources.iter().any(|source| views.contains(source)))
            .collect();
        if selected.is_empty() {
            return Ok(());
        }
        let tx = conn.unchecked_transaction()?;
        for mv in selected {
            Self::refresh_view(&tx, mv)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete the rows the definition no longer produces and insert the missing ones
    fn refresh_view(conn: &Connection, mv: &MaterializedView) -> Result<()> {
        let definition = mv.definition_name();
        let matches: Vec<String> =
            mv.columns.iter().map(|c| format!("d.{1} is {0}.{1}", mv.name, c)).collect();
        let deleted = conn.execute(
            &format!(
                "delete from {0} where not exists ( select 1 from {1} d where {2} )",
                mv.name,
                definition,
                matches.join(" and ")
            ),
            [],
        )?;
        let inserted = conn.execute(
            &format!(
                "insert or ignore into {0} ( {1} ) select {1} from {2}",
                mv.name,
                mv.columns.join(", "),
                definition
            ),
            [],
        )?;
        debug!("Refreshed {}: {} stale rows removed, {} rows added", mv.name, deleted, inserted);
        Ok(())
    }

    /// Refresh every materialized view
    pub fn refresh_all(&self, conn: &Connection) -> Result<()> {
        let views = self.views.iter().map(|mv| mv.view.clone()).collect();
        self.refresh(conn, &views)
    }
}
