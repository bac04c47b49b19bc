//! Write access to the view tables.

use std::collections::BTreeSet;
use std::path::Path;

use log::{debug, info};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};

use crate::error::{Error, Result};
use crate::views::definition::ViewsConfig;
use crate::views::schema::ensure_schema;
use crate::views::table::{JoinTable, SchemaModel, Table, ViewTables, LABEL_TABLE};

/// Values of one main-table row, `id` first
pub type RowValues = Vec<(String, SqlValue)>;

/// Connection to the view database used by the projection
pub struct ViewStoreClient {
    conn: Connection,
    model: SchemaModel,
}

impl ViewStoreClient {
    /// Open the database, validate `config` against it and migrate the tables
    pub fn open(path: impl AsRef<Path>, config: &ViewsConfig) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let model = ensure_schema(&conn, config)?;
        info!("View database {} ready with {} views", path.display(), model.views.len());
        Ok(Self { conn, model })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn model(&self) -> &SchemaModel {
        &self.model
    }

    fn tables(&self, view: &str) -> Result<&ViewTables> {
        self.model
            .view(view)
            .ok_or_else(|| Error::InvalidRequest(format!("View not supported: {}", view)))
    }

    fn property_table(&self, view: &str, column: &str) -> Result<&Table> {
        self.tables(view)?.properties.get(&column.to_lowercase()).ok_or_else(|| {
            Error::InvalidRequest(format!("No value set column {} in view {}", column, view))
        })
    }

    fn join_table(&self, view: &str, joined: &str) -> Result<&JoinTable> {
        self.tables(view)?.joins.get(&joined.to_lowercase()).ok_or_else(|| {
            Error::InvalidRequest(format!("View {} has no join with {}", view, joined))
        })
    }

    /// Insert the row or overwrite the listed columns of the existing row
    pub fn upsert_row(&self, view: &str, row: &RowValues) -> Result<()> {
        let table = &self.tables(view)?.main;
        let columns: Vec<&str> = row.iter().map(|(c, _)| c.as_str()).collect();
        let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{}", i)).collect();
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| **c != "id")
            .map(|c| format!("{0} = excluded.{0}", c))
            .collect();
        let conflict = if updates.is_empty() {
            "do nothing".to_string()
        } else {
            format!("do update set {}", updates.join(", "))
        };
        let sql = format!(
            "insert into {} ( {} ) values ( {} ) on conflict ( id ) {}",
            table.name,
            columns.join(", "),
            placeholders.join(", "),
            conflict
        );
        self.conn.prepare_cached(&sql)?.execute(params_from_iter(row.iter().map(|(_, v)| v)))?;
        Ok(())
    }

    /// Remove the main-table row of an entity
    pub fn delete_row(&self, view: &str, id: &str) -> Result<()> {
        let table = &self.tables(view)?.main;
        let deleted = self
            .conn
            .prepare_cached(&format!("delete from {} where id = ?1", table.name))?
            .execute(params![id])?;
        debug!("Deleted {} rows for {} from {}", deleted, id, table.name);
        Ok(())
    }

    /// Make the value set of `column` for entity `id` equal to `values`
    pub fn update_values(&self, view: &str, id: &str, column: &str, values: &BTreeSet<String>) -> Result<()> {
        let table = self.property_table(view, column)?;
        let (id_column, value_column) = (&table.columns[0].name, &table.columns[1].name);
        let existing: BTreeSet<String> = {
            let mut statement = self.conn.prepare_cached(&format!(
                "select {} from {} where {} = ?1",
                value_column, table.name, id_column
            ))?;
            let rows = statement.query_map(params![id], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let mut delete = self.conn.prepare_cached(&format!(
            "delete from {} where {} = ?1 and {} = ?2",
            table.name, id_column, value_column
        ))?;
        for value in existing.difference(values) {
            delete.execute(params![id, value])?;
        }
        let mut insert = self.conn.prepare_cached(&format!(
            "insert or ignore into {} ( {}, {} ) values ( ?1, ?2 )",
            table.name, id_column, value_column
        ))?;
        for value in values.difference(&existing) {
            insert.execute(params![id, value])?;
        }
        Ok(())
    }

    /// Make the set of `joined` rows linked to entity `id` equal to `ids`
    pub fn update_links(&self, view: &str, id: &str, joined: &str, ids: &BTreeSet<String>) -> Result<()> {
        let join = self.join_table(view, joined)?;
        let existing: BTreeSet<String> = {
            let mut statement = self.conn.prepare_cached(&format!(
                "select {} from {} where {} = ?1",
                join.other_column, join.table.name, join.own_column
            ))?;
            let rows = statement.query_map(params![id], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let mut delete = self.conn.prepare_cached(&format!(
            "delete from {} where {} = ?1 and {} = ?2",
            join.table.name, join.own_column, join.other_column
        ))?;
        for other in existing.difference(ids) {
            delete.execute(params![id, other])?;
        }
        let mut insert = self.conn.prepare_cached(&format!(
            "insert or ignore into {} ( {}, {} ) values ( ?1, ?2 )",
            join.table.name, join.own_column, join.other_column
        ))?;
        for other in ids.difference(&existing) {
            insert.execute(params![id, other])?;
        }
        Ok(())
    }

    pub fn add_label(&self, id: &str, rdf_type: &str, label: &str) -> Result<()> {
        self.conn
            .prepare_cached(&format!(
                "insert into {} ( id, type, label ) values ( ?1, ?2, ?3 ) \
                 on conflict ( id ) do update set type = excluded.type, label = excluded.label",
                LABEL_TABLE
            ))?
            .execute(params![id, rdf_type, label])?;
        Ok(())
    }

    /// Empty the main, property and join tables of a view
    pub fn truncate_view_tables(&self, view: &str) -> Result<()> {
        for table in self.tables(view)?.all_tables() {
            self.conn.execute(&format!("delete from {}", table.name), [])?;
        }
        debug!("Truncated the tables of view {}", view);
        Ok(())
    }

    /// Bulk insert of main-table rows that all have the same columns
    pub fn insert_rows(&self, view: &str, rows: &[RowValues]) -> Result<usize> {
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        let table = &self.tables(view)?.main;
        let columns: Vec<&str> = first.iter().map(|(c, _)| c.as_str()).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
        let mut insert = self.conn.prepare_cached(&format!(
            "insert or replace into {} ( {} ) values ( {} )",
            table.name,
            columns.join(", "),
            placeholders.join(", ")
        ))?;
        let mut count = 0;
        for row in rows {
            count += insert.execute(params_from_iter(row.iter().map(|(_, v)| v)))?;
        }
        Ok(count)
    }

    /// Bulk insert of `(entity id, value)` pairs into a property table
    pub fn insert_values(&self, view: &str, column: &str, values: &[(String, String)]) -> Result<usize> {
        let table = self.property_table(view, column)?;
        let mut insert = self.conn.prepare_cached(&format!(
            "insert or ignore into {} ( {}, {} ) values ( ?1, ?2 )",
            table.name, table.columns[0].name, table.columns[1].name
        ))?;
        let mut count = 0;
        for (id, value) in values {
            count += insert.execute(params![id, value])?;
        }
        Ok(count)
    }

    /// Bulk insert of `(entity id, joined id)` pairs into a join table
    pub fn insert_links(&self, view: &str, joined: &str, links: &[(String, String)]) -> Result<usize> {
        let join = self.join_table(view, joined)?;
        let mut insert = self.conn.prepare_cached(&format!(
            "insert or ignore into {} ( {}, {} ) values ( ?1, ?2 )",
            join.table.name, join.own_column, join.other_column
        ))?;
        let mut count = 0;
        for (id, other) in links {
            count += insert.execute(params![id, other])?;
        }
        Ok(count)
    }
}
