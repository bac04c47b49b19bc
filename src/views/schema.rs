//! Creating and migrating the view tables.
//!
//! Migration is additive: missing tables are created and missing columns added. A column that
//! disappeared from the definition or changed type is rejected, and every check runs before the
//! first statement that changes the database.

use log::{debug, info};
use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::views::definition::ViewsConfig;
use crate::views::table::{ColumnDefinition, SchemaModel, Table};

#[derive(Debug)]
enum Migration<'a> {
    Create(&'a Table),
    AddColumns(&'a Table, Vec<&'a ColumnDefinition>),
}

/// Columns of an existing table as `(name, declared type)`; empty when the table does not exist
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<(String, String)>> {
    let mut statement = conn.prepare(&format!("pragma table_info({})", table))?;
    let rows = statement.query_map([], |row| {
        Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
    })?;
    let mut columns = Vec::new();
    for row in rows {
        let (name, sql_type) = row?;
        columns.push((name.to_lowercase(), sql_type.to_lowercase()));
    }
    Ok(columns)
}

fn plan<'a>(conn: &Connection, table: &'a Table) -> Result<Option<Migration<'a>>> {
    let existing = table_columns(conn, &table.name)?;
    if existing.is_empty() {
        return Ok(Some(Migration::Create(table)));
    }
    for (name, sql_type) in &existing {
        let expected = table.column(name).ok_or_else(|| {
            Error::Config(format!(
                "Column {} of table {} is no longer defined; removing columns is not supported",
                name, table.name
            ))
        })?;
        if expected.sql_type() != sql_type {
            return Err(Error::Config(format!(
                "Column {} of table {} has type {} but is now defined as {}",
                name,
                table.name,
                sql_type,
                expected.sql_type()
            )));
        }
    }
    let added: Vec<&ColumnDefinition> = table
        .columns
        .iter()
        .filter(|column| !existing.iter().any(|(name, _)| *name == column.name))
        .collect();
    if added.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Migration::AddColumns(table, added)))
    }
}

/// Validate `config` against the database and bring the tables up to date
pub fn ensure_schema(conn: &Connection, config: &ViewsConfig) -> Result<SchemaModel> {
    config.validate()?;
    let model = SchemaModel::build(config);
    let label = SchemaModel::label_table();
    let mut tables = model.tables();
    tables.push(&label);

    let mut migrations = Vec::new();
    for table in &tables {
        if let Some(migration) = plan(conn, table)? {
            migrations.push(migration);
        }
    }

    let tx = conn.unchecked_transaction()?;
    for migration in &migrations {
        match migration {
            Migration::Create(table) => {
                let sql = table.create_sql();
                debug!("{}", sql);
                tx.execute_batch(&sql)?;
                info!("Table {} created", table.name);
            }
            Migration::AddColumns(table, columns) => {
                for column in columns {
                    let sql = format!(
                        "alter table {} add column {} {}",
                        table.name,
                        column.name,
                        column.sql_type()
                    );
                    debug!("{}", sql);
                    tx.execute_batch(&sql)?;
                }
                info!("Table {} updated with {} new columns", table.name, columns.len());
            }
        }
    }
    for table in &tables {
        for sql in table.index_sql() {
            tx.execute_batch(&sql)?;
        }
    }
    tx.commit()?;
    Ok(model)
}
