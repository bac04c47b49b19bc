//! Filtered, paginated reads of the view tables.
//!
//! The reader has its own connection. Page and count queries run under a watchdog thread that
//! interrupts the connection when the configured timeout elapses; an interrupted query yields the
//! rows read so far with `timeout` set instead of an error.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::views::accessor::{add_value, AccessorTable, Value, ValueDto, ViewRow};
use crate::views::definition::{ColumnType, ViewColumn, ViewDefinition, ViewsConfig, COLLECTION_COLUMN};
use crate::views::materialized::join_view_name;
use crate::views::table::{id_column, SchemaModel, LABEL_TABLE};

/// Constraint on one field. `field` is `View` (the entity itself) or `View_column`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewFilter {
    pub field: String,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default)]
    pub min: Option<Value>,
    #[serde(default)]
    pub max: Option<Value>,
    #[serde(default)]
    pub prefix: Option<String>,
}

impl ViewFilter {
    pub fn values(field: &str, values: &[&str]) -> Self {
        Self {
            field: field.to_string(),
            values: values.iter().map(|v| Value::Text(v.to_string())).collect(),
            ..Self::default()
        }
    }

    pub fn range(field: &str, min: Option<Value>, max: Option<Value>) -> Self {
        Self { field: field.to_string(), min, max, ..Self::default() }
    }

    pub fn prefix(field: &str, prefix: &str) -> Self {
        Self { field: field.to_string(), prefix: Some(prefix.to_string()), ..Self::default() }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RowsResult {
    pub rows: Vec<ViewRow>,
    pub timeout: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewPage {
    pub rows: Vec<ViewRow>,
    pub has_next: bool,
    pub timeout: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CountResult {
    pub count: u64,
    pub timeout: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Range {
    pub min: Value,
    pub max: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AggregateResult {
    pub range: Option<Range>,
    pub timeout: bool,
}

/// A filterable field of a view
#[derive(Clone, Copy, Debug)]
enum Field<'a> {
    Id,
    Label,
    Collection,
    Column(&'a ViewColumn),
}

impl Field<'_> {
    fn sql_name(&self) -> String {
        match self {
            Field::Id => "id".to_string(),
            Field::Label => "label".to_string(),
            Field::Collection => COLLECTION_COLUMN.to_string(),
            Field::Column(column) => column.sql_name(),
        }
    }

    fn column_type(&self) -> ColumnType {
        match self {
            Field::Id => ColumnType::Identifier,
            Field::Label | Field::Collection => ColumnType::Text,
            Field::Column(column) => column.column_type,
        }
    }
}

/// Interrupts the connection unless dropped before `timeout`
struct Watchdog {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn start(conn: &Connection, timeout: Duration) -> Result<Self> {
        let interrupt = conn.get_interrupt_handle();
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new().name("query-watchdog".to_string()).spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(timeout) {
                interrupt.interrupt();
            }
        })?;
        Ok(Self { stop: Some(stop), handle: Some(handle) })
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn is_interrupt(err: &Error) -> bool {
    matches!(
        err,
        Error::Sql(rusqlite::Error::SqliteFailure(failure, _)) if failure.code == ErrorCode::OperationInterrupted
    )
}

/// Row counts beyond the range of a SQLite integer are clamped
fn sql_integer(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Escape `%`, `_` and the escape character itself for a `like ... escape '\'` pattern
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn bind_value(value: &Value, column_type: ColumnType) -> SqlValue {
    match (value, column_type) {
        (Value::Bool(flag), _) => SqlValue::Integer(i64::from(*flag)),
        (Value::Number(number), _) => {
            if number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
                SqlValue::Integer(*number as i64)
            } else {
                SqlValue::Real(*number)
            }
        }
        (Value::Text(text), ColumnType::Boolean) => match text.as_str() {
            "true" | "1" => SqlValue::Integer(1),
            "false" | "0" => SqlValue::Integer(0),
            _ => SqlValue::Text(text.clone()),
        },
        (Value::Text(text), ColumnType::Number) => match text.trim().parse::<f64>() {
            Ok(number) => bind_value(&Value::Number(number), ColumnType::Number),
            Err(_) => SqlValue::Text(text.clone()),
        },
        (Value::Text(text), _) => SqlValue::Text(text.clone()),
    }
}

/// Read access to the view tables
pub struct ViewStoreReader {
    conn: Connection,
    config: ViewsConfig,
    model: SchemaModel,
    accessors: AccessorTable,
    page_timeout: Duration,
    count_timeout: Duration,
}

impl ViewStoreReader {
    pub fn open(
        path: impl AsRef<Path>,
        config: ViewsConfig,
        page_timeout: Duration,
        count_timeout: Duration,
    ) -> Result<Self> {
        config.validate()?;
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let model = SchemaModel::build(&config);
        let accessors = AccessorTable::build(&config);
        Ok(Self { conn, config, model, accessors, page_timeout, count_timeout })
    }

    fn view(&self, name: &str) -> Result<&ViewDefinition> {
        self.config
            .view(name)
            .ok_or_else(|| Error::InvalidRequest(format!("View not supported: {}", name)))
    }

    fn field<'a>(&self, view: &'a ViewDefinition, name: Option<&str>) -> Result<Field<'a>> {
        let Some(name) = name else {
            return Ok(Field::Id);
        };
        let lower = name.to_lowercase();
        match lower.as_str() {
            "id" => Ok(Field::Id),
            "label" => Ok(Field::Label),
            COLLECTION_COLUMN if view.is_resource_view() => Ok(Field::Collection),
            _ => view.find_column(name).map(Field::Column).ok_or_else(|| {
                Error::InvalidRequest(format!("Unknown column for view {}: {}", view.name, name))
            }),
        }
    }

    fn label_for(&self, id: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .prepare_cached(&format!("select label from {} where id = ?1", LABEL_TABLE))?
            .query_row(params![id], |row| row.get(0))
            .optional()?)
    }

    fn iri_for_label(&self, rdf_type: Option<&str>, label: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .prepare_cached(&format!(
                "select id from {} where type = ?1 and label = ?2 order by id limit 1",
                LABEL_TABLE
            ))?
            .query_row(params![rdf_type.unwrap_or(""), label], |row| row.get(0))
            .optional()?)
    }

    /// SQL condition on `expr`; `None` when the filter constrains nothing
    fn constraint(
        &self,
        expr: &str,
        field: Field<'_>,
        filter: &ViewFilter,
        params: &mut Vec<SqlValue>,
    ) -> Result<Option<String>> {
        let column_type = field.column_type();
        if !filter.values.is_empty() {
            let mut values = Vec::with_capacity(filter.values.len());
            for value in &filter.values {
                if matches!(column_type, ColumnType::Term | ColumnType::TermSet) {
                    match self.label_for(&value.to_text())? {
                        Some(label) => values.push(SqlValue::Text(label)),
                        None => error!("No label found for value {}", value.to_text()),
                    }
                } else {
                    values.push(bind_value(value, column_type));
                }
            }
            if values.is_empty() {
                return Ok(Some("0".to_string()));
            }
            let placeholders: Vec<&str> = values.iter().map(|_| "?").collect();
            params.extend(values);
            return Ok(Some(format!("{} in ( {} )", expr, placeholders.join(", "))));
        }
        let mut constraints = Vec::new();
        if let Some(min) = &filter.min {
            params.push(bind_value(min, column_type));
            constraints.push(format!("{} >= ?", expr));
        }
        if let Some(max) = &filter.max {
            params.push(bind_value(max, column_type));
            constraints.push(format!("{} <= ?", expr));
        }
        if let Some(prefix) = filter.prefix.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            // prefixes on the entity match its label
            let expr = match field {
                Field::Id => expr.strip_suffix(".id").map_or(expr.to_string(), |a| format!("{}.label", a)),
                _ => expr.to_string(),
            };
            params.push(SqlValue::Text(format!("{}%", escape_like(&prefix.to_lowercase()))));
            constraints.push(format!("lower({}) like ? escape '\\'", expr));
        }
        Ok((!constraints.is_empty()).then(|| constraints.join(" and ")))
    }

    /// Conditions of the filters on `view`, for rows aliased `alias`
    fn view_constraints(
        &self,
        view: &ViewDefinition,
        alias: &str,
        filters: &[&ViewFilter],
        params: &mut Vec<SqlValue>,
    ) -> Result<Vec<String>> {
        let mut constraints = Vec::new();
        for filter in filters {
            let column = filter.field.split_once('_').map(|(_, column)| column);
            let field = self.field(view, column)?;
            match field {
                Field::Column(column) if column.column_type.is_set() => {
                    let table = self
                        .model
                        .view(&view.name)
                        .and_then(|tables| tables.properties.get(&column.sql_name()))
                        .ok_or_else(|| Error::InvalidRequest(format!("No table for {}", filter.field)))?;
                    let inner = self.constraint(&format!("pt.{}", column.sql_name()), field, filter, params)?;
                    constraints.push(format!(
                        "exists ( select 1 from {} pt where pt.{} = {}.id{} )",
                        table.name,
                        id_column(&view.name),
                        alias,
                        inner.map(|c| format!(" and {}", c)).unwrap_or_default()
                    ));
                }
                _ => {
                    let expr = format!("{}.{}", alias, field.sql_name());
                    constraints.extend(self.constraint(&expr, field, filter, params)?);
                }
            }
        }
        Ok(constraints)
    }

    /// Select statement over the main table of `view` with all filters applied
    fn query(
        &self,
        view: &ViewDefinition,
        projection: &str,
        filters: &[ViewFilter],
        scope: &str,
    ) -> Result<(String, Vec<SqlValue>)> {
        let mut by_view: BTreeMap<String, Vec<&ViewFilter>> = BTreeMap::new();
        for filter in filters {
            let target = filter.field.split('_').next().unwrap_or_default().to_lowercase();
            by_view.entry(target).or_default().push(filter);
        }
        let mut params = Vec::new();
        let mut constraints = Vec::new();
        let own = view.table_name();
        if let Some(own_filters) = by_view.get(&own) {
            constraints.extend(self.view_constraints(view, "v", own_filters, &mut params)?);
        }
        for (target, target_filters) in by_view.iter().filter(|(target, _)| **target != own) {
            let joined = self.view(target)?;
            let join = self
                .model
                .view(&view.name)
                .and_then(|tables| tables.joins.get(target))
                .ok_or_else(|| {
                    Error::InvalidRequest(format!("View {} is not joined with {}", view.name, joined.name))
                })?;
            let inner = self.view_constraints(joined, "jv", target_filters, &mut params)?;
            constraints.push(format!(
                "exists ( select 1 from {} jt join {} jv on jv.id = jt.{} where jt.{} = v.id{} )",
                join.table.name,
                joined.table_name(),
                join.other_column,
                join.own_column,
                inner.iter().map(|c| format!(" and {}", c)).collect::<String>()
            ));
        }
        let filter = if constraints.is_empty() {
            String::new()
        } else {
            format!(" where {}", constraints.join(" and "))
        };
        let sql = format!("select {} from {} v{} {}", projection, own, filter, scope);
        debug!("Query: {}", sql);
        Ok((sql, params))
    }

    fn set_values(&self, view: &ViewDefinition, column: &ViewColumn, id: &str) -> Result<Vec<ValueDto>> {
        let Some(table) = self.model.view(&view.name).and_then(|t| t.properties.get(&column.sql_name())) else {
            return Ok(Vec::new());
        };
        let mut statement = self.conn.prepare_cached(&format!(
            "select {} from {} where {} = ?1 order by 1",
            column.sql_name(),
            table.name,
            id_column(&view.name)
        ))?;
        let labels = statement
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut values = Vec::with_capacity(labels.len());
        for label in labels {
            let value = match column.column_type {
                ColumnType::TermSet => {
                    self.iri_for_label(column.rdf_type.as_deref(), &label)?.unwrap_or_else(|| label.clone())
                }
                _ => label.clone(),
            };
            values.push(ValueDto::text(&label, &value));
        }
        Ok(values)
    }

    fn add_set_values(&self, row: &mut ViewRow, view: &ViewDefinition, id: &str, only: Option<&[String]>) -> Result<()> {
        for column in view.set_columns() {
            if only.map_or(false, |names| !names.iter().any(|n| n.eq_ignore_ascii_case(&column.name))) {
                continue;
            }
            let key = format!("{}_{}", view.name, column.name);
            row.entry(key.clone()).or_default();
            for value in self.set_values(view, column, id)? {
                add_value(row, &key, value);
            }
        }
        Ok(())
    }

    /// Entities linked through `joined`, read from the capped join materialization
    fn add_joined_values(&self, row: &mut ViewRow, view: &ViewDefinition, id: &str) -> Result<()> {
        for join in &view.join {
            let joined = self.view(&join.view)?;
            let Some(tables) = self.model.view(&view.name).and_then(|t| t.joins.get(&joined.table_name())) else {
                continue;
            };
            let accessors: Vec<_> = join
                .include
                .iter()
                .filter_map(|name| self.accessors.column(&joined.name, name))
                .collect();
            let mut statement = self.conn.prepare_cached(&format!(
                "select * from {} where {} = ?1 order by {}",
                join_view_name(view, joined),
                tables.own_column,
                tables.other_column
            ))?;
            let mut rows = statement.query(params![id])?;
            let mut linked = Vec::new();
            while let Some(result) = rows.next()? {
                let other: String = result.get(tables.other_column.as_str())?;
                let label: Option<String> = result.get("label")?;
                add_value(row, &joined.name, ValueDto::text(label.as_deref().unwrap_or(&other), &other));
                for accessor in &accessors {
                    let value = result.get_ref(accessor.sql_column.as_str())?;
                    let decoded =
                        accessor.decode(value, &|l| self.iri_for_label(accessor.rdf_type.as_deref(), l))?;
                    if let Some(dto) = decoded {
                        add_value(row, &accessor.key, dto);
                    }
                }
                linked.push(other);
            }
            for other in linked {
                self.add_set_values(row, joined, &other, Some(&join.include))?;
            }
        }
        Ok(())
    }

    fn collect_rows(
        &self,
        view: &ViewDefinition,
        sql: &str,
        params: &[SqlValue],
        include_joins: bool,
        rows: &mut Vec<ViewRow>,
    ) -> Result<()> {
        let accessors = self.accessors.view(&view.name);
        let mut statement = self.conn.prepare(sql)?;
        let mut results = statement.query(params_from_iter(params.iter()))?;
        while let Some(result) = results.next()? {
            let id: String = result.get("id")?;
            let label: Option<String> = result.get("label")?;
            let mut row = ViewRow::new();
            add_value(&mut row, &view.name, ValueDto::text(label.as_deref().unwrap_or(&id), &id));
            for accessor in accessors {
                let value = result.get_ref(accessor.sql_column.as_str())?;
                let decoded = accessor.decode(value, &|l| self.iri_for_label(accessor.rdf_type.as_deref(), l))?;
                if let Some(dto) = decoded {
                    add_value(&mut row, &accessor.key, dto);
                }
            }
            self.add_set_values(&mut row, view, &id, None)?;
            if include_joins {
                self.add_joined_values(&mut row, view, &id)?;
            }
            rows.push(row);
        }
        Ok(())
    }

    /// Rows of `view` matching all `filters`, ordered by id
    pub fn retrieve_rows(
        &self,
        view: &str,
        filters: &[ViewFilter],
        offset: usize,
        limit: usize,
        include_joins: bool,
    ) -> Result<RowsResult> {
        let definition = self.view(view)?;
        let scope = format!("order by v.id limit {} offset {}", sql_integer(limit), sql_integer(offset));
        let (sql, params) = self.query(definition, "v.*", filters, &scope)?;
        let start = Instant::now();
        let watchdog = Watchdog::start(&self.conn, self.page_timeout)?;
        let mut rows = Vec::new();
        let outcome = self.collect_rows(definition, &sql, &params, include_joins, &mut rows);
        drop(watchdog);
        debug!("Retrieving {} rows of {} took {}ms", rows.len(), view, start.elapsed().as_millis());
        match outcome {
            Ok(()) => Ok(RowsResult { rows, timeout: false }),
            Err(e) if is_interrupt(&e) => {
                warn!("Page query on view {} timed out after {} rows", view, rows.len());
                Ok(RowsResult { rows, timeout: true })
            }
            Err(e) => Err(e),
        }
    }

    /// Page `page` (starting at 1) of `size` rows
    pub fn retrieve_page(
        &self,
        view: &str,
        filters: &[ViewFilter],
        page: usize,
        size: usize,
        include_joins: bool,
    ) -> Result<ViewPage> {
        let (page, size) = (page.max(1), size.max(1));
        let offset = (page - 1).saturating_mul(size);
        let mut result = self.retrieve_rows(view, filters, offset, size.saturating_add(1), include_joins)?;
        let has_next = result.rows.len() > size;
        result.rows.truncate(size);
        Ok(ViewPage { rows: result.rows, has_next, timeout: result.timeout })
    }

    pub fn count_rows(&self, view: &str, filters: &[ViewFilter]) -> Result<CountResult> {
        let definition = self.view(view)?;
        let (sql, params) = self.query(definition, "count(*)", filters, "")?;
        let watchdog = Watchdog::start(&self.conn, self.count_timeout)?;
        let outcome = self
            .conn
            .query_row(&sql, params_from_iter(params.iter()), |row| row.get::<_, i64>(0))
            .map_err(Error::from);
        drop(watchdog);
        match outcome {
            Ok(count) => Ok(CountResult { count: count.max(0) as u64, timeout: false }),
            Err(e) if is_interrupt(&e) => {
                warn!("Count query on view {} timed out", view);
                Ok(CountResult { count: 0, timeout: true })
            }
            Err(e) => Err(e),
        }
    }

    /// Smallest and largest value of a Number or Date column
    pub fn aggregate(&self, view: &str, column: &str) -> Result<AggregateResult> {
        let definition = self.view(view)?;
        let field = definition.find_column(column).ok_or_else(|| {
            Error::InvalidRequest(format!("Unknown column for view {}: {}", view, column))
        })?;
        if !matches!(field.column_type, ColumnType::Number | ColumnType::Date) {
            return Err(Error::InvalidRequest(
                "Aggregation only supported for numerical and date columns".to_string(),
            ));
        }
        let accessor = self.accessors.column(&definition.name, column).ok_or_else(|| {
            Error::InvalidRequest(format!("Unknown column for view {}: {}", view, column))
        })?;
        let sql = format!(
            "select min({0}), max({0}) from {1}",
            accessor.sql_column,
            definition.table_name()
        );
        let no_terms = |_: &str| -> Result<Option<String>> { Ok(None) };
        let watchdog = Watchdog::start(&self.conn, self.page_timeout)?;
        let outcome = (|| -> Result<Option<Range>> {
            let mut statement = self.conn.prepare(&sql)?;
            let mut rows = statement.query([])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };
            let min = accessor.decode(row.get_ref(0)?, &no_terms)?;
            let max = accessor.decode(row.get_ref(1)?, &no_terms)?;
            Ok(min.zip(max).map(|(min, max)| Range { min: min.value, max: max.value }))
        })();
        drop(watchdog);
        match outcome {
            Ok(range) => Ok(AggregateResult { range, timeout: false }),
            Err(e) if is_interrupt(&e) => Ok(AggregateResult { range: None, timeout: true }),
            Err(e) => Err(e),
        }
    }
}
