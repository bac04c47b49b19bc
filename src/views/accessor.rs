//! Typed column access, fixed per view when the configuration is loaded.
//!
//! Each scalar column of a view gets a [`ColumnAccessor`] that knows how to turn a graph term
//! into a database value and a database value back into a [`ValueDto`].

use std::collections::{BTreeMap, HashMap};

use log::warn;
use oxigraph::model::Term;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::views::definition::{ColumnType, ViewDefinition, ViewsConfig, COLLECTION_COLUMN};

/// Raw value of a cell
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    Number(f64),
    Bool(bool),
}

/// A displayed cell value together with its raw value
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValueDto {
    pub label: String,
    pub value: Value,
}

impl Value {
    /// Text form, as compared against labels and identifiers
    pub fn to_text(&self) -> String {
        match self {
            Value::Text(text) => text.clone(),
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
        }
    }
}

impl ValueDto {
    pub fn text(label: &str, value: &str) -> Self {
        Self { label: label.to_string(), value: Value::Text(value.to_string()) }
    }
}

/// Column key (`View` or `View_column`) to its values, in order and without duplicates
pub type ViewRow = BTreeMap<String, Vec<ValueDto>>;

pub fn add_value(row: &mut ViewRow, key: &str, value: ValueDto) {
    let values = row.entry(key.to_string()).or_default();
    if !values.contains(&value) {
        values.push(value);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessorKind {
    Text,
    Number,
    Date,
    Boolean,
    Identifier,
    /// Stores the label of the term; reads map the label back to the term
    Term,
}

impl AccessorKind {
    fn for_column(column_type: ColumnType) -> Option<Self> {
        match column_type {
            ColumnType::Text => Some(AccessorKind::Text),
            ColumnType::Number => Some(AccessorKind::Number),
            ColumnType::Date => Some(AccessorKind::Date),
            ColumnType::Boolean => Some(AccessorKind::Boolean),
            ColumnType::Identifier => Some(AccessorKind::Identifier),
            ColumnType::Term => Some(AccessorKind::Term),
            ColumnType::Set | ColumnType::TermSet => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnAccessor {
    /// Column name as configured
    pub name: String,
    /// Key of the column in a [`ViewRow`]
    pub key: String,
    /// Physical column
    pub sql_column: String,
    pub kind: AccessorKind,
    pub rdf_type: Option<String>,
}

impl ColumnAccessor {
    /// Database value for `term`. `label` is the term's label, used by Term columns.
    pub fn encode(&self, term: &Term, label: Option<&str>) -> Option<SqlValue> {
        match self.kind {
            AccessorKind::Term => label.map(|l| SqlValue::Text(l.to_string())),
            AccessorKind::Text | AccessorKind::Identifier | AccessorKind::Date => {
                term_text(term).map(SqlValue::Text)
            }
            AccessorKind::Number => {
                let text = term_text(term)?;
                let text = text.trim();
                if let Ok(integer) = text.parse::<i64>() {
                    Some(SqlValue::Integer(integer))
                } else if let Ok(real) = text.parse::<f64>() {
                    Some(SqlValue::Real(real))
                } else {
                    warn!("Ignoring non-numeric value '{}' for column {}", text, self.key);
                    None
                }
            }
            AccessorKind::Boolean => match term_text(term)?.trim() {
                "true" | "1" => Some(SqlValue::Integer(1)),
                "false" | "0" => Some(SqlValue::Integer(0)),
                other => {
                    warn!("Ignoring non-boolean value '{}' for column {}", other, self.key);
                    None
                }
            },
        }
    }

    /// Cell value read back from the database. `term_for_label` resolves Term labels.
    pub fn decode(
        &self,
        value: ValueRef<'_>,
        term_for_label: &dyn Fn(&str) -> Result<Option<String>>,
    ) -> Result<Option<ValueDto>> {
        let dto = match (self.kind, value) {
            (_, ValueRef::Null) => return Ok(None),
            (AccessorKind::Boolean, ValueRef::Integer(i)) => {
                ValueDto { label: (i != 0).to_string(), value: Value::Bool(i != 0) }
            }
            (_, ValueRef::Integer(i)) => ValueDto { label: i.to_string(), value: Value::Number(i as f64) },
            (_, ValueRef::Real(f)) => ValueDto { label: f.to_string(), value: Value::Number(f) },
            (AccessorKind::Term, ValueRef::Text(bytes)) => {
                let label = String::from_utf8_lossy(bytes).into_owned();
                let iri = term_for_label(&label)?.unwrap_or_else(|| label.clone());
                ValueDto { label, value: Value::Text(iri) }
            }
            (AccessorKind::Number, ValueRef::Text(bytes)) => {
                let text = String::from_utf8_lossy(bytes).into_owned();
                match text.parse::<f64>() {
                    Ok(number) => ValueDto { label: text, value: Value::Number(number) },
                    Err(_) => ValueDto { label: text.clone(), value: Value::Text(text) },
                }
            }
            (_, ValueRef::Text(bytes)) => {
                let text = String::from_utf8_lossy(bytes).into_owned();
                ValueDto { label: text.clone(), value: Value::Text(text) }
            }
            (_, ValueRef::Blob(_)) => return Ok(None),
        };
        Ok(Some(dto))
    }
}

/// Lexical form of a literal or the IRI of a named node
pub fn term_text(term: &Term) -> Option<String> {
    match term {
        Term::Literal(literal) => Some(literal.value().to_string()),
        Term::NamedNode(node) => Some(node.as_str().to_string()),
        _ => None,
    }
}

/// Accessors of the scalar columns of every view, keyed by lowercase view name
#[derive(Clone, Debug, Default)]
pub struct AccessorTable {
    views: HashMap<String, Vec<ColumnAccessor>>,
}

impl AccessorTable {
    pub fn build(config: &ViewsConfig) -> Self {
        let views = config
            .views
            .iter()
            .map(|view| (view.name.to_lowercase(), Self::view_accessors(view)))
            .collect();
        Self { views }
    }

    fn view_accessors(view: &ViewDefinition) -> Vec<ColumnAccessor> {
        let mut accessors = Vec::new();
        if view.is_resource_view() {
            accessors.push(ColumnAccessor {
                name: COLLECTION_COLUMN.to_string(),
                key: format!("{}_{}", view.name, COLLECTION_COLUMN),
                sql_column: COLLECTION_COLUMN.to_string(),
                kind: AccessorKind::Text,
                rdf_type: None,
            });
        }
        for column in &view.columns {
            if let Some(kind) = AccessorKind::for_column(column.column_type) {
                accessors.push(ColumnAccessor {
                    name: column.name.clone(),
                    key: format!("{}_{}", view.name, column.name),
                    sql_column: column.sql_name(),
                    kind,
                    rdf_type: column.rdf_type.clone(),
                });
            }
        }
        accessors
    }

    pub fn view(&self, view: &str) -> &[ColumnAccessor] {
        self.views.get(&view.to_lowercase()).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn column(&self, view: &str, column: &str) -> Option<&ColumnAccessor> {
        self.view(view).iter().find(|a| a.name.eq_ignore_ascii_case(column))
    }
}
