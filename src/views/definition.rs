//! View definitions as loaded from the views configuration file.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use oxigraph::model::NamedNode;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::views::table::check_object_names;

/// Name of the built-in view of files and directories
pub const RESOURCE_VIEW: &str = "Resource";

/// Columns every main table has
pub const BUILT_IN_COLUMNS: [&str; 2] = ["id", "label"];

/// Extra built-in column of the resource view
pub const COLLECTION_COLUMN: &str = "collection";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    Text,
    Number,
    Date,
    Boolean,
    Identifier,
    Term,
    Set,
    TermSet,
}

impl ColumnType {
    /// Multi-valued types live in a property table, not on the main table
    pub fn is_set(self) -> bool {
        matches!(self, ColumnType::Set | ColumnType::TermSet)
    }

    /// Column type as declared in the database
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Number => "numeric",
            ColumnType::Boolean => "boolean",
            ColumnType::Text
            | ColumnType::Date
            | ColumnType::Identifier
            | ColumnType::Term
            | ColumnType::Set
            | ColumnType::TermSet => "text",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ColumnType::Text => "Text",
            ColumnType::Number => "Number",
            ColumnType::Date => "Date",
            ColumnType::Boolean => "Boolean",
            ColumnType::Identifier => "Identifier",
            ColumnType::Term => "Term",
            ColumnType::Set => "Set",
            ColumnType::TermSet => "TermSet",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "text" => Ok(ColumnType::Text),
            "number" => Ok(ColumnType::Number),
            "date" => Ok(ColumnType::Date),
            "boolean" => Ok(ColumnType::Boolean),
            "identifier" => Ok(ColumnType::Identifier),
            "term" => Ok(ColumnType::Term),
            "set" => Ok(ColumnType::Set),
            "termset" => Ok(ColumnType::TermSet),
            _ => Err(Error::Config(format!("Unknown column type: {}", value))),
        }
    }
}

impl TryFrom<String> for ColumnType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewColumn {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Whitespace-separated predicate path from the entity to the value
    pub source: String,
    /// Type of the terms of a Term/TermSet column
    #[serde(default)]
    pub rdf_type: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub display_index: Option<i32>,
}

impl ViewColumn {
    pub fn new(name: &str, column_type: ColumnType, source: &str) -> Self {
        Self {
            name: name.to_string(),
            title: name.to_string(),
            column_type,
            source: source.to_string(),
            rdf_type: None,
            priority: 0,
            display_index: None,
        }
    }

    pub fn with_rdf_type(mut self, rdf_type: &str) -> Self {
        self.rdf_type = Some(rdf_type.to_string());
        self
    }

    /// Predicates of the source path, in order
    pub fn path(&self) -> Vec<NamedNode> {
        self.source.split_whitespace().map(NamedNode::new_unchecked).collect()
    }

    /// Physical column name
    pub fn sql_name(&self) -> String {
        self.name.to_lowercase()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinView {
    pub view: String,
    /// Relation predicate linking the two views
    pub on: String,
    /// The relation points from the joined view to this one
    #[serde(default)]
    pub reverse: bool,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub display_index: Option<i32>,
}

impl JoinView {
    pub fn new(view: &str, on: &str) -> Self {
        Self {
            view: view.to_string(),
            on: on.to_string(),
            reverse: false,
            include: Vec::new(),
            display_index: None,
        }
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn including(mut self, columns: &[&str]) -> Self {
        self.include = columns.iter().map(|c| c.to_string()).collect();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewDefinition {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub item_name: Option<String>,
    #[serde(default)]
    pub max_display_count: Option<u32>,
    pub types: Vec<String>,
    #[serde(default)]
    pub columns: Vec<ViewColumn>,
    #[serde(default)]
    pub join: Vec<JoinView>,
}

impl ViewDefinition {
    pub fn new(name: &str, types: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            title: name.to_string(),
            item_name: None,
            max_display_count: None,
            types: types.iter().map(|t| t.to_string()).collect(),
            columns: Vec::new(),
            join: Vec::new(),
        }
    }

    pub fn column(mut self, column: ViewColumn) -> Self {
        self.columns.push(column);
        self
    }

    pub fn joined(mut self, join: JoinView) -> Self {
        self.join.push(join);
        self
    }

    pub fn table_name(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn is_resource_view(&self) -> bool {
        self.name.eq_ignore_ascii_case(RESOURCE_VIEW)
    }

    pub fn find_column(&self, name: &str) -> Option<&ViewColumn> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn scalar_columns(&self) -> impl Iterator<Item = &ViewColumn> {
        self.columns.iter().filter(|c| !c.column_type.is_set())
    }

    pub fn set_columns(&self) -> impl Iterator<Item = &ViewColumn> {
        self.columns.iter().filter(|c| c.column_type.is_set())
    }

    pub fn has_type(&self, type_iri: &str) -> bool {
        self.types.iter().any(|t| t == type_iri)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewsConfig {
    pub views: Vec<ViewDefinition>,
}

impl ViewsConfig {
    pub fn new(views: Vec<ViewDefinition>) -> Self {
        Self { views }
    }

    /// Load and validate a views file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: ViewsConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Case-insensitive lookup
    pub fn view(&self, name: &str) -> Option<&ViewDefinition> {
        self.views.iter().find(|v| v.name.eq_ignore_ascii_case(name))
    }

    /// Views projecting entities of `type_iri`
    pub fn views_for_type<'a>(&'a self, type_iri: &'a str) -> impl Iterator<Item = &'a ViewDefinition> {
        self.views.iter().filter(move |v| v.has_type(type_iri))
    }

    pub fn validate(&self) -> Result<()> {
        let identifier = Regex::new(r"^[A-Za-z][A-Za-z0-9]*$")
            .map_err(|e| Error::Config(e.to_string()))?;
        let mut names = HashSet::new();
        for view in &self.views {
            if !identifier.is_match(&view.name) {
                return Err(Error::Config(format!(
                    "Invalid view name '{}': use letters and digits only",
                    view.name
                )));
            }
            if !names.insert(view.name.to_lowercase()) {
                return Err(Error::Config(format!("Duplicate view '{}'", view.name)));
            }
            if view.types.is_empty() {
                return Err(Error::Config(format!("View '{}' has no types", view.name)));
            }
            for type_iri in &view.types {
                check_iri(type_iri, &view.name)?;
            }
            self.validate_columns(view, &identifier)?;
        }
        for view in &self.views {
            self.validate_joins(view)?;
        }
        check_object_names(self)
    }

    fn validate_columns(&self, view: &ViewDefinition, identifier: &Regex) -> Result<()> {
        let mut columns = HashSet::new();
        for column in &view.columns {
            if !identifier.is_match(&column.name) {
                return Err(Error::Config(format!(
                    "Invalid column name '{}' in view '{}': use letters and digits only",
                    column.name, view.name
                )));
            }
            let lower = column.name.to_lowercase();
            if BUILT_IN_COLUMNS.contains(&lower.as_str())
                || (view.is_resource_view() && lower == COLLECTION_COLUMN)
            {
                return Err(Error::Config(format!(
                    "Column '{}' of view '{}' redefines a built-in column",
                    column.name, view.name
                )));
            }
            if view.is_resource_view() && column.column_type.is_set() {
                return Err(Error::Config(format!(
                    "Column '{}': {} columns are not supported on the {} view",
                    column.name, column.column_type, RESOURCE_VIEW
                )));
            }
            if !columns.insert(lower) {
                return Err(Error::Config(format!(
                    "Duplicate column '{}' in view '{}'",
                    column.name, view.name
                )));
            }
            if column.source.split_whitespace().next().is_none() {
                return Err(Error::Config(format!(
                    "Column '{}' of view '{}' has no source",
                    column.name, view.name
                )));
            }
            for predicate in column.source.split_whitespace() {
                check_iri(predicate, &view.name)?;
            }
        }
        Ok(())
    }

    fn validate_joins(&self, view: &ViewDefinition) -> Result<()> {
        let mut targets = HashSet::new();
        for join in &view.join {
            let target = self.view(&join.view).ok_or_else(|| {
                Error::Config(format!("View '{}' joins unknown view '{}'", view.name, join.view))
            })?;
            if target.name.eq_ignore_ascii_case(&view.name) {
                return Err(Error::Config(format!("View '{}' cannot join itself", view.name)));
            }
            if !targets.insert(target.name.to_lowercase()) {
                return Err(Error::Config(format!(
                    "View '{}' joins '{}' more than once",
                    view.name, join.view
                )));
            }
            check_iri(&join.on, &view.name)?;
            for column in &join.include {
                let known = BUILT_IN_COLUMNS.contains(&column.to_lowercase().as_str())
                    || target.find_column(column).is_some();
                if !known {
                    return Err(Error::Config(format!(
                        "Join of '{}' to '{}' includes unknown column '{}'",
                        view.name, target.name, column
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_iri(iri: &str, view: &str) -> Result<()> {
    NamedNode::new(iri)
        .map(|_| ())
        .map_err(|e| Error::Config(format!("Invalid IRI '{}' in view '{}': {}", iri, view, e)))
}
