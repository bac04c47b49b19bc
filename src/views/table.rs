//! Physical relational schema derived from the view definitions.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::views::definition::{ColumnType, ViewDefinition, ViewsConfig, COLLECTION_COLUMN};
use crate::views::materialized::MaterializedViews;

/// Name of the table mapping term identifiers to labels
pub const LABEL_TABLE: &str = "label";

/// Id column referencing a row of `view` from another table
pub fn id_column(view: &str) -> String {
    format!("{}_id", view.to_lowercase())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnDefinition {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self { name: name.to_lowercase(), column_type }
    }

    pub fn sql_type(&self) -> &'static str {
        self.column_type.sql_type()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub primary_key: Vec<String>,
    /// Single-column secondary indexes
    pub indexes: Vec<String>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn create_sql(&self) -> String {
        let columns: Vec<String> =
            self.columns.iter().map(|c| format!("{} {}", c.name, c.sql_type())).collect();
        format!(
            "create table {} ( {}, primary key ( {} ) )",
            self.name,
            columns.join(", "),
            self.primary_key.join(", ")
        )
    }

    pub fn index_sql(&self) -> Vec<String> {
        self.indexes
            .iter()
            .map(|column| {
                format!("create index if not exists {0}_{1}_idx on {0} ( {1} )", self.name, column)
            })
            .collect()
    }
}

/// Join table linking a view to a joined view
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinTable {
    pub table: Table,
    /// Column holding the id of the row of the owning view
    pub own_column: String,
    /// Column holding the id of the row of the joined view
    pub other_column: String,
}

/// All tables backing one view
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewTables {
    pub main: Table,
    /// keyed by lowercase column name
    pub properties: BTreeMap<String, Table>,
    /// keyed by lowercase joined view name
    pub joins: BTreeMap<String, JoinTable>,
}

impl ViewTables {
    pub fn build(view: &ViewDefinition) -> Self {
        let mut columns = vec![
            ColumnDefinition::new("id", ColumnType::Identifier),
            ColumnDefinition::new("label", ColumnType::Text),
        ];
        if view.is_resource_view() {
            columns.push(ColumnDefinition::new(COLLECTION_COLUMN, ColumnType::Text));
        }
        columns.extend(view.scalar_columns().map(|c| ColumnDefinition::new(&c.name, c.column_type)));
        let main = Table {
            name: view.table_name(),
            columns,
            primary_key: vec!["id".to_string()],
            indexes: Vec::new(),
        };

        let properties = view
            .set_columns()
            .map(|column| {
                let id = id_column(&view.name);
                let value = column.sql_name();
                let table = Table {
                    name: format!("{}_{}", view.table_name(), value),
                    columns: vec![
                        ColumnDefinition::new(&id, ColumnType::Identifier),
                        ColumnDefinition::new(&value, column.column_type),
                    ],
                    primary_key: vec![id.clone(), value.clone()],
                    indexes: vec![id],
                };
                (value, table)
            })
            .collect();

        let joins = view
            .join
            .iter()
            .map(|join| {
                let (left, right) =
                    if join.reverse { (&join.view, &view.name) } else { (&view.name, &join.view) };
                let (left_id, right_id) = (id_column(left), id_column(right));
                let table = Table {
                    name: format!("{}_{}", left.to_lowercase(), right.to_lowercase()),
                    columns: vec![
                        ColumnDefinition::new(&left_id, ColumnType::Identifier),
                        ColumnDefinition::new(&right_id, ColumnType::Identifier),
                    ],
                    primary_key: vec![left_id.clone(), right_id.clone()],
                    indexes: vec![left_id, right_id],
                };
                let join_table = JoinTable {
                    table,
                    own_column: id_column(&view.name),
                    other_column: id_column(&join.view),
                };
                (join.view.to_lowercase(), join_table)
            })
            .collect();

        Self { main, properties, joins }
    }

    pub fn all_tables(&self) -> Vec<&Table> {
        let mut tables = vec![&self.main];
        tables.extend(self.properties.values());
        tables.extend(self.joins.values().map(|j| &j.table));
        tables
    }
}

/// The tables of every configured view, keyed by lowercase view name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaModel {
    pub views: BTreeMap<String, ViewTables>,
}

impl SchemaModel {
    pub fn build(config: &ViewsConfig) -> Self {
        let views = config
            .views
            .iter()
            .map(|view| (view.name.to_lowercase(), ViewTables::build(view)))
            .collect();
        Self { views }
    }

    pub fn view(&self, name: &str) -> Option<&ViewTables> {
        self.views.get(&name.to_lowercase())
    }

    /// Every table, each once; two views joining each other share a join table
    pub fn tables(&self) -> Vec<&Table> {
        let mut tables: Vec<&Table> = Vec::new();
        for view in self.views.values() {
            for table in view.all_tables() {
                if !tables.iter().any(|t| t.name == table.name) {
                    tables.push(table);
                }
            }
        }
        tables
    }

    pub fn label_table() -> Table {
        Table {
            name: LABEL_TABLE.to_string(),
            columns: vec![
                ColumnDefinition::new("id", ColumnType::Identifier),
                ColumnDefinition::new("type", ColumnType::Text),
                ColumnDefinition::new("label", ColumnType::Text),
            ],
            primary_key: vec!["id".to_string()],
            indexes: vec!["label".to_string()],
        }
    }
}

/// Owners of the database object names a configuration produces
#[derive(Default)]
struct NameClaims {
    owners: HashMap<String, String>,
}

impl NameClaims {
    fn claim(&mut self, name: String, owner: String) -> Result<()> {
        if let Some(existing) = self.owners.get(&name) {
            if *existing != owner {
                return Err(Error::Config(format!(
                    "Database name '{}' of {} clashes with {}",
                    name, owner, existing
                )));
            }
            return Ok(());
        }
        self.owners.insert(name, owner);
        Ok(())
    }

    fn claim_table(&mut self, table: &Table, owner: String) -> Result<()> {
        for column in &table.indexes {
            self.claim(format!("{}_{}_idx", table.name, column), format!("an index of {}", owner))?;
        }
        self.claim(table.name.clone(), owner)
    }
}

/// Check that the tables, views and indexes a configuration produces have distinct names. The
/// only shared object is a join table declared from both sides over the same predicate.
pub fn check_object_names(config: &ViewsConfig) -> Result<()> {
    let model = SchemaModel::build(config);
    let mut claims = NameClaims::default();
    claims.claim_table(&SchemaModel::label_table(), "the label table".to_string())?;
    for view in &config.views {
        let Some(tables) = model.view(&view.name) else {
            continue;
        };
        claims.claim_table(&tables.main, format!("view '{}'", view.name))?;
        for (column, table) in &tables.properties {
            claims.claim_table(table, format!("column '{}' of view '{}'", column, view.name))?;
        }
        for join in &view.join {
            if let Some(join_table) = tables.joins.get(&join.view.to_lowercase()) {
                claims.claim_table(&join_table.table, format!("the join table over <{}>", join.on))?;
            }
        }
    }
    for mv in MaterializedViews::build(config, &model, 1).all() {
        let owner = format!("materialized view '{}'", mv.name);
        claims.claim(format!("{}_{}_idx", mv.name, mv.id_column()), format!("an index of {}", owner))?;
        claims.claim(format!("{}_key", mv.name), owner.clone())?;
        claims.claim(mv.definition_name(), owner.clone())?;
        claims.claim(mv.name.clone(), owner)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::views::definition::{JoinView, ViewColumn};

    fn config() -> ViewsConfig {
        ViewsConfig::new(vec![
            ViewDefinition::new("Study", &["https://example.org/o#Study"])
                .column(ViewColumn::new("phase", ColumnType::Number, "https://example.org/o#phase"))
                .column(ViewColumn::new("Treatment", ColumnType::TermSet, "https://example.org/o#treatment")),
            ViewDefinition::new("Sample", &["https://example.org/o#Sample"])
                .joined(JoinView::new("Study", "https://example.org/o#study")),
            ViewDefinition::new("Resource", &["https://example.org/o#File"]),
        ])
    }

    #[test]
    fn test_table_naming() {
        let model = SchemaModel::build(&config());
        let study = model.view("Study").unwrap();
        assert_eq!(study.main.name, "study");
        let names: Vec<&str> = study.main.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "label", "phase"]);

        let treatment = &study.properties["treatment"];
        assert_eq!(treatment.name, "study_treatment");
        assert_eq!(treatment.primary_key, vec!["study_id", "treatment"]);

        let join = &model.view("sample").unwrap().joins["study"];
        assert_eq!(join.table.name, "sample_study");
        assert_eq!(join.own_column, "sample_id");
        assert_eq!(join.other_column, "study_id");

        assert!(model.view("resource").unwrap().main.column("collection").is_some());
    }

    #[test]
    fn test_reverse_join_swaps_sides() {
        let config = ViewsConfig::new(vec![
            ViewDefinition::new("Study", &["https://example.org/o#Study"])
                .joined(JoinView::new("Sample", "https://example.org/o#study").reversed()),
            ViewDefinition::new("Sample", &["https://example.org/o#Sample"]),
        ]);
        let model = SchemaModel::build(&config);
        let join = &model.view("study").unwrap().joins["sample"];
        assert_eq!(join.table.name, "sample_study");
        assert_eq!(join.own_column, "study_id");
        assert_eq!(
            join.table.create_sql(),
            "create table sample_study ( sample_id text, study_id text, primary key ( sample_id, study_id ) )"
        );
    }
}
