//! Relational projection of the graph: view definitions, the tables backing them, the commit-time
//! updater and the query reader

pub mod accessor;
pub mod client;
pub mod definition;
pub mod materialized;
pub mod projection;
pub mod reader;
pub mod schema;
pub mod table;
pub mod updater;

pub use accessor::{AccessorTable, ColumnAccessor, Value, ValueDto, ViewRow};
pub use client::ViewStoreClient;
pub use definition::{ColumnType, JoinView, ViewColumn, ViewDefinition, ViewsConfig};
pub use materialized::MaterializedViews;
pub use projection::ViewProjection;
pub use reader::{AggregateResult, CountResult, Range, RowsResult, ViewFilter, ViewPage, ViewStoreReader};
pub use schema::ensure_schema;
pub use updater::ViewUpdater;
