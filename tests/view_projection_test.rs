//! View Projection Integration Tests
//!
//! Writes go through the batch scheduler into the in-memory store; the commit pipeline projects
//! the touched entities into a SQLite database, which is then inspected directly and through
//! the query reader.

use metagraph::core::vocab::{XSD_BOOLEAN, XSD_DATE_TIME, XSD_INTEGER};
use metagraph::core::{vocab, CallerContext, Statement};
use metagraph::store::{MemoryGraphStore, Partition};
use metagraph::transactions::{BatchCommitScheduler, CommitPipeline};
use metagraph::views::{
    ColumnType, JoinView, Value, ViewColumn, ViewDefinition, ViewFilter, ViewProjection,
    ViewStoreReader, ViewsConfig,
};
use metagraph::Error;
use oxigraph::model::{Literal, NamedNode, Term};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const ONTOLOGY: &str = "https://example.org/o#";
const RESOURCE_ROOT: &str = "http://localhost/api/webdav/";

fn ex(name: &str) -> String {
    format!("{}{}", ONTOLOGY, name)
}

fn iri(value: &str) -> NamedNode {
    NamedNode::new(value).unwrap()
}

fn study(id: &str) -> NamedNode {
    iri(&format!("https://example.org/study/{}", id))
}

fn sample(id: &str) -> NamedNode {
    iri(&format!("https://example.org/sample/{}", id))
}

fn typed(value: &str, datatype: &str) -> Term {
    Term::Literal(Literal::new_typed_literal(value, iri(datatype)))
}

fn text(value: &str) -> Term {
    Term::Literal(Literal::new_simple_literal(value))
}

fn st(subject: &NamedNode, predicate: &str, object: impl Into<Term>) -> Statement {
    Statement::in_default_graph(subject.clone(), iri(predicate), object)
}

fn views() -> ViewsConfig {
    ViewsConfig::new(vec![
        ViewDefinition::new("Study", &[&ex("Study")])
            .column(ViewColumn::new("phase", ColumnType::Number, &ex("phase")))
            .column(ViewColumn::new("startDate", ColumnType::Date, &ex("startDate")))
            .column(ViewColumn::new("active", ColumnType::Boolean, &ex("active")))
            .column(ViewColumn::new("treatment", ColumnType::Set, &ex("treatment")))
            .column(ViewColumn::new("disease", ColumnType::TermSet, &ex("disease")).with_rdf_type(&ex("Disease")))
            .joined(JoinView::new("Sample", &ex("study")).reversed().including(&["kind"])),
        ViewDefinition::new("Sample", &[&ex("Sample")])
            .column(ViewColumn::new("kind", ColumnType::Text, &ex("kind")))
            .joined(JoinView::new("Study", &ex("study")).including(&["phase", "treatment"])),
        ViewDefinition::new("Resource", &[&ex("File")])
            .column(ViewColumn::new("size", ColumnType::Number, &ex("size"))),
    ])
}

struct Fixture {
    store: Arc<MemoryGraphStore>,
    scheduler: BatchCommitScheduler,
    projection: Arc<ViewProjection>,
    db: PathBuf,
    _dir: tempfile::TempDir,
}

fn fixture_with(partition: Partition) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("views.db");
    let store = Arc::new(MemoryGraphStore::with_partition(partition));
    let projection = Arc::new(ViewProjection::open(&db, views(), 2, RESOURCE_ROOT).unwrap());
    let pipeline = Arc::new(CommitPipeline::new().with_projection(projection.clone()));
    let scheduler = BatchCommitScheduler::new(store.clone(), pipeline).unwrap();
    Fixture { store, scheduler, projection, db, _dir: dir }
}

fn fixture() -> Fixture {
    fixture_with(Partition::Primary)
}

impl Fixture {
    fn add(&self, statements: Vec<Statement>) {
        self.scheduler
            .submit_write(CallerContext::system(), move |ctx| {
                for statement in &statements {
                    ctx.add(statement)?;
                }
                Ok(())
            })
            .unwrap();
    }

    fn remove(&self, statements: Vec<Statement>) {
        self.scheduler
            .submit_write(CallerContext::system(), move |ctx| {
                for statement in &statements {
                    ctx.remove(statement)?;
                }
                Ok(())
            })
            .unwrap();
    }

    fn reader(&self) -> ViewStoreReader {
        ViewStoreReader::open(&self.db, views(), Duration::from_secs(10), Duration::from_secs(10)).unwrap()
    }

    fn add_study(&self, id: &str, label: &str, phase: i64) {
        let s = study(id);
        self.add(vec![
            st(&s, vocab::RDF_TYPE, iri(&ex("Study"))),
            st(&s, vocab::RDFS_LABEL, text(label)),
            st(&s, &ex("phase"), typed(&phase.to_string(), XSD_INTEGER)),
        ]);
    }
}

fn cell(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn rows(db: &Path, sql: &str) -> Vec<Vec<String>> {
    let conn = Connection::open(db).unwrap();
    let mut statement = conn.prepare(sql).unwrap();
    let columns = statement.column_count();
    let mut rows: Vec<Vec<String>> = statement
        .query_map([], |row| {
            (0..columns)
                .map(|i| Ok(cell(row.get_ref(i)?)))
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .unwrap()
        .map(|row| row.unwrap())
        .collect();
    rows.sort();
    rows
}

fn strings(db: &Path, sql: &str) -> Vec<String> {
    let conn = Connection::open(db).unwrap();
    let mut statement = conn.prepare(sql).unwrap();
    let values = statement.query_map([], |row| row.get::<_, String>(0)).unwrap();
    values.map(|v| v.unwrap()).collect()
}

#[test]
fn test_removed_set_value_disappears_from_property_table() {
    let f = fixture();
    let e = study("e");
    f.add(vec![
        st(&e, vocab::RDF_TYPE, iri(&ex("Study"))),
        st(&e, &ex("treatment"), text("drugX")),
        st(&e, &ex("treatment"), text("drugY")),
    ]);
    let sql = "select study_id, treatment from study_treatment order by treatment";
    assert_eq!(strings(&f.db, "select treatment from study_treatment order by treatment"), vec!["drugX", "drugY"]);

    f.remove(vec![st(&e, &ex("treatment"), text("drugX"))]);
    let remaining = rows(&f.db, sql);
    assert_eq!(remaining, vec![vec![e.as_str().to_string(), "drugY".to_string()]]);

    // updating again without graph changes leaves the table as it is
    f.projection.update_subjects(f.store.as_ref(), [&e]).unwrap();
    f.projection.update_subjects(f.store.as_ref(), [&e]).unwrap();
    assert_eq!(rows(&f.db, sql), remaining);
}

#[test]
fn test_row_values_are_typed() {
    let f = fixture();
    let s = study("s1");
    let flu = iri("https://example.org/disease/flu");
    f.add(vec![
        st(&s, vocab::RDF_TYPE, iri(&ex("Study"))),
        st(&s, vocab::RDFS_LABEL, text("Study 1")),
        st(&s, &ex("phase"), typed("2", XSD_INTEGER)),
        st(&s, &ex("startDate"), typed("2024-01-01T00:00:00Z", XSD_DATE_TIME)),
        st(&s, &ex("active"), typed("true", XSD_BOOLEAN)),
        st(&s, &ex("treatment"), text("drugX")),
        st(&s, &ex("disease"), flu.clone()),
        st(&flu, vocab::RDFS_LABEL, text("Flu")),
    ]);

    let result = f.reader().retrieve_rows("Study", &[], 0, 10, false).unwrap();
    assert!(!result.timeout);
    assert_eq!(result.rows.len(), 1);
    let row = &result.rows[0];
    assert_eq!(row["Study"][0].label, "Study 1");
    assert_eq!(row["Study"][0].value, Value::Text(s.as_str().to_string()));
    assert_eq!(row["Study_phase"][0].value, Value::Number(2.0));
    assert_eq!(row["Study_startDate"][0].label, "2024-01-01T00:00:00Z");
    assert_eq!(row["Study_active"][0].value, Value::Bool(true));
    assert_eq!(row["Study_treatment"][0].label, "drugX");
    assert_eq!(row["Study_disease"][0].label, "Flu");
    assert_eq!(row["Study_disease"][0].value, Value::Text(flu.as_str().to_string()));
}

#[test]
fn test_joined_views() {
    let f = fixture();
    f.add_study("s1", "Study 1", 2);
    f.add(vec![st(&study("s1"), &ex("treatment"), text("drugY"))]);
    let x = sample("x1");
    f.add(vec![
        st(&x, vocab::RDF_TYPE, iri(&ex("Sample"))),
        st(&x, vocab::RDFS_LABEL, text("Sample 1")),
        st(&x, &ex("kind"), text("blood")),
        st(&x, &ex("study"), study("s1")),
    ]);
    assert_eq!(rows(&f.db, "select * from sample_study").len(), 1);

    let reader = f.reader();
    let result = reader.retrieve_rows("Sample", &[], 0, 10, true).unwrap();
    let row = &result.rows[0];
    assert_eq!(row["Sample_kind"][0].label, "blood");
    assert_eq!(row["Study"][0].label, "Study 1");
    assert_eq!(row["Study_phase"][0].value, Value::Number(2.0));
    assert_eq!(row["Study_treatment"][0].label, "drugY");

    let without_joins = reader.retrieve_rows("Sample", &[], 0, 10, false).unwrap();
    assert!(!without_joins.rows[0].contains_key("Study"));

    // filters on the joined view
    let phase = |min: f64| vec![ViewFilter::range("Study_phase", Some(Value::Number(min)), None)];
    assert_eq!(reader.count_rows("Sample", &phase(2.0)).unwrap().count, 1);
    assert_eq!(reader.count_rows("Sample", &phase(3.0)).unwrap().count, 0);
    let by_study = [ViewFilter::values("Study", &[study("s1").as_str()])];
    assert_eq!(reader.count_rows("Sample", &by_study).unwrap().count, 1);

    // unlinking removes the join row
    f.remove(vec![st(&x, &ex("study"), study("s1"))]);
    assert!(rows(&f.db, "select * from sample_study").is_empty());
    assert_eq!(reader.count_rows("Sample", &by_study).unwrap().count, 0);
}

#[test]
fn test_reverse_join_shares_the_join_table() {
    let f = fixture();
    f.add_study("s1", "Study 1", 1);
    let (s1, x) = (study("s1"), sample("x1"));
    f.add(vec![
        st(&x, vocab::RDF_TYPE, iri(&ex("Sample"))),
        st(&x, vocab::RDFS_LABEL, text("Sample 1")),
        st(&x, &ex("kind"), text("blood")),
        st(&x, &ex("study"), s1.clone()),
    ]);
    let link = vec![vec![x.as_str().to_string(), s1.as_str().to_string()]];
    assert_eq!(rows(&f.db, "select sample_id, study_id from sample_study"), link);
    assert_eq!(
        rows(&f.db, "select study_id, sample_id, label, kind from mv_study_join_sample"),
        vec![vec![s1.as_str().to_string(), x.as_str().to_string(), "Sample 1".to_string(), "blood".to_string()]]
    );

    let reader = f.reader();
    let result = reader.retrieve_rows("Study", &[], 0, 10, true).unwrap();
    assert_eq!(result.rows[0]["Sample"][0].label, "Sample 1");
    assert_eq!(result.rows[0]["Sample_kind"][0].label, "blood");
    let by_sample = [ViewFilter::values("Sample", &[x.as_str()])];
    assert_eq!(reader.count_rows("Study", &by_sample).unwrap().count, 1);

    // syncing the study side finds the same link
    f.projection.update_subjects(f.store.as_ref(), [&s1]).unwrap();
    assert_eq!(rows(&f.db, "select sample_id, study_id from sample_study"), link);

    // a second sample linked in a commit that also touches the study
    let y = sample("y1");
    f.add(vec![
        st(&y, vocab::RDF_TYPE, iri(&ex("Sample"))),
        st(&y, &ex("study"), s1.clone()),
        st(&s1, &ex("phase"), typed("2", XSD_INTEGER)),
    ]);
    assert_eq!(rows(&f.db, "select * from sample_study").len(), 2);
    assert_eq!(reader.count_rows("Study", &[ViewFilter::values("Sample", &[y.as_str()])]).unwrap().count, 1);

    let total = f.projection.recreate_all(f.store.as_ref()).unwrap();
    assert_eq!(total, 3);
    assert_eq!(rows(&f.db, "select * from sample_study").len(), 2);
}

#[test]
fn test_join_materialization_is_capped_and_refreshed() {
    let f = fixture();
    for (id, label) in [("a", "A"), ("b", "B"), ("c", "C")] {
        f.add_study(id, label, 1);
    }
    let x = sample("x1");
    f.add(vec![
        st(&x, vocab::RDF_TYPE, iri(&ex("Sample"))),
        st(&x, &ex("study"), study("a")),
        st(&x, &ex("study"), study("b")),
        st(&x, &ex("study"), study("c")),
    ]);
    assert_eq!(rows(&f.db, "select * from sample_study").len(), 3);
    // at most two linked entities are materialized per sample
    assert_eq!(rows(&f.db, "select * from mv_sample_join_study").len(), 2);

    f.remove(vec![st(&study("a"), vocab::RDFS_LABEL, text("A"))]);
    f.add(vec![st(&study("a"), vocab::RDFS_LABEL, text("A2"))]);
    assert_eq!(
        strings(&f.db, "select label from mv_sample_join_study order by study_id"),
        vec!["A2", "B"]
    );
}

#[test]
fn test_deleted_entity_leaves_the_view() {
    let f = fixture();
    f.add_study("s1", "Study 1", 1);
    f.add_study("s2", "Study 2", 1);
    let reader = f.reader();
    assert_eq!(reader.count_rows("Study", &[]).unwrap().count, 2);

    f.add(vec![st(&study("s1"), vocab::FS_DATE_DELETED, typed("2024-05-01T00:00:00Z", XSD_DATE_TIME))]);
    assert_eq!(reader.count_rows("Study", &[]).unwrap().count, 1);
    let result = reader.retrieve_rows("Study", &[], 0, 10, false).unwrap();
    assert_eq!(result.rows[0]["Study"][0].label, "Study 2");
}

#[test]
fn test_bulk_rebuild_matches_incremental_updates() {
    let f = fixture();
    f.add_study("s1", "Study 1", 1);
    f.add_study("s2", "Study 2", 3);
    let flu = iri("https://example.org/disease/flu");
    f.add(vec![
        st(&study("s1"), &ex("treatment"), text("drugX")),
        st(&study("s1"), &ex("disease"), flu.clone()),
        st(&flu, vocab::RDFS_LABEL, text("Flu")),
        st(&sample("x1"), vocab::RDF_TYPE, iri(&ex("Sample"))),
        st(&sample("x1"), &ex("study"), study("s2")),
        st(&sample("x1"), &ex("kind"), text("tissue")),
    ]);

    let tables = [
        "study",
        "study_treatment",
        "study_disease",
        "sample",
        "sample_study",
        "resource",
        "mv_study",
        "mv_study_join_sample",
        "mv_sample_join_study",
    ];
    let snapshot = |db: &Path| -> Vec<Vec<Vec<String>>> {
        tables.iter().map(|t| rows(db, &format!("select * from {}", t))).collect()
    };
    let incremental = snapshot(&f.db);
    let total = f.projection.recreate_all(f.store.as_ref()).unwrap();
    assert_eq!(total, 3);
    assert_eq!(snapshot(&f.db), incremental);
}

#[test]
fn test_pagination() {
    let f = fixture();
    let mut statements = Vec::new();
    for i in 1..=7 {
        let s = study(&format!("s{:02}", i));
        statements.push(st(&s, vocab::RDF_TYPE, iri(&ex("Study"))));
        statements.push(st(&s, vocab::RDFS_LABEL, text(&format!("Study {}", i))));
    }
    f.add(statements);

    let reader = f.reader();
    let expected = [(1, 3, true), (2, 3, true), (3, 1, false), (4, 0, false)];
    for (page, count, has_next) in expected {
        let result = reader.retrieve_page("Study", &[], page, 3, false).unwrap();
        assert_eq!(result.rows.len(), count, "page {}", page);
        assert_eq!(result.has_next, has_next, "page {}", page);
        assert!(!result.timeout);
    }
    let first = reader.retrieve_page("Study", &[], 1, 3, false).unwrap();
    assert_eq!(first.rows[0]["Study"][0].label, "Study 1");
    let exact = reader.retrieve_page("Study", &[], 1, 7, false).unwrap();
    assert_eq!(exact.rows.len(), 7);
    assert!(!exact.has_next);
    assert_eq!(reader.count_rows("Study", &[]).unwrap().count, 7);

    // pages and sizes beyond any row count
    let far = reader.retrieve_page("Study", &[], usize::MAX, 10, false).unwrap();
    assert!(far.rows.is_empty());
    assert!(!far.has_next);
    let huge = reader.retrieve_page("Study", &[], 2, usize::MAX, false).unwrap();
    assert!(huge.rows.is_empty());
    let all = reader.retrieve_rows("Study", &[], 0, usize::MAX, false).unwrap();
    assert_eq!(all.rows.len(), 7);
    assert!(reader.retrieve_rows("Study", &[], usize::MAX, usize::MAX, false).unwrap().rows.is_empty());
}

#[test]
fn test_filters() {
    let f = fixture();
    f.add_study("s1", "100% pure", 1);
    f.add_study("s2", "1000 samples", 2);
    f.add_study("s3", "Other", 3);
    let flu = iri("https://example.org/disease/flu");
    f.add(vec![
        st(&study("s1"), &ex("treatment"), text("drugX")),
        st(&study("s2"), &ex("treatment"), text("drugY")),
        st(&study("s2"), &ex("disease"), flu.clone()),
        st(&flu, vocab::RDFS_LABEL, text("Flu")),
        st(&study("s3"), &ex("active"), typed("true", XSD_BOOLEAN)),
    ]);
    let reader = f.reader();
    let count = |filters: Vec<ViewFilter>| reader.count_rows("Study", &filters).unwrap().count;

    assert_eq!(count(vec![ViewFilter::prefix("Study", "100%")]), 1);
    assert_eq!(count(vec![ViewFilter::prefix("Study", "100")]), 2);
    assert_eq!(count(vec![ViewFilter::prefix("Study", "oth")]), 1);
    assert_eq!(count(vec![ViewFilter::values("Study_treatment", &["drugY"])]), 1);
    assert_eq!(count(vec![ViewFilter::values("Study_disease", &[flu.as_str()])]), 1);
    assert_eq!(count(vec![ViewFilter::values("Study_disease", &["https://example.org/unknown"])]), 0);
    assert_eq!(
        count(vec![ViewFilter::range("Study_phase", Some(Value::Number(2.0)), Some(Value::Number(3.0)))]),
        2
    );
    assert_eq!(
        count(vec![ViewFilter { field: "Study_active".into(), values: vec![Value::Bool(true)], ..ViewFilter::default() }]),
        1
    );
    assert_eq!(
        count(vec![
            ViewFilter::range("Study_phase", Some(Value::Number(2.0)), None),
            ViewFilter::prefix("Study_label", "1000"),
        ]),
        1
    );

    let unknown = reader.count_rows("Study", &[ViewFilter::values("Study_nothing", &["x"])]);
    assert!(matches!(unknown, Err(Error::InvalidRequest(_))));
    assert!(matches!(reader.count_rows("Nothing", &[]), Err(Error::InvalidRequest(_))));
}

#[test]
fn test_aggregate() {
    let f = fixture();
    let reader = f.reader();
    assert_eq!(reader.aggregate("Study", "phase").unwrap().range, None);

    f.add_study("s1", "Study 1", 4);
    f.add_study("s2", "Study 2", 2);
    f.add(vec![
        st(&study("s1"), &ex("startDate"), typed("2023-03-01T00:00:00Z", XSD_DATE_TIME)),
        st(&study("s2"), &ex("startDate"), typed("2024-06-01T00:00:00Z", XSD_DATE_TIME)),
    ]);
    let phase = reader.aggregate("Study", "phase").unwrap();
    assert!(!phase.timeout);
    let range = phase.range.unwrap();
    assert_eq!((range.min, range.max), (Value::Number(2.0), Value::Number(4.0)));

    let dates = reader.aggregate("Study", "startDate").unwrap().range.unwrap();
    assert_eq!(dates.min, Value::Text("2023-03-01T00:00:00Z".into()));
    assert_eq!(dates.max, Value::Text("2024-06-01T00:00:00Z".into()));

    assert!(matches!(reader.aggregate("Study", "treatment"), Err(Error::InvalidRequest(_))));
}

#[test]
fn test_failing_entity_does_not_block_the_commit() {
    let f = fixture();
    let inside = iri(&format!("{}coll%201/dir/a.txt", RESOURCE_ROOT));
    let outside = iri("http://elsewhere.org/b.txt");
    f.add(vec![
        st(&inside, vocab::RDF_TYPE, iri(&ex("File"))),
        st(&inside, &ex("size"), typed("10", XSD_INTEGER)),
        st(&outside, vocab::RDF_TYPE, iri(&ex("File"))),
    ]);
    assert_eq!(f.store.len(), 3);
    assert_eq!(strings(&f.db, "select id from resource"), vec![inside.as_str().to_string()]);

    let result = f.reader().retrieve_rows("Resource", &[], 0, 10, false).unwrap();
    assert_eq!(result.rows[0]["Resource_collection"][0].label, "coll 1");
    let filter = [ViewFilter::values("Resource_collection", &["coll 1"])];
    assert_eq!(f.reader().count_rows("Resource", &filter).unwrap().count, 1);
}

#[test]
fn test_secondary_partition_is_not_projected() {
    let f = fixture_with(Partition::Secondary);
    f.add_study("s1", "Study 1", 1);
    assert_eq!(f.store.len(), 3);
    assert!(strings(&f.db, "select id from study").is_empty());
}

#[test]
fn test_invalid_configuration_is_rejected_before_any_change() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("views.db");
    let invalid = ViewsConfig::new(vec![
        ViewDefinition::new("Study", &[&ex("Study")]),
        ViewDefinition::new("Resource", &[&ex("File")])
            .column(ViewColumn::new("keywords", ColumnType::Set, &ex("keyword"))),
    ]);
    assert!(matches!(ViewProjection::open(&db, invalid, 50, RESOURCE_ROOT), Err(Error::Config(_))));
    assert!(strings(&db, "select name from sqlite_master where type = 'table'").is_empty());

    // a view named after the label table
    let clashing = ViewsConfig::new(vec![ViewDefinition::new("Label", &[&ex("Label")])]);
    assert!(matches!(ViewProjection::open(&db, clashing, 50, RESOURCE_ROOT), Err(Error::Config(_))));
    assert!(strings(&db, "select name from sqlite_master").is_empty());

    ViewProjection::open(&db, views(), 50, RESOURCE_ROOT).unwrap();
    let mut retyped = views();
    retyped.views[0].columns[0].column_type = ColumnType::Text;
    assert!(matches!(ViewProjection::open(&db, retyped, 50, RESOURCE_ROOT), Err(Error::Config(_))));

    let mut extended = views();
    extended.views[0].columns.push(ViewColumn::new("acronym", ColumnType::Text, &ex("acronym")));
    ViewProjection::open(&db, extended, 50, RESOURCE_ROOT).unwrap();
    let names: BTreeSet<String> = strings(&db, "select name from pragma_table_info('study')").into_iter().collect();
    assert!(names.contains("acronym"));
}
