use pretty_assertions::assert_eq;
use rusqlite::{types::Value, Connection};

use crate::{
    compile::{compile, CompileOptions, CompiledFormula},
    dialect::Dialect,
    error::{Error, Result},
    parser::parse,
    schema::{
        Catalog, Field, LinkOptions, LookupOptions, Relationship, SchemaCatalog, TableSchema, ValueKind,
        RECORD_ID,
    },
    select::{QueryOptions, RecordQuery},
    translate::Mode,
};

fn numbers() -> TableSchema {
    TableSchema::new("tblNumbers", "numbers")
        .with_field(Field::number("n1", "n1"))
        .with_field(Field::number("n2", "n2"))
        .with_field(Field::text("s", "s"))
        .with_field(Field::formula("twice", "twice", ValueKind::Number, "{n1} * 2"))
}

fn translate(formula: &str) -> Result<CompiledFormula> {
    let tree = parse(formula)?;
    compile(
        &tree,
        &numbers(),
        CompileOptions::new(Dialect::Postgres, Mode::Select).with_alias("t"),
    )
}

fn sql(formula: &str) -> String {
    match translate(formula) {
        Ok(compiled) => compiled.sql,
        Err(e) => panic!("{formula}: {e}"),
    }
}

fn operands(sql: &str) -> Vec<String> {
    let inner = sql.strip_prefix('(').and_then(|s| s.strip_suffix(')')).unwrap_or(sql);
    inner
        .split(" || ")
        .map(str::to_string)
        .collect()
}

#[test]
fn number_addition() {
    assert_eq!(sql("{n1} + {n2}"), r#"("t"."n1" + "t"."n2")"#);
}

#[test]
fn text_addition_is_symmetric() {
    let left = sql("{s} + {n1}");
    let right = sql("{n1} + {s}");
    assert!(left.contains(" || "), "{left}");
    let mut reversed = operands(&right);
    reversed.reverse();
    assert_eq!(operands(&left), reversed);
    assert_eq!(sql("{s} & {n1}"), left);
}

#[test]
fn operand_order_and_dependencies() {
    let forward = sql("SUM({n1}, {n2})");
    let backward = sql("SUM({n2}, {n1})");
    let position = |sql: &str, col: &str| sql.find(&format!(r#""t"."{col}""#)).expect("column");
    assert!(position(&forward, "n1") < position(&forward, "n2"), "{forward}");
    assert!(position(&backward, "n2") < position(&backward, "n1"), "{backward}");

    let doubled = translate("{n1} + {n1}").expect("compiles");
    assert_eq!(doubled.dependencies, vec!["n1".to_string()]);
    let nested = translate("{twice} + {n2} + {n1}").expect("compiles");
    assert_eq!(nested.dependencies, vec!["n1".to_string(), "n2".to_string()]);
}

#[test]
fn compiling_is_deterministic() {
    let formula = "IF({n1} > {n2}, CONCATENATE({s}, '!'), UPPER({s})) & ROUND({twice} / 3, 2)";
    assert_eq!(sql(formula), sql(formula));
}

#[test]
fn unknown_names() {
    assert_eq!(
        translate("{unknown_field} + 1").map(|c| c.sql),
        Err(Error::FieldNotFound("unknown_field".into()))
    );
    assert_eq!(
        translate("FOO({n1})").map(|c| c.sql),
        Err(Error::UnsupportedFunction("FOO".into()))
    );
}

#[test]
fn nested_ifs_flatten() {
    let sql = sql("IF({n1} > 1, 'a', IF({n1} > 2, 'b', IF({n1} > 3, 'c', IF({n1} > 4, 'd', 'e'))))");
    assert_eq!(sql.matches("WHEN").count(), 4, "{sql}");
    assert_eq!(sql.matches("CASE").count(), 1, "{sql}");
}

fn lists() -> Catalog {
    let through_entries = |target: &str| LookupOptions::new("fldEntries", "tblEntries", target);
    Catalog::new()
        .with_table(
            TableSchema::new("tblLists", "lists")
                .with_field(Field::text("fldTitle", "title"))
                .with_field(Field::link(
                    "fldEntries",
                    "entries",
                    LinkOptions::new(Relationship::OneToMany, "tblEntries", "fldLabel")
                        .with_keys("list_id", RECORD_ID)
                        .with_order_column("position"),
                ))
                .with_field(Field::lookup(
                    "fldLabels",
                    "labels",
                    ValueKind::String,
                    true,
                    through_entries("fldLabel"),
                ))
                .with_field(Field::rollup(
                    "fldJoined",
                    "joined",
                    ValueKind::String,
                    through_entries("fldLabel"),
                    "array_join({values})",
                ))
                .with_field(Field::rollup(
                    "fldKinds",
                    "kinds",
                    ValueKind::String,
                    through_entries("fldKind"),
                    "array_unique({values})",
                )),
        )
        .with_table(
            TableSchema::new("tblEntries", "entries")
                .with_field(Field::text("fldLabel", "label"))
                .with_field(Field::text("fldKind", "kind"))
                .with_field(Field::number("fldPosition", "position")),
        )
}

fn query(conn: &Connection, sql: &str) -> Vec<Vec<Value>> {
    let mut stmt = conn.prepare(sql).unwrap_or_else(|e| panic!("{e}: {sql}"));
    let width = stmt.column_count();
    stmt.query_map([], |row| (0..width).map(|i| row.get(i)).collect())
        .expect("runs")
        .collect::<rusqlite::Result<_>>()
        .expect("rows")
}

fn text(value: &str) -> Value {
    Value::Text(value.into())
}

#[test]
fn ordered_one_to_many_rollup() {
    let catalog = lists();
    let table = catalog.table("tblLists").expect("table");
    let projection = ["fldJoined", "fldLabels", "fldKinds"];

    let sqlite = RecordQuery::new(&catalog, table, QueryOptions::new(Dialect::Sqlite))
        .to_sql(&projection)
        .expect("builds");
    let conn = Connection::open_in_memory().expect("open");
    // list 1 holds five entries whose ids run against their positions
    conn.execute_batch(
        "CREATE TABLE lists (__id INTEGER PRIMARY KEY, title TEXT);
         CREATE TABLE entries (__id INTEGER PRIMARY KEY, list_id INTEGER, position INTEGER, label TEXT, kind TEXT);
         INSERT INTO lists VALUES (1, 'one'), (2, 'two'), (3, 'three'), (4, 'four');
         INSERT INTO entries VALUES
            (1, 1, 5, 'e', 'a'),
            (2, 2, 2, 'y', 'y'),
            (3, 1, 1, 'a', 'b'),
            (4, 2, 1, 'x', 'z'),
            (5, 1, 4, 'd', 'c'),
            (6, 3, 1, 'z', 'q'),
            (7, 1, 2, 'b', 'a'),
            (8, 2, NULL, 'w', 'z'),
            (9, 1, 3, 'c', 'b');",
    )
    .expect("schema");
    assert_eq!(
        query(&conn, &format!("{sqlite} ORDER BY \"t\".\"__id\"")),
        vec![
            vec![
                text("a, b, c, d, e"),
                text(r#"["a","b","c","d","e"]"#),
                text(r#"["b","a","c"]"#),
            ],
            vec![text("w, x, y"), text(r#"["w","x","y"]"#), text(r#"["z","y"]"#)],
            vec![text("z"), text(r#"["z"]"#), text(r#"["q"]"#)],
            vec![Value::Null, Value::Null, Value::Null],
        ]
    );

    let postgres = RecordQuery::new(&catalog, table, QueryOptions::new(Dialect::Postgres))
        .to_sql(&projection)
        .expect("builds");
    let order = r#"ORDER BY "f"."position" ASC NULLS FIRST, "f"."__id" ASC"#;
    assert!(
        postgres.contains(&format!(r#"STRING_AGG(("f"."label")::text, ', ' {order})"#)),
        "{postgres}"
    );
    assert!(
        postgres.contains(&format!(r#"jsonb_agg("f"."label" {order})"#)),
        "{postgres}"
    );
    // unique kinds keep the position of their first member
    assert!(
        postgres.contains(&format!(r#"jsonb_agg("f"."kind" {order}) FILTER (WHERE "f"."kind" IS NOT NULL) AS a"#)),
        "{postgres}"
    );
    assert!(postgres.contains("jsonb_agg(e.v ORDER BY e.i)"), "{postgres}");
    assert!(!postgres.contains("DISTINCT"), "{postgres}");
    assert!(postgres.contains(r#"GROUP BY "m"."__id""#), "{postgres}");
}

fn regions() -> Catalog {
    Catalog::new()
        .with_table(
            TableSchema::new("tblOrders", "orders")
                .with_field(Field::link(
                    "fldCustomer",
                    "customer",
                    LinkOptions::new(Relationship::ManyToOne, "tblCustomers", "fldCustomerName")
                        .with_keys(RECORD_ID, "customer_id"),
                ))
                .with_field(Field::lookup(
                    "fldOrderRegion",
                    "order_region",
                    ValueKind::String,
                    false,
                    LookupOptions::new("fldCustomer", "tblCustomers", "fldRegionLabel"),
                )),
        )
        .with_table(
            TableSchema::new("tblCustomers", "customers")
                .with_field(Field::text("fldCustomerName", "name"))
                .with_field(Field::link(
                    "fldRegion",
                    "region",
                    LinkOptions::new(Relationship::ManyToOne, "tblRegions", "fldRegionName")
                        .with_keys(RECORD_ID, "region_id"),
                ))
                .with_field(Field::lookup(
                    "fldRegionLabel",
                    "region_label",
                    ValueKind::String,
                    false,
                    LookupOptions::new("fldRegion", "tblRegions", "fldRegionName"),
                )),
        )
        .with_table(TableSchema::new("tblRegions", "regions").with_field(Field::text("fldRegionName", "name")))
}

#[test]
fn nested_lookups_read_foreign_ctes() {
    let catalog = regions();
    let table = catalog.table("tblOrders").expect("table");
    let (query_plan, state) = RecordQuery::new(&catalog, table, QueryOptions::new(Dialect::Sqlite))
        .build(&["fldCustomer", "fldOrderRegion"])
        .expect("builds");
    let names: Vec<&str> = query_plan.ctes().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["CTE_fldRegion", "CTE_fldCustomer"]);
    assert_eq!(query_plan.joined_ctes(), ["CTE_fldCustomer".to_string()]);
    assert_eq!(state.ctes().count(), 2);

    let conn = Connection::open_in_memory().expect("open");
    conn.execute_batch(
        "CREATE TABLE regions (__id INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE customers (__id INTEGER PRIMARY KEY, name TEXT, region_id INTEGER);
         CREATE TABLE orders (__id INTEGER PRIMARY KEY, customer_id INTEGER);
         INSERT INTO regions VALUES (1, 'north');
         INSERT INTO customers VALUES (1, 'ann', 1), (2, 'bob', NULL);
         INSERT INTO orders VALUES (1, 1), (2, 2), (3, NULL);",
    )
    .expect("schema");
    assert_eq!(
        query(&conn, &format!("{query_plan} ORDER BY \"t\".\"__id\"")),
        vec![
            vec![
                Value::Text(r#"{"id":1,"title":"ann"}"#.into()),
                Value::Text("north".into())
            ],
            vec![Value::Text(r#"{"id":2,"title":"bob"}"#.into()), Value::Null],
            vec![Value::Null, Value::Null],
        ]
    );
}

#[test]
fn self_referencing_lookup_reads_null() {
    let catalog = Catalog::new().with_table(
        TableSchema::new("tblPeople", "people")
            .with_field(Field::text("fldName", "name"))
            .with_field(Field::link(
                "fldParent",
                "parent",
                LinkOptions::new(Relationship::ManyToOne, "tblPeople", "fldName").with_keys(RECORD_ID, "parent_id"),
            ))
            .with_field(Field::lookup(
                "fldAncestor",
                "ancestor",
                ValueKind::String,
                false,
                LookupOptions::new("fldParent", "tblPeople", "fldAncestor"),
            )),
    );
    let table = catalog.table("tblPeople").expect("table");
    let postgres = RecordQuery::new(&catalog, table, QueryOptions::new(Dialect::Postgres))
        .to_sql(&["fldAncestor"])
        .expect("builds");
    assert!(postgres.contains(r#"NULL::text AS "ancestor""#), "{postgres}");
    assert!(!postgres.contains("RECURSIVE"), "{postgres}");

    let sqlite = RecordQuery::new(&catalog, table, QueryOptions::new(Dialect::Sqlite))
        .to_sql(&["fldAncestor", "fldParent"])
        .expect("builds");
    let conn = Connection::open_in_memory().expect("open");
    conn.execute_batch(
        "CREATE TABLE people (__id INTEGER PRIMARY KEY, name TEXT, parent_id INTEGER);
         INSERT INTO people VALUES (1, 'root', NULL), (2, 'child', 1);",
    )
    .expect("schema");
    assert_eq!(
        query(&conn, &format!("{sqlite} ORDER BY \"t\".\"__id\"")),
        vec![
            vec![Value::Null, Value::Null],
            vec![Value::Null, Value::Text(r#"{"id":1,"title":"root"}"#.into())],
        ]
    );
}
