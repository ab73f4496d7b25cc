//! Compiles the CTEs behind Link, Lookup, Rollup and Conditional fields.
//!
//! Each CTE yields one row per host record, keyed by [MAIN_RECORD_ID], with
//!  one column per field it carries (named after the field's column). Units
//!  are built in dependency order; a unit reading a unit that isn't built yet
//!  (a cycle) reads a typed NULL instead.

use indexmap::{IndexMap, IndexSet};
use log::{debug, warn};

use crate::{
    compile::Compiler,
    dialect::DialectProvider,
    error::{Error, Result},
    filter::{FieldMap, FilterCompiler, FilterTree},
    graph::{leaf_fields, unit_of, CteUnit, DependencyGraph},
    schema::{Field, FieldKind, SchemaCatalog, TableSchema, RECORD_ID},
    select::QueryOptions,
    sql::{qualified, quote_ident, Query},
    state::{QueryState, ScopedState, StateView},
};

mod conditional;
mod link;

/// Key column of every CTE, joined against the host's record id.
pub const MAIN_RECORD_ID: &str = "main_record_id";

const HOST: &str = "m";
const FOREIGN: &str = "f";
const JUNCTION: &str = "j";

/// Rows of one table as seen from inside a CTE body.
struct Side<'s> {
    table: &'s TableSchema,
    alias: &'static str,
    /// Nested CTEs are LEFT JOINed next to the alias; otherwise they are read
    ///  through correlated subqueries.
    joined: bool,
    joins: IndexSet<String>,
}

impl<'s> Side<'s> {
    fn new(table: &'s TableSchema, alias: &'static str, joined: bool) -> Self {
        Self {
            table,
            alias,
            joined,
            joins: IndexSet::new(),
        }
    }

    /// LEFT JOINs of the nested CTEs read so far.
    fn join_clause(&self) -> String {
        self.joins
            .iter()
            .map(|cte| {
                format!(
                    " LEFT JOIN {} ON {} = {}",
                    quote_ident(cte),
                    qualified(cte, MAIN_RECORD_ID),
                    qualified(self.alias, RECORD_ID)
                )
            })
            .collect()
    }
}

const ROWS: &str = "s";
const ELEMENT: &str = "e";

/// Pre-ordered foreign rows an aggregate reads, for dialects that can't
///  order inside aggregate calls (and for limits, which need a subquery
///  anyway).
struct Rows<'r> {
    value: &'r str,
    /// Everything after `FROM`, joins included
    source: &'r str,
    conditions: Vec<String>,
    order: &'r str,
    limit: Option<usize>,
    /// Unnest JSON array values into one row per element
    flatten: bool,
    /// Adds the row position as `"s"."o"`
    numbered: bool,
    /// Extra columns selected as `"k0"`, `"k1"`...
    keys: &'r [String],
}

impl Rows<'_> {
    fn select(&self) -> String {
        let record = qualified(FOREIGN, RECORD_ID);
        let mut sql = if self.flatten {
            format!(
                "SELECT {} AS \"v\", {} AS \"t\", {record} AS \"r\"",
                qualified(ELEMENT, "value"),
                qualified(ELEMENT, "type")
            )
        } else {
            format!("SELECT {} AS \"v\", {record} AS \"r\"", self.value)
        };
        if self.numbered {
            sql.push_str(&format!(", ROW_NUMBER() OVER (ORDER BY {}) AS \"o\"", self.order));
        }
        for (i, key) in self.keys.iter().enumerate() {
            sql.push_str(&format!(", {key} AS \"k{i}\""));
        }
        sql.push_str(&format!(" FROM {}", self.source));
        if self.flatten {
            sql.push_str(&format!(", json_each({}) AS {}", self.value, quote_ident(ELEMENT)));
        }
        if !self.conditions.is_empty() {
            sql.push_str(&format!(" WHERE {}", self.conditions.join(" AND ")));
        }
        sql.push_str(&format!(" ORDER BY {}", self.order));
        if self.flatten {
            sql.push_str(&format!(", {}", qualified(ELEMENT, "key")));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }

    /// `(SELECT aggregate FROM (rows) AS "s")`
    fn subquery(&self, aggregate: &str) -> String {
        format!("(SELECT {aggregate} FROM ({}) AS {})", self.select(), quote_ident(ROWS))
    }

    /// The row value as the outer aggregate sees it. JSON values lose their
    ///  JSON-ness crossing the subquery and are marked again.
    fn value(&self, provider: &dyn DialectProvider, json: bool) -> String {
        let v = qualified(ROWS, "v");
        if self.flatten {
            format!(
                "CASE WHEN {} IN ('object', 'array') THEN {} ELSE {v} END",
                qualified(ROWS, "t"),
                provider.json_value(&v)
            )
        } else if json {
            provider.json_value(&v)
        } else {
            v
        }
    }
}

/// What a unit produced: its body and the fields it carries.
struct Built {
    body: String,
    fields: Vec<String>,
}

pub struct CteCompiler<'a> {
    catalog: &'a dyn SchemaCatalog,
    options: &'a QueryOptions,
    filters: &'a dyn FilterCompiler,
    built: IndexSet<String>,
}

impl<'a> CteCompiler<'a> {
    pub fn new(catalog: &'a dyn SchemaCatalog, options: &'a QueryOptions, filters: &'a dyn FilterCompiler) -> Self {
        Self {
            catalog,
            options,
            filters,
            built: IndexSet::new(),
        }
    }

    fn provider(&self) -> &'static dyn DialectProvider {
        self.options.dialect.provider()
    }

    /// Adds to `query` every CTE the `projection` of `table` needs. The CTEs
    ///  of `table`'s own fields are joined to the query and registered in
    ///  `state`.
    pub fn compile(
        &mut self,
        table: &'a TableSchema,
        projection: &[&str],
        query: &mut Query,
        state: &mut QueryState,
    ) -> Result<()> {
        let graph = DependencyGraph::build(self.catalog, table, projection);
        if graph.is_cyclic() {
            debug!("CTE dependencies of {} are cyclic, some reads will be NULL", table.id);
        }
        for unit in graph.plan() {
            let name = unit.name();
            if self.built.contains(&name) {
                continue;
            }
            let Some(built) = self.unit(unit)? else {
                continue;
            };
            debug!("built {name} carrying {:?}", built.fields);
            query.push_cte(&name, built.body);
            self.built.insert(name.clone());
            if unit.table_id() == table.id {
                query.join_cte(&name);
                for field_id in &built.fields {
                    state.register_cte(field_id, &name)?;
                }
            }
        }
        Ok(())
    }

    fn unit(&self, unit: &CteUnit) -> Result<Option<Built>> {
        let Some(host) = self.catalog.table(unit.table_id()) else {
            warn!("table {} of {} is missing", unit.table_id(), unit.name());
            return Ok(None);
        };
        let Some(field) = host.field(unit.field_id()) else {
            warn!("field {} of {} is missing", unit.field_id(), unit.name());
            return Ok(None);
        };
        let built = match unit {
            CteUnit::Link { .. } => self.link(host, field)?,
            CteUnit::Conditional { .. } => self.conditional(host, field)?,
        };
        Ok(Some(built))
    }

    /// A body yielding NULL for every carried field.
    fn degraded(&self, host: &TableSchema, fields: &[&Field]) -> Built {
        let columns: String = fields
            .iter()
            .map(|f| format!(", {} AS {}", self.provider().typed_null(f.db_type), quote_ident(&f.column)))
            .collect();
        Built {
            body: format!(
                "SELECT {} AS {}{columns} FROM {} AS {}",
                qualified(HOST, RECORD_ID),
                quote_ident(MAIN_RECORD_ID),
                quote_ident(&host.name),
                quote_ident(HOST)
            ),
            fields: fields.iter().map(|f| f.id.clone()).collect(),
        }
    }

    /// The value of `field_id` on `side`, or `None` (with a warning) when the
    ///  field doesn't exist or its CTE isn't built yet.
    fn value(&self, side: &mut Side<'a>, field_id: &str) -> Result<Option<(String, &'a Field)>> {
        let Some(field) = side.table.field(field_id) else {
            warn!("field {field_id} is missing from {}, reading NULL", side.table.id);
            return Ok(None);
        };
        let column = qualified(side.alias, &field.column);
        let sql = match &field.kind {
            FieldKind::Column => column,
            FieldKind::System(system) if system.is_user() => {
                self.provider().user_lookup(&column, &self.options.user_table)
            }
            FieldKind::System(_) => column,
            FieldKind::Formula(_) => self.formula(side, field)?,
            _ => match self.nested(side, field) {
                Some(sql) => sql,
                None => return Ok(None),
            },
        };
        Ok(Some((sql, field)))
    }

    /// Reads a virtual field of `side` from its already built CTE.
    fn nested(&self, side: &mut Side<'a>, field: &Field) -> Option<String> {
        let built = unit_of(side.table, field)
            .map(|u| u.name())
            .filter(|name| self.built.contains(name));
        let Some(cte) = built else {
            warn!(
                "{} of {} is read before its CTE exists, reading NULL",
                field.id, side.table.id
            );
            return None;
        };
        let column = qualified(&cte, &field.column);
        if side.joined {
            side.joins.insert(cte);
            Some(column)
        } else {
            Some(format!(
                "(SELECT {column} FROM {} WHERE {} = {})",
                quote_ident(&cte),
                qualified(&cte, MAIN_RECORD_ID),
                qualified(side.alias, RECORD_ID)
            ))
        }
    }

    fn formula(&self, side: &mut Side<'a>, field: &Field) -> Result<String> {
        let mut scoped = ScopedState::detached();
        for leaf in leaf_fields(side.table, &field.id) {
            if leaf.is_virtual() {
                let sql = self
                    .nested(side, leaf)
                    .unwrap_or_else(|| self.provider().typed_null(leaf.db_type));
                scoped.set_selection(&leaf.id, sql);
            }
        }
        let options = self.options.compile_options(side.alias);
        let mut compiler = Compiler::new(side.table, options).with_state(&scoped);
        match compiler.compile_field(&field.id) {
            Ok(compiled) => Ok(compiled.sql),
            Err(Error::FieldNotFound(missing)) => {
                warn!("formula {} references missing field {missing}, reading NULL", field.id);
                Ok(self.provider().typed_null(field.db_type))
            }
            Err(e) => Err(e),
        }
    }

    /// Compiles a filter whose condition fields live on `foreign`. Field
    ///  values come from `host` when given, from `foreign` otherwise.
    fn filter(
        &self,
        filter: Option<&FilterTree>,
        foreign: &mut Side<'a>,
        mut host: Option<&mut Side<'a>>,
    ) -> Result<Option<String>> {
        let Some(filter) = filter else {
            return Ok(None);
        };
        let mut fields = FieldMap::new();
        let mut aliases = IndexMap::new();
        for id in filter.field_ids() {
            let sql = match self.value(foreign, id)? {
                Some((sql, field)) => {
                    fields.insert(field.id.as_str(), field);
                    sql
                }
                None => "NULL".to_string(),
            };
            aliases.insert(id.to_string(), sql);
        }
        for id in filter.value_field_ids() {
            let side: &mut Side<'a> = match host.as_deref_mut() {
                Some(host) => host,
                None => &mut *foreign,
            };
            let sql = match self.value(side, id)? {
                Some((sql, _)) => sql,
                None => "NULL".to_string(),
            };
            aliases.insert(id.to_string(), sql);
        }
        self.filters.compile(&fields, filter, &aliases).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rusqlite::{types::Value, Connection};

    use super::*;
    use crate::{
        dialect::Dialect,
        filter::{BasicFilterCompiler, FilterOperator, FilterValue},
        schema::{Catalog, ConditionalOptions, LinkOptions, LookupOptions, Relationship, ValueKind},
    };

    pub(crate) fn catalog() -> Catalog {
        Catalog::new()
            .with_table(
                TableSchema::new("tblOrders", "orders")
                    .with_field(Field::text("fldOrderName", "name"))
                    .with_field(Field::text("fldOrderCustomer", "customer"))
                    .with_field(Field::link(
                        "fldItems",
                        "items",
                        LinkOptions::new(Relationship::OneToMany, "tblItems", "fldItemName")
                            .with_keys("order_id", RECORD_ID),
                    ))
                    .with_field(Field::rollup(
                        "fldTotal",
                        "total",
                        ValueKind::Number,
                        LookupOptions::new("fldItems", "tblItems", "fldAmount"),
                        "sum({values})",
                    ))
                    .with_field(Field::lookup(
                        "fldAmounts",
                        "amounts",
                        ValueKind::Number,
                        true,
                        LookupOptions::new("fldItems", "tblItems", "fldAmount"),
                    ))
                    .with_field(Field::conditional_rollup(
                        "fldSameCustomer",
                        "same_customer",
                        ValueKind::Number,
                        ConditionalOptions::new("tblOrders", "fldOrderName").with_filter(
                            FilterTree::condition(
                                "fldOrderCustomer",
                                FilterOperator::Is,
                                FilterValue::Field("fldOrderCustomer".into()),
                            ),
                        ),
                        "countall({values})",
                    )),
            )
            .with_table(
                TableSchema::new("tblItems", "items")
                    .with_field(Field::text("fldItemName", "name"))
                    .with_field(Field::number("fldAmount", "amount"))
                    .with_field(Field::number("fldOrderId", "order_id")),
            )
    }

    pub(crate) fn database() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE orders (__id INTEGER PRIMARY KEY, name TEXT, customer TEXT);
             CREATE TABLE items (__id INTEGER PRIMARY KEY, name TEXT, amount REAL, order_id INTEGER);
             INSERT INTO orders VALUES (1, 'first', 'ann'), (2, 'second', 'bob'), (3, 'third', 'ann');
             INSERT INTO items VALUES (10, 'b', 2.5, 1), (11, 'a', 4, 1), (12, 'c', 1, 2);",
        )
        .expect("schema");
        conn
    }

    fn build(dialect: Dialect, projection: &[&str]) -> (Query, QueryState) {
        let catalog = catalog();
        let options = QueryOptions {
            dialect,
            ..Default::default()
        };
        let filters = BasicFilterCompiler::new(dialect);
        let orders = catalog.table("tblOrders").expect("table");
        let mut query = Query::new(&orders.name, &options.alias);
        let mut state = QueryState::new();
        CteCompiler::new(&catalog, &options, &filters)
            .compile(orders, projection, &mut query, &mut state)
            .expect("compiles");
        (query, state)
    }

    #[test]
    fn link_members_share_one_cte() {
        let (query, state) = build(Dialect::Postgres, &["fldTotal", "fldAmounts", "fldItems"]);
        assert_eq!(query.ctes().len(), 1);
        assert_eq!(query.joined_ctes(), ["CTE_fldItems".to_string()]);
        assert_eq!(
            state.ctes().collect::<Vec<_>>(),
            vec![
                ("fldItems", "CTE_fldItems"),
                ("fldTotal", "CTE_fldItems"),
                ("fldAmounts", "CTE_fldItems"),
            ]
        );
        let body = &query.ctes()[0].body;
        assert!(body.contains(r#"GROUP BY "m"."__id""#), "{body}");
        assert!(body.contains(r#"COALESCE(SUM("f"."amount"), 0)"#), "{body}");
    }

    #[test]
    fn one_to_many_rollups_run_on_sqlite() {
        let (mut query, _) = build(Dialect::Sqlite, &["fldTotal", "fldAmounts", "fldItems"]);
        query.select(qualified("CTE_fldItems", "total"), "total");
        query.select(qualified("CTE_fldItems", "amounts"), "amounts");
        query.select(qualified("CTE_fldItems", "items"), "items");
        let conn = database();
        let sql = format!("{query} ORDER BY \"t\".\"__id\"");
        let mut stmt = conn.prepare(&sql).expect("prepares");
        let rows: Vec<(Value, Value, Value)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .expect("runs")
            .collect::<rusqlite::Result<_>>()
            .expect("rows");
        assert_eq!(
            rows,
            vec![
                (
                    Value::Real(6.5),
                    Value::Text("[2.5,4.0]".into()),
                    Value::Text(r#"[{"id":10,"title":"b"},{"id":11,"title":"a"}]"#.into()),
                ),
                (
                    Value::Real(1.0),
                    Value::Text("[1.0]".into()),
                    Value::Text(r#"[{"id":12,"title":"c"}]"#.into()),
                ),
                (Value::Integer(0), Value::Null, Value::Null),
            ]
        );
    }

    fn missing_targets() -> Catalog {
        let deleted = |id: &str, column: &str, expression: &str| {
            Field::rollup(
                id,
                column,
                ValueKind::Number,
                LookupOptions::new("fldItems", "tblItems", "fldDeleted"),
                expression,
            )
        };
        let base = catalog();
        let items = base.table("tblItems").expect("table").clone();
        let orders = base
            .table("tblOrders")
            .expect("table")
            .clone()
            .with_field(deleted("fldDeletedSum", "deleted_sum", "sum({values})"))
            .with_field(deleted("fldDeletedCount", "deleted_count", "countall({values})"))
            .with_field(Field::conditional_rollup(
                "fldDeletedCond",
                "deleted_cond",
                ValueKind::Number,
                ConditionalOptions::new("tblItems", "fldDeleted"),
                "sum({values})",
            ));
        Catalog::new().with_table(orders).with_table(items)
    }

    #[test]
    fn missing_targets_read_null_not_identity() {
        let catalog = missing_targets();
        let orders = catalog.table("tblOrders").expect("table");
        let projection = ["fldDeletedSum", "fldDeletedCount", "fldDeletedCond"];

        let postgres = crate::select::RecordQuery::new(&catalog, orders, QueryOptions::new(Dialect::Postgres))
            .to_sql(&projection)
            .expect("builds");
        assert!(postgres.contains(r#"NULL::double precision AS "deleted_sum""#), "{postgres}");
        assert!(postgres.contains(r#"NULL::double precision AS "deleted_count""#), "{postgres}");
        assert!(postgres.contains(r#"NULL::double precision AS "deleted_cond""#), "{postgres}");

        let sqlite = crate::select::RecordQuery::new(&catalog, orders, QueryOptions::new(Dialect::Sqlite))
            .to_sql(&projection)
            .expect("builds");
        let conn = database();
        let mut stmt = conn
            .prepare(&format!("{sqlite} ORDER BY \"t\".\"__id\""))
            .expect("prepares");
        let rows: Vec<(Value, Value, Value)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .expect("runs")
            .collect::<rusqlite::Result<_>>()
            .expect("rows");
        assert_eq!(rows, vec![(Value::Null, Value::Null, Value::Null); 3]);
    }

    #[test]
    fn conditional_rollups_correlate_on_the_host_row() {
        let (mut query, state) = build(Dialect::Sqlite, &["fldSameCustomer"]);
        assert_eq!(state.cte_name("fldSameCustomer"), Some("CTE_CONDITIONAL_fldSameCustomer"));
        query.select(
            qualified("CTE_CONDITIONAL_fldSameCustomer", "same_customer"),
            "same_customer",
        );
        let conn = database();
        let sql = format!("{query} ORDER BY \"t\".\"__id\"");
        let mut stmt = conn.prepare(&sql).expect("prepares");
        let counts: Vec<i64> = stmt
            .query_map([], |r| r.get(0))
            .expect("runs")
            .collect::<rusqlite::Result<_>>()
            .expect("rows");
        assert_eq!(counts, vec![2, 1, 2]);
    }
}
