//! The CTE of a conditional field (or of a lookup needing its own sort or
//!  limit): foreign rows chosen by a filter, aggregated per host record.

use log::warn;

use super::{
    link::{correlated_source, link_order, numeric_input},
    Built, CteCompiler, Rows, Side, FOREIGN, HOST, MAIN_RECORD_ID, ROWS,
};
use crate::{
    dialect::{Aggregate, RollupFunction},
    error::{Error, Result},
    graph::ConditionalView,
    schema::{DbType, Field, FieldKind, SortDirection, TableSchema, RECORD_ID},
    sql::{qualified, quote_ident},
};

const GROUPS: &str = "g";

/// How the aggregated rows become the field value.
#[derive(Clone, Copy)]
struct Output {
    rollup: Option<RollupFunction>,
    target_multi: bool,
    target_json: bool,
    db_type: DbType,
}

impl<'a> CteCompiler<'a> {
    pub(super) fn conditional(&self, host: &'a TableSchema, field: &'a Field) -> Result<Built> {
        let view = ConditionalView::of(field)
            .ok_or_else(|| Error::Other(format!("{} has no conditional options", field.id)))?;
        let rollup = match &field.kind {
            FieldKind::Rollup { expression, .. } | FieldKind::ConditionalRollup { expression, .. } => {
                Some(RollupFunction::parse(expression)?)
            }
            _ => None,
        };
        let Some(foreign) = self.catalog.table(view.foreign_table_id) else {
            warn!(
                "foreign table {} of {} is missing, reading NULL",
                view.foreign_table_id, field.id
            );
            return Ok(self.degraded(host, &[field]));
        };
        let link = match view.link_field_id {
            Some(id) => match host.field(id).map(|f| &f.kind) {
                Some(FieldKind::Link(link)) => Some(link),
                _ => {
                    warn!("link {id} of {} is missing, reading NULL", field.id);
                    return Ok(self.degraded(host, &[field]));
                }
            },
            None => None,
        };

        let provider = self.provider();
        let mut side = Side::new(foreign, FOREIGN, true);
        let mut host_side = Side::new(host, HOST, false);

        let Some((value, target)) = self.value(&mut side, view.lookup_field_id)? else {
            return Ok(self.degraded(host, &[field]));
        };
        let value = match rollup {
            Some(func) => numeric_input(provider, func, Some(target), &value),
            None => value,
        };
        let output = Output {
            rollup,
            target_multi: target.is_multi_valued,
            target_json: target.db_type == DbType::Json,
            db_type: field.db_type,
        };

        let foreign_id = qualified(FOREIGN, RECORD_ID);
        let sort = match view.sort {
            Some(sort) => self.value(&mut side, &sort.field_id)?.map(|(sql, _)| {
                let direction = match sort.direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                };
                format!("{sql} {direction} NULLS FIRST, {foreign_id} ASC")
            }),
            None => None,
        };
        let order = match (sort, link) {
            (Some(sort), _) => sort,
            (None, Some(link)) => link_order(link),
            (None, None) => format!("{foreign_id} ASC"),
        };

        let pairs = match (link, view.sort, view.limit, view.filter) {
            (None, None, None, Some(filter)) if view.host_values => filter.equality_pairs(),
            _ => None,
        };
        if let Some(pairs) = pairs {
            let mut keys = Vec::new();
            let mut matches = Vec::new();
            for (i, (foreign_key, host_key)) in pairs.into_iter().enumerate() {
                let foreign_key = self.value(&mut side, foreign_key)?;
                let host_key = self.value(&mut host_side, host_key)?;
                let (Some((foreign_key, _)), Some((host_key, _))) = (foreign_key, host_key) else {
                    warn!("{} compares a missing field, reading NULL", field.id);
                    return Ok(self.degraded(host, &[field]));
                };
                keys.push(foreign_key);
                matches.push(format!("{} = {host_key}", qualified(GROUPS, &format!("k{i}"))));
            }
            let source = format!(
                "{} AS {}{}",
                quote_ident(&foreign.name),
                quote_ident(FOREIGN),
                side.join_clause()
            );
            let rows = Rows {
                value: &value,
                source: &source,
                conditions: Vec::new(),
                order: &order,
                limit: None,
                flatten: self.flattens(output),
                numbered: provider.supports_ordered_aggregate(),
                keys: &keys,
            };
            return Ok(self.grouped(host, field, &rows, &matches, output));
        }

        let (from, mut conditions) = match link {
            Some(link) => {
                let (from, correlation) = correlated_source(link, foreign);
                (from, vec![correlation])
            }
            None => (
                format!("{} AS {}", quote_ident(&foreign.name), quote_ident(FOREIGN)),
                Vec::new(),
            ),
        };
        let host_values = view.host_values.then_some(&mut host_side);
        if let Some(filter) = self.filter(view.filter, &mut side, host_values)? {
            conditions.push(format!("({filter})"));
        }
        let source = format!("{from}{}", side.join_clause());
        let rows = Rows {
            value: &value,
            source: &source,
            conditions,
            order: &order,
            limit: view.limit,
            flatten: self.flattens(output),
            numbered: provider.supports_ordered_aggregate(),
            keys: &[],
        };
        let aggregate = self.aggregate(&rows, output);
        let aggregate = match rollup {
            Some(func) => provider.rollup_identity(func, &aggregate, field.db_type),
            None => aggregate,
        };
        let column = rows.subquery(&aggregate);

        Ok(Built {
            body: format!(
                "SELECT {} AS {}, {column} AS {} FROM {} AS {}",
                qualified(HOST, RECORD_ID),
                quote_ident(MAIN_RECORD_ID),
                quote_ident(&field.column),
                quote_ident(&host.name),
                quote_ident(HOST)
            ),
            fields: vec![field.id.clone()],
        })
    }

    /// Lookups of multi-valued targets are unnested before aggregation when
    ///  the dialect can't flatten the aggregated array.
    fn flattens(&self, output: Output) -> bool {
        output.rollup.is_none() && output.target_multi && !self.provider().supports_ordered_aggregate()
    }

    /// The aggregate over `"s"`, without identity.
    fn aggregate(&self, rows: &Rows<'_>, output: Output) -> String {
        let provider = self.provider();
        let position = qualified(ROWS, "o");
        let order = provider.supports_ordered_aggregate().then_some(position.as_str());
        let value = rows.value(provider, output.target_json);
        match output.rollup {
            Some(func) => {
                let row_id = qualified(ROWS, "r");
                let input = Aggregate::new(&value, &row_id)
                    .ordered(order)
                    .multi_valued(output.target_multi);
                provider.rollup_aggregate(func, &input)
            }
            None => {
                let values = provider.json_agg_non_null(&value, order, None);
                if output.target_multi && !rows.flatten {
                    provider.flatten_json_array(&values)
                } else {
                    values
                }
            }
        }
    }

    /// Equality-only filters: aggregate every foreign row once per key, then
    ///  join the groups to the host rows.
    fn grouped(&self, host: &TableSchema, field: &Field, rows: &Rows<'_>, matches: &[String], output: Output) -> Built {
        let provider = self.provider();
        let keys: Vec<String> = (0..matches.len())
            .map(|i| qualified(ROWS, &format!("k{i}")))
            .collect();
        let groups = format!(
            "SELECT {}, {} AS \"v\" FROM ({}) AS {} GROUP BY {}",
            keys.join(", "),
            self.aggregate(rows, output),
            rows.select(),
            quote_ident(ROWS),
            keys.join(", ")
        );
        let value = qualified(GROUPS, "v");
        let value = match output.rollup {
            Some(func) => provider.rollup_identity(func, &value, output.db_type),
            None => value,
        };
        Built {
            body: format!(
                "SELECT {} AS {}, {value} AS {} FROM {} AS {} LEFT JOIN ({groups}) AS {} ON {}",
                qualified(HOST, RECORD_ID),
                quote_ident(MAIN_RECORD_ID),
                quote_ident(&field.column),
                quote_ident(&host.name),
                quote_ident(HOST),
                quote_ident(GROUPS),
                matches.join(" AND ")
            ),
            fields: vec![field.id.clone()],
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rusqlite::types::Value;

    use super::super::tests::database;
    use crate::{
        cte::CteCompiler,
        dialect::Dialect,
        filter::{BasicFilterCompiler, FilterOperator, FilterTree, FilterValue},
        schema::{Catalog, ConditionalOptions, Field, SchemaCatalog, SortDirection, TableSchema, ValueKind},
        select::QueryOptions,
        sql::{qualified, Query},
        state::{QueryState, StateView},
    };

    fn big_items(expression: &str) -> Field {
        Field::conditional_rollup(
            "fldBig",
            "big",
            ValueKind::Number,
            ConditionalOptions::new("tblItems", "fldAmount").with_filter(FilterTree::condition(
                "fldAmount",
                FilterOperator::IsGreater,
                FilterValue::Literal(100.into()),
            )),
            expression,
        )
    }

    fn run(field: Field, dialect: Dialect) -> (String, Vec<Value>) {
        let catalog = Catalog::new()
            .with_table(TableSchema::new("tblOrders", "orders").with_field(field))
            .with_table(
                TableSchema::new("tblItems", "items")
                    .with_field(Field::text("fldItemName", "name"))
                    .with_field(Field::number("fldAmount", "amount")),
            );
        let options = QueryOptions {
            dialect,
            ..Default::default()
        };
        let filters = BasicFilterCompiler::new(dialect);
        let orders = catalog.table("tblOrders").expect("table");
        let column = orders.fields().next().expect("field").clone();
        let mut query = Query::new("orders", "t");
        let mut state = QueryState::new();
        CteCompiler::new(&catalog, &options, &filters)
            .compile(orders, &[column.id.as_str()], &mut query, &mut state)
            .expect("compiles");
        let cte = state.cte_name(&column.id).expect("registered").to_string();
        query.select(qualified(&cte, &column.column), &column.column);
        let sql = format!("{query} ORDER BY \"t\".\"__id\"");
        if dialect != Dialect::Sqlite {
            return (sql, Vec::new());
        }
        let conn = database();
        let mut stmt = conn.prepare(&sql).expect("prepares");
        let values = stmt
            .query_map([], |r| r.get(0))
            .expect("runs")
            .collect::<rusqlite::Result<_>>()
            .expect("rows");
        (sql, values)
    }

    #[test]
    fn zero_rows_read_as_identity() {
        let zeros = vec![Value::Integer(0); 3];
        assert_eq!(run(big_items("countall({values})"), Dialect::Sqlite).1, zeros);
        assert_eq!(run(big_items("sum({values})"), Dialect::Sqlite).1, zeros);
        assert_eq!(run(big_items("average({values})"), Dialect::Sqlite).1, zeros);
        assert_eq!(run(big_items("max({values})"), Dialect::Sqlite).1, vec![Value::Null; 3]);

        let (sql, _) = run(big_items("min({values})"), Dialect::Postgres);
        assert!(sql.contains("COALESCE(MIN(\"s\".\"v\"), NULL::double precision)"), "{sql}");
    }

    #[test]
    fn sorted_and_limited_lookups() {
        let cheapest = Field::conditional_lookup(
            "fldCheapest",
            "cheapest",
            ValueKind::String,
            ConditionalOptions::new("tblItems", "fldItemName")
                .with_sort("fldAmount", SortDirection::Asc)
                .with_limit(2),
        );
        let (sql, values) = run(cheapest.clone(), Dialect::Sqlite);
        assert!(sql.contains(r#"ORDER BY "f"."amount" ASC NULLS FIRST, "f"."__id" ASC LIMIT 2"#), "{sql}");
        assert_eq!(values, vec![Value::Text(r#"["c","b"]"#.into()); 3]);

        let (sql, _) = run(cheapest, Dialect::Postgres);
        assert!(
            sql.contains(r#"jsonb_agg("s"."v" ORDER BY "s"."o")"#),
            "{sql}"
        );
    }
}
