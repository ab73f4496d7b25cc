use super::{Aggregate, Dialect, DialectProvider, RollupFunction};
use crate::{
    schema::{DbType, NumberFormat, NumberFormatKind},
    sql::{qualified, quote_ident, quote_literal},
};

#[derive(Debug, Clone, Copy)]
pub struct SqliteDialect;

impl DialectProvider for SqliteDialect {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn text_cast(&self, expr: &str) -> String {
        format!("CAST({expr} AS TEXT)")
    }

    // whole reals render without the trailing ".0"
    fn number_text(&self, expr: &str) -> String {
        format!(
            "(CASE WHEN {expr} = CAST({expr} AS INTEGER) THEN CAST(CAST({expr} AS INTEGER) AS TEXT) \
             ELSE CAST({expr} AS TEXT) END)"
        )
    }

    fn format_number(&self, expr: &str, format: &NumberFormat) -> String {
        let spec = quote_literal(&format!("%.{}f", format.precision));
        match format.kind {
            NumberFormatKind::Decimal => format!("printf({spec}, {expr})"),
            NumberFormatKind::Percent => format!("printf({spec}, ({expr}) * 100) || '%'"),
            NumberFormatKind::Currency => format!(
                "{} || printf({spec}, {expr})",
                quote_literal(&format.symbol)
            ),
            NumberFormatKind::Rating => format!("printf('%d', ROUND({expr}))"),
        }
    }

    fn format_number_array(&self, expr: &str, format: &NumberFormat) -> String {
        let item = self.format_number("e.value", format);
        format!("(SELECT group_concat({item}, ', ') FROM json_each({expr}) AS e)")
    }

    // There is no regex operator, so check the text shape with GLOB: an
    //  optional sign, then digits with at most one dot.
    fn coerce_numeric(&self, expr: &str) -> String {
        let text = format!("TRIM(CAST({expr} AS TEXT))");
        let unsigned =
            format!("(CASE WHEN SUBSTR({text}, 1, 1) IN ('-', '+') THEN SUBSTR({text}, 2) ELSE {text} END)");
        format!(
            "CASE WHEN typeof({expr}) IN ('integer', 'real') THEN {expr} \
             WHEN {unsigned} GLOB '*[0-9]*' AND {unsigned} NOT GLOB '*[^0-9.]*' AND {unsigned} NOT GLOB '*.*.*' \
             THEN CAST({text} AS REAL) \
             ELSE NULL END"
        )
    }

    fn link_exists(&self, expr: &str) -> String {
        format!("({expr} IS NOT NULL AND {expr} NOT IN ('null', '[]', '{{}}'))")
    }

    fn link_title(&self, expr: &str, multi: bool) -> String {
        if multi {
            format!(
                "(SELECT group_concat(json_extract(e.value, '$.title'), ', ') FROM json_each({expr}) AS e)"
            )
        } else {
            format!("json_extract({expr}, '$.title')")
        }
    }

    // json_patch drops members whose patch value is null
    fn link_object(&self, id: &str, title: &str) -> String {
        format!("json_patch('{{}}', json_object('id', {id}, 'title', {title}))")
    }

    fn user_lookup(&self, id_expr: &str, user_table: &str) -> String {
        format!(
            "(SELECT json_object('id', {}, 'title', {}) FROM {} AS {} WHERE {} = {id_expr})",
            qualified("u", "id"),
            qualified("u", "name"),
            quote_ident(user_table),
            quote_ident("u"),
            qualified("u", "id"),
        )
    }

    fn json_value(&self, expr: &str) -> String {
        format!("json({expr})")
    }

    // json_group_array has no ORDER BY: callers pre-order the rows
    fn json_agg_non_null(&self, expr: &str, _order_by: Option<&str>, filter: Option<&str>) -> String {
        let extra = filter.map(|f| format!(" AND ({f})")).unwrap_or_default();
        format!("NULLIF(json_group_array({expr}) FILTER (WHERE {expr} IS NOT NULL{extra}), '[]')")
    }

    fn string_agg(
        &self,
        expr: &str,
        delimiter: &str,
        _order_by: Option<&str>,
        filter: Option<&str>,
    ) -> String {
        let filter = filter
            .map(|f| format!(" FILTER (WHERE {f})"))
            .unwrap_or_default();
        format!("group_concat({expr}, {}){filter}", quote_literal(delimiter))
    }

    fn flatten_json_array(&self, expr: &str) -> String {
        format!(
            "(SELECT NULLIF(json_group_array(v), '[]') FROM (\
             SELECT CASE WHEN i.type IN ('object', 'array') THEN json(i.value) ELSE i.value END AS v \
             FROM json_each({expr}) AS o, json_each(CASE WHEN o.type = 'array' THEN o.value \
             WHEN o.type = 'object' THEN json_array(json(o.value)) ELSE json_array(o.value) END) AS i \
             ORDER BY o.key, i.key))"
        )
    }

    fn json_array_length(&self, expr: &str) -> String {
        format!("json_array_length({expr})")
    }

    fn typed_null(&self, ty: DbType) -> String {
        let ty = match ty {
            DbType::Integer | DbType::Boolean => "INTEGER",
            DbType::Real => "REAL",
            DbType::Text | DbType::DateTime | DbType::Json => "TEXT",
        };
        format!("CAST(NULL AS {ty})")
    }

    fn supports_ordered_aggregate(&self) -> bool {
        false
    }

    fn rollup_aggregate(&self, func: RollupFunction, input: &Aggregate<'_>) -> String {
        let v = input.value;
        let as_flag = format!("CASE WHEN {v} THEN 1 ELSE 0 END");
        match func {
            RollupFunction::Sum => format!("SUM({v}){}", input.filter_clause(None)),
            RollupFunction::Average => format!("AVG({v}){}", input.filter_clause(None)),
            RollupFunction::Count => format!("COUNT({v}){}", input.filter_clause(None)),
            RollupFunction::CountA => format!(
                "COUNT(NULLIF({}, '')){}",
                self.text_cast(v),
                input.filter_clause(None)
            ),
            RollupFunction::CountAll if input.multi_valued => format!(
                "SUM({}){}",
                self.json_array_length(v),
                input.filter_clause(None)
            ),
            RollupFunction::CountAll => {
                format!("COUNT({}){}", input.row_id, input.filter_clause(None))
            }
            RollupFunction::Max => format!("MAX({v}){}", input.filter_clause(None)),
            RollupFunction::Min => format!("MIN({v}){}", input.filter_clause(None)),
            RollupFunction::And => format!("MIN({as_flag}){}", input.filter_clause(None)),
            RollupFunction::Or => format!("MAX({as_flag}){}", input.filter_clause(None)),
            RollupFunction::Xor => {
                format!("(SUM({as_flag}){} % 2 = 1)", input.filter_clause(None))
            }
            RollupFunction::ArrayJoin => {
                self.string_agg(&self.text_cast(v), ", ", None, input.filter)
            }
            RollupFunction::Concatenate => {
                self.string_agg(&self.text_cast(v), "", None, input.filter)
            }
            RollupFunction::ArrayUnique => format!(
                "NULLIF(json_group_array(DISTINCT {v}){}, '[]')",
                input.filter_clause(Some(format!("{v} IS NOT NULL")))
            ),
            RollupFunction::ArrayCompact => format!(
                "NULLIF(json_group_array({v}){}, '[]')",
                input.filter_clause(Some(format!(
                    "{v} IS NOT NULL AND {} <> ''",
                    self.text_cast(v)
                )))
            ),
        }
    }

    fn rollup_single(&self, func: RollupFunction, input: &Aggregate<'_>) -> String {
        let v = input.filtered_value();
        match func {
            RollupFunction::Sum => format!("COALESCE({v}, 0)"),
            RollupFunction::Average | RollupFunction::Max | RollupFunction::Min => v,
            RollupFunction::CountAll if input.multi_valued => {
                format!("COALESCE({}, 0)", self.json_array_length(&v))
            }
            RollupFunction::CountAll if input.filter.is_none() => {
                format!("CASE WHEN {} IS NULL THEN 0 ELSE 1 END", input.row_id)
            }
            RollupFunction::Count | RollupFunction::CountA | RollupFunction::CountAll => {
                format!("CASE WHEN {v} IS NULL THEN 0 ELSE 1 END")
            }
            RollupFunction::And | RollupFunction::Or | RollupFunction::Xor => {
                format!("COALESCE({v}, 0)")
            }
            RollupFunction::ArrayJoin | RollupFunction::Concatenate => self.text_cast(&v),
            RollupFunction::ArrayUnique | RollupFunction::ArrayCompact => {
                format!("CASE WHEN {v} IS NULL THEN NULL ELSE json_array({v}) END")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn query_value(sql: &str) -> rusqlite::types::Value {
        let conn = rusqlite::Connection::open_in_memory().expect("in-memory db");
        conn.query_row(&format!("SELECT {sql}"), [], |row| row.get(0))
            .expect("query runs")
    }

    #[test]
    fn whole_numbers_read_as_integers() {
        use rusqlite::types::Value;
        let lite = SqliteDialect;
        assert_eq!(query_value(&lite.number_text("4.0")), Value::Text("4".into()));
        assert_eq!(query_value(&lite.number_text("-2.0")), Value::Text("-2".into()));
        assert_eq!(query_value(&lite.number_text("7")), Value::Text("7".into()));
        assert_eq!(query_value(&lite.number_text("2.5")), Value::Text("2.5".into()));
        assert_eq!(query_value(&lite.number_text("NULL")), Value::Null);
    }

    #[test]
    fn coerce_numeric_never_raises() {
        use rusqlite::types::Value;
        let lite = SqliteDialect;
        assert_eq!(query_value(&lite.coerce_numeric("'12.5'")), Value::Real(12.5));
        assert_eq!(query_value(&lite.coerce_numeric("' -3 '")), Value::Real(-3.0));
        assert_eq!(query_value(&lite.coerce_numeric("'abc'")), Value::Null);
        assert_eq!(query_value(&lite.coerce_numeric("''")), Value::Null);
        assert_eq!(query_value(&lite.coerce_numeric("7")), Value::Integer(7));
        assert_eq!(query_value(&lite.coerce_numeric("'+4'")), Value::Real(4.0));
        assert_eq!(query_value(&lite.coerce_numeric("'-.5'")), Value::Real(-0.5));
        assert_eq!(query_value(&lite.coerce_numeric("'1.2.3'")), Value::Null);
        assert_eq!(query_value(&lite.coerce_numeric("'.'")), Value::Null);
        assert_eq!(query_value(&lite.coerce_numeric("'-'")), Value::Null);
        assert_eq!(query_value(&lite.coerce_numeric("'+-1'")), Value::Null);
        assert_eq!(query_value(&lite.coerce_numeric("NULL")), Value::Null);
    }

    #[test]
    fn link_objects_drop_null_titles() {
        use rusqlite::types::Value;
        let lite = SqliteDialect;
        assert_eq!(
            query_value(&lite.link_object("1", "NULL")),
            Value::Text(r#"{"id":1}"#.into())
        );
        assert_eq!(
            query_value(&lite.link_object("1", "'a'")),
            Value::Text(r#"{"id":1,"title":"a"}"#.into())
        );
    }

    #[test]
    fn flatten_keeps_member_order() {
        use rusqlite::types::Value;
        let lite = SqliteDialect;
        assert_eq!(
            query_value(&lite.flatten_json_array(r#"'[["b","a"],"c",["d"]]'"#)),
            Value::Text(r#"["b","a","c","d"]"#.into())
        );
    }

    #[test]
    fn number_formats() {
        use rusqlite::types::Value;
        let lite = SqliteDialect;
        assert_eq!(
            query_value(&lite.format_number("3.6", &NumberFormat::rating())),
            Value::Text("4".into())
        );
        assert_eq!(
            query_value(&lite.format_number("0.125", &NumberFormat::percent(1))),
            Value::Text("12.5%".into())
        );
        assert_eq!(
            query_value(&lite.format_number_array("'[1, 2.5]'", &NumberFormat::currency("$", 2))),
            Value::Text("$1.00, $2.50".into())
        );
    }

    #[test]
    fn typed_nulls() {
        let lite = SqliteDialect;
        assert_eq!(lite.typed_null(DbType::Real), "CAST(NULL AS REAL)");
        assert_eq!(lite.typed_null(DbType::Boolean), "CAST(NULL AS INTEGER)");
        assert_eq!(
            lite.rollup_aggregate(RollupFunction::Or, &Aggregate::new("v", "id")),
            "MAX(CASE WHEN v THEN 1 ELSE 0 END)"
        );
    }
}
