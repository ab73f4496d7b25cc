use super::{Aggregate, Dialect, DialectProvider, RollupFunction};
use crate::{
    schema::{DbType, NumberFormat, NumberFormatKind},
    sql::{qualified, quote_ident, quote_literal},
};

/// Accepts optional sign, digits, optional fraction (or a bare fraction).
const NUMERIC_PATTERN: &str = r"^\s*[-+]?([0-9]+(\.[0-9]*)?|\.[0-9]+)\s*$";

#[derive(Debug, Clone, Copy)]
pub struct PostgresDialect;

impl PostgresDialect {
    fn order(order_by: Option<&str>) -> String {
        order_by.map(|o| format!(" ORDER BY {o}")).unwrap_or_default()
    }

    /// Text of a scalar, unquoted even when it is a jsonb string.
    fn bare_text(expr: &str) -> String {
        format!("(to_jsonb({expr}) #>> '{{}}')")
    }
}

impl DialectProvider for PostgresDialect {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn text_cast(&self, expr: &str) -> String {
        format!("({expr})::text")
    }

    fn format_number(&self, expr: &str, format: &NumberFormat) -> String {
        let p = format.precision;
        match format.kind {
            NumberFormatKind::Decimal => format!("(ROUND(({expr})::numeric, {p}))::text"),
            NumberFormatKind::Percent => {
                format!("(ROUND(({expr})::numeric * 100, {p}))::text || '%'")
            }
            NumberFormatKind::Currency => format!(
                "{} || (ROUND(({expr})::numeric, {p}))::text",
                quote_literal(&format.symbol)
            ),
            NumberFormatKind::Rating => format!("(ROUND(({expr})::numeric))::text"),
        }
    }

    fn format_number_array(&self, expr: &str, format: &NumberFormat) -> String {
        let item = self.format_number("(e.value)::numeric", format);
        format!(
            "(SELECT string_agg({item}, ', ' ORDER BY e.ordinality) FROM jsonb_array_elements_text({expr}) WITH ORDINALITY AS e(value, ordinality))"
        )
    }

    fn coerce_numeric(&self, expr: &str) -> String {
        format!(
            "CASE WHEN ({expr})::text ~ {} THEN (({expr})::text)::numeric ELSE NULL END",
            quote_literal(NUMERIC_PATTERN)
        )
    }

    fn link_exists(&self, expr: &str) -> String {
        format!("({expr} IS NOT NULL AND ({expr})::text NOT IN ('null', '[]', '{{}}'))")
    }

    fn link_title(&self, expr: &str, multi: bool) -> String {
        if multi {
            format!(
                "(SELECT string_agg(e.value ->> 'title', ', ' ORDER BY e.ordinality) FROM jsonb_array_elements({expr}) WITH ORDINALITY AS e(value, ordinality))"
            )
        } else {
            format!("({expr} ->> 'title')")
        }
    }

    fn link_object(&self, id: &str, title: &str) -> String {
        format!("jsonb_strip_nulls(jsonb_build_object('id', {id}, 'title', {title}))")
    }

    fn user_lookup(&self, id_expr: &str, user_table: &str) -> String {
        format!(
            "(SELECT jsonb_build_object('id', {}, 'title', {}) FROM {} AS {} WHERE {} = {id_expr})",
            qualified("u", "id"),
            qualified("u", "name"),
            quote_ident(user_table),
            quote_ident("u"),
            qualified("u", "id"),
        )
    }

    fn json_value(&self, expr: &str) -> String {
        expr.to_string()
    }

    fn json_agg_non_null(&self, expr: &str, order_by: Option<&str>, filter: Option<&str>) -> String {
        let extra = filter.map(|f| format!(" AND ({f})")).unwrap_or_default();
        format!(
            "jsonb_agg({expr}{}) FILTER (WHERE {expr} IS NOT NULL{extra})",
            Self::order(order_by)
        )
    }

    fn string_agg(
        &self,
        expr: &str,
        delimiter: &str,
        order_by: Option<&str>,
        filter: Option<&str>,
    ) -> String {
        let filter = filter
            .map(|f| format!(" FILTER (WHERE {f})"))
            .unwrap_or_default();
        format!(
            "STRING_AGG({expr}, {}{}){filter}",
            quote_literal(delimiter),
            Self::order(order_by)
        )
    }

    fn flatten_json_array(&self, expr: &str) -> String {
        // lax mode wraps scalar members so they survive the inner wildcard
        format!("jsonb_path_query_array({expr}, '$[*][*]')")
    }

    fn json_array_length(&self, expr: &str) -> String {
        format!("jsonb_array_length({expr})")
    }

    fn typed_null(&self, ty: DbType) -> String {
        let ty = match ty {
            DbType::Text => "text",
            DbType::Integer => "integer",
            DbType::Real => "double precision",
            DbType::Boolean => "boolean",
            DbType::DateTime => "timestamptz",
            DbType::Json => "jsonb",
        };
        format!("NULL::{ty}")
    }

    fn supports_ordered_aggregate(&self) -> bool {
        true
    }

    fn rollup_aggregate(&self, func: RollupFunction, input: &Aggregate<'_>) -> String {
        let v = input.value;
        let order = Self::order(input.order_by);
        match func {
            RollupFunction::Sum => format!("SUM({v}){}", input.filter_clause(None)),
            RollupFunction::Average => format!("AVG({v}){}", input.filter_clause(None)),
            RollupFunction::Count => format!("COUNT({v}){}", input.filter_clause(None)),
            RollupFunction::CountA => format!(
                "COUNT(NULLIF({}, '')){}",
                Self::bare_text(v),
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
            RollupFunction::And => format!("BOOL_AND(({v})::boolean){}", input.filter_clause(None)),
            RollupFunction::Or => format!("BOOL_OR(({v})::boolean){}", input.filter_clause(None)),
            RollupFunction::Xor => format!(
                "(COUNT(*){} % 2 = 1)",
                input.filter_clause(Some(format!("({v})::boolean")))
            ),
            RollupFunction::ArrayJoin | RollupFunction::Concatenate => {
                let delimiter = if func == RollupFunction::ArrayJoin {
                    ", "
                } else {
                    ""
                };
                self.string_agg(&self.text_cast(v), delimiter, input.order_by, input.filter)
            }
            // DISTINCT aggregates can't follow member order, so the ordered
            //  array keeps each value at its first position instead
            RollupFunction::ArrayUnique => format!(
                "(SELECT jsonb_agg(e.v ORDER BY e.i) FROM (SELECT jsonb_agg({v}{order}){} AS a) AS agg, \
                 jsonb_array_elements(agg.a) WITH ORDINALITY AS e(v, i) \
                 WHERE NOT EXISTS (SELECT 1 FROM jsonb_array_elements(agg.a) WITH ORDINALITY AS p(v, i) WHERE p.v = e.v AND p.i < e.i))",
                input.filter_clause(Some(format!("{v} IS NOT NULL")))
            ),
            RollupFunction::ArrayCompact => format!(
                "jsonb_agg({v}{order}){}",
                input.filter_clause(Some(format!(
                    "{v} IS NOT NULL AND {} <> ''",
                    Self::bare_text(v)
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
                format!("COALESCE(({v})::boolean, FALSE)")
            }
            RollupFunction::ArrayJoin | RollupFunction::Concatenate => self.text_cast(&v),
            RollupFunction::ArrayUnique | RollupFunction::ArrayCompact => {
                format!("CASE WHEN {v} IS NULL THEN NULL ELSE jsonb_build_array({v}) END")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn aggregates() {
        let pg = PostgresDialect;
        let input = Aggregate::new(r#""f"."amount""#, r#""f"."__id""#)
            .ordered(Some(r#""f"."__id" ASC"#));
        assert_eq!(
            pg.rollup_aggregate(RollupFunction::Sum, &input),
            r#"SUM("f"."amount")"#
        );
        assert_eq!(
            pg.rollup_aggregate(RollupFunction::ArrayJoin, &input),
            r#"STRING_AGG(("f"."amount")::text, ', ' ORDER BY "f"."__id" ASC)"#
        );
        assert_eq!(
            pg.rollup_aggregate(RollupFunction::CountAll, &input),
            r#"COUNT("f"."__id")"#
        );
        // json strings compare by their bare text
        assert_eq!(
            pg.rollup_aggregate(RollupFunction::ArrayCompact, &input),
            concat!(
                r#"jsonb_agg("f"."amount" ORDER BY "f"."__id" ASC) FILTER (WHERE "f"."amount" IS NOT NULL "#,
                r#"AND (to_jsonb("f"."amount") #>> '{}') <> '')"#
            )
        );
        assert_eq!(
            pg.rollup_aggregate(RollupFunction::CountA, &input),
            r#"COUNT(NULLIF((to_jsonb("f"."amount") #>> '{}'), ''))"#
        );
        let unique = pg.rollup_aggregate(RollupFunction::ArrayUnique, &input);
        assert!(!unique.contains("DISTINCT"), "{unique}");
        assert!(
            unique.starts_with(concat!(
                r#"(SELECT jsonb_agg(e.v ORDER BY e.i) FROM (SELECT jsonb_agg("f"."amount" ORDER BY "f"."__id" ASC) "#,
                r#"FILTER (WHERE "f"."amount" IS NOT NULL) AS a) AS agg"#
            )),
            "{unique}"
        );
        assert_eq!(
            pg.json_agg_non_null(r#""f"."name""#, Some("o ASC"), Some("x > 1")),
            r#"jsonb_agg("f"."name" ORDER BY o ASC) FILTER (WHERE "f"."name" IS NOT NULL AND (x > 1))"#
        );
    }

    #[test]
    fn single_valued_equivalents() {
        let pg = PostgresDialect;
        let input = Aggregate::new("v", "id");
        assert_eq!(pg.rollup_single(RollupFunction::Sum, &input), "COALESCE(v, 0)");
        assert_eq!(
            pg.rollup_single(RollupFunction::Count, &input),
            "CASE WHEN v IS NULL THEN 0 ELSE 1 END"
        );
        assert_eq!(pg.rollup_single(RollupFunction::Max, &input), "v");
        assert_eq!(
            pg.rollup_single(RollupFunction::Or, &input),
            "COALESCE((v)::boolean, FALSE)"
        );
    }

    #[test]
    fn formatting() {
        let pg = PostgresDialect;
        assert_eq!(
            pg.format_number("x", &NumberFormat::percent(1)),
            "(ROUND((x)::numeric * 100, 1))::text || '%'"
        );
        assert_eq!(
            pg.format_number("x", &NumberFormat::currency("$", 2)),
            "'$' || (ROUND((x)::numeric, 2))::text"
        );
        assert_eq!(pg.format_number("x", &NumberFormat::rating()), "(ROUND((x)::numeric))::text");
        assert_eq!(pg.typed_null(DbType::Json), "NULL::jsonb");
    }
}
