//! Per-database SQL fragment builders. Every method is pure: it only formats
//!  the fragments it is given.

use crate::{
    error::{Error, Result},
    schema::{DbType, NumberFormat},
};

pub mod postgres;
pub mod sqlite;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Dialect {
    #[default]
    Postgres,
    Sqlite,
}

impl Dialect {
    pub fn provider(self) -> &'static dyn DialectProvider {
        match self {
            Dialect::Postgres => &postgres::PostgresDialect,
            Dialect::Sqlite => &sqlite::SqliteDialect,
        }
    }
}

/// Aggregations a rollup expression may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollupFunction {
    Sum,
    Average,
    Count,
    CountAll,
    CountA,
    Max,
    Min,
    And,
    Or,
    Xor,
    ArrayJoin,
    Concatenate,
    ArrayUnique,
    ArrayCompact,
}

impl RollupFunction {
    /// Parses the function name out of an expression like `sum({values})`.
    pub fn parse(expression: &str) -> Result<Self> {
        let name = expression
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match name.as_str() {
            "sum" => Ok(RollupFunction::Sum),
            "average" | "avg" => Ok(RollupFunction::Average),
            "count" => Ok(RollupFunction::Count),
            "countall" => Ok(RollupFunction::CountAll),
            "counta" => Ok(RollupFunction::CountA),
            "max" => Ok(RollupFunction::Max),
            "min" => Ok(RollupFunction::Min),
            "and" => Ok(RollupFunction::And),
            "or" => Ok(RollupFunction::Or),
            "xor" => Ok(RollupFunction::Xor),
            "array_join" => Ok(RollupFunction::ArrayJoin),
            "concatenate" => Ok(RollupFunction::Concatenate),
            "array_unique" => Ok(RollupFunction::ArrayUnique),
            "array_compact" => Ok(RollupFunction::ArrayCompact),
            _ => Err(Error::UnsupportedRollupFunction(name)),
        }
    }

    /// Functions whose input must be numeric.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            RollupFunction::Sum | RollupFunction::Average | RollupFunction::Count
        )
    }

    /// Functions producing a JSON array.
    pub fn is_array(&self) -> bool {
        matches!(self, RollupFunction::ArrayUnique | RollupFunction::ArrayCompact)
    }
}

/// The pieces an aggregate builder needs.
#[derive(Debug, Clone, Copy)]
pub struct Aggregate<'a> {
    /// The value being aggregated
    pub value: &'a str,
    /// Id of the foreign row, counted by `countall`
    pub row_id: &'a str,
    /// Member order; only honoured when the dialect orders inside aggregates
    pub order_by: Option<&'a str>,
    /// Rows the aggregate should consider
    pub filter: Option<&'a str>,
    /// The value itself is a JSON array
    pub multi_valued: bool,
}

impl<'a> Aggregate<'a> {
    pub fn new(value: &'a str, row_id: &'a str) -> Self {
        Self {
            value,
            row_id,
            order_by: None,
            filter: None,
            multi_valued: false,
        }
    }

    pub fn ordered(mut self, order_by: Option<&'a str>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn filtered(mut self, filter: Option<&'a str>) -> Self {
        self.filter = filter;
        self
    }

    pub fn multi_valued(mut self, multi: bool) -> Self {
        self.multi_valued = multi;
        self
    }

    /// ` FILTER (WHERE ...)` from the row filter plus `extra`.
    pub(crate) fn filter_clause(&self, extra: Option<String>) -> String {
        let conds: Vec<String> = extra
            .into_iter()
            .chain(self.filter.map(|f| format!("({f})")))
            .collect();
        if conds.is_empty() {
            String::new()
        } else {
            format!(" FILTER (WHERE {})", conds.join(" AND "))
        }
    }

    /// The value restricted to filtered rows, for non aggregating contexts.
    pub(crate) fn filtered_value(&self) -> String {
        match self.filter {
            Some(filter) => format!("CASE WHEN {filter} THEN {} END", self.value),
            None => self.value.to_string(),
        }
    }
}

pub trait DialectProvider: Sync {
    fn dialect(&self) -> Dialect;

    fn text_cast(&self, expr: &str) -> String;

    /// Text of a number as concatenation shows it.
    fn number_text(&self, expr: &str) -> String {
        self.text_cast(expr)
    }

    fn format_number(&self, expr: &str, format: &NumberFormat) -> String;

    /// Formats every number of a JSON array and joins them with `, `.
    fn format_number_array(&self, expr: &str, format: &NumberFormat) -> String;

    /// Numeric value of `expr`, or NULL when it does not look like a number.
    ///  Must never raise.
    fn coerce_numeric(&self, expr: &str) -> String;

    fn link_exists(&self, expr: &str) -> String;

    /// Title text of a link value (`{id, title}` or an array of them).
    fn link_title(&self, expr: &str, multi: bool) -> String;

    /// `{id, title}` with `title` dropped when NULL.
    fn link_object(&self, id: &str, title: &str) -> String;

    fn user_lookup(&self, id_expr: &str, user_table: &str) -> String;

    /// Marks a JSON text value as JSON so aggregation nests it instead of
    ///  quoting it.
    fn json_value(&self, expr: &str) -> String;

    /// JSON array of the non-NULL values, NULL when there are none.
    fn json_agg_non_null(&self, expr: &str, order_by: Option<&str>, filter: Option<&str>) -> String;

    fn string_agg(
        &self,
        expr: &str,
        delimiter: &str,
        order_by: Option<&str>,
        filter: Option<&str>,
    ) -> String;

    /// Flattens one level of nesting of a JSON array, keeping member order.
    fn flatten_json_array(&self, expr: &str) -> String;

    fn json_array_length(&self, expr: &str) -> String;

    fn typed_null(&self, ty: DbType) -> String;

    /// Whether `ORDER BY` is accepted inside aggregate calls. When it isn't,
    ///  callers feed aggregates from pre-ordered subqueries.
    fn supports_ordered_aggregate(&self) -> bool;

    fn rollup_aggregate(&self, func: RollupFunction, input: &Aggregate<'_>) -> String;

    /// The non-aggregating equivalent used by single-valued links.
    fn rollup_single(&self, func: RollupFunction, input: &Aggregate<'_>) -> String;

    /// Replaces the NULL an aggregate yields over zero rows by the
    ///  function's identity value.
    fn rollup_identity(&self, func: RollupFunction, expr: &str, ty: DbType) -> String {
        match func {
            RollupFunction::Sum
            | RollupFunction::Average
            | RollupFunction::Count
            | RollupFunction::CountAll
            | RollupFunction::CountA => format!("COALESCE({expr}, 0)"),
            RollupFunction::Max | RollupFunction::Min => {
                format!("COALESCE({expr}, {})", self.typed_null(ty))
            }
            _ => expr.to_string(),
        }
    }
}
