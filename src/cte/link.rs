//! The CTE of a link field, carrying the link value itself and every plain
//!  lookup and rollup going through it.

use log::warn;

use super::{Built, CteCompiler, Rows, Side, FOREIGN, HOST, JUNCTION, MAIN_RECORD_ID, ROWS};
use crate::{
    dialect::{Aggregate, DialectProvider, RollupFunction},
    error::{Error, Result},
    graph::link_members,
    schema::{DbType, Field, FieldKind, KeyLocation, LinkOptions, TableSchema, ValueKind, RECORD_ID},
    sql::{qualified, quote_ident},
};

/// LEFT JOINs from the host row to its linked foreign rows.
pub(super) fn host_joins(link: &LinkOptions, foreign: &TableSchema) -> String {
    let foreign_table = format!("{} AS {}", quote_ident(&foreign.name), quote_ident(FOREIGN));
    let foreign_id = qualified(FOREIGN, RECORD_ID);
    let host_id = qualified(HOST, RECORD_ID);
    match link.key_location() {
        KeyLocation::Junction {
            table,
            self_key,
            foreign_key,
        } => format!(
            " LEFT JOIN {} AS {} ON {} = {host_id} LEFT JOIN {foreign_table} ON {foreign_id} = {}",
            quote_ident(table),
            quote_ident(JUNCTION),
            qualified(JUNCTION, self_key),
            qualified(JUNCTION, foreign_key)
        ),
        KeyLocation::Host { column } => format!(
            " LEFT JOIN {foreign_table} ON {foreign_id} = {}",
            qualified(HOST, column)
        ),
        KeyLocation::Foreign { column } => format!(
            " LEFT JOIN {foreign_table} ON {} = {host_id}",
            qualified(FOREIGN, column)
        ),
    }
}

/// The foreign rows of a link without the host: `(from, correlation)`, the
///  correlation tying them to the host row `"m"`.
pub(super) fn correlated_source(link: &LinkOptions, foreign: &TableSchema) -> (String, String) {
    let foreign_table = format!("{} AS {}", quote_ident(&foreign.name), quote_ident(FOREIGN));
    let foreign_id = qualified(FOREIGN, RECORD_ID);
    let host_id = qualified(HOST, RECORD_ID);
    match link.key_location() {
        KeyLocation::Junction {
            table,
            self_key,
            foreign_key,
        } => (
            format!(
                "{foreign_table} JOIN {} AS {} ON {} = {foreign_id}",
                quote_ident(table),
                quote_ident(JUNCTION),
                qualified(JUNCTION, foreign_key)
            ),
            format!("{} = {host_id}", qualified(JUNCTION, self_key)),
        ),
        KeyLocation::Host { column } => (foreign_table, format!("{foreign_id} = {}", qualified(HOST, column))),
        KeyLocation::Foreign { column } => (foreign_table, format!("{} = {host_id}", qualified(FOREIGN, column))),
    }
}

/// Member order of a link: its order column when it has one, then insertion
///  order.
pub(super) fn link_order(link: &LinkOptions) -> String {
    let foreign_id = qualified(FOREIGN, RECORD_ID);
    let position = match (&link.order_column, &link.junction_table) {
        (Some(column), Some(_)) => qualified(JUNCTION, column),
        (Some(column), None) => qualified(FOREIGN, column),
        (None, Some(_)) => qualified(JUNCTION, RECORD_ID),
        (None, None) => return format!("{foreign_id} ASC"),
    };
    format!("{position} ASC NULLS FIRST, {foreign_id} ASC")
}

/// Text shown as the title of a linked record.
fn title_text(provider: &dyn DialectProvider, field: &Field, sql: &str) -> String {
    match (&field.kind, &field.number_format) {
        (FieldKind::Link(_), _) => provider.link_title(sql, field.is_multi_valued),
        (FieldKind::System(system), _) if system.is_user() => provider.link_title(sql, false),
        (_, Some(format)) if field.value_kind == ValueKind::Number => {
            if field.is_multi_valued {
                provider.format_number_array(sql, format)
            } else {
                provider.format_number(sql, format)
            }
        }
        _ if field.db_type == DbType::Text => sql.to_string(),
        _ => provider.text_cast(sql),
    }
}

/// A lookup or rollup of the link, with its inputs resolved. Without a
///  target the member reads a typed NULL and is never aggregated.
struct Member<'f> {
    field: &'f Field,
    value: String,
    target: Option<&'f Field>,
    filter: Option<String>,
    rollup: Option<RollupFunction>,
}

impl Member<'_> {
    fn target_multi(&self) -> bool {
        self.target.is_some_and(|t| t.is_multi_valued)
    }

    fn target_json(&self) -> bool {
        self.target.is_some_and(|t| t.db_type == DbType::Json)
    }

    fn missing(&self, provider: &dyn DialectProvider) -> Option<String> {
        self.target.is_none().then(|| provider.typed_null(self.field.db_type))
    }
}

impl<'a> CteCompiler<'a> {
    pub(super) fn link(&self, host: &'a TableSchema, field: &'a Field) -> Result<Built> {
        let FieldKind::Link(link) = &field.kind else {
            return Err(Error::Other(format!("{} is not a link field", field.id)));
        };
        let mut carried = vec![field];
        carried.extend(link_members(host, &field.id));
        let Some(foreign) = self.catalog.table(&link.foreign_table_id) else {
            warn!(
                "foreign table {} of link {} is missing, reading NULL",
                link.foreign_table_id, field.id
            );
            return Ok(self.degraded(host, &carried));
        };
        let provider = self.provider();
        let mut side = Side::new(foreign, FOREIGN, true);

        let title = match self.value(&mut side, &link.title_field_id)? {
            Some((sql, title_field)) => title_text(provider, title_field, &sql),
            None => provider.typed_null(DbType::Text),
        };
        let object = provider.link_object(&qualified(FOREIGN, RECORD_ID), &title);

        let mut members = Vec::new();
        for member in carried[1..].iter().copied() {
            let (options, rollup) = match &member.kind {
                FieldKind::Lookup(options) => (options, None),
                FieldKind::Rollup { options, expression } => (options, Some(RollupFunction::parse(expression)?)),
                _ => continue,
            };
            let (value, target) = match self.value(&mut side, &options.lookup_field_id)? {
                Some((sql, target)) => (sql, Some(target)),
                None => (provider.typed_null(member.db_type), None),
            };
            let filter = self.filter(options.filter.as_ref(), &mut side, None)?;
            members.push(Member {
                field: member,
                value,
                target,
                filter,
                rollup,
            });
        }

        let columns = if !link.relationship.is_multi_valued() {
            self.single_columns(&object, &members)
        } else if provider.supports_ordered_aggregate() {
            self.grouped_columns(link, &object, &members)
        } else {
            let (from, correlation) = correlated_source(link, foreign);
            let source = format!("{from}{}", side.join_clause());
            self.correlated_columns(link, &source, &correlation, &object, &members)
        };

        let mut body = format!(
            "SELECT {} AS {}",
            qualified(HOST, RECORD_ID),
            quote_ident(MAIN_RECORD_ID)
        );
        for (sql, member) in columns.iter().zip(&carried) {
            body.push_str(&format!(", {sql} AS {}", quote_ident(&member.column)));
        }
        body.push_str(&format!(" FROM {} AS {}", quote_ident(&host.name), quote_ident(HOST)));
        let correlated = link.relationship.is_multi_valued() && !provider.supports_ordered_aggregate();
        if !correlated {
            body.push_str(&host_joins(link, foreign));
            body.push_str(&side.join_clause());
        }
        if link.relationship.is_multi_valued() && provider.supports_ordered_aggregate() {
            body.push_str(&format!(" GROUP BY {}", qualified(HOST, RECORD_ID)));
        }
        Ok(Built {
            body,
            fields: carried.iter().map(|f| f.id.clone()).collect(),
        })
    }

    /// At most one foreign row: plain values, no grouping.
    fn single_columns(&self, object: &str, members: &[Member<'_>]) -> Vec<String> {
        let provider = self.provider();
        let foreign_id = qualified(FOREIGN, RECORD_ID);
        let mut columns = vec![format!("CASE WHEN {foreign_id} IS NULL THEN NULL ELSE {object} END")];
        for member in members {
            if let Some(null) = member.missing(provider) {
                columns.push(null);
                continue;
            }
            let input = Aggregate::new(&member.value, &foreign_id)
                .filtered(member.filter.as_deref())
                .multi_valued(member.target_multi());
            columns.push(match member.rollup {
                Some(func) => provider.rollup_single(func, &input),
                None => input.filtered_value(),
            });
        }
        columns
    }

    /// Ordered aggregates over the joined rows, grouped by host record.
    fn grouped_columns(&self, link: &LinkOptions, object: &str, members: &[Member<'_>]) -> Vec<String> {
        let provider = self.provider();
        let foreign_id = qualified(FOREIGN, RECORD_ID);
        let order = link_order(link);
        let linked = format!("{foreign_id} IS NOT NULL");
        let mut columns = vec![provider.json_agg_non_null(object, Some(&order), Some(&linked))];
        for member in members {
            if let Some(null) = member.missing(provider) {
                columns.push(null);
                continue;
            }
            columns.push(match member.rollup {
                Some(func) => {
                    let value = numeric_input(provider, func, member.target, &member.value);
                    let input = Aggregate::new(&value, &foreign_id)
                        .ordered(Some(&order))
                        .filtered(member.filter.as_deref())
                        .multi_valued(member.target_multi());
                    provider.rollup_identity(func, &provider.rollup_aggregate(func, &input), member.field.db_type)
                }
                None => {
                    let values = provider.json_agg_non_null(&member.value, Some(&order), member.filter.as_deref());
                    if member.target_multi() {
                        provider.flatten_json_array(&values)
                    } else {
                        values
                    }
                }
            });
        }
        columns
    }

    /// One pre-ordered correlated subquery per column.
    fn correlated_columns(
        &self,
        link: &LinkOptions,
        source: &str,
        correlation: &str,
        object: &str,
        members: &[Member<'_>],
    ) -> Vec<String> {
        let provider = self.provider();
        let order = link_order(link);
        let conditions = |filter: Option<&str>| {
            let mut conditions = vec![correlation.to_string()];
            conditions.extend(filter.map(|f| format!("({f})")));
            conditions
        };

        let objects = Rows {
            value: object,
            source,
            conditions: conditions(None),
            order: &order,
            limit: None,
            flatten: false,
            numbered: false,
            keys: &[],
        };
        let mut columns =
            vec![objects.subquery(&provider.json_agg_non_null(&objects.value(provider, true), None, None))];

        for member in members {
            if let Some(null) = member.missing(provider) {
                columns.push(null);
                continue;
            }
            let value = match member.rollup {
                Some(func) => numeric_input(provider, func, member.target, &member.value),
                None => member.value.clone(),
            };
            let rows = Rows {
                value: &value,
                source,
                conditions: conditions(member.filter.as_deref()),
                order: &order,
                limit: None,
                flatten: member.rollup.is_none() && member.target_multi(),
                numbered: false,
                keys: &[],
            };
            let outer = rows.value(provider, member.target_json());
            let aggregate = match member.rollup {
                Some(func) => {
                    let row_id = qualified(ROWS, "r");
                    let input = Aggregate::new(&outer, &row_id).multi_valued(member.target_multi());
                    provider.rollup_identity(func, &provider.rollup_aggregate(func, &input), member.field.db_type)
                }
                None => provider.json_agg_non_null(&outer, None, None),
            };
            columns.push(rows.subquery(&aggregate));
        }
        columns
    }
}

/// Numeric rollups over non numeric values read what looks like a number.
pub(super) fn numeric_input(
    provider: &dyn DialectProvider,
    func: RollupFunction,
    target: Option<&Field>,
    value: &str,
) -> String {
    match target {
        Some(target) if func.is_numeric() && target.value_kind != ValueKind::Number && !target.is_multi_valued => {
            provider.coerce_numeric(value)
        }
        _ => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::schema::Relationship;

    fn foreign() -> TableSchema {
        TableSchema::new("tblTags", "tags")
    }

    #[test]
    fn join_shapes() {
        let junction = LinkOptions::new(Relationship::ManyToMany, "tblTags", "fldTag")
            .with_junction("post_tags")
            .with_keys("post_id", "tag_id");
        assert_eq!(
            host_joins(&junction, &foreign()),
            r#" LEFT JOIN "post_tags" AS "j" ON "j"."post_id" = "m"."__id" LEFT JOIN "tags" AS "f" ON "f"."__id" = "j"."tag_id""#
        );
        assert_eq!(
            correlated_source(&junction, &foreign()),
            (
                r#""tags" AS "f" JOIN "post_tags" AS "j" ON "j"."tag_id" = "f"."__id""#.to_string(),
                r#""j"."post_id" = "m"."__id""#.to_string()
            )
        );

        let many_to_one = LinkOptions::new(Relationship::ManyToOne, "tblTags", "fldTag").with_keys(RECORD_ID, "tag_id");
        assert_eq!(
            host_joins(&many_to_one, &foreign()),
            r#" LEFT JOIN "tags" AS "f" ON "f"."__id" = "m"."tag_id""#
        );

        let one_to_many = LinkOptions::new(Relationship::OneToMany, "tblTags", "fldTag").with_keys("post_id", RECORD_ID);
        assert_eq!(
            correlated_source(&one_to_many, &foreign()).1,
            r#""f"."post_id" = "m"."__id""#
        );
    }

    #[test]
    fn member_order() {
        let plain = LinkOptions::new(Relationship::OneToMany, "tblTags", "fldTag").with_keys("post_id", RECORD_ID);
        assert_eq!(link_order(&plain), r#""f"."__id" ASC"#);
        assert_eq!(
            link_order(&plain.clone().with_order_column("post_order")),
            r#""f"."post_order" ASC NULLS FIRST, "f"."__id" ASC"#
        );
        let junction = plain.with_junction("post_tags");
        assert_eq!(
            link_order(&junction),
            r#""j"."__id" ASC NULLS FIRST, "f"."__id" ASC"#
        );
    }
}
