//! Record queries: the CTEs a projection needs, then one selection per field.

use chrono::{DateTime, Utc};
use log::warn;

use crate::{
    compile::{CompileOptions, Compiler},
    cte::CteCompiler,
    dialect::Dialect,
    error::{Error, Result},
    filter::{BasicFilterCompiler, FilterCompiler},
    schema::{Field, FieldKind, SchemaCatalog, TableSchema},
    sql::{qualified, Query},
    state::{QueryState, StateView},
    translate::Mode,
};

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueryOptions {
    pub dialect: Dialect,
    /// Alias of the main table
    pub alias: String,
    pub timezone: String,
    pub user_table: String,
    pub now: Option<DateTime<Utc>>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            alias: "t".to_string(),
            timezone: "UTC".to_string(),
            user_table: "users".to_string(),
            now: None,
        }
    }
}

impl QueryOptions {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            ..Default::default()
        }
    }

    /// Options for formulas read through rows aliased `alias`.
    pub(crate) fn compile_options(&self, alias: &str) -> CompileOptions {
        CompileOptions {
            dialect: self.dialect,
            mode: Mode::Select,
            timezone: self.timezone.clone(),
            alias: Some(alias.to_string()),
            user_table: self.user_table.clone(),
            now: self.now,
        }
    }
}

/// Registers the selection of every projected field and adds the columns to
///  the query. Expects the CTEs of the projection to be registered already.
pub struct SelectionCompiler<'a> {
    table: &'a TableSchema,
    options: &'a QueryOptions,
}

impl<'a> SelectionCompiler<'a> {
    pub fn new(table: &'a TableSchema, options: &'a QueryOptions) -> Self {
        Self { table, options }
    }

    pub fn compile(&self, projection: &[&str], query: &mut Query, state: &mut QueryState) -> Result<()> {
        let fields = projection
            .iter()
            .map(|id| self.table.field(id).ok_or_else(|| Error::FieldNotFound(id.to_string())))
            .collect::<Result<Vec<_>>>()?;

        for field in &fields {
            if !matches!(field.kind, FieldKind::Formula(_)) {
                let sql = self.plain(field, state);
                state.set_selection(&field.id, sql);
            }
        }

        // formulas read the selections above
        let mut formulas = Vec::new();
        {
            let options = self.options.compile_options(&self.options.alias);
            let mut compiler = Compiler::new(self.table, options).with_state(&*state);
            for field in fields.iter().filter(|f| matches!(f.kind, FieldKind::Formula(_))) {
                formulas.push((field.id.as_str(), compiler.compile_field(&field.id)?.sql));
            }
        }
        for (id, sql) in formulas {
            state.set_selection(id, sql);
        }

        for field in &fields {
            if let Some(sql) = state.selection(&field.id) {
                query.select(sql.to_string(), &field.column);
            }
        }
        Ok(())
    }

    fn plain(&self, field: &Field, state: &QueryState) -> String {
        let provider = self.options.dialect.provider();
        let column = qualified(&self.options.alias, &field.column);
        match &field.kind {
            FieldKind::System(system) if system.is_user() => {
                provider.user_lookup(&column, &self.options.user_table)
            }
            kind if kind.is_virtual() => match state.cte_name(&field.id) {
                Some(cte) => qualified(cte, &field.column),
                None => {
                    warn!("no CTE carries {}, selecting NULL", field.id);
                    provider.typed_null(field.db_type)
                }
            },
            _ => column,
        }
    }
}

/// Builds `WITH … SELECT … FROM main LEFT JOIN cte …` for a projection of one
///  table.
pub struct RecordQuery<'a> {
    catalog: &'a dyn SchemaCatalog,
    table: &'a TableSchema,
    options: QueryOptions,
    filters: Box<dyn FilterCompiler + 'a>,
}

impl<'a> RecordQuery<'a> {
    pub fn new(catalog: &'a dyn SchemaCatalog, table: &'a TableSchema, options: QueryOptions) -> Self {
        let filters = Box::new(BasicFilterCompiler::new(options.dialect));
        Self {
            catalog,
            table,
            options,
            filters,
        }
    }

    pub fn with_filter_compiler(mut self, filters: impl FilterCompiler + 'a) -> Self {
        self.filters = Box::new(filters);
        self
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// The query and the state it was built with.
    pub fn build(&self, projection: &[&str]) -> Result<(Query, QueryState)> {
        let mut query = Query::new(&self.table.name, &self.options.alias);
        let mut state = QueryState::new();
        CteCompiler::new(self.catalog, &self.options, self.filters.as_ref()).compile(
            self.table,
            projection,
            &mut query,
            &mut state,
        )?;
        SelectionCompiler::new(self.table, &self.options).compile(projection, &mut query, &mut state)?;
        Ok((query, state))
    }

    pub fn to_sql(&self, projection: &[&str]) -> Result<String> {
        let (query, _) = self.build(projection)?;
        Ok(query.to_string())
    }

    /// [RecordQuery::to_sql] over every field of the table.
    pub fn to_sql_all(&self) -> Result<String> {
        let projection: Vec<&str> = self.table.fields().map(|f| f.id.as_str()).collect();
        self.to_sql(&projection)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::schema::{Catalog, LinkOptions, Relationship, SystemField, ValueKind};

    fn catalog() -> Catalog {
        Catalog::new().with_table(
            TableSchema::new("tblA", "a")
                .with_field(Field::number("fldN", "n"))
                .with_field(Field::formula("fldTwice", "twice", ValueKind::Number, "{fldN} * 2"))
                .with_field(Field::system("fldBy", SystemField::CreatedBy))
                .with_field(Field::link(
                    "fldGone",
                    "gone",
                    LinkOptions::new(Relationship::ManyToOne, "tblMissing", "fldTitle")
                        .with_keys(crate::schema::RECORD_ID, "gone_id"),
                )),
        )
    }

    #[test]
    fn plain_and_formula_selections() {
        let catalog = catalog();
        let table = catalog.table("tblA").expect("table");
        let query = RecordQuery::new(&catalog, table, QueryOptions::new(Dialect::Postgres));
        let (query, state) = query.build(&["fldTwice", "fldN"]).expect("builds");
        assert_eq!(
            query.to_string(),
            r#"SELECT ("t"."n" * 2) AS "twice", "t"."n" AS "n" FROM "a" AS "t""#
        );
        assert_eq!(state.selection("fldN"), Some(r#""t"."n""#));
    }

    #[test]
    fn users_and_missing_links() {
        let catalog = catalog();
        let table = catalog.table("tblA").expect("table");
        let query = RecordQuery::new(&catalog, table, QueryOptions::new(Dialect::Sqlite));
        let sql = query.to_sql(&["fldBy", "fldGone"]).expect("builds");
        assert_eq!(
            sql,
            concat!(
                r#"WITH "CTE_fldGone" AS (SELECT "m"."__id" AS "main_record_id", CAST(NULL AS TEXT) AS "gone" FROM "a" AS "m") "#,
                r#"SELECT (SELECT json_object('id', "u"."id", 'title', "u"."name") FROM "users" AS "u" WHERE "u"."id" = "t"."__created_by") AS "__created_by", "#,
                r#""CTE_fldGone"."gone" AS "gone" FROM "a" AS "t" LEFT JOIN "CTE_fldGone" ON "CTE_fldGone"."main_record_id" = "t"."__id""#
            )
        );
        assert_eq!(
            query.to_sql(&["fldNope"]),
            Err(Error::FieldNotFound("fldNope".into()))
        );
    }

    #[test]
    fn every_field() {
        let catalog = catalog();
        let table = catalog.table("tblA").expect("table");
        let sql = RecordQuery::new(&catalog, table, QueryOptions::new(Dialect::Postgres))
            .to_sql_all()
            .expect("builds");
        for column in [r#"AS "n""#, r#"AS "twice""#, r#"AS "__created_by""#, r#"AS "gone""#] {
            assert!(sql.contains(column), "{sql}");
        }
    }
}
