//! Table and field metadata as the compiler sees it. Everything here is read
//!  only for the duration of a compile.

use indexmap::IndexMap;

use crate::{ast::ParseTree, filter::FilterTree};

/// Reserved column holding the record id of every table (and junction table).
pub const RECORD_ID: &str = "__id";
pub const CREATED_TIME: &str = "__created_time";
pub const LAST_MODIFIED_TIME: &str = "__last_modified_time";
pub const AUTO_NUMBER: &str = "__auto_number";
pub const CREATED_BY: &str = "__created_by";
pub const LAST_MODIFIED_BY: &str = "__last_modified_by";

/// The logical kind of a cell value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueKind {
    String,
    Number,
    Boolean,
    DateTime,
}

/// Physical column type, used to produce correctly typed NULLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DbType {
    Text,
    Integer,
    Real,
    Boolean,
    DateTime,
    Json,
}

impl DbType {
    /// The physical type a single value of `kind` is stored as.
    pub fn for_value(kind: ValueKind) -> Self {
        match kind {
            ValueKind::String => DbType::Text,
            ValueKind::Number => DbType::Real,
            ValueKind::Boolean => DbType::Boolean,
            ValueKind::DateTime => DbType::DateTime,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Relationship {
    ManyToOne,
    OneToMany,
    OneToOne,
    ManyToMany,
}

impl Relationship {
    pub fn is_multi_valued(&self) -> bool {
        matches!(self, Relationship::OneToMany | Relationship::ManyToMany)
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkOptions {
    pub relationship: Relationship,
    pub foreign_table_id: String,
    /// Field of the foreign table whose value becomes the link title
    pub title_field_id: String,
    pub self_key_column: String,
    pub foreign_key_column: String,
    pub junction_table: Option<String>,
    pub order_column: Option<String>,
    pub symmetric_field_id: Option<String>,
}

/// Where the key columns of a link live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLocation<'a> {
    /// `junction.self_key = host.__id`, `junction.foreign_key = foreign.__id`
    Junction {
        table: &'a str,
        self_key: &'a str,
        foreign_key: &'a str,
    },
    /// `host.column = foreign.__id`
    Host { column: &'a str },
    /// `foreign.column = host.__id`
    Foreign { column: &'a str },
}

impl LinkOptions {
    pub fn new(
        relationship: Relationship,
        foreign_table_id: impl Into<String>,
        title_field_id: impl Into<String>,
    ) -> Self {
        Self {
            relationship,
            foreign_table_id: foreign_table_id.into(),
            title_field_id: title_field_id.into(),
            self_key_column: RECORD_ID.to_string(),
            foreign_key_column: RECORD_ID.to_string(),
            junction_table: None,
            order_column: None,
            symmetric_field_id: None,
        }
    }

    pub fn with_keys(mut self, self_key: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        self.self_key_column = self_key.into();
        self.foreign_key_column = foreign_key.into();
        self
    }

    pub fn with_junction(mut self, table: impl Into<String>) -> Self {
        self.junction_table = Some(table.into());
        self
    }

    pub fn with_order_column(mut self, column: impl Into<String>) -> Self {
        self.order_column = Some(column.into());
        self
    }

    pub fn with_symmetric_field(mut self, field_id: impl Into<String>) -> Self {
        self.symmetric_field_id = Some(field_id.into());
        self
    }

    pub fn key_location(&self) -> KeyLocation<'_> {
        match &self.junction_table {
            Some(table) => KeyLocation::Junction {
                table,
                self_key: &self.self_key_column,
                foreign_key: &self.foreign_key_column,
            },
            None if self.self_key_column == RECORD_ID => KeyLocation::Host {
                column: &self.foreign_key_column,
            },
            None => KeyLocation::Foreign {
                column: &self.self_key_column,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SortSpec {
    pub field_id: String,
    pub direction: SortDirection,
}

/// Options shared by Lookup and Rollup fields.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LookupOptions {
    pub link_field_id: String,
    pub foreign_table_id: String,
    pub lookup_field_id: String,
    pub filter: Option<FilterTree>,
    pub sort: Option<SortSpec>,
    pub limit: Option<usize>,
}

impl LookupOptions {
    pub fn new(
        link_field_id: impl Into<String>,
        foreign_table_id: impl Into<String>,
        lookup_field_id: impl Into<String>,
    ) -> Self {
        Self {
            link_field_id: link_field_id.into(),
            foreign_table_id: foreign_table_id.into(),
            lookup_field_id: lookup_field_id.into(),
            filter: None,
            sort: None,
            limit: None,
        }
    }

    pub fn with_filter(mut self, filter: FilterTree) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_sort(mut self, field_id: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(SortSpec {
            field_id: field_id.into(),
            direction,
        });
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Options of Conditional Lookup/Rollup fields: the related rows are chosen by
///  the filter rather than by a link, although a link may narrow them further.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConditionalOptions {
    pub link_field_id: Option<String>,
    pub foreign_table_id: String,
    pub lookup_field_id: String,
    pub filter: Option<FilterTree>,
    pub sort: Option<SortSpec>,
    pub limit: Option<usize>,
}

impl ConditionalOptions {
    pub fn new(foreign_table_id: impl Into<String>, lookup_field_id: impl Into<String>) -> Self {
        Self {
            link_field_id: None,
            foreign_table_id: foreign_table_id.into(),
            lookup_field_id: lookup_field_id.into(),
            filter: None,
            sort: None,
            limit: None,
        }
    }

    /// Only rows linked through `link_field_id` are considered.
    pub fn with_link(mut self, link_field_id: impl Into<String>) -> Self {
        self.link_field_id = Some(link_field_id.into());
        self
    }

    pub fn with_filter(mut self, filter: FilterTree) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_sort(mut self, field_id: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(SortSpec {
            field_id: field_id.into(),
            direction,
        });
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FormulaOptions {
    pub expression: String,
    /// Cached parse of `expression`; parsed on demand when absent
    #[cfg_attr(feature = "serde", serde(skip))]
    pub tree: Option<ParseTree>,
    /// The value is persisted as a generated column
    pub persisted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SystemField {
    CreatedTime,
    LastModifiedTime,
    AutoNumber,
    RecordId,
    CreatedBy,
    LastModifiedBy,
}

impl SystemField {
    pub fn column(&self) -> &'static str {
        match self {
            SystemField::CreatedTime => CREATED_TIME,
            SystemField::LastModifiedTime => LAST_MODIFIED_TIME,
            SystemField::AutoNumber => AUTO_NUMBER,
            SystemField::RecordId => RECORD_ID,
            SystemField::CreatedBy => CREATED_BY,
            SystemField::LastModifiedBy => LAST_MODIFIED_BY,
        }
    }

    fn value_kind(&self) -> ValueKind {
        match self {
            SystemField::CreatedTime | SystemField::LastModifiedTime => ValueKind::DateTime,
            SystemField::AutoNumber => ValueKind::Number,
            SystemField::RecordId | SystemField::CreatedBy | SystemField::LastModifiedBy => {
                ValueKind::String
            }
        }
    }

    fn db_type(&self) -> DbType {
        match self {
            SystemField::CreatedTime | SystemField::LastModifiedTime => DbType::DateTime,
            SystemField::AutoNumber => DbType::Integer,
            SystemField::RecordId => DbType::Text,
            SystemField::CreatedBy | SystemField::LastModifiedBy => DbType::Json,
        }
    }

    /// Whether the value is a user resolved through the user table.
    pub fn is_user(&self) -> bool {
        matches!(self, SystemField::CreatedBy | SystemField::LastModifiedBy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NumberFormatKind {
    Decimal,
    Percent,
    Currency,
    /// Whole stars, precision ignored
    Rating,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NumberFormat {
    pub kind: NumberFormatKind,
    pub precision: u8,
    /// Only used by `Currency`
    pub symbol: String,
}

impl NumberFormat {
    pub fn decimal(precision: u8) -> Self {
        Self {
            kind: NumberFormatKind::Decimal,
            precision,
            symbol: String::new(),
        }
    }

    pub fn percent(precision: u8) -> Self {
        Self {
            kind: NumberFormatKind::Percent,
            precision,
            symbol: String::new(),
        }
    }

    pub fn rating() -> Self {
        Self {
            kind: NumberFormatKind::Rating,
            precision: 0,
            symbol: String::new(),
        }
    }

    pub fn currency(symbol: impl Into<String>, precision: u8) -> Self {
        Self {
            kind: NumberFormatKind::Currency,
            precision,
            symbol: symbol.into(),
        }
    }
}

/// The closed set of field variants, each with its own payload.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FieldKind {
    Column,
    Link(LinkOptions),
    Lookup(LookupOptions),
    Rollup {
        options: LookupOptions,
        /// e.g. `sum({values})`
        expression: String,
    },
    ConditionalLookup(ConditionalOptions),
    ConditionalRollup {
        options: ConditionalOptions,
        expression: String,
    },
    Formula(FormulaOptions),
    System(SystemField),
}

impl FieldKind {
    /// Link, Lookup, Rollup and the conditional variants: values that come
    ///  from another table through a CTE.
    pub fn is_virtual(&self) -> bool {
        matches!(
            self,
            FieldKind::Link(_)
                | FieldKind::Lookup(_)
                | FieldKind::Rollup { .. }
                | FieldKind::ConditionalLookup(_)
                | FieldKind::ConditionalRollup { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Field {
    pub id: String,
    pub name: String,
    /// Physical column name, also the column name inside CTEs
    pub column: String,
    pub value_kind: ValueKind,
    pub db_type: DbType,
    pub is_multi_valued: bool,
    pub number_format: Option<NumberFormat>,
    pub kind: FieldKind,
}

impl Field {
    pub fn new(
        id: impl Into<String>,
        column: impl Into<String>,
        value_kind: ValueKind,
        kind: FieldKind,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            column: column.into(),
            value_kind,
            db_type: DbType::for_value(value_kind),
            is_multi_valued: false,
            number_format: None,
            kind,
        }
    }

    pub fn text(id: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(id, column, ValueKind::String, FieldKind::Column)
    }

    pub fn number(id: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(id, column, ValueKind::Number, FieldKind::Column)
    }

    pub fn boolean(id: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(id, column, ValueKind::Boolean, FieldKind::Column)
    }

    pub fn datetime(id: impl Into<String>, column: impl Into<String>) -> Self {
        Self::new(id, column, ValueKind::DateTime, FieldKind::Column)
    }

    pub fn formula(
        id: impl Into<String>,
        column: impl Into<String>,
        value_kind: ValueKind,
        expression: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            column,
            value_kind,
            FieldKind::Formula(FormulaOptions {
                expression: expression.into(),
                tree: None,
                persisted: false,
            }),
        )
    }

    pub fn link(id: impl Into<String>, column: impl Into<String>, options: LinkOptions) -> Self {
        let multi = options.relationship.is_multi_valued();
        Self::new(id, column, ValueKind::String, FieldKind::Link(options))
            .with_db_type(DbType::Json)
            .multi_valued(multi)
    }

    /// A lookup mirrors its target's kind. Pass whether the link is
    ///  multi-valued, the value is then a JSON array.
    pub fn lookup(
        id: impl Into<String>,
        column: impl Into<String>,
        value_kind: ValueKind,
        multi: bool,
        options: LookupOptions,
    ) -> Self {
        let field = Self::new(id, column, value_kind, FieldKind::Lookup(options));
        if multi {
            field.with_db_type(DbType::Json).multi_valued(true)
        } else {
            field
        }
    }

    pub fn rollup(
        id: impl Into<String>,
        column: impl Into<String>,
        value_kind: ValueKind,
        options: LookupOptions,
        expression: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            column,
            value_kind,
            FieldKind::Rollup {
                options,
                expression: expression.into(),
            },
        )
    }

    pub fn conditional_lookup(
        id: impl Into<String>,
        column: impl Into<String>,
        value_kind: ValueKind,
        options: ConditionalOptions,
    ) -> Self {
        Self::new(id, column, value_kind, FieldKind::ConditionalLookup(options))
            .with_db_type(DbType::Json)
            .multi_valued(true)
    }

    pub fn conditional_rollup(
        id: impl Into<String>,
        column: impl Into<String>,
        value_kind: ValueKind,
        options: ConditionalOptions,
        expression: impl Into<String>,
    ) -> Self {
        Self::new(
            id,
            column,
            value_kind,
            FieldKind::ConditionalRollup {
                options,
                expression: expression.into(),
            },
        )
    }

    pub fn system(id: impl Into<String>, system: SystemField) -> Self {
        Self::new(id, system.column(), system.value_kind(), FieldKind::System(system))
            .with_db_type(system.db_type())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_db_type(mut self, db_type: DbType) -> Self {
        self.db_type = db_type;
        self
    }

    pub fn multi_valued(mut self, multi: bool) -> Self {
        self.is_multi_valued = multi;
        self
    }

    pub fn with_number_format(mut self, format: NumberFormat) -> Self {
        self.number_format = Some(format);
        self
    }

    /// Attaches an already parsed tree to a formula field.
    pub fn with_tree(mut self, tree: ParseTree) -> Self {
        if let FieldKind::Formula(options) = &mut self.kind {
            options.tree = Some(tree);
        }
        self
    }

    pub fn persisted(mut self) -> Self {
        if let FieldKind::Formula(options) = &mut self.kind {
            options.persisted = true;
        }
        self
    }

    pub fn is_virtual(&self) -> bool {
        self.kind.is_virtual()
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TableSchema {
    pub id: String,
    /// Physical table name
    pub name: String,
    fields: IndexMap<String, Field>,
    #[cfg_attr(feature = "serde", serde(skip))]
    by_name: IndexMap<String, String>,
}

impl TableSchema {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            fields: IndexMap::new(),
            by_name: IndexMap::new(),
        }
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.push(field);
        self
    }

    pub fn push(&mut self, field: Field) {
        self.by_name.insert(field.name.clone(), field.id.clone());
        self.fields.insert(field.id.clone(), field);
    }

    pub fn field(&self, id: &str) -> Option<&Field> {
        self.fields.get(id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.by_name.get(name).and_then(|id| self.fields.get(id))
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values()
    }
}

/// Metadata lookup, implemented by whatever stores the schema.
pub trait SchemaCatalog {
    fn table(&self, table_id: &str) -> Option<&TableSchema>;

    /// A field and the table that owns it.
    fn field(&self, field_id: &str) -> Option<(&TableSchema, &Field)>;
}

/// An in-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: IndexMap<String, TableSchema>,
    field_tables: IndexMap<String, String>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.add_table(table);
        self
    }

    pub fn add_table(&mut self, table: TableSchema) {
        for field in table.fields() {
            self.field_tables.insert(field.id.clone(), table.id.clone());
        }
        self.tables.insert(table.id.clone(), table);
    }
}

impl SchemaCatalog for Catalog {
    fn table(&self, table_id: &str) -> Option<&TableSchema> {
        self.tables.get(table_id)
    }

    fn field(&self, field_id: &str) -> Option<(&TableSchema, &Field)> {
        let table = self.tables.get(self.field_tables.get(field_id)?)?;
        Some((table, table.field(field_id)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_location() {
        let junction = LinkOptions::new(Relationship::ManyToMany, "tblB", "fldTitle")
            .with_junction("junction_ab")
            .with_keys("__fk_a", "__fk_b");
        assert_eq!(
            junction.key_location(),
            KeyLocation::Junction {
                table: "junction_ab",
                self_key: "__fk_a",
                foreign_key: "__fk_b"
            }
        );

        let many_to_one = LinkOptions::new(Relationship::ManyToOne, "tblB", "fldTitle")
            .with_keys(RECORD_ID, "__fk_b");
        assert_eq!(
            many_to_one.key_location(),
            KeyLocation::Host { column: "__fk_b" }
        );

        let one_to_many = LinkOptions::new(Relationship::OneToMany, "tblB", "fldTitle")
            .with_keys("__fk_a", RECORD_ID);
        assert_eq!(
            one_to_many.key_location(),
            KeyLocation::Foreign { column: "__fk_a" }
        );
    }

    #[test]
    fn catalog_lookup() {
        let catalog = Catalog::new().with_table(
            TableSchema::new("tblA", "table_a")
                .with_field(Field::text("fldName", "name").with_name("Name"))
                .with_field(Field::system("fldCreated", SystemField::CreatedTime)),
        );
        let (table, field) = catalog.field("fldCreated").expect("field");
        assert_eq!(table.id, "tblA");
        assert_eq!(field.column, CREATED_TIME);
        assert_eq!(field.db_type, DbType::DateTime);
        assert_eq!(
            table.field_by_name("Name").map(|f| f.id.as_str()),
            Some("fldName")
        );
        assert!(catalog.field("nope").is_none());
    }

    #[test]
    fn link_fields_are_json() {
        let link = Field::link(
            "fldLink",
            "link",
            LinkOptions::new(Relationship::OneToMany, "tblB", "fldTitle"),
        );
        assert!(link.is_multi_valued);
        assert!(link.is_virtual());
        assert_eq!(link.db_type, DbType::Json);
    }
}
