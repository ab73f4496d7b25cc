use criterion::{Criterion, criterion_group, criterion_main};
use formula_sql::{
    CompileOptions, Dialect, Mode, QueryOptions, RecordQuery, compile,
    parser::parse,
    schema::{
        Catalog, Field, LinkOptions, LookupOptions, Relationship, SchemaCatalog, TableSchema, ValueKind,
        RECORD_ID,
    },
};

const FORMULAS: [&str; 6] = [
    "{n1} + {n2}",
    "{s} & ' ' & UPPER({s}) & {n1}",
    "IF({n1} > 1, 'a', IF({n1} > 2, 'b', IF({n1} > 3, 'c', IF({n1} > 4, 'd', 'e'))))",
    "ROUND(SUM({n1}, {n2}, {twice}) / 3, 2)",
    "DATETIME_FORMAT(DATE_ADD({d}, 3, 'day'), 'YYYY-MM-DD HH:mm')",
    "TRIM(TRIM(TRIM(TRIM(TRIM(TRIM(TRIM(TRIM(TRIM(TRIM({s}))))))))))",
];

fn table() -> TableSchema {
    TableSchema::new("tblNumbers", "numbers")
        .with_field(Field::number("n1", "n1"))
        .with_field(Field::number("n2", "n2"))
        .with_field(Field::text("s", "s"))
        .with_field(Field::datetime("d", "d"))
        .with_field(Field::formula("twice", "twice", ValueKind::Number, "{n1} * 2"))
}

fn catalog() -> Catalog {
    Catalog::new()
        .with_table(
            TableSchema::new("tblLists", "lists")
                .with_field(Field::link(
                    "fldEntries",
                    "entries",
                    LinkOptions::new(Relationship::OneToMany, "tblEntries", "fldLabel")
                        .with_keys("list_id", RECORD_ID)
                        .with_order_column("position"),
                ))
                .with_field(Field::rollup(
                    "fldTotal",
                    "total",
                    ValueKind::Number,
                    LookupOptions::new("fldEntries", "tblEntries", "fldAmount"),
                    "sum({values})",
                )),
        )
        .with_table(
            TableSchema::new("tblEntries", "entries")
                .with_field(Field::text("fldLabel", "label"))
                .with_field(Field::number("fldAmount", "amount")),
        )
}

fn parse_all() {
    for formula in FORMULAS.iter() {
        _ = std::hint::black_box(parse(formula));
    }
}

fn compile_all(table: &TableSchema, dialect: Dialect) {
    for formula in FORMULAS.iter() {
        if let Ok(tree) = parse(formula) {
            _ = std::hint::black_box(compile(&tree, table, CompileOptions::new(dialect, Mode::Select)));
        }
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let table = table();
    let catalog = catalog();
    let lists = catalog.table("tblLists").expect("table");
    c.bench_function("parse", |b| b.iter(parse_all));
    c.bench_function("compile postgres", |b| b.iter(|| compile_all(&table, Dialect::Postgres)));
    c.bench_function("compile sqlite", |b| b.iter(|| compile_all(&table, Dialect::Sqlite)));
    c.bench_function("record query", |b| {
        b.iter(|| {
            let query = RecordQuery::new(&catalog, lists, QueryOptions::new(Dialect::Sqlite));
            _ = std::hint::black_box(query.to_sql(&["fldEntries", "fldTotal"]));
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
