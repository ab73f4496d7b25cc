//! Whether a formula can be stored as a generated column.

use crate::{
    ast::{Expression, ExpressionId, ParseTree},
    dialect::Dialect,
    functions::FormulaFunction as F,
    parser,
    schema::{FieldKind, SystemField, TableSchema},
    translate::Mode,
};

/// Whether `func` can be translated for `dialect` in `mode`. Generated
///  columns only accept immutable expressions, so everything that depends on
///  subqueries, set returning functions or locale sensitive formatting is
///  rejected there.
pub fn function_supported(dialect: Dialect, mode: Mode, func: &F) -> bool {
    match (dialect, func) {
        (_, F::Unknown(_)) => false,
        (Dialect::Sqlite, F::RegexpReplace) => false,
        (_, F::Workday | F::WorkdayDiff | F::CountA | F::Count) => mode == Mode::Select,
        (_, F::ArrayJoin | F::ArrayUnique | F::ArrayFlatten | F::ArrayCompact) => {
            mode == Mode::Select
        }
        (_, F::TextAll | F::DatetimeFormat | F::Datestr | F::Timestr | F::DatetimeParse) => {
            mode == Mode::Select
        }
        // emulated with recursive CTEs
        (Dialect::Sqlite, F::Sqrt | F::Power) => mode == Mode::Select,
        // timestamptz casts, AT TIME ZONE, DATE_TRUNC, AGE and interval
        //  arithmetic read the session time zone
        (
            Dialect::Postgres,
            F::Year
            | F::Month
            | F::WeekNum
            | F::Weekday
            | F::Day
            | F::Hour
            | F::Minute
            | F::Second
            | F::FromNow
            | F::ToNow
            | F::DatetimeDiff
            | F::IsSame
            | F::IsAfter
            | F::IsBefore
            | F::DateAdd,
        ) => mode == Mode::Select,
        (
            _,
            F::Sum
            | F::Average
            | F::Max
            | F::Min
            | F::Round
            | F::RoundUp
            | F::RoundDown
            | F::Ceiling
            | F::Floor
            | F::Even
            | F::Odd
            | F::Int
            | F::Abs
            | F::Sqrt
            | F::Power
            | F::Exp
            | F::Log
            | F::Mod
            | F::Value
            | F::Concatenate
            | F::Find
            | F::Search
            | F::Mid
            | F::Left
            | F::Right
            | F::Replace
            | F::RegexpReplace
            | F::Substitute
            | F::Lower
            | F::Upper
            | F::Rept
            | F::Trim
            | F::Len
            | F::T
            | F::EncodeUrlComponent
            | F::If
            | F::Switch
            | F::And
            | F::Or
            | F::Xor
            | F::Not
            | F::Blank
            | F::Error
            | F::IsError
            | F::Today
            | F::Now
            | F::Year
            | F::Month
            | F::WeekNum
            | F::Weekday
            | F::Day
            | F::Hour
            | F::Minute
            | F::Second
            | F::FromNow
            | F::ToNow
            | F::DatetimeDiff
            | F::IsSame
            | F::IsAfter
            | F::IsBefore
            | F::DateAdd
            | F::CreatedTime
            | F::LastModifiedTime
            | F::CountAll
            | F::RecordId
            | F::AutoNumber,
        ) => true,
    }
}

/// Checks a formula for generated-column use: every function must be
///  supported in [Mode::Generated] and no field it reaches, through nested
///  formulas too, may come from another table.
pub fn supports_generated(table: &TableSchema, tree: &ParseTree, dialect: Dialect) -> bool {
    let mut visiting = Vec::new();
    Validator {
        table,
        dialect,
        visiting: &mut visiting,
    }
    .tree(tree)
}

/// [supports_generated] for a formula field of `table`.
pub fn field_supports_generated(table: &TableSchema, field_id: &str, dialect: Dialect) -> bool {
    let mut visiting = Vec::new();
    Validator {
        table,
        dialect,
        visiting: &mut visiting,
    }
    .field(field_id)
}

struct Validator<'a, 'v> {
    table: &'a TableSchema,
    dialect: Dialect,
    visiting: &'v mut Vec<String>,
}

impl Validator<'_, '_> {
    fn tree(&mut self, tree: &ParseTree) -> bool {
        match tree.root() {
            Some(root) => self.expr(tree, root),
            None => false,
        }
    }

    fn field(&mut self, field_id: &str) -> bool {
        let table = self.table;
        let Some(field) = table.field(field_id) else {
            return false;
        };
        match &field.kind {
            FieldKind::Column => true,
            FieldKind::System(system) => !matches!(
                system,
                SystemField::CreatedBy | SystemField::LastModifiedBy
            ),
            FieldKind::Formula(options) => {
                if self.visiting.iter().any(|v| v == field_id) {
                    return false;
                }
                let parsed;
                let tree = match &options.tree {
                    Some(tree) => tree,
                    None => match parser::parse(&options.expression) {
                        Ok(tree) => {
                            parsed = tree;
                            &parsed
                        }
                        Err(_) => return false,
                    },
                };
                self.visiting.push(field_id.to_string());
                let supported = self.tree(tree);
                self.visiting.pop();
                supported
            }
            FieldKind::Link(_)
            | FieldKind::Lookup(_)
            | FieldKind::Rollup { .. }
            | FieldKind::ConditionalLookup(_)
            | FieldKind::ConditionalRollup { .. } => false,
        }
    }

    fn expr(&mut self, tree: &ParseTree, id: ExpressionId) -> bool {
        let Some(expr) = tree.get_expr(id) else {
            return false;
        };
        match expr {
            Expression::BoolLiteral(_)
            | Expression::NumberLiteral(_)
            | Expression::StringLiteral(_)
            | Expression::NullLiteral => true,
            Expression::Field(field_id) => self.field(field_id),
            Expression::FunctionCall { name, args } => {
                function_supported(self.dialect, Mode::Generated, name)
                    && name.accepts(args.len())
                    && tree.get_args(args).iter().all(|a| self.expr(tree, *a))
            }
            Expression::Sequence(args, _) => tree.get_args(args).iter().all(|a| self.expr(tree, *a)),
            Expression::BinaryOperator(l, _, r) => self.expr(tree, *l) && self.expr(tree, *r),
            Expression::UnaryOperator(_, child) => self.expr(tree, *child),
        }
    }
}
