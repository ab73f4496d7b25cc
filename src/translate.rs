use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

use crate::{
    ast,
    dialect::{Dialect, DialectProvider},
    error::Error,
    functions::FormulaFunction,
    schema::ValueKind,
    sql::{BinaryOp, Expression, UnaryOp, When},
};

pub mod postgres;
pub mod sqlite;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum InferredType {
    String,
    Number,
    Boolean,
    DateTime,
    Unknown,
}

impl From<ValueKind> for InferredType {
    fn from(kind: ValueKind) -> Self {
        match kind {
            ValueKind::String => InferredType::String,
            ValueKind::Number => InferredType::Number,
            ValueKind::Boolean => InferredType::Boolean,
            ValueKind::DateTime => InferredType::DateTime,
        }
    }
}

/// Where the compiled SQL is going to live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Mode {
    /// A generated column: immutable functions only, unqualified columns
    Generated,
    /// A SELECT list entry
    #[default]
    Select,
}

/// A translated sub-expression along with what we know about its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub expr: Expression,
    pub ty: InferredType,
    /// The value is a JSON array (multi-valued field or array function)
    pub is_array: bool,
}

impl Fragment {
    pub fn new(expr: Expression, ty: InferredType) -> Self {
        Self {
            expr,
            ty,
            is_array: false,
        }
    }

    pub fn array(expr: Expression, ty: InferredType) -> Self {
        Self {
            expr,
            ty,
            is_array: true,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.expr.is_blank_literal()
    }
}

pub type Result = std::result::Result<Fragment, Error>;

fn ok(expr: Expression, ty: InferredType) -> Result {
    Ok(Fragment::new(expr, ty))
}

/// Per-compile translation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub mode: Mode,
    /// IANA name used when extracting date parts
    pub timezone: String,
    /// What `NOW()`/`TODAY()` freeze to in generated columns
    pub now: DateTime<Utc>,
    /// Table alias for column references in select mode
    pub alias: Option<String>,
}

impl Settings {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            timezone: "UTC".to_string(),
            now: Utc::now(),
            alias: None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(Mode::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePart {
    Year,
    Month,
    Week,
    Day,
    DayOfWeek,
    Hour,
    Minute,
    Second,
}

/// Units accepted by the date arithmetic functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl DateUnit {
    /// Short units are case sensitive (`m` is minutes, `M` months), long
    ///  names are not.
    pub fn parse(unit: &str) -> Option<Self> {
        let unit = unit.trim();
        match unit {
            "ms" => return Some(DateUnit::Millisecond),
            "s" => return Some(DateUnit::Second),
            "m" => return Some(DateUnit::Minute),
            "h" => return Some(DateUnit::Hour),
            "d" => return Some(DateUnit::Day),
            "w" => return Some(DateUnit::Week),
            "M" => return Some(DateUnit::Month),
            "Q" => return Some(DateUnit::Quarter),
            "y" => return Some(DateUnit::Year),
            _ => {}
        }
        match unit.to_ascii_lowercase().trim_end_matches('s') {
            "millisecond" => Some(DateUnit::Millisecond),
            "second" => Some(DateUnit::Second),
            "minute" => Some(DateUnit::Minute),
            "hour" => Some(DateUnit::Hour),
            "day" => Some(DateUnit::Day),
            "week" => Some(DateUnit::Week),
            "month" => Some(DateUnit::Month),
            "quarter" => Some(DateUnit::Quarter),
            "year" => Some(DateUnit::Year),
            _ => None,
        }
    }

    /// Length in seconds of the fixed-length units.
    pub fn seconds(&self) -> Option<f64> {
        match self {
            DateUnit::Millisecond => Some(0.001),
            DateUnit::Second => Some(1.0),
            DateUnit::Minute => Some(60.0),
            DateUnit::Hour => Some(3600.0),
            DateUnit::Day => Some(86400.0),
            DateUnit::Week => Some(604800.0),
            DateUnit::Month | DateUnit::Quarter | DateUnit::Year => None,
        }
    }
}

/// A piece of a `DATETIME_FORMAT` pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatPiece<'a> {
    Literal(&'a str),
    Token(&'a str),
}

static FORMAT_TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("YYYY|YY|SSS|MM|DD|HH|mm|ss|M|D|H|A").expect("valid token pattern"));

/// Splits a formula date format (`YYYY-MM-DD HH:mm`) into tokens and the
///  literal text between them.
pub fn format_pieces(format: &str) -> Vec<FormatPiece<'_>> {
    let mut pieces = Vec::new();
    let mut last = 0;
    for m in FORMAT_TOKENS.find_iter(format) {
        if m.start() > last {
            pieces.push(FormatPiece::Literal(&format[last..m.start()]));
        }
        pieces.push(FormatPiece::Token(m.as_str()));
        last = m.end();
    }
    if last < format.len() {
        pieces.push(FormatPiece::Literal(&format[last..]));
    }
    pieces
}

/// This trait lets each dialect control translation. A new target delegates
///  to the Postgres translator and intercepts whatever differs, the way
///  [sqlite::SqliteTranslator] does.
pub trait TranslationContext {
    fn settings(&self) -> &Settings;

    fn dialect(&self) -> Dialect;

    /// Translates a function call whose arguments are already translated.
    fn translate_fn_call(&self, func: &FormulaFunction, args: &[Fragment]) -> Result;

    fn translate_binary_op(&self, l: Fragment, op: ast::BinaryOp, r: Fragment) -> Result;

    fn ceil(&self, value: Expression) -> Expression;

    fn floor(&self, value: Expression) -> Expression;

    fn power(&self, base: Expression, exponent: &Fragment) -> Expression;

    /// 1-based position of `needle` in `haystack`, 0 when absent.
    fn position(&self, haystack: Expression, needle: Expression) -> Expression;

    /// An integer date part, in the configured timezone where supported.
    fn date_part(&self, part: DatePart, value: &Fragment) -> Expression;

    fn format_datetime(&self, value: &Fragment, format: &str) -> Expression;

    fn translate_unary_op(&self, op: ast::UnaryOp, value: Fragment) -> Result {
        match op {
            ast::UnaryOp::Not => ok(
                Expression::UnaryOperator(UnaryOp::Not, Box::new(self.truthy(&value))),
                InferredType::Boolean,
            ),
            ast::UnaryOp::Neg => ok(
                Expression::UnaryOperator(UnaryOp::Neg, Box::new(self.numeric(&value))),
                InferredType::Number,
            ),
        }
    }

    fn provider(&self) -> &'static dyn DialectProvider {
        self.dialect().provider()
    }

    /// A column of the table being compiled.
    fn column(&self, name: &str) -> Expression {
        let settings = self.settings();
        match settings.mode {
            Mode::Generated => Expression::column(None, name),
            Mode::Select => Expression::column(settings.alias.as_deref(), name),
        }
    }

    fn string_literal(&self, value: &str) -> Expression {
        match (self.dialect(), self.settings().mode) {
            (Dialect::Postgres, Mode::Generated) => {
                Expression::TypedStringLiteral(value.to_string(), "text")
            }
            _ => Expression::StringLiteral(value.to_string()),
        }
    }

    fn text(&self, value: &Fragment) -> Expression {
        match value.ty {
            _ if value.is_array => Expression::Raw(self.provider().text_cast(&value.expr.to_string())),
            InferredType::String => value.expr.clone(),
            InferredType::Number => Expression::Raw(self.provider().number_text(&value.expr.to_string())),
            _ => Expression::Raw(self.provider().text_cast(&value.expr.to_string())),
        }
    }

    /// The fragment as a number; text goes through the safe coercion.
    fn numeric(&self, value: &Fragment) -> Expression {
        match value.ty {
            InferredType::String => {
                Expression::Raw(self.provider().coerce_numeric(&value.expr.to_string()))
            }
            _ => value.expr.clone(),
        }
    }

    /// The fragment as a boolean condition.
    fn truthy(&self, value: &Fragment) -> Expression {
        let expr = value.expr.to_string();
        let sql = match value.ty {
            InferredType::Boolean => return value.expr.clone(),
            InferredType::Number => format!("(COALESCE({expr}, 0) <> 0)"),
            InferredType::String if !value.is_array => format!("(COALESCE({expr}, '') <> '')"),
            _ => format!("({expr} IS NOT NULL)"),
        };
        Expression::Raw(sql)
    }

    /// `COALESCE(text, '')`, the operand form used by concatenation.
    fn concat_operand(&self, value: &Fragment) -> Expression {
        Expression::call("COALESCE", vec![self.text(value), self.string_literal("")])
    }

    fn now(&self) -> Fragment {
        let settings = self.settings();
        let expr = match (settings.mode, self.dialect()) {
            (Mode::Select, Dialect::Postgres) => Expression::call("NOW", vec![]),
            (Mode::Select, Dialect::Sqlite) => Expression::call("DATETIME", vec!["now".into()]),
            (Mode::Generated, Dialect::Postgres) => Expression::TypedStringLiteral(
                settings.now.format("%Y-%m-%d %H:%M:%S+00").to_string(),
                "timestamptz",
            ),
            (Mode::Generated, Dialect::Sqlite) => {
                Expression::StringLiteral(settings.now.format("%Y-%m-%d %H:%M:%S").to_string())
            }
        };
        Fragment::new(expr, InferredType::DateTime)
    }

    fn today(&self) -> Fragment {
        let settings = self.settings();
        let expr = match (settings.mode, self.dialect()) {
            (Mode::Select, Dialect::Postgres) => Expression::BareFunctionCall("CURRENT_DATE".into()),
            (Mode::Select, Dialect::Sqlite) => Expression::call("DATE", vec!["now".into()]),
            (Mode::Generated, Dialect::Postgres) => Expression::TypedStringLiteral(
                settings.now.format("%Y-%m-%d").to_string(),
                "date",
            ),
            (Mode::Generated, Dialect::Sqlite) => {
                Expression::StringLiteral(settings.now.format("%Y-%m-%d").to_string())
            }
        };
        Fragment::new(expr, InferredType::DateTime)
    }
}

pub(crate) fn arg<'a>(
    func: &FormulaFunction,
    args: &'a [Fragment],
    index: usize,
) -> std::result::Result<&'a Fragment, Error> {
    args.get(index)
        .ok_or_else(|| Error::IncorrectArgCount(func.name().to_string(), args.len()))
}

pub(crate) fn wrong_type(func: &FormulaFunction, index: usize) -> Error {
    Error::ArgWrongType {
        func_name: func.name().to_string(),
        wrong_arg_index: index,
    }
}

/// A literal text argument such as a unit or a format.
pub(crate) fn literal_arg<'a>(
    func: &FormulaFunction,
    args: &'a [Fragment],
    index: usize,
) -> std::result::Result<Option<&'a str>, Error> {
    match args.get(index) {
        None => Ok(None),
        Some(f) if f.expr.is_blank_literal() => Ok(None),
        Some(f) => f
            .expr
            .as_string_literal()
            .map(Some)
            .ok_or_else(|| wrong_type(func, index)),
    }
}

pub(crate) fn unit_arg(
    func: &FormulaFunction,
    args: &[Fragment],
    index: usize,
) -> std::result::Result<Option<DateUnit>, Error> {
    match literal_arg(func, args, index)? {
        None => Ok(None),
        Some(unit) => DateUnit::parse(unit)
            .map(Some)
            .ok_or_else(|| wrong_type(func, index)),
    }
}

/// `10^precision` for the rounding functions, folded when the precision is a
///  literal.
pub(crate) fn precision_factor<C: TranslationContext + ?Sized>(
    cx: &C,
    precision: Option<&Fragment>,
) -> Expression {
    match precision {
        None => Expression::NumberLiteral("1.0".into()),
        Some(p) => match p.expr.as_integer_literal() {
            Some(p) => Expression::NumberLiteral(format!("{:?}", 10f64.powi(p as i32))),
            None => cx.power(Expression::NumberLiteral("10.0".into()), p),
        },
    }
}

/// An integer argument (lengths, counts, precisions).
pub(crate) fn integer<C: TranslationContext + ?Sized>(cx: &C, value: &Fragment) -> Expression {
    if value.expr.as_integer_literal().is_some() {
        return value.expr.clone();
    }
    let ty = match cx.dialect() {
        Dialect::Postgres => "integer",
        Dialect::Sqlite => "INTEGER",
    };
    Expression::cast(cx.numeric(value), ty)
}

/// `CASE WHEN value < 0 THEN -magnitude ELSE magnitude END`
pub(crate) fn signed(value: Expression, magnitude: Expression) -> Expression {
    Expression::Case {
        branches: vec![When {
            cond: Expression::binary(value, BinaryOp::Lt, 0.into()),
            then: Expression::UnaryOperator(UnaryOp::Neg, Box::new(magnitude.clone())),
        }],
        r#else: Some(Box::new(magnitude)),
    }
}

/// A one element JSON array, NULL for NULL.
pub(crate) fn single_array<C: TranslationContext + ?Sized>(cx: &C, value: &Fragment) -> Expression {
    let builder = match cx.dialect() {
        Dialect::Postgres => "jsonb_build_array",
        Dialect::Sqlite => "json_array",
    };
    Expression::Case {
        branches: vec![When {
            cond: Expression::Raw(format!("{} IS NULL", value.expr)),
            then: Expression::Null,
        }],
        r#else: Some(Box::new(Expression::call(builder, vec![value.expr.clone()]))),
    }
}

/// Merges `CASE` branches, folding a `CASE` in else position into the outer
///  one so nested `IF`s produce a flat expression.
pub(crate) fn case(branches: Vec<When>, r#else: Option<Expression>) -> Expression {
    let mut branches = branches;
    let r#else = match r#else {
        Some(Expression::Case {
            branches: inner,
            r#else,
        }) => {
            branches.extend(inner);
            r#else
        }
        other => other.map(Box::new),
    };
    Expression::Case { branches, r#else }
}

/// Picks the result type of conditional branches and nulls out blank branches
///  when the others are typed values. Branches of different types all become
///  text.
pub(crate) fn unify_branches<C: TranslationContext + ?Sized>(
    cx: &C,
    branches: &mut [Fragment],
) -> InferredType {
    let mut typed = branches
        .iter()
        .filter(|b| !b.is_blank() && b.ty != InferredType::Unknown)
        .map(|b| b.ty);
    let ty = match typed.next() {
        Some(first) if typed.all(|t| t == first) => first,
        Some(_) => InferredType::String,
        None => branches
            .iter()
            .map(|b| b.ty)
            .find(|t| *t != InferredType::Unknown)
            .unwrap_or(InferredType::Unknown),
    };
    if matches!(
        ty,
        InferredType::Number | InferredType::Boolean | InferredType::DateTime
    ) {
        for branch in branches.iter_mut().filter(|b| b.is_blank()) {
            branch.expr = Expression::Null;
            branch.ty = ty;
        }
    } else if ty == InferredType::String {
        // keep every branch textual so CASE arms share a type
        for branch in branches.iter_mut().filter(|b| {
            b.ty != InferredType::String && b.ty != InferredType::Unknown && !b.is_array
        }) {
            branch.expr = cx.text(branch);
            branch.ty = InferredType::String;
        }
    }
    ty
}

/// Concatenation: `COALESCE(a, '') || COALESCE(b, '')`.
pub(crate) fn concat<C: TranslationContext + ?Sized>(cx: &C, l: &Fragment, r: &Fragment) -> Result {
    let left = match &l.expr {
        Expression::Sequence(BinaryOp::Concat, _) if l.ty == InferredType::String => l.expr.clone(),
        _ => cx.concat_operand(l),
    };
    ok(
        Expression::chain(left, BinaryOp::Concat, cx.concat_operand(r)),
        InferredType::String,
    )
}

pub fn translator(dialect: Dialect, settings: Settings) -> Box<dyn TranslationContext> {
    match dialect {
        Dialect::Postgres => Box::new(postgres::PostgresTranslator { settings }),
        Dialect::Sqlite => Box::new(sqlite::SqliteTranslator { settings }),
    }
}
