use super::{
    DatePart, DateUnit, FormatPiece, Fragment, InferredType as T, Result, Settings,
    TranslationContext, arg as get_arg, format_pieces, integer, ok, single_array, unit_arg,
    postgres::{self, count_scalar, translate_binary_op},
};
use crate::{
    ast,
    dialect::Dialect,
    error::Error,
    functions::FormulaFunction as F,
    sql::{BinaryOp, Expression, UnaryOp, When},
};

/// Exponents up to this size are unrolled into a multiplication chain.
const MAX_UNROLLED_EXPONENT: i64 = 32;
/// Newton iterations used to emulate SQRT.
const SQRT_ITERATIONS: usize = 64;

/// SQLite lacks a lot of the numeric and date functions Postgres has; most of
///  them are emulated here. Everything else is delegated to Postgres.
#[derive(Debug, Clone)]
pub struct SqliteTranslator {
    pub settings: Settings,
}

impl TranslationContext for SqliteTranslator {
    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn translate_fn_call(&self, func: &F, args: &[Fragment]) -> Result {
        translate_fn_call(self, func, args)
    }

    fn translate_binary_op(&self, l: Fragment, op: ast::BinaryOp, r: Fragment) -> Result {
        match op {
            // integer division truncates otherwise
            ast::BinaryOp::Div => ok(
                Expression::binary(
                    Expression::cast(self.numeric(&l), "REAL"),
                    BinaryOp::Div,
                    self.numeric(&r),
                ),
                T::Number,
            ),
            _ => translate_binary_op(self, l, op, r),
        }
    }

    fn ceil(&self, value: Expression) -> Expression {
        let truncated = Expression::cast(value.clone(), "INTEGER");
        Expression::binary(
            truncated.clone(),
            BinaryOp::Add,
            Expression::binary(value, BinaryOp::Gt, truncated),
        )
    }

    fn floor(&self, value: Expression) -> Expression {
        let truncated = Expression::cast(value.clone(), "INTEGER");
        Expression::binary(
            truncated.clone(),
            BinaryOp::Sub,
            Expression::binary(value, BinaryOp::Lt, truncated),
        )
    }

    fn power(&self, base: Expression, exponent: &Fragment) -> Expression {
        match exponent.expr.as_integer_literal() {
            Some(0) => Expression::NumberLiteral("1.0".into()),
            Some(n) if n.abs() <= MAX_UNROLLED_EXPONENT => {
                let product = Expression::Sequence(
                    BinaryOp::Mul,
                    std::iter::repeat_n(base, n.unsigned_abs() as usize).collect(),
                );
                if n < 0 {
                    Expression::binary(Expression::NumberLiteral("1.0".into()), BinaryOp::Div, product)
                } else {
                    product
                }
            }
            // fractional exponents are truncated
            _ => {
                let n = Expression::cast(self.numeric(exponent), "INTEGER");
                Expression::Raw(format!(
                    "(WITH RECURSIVE p(i, acc) AS (SELECT 0, 1.0 UNION ALL SELECT i + 1, acc * ({base}) FROM p WHERE i < ABS({n})) SELECT CASE WHEN {n} < 0 THEN 1.0 / acc ELSE acc END FROM p ORDER BY i DESC LIMIT 1)"
                ))
            }
        }
    }

    fn position(&self, haystack: Expression, needle: Expression) -> Expression {
        Expression::call("INSTR", vec![haystack, needle])
    }

    // SQLite has no time zone database: parts are taken as stored
    fn date_part(&self, part: DatePart, value: &Fragment) -> Expression {
        let spec = match part {
            DatePart::Year => "%Y",
            DatePart::Month => "%m",
            DatePart::Week => "%W",
            DatePart::Day => "%d",
            DatePart::DayOfWeek => "%w",
            DatePart::Hour => "%H",
            DatePart::Minute => "%M",
            DatePart::Second => "%S",
        };
        strftime_int(spec, &value.expr)
    }

    fn format_datetime(&self, value: &Fragment, format: &str) -> Expression {
        let x = &value.expr;
        let mut parts = Vec::new();
        let mut spec = String::new();
        let flush = |spec: &mut String, parts: &mut Vec<Expression>| {
            if !spec.is_empty() {
                parts.push(Expression::call(
                    "STRFTIME",
                    vec![std::mem::take(spec).into(), x.clone()],
                ));
            }
        };
        for piece in format_pieces(format) {
            let emulated = match piece {
                FormatPiece::Literal(text) => {
                    spec.push_str(&text.replace('%', "%%"));
                    continue;
                }
                FormatPiece::Token("YYYY") | FormatPiece::Token("MM") | FormatPiece::Token("DD")
                | FormatPiece::Token("HH") | FormatPiece::Token("mm") | FormatPiece::Token("ss") => {
                    spec.push_str(match piece {
                        FormatPiece::Token("YYYY") => "%Y",
                        FormatPiece::Token("MM") => "%m",
                        FormatPiece::Token("DD") => "%d",
                        FormatPiece::Token("HH") => "%H",
                        FormatPiece::Token("mm") => "%M",
                        _ => "%S",
                    });
                    continue;
                }
                FormatPiece::Token("YY") => Expression::call(
                    "SUBSTR",
                    vec![Expression::call("STRFTIME", vec!["%Y".into(), x.clone()]), 3.into()],
                ),
                FormatPiece::Token("SSS") => Expression::call(
                    "SUBSTR",
                    vec![Expression::call("STRFTIME", vec!["%f".into(), x.clone()]), 4.into()],
                ),
                FormatPiece::Token("M") => Expression::cast(strftime_int("%m", x), "TEXT"),
                FormatPiece::Token("D") => Expression::cast(strftime_int("%d", x), "TEXT"),
                FormatPiece::Token("H") => Expression::cast(strftime_int("%H", x), "TEXT"),
                FormatPiece::Token(_) => Expression::Case {
                    branches: vec![When {
                        cond: Expression::binary(strftime_int("%H", x), BinaryOp::Lt, 12.into()),
                        then: "AM".into(),
                    }],
                    r#else: Some(Box::new("PM".into())),
                },
            };
            flush(&mut spec, &mut parts);
            parts.push(emulated);
        }
        flush(&mut spec, &mut parts);
        match parts.len() {
            0 => Expression::StringLiteral(String::new()),
            1 => parts.remove(0),
            _ => Expression::Sequence(BinaryOp::Concat, parts),
        }
    }
}

fn strftime_int(spec: &str, value: &Expression) -> Expression {
    Expression::cast(
        Expression::call("STRFTIME", vec![spec.into(), value.clone()]),
        "INTEGER",
    )
}

/// The `strftime` prefix two dates must share to be in the same `unit`.
fn truncation(unit: DateUnit) -> &'static str {
    match unit {
        DateUnit::Millisecond => "%Y-%m-%d %H:%M:%f",
        DateUnit::Second => "%Y-%m-%d %H:%M:%S",
        DateUnit::Minute => "%Y-%m-%d %H:%M",
        DateUnit::Hour => "%Y-%m-%d %H",
        DateUnit::Day => "%Y-%m-%d",
        DateUnit::Week => "%Y-%W",
        DateUnit::Month | DateUnit::Quarter => "%Y-%m",
        DateUnit::Year => "%Y",
    }
}

/// `DATETIME` modifier name and multiplier for a unit.
fn modifier(unit: DateUnit) -> (&'static str, &'static str) {
    match unit {
        DateUnit::Millisecond => ("seconds", "0.001"),
        DateUnit::Second => ("seconds", "1"),
        DateUnit::Minute => ("minutes", "1"),
        DateUnit::Hour => ("hours", "1"),
        DateUnit::Day => ("days", "1"),
        DateUnit::Week => ("days", "7"),
        DateUnit::Month => ("months", "1"),
        DateUnit::Quarter => ("months", "3"),
        DateUnit::Year => ("years", "1"),
    }
}

/// Array elements with nested JSON kept as JSON.
fn element_value(alias: &str) -> String {
    format!("CASE WHEN {alias}.type IN ('object', 'array') THEN json({alias}.value) ELSE {alias}.value END")
}

pub fn translate_fn_call<C: TranslationContext + ?Sized>(
    cx: &C,
    func: &F,
    args: &[Fragment],
) -> Result {
    let arg = |index: usize| get_arg(func, args, index);
    let num = |index: usize| arg(index).map(|a| cx.numeric(a));
    let text = |index: usize| arg(index).map(|a| cx.text(a));
    let call = |name: &str, args: Vec<Expression>, ty: T| ok(Expression::call(name, args), ty);

    match func {
        F::Max | F::Min if args.len() == 1 => ok(num(0)?, T::Number),
        F::Max | F::Min => call(
            if func == &F::Max { "MAX" } else { "MIN" },
            args.iter().map(|a| cx.numeric(a)).collect(),
            T::Number,
        ),
        F::Round => {
            let precision = args.get(1).map(|p| integer(cx, p)).unwrap_or(0.into());
            call("ROUND", vec![num(0)?, precision], T::Number)
        }
        F::Sqrt => {
            let v = num(0)?;
            ok(
                Expression::Raw(format!(
                    "CASE WHEN {v} IS NULL OR {v} < 0 THEN NULL WHEN {v} = 0 THEN 0.0 ELSE (WITH RECURSIVE s(i, x) AS (SELECT 0, CAST({v} AS REAL) UNION ALL SELECT i + 1, (x + CAST({v} AS REAL) / x) / 2.0 FROM s WHERE i < {SQRT_ITERATIONS}) SELECT x FROM s ORDER BY i DESC LIMIT 1) END"
                )),
                T::Number,
            )
        }
        F::Log => {
            let base = args.get(1).map(|b| cx.numeric(b)).unwrap_or(10.into());
            call("LOG", vec![base, num(0)?], T::Number)
        }
        F::Mod => {
            let (x, y) = (num(0)?, num(1)?);
            ok(
                Expression::Raw(format!("({x} - {y} * CAST(CAST({x} AS REAL) / {y} AS INTEGER))")),
                T::Number,
            )
        }
        F::Left => {
            let count = args.get(1).map(|n| integer(cx, n)).unwrap_or(1.into());
            call("SUBSTR", vec![text(0)?, 1.into(), count], T::String)
        }
        F::Right => {
            let count = args.get(1).map(|n| integer(cx, n)).unwrap_or(1.into());
            let tail = Expression::call(
                "SUBSTR",
                vec![
                    text(0)?,
                    Expression::UnaryOperator(UnaryOp::Neg, Box::new(count.clone())),
                ],
            );
            match count.as_integer_literal() {
                Some(n) if n > 0 => ok(tail, T::String),
                _ => ok(
                    Expression::Case {
                        branches: vec![When {
                            cond: Expression::binary(count, BinaryOp::Le, 0.into()),
                            then: cx.string_literal(""),
                        }],
                        r#else: Some(Box::new(tail)),
                    },
                    T::String,
                ),
            }
        }
        F::Replace => {
            let (value, start, count) = (text(0)?, integer(cx, arg(1)?), integer(cx, arg(2)?));
            ok(
                Expression::Sequence(
                    BinaryOp::Concat,
                    vec![
                        Expression::call(
                            "SUBSTR",
                            vec![
                                value.clone(),
                                1.into(),
                                Expression::binary(start.clone(), BinaryOp::Sub, 1.into()),
                            ],
                        ),
                        text(3)?,
                        Expression::call(
                            "SUBSTR",
                            vec![value, Expression::binary(start, BinaryOp::Add, count)],
                        ),
                    ],
                ),
                T::String,
            )
        }
        F::RegexpReplace => Err(Error::UnsupportedFunction(func.name().to_string())),
        F::Rept => {
            let count = integer(cx, arg(1)?);
            ok(
                Expression::Raw(format!(
                    "REPLACE(SUBSTR(QUOTE(ZEROBLOB(({count} + 1) / 2)), 3, {count}), '0', {})",
                    text(0)?
                )),
                T::String,
            )
        }
        F::DatetimeDiff => {
            let unit = unit_arg(func, args, 2)?.unwrap_or(DateUnit::Day);
            let (a, b) = (&arg(0)?.expr, &arg(1)?.expr);
            let sql = match unit.seconds() {
                Some(seconds) => format!(
                    "((JULIANDAY({a}) - JULIANDAY({b})) * 86400.0 / {seconds:?})"
                ),
                None => {
                    let years = format!("({} - {})", strftime_int("%Y", a), strftime_int("%Y", b));
                    let months = format!(
                        "({years} * 12 + {} - {})",
                        strftime_int("%m", a),
                        strftime_int("%m", b)
                    );
                    match unit {
                        DateUnit::Quarter => format!("({months} / 3)"),
                        DateUnit::Year => years,
                        _ => months,
                    }
                }
            };
            ok(Expression::Raw(sql), T::Number)
        }
        F::Workday => {
            let (start, days) = (&arg(0)?.expr, integer(cx, arg(1)?));
            ok(
                Expression::Raw(format!(
                    "(WITH RECURSIVE w(d, n) AS (SELECT DATE({start}), 0 UNION ALL SELECT DATE(d, '+1 day'), n + CASE WHEN STRFTIME('%w', DATE(d, '+1 day')) NOT IN ('0', '6') THEN 1 ELSE 0 END FROM w WHERE n < {days}) SELECT MAX(d) FROM w)"
                )),
                T::DateTime,
            )
        }
        F::WorkdayDiff => {
            let (a, b) = (&arg(0)?.expr, &arg(1)?.expr);
            ok(
                Expression::Raw(format!(
                    "(WITH RECURSIVE w(d) AS (SELECT DATE({a}) UNION ALL SELECT DATE(d, '+1 day') FROM w WHERE d < DATE({b})) SELECT COUNT(*) FROM w WHERE STRFTIME('%w', d) NOT IN ('0', '6'))"
                )),
                T::Number,
            )
        }
        F::IsSame | F::IsAfter | F::IsBefore => {
            let op = match func {
                F::IsSame => BinaryOp::Eq,
                F::IsAfter => BinaryOp::Gt,
                _ => BinaryOp::Lt,
            };
            let (a, b) = (&arg(0)?.expr, &arg(1)?.expr);
            let (a, b) = match unit_arg(func, args, 2)? {
                Some(DateUnit::Quarter) => {
                    let quarter = |v: &Expression| {
                        Expression::Raw(format!(
                            "(STRFTIME('%Y', {v}) || '-' || (({} + 2) / 3))",
                            strftime_int("%m", v)
                        ))
                    };
                    (quarter(a), quarter(b))
                }
                Some(unit) => {
                    let spec = truncation(unit);
                    (
                        Expression::call("STRFTIME", vec![spec.into(), a.clone()]),
                        Expression::call("STRFTIME", vec![spec.into(), b.clone()]),
                    )
                }
                None => (
                    Expression::call("DATETIME", vec![a.clone()]),
                    Expression::call("DATETIME", vec![b.clone()]),
                ),
            };
            ok(Expression::binary(a, op, b), T::Boolean)
        }
        F::DateAdd => {
            let unit = unit_arg(func, args, 2)?.ok_or_else(|| super::wrong_type(func, 2))?;
            let (name, factor) = modifier(unit);
            ok(
                Expression::Raw(format!(
                    "DATETIME({}, CAST(({}) * {factor} AS TEXT) || ' {name}')",
                    arg(0)?.expr,
                    num(1)?
                )),
                T::DateTime,
            )
        }
        F::DatetimeParse => call("DATETIME", vec![text(0)?], T::DateTime),

        // Arrays go through json_each
        F::CountA => {
            let counts = args
                .iter()
                .map(|a| {
                    Expression::Raw(if a.is_array {
                        format!(
                            "(SELECT COUNT(*) FROM json_each({}) AS e WHERE e.type <> 'null' AND CAST(e.value AS TEXT) <> '')",
                            a.expr
                        )
                    } else {
                        format!(
                            "CASE WHEN {} IS NULL OR {} = '' THEN 0 ELSE 1 END",
                            a.expr,
                            cx.text(a)
                        )
                    })
                })
                .collect();
            ok(Expression::Sequence(BinaryOp::Add, counts), T::Number)
        }
        F::Count => {
            let counts = args
                .iter()
                .map(|a| {
                    Expression::Raw(if a.is_array {
                        format!(
                            "(SELECT COUNT(*) FROM json_each({}) AS e WHERE e.type IN ('integer', 'real'))",
                            a.expr
                        )
                    } else {
                        count_scalar(cx, a)
                    })
                })
                .collect();
            ok(Expression::Sequence(BinaryOp::Add, counts), T::Number)
        }
        F::ArrayJoin => {
            let value = arg(0)?;
            if !value.is_array {
                return ok(cx.text(value), T::String);
            }
            let separator = args
                .get(1)
                .map(|s| cx.text(s))
                .unwrap_or_else(|| cx.string_literal(", "));
            ok(
                Expression::Raw(format!(
                    "(SELECT group_concat(e.value, {separator}) FROM json_each({}) AS e)",
                    value.expr
                )),
                T::String,
            )
        }
        F::ArrayUnique => {
            let value = arg(0)?;
            if !value.is_array {
                return Ok(Fragment::array(single_array(cx, value), value.ty));
            }
            let x = &value.expr;
            Ok(Fragment::array(
                Expression::Raw(format!(
                    "(SELECT json_group_array({}) FROM json_each({x}) AS e WHERE NOT EXISTS (SELECT 1 FROM json_each({x}) AS p WHERE p.value IS e.value AND p.key < e.key))",
                    element_value("e")
                )),
                value.ty,
            ))
        }
        F::ArrayCompact => {
            let value = arg(0)?;
            if !value.is_array {
                return Ok(Fragment::array(single_array(cx, value), value.ty));
            }
            Ok(Fragment::array(
                Expression::Raw(format!(
                    "(SELECT json_group_array({}) FROM json_each({}) AS e WHERE e.type <> 'null' AND NOT (e.type = 'text' AND e.value = ''))",
                    element_value("e"),
                    value.expr
                )),
                value.ty,
            ))
        }

        F::Sum
        | F::Average
        | F::RoundUp
        | F::RoundDown
        | F::Ceiling
        | F::Floor
        | F::Even
        | F::Odd
        | F::Int
        | F::Abs
        | F::Power
        | F::Exp
        | F::Value
        | F::Concatenate
        | F::Find
        | F::Search
        | F::Mid
        | F::Substitute
        | F::Lower
        | F::Upper
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
        | F::Datestr
        | F::Timestr
        | F::DatetimeFormat
        | F::CreatedTime
        | F::LastModifiedTime
        | F::CountAll
        | F::ArrayFlatten
        | F::RecordId
        | F::AutoNumber
        | F::TextAll
        | F::Unknown(_) => postgres::translate_fn_call(cx, func, args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::Mode;
    use pretty_assertions::assert_eq;
    use rusqlite::{Connection, types::Value};

    fn cx() -> SqliteTranslator {
        SqliteTranslator {
            settings: Settings::new(Mode::Select),
        }
    }

    fn number(v: &str) -> Fragment {
        Fragment::new(Expression::NumberLiteral(v.into()), T::Number)
    }

    fn string(v: &str) -> Fragment {
        Fragment::new(Expression::StringLiteral(v.into()), T::String)
    }

    fn eval(fragment: &Fragment) -> Value {
        let conn = Connection::open_in_memory().expect("in-memory db");
        conn.query_row(&format!("SELECT {}", fragment.expr), [], |row| row.get(0))
            .expect("query runs")
    }

    fn call(func: F, args: &[Fragment]) -> Fragment {
        cx().translate_fn_call(&func, args).expect("translates")
    }

    #[test]
    fn emulated_numeric_functions() {
        assert_eq!(eval(&call(F::Power, &[number("2"), number("10")])), Value::Integer(1024));
        assert_eq!(eval(&call(F::Power, &[number("2"), number("-1")])), Value::Real(0.5));
        assert_eq!(eval(&call(F::Ceiling, &[number("1.2")])), Value::Integer(2));
        assert_eq!(eval(&call(F::Floor, &[number("-1.2")])), Value::Integer(-2));
        assert_eq!(eval(&call(F::Mod, &[number("7"), number("3")])), Value::Integer(1));
        let Value::Real(root) = eval(&call(F::Sqrt, &[number("2")])) else {
            panic!("expected a real");
        };
        assert!((root - std::f64::consts::SQRT_2).abs() < 1e-9);
        assert_eq!(eval(&call(F::Sqrt, &[number("-4")])), Value::Null);
    }

    #[test]
    fn text_functions() {
        assert_eq!(
            eval(&call(F::Rept, &[string("ab"), number("3")])),
            Value::Text("ababab".into())
        );
        assert_eq!(
            eval(&call(F::Right, &[string("hello"), number("3")])),
            Value::Text("llo".into())
        );
        assert_eq!(
            eval(&call(F::Replace, &[string("hello"), number("2"), number("3"), string("EY")])),
            Value::Text("hEYo".into())
        );
        assert_eq!(
            eval(&call(F::Find, &[string("l"), string("hello"), number("4")])),
            Value::Integer(4)
        );
        assert_eq!(
            eval(&call(F::EncodeUrlComponent, &[string("a b&c")])),
            Value::Text("a%20b%26c".into())
        );
    }

    #[test]
    fn dates() {
        let date = || string("2024-03-05 14:07:09");
        assert_eq!(eval(&call(F::Year, &[date()])), Value::Integer(2024));
        assert_eq!(
            eval(&call(F::DatetimeFormat, &[date(), string("D/M/YY h:mm A")])),
            Value::Text("5/3/24 h:07 PM".into())
        );
        assert_eq!(
            eval(&call(F::DateAdd, &[date(), number("2"), string("week")])),
            Value::Text("2024-03-19 14:07:09".into())
        );
        assert_eq!(
            eval(&call(F::DatetimeDiff, &[string("2024-03-06"), string("2024-03-05"), string("h")])),
            Value::Real(24.0)
        );
        // Friday + 1 working day is Monday
        assert_eq!(
            eval(&call(F::Workday, &[string("2024-03-08"), number("1")])),
            Value::Text("2024-03-11".into())
        );
    }

    #[test]
    fn regexp_replace_is_unsupported() {
        assert_eq!(
            cx().translate_fn_call(&F::RegexpReplace, &[string("a"), string("b"), string("c")]),
            Err(Error::UnsupportedFunction("REGEXP_REPLACE".into()))
        );
    }

    #[test]
    fn division_is_real() {
        let div = cx()
            .translate_binary_op(number("1"), ast::BinaryOp::Div, number("2"))
            .expect("translates");
        assert_eq!(div.expr.to_string(), "(CAST(1 AS REAL) / 2)");
        assert_eq!(eval(&div), Value::Real(0.5));
    }

    #[test]
    fn concatenated_numbers_match_postgres() {
        let cx = cx();
        let half = cx
            .translate_binary_op(number("4"), ast::BinaryOp::Div, number("2"))
            .expect("translates");
        let joined = cx
            .translate_binary_op(string("a"), ast::BinaryOp::Concat, half)
            .expect("translates");
        assert_eq!(eval(&joined), Value::Text("a2".into()));
        let joined = cx
            .translate_binary_op(string("a"), ast::BinaryOp::Concat, number("2.5"))
            .expect("translates");
        assert_eq!(eval(&joined), Value::Text("a2.5".into()));
    }

    #[test]
    fn mixed_if_branches_read_as_text() {
        let yes = Fragment::new(Expression::Raw("1 = 1".into()), T::Boolean);
        let out = call(F::If, &[yes, number("2"), string("x")]);
        assert_eq!(out.ty, T::String);
        assert_eq!(eval(&out), Value::Text("2".into()));
    }

    #[test]
    fn arrays() {
        let array = Fragment::array(Expression::StringLiteral(r#"["a","","a",null,"b"]"#.into()), T::String);
        assert_eq!(
            eval(&call(F::ArrayUnique, &[array.clone()])),
            Value::Text(r#"["a","",null,"b"]"#.into())
        );
        assert_eq!(
            eval(&call(F::ArrayCompact, &[array.clone()])),
            Value::Text(r#"["a","a","b"]"#.into())
        );
        assert_eq!(eval(&call(F::CountA, &[array.clone()])), Value::Integer(3));
        assert_eq!(eval(&call(F::CountAll, &[array])), Value::Integer(5));
    }
}
