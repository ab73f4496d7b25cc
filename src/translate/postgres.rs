use super::{
    DatePart, DateUnit, FormatPiece, Fragment, InferredType as T, Result, Settings,
    TranslationContext, arg as get_arg, case, concat, format_pieces, integer, literal_arg, ok,
    precision_factor, signed, single_array, unify_branches, unit_arg,
};
use crate::{
    ast,
    dialect::Dialect,
    error::Error,
    functions::FormulaFunction as F,
    schema::{AUTO_NUMBER, CREATED_TIME, LAST_MODIFIED_TIME, RECORD_ID},
    sql::{BinaryOp, Expression, UnaryOp, When, quote_literal},
};

/// Characters escaped by `ENCODE_URL_COMPONENT`. `%` has to come first.
pub(crate) const URL_ESCAPES: &[(&str, &str)] = &[
    ("%", "%25"),
    (" ", "%20"),
    ("\"", "%22"),
    ("#", "%23"),
    ("$", "%24"),
    ("&", "%26"),
    ("+", "%2B"),
    (",", "%2C"),
    ("/", "%2F"),
    (":", "%3A"),
    (";", "%3B"),
    ("<", "%3C"),
    ("=", "%3D"),
    (">", "%3E"),
    ("?", "%3F"),
    ("@", "%40"),
    ("[", "%5B"),
    ("]", "%5D"),
];

/// The Postgres translator, also the default every other dialect falls back on.
#[derive(Debug, Clone)]
pub struct PostgresTranslator {
    pub settings: Settings,
}

impl TranslationContext for PostgresTranslator {
    fn settings(&self) -> &Settings {
        &self.settings
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn translate_fn_call(&self, func: &F, args: &[Fragment]) -> Result {
        translate_fn_call(self, func, args)
    }

    fn translate_binary_op(&self, l: Fragment, op: ast::BinaryOp, r: Fragment) -> Result {
        translate_binary_op(self, l, op, r)
    }

    fn ceil(&self, value: Expression) -> Expression {
        Expression::call("CEIL", vec![value])
    }

    fn floor(&self, value: Expression) -> Expression {
        Expression::call("FLOOR", vec![value])
    }

    fn power(&self, base: Expression, exponent: &Fragment) -> Expression {
        Expression::call("POWER", vec![base, self.numeric(exponent)])
    }

    fn position(&self, haystack: Expression, needle: Expression) -> Expression {
        Expression::call("STRPOS", vec![haystack, needle])
    }

    fn date_part(&self, part: DatePart, value: &Fragment) -> Expression {
        let field = match part {
            DatePart::Year => "YEAR",
            DatePart::Month => "MONTH",
            DatePart::Week => "WEEK",
            DatePart::Day => "DAY",
            DatePart::DayOfWeek => "DOW",
            DatePart::Hour => "HOUR",
            DatePart::Minute => "MINUTE",
            DatePart::Second => "SECOND",
        };
        Expression::Raw(format!(
            "CAST(EXTRACT({field} FROM {}) AS integer)",
            self.local_time(value)
        ))
    }

    fn format_datetime(&self, value: &Fragment, format: &str) -> Expression {
        Expression::call(
            "TO_CHAR",
            vec![
                Expression::Raw(self.local_time(value)),
                self.string_literal(&pattern(format)),
            ],
        )
    }
}

impl PostgresTranslator {
    /// `(ts AT TIME ZONE 'tz')`
    fn local_time(&self, value: &Fragment) -> String {
        format!(
            "({} AT TIME ZONE {})",
            timestamp(value),
            quote_literal(&self.settings.timezone)
        )
    }
}

/// Text and unknown values are cast so date functions accept them.
fn timestamp(value: &Fragment) -> Expression {
    match value.ty {
        T::String => Expression::cast(value.expr.clone(), "timestamptz"),
        _ => value.expr.clone(),
    }
}

/// Converts formula format tokens into a `to_char` pattern. Literal runs are
///  double quoted so letters in them aren't read as patterns.
pub(crate) fn pattern(format: &str) -> String {
    format_pieces(format)
        .into_iter()
        .map(|piece| match piece {
            FormatPiece::Token(token) => match token {
                "YYYY" => "YYYY".to_string(),
                "YY" => "YY".to_string(),
                "MM" => "MM".to_string(),
                "M" => "FMMM".to_string(),
                "DD" => "DD".to_string(),
                "D" => "FMDD".to_string(),
                "HH" => "HH24".to_string(),
                "H" => "FMHH24".to_string(),
                "mm" => "MI".to_string(),
                "ss" => "SS".to_string(),
                "SSS" => "MS".to_string(),
                _ => "AM".to_string(),
            },
            FormatPiece::Literal(text) if text.chars().any(|c| c.is_alphabetic()) => {
                format!("\"{}\"", text.replace('"', "\\\""))
            }
            FormatPiece::Literal(text) => text.to_string(),
        })
        .collect()
}

fn interval(unit: DateUnit) -> &'static str {
    match unit {
        DateUnit::Millisecond => "1 millisecond",
        DateUnit::Second => "1 second",
        DateUnit::Minute => "1 minute",
        DateUnit::Hour => "1 hour",
        DateUnit::Day => "1 day",
        DateUnit::Week => "1 week",
        DateUnit::Month => "1 month",
        DateUnit::Quarter => "3 months",
        DateUnit::Year => "1 year",
    }
}

fn truncation(unit: DateUnit) -> &'static str {
    match unit {
        DateUnit::Millisecond => "milliseconds",
        DateUnit::Second => "second",
        DateUnit::Minute => "minute",
        DateUnit::Hour => "hour",
        DateUnit::Day => "day",
        DateUnit::Week => "week",
        DateUnit::Month => "month",
        DateUnit::Quarter => "quarter",
        DateUnit::Year => "year",
    }
}

pub(crate) fn comparison(op: ast::BinaryOp) -> BinaryOp {
    match op {
        ast::BinaryOp::Eq => BinaryOp::Eq,
        ast::BinaryOp::Ne => BinaryOp::Ne,
        ast::BinaryOp::Lt => BinaryOp::Lt,
        ast::BinaryOp::Le => BinaryOp::Le,
        ast::BinaryOp::Gt => BinaryOp::Gt,
        _ => BinaryOp::Ge,
    }
}

/// Translates a binary operator. `+` is ambiguous: it concatenates as soon
///  as either side is text (or a date), otherwise it adds.
pub fn translate_binary_op<C: TranslationContext + ?Sized>(
    cx: &C,
    l: Fragment,
    op: ast::BinaryOp,
    r: Fragment,
) -> Result {
    use ast::BinaryOp as A;
    let textual = |f: &Fragment| matches!(f.ty, T::String | T::DateTime);
    let arithmetic = |op: BinaryOp| ok(Expression::binary(cx.numeric(&l), op, cx.numeric(&r)), T::Number);

    match op {
        A::Add if textual(&l) || textual(&r) => concat(cx, &l, &r),
        A::Concat => concat(cx, &l, &r),
        A::Add => ok(
            Expression::chain(cx.numeric(&l), BinaryOp::Add, cx.numeric(&r)),
            T::Number,
        ),
        A::Sub => arithmetic(BinaryOp::Sub),
        A::Mul => arithmetic(BinaryOp::Mul),
        A::Div => ok(
            Expression::binary(
                Expression::cast(cx.numeric(&l), "double precision"),
                BinaryOp::Div,
                cx.numeric(&r),
            ),
            T::Number,
        ),
        A::Mod => cx.translate_fn_call(&F::Mod, &[l, r]),
        A::Eq | A::Ne | A::Lt | A::Le | A::Gt | A::Ge => {
            // text compared with a number is coerced, NULL when not numeric
            let (left, right) = match (l.ty, r.ty) {
                (T::String, T::Number) => (cx.numeric(&l), r.expr),
                (T::Number, T::String) => (l.expr, cx.numeric(&r)),
                _ => (l.expr, r.expr),
            };
            ok(Expression::binary(left, comparison(op), right), T::Boolean)
        }
        A::And => ok(
            Expression::binary(cx.truthy(&l), BinaryOp::And, cx.truthy(&r)),
            T::Boolean,
        ),
        A::Or => ok(
            Expression::binary(cx.truthy(&l), BinaryOp::Or, cx.truthy(&r)),
            T::Boolean,
        ),
    }
}

// Formula functions rarely map one to one onto SQL: most of them need a small
//  bundle of casts and CASEs. Arguments arrive translated and typed.
pub fn translate_fn_call<C: TranslationContext + ?Sized>(
    cx: &C,
    func: &F,
    args: &[Fragment],
) -> Result {
    let arg = |index: usize| get_arg(func, args, index);
    let num = |index: usize| arg(index).map(|a| cx.numeric(a));
    let text = |index: usize| arg(index).map(|a| cx.text(a));
    let all_nums = || args.iter().map(|a| cx.numeric(a)).collect::<Vec<_>>();
    let call = |name: &str, args: Vec<Expression>, ty: T| ok(Expression::call(name, args), ty);
    let provider = cx.provider();

    match func {
        // Numeric
        F::Sum => ok(Expression::Sequence(BinaryOp::Add, all_nums()), T::Number),
        F::Average => ok(
            Expression::binary(
                Expression::Sequence(BinaryOp::Add, all_nums()),
                BinaryOp::Div,
                Expression::NumberLiteral(format!("{}.0", args.len())),
            ),
            T::Number,
        ),
        F::Max | F::Min if args.len() == 1 => ok(num(0)?, T::Number),
        F::Max => call("GREATEST", all_nums(), T::Number),
        F::Min => call("LEAST", all_nums(), T::Number),
        F::Round => {
            let precision = args.get(1).map(|p| integer(cx, p)).unwrap_or(0.into());
            call(
                "ROUND",
                vec![Expression::cast(num(0)?, "numeric"), precision],
                T::Number,
            )
        }
        F::RoundUp | F::RoundDown => {
            let value = num(0)?;
            let factor = precision_factor(cx, args.get(1));
            let scaled = Expression::binary(
                Expression::call("ABS", vec![value.clone()]),
                BinaryOp::Mul,
                factor.clone(),
            );
            let rounded = if func == &F::RoundUp {
                cx.ceil(scaled)
            } else {
                cx.floor(scaled)
            };
            ok(
                signed(value, Expression::binary(rounded, BinaryOp::Div, factor)),
                T::Number,
            )
        }
        F::Ceiling | F::Floor => {
            let value = num(0)?;
            let round = |v| {
                if func == &F::Ceiling {
                    cx.ceil(v)
                } else {
                    cx.floor(v)
                }
            };
            match args.get(1) {
                None => ok(round(value), T::Number),
                Some(significance) => {
                    let significance = cx.numeric(significance);
                    ok(
                        Expression::binary(
                            round(Expression::binary(value, BinaryOp::Div, significance.clone())),
                            BinaryOp::Mul,
                            significance,
                        ),
                        T::Number,
                    )
                }
            }
        }
        F::Even | F::Odd => {
            let value = num(0)?;
            let abs = Expression::call("ABS", vec![value.clone()]);
            let magnitude = if func == &F::Even {
                Expression::binary(
                    cx.ceil(Expression::binary(abs, BinaryOp::Div, Expression::NumberLiteral("2.0".into()))),
                    BinaryOp::Mul,
                    2.into(),
                )
            } else {
                let half = Expression::binary(
                    Expression::binary(abs, BinaryOp::Add, 1.into()),
                    BinaryOp::Div,
                    Expression::NumberLiteral("2.0".into()),
                );
                Expression::binary(
                    Expression::binary(cx.ceil(half), BinaryOp::Mul, 2.into()),
                    BinaryOp::Sub,
                    1.into(),
                )
            };
            ok(signed(value, magnitude), T::Number)
        }
        F::Int => ok(cx.floor(num(0)?), T::Number),
        F::Abs => call("ABS", vec![num(0)?], T::Number),
        F::Sqrt => call("SQRT", vec![num(0)?], T::Number),
        F::Power => ok(cx.power(num(0)?, arg(1)?), T::Number),
        F::Exp => call("EXP", vec![num(0)?], T::Number),
        F::Log => {
            let base = args.get(1).map(|b| cx.numeric(b)).unwrap_or(10.into());
            call(
                "LOG",
                vec![
                    Expression::cast(base, "numeric"),
                    Expression::cast(num(0)?, "numeric"),
                ],
                T::Number,
            )
        }
        F::Mod => call(
            "MOD",
            vec![
                Expression::cast(num(0)?, "numeric"),
                Expression::cast(num(1)?, "numeric"),
            ],
            T::Number,
        ),
        F::Value => ok(
            Expression::Raw(provider.coerce_numeric(&text(0)?.to_string())),
            T::Number,
        ),

        // Text
        F::Concatenate => {
            let mut acc = Fragment::new(cx.concat_operand(arg(0)?), T::String);
            for next in &args[1..] {
                acc = concat(cx, &acc, next)?;
            }
            Ok(acc)
        }
        F::Find | F::Search => {
            let (mut needle, mut haystack) = (text(0)?, text(1)?);
            if func == &F::Search {
                needle = Expression::call("LOWER", vec![needle]);
                haystack = Expression::call("LOWER", vec![haystack]);
            }
            match args.get(2) {
                None => ok(cx.position(haystack, needle), T::Number),
                Some(start) => {
                    let start = integer(cx, start);
                    let found =
                        cx.position(Expression::call("SUBSTR", vec![haystack, start.clone()]), needle);
                    ok(
                        Expression::Case {
                            branches: vec![When {
                                cond: Expression::binary(found.clone(), BinaryOp::Eq, 0.into()),
                                then: 0.into(),
                            }],
                            r#else: Some(Box::new(Expression::binary(
                                Expression::binary(found, BinaryOp::Add, start),
                                BinaryOp::Sub,
                                1.into(),
                            ))),
                        },
                        T::Number,
                    )
                }
            }
        }
        F::Mid => call(
            "SUBSTR",
            vec![text(0)?, integer(cx, arg(1)?), integer(cx, arg(2)?)],
            T::String,
        ),
        F::Left | F::Right => {
            let count = args.get(1).map(|n| integer(cx, n)).unwrap_or(1.into());
            let name = if func == &F::Left { "LEFT" } else { "RIGHT" };
            call(name, vec![text(0)?, count], T::String)
        }
        F::Replace => ok(
            Expression::Raw(format!(
                "OVERLAY({} PLACING {} FROM {} FOR {})",
                text(0)?,
                text(3)?,
                integer(cx, arg(1)?),
                integer(cx, arg(2)?)
            )),
            T::String,
        ),
        F::RegexpReplace => call(
            "REGEXP_REPLACE",
            vec![text(0)?, text(1)?, text(2)?, cx.string_literal("g")],
            T::String,
        ),
        F::Substitute => call("REPLACE", vec![text(0)?, text(1)?, text(2)?], T::String),
        F::Lower => call("LOWER", vec![text(0)?], T::String),
        F::Upper => call("UPPER", vec![text(0)?], T::String),
        F::Trim => call("TRIM", vec![text(0)?], T::String),
        F::Rept => call("REPEAT", vec![text(0)?, integer(cx, arg(1)?)], T::String),
        F::Len => call("LENGTH", vec![text(0)?], T::Number),
        F::T => match arg(0)? {
            value if value.ty == T::String && !value.is_array => Ok(value.clone()),
            _ => ok(cx.string_literal(""), T::String),
        },
        F::EncodeUrlComponent => {
            let encoded = URL_ESCAPES.iter().fold(text(0)?, |acc, (from, to)| {
                Expression::call(
                    "REPLACE",
                    vec![acc, cx.string_literal(from), cx.string_literal(to)],
                )
            });
            ok(encoded, T::String)
        }

        // Logical
        F::If => {
            let cond = cx.truthy(arg(0)?);
            let has_else = args.len() > 2;
            let mut branches = vec![
                arg(1)?.clone(),
                args.get(2)
                    .cloned()
                    .unwrap_or(Fragment::new(Expression::Null, T::Unknown)),
            ];
            let ty = unify_branches(cx, &mut branches);
            let mut branches = branches.into_iter();
            let then = branches.next().map(|b| b.expr).unwrap_or(Expression::Null);
            let r#else = branches.next().map(|b| b.expr).filter(|_| has_else);
            ok(case(vec![When { cond, then }], r#else), ty)
        }
        F::Switch => {
            let subject = arg(0)?;
            let rest = &args[1..];
            let (pairs, default) = if rest.len() % 2 == 1 {
                (&rest[..rest.len() - 1], rest.last())
            } else {
                (rest, None)
            };
            let mut results: Vec<Fragment> = pairs
                .chunks(2)
                .filter_map(|pair| pair.get(1).cloned())
                .chain(default.cloned())
                .collect();
            let ty = unify_branches(cx, &mut results);
            let r#else = if default.is_some() {
                results.pop().map(|r| r.expr)
            } else {
                None
            };
            let mut branches = Vec::with_capacity(results.len());
            for (pair, result) in pairs.chunks(2).zip(results) {
                let cond = cx.translate_binary_op(subject.clone(), ast::BinaryOp::Eq, pair[0].clone())?;
                branches.push(When {
                    cond: cond.expr,
                    then: result.expr,
                });
            }
            ok(case(branches, r#else), ty)
        }
        F::And | F::Or => {
            let op = if func == &F::And {
                BinaryOp::And
            } else {
                BinaryOp::Or
            };
            ok(
                Expression::Sequence(op, args.iter().map(|a| cx.truthy(a)).collect()),
                T::Boolean,
            )
        }
        F::Xor => {
            let flags = args
                .iter()
                .map(|a| Expression::Case {
                    branches: vec![When {
                        cond: cx.truthy(a),
                        then: 1.into(),
                    }],
                    r#else: Some(Box::new(0.into())),
                })
                .collect();
            ok(
                Expression::binary(
                    Expression::binary(Expression::Sequence(BinaryOp::Add, flags), BinaryOp::Mod, 2.into()),
                    BinaryOp::Eq,
                    1.into(),
                ),
                T::Boolean,
            )
        }
        F::Not => ok(
            Expression::UnaryOperator(UnaryOp::Not, Box::new(cx.truthy(arg(0)?))),
            T::Boolean,
        ),
        F::Blank => ok(cx.string_literal(""), T::String),
        F::Error => ok(
            Expression::Sequence(BinaryOp::Concat, vec![cx.string_literal("#ERROR: "), text(0)?]),
            T::String,
        ),
        F::IsError => ok(
            Expression::Raw(format!("COALESCE({} LIKE '#ERROR%', FALSE)", text(0)?)),
            T::Boolean,
        ),

        // Date and time
        F::Today => Ok(cx.today()),
        F::Now => Ok(cx.now()),
        F::Year => ok(cx.date_part(DatePart::Year, arg(0)?), T::Number),
        F::Month => ok(cx.date_part(DatePart::Month, arg(0)?), T::Number),
        F::WeekNum => ok(cx.date_part(DatePart::Week, arg(0)?), T::Number),
        F::Day => ok(cx.date_part(DatePart::Day, arg(0)?), T::Number),
        F::Hour => ok(cx.date_part(DatePart::Hour, arg(0)?), T::Number),
        F::Minute => ok(cx.date_part(DatePart::Minute, arg(0)?), T::Number),
        F::Second => ok(cx.date_part(DatePart::Second, arg(0)?), T::Number),
        F::Weekday => {
            // 0 is Sunday unless the week starts on Monday
            let dow = cx.date_part(DatePart::DayOfWeek, arg(0)?);
            match literal_arg(func, args, 1)? {
                Some(start) if start.eq_ignore_ascii_case("monday") => ok(
                    Expression::binary(
                        Expression::binary(dow, BinaryOp::Add, 6.into()),
                        BinaryOp::Mod,
                        7.into(),
                    ),
                    T::Number,
                ),
                _ => ok(dow, T::Number),
            }
        }
        F::FromNow | F::ToNow => {
            let date = arg(0)?.clone();
            let mut diff = if func == &F::FromNow {
                vec![cx.now(), date]
            } else {
                vec![date, cx.now()]
            };
            diff.extend(args.get(1).cloned());
            cx.translate_fn_call(&F::DatetimeDiff, &diff)
        }
        F::DatetimeDiff => {
            let unit = unit_arg(func, args, 2)?.unwrap_or(DateUnit::Day);
            let (a, b) = (timestamp(arg(0)?), timestamp(arg(1)?));
            let sql = match unit.seconds() {
                Some(seconds) => format!("(EXTRACT(EPOCH FROM ({a} - {b})) / {seconds:?})"),
                None => {
                    let age = format!("AGE({a}, {b})");
                    let months = format!("(EXTRACT(YEAR FROM {age}) * 12 + EXTRACT(MONTH FROM {age}))");
                    match unit {
                        DateUnit::Quarter => format!("TRUNC({months} / 3)"),
                        DateUnit::Year => format!("EXTRACT(YEAR FROM {age})"),
                        _ => months,
                    }
                }
            };
            ok(Expression::Raw(sql), T::Number)
        }
        F::Workday => {
            let start = format!("({})::date", timestamp(arg(0)?));
            let days = integer(cx, arg(1)?);
            ok(
                Expression::Raw(format!(
                    "CASE WHEN {days} <= 0 THEN {start} ELSE (SELECT MAX(w.d)::date FROM (SELECT g.d FROM generate_series({start} + 1, {start} + {days} * 2 + 7, INTERVAL '1 day') AS g(d) WHERE EXTRACT(ISODOW FROM g.d) < 6 ORDER BY g.d LIMIT {days}) AS w) END"
                )),
                T::DateTime,
            )
        }
        F::WorkdayDiff => ok(
            Expression::Raw(format!(
                "(SELECT COUNT(*) FROM generate_series(({})::date, ({})::date, INTERVAL '1 day') AS g(d) WHERE EXTRACT(ISODOW FROM g.d) < 6)",
                timestamp(arg(0)?),
                timestamp(arg(1)?)
            )),
            T::Number,
        ),
        F::IsSame | F::IsAfter | F::IsBefore => {
            let op = match func {
                F::IsSame => BinaryOp::Eq,
                F::IsAfter => BinaryOp::Gt,
                _ => BinaryOp::Lt,
            };
            let (a, b) = (timestamp(arg(0)?), timestamp(arg(1)?));
            let (a, b) = match unit_arg(func, args, 2)? {
                Some(unit) => {
                    let trunc = |v| Expression::call("DATE_TRUNC", vec![truncation(unit).into(), v]);
                    (trunc(a), trunc(b))
                }
                None => (a, b),
            };
            ok(Expression::binary(a, op, b), T::Boolean)
        }
        F::DateAdd => {
            let unit = unit_arg(func, args, 2)?.ok_or_else(|| super::wrong_type(func, 2))?;
            ok(
                Expression::Raw(format!(
                    "({} + {} * INTERVAL '{}')",
                    timestamp(arg(0)?),
                    num(1)?,
                    interval(unit)
                )),
                T::DateTime,
            )
        }
        F::Datestr => ok(cx.format_datetime(arg(0)?, "YYYY-MM-DD"), T::String),
        F::Timestr => ok(cx.format_datetime(arg(0)?, "HH:mm:ss"), T::String),
        F::DatetimeFormat => {
            let format = literal_arg(func, args, 1)?.unwrap_or("YYYY-MM-DD HH:mm");
            ok(cx.format_datetime(arg(0)?, format), T::String)
        }
        F::DatetimeParse => match literal_arg(func, args, 1)? {
            Some(format) => call(
                "TO_TIMESTAMP",
                vec![text(0)?, cx.string_literal(&pattern(format))],
                T::DateTime,
            ),
            None => ok(Expression::cast(text(0)?, "timestamptz"), T::DateTime),
        },
        F::CreatedTime => ok(cx.column(CREATED_TIME), T::DateTime),
        F::LastModifiedTime => ok(cx.column(LAST_MODIFIED_TIME), T::DateTime),

        // Arrays
        F::CountAll => {
            let value = arg(0)?;
            let sql = if value.is_array {
                format!("COALESCE({}, 0)", provider.json_array_length(&value.expr.to_string()))
            } else {
                format!("CASE WHEN {} IS NULL THEN 0 ELSE 1 END", value.expr)
            };
            ok(Expression::Raw(sql), T::Number)
        }
        F::CountA => {
            let counts = args
                .iter()
                .map(|a| {
                    Expression::Raw(if a.is_array {
                        format!(
                            "(SELECT COUNT(*) FROM jsonb_array_elements_text({}) AS e(v) WHERE e.v IS NOT NULL AND e.v <> '')",
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
                            "(SELECT COUNT(*) FROM jsonb_array_elements({}) AS e(v) WHERE jsonb_typeof(e.v) = 'number')",
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
                    "(SELECT string_agg(e.v, {separator} ORDER BY e.i) FROM jsonb_array_elements_text({}) WITH ORDINALITY AS e(v, i))",
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
                    "(SELECT jsonb_agg(e.v ORDER BY e.i) FROM jsonb_array_elements({x}) WITH ORDINALITY AS e(v, i) WHERE NOT EXISTS (SELECT 1 FROM jsonb_array_elements({x}) WITH ORDINALITY AS p(v, i) WHERE p.v = e.v AND p.i < e.i))"
                )),
                value.ty,
            ))
        }
        F::ArrayFlatten => {
            let value = arg(0)?;
            if !value.is_array {
                return Ok(Fragment::array(single_array(cx, value), value.ty));
            }
            Ok(Fragment::array(
                Expression::Raw(provider.flatten_json_array(&value.expr.to_string())),
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
                    "(SELECT jsonb_agg(e.v ORDER BY e.i) FROM jsonb_array_elements({}) WITH ORDINALITY AS e(v, i) WHERE e.v <> 'null'::jsonb AND e.v <> '\"\"'::jsonb)",
                    value.expr
                )),
                value.ty,
            ))
        }

        // System
        F::RecordId => ok(cx.column(RECORD_ID), T::String),
        F::AutoNumber => ok(cx.column(AUTO_NUMBER), T::Number),
        F::TextAll => cx.translate_fn_call(&F::ArrayJoin, std::slice::from_ref(arg(0)?)),

        F::Unknown(name) => Err(Error::UnsupportedFunction(name.clone())),
    }
}

/// `COUNT` of a single value: 1 when it is a number.
pub(crate) fn count_scalar<C: TranslationContext + ?Sized>(cx: &C, value: &Fragment) -> String {
    match value.ty {
        T::Number => format!("CASE WHEN {} IS NULL THEN 0 ELSE 1 END", value.expr),
        T::String => format!("CASE WHEN {} IS NULL THEN 0 ELSE 1 END", cx.numeric(value)),
        _ => "0".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::Mode;
    use pretty_assertions::assert_eq;

    fn cx() -> PostgresTranslator {
        let mut settings = Settings::new(Mode::Select);
        settings.alias = Some("t".into());
        PostgresTranslator { settings }
    }

    fn column(name: &str, ty: T) -> Fragment {
        Fragment::new(Expression::column(Some("t"), name), ty)
    }

    #[test]
    fn numeric_add_and_concat() {
        let cx = cx();
        let sum = cx
            .translate_binary_op(column("a", T::Number), ast::BinaryOp::Add, column("b", T::Number))
            .unwrap();
        assert_eq!(sum.expr.to_string(), r#"("t"."a" + "t"."b")"#);

        let text = cx
            .translate_binary_op(column("a", T::Number), ast::BinaryOp::Add, column("s", T::String))
            .unwrap();
        assert_eq!(text.ty, T::String);
        assert_eq!(
            text.expr.to_string(),
            r#"(COALESCE(("t"."a")::text, '') || COALESCE("t"."s", ''))"#
        );
    }

    #[test]
    fn string_number_comparison_is_coerced() {
        let cx = cx();
        let cmp = cx
            .translate_binary_op(column("s", T::String), ast::BinaryOp::Gt, column("n", T::Number))
            .unwrap();
        assert!(cmp.expr.to_string().starts_with(r#"(CASE WHEN ("t"."s")::text ~"#));
        assert_eq!(cmp.ty, T::Boolean);
    }

    #[test]
    fn datetime_tokens() {
        assert_eq!(pattern("YYYY-MM-DD HH:mm"), "YYYY-MM-DD HH24:MI");
        assert_eq!(pattern("D/M at h"), "FMDD/FMMM\" at h\"");
    }

    #[test]
    fn unit_must_be_literal() {
        let cx = cx();
        let result = cx.translate_fn_call(
            &F::DatetimeDiff,
            &[
                column("d1", T::DateTime),
                column("d2", T::DateTime),
                column("unit", T::String),
            ],
        );
        assert_eq!(
            result,
            Err(Error::ArgWrongType {
                func_name: "DATETIME_DIFF".into(),
                wrong_arg_index: 2
            })
        );
    }

    #[test]
    fn rounding() {
        let cx = cx();
        let up = cx
            .translate_fn_call(
                &F::RoundUp,
                &[column("n", T::Number), Fragment::new(Expression::NumberLiteral("2".into()), T::Number)],
            )
            .unwrap();
        assert_eq!(
            up.expr.to_string(),
            r#"CASE WHEN ("t"."n" < 0) THEN (-(CEIL((ABS("t"."n") * 100.0)) / 100.0)) ELSE (CEIL((ABS("t"."n") * 100.0)) / 100.0) END"#
        );
    }
}
