use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Numeric,
    Text,
    Logical,
    DateTime,
    Array,
    System,
}

/// Declares the closed set of formula functions along with their canonical
///  (upper case) name, category and arity. `None` as the max arity means the
///  function is variadic.
macro_rules! formula_functions {
    ($($variant:ident => $name:literal, $cat:ident, $min:literal, $max:expr;)*) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum FormulaFunction {
            $($variant,)*
            Unknown(String),
        }

        impl FormulaFunction {
            pub const ALL: &'static [FormulaFunction] = &[$(FormulaFunction::$variant,)*];

            pub fn name(&self) -> &str {
                match self {
                    $(FormulaFunction::$variant => $name,)*
                    FormulaFunction::Unknown(name) => name,
                }
            }

            pub fn category(&self) -> Option<Category> {
                match self {
                    $(FormulaFunction::$variant => Some(Category::$cat),)*
                    FormulaFunction::Unknown(_) => None,
                }
            }

            /// Minimum and maximum number of arguments.
            pub fn arity(&self) -> (usize, Option<usize>) {
                match self {
                    $(FormulaFunction::$variant => ($min, $max),)*
                    FormulaFunction::Unknown(_) => (0, None),
                }
            }

            fn lookup(upper: &str) -> Option<FormulaFunction> {
                match upper {
                    $($name => Some(FormulaFunction::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

formula_functions! {
    // Numeric
    Sum => "SUM", Numeric, 1, None;
    Average => "AVERAGE", Numeric, 1, None;
    Max => "MAX", Numeric, 1, None;
    Min => "MIN", Numeric, 1, None;
    Round => "ROUND", Numeric, 1, Some(2);
    RoundUp => "ROUNDUP", Numeric, 1, Some(2);
    RoundDown => "ROUNDDOWN", Numeric, 1, Some(2);
    Ceiling => "CEILING", Numeric, 1, Some(2);
    Floor => "FLOOR", Numeric, 1, Some(2);
    Even => "EVEN", Numeric, 1, Some(1);
    Odd => "ODD", Numeric, 1, Some(1);
    Int => "INT", Numeric, 1, Some(1);
    Abs => "ABS", Numeric, 1, Some(1);
    Sqrt => "SQRT", Numeric, 1, Some(1);
    Power => "POWER", Numeric, 2, Some(2);
    Exp => "EXP", Numeric, 1, Some(1);
    Log => "LOG", Numeric, 1, Some(2);
    Mod => "MOD", Numeric, 2, Some(2);
    Value => "VALUE", Numeric, 1, Some(1);

    // Text
    Concatenate => "CONCATENATE", Text, 1, None;
    Find => "FIND", Text, 2, Some(3);
    Search => "SEARCH", Text, 2, Some(3);
    Mid => "MID", Text, 3, Some(3);
    Left => "LEFT", Text, 1, Some(2);
    Right => "RIGHT", Text, 1, Some(2);
    Replace => "REPLACE", Text, 4, Some(4);
    RegexpReplace => "REGEXP_REPLACE", Text, 3, Some(3);
    Substitute => "SUBSTITUTE", Text, 3, Some(3);
    Lower => "LOWER", Text, 1, Some(1);
    Upper => "UPPER", Text, 1, Some(1);
    Rept => "REPT", Text, 2, Some(2);
    Trim => "TRIM", Text, 1, Some(1);
    Len => "LEN", Text, 1, Some(1);
    T => "T", Text, 1, Some(1);
    EncodeUrlComponent => "ENCODE_URL_COMPONENT", Text, 1, Some(1);

    // Logical
    If => "IF", Logical, 2, Some(3);
    Switch => "SWITCH", Logical, 3, None;
    And => "AND", Logical, 1, None;
    Or => "OR", Logical, 1, None;
    Xor => "XOR", Logical, 1, None;
    Not => "NOT", Logical, 1, Some(1);
    Blank => "BLANK", Logical, 0, Some(0);
    Error => "ERROR", Logical, 1, Some(1);
    IsError => "IS_ERROR", Logical, 1, Some(1);

    // Date and time
    Today => "TODAY", DateTime, 0, Some(0);
    Now => "NOW", DateTime, 0, Some(0);
    Year => "YEAR", DateTime, 1, Some(1);
    Month => "MONTH", DateTime, 1, Some(1);
    WeekNum => "WEEKNUM", DateTime, 1, Some(1);
    Weekday => "WEEKDAY", DateTime, 1, Some(2);
    Day => "DAY", DateTime, 1, Some(1);
    Hour => "HOUR", DateTime, 1, Some(1);
    Minute => "MINUTE", DateTime, 1, Some(1);
    Second => "SECOND", DateTime, 1, Some(1);
    FromNow => "FROMNOW", DateTime, 1, Some(2);
    ToNow => "TONOW", DateTime, 1, Some(2);
    DatetimeDiff => "DATETIME_DIFF", DateTime, 2, Some(3);
    Workday => "WORKDAY", DateTime, 2, Some(2);
    WorkdayDiff => "WORKDAY_DIFF", DateTime, 2, Some(2);
    IsSame => "IS_SAME", DateTime, 2, Some(3);
    IsAfter => "IS_AFTER", DateTime, 2, Some(3);
    IsBefore => "IS_BEFORE", DateTime, 2, Some(3);
    DateAdd => "DATE_ADD", DateTime, 3, Some(3);
    Datestr => "DATESTR", DateTime, 1, Some(1);
    Timestr => "TIMESTR", DateTime, 1, Some(1);
    DatetimeFormat => "DATETIME_FORMAT", DateTime, 1, Some(2);
    DatetimeParse => "DATETIME_PARSE", DateTime, 1, Some(2);
    CreatedTime => "CREATED_TIME", DateTime, 0, Some(0);
    LastModifiedTime => "LAST_MODIFIED_TIME", DateTime, 0, Some(0);

    // Arrays
    CountAll => "COUNTALL", Array, 1, Some(1);
    CountA => "COUNTA", Array, 1, None;
    Count => "COUNT", Array, 1, None;
    ArrayJoin => "ARRAY_JOIN", Array, 1, Some(2);
    ArrayUnique => "ARRAY_UNIQUE", Array, 1, Some(1);
    ArrayFlatten => "ARRAY_FLATTEN", Array, 1, Some(1);
    ArrayCompact => "ARRAY_COMPACT", Array, 1, Some(1);

    // System
    RecordId => "RECORD_ID", System, 0, Some(0);
    AutoNumber => "AUTO_NUMBER", System, 0, Some(0);
    TextAll => "TEXT_ALL", System, 1, Some(1);
}

impl FormulaFunction {
    /// Checks an argument count against the declared arity.
    pub fn accepts(&self, count: usize) -> bool {
        let (min, max) = self.arity();
        count >= min && max.is_none_or(|max| count <= max)
    }
}

impl fmt::Display for FormulaFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<String> for FormulaFunction {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(FormulaFunction::Unknown(s))
    }
}

impl From<&[u8]> for FormulaFunction {
    fn from(word: &[u8]) -> Self {
        match std::str::from_utf8(word) {
            Ok(s) => s.to_string().into(),
            Err(_) => FormulaFunction::Unknown(String::from_utf8_lossy(word).into_owned()),
        }
    }
}

impl FromStr for FormulaFunction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FormulaFunction::lookup(&s.to_ascii_uppercase())
            .ok_or_else(|| format!("Unknown function: {s}"))
    }
}
