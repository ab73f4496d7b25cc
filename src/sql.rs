//! The output side of translation: a small SQL expression tree, identifier and
//!  literal quoting, and the `WITH ... SELECT` query the record builder renders.

use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Concat,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Concat => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// A WHEN branch for CASE
#[derive(Debug, Clone, PartialEq)]
pub struct When {
    pub cond: Expression,
    pub then: Expression,
}

/// This is the output type of translation: a formula tree goes in, a SQL tree
///  comes out and is rendered with `Display`.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    BoolLiteral(bool),
    NumberLiteral(String),
    StringLiteral(String),
    /// `'value'::type`, used where Postgres needs the literal pinned (generated columns)
    TypedStringLiteral(String, &'static str),
    Null,
    Column {
        alias: Option<String>,
        name: String,
    },
    FunctionCall {
        name: String,
        args: Vec<Expression>,
    },
    // used for things like "CURRENT_DATE" which are functions but don't
    //  allow the parentheses.
    BareFunctionCall(String),
    BinaryOperator(Box<Expression>, BinaryOp, Box<Expression>),
    // This is an optimization of BinaryOperator for things like:
    //   a + b + c + d
    // OR
    //   a || b || c
    Sequence(BinaryOp, Vec<Expression>),
    UnaryOperator(UnaryOp, Box<Expression>),
    Cast(Box<Expression>, &'static str),
    Case {
        branches: Vec<When>,
        r#else: Option<Box<Expression>>,
    },
    /// An already rendered fragment (dialect helpers, CTE references)
    Raw(String),
}

// These From implementations help the translation implementation
impl From<&str> for Expression {
    fn from(s: &str) -> Self {
        Expression::StringLiteral(s.to_string())
    }
}
impl From<String> for Expression {
    fn from(s: String) -> Self {
        Expression::StringLiteral(s)
    }
}
impl From<i64> for Expression {
    fn from(n: i64) -> Self {
        Expression::NumberLiteral(n.to_string())
    }
}

impl Expression {
    pub fn column(alias: Option<&str>, name: &str) -> Self {
        Expression::Column {
            alias: alias.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn call(name: &str, args: Vec<Expression>) -> Self {
        Expression::FunctionCall {
            name: name.to_string(),
            args,
        }
    }

    pub fn binary(l: Expression, op: BinaryOp, r: Expression) -> Self {
        Expression::BinaryOperator(Box::new(l), op, Box::new(r))
    }

    pub fn cast(expr: Expression, ty: &'static str) -> Self {
        Expression::Cast(Box::new(expr), ty)
    }

    /// Appends `r` to `l` with `op`, extending `l` in place when it is already
    ///  a sequence of the same operator.
    pub fn chain(l: Expression, op: BinaryOp, r: Expression) -> Self {
        match l {
            Expression::Sequence(seq_op, mut items) if seq_op == op => {
                items.push(r);
                Expression::Sequence(op, items)
            }
            l => Expression::Sequence(op, vec![l, r]),
        }
    }

    pub fn is_blank_literal(&self) -> bool {
        matches!(
            self,
            Expression::StringLiteral(s) | Expression::TypedStringLiteral(s, _) if s.is_empty()
        )
    }

    /// The value of a string literal, whether or not it was pinned to a type.
    pub fn as_string_literal(&self) -> Option<&str> {
        match self {
            Expression::StringLiteral(s) | Expression::TypedStringLiteral(s, _) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer_literal(&self) -> Option<i64> {
        match self {
            Expression::NumberLiteral(v) => v.parse().ok(),
            Expression::UnaryOperator(UnaryOp::Neg, inner) => {
                inner.as_integer_literal().map(|v| -v)
            }
            _ => None,
        }
    }
}

impl Display for Expression {
    fn fmt(&self, out: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Expression::BoolLiteral(true) => write!(out, "TRUE"),
            Expression::BoolLiteral(false) => write!(out, "FALSE"),
            Expression::NumberLiteral(v) => write!(out, "{v}"),
            Expression::StringLiteral(v) => write!(out, "{}", quote_literal(v)),
            Expression::TypedStringLiteral(v, ty) => write!(out, "{}::{ty}", quote_literal(v)),
            Expression::Null => write!(out, "NULL"),
            Expression::Column { alias, name } => match alias {
                Some(alias) => write!(out, "{}.{}", quote_ident(alias), quote_ident(name)),
                None => write!(out, "{}", quote_ident(name)),
            },
            Expression::FunctionCall { name, args } => {
                write!(out, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(out, ", ")?;
                    }
                    write!(out, "{arg}")?;
                }
                write!(out, ")")
            }
            Expression::BareFunctionCall(name) => write!(out, "{name}"),
            //NOTE order of operations is preserved by parenthesizing everything
            Expression::BinaryOperator(l, op, r) => write!(out, "({l} {} {r})", op.symbol()),
            Expression::Sequence(op, items) => {
                write!(out, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(out, " {} ", op.symbol())?;
                    }
                    write!(out, "{item}")?;
                }
                write!(out, ")")
            }
            Expression::UnaryOperator(UnaryOp::Not, r) => write!(out, "(NOT {r})"),
            Expression::UnaryOperator(UnaryOp::Neg, r) => write!(out, "(-{r})"),
            Expression::Cast(expr, ty) => write!(out, "CAST({expr} AS {ty})"),
            Expression::Case { branches, r#else } => {
                write!(out, "CASE")?;
                for When { cond, then } in branches {
                    write!(out, " WHEN {cond} THEN {then}")?;
                }
                if let Some(r#else) = r#else {
                    write!(out, " ELSE {}", r#else)?;
                }
                write!(out, " END")
            }
            Expression::Raw(sql) => write!(out, "{sql}"),
        }
    }
}

/// Quotes an identifier, doubling embedded double quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `"alias"."column"`
pub fn qualified(alias: &str, column: &str) -> String {
    format!("{}.{}", quote_ident(alias), quote_ident(column))
}

/// A named common table expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cte {
    pub name: String,
    pub body: String,
}

impl Display for Cte {
    fn fmt(&self, out: &mut Formatter<'_>) -> fmt::Result {
        write!(out, "{} AS ({})", quote_ident(&self.name), self.body)
    }
}

/// The query under construction. The CTE compiler pushes its CTEs (and the
///  joins of CTEs keyed by the main table) here, the selection compiler adds
///  the columns.
#[derive(Debug, Clone, Default)]
pub struct Query {
    ctes: Vec<Cte>,
    columns: Vec<(String, String)>,
    from: Option<(String, String)>,
    joined_ctes: Vec<String>,
    record_id_column: String,
}

impl Query {
    pub fn new(table: &str, alias: &str) -> Self {
        Self {
            from: Some((table.to_string(), alias.to_string())),
            record_id_column: crate::schema::RECORD_ID.to_string(),
            ..Default::default()
        }
    }

    /// Adds a CTE. Adding a name twice is a no-op.
    pub fn push_cte(&mut self, name: &str, body: String) {
        if !self.has_cte(name) {
            self.ctes.push(Cte {
                name: name.to_string(),
                body,
            });
        }
    }

    pub fn has_cte(&self, name: &str) -> bool {
        self.ctes.iter().any(|c| c.name == name)
    }

    pub fn ctes(&self) -> &[Cte] {
        &self.ctes
    }

    /// LEFT JOINs a CTE on its `main_record_id`.
    pub fn join_cte(&mut self, name: &str) {
        if !self.joined_ctes.iter().any(|j| j == name) {
            self.joined_ctes.push(name.to_string());
        }
    }

    pub fn joined_ctes(&self) -> &[String] {
        &self.joined_ctes
    }

    pub fn select(&mut self, sql: String, alias: &str) {
        self.columns.push((sql, alias.to_string()));
    }
}

impl Display for Query {
    fn fmt(&self, out: &mut Formatter<'_>) -> fmt::Result {
        if !self.ctes.is_empty() {
            write!(out, "WITH ")?;
            for (i, cte) in self.ctes.iter().enumerate() {
                if i > 0 {
                    write!(out, ", ")?;
                }
                write!(out, "{cte}")?;
            }
            write!(out, " ")?;
        }
        write!(out, "SELECT ")?;
        if self.columns.is_empty() {
            write!(out, "*")?;
        }
        for (i, (sql, alias)) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(out, ", ")?;
            }
            write!(out, "{sql} AS {}", quote_ident(alias))?;
        }
        if let Some((table, alias)) = &self.from {
            write!(out, " FROM {} AS {}", quote_ident(table), quote_ident(alias))?;
            for cte in &self.joined_ctes {
                write!(
                    out,
                    " LEFT JOIN {} ON {} = {}",
                    quote_ident(cte),
                    qualified(cte, crate::cte::MAIN_RECORD_ID),
                    qualified(alias, &self.record_id_column)
                )?;
            }
        }
        Ok(())
    }
}
