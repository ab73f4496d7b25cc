use crate::functions::FormulaFunction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Concat => "&",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    BoolLiteral(bool),
    NumberLiteral(String),
    StringLiteral(String),
    NullLiteral,
    /// `{fieldId}`
    Field(String),
    FunctionCall {
        name: FormulaFunction,
        args: ArgList,
    },
    BinaryOperator(ExpressionId, BinaryOp, ExpressionId),
    UnaryOperator(UnaryOp, ExpressionId),
    /// Long `a+b+c+d` chains are common in formulas (concatenating labels).
    /// A left-nested tree of BinaryOps would be walked recursively once per
    ///  operand, so the parser flattens them into one op and an arg list.
    Sequence(ArgList, BinaryOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExpressionId(usize);

/// A contiguous span of [ParseTree::arg_lists].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgList {
    start: usize,
    len: usize,
}

impl ArgList {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Instead of generating a tree of references or smart pointers (Rc), all
///  expressions are packed into a flat array and refer to each other by an id
///  (an index into that array).
///
/// Argument lists are stored the same way: the ids of a call's arguments are
///  contiguous within `arg_lists` and the call only carries the span. For
///  example `fn_a(fn_b(1), 2)` becomes:
///
///  expressions: [Number(1), Call(fn_b, ArgList(0, 1)), Number(2), Call(fn_a, ArgList(1, 2))]
///  arg_lists:   [ExpressionId(0), ExpressionId(1), ExpressionId(2)]
///
/// A tree is produced by the external parser (or [crate::parser::parse]) and
///  is only ever read by the compiler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseTree {
    expressions: Vec<Expression>,
    arg_lists: Vec<ExpressionId>,
    root: Option<ExpressionId>,
}

impl ParseTree {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            expressions: Vec::with_capacity(capacity),
            arg_lists: Vec::with_capacity(capacity),
            root: None,
        }
    }

    pub fn push_expr(&mut self, expr: Expression) -> ExpressionId {
        let id = ExpressionId(self.expressions.len());
        self.expressions.push(expr);
        id
    }

    pub fn push_args(&mut self, ids: impl ExactSizeIterator<Item = ExpressionId>) -> ArgList {
        let start = self.arg_lists.len();
        let len = ids.len();
        self.arg_lists.extend(ids);
        ArgList { start, len }
    }

    #[inline]
    pub fn get_expr_unchecked(&self, id: ExpressionId) -> &Expression {
        &self.expressions[id.0]
    }

    #[inline]
    pub fn get_expr(&self, id: ExpressionId) -> Option<&Expression> {
        self.expressions.get(id.0)
    }

    /// Get the ExpressionIds representing a particular argument list
    #[inline]
    pub fn get_args(&self, list: &ArgList) -> &[ExpressionId] {
        &self.arg_lists[list.start..list.start + list.len]
    }

    pub fn set_root(&mut self, root: ExpressionId) {
        self.root = Some(root);
    }

    /// The root node; an empty tree has none.
    pub fn root(&self) -> Option<ExpressionId> {
        self.root
    }

    /// Field ids referenced by the tree, de-duplicated, in left-to-right order.
    pub fn field_references(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = Vec::new();
        let Some(root) = self.root else {
            return refs;
        };
        // explicit stack, pushed right-to-left so we pop left-to-right
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            match self.get_expr_unchecked(id) {
                Expression::Field(field_id) => {
                    if !refs.contains(&field_id.as_str()) {
                        refs.push(field_id);
                    }
                }
                Expression::FunctionCall { args, .. } | Expression::Sequence(args, _) => {
                    stack.extend(self.get_args(args).iter().rev().copied());
                }
                Expression::BinaryOperator(l, _, r) => {
                    stack.push(*r);
                    stack.push(*l);
                }
                Expression::UnaryOperator(_, child) => stack.push(*child),
                Expression::BoolLiteral(_)
                | Expression::NumberLiteral(_)
                | Expression::StringLiteral(_)
                | Expression::NullLiteral => {}
            }
        }
        refs
    }

    // Builder helpers, mostly used when a caller constructs trees by hand.

    pub fn field(&mut self, field_id: impl Into<String>) -> ExpressionId {
        self.push_expr(Expression::Field(field_id.into()))
    }

    pub fn number(&mut self, value: impl ToString) -> ExpressionId {
        self.push_expr(Expression::NumberLiteral(value.to_string()))
    }

    pub fn string(&mut self, value: impl Into<String>) -> ExpressionId {
        self.push_expr(Expression::StringLiteral(value.into()))
    }

    pub fn boolean(&mut self, value: bool) -> ExpressionId {
        self.push_expr(Expression::BoolLiteral(value))
    }

    pub fn binary(&mut self, l: ExpressionId, op: BinaryOp, r: ExpressionId) -> ExpressionId {
        self.push_expr(Expression::BinaryOperator(l, op, r))
    }

    pub fn unary(&mut self, op: UnaryOp, child: ExpressionId) -> ExpressionId {
        self.push_expr(Expression::UnaryOperator(op, child))
    }

    pub fn call(&mut self, name: FormulaFunction, args: &[ExpressionId]) -> ExpressionId {
        let args = self.push_args(args.iter().copied());
        self.push_expr(Expression::FunctionCall { name, args })
    }

    pub fn print_tree(&self, id: ExpressionId, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.get_expr_unchecked(id) {
            Expression::BoolLiteral(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Expression::NumberLiteral(s) => write!(f, "{s}"),
            Expression::StringLiteral(s) => write!(f, "{s:?}"),
            Expression::NullLiteral => write!(f, "NULL"),
            Expression::Field(id) => write!(f, "{{{id}}}"),
            Expression::UnaryOperator(UnaryOp::Not, child) => {
                write!(f, "(!")?;
                self.print_tree(*child, f)?;
                write!(f, ")")
            }
            Expression::UnaryOperator(UnaryOp::Neg, child) => {
                write!(f, "(-")?;
                self.print_tree(*child, f)?;
                write!(f, ")")
            }
            Expression::BinaryOperator(l, op, r) => {
                write!(f, "(")?;
                self.print_tree(*l, f)?;
                write!(f, " {} ", op.symbol())?;
                self.print_tree(*r, f)?;
                write!(f, ")")
            }
            Expression::FunctionCall { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in self.get_args(args).iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    self.print_tree(*arg, f)?;
                }
                write!(f, ")")
            }
            Expression::Sequence(args, op) => {
                write!(f, "(")?;
                for (i, arg) in self.get_args(args).iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", op.symbol())?;
                    }
                    self.print_tree(*arg, f)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl std::fmt::Display for ParseTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.root {
            Some(root) => self.print_tree(root, f),
            None => Ok(()),
        }
    }
}
