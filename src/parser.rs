//! Formula front end. Formula fields normally arrive with a parsed tree, but
//!  a field that only carries its expression text is parsed here.

use crate::ast::{BinaryOp, Expression, ExpressionId, ParseTree, UnaryOp};
use crate::functions::FormulaFunction;
use crate::lex::{Error as LexerError, Lexer, Token, TokenType};

impl TryFrom<Token> for BinaryOp {
    type Error = Error;
    fn try_from(value: Token) -> Result<Self, Self::Error> {
        match value.ty {
            TokenType::Plus => Ok(BinaryOp::Add),
            TokenType::Minus => Ok(BinaryOp::Sub),
            TokenType::Asterisk => Ok(BinaryOp::Mul),
            TokenType::ForwardSlash => Ok(BinaryOp::Div),
            TokenType::Percent => Ok(BinaryOp::Mod),
            TokenType::Ampersand => Ok(BinaryOp::Concat),
            TokenType::Equals => Ok(BinaryOp::Eq),
            TokenType::NotEquals => Ok(BinaryOp::Ne),
            TokenType::LT => Ok(BinaryOp::Lt),
            TokenType::LTE => Ok(BinaryOp::Le),
            TokenType::GT => Ok(BinaryOp::Gt),
            TokenType::GTE => Ok(BinaryOp::Ge),
            TokenType::And => Ok(BinaryOp::And),
            TokenType::Or => Ok(BinaryOp::Or),
            _ => Err(Error::UnexpectedToken(value)),
        }
    }
}

impl TryFrom<Token> for UnaryOp {
    type Error = Error;
    fn try_from(value: Token) -> Result<Self, Self::Error> {
        match value.ty {
            TokenType::Minus => Ok(UnaryOp::Neg),
            TokenType::Bang => Ok(UnaryOp::Not),
            _ => Err(Error::UnexpectedToken(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Returned when the input is empty (or just whitespace)
    #[error("Empty input")]
    NoExpression,
    #[error("Lexical error: {0}")]
    Lexical(#[from] LexerError),
    #[error("Missing closing parenthesis")]
    MissingCloseParen,
    #[error("Unexpected token, got {0:?}")]
    UnexpectedToken(Token),
    #[error("Unexpected end of input")]
    UnexpectedEof,
    #[error("{0}")]
    Other(String),
}

pub fn parse(input: &str) -> Result<ParseTree, Error> {
    let mut lexer = Lexer::new(input.as_bytes());
    let mut arg_scratch = Vec::with_capacity(32);
    let mut pt = ParseTree::with_capacity(32);

    let root = parse_binary_op(&mut lexer, &mut pt, &mut arg_scratch, 0)?;

    // Make sure we've completely parsed the input
    if let Some(tok) = lexer.next_token()? {
        return Err(Error::UnexpectedToken(tok));
    }
    let root = pt.push_expr(root);
    pt.set_root(root);
    Ok(pt)
}

fn parse_binary_op(
    lexer: &mut Lexer<'_>,
    tree: &mut ParseTree,
    scratch: &mut Vec<ExpressionId>,
    min_binding_power: u8,
) -> Result<Expression, Error> {
    let lhs = lexer.next_token()?.ok_or(Error::NoExpression)?;
    let mut lhs = match lhs {
        // Open paren: parse the internal expression and expect a closing paren
        Token {
            ty: TokenType::ParenLeft,
            ..
        } => {
            let lhs = parse_binary_op(lexer, tree, scratch, 0)?;
            if !lexer.consume(TokenType::ParenRight)? {
                return Err(Error::MissingCloseParen);
            }
            Ok(lhs)
        }
        // Prefix '-' or '!'
        prefix if prefix.ty == TokenType::Minus || prefix.ty == TokenType::Bang => {
            let pow = prefix_binding(prefix.ty);
            let rhs = parse_binary_op(lexer, tree, scratch, pow)?;
            let rhs = tree.push_expr(rhs);
            Ok(Expression::UnaryOperator(prefix.try_into()?, rhs))
        }

        // Numbers, strings, boolean and null literals
        tok if is_literal(&tok) => parse_literal(lexer, &tok),

        tok if tok.ty == TokenType::FieldRef => {
            let id = String::from_utf8_lossy(lexer.contents(&tok)).trim().to_string();
            Ok(Expression::Field(id))
        }

        // Identifiers are only valid as function names
        tok if tok.ty == TokenType::Identifier => parse_fn_call(lexer, tree, scratch, &tok),
        unexpected => Err(Error::UnexpectedToken(unexpected)),
    }?;

    // now that we have our left side, expect a series of operators or EOF
    loop {
        let op_tok = match lexer.peek_token()? {
            None => break,
            Some(op) => op,
        };

        let Some((l_pow, r_pow)) = infix_binding(op_tok.ty) else {
            break;
        };

        if l_pow < min_binding_power {
            break;
        }

        let op: BinaryOp = op_tok.clone().try_into()?;

        // Consume the operator token
        _ = lexer.next_token()?;

        // Chains of the same `+` or `&` collapse into a Sequence
        if matches!(op, BinaryOp::Add | BinaryOp::Concat) {
            let scratch_start = scratch.len();
            scratch.push(tree.push_expr(lhs));

            let rhs = parse_binary_op(lexer, tree, scratch, r_pow)?;
            scratch.push(tree.push_expr(rhs));

            // Collect additional RHS while the next operator is exactly the same
            while let Some(next_op_tok) = lexer.peek_token()?
                && next_op_tok.ty == op_tok.ty
            {
                _ = lexer.next_token()?;
                let rhs = parse_binary_op(lexer, tree, scratch, r_pow)?;
                scratch.push(tree.push_expr(rhs));
            }

            // If just the two operands, use a BinaryOperator
            if let [l_id, r_id] = scratch[scratch_start..] {
                lhs = Expression::BinaryOperator(l_id, op, r_id);
                scratch.truncate(scratch_start); // clean up my usage
            } else {
                let arg_list = tree.push_args(scratch.drain(scratch_start..));
                lhs = Expression::Sequence(arg_list, op);
            }
        } else {
            let lhs_id = tree.push_expr(lhs);
            let rhs = parse_binary_op(lexer, tree, scratch, r_pow)?;
            let rhs_id = tree.push_expr(rhs);
            lhs = Expression::BinaryOperator(lhs_id, op, rhs_id);
        }
    }

    Ok(lhs)
}

fn is_literal(token: &Token) -> bool {
    matches!(
        token.ty,
        TokenType::Number
            | TokenType::StringSingleQuote
            | TokenType::StringDoubleQuote
            | TokenType::True
            | TokenType::False
            | TokenType::Null
    )
}

fn parse_literal(lexer: &Lexer<'_>, token: &Token) -> Result<Expression, Error> {
    match token.ty {
        TokenType::True => Ok(Expression::BoolLiteral(true)),
        TokenType::False => Ok(Expression::BoolLiteral(false)),
        TokenType::Null => Ok(Expression::NullLiteral),
        TokenType::Number => Ok(Expression::NumberLiteral(
            String::from_utf8_lossy(lexer.contents(token)).into_owned(),
        )),
        TokenType::StringSingleQuote | TokenType::StringDoubleQuote => {
            Ok(Expression::StringLiteral(unescape(lexer.contents(token))))
        }
        _ => Err(Error::Other(format!(
            "Unexpected token in parse_literal: {:?}",
            token.ty
        ))),
    }
}

fn unescape(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter();
    while let Some(&b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b't') => out.push(b'\t'),
            Some(&other) => out.push(other),
            None => out.push(b'\\'),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn parse_fn_call(
    lexer: &mut Lexer<'_>,
    tree: &mut ParseTree,
    scratch: &mut Vec<ExpressionId>,
    name_token: &Token,
) -> Result<Expression, Error> {
    // We'll use the scratch buffer to accumulate the ExpressionIds of the args
    // At the end we'll drain them into the ParseTree. We do need to track where
    //  we're starting because we might be recursed multiple levels and prior
    //  stack frames are also using this buffer so it might not be empty.
    let scratch_start = scratch.len();

    if !lexer.consume(TokenType::ParenLeft)? {
        return match lexer.next_token()? {
            Some(tok) => Err(Error::UnexpectedToken(tok)),
            None => Err(Error::UnexpectedEof),
        };
    }

    // Zero or more arguments
    let mut first = true;
    loop {
        let t = lexer.peek_token()?.ok_or(Error::UnexpectedEof)?;
        if t.ty == TokenType::ParenRight {
            _ = lexer.next_token();
            break;
        }

        if !first {
            if !lexer.consume(TokenType::Comma)? {
                return Err(Error::UnexpectedToken(t));
            };
        } else {
            first = false;
        }

        let arg = parse_binary_op(lexer, tree, scratch, 0)?;
        scratch.push(tree.push_expr(arg));
    }

    // Unknown names are kept: the compiler reports them with their spelling
    let name = FormulaFunction::from(lexer.contents(name_token));
    let args = tree.push_args(scratch.drain(scratch_start..));

    Ok(Expression::FunctionCall { name, args })
}

// NOTE prefix_binding and infix_binding specify the "binding power" of the
//  various prefix and infix operators. Binding power is a more intuitive
//  version of "precedence": higher binding power means the operator binds
//  more tightly.
fn prefix_binding(ty: TokenType) -> u8 {
    match ty {
        TokenType::Bang => 30,
        _ => 90,
    }
}

// NOTE for infix bindings we specify a left and right side of the operator,
//  this slight asymmetry prevents us from getting stuck on ties and makes
//  every operator left associative.
fn infix_binding(ty: TokenType) -> Option<(u8, u8)> {
    match ty {
        TokenType::Plus | TokenType::Minus => Some((50, 51)),
        TokenType::Asterisk | TokenType::ForwardSlash | TokenType::Percent => Some((60, 61)),
        TokenType::Ampersand => Some((45, 46)),
        TokenType::Equals
        | TokenType::NotEquals
        | TokenType::LT
        | TokenType::LTE
        | TokenType::GT
        | TokenType::GTE => Some((40, 41)),
        TokenType::And => Some((20, 21)),
        TokenType::Or => Some((10, 11)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(tree: &ParseTree) -> &Expression {
        tree.get_expr(tree.root().expect("root")).expect("root expr")
    }

    #[test]
    fn basic1() {
        let tree = parse(r#"(1 + -2.0) != 3."#).expect("a valid parse");
        let Expression::BinaryOperator(lhs, BinaryOp::Ne, rhs) = root(&tree) else {
            panic!("Expected a Ne, got a {:?}", root(&tree))
        };

        let lhs = tree.get_expr(*lhs).expect("lhs");
        let rhs = tree.get_expr(*rhs).expect("rhs");

        assert_eq!(*rhs, Expression::NumberLiteral("3.".into()));

        let Expression::BinaryOperator(lhs, BinaryOp::Add, rhs) = lhs else {
            panic!("Expected an Add, got a {lhs:?}")
        };

        let lhs = tree.get_expr(*lhs).expect("lhs");
        let rhs = tree.get_expr(*rhs).expect("rhs");

        assert_eq!(*lhs, Expression::NumberLiteral("1".into()));

        let Expression::UnaryOperator(UnaryOp::Neg, rhs) = rhs else {
            panic!("Expected a Neg, got a {rhs:?}")
        };
        let rhs = tree.get_expr(*rhs).expect("rhs");
        assert_eq!(*rhs, Expression::NumberLiteral("2.0".into()));
    }

    #[test]
    fn field_references() {
        let tree = parse(r#"'Hello ' & ({fldFirst} & { fldLast })"#).expect("a valid parse");
        assert_eq!(tree.field_references(), vec!["fldFirst", "fldLast"]);
        assert_eq!(tree.to_string(), r#"("Hello " & ({fldFirst} & {fldLast}))"#);
    }

    #[test]
    fn logical() {
        let tree = parse(r#"(TRUE = !false) || true"#).expect("a valid parse");
        let Expression::BinaryOperator(lhs, BinaryOp::Or, rhs) = root(&tree) else {
            panic!("Expected an OR");
        };
        assert_eq!(tree.get_expr(*rhs), Some(&Expression::BoolLiteral(true)));
        let Some(Expression::BinaryOperator(_, BinaryOp::Eq, not)) = tree.get_expr(*lhs) else {
            panic!("Expected an Eq");
        };
        let Some(Expression::UnaryOperator(UnaryOp::Not, _)) = tree.get_expr(*not) else {
            panic!("Expected a NOT")
        };
    }

    #[test]
    fn fn_calls() {
        let tree = parse(r#"if(sum({a}, 2) > 10, LEFT({b}, 5), "x")"#).expect("a valid parse");
        let Expression::FunctionCall {
            name: FormulaFunction::If,
            args,
        } = root(&tree)
        else {
            panic!("Expected an IF call, got {:?}", root(&tree))
        };
        let args = tree.get_args(args);
        assert_eq!(args.len(), 3);
        assert_eq!(
            tree.get_expr(args[2]),
            Some(&Expression::StringLiteral("x".into()))
        );
        let Some(Expression::BinaryOperator(sum, BinaryOp::Gt, _)) = tree.get_expr(args[0]) else {
            panic!("Expected a comparison")
        };
        let Some(Expression::FunctionCall {
            name: FormulaFunction::Sum,
            args,
        }) = tree.get_expr(*sum)
        else {
            panic!("Expected SUM")
        };
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn unknown_function_is_preserved() {
        let tree = parse("FOO({n1})").expect("a valid parse");
        let Expression::FunctionCall { name, .. } = root(&tree) else {
            panic!("Expected a call");
        };
        assert_eq!(*name, FormulaFunction::Unknown("FOO".into()));
    }

    #[test]
    fn sequence() {
        let tree = parse(r#"{a}+{b}+{c}+{d}*{e}+{f}"#).expect("a valid parse");
        let Expression::Sequence(args, BinaryOp::Add) = root(&tree) else {
            panic!("Expect a Sequence, got a {:?}", root(&tree))
        };
        let args = tree.get_args(args);
        assert_eq!(args.len(), 5); // a, b, c, (d*e), f

        assert_eq!(
            tree.get_expr(args[0]),
            Some(&Expression::Field("a".into()))
        );
        assert_eq!(
            tree.get_expr(args[4]),
            Some(&Expression::Field("f".into()))
        );
        let Some(Expression::BinaryOperator(_, BinaryOp::Mul, _)) = tree.get_expr(args[3]) else {
            panic!("Expected a Mul")
        };
    }

    #[test]
    fn escapes() {
        let tree = parse(r#""it's \"quoted\"""#).expect("a valid parse");
        assert_eq!(
            root(&tree),
            &Expression::StringLiteral(r#"it's "quoted""#.into())
        );
    }

    #[test]
    fn errors() {
        assert_eq!(parse("   "), Err(Error::NoExpression));
        assert_eq!(parse("(1 + 2"), Err(Error::MissingCloseParen));
        assert!(matches!(parse("1 2"), Err(Error::UnexpectedToken(_))));
        assert!(matches!(parse("SUM(1,"), Err(Error::NoExpression)));
        assert!(matches!(parse("{a"), Err(Error::Lexical(_))));
    }
}
