/// #Notes
/// `+` and `-` could be operators or the starts of numbers (`-.1`). This lexer
///  does not attempt to distinguish: they always become Plus and Minus tokens.
///  The parser should use its increased context to disambiguate these usages.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum TokenType {
    ParenLeft,
    ParenRight,
    Comma,
    Plus,
    Minus,
    Asterisk,
    ForwardSlash,
    Percent,
    Ampersand, // & is string concatenation
    Equals,    // = or ==
    NotEquals, // != or <>
    LT,        // <
    GT,        // >
    LTE,       // <=
    GTE,       // >=
    And,       // &&
    Or,        // ||
    Bang,      // !
    Number,
    Identifier,
    FieldRef, // {fieldId}
    True,
    False,
    Null,
    StringSingleQuote,
    StringDoubleQuote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub ty: TokenType,

    // Byte indexes into the source
    start: usize,
    end: usize,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unterminated string literal starting at {0}")]
    UnterminatedStringLiteral(usize),
    #[error("Unterminated field reference starting at {0}")]
    UnterminatedFieldReference(usize),
    #[error("Unexpected character at {0}")]
    UnexpectedCharacter(usize),
}

/// This type simply holds a reference to the source bytes and an index, so it's
///  cheap to copy, making lookahead/rewind operations in the parser very easy.
#[derive(Clone)]
pub struct Lexer<'input> {
    source: &'input [u8],
    current: usize,
}

impl<'input> Lexer<'input> {
    pub fn new(source: &'input [u8]) -> Self {
        Self { source, current: 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.current >= self.source.len()
    }

    #[inline]
    pub fn peek(&self) -> Option<u8> {
        self.source.get(self.current).copied()
    }

    #[inline]
    fn pop_unchecked(&mut self) -> u8 {
        let res = self.source[self.current];
        self.current += 1;
        res
    }

    /// If current starts with [prefix], consume it and return true.
    pub fn consume1(&mut self, prefix: u8) -> bool {
        if let Some(c) = self.peek()
            && c == prefix
        {
            self.current += 1;
            true
        } else {
            false
        }
    }

    #[inline]
    fn consume_while(&mut self, predicate: impl Fn(u8) -> bool) {
        while let Some(c) = self.peek()
            && predicate(c)
        {
            self.current += 1;
        }
    }

    #[inline]
    fn consume_whitespace(&mut self) {
        self.consume_while(|b| b.is_ascii_whitespace());
    }

    fn consume_number(&mut self) {
        // Start with zero or more digits
        self.consume_while(|b| b.is_ascii_digit());

        // Optional dot
        if let Some(b'.') = self.peek() {
            self.current += 1; // consume '.'
            // Followed by zero or more digits
            self.consume_while(|b| b.is_ascii_digit());
        }
    }

    /// Returns the slice of the source that this token was lexed from.
    #[inline]
    pub fn source_of(&self, token: &Token) -> &'input [u8] {
        &self.source[token.start..token.end]
    }

    /// Like [source_of] but omits the delimiters of string literal and field
    ///  reference tokens. Escapes are left in place.
    #[inline]
    pub fn contents(&self, token: &Token) -> &'input [u8] {
        let s = self.source_of(token);
        match token.ty {
            TokenType::StringSingleQuote | TokenType::StringDoubleQuote | TokenType::FieldRef => {
                &s[1..s.len() - 1]
            }
            _ => s,
        }
    }

    /// Returns the next token without consuming it.
    pub fn peek_token(&self) -> Result<Option<Token>, Error> {
        self.clone().next_token()
    }

    /// Consumes the next token if it has type [ty].
    pub fn consume(&mut self, ty: TokenType) -> Result<bool, Error> {
        let mut lookahead = self.clone();
        match lookahead.next_token()? {
            Some(tok) if tok.ty == ty => {
                *self = lookahead;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn next_token(&mut self) -> Result<Option<Token>, Error> {
        self.consume_whitespace();

        if self.is_empty() {
            return Ok(None);
        }
        let start = self.current;

        // Convenience macro for returning a token from `start` to `self.current`
        // The match below will borrow self as mutable, so a simple closure won't
        //  do the trick.
        macro_rules! tok {
            ($name:ident) => {{
                Token {
                    ty: TokenType::$name,
                    start,
                    end: self.current,
                }
            }};
        }

        Ok(Some(match self.pop_unchecked() {
            b'(' => tok!(ParenLeft),
            b')' => tok!(ParenRight),
            b',' => tok!(Comma),
            b'/' => tok!(ForwardSlash),
            b'*' => tok!(Asterisk),
            b'%' => tok!(Percent),

            // While +/- could be the start of a number, we treat them as
            //  operators and allow the parser to interpret them as unary or
            //  binary operators
            b'+' => tok!(Plus),
            b'-' => tok!(Minus),
            b'&' => {
                if self.consume1(b'&') {
                    tok!(And)
                } else {
                    tok!(Ampersand)
                }
            }
            b'|' => {
                if self.consume1(b'|') {
                    tok!(Or)
                } else {
                    return Err(Error::UnexpectedCharacter(start));
                }
            }
            b'=' => {
                self.consume1(b'=');
                tok!(Equals)
            }
            b'!' => {
                if self.consume1(b'=') {
                    tok!(NotEquals)
                } else {
                    tok!(Bang)
                }
            }
            b'<' => {
                if self.consume1(b'>') {
                    tok!(NotEquals)
                } else if self.consume1(b'=') {
                    tok!(LTE)
                } else {
                    tok!(LT)
                }
            }
            b'>' => {
                if self.consume1(b'=') {
                    tok!(GTE)
                } else {
                    tok!(GT)
                }
            }

            // Single and double-quoted strings, backslash escapes the next byte
            term if term == b'\'' || term == b'"' => {
                let mut escaped = false;
                loop {
                    match self.peek() {
                        None => return Err(Error::UnterminatedStringLiteral(start)),
                        Some(b) if b == term && !escaped => break,
                        Some(b) => {
                            escaped = b == b'\\' && !escaped;
                            self.current += 1;
                        }
                    }
                }

                // consume closing term
                self.current += 1;
                if term == b'"' {
                    tok!(StringDoubleQuote)
                } else {
                    tok!(StringSingleQuote)
                }
            }

            b'{' => {
                self.consume_while(|b| b != b'}');
                if self.is_empty() {
                    return Err(Error::UnterminatedFieldReference(start));
                }
                self.current += 1;
                tok!(FieldRef)
            }

            // Identifiers start with a-Z or underscore; TRUE/FALSE/NULL are
            //  keywords regardless of case
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                self.consume_while(|b| matches!(b, b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_'));
                let word = &self.source[start..self.current];
                if word.eq_ignore_ascii_case(b"true") {
                    tok!(True)
                } else if word.eq_ignore_ascii_case(b"false") {
                    tok!(False)
                } else if word.eq_ignore_ascii_case(b"null") {
                    tok!(Null)
                } else {
                    tok!(Identifier)
                }
            }

            // Digits or a dot mean it's a number
            b'0'..=b'9' | b'.' => {
                self.current -= 1;
                self.consume_number();
                tok!(Number)
            }
            _ => return Err(Error::UnexpectedCharacter(start)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lex_basic() {
        //NOTE this test doesn't use the handy assert_toks macro because we're
        //  checking that the token boundaries are correct as well.
        //              0         1         2
        //              0123456789012345678901234
        let source = r#"'single' & "double" {fld}"#;
        let mut lexer = Lexer::new(source.as_bytes());

        let tok = lexer.next_token();
        assert_eq!(
            tok,
            Ok(Some(Token {
                ty: TokenType::StringSingleQuote,
                start: 0,
                end: 8
            }))
        );
        assert_eq!(lexer.contents(&tok.unwrap().unwrap()), b"single");

        assert_eq!(
            lexer.next_token(),
            Ok(Some(Token {
                ty: TokenType::Ampersand,
                start: 9,
                end: 10
            }))
        );
        let tok = lexer.next_token();
        assert_eq!(
            tok,
            Ok(Some(Token {
                ty: TokenType::StringDoubleQuote,
                start: 11,
                end: 19
            }))
        );
        assert_eq!(lexer.contents(&tok.unwrap().unwrap()), b"double");

        let tok = lexer.next_token();
        assert_eq!(
            tok,
            Ok(Some(Token {
                ty: TokenType::FieldRef,
                start: 20,
                end: 25
            }))
        );
        assert_eq!(lexer.contents(&tok.unwrap().unwrap()), b"fld");
        assert_eq!(lexer.next_token(), Ok(None));
    }

    #[test]
    fn lex_numbers() {
        //             0         1
        //             01234567890123456
        let source = b"12.3 4+5. - .6009";
        let mut lexer = Lexer::new(source);
        assert_eq!(
            lexer.next_token(),
            Ok(Some(Token {
                ty: TokenType::Number,
                start: 0,
                end: 4,
            }))
        );
        assert_eq!(
            lexer.next_token(),
            Ok(Some(Token {
                ty: TokenType::Number,
                start: 5,
                end: 6,
            }))
        );
        assert_eq!(
            lexer.next_token(),
            Ok(Some(Token {
                ty: TokenType::Plus,
                start: 6,
                end: 7,
            }))
        );
        assert_eq!(
            lexer.next_token(),
            Ok(Some(Token {
                ty: TokenType::Number,
                start: 7,
                end: 9,
            }))
        );
        assert_eq!(
            lexer.next_token(),
            Ok(Some(Token {
                ty: TokenType::Minus,
                start: 10,
                end: 11,
            }))
        );
        assert_eq!(
            lexer.next_token(),
            Ok(Some(Token {
                ty: TokenType::Number,
                start: 12,
                end: 17,
            }))
        );
    }

    macro_rules! assert_tok {
        ($lex:ident, $tok_ty:ident) => {{
            let tok = $lex.next_token();
            assert!(
                matches!(
                    tok,
                    Ok(Some(Token {
                        ty: TokenType::$tok_ty,
                        ..
                    }))
                ),
                "Expected {}, got {tok:?}",
                stringify!($tok_ty)
            );
        }};
    }
    macro_rules! assert_toks {
        ($lex:ident, $tok_ty:ident) => {{
            assert_tok!($lex, $tok_ty)
        }};
        ($lex:ident, $tok_ty:ident, $($rest:tt)*) => {
            assert_tok!($lex, $tok_ty);
            assert_toks!($lex, $($rest)*)
        };
    }

    #[test]
    fn lex_comparisons() {
        let source = b"= == != <> < > <= >=";
        let mut lexer = Lexer::new(source);
        assert_toks!(lexer, Equals, Equals, NotEquals, NotEquals, LT, GT, LTE, GTE);
    }

    #[test]
    fn lex_logical() {
        let source = b"TRUE && false || !Null";
        let mut lexer = Lexer::new(source);
        assert_toks!(lexer, True, And, False, Or, Bang, Null);
    }

    #[test]
    fn escaped_quote_does_not_terminate() {
        let source = br#""say \"hi\"""#;
        let mut lexer = Lexer::new(source);
        let tok = lexer.next_token().unwrap().unwrap();
        assert_eq!(tok.ty, TokenType::StringDoubleQuote);
        assert_eq!(lexer.contents(&tok), br#"say \"hi\""#);
    }

    #[test]
    fn unterminated() {
        assert_eq!(
            Lexer::new(b"'abc").next_token(),
            Err(Error::UnterminatedStringLiteral(0))
        );
        assert_eq!(
            Lexer::new(b" {fld").next_token(),
            Err(Error::UnterminatedFieldReference(1))
        );
        assert_eq!(
            Lexer::new(b"#").next_token(),
            Err(Error::UnexpectedCharacter(0))
        );
    }
}
