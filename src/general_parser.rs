//! The reader: turns lexer tokens into s-expression [`Value`]s.
//!
//! Lists may be dotted (`(a . b)`) and `'datum` reads as `(quote datum)`.
//! Every error carries the span of the text that caused it.
use logos::SpannedIter;

use crate::{
    lexer::{LexerError, Span, Token},
    value::Value,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("{error}")]
    Lexer { error: LexerError, span: Span },
    #[error("unexpected `)`")]
    UnexpectedCloseParen(Span),
    #[error("unexpected `.`")]
    UnexpectedDot(Span),
    #[error("expected `)` after the tail of a dotted list")]
    ExpectedCloseParen(Span),
    #[error("list is never closed")]
    UnclosedList(Span),
    #[error("unexpected end of input")]
    UnexpectedEof(Span),
    #[error("data nested deeper than {MAX_NESTING} levels")]
    TooDeep(Span),
}

/// How many lists and quotes a datum may be nested in
pub const MAX_NESTING: usize = 256;

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            Self::Lexer { span, .. }
            | Self::UnexpectedCloseParen(span)
            | Self::UnexpectedDot(span)
            | Self::ExpectedCloseParen(span)
            | Self::UnclosedList(span)
            | Self::UnexpectedEof(span)
            | Self::TooDeep(span) => span.clone(),
        }
    }
}

/// Reads every top-level datum of `source`.
pub fn read(source: &str) -> Result<Vec<Value>, ParseError> {
    let mut reader = Reader {
        tokens: Token::lexer(source).spanned(),
        lookahead: None,
        end: source.len(),
        depth: 0,
    };
    let mut data = vec![];
    while reader.peek()?.is_some() {
        data.push(reader.datum()?);
    }
    Ok(data)
}

struct Reader<'s> {
    tokens: SpannedIter<'s, Token>,
    lookahead: Option<(Token, Span)>,
    end: usize,
    depth: usize,
}

impl Reader<'_> {
    /// Next token that is not trivia
    fn next_token(&mut self) -> Result<Option<(Token, Span)>, ParseError> {
        if let Some(token) = self.lookahead.take() {
            return Ok(Some(token));
        }
        for (token, span) in self.tokens.by_ref() {
            match token {
                Ok(token) if token.is_trivia() => continue,
                Ok(token) => return Ok(Some((token, span))),
                Err(error) => return Err(ParseError::Lexer { error, span }),
            }
        }
        Ok(None)
    }

    fn peek(&mut self) -> Result<Option<(Token, Span)>, ParseError> {
        if self.lookahead.is_none() {
            self.lookahead = self.next_token()?;
        }
        Ok(self.lookahead.clone())
    }

    fn datum(&mut self) -> Result<Value, ParseError> {
        let Some((token, span)) = self.next_token()? else {
            return Err(ParseError::UnexpectedEof(self.end..self.end));
        };
        match token {
            Token::Identifier(name) => Ok(Value::symbol(name)),
            Token::Boolean(b) => Ok(Value::Boolean(b)),
            Token::Fixnum(n) => Ok(Value::Fixnum(n)),
            Token::Quote => {
                if self.peek()?.is_none() {
                    return Err(ParseError::UnexpectedEof(span));
                }
                let quoted = self.nested(span, Self::datum)?;
                Ok(Value::list([Value::symbol("quote"), quoted]))
            }
            Token::LParen => self.nested(span.clone(), |reader| reader.list(span)),
            Token::RParen => Err(ParseError::UnexpectedCloseParen(span)),
            Token::Dot => Err(ParseError::UnexpectedDot(span)),
            Token::IntralineWhitespace | Token::LineEnding | Token::Comment => self.datum(),
        }
    }

    fn nested(
        &mut self,
        span: Span,
        read: impl FnOnce(&mut Self) -> Result<Value, ParseError>,
    ) -> Result<Value, ParseError> {
        if self.depth == MAX_NESTING {
            return Err(ParseError::TooDeep(span));
        }
        self.depth += 1;
        let value = read(self);
        self.depth -= 1;
        value
    }

    fn list(&mut self, open: Span) -> Result<Value, ParseError> {
        let mut items = vec![];
        loop {
            match self.peek()? {
                None => return Err(ParseError::UnclosedList(open)),
                Some((Token::RParen, _)) => {
                    self.next_token()?;
                    return Ok(Value::list(items));
                }
                Some((Token::Dot, dot)) => {
                    self.next_token()?;
                    if items.is_empty() {
                        return Err(ParseError::UnexpectedDot(dot));
                    }
                    match self.peek()? {
                        None => return Err(ParseError::UnclosedList(open)),
                        Some((Token::RParen, span)) => {
                            return Err(ParseError::UnexpectedCloseParen(span))
                        }
                        Some(_) => {}
                    }
                    let tail = self.datum()?;
                    return match self.next_token()? {
                        Some((Token::RParen, _)) => Ok(Value::list_with_tail(items, tail)),
                        Some((_, span)) => Err(ParseError::ExpectedCloseParen(span)),
                        None => Err(ParseError::UnclosedList(open)),
                    };
                }
                Some(_) => items.push(self.datum()?),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use super::{read, ParseError, MAX_NESTING};
    use crate::{lexer::LexerError, value::Value};

    fn read_one(src: &str) -> Value {
        let_assert!(Ok(data) = read(src));
        let_assert!([datum] = data.as_slice());
        datum.clone()
    }

    #[test]
    fn atoms() {
        check!(read_one("42") == Value::Fixnum(42));
        check!(read_one("-3") == Value::Fixnum(-3));
        check!(read_one("#true") == Value::Boolean(true));
        check!(read_one("make-counter") == Value::symbol("make-counter"));
        check!(read_one("()") == Value::Nil);
    }

    #[test]
    fn lists_print_back() {
        check!(read_one("(a (b . c) 'd)").to_string() == "(a (b . c) (quote d))");
        check!(read_one("(1 . (2 . (3 . ())))").to_string() == "(1 2 3)");
        check!(read_one("(lambda (x . rest) rest)").to_string() == "(lambda (x . rest) rest)");
    }

    #[test]
    fn trivia_is_skipped() {
        let_assert!(Ok(data) = read("; leading comment\n  1 ; one\n\t(2)\r\n"));
        check!(data.len() == 2);
        let_assert!(Ok(data) = read("   "));
        check!(data.is_empty());
    }

    #[test]
    fn errors_carry_spans() {
        let_assert!(Err(ParseError::UnexpectedCloseParen(span)) = read("1 )"));
        check!(span == (2..3));

        let_assert!(Err(ParseError::UnclosedList(span)) = read("(1 (2)"));
        check!(span == (0..1));

        let_assert!(Err(ParseError::UnexpectedDot(span)) = read("( . 1)"));
        check!(span == (2..3));

        let_assert!(Err(ParseError::UnexpectedCloseParen(_)) = read("(1 . )"));

        let_assert!(Err(ParseError::ExpectedCloseParen(span)) = read("(1 . 2 3)"));
        check!(span == (7..8));

        let_assert!(Err(ParseError::UnexpectedEof(span)) = read("(a) '"));
        check!(span == (4..5));

        let_assert!(Err(err @ ParseError::Lexer { .. }) = read("(a #)"));
        check!(err.span() == (3..4));
        check!(err == ParseError::Lexer { error: LexerError::Invalid, span: 3..4 });
    }

    #[test]
    fn nesting_is_bounded() {
        let deepest = format!("{}{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        let_assert!(Ok(_) = read(&deepest));

        let deeper = format!("{}{}", "(".repeat(MAX_NESTING + 1), ")".repeat(MAX_NESTING + 1));
        let_assert!(Err(ParseError::TooDeep(span)) = read(&deeper));
        check!(span == (MAX_NESTING..MAX_NESTING + 1));

        let quotes = format!("{}x", "'".repeat(MAX_NESTING + 1));
        let_assert!(Err(ParseError::TooDeep(_)) = read(&quotes));

        let_assert!(Err(ParseError::TooDeep(_)) = read(&"(".repeat(100_000)));
    }
}
