// Tokenizer and recursive-descent parser producing an immutable expression tree.
use time::OffsetDateTime;

use crate::core::error::{Error, ErrorKind};
use crate::core::value::Value;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl CmpOp {
    pub(crate) fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum FieldRef {
    Named(String),
    Source,
    Generated,
    Descriptor,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Expr {
    Field(FieldRef),
    Literal(Value),
    Compare {
        op: CmpOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Word(String),
    /// Unsigned magnitude; the sign is applied by the parser.
    Int(u64),
    Float(f64),
    Str(String),
    Dot,
    LParen,
    RParen,
    Minus,
    Op(CmpOp),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Word(word) => format!("`{word}`"),
            Token::Int(n) => format!("number {n}"),
            Token::Float(n) => format!("number {n}"),
            Token::Str(_) => "string literal".to_string(),
            Token::Dot => "`.`".to_string(),
            Token::LParen => "`(`".to_string(),
            Token::RParen => "`)`".to_string(),
            Token::Minus => "`-`".to_string(),
            Token::Op(op) => format!("`{}`", op.symbol()),
        }
    }
}

/// Deepest allowed nesting of parentheses and `not`.
pub(crate) const MAX_NESTING: usize = 256;

pub(crate) fn parse(text: &str) -> Result<Expr, Error> {
    let tokens = tokenize(text)?;
    let mut parser = Parser {
        text,
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    if let Some((token, col)) = parser.tokens.get(parser.pos) {
        return Err(syntax_error(
            text,
            *col,
            format!("unexpected {} after expression", token.describe()),
        ));
    }
    Ok(expr)
}

fn syntax_error(text: &str, col: usize, message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Syntax)
        .with_message(format!("{} at column {}", message.into(), col + 1))
        .with_hint(format!(
            "Selector `{text}` did not parse. Example: r.idx >= 3 and r.name != \"x\""
        ))
}

fn tokenize(text: &str) -> Result<Vec<(Token, usize)>, Error> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let start = pos;
        let ch = bytes[pos];
        let token = match ch {
            b' ' | b'\t' | b'\r' | b'\n' => {
                pos += 1;
                continue;
            }
            b'.' => {
                pos += 1;
                Token::Dot
            }
            b'(' => {
                pos += 1;
                Token::LParen
            }
            b')' => {
                pos += 1;
                Token::RParen
            }
            b'-' => {
                pos += 1;
                Token::Minus
            }
            b'=' | b'!' | b'<' | b'>' => {
                let next = bytes.get(pos + 1).copied();
                let (op, len) = match (ch, next) {
                    (b'=', Some(b'=')) => (CmpOp::Eq, 2),
                    (b'!', Some(b'=')) => (CmpOp::Ne, 2),
                    (b'<', Some(b'=')) => (CmpOp::Le, 2),
                    (b'>', Some(b'=')) => (CmpOp::Ge, 2),
                    (b'<', _) => (CmpOp::Lt, 1),
                    (b'>', _) => (CmpOp::Gt, 1),
                    (b'=', _) => {
                        return Err(syntax_error(text, start, "single `=`; use `==` to compare"));
                    }
                    _ => return Err(syntax_error(text, start, "unexpected `!`; use `not`")),
                };
                pos += len;
                Token::Op(op)
            }
            b'"' | b'\'' => {
                let (literal, end) = lex_string(text, start)?;
                pos = end;
                Token::Str(literal)
            }
            b'0'..=b'9' => {
                let (token, end) = lex_number(text, start)?;
                pos = end;
                token
            }
            c if c == b'_' || c.is_ascii_alphabetic() => {
                while pos < bytes.len() && (bytes[pos] == b'_' || bytes[pos].is_ascii_alphanumeric())
                {
                    pos += 1;
                }
                Token::Word(text[start..pos].to_string())
            }
            _ => {
                let shown = text[start..].chars().next().unwrap_or('?');
                return Err(syntax_error(text, start, format!("unexpected character `{shown}`")));
            }
        };
        tokens.push((token, start));
    }
    Ok(tokens)
}

fn lex_string(text: &str, start: usize) -> Result<(String, usize), Error> {
    let mut chars = text[start..].char_indices();
    let Some((_, quote)) = chars.next() else {
        return Err(syntax_error(text, start, "expected string literal"));
    };
    let mut out = String::new();
    while let Some((offset, ch)) = chars.next() {
        match ch {
            '\\' => {
                let Some((_, escaped)) = chars.next() else {
                    break;
                };
                match escaped {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '0' => out.push('\0'),
                    '\\' | '\'' | '"' => out.push(escaped),
                    other => {
                        return Err(syntax_error(
                            text,
                            start + offset,
                            format!("unknown escape `\\{other}`"),
                        ));
                    }
                }
            }
            c if c == quote => return Ok((out, start + offset + c.len_utf8())),
            c => out.push(c),
        }
    }
    Err(syntax_error(text, start, "unterminated string literal"))
}

fn lex_number(text: &str, start: usize) -> Result<(Token, usize), Error> {
    let bytes = text.as_bytes();
    if bytes[start..].starts_with(b"0x") || bytes[start..].starts_with(b"0X") {
        let mut end = start + 2;
        while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
            end += 1;
        }
        let value = u64::from_str_radix(&text[start + 2..end], 16)
            .map_err(|_| syntax_error(text, start, "invalid hex literal"))?;
        return Ok((Token::Int(value), end));
    }

    let mut end = start;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let is_float = end + 1 < bytes.len() && bytes[end] == b'.' && bytes[end + 1].is_ascii_digit();
    if is_float {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        let value = text[start..end]
            .parse::<f64>()
            .map_err(|_| syntax_error(text, start, "invalid number"))?;
        return Ok((Token::Float(value), end));
    }
    let value = text[start..end]
        .parse::<u64>()
        .map_err(|_| syntax_error(text, start, "integer literal out of range"))?;
    Ok((Token::Int(value), end))
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn peek_word(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w == word)
    }

    fn column(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, col)| *col)
            .unwrap_or(self.text.len())
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(token, _)| token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> Error {
        syntax_error(self.text, self.column(), message)
    }

    fn enter(&mut self, col: usize) -> Result<(), Error> {
        if self.depth >= MAX_NESTING {
            return Err(syntax_error(
                self.text,
                col,
                format!("selector nesting too deep (limit {MAX_NESTING})"),
            ));
        }
        self.depth += 1;
        Ok(())
    }

    // Chains are kept flat so a long `a or b or ...` does not deepen the tree.
    fn parse_or(&mut self) -> Result<Expr, Error> {
        let mut terms = vec![self.parse_and()?];
        while self.peek_word("or") {
            self.pos += 1;
            terms.push(self.parse_and()?);
        }
        Ok(match terms.len() {
            1 => terms.remove(0),
            _ => Expr::Or(terms),
        })
    }

    fn parse_and(&mut self) -> Result<Expr, Error> {
        let mut terms = vec![self.parse_not()?];
        while self.peek_word("and") {
            self.pos += 1;
            terms.push(self.parse_not()?);
        }
        Ok(match terms.len() {
            1 => terms.remove(0),
            _ => Expr::And(terms),
        })
    }

    fn parse_not(&mut self) -> Result<Expr, Error> {
        if self.peek_word("not") {
            self.enter(self.column())?;
            self.pos += 1;
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, Error> {
        let lhs = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Op(op)) => Some(*op),
            Some(Token::Word(word)) if word == "in" => Some(CmpOp::In),
            Some(Token::Word(word)) if word == "not" => Some(CmpOp::NotIn),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(lhs);
        };
        self.pos += 1;
        if op == CmpOp::NotIn {
            if !self.peek_word("in") {
                return Err(self.error("expected `in` after `not`"));
            }
            self.pos += 1;
        }
        let rhs = self.parse_operand()?;
        if matches!(self.peek(), Some(Token::Op(_))) {
            return Err(self.error("chained comparisons are not supported; use `and`"));
        }
        Ok(Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn parse_operand(&mut self) -> Result<Expr, Error> {
        let col = self.column();
        let Some(token) = self.bump() else {
            return Err(self.error("unexpected end of selector"));
        };
        match token {
            Token::LParen => {
                self.enter(col)?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(syntax_error(self.text, col, "unclosed `(`")),
                }
            }
            Token::Int(n) => i64::try_from(n)
                .map(|n| Expr::Literal(Value::Varint(n)))
                .map_err(|_| syntax_error(self.text, col, "integer literal out of range")),
            Token::Float(n) => Ok(Expr::Literal(Value::Float(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Minus => match self.bump() {
                Some(Token::Int(n)) => 0i64
                    .checked_sub_unsigned(n)
                    .map(|n| Expr::Literal(Value::Varint(n)))
                    .ok_or_else(|| syntax_error(self.text, col, "integer literal out of range")),
                Some(Token::Float(n)) => Ok(Expr::Literal(Value::Float(-n))),
                _ => Err(syntax_error(self.text, col, "`-` must precede a number")),
            },
            Token::Word(word) => self.parse_word(word, col),
            other => Err(syntax_error(
                self.text,
                col,
                format!("unexpected {}", other.describe()),
            )),
        }
    }

    fn parse_word(&mut self, word: String, col: usize) -> Result<Expr, Error> {
        match word.as_str() {
            "true" | "True" => return Ok(Expr::Literal(Value::Boolean(true))),
            "false" | "False" => return Ok(Expr::Literal(Value::Boolean(false))),
            "none" | "None" | "null" => return Ok(Expr::Literal(Value::Null)),
            "r" => {}
            "and" | "or" | "not" | "in" => {
                return Err(syntax_error(self.text, col, format!("unexpected keyword `{word}`")));
            }
            _ => {
                return Err(syntax_error(
                    self.text,
                    col,
                    format!("unknown name `{word}`; fields are accessed as r.<field>"),
                ));
            }
        }
        if self.bump() != Some(Token::Dot) {
            return Err(syntax_error(self.text, col, "expected `.` after `r`"));
        }
        let field = match self.bump() {
            Some(Token::Word(field)) => field,
            _ => return Err(syntax_error(self.text, col, "expected field name after `r.`")),
        };
        if self.peek() == Some(&Token::Dot) {
            return Err(self.error("nested field access is not supported"));
        }
        let field = match field.as_str() {
            "_source" => FieldRef::Source,
            "_generated" => FieldRef::Generated,
            "_desc" => FieldRef::Descriptor,
            _ => FieldRef::Named(field),
        };
        Ok(Expr::Field(field))
    }
}

/// Parses an RFC 3339 literal used against a datetime field.
pub(crate) fn parse_datetime_literal(text: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(text, &time::format_description::well_known::Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::{CmpOp, Expr, FieldRef, MAX_NESTING, parse};
    use crate::core::error::ErrorKind;
    use crate::core::value::Value;

    fn field(name: &str) -> Box<Expr> {
        Box::new(Expr::Field(FieldRef::Named(name.to_string())))
    }

    #[test]
    fn parses_simple_comparison() {
        assert_eq!(
            parse("r.idx >= 3").unwrap(),
            Expr::Compare {
                op: CmpOp::Ge,
                lhs: field("idx"),
                rhs: Box::new(Expr::Literal(Value::Varint(3))),
            }
        );
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let expr = parse("r.a == 1 or r.b == 2 and not r.c").unwrap();
        let Expr::Or(terms) = expr else {
            panic!("expected or at the root");
        };
        assert_eq!(terms.len(), 2);
        let Expr::And(factors) = &terms[1] else {
            panic!("expected and on the right");
        };
        assert_eq!(factors[1], Expr::Not(field("c")));
    }

    #[test]
    fn long_chains_stay_flat() {
        let text = vec!["r.idx == 1"; 10_000].join(" or ");
        let Expr::Or(terms) = parse(&text).unwrap() else {
            panic!("expected or at the root");
        };
        assert_eq!(terms.len(), 10_000);
    }

    #[test]
    fn deep_nesting_is_a_syntax_error() {
        let parens = format!("{}r.idx >= 3{}", "(".repeat(200_000), ")".repeat(200_000));
        let nots = format!("{}r.idx", "not ".repeat(200_000));
        for text in [parens, nots] {
            let err = parse(&text).expect_err("too deep");
            assert_eq!(err.kind(), ErrorKind::Syntax);
            assert!(err.message().unwrap().contains("nesting too deep"));
        }

        let ok = format!("{}r.idx{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(parse(&ok).is_ok());
        let ok = format!("{}r.idx", "not ".repeat(MAX_NESTING));
        assert!(parse(&ok).is_ok());
    }

    #[test]
    fn integer_literal_bounds() {
        assert_eq!(
            parse("r.idx >= -9223372036854775808").unwrap(),
            Expr::Compare {
                op: CmpOp::Ge,
                lhs: field("idx"),
                rhs: Box::new(Expr::Literal(Value::Varint(i64::MIN))),
            }
        );
        assert_eq!(
            parse("r.idx == 9223372036854775807").unwrap(),
            Expr::Compare {
                op: CmpOp::Eq,
                lhs: field("idx"),
                rhs: Box::new(Expr::Literal(Value::Varint(i64::MAX))),
            }
        );
        for text in [
            "r.idx == 9223372036854775808",
            "r.idx == -9223372036854775809",
            "r.idx == 0xFFFFFFFFFFFFFFFF",
        ] {
            let err = parse(text).expect_err(text);
            assert_eq!(err.kind(), ErrorKind::Syntax, "{text}");
            assert!(err.message().unwrap().contains("out of range"), "{text}");
        }
    }

    #[test]
    fn literals_and_metadata_fields() {
        assert_eq!(
            parse("r._source == 'a\\'b'").unwrap(),
            Expr::Compare {
                op: CmpOp::Eq,
                lhs: Box::new(Expr::Field(FieldRef::Source)),
                rhs: Box::new(Expr::Literal(Value::from("a'b"))),
            }
        );
        assert_eq!(
            parse("r.x != -1.5").unwrap(),
            Expr::Compare {
                op: CmpOp::Ne,
                lhs: field("x"),
                rhs: Box::new(Expr::Literal(Value::Float(-1.5))),
            }
        );
        assert_eq!(
            parse("r.x == 0x1F").unwrap(),
            Expr::Compare {
                op: CmpOp::Eq,
                lhs: field("x"),
                rhs: Box::new(Expr::Literal(Value::Varint(31))),
            }
        );
        assert_eq!(
            parse("'ba' not in r.foo").unwrap(),
            Expr::Compare {
                op: CmpOp::NotIn,
                lhs: Box::new(Expr::Literal(Value::from("ba"))),
                rhs: field("foo"),
            }
        );
    }

    #[test]
    fn malformed_selectors_are_syntax_errors() {
        for text in [
            "",
            "r.idx >=",
            "r.idx = 3",
            "idx >= 3",
            "r.idx >= 3 and",
            "(r.idx >= 3",
            "r.idx >= 3)",
            "r.a.b == 1",
            "r.idx >= 'open",
            "1 < r.idx < 3",
            "r.idx # 3",
            "not",
        ] {
            let err = parse(text).expect_err(text);
            assert_eq!(err.kind(), ErrorKind::Syntax, "{text}");
            assert!(err.message().unwrap().contains("column"), "{text}");
        }
    }
}
