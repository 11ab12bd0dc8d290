use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

use rust_decimal::Decimal;

/// Sandboxed arithmetic over named values: `+ - * /`, parentheses, numeric
/// literals and identifiers. No calls, no I/O; unknown names are errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(Decimal),
    Name(String),
    Unary(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    UnexpectedChar(char),
    UnexpectedEnd,
    UnexpectedToken(String),
    UnknownName(String),
    DivisionByZero,
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprError::UnexpectedChar(c) => write!(f, "unexpected character {c:?}"),
            ExprError::UnexpectedEnd => write!(f, "unexpected end of expression"),
            ExprError::UnexpectedToken(t) => write!(f, "unexpected token {t:?}"),
            ExprError::UnknownName(n) => write!(f, "unknown name {n:?}"),
            ExprError::DivisionByZero => write!(f, "division by zero"),
        }
    }
}

impl Error for ExprError {}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Decimal),
    Name(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '0'..='9' | '.' => {
                let mut literal = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        literal.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = literal
                    .parse::<Decimal>()
                    .map_err(|_| ExprError::UnexpectedToken(literal.clone()))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Name(name));
            }
            other => return Err(ExprError::UnexpectedChar(other)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_term()?;
        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some(BinOp::Add),
            Some(Token::Minus) => Some(BinOp::Sub),
            _ => None,
        } {
            self.next();
            let rhs = self.parse_term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_factor()?;
        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some(BinOp::Mul),
            Some(Token::Slash) => Some(BinOp::Div),
            _ => None,
        } {
            self.next();
            let rhs = self.parse_factor()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_factor(&mut self) -> Result<Expr, ExprError> {
        match self.next().ok_or(ExprError::UnexpectedEnd)? {
            Token::Number(value) => Ok(Expr::Number(value)),
            Token::Name(name) => Ok(Expr::Name(name)),
            Token::Minus => Ok(Expr::Unary(Box::new(self.parse_factor()?))),
            Token::LParen => {
                let inner = self.parse_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExprError::UnexpectedEnd),
                }
            }
            other => Err(ExprError::UnexpectedToken(format!("{other:?}"))),
        }
    }
}

pub fn parse(input: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::UnexpectedToken(format!(
            "{:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

pub fn evaluate(expr: &Expr, scope: &BTreeMap<String, Decimal>) -> Result<Decimal, ExprError> {
    match expr {
        Expr::Number(value) => Ok(*value),
        Expr::Name(name) => scope
            .get(name)
            .copied()
            .ok_or_else(|| ExprError::UnknownName(name.clone())),
        Expr::Unary(inner) => Ok(-evaluate(inner, scope)?),
        Expr::Binary { op, lhs, rhs } => {
            let lhs = evaluate(lhs, scope)?;
            let rhs = evaluate(rhs, scope)?;
            match op {
                BinOp::Add => Ok(lhs + rhs),
                BinOp::Sub => Ok(lhs - rhs),
                BinOp::Mul => Ok(lhs * rhs),
                BinOp::Div => {
                    if rhs.is_zero() {
                        Err(ExprError::DivisionByZero)
                    } else {
                        Ok(lhs / rhs)
                    }
                }
            }
        }
    }
}

/// Parse-and-evaluate convenience for one-shot expressions.
pub fn evaluate_str(
    input: &str,
    scope: &BTreeMap<String, Decimal>,
) -> Result<Decimal, ExprError> {
    evaluate(&parse(input)?, scope)
}

/// Names referenced by an expression, for dependency checks.
pub fn referenced_names(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Number(_) => {}
        Expr::Name(name) => {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        Expr::Unary(inner) => referenced_names(inner, out),
        Expr::Binary { lhs, rhs, .. } => {
            referenced_names(lhs, out);
            referenced_names(rhs, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(pairs: &[(&str, &str)]) -> BTreeMap<String, Decimal> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.parse().unwrap()))
            .collect()
    }

    #[test]
    fn precedence_and_parens() {
        let scope = scope(&[("a", "2"), ("b", "3")]);
        assert_eq!(evaluate_str("a + b * 2", &scope).unwrap(), Decimal::from(8));
        assert_eq!(evaluate_str("(a + b) * 2", &scope).unwrap(), Decimal::from(10));
        assert_eq!(evaluate_str("-a + 5", &scope).unwrap(), Decimal::from(3));
    }

    #[test]
    fn division_is_exact_decimal() {
        let scope = scope(&[("value", "1048576")]);
        let out = evaluate_str("value / 1024 / 1024", &scope).unwrap();
        assert_eq!(out, Decimal::ONE);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let err = evaluate_str("tokens * price", &scope(&[("tokens", "5")])).unwrap_err();
        assert_eq!(err, ExprError::UnknownName("price".to_string()));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let err = evaluate_str("1 / 0", &BTreeMap::new()).unwrap_err();
        assert_eq!(err, ExprError::DivisionByZero);
    }

    #[test]
    fn rejects_trailing_garbage_and_bad_chars() {
        assert!(parse("a b").is_err());
        assert!(parse("a ^ 2").is_err());
        assert!(parse("fn()").is_err());
    }
}
