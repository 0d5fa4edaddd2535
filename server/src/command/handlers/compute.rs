//! Arithmetic expression handler
//!
//! Expressions are parsed by recursive descent into a tree that can only hold
//! numeric literals and the four basic binary operators:
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := factor (('*' | '/') factor)*
//! factor := NUMBER | '(' expr ')'
//! ```
//!
//! Anything else (names, calls, attribute access, unary operators, other
//! operators) fails to parse, so there is no path from an expression to code
//! execution.

use crate::command::envelope::CommandEnvelope;
use cmdbroker_shared::{limits, CommandResult};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    #[error("Unsupported expression type: {0}")]
    UnsupportedExpression(&'static str),

    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(&'static str),

    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),

    #[error("expression must be a string")]
    NotAString,

    #[error("expression longer than {} bytes", limits::MAX_EXPRESSION_LEN)]
    TooLong,

    #[error("expression nested deeper than {} levels", limits::MAX_EXPRESSION_DEPTH)]
    TooDeep,

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    Overflow,

    #[error("result is not a finite number")]
    NonFinite,
}

/// A numeric value; integer arithmetic stays integral until a division
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    fn into_json(self) -> Result<Value, ComputeError> {
        match self {
            Number::Int(i) => Ok(Value::from(i)),
            Number::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .ok_or(ComputeError::NonFinite),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(Number),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Number),
    Op(BinaryOp),
    LParen,
    RParen,
    Ident,
    Dot,
    Str,
    Bracket,
    Brace,
    CloseBracket,
    CloseBrace,
    Comma,
    Colon,
    /// Operators outside the allow-list, by their syntax-tree name
    OtherOp(&'static str),
    Compare,
    Tilde,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(Number::Int(i)) => write!(f, "'{}'", i),
            Token::Number(Number::Float(x)) => write!(f, "'{}'", x),
            Token::Op(BinaryOp::Add) => f.write_str("'+'"),
            Token::Op(BinaryOp::Sub) => f.write_str("'-'"),
            Token::Op(BinaryOp::Mul) => f.write_str("'*'"),
            Token::Op(BinaryOp::Div) => f.write_str("'/'"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Ident => f.write_str("name"),
            Token::Dot => f.write_str("'.'"),
            Token::Str => f.write_str("string literal"),
            Token::Bracket => f.write_str("'['"),
            Token::Brace => f.write_str("'{'"),
            Token::CloseBracket => f.write_str("']'"),
            Token::CloseBrace => f.write_str("'}'"),
            Token::Comma => f.write_str("','"),
            Token::Colon => f.write_str("':'"),
            Token::OtherOp(name) => write!(f, "operator {}", name),
            Token::Compare => f.write_str("comparison"),
            Token::Tilde => f.write_str("'~'"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ComputeError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();
        let (token, len) = match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
                continue;
            }
            b'0'..=b'9' => lex_number(&input[i..])?,
            b'.' if next.is_some_and(|n| n.is_ascii_digit()) => lex_number(&input[i..])?,
            b'.' => (Token::Dot, 1),
            b'+' => (Token::Op(BinaryOp::Add), 1),
            b'-' => (Token::Op(BinaryOp::Sub), 1),
            b'*' if next == Some(b'*') => (Token::OtherOp("Pow"), 2),
            b'*' => (Token::Op(BinaryOp::Mul), 1),
            b'/' if next == Some(b'/') => (Token::OtherOp("FloorDiv"), 2),
            b'/' => (Token::Op(BinaryOp::Div), 1),
            b'%' => (Token::OtherOp("Mod"), 1),
            b'@' => (Token::OtherOp("MatMult"), 1),
            b'&' => (Token::OtherOp("BitAnd"), 1),
            b'|' => (Token::OtherOp("BitOr"), 1),
            b'^' => (Token::OtherOp("BitXor"), 1),
            b'<' if next == Some(b'<') => (Token::OtherOp("LShift"), 2),
            b'>' if next == Some(b'>') => (Token::OtherOp("RShift"), 2),
            b'<' | b'>' if next == Some(b'=') => (Token::Compare, 2),
            b'<' | b'>' => (Token::Compare, 1),
            b'=' | b'!' if next == Some(b'=') => (Token::Compare, 2),
            b'~' => (Token::Tilde, 1),
            b'(' => (Token::LParen, 1),
            b')' => (Token::RParen, 1),
            b'[' => (Token::Bracket, 1),
            b'{' => (Token::Brace, 1),
            b']' => (Token::CloseBracket, 1),
            b'}' => (Token::CloseBrace, 1),
            b',' => (Token::Comma, 1),
            b':' => (Token::Colon, 1),
            b'"' | b'\'' => {
                let close = input[i + 1..]
                    .find(c as char)
                    .ok_or_else(|| ComputeError::InvalidSyntax("unterminated string literal".into()))?;
                (Token::Str, close + 2)
            }
            c if c == b'_' || c.is_ascii_alphabetic() => {
                let len = bytes[i..]
                    .iter()
                    .take_while(|b| **b == b'_' || b.is_ascii_alphanumeric())
                    .count();
                (Token::Ident, len)
            }
            _ => {
                let ch = input[i..].chars().next().unwrap_or('?');
                return Err(ComputeError::InvalidSyntax(format!("unexpected character '{}'", ch)));
            }
        };
        tokens.push(token);
        i += len;
    }

    Ok(tokens)
}

/// Lex a decimal literal: digits, optional fraction, optional exponent
fn lex_number(input: &str) -> Result<(Token, usize), ComputeError> {
    let bytes = input.as_bytes();
    let digits = |from: usize| bytes[from..].iter().take_while(|b| b.is_ascii_digit()).count();

    let mut len = digits(0);
    let mut is_float = false;

    if bytes.get(len) == Some(&b'.') {
        is_float = true;
        len += 1;
        len += digits(len);
    }
    if matches!(bytes.get(len), Some(b'e' | b'E')) {
        let mut exp = len + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let exp_digits = digits(exp);
        if exp_digits == 0 {
            return Err(ComputeError::InvalidSyntax("malformed number".into()));
        }
        is_float = true;
        len = exp + exp_digits;
    }

    let text = &input[..len];
    let number = if is_float {
        text.parse::<f64>()
            .map(Number::Float)
            .map_err(|e| ComputeError::InvalidSyntax(e.to_string()))?
    } else {
        text.parse::<i64>()
            .map(Number::Int)
            .map_err(|_| ComputeError::Overflow)?
    };
    Ok((Token::Number(number), len))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Expr, ComputeError> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ (BinaryOp::Add | BinaryOp::Sub))) = self.peek() {
            let op = *op;
            self.advance();
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ComputeError> {
        let mut lhs = self.factor()?;
        loop {
            match self.peek() {
                Some(Token::Op(op @ (BinaryOp::Mul | BinaryOp::Div))) => {
                    let op = *op;
                    self.advance();
                    let rhs = self.factor()?;
                    lhs = Expr::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    };
                }
                Some(Token::OtherOp(name)) => return Err(ComputeError::UnsupportedOperator(name)),
                Some(Token::Compare) => return Err(ComputeError::UnsupportedExpression("Compare")),
                Some(Token::Dot) => return Err(ComputeError::UnsupportedExpression("Attribute")),
                Some(Token::LParen) => return Err(ComputeError::UnsupportedExpression("Call")),
                Some(Token::Bracket) => return Err(ComputeError::UnsupportedExpression("Subscript")),
                _ => return Ok(lhs),
            }
        }
    }

    fn factor(&mut self) -> Result<Expr, ComputeError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                self.depth += 1;
                if self.depth > limits::MAX_EXPRESSION_DEPTH {
                    return Err(ComputeError::TooDeep);
                }
                let inner = self.expr()?;
                match self.advance() {
                    Some(Token::RParen) => {
                        self.depth -= 1;
                        Ok(inner)
                    }
                    Some(Token::Comma) => Err(ComputeError::UnsupportedExpression("Tuple")),
                    _ => Err(ComputeError::InvalidSyntax("'(' was never closed".into())),
                }
            }
            Some(Token::Ident) => Err(match self.peek() {
                Some(Token::LParen) => ComputeError::UnsupportedExpression("Call"),
                Some(Token::Dot) => ComputeError::UnsupportedExpression("Attribute"),
                Some(Token::Bracket) => ComputeError::UnsupportedExpression("Subscript"),
                _ => ComputeError::UnsupportedExpression("Name"),
            }),
            Some(Token::Op(BinaryOp::Add | BinaryOp::Sub)) | Some(Token::Tilde) => {
                Err(ComputeError::UnsupportedExpression("UnaryOp"))
            }
            Some(Token::Str) => Err(ComputeError::UnsupportedExpression("Constant")),
            Some(Token::Bracket) => Err(ComputeError::UnsupportedExpression("List")),
            Some(Token::Brace) => Err(ComputeError::UnsupportedExpression("Dict")),
            Some(token) => Err(ComputeError::InvalidSyntax(format!("unexpected {}", token))),
            None => Err(ComputeError::InvalidSyntax("unexpected end of expression".into())),
        }
    }
}

/// Parse an expression into its restricted syntax tree
pub fn parse(input: &str) -> Result<Expr, ComputeError> {
    if input.len() > limits::MAX_EXPRESSION_LEN {
        return Err(ComputeError::TooLong);
    }

    let mut parser = Parser {
        tokens: tokenize(input)?,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expr()?;

    match parser.peek() {
        None => Ok(expr),
        Some(Token::RParen) => Err(ComputeError::InvalidSyntax("unmatched ')'".into())),
        Some(token) => Err(ComputeError::InvalidSyntax(format!("unexpected {}", token))),
    }
}

/// Evaluate a syntax tree
pub fn evaluate(expr: &Expr) -> Result<Number, ComputeError> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Binary { op, lhs, rhs } => {
            let lhs = evaluate(lhs)?;
            let rhs = evaluate(rhs)?;
            apply(*op, lhs, rhs)
        }
    }
}

fn apply(op: BinaryOp, lhs: Number, rhs: Number) -> Result<Number, ComputeError> {
    match (op, lhs, rhs) {
        (BinaryOp::Div, _, _) => {
            let divisor = rhs.as_f64();
            if divisor == 0.0 {
                return Err(ComputeError::DivisionByZero);
            }
            finite(lhs.as_f64() / divisor)
        }
        (_, Number::Int(a), Number::Int(b)) => {
            let value = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                _ => a.checked_mul(b),
            };
            value.map(Number::Int).ok_or(ComputeError::Overflow)
        }
        _ => {
            let (a, b) = (lhs.as_f64(), rhs.as_f64());
            finite(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                _ => a * b,
            })
        }
    }
}

fn finite(value: f64) -> Result<Number, ComputeError> {
    if value.is_finite() {
        Ok(Number::Float(value))
    } else {
        Err(ComputeError::NonFinite)
    }
}

/// Handles `compute` commands
#[derive(Debug, Clone, Default)]
pub struct MathCommandHandler;

impl MathCommandHandler {
    pub fn process(&self, envelope: &CommandEnvelope) -> CommandResult {
        match self.evaluate(envelope) {
            Ok(value) => CommandResult::success().with_field("result", value),
            Err(e) => {
                debug!(error = %e, "Expression rejected");
                CommandResult::error(e.to_string())
            }
        }
    }

    fn evaluate(&self, envelope: &CommandEnvelope) -> Result<Value, ComputeError> {
        let expression = match envelope.get("expression") {
            None | Some(Value::Null) => "",
            Some(Value::String(s)) => s.as_str(),
            Some(_) => return Err(ComputeError::NotAString),
        };
        evaluate(&parse(expression)?)?.into_json()
    }
}
