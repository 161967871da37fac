// src/graph/expression.rs

//! Task condition expressions.
//!
//! A small, typed evaluator over [`serde_json::Value`]. Grammar:
//!
//! ```text
//! expr    := or
//! or      := and (("or" | "||") and)*
//! and     := not (("and" | "&&") not)*
//! not     := ("not" | "!") not | cmp
//! cmp     := primary (("==" | "=" | "!=" | "<" | "<=" | ">" | ">=" | "in") primary)?
//! primary := literal | path | call | "(" expr ")" | "[" (expr ("," expr)*)? "]"
//! path    := ident ("." (ident | integer))*
//! call    := ident "(" (expr ("," expr)*)? ")"
//! ```
//!
//! Paths are looked up in the evaluation scope built by
//! [`TransactionContext::scope`](crate::graph::context::TransactionContext::scope):
//! `cluster`, `node`, `old` and `task`. Missing keys evaluate to `null`.
//!
//! Functions:
//! - `changed()`: the node's expected state differs from the recorded one.
//! - `changed(node.a.b)`: the same, restricted to one sub-tree.
//! - `len(x)`: length of a list, map or string.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use crate::errors::{DeployError, Result};

/// A parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source).map_err(|reason| expression_error(source, reason))?;
        let mut parser = Parser { tokens, pos: 0 };
        let ast = parser
            .parse_expression()
            .map_err(|reason| expression_error(source, reason))?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, scope: &Value) -> Result<Value> {
        eval(&self.ast, scope).map_err(|reason| expression_error(&self.source, reason))
    }

    pub fn is_true(&self, scope: &Value) -> Result<bool> {
        Ok(truthy(&self.evaluate(scope)?))
    }
}

fn expression_error(source: &str, reason: String) -> DeployError {
    DeployError::Expression {
        expression: source.to_string(),
        reason,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Literal(Value),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

fn tokenize(src: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let peek = |i: usize| chars.get(i).copied();

    while let Some(c) = peek(i) {
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' => {
                i += if peek(i + 1) == Some('=') { 2 } else { 1 };
                tokens.push(Token::Op(CmpOp::Eq));
            }
            '!' => {
                if peek(i + 1) == Some('=') {
                    tokens.push(Token::Op(CmpOp::Ne));
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' | '>' => {
                let with_eq = peek(i + 1) == Some('=');
                let op = match (c, with_eq) {
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    (_, true) => CmpOp::Ge,
                    (_, false) => CmpOp::Gt,
                };
                tokens.push(Token::Op(op));
                i += if with_eq { 2 } else { 1 };
            }
            '&' | '|' => {
                if peek(i + 1) != Some(c) {
                    return Err(format!("expected '{c}{c}' at offset {i}"));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match peek(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\\') if peek(i + 1).is_some() => {
                            s.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit()
                || (c == '-' && peek(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                // Right after a dot only an integer path segment is allowed.
                let after_dot = matches!(tokens.last(), Some(Token::Dot));
                let start = i;
                i += 1;
                while let Some(d) = peek(i) {
                    let fraction = d == '.'
                        && !after_dot
                        && peek(i + 1).is_some_and(|n| n.is_ascii_digit());
                    if d.is_ascii_digit() || fraction {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while peek(i).is_some_and(|d| d.is_alphanumeric() || d == '_' || d == '$') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::Op(CmpOp::In),
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{other}' at offset {i}")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult<T> = std::result::Result<T, String>;

impl Parser {
    fn parse_expression(&mut self) -> ParseResult<Expr> {
        if self.tokens.is_empty() {
            return Err("empty expression".to_string());
        }
        let expr = self.parse_or()?;
        match self.tokens.get(self.pos) {
            None => Ok(expr),
            Some(tok) => Err(format!("unexpected token {tok:?}")),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> ParseResult<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(format!("expected {expected:?}, found {:?}", self.peek()))
        }
    }

    fn parse_or(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> ParseResult<Expr> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> ParseResult<Expr> {
        let left = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_list(&mut self, close: &Token) -> ParseResult<Vec<Expr>> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_or()?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(&Token::Comma)?;
        }
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Literal(v)) => Ok(Expr::Literal(v)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => Ok(Expr::List(self.parse_list(&Token::RBracket)?)),
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let args = self.parse_list(&Token::RParen)?;
                    return Ok(Expr::Call(name, args));
                }
                let mut segments = vec![name];
                while self.eat(&Token::Dot) {
                    match self.next() {
                        Some(Token::Ident(seg)) => segments.push(seg),
                        Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            segments.push((n as u64).to_string())
                        }
                        other => return Err(format!("invalid path segment {other:?}")),
                    }
                }
                Ok(Expr::Path(segments))
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn eval(expr: &Expr, scope: &Value) -> std::result::Result<Value, String> {
    Ok(match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path(segments) => lookup(scope, segments.as_slice()).cloned().unwrap_or(Value::Null),
        Expr::List(items) => Value::Array(
            items
                .iter()
                .map(|item| eval(item, scope))
                .collect::<std::result::Result<_, _>>()?,
        ),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, scope)?)),
        Expr::And(l, r) => Value::Bool(truthy(&eval(l, scope)?) && truthy(&eval(r, scope)?)),
        Expr::Or(l, r) => Value::Bool(truthy(&eval(l, scope)?) || truthy(&eval(r, scope)?)),
        Expr::Compare(op, l, r) => Value::Bool(compare(*op, &eval(l, scope)?, &eval(r, scope)?)),
        Expr::Call(name, args) => call(name, args, scope)?,
    })
}

fn call(name: &str, args: &[Expr], scope: &Value) -> std::result::Result<Value, String> {
    match (name, args) {
        ("changed", []) => {
            let new = scope.get("node").unwrap_or(&Value::Null);
            let old = scope.get("old").unwrap_or(&Value::Null);
            Ok(Value::Bool(!values_equal(new, old)))
        }
        ("changed", [Expr::Path(segments)]) => match segments.split_first() {
            Some((root, rest)) if root == "node" => {
                let new = lookup(scope, segments.as_slice()).unwrap_or(&Value::Null);
                let old = scope
                    .get("old")
                    .and_then(|old| lookup(old, rest))
                    .unwrap_or(&Value::Null);
                Ok(Value::Bool(!values_equal(new, old)))
            }
            _ => Err("changed() expects a path rooted at `node`".to_string()),
        },
        ("changed", _) => Err("changed() takes at most one path argument".to_string()),
        ("len", [arg]) => {
            let n = match eval(arg, scope)? {
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::String(s) => s.chars().count(),
                Value::Null => 0,
                other => return Err(format!("len() is not defined for {other}")),
            };
            Ok(Value::from(n as u64))
        }
        _ => Err(format!("unknown function {name}() with {} argument(s)", args.len())),
    }
}

fn lookup<'v, S: AsRef<str>>(root: &'v Value, segments: &[S]) -> Option<&'v Value> {
    segments.iter().try_fold(root, |current, seg| match current {
        Value::Object(map) => map.get(seg.as_ref()),
        Value::Array(items) => seg.as_ref().parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Truthiness: `null`, `false`, `0`, and empty strings, lists and maps are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Structural equality that treats `1` and `1.0` as equal.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        CmpOp::Lt => ordering(left, right) == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering(left, right), Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering(left, right) == Some(Ordering::Greater),
        CmpOp::Ge => matches!(
            ordering(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        CmpOp::In => match (left, right) {
            (_, Value::Array(items)) => items.iter().any(|item| values_equal(left, item)),
            (Value::String(needle), Value::String(haystack)) => haystack.contains(needle.as_str()),
            (Value::String(key), Value::Object(map)) => map.contains_key(key),
            _ => false,
        },
    }
}
