//! # Expression
//!
//! A small, side-effect-free expression language used by template tags, `queueStatement`
//! gates and pointer strings. It operates on `serde_json::Value`s and only sees what a
//! [`Scope`] chooses to expose (memory slots, loop bindings, the running command's pid and
//! stack). There is no assignment and no way to call anything outside the allow-list below.
//!
//! Supported: literals, array/object literals, member access, indexing, `! - +` unary
//! operators, arithmetic, comparisons, `== != === !==`, `&& ||`, the ternary operator,
//! `JSON.*`, `Math.*`, `Object.keys/values`, `Array.isArray`, `String`, `Number`, `Boolean`,
//! `parseInt`, `parseFloat`, `encodeURIComponent` and a handful of string/array methods.

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while lexing, parsing or evaluating an expression.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Empty expression.")]
    Empty,
    #[error("Unexpected character '{ch}' at offset {offset} in '{source_text}'.")]
    UnexpectedChar {
        ch: char,
        offset: usize,
        source_text: String,
    },
    #[error("Unterminated string literal in '{0}'.")]
    UnterminatedString(String),
    #[error("Unexpected {found} in '{source_text}', expected {expected}.")]
    UnexpectedToken {
        found: String,
        expected: &'static str,
        source_text: String,
    },
    #[error("'{0}' is not defined.")]
    UnknownIdentifier(String),
    #[error("Cannot read property '{0}' of null.")]
    NullAccess(String),
    #[error("'{0}' is not an allowed function.")]
    NotAllowed(String),
    #[error("Invalid arguments for '{function}': {reason}")]
    InvalidArguments { function: String, reason: String },
}

type EvalResult<T> = Result<T, ExpressionError>;

/// Read-only view of the names an expression may reference.
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<Value>;
}

/// A plain name → value scope.
#[derive(Debug, Clone, Default)]
pub struct MapScope {
    values: BTreeMap<String, Value>,
}

impl MapScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.values.insert(name.into(), value);
        self
    }
}

impl Scope for MapScope {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }
}

// --- PUBLIC API ---

/// Parses and evaluates `source` against `scope`.
pub fn evaluate(source: &str, scope: &dyn Scope) -> EvalResult<Value> {
    let expr = parse(source)?;
    Evaluator { scope }.eval(&expr)
}

/// Evaluates `source` and converts the result with JavaScript truthiness rules.
pub fn evaluate_truthy(source: &str, scope: &dyn Scope) -> EvalResult<bool> {
    evaluate(source, scope).map(|v| is_truthy(&v))
}

/// Parses `source` into an expression tree.
pub fn parse(source: &str) -> EvalResult<Expr> {
    let tokens = Lexer::new(source).tokenize()?;
    if tokens.len() == 1 {
        return Err(ExpressionError::Empty);
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        source,
    };
    let expr = parser.expression()?;
    parser.expect_end()?;
    Ok(expr)
}

pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// String form used when a value is substituted into text.
pub fn to_display(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format_number(n),
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Builds a JSON number, keeping integral values integral.
#[allow(clippy::cast_possible_truncation)]
pub fn number(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn format_number(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => {
            (f as i64).to_string()
        }
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

pub fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

// --- LEXER ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Punct(&'static str),
    End,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Number(n) => format!("number {}", n),
            Self::Str(s) => format!("string '{}'", s),
            Self::Ident(i) => format!("identifier '{}'", i),
            Self::Punct(p) => format!("'{}'", p),
            Self::End => "end of expression".to_string(),
        }
    }
}

const PUNCTUATION: &[&str] = &[
    "===", "!==", "==", "!=", "<=", ">=", "&&", "||", "(", ")", "[", "]", "{", "}", ".", ",",
    "?", ":", "!", "+", "-", "*", "/", "%", "<", ">",
];

struct Lexer<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map_or(self.source.len(), |(i, _)| *i)
    }

    fn tokenize(mut self) -> EvalResult<Vec<Token>> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += 1;
            } else if c.is_ascii_digit() {
                tokens.push(self.number());
            } else if c == '"' || c == '\'' {
                tokens.push(self.string(c)?);
            } else if c.is_alphabetic() || c == '_' || c == '$' || c == '#' {
                tokens.push(self.identifier());
            } else {
                tokens.push(self.punct(c)?);
            }
        }
        tokens.push(Token::End);
        Ok(tokens)
    }

    fn number(&mut self) -> Token {
        let start = self.offset();
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = usize::from(matches!(self.peek_at(1), Some('+' | '-')));
            if self.peek_at(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1 + sign;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        let text = &self.source[start..self.offset()];
        Token::Number(text.parse().unwrap_or(f64::NAN))
    }

    fn string(&mut self, quote: char) -> EvalResult<Token> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            let c = self
                .peek()
                .ok_or_else(|| ExpressionError::UnterminatedString(self.source.to_string()))?;
            self.pos += 1;
            if c == quote {
                return Ok(Token::Str(out));
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            let escaped = self
                .peek()
                .ok_or_else(|| ExpressionError::UnterminatedString(self.source.to_string()))?;
            self.pos += 1;
            match escaped {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                'u' => {
                    let hex: String = (0..4).filter_map(|i| self.peek_at(i)).collect();
                    match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                        Some(ch) if hex.len() == 4 => {
                            out.push(ch);
                            self.pos += 4;
                        }
                        _ => out.push('u'),
                    }
                }
                other => out.push(other),
            }
        }
    }

    fn identifier(&mut self) -> Token {
        let start = self.offset();
        self.pos += 1;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$')
        {
            self.pos += 1;
        }
        Token::Ident(self.source[start..self.offset()].to_string())
    }

    fn punct(&mut self, c: char) -> EvalResult<Token> {
        let rest = &self.source[self.offset()..];
        for p in PUNCTUATION {
            if rest.starts_with(*p) {
                self.pos += p.chars().count();
                return Ok(Token::Punct(*p));
            }
        }
        Err(ExpressionError::UnexpectedChar {
            ch: c,
            offset: self.offset(),
            source_text: self.source.to_string(),
        })
    }
}

// --- PARSER ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional(Box<Expr>, Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::End)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Token::Punct(p) if *p == punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, punct: &'static str) -> EvalResult<()> {
        if self.eat(punct) {
            Ok(())
        } else {
            Err(self.unexpected(punct))
        }
    }

    fn expect_end(&self) -> EvalResult<()> {
        match self.peek() {
            Token::End => Ok(()),
            _ => Err(self.unexpected("end of expression")),
        }
    }

    fn unexpected(&self, expected: &'static str) -> ExpressionError {
        ExpressionError::UnexpectedToken {
            found: self.peek().describe(),
            expected,
            source_text: self.source.to_string(),
        }
    }

    fn expression(&mut self) -> EvalResult<Expr> {
        let condition = self.or()?;
        if self.eat("?") {
            let then = self.expression()?;
            self.expect(":")?;
            let otherwise = self.expression()?;
            return Ok(Expr::Conditional(
                Box::new(condition),
                Box::new(then),
                Box::new(otherwise),
            ));
        }
        Ok(condition)
    }

    fn or(&mut self) -> EvalResult<Expr> {
        let mut left = self.and()?;
        while self.eat("||") {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> EvalResult<Expr> {
        let mut left = self.equality()?;
        while self.eat("&&") {
            let right = self.equality()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn binary_level(
        &mut self,
        operators: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> EvalResult<Expr>,
    ) -> EvalResult<Expr> {
        let mut left = next(self)?;
        'outer: loop {
            for (punct, op) in operators {
                if self.eat(punct) {
                    let right = next(self)?;
                    left = Expr::Binary(*op, Box::new(left), Box::new(right));
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn equality(&mut self) -> EvalResult<Expr> {
        self.binary_level(
            &[
                ("===", BinaryOp::StrictEq),
                ("!==", BinaryOp::StrictNe),
                ("==", BinaryOp::Eq),
                ("!=", BinaryOp::Ne),
            ],
            Self::relational,
        )
    }

    fn relational(&mut self) -> EvalResult<Expr> {
        self.binary_level(
            &[
                ("<=", BinaryOp::Le),
                (">=", BinaryOp::Ge),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            Self::additive,
        )
    }

    fn additive(&mut self) -> EvalResult<Expr> {
        self.binary_level(
            &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
            Self::multiplicative,
        )
    }

    fn multiplicative(&mut self) -> EvalResult<Expr> {
        self.binary_level(
            &[
                ("*", BinaryOp::Mul),
                ("/", BinaryOp::Div),
                ("%", BinaryOp::Rem),
            ],
            Self::unary,
        )
    }

    fn unary(&mut self) -> EvalResult<Expr> {
        let op = if self.eat("!") {
            UnaryOp::Not
        } else if self.eat("-") {
            UnaryOp::Negate
        } else if self.eat("+") {
            UnaryOp::Plus
        } else {
            return self.postfix();
        };
        Ok(Expr::Unary(op, Box::new(self.unary()?)))
    }

    fn postfix(&mut self) -> EvalResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(".") {
                match self.advance() {
                    Token::Ident(name) => expr = Expr::Member(Box::new(expr), name),
                    // `stack.17` style numeric keys.
                    Token::Number(n) => expr = Expr::Member(Box::new(expr), to_display(&number(n))),
                    _ => {
                        self.pos -= 1;
                        return Err(self.unexpected("a property name"));
                    }
                }
            } else if self.eat("[") {
                let index = self.expression()?;
                self.expect("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat("(") {
                let args = self.list(")")?;
                expr = Expr::Call(Box::new(expr), args);
            } else {
                return Ok(expr);
            }
        }
    }

    fn list(&mut self, close: &'static str) -> EvalResult<Vec<Expr>> {
        let mut items = Vec::new();
        if self.eat(close) {
            return Ok(items);
        }
        loop {
            items.push(self.expression()?);
            if self.eat(close) {
                return Ok(items);
            }
            self.expect(",")?;
        }
    }

    fn primary(&mut self) -> EvalResult<Expr> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Literal(number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "undefined" => Expr::Literal(Value::Null),
                _ => Expr::Ident(name),
            }),
            Token::Punct("(") => {
                let inner = self.expression()?;
                self.expect(")")?;
                Ok(inner)
            }
            Token::Punct("[") => Ok(Expr::Array(self.list("]")?)),
            Token::Punct("{") => self.object(),
            _ => {
                self.pos -= 1;
                Err(self.unexpected("a value"))
            }
        }
    }

    fn object(&mut self) -> EvalResult<Expr> {
        let mut entries = Vec::new();
        if self.eat("}") {
            return Ok(Expr::Object(entries));
        }
        loop {
            let key = match self.advance() {
                Token::Ident(name) | Token::Str(name) => name,
                Token::Number(n) => to_display(&number(n)),
                _ => {
                    self.pos -= 1;
                    return Err(self.unexpected("an object key"));
                }
            };
            self.expect(":")?;
            entries.push((key, self.expression()?));
            if self.eat("}") {
                return Ok(Expr::Object(entries));
            }
            self.expect(",")?;
        }
    }
}

// --- EVALUATOR ---

const NAMESPACES: &[&str] = &["JSON", "Math", "Object", "Array"];
const GLOBAL_FUNCTIONS: &[&str] = &[
    "String",
    "Number",
    "Boolean",
    "parseInt",
    "parseFloat",
    "encodeURIComponent",
];

struct Evaluator<'s> {
    scope: &'s dyn Scope,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr) -> EvalResult<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => self
                .scope
                .lookup(name)
                .ok_or_else(|| ExpressionError::UnknownIdentifier(name.clone())),
            Expr::Member(object, property) => {
                let object = self.eval(object)?;
                get_property(&object, property)
            }
            Expr::Index(object, index) => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                get_property(&object, &to_display(&index))
            }
            Expr::Call(callee, args) => self.call(callee, args),
            Expr::Unary(op, operand) => {
                let value = self.eval(operand)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!is_truthy(&value)),
                    UnaryOp::Negate => number(-to_number(&value)),
                    UnaryOp::Plus => number(to_number(&value)),
                })
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Ok(binary(*op, &left, &right))
            }
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if is_truthy(&left) {
                    self.eval(right)
                } else {
                    Ok(left)
                }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if is_truthy(&left) {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            Expr::Conditional(condition, then, otherwise) => {
                if is_truthy(&self.eval(condition)?) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Array(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<EvalResult<Vec<_>>>()
                .map(Value::Array),
            Expr::Object(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), self.eval(value)?);
                }
                Ok(Value::Object(map))
            }
        }
    }

    fn call(&self, callee: &Expr, args: &[Expr]) -> EvalResult<Value> {
        let evaluated = || -> EvalResult<Vec<Value>> {
            args.iter().map(|arg| self.eval(arg)).collect()
        };
        match callee {
            Expr::Member(object, name) => {
                if let Expr::Ident(namespace) = object.as_ref() {
                    if NAMESPACES.contains(&namespace.as_str())
                        && self.scope.lookup(namespace).is_none()
                    {
                        return call_namespace(namespace, name, &evaluated()?);
                    }
                }
                let receiver = self.eval(object)?;
                call_method(&receiver, name, &evaluated()?)
            }
            Expr::Ident(name) if GLOBAL_FUNCTIONS.contains(&name.as_str()) => {
                call_global(name, &evaluated()?)
            }
            Expr::Ident(name) => Err(ExpressionError::NotAllowed(name.clone())),
            _ => Err(ExpressionError::NotAllowed("<computed callee>".to_string())),
        }
    }
}

fn get_property(object: &Value, property: &str) -> EvalResult<Value> {
    Ok(match object {
        Value::Null => return Err(ExpressionError::NullAccess(property.to_string())),
        Value::Object(map) => map.get(property).cloned().unwrap_or(Value::Null),
        Value::Array(items) => {
            if property == "length" {
                Value::from(items.len())
            } else {
                property
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .unwrap_or(Value::Null)
            }
        }
        Value::String(s) => {
            if property == "length" {
                Value::from(s.chars().count())
            } else {
                property
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| Value::String(c.to_string()))
                    .unwrap_or(Value::Null)
            }
        }
        Value::Bool(_) | Value::Number(_) => Value::Null,
    })
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Add => {
            let stringy = |v: &Value| !matches!(v, Value::Null | Value::Bool(_) | Value::Number(_));
            if stringy(left) || stringy(right) {
                Value::String(format!("{}{}", to_display(left), to_display(right)))
            } else {
                number(to_number(left) + to_number(right))
            }
        }
        BinaryOp::Sub => number(to_number(left) - to_number(right)),
        BinaryOp::Mul => number(to_number(left) * to_number(right)),
        BinaryOp::Div => number(to_number(left) / to_number(right)),
        BinaryOp::Rem => number(to_number(left) % to_number(right)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            Value::Bool(compare(op, left, right))
        }
        BinaryOp::Eq => Value::Bool(loose_equals(left, right)),
        BinaryOp::Ne => Value::Bool(!loose_equals(left, right)),
        BinaryOp::StrictEq => Value::Bool(strict_equals(left, right)),
        BinaryOp::StrictNe => Value::Bool(!strict_equals(left, right)),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> bool {
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return match op {
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            _ => a >= b,
        };
    }
    let (a, b) = (to_number(left), to_number(right));
    match op {
        BinaryOp::Lt => a < b,
        BinaryOp::Le => a <= b,
        BinaryOp::Gt => a > b,
        _ => a >= b,
    }
}

fn strict_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn loose_equals(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(_), Value::String(_)) => left == right,
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
            strict_equals(left, right)
        }
        _ => to_number(left) == to_number(right),
    }
}

fn invalid(function: &str, reason: impl Into<String>) -> ExpressionError {
    ExpressionError::InvalidArguments {
        function: function.to_string(),
        reason: reason.into(),
    }
}

fn first<'v>(function: &str, args: &'v [Value]) -> EvalResult<&'v Value> {
    args.first()
        .ok_or_else(|| invalid(function, "expected at least one argument"))
}

fn call_namespace(namespace: &str, name: &str, args: &[Value]) -> EvalResult<Value> {
    let qualified = format!("{}.{}", namespace, name);
    match (namespace, name) {
        ("JSON", "stringify") => Ok(Value::String(first(&qualified, args)?.to_string())),
        ("JSON", "parse") => {
            let text = to_display(first(&qualified, args)?);
            serde_json::from_str(&text).map_err(|e| invalid(&qualified, e.to_string()))
        }
        ("Math", "floor") => Ok(number(to_number(first(&qualified, args)?).floor())),
        ("Math", "ceil") => Ok(number(to_number(first(&qualified, args)?).ceil())),
        ("Math", "round") => Ok(number((to_number(first(&qualified, args)?) + 0.5).floor())),
        ("Math", "abs") => Ok(number(to_number(first(&qualified, args)?).abs())),
        ("Math", "min") => Ok(number(
            args.iter().map(to_number).fold(f64::INFINITY, f64::min),
        )),
        ("Math", "max") => Ok(number(
            args.iter().map(to_number).fold(f64::NEG_INFINITY, f64::max),
        )),
        ("Object", "keys") => match first(&qualified, args)? {
            Value::Object(map) => Ok(Value::Array(
                map.keys().cloned().map(Value::String).collect(),
            )),
            Value::Array(items) => Ok(Value::Array(
                (0..items.len()).map(|i| Value::String(i.to_string())).collect(),
            )),
            _ => Ok(Value::Array(Vec::new())),
        },
        ("Object", "values") => match first(&qualified, args)? {
            Value::Object(map) => Ok(Value::Array(map.values().cloned().collect())),
            Value::Array(items) => Ok(Value::Array(items.clone())),
            _ => Ok(Value::Array(Vec::new())),
        },
        ("Array", "isArray") => Ok(Value::Bool(matches!(
            args.first(),
            Some(Value::Array(_))
        ))),
        _ => Err(ExpressionError::NotAllowed(qualified)),
    }
}

fn call_global(name: &str, args: &[Value]) -> EvalResult<Value> {
    let arg = args.first().unwrap_or(&Value::Null);
    match name {
        "String" => Ok(Value::String(to_display(arg))),
        "Number" => Ok(number(to_number(arg))),
        "Boolean" => Ok(Value::Bool(is_truthy(arg))),
        "parseInt" => Ok(parse_leading(&to_display(arg), false)),
        "parseFloat" => Ok(parse_leading(&to_display(arg), true)),
        "encodeURIComponent" => Ok(Value::String(encode_uri_component(&to_display(arg)))),
        _ => Err(ExpressionError::NotAllowed(name.to_string())),
    }
}

fn parse_leading(text: &str, allow_fraction: bool) -> Value {
    let trimmed = text.trim_start();
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in trimmed.char_indices() {
        let ok = c.is_ascii_digit()
            || (i == 0 && (c == '-' || c == '+'))
            || (allow_fraction && c == '.' && !seen_dot);
        if !ok {
            break;
        }
        seen_dot |= c == '.';
        end = i + c.len_utf8();
    }
    trimmed[..end]
        .parse::<f64>()
        .map(|n| number(if allow_fraction { n } else { n.trunc() }))
        .unwrap_or(Value::Null)
}

fn encode_uri_component(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        let c = char::from(byte);
        if c.is_ascii_alphanumeric() || "-_.!~*'()".contains(c) {
            out.push(c);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn call_method(receiver: &Value, name: &str, args: &[Value]) -> EvalResult<Value> {
    let arg = args.first();
    match (receiver, name) {
        (Value::Null, _) => Err(ExpressionError::NullAccess(name.to_string())),
        (_, "toString") => Ok(Value::String(to_display(receiver))),
        (Value::String(s), "includes") => Ok(Value::Bool(
            s.contains(&to_display(first(name, args)?)),
        )),
        (Value::Array(items), "includes") => {
            let needle = first(name, args)?;
            Ok(Value::Bool(items.iter().any(|i| strict_equals(i, needle))))
        }
        (Value::String(s), "indexOf") => {
            let needle = to_display(first(name, args)?);
            Ok(match s.find(&needle) {
                Some(byte) => Value::from(s[..byte].chars().count()),
                None => Value::from(-1),
            })
        }
        (Value::Array(items), "indexOf") => {
            let needle = first(name, args)?;
            Ok(match items.iter().position(|i| strict_equals(i, needle)) {
                Some(i) => Value::from(i),
                None => Value::from(-1),
            })
        }
        (Value::Array(items), "join") => {
            let separator = arg.map_or_else(|| ",".to_string(), to_display);
            Ok(Value::String(
                items
                    .iter()
                    .map(|i| match i {
                        Value::Null => String::new(),
                        other => to_display(other),
                    })
                    .collect::<Vec<_>>()
                    .join(&separator),
            ))
        }
        (Value::String(s), "toUpperCase") => Ok(Value::String(s.to_uppercase())),
        (Value::String(s), "toLowerCase") => Ok(Value::String(s.to_lowercase())),
        (Value::String(s), "trim") => Ok(Value::String(s.trim().to_string())),
        (Value::String(s), "startsWith") => Ok(Value::Bool(
            s.starts_with(&to_display(first(name, args)?)),
        )),
        (Value::String(s), "endsWith") => Ok(Value::Bool(
            s.ends_with(&to_display(first(name, args)?)),
        )),
        (Value::String(s), "split") => {
            let separator = to_display(first(name, args)?);
            let parts: Vec<Value> = if separator.is_empty() {
                s.chars().map(|c| Value::String(c.to_string())).collect()
            } else {
                s.split(separator.as_str())
                    .map(|p| Value::String(p.to_string()))
                    .collect()
            };
            Ok(Value::Array(parts))
        }
        (Value::Number(n), "toFixed") => {
            let digits = arg.map_or(0.0, to_number);
            if !(0.0..=20.0).contains(&digits) {
                return Err(invalid(name, "digits must be between 0 and 20"));
            }
            let digits = digits.trunc() as usize;
            let value = n.as_f64().unwrap_or(f64::NAN);
            Ok(Value::String(format!("{:.*}", digits, value)))
        }
        _ => Err(ExpressionError::NotAllowed(format!(".{}()", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> MapScope {
        MapScope::new()
            .with(
                "memory",
                json!({
                    "user": {"value": {"name": "Ada", "tags": ["a", "b"]}, "origin": "User"},
                    "count": {"value": 3}
                }),
            )
            .with("#loop0", json!(1))
    }

    fn eval(source: &str) -> Value {
        evaluate(source, &scope()).unwrap()
    }

    #[test]
    fn test_member_and_index_access() {
        assert_eq!(eval("memory.user.value.name"), json!("Ada"));
        assert_eq!(eval("memory['user'].value.tags[1]"), json!("b"));
        assert_eq!(eval("memory.user.value.tags.length"), json!(2));
        assert_eq!(eval("memory.missing"), Value::Null);
        assert_eq!(eval("memory.user.value.tags[#loop0]"), json!("b"));
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(eval("1 + 2 * 3"), json!(7));
        assert_eq!(eval("(1 + 2) * 3"), json!(9));
        assert_eq!(eval("memory.count.value % 2"), json!(1));
        assert_eq!(eval("-memory.count.value + 1"), json!(-2));
        assert_eq!(eval("7 / 2"), json!(3.5));
        assert_eq!(eval("'n' + 1"), json!("n1"));
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(eval("memory.count.value > 2 && memory.count.value <= 3"), json!(true));
        assert_eq!(eval("memory.count.value == '3'"), json!(true));
        assert_eq!(eval("memory.count.value === '3'"), json!(false));
        assert_eq!(eval("memory.none || 'fallback'"), json!("fallback"));
        assert_eq!(eval("!memory.none"), json!(true));
        assert_eq!(eval("memory.count.value > 5 ? 'big' : 'small'"), json!("small"));
    }

    #[test]
    fn test_allowed_functions() {
        assert_eq!(eval("JSON.stringify([1, 'a'])"), json!("[1,\"a\"]"));
        assert_eq!(eval("JSON.parse('{\"a\":1}').a"), json!(1));
        assert_eq!(eval("Math.max(1, 9, 4)"), json!(9));
        assert_eq!(eval("Object.keys(memory).length"), json!(2));
        assert_eq!(eval("memory.user.value.tags.join('-')"), json!("a-b"));
        assert_eq!(eval("memory.user.value.name.toUpperCase()"), json!("ADA"));
        assert_eq!(eval("parseInt('42px')"), json!(42));
        assert_eq!(eval("(1.005).toFixed(1)"), json!("1.0"));
        assert_eq!(eval("encodeURIComponent('a b&c')"), json!("a%20b%26c"));
    }

    #[test]
    fn test_disallowed_calls_and_unknown_names() {
        let scope = scope();
        assert!(matches!(
            evaluate("alert('x')", &scope),
            Err(ExpressionError::NotAllowed(_))
        ));
        assert!(matches!(
            evaluate("window.location", &scope),
            Err(ExpressionError::UnknownIdentifier(_))
        ));
        assert!(matches!(
            evaluate("memory.missing.value", &scope),
            Err(ExpressionError::NullAccess(_))
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse("   "), Err(ExpressionError::Empty));
        assert!(parse("1 +").is_err());
        assert!(parse("'open").is_err());
        assert!(parse("a = 1").is_err());
        assert!(parse("1 2").is_err());
    }

    #[test]
    fn test_display_conversion() {
        assert_eq!(to_display(&json!(3.0)), "3");
        assert_eq!(to_display(&json!(0.5)), "0.5");
        assert_eq!(to_display(&json!({"a": [1]})), "{\"a\":[1]}");
        assert_eq!(to_display(&Value::Null), "null");
    }
}
