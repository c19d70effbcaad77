//! Shared fixtures: a small arithmetic calculator and a recording notifier.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use dms_actor::{
    Calculator, CalculatorFactory, DataValue, NotificationCode, StateChangeNotifier, TreeItem,
};
use parking_lot::Mutex;

/// Install a test subscriber once; `RUST_LOG` selects what is shown.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Arithmetic expressions
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(i64),
    Name(String),
    Op(char),
    Open,
    Close,
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '.'
}

/// End of the name or path starting before `i`.
fn name_end(chars: &[char], mut i: usize) -> usize {
    while i < chars.len()
        && (chars[i].is_alphanumeric()
            || chars[i] == '_'
            || chars[i] == '.'
            || (chars[i] == '/' && chars.get(i + 1).copied().is_some_and(is_name_start)))
    {
        i += 1;
    }
    i
}

fn tokenize(expr: &str) -> anyhow::Result<Vec<Token>> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '0'..='9' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Num(text.parse()?));
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            // A `/` directly followed by a name starts or continues a path.
            '/' if chars.get(i + 1).copied().is_some_and(is_name_start)
                && matches!(tokens.last(), None | Some(Token::Op(_)) | Some(Token::Open)) =>
            {
                let start = i;
                i = name_end(&chars, i + 1);
                tokens.push(Token::Name(chars[start..i].iter().collect()));
            }
            '+' | '-' | '*' | '/' | '<' | '>' | '=' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            c if is_name_start(c) => {
                let start = i;
                i = name_end(&chars, i);
                tokens.push(Token::Name(chars[start..i].iter().collect()));
            }
            other => bail!("unexpected character '{}' in '{}'", other, expr),
        }
    }
    Ok(tokens)
}

#[derive(Debug)]
enum Expr {
    Num(i64),
    This,
    Supplier(usize),
    Neg(Box<Expr>),
    Binary(char, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    names: Vec<String>,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn comparison(&mut self) -> anyhow::Result<Expr> {
        let lhs = self.sum()?;
        match self.peek() {
            Some(Token::Op(op @ ('<' | '>' | '='))) => {
                let op = *op;
                self.pos += 1;
                Ok(Expr::Binary(op, Box::new(lhs), Box::new(self.sum()?)))
            }
            _ => Ok(lhs),
        }
    }

    fn sum(&mut self) -> anyhow::Result<Expr> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            let op = *op;
            self.pos += 1;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.term()?));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> anyhow::Result<Expr> {
        let mut lhs = self.factor()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek() {
            let op = *op;
            self.pos += 1;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.factor()?));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> anyhow::Result<Expr> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Name(name)) if name == "this" => Ok(Expr::This),
            Some(Token::Name(name)) => {
                let index = match self.names.iter().position(|known| *known == name) {
                    Some(index) => index,
                    None => {
                        self.names.push(name);
                        self.names.len() - 1
                    }
                };
                Ok(Expr::Supplier(index))
            }
            Some(Token::Op('-')) => Ok(Expr::Neg(Box::new(self.factor()?))),
            Some(Token::Open) => {
                let inner = self.comparison()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => bail!("missing ')'"),
                }
            }
            other => bail!("unexpected token {:?}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Int(i64),
    Bool(bool),
}

impl Value {
    fn int(self) -> anyhow::Result<i64> {
        match self {
            Value::Int(n) => Ok(n),
            Value::Bool(_) => bail!("expected a number"),
        }
    }
}

fn int_data(item: &TreeItem) -> anyhow::Result<i64> {
    item.data_as::<i64>()
        .map(|value| *value)
        .ok_or_else(|| anyhow!("'{}' has no integer value", item.full_name()))
}

fn eval(expr: &Expr, item: &TreeItem, suppliers: &[Arc<TreeItem>]) -> anyhow::Result<Value> {
    Ok(match expr {
        Expr::Num(n) => Value::Int(*n),
        Expr::This => Value::Int(int_data(item)?),
        Expr::Supplier(index) => {
            let supplier = suppliers
                .get(*index)
                .context("supplier list does not match the expression")?;
            Value::Int(int_data(supplier)?)
        }
        Expr::Neg(inner) => Value::Int(-eval(inner, item, suppliers)?.int()?),
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, item, suppliers)?.int()?;
            let rhs = eval(rhs, item, suppliers)?.int()?;
            match op {
                '+' => Value::Int(lhs + rhs),
                '-' => Value::Int(lhs - rhs),
                '*' => Value::Int(lhs * rhs),
                '/' if rhs == 0 => bail!("division by zero"),
                '/' => Value::Int(lhs / rhs),
                '<' => Value::Bool(lhs < rhs),
                '>' => Value::Bool(lhs > rhs),
                _ => Value::Bool(lhs == rhs),
            }
        }
    })
}

#[derive(Debug)]
pub struct ArithCalculator {
    expr: String,
    names: Vec<String>,
    ast: Expr,
    calls: Arc<Mutex<HashMap<String, usize>>>,
}

impl Calculator for ArithCalculator {
    fn expr(&self) -> &str {
        &self.expr
    }

    fn supplier_names(&self) -> &[String] {
        &self.names
    }

    fn calculate(&self, item: &TreeItem, suppliers: &[Arc<TreeItem>]) -> anyhow::Result<DataValue> {
        *self.calls.lock().entry(item.full_name()).or_default() += 1;
        Ok(match eval(&self.ast, item, suppliers)? {
            Value::Int(n) => Arc::new(n),
            Value::Bool(b) => Arc::new(b),
        })
    }
}

/// Parses `+ - * /`, comparisons, parentheses, integers and item paths. `this` is the value of
/// the calculated item itself, for integrity checks. Division needs spaces around the `/`
/// when the right-hand side is a name.
#[derive(Debug, Default)]
pub struct Arith {
    calls: Arc<Mutex<HashMap<String, usize>>>,
}

impl Arith {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// How often the rule of the item at `path` was evaluated.
    pub fn calls(&self, path: &str) -> usize {
        self.calls.lock().get(path).copied().unwrap_or(0)
    }
}

impl CalculatorFactory for Arith {
    fn parse(&self, _item: &TreeItem, expr: &str) -> anyhow::Result<Arc<dyn Calculator>> {
        let mut parser = Parser {
            tokens: tokenize(expr)?,
            pos: 0,
            names: Vec::new(),
        };
        let ast = parser.comparison()?;
        if parser.pos != parser.tokens.len() {
            bail!("trailing input in '{}'", expr);
        }
        Ok(Arc::new(ArithCalculator {
            expr: expr.to_string(),
            names: parser.names,
            ast,
            calls: self.calls.clone(),
        }))
    }
}

// ============================================================================
// Recording notifier
// ============================================================================

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(String, NotificationCode)>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(String, NotificationCode)> {
        self.events.lock().clone()
    }

    pub fn codes_for(&self, item: &str) -> Vec<NotificationCode> {
        self.events
            .lock()
            .iter()
            .filter(|(name, _)| name == item)
            .map(|(_, code)| *code)
            .collect()
    }

    pub fn position(&self, item: &str, code: NotificationCode) -> Option<usize> {
        self.events
            .lock()
            .iter()
            .position(|(name, c)| name == item && *c == code)
    }

    pub fn first(&self, code: NotificationCode) -> Option<usize> {
        self.events.lock().iter().position(|(_, c)| *c == code)
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl StateChangeNotifier for RecordingNotifier {
    fn on_state_change(&self, item: &str, code: NotificationCode) {
        self.events.lock().push((item.to_string(), code));
    }
}
