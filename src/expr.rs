//! Declarative expressions for predicates and computed columns.
//!
//! Expressions are plain data (serialisable, inspectable) rather than text in
//! some query language. The in-memory backend evaluates them row by row with
//! [`Expr::eval`]; the out-of-core adapter translates the same tree into its
//! engine's expressions.
//!
//! ```
//! use tabflow::expr::Expr;
//!
//! let big = Expr::col("amount").gt(Expr::lit(1000.0));
//! let json = serde_json::to_string(&big).unwrap();
//! assert_eq!(json, r#"{"binary":{"op":"gt","left":{"column":"amount"},"right":{"literal":1000.0}}}"#);
//! ```

use crate::schema::{ColumnType, Schema};
use crate::table::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Literal constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Null(()),
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Literal {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Null(()) => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(*n),
            Self::Text(s) => Value::Text(s.clone()),
        }
    }

    fn column_type(&self) -> ColumnType {
        match self {
            Self::Null(()) => ColumnType::Unknown,
            Self::Bool(_) => ColumnType::Boolean,
            Self::Number(_) => ColumnType::Number,
            Self::Text(_) => ColumnType::String,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Neq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    fn is_arithmetic(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Mul | Self::Div)
    }

    fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Column(String),
    Literal(Literal),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    IsNull(Box<Expr>),
}

/// Which values two sides of a comparison may hold.
#[derive(PartialEq, Eq)]
enum TypeClass {
    Number,
    Boolean,
    Text,
}

fn class_of(kind: ColumnType) -> TypeClass {
    match kind {
        ColumnType::Number => TypeClass::Number,
        ColumnType::Boolean => TypeClass::Boolean,
        ColumnType::String | ColumnType::Temporal | ColumnType::Unknown => TypeClass::Text,
    }
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Self {
        Self::Column(name.into())
    }

    pub fn lit(value: impl Into<Literal>) -> Self {
        Self::Literal(value.into())
    }

    pub fn null() -> Self {
        Self::Literal(Literal::Null(()))
    }

    fn binary(self, op: BinaryOp, other: Self) -> Self {
        Self::Binary {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    #[expect(clippy::should_implement_trait)]
    pub fn add(self, other: Self) -> Self {
        self.binary(BinaryOp::Add, other)
    }

    #[expect(clippy::should_implement_trait)]
    pub fn sub(self, other: Self) -> Self {
        self.binary(BinaryOp::Sub, other)
    }

    #[expect(clippy::should_implement_trait)]
    pub fn mul(self, other: Self) -> Self {
        self.binary(BinaryOp::Mul, other)
    }

    #[expect(clippy::should_implement_trait)]
    pub fn div(self, other: Self) -> Self {
        self.binary(BinaryOp::Div, other)
    }

    pub fn eq(self, other: Self) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn neq(self, other: Self) -> Self {
        self.binary(BinaryOp::Neq, other)
    }

    pub fn lt(self, other: Self) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn lt_eq(self, other: Self) -> Self {
        self.binary(BinaryOp::LtEq, other)
    }

    pub fn gt(self, other: Self) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn gt_eq(self, other: Self) -> Self {
        self.binary(BinaryOp::GtEq, other)
    }

    pub fn and(self, other: Self) -> Self {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: Self) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    #[expect(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn is_null(self) -> Self {
        Self::IsNull(Box::new(self))
    }

    /// Every column name the expression reads.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Column(name) => out.push(name),
            Self::Literal(_) => {}
            Self::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Self::Not(inner) | Self::IsNull(inner) => inner.collect_columns(out),
        }
    }

    /// Static result type against `schema`, or a description of the first
    /// typing problem found.
    pub fn infer_type(&self, schema: &Schema) -> Result<ColumnType, String> {
        match self {
            Self::Column(name) => schema
                .type_of(name)
                .ok_or_else(|| format!("column '{name}' not found")),
            Self::Literal(lit) => Ok(lit.column_type()),
            Self::Not(inner) => match inner.infer_type(schema)? {
                ColumnType::Boolean => Ok(ColumnType::Boolean),
                other => Err(format!("'not' needs a boolean operand, got {other}")),
            },
            Self::IsNull(inner) => inner.infer_type(schema).map(|_| ColumnType::Boolean),
            Self::Binary { op, left, right } => {
                let lt = left.infer_type(schema)?;
                let rt = right.infer_type(schema)?;
                if op.is_arithmetic() {
                    if lt == ColumnType::Number && rt == ColumnType::Number {
                        Ok(ColumnType::Number)
                    } else {
                        Err(format!("arithmetic '{op:?}' needs numbers, got {lt} and {rt}"))
                    }
                } else if op.is_logical() {
                    if lt == ColumnType::Boolean && rt == ColumnType::Boolean {
                        Ok(ColumnType::Boolean)
                    } else {
                        Err(format!("'{op:?}' needs booleans, got {lt} and {rt}"))
                    }
                } else if class_of(lt) == class_of(rt) {
                    Ok(ColumnType::Boolean)
                } else {
                    Err(format!("cannot compare {lt} with {rt}"))
                }
            }
        }
    }

    /// Evaluate against one row laid out per `schema`. Expressions are
    /// type-checked before execution, so a missing column evaluates to null.
    pub fn eval(&self, schema: &Schema, row: &[Value]) -> Value {
        match self {
            Self::Column(name) => schema
                .index_of(name)
                .and_then(|idx| row.get(idx))
                .cloned()
                .unwrap_or(Value::Null),
            Self::Literal(lit) => lit.to_value(),
            Self::Not(inner) => match inner.eval(schema, row) {
                Value::Bool(b) => Value::Bool(!b),
                _ => Value::Null,
            },
            Self::IsNull(inner) => Value::Bool(inner.eval(schema, row).is_null()),
            Self::Binary { op, left, right } => {
                let l = left.eval(schema, row);
                let r = right.eval(schema, row);
                eval_binary(*op, &l, &r)
            }
        }
    }

    /// Predicate evaluation: only `true` keeps a row.
    pub fn matches(&self, schema: &Schema, row: &[Value]) -> bool {
        matches!(self.eval(schema, row), Value::Bool(true))
    }
}

fn eval_binary(op: BinaryOp, l: &Value, r: &Value) -> Value {
    match op {
        BinaryOp::And => match (l.as_bool(), r.as_bool()) {
            (Some(false), _) | (_, Some(false)) => Value::Bool(false),
            (Some(true), Some(true)) => Value::Bool(true),
            _ => Value::Null,
        },
        BinaryOp::Or => match (l.as_bool(), r.as_bool()) {
            (Some(true), _) | (_, Some(true)) => Value::Bool(true),
            (Some(false), Some(false)) => Value::Bool(false),
            _ => Value::Null,
        },
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
            match (l.as_f64(), r.as_f64()) {
                (Some(a), Some(b)) => Value::Number(match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    _ => a / b,
                }),
                _ => Value::Null,
            }
        }
        BinaryOp::Eq | BinaryOp::Neq => {
            if l.is_null() || r.is_null() {
                return Value::Null;
            }
            let equal = l.compare(r) == Some(Ordering::Equal);
            Value::Bool(if op == BinaryOp::Eq { equal } else { !equal })
        }
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => match l.compare(r) {
            Some(ord) => Value::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::LtEq => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }),
            None => Value::Null,
        },
    }
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Eq => "==",
            Self::Neq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::And => "and",
            Self::Or => "or",
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(name) => f.write_str(name),
            Self::Literal(Literal::Null(())) => f.write_str("null"),
            Self::Literal(Literal::Bool(b)) => write!(f, "{b}"),
            Self::Literal(Literal::Number(n)) => write!(f, "{n}"),
            Self::Literal(Literal::Text(s)) => write!(f, "{s:?}"),
            Self::Binary { op, left, right } => write!(f, "({left} {} {right})", op.symbol()),
            Self::Not(inner) => write!(f, "not {inner}"),
            Self::IsNull(inner) => write!(f, "{inner} is null"),
        }
    }
}

impl From<f64> for Literal {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for Literal {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::from_pairs([
            ("store", ColumnType::String),
            ("amount", ColumnType::Number),
            ("active", ColumnType::Boolean),
        ])
        .expect("valid schema")
    }

    #[test]
    fn test_type_checking() {
        let s = schema();
        assert_eq!(
            Expr::col("amount").gt(Expr::lit(10)).infer_type(&s),
            Ok(ColumnType::Boolean)
        );
        assert_eq!(
            Expr::col("amount").mul(Expr::lit(2)).infer_type(&s),
            Ok(ColumnType::Number)
        );
        assert!(Expr::col("store").gt(Expr::lit(10)).infer_type(&s).is_err());
        assert!(Expr::col("amount").and(Expr::col("active")).infer_type(&s).is_err());
        assert!(Expr::col("missing").is_null().infer_type(&s).is_err());
    }

    #[test]
    fn test_kleene_logic() {
        let s = schema();
        let row = vec![Value::Text("a".to_owned()), Value::Null, Value::Bool(false)];

        // null > 10 is null, so the row is filtered out.
        let pred = Expr::col("amount").gt(Expr::lit(10));
        assert_eq!(pred.eval(&s, &row), Value::Null);
        assert!(!pred.matches(&s, &row));

        // null AND false is false; null OR true is true.
        let and = pred.clone().and(Expr::col("active"));
        assert_eq!(and.eval(&s, &row), Value::Bool(false));
        let or = pred.or(Expr::col("active").not());
        assert_eq!(or.eval(&s, &row), Value::Bool(true));
    }

    #[test]
    fn test_arithmetic() {
        let s = schema();
        let row = vec![Value::Null, Value::Number(7.0), Value::Bool(true)];
        let expr = Expr::col("amount").mul(Expr::lit(2)).sub(Expr::lit(4));
        assert_eq!(expr.eval(&s, &row), Value::Number(10.0));
        assert_eq!(
            Expr::col("amount").div(Expr::lit(0)).eval(&s, &row),
            Value::Number(f64::INFINITY)
        );
    }

    #[test]
    fn test_display() {
        let expr = Expr::col("amount").gt(Expr::lit(1000)).and(Expr::col("store").is_null().not());
        assert_eq!(expr.to_string(), "((amount > 1000) and not store is null)");
    }

    #[test]
    fn test_literal_json_forms() {
        let expr: Expr = serde_json::from_str(r#"{"literal": null}"#).expect("null literal");
        assert_eq!(expr, Expr::null());
        let expr: Expr = serde_json::from_str(r#"{"literal": "x"}"#).expect("text literal");
        assert_eq!(expr, Expr::lit("x"));
    }
}
