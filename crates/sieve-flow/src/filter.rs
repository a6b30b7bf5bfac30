//! Restricted row-filter expressions.
//!
//! A filter is a SQL boolean expression over named numeric columns, e.g.
//! `n_genes > 500 AND (pct_mito < 0.2 OR NOT is_doublet)`. It is parsed with
//! `sqlparser` and then checked against a small grammar:
//!
//! | Form | Example |
//! |------|---------|
//! | column | `n_genes`, `"total counts"` |
//! | number / boolean literal | `0.25`, `-3`, `TRUE` |
//! | comparison | `=`, `!=`, `<>`, `<`, `<=`, `>`, `>=` |
//! | logic | `AND`, `OR`, `NOT`, parentheses |
//!
//! Everything else (function calls, subqueries, strings, arithmetic) is
//! rejected. Nothing is ever evaluated as code. A bare column in boolean
//! position is true when its value is non-zero.

use std::fmt;

use sqlparser::ast::{BinaryOperator, Expr as SqlExpr, UnaryOperator, Value};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use crate::error::{Error, Result};

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `!=` or `<>`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
}

impl CompareOp {
    fn apply(self, left: f64, right: f64) -> bool {
        match self {
            Self::Eq => left == right,
            Self::NotEq => left != right,
            Self::Lt => left < right,
            Self::LtEq => left <= right,
            Self::Gt => left > right,
            Self::GtEq => left >= right,
        }
    }
}

/// Parsed filter expression, not yet bound to columns.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    /// Reference to a named column.
    Column(String),
    /// Numeric literal.
    Number(f64),
    /// Boolean literal.
    Bool(bool),
    /// Arithmetic negation.
    Neg(Box<FilterExpr>),
    /// Logical negation.
    Not(Box<FilterExpr>),
    /// Comparison of two numeric operands.
    Compare {
        /// Operator.
        op: CompareOp,
        /// Left operand.
        left: Box<FilterExpr>,
        /// Right operand.
        right: Box<FilterExpr>,
    },
    /// Conjunction.
    And(Box<FilterExpr>, Box<FilterExpr>),
    /// Disjunction.
    Or(Box<FilterExpr>, Box<FilterExpr>),
}

impl FilterExpr {
    /// Parses a filter expression.
    ///
    /// # Errors
    ///
    /// Returns `Error::Filter` on a syntax error or any construct outside the
    /// supported grammar.
    pub fn parse(source: &str) -> Result<Self> {
        if source.trim().is_empty() {
            return Err(Error::filter("expression is empty"));
        }
        let dialect = GenericDialect {};
        let mut parser = Parser::new(&dialect)
            .try_with_sql(source)
            .map_err(|e| Error::filter(e.to_string()))?;
        let expr = parser
            .parse_expr()
            .map_err(|e| Error::filter(e.to_string()))?;
        let trailing = parser.peek_token();
        if trailing.token != Token::EOF {
            return Err(Error::filter(format!(
                "unexpected trailing input at '{}'",
                trailing.token
            )));
        }
        Self::from_sql(&expr)
    }

    fn from_sql(expr: &SqlExpr) -> Result<Self> {
        match expr {
            SqlExpr::Identifier(ident) => Ok(Self::Column(ident.value.clone())),
            SqlExpr::Value(Value::Number(text, _)) => text
                .parse::<f64>()
                .map(Self::Number)
                .map_err(|_| Error::filter(format!("bad number: {text}"))),
            SqlExpr::Value(Value::Boolean(b)) => Ok(Self::Bool(*b)),
            SqlExpr::Nested(inner) => Self::from_sql(inner),
            SqlExpr::UnaryOp { op, expr } => {
                let inner = Box::new(Self::from_sql(expr)?);
                match op {
                    UnaryOperator::Not => Ok(Self::Not(inner)),
                    UnaryOperator::Minus => Ok(Self::Neg(inner)),
                    UnaryOperator::Plus => Ok(*inner),
                    other => Err(Error::filter(format!("unsupported unary operator: {other}"))),
                }
            }
            SqlExpr::BinaryOp { left, op, right } => {
                let l = Box::new(Self::from_sql(left)?);
                let r = Box::new(Self::from_sql(right)?);
                let op = match op {
                    BinaryOperator::And => return Ok(Self::And(l, r)),
                    BinaryOperator::Or => return Ok(Self::Or(l, r)),
                    BinaryOperator::Eq => CompareOp::Eq,
                    BinaryOperator::NotEq => CompareOp::NotEq,
                    BinaryOperator::Lt => CompareOp::Lt,
                    BinaryOperator::LtEq => CompareOp::LtEq,
                    BinaryOperator::Gt => CompareOp::Gt,
                    BinaryOperator::GtEq => CompareOp::GtEq,
                    other => {
                        return Err(Error::filter(format!("unsupported operator: {other}")))
                    }
                };
                Ok(Self::Compare {
                    op,
                    left: l,
                    right: r,
                })
            }
            other => Err(Error::filter(format!("unsupported expression: {other}"))),
        }
    }

    /// Column names referenced by the expression, in first-use order.
    #[must_use]
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Column(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            Self::Number(_) | Self::Bool(_) => {}
            Self::Neg(e) | Self::Not(e) => e.collect_columns(out),
            Self::Compare { left, right, .. } | Self::And(left, right) | Self::Or(left, right) => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
        }
    }

    /// Resolves column names against `columns` and type-checks the expression.
    ///
    /// # Errors
    ///
    /// Returns `Error::Filter` for unknown columns, for comparisons between
    /// non-numeric operands, and for logic over numeric literals.
    pub fn bind<S: AsRef<str>>(&self, columns: &[S]) -> Result<RowFilter> {
        let root = bind_bool(self, columns)?;
        Ok(RowFilter { root })
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(name) => write!(f, "\"{name}\""),
            Self::Number(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Self::Neg(e) => write!(f, "-({e})"),
            Self::Not(e) => write!(f, "NOT ({e})"),
            Self::Compare { op, left, right } => {
                let sym = match op {
                    CompareOp::Eq => "=",
                    CompareOp::NotEq => "<>",
                    CompareOp::Lt => "<",
                    CompareOp::LtEq => "<=",
                    CompareOp::Gt => ">",
                    CompareOp::GtEq => ">=",
                };
                write!(f, "({left} {sym} {right})")
            }
            Self::And(l, r) => write!(f, "({l} AND {r})"),
            Self::Or(l, r) => write!(f, "({l} OR {r})"),
        }
    }
}

#[derive(Debug, Clone)]
enum NumExpr {
    Column(usize),
    Literal(f64),
    Neg(Box<NumExpr>),
}

impl NumExpr {
    fn eval(&self, row: &[f32]) -> f64 {
        match self {
            Self::Column(i) => row.get(*i).copied().map_or(f64::NAN, f64::from),
            Self::Literal(v) => *v,
            Self::Neg(e) => -e.eval(row),
        }
    }
}

#[derive(Debug, Clone)]
enum BoolExpr {
    Literal(bool),
    Truthy(NumExpr),
    Not(Box<BoolExpr>),
    Compare(CompareOp, NumExpr, NumExpr),
    And(Box<BoolExpr>, Box<BoolExpr>),
    Or(Box<BoolExpr>, Box<BoolExpr>),
}

impl BoolExpr {
    fn eval(&self, row: &[f32]) -> bool {
        match self {
            Self::Literal(b) => *b,
            Self::Truthy(e) => {
                let v = e.eval(row);
                !v.is_nan() && v != 0.0
            }
            Self::Not(e) => !e.eval(row),
            Self::Compare(op, l, r) => op.apply(l.eval(row), r.eval(row)),
            Self::And(l, r) => l.eval(row) && r.eval(row),
            Self::Or(l, r) => l.eval(row) || r.eval(row),
        }
    }
}

fn resolve<S: AsRef<str>>(name: &str, columns: &[S]) -> Result<usize> {
    columns
        .iter()
        .position(|c| c.as_ref() == name)
        .ok_or_else(|| Error::filter(format!("unknown column '{name}'")))
}

fn bind_num<S: AsRef<str>>(expr: &FilterExpr, columns: &[S]) -> Result<NumExpr> {
    match expr {
        FilterExpr::Column(name) => Ok(NumExpr::Column(resolve(name, columns)?)),
        FilterExpr::Number(v) => Ok(NumExpr::Literal(*v)),
        FilterExpr::Neg(inner) => Ok(NumExpr::Neg(Box::new(bind_num(inner, columns)?))),
        other => Err(Error::filter(format!(
            "expected a numeric operand, found {other}"
        ))),
    }
}

fn bind_bool<S: AsRef<str>>(expr: &FilterExpr, columns: &[S]) -> Result<BoolExpr> {
    match expr {
        FilterExpr::Bool(b) => Ok(BoolExpr::Literal(*b)),
        FilterExpr::Column(name) => Ok(BoolExpr::Truthy(NumExpr::Column(resolve(name, columns)?))),
        FilterExpr::Not(inner) => Ok(BoolExpr::Not(Box::new(bind_bool(inner, columns)?))),
        FilterExpr::Compare { op, left, right } => Ok(BoolExpr::Compare(
            *op,
            bind_num(left, columns)?,
            bind_num(right, columns)?,
        )),
        FilterExpr::And(l, r) => Ok(BoolExpr::And(
            Box::new(bind_bool(l, columns)?),
            Box::new(bind_bool(r, columns)?),
        )),
        FilterExpr::Or(l, r) => Ok(BoolExpr::Or(
            Box::new(bind_bool(l, columns)?),
            Box::new(bind_bool(r, columns)?),
        )),
        other @ (FilterExpr::Number(_) | FilterExpr::Neg(_)) => Err(Error::filter(format!(
            "expected a boolean expression, found {other}"
        ))),
    }
}

/// A filter bound to a fixed column order, ready to test rows.
#[derive(Debug, Clone)]
pub struct RowFilter {
    root: BoolExpr,
}

impl RowFilter {
    /// Parses `source` and binds it to `columns`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Filter` if parsing or binding fails.
    pub fn compile<S: AsRef<str>>(source: &str, columns: &[S]) -> Result<Self> {
        FilterExpr::parse(source)?.bind(columns)
    }

    /// Tests one row. Values are indexed in the bound column order.
    #[must_use]
    pub fn matches(&self, row: &[f32]) -> bool {
        self.root.eval(row)
    }
}
