use std::fmt;

use ordered_float::OrderedFloat;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Scalar functions whose result varies between invocations. A subtree
/// containing one of these must never be deduplicated or materialized.
const VOLATILE_FUNCTIONS: &[&str] = &[
    "RAND",
    "GENERATE_UUID",
    "CURRENT_TIMESTAMP",
    "CURRENT_DATE",
    "CURRENT_TIME",
    "CURRENT_DATETIME",
    "SESSION_USER",
];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
    And,
    Or,
}

impl BinaryOp {
    /// Operand order does not change the result.
    pub fn is_commutative(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Plus | BinaryOp::Multiply | BinaryOp::And | BinaryOp::Or
        )
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Literal {
    Int64(i64),
    Float64(OrderedFloat<f64>),
    Numeric(Decimal),
    String(String),
    Bool(bool),
    Null,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Int64(v) => write!(f, "{}", v),
            Literal::Float64(v) => write!(f, "{}", v),
            Literal::Numeric(v) => write!(f, "{}", v),
            Literal::String(v) => write!(f, "'{}'", v),
            Literal::Bool(v) => write!(f, "{}", if *v { "TRUE" } else { "FALSE" }),
            Literal::Null => write!(f, "NULL"),
        }
    }
}

impl AggregateFunc {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Expr {
    Column {
        table: Option<String>,
        name: String,
    },
    Literal(Literal),
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    ScalarFunction {
        name: String,
        args: Vec<Expr>,
    },
    Aggregate {
        func: AggregateFunc,
        arg: Option<Box<Expr>>,
        distinct: bool,
    },
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    pub fn table_column(table: impl Into<String>, name: impl Into<String>) -> Self {
        Expr::Column {
            table: Some(table.into()),
            name: name.into(),
        }
    }

    pub fn literal_int(v: i64) -> Self {
        Expr::Literal(Literal::Int64(v))
    }

    pub fn literal_bool(v: bool) -> Self {
        Expr::Literal(Literal::Bool(v))
    }

    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Self {
        Expr::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// True when every function in the expression produces the same output
    /// for the same input. Volatile builtins make the whole tree
    /// non-deterministic.
    pub fn is_deterministic(&self) -> bool {
        match self {
            Expr::Column { .. } | Expr::Literal(_) => true,
            Expr::BinaryOp { left, right, .. } => {
                left.is_deterministic() && right.is_deterministic()
            }
            Expr::Not(expr) => expr.is_deterministic(),
            Expr::ScalarFunction { name, args } => {
                !VOLATILE_FUNCTIONS
                    .iter()
                    .any(|v| name.eq_ignore_ascii_case(v))
                    && args.iter().all(Expr::is_deterministic)
            }
            Expr::Aggregate { arg, .. } => {
                arg.as_deref().is_none_or(Expr::is_deterministic)
            }
        }
    }

    /// Canonical form for fingerprinting: operands of commutative operators
    /// are sorted so `a = b` and `b = a` fingerprint identically. Used only
    /// for signature computation, never as a plan rewrite.
    pub fn normalized(&self) -> Expr {
        match self {
            Expr::Column { .. } | Expr::Literal(_) => self.clone(),
            Expr::BinaryOp { left, op, right } => {
                let mut left = left.normalized();
                let mut right = right.normalized();
                if op.is_commutative() && right < left {
                    std::mem::swap(&mut left, &mut right);
                }
                Expr::BinaryOp {
                    left: Box::new(left),
                    op: *op,
                    right: Box::new(right),
                }
            }
            Expr::Not(expr) => Expr::Not(Box::new(expr.normalized())),
            Expr::ScalarFunction { name, args } => Expr::ScalarFunction {
                name: name.to_uppercase(),
                args: args.iter().map(Expr::normalized).collect(),
            },
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => Expr::Aggregate {
                func: *func,
                arg: arg.as_ref().map(|a| Box::new(a.normalized())),
                distinct: *distinct,
            },
        }
    }

    /// True for conditions of the shape `col = col [AND col = col ...]`,
    /// the symmetric equi-join form whose operand order may be normalized.
    pub fn is_symmetric_equi_condition(&self) -> bool {
        match self {
            Expr::BinaryOp {
                left,
                op: BinaryOp::Eq,
                right,
            } => {
                matches!(left.as_ref(), Expr::Column { .. })
                    && matches!(right.as_ref(), Expr::Column { .. })
            }
            Expr::BinaryOp {
                left,
                op: BinaryOp::And,
                right,
            } => left.is_symmetric_equi_condition() && right.is_symmetric_equi_condition(),
            Expr::BinaryOp { .. }
            | Expr::Column { .. }
            | Expr::Literal(_)
            | Expr::Not(_)
            | Expr::ScalarFunction { .. }
            | Expr::Aggregate { .. } => false,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Column { table: Some(t), name } => write!(f, "{}.{}", t, name),
            Expr::Column { table: None, name } => write!(f, "{}", name),
            Expr::Literal(lit) => write!(f, "{}", lit),
            Expr::BinaryOp { left, op, right } => {
                fmt_operand(left, f)?;
                write!(f, " {} ", op.symbol())?;
                fmt_operand(right, f)
            }
            Expr::Not(expr) => write!(f, "NOT {}", expr),
            Expr::ScalarFunction { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expr::Aggregate {
                func,
                arg,
                distinct,
            } => match arg {
                Some(arg) if *distinct => write!(f, "{}(DISTINCT {})", func.as_str(), arg),
                Some(arg) => write!(f, "{}({})", func.as_str(), arg),
                None => write!(f, "{}(*)", func.as_str()),
            },
        }
    }
}

/// Nested binary operators are parenthesized so precedence stays visible.
fn fmt_operand(expr: &Expr, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match expr {
        Expr::BinaryOp { .. } => write!(f, "({})", expr),
        Expr::Column { .. }
        | Expr::Literal(_)
        | Expr::Not(_)
        | Expr::ScalarFunction { .. }
        | Expr::Aggregate { .. } => write!(f, "{}", expr),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SortExpr {
    pub expr: Expr,
    pub ascending: bool,
}

impl fmt::Display for SortExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}",
            self.expr,
            if self.ascending { "ASC" } else { "DESC" }
        )
    }
}
