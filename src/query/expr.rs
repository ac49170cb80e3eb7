//! Expression tree and vectorized interpreter for selector queries

use crate::core::property::Property;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Parsed expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// Integer literal, kept exact for identifier comparisons
    Integer(u64),
    /// Identifier not yet resolved to a property or `t`
    Name(String),
    Property(Property),
    /// The bound time variable `t`
    Time,
    /// Result array of clause `k`
    Clause(usize),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinaryOp {
    fn compare<T: PartialOrd>(&self, a: T, b: T) -> Option<bool> {
        Some(match self {
            BinaryOp::Lt => a < b,
            BinaryOp::Le => a <= b,
            BinaryOp::Gt => a > b,
            BinaryOp::Ge => a >= b,
            BinaryOp::Eq => a == b,
            BinaryOp::Ne => a != b,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Abs,
    Sqrt,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "abs" => Some(Function::Abs),
            "sqrt" => Some(Function::Sqrt),
            _ => None,
        }
    }

    fn apply(&self, x: f64) -> f64 {
        match self {
            Function::Abs => x.abs(),
            Function::Sqrt => x.sqrt(),
        }
    }
}

/// What a name may resolve to in a given position of a query
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    /// Time selector: only `t`
    Time,
    /// Particle predicate: properties recorded for the species
    Particle(&'a [Property]),
    /// Outer combination: clause placeholders only
    Outer,
}

impl Expr {
    /// Replace names with properties or `t`, rejecting anything out of scope
    pub fn resolve(self, scope: Scope<'_>, fragment: &str) -> Result<Expr> {
        Ok(match self {
            Expr::Name(name) => match scope {
                Scope::Time if name == "t" => Expr::Time,
                Scope::Particle(available) => {
                    let prop: Property = name.parse().map_err(|_| {
                        Error::selector(format!("unknown name `{}`", name), fragment)
                    })?;
                    if !available.contains(&prop) {
                        return Err(Error::UnknownProperty(prop.name().to_string()));
                    }
                    Expr::Property(prop)
                }
                _ => {
                    return Err(Error::selector(
                        format!("`{}` is not allowed here", name),
                        fragment,
                    ))
                }
            },
            Expr::Clause(k) => match scope {
                Scope::Outer => Expr::Clause(k),
                _ => return Err(Error::selector("nested any()/all() clause", fragment)),
            },
            Expr::Unary(op, e) => Expr::Unary(op, Box::new(e.resolve(scope, fragment)?)),
            Expr::Binary(op, l, r) => Expr::Binary(
                op,
                Box::new(l.resolve(scope, fragment)?),
                Box::new(r.resolve(scope, fragment)?),
            ),
            Expr::Call(f, e) => Expr::Call(f, Box::new(e.resolve(scope, fragment)?)),
            other => other,
        })
    }

    /// Properties referenced by the expression
    pub fn properties(&self) -> BTreeSet<Property> {
        let mut out = BTreeSet::new();
        self.visit(&mut |e| {
            if let Expr::Property(p) = e {
                out.insert(*p);
            }
        });
        out
    }

    /// Whether the expression mentions `t`
    pub fn uses_time(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| found |= matches!(e, Expr::Time));
        found
    }

    fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::Unary(_, e) | Expr::Call(_, e) => e.visit(f),
            Expr::Binary(_, l, r) => {
                l.visit(f);
                r.visit(f);
            }
            _ => {}
        }
    }
}

/// Result of evaluating an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Array(Vec<f64>),
}

impl Value {
    /// Expand to `len` elements
    pub fn into_array(self, len: usize) -> Vec<f64> {
        match self {
            Value::Scalar(x) => vec![x; len],
            Value::Array(v) => v,
        }
    }
}

/// Truthiness: non-zero and not NaN
pub fn truthy(x: f64) -> bool {
    x != 0.0 && !x.is_nan()
}

fn flag(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Variable bindings for one evaluation
#[derive(Debug, Default)]
pub struct Env<'a> {
    pub properties: BTreeMap<Property, &'a [f64]>,
    /// Raw identifiers; `Id` compared with an integer literal reads these
    pub ids: Option<&'a [u64]>,
    pub time: Option<&'a [f64]>,
    pub clauses: &'a [Vec<f64>],
}

/// Evaluate an expression element-wise
pub fn eval(expr: &Expr, env: &Env<'_>) -> Result<Value> {
    Ok(match expr {
        Expr::Number(x) => Value::Scalar(*x),
        Expr::Integer(n) => Value::Scalar(*n as f64),
        Expr::Name(name) => {
            return Err(Error::selector("unresolved name", name.clone()));
        }
        Expr::Property(p) => Value::Array(
            env.properties
                .get(p)
                .ok_or_else(|| Error::UnknownProperty(p.name().to_string()))?
                .to_vec(),
        ),
        Expr::Time => Value::Array(
            env.time
                .ok_or_else(|| Error::selector("`t` is not bound", "t"))?
                .to_vec(),
        ),
        Expr::Clause(k) => Value::Array(
            env.clauses
                .get(*k)
                .ok_or_else(|| Error::selector(format!("no clause #{}", k), format!("#{}", k)))?
                .clone(),
        ),
        Expr::Unary(op, e) => {
            let v = eval(e, env)?;
            map(v, |x| match op {
                UnaryOp::Neg => -x,
                UnaryOp::Not => flag(!truthy(x)),
            })
        }
        Expr::Call(f, e) => map(eval(e, env)?, |x| f.apply(x)),
        Expr::Binary(op, l, r) => {
            if let Some(exact) = compare_ids(*op, l, r, env) {
                return Ok(exact);
            }
            let (l, r) = (eval(l, env)?, eval(r, env)?);
            zip(l, r, |a, b| apply(*op, a, b))?
        }
    })
}

/// `Id <op> literal` over the raw `u64` identifiers
fn compare_ids(op: BinaryOp, l: &Expr, r: &Expr, env: &Env<'_>) -> Option<Value> {
    let ids = env.ids?;
    let flags = match (l, r) {
        (Expr::Property(Property::Id), Expr::Integer(n)) => ids
            .iter()
            .map(|id| op.compare(*id, *n).map(flag))
            .collect::<Option<Vec<_>>>()?,
        (Expr::Integer(n), Expr::Property(Property::Id)) => ids
            .iter()
            .map(|id| op.compare(*n, *id).map(flag))
            .collect::<Option<Vec<_>>>()?,
        _ => return None,
    };
    Some(Value::Array(flags))
}

fn apply(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::Pow => a.powf(b),
        BinaryOp::Lt => flag(a < b),
        BinaryOp::Le => flag(a <= b),
        BinaryOp::Gt => flag(a > b),
        BinaryOp::Ge => flag(a >= b),
        BinaryOp::Eq => flag(a == b),
        BinaryOp::Ne => flag(a != b),
        BinaryOp::And => flag(truthy(a) && truthy(b)),
        BinaryOp::Or => flag(truthy(a) || truthy(b)),
    }
}

fn map(v: Value, f: impl Fn(f64) -> f64) -> Value {
    match v {
        Value::Scalar(x) => Value::Scalar(f(x)),
        Value::Array(xs) => Value::Array(xs.into_iter().map(f).collect()),
    }
}

fn zip(l: Value, r: Value, f: impl Fn(f64, f64) -> f64) -> Result<Value> {
    Ok(match (l, r) {
        (Value::Scalar(a), Value::Scalar(b)) => Value::Scalar(f(a, b)),
        (Value::Scalar(a), Value::Array(bs)) => Value::Array(bs.into_iter().map(|b| f(a, b)).collect()),
        (Value::Array(a), Value::Scalar(b)) => Value::Array(a.into_iter().map(|x| f(x, b)).collect()),
        (Value::Array(a), Value::Array(b)) => {
            if a.len() != b.len() {
                return Err(Error::Storage(format!(
                    "Operand lengths differ: {} and {}",
                    a.len(),
                    b.len()
                )));
            }
            Value::Array(a.into_iter().zip(b).map(|(x, y)| f(x, y)).collect())
        }
    })
}
