//! The expression language of the query IR.
//!
//! Expressions are tagged variants — column references, literal values,
//! scalar functions, and aggregates — evaluated against *namespaced rows*:
//! JSON objects mapping each query alias to its record, e.g.
//! `{"u": {"id": 1, "name": "Alice"}}`. A reference path names the alias
//! first, then the field path inside the record.
//!
//! Comparison functions use the total value order of
//! [`value_compare`](crate::value::value_compare); only the boolean `true`
//! is truthy. `like`/`ilike` translate SQL patterns (`%`, `_`) into
//! anchored regular expressions.

use crate::value::{value_compare, value_eq};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Scalar functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FuncName {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    And,
    Or,
    Not,
    In,
    Like,
    Ilike,
    Add,
    Subtract,
    Multiply,
    Divide,
    Concat,
    Upper,
    Lower,
    Length,
    Coalesce,
}

/// Aggregate functions, legal only under `groupBy`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggName {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

/// An expression tree node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Expr {
    /// Column reference: `[alias, field, subfield, ...]`.
    Ref(Vec<String>),
    /// Literal value.
    Val(Value),
    /// Scalar function application.
    Func { name: FuncName, args: Vec<Expr> },
    /// Aggregate application.
    Agg { name: AggName, args: Vec<Expr> },
}

// |--------------|
// | Constructors |
// |--------------|

/// Column reference: `col(["u", "name"])`.
pub fn col<I, S>(path: I) -> Expr
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Expr::Ref(path.into_iter().map(Into::into).collect())
}

/// Literal value.
pub fn val(v: impl Into<Value>) -> Expr {
    Expr::Val(v.into())
}

fn func(name: FuncName, args: Vec<Expr>) -> Expr {
    Expr::Func { name, args }
}

pub fn eq(a: Expr, b: Expr) -> Expr {
    func(FuncName::Eq, vec![a, b])
}

pub fn gt(a: Expr, b: Expr) -> Expr {
    func(FuncName::Gt, vec![a, b])
}

pub fn gte(a: Expr, b: Expr) -> Expr {
    func(FuncName::Gte, vec![a, b])
}

pub fn lt(a: Expr, b: Expr) -> Expr {
    func(FuncName::Lt, vec![a, b])
}

pub fn lte(a: Expr, b: Expr) -> Expr {
    func(FuncName::Lte, vec![a, b])
}

pub fn and(clauses: impl IntoIterator<Item = Expr>) -> Expr {
    func(FuncName::And, clauses.into_iter().collect())
}

pub fn or(clauses: impl IntoIterator<Item = Expr>) -> Expr {
    func(FuncName::Or, clauses.into_iter().collect())
}

pub fn not(e: Expr) -> Expr {
    func(FuncName::Not, vec![e])
}

/// Membership test against a literal or referenced array.
pub fn in_list(needle: Expr, haystack: Expr) -> Expr {
    func(FuncName::In, vec![needle, haystack])
}

/// SQL `LIKE` with `%` and `_` wildcards.
pub fn like(target: Expr, pattern: Expr) -> Expr {
    func(FuncName::Like, vec![target, pattern])
}

/// Case-insensitive [`like`].
pub fn ilike(target: Expr, pattern: Expr) -> Expr {
    func(FuncName::Ilike, vec![target, pattern])
}

pub fn add(a: Expr, b: Expr) -> Expr {
    func(FuncName::Add, vec![a, b])
}

pub fn subtract(a: Expr, b: Expr) -> Expr {
    func(FuncName::Subtract, vec![a, b])
}

pub fn multiply(a: Expr, b: Expr) -> Expr {
    func(FuncName::Multiply, vec![a, b])
}

pub fn divide(a: Expr, b: Expr) -> Expr {
    func(FuncName::Divide, vec![a, b])
}

pub fn concat(parts: impl IntoIterator<Item = Expr>) -> Expr {
    func(FuncName::Concat, parts.into_iter().collect())
}

pub fn upper(e: Expr) -> Expr {
    func(FuncName::Upper, vec![e])
}

pub fn lower(e: Expr) -> Expr {
    func(FuncName::Lower, vec![e])
}

pub fn length(e: Expr) -> Expr {
    func(FuncName::Length, vec![e])
}

pub fn coalesce(parts: impl IntoIterator<Item = Expr>) -> Expr {
    func(FuncName::Coalesce, parts.into_iter().collect())
}

pub fn count(e: Expr) -> Expr {
    Expr::Agg { name: AggName::Count, args: vec![e] }
}

pub fn sum(e: Expr) -> Expr {
    Expr::Agg { name: AggName::Sum, args: vec![e] }
}

pub fn avg(e: Expr) -> Expr {
    Expr::Agg { name: AggName::Avg, args: vec![e] }
}

pub fn min(e: Expr) -> Expr {
    Expr::Agg { name: AggName::Min, args: vec![e] }
}

pub fn max(e: Expr) -> Expr {
    Expr::Agg { name: AggName::Max, args: vec![e] }
}

// |------------|
// | Inspection |
// |------------|

impl Expr {
    /// Collect the aliases (leading reference segments) this expression
    /// touches.
    pub fn collect_aliases(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Ref(path) => {
                if let Some(alias) = path.first() {
                    out.insert(alias.clone());
                }
            }
            Expr::Val(_) => {}
            Expr::Func { args, .. } | Expr::Agg { args, .. } => {
                for arg in args {
                    arg.collect_aliases(out);
                }
            }
        }
    }

    /// The aliases this expression touches.
    pub fn aliases(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_aliases(&mut out);
        out
    }

    /// True if any node is an aggregate.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expr::Agg { .. } => true,
            Expr::Ref(_) | Expr::Val(_) => false,
            Expr::Func { args, .. } => args.iter().any(Expr::contains_aggregate),
        }
    }

    /// Rewrite references so the leading alias segment is dropped. Used
    /// when a single-alias clause is pushed down to a source, which
    /// evaluates against bare records.
    pub fn strip_alias(&self) -> Expr {
        match self {
            Expr::Ref(path) => Expr::Ref(path.iter().skip(1).cloned().collect()),
            Expr::Val(v) => Expr::Val(v.clone()),
            Expr::Func { name, args } => Expr::Func {
                name: *name,
                args: args.iter().map(Expr::strip_alias).collect(),
            },
            Expr::Agg { name, args } => Expr::Agg {
                name: *name,
                args: args.iter().map(Expr::strip_alias).collect(),
            },
        }
    }

    /// The direct single-column reference `[alias, field]`, if this is one.
    pub fn as_direct_ref(&self) -> Option<(&str, &[String])> {
        match self {
            Expr::Ref(path) if path.len() >= 2 => Some((&path[0], &path[1..])),
            _ => None,
        }
    }
}

// |------------|
// | Evaluation |
// |------------|

fn walk_path<'a>(mut v: &'a Value, path: &[String]) -> &'a Value {
    for segment in path {
        match v.get(segment) {
            Some(next) => v = next,
            None => return &Value::Null,
        }
    }
    v
}

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64()
}

// Render a float back as the narrowest JSON number.
fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < (i64::MAX as f64) {
        Value::from(f as i64)
    } else {
        serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn like_regex(pattern: &str, case_insensitive: bool) -> Option<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    if case_insensitive {
        re.push_str("(?i)");
    }
    re.push('^');
    for c in pattern.chars() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

impl Expr {
    /// Evaluate against a namespaced row. Aggregates evaluate to null here;
    /// the compiler rejects aggregates outside `groupBy`, and grouped
    /// pipelines evaluate them via [`Expr::eval_with_group`].
    pub fn eval(&self, row: &Value) -> Value {
        self.eval_inner(row, None)
    }

    /// Evaluate with aggregate support: aggregates fold over the group's
    /// `(row, multiplicity)` entries, everything else evaluates against the
    /// representative row.
    pub fn eval_with_group(&self, representative: &Value, group: &[(Value, isize)]) -> Value {
        self.eval_inner(representative, Some(group))
    }

    fn eval_inner(&self, row: &Value, group: Option<&[(Value, isize)]>) -> Value {
        match self {
            Expr::Ref(path) => walk_path(row, path).clone(),
            Expr::Val(v) => v.clone(),
            Expr::Agg { name, args } => match group {
                Some(group) => eval_aggregate(*name, args, group),
                None => Value::Null,
            },
            Expr::Func { name, args } => {
                let arg = |i: usize| -> Value {
                    args.get(i).map(|a| a.eval_inner(row, group)).unwrap_or(Value::Null)
                };
                match name {
                    FuncName::Eq => Value::Bool(value_eq(&arg(0), &arg(1))),
                    FuncName::Gt => Value::Bool(value_compare(&arg(0), &arg(1)) == Ordering::Greater),
                    FuncName::Gte => Value::Bool(value_compare(&arg(0), &arg(1)) != Ordering::Less),
                    FuncName::Lt => Value::Bool(value_compare(&arg(0), &arg(1)) == Ordering::Less),
                    FuncName::Lte => Value::Bool(value_compare(&arg(0), &arg(1)) != Ordering::Greater),
                    FuncName::And => Value::Bool(
                        args.iter().all(|a| a.eval_inner(row, group) == Value::Bool(true)),
                    ),
                    FuncName::Or => Value::Bool(
                        args.iter().any(|a| a.eval_inner(row, group) == Value::Bool(true)),
                    ),
                    FuncName::Not => Value::Bool(arg(0) != Value::Bool(true)),
                    FuncName::In => {
                        let needle = arg(0);
                        match arg(1) {
                            Value::Array(items) => {
                                Value::Bool(items.iter().any(|i| value_eq(i, &needle)))
                            }
                            _ => Value::Bool(false),
                        }
                    }
                    FuncName::Like | FuncName::Ilike => {
                        let target = arg(0);
                        let pattern = arg(1);
                        match (target.as_str(), pattern.as_str()) {
                            (Some(t), Some(p)) => {
                                let matched = like_regex(p, *name == FuncName::Ilike)
                                    .map(|re| re.is_match(t))
                                    .unwrap_or(false);
                                Value::Bool(matched)
                            }
                            _ => Value::Bool(false),
                        }
                    }
                    FuncName::Add | FuncName::Subtract | FuncName::Multiply | FuncName::Divide => {
                        match (as_f64(&arg(0)), as_f64(&arg(1))) {
                            (Some(a), Some(b)) => match name {
                                FuncName::Add => number_value(a + b),
                                FuncName::Subtract => number_value(a - b),
                                FuncName::Multiply => number_value(a * b),
                                _ => {
                                    if b == 0.0 {
                                        Value::Null
                                    } else {
                                        number_value(a / b)
                                    }
                                }
                            },
                            _ => Value::Null,
                        }
                    }
                    FuncName::Concat => {
                        let mut s = String::new();
                        for a in args {
                            match a.eval_inner(row, group) {
                                Value::Null => {}
                                Value::String(part) => s.push_str(&part),
                                other => s.push_str(&other.to_string()),
                            }
                        }
                        Value::String(s)
                    }
                    FuncName::Upper => match arg(0) {
                        Value::String(s) => Value::String(s.to_uppercase()),
                        _ => Value::Null,
                    },
                    FuncName::Lower => match arg(0) {
                        Value::String(s) => Value::String(s.to_lowercase()),
                        _ => Value::Null,
                    },
                    FuncName::Length => match arg(0) {
                        Value::String(s) => Value::from(s.chars().count() as i64),
                        Value::Array(items) => Value::from(items.len() as i64),
                        _ => Value::Null,
                    },
                    FuncName::Coalesce => {
                        for a in args {
                            let v = a.eval_inner(row, group);
                            if v != Value::Null {
                                return v;
                            }
                        }
                        Value::Null
                    }
                }
            }
        }
    }

    /// True when evaluation yields the boolean `true`.
    pub fn eval_truthy(&self, row: &Value) -> bool {
        self.eval(row) == Value::Bool(true)
    }
}

fn eval_aggregate(name: AggName, args: &[Expr], group: &[(Value, isize)]) -> Value {
    let arg = args.first();
    match name {
        AggName::Count => {
            let total: isize = group.iter().map(|(_, m)| *m).sum();
            Value::from(total.max(0) as i64)
        }
        AggName::Sum | AggName::Avg => {
            let mut total = 0.0;
            let mut count = 0isize;
            for (row, m) in group {
                count += *m;
                if let Some(a) = arg {
                    if let Some(n) = as_f64(&a.eval(row)) {
                        total += n * (*m as f64);
                    }
                }
            }
            match name {
                AggName::Sum => number_value(total),
                _ => {
                    if count <= 0 {
                        Value::Null
                    } else {
                        number_value(total / count as f64)
                    }
                }
            }
        }
        AggName::Min | AggName::Max => {
            let mut best: Option<Value> = None;
            for (row, m) in group {
                if *m <= 0 {
                    continue;
                }
                let v = arg.map(|a| a.eval(row)).unwrap_or(Value::Null);
                if v == Value::Null {
                    continue;
                }
                best = Some(match best {
                    None => v,
                    Some(b) => {
                        let keep_new = match name {
                            AggName::Min => value_compare(&v, &b) == Ordering::Less,
                            _ => value_compare(&v, &b) == Ordering::Greater,
                        };
                        if keep_new { v } else { b }
                    }
                });
            }
            best.unwrap_or(Value::Null)
        }
    }
}
