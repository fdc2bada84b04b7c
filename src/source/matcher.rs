//! Built-in selector matcher.
//!
//! Supports a Mongo-style subset: literal equality on dotted paths (an array
//! field matches when it contains the literal), the field operators
//! `$eq $ne $gt $gte $lt $lte $in $nin $exists $regex` and the logical
//! operators `$and $or $nor`. A scalar selector is shorthand for `{_id: v}`.

use std::cmp::Ordering;

use regex::{Regex, RegexBuilder};

use crate::value::{get_path, Document, Value, ID_FIELD};

use super::traits::{DocumentMatcher, MatcherFactory, SourceError};

#[derive(Debug, Clone)]
enum Op {
    Eq(Value),
    Ne(Value),
    Cmp(Ordering, bool, Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
}

#[derive(Debug, Clone)]
enum Clause {
    Field { path: String, ops: Vec<Op> },
    And(Vec<Vec<Clause>>),
    Or(Vec<Vec<Clause>>),
    Nor(Vec<Vec<Clause>>),
}

/// A compiled selector.
#[derive(Debug, Clone)]
pub struct SelectorMatcher {
    clauses: Vec<Clause>,
}

impl SelectorMatcher {
    /// Compile a selector.
    pub fn compile(selector: &Value) -> Result<Self, SourceError> {
        Ok(Self {
            clauses: compile_selector(selector)?,
        })
    }
}

impl DocumentMatcher for SelectorMatcher {
    fn matches(&self, doc: &Document) -> bool {
        all_match(&self.clauses, doc)
    }
}

/// Factory producing [`SelectorMatcher`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectorMatcherFactory;

impl MatcherFactory for SelectorMatcherFactory {
    fn build(&self, selector: &Value) -> Result<Box<dyn DocumentMatcher>, SourceError> {
        Ok(Box::new(SelectorMatcher::compile(selector)?))
    }
}

fn compile_selector(selector: &Value) -> Result<Vec<Clause>, SourceError> {
    let map = match selector {
        Value::Null => return Ok(Vec::new()),
        Value::Object(map) => map,
        Value::String(_) | Value::Number(_) => {
            return Ok(vec![Clause::Field {
                path: ID_FIELD.to_string(),
                ops: vec![Op::Eq(selector.clone())],
            }])
        }
        other => return Err(SourceError::InvalidSelector(format!("unsupported selector {other}"))),
    };

    let mut clauses = Vec::with_capacity(map.len());
    for (key, value) in map {
        let clause = match key.as_str() {
            "$and" => Clause::And(compile_branches(key, value)?),
            "$or" => Clause::Or(compile_branches(key, value)?),
            "$nor" => Clause::Nor(compile_branches(key, value)?),
            op if op.starts_with('$') => {
                return Err(SourceError::InvalidSelector(format!("unknown top-level operator {op}")))
            }
            path => Clause::Field {
                path: path.to_string(),
                ops: compile_condition(value)?,
            },
        };
        clauses.push(clause);
    }
    Ok(clauses)
}

fn compile_branches(op: &str, value: &Value) -> Result<Vec<Vec<Clause>>, SourceError> {
    let Value::Array(items) = value else {
        return Err(SourceError::InvalidSelector(format!("{op} expects an array")));
    };
    items.iter().map(compile_selector).collect()
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn compile_condition(value: &Value) -> Result<Vec<Op>, SourceError> {
    if !is_operator_object(value) {
        return Ok(vec![Op::Eq(value.clone())]);
    }

    let Value::Object(map) = value else {
        return Ok(Vec::new());
    };

    let mut ops = Vec::with_capacity(map.len());
    for (op, arg) in map {
        let compiled = match op.as_str() {
            "$eq" => Op::Eq(arg.clone()),
            "$ne" => Op::Ne(arg.clone()),
            "$gt" => Op::Cmp(Ordering::Greater, false, arg.clone()),
            "$gte" => Op::Cmp(Ordering::Greater, true, arg.clone()),
            "$lt" => Op::Cmp(Ordering::Less, false, arg.clone()),
            "$lte" => Op::Cmp(Ordering::Less, true, arg.clone()),
            "$in" => Op::In(expect_array(op, arg)?),
            "$nin" => Op::Nin(expect_array(op, arg)?),
            "$exists" => Op::Exists(crate::value::truthy(arg)),
            "$regex" => Op::Regex(compile_regex(arg, map.get("$options"))?),
            "$options" => continue,
            other => return Err(SourceError::InvalidSelector(format!("unknown operator {other}"))),
        };
        ops.push(compiled);
    }
    Ok(ops)
}

fn expect_array(op: &str, arg: &Value) -> Result<Vec<Value>, SourceError> {
    match arg {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(SourceError::InvalidSelector(format!("{op} expects an array"))),
    }
}

fn compile_regex(pattern: &Value, options: Option<&Value>) -> Result<Regex, SourceError> {
    let Value::String(pattern) = pattern else {
        return Err(SourceError::InvalidSelector("$regex expects a string".to_string()));
    };
    let flags = options.and_then(Value::as_str).unwrap_or("");

    RegexBuilder::new(pattern)
        .case_insensitive(flags.contains('i'))
        .multi_line(flags.contains('m'))
        .dot_matches_new_line(flags.contains('s'))
        .ignore_whitespace(flags.contains('x'))
        .build()
        .map_err(|e| SourceError::InvalidSelector(format!("invalid regex '{pattern}': {e}")))
}

fn all_match(clauses: &[Clause], doc: &Document) -> bool {
    clauses.iter().all(|c| clause_matches(c, doc))
}

fn clause_matches(clause: &Clause, doc: &Document) -> bool {
    match clause {
        Clause::Field { path, ops } => {
            let field = get_path(doc, path);
            ops.iter().all(|op| op_matches(op, field))
        }
        Clause::And(branches) => branches.iter().all(|b| all_match(b, doc)),
        Clause::Or(branches) => branches.iter().any(|b| all_match(b, doc)),
        Clause::Nor(branches) => !branches.iter().any(|b| all_match(b, doc)),
    }
}

fn equals(field: Option<&Value>, literal: &Value) -> bool {
    match field {
        None => literal.is_null(),
        Some(v) if v == literal => true,
        Some(Value::Array(items)) => items.contains(literal),
        Some(_) => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn any_element(field: Option<&Value>, pred: impl Fn(&Value) -> bool) -> bool {
    match field {
        None => false,
        Some(Value::Array(items)) => items.iter().any(&pred),
        Some(v) => pred(v),
    }
}

fn op_matches(op: &Op, field: Option<&Value>) -> bool {
    match op {
        Op::Eq(lit) => equals(field, lit),
        Op::Ne(lit) => !equals(field, lit),
        Op::Cmp(want, inclusive, lit) => any_element(field, |v| match compare(v, lit) {
            Some(Ordering::Equal) => *inclusive,
            Some(ord) => ord == *want,
            None => false,
        }),
        Op::In(items) => items.iter().any(|lit| equals(field, lit)),
        Op::Nin(items) => !items.iter().any(|lit| equals(field, lit)),
        Op::Exists(expected) => field.is_some() == *expected,
        Op::Regex(re) => any_element(field, |v| v.as_str().is_some_and(|s| re.is_match(s))),
    }
}
