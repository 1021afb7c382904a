//! Structural evaluation of the expression tree.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use super::parser::{CompareOp, Node, StringMethod};
use super::{Context, EvaluationError, Value};

pub(crate) fn eval_bool(node: &Node, ctx: &Context) -> Result<bool, EvaluationError> {
    match eval(node, ctx)? {
        Value::Bool(b) => Ok(b),
        other => Err(EvaluationError::NotBoolean(other.type_name())),
    }
}

fn eval(node: &Node, ctx: &Context) -> Result<Value, EvaluationError> {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Attribute(name) => ctx
            .get(name)
            .cloned()
            .ok_or_else(|| EvaluationError::UnknownAttribute(name.clone())),
        Node::Not(inner) => Ok(Value::Bool(!eval_bool(inner, ctx)?)),
        Node::And(lhs, rhs) => Ok(Value::Bool(eval_bool(lhs, ctx)? && eval_bool(rhs, ctx)?)),
        Node::Or(lhs, rhs) => Ok(Value::Bool(eval_bool(lhs, ctx)? || eval_bool(rhs, ctx)?)),
        Node::Compare(op, lhs, rhs) => {
            let left = eval(lhs, ctx)?;
            let right = eval(rhs, ctx)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
        Node::In(needle, items) => {
            let needle = eval(needle, ctx)?;
            for item in items {
                let item = eval(item, ctx)?;
                if compare(CompareOp::Eq, &needle, &item)? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        Node::Method(method, target, arg) => {
            let target = eval(target, ctx)?;
            let arg = eval(arg, ctx)?;
            let (Value::String(s), Value::String(a)) = (&target, &arg) else {
                return Err(EvaluationError::TypeMismatch {
                    op: method.name().to_string(),
                    left: target.type_name(),
                    right: arg.type_name(),
                });
            };
            Ok(Value::Bool(match method {
                StringMethod::StartsWith => s.starts_with(a.as_str()),
                StringMethod::EndsWith => s.ends_with(a.as_str()),
                StringMethod::Contains => s.contains(a.as_str()),
            }))
        }
        Node::Matches(target, regex) => match eval(target, ctx)? {
            Value::String(s) => Ok(Value::Bool(regex.is_match(&s))),
            other => Err(EvaluationError::TypeMismatch {
                op: "matches".to_string(),
                left: other.type_name(),
                right: "string",
            }),
        },
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Result<bool, EvaluationError> {
    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Bool(a), Value::Bool(b)) if matches!(op, CompareOp::Eq | CompareOp::Ne) => a.cmp(b),
        _ => {
            return Err(EvaluationError::TypeMismatch {
                op: op.symbol().to_string(),
                left: left.type_name(),
                right: right.type_name(),
            })
        }
    };
    Ok(match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
    })
}

pub(crate) fn collect_attributes(node: &Node, out: &mut BTreeSet<String>) {
    match node {
        Node::Literal(_) => {}
        Node::Attribute(name) => {
            out.insert(name.clone());
        }
        Node::Not(inner) | Node::Matches(inner, _) => collect_attributes(inner, out),
        Node::And(a, b) | Node::Or(a, b) | Node::Compare(_, a, b) | Node::Method(_, a, b) => {
            collect_attributes(a, out);
            collect_attributes(b, out);
        }
        Node::In(needle, items) => {
            collect_attributes(needle, out);
            for item in items {
                collect_attributes(item, out);
            }
        }
    }
}
