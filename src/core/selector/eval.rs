// Tree-walk evaluation of parsed selectors against one record.
use std::borrow::Cow;
use std::cmp::Ordering;

use bstr::ByteSlice;

use super::parse::{CmpOp, Expr, FieldRef, parse_datetime_literal};
use crate::core::error::{Error, ErrorKind};
use crate::core::record::Record;
use crate::core::value::Value;

pub(crate) fn eval<'a>(expr: &'a Expr, record: &'a Record) -> Result<Cow<'a, Value>, Error> {
    match expr {
        Expr::Literal(value) => Ok(Cow::Borrowed(value)),
        Expr::Field(field) => Ok(read_field(field, record)),
        Expr::Not(inner) => {
            let value = eval(inner, record)?;
            Ok(Cow::Owned(Value::Boolean(!truthy(&value))))
        }
        Expr::And(terms) => {
            for term in terms {
                let value = eval(term, record)?;
                if !truthy(&value) {
                    return Ok(Cow::Owned(Value::Boolean(false)));
                }
            }
            Ok(Cow::Owned(Value::Boolean(true)))
        }
        Expr::Or(terms) => {
            for term in terms {
                let value = eval(term, record)?;
                if truthy(&value) {
                    return Ok(Cow::Owned(Value::Boolean(true)));
                }
            }
            Ok(Cow::Owned(Value::Boolean(false)))
        }
        Expr::Compare { op, lhs, rhs } => {
            let lhs = eval(lhs, record)?;
            let rhs = eval(rhs, record)?;
            compare(*op, &lhs, &rhs).map(|result| Cow::Owned(Value::Boolean(result)))
        }
    }
}

fn read_field<'a>(field: &'a FieldRef, record: &'a Record) -> Cow<'a, Value> {
    match field {
        FieldRef::Named(name) => record
            .get(name)
            .map(Cow::Borrowed)
            .unwrap_or(Cow::Owned(Value::Null)),
        FieldRef::Source => Cow::Owned(record.source().map(Value::from).into()),
        FieldRef::Generated => Cow::Owned(record.generated().map(Value::Datetime).into()),
        FieldRef::Descriptor => Cow::Owned(Value::from(record.descriptor().name())),
    }
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Boolean(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Bytes(bytes) => !bytes.is_empty(),
        Value::Varint(n) => *n != 0,
        Value::Uint32(n) => *n != 0,
        Value::Float(n) => *n != 0.0,
        Value::Datetime(_) => true,
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool, Error> {
    match op {
        CmpOp::Eq => equals(lhs, rhs),
        CmpOp::Ne => equals(lhs, rhs).map(|eq| !eq),
        CmpOp::In => contains(rhs, lhs),
        CmpOp::NotIn => contains(rhs, lhs).map(|found| !found),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let Some(ordering) = order(lhs, rhs, op)? else {
                return Ok(false);
            };
            Ok(match op {
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Le => ordering != Ordering::Greater,
                CmpOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }
    }
}

fn equals(lhs: &Value, rhs: &Value) -> Result<bool, Error> {
    if lhs.is_null() || rhs.is_null() {
        return Ok(lhs.is_null() && rhs.is_null());
    }
    Ok(order(lhs, rhs, CmpOp::Eq)? == Some(Ordering::Equal))
}

/// Orders two values of compatible kinds; `None` means unordered (NaN).
fn order(lhs: &Value, rhs: &Value, op: CmpOp) -> Result<Option<Ordering>, Error> {
    let ordering = match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
        (Value::Bytes(a), Value::String(b)) => Some(a.as_slice().cmp(b.as_bytes())),
        (Value::String(a), Value::Bytes(b)) => Some(a.as_bytes().cmp(b.as_slice())),
        (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
        (Value::Datetime(a), Value::Datetime(b)) => Some(a.cmp(b)),
        (Value::Datetime(a), Value::String(b)) => Some(a.cmp(&datetime_literal(b, lhs, rhs, op)?)),
        (Value::String(a), Value::Datetime(b)) => Some(datetime_literal(a, lhs, rhs, op)?.cmp(b)),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Float(a), other) | (other, Value::Float(a)) if other.as_i64().is_some() => {
            let b = other.as_i64().unwrap_or_default() as f64;
            let ordering = a.partial_cmp(&b);
            if matches!(lhs, Value::Float(_)) {
                ordering
            } else {
                ordering.map(Ordering::reverse)
            }
        }
        (a, b) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => return Err(mismatch(lhs, rhs, op)),
        },
    };
    Ok(ordering)
}

fn datetime_literal(
    text: &str,
    lhs: &Value,
    rhs: &Value,
    op: CmpOp,
) -> Result<time::OffsetDateTime, Error> {
    parse_datetime_literal(text).ok_or_else(|| {
        mismatch(lhs, rhs, op).with_hint("Datetime fields compare against RFC 3339 strings.")
    })
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, Error> {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => Ok(h.contains(n.as_str())),
        (Value::Bytes(h), Value::Bytes(n)) => Ok(h.contains_str(n)),
        (Value::Bytes(h), Value::String(n)) => Ok(h.contains_str(n)),
        _ => Err(mismatch(needle, haystack, CmpOp::In)),
    }
}

fn mismatch(lhs: &Value, rhs: &Value, op: CmpOp) -> Error {
    Error::new(ErrorKind::TypeMismatch).with_message(format!(
        "cannot apply `{}` to {} and {}",
        op.symbol(),
        lhs.type_label(),
        rhs.type_label()
    ))
}
