use crate::value::Value;

use super::op::Op;
use super::{VmFault, VmResult};

// ── Operator semantics ──────────────────────────────────────────────
//
// `lhs` is the deeper operand (emitted first), `rhs` the top of stack.

fn mismatch(op: &Op, expected: &'static str, lhs: &Value, rhs: &Value) -> VmFault {
    VmFault::TypeMismatch {
        op: op.name(),
        expected,
        found: format!("{} and {}", lhs.type_name(), rhs.type_name()),
    }
}

/// ADD, SUBTRACT, MULTIPLY, DIVIDE, MODULO
pub(crate) fn arithmetic(op: &Op, lhs: Value, rhs: Value) -> VmResult<Value> {
    match (&lhs, &rhs) {
        (Value::Integer(a), Value::Integer(b)) => integer_arithmetic(op, *a, *b).map(Value::Integer),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(match op {
            Op::Add => a + b,
            Op::Subtract => a - b,
            Op::Multiply => a * b,
            Op::Divide => a / b,
            Op::Modulo => a % b,
            other => unreachable!("{} is not arithmetic", other.name()),
        })),
        _ => Err(mismatch(op, "two integers or two floats", &lhs, &rhs)),
    }
}

fn integer_arithmetic(op: &Op, a: i64, b: i64) -> VmResult<i64> {
    if matches!(op, Op::Divide | Op::Modulo) && b == 0 {
        return Err(VmFault::DivisionByZero);
    }
    let result = match op {
        Op::Add => a.checked_add(b),
        Op::Subtract => a.checked_sub(b),
        Op::Multiply => a.checked_mul(b),
        Op::Divide => a.checked_div(b),
        Op::Modulo => a.checked_rem(b),
        other => unreachable!("{} is not arithmetic", other.name()),
    };
    result.ok_or(VmFault::IntegerOverflow { op: op.name() })
}

pub(crate) fn negate(value: Value) -> VmResult<Value> {
    match value {
        Value::Integer(n) => n.checked_neg().map(Value::Integer).ok_or(VmFault::IntegerOverflow { op: "NEGATE" }),
        Value::Float(n) => Ok(Value::Float(-n)),
        other => Err(VmFault::TypeMismatch {
            op: "NEGATE",
            expected: "integer or float",
            found: other.type_name().to_string(),
        }),
    }
}

/// BITWISE_AND/OR/XOR, SHIFT_LEFT/RIGHT
pub(crate) fn bitwise(op: &Op, lhs: Value, rhs: Value) -> VmResult<Value> {
    let (Value::Integer(a), Value::Integer(b)) = (&lhs, &rhs) else {
        return Err(mismatch(op, "two integers", &lhs, &rhs));
    };
    let (a, b) = (*a, *b);
    let result = match op {
        Op::BitwiseAnd => a & b,
        Op::BitwiseOr => a | b,
        Op::BitwiseXor => a ^ b,
        Op::ShiftLeft | Op::ShiftRight => {
            let shift = u32::try_from(b)
                .ok()
                .filter(|s| *s < i64::BITS)
                .ok_or(VmFault::IntegerOverflow { op: op.name() })?;
            if matches!(op, Op::ShiftLeft) { a << shift } else { a >> shift }
        }
        other => unreachable!("{} is not bitwise", other.name()),
    };
    Ok(Value::Integer(result))
}

/// LOGICAL_AND, LOGICAL_OR
pub(crate) fn logical(op: &Op, lhs: Value, rhs: Value) -> VmResult<Value> {
    match (&lhs, &rhs) {
        (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(match op {
            Op::LogicalAnd => *a && *b,
            Op::LogicalOr => *a || *b,
            other => unreachable!("{} is not logical", other.name()),
        })),
        _ => Err(mismatch(op, "two bools", &lhs, &rhs)),
    }
}

/// EQUAL … GREATER_THAN_OR_EQUAL. Floats compare per IEEE-754, so any
/// comparison against NaN is false except NOT_EQUAL.
pub(crate) fn compare(op: &Op, lhs: Value, rhs: Value) -> VmResult<Value> {
    let result = match (&lhs, &rhs) {
        (Value::Integer(a), Value::Integer(b)) => apply_comparison(op, a, b),
        (Value::Float(a), Value::Float(b)) => apply_comparison(op, a, b),
        (Value::String(a), Value::String(b)) => apply_comparison(op, a, b),
        _ => return Err(mismatch(op, "two integers, two floats or two strings", &lhs, &rhs)),
    };
    Ok(Value::Bool(result))
}

fn apply_comparison<T: PartialOrd + ?Sized>(op: &Op, a: &T, b: &T) -> bool {
    match op {
        Op::Equal => a == b,
        Op::NotEqual => a != b,
        Op::LessThan => a < b,
        Op::LessThanOrEqual => a <= b,
        Op::GreaterThan => a > b,
        Op::GreaterThanOrEqual => a >= b,
        other => unreachable!("{} is not a comparison", other.name()),
    }
}
