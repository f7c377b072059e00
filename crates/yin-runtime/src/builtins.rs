//! Built-in primitives (§2, "Primitives & value tags"): arithmetic,
//! comparison, and boolean ops. These are plain functions — primitives
//! run to completion and are pure except where they explicitly return an
//! [`Effect`] for the VM to apply (none of the arithmetic/comparison
//! primitives do).

use yin_core::{Effect, PrimitiveOutcome, Scalar, Value, VmError, VmErrorKind};

fn type_error(op: &str, args: &[Value]) -> VmError {
    let types: Vec<&str> = args.iter().map(|v| v.type_tag()).collect();
    VmError::new(VmErrorKind::MalformedProgram, format!("{op}: unsupported operand types {types:?}"))
}

/// Numeric binary op dispatch: integer arithmetic stays integer; any
/// float operand promotes the result to float.
fn numeric_pair(args: &[Value]) -> Option<(f64, f64, bool)> {
    if args.len() != 2 {
        return None;
    }
    let as_num = |v: &Value| match v {
        Value::Scalar(Scalar::Int(n)) => Some((*n as f64, false)),
        Value::Scalar(Scalar::Float(n)) => Some((*n, true)),
        _ => None,
    };
    let (a, a_float) = as_num(&args[0])?;
    let (b, b_float) = as_num(&args[1])?;
    Some((a, b, a_float || b_float))
}

macro_rules! arith_primitive {
    ($name:ident, $op_name:literal, $op:tt) => {
        pub fn $name(args: &[Value]) -> Result<PrimitiveOutcome, VmError> {
            let (a, b, is_float) = numeric_pair(args).ok_or_else(|| type_error($op_name, args))?;
            let result = a $op b;
            Ok(if is_float {
                Value::float(result)
            } else {
                Value::int(result as i64)
            }
            .into())
        }
    };
}

arith_primitive!(add, "+", +);
arith_primitive!(sub, "-", -);
arith_primitive!(mul, "*", *);

pub fn div(args: &[Value]) -> Result<PrimitiveOutcome, VmError> {
    let (a, b, _) = numeric_pair(args).ok_or_else(|| type_error("/", args))?;
    if b == 0.0 {
        return Err(VmError::new(VmErrorKind::MalformedProgram, "/: division by zero"));
    }
    Ok(Value::float(a / b).into())
}

macro_rules! compare_primitive {
    ($name:ident, $op_name:literal, $op:tt) => {
        pub fn $name(args: &[Value]) -> Result<PrimitiveOutcome, VmError> {
            let (a, b, _) = numeric_pair(args).ok_or_else(|| type_error($op_name, args))?;
            Ok(Value::bool(a $op b).into())
        }
    };
}

compare_primitive!(lt, "<", <);
compare_primitive!(gt, ">", >);
compare_primitive!(lte, "<=", <=);
compare_primitive!(gte, ">=", >=);

pub fn eq(args: &[Value]) -> Result<PrimitiveOutcome, VmError> {
    if args.len() != 2 {
        return Err(type_error("=", args));
    }
    Ok(Value::bool(args[0] == args[1]).into())
}

pub fn neq(args: &[Value]) -> Result<PrimitiveOutcome, VmError> {
    if args.len() != 2 {
        return Err(type_error("!=", args));
    }
    Ok(Value::bool(args[0] != args[1]).into())
}

pub fn and(args: &[Value]) -> Result<PrimitiveOutcome, VmError> {
    Ok(Value::bool(args.iter().all(Value::is_truthy)).into())
}

pub fn or(args: &[Value]) -> Result<PrimitiveOutcome, VmError> {
    Ok(Value::bool(args.iter().any(Value::is_truthy)).into())
}

pub fn not(args: &[Value]) -> Result<PrimitiveOutcome, VmError> {
    let v = args.first().ok_or_else(|| type_error("not", args))?;
    Ok(Value::bool(!v.is_truthy()).into())
}

pub fn str_concat(args: &[Value]) -> Result<PrimitiveOutcome, VmError> {
    let mut out = String::new();
    for a in args {
        match a {
            Value::Scalar(Scalar::String(s)) => out.push_str(s),
            other => out.push_str(&format!("{other:?}")),
        }
    }
    Ok(Value::string(out).into())
}

/// `vm/store-put` is exposed as a primitive too (not just an AST node),
/// so module-registered code can trigger the same effect (§4.11).
pub fn store_put(args: &[Value]) -> Result<PrimitiveOutcome, VmError> {
    if args.len() != 2 {
        return Err(type_error("vm/store-put!", args));
    }
    Ok(Effect::StorePut { key: args[0].clone(), val: args[1].clone() }.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_integers_stays_integer() {
        let out = add(&[Value::int(10), Value::int(20)]).unwrap();
        assert_eq!(out, PrimitiveOutcome::Value(Value::int(30)));
    }

    #[test]
    fn add_promotes_to_float() {
        let out = add(&[Value::int(1), Value::float(0.5)]).unwrap();
        assert_eq!(out, PrimitiveOutcome::Value(Value::float(1.5)));
    }

    #[test]
    fn division_by_zero_is_fatal() {
        assert!(div(&[Value::int(1), Value::int(0)]).is_err());
    }

    #[test]
    fn equality_is_by_value() {
        let out = eq(&[Value::int(1), Value::int(1)]).unwrap();
        assert_eq!(out, PrimitiveOutcome::Value(Value::bool(true)));
    }
}
