//! Small helpers shared by every backend's effect-application code.

use yin_core::{Scalar, Value, VmError, VmErrorKind};

/// The global store is keyed by string (§3: "mapping from key to value").
/// `vm/store-put`'s key is a full runtime value at the primitive-effect
/// boundary (§4.11's `StorePut { key: Value, .. }`); only a
/// string/symbol/keyword scalar is a sensible store key.
pub(crate) fn value_key(v: &Value) -> Result<String, VmError> {
    match v {
        Value::Scalar(Scalar::String(s) | Scalar::Symbol(s) | Scalar::Keyword(s)) => Ok(s.clone()),
        other => Err(VmError::new(
            VmErrorKind::MalformedProgram,
            format!("store key must be a string/symbol/keyword, got {}", other.type_tag()),
        )),
    }
}
