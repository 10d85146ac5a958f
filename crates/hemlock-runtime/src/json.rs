//! JSON serialization
//!
//! Covers null, bool, the numeric variants, strings, arrays and objects.
//! Objects keep field order in both directions. A container that contains
//! itself fails with CycleDetected; the same container reached along two
//! different paths is written twice.

use serde_json::{Map, Number};
use smallvec::SmallVec;

use crate::error::{RtError, RtResult};
use crate::exception::abi_value;
use crate::object;
use crate::value::Value;

type Path = SmallVec<[usize; 16]>;

fn to_json(value: Value, path: &mut Path) -> RtResult<serde_json::Value> {
    Ok(match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::I8(_) | Value::I16(_) | Value::I32(_) | Value::I64(_) => {
            serde_json::Value::Number(Number::from(value.as_i64().unwrap_or_default()))
        }
        Value::U8(_) | Value::U16(_) | Value::U32(_) => {
            serde_json::Value::Number(Number::from(value.as_i64().unwrap_or_default()))
        }
        Value::U64(u) => serde_json::Value::Number(Number::from(u)),
        // Non-finite floats have no JSON form.
        Value::F32(f) => Number::from_f64(f as f64).map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::F64(f) => Number::from_f64(f).map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::String(_) => serde_json::Value::String(value.as_str().unwrap_or_default().to_string()),
        Value::Array(_) | Value::Object(_) => {
            let addr = value.cell_addr().unwrap_or_default();
            if path.contains(&addr) {
                return Err(RtError::cycle_detected());
            }
            path.push(addr);
            let out = if let Some(arr) = value.as_array_cell() {
                let items = arr
                    .to_vec_raw()
                    .into_iter()
                    .map(|elem| to_json(elem, path))
                    .collect::<RtResult<Vec<_>>>()?;
                serde_json::Value::Array(items)
            } else {
                let mut map = Map::new();
                for (key, field) in value.as_object_cell().map(|c| c.entries_raw()).unwrap_or_default() {
                    map.insert(key, to_json(field, path)?);
                }
                serde_json::Value::Object(map)
            };
            path.pop();
            out
        }
        other => {
            return Err(RtError::type_mismatch(format!(
                "Cannot serialize value of type {}",
                other.type_name()
            )));
        }
    })
}

fn from_json(json: serde_json::Value) -> RtResult<Value> {
    Ok(match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i32::try_from(i).map_or(Value::I64(i), Value::I32)
            } else if let Some(u) = n.as_u64() {
                Value::U64(u)
            } else {
                Value::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::string(s),
        serde_json::Value::Array(items) => {
            let mut elems = Vec::with_capacity(items.len());
            for item in items {
                match from_json(item) {
                    Ok(v) => elems.push(v),
                    Err(err) => {
                        elems.into_iter().for_each(Value::release);
                        return Err(err);
                    }
                }
            }
            Value::array_from(elems)
        }
        serde_json::Value::Object(map) => {
            let obj = Value::object();
            for (key, field) in map {
                let converted = from_json(field).and_then(|v| {
                    let set = object::set_field(obj, &key, v);
                    v.release();
                    set
                });
                if let Err(err) = converted {
                    obj.release();
                    return Err(err);
                }
            }
            obj
        }
    })
}

/// Compact JSON text for `value`.
pub fn serialize(value: Value) -> RtResult<String> {
    let json = to_json(value, &mut Path::new())?;
    Ok(serde_json::to_string(&json)?)
}

/// Parse JSON text into a fresh value. Integers that fit i32 become i32,
/// other integers i64 (u64 above `i64::MAX`), everything else f64.
pub fn deserialize(text: &str) -> RtResult<Value> {
    let json: serde_json::Value = serde_json::from_str(text)?;
    from_json(json)
}

// =============================================================================
// C ABI
// =============================================================================

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_serialize(value: Value) -> Value {
    abi_value(serialize(value).map(Value::string))
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_deserialize(text: Value) -> Value {
    let result = text
        .as_str()
        .ok_or_else(|| RtError::type_mismatch("deserialize() requires string argument"))
        .and_then(deserialize);
    abi_value(result)
}
