//! Method dispatch
//!
//! `receiver.method(args...)` lowers to [`call_method`]. Strings, arrays,
//! channels, tasks and files have fixed method tables that route straight
//! to their module operations. On an object the named field is fetched and,
//! when it holds a function, called with `self` bound to the receiver;
//! objects without such a field fall back to `keys`, `has` and `delete`.

use core::ffi::{CStr, c_char};

use crate::call::{builtin_args, call_with_self};
use crate::convert::expect_int;
use crate::error::{RtError, RtResult};
use crate::exception::abi_value;
use crate::value::Value;
use crate::{array, buffer, channel, handle, object, string, task};

const STRING_METHODS: &[&str] = &[
    "chars",
    "bytes",
    "to_bytes",
    "substr",
    "slice",
    "find",
    "contains",
    "split",
    "trim",
    "to_upper",
    "to_lower",
    "starts_with",
    "ends_with",
    "replace",
    "replace_all",
    "repeat",
    "char_at",
    "byte_at",
    "length",
];

const ARRAY_METHODS: &[&str] = &[
    "push", "pop", "shift", "unshift", "insert", "remove", "find", "contains", "slice", "join",
    "concat", "reverse", "first", "last", "clear", "map", "filter", "reduce", "length", "get",
    "set",
];

fn unit(result: RtResult<()>) -> RtResult<Value> {
    result.map(|()| Value::Null)
}

fn int(v: Value, op: &str) -> RtResult<i64> {
    expect_int(v, op)
}

/// Known method called with the wrong number of arguments, or an unknown one.
fn unmatched(kind: &str, table: &[&str], method: &str, argc: usize) -> RtError {
    if table.contains(&method) {
        RtError::arity(format!(
            "{kind}.{method}() does not take {argc} argument{}",
            if argc == 1 { "" } else { "s" }
        ))
    } else {
        RtError::no_such_method(format!("{kind} has no method '{method}'"))
    }
}

fn string_method(s: Value, method: &str, args: &[Value]) -> RtResult<Value> {
    match (method, args) {
        ("chars", []) => string::chars(s),
        ("bytes", []) => string::bytes(s),
        ("to_bytes", []) => string::to_bytes(s),
        ("length", []) => Ok(Value::I32(string::char_length(s)? as i32)),
        ("substr", [start, len]) => string::substr(s, int(*start, "substr")?, int(*len, "substr")?),
        ("slice", [start, end]) => string::slice(s, int(*start, "slice")?, int(*end, "slice")?),
        ("find", [needle]) => Ok(Value::I32(string::find(s, *needle)? as i32)),
        ("contains", [needle]) => string::contains(s, *needle).map(Value::Bool),
        ("split", [delim]) => string::split(s, *delim),
        ("trim", []) => string::trim(s),
        ("to_upper", []) => string::to_upper(s),
        ("to_lower", []) => string::to_lower(s),
        ("starts_with", [prefix]) => string::starts_with(s, *prefix).map(Value::Bool),
        ("ends_with", [suffix]) => string::ends_with(s, *suffix).map(Value::Bool),
        ("replace", [old, new]) => string::replace(s, *old, *new),
        ("replace_all", [old, new]) => string::replace_all(s, *old, *new),
        ("repeat", [count]) => string::repeat(s, int(*count, "repeat")?),
        ("char_at", [index]) => string::char_at(s, int(*index, "char_at")?),
        ("byte_at", [index]) => string::byte_at(s, int(*index, "byte_at")?),
        _ => Err(unmatched("String", STRING_METHODS, method, args.len())),
    }
}

fn array_method(arr: Value, method: &str, args: &[Value]) -> RtResult<Value> {
    match (method, args) {
        ("push", [v]) => unit(array::push(arr, *v)),
        ("pop", []) => array::pop(arr),
        ("shift", []) => array::shift(arr),
        ("unshift", [v]) => unit(array::unshift(arr, *v)),
        ("insert", [index, v]) => unit(array::insert(arr, int(*index, "insert")?, *v)),
        ("remove", [index]) => array::remove(arr, int(*index, "remove")?),
        ("get", [index]) => array::get(arr, int(*index, "get")?),
        ("set", [index, v]) => unit(array::set(arr, int(*index, "set")?, *v)),
        ("length", []) => Ok(Value::I32(array::len(arr)? as i32)),
        ("find", [needle]) => Ok(Value::I32(array::find(arr, *needle)? as i32)),
        ("contains", [needle]) => array::contains(arr, *needle).map(Value::Bool),
        ("slice", [start, end]) => array::slice(arr, int(*start, "slice")?, int(*end, "slice")?),
        ("join", [sep]) => array::join(arr, *sep),
        ("concat", [other]) => array::concat(arr, *other),
        ("reverse", []) => unit(array::reverse(arr)),
        ("first", []) => array::first(arr),
        ("last", []) => array::last(arr),
        ("clear", []) => unit(array::clear(arr)),
        ("map", [f]) => array::map(arr, *f),
        ("filter", [f]) => array::filter(arr, *f),
        ("reduce", [f]) => array::reduce(arr, *f, Value::Null),
        ("reduce", [f, initial]) => array::reduce(arr, *f, *initial),
        _ => Err(unmatched("Array", ARRAY_METHODS, method, args.len())),
    }
}

fn channel_method(ch: Value, method: &str, args: &[Value]) -> RtResult<Value> {
    const METHODS: &[&str] = &["send", "recv", "close", "send_timeout", "recv_timeout"];
    match (method, args) {
        ("send", [v]) => unit(channel::send(ch, *v)),
        ("recv", []) => channel::recv(ch),
        ("close", []) => unit(channel::close(ch)),
        ("send_timeout", [v, ms]) => {
            channel::send_timeout(ch, *v, int(*ms, "send_timeout")?).map(Value::Bool)
        }
        ("recv_timeout", [ms]) => channel::recv_timeout(ch, int(*ms, "recv_timeout")?),
        _ => Err(unmatched("Channel", METHODS, method, args.len())),
    }
}

fn buffer_method(buf: Value, method: &str, args: &[Value]) -> RtResult<Value> {
    const METHODS: &[&str] = &["length", "capacity", "get", "set", "free"];
    match (method, args) {
        ("length", []) => Ok(Value::I32(buffer::len(buf)? as i32)),
        ("capacity", []) => Ok(Value::I32(buffer::capacity(buf)? as i32)),
        ("get", [i]) => buffer::get(buf, int(*i, "get")?),
        ("set", [i, byte]) => unit(buffer::set(buf, int(*i, "set")?, int(*byte, "set")?)),
        ("free", []) => unit(buffer::free(buf)),
        _ => Err(unmatched("Buffer", METHODS, method, args.len())),
    }
}

fn task_method(t: Value, method: &str, args: &[Value]) -> RtResult<Value> {
    const METHODS: &[&str] = &["join", "detach"];
    match (method, args) {
        ("join", []) => task::join(t),
        ("detach", []) => unit(task::detach(t)),
        _ => Err(unmatched("Task", METHODS, method, args.len())),
    }
}

fn file_method(file: Value, method: &str, args: &[Value]) -> RtResult<Value> {
    const METHODS: &[&str] = &["read", "write", "close"];
    match (method, args) {
        ("read", []) => handle::read_all(file),
        ("write", [data]) => Ok(Value::I32(handle::write(file, *data)? as i32)),
        ("close", []) => unit(handle::close(file)),
        _ => Err(unmatched("File", METHODS, method, args.len())),
    }
}

fn string_arg<'a>(v: &'a Value, op: &str) -> RtResult<&'a str> {
    v.as_str()
        .ok_or_else(|| RtError::type_mismatch(format!("Object.{op}() requires string argument")))
}

fn object_method(obj: Value, method: &str, args: &[Value]) -> RtResult<Value> {
    let field = object::get_field(obj, method)?;
    if !field.is_null() {
        let result = call_with_self(obj, field, args);
        field.release();
        return result;
    }
    match (method, args) {
        ("keys", []) => object::keys(obj),
        ("has", [name]) => object::has_field(obj, string_arg(name, "has")?).map(Value::Bool),
        ("delete", [name]) => {
            object::delete_field(obj, string_arg(name, "delete")?).map(Value::Bool)
        }
        _ => Err(RtError::no_such_method(format!(
            "Object has no method '{method}'"
        ))),
    }
}

/// Call `method` on `receiver`. The result is a new reference.
pub fn call_method(receiver: Value, method: &str, args: &[Value]) -> RtResult<Value> {
    match receiver {
        Value::String(_) => string_method(receiver, method, args),
        Value::Array(_) => array_method(receiver, method, args),
        Value::Object(_) => object_method(receiver, method, args),
        Value::Buffer(_) => buffer_method(receiver, method, args),
        Value::Channel(_) => channel_method(receiver, method, args),
        Value::Task(_) => task_method(receiver, method, args),
        Value::File(_) => file_method(receiver, method, args),
        other => Err(RtError::no_such_method(format!(
            "Cannot call method '{method}' on non-object (type: {})",
            other.type_name()
        ))),
    }
}

// =============================================================================
// C ABI
// =============================================================================

/// Signature: `(Value, ptr, ptr, i32) -> Value`
///
/// # Safety
///
/// `method` must be a NUL-terminated string and `args` must point to `count`
/// initialized values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_call_method(
    receiver: Value,
    method: *const c_char,
    args: *const Value,
    count: i32,
) -> Value {
    if method.is_null() {
        return abi_value(Err(RtError::null_dereference("method name")));
    }
    let name = unsafe { CStr::from_ptr(method) }.to_string_lossy();
    let args = unsafe { builtin_args(args, count) };
    abi_value(call_method(receiver, &name, args))
}
