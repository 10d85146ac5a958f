//! End-to-end behavior of the runtime through its public Rust API.

use core::ffi::c_void;

use hemlock_runtime::arithmetic::{BinaryOp, binary_op, promote};
use hemlock_runtime::call::{ClosureEnv, EnvPtr, FunctionInfo, builtin_args, call_function};
use hemlock_runtime::error::RtErrorKind;
use hemlock_runtime::exception::{protect, throw};
use hemlock_runtime::value::{Value, ValueTag, values_equal};
use hemlock_runtime::{array, defer, json, object, string};
use parking_lot::Mutex;

#[test]
fn test_integer_promotion() {
    let sum = binary_op(BinaryOp::Add, Value::I32(1000), Value::I64(2_000_000_000)).unwrap();
    assert!(matches!(sum, Value::I64(2_000_001_000)));
    assert_eq!(promote(ValueTag::I32, ValueTag::I64), Some(ValueTag::I64));
    assert_eq!(promote(ValueTag::I64, ValueTag::I32), Some(ValueTag::I64));
}

#[test]
fn test_division_semantics() {
    let q = binary_op(BinaryOp::Div, Value::I32(7), Value::I32(2)).unwrap();
    assert!(matches!(q, Value::F64(x) if x == 3.5));
    let err = binary_op(BinaryOp::Mod, Value::I32(7), Value::I32(0)).unwrap_err();
    assert!(matches!(err.kind(), RtErrorKind::DivisionByZero));
}

#[test]
fn test_typed_array_enforcement() {
    let arr = Value::array_with_type(ValueTag::I32);
    array::push(arr, Value::I32(1)).unwrap();
    array::push(arr, Value::I32(2)).unwrap();
    let err = array::push(arr, Value::F64(3.5)).unwrap_err();
    assert!(matches!(err.kind(), RtErrorKind::TypeMismatch(_)));
    assert_eq!(array::len(arr).unwrap(), 2);
    arr.release();
}

static DEFER_LOG: Mutex<Vec<i64>> = Mutex::new(Vec::new());

extern "C" fn record(args: *const Value, count: i32) -> Value {
    let args = unsafe { builtin_args(args, count) };
    if let Some(n) = args.first().and_then(Value::as_i64) {
        DEFER_LOG.lock().push(n);
    }
    Value::Null
}

#[test]
fn test_exception_runs_defers_before_catch() {
    let recorder = Value::builtin("record", record);
    let thrown = Value::string_from("E");

    let caught = protect(|| -> hemlock_runtime::RtResult<()> {
        defer::push_call_with_args(recorder, &[Value::I32(1)]);
        defer::push_call_with_args(recorder, &[Value::I32(2)]);
        Err(throw(thrown))
    })
    .unwrap_err();

    assert_eq!(*DEFER_LOG.lock(), vec![2, 1]);
    assert!(values_equal(caught.get(), thrown));
    assert_eq!(thrown.refcount(), 2);
    drop(caught);
    assert_eq!(thrown.refcount(), 1);
    assert_eq!(defer::depth(), 0);
    thrown.release();
    recorder.release();
}

extern "C" fn bump_counter(env: *mut ClosureEnv) -> Value {
    let cell = unsafe { hemlock_runtime::call::hml_closure_env_get(env, 0) };
    let next = match object::get_field(cell, "n") {
        Ok(Value::I32(n)) => n + 1,
        _ => 1,
    };
    let _ = object::set_field(cell, "n", Value::I32(next));
    cell.release();
    Value::I32(next)
}

#[test]
fn test_closure_capture() {
    let counter = Value::object();
    object::set_field(counter, "n", Value::I32(0)).unwrap();

    let env = EnvPtr::new(1);
    env.set(0, counter).unwrap();
    let f = Value::function(bump_counter as *const c_void, Some(env), FunctionInfo::fixed(0))
        .unwrap();
    env.release();
    let g = f;
    g.retain();

    assert!(matches!(call_function(f, &[]).unwrap(), Value::I32(1)));
    assert!(matches!(call_function(g, &[]).unwrap(), Value::I32(2)));
    assert_eq!(counter.refcount(), 2);

    f.release();
    assert_eq!(counter.refcount(), 2);
    g.release();
    assert_eq!(counter.refcount(), 1);
    counter.release();
}

#[test]
fn test_container_invariants() {
    let arr = Value::array();
    array::push(arr, Value::I32(1)).unwrap();
    let item = Value::string_from("x");
    array::push(arr, item).unwrap();
    array::pop(arr).unwrap().release();
    assert_eq!(array::len(arr).unwrap(), 1);
    assert_eq!(item.refcount(), 1);

    let obj = Value::object();
    object::set_field(obj, "k", item).unwrap();
    let before = item.refcount();
    let got = object::get_field(obj, "k").unwrap();
    assert_eq!(got.refcount(), before + 1);
    got.release();

    let mut dest = Value::string_from("ab");
    let observer = dest;
    observer.retain();
    let tail = Value::string_from("cd");
    string::append_inplace(&mut dest, tail);
    assert_eq!(observer.as_str(), Some("ab"));
    assert_eq!(dest.as_str(), Some("abcd"));
    assert_eq!(observer.refcount(), 1);
    for v in [tail, observer, dest, obj, item, arr] {
        v.release();
    }
}

#[test]
fn test_json_round_trip_compares_equal() {
    let obj = Value::object();
    let list = Value::array_from(vec![Value::I32(1), Value::Bool(false), Value::Null]);
    object::set_field(obj, "list", list).unwrap();
    object::set_field(obj, "ratio", Value::F64(0.25)).unwrap();

    let text = json::serialize(obj).unwrap();
    let back = json::deserialize(&text).unwrap();
    assert_eq!(json::serialize(back).unwrap(), text);
    let ratio = object::get_field(back, "ratio").unwrap();
    assert!(values_equal(ratio, Value::F64(0.25)));
    for v in [back, list, obj] {
        v.release();
    }
}
