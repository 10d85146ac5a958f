//! Function values and the calling convention
//!
//! A compiled function is an `extern "C"` entry taking the closure
//! environment pointer followed by one [`Value`] per declared parameter,
//! plus a trailing array slot when it has a rest parameter. [`call_function`]
//! normalizes the argument list to that shape and dispatches through a
//! switch over the slot count; there is no variadic trampoline.
//!
//! Builtins use the uniform `(args, count) -> Value` signature and skip
//! arity normalization entirely.

use core::cell::UnsafeCell;
use core::ffi::{CStr, c_char, c_void};
use core::marker::PhantomData;
use core::ptr::NonNull;

use smallvec::SmallVec;

use crate::convert::expect_int;
use crate::error::{RtError, RtResult};
use crate::exception::{abi_unit, abi_value, exception_pending};
use crate::memory::{self, HeapCell, RcHeader, ReleaseList};
use crate::tls::with_thread_state;
use crate::value::Value;

/// Most declared parameters a compiled function may have.
pub const MAX_PARAMS: usize = 8;

/// Uniform builtin entry: argument pointer and count.
pub type BuiltinFn = extern "C" fn(*const Value, i32) -> Value;

// =============================================================================
// Closure environments
// =============================================================================

/// Captured variables shared by every closure created in one scope.
pub struct ClosureEnv {
    pub(crate) header: RcHeader,
    slots: UnsafeCell<Box<[Value]>>,
}

impl HeapCell for ClosureEnv {
    fn header(&self) -> &RcHeader {
        &self.header
    }

    fn drain_children(&mut self, out: &mut ReleaseList) {
        out.extend(core::mem::take(self.slots.get_mut()).into_vec());
    }
}

/// Counted handle to a [`ClosureEnv`]. Copying does not retain.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvPtr(NonNull<ClosureEnv>);

impl EnvPtr {
    /// A fresh environment of `size` null slots, count 1.
    pub fn new(size: usize) -> Self {
        let cell = ClosureEnv {
            header: RcHeader::new(),
            slots: UnsafeCell::new(vec![Value::Null; size].into_boxed_slice()),
        };
        EnvPtr(memory::alloc_cell(cell))
    }

    fn slots(&self) -> &[Value] {
        unsafe { &*self.0.as_ref().slots.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn slots_mut(&self) -> &mut [Value] {
        unsafe { &mut *self.0.as_ref().slots.get() }
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Captured value at `index`, retained.
    pub fn get(&self, index: usize) -> RtResult<Value> {
        let v = *self
            .slots()
            .get(index)
            .ok_or_else(|| RtError::index_out_of_bounds(index as i64, self.len()))?;
        v.retain();
        Ok(v)
    }

    /// Replace the value at `index`. The environment retains `value` and
    /// releases what it held before.
    pub fn set(&self, index: usize, value: Value) -> RtResult<()> {
        let len = self.len();
        let slot = self
            .slots_mut()
            .get_mut(index)
            .ok_or_else(|| RtError::index_out_of_bounds(index as i64, len))?;
        value.retain();
        core::mem::replace(slot, value).release();
        Ok(())
    }

    pub fn retain(&self) {
        unsafe { self.0.as_ref() }.header.increment();
    }

    pub fn release(self) {
        let mut pending = ReleaseList::new();
        unsafe { memory::release_cell(self.0, &mut pending) };
        memory::drain_release_list(&mut pending);
    }

    pub fn refcount(&self) -> u32 {
        unsafe { self.0.as_ref() }.header.count()
    }

    pub fn as_ptr(&self) -> *mut ClosureEnv {
        self.0.as_ptr()
    }

    fn from_raw(ptr: *mut ClosureEnv) -> Option<Self> {
        NonNull::new(ptr).map(EnvPtr)
    }
}

// =============================================================================
// Function cells
// =============================================================================

/// Declared shape of a compiled function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FunctionInfo {
    pub params: usize,
    pub required: usize,
    pub rest: bool,
    pub is_async: bool,
}

impl FunctionInfo {
    /// `n` parameters, all required.
    pub fn fixed(n: usize) -> Self {
        Self {
            params: n,
            required: n,
            ..Self::default()
        }
    }

    pub fn with_required(mut self, required: usize) -> Self {
        self.required = required;
        self
    }

    pub fn with_rest(mut self) -> Self {
        self.rest = true;
        self
    }

    pub fn with_async(mut self) -> Self {
        self.is_async = true;
        self
    }
}

pub struct FunctionCell {
    pub(crate) header: RcHeader,
    entry: *const c_void,
    env: Option<EnvPtr>,
    info: FunctionInfo,
}

impl HeapCell for FunctionCell {
    fn header(&self) -> &RcHeader {
        &self.header
    }

    fn drain_children(&mut self, out: &mut ReleaseList) {
        if let Some(env) = self.env.take() {
            unsafe { memory::release_cell(env.0, out) };
        }
    }
}

pub struct BuiltinCell {
    pub(crate) header: RcHeader,
    name: Box<str>,
    func: BuiltinFn,
}

impl HeapCell for BuiltinCell {
    fn header(&self) -> &RcHeader {
        &self.header
    }
}

impl Value {
    /// A compiled function value. The function keeps its own reference to
    /// `env`.
    pub fn function(
        entry: *const c_void,
        env: Option<EnvPtr>,
        info: FunctionInfo,
    ) -> RtResult<Value> {
        if entry.is_null() {
            return Err(RtError::null_dereference("function entry"));
        }
        if info.params > MAX_PARAMS {
            return Err(RtError::arity(format!(
                "Functions with more than {MAX_PARAMS} parameters are not supported"
            )));
        }
        if info.required > info.params {
            return Err(RtError::arity(format!(
                "Function declares {} required parameters but only {} parameters",
                info.required, info.params
            )));
        }
        if let Some(env) = env {
            env.retain();
        }
        let cell = FunctionCell {
            header: RcHeader::new(),
            entry,
            env,
            info,
        };
        Ok(Value::Function(memory::alloc_cell(cell)))
    }

    /// A builtin function value.
    pub fn builtin(name: &str, func: BuiltinFn) -> Value {
        let cell = BuiltinCell {
            header: RcHeader::new(),
            name: name.into(),
            func,
        };
        Value::Builtin(memory::alloc_cell(cell))
    }
}

/// Declared shape of a compiled function value.
pub fn function_info(func: Value) -> Option<FunctionInfo> {
    match func {
        Value::Function(p) => Some(unsafe { p.as_ref() }.info),
        _ => None,
    }
}

/// Name a builtin was registered under.
pub fn builtin_name(func: Value) -> Option<String> {
    match func {
        Value::Builtin(p) => Some(unsafe { p.as_ref() }.name.to_string()),
        _ => None,
    }
}

/// View a builtin's argument pointer as a slice.
///
/// # Safety
///
/// `args` must be null or point to `count` initialized values that outlive
/// the returned slice.
pub unsafe fn builtin_args<'a>(args: *const Value, count: i32) -> &'a [Value] {
    if args.is_null() || count <= 0 {
        &[]
    } else {
        unsafe { core::slice::from_raw_parts(args, count as usize) }
    }
}

// =============================================================================
// Calling
// =============================================================================

macro_rules! slot_ty {
    ($_i:tt) => {
        Value
    };
}

macro_rules! dispatch_slots {
    ($entry:expr, $env:expr, $slots:expr, { $($n:literal => [$($i:literal)*]),* $(,)? }) => {
        match $slots.len() {
            $(
                $n => {
                    // SAFETY: the entry was registered with exactly this
                    // many slots.
                    let f = unsafe {
                        core::mem::transmute::<
                            *const c_void,
                            extern "C" fn(*mut ClosureEnv $(, slot_ty!($i))*) -> Value,
                        >($entry)
                    };
                    f($env $(, $slots[$i])*)
                }
            )*
            n => {
                return Err(RtError::arity(format!(
                    "Functions with more than {MAX_PARAMS} parameters are not supported (got {n} slots)"
                )));
            }
        }
    };
}

fn finish_native(result: Value) -> RtResult<Value> {
    if exception_pending() {
        result.release();
        return Err(RtError::propagated());
    }
    Ok(result)
}

fn check_arity(info: &FunctionInfo, given: usize) -> RtResult<()> {
    if given < info.required {
        return Err(RtError::arity(if info.rest {
            format!(
                "Function expects at least {} arguments, got {given}",
                info.required
            )
        } else {
            format!("Function expects {} arguments, got {given}", info.required)
        }));
    }
    if !info.rest && given > info.params {
        return Err(RtError::arity(format!(
            "Function expects {} arguments, got {given}",
            info.params
        )));
    }
    Ok(())
}

/// Call `func` with `args`. The caller keeps its references to the
/// arguments and owns the returned value.
pub fn call_function(func: Value, args: &[Value]) -> RtResult<Value> {
    match func {
        Value::Builtin(p) => {
            let cell = unsafe { p.as_ref() };
            finish_native((cell.func)(args.as_ptr(), args.len() as i32))
        }
        Value::Function(p) => {
            let cell = unsafe { p.as_ref() };
            let info = cell.info;
            check_arity(&info, args.len())?;

            let mut slots: SmallVec<[Value; MAX_PARAMS + 1]> = SmallVec::new();
            slots.extend(args.iter().take(info.params).copied());
            slots.resize(info.params, Value::Null);
            let rest = info.rest.then(|| {
                let extra: Vec<Value> = args
                    .iter()
                    .skip(info.params)
                    .map(|v| {
                        v.retain();
                        *v
                    })
                    .collect();
                Value::array_from(extra)
            });
            if let Some(rest) = rest {
                slots.push(rest);
            }

            let env = cell.env.map_or(core::ptr::null_mut(), |e| e.as_ptr());
            let result = dispatch_slots!(cell.entry, env, slots, {
                0 => [],
                1 => [0],
                2 => [0 1],
                3 => [0 1 2],
                4 => [0 1 2 3],
                5 => [0 1 2 3 4],
                6 => [0 1 2 3 4 5],
                7 => [0 1 2 3 4 5 6],
                8 => [0 1 2 3 4 5 6 7],
                9 => [0 1 2 3 4 5 6 7 8],
            });
            if let Some(rest) = rest {
                rest.release();
            }
            finish_native(result)
        }
        other => Err(RtError::type_mismatch(format!(
            "Cannot call non-function value (type: {})",
            other.type_name()
        ))),
    }
}

/// Call `func` with the elements of `args_array` as its arguments.
pub fn apply(func: Value, args_array: Value) -> RtResult<Value> {
    let cell = args_array.as_array_cell().ok_or_else(|| {
        RtError::type_mismatch(format!(
            "apply() expects array of arguments, got {}",
            args_array.type_name()
        ))
    })?;
    let args = cell.to_vec_raw();
    for a in &args {
        a.retain();
    }
    let result = call_function(func, &args);
    for a in args {
        a.release();
    }
    result
}

// =============================================================================
// Method receiver
// =============================================================================

/// The receiver of the method call running on this thread, retained, or
/// null outside a method call.
pub fn get_self() -> Value {
    with_thread_state(|ts| {
        let v = ts.self_value.get();
        v.retain();
        v
    })
}

/// Call `func` with `receiver` bound as `self` for the duration of the call.
pub fn call_with_self(receiver: Value, func: Value, args: &[Value]) -> RtResult<Value> {
    receiver.retain();
    let saved = with_thread_state(|ts| ts.self_value.replace(receiver));
    let result = call_function(func, args);
    let ours = with_thread_state(|ts| ts.self_value.replace(saved));
    ours.release();
    result
}

// =============================================================================
// Stack-depth guard
// =============================================================================

/// One level of call depth; dropping it leaves the level.
#[derive(Debug)]
pub struct CallGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        exit_call();
    }
}

/// Enter one call level. Exceeding the thread's limit resets the depth and
/// fails with StackOverflow.
pub fn enter_call() -> RtResult<CallGuard> {
    with_thread_state(|ts| {
        let depth = ts.call_depth.get() + 1;
        if depth > ts.stack_limit.get() {
            ts.call_depth.set(0);
            return Err(RtError::stack_overflow());
        }
        ts.call_depth.set(depth);
        Ok(CallGuard {
            _not_send: PhantomData,
        })
    })
}

/// Leave one call level.
pub fn exit_call() {
    with_thread_state(|ts| ts.call_depth.set(ts.call_depth.get().saturating_sub(1)));
}

pub fn call_depth() -> u32 {
    with_thread_state(|ts| ts.call_depth.get())
}

pub fn get_stack_limit() -> u32 {
    with_thread_state(|ts| ts.stack_limit.get())
}

/// Set this thread's depth limit. Returns the previous limit.
pub fn set_stack_limit(limit: i64) -> RtResult<u32> {
    let limit = u32::try_from(limit)
        .ok()
        .filter(|&l| l > 0)
        .ok_or_else(|| RtError::range("set_stack_limit() expects a positive integer"))?;
    Ok(with_thread_state(|ts| ts.stack_limit.replace(limit)))
}

// =============================================================================
// C ABI
// =============================================================================

fn info_from_abi(num_params: i32, num_required: i32, is_async: i32, rest: bool) -> FunctionInfo {
    FunctionInfo {
        params: num_params.max(0) as usize,
        required: num_required.max(0) as usize,
        rest,
        is_async: is_async != 0,
    }
}

/// Signature: `(ptr, i32, i32, i32) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_function(
    entry: *const c_void,
    num_params: i32,
    num_required: i32,
    is_async: i32,
) -> Value {
    let info = info_from_abi(num_params, num_required, is_async, false);
    abi_value(Value::function(entry, None, info))
}

/// Signature: `(ptr, ptr, i32, i32, i32) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_function_with_env(
    entry: *const c_void,
    env: *mut ClosureEnv,
    num_params: i32,
    num_required: i32,
    is_async: i32,
) -> Value {
    let info = info_from_abi(num_params, num_required, is_async, false);
    abi_value(Value::function(entry, EnvPtr::from_raw(env), info))
}

/// Like `hml_val_function_with_env`, for a function whose last slot
/// collects extra arguments.
///
/// Signature: `(ptr, ptr, i32, i32, i32) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_val_function_rest(
    entry: *const c_void,
    env: *mut ClosureEnv,
    num_params: i32,
    num_required: i32,
    is_async: i32,
) -> Value {
    let info = info_from_abi(num_params, num_required, is_async, true);
    abi_value(Value::function(entry, EnvPtr::from_raw(env), info))
}

/// Signature: `(ptr, ptr) -> Value`
///
/// # Safety
///
/// `name` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_val_builtin(func: BuiltinFn, name: *const c_char) -> Value {
    let name = if name.is_null() {
        std::borrow::Cow::Borrowed("<builtin>")
    } else {
        unsafe { CStr::from_ptr(name) }.to_string_lossy()
    };
    Value::builtin(&name, func)
}

/// Signature: `(Value, ptr, i32) -> Value`
///
/// # Safety
///
/// `args` must point to `count` initialized values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_call_function(func: Value, args: *const Value, count: i32) -> Value {
    if args.is_null() && count > 0 {
        return abi_value(Err(RtError::null_dereference("function arguments")));
    }
    let args = unsafe { builtin_args(args, count) };
    abi_value(call_function(func, args))
}

/// Signature: `(Value, Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_apply(func: Value, args_array: Value) -> Value {
    abi_value(apply(func, args_array))
}

/// Signature: `(i32) -> ptr`
#[unsafe(no_mangle)]
pub extern "C" fn hml_closure_env_new(size: i32) -> *mut ClosureEnv {
    EnvPtr::new(size.max(0) as usize).as_ptr()
}

/// Signature: `(ptr, i32) -> Value`
///
/// # Safety
///
/// `env` must be a live environment from `hml_closure_env_new`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_closure_env_get(env: *mut ClosureEnv, index: i32) -> Value {
    abi_value(
        EnvPtr::from_raw(env)
            .ok_or_else(|| RtError::null_dereference("closure environment"))
            .and_then(|e| e.get(index.max(0) as usize)),
    )
}

/// Signature: `(ptr, i32, Value) -> ()`
///
/// # Safety
///
/// `env` must be a live environment from `hml_closure_env_new`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_closure_env_set(env: *mut ClosureEnv, index: i32, value: Value) {
    abi_unit(
        EnvPtr::from_raw(env)
            .ok_or_else(|| RtError::null_dereference("closure environment"))
            .and_then(|e| e.set(index.max(0) as usize, value)),
    );
}

/// Signature: `(ptr) -> ()`
///
/// # Safety
///
/// `env` must be null or a live environment.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_closure_env_retain(env: *mut ClosureEnv) {
    if let Some(env) = EnvPtr::from_raw(env) {
        env.retain();
    }
}

/// Signature: `(ptr) -> ()`
///
/// # Safety
///
/// `env` must be null or a live environment the caller holds a reference to.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_closure_env_release(env: *mut ClosureEnv) {
    if let Some(env) = EnvPtr::from_raw(env) {
        env.release();
    }
}

/// Signature: `() -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_get_self() -> Value {
    get_self()
}

/// Enter a call level. On overflow the exception is raised and 0 returned.
///
/// Signature: `() -> i32`
#[unsafe(no_mangle)]
pub extern "C" fn hml_call_enter() -> i32 {
    match enter_call() {
        Ok(guard) => {
            // Generated code leaves the level with hml_call_exit.
            core::mem::forget(guard);
            1
        }
        Err(err) => {
            crate::exception::raise(err);
            0
        }
    }
}

/// Signature: `() -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_call_exit() {
    exit_call();
}

/// Signature: `() -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_get_stack_limit() -> Value {
    Value::I32(get_stack_limit() as i32)
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_set_stack_limit(limit: Value) -> Value {
    abi_value(
        expect_int(limit, "set_stack_limit")
            .and_then(set_stack_limit)
            .map(|old| Value::I32(old as i32)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array;
    use crate::error::RtErrorKind;
    use crate::exception::{protect, raise};
    use crate::format::to_display_string;

    extern "C" fn add2(_env: *mut ClosureEnv, a: Value, b: Value) -> Value {
        match (a, b) {
            (Value::I32(x), Value::I32(y)) => Value::I32(x + y),
            (Value::I32(x), Value::Null) => Value::I32(x),
            _ => Value::Null,
        }
    }

    extern "C" fn count_rest(_env: *mut ClosureEnv, first: Value, rest: Value) -> Value {
        let n = array::len(rest).unwrap_or(0) as i32;
        match first {
            Value::I32(x) => Value::I32(x * 100 + n),
            _ => Value::I32(n),
        }
    }

    extern "C" fn counter(env: *mut ClosureEnv) -> Value {
        let env = EnvPtr::from_raw(env).unwrap();
        let next = match env.get(0).unwrap() {
            Value::I32(n) => n + 1,
            _ => 1,
        };
        env.set(0, Value::I32(next)).unwrap();
        Value::I32(next)
    }

    extern "C" fn sum_builtin(args: *const Value, count: i32) -> Value {
        let args = unsafe { builtin_args(args, count) };
        Value::I32(args.iter().filter_map(Value::as_i64).sum::<i64>() as i32)
    }

    extern "C" fn failing(_env: *mut ClosureEnv) -> Value {
        raise(RtError::runtime("inside"));
        Value::Null
    }

    extern "C" fn read_self(_env: *mut ClosureEnv) -> Value {
        get_self()
    }

    #[test]
    fn test_fixed_arity_and_optional_padding() {
        let f = Value::function(
            add2 as *const c_void,
            None,
            FunctionInfo::fixed(2).with_required(1),
        )
        .unwrap();
        assert!(matches!(
            call_function(f, &[Value::I32(2), Value::I32(3)]).unwrap(),
            Value::I32(5)
        ));
        assert!(matches!(call_function(f, &[Value::I32(7)]).unwrap(), Value::I32(7)));

        let err = call_function(f, &[]).unwrap_err();
        assert!(matches!(err.kind(), RtErrorKind::ArityError(_)));
        assert_eq!(err.to_string(), "Function expects 1 arguments, got 0");
        let err = call_function(f, &[Value::I32(1); 3]).unwrap_err();
        assert_eq!(err.to_string(), "Function expects 2 arguments, got 3");
        f.release();
    }

    #[test]
    fn test_rest_parameter_collects_extras() {
        let f = Value::function(
            count_rest as *const c_void,
            None,
            FunctionInfo::fixed(1).with_rest(),
        )
        .unwrap();
        let extra = Value::string_from("x");
        let result = call_function(f, &[Value::I32(4), extra, Value::I32(0)]).unwrap();
        assert!(matches!(result, Value::I32(402)));
        assert_eq!(extra.refcount(), 1);
        assert!(matches!(call_function(f, &[Value::I32(4)]).unwrap(), Value::I32(400)));
        let err = call_function(f, &[]).unwrap_err();
        assert_eq!(err.to_string(), "Function expects at least 1 arguments, got 0");
        extra.release();
        f.release();
    }

    #[test]
    fn test_closure_counter() {
        let env = EnvPtr::new(2);
        let captured = Value::string_from("kept alive");
        env.set(0, Value::I32(0)).unwrap();
        env.set(1, captured).unwrap();
        let f = Value::function(
            counter as *const c_void,
            Some(env),
            FunctionInfo::fixed(0),
        )
        .unwrap();
        env.release();
        assert_eq!(captured.refcount(), 2);

        assert!(matches!(call_function(f, &[]).unwrap(), Value::I32(1)));
        assert!(matches!(call_function(f, &[]).unwrap(), Value::I32(2)));

        f.release();
        assert_eq!(captured.refcount(), 1);
        captured.release();
    }

    #[test]
    fn test_builtin_bypasses_arity() {
        let f = Value::builtin("sum", sum_builtin);
        assert_eq!(f.type_name(), "function");
        assert_eq!(builtin_name(f).as_deref(), Some("sum"));
        let r = call_function(f, &[Value::I32(1), Value::I32(2), Value::I32(3)]).unwrap();
        assert!(matches!(r, Value::I32(6)));
        let args = Value::array_from(vec![Value::I32(4), Value::I32(5)]);
        assert!(matches!(apply(f, args).unwrap(), Value::I32(9)));
        args.release();
        f.release();
    }

    #[test]
    fn test_non_function_rejected() {
        let err = call_function(Value::I32(3), &[]).unwrap_err();
        assert_eq!(err.to_string(), "Cannot call non-function value (type: i32)");
        assert!(Value::function(core::ptr::null(), None, FunctionInfo::fixed(0)).is_err());
        assert!(
            Value::function(
                add2 as *const c_void,
                None,
                FunctionInfo::fixed(9)
            )
            .is_err()
        );
    }

    #[test]
    fn test_exception_from_native_propagates() {
        let f = Value::function(
            failing as *const c_void,
            None,
            FunctionInfo::fixed(0),
        )
        .unwrap();
        let caught = protect(|| call_function(f, &[])).unwrap_err();
        assert_eq!(caught.get().as_str(), Some("inside"));
        f.release();
    }

    #[test]
    fn test_self_binding_restored() {
        let f = Value::function(
            read_self as *const c_void,
            None,
            FunctionInfo::fixed(0),
        )
        .unwrap();
        let obj = Value::object();
        let seen = call_with_self(obj, f, &[]).unwrap();
        assert_eq!(seen.cell_addr(), obj.cell_addr());
        seen.release();
        assert!(get_self().is_null());
        assert_eq!(obj.refcount(), 1);
        obj.release();
        f.release();
    }

    #[test]
    fn test_stack_guard() {
        let old = set_stack_limit(3).unwrap();
        let g1 = enter_call().unwrap();
        let g2 = enter_call().unwrap();
        let g3 = enter_call().unwrap();
        assert_eq!(call_depth(), 3);
        let err = enter_call().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Maximum call stack depth exceeded (infinite recursion?)"
        );
        assert_eq!(call_depth(), 0);
        drop((g1, g2, g3));
        assert_eq!(call_depth(), 0);
        assert_eq!(set_stack_limit(old as i64).unwrap(), 3);
        assert_eq!(
            set_stack_limit(0).unwrap_err().to_string(),
            "set_stack_limit() expects a positive integer"
        );
    }

    #[test]
    fn test_rest_array_display() {
        extern "C" fn echo_rest(_env: *mut ClosureEnv, rest: Value) -> Value {
            rest.retain();
            rest
        }
        let f = Value::function(
            echo_rest as *const c_void,
            None,
            FunctionInfo::fixed(0).with_rest(),
        )
        .unwrap();
        let r = call_function(f, &[Value::I32(1), Value::Bool(true)]).unwrap();
        assert_eq!(to_display_string(r), "[1, true]");
        r.release();
        f.release();
    }
}
