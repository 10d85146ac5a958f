//! Async tasks
//!
//! `spawn` runs an async function on the global pool and hands back a Task
//! value. The task cell keeps the function and its arguments alive until the
//! call has run; the outcome stays in the cell until `join` takes it.

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::call::{MAX_PARAMS, builtin_args, call_function, function_info};
use crate::error::{RtError, RtResult};
use crate::exception::{abi_unit, abi_value, protect};
use crate::memory::{self, HeapCell, RcHeader, ReleaseList};
use crate::scheduler::{self, WorkHandle};
use crate::value::{Owned, Value};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Ready = 0,
    Running = 1,
    Completed = 2,
}

impl TaskState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Ready,
            1 => TaskState::Running,
            _ => TaskState::Completed,
        }
    }
}

type Outcome = Result<Owned, Owned>;

pub struct TaskCell {
    pub(crate) header: RcHeader,
    id: u64,
    state: AtomicU8,
    detached: AtomicBool,
    joined: AtomicBool,
    func: Owned,
    args: Vec<Owned>,
    outcome: Mutex<Option<Outcome>>,
    work: Mutex<Option<WorkHandle>>,
}

impl HeapCell for TaskCell {
    fn header(&self) -> &RcHeader {
        &self.header
    }

    fn drain_children(&mut self, out: &mut ReleaseList) {
        out.push(core::mem::take(&mut self.func).into_raw());
        out.extend(self.args.drain(..).map(Owned::into_raw));
        match self.outcome.get_mut().take() {
            Some(Ok(v)) | Some(Err(v)) => out.push(v.into_raw()),
            None => {}
        }
    }
}

impl TaskCell {
    fn run(&self) {
        self.state.store(TaskState::Running as u8, Ordering::Release);
        let args: SmallVec<[Value; MAX_PARAMS]> = self.args.iter().map(Owned::get).collect();
        let outcome = protect(|| call_function(self.func.get(), &args)).map(Owned::new);
        if outcome.is_err() {
            tracing::debug!(task = self.id, "task finished with an exception");
        }
        *self.outcome.lock() = Some(outcome);
        self.state.store(TaskState::Completed as u8, Ordering::Release);
    }
}

fn task_cell<'a>(task: &'a Value, op: &str) -> RtResult<&'a TaskCell> {
    match *task {
        Value::Task(p) => Ok(unsafe { p.as_ref() }),
        _ => Err(RtError::type_mismatch(format!("{op}() expects a task"))),
    }
}

/// Start `func(args...)` on the pool. `func` must be an async function.
/// The task takes its own references to the function and the arguments.
pub fn spawn(func: Value, args: &[Value]) -> RtResult<Value> {
    if !function_info(func).is_some_and(|info| info.is_async) {
        return Err(RtError::type_mismatch("spawn() requires an async function"));
    }
    let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
    let cell = TaskCell {
        header: RcHeader::new(),
        id,
        state: AtomicU8::new(TaskState::Ready as u8),
        detached: AtomicBool::new(false),
        joined: AtomicBool::new(false),
        func: Owned::retained(func),
        args: args.iter().map(|a| Owned::retained(*a)).collect(),
        outcome: Mutex::new(None),
        work: Mutex::new(None),
    };
    let task = Value::Task(memory::alloc_cell(cell));

    // The job holds a reference of its own so a detached task outlives its
    // last user-visible handle.
    let job_ref = Owned::retained(task);
    let submitted = scheduler::global().and_then(|pool| {
        pool.spawn(move || {
            if let Value::Task(p) = job_ref.get() {
                unsafe { p.as_ref() }.run();
            }
        })
    });
    match submitted {
        Ok(handle) => {
            if let Ok(cell) = task_cell(&task, "spawn") {
                *cell.work.lock() = Some(handle);
            }
            tracing::debug!(task = id, "task spawned");
            Ok(task)
        }
        Err(err) => {
            task.release();
            Err(err)
        }
    }
}

/// Wait for `task` and return its result. An exception thrown inside the
/// task is thrown again here.
pub fn join(task: Value) -> RtResult<Value> {
    let cell = task_cell(&task, "join")?;
    if cell.detached.load(Ordering::Acquire) {
        return Err(RtError::runtime("cannot join detached task"));
    }
    if cell.joined.swap(true, Ordering::AcqRel) {
        return Err(RtError::runtime("task handle already joined"));
    }
    let handle = cell.work.lock().clone();
    if let Some(handle) = handle {
        handle.wait();
    }
    tracing::debug!(task = cell.id, "task joined");
    match cell.outcome.lock().take() {
        Some(Ok(value)) => Ok(value.into_raw()),
        Some(Err(thrown)) => Err(RtError::user(thrown)),
        None => Err(RtError::runtime("task finished without a result")),
    }
}

/// Let `task` run to completion unobserved.
pub fn detach(task: Value) -> RtResult<()> {
    let cell = task_cell(&task, "detach")?;
    if cell.joined.load(Ordering::Acquire) {
        return Err(RtError::runtime("cannot detach already joined task"));
    }
    cell.detached.store(true, Ordering::Release);
    Ok(())
}

pub fn id(task: Value) -> RtResult<u64> {
    task_cell(&task, "task_id").map(|c| c.id)
}

pub fn state(task: Value) -> RtResult<TaskState> {
    task_cell(&task, "task_state").map(|c| TaskState::from_u8(c.state.load(Ordering::Acquire)))
}

// =============================================================================
// C ABI
// =============================================================================

/// Signature: `(Value, ptr, i32) -> Value`
///
/// # Safety
///
/// `args` must point to `count` initialized values.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn hml_spawn(func: Value, args: *const Value, count: i32) -> Value {
    let args = unsafe { builtin_args(args, count) };
    abi_value(spawn(func, args))
}

/// Signature: `(Value) -> Value`
#[unsafe(no_mangle)]
pub extern "C" fn hml_join(task: Value) -> Value {
    abi_value(join(task))
}

/// Signature: `(Value) -> ()`
#[unsafe(no_mangle)]
pub extern "C" fn hml_detach(task: Value) {
    abi_unit(detach(task));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{ClosureEnv, FunctionInfo};
    use crate::error::RtErrorKind;
    use crate::exception::{raise, throw};
    use core::ffi::c_void;
    use serial_test::serial;

    extern "C" fn triple(_env: *mut ClosureEnv, x: Value) -> Value {
        match x {
            Value::I32(n) => Value::I32(n * 3),
            _ => Value::Null,
        }
    }

    extern "C" fn fail(_env: *mut ClosureEnv) -> Value {
        let msg = Value::string_from("boom");
        raise(throw(msg));
        msg.release();
        Value::Null
    }

    extern "C" fn fan_out(_env: *mut ClosureEnv, n: Value) -> Value {
        let Ok(f) = async_fn(triple as *const c_void, 1) else {
            return Value::Null;
        };
        let mut sum = 0;
        for i in 0..n.as_i64().unwrap_or(0) {
            let t = spawn(f, &[Value::I32(i as i32)]).unwrap();
            if let Ok(Value::I32(v)) = join(t) {
                sum += v;
            }
            t.release();
        }
        f.release();
        Value::I32(sum)
    }

    fn async_fn(entry: *const c_void, params: usize) -> RtResult<Value> {
        Value::function(entry, None, FunctionInfo::fixed(params).with_async())
    }

    #[test]
    #[serial]
    fn test_spawn_and_join() {
        let f = async_fn(triple as *const c_void, 1).unwrap();
        let tasks: Vec<_> = (0..16).map(|i| spawn(f, &[Value::I32(i)]).unwrap()).collect();
        for (i, t) in tasks.iter().enumerate() {
            assert!(matches!(join(*t).unwrap(), Value::I32(v) if v == i as i32 * 3));
            assert_eq!(state(*t).unwrap(), TaskState::Completed);
        }
        let ids: Vec<_> = tasks.iter().map(|t| id(*t).unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        tasks.into_iter().for_each(Value::release);
        f.release();
    }

    #[test]
    #[serial]
    fn test_exception_is_rethrown_at_join() {
        let f = async_fn(fail as *const c_void, 0).unwrap();
        let t = spawn(f, &[]).unwrap();
        let err = join(t).unwrap_err();
        assert!(err.is_user_exception());
        let thrown = err.into_value();
        assert_eq!(thrown.as_str(), Some("boom"));
        thrown.release();
        t.release();
        f.release();
    }

    #[test]
    #[serial]
    fn test_join_rules() {
        let f = async_fn(triple as *const c_void, 1).unwrap();
        let t = spawn(f, &[Value::I32(1)]).unwrap();
        join(t).unwrap();
        let err = join(t).unwrap_err();
        assert_eq!(err.to_string(), "task handle already joined");
        assert!(detach(t).is_err());
        t.release();

        let d = spawn(f, &[Value::I32(2)]).unwrap();
        detach(d).unwrap();
        assert_eq!(join(d).unwrap_err().to_string(), "cannot join detached task");
        d.release();
        f.release();
    }

    #[test]
    #[serial]
    fn test_spawn_requires_async_function() {
        let f = Value::function(triple as *const c_void, None, FunctionInfo::fixed(1)).unwrap();
        let err = spawn(f, &[Value::I32(1)]).unwrap_err();
        assert!(matches!(err.kind(), RtErrorKind::TypeMismatch(m) if m == "spawn() requires an async function"));
        f.release();
        assert!(join(Value::I32(1)).is_err());
    }

    #[test]
    #[serial]
    fn test_nested_spawn_and_join_inside_tasks() {
        let f = async_fn(fan_out as *const c_void, 1).unwrap();
        let outer: Vec<_> = (0..8).map(|_| spawn(f, &[Value::I32(10)]).unwrap()).collect();
        for t in outer {
            // 3 * (0 + 1 + ... + 9)
            assert!(matches!(join(t).unwrap(), Value::I32(135)));
            t.release();
        }
        f.release();
    }
}
