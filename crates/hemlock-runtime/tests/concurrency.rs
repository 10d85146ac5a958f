//! Tasks and channels running on the global pool.

use core::ffi::c_void;
use std::thread;
use std::time::{Duration, Instant};

use hemlock_runtime::call::{ClosureEnv, FunctionInfo};
use hemlock_runtime::value::{Value, values_equal};
use hemlock_runtime::{array, channel, object, pointer, task};
use serial_test::serial;

extern "C" fn produce(_env: *mut ClosureEnv, ch: Value) -> Value {
    for i in 1..=3 {
        if channel::send(ch, Value::I32(i)).is_err() {
            return Value::Null;
        }
    }
    let _ = channel::close(ch);
    Value::Null
}

extern "C" fn consume(_env: *mut ClosureEnv, ch: Value) -> Value {
    let received = Value::array();
    loop {
        match channel::recv(ch) {
            Ok(Value::Null) | Err(_) => break,
            Ok(v) => {
                let _ = array::push(received, v);
                v.release();
            }
        }
    }
    received
}

extern "C" fn bump(_env: *mut ClosureEnv, cell: Value) -> Value {
    for _ in 0..500 {
        let _ = unsafe { hemlock_runtime::atomics::add_i64(cell, Value::I32(1)) };
    }
    Value::Null
}

fn async_fn(entry: *const c_void) -> Value {
    Value::function(entry, None, FunctionInfo::fixed(1).with_async()).unwrap()
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
#[serial]
fn test_producer_blocks_until_consumer_drains() {
    let ch = channel::create(2).unwrap();
    let producer = async_fn(produce as *const c_void);
    let consumer = async_fn(consume as *const c_void);

    let p = task::spawn(producer, &[ch]).unwrap();
    wait_until(|| channel::blocked_sends(ch).unwrap() == 1);
    assert_eq!(channel::len(ch).unwrap(), 2);

    let c = task::spawn(consumer, &[ch]).unwrap();
    task::join(p).unwrap().release();
    let received = task::join(c).unwrap();

    assert_eq!(array::len(received).unwrap(), 3);
    for i in 0..3 {
        assert!(matches!(array::get(received, i).unwrap(), Value::I32(v) if v == i as i32 + 1));
    }
    assert_eq!(channel::blocked_sends(ch).unwrap(), 1);
    assert!(channel::is_closed(ch).unwrap());
    for v in [received, c, p, consumer, producer, ch] {
        v.release();
    }
}

#[test]
#[serial]
fn test_select_sees_value_sent_by_task() {
    let idle = channel::create(1).unwrap();
    let busy = channel::create(1).unwrap();
    let producer = async_fn(produce as *const c_void);
    let t = task::spawn(producer, &[busy]).unwrap();

    idle.retain();
    busy.retain();
    let channels = Value::array_from(vec![idle, busy]);
    let picked = channel::select(channels, Some(5_000)).unwrap();
    let from = object::get_field(picked, "channel").unwrap();
    let value = object::get_field(picked, "value").unwrap();
    assert!(values_equal(from, busy));
    assert!(!values_equal(from, idle));
    assert!(matches!(value, Value::I32(1)));

    while !matches!(channel::recv(busy).unwrap(), Value::Null) {}
    task::join(t).unwrap().release();
    for v in [from, picked, channels, t, producer, busy, idle] {
        v.release();
    }
}

#[test]
#[serial]
fn test_atomic_counter_shared_by_tasks() {
    let cell = pointer::alloc(8).unwrap();
    unsafe { hemlock_runtime::atomics::store_i64(cell, Value::I64(0)).unwrap() };
    let f = async_fn(bump as *const c_void);

    let tasks: Vec<_> = (0..8).map(|_| task::spawn(f, &[cell]).unwrap()).collect();
    for t in &tasks {
        task::join(*t).unwrap().release();
    }
    let total = unsafe { hemlock_runtime::atomics::load_i64(cell) }.unwrap();
    assert!(matches!(total, Value::I64(4000)));

    tasks.into_iter().for_each(Value::release);
    f.release();
    unsafe { pointer::free(cell).unwrap() };
}
