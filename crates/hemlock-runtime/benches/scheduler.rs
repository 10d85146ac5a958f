//! Scheduler throughput benchmarks

use core::ffi::c_void;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use hemlock_runtime::ThreadPool;
use hemlock_runtime::call::{ClosureEnv, FunctionInfo};
use hemlock_runtime::value::Value;
use hemlock_runtime::{channel, task};

extern "C" fn square(_env: *mut ClosureEnv, x: Value) -> Value {
    match x {
        Value::I32(n) => Value::I32(n.wrapping_mul(n)),
        _ => Value::Null,
    }
}

fn bench_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool");
    let pool = ThreadPool::new(4).expect("pool");

    group.bench_function("spawn_wait_256", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..256)
                .map(|i| {
                    pool.spawn(move || {
                        black_box(i * 2);
                    })
                    .expect("spawn")
                })
                .collect();
            for h in handles {
                let _ = h.wait();
            }
        });
    });

    group.finish();
    pool.shutdown();
}

fn bench_tasks(c: &mut Criterion) {
    let mut group = c.benchmark_group("tasks");
    let f = Value::function(square as *const c_void, None, FunctionInfo::fixed(1).with_async())
        .expect("function");

    group.bench_function("spawn_join_64", |b| {
        b.iter(|| {
            let tasks: Vec<_> = (0..64)
                .map(|i| task::spawn(f, &[Value::I32(i)]).expect("spawn"))
                .collect();
            for t in tasks {
                let _ = task::join(t);
                t.release();
            }
        });
    });

    let ch = channel::create(1024).expect("channel");
    group.bench_function("channel_send_recv_1000", |b| {
        b.iter(|| {
            for i in 0..1000 {
                let _ = channel::send(ch, Value::I32(i));
            }
            for _ in 0..1000 {
                let _ = channel::recv(ch);
            }
        });
    });
    ch.release();
    f.release();

    group.finish();
}

criterion_group!(benches, bench_pool, bench_tasks);
criterion_main!(benches);
