//! Measurements of `PriorityDict` under balancer-like access patterns.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::Rng;

use netcall_core::PriorityDict;

criterion_group!(pqueue, busy_balancer, churn);
criterion_main!(pqueue);

/// Repeatedly picks the least loaded worker, as the request router does.
fn busy_balancer(c: &mut Criterion) {
    let mut pd = PriorityDict::new();
    for w in 0..64u32 {
        pd.set(w, 0);
    }
    let mut rng = rand::thread_rng();
    c.bench_function("pick and increment, 64 workers", |b| {
        b.iter(|| {
            let (w, _) = pd.peek_min().map(|(w, p)| (*w, p)).unwrap_or((0, 0));
            pd.increment(black_box(&w));
        })
    });
    c.bench_function("random decrement, 64 workers", |b| {
        b.iter(|| {
            let w = rng.gen_range(0, 64u32);
            pd.decrement(black_box(&w));
        })
    });
}

fn churn(c: &mut Criterion) {
    c.bench_function("insert and remove 1000 workers", |b| {
        b.iter(|| {
            let mut pd = PriorityDict::new();
            for w in 0..1000u32 {
                pd.set(w, (w % 7) as u64);
            }
            for w in (0..1000u32).step_by(2) {
                pd.remove(&w);
            }
            black_box(pd.peek_min().map(|(w, _)| *w))
        })
    });
}
