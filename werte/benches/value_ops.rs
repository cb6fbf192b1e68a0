//! Run with:
//!   cargo bench --bench value_ops

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use werte::{ObjectKind, Runtime, SparseMap, Value};

/// Pinned registry holding `count` instances through a roster array, each
/// instance carrying a string name and an integer counter.
fn build_graph(count: usize) -> Runtime {
    let mut rt = Runtime::new();
    let registry = rt.alloc_object(ObjectKind::Base).expect("registry");
    rt.pin(registry);

    let roster = rt.alloc_array(Vec::new()).expect("roster");
    rt.set(registry, "roster", &roster).expect("roster property");

    for i in 0..count {
        let unit = rt.alloc_object(ObjectKind::Instance).expect("instance");
        let name = rt.alloc_string(&format!("unit-{i}"));
        rt.set(unit, "name", &name).expect("name property");
        rt.release(name);
        rt.set(unit, "hp", &Value::int32(100)).expect("hp property");
        rt.array_push(&roster, Value::object(unit)).expect("push");
    }
    rt.release(roster);
    rt
}

fn bench_value_coercions(c: &mut Criterion) {
    let values = [
        Value::real(13.25),
        Value::int32(-7),
        Value::int64(1 << 40),
        Value::boolean(true),
    ];

    c.bench_function("value_coercions", |b| {
        b.iter(|| {
            for value in black_box(&values) {
                black_box(value.to_f64().expect("to_f64"));
                black_box(value.to_bool().expect("to_bool"));
            }
        });
    });
}

fn bench_sparse_insert_lookup(c: &mut Criterion) {
    c.bench_function("sparse_insert_lookup_1000", |b| {
        b.iter(|| {
            let mut map: SparseMap<i32, u32> = SparseMap::new();
            for key in 0..1000i32 {
                map.insert(black_box(key), key as u32).expect("insert");
            }
            let mut hits = 0usize;
            for key in 0..1000i32 {
                if map.get(black_box(key)).is_some() {
                    hits += 1;
                }
            }
            black_box(hits);
        });
    });
}

fn bench_property_set_get(c: &mut Criterion) {
    let mut rt = Runtime::new();
    let unit = rt.alloc_object(ObjectKind::Instance).expect("instance");
    rt.pin(unit);
    rt.set(unit, "hp", &Value::int32(0)).expect("seed");

    c.bench_function("property_set_get", |b| {
        let mut tick = 0i32;
        b.iter(|| {
            tick = tick.wrapping_add(1);
            rt.set(unit, "hp", &Value::int32(black_box(tick))).expect("set");
            let back = rt.get(unit, "hp").expect("get").expect("present");
            black_box(back.to_i32().expect("to_i32"));
        });
    });
}

fn bench_string_churn(c: &mut Criterion) {
    let mut rt = Runtime::new();

    c.bench_function("string_churn", |b| {
        b.iter(|| {
            let text = rt.alloc_string(black_box("transient payload"));
            rt.release(text);
            black_box(rt.drain_pending());
        });
    });
}

fn bench_collect_live_graph(c: &mut Criterion) {
    let mut rt = build_graph(100);

    c.bench_function("collect_live_100", |b| {
        b.iter(|| {
            let stats = rt.collect();
            black_box(stats.marked);
        });
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_value_coercions, bench_sparse_insert_lookup,
        bench_property_set_get, bench_string_churn, bench_collect_live_graph
}

criterion_main!(benches);
