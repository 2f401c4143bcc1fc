//! Benchmarks for the conversion hot path.
//!
//! Covers primitives, nested containers, opaque values, invocable calls in
//! both directions and the string atom cache.
//!
//! ## Profiling with Puffin
//!
//! ```bash
//! cargo bench --features profile-with-puffin -- --profile-time 5
//! ```

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use variant_bridge::{AtomCache, push_host_value, to_callable, to_host_value};
use variant_bridge_core::{Array, Callable, CallableFn, Dictionary, Variant, Vector2};
use variant_bridge_vm::{Thread, Vm};

#[cfg(feature = "profile-with-puffin")]
static FRAME_VIEW: std::sync::OnceLock<puffin::GlobalFrameView> = std::sync::OnceLock::new();

#[cfg(feature = "profile-with-puffin")]
fn setup_profiler() {
    puffin::set_scopes_on(true);
    FRAME_VIEW.get_or_init(puffin::GlobalFrameView::default);
}

#[cfg(not(feature = "profile-with-puffin"))]
fn setup_profiler() {}

#[cfg(feature = "profile-with-puffin")]
fn end_profiling_frame() {
    puffin::GlobalProfiler::lock().new_frame();
}

#[cfg(not(feature = "profile-with-puffin"))]
fn end_profiling_frame() {}

fn sequence(len: usize) -> Variant {
    let items: Vec<Variant> = (0..len as i64).map(Variant::Int).collect();
    Variant::from(items)
}

fn record(fields: usize) -> Variant {
    let mut map = Dictionary::new();
    for i in 0..fields {
        map.insert(format!("field_{}", i), i as i64);
    }
    Variant::from(map)
}

fn nested(depth: usize) -> Variant {
    let mut value = Variant::from("leaf");
    for _ in 0..depth {
        value = Variant::from(Array::from(vec![value.clone(), value]));
    }
    value
}

fn round_trip(vm: &Vm, value: &Variant) -> Variant {
    push_host_value(vm, value).unwrap();
    let back = to_host_value(vm, -1);
    vm.pop(1);
    back
}

fn bench_primitives(c: &mut Criterion) {
    let vm = Vm::new();
    let mut group = c.benchmark_group("primitives");
    for (name, value) in [
        ("int", Variant::Int(42)),
        ("float", Variant::Float(1.25)),
        ("string", Variant::from("a moderately sized string value")),
        ("opaque", Variant::Vector2(Vector2::new(1.0, 2.0))),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                black_box(round_trip(&vm, black_box(&value)));
                end_profiling_frame();
            })
        });
    }
    group.finish();
}

fn bench_containers(c: &mut Criterion) {
    let vm = Vm::new();
    let mut group = c.benchmark_group("containers");
    for len in [8, 64, 512] {
        let value = sequence(len);
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("sequence", len), &value, |b, value| {
            b.iter(|| black_box(round_trip(&vm, value)))
        });
        let value = record(len);
        group.bench_with_input(BenchmarkId::new("map", len), &value, |b, value| {
            b.iter(|| black_box(round_trip(&vm, value)))
        });
    }
    let value = nested(8);
    group.bench_function("nested_depth_8", |b| b.iter(|| black_box(round_trip(&vm, &value))));
    group.finish();
}

fn bench_calls(c: &mut Criterion) {
    let vm = Vm::new();
    let mut group = c.benchmark_group("calls");

    vm.push_function("add", |t: &Thread| {
        let sum = t.check_number(1)? + t.check_number(2)?;
        t.push_number(sum);
        Ok(1)
    });
    let add = to_callable(&vm, -1).unwrap();
    vm.pop(1);
    let args = [Variant::Int(1), Variant::Int(2)];
    group.bench_function("host_to_vm", |b| b.iter(|| black_box(add.call(black_box(&args)))));

    let answer = Callable::from_custom(CallableFn::new("answer", |_: &[Variant]| Ok(Variant::Int(42))));
    push_host_value(&vm, &Variant::Callable(answer)).unwrap();
    group.bench_function("vm_to_host", |b| {
        b.iter(|| {
            vm.push_value(-1);
            vm.call(0, 1).unwrap();
            black_box(vm.to_number(-1));
            vm.pop(1);
        })
    });
    group.finish();
}

fn bench_atoms(c: &mut Criterion) {
    let names: Vec<String> = (0..1024).map(|i| format!("property_{}", i)).collect();
    c.bench_function("atom_cache/create_1024", |b| {
        b.iter(|| {
            let cache = AtomCache::with_capacity(4096);
            for name in &names {
                black_box(cache.create_atom(name.as_bytes()));
            }
        })
    });
}

fn benches(c: &mut Criterion) {
    setup_profiler();
    variant_bridge::initialize();
    bench_primitives(c);
    bench_containers(c);
    bench_calls(c);
    bench_atoms(c);
}

criterion_group!(conversion, benches);
criterion_main!(conversion);
