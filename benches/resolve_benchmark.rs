//! Performance benchmarks for ServeTune
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use servetune::resolver::{
    wheel, InMemoryRegistry, InterpreterResolver, Marker, MarkerEnv, ResolveRequest, ResolverOptions,
    WheelTags,
};
use servetune::system::{Architecture, FeatureSet, HardwareProfile};
use servetune::tuner::{Overrides, Tuner};

/// Wheel filenames for `minors` on both Linux architectures
fn wheel_files(name: &str, version: &str, minors: std::ops::RangeInclusive<u32>) -> Vec<String> {
    minors
        .flat_map(|m| {
            ["manylinux_2_28_x86_64", "manylinux_2_28_aarch64"]
                .into_iter()
                .map(move |plat| format!("{}-{}-cp3{m}-cp3{m}-{}.whl", name, version, plat, m = m))
        })
        .collect()
}

/// Registry with a target release and `deps` dependencies, the last of which
/// only publishes for 3.10 so verification walks several versions
fn registry(deps: usize) -> InMemoryRegistry {
    let mut requires: Vec<String> = (0..deps).map(|i| format!("dep{}==1.{}", i, i)).collect();
    requires.push("torch==2.8.0; platform_machine == 'x86_64' or platform_machine == 'aarch64'".to_string());
    requires.push("pytest==8.0; extra == 'test'".to_string());

    let mut registry = InMemoryRegistry::new()
        .with_release("pkg", "1.0.0", wheel_files("pkg", "1.0.0", 9..=13))
        .with_requires_dist("pkg", "1.0.0", requires)
        .with_release("torch", "2.8.0", wheel_files("torch", "2.8.0", 9..=13));

    for i in 0..deps {
        let version = format!("1.{}", i);
        let files = if i + 1 == deps {
            wheel_files(&format!("dep{}", i), &version, 10..=10)
        } else {
            vec![format!("dep{}-{}-py3-none-any.whl", i, version)]
        };
        registry = registry.with_release(&format!("dep{}", i), &version, files);
    }
    registry
}

fn bench_wheel_parsing(c: &mut Criterion) {
    let files = wheel_files("numpy", "2.1.0", 9..=13);

    let mut group = c.benchmark_group("wheel_tags");
    group.throughput(Throughput::Elements(files.len() as u64));

    group.bench_function("parse", |b| {
        b.iter(|| {
            for file in &files {
                black_box(WheelTags::parse(file));
            }
        });
    });

    group.bench_function("highest_minor", |b| {
        b.iter(|| black_box(wheel::highest_minor(files.iter().map(String::as_str), Architecture::X86_64)));
    });

    group.finish();
}

fn bench_marker_evaluation(c: &mut Criterion) {
    let marker = Marker::parse(
        "(platform_machine == 'x86_64' or platform_machine == 'arm64') and python_version >= '3.10' and sys_platform == 'linux'",
    )
    .unwrap();
    let env = MarkerEnv {
        arch: Architecture::Aarch64,
        python_minor: Some(12),
    };

    c.bench_function("marker_evaluate", |b| b.iter(|| black_box(marker.evaluate(&env))));
}

fn bench_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_in_memory");

    for deps in [5, 50, 200].iter() {
        let registry = registry(*deps);
        let request = ResolveRequest::new("pkg", "1.0.0", Architecture::X86_64);

        group.bench_with_input(BenchmarkId::from_parameter(deps), deps, |b, _| {
            b.iter(|| {
                let resolver =
                    InterpreterResolver::new(&registry, &registry, &registry, ResolverOptions::default());
                black_box(resolver.resolve(&request).unwrap())
            });
        });
    }

    group.finish();
}

fn bench_tuning(c: &mut Criterion) {
    let profile = HardwareProfile {
        physical_cores: 56,
        logical_cores: 112,
        available_memory_gib: 480,
        total_memory_gib: 512,
        numa_nodes: 2,
        numa_accessible: true,
        features: FeatureSet::from_flags(["avx512f", "avx512_vnni", "avx512_bf16", "amx_bf16"]),
        architecture: Architecture::X86_64,
        cpu_model: "Benchmark CPU".to_string(),
    };
    let overrides = Overrides::from_pairs([("VLLM_CPU_KVCACHE_SPACE", "40")]);

    c.bench_function("tune_decision", |b| {
        b.iter(|| {
            black_box(
                Tuner::new(&profile, &overrides)
                    .with_allocator_probe(|_| true)
                    .resolve(),
            )
        });
    });
}

criterion_group!(
    benches,
    bench_wheel_parsing,
    bench_marker_evaluation,
    bench_resolution,
    bench_tuning,
);

criterion_main!(benches);
