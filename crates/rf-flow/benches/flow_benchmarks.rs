//! Flow stack benchmarks

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rf_flow::{ChunkConfig, ChunkedInferenceController, FlowConfig, FlowStack, SubnetConfig};

fn bench_stack() -> FlowStack {
    let config = FlowConfig {
        subnet: SubnetConfig {
            depth: 4,
            width: 32,
            ..SubnetConfig::default()
        },
        ..FlowConfig::default()
    };
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    FlowStack::new(config, &mut rng).expect("valid benchmark config")
}

fn signal(samples: usize, phase: f32) -> Array2<f32> {
    Array2::from_shape_fn((1, samples), |(_, i)| (i as f32 * 0.013 + phase).sin() * 0.5)
}

fn bench_forward(c: &mut Criterion) {
    let stack = bench_stack();
    let cond = signal(4096, 0.0);
    let x = signal(4096, 1.0);

    c.bench_function("flow_forward_4096", |b| {
        b.iter(|| stack.forward(black_box(cond.view()), black_box(x.view())))
    });
}

fn bench_inverse(c: &mut Criterion) {
    let stack = bench_stack();
    let cond = signal(4096, 0.0);
    let z = signal(4096, 2.0);

    c.bench_function("flow_inverse_4096", |b| {
        b.iter(|| stack.inverse(black_box(cond.view()), black_box(z.view())))
    });
}

fn bench_chunked(c: &mut Criterion) {
    let stack = bench_stack();
    let cond = signal(32_000, 0.0);
    let z = signal(32_000, 2.0);

    let sequential = ChunkedInferenceController::new(
        ChunkConfig {
            chunk_size: 8_000,
            context_margin: 2_000,
            parallel: false,
        },
        stack.group_size(),
    )
    .expect("valid chunking");
    let parallel = ChunkedInferenceController::new(
        ChunkConfig {
            chunk_size: 8_000,
            context_margin: 2_000,
            parallel: true,
        },
        stack.group_size(),
    )
    .expect("valid chunking");

    c.bench_function("chunked_inverse_32000_sequential", |b| {
        b.iter(|| sequential.generate(&stack, black_box(cond.view()), black_box(z.view())))
    });
    c.bench_function("chunked_inverse_32000_parallel", |b| {
        b.iter(|| parallel.generate(&stack, black_box(cond.view()), black_box(z.view())))
    });
}

criterion_group!(benches, bench_forward, bench_inverse, bench_chunked);
criterion_main!(benches);
