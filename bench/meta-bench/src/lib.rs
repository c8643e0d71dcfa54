mod bump;
mod churn;
mod reuse;

use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{Criterion, criterion_group, criterion_main};
use metaspace::perlude::*;

/// Block sizes in words.
const BLOCK_WORDS: &[usize] = &[2, 8, 12, 32, 128, 1 << 10, 4 << 10, 16 << 10];

/// Blocks allocated per domain before it is torn down.
const BATCH: usize = 1024;

type BenchFn = fn(&Arc<Metaspace>, usize, usize) -> Duration;

fn metaspace() -> Arc<Metaspace> {
    let conf = Config::default()
        .with_commit_granularity(64 << 10)
        .with_initial_capacity(256 << 20)
        .with_dictionary_threshold(0)
        .with_class_space_size(Some(256 << 20));
    Metaspace::with_config(conf).unwrap()
}

/// Touches the first and last word so the block is really backed.
#[inline]
fn touch(block: MetaBlock, words: usize) {
    unsafe {
        block.as_ptr().write(black_box(words));
        block.as_ptr().add(words - 1).write(black_box(words));
    }
}

#[cfg(feature = "tracing")]
fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn groups(c: &mut Criterion) {
    macro_rules! benches {
        ($($name:ident),* $(,)?) => ([$((stringify!($name), self::$name::bench as BenchFn),)*]);
    }

    #[cfg(feature = "tracing")]
    tracing_init();

    let ctx = metaspace();
    let mut g = c.benchmark_group("metaspace_benchmark");

    for (i, words) in BLOCK_WORDS.iter().copied().enumerate() {
        for (name, f) in benches![bump, reuse, churn] {
            let id = format!("metaspace_benchmark_{i:02}_{words}w_{name}");
            g.bench_function(&id, |b| b.iter_custom(|iters| f(&ctx, iters as usize, words)));
        }
    }
    g.finish();

    ctx.purge();
    ctx.verify();
}

criterion_group!(
    name = metaspace_benchmark;
    config = Criterion::default().sample_size(50).measurement_time(Duration::from_secs(10));
    targets = groups
);

criterion_main!(metaspace_benchmark);
