#![cfg(all(unix, feature = "unix"))]

use std::sync::{Arc, Barrier};
use std::thread;

use crossbeam_queue::SegQueue;

use crate::block::MetaBlock;
use crate::config::{Config, MetadataType};
use crate::context::Metaspace;
use crate::domain::{Domain, DomainKind};
use crate::policy::Resize;
use crate::tests::{fill_and_check, prob, scenario_config, small_block_scenario, tracing_init};

const THREADS: usize = 4;
const ROUNDS: usize = 2000;

fn anon_metaspace(conf: Config) -> Arc<Metaspace> {
    Metaspace::with_config(conf).expect("should map the initial regions")
}

fn random_request() -> (usize, MetadataType) {
    let words = if prob(0.02) {
        fastrand::usize(1000..10_000)
    } else {
        fastrand::usize(1..64)
    };
    let mdtype = if prob(0.25) {
        MetadataType::Class
    } else {
        MetadataType::NonClass
    };
    (words, mdtype)
}

#[test]
fn small_blocks_on_anonymous_mappings() {
    tracing_init();
    let ctx = anon_metaspace(scenario_config());
    small_block_scenario(&ctx);
}

#[test]
fn freed_memory_comes_back_zeroed() {
    let ctx = anon_metaspace(scenario_config());
    let domain = Domain::new(&ctx, DomainKind::Standard);
    let block = domain.allocate(32, MetadataType::NonClass).unwrap();
    fill_and_check(block, 32);
    domain.deallocate(block, 32, MetadataType::NonClass);
    let again = domain.allocate(32, MetadataType::NonClass).unwrap();
    assert_eq!(again, block);
    fill_and_check(again, 32);
}

#[test]
fn humongous_blocks_span_regions() {
    tracing_init();
    let conf = scenario_config().with_region_words(16 * 1024);
    let ctx = anon_metaspace(conf);
    let domain = Domain::new(&ctx, DomainKind::Standard);

    let big = domain.allocate(40_000, MetadataType::NonClass).unwrap();
    fill_and_check(big, 40_000);
    let small = domain.allocate(8, MetadataType::NonClass).unwrap();
    fill_and_check(small, 8);

    let stats = domain.stats();
    assert_eq!(stats.non_class.chunk_count[3], 1);
    assert!(ctx.stats().non_class.region_count >= 2);
    domain.verify();
    ctx.verify();
}

#[test]
fn domains_allocate_concurrently() {
    tracing_init();
    let ctx = anon_metaspace(Config::default().with_class_space_size(Some(4 << 20)));
    let domains: Vec<_> = (0..THREADS)
        .map(|_| Domain::new(&ctx, DomainKind::Standard))
        .collect();
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for domain in &domains {
            let barrier = &barrier;
            s.spawn(move || {
                let mut live = Vec::new();
                barrier.wait();
                for _ in 0..ROUNDS {
                    let (words, mdtype) = random_request();
                    let Ok(block) = domain.allocate(words, mdtype) else {
                        continue;
                    };
                    fill_and_check(block, words);
                    live.push((block, words, mdtype));
                    if prob(0.4) {
                        let (block, words, mdtype) = live.swap_remove(fastrand::usize(..live.len()));
                        domain.deallocate(block, words, mdtype);
                    }
                }
                domain.verify();
            });
        }
    });
    ctx.verify();

    let in_use = ctx.stats().non_class.in_use_chunk_count;
    assert!(in_use >= THREADS);
    drop(domains);
    let stats = ctx.stats();
    assert_eq!(stats.non_class.in_use_chunk_count, 0);
    assert_eq!(stats.class.unwrap().in_use_chunk_count, 0);
    ctx.verify();
}

#[test]
fn blocks_freed_from_other_threads() {
    let ctx = anon_metaspace(Config::default().with_class_space_size(Some(4 << 20)));
    let domain = Domain::new(&ctx, DomainKind::Standard);
    let queue: SegQueue<(MetaBlock, usize, MetadataType)> = SegQueue::new();
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for t in 0..THREADS {
            let (domain, queue, barrier) = (&domain, &queue, &barrier);
            s.spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS {
                    // even threads produce, odd threads free what others produced
                    if t % 2 == 0 {
                        let (words, mdtype) = random_request();
                        if let Ok(block) = domain.allocate(words, mdtype) {
                            fill_and_check(block, words);
                            queue.push((block, words, mdtype));
                        }
                    } else if let Some((block, words, mdtype)) = queue.pop() {
                        domain.deallocate(block, words, mdtype);
                    }
                }
            });
        }
    });
    while let Some((block, words, mdtype)) = queue.pop() {
        domain.deallocate(block, words, mdtype);
    }

    domain.verify();
    ctx.verify();
    let stats = domain.stats();
    assert_eq!(stats.non_class.live_words(), 0);
    assert_eq!(stats.class.unwrap().live_words(), 0);
}

#[test]
fn unloading_then_purging() {
    tracing_init();
    let conf = Config::default()
        .with_region_words(16 * 1024)
        .with_class_space_size(Some(1 << 20));
    let ctx = anon_metaspace(conf);

    let survivor = Domain::new(&ctx, DomainKind::Standard);
    let keep = survivor.allocate(100, MetadataType::NonClass).unwrap();
    for _ in 0..4 {
        let domains: Vec<_> = (0..8)
            .map(|_| Domain::new(&ctx, DomainKind::Anonymous))
            .collect();
        for domain in &domains {
            for _ in 0..20 {
                let (words, mdtype) = random_request();
                let _ = domain.allocate(words, mdtype);
            }
        }
        ctx.verify();
        let regions = ctx.stats().non_class.region_count;
        drop(domains);
        let purged = ctx.purge();
        assert!(purged < regions);
        assert_eq!(ctx.stats().non_class.region_count, regions - purged);
        ctx.verify();
    }

    assert!(ctx.contains(keep.as_ptr()));
    assert!(survivor.contains(keep.as_ptr()));
    fill_and_check(keep, 100);
    let owned: usize = survivor.stats().non_class.chunk_count.iter().sum();
    assert_eq!(ctx.stats().non_class.in_use_chunk_count, owned);
}

#[test]
fn cycle_notifications_move_capacity() {
    let conf = Config::default().with_min_capacity(1 << 20).with_initial_capacity(8 << 20);
    let ctx = anon_metaspace(conf);
    let domain = Domain::new(&ctx, DomainKind::Standard);
    let before = ctx.capacity_until_gc();

    // little committed against a large mark: shrinks, damped
    let first = ctx.notify_cycle_complete(ctx.committed_bytes());
    assert!(matches!(first, Resize::Unchanged { .. }), "{first:?}");
    let second = ctx.notify_cycle_complete(ctx.committed_bytes());
    assert!(matches!(second, Resize::Shrunk { .. }), "{second:?}");
    assert!(ctx.capacity_until_gc() < before);
    assert_eq!(ctx.stats().shrink_factor, 40);

    // fill past the mark's comfort zone: expands at once
    while ctx.committed_bytes() * 100 / ctx.capacity_until_gc() < 80 {
        if domain.allocate(4000, MetadataType::NonClass).is_err() {
            break;
        }
    }
    let grown = ctx.notify_cycle_complete(ctx.committed_bytes());
    assert!(matches!(grown, Resize::Expanded { .. }), "{grown:?}");
    assert_eq!(ctx.stats().shrink_factor, 0);
}
