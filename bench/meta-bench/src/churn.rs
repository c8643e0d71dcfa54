use super::*;

/// Short-lived domains: initial chunk, a few blocks, teardown.
pub fn bench(ctx: &Arc<Metaspace>, iters: usize, words: usize) -> Duration {
    let start = Instant::now();
    for _ in 0..iters {
        let domain = Domain::new(ctx, DomainKind::Anonymous);
        for mdtype in MetadataType::ALL {
            let block = domain.allocate(words, mdtype).unwrap();
            touch(block, words);
        }
        black_box(domain).destroy();
    }
    start.elapsed()
}
