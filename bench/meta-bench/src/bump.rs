use super::*;

/// Fresh allocations, bump pointer and chunk growth only.
pub fn bench(ctx: &Arc<Metaspace>, iters: usize, words: usize) -> Duration {
    let mut elapsed = Duration::ZERO;
    let mut left = iters;
    while left > 0 {
        let n = left.min(BATCH);
        let domain = Domain::new(ctx, DomainKind::Standard);
        let start = Instant::now();
        for _ in 0..n {
            let block = domain.allocate(words, MetadataType::NonClass).unwrap();
            touch(block, words);
        }
        elapsed += start.elapsed();
        left -= n;
    }
    elapsed
}
