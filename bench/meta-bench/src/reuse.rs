use super::*;

/// Allocation served from the block free list after a free.
pub fn bench(ctx: &Arc<Metaspace>, iters: usize, words: usize) -> Duration {
    let domain = Domain::new(ctx, DomainKind::Standard);
    let mut blocks: Vec<_> = (0..BATCH)
        .map(|_| domain.allocate(words, MetadataType::NonClass).unwrap())
        .collect();

    let start = Instant::now();
    for _ in 0..iters {
        let idx = fastrand::usize(..blocks.len());
        domain.deallocate(blocks[idx], words, MetadataType::NonClass);
        blocks[idx] = domain.allocate(words, MetadataType::NonClass).unwrap();
        touch(blocks[idx], words);
    }
    start.elapsed()
}
