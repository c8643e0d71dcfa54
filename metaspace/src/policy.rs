use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::config::{Config, MetadataType};
use crate::numeric::{Alignable, bytes_to_words, checked_words_to_bytes, words_to_bytes};

/// First shrink factor, in percent, applied after one eligible cycle.
pub const SHRINK_FACTOR_INITIAL: u32 = 10;
pub const SHRINK_FACTOR_GROWTH: u32 = 4;
pub const SHRINK_FACTOR_MAX: u32 = 100;

/// Permission to commit more memory.
pub trait Expand {
    /// Whether committing `word_size` more words for `mdtype` stays within
    /// the hard limits.
    fn can_expand(&self, word_size: usize, mdtype: MetadataType) -> bool;
    /// Words that may still be committed below the high-water mark.
    fn allowed_expansion(&self) -> usize;
}

/// Outcome of a post-collection resize of the high-water mark.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resize {
    Expanded { by: usize, capacity: usize },
    Shrunk { by: usize, capacity: usize },
    Unchanged { capacity: usize },
}

/// The high-water mark `capacity_until_gc` and the rules that move it. All
/// sizes are in bytes.
pub struct CapacityPolicy {
    capacity_until_gc: CachePadded<AtomicUsize>,
    shrink_factor: AtomicU32,
    commit_granularity: usize,
    min_expansion: usize,
    max_expansion: usize,
    min_capacity: usize,
    max_capacity: usize,
    min_free_ratio: usize,
    max_free_ratio: usize,
    class_space_size: Option<usize>,
}

impl core::fmt::Debug for CapacityPolicy {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CapacityPolicy")
            .field("capacity_until_gc", &self.capacity_until_gc())
            .field("shrink_factor", &self.shrink_factor())
            .finish()
    }
}

/// `bytes * 100 / (100 - ratio)` without overflow, saturating at `usize::MAX`.
#[inline]
fn scale_by_free_ratio(bytes: usize, ratio: usize) -> usize {
    let used_pct = 100 - ratio as u128;
    let desired = bytes as u128 * 100 / used_pct;
    desired.min(usize::MAX as u128) as usize
}

impl CapacityPolicy {
    pub fn new(conf: &Config) -> Self {
        let initial = conf
            .initial_capacity
            .max(conf.min_capacity)
            .align_up(conf.commit_granularity)
            .min(conf.max_capacity);
        Self {
            capacity_until_gc: CachePadded::new(AtomicUsize::new(initial)),
            shrink_factor: AtomicU32::new(0),
            commit_granularity: conf.commit_granularity,
            min_expansion: conf.min_expansion,
            max_expansion: conf.max_expansion,
            min_capacity: conf.min_capacity,
            max_capacity: conf.max_capacity,
            min_free_ratio: conf.min_free_ratio,
            max_free_ratio: conf.max_free_ratio,
            class_space_size: conf.class_space_size,
        }
    }

    #[inline]
    pub fn capacity_until_gc(&self) -> usize {
        self.capacity_until_gc.load(Ordering::Acquire)
    }

    #[inline]
    pub fn shrink_factor(&self) -> u32 {
        self.shrink_factor.load(Ordering::Relaxed)
    }

    /// How far to raise the high-water mark so a `bytes` request fits and the
    /// next few do too. `None` when no such step is representable.
    pub fn delta_capacity_until_gc(&self, bytes: usize) -> Option<usize> {
        let delta = bytes.checked_next_multiple_of(self.commit_granularity)?;
        if delta <= self.min_expansion {
            Some(self.min_expansion)
        } else if delta <= self.max_expansion {
            Some(self.max_expansion)
        } else {
            delta.checked_add(self.min_expansion)
        }
    }

    /// Raises the high-water mark by `delta`, returning the new and previous
    /// values. Fails when the result would pass `max_capacity`.
    pub fn inc_capacity_until_gc(&self, delta: usize) -> Option<(usize, usize)> {
        let backoff = Backoff::new();
        let mut old = self.capacity_until_gc.load(Ordering::Acquire);
        loop {
            let new = old
                .checked_add(delta)
                .filter(|&new| new <= self.max_capacity)?;
            match self.capacity_until_gc.compare_exchange_weak(
                old,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("[Policy]: capacity until GC {} -> {}", old, new);
                    return Some((new, old));
                }
                Err(cur) => {
                    old = cur;
                    backoff.spin();
                }
            }
        }
    }

    /// Lowers the high-water mark by `delta`, returning the new value.
    pub fn dec_capacity_until_gc(&self, delta: usize) -> usize {
        match self
            .capacity_until_gc
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                cur.checked_sub(delta)
            }) {
            Ok(old) => old - delta,
            Err(cur) => panic!("capacity until GC underflow: {cur} - {delta}"),
        }
    }

    /// Recomputes the high-water mark after a collection from the bytes
    /// committed at that point. Expansion happens at once; shrinking is
    /// damped over consecutive eligible cycles.
    pub fn compute_new_size(&self, committed: usize) -> Resize {
        let factor = self.shrink_factor.swap(0, Ordering::Relaxed);
        let capacity = self.capacity_until_gc();

        let min_desired = scale_by_free_ratio(committed, self.min_free_ratio).max(self.min_capacity);
        if capacity < min_desired {
            let by = (min_desired - capacity)
                .checked_next_multiple_of(self.commit_granularity)
                .filter(|&by| by >= self.min_expansion);
            if let Some((by, (capacity, _))) =
                by.and_then(|by| Some((by, self.inc_capacity_until_gc(by)?)))
            {
                return Resize::Expanded { by, capacity };
            }
            return Resize::Unchanged {
                capacity: self.capacity_until_gc(),
            };
        }

        let mut shrink = 0;
        if self.max_free_ratio < 100 {
            let max_desired =
                scale_by_free_ratio(committed, self.max_free_ratio).max(self.min_capacity);
            if capacity > max_desired {
                shrink = ((capacity - max_desired) / 100 * factor as usize)
                    .align_down(self.commit_granularity);
                let next = match factor {
                    0 => SHRINK_FACTOR_INITIAL,
                    f => (f * SHRINK_FACTOR_GROWTH).min(SHRINK_FACTOR_MAX),
                };
                self.shrink_factor.store(next, Ordering::Relaxed);
            }
        }

        if shrink >= self.min_expansion && capacity - shrink >= self.min_capacity {
            let capacity = self.dec_capacity_until_gc(shrink);

            #[cfg(feature = "tracing")]
            tracing::debug!(
                "[Policy]: shrink capacity until GC by {} at factor {}%",
                shrink,
                factor
            );

            return Resize::Shrunk { by: shrink, capacity };
        }
        Resize::Unchanged { capacity }
    }

    /// Snapshot of the committed totals, in words, checked against this
    /// policy during one chunk request.
    pub fn gate(&self, committed_words: usize, class_committed_words: usize) -> Gate<'_> {
        Gate {
            policy: self,
            committed: words_to_bytes(committed_words),
            class_committed: words_to_bytes(class_committed_words),
        }
    }
}

pub struct Gate<'a> {
    policy: &'a CapacityPolicy,
    committed: usize,
    class_committed: usize,
}

impl Expand for Gate<'_> {
    fn can_expand(&self, word_size: usize, mdtype: MetadataType) -> bool {
        let Some(bytes) = checked_words_to_bytes(word_size) else {
            return false;
        };
        if mdtype.is_class() {
            if let Some(limit) = self.policy.class_space_size {
                if self.class_committed.saturating_add(bytes) > limit {
                    return false;
                }
            }
        }
        self.committed.saturating_add(bytes) <= self.policy.max_capacity
    }

    fn allowed_expansion(&self) -> usize {
        let limit = self.policy.capacity_until_gc().min(self.policy.max_capacity);
        bytes_to_words(limit.saturating_sub(self.committed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const K: usize = 1024;
    const M: usize = K * K;

    fn conf() -> Config {
        Config::default()
            .with_commit_granularity(4 * K)
            .with_min_expansion(256 * K)
            .with_max_expansion(4 * M)
            .with_initial_capacity(64 * M)
            .with_min_capacity(16 * M)
            .with_max_capacity(256 * M)
    }

    #[test]
    fn delta_bands() {
        let policy = CapacityPolicy::new(&conf());
        assert_eq!(policy.delta_capacity_until_gc(1), Some(256 * K));
        assert_eq!(policy.delta_capacity_until_gc(256 * K), Some(256 * K));
        assert_eq!(policy.delta_capacity_until_gc(256 * K + 1), Some(4 * M));
        assert_eq!(policy.delta_capacity_until_gc(4 * M), Some(4 * M));
        assert_eq!(
            policy.delta_capacity_until_gc(5 * M + 1),
            Some(5 * M + 4 * K + 256 * K)
        );
        assert_eq!(policy.delta_capacity_until_gc(usize::MAX), None);
        assert_eq!(policy.delta_capacity_until_gc(usize::MAX - 256 * K), None);
    }

    #[test]
    fn inc_is_capped() {
        let policy = CapacityPolicy::new(&conf());
        assert_eq!(policy.capacity_until_gc(), 64 * M);
        assert_eq!(policy.inc_capacity_until_gc(64 * M), Some((128 * M, 64 * M)));
        assert_eq!(policy.inc_capacity_until_gc(256 * M), None);
        assert_eq!(policy.capacity_until_gc(), 128 * M);
        assert_eq!(policy.dec_capacity_until_gc(64 * M), 64 * M);
    }

    #[test]
    fn concurrent_inc_loses_nothing() {
        let policy = CapacityPolicy::new(&conf());
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        assert!(policy.inc_capacity_until_gc(4 * K).is_some());
                    }
                });
            }
        });
        assert_eq!(policy.capacity_until_gc(), 64 * M + 400 * 4 * K);
    }

    #[test]
    fn shrink_is_damped() {
        let policy = CapacityPolicy::new(&conf());
        let committed = M;

        assert!(matches!(
            policy.compute_new_size(committed),
            Resize::Unchanged { .. }
        ));
        assert_eq!(policy.shrink_factor(), 10);

        let mut last = policy.capacity_until_gc();
        for factor in [40, 100, 100] {
            match policy.compute_new_size(committed) {
                Resize::Shrunk { capacity, .. } => assert!(capacity < last),
                other => panic!("expected a shrink, got {other:?}"),
            }
            assert_eq!(policy.shrink_factor(), factor);
            last = policy.capacity_until_gc();
        }
        assert!(last >= 16 * M);
    }

    #[test]
    fn expansion_resets_damping() {
        let policy = CapacityPolicy::new(&conf());
        policy.compute_new_size(M);
        policy.compute_new_size(M);
        assert_eq!(policy.shrink_factor(), 40);

        let before = policy.capacity_until_gc();
        match policy.compute_new_size(60 * M) {
            Resize::Expanded { capacity, by } => {
                assert_eq!(capacity, 100 * M);
                assert_eq!(by, 100 * M - before);
            }
            other => panic!("expected an expansion, got {other:?}"),
        }
        assert_eq!(policy.shrink_factor(), 0);
    }

    #[test]
    fn never_shrinks_below_min_capacity() {
        let policy = CapacityPolicy::new(&conf());
        for _ in 0..16 {
            policy.compute_new_size(0);
            assert!(policy.capacity_until_gc() >= 16 * M);
        }
        assert!(policy.capacity_until_gc() < 16 * M + 256 * K);
    }

    #[test]
    fn gate_limits() {
        let conf = conf().with_class_space_size(Some(8 * M));
        let policy = CapacityPolicy::new(&conf);
        let gate = policy.gate(bytes_to_words(60 * M), bytes_to_words(7 * M));
        assert_eq!(gate.allowed_expansion(), bytes_to_words(4 * M));
        assert!(gate.can_expand(bytes_to_words(M), MetadataType::Class));
        assert!(!gate.can_expand(bytes_to_words(2 * M), MetadataType::Class));
        assert!(gate.can_expand(bytes_to_words(2 * M), MetadataType::NonClass));
        assert!(!gate.can_expand(bytes_to_words(200 * M), MetadataType::NonClass));
        assert!(!gate.can_expand(usize::MAX / 4, MetadataType::NonClass));
        assert!(!gate.can_expand(usize::MAX, MetadataType::Class));
    }
}
