//! Replacement-policy tables and victim selection.
//!
//! Three global tables charge every resident page to the policy of its
//! file: a last-use-ordered set for `KEEP`, the same shape for `LRU`, and
//! an insertion-ordered list for `FIFO`. Victim selection follows a fixed
//! fallback chain per policy; the final coin flip between the two oldest
//! candidates keeps pathological access patterns from deterministically
//! evicting the page that was just loaded.
//!
//! Failing to find a victim means the working set exceeds the cache and is
//! fatal.

use fcache_types::{CachePolicy, PageId};
use rand::Rng;
use rand::rngs::SmallRng;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{error, trace};

/// Set of pages ordered by last use (oldest first).
#[derive(Debug, Default)]
pub(crate) struct AgedSet {
    by_age: BTreeSet<(u64, PageId)>,
    key: HashMap<PageId, u64>,
}

impl AgedSet {
    fn insert(&mut self, page: PageId, tick: u64) {
        if let Some(prev) = self.key.insert(page, tick) {
            let _ = self.by_age.remove(&(prev, page));
        }
        self.by_age.insert((tick, page));
    }

    fn remove(&mut self, page: PageId) -> bool {
        let Some(tick) = self.key.remove(&page) else {
            return false;
        };
        let _ = self.by_age.remove(&(tick, page));
        true
    }

    fn len(&self) -> usize {
        self.by_age.len()
    }

    /// Oldest entry as `(last_use, page)`.
    fn oldest(&self) -> Option<(u64, PageId)> {
        self.by_age.iter().next().copied()
    }

    /// One of the two oldest pages, chosen by `flip` when both exist.
    fn one_of_two_oldest(&self, flip: bool) -> Option<PageId> {
        let mut iter = self.by_age.iter();
        let first = iter.next().map(|(_, page)| *page)?;
        let second = iter.next().map(|(_, page)| *page);
        match second {
            Some(second) if flip => Some(second),
            _ => Some(first),
        }
    }
}

/// Insertion-ordered page list; newest at the front, oldest at the back.
#[derive(Debug, Default)]
pub(crate) struct FifoList {
    deque: VecDeque<PageId>,
}

impl FifoList {
    fn push_front(&mut self, page: PageId) {
        self.deque.push_front(page);
    }

    fn remove(&mut self, page: PageId) -> bool {
        if let Some(pos) = self.deque.iter().position(|p| *p == page) {
            let _ = self.deque.remove(pos);
            return true;
        }
        false
    }

    fn pop_back(&mut self) -> Option<PageId> {
        self.deque.pop_back()
    }

    fn len(&self) -> usize {
        self.deque.len()
    }
}

/// The three per-policy tables plus the tie-break RNG.
#[derive(Debug)]
pub(crate) struct PolicyTables {
    keep: AgedSet,
    lru: AgedSet,
    fifo: FifoList,
    keep_threshold: usize,
    lru_threshold: usize,
    fifo_threshold: usize,
    rng: SmallRng,
}

impl PolicyTables {
    pub(crate) fn new(
        keep_threshold: usize,
        lru_threshold: usize,
        fifo_threshold: usize,
        rng: SmallRng,
    ) -> Self {
        Self {
            keep: AgedSet::default(),
            lru: AgedSet::default(),
            fifo: FifoList::default(),
            keep_threshold,
            lru_threshold,
            fifo_threshold,
            rng,
        }
    }

    /// Charge `page` to `policy`.
    pub(crate) fn insert(&mut self, policy: CachePolicy, page: PageId, tick: u64) {
        match policy {
            CachePolicy::Keep => self.keep.insert(page, tick),
            CachePolicy::Lru => self.lru.insert(page, tick),
            CachePolicy::Fifo => self.fifo.push_front(page),
        }
    }

    /// Remove `page` from whichever table holds it. Idempotent.
    pub(crate) fn remove(&mut self, page: PageId) {
        let _ = self.keep.remove(page) || self.lru.remove(page) || self.fifo.remove(page);
    }

    /// Record a hit on `page`.
    ///
    /// `KEEP` and `LRU` re-key the page by the current tick; `FIFO` keeps
    /// its insertion order.
    pub(crate) fn touch(&mut self, policy: CachePolicy, page: PageId, tick: u64) {
        match policy {
            CachePolicy::Keep => self.keep.insert(page, tick),
            CachePolicy::Lru => self.lru.insert(page, tick),
            CachePolicy::Fifo => {}
        }
    }

    /// Pick and remove a victim page on behalf of a file using `policy`.
    ///
    /// Panics when no table can yield one; the cache is then misconfigured
    /// for the current working set.
    pub(crate) fn evict(&mut self, policy: CachePolicy, tick: u64) -> PageId {
        let victim = match policy {
            CachePolicy::Keep => self.evict_keep(tick),
            CachePolicy::Lru => self.evict_lru(tick),
            CachePolicy::Fifo => self.evict_fifo(tick),
        };
        match victim {
            Some(page) => {
                trace!(event = "victim_selected", policy = %policy, page = %page);
                page
            }
            None => {
                error!(
                    event = "eviction_starved",
                    policy = %policy,
                    keep_len = self.keep.len(),
                    lru_len = self.lru.len(),
                    fifo_len = self.fifo.len()
                );
                panic!("no policy table can yield an eviction victim; working set exceeds the cache");
            }
        }
    }

    fn lru_oldest_is_aged(&self, tick: u64) -> bool {
        self.lru
            .oldest()
            .is_some_and(|(last_use, _)| tick.saturating_sub(last_use) > self.lru_threshold as u64)
    }

    fn take_aged_lru(&mut self, tick: u64) -> Option<PageId> {
        if self.lru.len() > self.lru_threshold && self.lru_oldest_is_aged(tick) {
            let flip = self.rng.random::<bool>();
            let page = self.lru.one_of_two_oldest(flip)?;
            self.lru.remove(page);
            return Some(page);
        }
        None
    }

    fn take_fifo_tail(&mut self, min_len: usize) -> Option<PageId> {
        if self.fifo.len() > min_len {
            return self.fifo.pop_back();
        }
        None
    }

    fn evict_keep(&mut self, tick: u64) -> Option<PageId> {
        if let Some(page) = self.take_fifo_tail(self.fifo_threshold) {
            return Some(page);
        }
        if let Some(page) = self.take_aged_lru(tick) {
            return Some(page);
        }
        if self.keep.len() > self.keep_threshold / 2 {
            let flip = self.rng.random::<bool>();
            let page = self.keep.one_of_two_oldest(flip)?;
            self.keep.remove(page);
            return Some(page);
        }
        None
    }

    fn evict_lru(&mut self, tick: u64) -> Option<PageId> {
        if let Some(page) = self.take_aged_lru(tick) {
            return Some(page);
        }
        if let Some(page) = self.take_fifo_tail(self.fifo_threshold) {
            return Some(page);
        }
        if self.lru.len() > 2 {
            let (_, page) = self.lru.oldest()?;
            self.lru.remove(page);
            return Some(page);
        }
        None
    }

    fn evict_fifo(&mut self, tick: u64) -> Option<PageId> {
        if let Some(page) = self.take_fifo_tail(self.fifo_threshold) {
            return Some(page);
        }
        if let Some(page) = self.take_aged_lru(tick) {
            return Some(page);
        }
        self.take_fifo_tail(self.fifo_threshold / 2)
    }

    pub(crate) fn lens(&self) -> (usize, usize, usize) {
        (self.keep.len(), self.lru.len(), self.fifo.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcache_types::Handle;
    use rand::SeedableRng;

    fn tables() -> PolicyTables {
        PolicyTables::new(8, 8, 8, SmallRng::seed_from_u64(7))
    }

    fn page(n: u64) -> PageId {
        PageId::new(Handle(1), n * 4096)
    }

    #[test]
    fn aged_set_orders_by_last_use() {
        let mut set = AgedSet::default();
        set.insert(page(1), 10);
        set.insert(page(2), 5);
        set.insert(page(3), 20);
        assert_eq!(set.oldest(), Some((5, page(2))));

        // Re-inserting with a newer tick re-keys the page.
        set.insert(page(2), 30);
        assert_eq!(set.oldest(), Some((10, page(1))));
    }

    #[test]
    fn fifo_evicts_tail_above_threshold() {
        let mut tables = tables();
        for n in 0..9 {
            tables.insert(CachePolicy::Fifo, page(n), n);
        }
        // Newest is pushed at the front, so the tail is page 0.
        let victim = tables.evict(CachePolicy::Fifo, 9);
        assert_eq!(victim, page(0));
    }

    #[test]
    fn fifo_touch_does_not_reorder() {
        let mut tables = tables();
        for n in 0..9 {
            tables.insert(CachePolicy::Fifo, page(n), n);
        }
        tables.touch(CachePolicy::Fifo, page(0), 100);
        assert_eq!(tables.evict(CachePolicy::Fifo, 101), page(0));
    }

    #[test]
    fn lru_prefers_aged_oldest() {
        let mut tables = tables();
        for n in 0..9 {
            tables.insert(CachePolicy::Lru, page(n), n);
        }
        // tick 100 makes every page aged; victim is one of the two oldest.
        let victim = tables.evict(CachePolicy::Lru, 100);
        assert!(victim == page(0) || victim == page(1));
    }

    #[test]
    fn lru_falls_back_to_oldest_when_not_aged() {
        let mut tables = tables();
        for n in 0..9 {
            tables.insert(CachePolicy::Lru, page(n), 100 + n);
        }
        // Ages are all below the threshold and FIFO is empty.
        let victim = tables.evict(CachePolicy::Lru, 105);
        assert_eq!(victim, page(0));
    }

    #[test]
    fn lru_touch_protects_a_page() {
        let mut tables = tables();
        for n in 0..9 {
            tables.insert(CachePolicy::Lru, page(n), n);
        }
        tables.touch(CachePolicy::Lru, page(0), 50);
        let victim = tables.evict(CachePolicy::Lru, 100);
        assert_ne!(victim, page(0));
    }

    #[test]
    fn keep_steals_from_fifo_first() {
        let mut tables = tables();
        for n in 0..4 {
            tables.insert(CachePolicy::Keep, page(n), n);
        }
        for n in 10..19 {
            tables.insert(CachePolicy::Fifo, page(n), n);
        }
        let victim = tables.evict(CachePolicy::Keep, 20);
        assert_eq!(victim, page(10));
    }

    #[test]
    fn keep_evicts_own_pages_above_half_threshold() {
        let mut tables = tables();
        for n in 0..5 {
            tables.insert(CachePolicy::Keep, page(n), n);
        }
        let victim = tables.evict(CachePolicy::Keep, 6);
        assert!(victim == page(0) || victim == page(1));
    }

    #[test]
    #[should_panic(expected = "working set exceeds the cache")]
    fn starved_eviction_is_fatal() {
        let mut tables = tables();
        tables.insert(CachePolicy::Keep, page(0), 0);
        let _ = tables.evict(CachePolicy::Keep, 1);
    }

    #[test]
    fn remove_is_idempotent_across_tables() {
        let mut tables = tables();
        tables.insert(CachePolicy::Lru, page(1), 1);
        tables.remove(page(1));
        tables.remove(page(1));
        assert_eq!(tables.lens(), (0, 0, 0));
    }
}
