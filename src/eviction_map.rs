//! An ordered key→value map with weight-bounded, recency-driven garbage
//! collection.

use std::{cmp::Ordering, future::Future, hash::Hash};

use indexmap::IndexMap;

use crate::{clock::Bytes, error::Result};

/// An insertion-ordered mapping augmented with a weight-bounded `gc` pass.
///
/// Insertion order is preserved (via [`indexmap::IndexMap`]) so that
/// `gc`'s stable sort resolves sort-key ties by "whichever was encountered
/// first", exactly as the source requires.
#[derive(Debug)]
pub struct EvictionMap<K, V> {
    entries: IndexMap<K, V>,
}

impl<K, V> Default for EvictionMap<K, V> {
    fn default() -> Self {
        EvictionMap { entries: IndexMap::new() }
    }
}

impl<K: Eq + Hash + Clone, V> EvictionMap<K, V> {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value by key.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Insert or replace a value, returning the previous one if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    /// Remove a value by key, returning it if present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.shift_remove(key)
    }

    /// Look up a value by key, for in-place mutation.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum `weigher(v)` over every value, concurrently.
    pub async fn weight<W, Fut>(&self, weigher: W) -> Result<Bytes>
    where
        W: Fn(&V) -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        let futures = self.entries.values().map(&weigher);
        let weights = futures::future::try_join_all(futures).await?;
        Ok(weights.into_iter().sum())
    }

    /// Retain values greedily in descending order of `sort_key` while their
    /// cumulative weight stays within `limit`; delete everything else.
    ///
    /// The walk does not stop at the first entry that would overflow the
    /// budget — it skips that entry and keeps checking the rest, any of
    /// which may still individually fit. A weight of [`Bytes::INFINITE`]
    /// always causes the entry to be dropped. If any weigher call fails,
    /// the error propagates and the map is left completely unmodified.
    pub async fn gc<S, SK, W, Fut, C>(
        &mut self,
        limit: Bytes,
        sort_key: S,
        weigher: W,
        compare: C,
    ) -> Result<Bytes>
    where
        S: Fn(&V) -> SK,
        W: Fn(&V) -> Fut,
        Fut: Future<Output = Result<Bytes>>,
        C: Fn(&SK, &SK) -> Ordering,
    {
        let weight_futures = self.entries.values().map(&weigher);
        let weights = futures::future::try_join_all(weight_futures).await?;
        let sort_keys: Vec<SK> =
            self.entries.values().map(&sort_key).collect();

        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        // Descending by sort key; Vec::sort_by is stable, so ties keep
        // their original (insertion) relative order.
        order.sort_by(|&a, &b| compare(&sort_keys[b], &sort_keys[a]));

        let mut keep = vec![false; self.entries.len()];
        let mut cumulative = Bytes::ZERO;
        for index in order {
            let w = weights[index];
            if w.is_infinite() {
                continue;
            }
            let candidate = cumulative.saturating_add(w);
            if candidate <= limit {
                cumulative = candidate;
                keep[index] = true;
            }
        }

        let drop_keys: Vec<K> = self
            .entries
            .keys()
            .enumerate()
            .filter(|(i, _)| !keep[*i])
            .map(|(_, k)| k.clone())
            .collect();
        for key in drop_keys {
            self.entries.shift_remove(&key);
        }

        Ok(cumulative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;

    async fn fixed(weights: &[u64]) -> EvictionMap<usize, u64> {
        let mut map = EvictionMap::new();
        for (i, w) in weights.iter().enumerate() {
            map.insert(i, *w);
        }
        map
    }

    fn weigher(v: &u64) -> impl Future<Output = Result<Bytes>> {
        let v = *v;
        async move { Ok(Bytes::new(v)) }
    }

    fn recency(v: &u64) -> usize {
        // Treat the value's own index-derived identity (its insertion
        // order, via the key) as recency in these unit tests; the real
        // Target uses `LocationStatus::last_used` instead.
        *v as usize
    }

    #[tokio::test]
    async fn g1_nothing_removed_when_everything_fits() {
        let mut map = fixed(&[0, 1, 2, 3, 4]).await;
        let kept = map
            .gc(Bytes::new(20), |v| *v, weigher, |a, b| a.cmp(b))
            .await
            .unwrap();
        assert_eq!(kept, Bytes::new(10));
        assert_eq!(map.len(), 5);
    }

    #[tokio::test]
    async fn g2_skip_dont_stop_removes_only_the_non_fitting_entry() {
        // insertion order 0..5 is recency (index 4 = most recent)
        let mut map = EvictionMap::new();
        for (i, w) in [0u64, 1, 2, 3, 4].into_iter().enumerate() {
            map.insert(i, w);
        }
        let kept = map
            .gc(Bytes::new(9), |&w| w as i64, weigher, |a, b| a.cmp(b))
            .await
            .unwrap();
        assert_eq!(kept, Bytes::new(9));
        let remaining: Vec<u64> =
            (0..5).filter_map(|k| map.get(&k).copied()).collect();
        assert_eq!(remaining, vec![0, 2, 3, 4]);
    }

    #[tokio::test]
    async fn g3_removes_the_oversized_entry_and_one_more() {
        let mut map = EvictionMap::new();
        for (i, w) in [1u64, 1, 1, 4, 1].into_iter().enumerate() {
            map.insert(i, w);
        }
        let kept = map
            .gc(Bytes::new(3), |&w| w as i64, weigher, |a, b| a.cmp(b))
            .await
            .unwrap();
        assert_eq!(kept, Bytes::new(3));
        let mut remaining: Vec<u64> =
            (0..5).filter_map(|k| map.get(&k).copied()).collect();
        remaining.sort_unstable();
        assert_eq!(remaining, vec![1, 1, 1]);
        assert_eq!(map.len(), 3);
    }

    #[tokio::test]
    async fn infinite_weight_is_always_dropped() {
        let mut map = EvictionMap::new();
        map.insert("poisoned", 0u64);
        map.insert("fine", 1u64);
        let kept = map
            .gc(
                Bytes::new(1000),
                |_| 0i64,
                |v: &u64| {
                    let v = *v;
                    async move {
                        Ok(if v == 0 { Bytes::INFINITE } else { Bytes::new(v) })
                    }
                },
                |a, b| a.cmp(b),
            )
            .await
            .unwrap();
        assert_eq!(kept, Bytes::new(1));
        assert!(map.get(&"poisoned").is_none());
        assert!(map.get(&"fine").is_some());
    }

    #[tokio::test]
    async fn weigher_failure_leaves_map_untouched() {
        let mut map = EvictionMap::new();
        map.insert(1, 10u64);
        map.insert(2, 20u64);
        let result = map
            .gc(
                Bytes::new(5),
                |v| *v as i64,
                |v: &u64| {
                    let v = *v;
                    async move {
                        if v == 20 {
                            Err(CacheError::Weigher("boom".into()))
                        } else {
                            Ok(Bytes::new(v))
                        }
                    }
                },
                |a, b| a.cmp(b),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn weigher_unused_helper_silences_dead_code() {
        let _ = recency(&0);
    }
}
