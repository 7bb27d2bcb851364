// SPDX-License-Identifier: Apache-2.0

//! The public façade (§6): a concurrent ordered map over an unbalanced
//! external binary search tree, built on LLX/SCX multi-word conditional
//! updates and reclaimed with an epoch-based (DEBRA) scheme. [`Map`] itself
//! is a thin wrapper around [`crate::tree::Tree`] translating the tree
//! protocol's `only_if_absent` flag into the two distinct entry points the
//! external interface exposes.

use crate::tree::Tree;

/// A concurrent ordered map from `K` to `V`.
///
/// Every method other than [`Map::new`] takes a thread id `tid` that must be
/// stable for the calling thread's lifetime and in `[0, max_threads)`
/// (§6), and must have been registered with [`Map::init_thread`] first.
///
/// `no_key` must compare greater than every real key ever inserted — it
/// marks the two permanent sentinel levels above the real data (I2) and the
/// placeholder leaf of an empty tree.
pub struct Map<K, V> {
    tree: Tree<K, V>,
}

impl<K, V> Map<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(no_key: K, no_value: V, max_threads: usize) -> Self {
        Self {
            tree: Tree::new(no_key, no_value, max_threads),
        }
    }

    /// Must be called once by thread `tid` before any other method on this
    /// `Map`. Leaves the thread in a quiescent state.
    pub fn init_thread(&self, tid: usize) {
        self.tree.init_thread(tid);
    }

    /// Inserts `key -> value`, replacing and returning any existing value
    /// for `key`.
    pub fn insert(&self, tid: usize, key: K, value: V) -> Option<V> {
        self.tree.recman.leave_quiescent(tid);
        let ret = self.tree.insert(tid, key, value, false);
        self.tree.recman.enter_quiescent(tid);
        ret
    }

    /// Inserts `key -> value` only if `key` is absent. Returns `true` iff
    /// the insertion happened.
    pub fn insert_if_absent(&self, tid: usize, key: K, value: V) -> bool {
        self.tree.recman.leave_quiescent(tid);
        let existed = self.tree.insert(tid, key, value, true).is_some();
        self.tree.recman.enter_quiescent(tid);
        !existed
    }

    /// Removes `key`, returning its value if present.
    pub fn erase(&self, tid: usize, key: &K) -> Option<V> {
        self.tree.recman.leave_quiescent(tid);
        let ret = self.tree.erase(tid, key);
        self.tree.recman.enter_quiescent(tid);
        ret
    }

    /// Looks up `key` without taking part in any SCX.
    pub fn find(&self, tid: usize, key: &K) -> Option<V> {
        self.tree.recman.leave_quiescent(tid);
        let ret = self.tree.find(key);
        self.tree.recman.enter_quiescent(tid);
        ret
    }

    /// Appends every `(key, value)` with a key in `[lo, hi]` to `out`,
    /// sorted by key, and returns how many were appended. Linearizes at the
    /// marked-bit validation step (§4.3, P7): the result existed
    /// simultaneously in the tree at some instant during the call.
    pub fn range(&self, tid: usize, lo: &K, hi: &K, out: &mut Vec<(K, V)>) -> usize {
        self.tree.recman.leave_quiescent(tid);
        let n = self.tree.range(lo, hi, out);
        self.tree.recman.enter_quiescent(tid);
        n
    }
}

// SAFETY: `Tree` is `Send + Sync` whenever `K, V` are; `Map` has no
// additional state.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for Map<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Map<K, V> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_single_thread_basic() {
        let map: Map<i64, &'static str> = Map::new(10_000_000, "", 1);
        map.init_thread(0);
        assert_eq!(map.insert(0, 5, "a"), None);
        assert_eq!(map.insert(0, 3, "b"), None);
        assert_eq!(map.insert(0, 7, "c"), None);
        assert_eq!(map.find(0, &5), Some("a"));
        assert_eq!(map.find(0, &4), None);
        assert_eq!(map.erase(0, &3), Some("b"));
        assert_eq!(map.find(0, &3), None);
        let mut out = Vec::new();
        let n = map.range(0, &0, &10, &mut out);
        assert_eq!(n, 2);
        assert_eq!(out, vec![(5, "a"), (7, "c")]);
    }

    #[test]
    fn scenario_replacement() {
        let map: Map<i64, &'static str> = Map::new(10_000_000, "", 1);
        map.init_thread(0);
        assert_eq!(map.insert(0, 5, "a"), None);
        assert_eq!(map.insert(0, 5, "b"), Some("a"));
        assert_eq!(map.find(0, &5), Some("b"));
        assert!(!map.insert_if_absent(0, 5, "z"));
        assert_eq!(map.find(0, &5), Some("b"));
    }

    #[test]
    fn insert_if_absent_on_fresh_key() {
        let map: Map<i64, i64> = Map::new(10_000_000, 0, 1);
        map.init_thread(0);
        assert!(map.insert_if_absent(0, 1, 100));
        assert_eq!(map.find(0, &1), Some(100));
        assert!(!map.insert_if_absent(0, 1, 200));
        assert_eq!(map.find(0, &1), Some(100));
    }

    #[test]
    fn range_excludes_out_of_bounds_and_no_key() {
        let map: Map<i64, i64> = Map::new(10_000_000, 0, 1);
        map.init_thread(0);
        for k in [1, 5, 10, 15, 20] {
            map.insert(0, k, k);
        }
        let mut out = Vec::new();
        let n = map.range(0, &5, &15, &mut out);
        assert_eq!(n, 3);
        assert_eq!(out, vec![(5, 5), (10, 10), (15, 15)]);
        assert!(out.iter().all(|(k, _)| *k != 10_000_000));
    }
}
