// SPDX-License-Identifier: Apache-2.0

//! Tree Protocol (C3): traversal, leaf insertion/removal and range-query
//! validation layered on top of LLX/SCX (C2) and the record manager (C4).
//!
//! Every operation here follows the same shape: `leave_quiescent`, an
//! unsynchronized descent to a leaf (and its ancestors), one or more `llx`
//! calls on the nodes it is about to touch, a single `scx` attempt, then
//! `enter_quiescent`. A failed `llx` or an aborted `scx` is never surfaced;
//! the operation simply redescends and tries again (§7: "not surfaced").

use crate::mem::UArray;
use crate::recman::RecordManager;
use crate::scx::{self, highest_index_reached, llx, Descriptor, LlxResult, Node};
use crate::sync::{ORD_ACQ, ORD_REL};
use log::trace;
use std::cmp::Ordering;
use std::ptr;

/// The external binary search tree plus the record manager it allocates
/// through. Two permanent sentinel levels sit above the real data (I2): the
/// `root` and its first child both carry `no_key`, which compares greater
/// than any real key, so every real-key comparison at those two levels
/// descends left. This guarantees every real operation has both a parent
/// and a grandparent without any special-casing in the descent loop.
pub struct Tree<K, V> {
    pub(crate) recman: RecordManager<K, V>,
    root: *mut Node<K, V>,
    dummy: *mut Descriptor<K, V>,
    no_key: K,
}

// SAFETY: every node and descriptor is reachable only through atomic
// pointers, guarded by the epoch reclaimer; `K`/`V` are required to be
// `Send + Sync` by `Map`.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for Tree<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Tree<K, V> {}

struct Descent<K, V> {
    gp: *mut Node<K, V>,
    p: *mut Node<K, V>,
    l: *mut Node<K, V>,
}

impl<K: Ord + Clone + 'static, V: Clone + 'static> Tree<K, V> {
    pub fn new(no_key: K, no_value: V, max_threads: usize) -> Self {
        let recman = RecordManager::new(max_threads);
        // All nodes, including the two permanent sentinels, are allocated
        // through the record manager's pools (tid 0 is always valid: a
        // `Tree` always has at least one thread slot), so `drop_tree` can
        // uniformly hand every node back to `recman` rather than tracking
        // which ones came from a plain `Box::new`.
        //
        // The dummy descriptor: permanently aborted, never retired, used as
        // the initial `info` of every freshly built node until an SCX
        // actually freezes it.
        let dummy = recman.alloc_descriptor(0, Descriptor::dummy());

        // Two filler leaves that exist only so the two sentinel levels
        // qualify as internal nodes (both children non-null); never
        // reachable by any real-key comparison since `no_key` is greater
        // than every real key.
        let filler_a = recman.alloc_node(0, Node::new_leaf(no_key.clone(), no_value.clone(), dummy));
        let filler_b = recman.alloc_node(0, Node::new_leaf(no_key.clone(), no_value.clone(), dummy));
        // The single leaf representing an empty dataset, initially the
        // root's first grandchild (I2).
        let empty_leaf = recman.alloc_node(0, Node::new_leaf(no_key.clone(), no_value.clone(), dummy));
        let s1 = recman.alloc_node(
            0,
            Node::new_internal(no_key.clone(), no_value.clone(), empty_leaf, filler_b, dummy),
        );
        let root = recman.alloc_node(
            0,
            Node::new_internal(no_key.clone(), no_value, s1, filler_a, dummy),
        );

        Self {
            recman,
            root,
            dummy,
            no_key,
        }
    }

    pub fn init_thread(&self, tid: usize) {
        self.recman.init_thread(tid);
    }

    /// Unsynchronized descent from the root to a leaf, tracking the leaf's
    /// parent and grandparent. Every pointer read here stays valid to
    /// dereference until this thread's next quiescent state, per the
    /// reclaimer's contract.
    fn descend(&self, key: &K) -> Descent<K, V> {
        let mut gp = ptr::null_mut();
        let mut p = ptr::null_mut();
        let mut node = self.root;
        loop {
            // SAFETY: `node` starts at `root` (never reclaimed) and is only
            // ever advanced to a child read while this thread is
            // non-quiescent.
            let n = unsafe { &*node };
            let left = n.left.load(ORD_ACQ);
            if left.is_null() {
                break;
            }
            let right = n.right.load(ORD_ACQ);
            gp = p;
            p = node;
            node = if key.cmp(&n.key) == Ordering::Less {
                left
            } else {
                right
            };
        }
        Descent { gp, p, l: node }
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let Descent { l, .. } = self.descend(key);
        // SAFETY: `l` is a leaf reached by `descend`, valid while
        // non-quiescent.
        let leaf = unsafe { &*l };
        if &leaf.key == key {
            Some(leaf.value.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, tid: usize, key: K, value: V, only_if_absent: bool) -> Option<V> {
        loop {
            let Descent { p, l, .. } = self.descend(&key);
            // SAFETY: reachable while non-quiescent.
            let l_ref = unsafe { &*l };
            if l_ref.key == key {
                if only_if_absent {
                    return Some(l_ref.value.clone());
                }
                match self.try_replace(tid, p, l, &key, &value) {
                    Some(old) => return Some(old),
                    None => continue,
                }
            } else if self.try_insert_leaf(tid, p, l, &key, &value) {
                return None;
            }
        }
    }

    /// One attempt at replacing leaf `l` (whose key already equals `key`)
    /// with a fresh leaf carrying `value`. Returns `Some(old_value)` on
    /// success, `None` if the attempt should be retried from a fresh
    /// descent.
    fn try_replace(&self, tid: usize, p: *mut Node<K, V>, l: *mut Node<K, V>, key: &K, value: &V) -> Option<V> {
        // SAFETY: `p`/`l` are reachable while non-quiescent.
        let p_ref = unsafe { &*p };
        let l_ref = unsafe { &*l };
        let (info, field, child_matches) = match llx(p_ref) {
            LlxResult::Ok { info, left, right } => {
                if left == l {
                    (info, &p_ref.left as *const _, true)
                } else if right == l {
                    (info, &p_ref.right as *const _, true)
                } else {
                    (info, ptr::null(), false)
                }
            }
            LlxResult::Conflict(d) => {
                self.drive_and_retire(tid, d);
                return None;
            }
            LlxResult::Failed | LlxResult::Leaf => return None,
        };
        if !child_matches {
            return None;
        }

        let old_value = l_ref.value.clone();
        let new_leaf = self
            .recman
            .alloc_node(tid, Node::new_leaf(key.clone(), value.clone(), self.dummy));

        let mut nodes = UArray::new();
        nodes.push(p);
        nodes.push(l);
        let mut info_seen = UArray::new();
        info_seen.push(info);
        info_seen.push(ptr::null_mut()); // `l` is a leaf: never frozen.

        let desc = self.recman.alloc_descriptor(
            tid,
            Descriptor::new_in_progress(nodes, info_seen, 1, field, new_leaf),
        );

        let mut retired = UArray::new();
        if scx::scx(desc, &mut retired) {
            for old_desc in retired.iter() {
                self.recman.retire_descriptor(tid, *old_desc);
            }
            // `l` is a leaf, so `num_freeze == 1` means the generic SCX
            // mark loop (which only marks `nodes[1..num_freeze)`) never
            // touches it. `l` is logically removed here, its key now maps
            // to `new_leaf`'s value, not `l`'s, so a concurrent `range`
            // holding a reference to `l` must be able to detect that; mark
            // it explicitly.
            l_ref.marked.store(true, ORD_REL);
            // `l` is fully superseded (the fresh leaf does not reference
            // it); `p` stays in the tree, only its child pointer and `info`
            // changed. `desc` is now reachable via `p.info`; a later SCX
            // will retire it once it displaces that back-reference.
            self.recman.retire_node(tid, l);
            Some(old_value)
        } else {
            // num_freeze == 1, so an abort can only happen at index 0: no
            // freezing CAS succeeded and nothing here ever became
            // reachable. Free both immediately rather than through the
            // reclaimer.
            self.recman.dealloc_node(tid, new_leaf);
            self.recman.dealloc_descriptor(tid, desc);
            None
        }
    }

    /// One attempt at growing the tree: replacing leaf `l` (whose key
    /// differs from `key`) with a fresh internal node whose children are
    /// `l` and a new leaf for `key`/`value`. Returns `true` on success.
    fn try_insert_leaf(&self, tid: usize, p: *mut Node<K, V>, l: *mut Node<K, V>, key: &K, value: &V) -> bool {
        // SAFETY: reachable while non-quiescent.
        let p_ref = unsafe { &*p };
        let l_ref = unsafe { &*l };
        let (info, field, child_matches) = match llx(p_ref) {
            LlxResult::Ok { info, left, right } => {
                if left == l {
                    (info, &p_ref.left as *const _, true)
                } else if right == l {
                    (info, &p_ref.right as *const _, true)
                } else {
                    (info, ptr::null(), false)
                }
            }
            LlxResult::Conflict(d) => {
                self.drive_and_retire(tid, d);
                return false;
            }
            LlxResult::Failed | LlxResult::Leaf => return false,
        };
        if !child_matches {
            return false;
        }

        let new_leaf = self
            .recman
            .alloc_node(tid, Node::new_leaf(key.clone(), value.clone(), self.dummy));
        // In-order position: if `key` sorts before `l`'s key (which is
        // always true when `l` is the `no_key` placeholder for an empty
        // tree, since `no_key` sorts after every real key), the new
        // internal node's separator is `l`'s key and its children are
        // [new_leaf, l]; otherwise the separator is `key` and the children
        // are [l, new_leaf].
        let goes_before_l = key.cmp(&l_ref.key) == Ordering::Less;
        let internal = if goes_before_l {
            Node::new_internal(l_ref.key.clone(), l_ref.value.clone(), new_leaf, l, self.dummy)
        } else {
            Node::new_internal(key.clone(), value.clone(), l, new_leaf, self.dummy)
        };
        let new_internal = self.recman.alloc_node(tid, internal);

        // `nodes[1]` must be `l`: `help`'s commit step always CASes the
        // field from `nodes[1]` to `new_node`, regardless of whether
        // `nodes[1]` ends up retired. `l` is never passed to
        // `recman.retire_node` below: the published subtree still
        // references it as a child, so it stays reachable.
        let mut nodes = UArray::new();
        nodes.push(p);
        nodes.push(l);
        let mut info_seen = UArray::new();
        info_seen.push(info);

        let desc = self.recman.alloc_descriptor(
            tid,
            Descriptor::new_in_progress(nodes, info_seen, 1, field, new_internal),
        );

        let mut retired = UArray::new();
        if scx::scx(desc, &mut retired) {
            for old_desc in retired.iter() {
                self.recman.retire_descriptor(tid, *old_desc);
            }
            true
        } else {
            self.recman.dealloc_node(tid, new_leaf);
            self.recman.dealloc_node(tid, new_internal);
            self.recman.dealloc_descriptor(tid, desc);
            false
        }
    }

    pub fn erase(&self, tid: usize, key: &K) -> Option<V> {
        loop {
            let Descent { gp, p, l } = self.descend(key);
            // SAFETY: reachable while non-quiescent.
            let l_ref = unsafe { &*l };
            if &l_ref.key != key {
                return None;
            }
            match self.try_erase(tid, gp, p, l) {
                Some(old) => return Some(old),
                None => continue,
            }
        }
    }

    fn try_erase(
        &self,
        tid: usize,
        gp: *mut Node<K, V>,
        p: *mut Node<K, V>,
        l: *mut Node<K, V>,
    ) -> Option<V> {
        // SAFETY: reachable while non-quiescent.
        let gp_ref = unsafe { &*gp };
        let p_ref = unsafe { &*p };
        let l_ref = unsafe { &*l };

        let (info_gp, gp_left, gp_right) = match llx(gp_ref) {
            LlxResult::Ok { info, left, right } => (info, left, right),
            LlxResult::Conflict(d) => {
                self.drive_and_retire(tid, d);
                return None;
            }
            LlxResult::Failed | LlxResult::Leaf => return None,
        };
        if gp_left != p && gp_right != p {
            return None;
        }

        let (info_p, p_left, p_right) = match llx(p_ref) {
            LlxResult::Ok { info, left, right } => (info, left, right),
            LlxResult::Conflict(d) => {
                self.drive_and_retire(tid, d);
                return None;
            }
            LlxResult::Failed | LlxResult::Leaf => return None,
        };
        let sibling = if p_left == l {
            p_right
        } else if p_right == l {
            p_left
        } else {
            return None;
        };

        // SAFETY: `sibling` is a current child of `p`, reachable while
        // non-quiescent.
        let sibling_ref = unsafe { &*sibling };
        let (info_sibling, sib_left, sib_right, sibling_is_leaf) = match llx(sibling_ref) {
            LlxResult::Ok { info, left, right } => (info, left, right, false),
            LlxResult::Leaf => (ptr::null_mut(), ptr::null_mut(), ptr::null_mut(), true),
            LlxResult::Conflict(d) => {
                self.drive_and_retire(tid, d);
                return None;
            }
            LlxResult::Failed => return None,
        };

        let field = if gp_left == p {
            &gp_ref.left as *const _
        } else {
            &gp_ref.right as *const _
        };

        let copy = if sibling_is_leaf {
            Node::new_leaf(sibling_ref.key.clone(), sibling_ref.value.clone(), self.dummy)
        } else {
            Node::new_internal(
                sibling_ref.key.clone(),
                sibling_ref.value.clone(),
                sib_left,
                sib_right,
                self.dummy,
            )
        };
        let copy = self.recman.alloc_node(tid, copy);

        let mut nodes = UArray::new();
        nodes.push(gp);
        nodes.push(p);
        nodes.push(sibling);
        nodes.push(l);
        let mut info_seen = UArray::new();
        info_seen.push(info_gp);
        info_seen.push(info_p);
        info_seen.push(if sibling_is_leaf { ptr::null_mut() } else { info_sibling });
        info_seen.push(ptr::null_mut()); // `l` is a leaf: never frozen.

        let desc = self.recman.alloc_descriptor(
            tid,
            Descriptor::new_in_progress(nodes, info_seen, 3, field, copy),
        );

        let old_value = l_ref.value.clone();
        let mut retired = UArray::new();
        if scx::scx(desc, &mut retired) {
            for old_desc in retired.iter() {
                self.recman.retire_descriptor(tid, *old_desc);
            }
            // `l` is the erased leaf: it is never frozen (it is immutable
            // and `num_freeze == 3` excludes it), so the generic SCX mark
            // loop never touches it either. Its key is gone from the map
            // entirely, so mark it explicitly for the same reason as
            // `try_replace` above.
            l_ref.marked.store(true, ORD_REL);
            // `p`, `l` and the original `sibling` object are all
            // structurally removed: `gp`'s child now points at `copy`,
            // which carries `sibling`'s children directly, so `sibling`'s
            // subtree (if any) survives while the `sibling` node object
            // itself does not. `gp` stays in the tree.
            self.recman.retire_node(tid, p);
            self.recman.retire_node(tid, l);
            self.recman.retire_node(tid, sibling);
            Some(old_value)
        } else {
            self.recman.dealloc_node(tid, copy);
            if highest_index_reached(unsafe { &*desc }) == 0 {
                self.recman.dealloc_descriptor(tid, desc);
            }
            // else: some freezing CAS succeeded before the abort, so `desc`
            // is reachable from that node's `info`; a later SCX over that
            // node will retire it via the usual displaced-descriptor path.
            None
        }
    }

    /// Drives a conflicting in-progress descriptor towards a terminal state
    /// (optional for liveness, required for lock-freedom) and retires any
    /// descriptor it proves unreachable.
    fn drive_and_retire(&self, tid: usize, d: *mut Descriptor<K, V>) {
        let mut retired = UArray::new();
        scx::help(d, true, &mut retired);
        for old_desc in retired.iter() {
            self.recman.retire_descriptor(tid, *old_desc);
        }
    }

    /// Depth-first, pruning traversal collecting every leaf whose key lies
    /// in `[lo, hi]`. `node`'s key is the in-order separator: keys `< key`
    /// live entirely under `left`, keys `>= key` entirely under `right`, so
    /// a subtree is only descended into when `[lo, hi]` could overlap it.
    fn collect_leaves(&self, node: *mut Node<K, V>, lo: &K, hi: &K, out: &mut Vec<*mut Node<K, V>>) {
        // SAFETY: reachable while non-quiescent.
        let n = unsafe { &*node };
        let left = n.left.load(ORD_ACQ);
        if left.is_null() {
            if n.key != self.no_key && lo <= &n.key && &n.key <= hi {
                out.push(node);
            }
            return;
        }
        let right = n.right.load(ORD_ACQ);
        if lo.cmp(&n.key) == Ordering::Less {
            self.collect_leaves(left, lo, hi, out);
        }
        if hi.cmp(&n.key) != Ordering::Less {
            self.collect_leaves(right, lo, hi, out);
        }
    }

    /// Range query with marked-bit validation (§4.3): the result set
    /// linearizes at the validation read, since every selected leaf being
    /// unmarked there means the whole set coexisted in the tree at some
    /// point between traversal start and that read (P7).
    pub fn range(&self, lo: &K, hi: &K, out: &mut Vec<(K, V)>) -> usize {
        loop {
            let mut leaves = Vec::new();
            self.collect_leaves(self.root, lo, hi, &mut leaves);
            std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
            let all_unmarked = leaves
                .iter()
                .all(|&l| !unsafe { &*l }.marked.load(ORD_ACQ));
            if !all_unmarked {
                trace!("range: validation failed, restarting");
                continue;
            }
            out.clear();
            for l in &leaves {
                // SAFETY: leaf pointers read during this non-quiescent
                // region stay valid to dereference.
                let n = unsafe { &**l };
                out.push((n.key.clone(), n.value.clone()));
            }
            out.sort_by(|a, b| a.0.cmp(&b.0));
            return out.len();
        }
    }

    /// Recursively hands every node and descriptor reachable from `root`,
    /// plus the shared dummy descriptor, back to `recman` (every one of
    /// them was allocated through it, including the sentinels built in
    /// `new`). Only safe once no other thread can possibly still be
    /// operating on the tree, which is exactly the exclusivity
    /// `Drop::drop` gives us; `recman` itself is dropped afterwards (by the
    /// compiler-generated field drop glue), which is what actually returns
    /// this memory to the allocator.
    pub(crate) fn drop_tree(&mut self) {
        fn free_node<K, V>(
            recman: &RecordManager<K, V>,
            node: *mut Node<K, V>,
            dummy: *mut Descriptor<K, V>,
            descriptors: &mut Vec<*mut Descriptor<K, V>>,
        ) {
            if node.is_null() {
                return;
            }
            // SAFETY: called only from `Drop`, which has exclusive access.
            let (left, right, info) = unsafe {
                let n = &*node;
                (n.left.load(ORD_ACQ), n.right.load(ORD_ACQ), n.info.load(ORD_ACQ))
            };
            // every non-dummy `info` still hanging off a live node is a
            // committed descriptor that was never retired through the
            // reclaimer (it is still the *current* descriptor, not a
            // displaced one), so it has to be collected here or it leaks.
            if info != dummy {
                descriptors.push(info);
            }
            if !left.is_null() {
                free_node(recman, left, dummy, descriptors);
                free_node(recman, right, dummy, descriptors);
            }
            recman.dealloc_node(0, node);
        }
        let mut descriptors = Vec::new();
        free_node(&self.recman, self.root, self.dummy, &mut descriptors);
        // several nodes can share the same descriptor (one multi-node SCX
        // publishes it onto every node it touched), so dedup before freeing.
        descriptors.sort_unstable();
        descriptors.dedup();
        for d in descriptors {
            self.recman.dealloc_descriptor(0, d);
        }
        self.recman.dealloc_descriptor(0, self.dummy);
        self.root = ptr::null_mut();
        self.dummy = ptr::null_mut();
    }
}

impl<K, V> Drop for Tree<K, V> {
    fn drop(&mut self) {
        if !self.root.is_null() {
            self.drop_tree();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_tree() -> Tree<i64, i64> {
        Tree::new(10_000_000, 0, 4)
    }

    #[test]
    fn empty_tree_finds_nothing() {
        let t = new_tree();
        t.init_thread(0);
        t.recman.leave_quiescent(0);
        assert_eq!(t.find(&5), None);
        t.recman.enter_quiescent(0);
    }

    #[test]
    fn insert_then_find() {
        let t = new_tree();
        t.init_thread(0);
        t.recman.leave_quiescent(0);
        assert_eq!(t.insert(0, 5, 50, false), None);
        assert_eq!(t.insert(0, 3, 30, false), None);
        assert_eq!(t.insert(0, 7, 70, false), None);
        assert_eq!(t.find(&5), Some(50));
        assert_eq!(t.find(&4), None);
        assert_eq!(t.find(&3), Some(30));
        t.recman.enter_quiescent(0);
    }

    #[test]
    fn insert_replace_returns_old_value() {
        let t = new_tree();
        t.init_thread(0);
        t.recman.leave_quiescent(0);
        assert_eq!(t.insert(0, 5, 50, false), None);
        assert_eq!(t.insert(0, 5, 51, false), Some(50));
        assert_eq!(t.find(&5), Some(51));
        assert_eq!(t.insert(0, 5, 999, true), Some(51));
        assert_eq!(t.find(&5), Some(51));
        t.recman.enter_quiescent(0);
    }

    #[test]
    fn erase_removes_key() {
        let t = new_tree();
        t.init_thread(0);
        t.recman.leave_quiescent(0);
        t.insert(0, 5, 50, false);
        t.insert(0, 3, 30, false);
        t.insert(0, 7, 70, false);
        assert_eq!(t.erase(0, &3), Some(30));
        assert_eq!(t.find(&3), None);
        assert_eq!(t.find(&5), Some(50));
        assert_eq!(t.erase(0, &3), None);
        t.recman.enter_quiescent(0);
    }

    #[test]
    fn range_query_returns_sorted_subset() {
        let t = new_tree();
        t.init_thread(0);
        t.recman.leave_quiescent(0);
        for k in [5, 3, 7, 1, 9, 20] {
            t.insert(0, k, k * 10, false);
        }
        let mut out = Vec::new();
        let n = t.range(&0, &10, &mut out);
        assert_eq!(n, 5);
        assert_eq!(out, vec![(1, 10), (3, 30), (5, 50), (7, 70), (9, 90)]);
        t.recman.enter_quiescent(0);
    }
}
