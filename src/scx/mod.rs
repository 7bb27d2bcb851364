// SPDX-License-Identifier: Apache-2.0

//! LLX/SCX: multi-word conditional update across a bounded set of tree nodes.
//!
//! [`llx`] is a read that additionally captures enough state (a descriptor
//! snapshot) that a later [`scx`] can detect whether the node has been
//! touched since. [`scx`] then tries to "freeze" every node it touches by
//! CASing a descriptor into `info`, and only after every freeze succeeds does
//! it mark removed nodes and publish the replacement subtree. A conflicting
//! in-progress descriptor can be driven to completion by any thread that
//! notices it, via [`help`], which is how the protocol stays lock-free
//! without blocking.

use crate::mem::UArray;
use crate::sync::{ORD_ACQ, ORD_ACR, ORD_REL};
use log::trace;
use std::ptr;
use std::sync::atomic::{compiler_fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Upper bound on how many nodes a single SCX can touch. `erase` is the
/// widest tree operation, touching grandparent, parent, sibling and leaf.
pub const MAX_NODES: usize = 4;

/// Upper bound on how many old descriptors a single `help` call can prove
/// unreachable and hand back for retirement: at most one per frozen node.
pub const MAX_RETIRED: usize = MAX_NODES;

const STATE_IN_PROGRESS: usize = 0;
const STATE_COMMITTED: usize = 1;
const STATE_ABORTED_TAG: usize = 2;
const ABORTED_INDEX_SHIFT: usize = 2;
const ABORTED_INDEX_MASK: usize = 0x1F << ABORTED_INDEX_SHIFT;
const ABORTED_FLAGS_SHIFT: usize = 7;

#[inline(always)]
fn make_aborted(index: usize, flags: usize) -> usize {
    STATE_ABORTED_TAG | (index << ABORTED_INDEX_SHIFT) | (flags << ABORTED_FLAGS_SHIFT)
}

#[inline(always)]
fn is_committed(state: usize) -> bool {
    state == STATE_COMMITTED
}

#[inline(always)]
fn is_aborted(state: usize) -> bool {
    state & 0b11 == STATE_ABORTED_TAG
}

#[inline(always)]
fn aborted_index(state: usize) -> usize {
    (state & ABORTED_INDEX_MASK) >> ABORTED_INDEX_SHIFT
}

#[inline(always)]
fn aborted_flags(state: usize) -> usize {
    state >> ABORTED_FLAGS_SHIFT
}

/// A node in the external binary search tree. Both children null means this
/// is a leaf; leaves never change `key`, `value`, `left` or `right` once
/// published (I1 in the design notes).
pub struct Node<K, V> {
    pub key: K,
    pub value: V,
    pub left: AtomicPtr<Node<K, V>>,
    pub right: AtomicPtr<Node<K, V>>,
    /// The descriptor of the most recent SCX to freeze this node. Never
    /// null: a fresh node's `info` points at the tree's shared dummy
    /// descriptor, which is permanently in the aborted state.
    pub info: AtomicPtr<Descriptor<K, V>>,
    pub marked: AtomicBool,
}

// SAFETY: Node is only ever reached through atomic pointers guarded by the
// epoch reclaimer; every field is either immutable after publication or
// itself atomic.
unsafe impl<K: Send, V: Send> Send for Node<K, V> {}
unsafe impl<K: Send, V: Send> Sync for Node<K, V> {}

impl<K, V> Node<K, V> {
    pub fn new_leaf(key: K, value: V, dummy: *mut Descriptor<K, V>) -> Self {
        Self {
            key,
            value,
            left: AtomicPtr::new(ptr::null_mut()),
            right: AtomicPtr::new(ptr::null_mut()),
            info: AtomicPtr::new(dummy),
            marked: AtomicBool::new(false),
        }
    }

    pub fn new_internal(
        key: K,
        value: V,
        left: *mut Node<K, V>,
        right: *mut Node<K, V>,
        dummy: *mut Descriptor<K, V>,
    ) -> Self {
        Self {
            key,
            value,
            left: AtomicPtr::new(left),
            right: AtomicPtr::new(right),
            info: AtomicPtr::new(dummy),
            marked: AtomicBool::new(false),
        }
    }

    #[inline(always)]
    pub fn is_leaf_ptrs(left: *mut Node<K, V>) -> bool {
        left.is_null()
    }
}

/// An in-progress, committed, or aborted multi-node update.
///
/// `nodes[0..num_freeze)` are frozen by this SCX; `nodes[num_freeze..num_nodes)`
/// are additional nodes retired on commit without being frozen (immutable
/// leaves). `info_seen[i]` is the snapshot of `nodes[i].info` an LLX
/// observed before this SCX began, or null if that LLX found `nodes[i]` to
/// be a leaf (leaves carry no freezable descriptor snapshot).
pub struct Descriptor<K, V> {
    state: AtomicUsize,
    all_frozen: AtomicBool,
    pub num_freeze: usize,
    pub num_nodes: usize,
    pub nodes: UArray<MAX_NODES, *mut Node<K, V>>,
    pub info_seen: UArray<MAX_NODES, *mut Descriptor<K, V>>,
    pub field: *const AtomicPtr<Node<K, V>>,
    pub new_node: *mut Node<K, V>,
}

// SAFETY: same reasoning as Node; descriptors are reached only through
// atomic `info` pointers while the owning operation (or a helper) is
// non-quiescent.
unsafe impl<K: Send, V: Send> Send for Descriptor<K, V> {}
unsafe impl<K: Send, V: Send> Sync for Descriptor<K, V> {}

impl<K, V> Descriptor<K, V> {
    /// A permanently-aborted descriptor with no frozen nodes, used as the
    /// initial `info` value for every freshly allocated node.
    pub fn dummy() -> Self {
        Self {
            state: AtomicUsize::new(make_aborted(0, 0)),
            all_frozen: AtomicBool::new(false),
            num_freeze: 0,
            num_nodes: 0,
            nodes: UArray::new(),
            info_seen: UArray::new(),
            field: ptr::null(),
            new_node: ptr::null_mut(),
        }
    }

    pub fn new_in_progress(
        nodes: UArray<MAX_NODES, *mut Node<K, V>>,
        info_seen: UArray<MAX_NODES, *mut Descriptor<K, V>>,
        num_freeze: usize,
        field: *const AtomicPtr<Node<K, V>>,
        new_node: *mut Node<K, V>,
    ) -> Self {
        let num_nodes = nodes.len();
        Self {
            state: AtomicUsize::new(STATE_IN_PROGRESS),
            all_frozen: AtomicBool::new(false),
            num_freeze,
            num_nodes,
            nodes,
            info_seen,
            field,
            new_node,
        }
    }

    #[inline]
    pub fn is_committed(&self) -> bool {
        is_committed(self.state.load(ORD_ACQ))
    }
}

/// Result of an `llx` call.
pub enum LlxResult<K, V> {
    /// The node is a leaf: both children are null.
    Leaf,
    /// The node is mid-update by another thread; `Descriptor` is the
    /// conflicting descriptor a caller may choose to help.
    Conflict(*mut Descriptor<K, V>),
    /// The node changed between the two `info` reads; the caller should
    /// simply retry its enclosing operation.
    Failed,
    /// A consistent snapshot: `info` as of both reads, and the children read
    /// in between.
    Ok {
        info: *mut Descriptor<K, V>,
        left: *mut Node<K, V>,
        right: *mut Node<K, V>,
    },
}

/// Load-linked extended: an enhanced read of `node` that captures enough
/// state for a later `scx` over `node` to detect interference.
pub fn llx<K, V>(node: &Node<K, V>) -> LlxResult<K, V> {
    let info = node.info.load(ORD_ACQ);
    compiler_fence(Ordering::SeqCst);
    // SAFETY: `info` is never null and, while this thread is non-quiescent,
    // never freed: it is either the tree's permanent dummy or a descriptor
    // still reachable from the live tree.
    let state = unsafe { (*info).state.load(ORD_ACQ) };
    compiler_fence(Ordering::SeqCst);
    let marked = node.marked.load(ORD_ACQ);

    let committed_or_aborted = (is_committed(state) && !marked) || is_aborted(state);
    if !committed_or_aborted {
        if state == STATE_IN_PROGRESS {
            return LlxResult::Conflict(info);
        }
        return LlxResult::Failed;
    }

    let left = node.left.load(ORD_ACQ);
    let right = node.right.load(ORD_ACQ);
    if left.is_null() {
        return LlxResult::Leaf;
    }
    compiler_fence(Ordering::SeqCst);
    let info2 = node.info.load(ORD_ACQ);
    if info2 == info {
        LlxResult::Ok { info, left, right }
    } else {
        LlxResult::Failed
    }
}

#[inline(always)]
fn is_leaf_marker<K, V>(seen: *mut Descriptor<K, V>) -> bool {
    seen.is_null()
}

/// Drives `d` towards a terminal state and returns the state reached.
/// `helping` is true when called by a thread other than `d`'s initiator, in
/// which case the node at index 0 (already frozen by the initiator before
/// any helper could observe `d`) is skipped.
///
/// Any old descriptor this call displaces from a node's `info` field that
/// becomes provably unreachable is appended to `retired_out`, for the caller
/// to hand to the reclaimer.
pub fn help<K, V>(
    d: *mut Descriptor<K, V>,
    helping: bool,
    retired_out: &mut UArray<MAX_RETIRED, *mut Descriptor<K, V>>,
) -> usize {
    // SAFETY: caller guarantees `d` is reachable and this thread is
    // non-quiescent.
    let desc = unsafe { &*d };
    let mut state = desc.state.load(ORD_ACQ);
    if state != STATE_IN_PROGRESS {
        return state;
    }

    let start = if helping { 1 } else { 0 };
    for i in start..desc.num_freeze {
        let seen = desc.info_seen[i];
        if is_leaf_marker(seen) {
            continue;
        }
        let node = unsafe { &*desc.nodes[i] };
        match node
            .info
            .compare_exchange(seen, d, ORD_ACR, ORD_ACQ)
        {
            Ok(_) => {
                maybe_retire_old(seen, i, retired_out);
            }
            Err(cur) => {
                if cur == d {
                    // a concurrent helper already froze this node for us
                    continue;
                }
                if desc.all_frozen.load(ORD_ACQ) {
                    return STATE_COMMITTED;
                }
                if i == 0 {
                    desc.state.store(make_aborted(0, 0), ORD_REL);
                    trace!("scx: descriptor aborted at index 0");
                    return desc.state.load(ORD_ACQ);
                }
                let mut flags = 0usize;
                for k in 0..i {
                    if !is_leaf_marker(desc.info_seen[k]) {
                        flags |= 1 << k;
                    }
                }
                let aborted = make_aborted(i, flags);
                return match desc.state.compare_exchange(
                    STATE_IN_PROGRESS,
                    aborted,
                    ORD_ACR,
                    ORD_ACQ,
                ) {
                    Ok(_) => {
                        trace!("scx: descriptor aborted at index {i}");
                        aborted
                    }
                    Err(s) => s,
                };
            }
        }
    }

    desc.all_frozen.store(true, ORD_REL);
    compiler_fence(Ordering::SeqCst);

    for i in 1..desc.num_freeze {
        if !is_leaf_marker(desc.info_seen[i]) {
            unsafe { (*desc.nodes[i]).marked.store(true, ORD_REL) };
        }
    }

    // SAFETY: field points at the child slot of nodes[0], which this SCX has
    // frozen and is therefore the only writer permitted to change.
    let field = unsafe { &*desc.field };
    let _ = field.compare_exchange(desc.nodes[1], desc.new_node, ORD_ACR, ORD_ACQ);

    state = STATE_COMMITTED;
    desc.state.store(state, ORD_REL);
    state
}

/// Checks whether the descriptor previously occupying node index `idx`'s
/// `info` field has lost its last back-reference and, if so, appends it to
/// `out` for retirement.
fn maybe_retire_old<K, V>(
    old: *mut Descriptor<K, V>,
    idx: usize,
    out: &mut UArray<MAX_RETIRED, *mut Descriptor<K, V>>,
) {
    // SAFETY: `old` was an `info` snapshot taken by a prior LLX; it remains
    // valid while this thread is non-quiescent.
    let old_ref = unsafe { &*old };
    let state = old_ref.state.load(ORD_ACQ);
    if is_committed(state) {
        out.push(old);
    } else if is_aborted(state) {
        loop {
            let cur = old_ref.state.load(ORD_ACQ);
            if !is_aborted(cur) {
                break;
            }
            let flags = aborted_flags(cur);
            if flags & (1 << idx) == 0 {
                break;
            }
            let new_flags = flags & !(1 << idx);
            let new_state = make_aborted(aborted_index(cur), new_flags);
            if old_ref
                .state
                .compare_exchange(cur, new_state, ORD_ACR, ORD_ACQ)
                .is_ok()
            {
                if new_flags == 0 {
                    out.push(old);
                }
                break;
            }
        }
    }
    // IN_PROGRESS is unreachable here: a descriptor's state only moves
    // in_progress -> terminal, and `old` was already terminal when the LLX
    // that produced it ran.
}

/// Runs `d` (freshly allocated, in-progress) to completion and reports
/// whether it committed. Any descriptors it displaced and proved
/// unreachable are appended to `retired_out`.
pub fn scx<K, V>(
    d: *mut Descriptor<K, V>,
    retired_out: &mut UArray<MAX_RETIRED, *mut Descriptor<K, V>>,
) -> bool {
    is_committed(help(d, false, retired_out))
}

/// Highest index this descriptor reached while freezing: `num_freeze` if it
/// committed, otherwise the index recorded in its aborted state.
pub fn highest_index_reached<K, V>(d: &Descriptor<K, V>) -> usize {
    let state = d.state.load(ORD_ACQ);
    if is_committed(state) {
        d.num_freeze
    } else if is_aborted(state) {
        aborted_index(state)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type D = Descriptor<i32, i32>;

    fn leaf(k: i32, v: i32, dummy: *mut D) -> Box<Node<i32, i32>> {
        Box::new(Node::new_leaf(k, v, dummy))
    }

    #[test]
    fn llx_on_fresh_leaf_returns_leaf() {
        let mut dummy = D::dummy();
        let dummy_ptr: *mut D = &mut dummy;
        let n = leaf(1, 10, dummy_ptr);
        match llx(&n) {
            LlxResult::Leaf => {}
            _ => panic!("expected Leaf"),
        }
    }

    #[test]
    fn llx_on_fresh_internal_returns_ok() {
        let mut dummy = D::dummy();
        let dummy_ptr: *mut D = &mut dummy;
        let l = Box::into_raw(leaf(1, 10, dummy_ptr));
        let r = Box::into_raw(leaf(2, 20, dummy_ptr));
        let internal = Node::new_internal(2, 0, l, r, dummy_ptr);
        match llx(&internal) {
            LlxResult::Ok { left, right, .. } => {
                assert_eq!(left, l);
                assert_eq!(right, r);
            }
            _ => panic!("expected Ok"),
        }
        unsafe {
            drop(Box::from_raw(l));
            drop(Box::from_raw(r));
        }
    }

    #[test]
    fn scx_commits_and_publishes_single_node_update() {
        let mut dummy = D::dummy();
        let dummy_ptr: *mut D = &mut dummy;
        let old_leaf = Box::into_raw(leaf(5, 1, dummy_ptr));
        let sibling = Box::into_raw(leaf(9, 2, dummy_ptr));
        let mut parent = Node::new_internal(9, 0, old_leaf, sibling, dummy_ptr);
        let parent_ptr: *mut Node<i32, i32> = &mut parent;

        let info = match llx(&parent) {
            LlxResult::Ok { info, .. } => info,
            _ => panic!("expected Ok"),
        };

        let new_leaf = Box::into_raw(leaf(5, 99, dummy_ptr));

        let mut nodes = UArray::new();
        nodes.push(parent_ptr);
        nodes.push(old_leaf);
        let mut info_seen = UArray::new();
        info_seen.push(info);

        let desc = Box::new(D::new_in_progress(
            nodes,
            info_seen,
            1,
            &parent.left,
            new_leaf,
        ));
        let desc_ptr = Box::into_raw(desc);

        let mut retired = UArray::new();
        let committed = scx(desc_ptr, &mut retired);
        assert!(committed);
        assert_eq!(parent.left.load(ORD_ACQ), new_leaf);

        unsafe {
            drop(Box::from_raw(desc_ptr));
            drop(Box::from_raw(old_leaf));
            drop(Box::from_raw(sibling));
            drop(Box::from_raw(new_leaf));
        }
    }
}
