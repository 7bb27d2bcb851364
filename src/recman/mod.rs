// SPDX-License-Identifier: Apache-2.0

//! Record Manager (C4): composes the epoch reclaimer (C1) with a typed
//! [`Pool`] per record kind and exposes the single façade the tree protocol
//! (C3) uses for every allocation and retirement. Parameterized over `K, V`
//! via concrete fields rather than a generic `allocate<T>`/`retire<T>`: the
//! two record kinds (`Node`, `Descriptor`) are known statically, so each
//! gets its own method and its own `Pool`, with no vtable on the hot path
//! (see the "Dynamic dispatch" design note).

use crate::reclaim::{Reclaimable, Reclaimer, Pool};
use crate::scx::{Descriptor, Node};

/// Either record kind, tagged with the pool it was allocated from so
/// [`Reclaimable::reclaim`] can hand it back without the reclaimer itself
/// knowing anything about pools.
enum Retired<K, V> {
    Node(*mut Node<K, V>, *const Pool<Node<K, V>>),
    Descriptor(*mut Descriptor<K, V>, *const Pool<Descriptor<K, V>>),
}

// SAFETY: both variants carry a raw pointer into structures reachable only
// through the epoch reclaimer's own synchronization, and a raw pointer to a
// `Pool` owned by the same `RecordManager` that owns this `Reclaimer`.
unsafe impl<K: Send, V: Send> Send for Retired<K, V> {}

impl<K, V> Reclaimable for Retired<K, V> {
    fn reclaim(self, tid: usize) {
        match self {
            // SAFETY: the pool pointer is valid for the lifetime of the
            // `RecordManager` that retired this object, which outlives any
            // in-flight reclamation (see `RecordManager`'s drop-order note).
            Retired::Node(p, pool) => unsafe { (*pool).recycle(tid, p) },
            Retired::Descriptor(p, pool) => unsafe { (*pool).recycle(tid, p) },
        }
    }
}

/// Composes C1 with per-record pools and exposes the façade the tree
/// protocol consumes: `init_thread`, `enter_quiescent`/`leave_quiescent`,
/// allocation, and retirement.
///
/// The pools are boxed rather than inline fields: a [`Retired`] value
/// sitting in an epoch bag carries a raw pointer straight at a `Pool`, and
/// that pointer must stay valid even if the `RecordManager` (and the `Tree`/
/// `Map` that owns it) is itself moved — e.g. into an `Arc` right after
/// construction. Boxing gives the pools a stable heap address independent
/// of wherever `RecordManager` ends up living.
pub struct RecordManager<K, V> {
    reclaimer: Reclaimer<Retired<K, V>>,
    nodes: Box<Pool<Node<K, V>>>,
    descriptors: Box<Pool<Descriptor<K, V>>>,
}

impl<K, V> RecordManager<K, V> {
    pub fn new(max_threads: usize) -> Self {
        Self {
            reclaimer: Reclaimer::new(max_threads),
            nodes: Box::new(Pool::new(max_threads)),
            descriptors: Box::new(Pool::new(max_threads)),
        }
    }

    /// Must be called once per thread before any other method. Leaves the
    /// thread in a quiescent state.
    pub fn init_thread(&self, tid: usize) {
        self.reclaimer.init_thread(tid);
    }

    #[inline]
    pub fn is_quiescent(&self, tid: usize) -> bool {
        self.reclaimer.is_quiescent(tid)
    }

    #[inline]
    pub fn enter_quiescent(&self, tid: usize) {
        self.reclaimer.enter_quiescent(tid);
    }

    #[inline]
    pub fn leave_quiescent(&self, tid: usize) {
        self.reclaimer.leave_quiescent(tid);
    }

    /// Allocates (or recycles) a node carrying `node`'s fields.
    pub fn alloc_node(&self, tid: usize, node: Node<K, V>) -> *mut Node<K, V> {
        self.nodes.allocate(tid, node)
    }

    /// Allocates (or recycles) a descriptor carrying `desc`'s fields.
    pub fn alloc_descriptor(&self, tid: usize, desc: Descriptor<K, V>) -> *mut Descriptor<K, V> {
        self.descriptors.allocate(tid, desc)
    }

    /// Hands a node that has been unreachable from the tree since this SCX
    /// committed to the epoch reclaimer. Precondition: `tid` is not
    /// quiescent.
    pub fn retire_node(&self, tid: usize, node: *mut Node<K, V>) {
        self.reclaimer
            .retire(tid, Retired::Node(node, &*self.nodes as *const _));
    }

    /// Hands a descriptor that has lost its last back-reference (I7) to the
    /// epoch reclaimer. Precondition: `tid` is not quiescent.
    pub fn retire_descriptor(&self, tid: usize, desc: *mut Descriptor<K, V>) {
        self.reclaimer
            .retire(tid, Retired::Descriptor(desc, &*self.descriptors as *const _));
    }

    /// Returns a node that was allocated for an SCX attempt that aborted
    /// before the node could become reachable from the tree. No reader could
    /// ever have observed it, so it is recycled immediately rather than
    /// going through the epoch reclaimer.
    pub fn dealloc_node(&self, tid: usize, node: *mut Node<K, V>) {
        self.nodes.deallocate(tid, node);
    }

    /// As [`Self::dealloc_node`], for a descriptor whose first freezing CAS
    /// never succeeded (so it never became reachable via any `info` field).
    pub fn dealloc_descriptor(&self, tid: usize, desc: *mut Descriptor<K, V>) {
        self.descriptors.deallocate(tid, desc);
    }
}
