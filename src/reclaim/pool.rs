// SPDX-License-Identifier: Apache-2.0

//! Per-record-type recycling pool: a per-thread free list with spillover to
//! a lock-free shared Treiber stack, so a churning workload mostly recycles
//! already-allocated [`crate::scx::Node`]/[`crate::scx::Descriptor`] blocks
//! instead of round-tripping through the global allocator. This is the
//! "pure optimization over `malloc`/`free`" named in §1/§4.1A: the
//! reclaimer's correctness does not depend on it, only its allocator
//! high-water mark does.
//!
//! The free-list link is embedded in the recycled block itself (the same
//! technique as a Cortex-M bump pool's intrusive freelist), rather than
//! wrapping every value in a separately-allocated stack node.

use crate::sync::{PerThread, ORD_ACQ, ORD_ACR, ORD_RLX};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::AtomicPtr;

/// Cap on how many free blocks a single thread holds onto locally before it
/// starts spilling over to the shared stack. Small and fixed: this is a
/// cache for allocation latency, not a long-term store.
const LOCAL_CAP: usize = 64;

#[repr(C)]
struct PoolNode<T> {
    // `value` must be the first field: a pointer to `PoolNode<T>` and a
    // pointer to its `value` are then the same address, so handing out
    // `*mut T` to callers and getting it back at `recycle` needs no offset
    // arithmetic, just a cast.
    value: MaybeUninit<T>,
    next: AtomicPtr<PoolNode<T>>,
}

/// A lock-free recycling pool for `T`, composed by [`crate::recman`] one per
/// record kind (`Node<K, V>`, `Descriptor<K, V>`).
pub struct Pool<T> {
    shared: AtomicPtr<PoolNode<T>>,
    local: PerThread<UnsafeCell<Vec<usize>>>,
}

// SAFETY: `shared` is a standard Treiber stack, safe to share. `local`'s
// per-slot Vec is only ever touched by the thread that owns that slot (see
// the safety discipline on `PerThread`); the addresses stored in it are
// `usize` so the Vec itself is trivially `Send`.
unsafe impl<T: Send> Sync for Pool<T> {}

impl<T> Pool<T> {
    pub fn new(num_threads: usize) -> Self {
        Self {
            shared: AtomicPtr::new(ptr::null_mut()),
            local: PerThread::new(num_threads, |_| UnsafeCell::new(Vec::new())),
        }
    }

    /// Returns a pointer to a `T` slot holding `value`, reusing a recycled
    /// block from thread `tid`'s local list or the shared stack when one is
    /// available, falling back to the allocator otherwise.
    pub fn allocate(&self, tid: usize, value: T) -> *mut T {
        let node = self.pop_local(tid).or_else(|| self.pop_shared()).unwrap_or_else(|| {
            Box::into_raw(Box::new(PoolNode {
                value: MaybeUninit::uninit(),
                next: AtomicPtr::new(ptr::null_mut()),
            }))
        });
        // SAFETY: `node` is either fresh (uninitialized `value`, about to be
        // written) or was returned by `recycle`, which already dropped its
        // old `value` in place before pushing it back.
        unsafe {
            (*node).value.as_mut_ptr().write(value);
        }
        node as *mut T
    }

    /// Drops the `T` at `obj` and returns its storage to this pool, for use
    /// once `obj` is no longer reachable by any in-flight operation.
    pub fn recycle(&self, tid: usize, obj: *mut T) {
        let node = obj as *mut PoolNode<T>;
        // SAFETY: caller guarantees `obj` was produced by `allocate` on this
        // pool and is not reachable from anywhere else anymore.
        unsafe {
            ptr::drop_in_place((*node).value.as_mut_ptr());
        }
        // SAFETY: tid is this reclaiming thread's own id; see PerThread's
        // safety discipline.
        let local = unsafe { &mut *self.local.slot(tid).get() };
        if local.len() < LOCAL_CAP {
            local.push(node as usize);
        } else {
            self.push_shared(node);
        }
    }

    /// Drops the `T` at `obj` and returns its storage to this pool
    /// immediately, without going through the epoch reclaimer. Only valid
    /// for objects that were never made reachable from the tree (a failed
    /// SCX's freshly built nodes, a descriptor that never froze anything).
    pub fn deallocate(&self, tid: usize, obj: *mut T) {
        self.recycle(tid, obj);
    }

    fn pop_local(&self, tid: usize) -> Option<*mut PoolNode<T>> {
        // SAFETY: tid is this thread's own id.
        let local = unsafe { &mut *self.local.slot(tid).get() };
        local.pop().map(|addr| addr as *mut PoolNode<T>)
    }

    fn pop_shared(&self) -> Option<*mut PoolNode<T>> {
        let mut head = self.shared.load(ORD_ACQ);
        loop {
            if head.is_null() {
                return None;
            }
            // SAFETY: nodes on the shared stack are only observed by other
            // `pop_shared`/`push_shared` callers, which never free them.
            let next = unsafe { (*head).next.load(ORD_RLX) };
            match self
                .shared
                .compare_exchange_weak(head, next, ORD_ACR, ORD_ACQ)
            {
                Ok(_) => return Some(head),
                Err(cur) => head = cur,
            }
        }
    }

    fn push_shared(&self, node: *mut PoolNode<T>) {
        let mut head = self.shared.load(ORD_ACQ);
        loop {
            // SAFETY: `node` was just exclusively popped or freshly built;
            // no other thread can be touching it.
            unsafe { (*node).next.store(head, ORD_RLX) };
            match self
                .shared
                .compare_exchange_weak(head, node, ORD_ACR, ORD_ACQ)
            {
                Ok(_) => return,
                Err(cur) => head = cur,
            }
        }
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        for tid in 0..self.local.len() {
            // SAFETY: `Pool` is being dropped, so no other thread can be
            // concurrently operating on any slot.
            let local = unsafe { &mut *self.local.slot(tid).get() };
            for addr in local.drain(..) {
                let node = addr as *mut PoolNode<T>;
                unsafe {
                    drop(Box::from_raw(node));
                }
            }
        }
        let mut head = self.shared.load(ORD_RLX);
        while !head.is_null() {
            let node = head;
            head = unsafe { (*node).next.load(ORD_RLX) };
            unsafe {
                drop(Box::from_raw(node));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_recycles_local_block() {
        let pool: Pool<u64> = Pool::new(1);
        let a = pool.allocate(0, 7);
        assert_eq!(unsafe { *a }, 7);
        pool.recycle(0, a);
        let b = pool.allocate(0, 9);
        assert_eq!(b, a, "expected the just-recycled block to be reused");
        assert_eq!(unsafe { *b }, 9);
        pool.recycle(0, b);
    }

    #[test]
    fn spillover_to_shared_stack_is_reusable_by_other_threads() {
        let pool: Pool<u64> = Pool::new(2);
        let mut blocks = Vec::new();
        for i in 0..(LOCAL_CAP as u64 + 4) {
            blocks.push(pool.allocate(0, i));
        }
        for b in blocks {
            pool.recycle(0, b);
        }
        // thread 1 should be able to pull spilled-over blocks even though it
        // never allocated on this pool before.
        let reused = pool.allocate(1, 42);
        assert_eq!(unsafe { *reused }, 42);
        pool.recycle(1, reused);
    }

    #[test]
    fn drop_in_place_runs_on_recycle() {
        use std::rc::Rc;
        let pool: Pool<Rc<()>> = Pool::new(1);
        let rc = Rc::new(());
        let a = pool.allocate(0, rc.clone());
        assert_eq!(Rc::strong_count(&rc), 2);
        pool.recycle(0, a);
        assert_eq!(Rc::strong_count(&rc), 1);
    }
}
