// SPDX-License-Identifier: Apache-2.0

//! Per-thread-partitioned storage and ordering helpers.
//!
//! The reclaimer and the record manager both need an array indexed by thread
//! id where every slot is read by every thread but written only by its
//! owner. [`PerThread`] gives that shape a `Sync` impl without forcing every
//! slot behind its own lock.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::Ordering;

/// Relaxed load/store: no ordering is implied with any other memory location.
pub const ORD_RLX: Ordering = Ordering::Relaxed;
/// Acquire load, pairs with [`ORD_REL`].
pub const ORD_ACQ: Ordering = Ordering::Acquire;
/// Release store, pairs with [`ORD_ACQ`].
pub const ORD_REL: Ordering = Ordering::Release;
/// Full fence, used on the freezing CAS and the global epoch CAS.
pub const ORD_ACR: Ordering = Ordering::AcqRel;
/// Sequentially consistent, reserved for the rare operation that needs a
/// total order across all threads (the global epoch advance).
pub const ORD_SEQ: Ordering = Ordering::SeqCst;

/// An array of `N` cache-padded slots, one per thread, where thread `tid`
/// only ever writes `slot(tid)` but any thread may read any slot.
///
/// # Safety discipline
/// `PerThread` hands out `&T` and `&mut T`/interior-mutation access via
/// `slot`/`slot_mut`. Callers must uphold the partition: only the thread that
/// owns index `tid` may perform non-atomic mutation through `slot_mut(tid)`.
/// Concurrent readers of other slots must only perform operations that are
/// themselves safe under racing atomic access (i.e. `T`'s own interior
/// mutability, such as `AtomicUsize` fields).
pub struct PerThread<T> {
    slots: Box<[CachePadded<UnsafeCell<T>>]>,
}

// SAFETY: every slot is owned exclusively by one thread for writes; reads of
// other slots only ever touch the slot's own atomic fields (see call sites in
// `reclaim` and `recman`), so races on `UnsafeCell<T>` never produce a data
// race at the byte level.
unsafe impl<T: Send> Sync for PerThread<T> {}

impl<T> PerThread<T> {
    pub fn new<F: FnMut(usize) -> T>(count: usize, mut init: F) -> Self {
        let slots = (0..count)
            .map(|tid| CachePadded::new(UnsafeCell::new(init(tid))))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// # Safety
    /// The returned reference may only be used by the thread that owns
    /// `tid`, or in ways that are safe to race against that thread (reading
    /// through shared atomic fields of `T`).
    #[inline(always)]
    pub fn slot(&self, tid: usize) -> &T {
        unsafe { &*self.slots[tid].get() }
    }

    /// # Safety
    /// The caller must be the thread that owns `tid`; no other thread may be
    /// concurrently accessing this slot through `slot_mut`.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_mut(&self, tid: usize) -> &mut T {
        &mut *self.slots[tid].get()
    }
}

#[cfg(test)]
mod tests {
    use super::PerThread;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn each_thread_owns_its_slot() {
        let pt = Arc::new(PerThread::new(4, |_| AtomicUsize::new(0)));
        let mut handles = vec![];
        for tid in 0..4 {
            let pt = pt.clone();
            handles.push(thread::spawn(move || {
                pt.slot(tid).store(tid, Ordering::Relaxed);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for tid in 0..4 {
            assert_eq!(pt.slot(tid).load(Ordering::Relaxed), tid);
        }
    }
}
