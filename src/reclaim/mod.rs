// SPDX-License-Identifier: Apache-2.0

//! Epoch-based reclamation (DEBRA-style).
//!
//! A single monotonically increasing global epoch, incremented by 2 so its
//! low bit is free to double as a thread's quiescent flag, partitions time.
//! An object retired while the epoch was `e` is only handed back to the
//! caller's [`Reclaimable::reclaim`] once every thread has been observed at
//! epoch `>= e + 2` or quiescent, which [`Reclaimer::leave_quiescent`]
//! enforces by rotating three per-thread bags and incrementally polling
//! other threads rather than taking a global snapshot on every call.

mod bag;
mod pool;

pub use pool::Pool;

use crate::sync::{PerThread, ORD_ACQ, ORD_REL};
use bag::ThreadBags;
use log::trace;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of `leave_quiescent` calls between round-robin liveness checks of
/// other threads. Mirrors the reference reclaimer's amortized scan: checking
/// one other thread every `OPS_BEFORE_CHECK` calls bounds the cost any single
/// call pays while still completing a full sweep in bounded time.
const OPS_BEFORE_CHECK: usize = 20;

/// Number of rotating per-thread epoch bags. Three bags let a thread keep
/// retiring into the newest bag while a two-epochs-old bag is reclaimed.
const NUM_EPOCH_BAGS: usize = 3;

/// The low bit of every announced-epoch word is reserved for the quiescent
/// flag; the global epoch therefore only ever takes even values.
const QUIESCENT_BIT: usize = 1;
const EPOCH_MASK: usize = !QUIESCENT_BIT;

/// An object that can be handed back to its owner once it is no longer
/// reachable by any in-flight operation.
///
/// Implemented as a plain trait rather than exposed through `dyn` so that
/// reclamation of [`crate::scx::Node`] and [`crate::scx::Descriptor`] stays a
/// direct call, not a vtable indirection. `tid` is the thread currently
/// running [`Reclaimer::leave_quiescent`] (the thread performing the
/// reclamation, not necessarily the one that retired the object), which a
/// [`Pool`]-backed implementation uses to prefer that thread's own local
/// free list over the shared spillover stack.
pub trait Reclaimable {
    fn reclaim(self, tid: usize);
}

/// The epoch reclaimer. Generic over the retired object type so a
/// [`crate::recman::RecordManager`] can compose one reclaimer per record kind
/// (or, as it does, a single reclaimer over a small enum of every kind it
/// manages) without dynamic dispatch.
pub struct Reclaimer<T> {
    epoch: AtomicUsize,
    announced: PerThread<AtomicUsize>,
    bags: PerThread<ThreadBags<T>>,
    num_threads: usize,
}

impl<T: Reclaimable> Reclaimer<T> {
    pub fn new(num_threads: usize) -> Self {
        Self {
            epoch: AtomicUsize::new(0),
            announced: PerThread::new(num_threads, |_| AtomicUsize::new(QUIESCENT_BIT)),
            bags: PerThread::new(num_threads, |tid| ThreadBags::new(tid, num_threads)),
            num_threads,
        }
    }

    /// Must be called once by thread `tid` before any other method. Leaves
    /// the thread in a quiescent state.
    pub fn init_thread(&self, tid: usize) {
        self.enter_quiescent(tid);
    }

    #[inline]
    pub fn is_quiescent(&self, tid: usize) -> bool {
        self.announced.slot(tid).load(ORD_ACQ) & QUIESCENT_BIT != 0
    }

    /// Announces that thread `tid` holds no reference into the structure.
    #[inline]
    pub fn enter_quiescent(&self, tid: usize) {
        std::sync::atomic::compiler_fence(Ordering::SeqCst);
        self.announced.slot(tid).fetch_or(QUIESCENT_BIT, ORD_REL);
    }

    /// Announces that thread `tid` is about to begin dereferencing shared
    /// structure, rotates its bags if the global epoch has moved on since it
    /// last checked, and occasionally advances the global epoch itself.
    pub fn leave_quiescent(&self, tid: usize) {
        let e = self.epoch.load(ORD_ACQ);
        // SAFETY: only thread `tid` calls this with its own id.
        let bags = unsafe { self.bags.slot_mut(tid) };

        if bags.last_epoch != e {
            bags.rotate(tid);
            bags.last_epoch = e;
            bags.checked = 0;
            bags.check_idx = bag::first_other(tid, self.num_threads);
            trace!("reclaim: thread {tid} observed epoch advance to {e}");
        }

        self.announced.slot(tid).store(e, ORD_REL);
        std::sync::atomic::compiler_fence(Ordering::SeqCst);

        bags.ops = bags.ops.wrapping_add(1);
        if self.num_threads > 1 && bags.ops % OPS_BEFORE_CHECK == 0 {
            self.scan_and_maybe_advance(tid, e, bags);
        }
    }

    fn scan_and_maybe_advance(&self, tid: usize, e: usize, bags: &mut ThreadBags<T>) {
        let other = bags.check_idx;
        if other != tid {
            let w = self.announced.slot(other).load(ORD_ACQ);
            let quiescent = w & QUIESCENT_BIT != 0;
            let other_epoch = w & EPOCH_MASK;
            if quiescent || other_epoch >= e {
                // `other` is confirmed caught up; only now does the scan
                // move on and count toward the threshold. A stalled thread
                // is re-checked on every call instead of being skipped over.
                bags.checked += 1;
                bags.check_idx = bag::next_other(bags.check_idx, tid, self.num_threads);

                if bags.checked >= self.num_threads.saturating_sub(1) {
                    if self
                        .epoch
                        .compare_exchange(e, e + 2, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                    {
                        trace!("reclaim: thread {tid} advanced global epoch {e} -> {}", e + 2);
                    }
                    bags.checked = 0;
                }
            }
        }
    }

    /// Hands `obj` to the reclaimer. Precondition: `tid` is not quiescent.
    pub fn retire(&self, tid: usize, obj: T) {
        debug_assert!(
            !self.is_quiescent(tid),
            "retire called while thread {tid} is quiescent"
        );
        // SAFETY: only thread `tid` calls this with its own id.
        let bags = unsafe { self.bags.slot_mut(tid) };
        bags.retire(obj);
    }

    #[cfg(test)]
    fn epoch(&self) -> usize {
        self.epoch.load(ORD_ACQ)
    }

    #[cfg(test)]
    fn pending(&self, tid: usize) -> usize {
        self.bags.slot(tid).pending_len()
    }
}

impl<T: Reclaimable> Drop for Reclaimer<T> {
    /// Drains every thread's bags, reclaiming anything still pending
    /// regardless of epoch. Safe only because `Drop` has exclusive access:
    /// nothing can still be dereferencing these objects by the time a
    /// `Reclaimer` itself is torn down.
    fn drop(&mut self) {
        for tid in 0..self.num_threads {
            // SAFETY: exclusive access via `&mut self`.
            let bags = unsafe { self.bags.slot_mut(tid) };
            bags.drain_all(tid);
        }
    }
}

pub(crate) const _NUM_EPOCH_BAGS: usize = NUM_EPOCH_BAGS;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Counted(Rc<Cell<usize>>);
    impl Reclaimable for Counted {
        fn reclaim(self, _tid: usize) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn single_thread_round_trips_without_advancing() {
        let r: Reclaimer<Counted> = Reclaimer::new(1);
        r.init_thread(0);
        r.leave_quiescent(0);
        let freed = Rc::new(Cell::new(0));
        r.retire(0, Counted(freed.clone()));
        assert_eq!(freed.get(), 0);
        r.enter_quiescent(0);
    }

    #[test]
    fn quiescence_lets_epoch_advance_and_bags_drain() {
        let n = 4;
        let r: Reclaimer<Counted> = Reclaimer::new(n);
        for tid in 0..n {
            r.init_thread(tid);
        }
        let freed = Rc::new(Cell::new(0));

        for tid in 0..n {
            r.leave_quiescent(tid);
            r.retire(tid, Counted(freed.clone()));
        }
        assert_eq!(freed.get(), 0, "nothing reclaimed before any epoch advance");

        // drive enough leave/enter cycles (with every thread quiescent in
        // between) that the round-robin scan completes and the epoch moves
        // forward twice, which is what it takes for a bag to become the
        // "two epochs ago" bag and get drained.
        for _ in 0..(super::OPS_BEFORE_CHECK * n * 4) {
            for tid in 0..n {
                r.enter_quiescent(tid);
                r.leave_quiescent(tid);
            }
        }
        assert!(r.epoch() >= 2, "epoch should have advanced: {}", r.epoch());
        for tid in 0..n {
            assert_eq!(r.pending(tid), 0, "thread {tid} still holds retired objects");
        }
        assert!(freed.get() >= n, "objects should have been reclaimed");
    }
}
