// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::cache::entry::DmaMapping;

/* ---------------------------------------------------------------------------------------------- */

/// The eviction FIFO: two lock-free singly-linked halves.
///
/// All insertion goes to the add-half; the evictor consumes the del-half and, when that comes
/// up empty, splices the whole add-half over in one exchange. Within a spliced batch the
/// relative order reverses (lock-free stack), which is fine: eviction order is only
/// approximately insertion order.
///
/// Entries are linked through their `fifo_next` field. Every non-null pointer reachable from a
/// half's head is an owned strong `Arc` reference; an entry is reachable from at most one half
/// at a time, so the containing list exclusively owns each `fifo_next` link.
///
/// One pinned sentinel is installed in each half at construction so neither list starts empty.
/// Sentinels are ordinary unclaimable entries: the evictor's claim on them fails and they are
/// re-queued to the add-half like any in-use entry.
#[derive(Debug)]
pub(crate) struct EvictionFifo {
    add_half: AtomicPtr<DmaMapping>,
    del_half: AtomicPtr<DmaMapping>,
}

impl EvictionFifo {
    pub(crate) fn new() -> EvictionFifo {
        let fifo = EvictionFifo {
            add_half: AtomicPtr::new(ptr::null_mut()),
            del_half: AtomicPtr::new(ptr::null_mut()),
        };

        Self::push(&fifo.add_half, Arc::new(DmaMapping::sentinel()));
        Self::push(&fifo.del_half, Arc::new(DmaMapping::sentinel()));

        fifo
    }

    /// Prepends an entry to the add-half.
    pub(crate) fn push_add(&self, entry: Arc<DmaMapping>) {
        Self::push(&self.add_half, entry);
    }

    fn push(head: &AtomicPtr<DmaMapping>, entry: Arc<DmaMapping>) {
        let node = Arc::into_raw(entry) as *mut DmaMapping;
        let mut current = head.load(Ordering::Acquire);

        loop {
            // The node is not yet shared; the Release on the successful exchange publishes
            // this link together with it.
            unsafe { (*node).fifo_next.store(current, Ordering::Relaxed) };

            match head.compare_exchange_weak(current, node, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Detaches the entire del-half.
    pub(crate) fn take_del(&self) -> Detached {
        Detached(self.del_half.swap(ptr::null_mut(), Ordering::AcqRel))
    }

    /// Splices the entire add-half out, for when the del-half came up empty.
    pub(crate) fn take_add(&self) -> Detached {
        Detached(self.add_half.swap(ptr::null_mut(), Ordering::AcqRel))
    }

    /// Re-attaches an unwalked chain to the del-half.
    ///
    /// Anything another evictor put there in the meantime is appended behind the re-attached
    /// chain rather than dropped, so concurrent eviction passes only duplicate work.
    pub(crate) fn reattach_del(&self, chain: Detached) {
        let head = chain.into_raw();
        if head.is_null() {
            return;
        }

        // We own the chain, so walking it unsynchronized is fine.
        let mut tail = head;
        loop {
            let next = unsafe { (*tail).fifo_next.load(Ordering::Relaxed) };
            if next.is_null() {
                break;
            }
            tail = next;
        }

        let mut current = self.del_half.load(Ordering::Acquire);
        loop {
            unsafe { (*tail).fifo_next.store(current, Ordering::Relaxed) };

            match self
                .del_half
                .compare_exchange_weak(current, head, Ordering::Release, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Drop for EvictionFifo {
    fn drop(&mut self) {
        // Consume both halves so the owned Arc references are dropped.
        drop(self.take_del());
        drop(self.take_add());
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// A chain detached from one of the FIFO halves.
///
/// Owns one strong `Arc` reference per linked entry. Popping transfers that ownership to the
/// caller; dropping a non-empty chain releases whatever was not consumed.
#[derive(Debug)]
pub(crate) struct Detached(*mut DmaMapping);

impl Detached {
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_null()
    }

    /// Takes the first entry off the chain, clearing its `fifo_next` link so a later re-queue
    /// starts from a clean node.
    pub(crate) fn pop(&mut self) -> Option<Arc<DmaMapping>> {
        if self.0.is_null() {
            return None;
        }

        // SAFETY: the head pointer is an owned strong reference that the shared structure can
        // no longer reach; `from_raw` takes that ownership back.
        let entry = unsafe { Arc::from_raw(self.0) };
        self.0 = entry.fifo_next.swap(ptr::null_mut(), Ordering::Relaxed);
        Some(entry)
    }

    fn into_raw(mut self) -> *mut DmaMapping {
        mem::replace(&mut self.0, ptr::null_mut())
    }
}

impl Drop for Detached {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

// SAFETY: the raw head pointer stands for owned `Arc<DmaMapping>` references, which are Send
// and Sync; the chain itself is exclusively owned by the holder.
unsafe impl Send for Detached {}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iommu::DmaDirection;

    fn entry(dma_page: u64) -> Arc<DmaMapping> {
        Arc::new(DmaMapping::new(dma_page, dma_page, DmaDirection::ToDevice))
    }

    fn drain(mut chain: Detached) -> Vec<u64> {
        let mut pages = Vec::new();
        while let Some(e) = chain.pop() {
            pages.push(e.dma_page);
        }
        pages
    }

    #[test]
    fn test_halves_start_with_one_sentinel_each() {
        let fifo = EvictionFifo::new();

        let del = drain(fifo.take_del());
        let add = drain(fifo.take_add());

        assert_eq!(del, vec![u64::MAX]);
        assert_eq!(add, vec![u64::MAX]);
    }

    #[test]
    fn test_push_is_lifo_within_a_batch() {
        let fifo = EvictionFifo::new();
        for page in 1..=3 {
            fifo.push_add(entry(page));
        }

        // Newest first, sentinel last.
        assert_eq!(drain(fifo.take_add()), vec![3, 2, 1, u64::MAX]);
    }

    #[test]
    fn test_popped_entry_has_clean_link() {
        let fifo = EvictionFifo::new();
        fifo.push_add(entry(1));

        let mut chain = fifo.take_add();
        let e = chain.pop().unwrap();
        assert!(e.fifo_next.load(Ordering::Relaxed).is_null());

        // Re-queueing the popped entry must not resurrect its old successors.
        fifo.push_add(e);
        assert_eq!(drain(fifo.take_add()), vec![1]);
    }

    #[test]
    fn test_reattach_appends_existing_content_behind_chain() {
        let fifo = EvictionFifo::new();
        fifo.push_add(entry(1));
        fifo.push_add(entry(2));
        let remainder = fifo.take_add();

        fifo.push_add(entry(3));
        let other = fifo.take_add();
        fifo.reattach_del(other);

        // [2, 1, sentinel] goes in front of what already sat in the del-half.
        fifo.reattach_del(remainder);
        assert_eq!(drain(fifo.take_del()), vec![2, 1, u64::MAX, 3, u64::MAX]);
    }

    #[test]
    fn test_reattach_empty_chain_is_a_no_op() {
        let fifo = EvictionFifo::new();
        let empty = fifo.take_del();
        let sentinel = drain(empty);
        assert_eq!(sentinel, vec![u64::MAX]);

        fifo.reattach_del(fifo.take_del());
        assert!(fifo.take_del().is_empty());
    }

    #[test]
    fn test_concurrent_pushes_lose_nothing() {
        let fifo = Arc::new(EvictionFifo::new());
        let threads = 4u64;
        let per_thread = 1000u64;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let fifo = Arc::clone(&fifo);
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        fifo.push_add(entry(t * per_thread + i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut pages = drain(fifo.take_add());
        pages.retain(|&p| p != u64::MAX);
        pages.sort_unstable();
        let expected: Vec<u64> = (0..threads * per_thread).collect();
        assert_eq!(pages, expected);
    }
}

/* ---------------------------------------------------------------------------------------------- */
