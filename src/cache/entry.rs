// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::iommu::DmaDirection;

/* ---------------------------------------------------------------------------------------------- */

/// Bias subtracted from `count` to claim an entry for removal.
///
/// Must exceed any plausible number of live references, so that `count - REMOVING_BIAS` of an
/// in-use entry can never collide with the claimed state of an idle one.
pub(crate) const REMOVING_BIAS: i64 = 0x0DEA_DBEE;

/* ---------------------------------------------------------------------------------------------- */

/// A single cached page mapping: one host page translated to one DMA page.
///
/// An entry is immutable once published except for `count` (the reference protocol),
/// `fifo_next` (owned by whichever FIFO half currently holds the entry), and `chain_next`
/// (mutated only under the host-index entry guard for `host_page`).
///
/// `count` encodes three regimes: `n >= 1` means n holders; `0` means idle and evictable;
/// `-REMOVING_BIAS` means an evictor has claimed the entry and it must not be re-acquired.
#[derive(Debug)]
pub(crate) struct DmaMapping {
    pub(crate) host_page: u64,
    pub(crate) dma_page: u64,
    pub(crate) direction: DmaDirection,
    count: AtomicI64,
    pub(crate) fifo_next: AtomicPtr<DmaMapping>,
    pub(crate) chain_next: Mutex<Option<Arc<DmaMapping>>>,
    #[cfg(feature = "event-log")]
    events: Mutex<Vec<&'static str>>,
}

impl DmaMapping {
    pub(crate) fn new(host_page: u64, dma_page: u64, direction: DmaDirection) -> DmaMapping {
        DmaMapping {
            host_page,
            dma_page,
            direction,
            count: AtomicI64::new(1),
            fifo_next: AtomicPtr::new(std::ptr::null_mut()),
            chain_next: Mutex::new(None),
            #[cfg(feature = "event-log")]
            events: Mutex::new(Vec::new()),
        }
    }

    /// A pinned entry that keeps a FIFO half non-empty.
    ///
    /// Its count starts at 1 and is never released, so a claim on it always fails and the
    /// evictor just re-queues it.
    pub(crate) fn sentinel() -> DmaMapping {
        DmaMapping {
            host_page: u64::MAX,
            dma_page: u64::MAX,
            direction: DmaDirection::None,
            count: AtomicI64::new(1),
            fifo_next: AtomicPtr::new(std::ptr::null_mut()),
            chain_next: Mutex::new(None),
            #[cfg(feature = "event-log")]
            events: Mutex::new(Vec::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_sentinel(&self) -> bool {
        self.host_page == u64::MAX && self.dma_page == u64::MAX
    }

    /// Takes a reference on the entry unless it has been claimed for removal.
    ///
    /// Atomic fetch-add-unless: increments `count` iff it is not `-REMOVING_BIAS`.
    pub(crate) fn try_acquire(&self) -> bool {
        let acquired = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c == -REMOVING_BIAS {
                    None
                } else {
                    Some(c + 1)
                }
            })
            .is_ok();

        if acquired {
            self.log_event("acquire");
        }
        acquired
    }

    /// Drops one reference. The entry becomes evictable once `count` reaches 0.
    pub(crate) fn release(&self) {
        self.count.fetch_sub(1, Ordering::Release);
        self.log_event("release");
    }

    /// Attempts to take exclusive ownership for removal.
    ///
    /// Succeeds iff `count` was exactly 0. On failure the entry is in use and the caller must
    /// [`unclaim`](DmaMapping::unclaim) it and re-queue it.
    pub(crate) fn try_claim(&self) -> bool {
        let prior = self.count.fetch_sub(REMOVING_BIAS, Ordering::AcqRel);
        if prior == 0 {
            self.log_event("claim");
            true
        } else {
            false
        }
    }

    /// Undoes a failed [`try_claim`](DmaMapping::try_claim).
    pub(crate) fn unclaim(&self) {
        self.count.fetch_add(REMOVING_BIAS, Ordering::AcqRel);
        self.log_event("unclaim");
    }

    #[cfg(test)]
    pub(crate) fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    #[cfg(feature = "event-log")]
    fn log_event(&self, event: &'static str) {
        self.events.lock().push(event);
    }

    #[cfg(feature = "event-log")]
    #[allow(dead_code)]
    pub(crate) fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }

    #[cfg(not(feature = "event-log"))]
    #[inline]
    fn log_event(&self, _event: &'static str) {}
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_round_trip() {
        let e = DmaMapping::new(0x10, 0xd0, DmaDirection::ToDevice);
        assert_eq!(e.count(), 1);

        assert!(e.try_acquire());
        assert_eq!(e.count(), 2);

        e.release();
        e.release();
        assert_eq!(e.count(), 0);
    }

    #[test]
    fn test_claim_succeeds_only_when_idle() {
        let e = DmaMapping::new(0x10, 0xd0, DmaDirection::ToDevice);

        // One holder: claim must fail and be undone.
        assert!(!e.try_claim());
        e.unclaim();
        assert_eq!(e.count(), 1);

        e.release();
        assert!(e.try_claim());
        assert_eq!(e.count(), -REMOVING_BIAS);
    }

    #[test]
    fn test_acquire_fails_after_claim() {
        let e = DmaMapping::new(0x10, 0xd0, DmaDirection::ToDevice);
        e.release();
        assert!(e.try_claim());

        assert!(!e.try_acquire());
        assert_eq!(e.count(), -REMOVING_BIAS);
    }

    #[test]
    fn test_claim_fails_against_concurrent_acquire() {
        // An acquire that lands before the claim pushes the observed prior value above 0,
        // so the claim backs off and the acquired reference stays valid.
        let e = DmaMapping::new(0x10, 0xd0, DmaDirection::ToDevice);
        e.release();

        assert!(e.try_acquire());
        assert!(!e.try_claim());
        e.unclaim();
        assert_eq!(e.count(), 1);
    }

    #[test]
    fn test_sentinel_is_never_claimable() {
        let s = DmaMapping::sentinel();
        assert!(s.is_sentinel());
        assert!(!s.try_claim());
        s.unclaim();
        assert_eq!(s.count(), 1);
    }

    #[cfg(feature = "event-log")]
    #[test]
    fn test_event_log_records_reference_events() {
        let e = DmaMapping::new(0x10, 0xd0, DmaDirection::ToDevice);
        assert!(e.try_acquire());
        e.release();
        e.release();
        assert!(e.try_claim());
        assert_eq!(e.events(), vec!["acquire", "release", "release", "claim"]);
    }
}

/* ---------------------------------------------------------------------------------------------- */
