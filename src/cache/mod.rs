// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

//! The DMA-mapping page cache.
//!
//! Mappings installed through the external [`IommuMapper`](crate::iommu::IommuMapper) are
//! remembered here, indexed both by host page and by DMA page, so a driver that maps the same
//! host pages again gets the existing translation back instead of paying for a fresh one.
//! Unused mappings are only torn down once the cache grows past its budget, by an approximate
//! FIFO eviction pass.

mod batch;
mod entry;
mod fifo;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{error, warn};

use crate::cache::batch::UnmapBatch;
use crate::cache::entry::DmaMapping;
use crate::cache::fifo::EvictionFifo;
use crate::iommu::{DmaDirection, IommuMapper};

/* ---------------------------------------------------------------------------------------------- */

/// Budget as a percentage of the table's total IOMMU pages.
const MAX_CACHE_PERCENT: u64 = 75;

/// Extra pages drained past the high-water mark per eviction request, so eviction is not
/// re-triggered by the very next free.
const EVICT_THRESHOLD: i64 = 128;

/* ---------------------------------------------------------------------------------------------- */

/// The cache proper: dual indices, eviction FIFO, and the size budget.
///
/// Per-page granularity: a mapping of `npages` pages is cached as `npages` independent entries
/// with consecutive host and DMA page numbers. Entries are shared between the indices and the
/// FIFO through `Arc`s; which evictor gets to tear an entry down is decided solely by the
/// claim protocol on its reference count.
#[derive(Debug)]
pub(crate) struct MappingCache {
    /// Host page number -> head of the chain of entries mapped from that page.
    host_index: DashMap<u64, Arc<DmaMapping>>,
    /// DMA page number -> the single entry owning that page.
    dma_index: DashMap<u64, Arc<DmaMapping>>,
    fifo: EvictionFifo,
    /// Pages currently charged against the budget. Deliberately also counts failed
    /// insertions; see [`MappingCache::add`].
    size: AtomicI64,
    max_size: i64,
    page_shift: u32,
}

impl MappingCache {
    pub(crate) fn new(page_shift: u32, total_pages: u64) -> MappingCache {
        Self::with_max_size(page_shift, (MAX_CACHE_PERCENT * total_pages / 100) as i64)
    }

    /// The disabled configuration: a zero budget makes every operation degrade to the direct
    /// path in [`IommuTable`](crate::table::IommuTable).
    pub(crate) fn disabled(page_shift: u32) -> MappingCache {
        Self::with_max_size(page_shift, 0)
    }

    fn with_max_size(page_shift: u32, max_size: i64) -> MappingCache {
        MappingCache {
            host_index: DashMap::new(),
            dma_index: DashMap::new(),
            fifo: EvictionFifo::new(),
            size: AtomicI64::new(0),
            max_size,
            page_shift,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.max_size > 0
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Caches a freshly installed mapping of `npages` pages.
    ///
    /// May partially succeed: on an index conflict or publish failure the cache keeps the
    /// consistent prefix that made it in and drops the rest.
    pub(crate) fn add(
        &self,
        host_addr: usize,
        npages: usize,
        dma_addr: u64,
        direction: DmaDirection,
    ) {
        if npages == 0 {
            return;
        }

        // Charged up front, and not refunded on failure: failed insertions must still consume
        // budget, otherwise a saturated cache that keeps failing to insert never reaches the
        // eviction trigger.
        self.size.fetch_add(npages as i64, Ordering::Relaxed);

        let host_page = (host_addr as u64) >> self.page_shift;
        let dma_page = dma_addr >> self.page_shift;

        for i in 0..npages as u64 {
            let entry = Arc::new(DmaMapping::new(host_page + i, dma_page + i, direction));
            if !self.publish(entry) {
                break;
            }
        }
    }

    /// Publishes one entry into both indices and the FIFO.
    fn publish(&self, entry: Arc<DmaMapping>) -> bool {
        // Only one mapping may own a DMA page.
        match self.dma_index.entry(entry.dma_page) {
            Entry::Occupied(_) => {
                warn!(
                    "DMA page {:#x} is already cached; dropping the rest of the insertion",
                    entry.dma_page
                );
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&entry));
            }
        }

        // Many mappings may share a host page: the new entry becomes the chain head and the
        // previous head its successor.
        match self.host_index.entry(entry.host_page) {
            Entry::Occupied(mut head) => {
                *entry.chain_next.lock() = Some(Arc::clone(head.get()));
                head.insert(Arc::clone(&entry));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&entry));
            }
        }

        self.fifo.push_add(entry);
        true
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Looks for a cached mapping covering `npages` pages from `host_addr` with a compatible
    /// direction, taking one reference per page on success.
    ///
    /// Returns the DMA address of the range, or `None` if nothing usable is cached.
    pub(crate) fn lookup(
        &self,
        host_addr: usize,
        npages: usize,
        direction: DmaDirection,
    ) -> Option<u64> {
        if npages == 0 {
            return None;
        }

        let host_page = (host_addr as u64) >> self.page_shift;

        let mut current = self
            .host_index
            .get(&host_page)
            .map(|head| Arc::clone(head.value()));

        while let Some(entry) = current {
            if entry.host_page == host_page
                && entry.direction.covers(direction)
                && self.acquire_range(&entry, npages, direction)
            {
                return Some(entry.dma_page << self.page_shift);
            }

            current = entry.chain_next.lock().clone();
        }

        None
    }

    /// Acquires every page of the range starting at `first`, or nothing.
    ///
    /// The tail is checked from the highest offset down so a range whose far end is missing
    /// fails as early as possible.
    fn acquire_range(
        &self,
        first: &Arc<DmaMapping>,
        npages: usize,
        direction: DmaDirection,
    ) -> bool {
        if !first.try_acquire() {
            return false;
        }

        let mut acquired: Vec<Arc<DmaMapping>> = Vec::with_capacity(npages);
        acquired.push(Arc::clone(first));

        for i in (1..npages as u64).rev() {
            let tail = self
                .dma_index
                .get(&(first.dma_page + i))
                .map(|e| Arc::clone(e.value()))
                .filter(|e| {
                    e.host_page == first.host_page + i && e.direction.covers(direction)
                });

            let ok = match tail {
                Some(e) => {
                    if e.try_acquire() {
                        acquired.push(e);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };

            if !ok {
                for entry in &acquired {
                    entry.release();
                }
                return false;
            }
        }

        true
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Drops one reference per page of the range; pages the cache has never seen are unmapped
    /// directly. Evicts when the cache has grown past its budget.
    pub(crate) fn free(&self, mapper: &dyn IommuMapper, dma_addr: u64, npages: usize) {
        if npages == 0 {
            return;
        }

        let dma_page = dma_addr >> self.page_shift;
        let mut direct = UnmapBatch::with_capacity(npages).ok();

        for i in 0..npages as u64 {
            let page = dma_page + i;
            match self.dma_index.get(&page) {
                Some(entry) => entry.release(),
                None => match direct.as_mut() {
                    Some(batch) => batch.append(page),
                    // No batch buffer: fall back to unmapping page by page.
                    None => {
                        if let Err(e) = mapper.unmap_pages(page << self.page_shift, 1) {
                            error!("failed to unmap page at {:#x}: {}", page << self.page_shift, e);
                        }
                    }
                },
            }
        }

        if let Some(batch) = direct {
            batch.flush(mapper, self.page_shift);
        }

        let exceeding = self.size.load(Ordering::Relaxed) - self.max_size;
        if exceeding > 0 {
            self.clean(mapper, exceeding + EVICT_THRESHOLD);
        }
    }

    /* ------------------------------------------------------------------------------------------ */

    /// One eviction pass: reclaim up to `count` idle pages from the FIFO.
    ///
    /// Consumes the del-half, splicing the add-half over when the del-half is empty. Entries
    /// that win the claim are unlinked from both indices and their pages unmapped in coalesced
    /// runs; entries still in use are re-queued to the add-half.
    pub(crate) fn clean(&self, mapper: &dyn IommuMapper, count: i64) {
        if count <= 0 {
            return;
        }

        let mut list = self.fifo.take_del();
        if list.is_empty() {
            list = self.fifo.take_add();
        }
        if list.is_empty() {
            return;
        }

        let hint = count.min(self.size.load(Ordering::Relaxed).max(0)).max(1) as usize;
        let mut batch = match UnmapBatch::with_capacity(hint) {
            Ok(batch) => batch,
            Err(_) => {
                // No memory for the descriptors: put everything back and let the next free
                // retry the pass.
                self.fifo.reattach_del(list);
                return;
            }
        };

        let mut removed: i64 = 0;
        while removed < count {
            let Some(entry) = list.pop() else { break };

            if entry.try_claim() {
                self.unlink(&entry);
                batch.append(entry.dma_page);
                removed += 1;
            } else {
                // In use, or a sentinel: back off and re-queue.
                entry.unclaim();
                self.fifo.push_add(entry);
            }
        }

        self.fifo.reattach_del(list);
        self.size.fetch_sub(removed, Ordering::Relaxed);
        batch.flush(mapper, self.page_shift);
    }

    /// Removes a claimed entry from both indices.
    fn unlink(&self, entry: &Arc<DmaMapping>) {
        if self.dma_index.remove(&entry.dma_page).is_none() {
            error!("no DMA index entry for page {:#x}", entry.dma_page);
        }

        match self.host_index.entry(entry.host_page) {
            Entry::Occupied(mut head_slot) => {
                if Arc::ptr_eq(head_slot.get(), entry) {
                    // Head of the chain: republish the successor, or empty the slot.
                    match entry.chain_next.lock().clone() {
                        Some(successor) => {
                            head_slot.insert(successor);
                        }
                        None => {
                            head_slot.remove();
                        }
                    }
                } else {
                    // Walk with an explicit predecessor and splice the entry out. The entry's
                    // own chain_next stays intact so walkers already past the predecessor
                    // still reach the tail of the chain.
                    let mut predecessor = Arc::clone(head_slot.get());
                    loop {
                        let next = predecessor.chain_next.lock().clone();
                        match next {
                            Some(ref n) if Arc::ptr_eq(n, entry) => {
                                let successor = entry.chain_next.lock().clone();
                                *predecessor.chain_next.lock() = successor;
                                break;
                            }
                            Some(n) => predecessor = n,
                            None => {
                                error!(
                                    "entry for host page {:#x} missing from its chain",
                                    entry.host_page
                                );
                                break;
                            }
                        }
                    }
                }
            }
            Entry::Vacant(_) => {
                error!("no chain for host page {:#x}", entry.host_page);
            }
        }
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Drains everything. The caller guarantees quiescence; entries whose count never reaches
    /// zero are a caller bug and are reported, not waited for.
    pub(crate) fn destroy(&self, mapper: &dyn IommuMapper) {
        let mut stalled = 0;
        while !self.dma_index.is_empty() && stalled < 2 {
            let before = self.dma_index.len();
            self.clean(mapper, before as i64 + 1);

            // A pass that only shuffled sentinels between the halves makes no progress; two
            // such passes in a row mean nothing claimable is left.
            if self.dma_index.len() < before {
                stalled = 0;
            } else {
                stalled += 1;
            }
        }

        if !self.dma_index.is_empty() {
            error!(
                "{} mappings still referenced at teardown",
                self.dma_index.len()
            );
        }

        self.dma_index.clear();
        self.host_index.clear();
        self.size.store(0, Ordering::Relaxed);
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
