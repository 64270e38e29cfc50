// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::io;
use std::sync::Arc;

use log::error;

use crate::cache::MappingCache;
use crate::iommu::{DmaDirection, IommuMapper};

/* ---------------------------------------------------------------------------------------------- */

/// A device's IOMMU translation table, with the DMA-mapping cache attached.
///
/// This is the handle every cache operation goes through: it carries the page-size constant,
/// the backend that performs real map/unmap work, and the cache state. One table per IOMMU
/// context; mappings are not shared across tables.
///
/// All methods take `&self` and may be called concurrently from any thread. Dropping the table
/// drains the cache, unmapping everything that is no longer referenced; the exclusive access
/// implied by the drop is what guarantees no operation is still in flight.
#[derive(Debug)]
pub struct IommuTable {
    mapper: Arc<dyn IommuMapper>,
    cache: MappingCache,
    page_shift: u32,
    total_pages: u64,
}

impl IommuTable {
    /// Creates a table whose cache may hold up to 75% of `total_pages` mapped pages.
    ///
    /// `page_shift` is the log2 of the IOMMU page size (12 for 4 KiB pages); `total_pages` is
    /// the size of the device's DMA window in pages.
    pub fn new(mapper: Arc<dyn IommuMapper>, page_shift: u32, total_pages: u64) -> IommuTable {
        IommuTable {
            cache: MappingCache::new(page_shift, total_pages),
            mapper,
            page_shift,
            total_pages,
        }
    }

    /// Creates a table with the cache disabled: every operation takes the direct path to the
    /// backend, nothing is remembered.
    pub fn uncached(mapper: Arc<dyn IommuMapper>, page_shift: u32) -> IommuTable {
        IommuTable {
            cache: MappingCache::disabled(page_shift),
            mapper,
            page_shift,
            total_pages: 0,
        }
    }

    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    pub fn total_pages(&self) -> u64 {
        self.total_pages
    }

    /* ------------------------------------------------------------------------------------------ */

    /// Maps `npages` host pages for DMA, reusing a cached translation when one with a
    /// compatible direction exists.
    ///
    /// Each successful `map` must eventually be balanced by one [`free`](IommuTable::free) of
    /// the returned range.
    pub fn map(
        &self,
        host_addr: usize,
        npages: usize,
        direction: DmaDirection,
    ) -> io::Result<u64> {
        if npages == 0 {
            return Ok(0);
        }

        if let Some(dma_addr) = self.cache_use(host_addr, npages, direction) {
            return Ok(dma_addr);
        }

        let dma_addr = self.mapper.map_pages(host_addr, npages, direction)?;
        self.cache_add(host_addr, npages, dma_addr, direction);

        Ok(dma_addr)
    }

    /// Caches an already-installed mapping so later [`map`](IommuTable::map) or
    /// [`cache_use`](IommuTable::cache_use) calls can reuse it. No-op when the cache is
    /// disabled.
    pub fn cache_add(
        &self,
        host_addr: usize,
        npages: usize,
        dma_addr: u64,
        direction: DmaDirection,
    ) {
        if self.cache.is_enabled() {
            self.cache.add(host_addr, npages, dma_addr, direction);
        }
    }

    /// Looks up a cached mapping of `npages` pages at `host_addr` usable for `direction`.
    ///
    /// On a hit, a reference per page is taken and the caller owes a matching
    /// [`free`](IommuTable::free). Always `None` when the cache is disabled.
    pub fn cache_use(
        &self,
        host_addr: usize,
        npages: usize,
        direction: DmaDirection,
    ) -> Option<u64> {
        if self.cache.is_enabled() {
            self.cache.lookup(host_addr, npages, direction)
        } else {
            None
        }
    }

    /// Releases a mapped range.
    ///
    /// Cached pages just lose a reference and stay mapped for reuse until eviction; pages the
    /// cache does not know are unmapped immediately. With the cache disabled this forwards
    /// straight to the backend.
    pub fn free(&self, dma_addr: u64, npages: usize) {
        if npages == 0 {
            return;
        }

        if self.cache.is_enabled() {
            self.cache.free(&*self.mapper, dma_addr, npages);
        } else if let Err(e) = self.mapper.unmap_pages(dma_addr, npages) {
            error!("failed to unmap {} pages at {:#x}: {}", npages, dma_addr, e);
        }
    }

    /// Tears the table down, unmapping every cached page.
    ///
    /// Equivalent to dropping the table; provided so teardown can be spelled out at call
    /// sites. The caller must have freed every mapped range first.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for IommuTable {
    fn drop(&mut self) {
        self.cache.destroy(&*self.mapper);
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    use crate::iommu::DmaDirection::ToDevice;
    use crate::mocks::MockIommuMapper;

    #[test]
    fn test_map_memoizes_translations() {
        let mut mapper = MockIommuMapper::new();
        mapper
            .expect_map_pages()
            .with(eq(0x1000), eq(2), eq(ToDevice))
            .times(1)
            .returning(|_, _, _| Ok(0xd000));
        mapper.expect_unmap_pages().returning(|_, _| Ok(()));

        let table = IommuTable::new(Arc::new(mapper), 12, 100);

        // Second map is served from the cache; the backend sees only one map_pages call.
        assert_eq!(table.map(0x1000, 2, ToDevice).unwrap(), 0xd000);
        assert_eq!(table.map(0x1000, 2, ToDevice).unwrap(), 0xd000);

        table.free(0xd000, 2);
        table.free(0xd000, 2);
    }

    #[test]
    fn test_map_of_zero_pages_never_reaches_the_backend() {
        // No expectations set: any backend call would fail the test.
        let mapper = MockIommuMapper::new();
        let table = IommuTable::new(Arc::new(mapper), 12, 100);

        assert_eq!(table.map(0x1000, 0, ToDevice).unwrap(), 0);
    }

    #[test]
    fn test_map_failure_is_propagated() {
        let mut mapper = MockIommuMapper::new();
        mapper
            .expect_map_pages()
            .returning(|_, _, _| Err(std::io::Error::new(std::io::ErrorKind::Other, "no space")));

        let table = IommuTable::new(Arc::new(mapper), 12, 100);

        assert!(table.map(0x1000, 2, ToDevice).is_err());
        assert_eq!(table.cache_use(0x1000, 2, ToDevice), None);
    }

    #[test]
    fn test_uncached_table_takes_the_direct_path() {
        let mut mapper = MockIommuMapper::new();
        mapper
            .expect_unmap_pages()
            .with(eq(0xd000), eq(4))
            .times(1)
            .returning(|_, _| Ok(()));

        let table = IommuTable::uncached(Arc::new(mapper), 12);

        // Nothing is remembered...
        table.cache_add(0x1000, 4, 0xd000, ToDevice);
        assert_eq!(table.cache_use(0x1000, 4, ToDevice), None);

        // ...and free forwards the whole range to the backend.
        table.free(0xd000, 4);
    }

    #[test]
    fn test_uncached_map_always_calls_the_backend() {
        let mut mapper = MockIommuMapper::new();
        mapper
            .expect_map_pages()
            .times(2)
            .returning(|_, _, _| Ok(0xd000));

        let table = IommuTable::uncached(Arc::new(mapper), 12);

        assert_eq!(table.map(0x1000, 1, ToDevice).unwrap(), 0xd000);
        assert_eq!(table.map(0x1000, 1, ToDevice).unwrap(), 0xd000);
    }

    #[test]
    fn test_destroy_unmaps_cached_pages() {
        let mut mapper = MockIommuMapper::new();
        mapper
            .expect_map_pages()
            .returning(|_, _, _| Ok(0xd000));
        mapper
            .expect_unmap_pages()
            .with(eq(0xd000), eq(1))
            .times(1)
            .returning(|_, _| Ok(()));

        let table = IommuTable::new(Arc::new(mapper), 12, 100);
        let dma = table.map(0x1000, 1, ToDevice).unwrap();
        table.free(dma, 1);
        table.destroy();
    }
}

/* ---------------------------------------------------------------------------------------------- */
