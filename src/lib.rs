// SPDX-License-Identifier: MIT OR Apache-2.0

//! A DMA-mapping page cache for user-space PCI and PCIe drivers.
//!
//! Installing an IOMMU translation is expensive: with a VFIO backend it is at least one
//! syscall, and the IOMMU driver may need to shoot down TLBs on top. Drivers that stream I/O
//! through a bounded set of buffers end up installing the same translations over and over.
//! This crate memoises them: the first mapping of a host page range goes through the real
//! backend, and as long as the cached mapping's DMA direction is compatible, later requests
//! for the same pages get the existing DMA address back immediately. Unused mappings are only
//! torn down when the cache outgrows its budget, by an approximate-FIFO eviction pass that
//! batches and coalesces the unmaps.
//!
//! The entry point is [`IommuTable`](table::IommuTable), one per IOMMU context. It needs a
//! backend implementing [`IommuMapper`](iommu::IommuMapper), which performs the actual
//! map/unmap work:
//!
//! ```no_run
//! use std::sync::Arc;
//! use pci_dma_cache::iommu::{DmaDirection, IommuMapper};
//! use pci_dma_cache::table::IommuTable;
//!
//! let mapper: Arc<dyn IommuMapper> = unimplemented!();
//!
//! // A 4 KiB-page IOMMU with a 1M-page DMA window; the cache may keep 75% of it mapped.
//! let table = IommuTable::new(mapper, 12, 1 << 20);
//!
//! // The first map installs a translation through the backend and caches it.
//! let dma = table.map(0x7f00_0000_0000, 8, DmaDirection::ToDevice)?;
//!
//! // Mapping the same pages again is served from the cache.
//! assert_eq!(table.map(0x7f00_0000_0000, 8, DmaDirection::ToDevice)?, dma);
//!
//! // One free per map; the translation stays installed for future reuse until evicted.
//! table.free(dma, 8);
//! table.free(dma, 8);
//! # std::io::Result::Ok(())
//! ```
//!
//! All `IommuTable` methods take `&self` and are safe to call concurrently from any thread;
//! no operation blocks on a lock. Dropping the table unmaps whatever the cache still holds.
//!
//! The `mock` crate feature exports [`mocks::MockIommuMapper`] for testing driver code
//! against the cache without hardware.

/* ---------------------------------------------------------------------------------------------- */

mod cache;

pub mod iommu;
pub mod table;

#[cfg(any(test, feature = "mock"))]
pub mod mocks;

/* ---------------------------------------------------------------------------------------------- */
