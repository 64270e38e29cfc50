// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::fmt::Debug;
use std::io;

/* ---------------------------------------------------------------------------------------------- */

/// The direction of the data flow a DMA mapping was established for.
///
/// A cached mapping may only be reused for a transfer whose direction it
/// [covers](DmaDirection::covers), so a read-only mapping is never handed to a device that
/// intends to write through it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DmaDirection {
    /// Data flows from the CPU to the device.
    ToDevice,
    /// Data flows from the device to the CPU.
    FromDevice,
    /// Data flows both ways.
    Bidirectional,
    /// No data flow; used for mappings that only reserve an address.
    None,
}

impl DmaDirection {
    /// Whether a mapping established with direction `self` may serve a transfer that requires
    /// direction `requested`.
    ///
    /// Reflexive, and [`DmaDirection::Bidirectional`] covers everything.
    pub fn covers(self, requested: DmaDirection) -> bool {
        self == requested || self == DmaDirection::Bidirectional
    }
}

/* ---------------------------------------------------------------------------------------------- */

/// The underlying IOMMU page mapper that the cache defers to.
///
/// Implementations install and tear down actual IOMMU translations: with a VFIO backend these
/// are `VFIO_IOMMU_MAP_DMA` / `VFIO_IOMMU_UNMAP_DMA` ioctls; on other backends, whatever
/// programs the translation tables. The cache itself never decides DMA addresses; it only
/// remembers mappings this trait produced and hands them back to repeat callers.
///
/// All addresses exchanged through this trait are page-granular: `host_addr` and the returned
/// DMA address are aligned to the page size implied by the owning table's `page_shift`.
pub trait IommuMapper: Debug + Send + Sync {
    /// Installs a translation for `npages` host pages starting at `host_addr` and returns the
    /// DMA address the device must use.
    fn map_pages(
        &self,
        host_addr: usize,
        npages: usize,
        direction: DmaDirection,
    ) -> io::Result<u64>;

    /// Tears down the translation for the contiguous DMA page run starting at `dma_addr`.
    ///
    /// The cache batches and coalesces its unmaps, so a single call may cover a run that was
    /// installed by several `map_pages` calls.
    fn unmap_pages(&self, dma_addr: u64, npages: usize) -> io::Result<()>;
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::DmaDirection::{self, *};

    #[test]
    fn test_covers_is_reflexive() {
        for d in [ToDevice, FromDevice, Bidirectional, DmaDirection::None] {
            assert!(d.covers(d));
        }
    }

    #[test]
    fn test_bidirectional_covers_everything() {
        for d in [ToDevice, FromDevice, Bidirectional, DmaDirection::None] {
            assert!(Bidirectional.covers(d));
        }
    }

    #[test]
    fn test_one_way_directions_do_not_mix() {
        assert!(!ToDevice.covers(FromDevice));
        assert!(!FromDevice.covers(ToDevice));
        assert!(!ToDevice.covers(Bidirectional));
        assert!(!FromDevice.covers(Bidirectional));
        assert!(!DmaDirection::None.covers(ToDevice));
    }
}

/* ---------------------------------------------------------------------------------------------- */
