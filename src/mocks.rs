// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::io;

use mockall::mock;

use crate::iommu::{DmaDirection, IommuMapper};

/* ---------------------------------------------------------------------------------------------- */

mock! {
    /// A mock IOMMU backend, so crate users can exercise the cache and their driver code
    /// without real hardware or VFIO access.
    #[derive(Debug)]
    pub IommuMapper {}

    impl IommuMapper for IommuMapper {
        fn map_pages(
            &self,
            host_addr: usize,
            npages: usize,
            direction: DmaDirection,
        ) -> io::Result<u64>;

        fn unmap_pages(&self, dma_addr: u64, npages: usize) -> io::Result<()>;
    }
}

/* ---------------------------------------------------------------------------------------------- */
