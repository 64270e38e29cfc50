// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::collections::TryReserveError;

use log::error;

use crate::iommu::IommuMapper;

/* ---------------------------------------------------------------------------------------------- */

/// How many of the most recent runs [`UnmapBatch::append`] considers for extension. The page
/// being appended almost always continues the newest run; anything older than a few runs back
/// is not worth scanning.
const RECENT_RUNS: usize = 4;

/// A contiguous DMA page run, the descriptor handed to [`IommuMapper::unmap_pages`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct PageRun {
    pub(crate) dma_page: u64,
    pub(crate) npages: usize,
}

/* ---------------------------------------------------------------------------------------------- */

/// Collects DMA pages to unmap, coalescing adjacent pages into runs so the underlying mapper
/// is invoked once per run instead of once per page.
#[derive(Debug)]
pub(crate) struct UnmapBatch {
    runs: Vec<PageRun>,
}

impl UnmapBatch {
    /// Fallible construction: eviction and the direct-free path both have a defined fallback
    /// when this buffer cannot be allocated.
    pub(crate) fn with_capacity(pages: usize) -> Result<UnmapBatch, TryReserveError> {
        let mut runs = Vec::new();
        runs.try_reserve(pages)?;
        Ok(UnmapBatch { runs })
    }

    /// Adds one DMA page, extending a recent adjacent run when possible.
    pub(crate) fn append(&mut self, dma_page: u64) {
        for run in self.runs.iter_mut().rev().take(RECENT_RUNS) {
            if run.dma_page + run.npages as u64 == dma_page {
                run.npages += 1;
                return;
            }
        }

        self.runs.push(PageRun { dma_page, npages: 1 });
    }

    #[cfg(test)]
    pub(crate) fn pages(&self) -> usize {
        self.runs.iter().map(|r| r.npages).sum()
    }

    /// Unmaps every collected run through the external mapper.
    pub(crate) fn flush(self, mapper: &dyn IommuMapper, page_shift: u32) {
        for run in self.runs {
            if let Err(e) = mapper.unmap_pages(run.dma_page << page_shift, run.npages) {
                error!(
                    "failed to unmap {} pages at {:#x}: {}",
                    run.npages,
                    run.dma_page << page_shift,
                    e
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn runs(&self) -> &[PageRun] {
        &self.runs
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
