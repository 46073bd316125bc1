// Unified (multi-range) splat sorter facade
//
// One sort pass covers several independently transformed splat groups: each
// group contributes a SortRange whose offset/scale remap its local distances
// into the shared global domain, so a single histogram and one permutation
// order all of them consistently.

use crate::sort_types::{
    CentersBuffer, MappingUpdate, SortCommand, SortRange, SortStats, SortVersion, Sorted,
    SorterError,
};
use crate::splat_sorter::SorterCore;
use crate::upload_stream::OrderSink;

/// Asynchronous depth sorter for multiple splat groups sharing one work
/// buffer and one draw order.
pub struct UnifiedSplatSorter {
    core: SorterCore,
}

impl UnifiedSplatSorter {
    /// Creates the sorter. `num_splats` sizes the order buffers (the maximum
    /// working set); `centers` is the initial working set and may cover
    /// fewer splats.
    pub fn new(
        sink: Box<dyn OrderSink>,
        num_splats: usize,
        centers: CentersBuffer,
    ) -> Result<Self, SorterError> {
        assert!(
            centers.num_splats() <= num_splats,
            "centers exceed the sorter's splat capacity"
        );
        let core = SorterCore::new(sink, num_splats, centers)?;
        Ok(Self { core })
    }

    /// Replaces the working-set centers, bumping and returning the version.
    ///
    /// `sort_splat_count` restricts sorting to a prefix of the working index
    /// space when only part of it is active.
    pub fn set_centers(
        &mut self,
        centers: CentersBuffer,
        sort_splat_count: Option<u32>,
    ) -> Result<SortVersion, SorterError> {
        self.submit_centers(centers, MappingUpdate::Unchanged, sort_splat_count)
    }

    /// Like [`set_centers`](Self::set_centers), additionally updating the
    /// index mapping that translates working-set indices back to the full
    /// splat index space.
    pub fn set_centers_with_mapping(
        &mut self,
        centers: CentersBuffer,
        mapping: MappingUpdate,
        sort_splat_count: Option<u32>,
    ) -> Result<SortVersion, SorterError> {
        self.submit_centers(centers, mapping, sort_splat_count)
    }

    /// Supplies the per-frame range descriptors and triggers a resort.
    pub fn set_sort_params(&mut self, ranges: Vec<SortRange>) -> Result<(), SorterError> {
        self.core.link.send(SortCommand::SetSortParams(ranges))
    }

    /// Drains completed sort results; see
    /// [`SplatSorter::poll_sorted`](crate::SplatSorter::poll_sorted).
    pub fn poll_sorted(&mut self) -> Result<Option<Sorted>, SorterError> {
        self.core.poll_sorted()
    }

    /// The resident (last published) draw order.
    pub fn order(&self) -> &[u32] {
        self.core.order()
    }

    pub fn num_splats(&self) -> usize {
        self.core.num_splats
    }

    pub fn stats(&self) -> &SortStats {
        self.core.stats()
    }

    /// Hands out a centers buffer, reusing recycled allocations.
    pub fn acquire_centers(&mut self, num_splats: usize) -> CentersBuffer {
        self.core.acquire_centers(num_splats)
    }

    fn submit_centers(
        &mut self,
        centers: CentersBuffer,
        mapping: MappingUpdate,
        sort_splat_count: Option<u32>,
    ) -> Result<SortVersion, SorterError> {
        assert!(
            centers.num_splats() <= self.core.num_splats,
            "centers exceed the sorter's splat capacity"
        );
        if let Some(count) = sort_splat_count {
            assert!(
                count as usize <= centers.num_splats(),
                "sort splat count exceeds the working set"
            );
        }
        self.core.set_centers(centers, sort_splat_count, mapping)
    }
}
