// Single-range splat sorter facade
//
// Owns the worker thread and the GPU-resident order buffer. All public calls
// are non-blocking; results are drained with poll_sorted, which completes
// the double-buffer exchange before anything is published downstream.

use glam::Vec3;
use tracing::debug;

use crate::sort_types::{
    CentersBuffer, IndexMapping, MappingUpdate, OrderBuffer, SortCommand, SortStats, SortVersion,
    Sorted, SorterError,
};
use crate::sort_worker::{spawn_worker, WorkerLink};
use crate::upload_stream::OrderSink;

/// Facade plumbing shared by the single-range and unified sorters: worker
/// lifecycle, the order double-buffer exchange, version staleness, sink
/// publication and centers recycling.
pub(crate) struct SorterCore {
    pub(crate) link: WorkerLink,
    resident: OrderBuffer,
    sink: Box<dyn OrderSink>,
    pub(crate) num_splats: usize,
    pub(crate) version: SortVersion,
    recycled: Vec<CentersBuffer>,
    stats: SortStats,
}

impl SorterCore {
    /// Spawns the worker, publishes the identity order and transfers the
    /// initial centers plus one of the two order buffers to the worker.
    pub(crate) fn new(
        mut sink: Box<dyn OrderSink>,
        num_splats: usize,
        centers: CentersBuffer,
    ) -> Result<Self, SorterError> {
        let link = spawn_worker()?;

        let resident = OrderBuffer::identity(num_splats);
        sink.publish(resident.as_slice(), num_splats as u32);

        link.send(SortCommand::SetData {
            centers,
            mapping: MappingUpdate::Unchanged,
            version: 1,
            sort_splat_count: None,
        })?;
        link.send(SortCommand::ReturnOrder(OrderBuffer::identity(num_splats)))?;

        debug!("splat sorter created for {} splats", num_splats);

        Ok(Self {
            link,
            resident,
            sink,
            num_splats,
            version: 1,
            recycled: Vec::new(),
            stats: SortStats::default(),
        })
    }

    /// Submits replacement centers, bumping and returning the version.
    pub(crate) fn set_centers(
        &mut self,
        centers: CentersBuffer,
        sort_splat_count: Option<u32>,
        mapping: MappingUpdate,
    ) -> Result<SortVersion, SorterError> {
        self.version += 1;
        self.link.send(SortCommand::SetData {
            centers,
            mapping,
            version: self.version,
            sort_splat_count,
        })?;
        Ok(self.version)
    }

    /// Drains completed sort results.
    ///
    /// For every result the previous resident order buffer is posted back to
    /// the worker first, completing the exchange, and any returned centers
    /// buffer joins the recycle pool. Results computed against a superseded
    /// centers version are then dropped without publication; current ones
    /// are published through the sink. Returns the newest accepted event.
    pub(crate) fn poll_sorted(&mut self) -> Result<Option<Sorted>, SorterError> {
        let mut newest = None;
        while let Some(result) = self.link.try_recv()? {
            let previous = std::mem::replace(&mut self.resident, result.order);
            self.link.send(SortCommand::ReturnOrder(previous))?;

            if let Some(centers) = result.recycled_centers {
                self.recycled.push(centers);
            }

            if result.version < self.version {
                self.stats.record_stale();
                continue;
            }

            self.sink.publish(self.resident.as_slice(), result.count);
            self.stats.record_sorted(result.sort_micros);
            newest = Some(Sorted {
                count: result.count,
                version: result.version,
            });
        }
        Ok(newest)
    }

    /// Hands out a zeroed centers buffer for `num_splats` splats, reusing a
    /// recycled allocation when one is available.
    pub(crate) fn acquire_centers(&mut self, num_splats: usize) -> CentersBuffer {
        match self.recycled.pop() {
            Some(buffer) => {
                let mut data = buffer.into_inner();
                data.clear();
                data.resize(num_splats * 3, 0.0);
                CentersBuffer::new(data)
            }
            None => CentersBuffer::zeroed(num_splats),
        }
    }

    pub(crate) fn order(&self) -> &[u32] {
        self.resident.as_slice()
    }

    pub(crate) fn stats(&self) -> &SortStats {
        &self.stats
    }
}

/// Asynchronous depth sorter for a single splat cloud.
///
/// Sorts by camera-relative distance along the view direction. Retains a CPU
/// copy of the centers so an index mapping (reduced working set) can be
/// applied by re-projecting and resubmitting them, the way the worker's
/// local index space requires.
pub struct SplatSorter {
    core: SorterCore,
    centers_copy: Vec<f32>,
    mapping: Option<Vec<u32>>,
}

impl SplatSorter {
    /// Creates the sorter, taking ownership of `centers` (length `3 *
    /// num_splats`) and publishing an identity order to `sink`.
    pub fn new(
        sink: Box<dyn OrderSink>,
        num_splats: usize,
        centers: CentersBuffer,
    ) -> Result<Self, SorterError> {
        assert_eq!(
            centers.num_splats(),
            num_splats,
            "centers must cover every splat"
        );
        let centers_copy = centers.as_slice().to_vec();
        let core = SorterCore::new(sink, num_splats, centers)?;
        Ok(Self {
            core,
            centers_copy,
            mapping: None,
        })
    }

    /// Replaces the splat centers wholesale. An active mapping stays in
    /// effect: the submitted copy is re-projected through it.
    pub fn set_centers(&mut self, centers: CentersBuffer) -> Result<SortVersion, SorterError> {
        assert_eq!(
            centers.num_splats(),
            self.core.num_splats,
            "centers must cover every splat"
        );
        self.centers_copy.clear();
        self.centers_copy.extend_from_slice(centers.as_slice());

        match self.mapping.clone() {
            Some(indices) => {
                self.recycle(centers);
                let projected = self.project_centers(&indices);
                self.core
                    .set_centers(projected, None, MappingUpdate::Unchanged)
            }
            None => self.core.set_centers(centers, None, MappingUpdate::Unchanged),
        }
    }

    /// Applies or clears a reduced working set.
    ///
    /// The worker sorts in whatever index space the last centers submission
    /// defined, so a mapping change is not a free reindex: the retained
    /// centers copy is gathered through the mapping and resubmitted together
    /// with it. Clearing resubmits the full copy.
    pub fn set_mapping(&mut self, mapping: Option<&[u32]>) -> Result<SortVersion, SorterError> {
        match mapping {
            Some(indices) => {
                let projected = self.project_centers(indices);
                self.mapping = Some(indices.to_vec());
                self.core.set_centers(
                    projected,
                    None,
                    MappingUpdate::Apply(IndexMapping::new(indices.to_vec())),
                )
            }
            None => {
                self.mapping = None;
                let mut full = self.core.acquire_centers(self.core.num_splats);
                full.as_mut_slice().copy_from_slice(&self.centers_copy);
                self.core.set_centers(full, None, MappingUpdate::Clear)
            }
        }
    }

    /// Supplies the per-frame camera pose and triggers a resort. The worker
    /// skips passes for sub-epsilon camera movement.
    pub fn set_camera(&mut self, position: Vec3, direction: Vec3) -> Result<(), SorterError> {
        self.core.link.send(SortCommand::SetCamera {
            position,
            direction,
        })
    }

    /// Drains completed sort results, completing the double-buffer exchange
    /// with the worker and publishing accepted orders to the sink. Returns
    /// the newest accepted event, if any.
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

    fn project_centers(&mut self, indices: &[u32]) -> CentersBuffer {
        let mut projected = self.core.acquire_centers(indices.len());
        let data = projected.as_mut_slice();
        for (local, &index) in indices.iter().enumerate() {
            let src = index as usize * 3;
            let dst = local * 3;
            data[dst..dst + 3].copy_from_slice(&self.centers_copy[src..src + 3]);
        }
        projected
    }

    fn recycle(&mut self, centers: CentersBuffer) {
        self.core.recycled.push(centers);
    }
}
