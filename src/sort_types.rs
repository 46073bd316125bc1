// Shared buffer, message and result types for the splat sorting pipeline
//
// Buffers that cross the worker thread boundary are owned newtypes. Sending
// one through a channel moves it, so the sender provably cannot touch the
// memory afterwards - the transfer-of-ownership half of the exchange
// protocol is enforced at compile time.

use glam::{Mat4, Vec3};
use thiserror::Error;

/// Monotonically increasing tag identifying a centers submission.
///
/// Every sort result carries the version of the centers it was computed
/// against, so the facade can discard results that a newer submission has
/// already superseded.
pub type SortVersion = u64;

/// Owned splat center positions, three `f32` (x, y, z) per splat.
///
/// Replaced wholesale on content change, never patched in place. Ownership
/// moves to the worker on submission; the worker hands the previous instance
/// back in its next result so the allocation can be recycled.
#[derive(Debug, Clone, PartialEq)]
pub struct CentersBuffer {
    data: Vec<f32>,
}

impl CentersBuffer {
    pub fn new(data: Vec<f32>) -> Self {
        assert_eq!(
            data.len() % 3,
            0,
            "centers length must be a multiple of 3 (x, y, z per splat)"
        );
        Self { data }
    }

    /// An all-zero buffer sized for `num_splats` splats.
    pub fn zeroed(num_splats: usize) -> Self {
        Self {
            data: vec![0.0; num_splats * 3],
        }
    }

    pub fn num_splats(&self) -> usize {
        self.data.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.data
    }
}

/// Owned draw-order permutation: `order[k]` is the splat index drawn k-th.
///
/// Exactly two instances exist per sorter in steady state. One is resident at
/// the GPU target, the other is in flight inside the worker; every completed
/// sort trades them, so no allocation happens after initialization.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBuffer {
    data: Box<[u32]>,
}

impl OrderBuffer {
    /// The identity permutation `order[i] = i` over `num_splats` entries.
    pub fn identity(num_splats: usize) -> Self {
        Self {
            data: (0..num_splats as u32).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u32] {
        &mut self.data
    }
}

/// Index mapping from a reduced working set back to the full splat index
/// space, applied as a final pass over the produced order.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMapping {
    data: Vec<u32>,
}

impl IndexMapping {
    pub fn new(data: Vec<u32>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.data
    }
}

/// One independently transformed, contiguous group of splats sharing a sort
/// pass.
///
/// `direction` is the camera view direction expressed in the group's local
/// space; `offset` and `scale` remap the local dot-product distance into the
/// global distance domain shared by every other range, so heterogeneous
/// local-space groups can be ordered consistently by one histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SortRange {
    pub direction: Vec3,
    pub offset: f32,
    pub scale: f32,
    pub start_index: u32,
    pub end_index: u32,
}

impl SortRange {
    /// Builds the range descriptor for a splat group with local-to-world
    /// transform `model`, viewed by a camera at `camera_position` looking
    /// along `camera_direction`.
    ///
    /// Assumes a uniform model scale. The camera direction is transformed by
    /// the full inverse matrix and then normalized, which cancels the 1/s
    /// scaling factor.
    pub fn from_local_transform(
        model: &Mat4,
        camera_position: Vec3,
        camera_direction: Vec3,
        start_index: u32,
        end_index: u32,
    ) -> Self {
        let direction = model
            .inverse()
            .transform_vector3(camera_direction)
            .normalize();

        // uniform scale, taken from the x basis vector
        let scale = model.x_axis.truncate().length();

        // world-space offset of the group along the view direction
        let translation = model.w_axis.truncate();
        let offset = (translation - camera_position).dot(camera_direction);

        Self {
            direction,
            offset,
            scale,
            start_index,
            end_index,
        }
    }

    pub fn num_splats(&self) -> u32 {
        self.end_index - self.start_index
    }
}

/// Update to the worker's index mapping carried alongside a centers
/// submission: leave it alone, clear it, or replace it.
#[derive(Debug, Clone, PartialEq)]
pub enum MappingUpdate {
    Unchanged,
    Clear,
    Apply(IndexMapping),
}

/// Messages accepted by the sort worker. Each variant is a partial update to
/// the worker's state; aspects a message does not mention are untouched.
#[derive(Debug)]
pub enum SortCommand {
    /// Wholesale replacement of the splat centers, optionally updating the
    /// index mapping in the same step. Forces a resort on the next pass.
    SetData {
        centers: CentersBuffer,
        mapping: MappingUpdate,
        version: SortVersion,
        /// When set, only the first `sort_splat_count` entries of the working
        /// index space are sorted.
        sort_splat_count: Option<u32>,
    },
    /// Per-frame camera pose for single-range sorting.
    SetCamera { position: Vec3, direction: Vec3 },
    /// Per-frame range descriptors for multi-range sorting.
    SetSortParams(Vec<SortRange>),
    /// Hands an order buffer (back) to the worker, completing the
    /// double-buffer exchange.
    ReturnOrder(OrderBuffer),
}

/// A completed sort pass, sent from the worker back to the facade.
#[derive(Debug)]
pub struct SortResult {
    /// The freshly written permutation. Ownership moves back to the facade.
    pub order: OrderBuffer,
    /// Number of valid entries at the front of `order`.
    pub count: u32,
    /// Version of the centers this order was computed against.
    pub version: SortVersion,
    /// The previous centers buffer, returned for recycling when a new one
    /// arrived since the last pass.
    pub recycled_centers: Option<CentersBuffer>,
    /// Wall-clock duration of the pass in microseconds.
    pub sort_micros: u64,
}

/// Event reported by the facade once a sort result has been accepted and its
/// order published to the GPU target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sorted {
    pub count: u32,
    pub version: SortVersion,
}

/// Counters describing sorter throughput.
#[derive(Debug, Clone, Default)]
pub struct SortStats {
    /// Results accepted and published.
    pub sorts_completed: u64,
    /// Results discarded because a newer centers submission superseded them.
    pub stale_results_dropped: u64,
    /// Duration of the most recent accepted pass, in microseconds.
    pub last_sort_micros: u64,
    /// Accumulated duration of all accepted passes, in microseconds.
    pub total_sort_micros: u64,
}

impl SortStats {
    pub(crate) fn record_sorted(&mut self, micros: u64) {
        self.sorts_completed += 1;
        self.last_sort_micros = micros;
        self.total_sort_micros += micros;
    }

    pub(crate) fn record_stale(&mut self) {
        self.stale_results_dropped += 1;
    }

    pub fn average_sort_micros(&self) -> u64 {
        if self.sorts_completed == 0 {
            0
        } else {
            self.total_sort_micros / self.sorts_completed
        }
    }
}

/// Errors surfaced by the sorter facades.
///
/// Worker-side failures have no per-request error channel; a terminated
/// worker is fatal to the sorter instance, which must be recreated.
#[derive(Error, Debug)]
pub enum SorterError {
    #[error("sort worker terminated unexpectedly")]
    WorkerTerminated,

    #[error("failed to spawn sort worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
