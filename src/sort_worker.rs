// Background counting-sort worker for splat depth ordering
//
// The worker owns an explicit mutable state updated piecemeal by inbound
// messages; every message triggers a sort pass, which is a no-op until an
// order buffer, centers and a distance basis (camera or range params) are
// all present. A pass always runs to completion - there is no cancellation,
// superseding state before the next trigger is the only way to "abort".

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;
use std::time::Instant;

use glam::Vec3;
use tracing::{debug, trace};

use crate::sort_types::{
    CentersBuffer, IndexMapping, MappingUpdate, OrderBuffer, SortCommand, SortRange, SortResult,
    SortVersion, SorterError,
};

/// Camera movement below this threshold skips a camera-mode resort.
const CAMERA_EPSILON: f32 = 0.001;

/// Smallest distance spread treated as non-degenerate.
const MIN_DISTANCE_RANGE: f32 = 1e-6;

#[cfg(feature = "rayon")]
const DISTANCE_CHUNK: usize = 8192;

/// Number of bits used for distance bucket keys, derived from the splat
/// count: fewer buckets for small sets, capped for very large ones to keep
/// the histogram cache-resident.
fn compare_bits_for(num_vertices: usize) -> u32 {
    let bits = (num_vertices as f32 / 4.0).log2().round();
    bits.clamp(10.0, 20.0) as u32
}

/// Remaps distances for one range into `distances[start..end]` and returns
/// the (min, max) spread of the values written.
#[cfg(feature = "rayon")]
fn accumulate_range(centers: &[f32], range: &SortRange, distances: &mut [f32]) -> (f32, f32) {
    use rayon::prelude::*;

    let direction = range.direction;
    let scale = range.scale;
    let offset = range.offset;
    distances
        .par_chunks_mut(DISTANCE_CHUNK)
        .zip(centers.par_chunks(DISTANCE_CHUNK * 3))
        .map(|(out, positions)| {
            let mut lo = f32::INFINITY;
            let mut hi = f32::NEG_INFINITY;
            for (slot, position) in out.iter_mut().zip(positions.chunks_exact(3)) {
                let dot = position[0] * direction.x
                    + position[1] * direction.y
                    + position[2] * direction.z;
                let distance = scale * dot + offset;
                *slot = distance;
                lo = lo.min(distance);
                hi = hi.max(distance);
            }
            (lo, hi)
        })
        .reduce(
            || (f32::INFINITY, f32::NEG_INFINITY),
            |a, b| (a.0.min(b.0), a.1.max(b.1)),
        )
}

/// Remaps distances for one range into `distances[start..end]` and returns
/// the (min, max) spread of the values written.
#[cfg(not(feature = "rayon"))]
fn accumulate_range(centers: &[f32], range: &SortRange, distances: &mut [f32]) -> (f32, f32) {
    let direction = range.direction;
    let scale = range.scale;
    let offset = range.offset;
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for (slot, position) in distances.iter_mut().zip(centers.chunks_exact(3)) {
        let dot =
            position[0] * direction.x + position[1] * direction.y + position[2] * direction.z;
        let distance = scale * dot + offset;
        *slot = distance;
        lo = lo.min(distance);
        hi = hi.max(distance);
    }
    (lo, hi)
}

/// Mutable state of one sort worker.
///
/// Usable directly for synchronous sorting; [`spawn_worker`] runs the same
/// state on a dedicated thread behind channels.
#[derive(Default)]
pub struct WorkerState {
    order: Option<OrderBuffer>,
    centers: Option<CentersBuffer>,
    return_centers: Option<CentersBuffer>,
    mapping: Option<IndexMapping>,
    camera: Option<(Vec3, Vec3)>,
    sort_params: Option<Vec<SortRange>>,
    sort_splat_count: Option<u32>,
    version: SortVersion,
    force_update: bool,
    last_camera: Option<(Vec3, Vec3)>,

    // per-pass scratch, reused across passes
    distances: Vec<f32>,
    keys: Vec<u32>,
    count_buffer: Vec<u32>,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one message. Aspects of the state the message does not
    /// mention are left untouched.
    pub fn apply(&mut self, command: SortCommand) {
        match command {
            SortCommand::SetData {
                centers,
                mapping,
                version,
                sort_splat_count,
            } => {
                debug!(
                    "sort worker received {} centers (version {})",
                    centers.num_splats(),
                    version
                );
                // hand the old centers back to the facade with the next result
                self.return_centers = self.centers.take();
                self.centers = Some(centers);
                self.version = version;
                self.sort_splat_count = sort_splat_count;
                match mapping {
                    MappingUpdate::Unchanged => {}
                    MappingUpdate::Clear => self.mapping = None,
                    MappingUpdate::Apply(mapping) => self.mapping = Some(mapping),
                }
                self.force_update = true;
            }
            SortCommand::SetCamera {
                position,
                direction,
            } => {
                self.camera = Some((position, direction));
            }
            SortCommand::SetSortParams(ranges) => {
                self.sort_params = Some(ranges);
            }
            SortCommand::ReturnOrder(order) => {
                self.order = Some(order);
            }
        }
    }

    /// Runs one counting-sort pass if all required inputs are present.
    ///
    /// Returns `None` when the order buffer, centers or distance basis is
    /// missing, when the centers are empty, or when a camera-mode pass is
    /// skipped because the camera barely moved since the last pass.
    pub fn update(&mut self) -> Option<SortResult> {
        if self.order.is_none() {
            return None;
        }
        let centers = self.centers.as_ref()?;
        if centers.is_empty() {
            return None;
        }
        if self.sort_params.is_none() && self.camera.is_none() {
            return None;
        }

        // camera mode only: skip the pass when nothing observable changed
        if self.sort_params.is_none() && !self.force_update {
            let (position, direction) = self.camera.unwrap();
            if let Some((last_position, last_direction)) = self.last_camera {
                if (position - last_position).abs().max_element() < CAMERA_EPSILON
                    && (direction - last_direction).abs().max_element() < CAMERA_EPSILON
                {
                    trace!("sort pass skipped, camera unchanged");
                    return None;
                }
            }
        }

        self.force_update = false;
        self.last_camera = self.camera;
        let started = Instant::now();

        let num_vertices = self
            .sort_splat_count
            .map(|count| count as usize)
            .unwrap_or(centers.num_splats());

        let compare_bits = compare_bits_for(num_vertices);
        let bucket_count = (1usize << compare_bits) + 1;

        if self.distances.len() != num_vertices {
            self.distances.resize(num_vertices, 0.0);
        }
        if self.keys.len() != num_vertices {
            self.keys.resize(num_vertices, 0);
        }
        if self.count_buffer.len() != bucket_count {
            self.count_buffer = vec![0; bucket_count];
        } else {
            self.count_buffer.fill(0);
        }

        // the camera pose is equivalent to a single identity-scale range
        let derived_range;
        let ranges: &[SortRange] = match &self.sort_params {
            Some(ranges) => ranges,
            None => {
                let (position, direction) = self.camera.unwrap();
                derived_range = [SortRange {
                    direction,
                    offset: -position.dot(direction),
                    scale: 1.0,
                    start_index: 0,
                    end_index: num_vertices as u32,
                }];
                &derived_range
            }
        };

        // pass 1: remap per-range local distances into the shared global
        // domain and find its actual spread
        let centers_data = centers.as_slice();
        let mut min_dist = f32::INFINITY;
        let mut max_dist = f32::NEG_INFINITY;
        for range in ranges {
            let start = range.start_index as usize;
            let end = range.end_index as usize;
            debug_assert!(start <= end && end <= num_vertices, "range out of bounds");
            let (lo, hi) = accumulate_range(
                &centers_data[start * 3..end * 3],
                range,
                &mut self.distances[start..end],
            );
            min_dist = min_dist.min(lo);
            max_dist = max_dist.max(hi);
        }

        // pass 2: quantize distances into bucket keys and histogram them
        let spread = max_dist - min_dist;
        if spread < MIN_DISTANCE_RANGE {
            // all points are at the same distance
            self.keys[..num_vertices].fill(0);
            self.count_buffer[0] = num_vertices as u32;
        } else {
            let divider = (1u64 << compare_bits) as f32 / spread;
            let max_key = (bucket_count - 1) as u32;
            for (key, &distance) in self.keys[..num_vertices]
                .iter_mut()
                .zip(&self.distances[..num_vertices])
            {
                let bucket = (((distance - min_dist) * divider) as u32).min(max_key);
                *key = bucket;
                self.count_buffer[bucket as usize] += 1;
            }
        }

        // in-place prefix sum: each entry becomes the exclusive upper bound
        // of its bucket's region in the output
        for i in 1..bucket_count {
            self.count_buffer[i] += self.count_buffer[i - 1];
        }

        // placement: walking indices upward while decrementing the bucket
        // bound fixes the tie-break order inside each bucket
        let mut order = self.order.take().unwrap();
        debug_assert!(order.len() >= num_vertices, "order buffer too small");
        let order_data = order.as_mut_slice();
        for i in 0..num_vertices {
            let key = self.keys[i] as usize;
            self.count_buffer[key] -= 1;
            order_data[self.count_buffer[key] as usize] = i as u32;
        }

        // translate working-set indices back to the full splat index space
        if let Some(mapping) = &self.mapping {
            let mapping = mapping.as_slice();
            for slot in order_data[..num_vertices].iter_mut() {
                *slot = mapping[*slot as usize];
            }
        }

        let sort_micros = started.elapsed().as_micros() as u64;
        trace!(
            "sorted {} splats into {} buckets in {}us",
            num_vertices,
            bucket_count,
            sort_micros
        );

        Some(SortResult {
            order,
            count: num_vertices as u32,
            version: self.version,
            recycled_centers: self.return_centers.take(),
            sort_micros,
        })
    }
}

/// Channel endpoints of a spawned sort worker, held by the facade.
pub struct WorkerLink {
    commands: Option<Sender<SortCommand>>,
    results: Receiver<SortResult>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerLink {
    pub fn send(&self, command: SortCommand) -> Result<(), SorterError> {
        self.commands
            .as_ref()
            .ok_or(SorterError::WorkerTerminated)?
            .send(command)
            .map_err(|_| SorterError::WorkerTerminated)
    }

    /// Non-blocking receive of the next completed sort result.
    pub fn try_recv(&self) -> Result<Option<SortResult>, SorterError> {
        match self.results.try_recv() {
            Ok(result) => Ok(Some(result)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SorterError::WorkerTerminated),
        }
    }
}

impl Drop for WorkerLink {
    fn drop(&mut self) {
        // closing the command channel ends the worker loop
        self.commands.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Spawns a dedicated sort worker thread and returns its channel endpoints.
///
/// The worker applies every inbound message to its state and attempts a sort
/// pass after each one; completed passes are delivered through the result
/// channel. The worker exits when the command channel closes.
pub fn spawn_worker() -> Result<WorkerLink, SorterError> {
    let (command_sender, command_receiver) = mpsc::channel::<SortCommand>();
    let (result_sender, result_receiver) = mpsc::channel::<SortResult>();

    let thread = std::thread::Builder::new()
        .name("gsplat-sort-worker".into())
        .spawn(move || {
            let mut state = WorkerState::new();
            while let Ok(command) = command_receiver.recv() {
                state.apply(command);
                if let Some(result) = state.update() {
                    if result_sender.send(result).is_err() {
                        break;
                    }
                }
            }
        })?;

    Ok(WorkerLink {
        commands: Some(command_sender),
        results: result_receiver,
        thread: Some(thread),
    })
}
