// Sort Worker Validation Tests
// Drives WorkerState directly to pin down the counting-sort semantics

use glam::Vec3;
use rfs_gsplat_sort::{
    CentersBuffer, MappingUpdate, OrderBuffer, SortCommand, SortRange, SortResult, WorkerState,
};

// Build a centers buffer from per-splat positions
fn centers_from(positions: &[[f32; 3]]) -> CentersBuffer {
    let mut data = Vec::with_capacity(positions.len() * 3);
    for position in positions {
        data.extend_from_slice(position);
    }
    CentersBuffer::new(data)
}

// A single range covering the whole working set with identity remap
fn full_range(direction: Vec3, num_splats: u32) -> SortRange {
    SortRange {
        direction,
        offset: 0.0,
        scale: 1.0,
        start_index: 0,
        end_index: num_splats,
    }
}

// Run one sort pass over fresh worker state using range params
fn sort_once(centers: CentersBuffer, ranges: Vec<SortRange>) -> SortResult {
    let num_splats = centers.num_splats();
    let mut state = WorkerState::new();
    state.apply(SortCommand::SetData {
        centers,
        mapping: MappingUpdate::Unchanged,
        version: 1,
        sort_splat_count: None,
    });
    state.apply(SortCommand::SetSortParams(ranges));
    state.apply(SortCommand::ReturnOrder(OrderBuffer::identity(num_splats)));
    state.update().expect("all inputs present, pass must run")
}

// Verify that `order[..count]` is a bijection on [0, count)
fn is_permutation(order: &[u32], count: usize) -> bool {
    let mut seen = vec![false; count];
    for &index in &order[..count] {
        let index = index as usize;
        if index >= count || seen[index] {
            return false;
        }
        seen[index] = true;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_concrete_scenario_sorts_by_depth() {
        let centers = centers_from(&[
            [0.0, 0.0, 0.0],
            [0.0, 0.0, 1.0],
            [0.0, 0.0, 2.0],
            [0.0, 0.0, 3.0],
            [0.0, 0.0, 4.0],
            [0.0, 0.0, 5.0],
        ]);
        let result = sort_once(centers, vec![full_range(Vec3::Z, 6)]);

        assert_eq!(result.count, 6);
        assert_eq!(result.order.as_slice(), &[0, 1, 2, 3, 4, 5]);
        assert_eq!(result.version, 1);
    }

    #[test]
    fn test_order_is_permutation() {
        let mut rng = rand::thread_rng();
        let n = 10_000;
        let positions: Vec<[f32; 3]> = (0..n)
            .map(|_| {
                [
                    rng.gen_range(-50.0..50.0),
                    rng.gen_range(-50.0..50.0),
                    rng.gen_range(-50.0..50.0),
                ]
            })
            .collect();
        let direction = Vec3::new(0.3, -0.5, 0.8).normalize();
        let result = sort_once(centers_from(&positions), vec![full_range(direction, n as u32)]);

        assert_eq!(result.count as usize, n as usize);
        assert!(
            is_permutation(result.order.as_slice(), n as usize),
            "every splat index must appear exactly once"
        );
    }

    #[test]
    fn test_distance_monotonicity_camera_mode() {
        let mut rng = rand::thread_rng();
        let n = 2000usize;
        let positions: Vec<[f32; 3]> = (0..n)
            .map(|_| {
                [
                    rng.gen_range(-10.0..10.0),
                    rng.gen_range(-10.0..10.0),
                    rng.gen_range(-10.0..10.0),
                ]
            })
            .collect();
        let camera_position = Vec3::new(5.0, 5.0, 5.0);
        let camera_direction = Vec3::new(1.0, 0.2, -0.3).normalize();

        let mut state = WorkerState::new();
        state.apply(SortCommand::SetData {
            centers: centers_from(&positions),
            mapping: MappingUpdate::Unchanged,
            version: 1,
            sort_splat_count: None,
        });
        state.apply(SortCommand::SetCamera {
            position: camera_position,
            direction: camera_direction,
        });
        state.apply(SortCommand::ReturnOrder(OrderBuffer::identity(n)));
        let result = state.update().expect("camera pass must run");

        let distance = |index: u32| {
            let p = positions[index as usize];
            (Vec3::from(p) - camera_position).dot(camera_direction)
        };
        let all: Vec<f32> = (0..n as u32).map(distance).collect();
        let spread = all.iter().cloned().fold(f32::NEG_INFINITY, f32::max)
            - all.iter().cloned().fold(f32::INFINITY, f32::min);
        // equal buckets may reorder splats within one quantization step
        let tolerance = spread / 1024.0 + 1e-4;

        let order = result.order.as_slice();
        for pair in order[..n].windows(2) {
            assert!(
                distance(pair[1]) >= distance(pair[0]) - tolerance,
                "distances along the order must be non-decreasing"
            );
        }
    }

    #[test]
    fn test_degenerate_equal_distances() {
        let n = 5;
        let positions = vec![[1.0, 2.0, 3.0]; n];
        let result = sort_once(centers_from(&positions), vec![full_range(Vec3::Z, n as u32)]);

        assert_eq!(result.count as usize, n);
        assert!(is_permutation(result.order.as_slice(), n));
        // every splat lands in bucket 0; the decrement walk then fills the
        // output back to front, reversing the index order
        assert_eq!(result.order.as_slice(), &[4, 3, 2, 1, 0]);
    }

    #[test]
    fn test_tie_break_is_deterministic() {
        // splats 0 and 2 share a distance; the decrement-based placement
        // assigns the last free slot of their bucket to the lower index
        let positions = [
            [0.0, 0.0, 1.0],
            [0.0, 0.0, 5.0],
            [0.0, 0.0, 1.0],
            [0.0, 0.0, 9.0],
        ];
        let first = sort_once(centers_from(&positions), vec![full_range(Vec3::Z, 4)]);
        let second = sort_once(centers_from(&positions), vec![full_range(Vec3::Z, 4)]);

        assert_eq!(first.order.as_slice(), &[2, 0, 1, 3]);
        assert_eq!(
            first.order.as_slice(),
            second.order.as_slice(),
            "identical input must reproduce the identical order"
        );
    }

    #[test]
    fn test_multi_range_offset_scale_remap() {
        // two groups in different local spaces merged into one global order:
        // group A [0, 3) identity, group B [3, 6) with scale 2, offset -5
        let centers = centers_from(&[
            [0.0, 0.0, 10.0],
            [0.0, 0.0, 20.0],
            [0.0, 0.0, 30.0],
            [0.0, 0.0, 1.0],
            [0.0, 0.0, 12.0],
            [0.0, 0.0, 3.0],
        ]);
        let ranges = vec![
            SortRange {
                direction: Vec3::Z,
                offset: 0.0,
                scale: 1.0,
                start_index: 0,
                end_index: 3,
            },
            SortRange {
                direction: Vec3::Z,
                offset: -5.0,
                scale: 2.0,
                start_index: 3,
                end_index: 6,
            },
        ];
        let result = sort_once(centers, ranges);

        // remapped distances: A = [10, 20, 30], B = [-3, 19, 1]
        assert_eq!(result.order.as_slice(), &[3, 5, 0, 4, 1, 2]);
    }

    #[test]
    fn test_mapping_remaps_into_full_index_space() {
        // working set of 4 out of 8 splats
        let mapping = [7u32, 3, 5, 1];
        let local_positions = [
            [0.0, 0.0, 7.0],
            [0.0, 0.0, 3.0],
            [0.0, 0.0, 5.0],
            [0.0, 0.0, 1.0],
        ];
        let mut state = WorkerState::new();
        state.apply(SortCommand::SetData {
            centers: centers_from(&local_positions),
            mapping: MappingUpdate::Apply(rfs_gsplat_sort::IndexMapping::new(mapping.to_vec())),
            version: 1,
            sort_splat_count: None,
        });
        state.apply(SortCommand::SetSortParams(vec![full_range(Vec3::Z, 4)]));
        state.apply(SortCommand::ReturnOrder(OrderBuffer::identity(8)));
        let result = state.update().expect("mapped pass must run");

        assert_eq!(result.count, 4);
        // local order by depth is [3, 1, 2, 0]; mapped through the table
        assert_eq!(&result.order.as_slice()[..4], &[1, 3, 5, 7]);
        for &index in &result.order.as_slice()[..4] {
            assert!(
                mapping.contains(&index),
                "mapped order must only contain full-space indices"
            );
        }
    }

    #[test]
    fn test_sort_splat_count_limits_the_working_set() {
        let centers = centers_from(&[
            [0.0, 0.0, 5.0],
            [0.0, 0.0, 4.0],
            [0.0, 0.0, 3.0],
            [0.0, 0.0, 2.0],
            [0.0, 0.0, 1.0],
            [0.0, 0.0, 0.0],
        ]);
        let mut state = WorkerState::new();
        state.apply(SortCommand::SetData {
            centers,
            mapping: MappingUpdate::Unchanged,
            version: 1,
            sort_splat_count: Some(4),
        });
        state.apply(SortCommand::SetSortParams(vec![full_range(Vec3::Z, 4)]));
        state.apply(SortCommand::ReturnOrder(OrderBuffer::identity(6)));
        let result = state.update().expect("prefix pass must run");

        assert_eq!(result.count, 4);
        assert_eq!(&result.order.as_slice()[..4], &[3, 2, 1, 0]);
        // entries beyond the working set are left untouched
        assert_eq!(&result.order.as_slice()[4..], &[4, 5]);
    }

    #[test]
    fn test_empty_centers_produce_no_result() {
        let mut state = WorkerState::new();
        state.apply(SortCommand::SetData {
            centers: CentersBuffer::new(Vec::new()),
            mapping: MappingUpdate::Unchanged,
            version: 1,
            sort_splat_count: None,
        });
        state.apply(SortCommand::SetSortParams(vec![full_range(Vec3::Z, 0)]));
        state.apply(SortCommand::ReturnOrder(OrderBuffer::identity(0)));
        assert!(state.update().is_none());
    }

    #[test]
    fn test_missing_inputs_are_a_noop() {
        let mut state = WorkerState::new();
        assert!(state.update().is_none());

        state.apply(SortCommand::SetData {
            centers: centers_from(&[[0.0, 0.0, 1.0]]),
            mapping: MappingUpdate::Unchanged,
            version: 1,
            sort_splat_count: None,
        });
        // no order buffer and no distance basis yet
        assert!(state.update().is_none());

        state.apply(SortCommand::SetSortParams(vec![full_range(Vec3::Z, 1)]));
        assert!(state.update().is_none());

        state.apply(SortCommand::ReturnOrder(OrderBuffer::identity(1)));
        assert!(state.update().is_some());
    }

    #[test]
    fn test_camera_epsilon_skips_and_forced_updates() {
        let positions = [[0.0, 0.0, 1.0], [0.0, 0.0, 2.0], [0.0, 0.0, 3.0]];
        let camera = Vec3::new(0.0, 0.0, -2.0);

        let mut state = WorkerState::new();
        state.apply(SortCommand::SetData {
            centers: centers_from(&positions),
            mapping: MappingUpdate::Unchanged,
            version: 1,
            sort_splat_count: None,
        });
        state.apply(SortCommand::SetCamera {
            position: camera,
            direction: Vec3::Z,
        });
        state.apply(SortCommand::ReturnOrder(OrderBuffer::identity(3)));
        let first = state.update().expect("first camera pass must run");
        state.apply(SortCommand::ReturnOrder(first.order));

        // sub-epsilon camera movement is skipped
        state.apply(SortCommand::SetCamera {
            position: camera + Vec3::new(1e-4, 0.0, 0.0),
            direction: Vec3::Z,
        });
        assert!(state.update().is_none(), "static camera must not resort");

        // a real move sorts again
        state.apply(SortCommand::SetCamera {
            position: camera + Vec3::new(1.0, 0.0, 0.0),
            direction: Vec3::Z,
        });
        let second = state.update().expect("moved camera must resort");
        state.apply(SortCommand::ReturnOrder(second.order));

        // new centers force a pass even with an identical camera
        state.apply(SortCommand::SetData {
            centers: centers_from(&positions),
            mapping: MappingUpdate::Unchanged,
            version: 2,
            sort_splat_count: None,
        });
        let forced = state.update().expect("fresh centers must resort");
        assert_eq!(forced.version, 2);
    }

    #[test]
    fn test_transferred_buffers_round_trip_unchanged() {
        let original: Vec<f32> = (0..30).map(|v| v as f32 * 0.5).collect();
        let replacement: Vec<f32> = (0..30).map(|v| v as f32 - 7.0).collect();

        let mut state = WorkerState::new();
        state.apply(SortCommand::SetData {
            centers: CentersBuffer::new(original.clone()),
            mapping: MappingUpdate::Unchanged,
            version: 1,
            sort_splat_count: None,
        });
        state.apply(SortCommand::SetSortParams(vec![full_range(Vec3::Z, 10)]));
        state.apply(SortCommand::ReturnOrder(OrderBuffer::identity(10)));
        let first = state.update().expect("first pass must run");
        assert!(
            first.recycled_centers.is_none(),
            "nothing to recycle on the first pass"
        );
        state.apply(SortCommand::ReturnOrder(first.order));

        state.apply(SortCommand::SetData {
            centers: CentersBuffer::new(replacement),
            mapping: MappingUpdate::Unchanged,
            version: 2,
            sort_splat_count: None,
        });
        let second = state.update().expect("second pass must run");
        let recycled = second
            .recycled_centers
            .expect("replaced centers must come back for reuse");
        // the transfer moves ownership without touching the bytes
        assert_eq!(recycled.as_slice(), original.as_slice());
    }
}
