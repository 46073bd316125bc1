// Sort pipeline demo (CPU only)
// Spins up a sorter over a synthetic splat cloud and orbits the camera
// around it, printing the sort events as they arrive.

use std::time::Duration;

use glam::Vec3;
use rand::Rng;
use rfs_gsplat_sort::{CentersBuffer, SplatSorter, VecOrderSink};

fn main() {
    let num_splats = 50_000;
    let mut rng = rand::thread_rng();
    let mut data = Vec::with_capacity(num_splats * 3);
    for _ in 0..num_splats {
        data.push(rng.gen_range(-10.0f32..10.0));
        data.push(rng.gen_range(-10.0f32..10.0));
        data.push(rng.gen_range(-10.0f32..10.0));
    }

    let mut sorter = SplatSorter::new(
        Box::new(VecOrderSink::default()),
        num_splats,
        CentersBuffer::new(data),
    )
    .expect("failed to start sorter");

    println!("sorting {} splats across 120 orbit frames", num_splats);

    for frame in 0..120u32 {
        let angle = frame as f32 * 0.05;
        let position = Vec3::new(angle.cos() * 30.0, 5.0, angle.sin() * 30.0);
        let direction = (-position).normalize();

        sorter
            .set_camera(position, direction)
            .expect("worker alive");
        if let Some(sorted) = sorter.poll_sorted().expect("worker alive") {
            println!(
                "frame {:3}: sorted {} splats (version {}), front splats {:?}",
                frame,
                sorted.count,
                sorted.version,
                &sorter.order()[..4]
            );
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    // drain whatever is still in flight
    std::thread::sleep(Duration::from_millis(50));
    let _ = sorter.poll_sorted();

    let stats = sorter.stats();
    println!(
        "done: {} sorts, {} stale results dropped, avg {}us per sort",
        stats.sorts_completed,
        stats.stale_results_dropped,
        stats.average_sort_micros()
    );
}
