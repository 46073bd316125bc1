// Order upload demo (requires a GPU adapter)
// Runs the unified sorter against a real wgpu device, streaming the order
// into a storage buffer through the pooled upload path, then reads it back.

use std::time::Duration;

use glam::{Mat4, Vec3};
use rfs_gsplat_sort::{
    create_order_buffer, BufferOrderSink, CentersBuffer, SortRange, UnifiedSplatSorter,
    UploadStream,
};

fn main() {
    let instance = wgpu::Instance::default();
    let Ok(adapter) =
        pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
    else {
        eprintln!("no GPU adapter available");
        return;
    };
    let Ok((device, queue)) =
        pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default()))
    else {
        eprintln!("failed to create device");
        return;
    };

    // two splat groups in different local spaces
    let num_splats = 8;
    let mut data = Vec::new();
    for i in 0..num_splats {
        data.extend_from_slice(&[0.0, 0.0, i as f32]);
    }

    let target = create_order_buffer(&device, num_splats);
    let sink = BufferOrderSink::new(
        device.clone(),
        queue.clone(),
        target.clone(),
        UploadStream::pooled(3),
    );

    let mut sorter = UnifiedSplatSorter::new(Box::new(sink), num_splats, CentersBuffer::new(data))
        .expect("failed to start sorter");

    let camera_position = Vec3::new(0.0, 0.0, -5.0);
    let camera_direction = Vec3::Z;
    let model_near = Mat4::from_translation(Vec3::new(0.0, 0.0, 2.0));
    let model_far = Mat4::from_translation(Vec3::new(0.0, 0.0, 40.0));

    sorter
        .set_sort_params(vec![
            SortRange::from_local_transform(&model_far, camera_position, camera_direction, 0, 4),
            SortRange::from_local_transform(&model_near, camera_position, camera_direction, 4, 8),
        ])
        .expect("worker alive");

    let sorted = loop {
        if let Some(sorted) = sorter.poll_sorted().expect("worker alive") {
            break sorted;
        }
        std::thread::sleep(Duration::from_millis(1));
    };
    println!("sorted {} splats (version {})", sorted.count, sorted.version);
    println!("order on the CPU side: {:?}", sorter.order());

    // read the uploaded order back from the GPU target
    let readback = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("demo_readback"),
        size: target.size(),
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
    encoder.copy_buffer_to_buffer(&target, 0, &readback, 0, target.size());
    queue.submit(Some(encoder.finish()));

    let (sender, receiver) = std::sync::mpsc::channel();
    readback
        .slice(..)
        .map_async(wgpu::MapMode::Read, move |result| {
            sender.send(result).unwrap();
        });
    let _ = device.poll(wgpu::PollType::Wait);
    receiver.recv().unwrap().expect("map failed");
    let mapped = readback.slice(..).get_mapped_range();
    let gpu_order: Vec<u32> = bytemuck::cast_slice(&mapped).to_vec();
    println!("order on the GPU target:  {:?}", gpu_order);
}
