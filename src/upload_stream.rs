// Non-blocking upload of order data into GPU-visible resources
//
// Pooled mode keeps a set of mappable staging buffers in rotation: write
// while mapped, unmap, record a copy into the target, then re-map
// asynchronously after submission and return the buffer to the pool (the
// orphaning pattern). Direct mode trades the pool for a single queue write
// that may stage internally.

use std::sync::mpsc::{self, Receiver, Sender};

use tracing::trace;

/// Receives completed sort orders for the renderer to consume.
///
/// This is the seam between the sorter facade and the GPU target resource:
/// the wgpu sinks below upload into a buffer or texture, while headless
/// users and tests can capture the data on the CPU.
pub trait OrderSink {
    /// Publishes a completed draw order. Only the first `count` entries are
    /// valid for drawing; the rest pad out the fixed-size resource.
    fn publish(&mut self, order: &[u32], count: u32);
}

/// CPU capture sink for tests and headless runs.
#[derive(Debug, Default)]
pub struct VecOrderSink {
    pub order: Vec<u32>,
    pub count: u32,
    pub publishes: u64,
}

impl OrderSink for VecOrderSink {
    fn publish(&mut self, order: &[u32], count: u32) {
        self.order.clear();
        self.order.extend_from_slice(order);
        self.count = count;
        self.publishes += 1;
    }
}

struct StagingBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

#[derive(Clone, Copy)]
enum UploadMode {
    /// Round-robin over up to `max_buffers` staging buffers; block on the
    /// device only when every buffer is still in flight.
    Pooled { max_buffers: usize },
    /// One direct queue write per upload.
    Direct,
}

/// Pushes numeric payloads into GPU resources without stalling the calling
/// thread on GPU completion.
pub struct UploadStream {
    mode: UploadMode,
    free: Vec<StagingBuffer>,
    pending: Vec<StagingBuffer>,
    allocated: usize,
    return_sender: Sender<StagingBuffer>,
    return_receiver: Receiver<StagingBuffer>,
}

impl UploadStream {
    /// Pooled mode with bounded growth.
    pub fn pooled(max_buffers: usize) -> Self {
        assert!(max_buffers >= 1, "staging pool needs at least one buffer");
        Self::with_mode(UploadMode::Pooled { max_buffers })
    }

    /// Single-write mode: no pool, every upload is one queue write.
    pub fn direct() -> Self {
        Self::with_mode(UploadMode::Direct)
    }

    fn with_mode(mode: UploadMode) -> Self {
        let (return_sender, return_receiver) = mpsc::channel();
        Self {
            mode,
            free: Vec::new(),
            pending: Vec::new(),
            allocated: 0,
            return_sender,
            return_receiver,
        }
    }

    /// Number of staging buffers currently allocated by the pool.
    pub fn pooled_buffers(&self) -> usize {
        self.allocated
    }

    /// Copies `data` into `target` at `offset`. Both `offset` and the data
    /// size must be multiples of [`wgpu::COPY_BUFFER_ALIGNMENT`]; violating
    /// this is a caller error.
    ///
    /// In pooled mode the copy is recorded into `encoder` and becomes
    /// effective with its submission, after which [`recall`](Self::recall)
    /// must run once.
    pub fn write_buffer(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::Buffer,
        offset: u64,
        data: &[u8],
    ) {
        assert_eq!(
            offset % wgpu::COPY_BUFFER_ALIGNMENT,
            0,
            "upload offset must be aligned to {}",
            wgpu::COPY_BUFFER_ALIGNMENT
        );
        assert_eq!(
            data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT,
            0,
            "upload size must be aligned to {}",
            wgpu::COPY_BUFFER_ALIGNMENT
        );
        if data.is_empty() {
            return;
        }

        match self.mode {
            UploadMode::Direct => queue.write_buffer(target, offset, data),
            UploadMode::Pooled { .. } => {
                let staging = self.grab(device, data.len() as u64);
                {
                    let mut view = staging.buffer.slice(0..data.len() as u64).get_mapped_range_mut();
                    view.copy_from_slice(data);
                }
                staging.buffer.unmap();
                encoder.copy_buffer_to_buffer(
                    &staging.buffer,
                    0,
                    target,
                    offset,
                    data.len() as u64,
                );
                self.pending.push(staging);
            }
        }
    }

    /// Copies whole rows of `R32Uint` texels into `target`, starting at the
    /// top-left. `data` must be an exact number of rows and `width * 4` must
    /// be a multiple of [`wgpu::COPY_BYTES_PER_ROW_ALIGNMENT`]; violating
    /// either is a caller error.
    pub fn write_texture(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::Texture,
        width: u32,
        data: &[u8],
    ) {
        let bytes_per_row = width * 4;
        assert_eq!(
            bytes_per_row % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT,
            0,
            "order texture row pitch must be aligned to {}",
            wgpu::COPY_BYTES_PER_ROW_ALIGNMENT
        );
        assert_eq!(
            data.len() as u32 % bytes_per_row,
            0,
            "texture upload must cover whole rows"
        );
        if data.is_empty() {
            return;
        }
        let rows = data.len() as u32 / bytes_per_row;
        let extent = wgpu::Extent3d {
            width,
            height: rows,
            depth_or_array_layers: 1,
        };
        let layout = wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(bytes_per_row),
            rows_per_image: None,
        };

        match self.mode {
            UploadMode::Direct => {
                queue.write_texture(target.as_image_copy(), data, layout, extent);
            }
            UploadMode::Pooled { .. } => {
                let staging = self.grab(device, data.len() as u64);
                {
                    let mut view = staging.buffer.slice(0..data.len() as u64).get_mapped_range_mut();
                    view.copy_from_slice(data);
                }
                staging.buffer.unmap();
                encoder.copy_buffer_to_texture(
                    wgpu::TexelCopyBufferInfo {
                        buffer: &staging.buffer,
                        layout,
                    },
                    target.as_image_copy(),
                    extent,
                );
                self.pending.push(staging);
            }
        }
    }

    /// Re-queues staging buffers written since the last call. Call once
    /// after submitting the command encoder; the buffers return to the pool
    /// as soon as the GPU releases them.
    pub fn recall(&mut self) {
        for staging in self.pending.drain(..) {
            let sender = self.return_sender.clone();
            staging
                .buffer
                .clone()
                .slice(..)
                .map_async(wgpu::MapMode::Write, move |result| {
                    if result.is_ok() {
                        let _ = sender.send(staging);
                    }
                });
        }
    }

    fn receive_returned(&mut self) {
        while let Ok(staging) = self.return_receiver.try_recv() {
            self.free.push(staging);
        }
    }

    /// Grabs a mapped staging buffer of at least `size` bytes, growing the
    /// pool up to its bound and blocking on the device as a last resort.
    fn grab(&mut self, device: &wgpu::Device, size: u64) -> StagingBuffer {
        let UploadMode::Pooled { max_buffers } = self.mode else {
            unreachable!("staging buffers are only used in pooled mode");
        };
        loop {
            self.receive_returned();
            if let Some(index) = self.free.iter().position(|staging| staging.size >= size) {
                return self.free.swap_remove(index);
            }
            // undersized free buffers make room for a bigger replacement
            if self.free.pop().is_some() {
                self.allocated -= 1;
            }
            if self.allocated < max_buffers {
                self.allocated += 1;
                trace!("allocating staging buffer #{} ({} bytes)", self.allocated, size);
                return StagingBuffer {
                    buffer: device.create_buffer(&wgpu::BufferDescriptor {
                        label: Some("gsplat_order_staging"),
                        size,
                        usage: wgpu::BufferUsages::MAP_WRITE | wgpu::BufferUsages::COPY_SRC,
                        mapped_at_creation: true,
                    }),
                    size,
                };
            }
            // pool exhausted: wait for an in-flight buffer to come back
            let _ = device.poll(wgpu::PollType::Wait);
        }
    }
}

/// Creates a GPU order buffer sized for `num_splats` `u32` entries.
pub fn create_order_buffer(device: &wgpu::Device, num_splats: usize) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("gsplat_order_buffer"),
        size: ((num_splats * 4).max(4)) as u64,
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

/// Creates an `R32Uint` order texture of `width` x `rows` texels.
pub fn create_order_texture(device: &wgpu::Device, width: u32, rows: u32) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some("gsplat_order_texture"),
        size: wgpu::Extent3d {
            width,
            height: rows,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::R32Uint,
        usage: wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

/// Publishes sort orders into a GPU storage buffer.
pub struct BufferOrderSink {
    device: wgpu::Device,
    queue: wgpu::Queue,
    target: wgpu::Buffer,
    stream: UploadStream,
}

impl BufferOrderSink {
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        target: wgpu::Buffer,
        stream: UploadStream,
    ) -> Self {
        assert!(
            target.usage().contains(wgpu::BufferUsages::COPY_DST),
            "order buffer target must be a copy destination"
        );
        Self {
            device,
            queue,
            target,
            stream,
        }
    }

    pub fn target(&self) -> &wgpu::Buffer {
        &self.target
    }
}

impl OrderSink for BufferOrderSink {
    fn publish(&mut self, order: &[u32], _count: u32) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("gsplat_order_upload"),
            });
        self.stream.write_buffer(
            &self.device,
            &self.queue,
            &mut encoder,
            &self.target,
            0,
            bytemuck::cast_slice(order),
        );
        self.queue.submit(Some(encoder.finish()));
        self.stream.recall();
    }
}

/// Publishes sort orders into an `R32Uint` order texture, padding the
/// trailing row when the order length is not a whole number of rows.
pub struct TextureOrderSink {
    device: wgpu::Device,
    queue: wgpu::Queue,
    target: wgpu::Texture,
    width: u32,
    stream: UploadStream,
    padded: Vec<u32>,
}

impl TextureOrderSink {
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        target: wgpu::Texture,
        width: u32,
        stream: UploadStream,
    ) -> Self {
        assert!(
            width > 0 && (width * 4) % wgpu::COPY_BYTES_PER_ROW_ALIGNMENT == 0,
            "order texture width must be a multiple of {} texels",
            wgpu::COPY_BYTES_PER_ROW_ALIGNMENT / 4
        );
        Self {
            device,
            queue,
            target,
            width,
            stream,
            padded: Vec::new(),
        }
    }

    pub fn target(&self) -> &wgpu::Texture {
        &self.target
    }
}

impl OrderSink for TextureOrderSink {
    fn publish(&mut self, order: &[u32], _count: u32) {
        let width = self.width as usize;
        let data: &[u32] = if order.len() % width == 0 {
            order
        } else {
            let rows = order.len().div_ceil(width);
            self.padded.clear();
            self.padded.extend_from_slice(order);
            self.padded.resize(rows * width, 0);
            &self.padded
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("gsplat_order_upload"),
            });
        self.stream.write_texture(
            &self.device,
            &self.queue,
            &mut encoder,
            &self.target,
            self.width,
            bytemuck::cast_slice(data),
        );
        self.queue.submit(Some(encoder.finish()));
        self.stream.recall();
    }
}
