// Asynchronous depth-order sorting for Gaussian splat rendering
//
// Splats must be composited in depth order, and the order changes every time
// the camera moves. The pipeline here keeps the render thread free of that
// cost: a facade feeds splat centers and per-frame camera data to a
// dedicated worker thread running a bucketed counting sort, trades ownership
// of two permutation buffers back and forth with it, and streams accepted
// results into a GPU-visible resource through a pooled, non-blocking upload
// path.

pub mod sort_types;
pub mod sort_worker;
pub mod splat_sorter;
pub mod unified_sorter;
pub mod upload_stream;

// Re-exports - core types always available
pub use sort_types::{
    CentersBuffer, IndexMapping, MappingUpdate, OrderBuffer, SortCommand, SortRange, SortResult,
    SortStats, SortVersion, Sorted, SorterError,
};
pub use sort_worker::{spawn_worker, WorkerLink, WorkerState};
pub use splat_sorter::SplatSorter;
pub use unified_sorter::UnifiedSplatSorter;
pub use upload_stream::{
    create_order_buffer, create_order_texture, BufferOrderSink, OrderSink, TextureOrderSink,
    UploadStream, VecOrderSink,
};
