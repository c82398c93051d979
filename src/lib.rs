//! Hardware buffer allocation for Linux: dma-heap and memfd backed buffers, multi-plane
//! layouts, memory-type selection, staging, and dma-buf synchronization.

pub mod engine;
pub mod error;
pub mod kernel;
pub mod utils;

pub use engine::bo::{BufferObject, ImportSource, ImportTarget};
pub use engine::context::{AllocationPlan, BufferRequest, Context, ContextBuilder};
pub use engine::format::{Format, Modifier};
pub use engine::layout::{Plane, PlaneLayout};
pub use engine::memory::{MemoryDomain, MemoryProvider, MemoryType, MemoryTypeFlags};
pub use engine::sync::MapMode;
pub use engine::usage::{Capabilities, Usage};
pub use error::{HbmError, HbmResult};
pub use kernel::dmabuf::Access;
