//! Allocation policy: usage resolution, layout, memory-type selection, buffer objects, and the
//! CPU-access protocol around them.

pub mod bo;
pub mod context;
pub mod format;
pub mod layout;
pub mod memory;
pub mod staging;
pub mod sync;
pub mod usage;
pub mod vendor;
