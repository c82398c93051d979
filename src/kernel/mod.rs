//! Thin wrappers over the Linux interfaces buffers are allocated, shared, and synchronized
//! through.

pub mod dmabuf;
pub mod drm;
pub mod heap;
pub mod ioctl;
pub mod memfd;
