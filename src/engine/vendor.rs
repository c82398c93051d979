//! Boundary to a vendor rendering driver that owns tiled/compressed image layouts.
//!
//! Loading such a driver is out of scope; callers hand an implementation to the
//! [`ContextBuilder`](crate::engine::context::ContextBuilder).

use crate::engine::format::{Format, Modifier};
use crate::engine::layout::PlaneLayout;
use crate::engine::staging::Rect;
use crate::engine::usage::Capabilities;
use crate::error::HbmResult;
use crate::kernel::dmabuf::Access;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;

/// What the vendor driver is asked to create or import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDescription {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub modifier: Modifier,
    pub caps: Capabilities,
}

/// A driver-side image: an opaque handle plus the layout the driver chose for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorImage {
    pub handle: u64,
    pub layout: PlaneLayout,
}

/// A CPU view of an image returned by [`VendorDriver::map_image`].
#[derive(Debug, Clone, Copy)]
pub struct VendorMapping {
    pub ptr: NonNull<u8>,
    pub len: usize,
}

// Points into driver-owned shared memory; validity is tied to the map/unmap pair, not a thread.
unsafe impl Send for VendorMapping {}
unsafe impl Sync for VendorMapping {}

/// Direction of a staging transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// Staging buffer into the image.
    ToImage,
    /// Image into the staging buffer.
    FromImage,
}

pub trait VendorDriver: Send + Sync {
    /// Creates an unbound image and reports its layout (`total_size` included).
    ///
    /// # Errors
    /// `UnsupportedFormat` or `BackendAllocationFailed` from the driver.
    fn create_image(&self, desc: &ImageDescription) -> HbmResult<VendorImage>;

    /// Wraps existing memory, one descriptor per plane, laid out as `layout`.
    ///
    /// # Errors
    /// `ReimportFailed` or `InvalidParam` from the driver.
    fn import_image(
        &self,
        desc: &ImageDescription,
        fds: &[BorrowedFd<'_>],
        layout: &PlaneLayout,
    ) -> HbmResult<VendorImage>;

    /// Binds freshly allocated memory to an image from [`create_image`](Self::create_image).
    ///
    /// # Errors
    /// `BackendAllocationFailed` from the driver.
    fn bind_memory(&self, image: u64, fd: BorrowedFd<'_>) -> HbmResult<()>;

    /// Maps a linear image for CPU access.
    ///
    /// # Errors
    /// Driver-specific.
    fn map_image(&self, image: u64, access: Access) -> HbmResult<VendorMapping>;

    fn unmap_image(&self, image: u64);

    /// Transfers `rect` between an image and a linear staging buffer.
    ///
    /// # Errors
    /// `CopyFailed` from the driver.
    fn copy_image(
        &self,
        image: u64,
        staging: BorrowedFd<'_>,
        staging_layout: &PlaneLayout,
        rect: Rect,
        direction: CopyDirection,
    ) -> HbmResult<()>;

    fn destroy_image(&self, image: u64);
}
