pub mod selector;

use crate::engine::format::{self, Format, Modifier};
use crate::engine::layout::PlaneLayout;
use crate::engine::staging::Rect;
use crate::engine::usage::{Capabilities, Usage};
use crate::engine::vendor::CopyDirection;
use crate::error::{HbmError, HbmResult};
use crate::kernel::dmabuf::{self, Access, CpuMapping};
use bitflags::bitflags;
use std::fmt;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

bitflags! {
    /// Attributes of a memory class as declared by a backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MemoryTypeFlags: u32 {
        /// Close to the device (fast device access, possibly contiguous).
        const LOCAL = 1 << 0;
        /// CPU-cacheable.
        const CACHED = 1 << 1;
        /// CPU and device views stay coherent without explicit cache maintenance.
        const COHERENT = 1 << 2;
        /// Can be mapped into the CPU address space.
        const MAPPABLE = 1 << 3;
    }
}

/// Which allocator serves a memory type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryDomain {
    /// Served by the [`MemoryProvider`] (kernel heaps, memfd).
    Heap,
    /// Served by the [`DeviceBackend`]'s own memory manager.
    Device,
}

/// A backend-declared memory class. Queried fresh per decision, never cached by buffers
/// beyond recording which one they were bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemoryType {
    /// Backend-specific identifier, only meaningful to the backend that declared it.
    pub id: u32,
    pub name: String,
    pub flags: MemoryTypeFlags,
    pub domain: MemoryDomain,
}

impl MemoryType {
    #[must_use]
    pub fn new(
        id: u32,
        name: impl Into<String>,
        flags: MemoryTypeFlags,
        domain: MemoryDomain,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            flags,
            domain,
        }
    }

    #[must_use]
    pub const fn is_mappable(&self) -> bool {
        self.flags.contains(MemoryTypeFlags::MAPPABLE)
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} {:?}", self.name, self.id, self.flags)
    }
}

/// A region handed out by a [`MemoryProvider`]. The descriptor is the only handle to it.
#[derive(Debug)]
pub struct Allocation {
    pub fd: OwnedFd,
    pub size: u64,
    pub memory_type: MemoryType,
}

/// A region handed out by a [`DeviceBackend`]'s memory manager, exported as a descriptor.
#[derive(Debug)]
pub struct DeviceMemory {
    /// Backend-private handle used to free the memory.
    pub handle: u64,
    pub fd: OwnedFd,
    pub size: u64,
    pub memory_type: MemoryType,
}

/// What the device is asked to place.
#[derive(Debug, Clone, Copy)]
pub struct Constraints {
    pub format: Format,
    pub modifier: Modifier,
    pub caps: Capabilities,
    pub size: u64,
}

/// A device-side transfer of `rect` between a buffer and its linear staging copy.
///
/// `FromImage` reads the buffer into staging, `ToImage` writes staging back.
#[derive(Debug, Clone, Copy)]
pub struct DeviceCopy<'a> {
    pub format: Format,
    pub buffer: BorrowedFd<'a>,
    pub layout: &'a PlaneLayout,
    pub staging: BorrowedFd<'a>,
    pub staging_layout: &'a PlaneLayout,
    pub rect: Rect,
    pub direction: CopyDirection,
}

// ===============================================================================================
// Memory provider (kernel heaps, memfd)
// ===============================================================================================

/// A source of fixed-size shareable allocations.
///
/// Everything except [`memory_types`](Self::memory_types) and [`alloc`](Self::alloc) defaults
/// to the plain dma-buf behavior.
pub trait MemoryProvider: Send + Sync {
    /// Memory types this provider can allocate from, in preference order.
    fn memory_types(&self) -> Vec<MemoryType>;

    /// Allocates `size` bytes of `memory_type`.
    ///
    /// # Errors
    /// `BackendAllocationFailed` when the kernel or quota refuses the request.
    fn alloc(&self, size: u64, memory_type: &MemoryType) -> HbmResult<Allocation>;

    /// Returns an allocation. The default simply closes the descriptor.
    fn free(&self, allocation: Allocation) {
        drop(allocation);
    }

    /// Attaches a debug name to the allocation.
    ///
    /// # Errors
    /// The OS error from the naming ioctl.
    fn set_name(&self, fd: BorrowedFd<'_>, name: &str) -> HbmResult<()> {
        dmabuf::set_name(fd, name).map_err(HbmError::from)
    }

    /// Begins a CPU access.
    ///
    /// # Errors
    /// The OS error from the sync ioctl.
    fn sync_start(&self, fd: BorrowedFd<'_>, access: Access) -> HbmResult<()> {
        dmabuf::sync_start(fd, access).map_err(HbmError::from)
    }

    /// Ends a CPU access, making CPU writes visible to devices.
    ///
    /// # Errors
    /// The OS error from the sync ioctl.
    fn sync_end(&self, fd: BorrowedFd<'_>, access: Access) -> HbmResult<()> {
        dmabuf::sync_end(fd, access).map_err(HbmError::from)
    }

    /// Produces a descriptor that can be handed to another process or device.
    ///
    /// # Errors
    /// The OS error from duplicating the descriptor.
    fn export(&self, fd: BorrowedFd<'_>) -> HbmResult<OwnedFd> {
        fd.try_clone_to_owned().map_err(HbmError::from)
    }

    /// Maps `len` bytes of the allocation into the CPU address space.
    ///
    /// # Errors
    /// The OS error from `mmap`.
    fn map(&self, fd: BorrowedFd<'_>, len: usize, access: Access) -> HbmResult<CpuMapping> {
        CpuMapping::new(fd, len, access).map_err(HbmError::from)
    }

    /// Blocks until the implicit fences on `fd` allow `access`.
    ///
    /// # Errors
    /// The error from polling the descriptor.
    fn wait_ready(
        &self,
        fd: BorrowedFd<'_>,
        access: Access,
        timeout: Option<Duration>,
    ) -> HbmResult<()> {
        dmabuf::wait_ready(fd, access, timeout).map_err(HbmError::from)
    }
}

// ===============================================================================================
// Device backend
// ===============================================================================================

/// The device-capability side: which usages and modifiers it understands, how it aligns
/// buffers, and which memory types can back a given buffer.
pub trait DeviceBackend: Send + Sync {
    /// Usage bits this device can honor. Anything else is residual.
    fn supported_usage(&self) -> Usage;

    /// Memory types that can back a buffer with `constraints`, in preference order.
    fn enumerate_memory_types(&self, constraints: &Constraints) -> Vec<MemoryType>;

    /// Number of memory planes a `format` buffer has with `modifier`.
    ///
    /// # Errors
    /// `UnsupportedFormat` if the combination is unknown to the device.
    fn plane_count(&self, format: Format, modifier: Modifier) -> HbmResult<usize>;

    /// Modifiers the device supports for `format` under `caps`, in preference order.
    fn modifiers(&self, format: Format, caps: &Capabilities) -> Vec<Modifier>;

    /// Row pitch alignment of linear images.
    fn stride_alignment(&self) -> u64 {
        1
    }

    /// Allocation size granularity.
    fn size_granularity(&self) -> u64 {
        crate::engine::layout::DEFAULT_SIZE_GRANULARITY
    }

    /// Allocates memory of a [`MemoryDomain::Device`] type.
    ///
    /// # Errors
    /// `BackendAllocationFailed`; the default backend has no device memory.
    fn allocate_memory(&self, size: u64, memory_type: &MemoryType) -> HbmResult<DeviceMemory> {
        Err(HbmError::BackendAllocationFailed(format!(
            "device cannot allocate {size} bytes of {memory_type}"
        )))
    }

    fn free_memory(&self, memory: DeviceMemory) {
        drop(memory);
    }

    /// Copies between a buffer the CPU cannot map and its staging buffer, on the device.
    ///
    /// # Errors
    /// `CopyFailed`; the default backend has no copy engine.
    fn copy_buffer(&self, copy: &DeviceCopy<'_>) -> HbmResult<()> {
        Err(HbmError::CopyFailed(format!(
            "device cannot copy {} ({:?})",
            copy.format, copy.direction
        )))
    }
}

/// Device backend for hosts where buffers come straight from the memory provider: linear
/// layouts only, every provider memory type is a candidate.
pub struct HeapDevice {
    provider: Arc<dyn MemoryProvider>,
    supported: Usage,
}

impl HeapDevice {
    #[must_use]
    pub fn new(provider: Arc<dyn MemoryProvider>) -> Self {
        Self {
            provider,
            supported: Usage::KERNEL_HEAP_SUPPORTED,
        }
    }
}

impl DeviceBackend for HeapDevice {
    fn supported_usage(&self) -> Usage {
        self.supported
    }

    fn enumerate_memory_types(&self, _constraints: &Constraints) -> Vec<MemoryType> {
        self.provider.memory_types()
    }

    fn plane_count(&self, format: Format, modifier: Modifier) -> HbmResult<usize> {
        if !modifier.is_linear() {
            return Err(HbmError::UnsupportedFormat(format));
        }
        match format.num_planes() {
            0 => Err(HbmError::UnsupportedFormat(format)),
            n => Ok(n),
        }
    }

    fn modifiers(&self, format: Format, _caps: &Capabilities) -> Vec<Modifier> {
        if format::planar_layout(format).is_some() {
            vec![Modifier::LINEAR]
        } else {
            Vec::new()
        }
    }
}
