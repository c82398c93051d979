use crate::engine::context::{AllocationPlan, BufferRequest, Context, PendingImage};
use crate::engine::format::{Format, Modifier};
use crate::engine::layout::PlaneLayout;
use crate::engine::memory::selector;
use crate::engine::memory::{
    Allocation, Constraints, DeviceBackend, DeviceMemory, MemoryDomain, MemoryProvider, MemoryType,
};
use crate::engine::staging::{StagingBuffer, StagingPlan};
use crate::engine::sync::MapState;
use crate::engine::usage::{self, Capabilities, Usage};
use crate::engine::vendor::{ImageDescription, VendorDriver};
use crate::error::{HbmError, HbmResult};
use crate::kernel::dmabuf;
use std::mem::ManuallyDrop;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

/// A second device context a buffer can be re-imported into (e.g. a DRM render node).
pub trait ImportTarget: Send + Sync {
    /// Translates a shareable descriptor into a handle local to this context.
    ///
    /// # Errors
    /// `ReimportFailed` when the translation is refused.
    fn import(&self, fd: BorrowedFd<'_>) -> HbmResult<u32>;

    /// Releases a handle returned by [`import`](Self::import).
    ///
    /// # Errors
    /// The OS error from the release.
    fn release(&self, handle: u32) -> HbmResult<()>;
}

/// Externally allocated memory handed to [`Context::import`].
#[derive(Debug)]
pub struct ImportSource {
    /// Ownership moves into the engine, also when the import fails.
    pub fd: OwnedFd,
    /// Per-plane strides. Empty (or a zero first stride with an INVALID modifier) means the
    /// memory is imported as an opaque byte buffer.
    pub strides: Vec<u64>,
    pub offsets: Vec<u64>,
    pub modifier: Modifier,
}

impl ImportSource {
    /// An import with no layout metadata: the buffer is taken as opaque bytes.
    #[must_use]
    pub const fn opaque(fd: OwnedFd) -> Self {
        Self {
            fd,
            strides: Vec::new(),
            offsets: Vec::new(),
            modifier: Modifier::INVALID,
        }
    }

    fn is_opaque(&self) -> bool {
        match self.strides.first() {
            None => true,
            Some(&stride) => stride == 0 && self.modifier.is_invalid(),
        }
    }
}

// ===============================================================================================
// Backings
// ===============================================================================================

/// The memory behind a buffer, tagged by who releases it.
pub(crate) enum Backing {
    /// Memory from the provider. `provider` is `None` for imported descriptors, which are
    /// simply closed.
    KernelHeap {
        provider: Option<Arc<dyn MemoryProvider>>,
        allocation: Allocation,
    },
    /// Memory from the device backend's own manager.
    DeviceMemory {
        device: Arc<dyn DeviceBackend>,
        memory: DeviceMemory,
    },
    /// A vendor image bound to memory of one of the other kinds.
    VendorImage {
        vendor: Arc<dyn VendorDriver>,
        image: u64,
        memory: Box<Backing>,
    },
}

impl Backing {
    pub(crate) fn fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::KernelHeap { allocation, .. } => allocation.fd.as_fd(),
            Self::DeviceMemory { memory, .. } => memory.fd.as_fd(),
            Self::VendorImage { memory, .. } => memory.fd(),
        }
    }

    pub(crate) fn memory_type(&self) -> &MemoryType {
        match self {
            Self::KernelHeap { allocation, .. } => &allocation.memory_type,
            Self::DeviceMemory { memory, .. } => &memory.memory_type,
            Self::VendorImage { memory, .. } => memory.memory_type(),
        }
    }

    pub(crate) fn vendor_image(&self) -> Option<(&Arc<dyn VendorDriver>, u64)> {
        match self {
            Self::VendorImage { vendor, image, .. } => Some((vendor, *image)),
            _ => None,
        }
    }

    /// Whether staging transfers may go through a CPU mapping of the memory. Device-managed
    /// and non-mappable memory is copied by the device instead.
    pub(crate) fn cpu_copyable(&self) -> bool {
        match self {
            Self::KernelHeap { allocation, .. } => allocation.memory_type.is_mappable(),
            Self::DeviceMemory { .. } => false,
            Self::VendorImage { memory, .. } => memory.cpu_copyable(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::KernelHeap { .. } => "kernel-heap",
            Self::DeviceMemory { .. } => "device-memory",
            Self::VendorImage { .. } => "vendor-image",
        }
    }

    /// Allocates `size` bytes of `memory_type` from whichever allocator serves its domain.
    fn allocate(ctx: &Context, size: u64, memory_type: &MemoryType) -> HbmResult<Self> {
        match memory_type.domain {
            MemoryDomain::Heap => Ok(Self::KernelHeap {
                allocation: ctx.provider.alloc(size, memory_type)?,
                provider: Some(ctx.provider.clone()),
            }),
            MemoryDomain::Device => Ok(Self::DeviceMemory {
                memory: ctx.device.allocate_memory(size, memory_type)?,
                device: ctx.device.clone(),
            }),
        }
    }

    fn release(self) {
        match self {
            Self::KernelHeap {
                provider: Some(provider),
                allocation,
            } => provider.free(allocation),
            Self::KernelHeap {
                provider: None,
                allocation,
            } => drop(allocation),
            Self::DeviceMemory { device, memory } => device.free_memory(memory),
            Self::VendorImage {
                vendor,
                image,
                memory,
            } => {
                vendor.destroy_image(image);
                memory.release();
            }
        }
    }
}

// ===============================================================================================
// Buffer Objects
// ===============================================================================================

/// An allocated or imported buffer.
///
/// Owns its memory, one shareable descriptor per plane, any staging buffer, any implicit
/// fence descriptor, and the handles it was re-imported as. All of them are released when the
/// buffer is destroyed or dropped.
pub struct BufferObject {
    pub(crate) format: Format,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) usage: Usage,
    pub(crate) caps: Capabilities,
    pub(crate) layout: PlaneLayout,

    pub(crate) provider: Arc<dyn MemoryProvider>,
    pub(crate) device: Arc<dyn DeviceBackend>,
    pub(crate) backing: ManuallyDrop<Backing>,
    plane_fds: Vec<OwnedFd>,

    pub(crate) staging: Option<StagingPlan>,
    pub(crate) keep_staging: bool,
    pub(crate) kept_staging: Option<StagingBuffer>,

    pub(crate) state: MapState,
    pub(crate) fence: Option<OwnedFd>,
    imports: Vec<(Arc<dyn ImportTarget>, u32)>,
}

impl std::fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferObject")
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("usage", &self.usage)
            .field("layout", &self.layout)
            .field("backing", &self.backing.kind())
            .field("memory_type", self.backing.memory_type())
            .field("staging", &self.staging.is_some())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl BufferObject {
    pub(crate) fn allocate(ctx: &Context, request: &BufferRequest) -> HbmResult<Self> {
        let (plan, pending) = ctx.plan(request)?;
        if plan.resolved.caps.test_only {
            return Err(HbmError::InvalidParam(
                "test-only request; use Context::test_allocate".to_string(),
            ));
        }

        let memory = Backing::allocate(ctx, plan.layout.total_size, &plan.memory.memory_type)?;
        let backing = match pending.and_then(PendingImage::claim) {
            Some((vendor, image)) => {
                if let Err(e) = vendor.bind_memory(image.handle, memory.fd()) {
                    vendor.destroy_image(image.handle);
                    memory.release();
                    return Err(e);
                }
                Backing::VendorImage {
                    vendor,
                    image: image.handle,
                    memory: Box::new(memory),
                }
            }
            None => memory,
        };

        let bo = Self::assemble(ctx, &plan, backing)?;

        if ctx.name_buffers {
            let name = format!(
                "{}x{} {} {}",
                bo.width,
                bo.height,
                bo.format.fourcc_string(),
                bo.usage.short_string()
            );
            if let Err(e) = ctx.provider.set_name(bo.backing.fd(), &name) {
                log::warn!("failed to name buffer \"{name}\": {e}");
            }
        }

        log::info!(
            "Allocate buffer: {}x{} {} size {} stride {} modifier {:#x} usage [{}] in {}{}",
            bo.width,
            bo.height,
            bo.format,
            bo.layout.total_size,
            bo.layout.planes.first().map_or(0, |p| p.stride),
            bo.layout.modifier.0,
            bo.usage.short_string(),
            bo.backing.memory_type(),
            if bo.staging.is_some() { " (staged)" } else { "" }
        );

        Ok(bo)
    }

    pub(crate) fn import(
        ctx: &Context,
        request: &BufferRequest,
        source: ImportSource,
    ) -> HbmResult<Self> {
        let size = dmabuf::size(source.fd.as_fd())?;
        if size == 0 {
            return Err(HbmError::InvalidParam("imported buffer is empty".to_string()));
        }

        let opaque = source.is_opaque();
        let (format, width, height, caps, usage, layout) = if opaque {
            let (caps, residual) =
                Capabilities::decompose(request.usage.bits(), ctx.device.supported_usage());
            if residual != 0 {
                return Err(HbmError::UnsupportedUsage(residual));
            }
            let width = u32::try_from(size).map_err(|_| HbmError::LayoutOverflow)?;
            (Format::INVALID, width, 1, caps, request.usage, PlaneLayout::opaque(size))
        } else {
            let resolved = usage::resolve(
                request.format,
                request.usage.bits(),
                ctx.device.supported_usage(),
            )?;
            let modifier = if source.modifier.is_invalid() {
                Modifier::LINEAR
            } else {
                source.modifier
            };
            let layout =
                PlaneLayout::from_metadata(&source.strides, &source.offsets, size, modifier)?;
            let expected = ctx.plane_count(resolved.format, modifier)?;
            if expected != layout.plane_count() {
                return Err(HbmError::InvalidParam(format!(
                    "{} with modifier {:#x} has {expected} planes, {} described",
                    resolved.format,
                    modifier.0,
                    layout.plane_count()
                )));
            }
            (
                resolved.format,
                request.width,
                request.height,
                resolved.caps,
                resolved.usage,
                layout,
            )
        };

        let constraints = Constraints {
            format,
            modifier: layout.modifier,
            caps,
            size,
        };
        let candidates = ctx.device.enumerate_memory_types(&constraints);
        let memory = selector::select(&caps, &candidates, layout.modifier.is_linear())?;

        let imported = Backing::KernelHeap {
            provider: None,
            allocation: Allocation {
                fd: source.fd,
                size,
                memory_type: memory.memory_type.clone(),
            },
        };

        let backing = match &ctx.vendor {
            Some(vendor) if !format.is_blob() => {
                let desc = ImageDescription {
                    format,
                    width,
                    height,
                    modifier: layout.modifier,
                    caps,
                };
                let image = {
                    let fds = vec![imported.fd(); layout.plane_count()];
                    vendor.import_image(&desc, &fds, &layout)?
                };
                Backing::VendorImage {
                    vendor: vendor.clone(),
                    image: image.handle,
                    memory: Box::new(imported),
                }
            }
            _ => imported,
        };

        let staging_layout = if memory.use_staging {
            Some(if format.is_blob() {
                PlaneLayout::opaque(size)
            } else {
                crate::engine::layout::standard_layout(format, width, height)?
            })
        } else {
            None
        };

        let plan = AllocationPlan {
            resolved: usage::Resolved {
                format,
                usage,
                caps,
            },
            width,
            height,
            layout,
            memory,
            staging_layout,
        };
        let bo = Self::assemble(ctx, &plan, backing)?;

        log::info!(
            "Import buffer: {}x{} {} size {} planes {} in {}",
            bo.width,
            bo.height,
            bo.format,
            bo.layout.total_size,
            bo.layout.plane_count(),
            bo.backing.memory_type()
        );

        Ok(bo)
    }

    /// Wraps a realized backing. Once the object exists, its `Drop` owns the rollback.
    fn assemble(ctx: &Context, plan: &AllocationPlan, backing: Backing) -> HbmResult<Self> {
        let mut bo = Self {
            format: plan.resolved.format,
            width: plan.width,
            height: plan.height,
            usage: plan.resolved.usage,
            caps: plan.resolved.caps,
            layout: plan.layout.clone(),
            provider: ctx.provider.clone(),
            device: ctx.device.clone(),
            backing: ManuallyDrop::new(backing),
            plane_fds: Vec::with_capacity(plan.layout.plane_count()),
            staging: plan.staging_layout.as_ref().map(|layout| StagingPlan {
                memory_type: ctx.staging_memory_type.clone(),
                layout: layout.clone(),
            }),
            keep_staging: false,
            kept_staging: None,
            state: MapState::Idle,
            fence: None,
            imports: Vec::new(),
        };

        for _ in 0..bo.layout.plane_count() {
            let fd = ctx.provider.export(bo.backing.fd())?;
            bo.plane_fds.push(fd);
        }

        Ok(bo)
    }

    /// Releases the buffer and everything it owns. Failures on the way are logged.
    pub fn destroy(self) {
        drop(self);
    }

    // ===========================================================================================
    // Accessors
    // ===========================================================================================

    #[must_use]
    pub const fn format(&self) -> Format {
        self.format
    }

    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub const fn usage(&self) -> Usage {
        self.usage
    }

    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    #[must_use]
    pub const fn layout(&self) -> &PlaneLayout {
        &self.layout
    }

    #[must_use]
    pub const fn modifier(&self) -> Modifier {
        self.layout.modifier
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.layout.total_size
    }

    #[must_use]
    pub fn memory_type(&self) -> &MemoryType {
        self.backing.memory_type()
    }

    /// Whether CPU access goes through a staging buffer.
    #[must_use]
    pub const fn uses_staging(&self) -> bool {
        self.staging.is_some()
    }

    #[must_use]
    pub fn staging_layout(&self) -> Option<&PlaneLayout> {
        self.staging.as_ref().map(|s| &s.layout)
    }

    #[must_use]
    pub const fn has_fence(&self) -> bool {
        self.fence.is_some()
    }

    /// A fresh shareable descriptor for `plane`. The caller owns it.
    ///
    /// # Errors
    /// `InvalidParam` for a plane index past the layout; the OS error if duplication fails.
    pub fn get_plane_descriptor(&self, plane: usize) -> HbmResult<OwnedFd> {
        let fd = self.plane_fds.get(plane).ok_or_else(|| {
            HbmError::InvalidParam(format!(
                "plane {plane} of a {}-plane buffer",
                self.plane_fds.len()
            ))
        })?;
        self.provider.export(fd.as_fd())
    }

    /// Keeps the staging buffer alive across map/unmap cycles instead of reallocating it on
    /// every map. Turning it off releases a kept buffer.
    pub fn set_keep_staging(&mut self, keep: bool) {
        self.keep_staging = keep;
        if !keep {
            self.kept_staging = None;
        }
    }

    /// Installs `fence` as the descriptor [`map`](Self::map) waits on, replacing any previous one.
    pub fn attach_fence(&mut self, fence: OwnedFd) {
        self.fence = Some(fence);
    }

    // ===========================================================================================
    // Re-import
    // ===========================================================================================

    /// Returns the handle of this buffer in `target`, importing it on first use.
    ///
    /// The import works on a duplicate descriptor. For CPU-accessed buffers without a fence,
    /// the duplicate is kept as the implicit fence [`map`](Self::map) waits on.
    ///
    /// # Errors
    /// `ReimportFailed` if duplication or the target's import fails.
    pub fn reimport(&mut self, target: &Arc<dyn ImportTarget>) -> HbmResult<u32> {
        if let Some((_, handle)) = self.imports.iter().find(|(t, _)| Arc::ptr_eq(t, target)) {
            return Ok(*handle);
        }

        let dup = self
            .provider
            .export(self.backing.fd())
            .map_err(|e| HbmError::ReimportFailed(format!("duplicating descriptor: {e}")))?;
        let handle = target.import(dup.as_fd()).map_err(|e| match e {
            HbmError::ReimportFailed(_) => e,
            other => HbmError::ReimportFailed(other.to_string()),
        })?;

        if self.caps.uses_cpu() && self.fence.is_none() {
            self.fence = Some(dup);
        }
        self.imports.push((target.clone(), handle));

        log::debug!(
            "re-imported {}x{} {} as handle {handle}",
            self.width,
            self.height,
            self.format
        );
        Ok(handle)
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        self.abandon_mapping();
        self.kept_staging = None;

        for (target, handle) in self.imports.drain(..) {
            if let Err(e) = target.release(handle) {
                log::warn!("failed to release imported handle {handle}: {e}");
            }
        }

        self.plane_fds.clear();
        self.fence = None;

        // Nothing reads the backing after this point.
        let backing = unsafe { ManuallyDrop::take(&mut self.backing) };
        backing.release();
    }
}
