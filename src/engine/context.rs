use crate::engine::bo::{BufferObject, ImportSource, ImportTarget};
use crate::engine::format::{Format, Modifier};
use crate::engine::layout::{LayoutHints, PlaneLayout, compute_layout, standard_layout};
use crate::engine::memory::selector::{self, MemoryPlan};
use crate::engine::memory::{Constraints, DeviceBackend, HeapDevice, MemoryProvider, MemoryType};
use crate::engine::usage::{self, Resolved, Usage};
use crate::engine::vendor::{ImageDescription, VendorDriver, VendorImage};
use crate::error::{HbmError, HbmResult};
use crate::kernel::drm::{RENDER_NODE_ENV, RenderNode};
use crate::kernel::heap::DmaHeapProvider;
use std::path::PathBuf;
use std::sync::Arc;

// ===============================================================================================
// Requests
// ===============================================================================================

/// What a client asks for. Usage bits outside [`Usage`]'s named flags are kept so the resolver
/// can reject them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRequest {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub usage: Usage,
    /// Acceptable modifiers, in the caller's preference order. Empty means "any".
    pub modifiers: Vec<Modifier>,
}

impl BufferRequest {
    #[must_use]
    pub const fn new(width: u32, height: u32, format: Format, usage: Usage) -> Self {
        Self {
            width,
            height,
            format,
            usage,
            modifiers: Vec::new(),
        }
    }

    /// A one-row R8 buffer of `size` bytes. Generic GPU-data and sensor consumers get it as an
    /// opaque byte buffer.
    #[must_use]
    pub const fn blob(size: u32, usage: Usage) -> Self {
        Self::new(size, 1, Format::R8, usage)
    }

    #[must_use]
    pub fn with_modifiers(mut self, modifiers: impl IntoIterator<Item = Modifier>) -> Self {
        self.modifiers = modifiers.into_iter().collect();
        self
    }
}

/// Every decision made for a request, before any memory is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPlan {
    pub resolved: Resolved,
    pub width: u32,
    pub height: u32,
    pub layout: PlaneLayout,
    pub memory: MemoryPlan,
    /// Linear layout of the staging buffer, when CPU access is staged.
    pub staging_layout: Option<PlaneLayout>,
}

impl AllocationPlan {
    #[must_use]
    pub const fn modifier(&self) -> Modifier {
        self.layout.modifier
    }

    #[must_use]
    pub const fn use_staging(&self) -> bool {
        self.memory.use_staging
    }
}

/// A vendor image created during planning; destroyed on drop unless claimed.
pub(crate) struct PendingImage {
    vendor: Arc<dyn VendorDriver>,
    image: Option<VendorImage>,
}

impl PendingImage {
    pub(crate) fn claim(mut self) -> Option<(Arc<dyn VendorDriver>, VendorImage)> {
        let image = self.image.take()?;
        Some((self.vendor.clone(), image))
    }
}

impl Drop for PendingImage {
    fn drop(&mut self) {
        if let Some(image) = self.image.take() {
            self.vendor.destroy_image(image.handle);
        }
    }
}

// ===============================================================================================
// Context
// ===============================================================================================

/// The engine's explicit state: its collaborators and the staging memory type chosen for
/// them. Built once and passed by reference to every allocation and import.
pub struct Context {
    pub(crate) provider: Arc<dyn MemoryProvider>,
    pub(crate) device: Arc<dyn DeviceBackend>,
    pub(crate) vendor: Option<Arc<dyn VendorDriver>>,
    render_node: Option<Arc<RenderNode>>,
    pub(crate) staging_memory_type: MemoryType,
    pub(crate) name_buffers: bool,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("vendor", &self.vendor.is_some())
            .field("render_node", &self.render_node)
            .field("staging_memory_type", &self.staging_memory_type)
            .field("name_buffers", &self.name_buffers)
            .finish_non_exhaustive()
    }
}

impl Context {
    #[must_use]
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// A context over the system's dma-heaps with default settings.
    ///
    /// # Errors
    /// See [`ContextBuilder::build`].
    pub fn new() -> HbmResult<Self> {
        Self::builder().build()
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn MemoryProvider> {
        &self.provider
    }

    #[must_use]
    pub const fn staging_memory_type(&self) -> &MemoryType {
        &self.staging_memory_type
    }

    /// The render node buffers can be re-imported into, if one was opened.
    #[must_use]
    pub fn render_node(&self) -> Option<Arc<dyn ImportTarget>> {
        self.render_node
            .clone()
            .map(|node| node as Arc<dyn ImportTarget>)
    }

    /// Allocates a buffer for `request`.
    ///
    /// # Errors
    /// Any resolver, layout, or selection error, or `BackendAllocationFailed`. Nothing is left
    /// allocated when an error is returned.
    pub fn allocate(&self, request: &BufferRequest) -> HbmResult<BufferObject> {
        BufferObject::allocate(self, request)
    }

    /// Wraps an externally allocated buffer. The descriptor in `source` is consumed even when
    /// the import fails.
    ///
    /// # Errors
    /// Resolver errors, `InvalidParam` for inconsistent metadata, or the OS error from querying
    /// the descriptor.
    pub fn import(&self, request: &BufferRequest, source: ImportSource) -> HbmResult<BufferObject> {
        BufferObject::import(self, request, source)
    }

    /// Runs every allocation decision for `request` without allocating memory.
    ///
    /// # Errors
    /// The same errors [`allocate`](Self::allocate) reports before reaching the provider.
    pub fn test_allocate(&self, request: &BufferRequest) -> HbmResult<AllocationPlan> {
        let (plan, _image) = self.plan(request)?;
        Ok(plan)
    }

    /// Modifiers usable for `format` with `usage`, in preference order.
    ///
    /// # Errors
    /// Resolver errors.
    pub fn format_modifiers(&self, format: Format, usage: Usage) -> HbmResult<Vec<Modifier>> {
        let resolved = usage::resolve(format, usage.bits(), self.device.supported_usage())?;
        let mut modifiers = self.candidate_modifiers(&resolved);
        if resolved.caps.needs_linear || resolved.caps.needs_cursor {
            modifiers.retain(|m| m.is_linear());
        }
        Ok(modifiers)
    }

    /// Number of memory planes of `format` with `modifier`. An INVALID modifier means "the
    /// format's linear plane count".
    ///
    /// # Errors
    /// `UnsupportedFormat` for unknown formats or format/modifier combinations.
    pub fn plane_count(&self, format: Format, modifier: Modifier) -> HbmResult<usize> {
        if modifier.is_invalid() {
            return match format.num_planes() {
                0 => Err(HbmError::UnsupportedFormat(format)),
                n => Ok(n),
            };
        }
        self.device.plane_count(format, modifier)
    }

    fn candidate_modifiers(&self, resolved: &Resolved) -> Vec<Modifier> {
        if resolved.format.is_blob() {
            return vec![Modifier::LINEAR];
        }
        self.device.modifiers(resolved.format, &resolved.caps)
    }

    /// Picks one modifier from the caller's list (or the device's, when the caller has none).
    fn choose_modifier(&self, resolved: &Resolved, requested: &[Modifier]) -> HbmResult<Modifier> {
        let supported = self.candidate_modifiers(resolved);
        let candidates: Vec<Modifier> = if requested.is_empty() {
            supported
        } else {
            requested
                .iter()
                .copied()
                .filter(|m| supported.contains(m))
                .collect()
        };

        let caps = &resolved.caps;
        let has_linear = candidates.iter().any(|m| m.is_linear());

        if caps.needs_linear || caps.needs_cursor {
            return if has_linear {
                Ok(Modifier::LINEAR)
            } else {
                Err(HbmError::UnsupportedFormat(resolved.format))
            };
        }
        if caps.uses_cpu() && caps.prefers_direct_map() && has_linear {
            return Ok(Modifier::LINEAR);
        }

        candidates
            .first()
            .copied()
            .ok_or(HbmError::UnsupportedFormat(resolved.format))
    }

    /// Resolve, choose a modifier, lay out, and select memory.
    pub(crate) fn plan(
        &self,
        request: &BufferRequest,
    ) -> HbmResult<(AllocationPlan, Option<PendingImage>)> {
        let resolved = usage::resolve(
            request.format,
            request.usage.bits(),
            self.device.supported_usage(),
        )?;
        let modifier = self.choose_modifier(&resolved, &request.modifiers)?;
        let (width, height) = (request.width, request.height);

        let (layout, pending) = match &self.vendor {
            Some(vendor) if !resolved.format.is_blob() => {
                let desc = ImageDescription {
                    format: resolved.format,
                    width,
                    height,
                    modifier,
                    caps: resolved.caps,
                };
                let image = vendor.create_image(&desc)?;
                let layout = image.layout.clone();
                let pending = PendingImage {
                    vendor: vendor.clone(),
                    image: Some(image),
                };
                (layout, Some(pending))
            }
            _ => {
                if !modifier.is_linear() {
                    return Err(HbmError::InvalidParam(format!(
                        "modifier {:#x} needs a vendor driver",
                        modifier.0
                    )));
                }
                let hints = LayoutHints::for_capabilities(
                    &resolved.caps,
                    self.device.stride_alignment(),
                    self.device.size_granularity(),
                    width,
                    height,
                )?;
                (compute_layout(resolved.format, width, height, &hints)?, None)
            }
        };

        let constraints = Constraints {
            format: resolved.format,
            modifier: layout.modifier,
            caps: resolved.caps,
            size: layout.total_size,
        };
        let candidates = self.device.enumerate_memory_types(&constraints);
        let memory = selector::select(&resolved.caps, &candidates, layout.modifier.is_linear())?;

        let staging_layout = if memory.use_staging {
            Some(standard_layout(resolved.format, width, height)?)
        } else {
            None
        };

        log::debug!(
            "{resolved} {width}x{height}: modifier {:#x}, {} bytes in {}, staging {}",
            layout.modifier.0,
            layout.total_size,
            memory.memory_type,
            memory.use_staging
        );

        Ok((
            AllocationPlan {
                resolved,
                width,
                height,
                layout,
                memory,
                staging_layout,
            },
            pending,
        ))
    }
}

// ===============================================================================================
// Builder
// ===============================================================================================

/// Configures where a [`Context`]'s collaborators come from.
///
/// Unset collaborators default to the kernel ones: dma-heaps under `HBM_DMA_HEAP_DIR` (or
/// `/dev/dma_heap`), a [`HeapDevice`] over them, and the render node named by
/// `HBM_RENDER_NODE` if that variable is set.
#[derive(Default)]
pub struct ContextBuilder {
    heap_dir: Option<PathBuf>,
    render_node: Option<PathBuf>,
    name_buffers: Option<bool>,
    provider: Option<Arc<dyn MemoryProvider>>,
    device: Option<Arc<dyn DeviceBackend>>,
    vendor: Option<Arc<dyn VendorDriver>>,
}

impl ContextBuilder {
    #[must_use]
    pub fn heap_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.heap_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn render_node(mut self, path: impl Into<PathBuf>) -> Self {
        self.render_node = Some(path.into());
        self
    }

    /// Whether allocated buffers get a kernel debug name. Defaults to on.
    #[must_use]
    pub const fn name_buffers(mut self, enabled: bool) -> Self {
        self.name_buffers = Some(enabled);
        self
    }

    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn MemoryProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn device(mut self, device: Arc<dyn DeviceBackend>) -> Self {
        self.device = Some(device);
        self
    }

    #[must_use]
    pub fn vendor(mut self, vendor: Arc<dyn VendorDriver>) -> Self {
        self.vendor = Some(vendor);
        self
    }

    /// Opens the collaborators that were not injected and picks the staging memory type.
    ///
    /// # Errors
    /// The OS error if the system heap or an explicitly named render node cannot be opened;
    /// `NoSuitableMemoryType` if the provider has no mappable coherent memory for staging.
    pub fn build(self) -> HbmResult<Context> {
        let provider: Arc<dyn MemoryProvider> = match self.provider {
            Some(provider) => provider,
            None => {
                let heaps = match self.heap_dir {
                    Some(dir) => DmaHeapProvider::open(dir)?,
                    None => DmaHeapProvider::open_default()?,
                };
                Arc::new(heaps)
            }
        };

        let device: Arc<dyn DeviceBackend> = self
            .device
            .unwrap_or_else(|| Arc::new(HeapDevice::new(provider.clone())));

        let render_node = match self.render_node {
            Some(path) => Some(Arc::new(RenderNode::open(path)?)),
            None => match std::env::var_os(RENDER_NODE_ENV) {
                Some(path) => match RenderNode::open(&path) {
                    Ok(node) => Some(Arc::new(node)),
                    Err(e) => {
                        log::warn!("{RENDER_NODE_ENV}={}: {e}", path.to_string_lossy());
                        None
                    }
                },
                None => None,
            },
        };

        let staging_memory_type = selector::pick_staging_memory_type(&provider.memory_types())?;
        log::debug!("staging memory type: {staging_memory_type}");

        Ok(Context {
            provider,
            device,
            vendor: self.vendor,
            render_node,
            staging_memory_type,
            name_buffers: self.name_buffers.unwrap_or(true),
        })
    }
}
