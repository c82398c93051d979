#![allow(dead_code)]

use hbm_rs::engine::format::{Format, Modifier};
use hbm_rs::engine::layout::{LayoutHints, PlaneLayout, compute_layout};
use hbm_rs::engine::memory::{
    Allocation, Constraints, DeviceBackend, DeviceCopy, DeviceMemory, HeapDevice, MemoryDomain,
    MemoryProvider, MemoryType, MemoryTypeFlags,
};
use hbm_rs::engine::staging::{Rect, copy_rect};
use hbm_rs::engine::usage::{Capabilities, Usage};
use hbm_rs::engine::vendor::{
    CopyDirection, ImageDescription, VendorDriver, VendorImage, VendorMapping,
};
use hbm_rs::kernel::dmabuf::{Access, CpuMapping};
use hbm_rs::kernel::memfd::MemfdProvider;
use hbm_rs::{BufferObject, BufferRequest, Context, HbmError, HbmResult, ImportTarget};
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ===============================================================================================
// Memory provider
// ===============================================================================================

/// A memfd provider that counts every call the engine makes into it.
#[derive(Debug)]
pub struct CountingProvider {
    pub inner: MemfdProvider,
    pub allocs: AtomicUsize,
    pub frees: AtomicUsize,
    pub sync_starts: AtomicUsize,
    pub sync_ends: AtomicUsize,
    pub maps: AtomicUsize,
    pub names: Mutex<Vec<String>>,
    /// Remaining maps before every further map fails. `None` never fails.
    map_budget: Mutex<Option<usize>>,
}

impl CountingProvider {
    pub fn new(inner: MemfdProvider) -> Self {
        Self {
            inner,
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            sync_starts: AtomicUsize::new(0),
            sync_ends: AtomicUsize::new(0),
            maps: AtomicUsize::new(0),
            names: Mutex::new(Vec::new()),
            map_budget: Mutex::new(None),
        }
    }

    /// Lets `n` more maps succeed, then fails the rest.
    pub fn fail_maps_after(&self, n: usize) {
        *self.map_budget.lock().unwrap() = Some(n);
    }

    pub fn allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    pub fn sync_starts(&self) -> usize {
        self.sync_starts.load(Ordering::SeqCst)
    }

    pub fn sync_ends(&self) -> usize {
        self.sync_ends.load(Ordering::SeqCst)
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.inner.bytes_in_use()
    }
}

impl MemoryProvider for CountingProvider {
    fn memory_types(&self) -> Vec<MemoryType> {
        self.inner.memory_types()
    }

    fn alloc(&self, size: u64, memory_type: &MemoryType) -> HbmResult<Allocation> {
        let allocation = self.inner.alloc(size, memory_type)?;
        self.allocs.fetch_add(1, Ordering::SeqCst);
        Ok(allocation)
    }

    fn free(&self, allocation: Allocation) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        self.inner.free(allocation);
    }

    fn set_name(&self, _fd: BorrowedFd<'_>, name: &str) -> HbmResult<()> {
        self.names.lock().unwrap().push(name.to_string());
        Ok(())
    }

    fn sync_start(&self, fd: BorrowedFd<'_>, access: Access) -> HbmResult<()> {
        self.sync_starts.fetch_add(1, Ordering::SeqCst);
        self.inner.sync_start(fd, access)
    }

    fn sync_end(&self, fd: BorrowedFd<'_>, access: Access) -> HbmResult<()> {
        self.sync_ends.fetch_add(1, Ordering::SeqCst);
        self.inner.sync_end(fd, access)
    }

    fn map(&self, fd: BorrowedFd<'_>, len: usize, access: Access) -> HbmResult<CpuMapping> {
        {
            let mut budget = self.map_budget.lock().unwrap();
            match budget.as_mut() {
                Some(0) => return Err(HbmError::InvalidParam("map refused".to_string())),
                Some(n) => *n -= 1,
                None => {}
            }
        }
        self.maps.fetch_add(1, Ordering::SeqCst);
        self.inner.map(fd, len, access)
    }
}

// ===============================================================================================
// Device backends
// ===============================================================================================

/// A discrete device whose only memory is device-local and not CPU-mappable.
///
/// Every allocation is exported as a pipe, so any attempt to `mmap` it fails the way real VRAM
/// would. The contents live on the "device" side, keyed by the descriptor's inode, and are only
/// reachable through [`DeviceBackend::copy_buffer`] or the device-write helpers below.
pub struct VramDevice {
    heap: HeapDevice,
    memory: Mutex<HashMap<u64, Vec<u8>>>,
    pub allocs: AtomicUsize,
    pub frees: AtomicUsize,
    pub copies: Mutex<Vec<CopyDirection>>,
    fail_copies: AtomicBool,
}

pub fn vram_type() -> MemoryType {
    MemoryType::new(7, "vram", MemoryTypeFlags::LOCAL, MemoryDomain::Device)
}

fn inode(fd: BorrowedFd<'_>) -> u64 {
    File::from(fd.try_clone_to_owned().unwrap())
        .metadata()
        .unwrap()
        .ino()
}

fn pipe() -> OwnedFd {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    drop(write);
    read
}

impl VramDevice {
    pub fn new(provider: Arc<dyn MemoryProvider>) -> Self {
        Self {
            heap: HeapDevice::new(provider),
            memory: Mutex::new(HashMap::new()),
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            copies: Mutex::new(Vec::new()),
            fail_copies: AtomicBool::new(false),
        }
    }

    pub fn bytes_in_use(&self) -> u64 {
        self.memory
            .lock()
            .unwrap()
            .values()
            .map(|bytes| bytes.len() as u64)
            .sum()
    }

    pub fn copies(&self) -> Vec<CopyDirection> {
        self.copies.lock().unwrap().clone()
    }

    pub fn fail_copies(&self) {
        self.fail_copies.store(true, Ordering::SeqCst);
    }

    /// The bytes of the allocation behind `fd`, as the device sees them.
    pub fn contents(&self, fd: BorrowedFd<'_>) -> Vec<u8> {
        self.memory.lock().unwrap()[&inode(fd)].clone()
    }

    /// A device-side write, e.g. a render into the buffer.
    pub fn write(&self, fd: BorrowedFd<'_>, offset: usize, bytes: &[u8]) {
        let mut memory = self.memory.lock().unwrap();
        let contents = memory.get_mut(&inode(fd)).unwrap();
        contents[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl DeviceBackend for VramDevice {
    fn supported_usage(&self) -> Usage {
        self.heap.supported_usage()
    }

    fn enumerate_memory_types(&self, _constraints: &Constraints) -> Vec<MemoryType> {
        vec![vram_type()]
    }

    fn plane_count(&self, format: Format, modifier: Modifier) -> HbmResult<usize> {
        self.heap.plane_count(format, modifier)
    }

    fn modifiers(&self, format: Format, caps: &Capabilities) -> Vec<Modifier> {
        self.heap.modifiers(format, caps)
    }

    fn stride_alignment(&self) -> u64 {
        256
    }

    fn allocate_memory(&self, size: u64, memory_type: &MemoryType) -> HbmResult<DeviceMemory> {
        let fd = pipe();
        let len = usize::try_from(size).unwrap();
        self.memory.lock().unwrap().insert(inode(fd.as_fd()), vec![0; len]);
        let handle = self.allocs.fetch_add(1, Ordering::SeqCst) as u64;
        Ok(DeviceMemory {
            handle,
            fd,
            size,
            memory_type: memory_type.clone(),
        })
    }

    fn free_memory(&self, memory: DeviceMemory) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        self.memory.lock().unwrap().remove(&inode(memory.fd.as_fd()));
    }

    fn copy_buffer(&self, copy: &DeviceCopy<'_>) -> HbmResult<()> {
        if self.fail_copies.load(Ordering::SeqCst) {
            return Err(HbmError::CopyFailed("device copy refused".to_string()));
        }
        self.copies.lock().unwrap().push(copy.direction);

        let staging_len = usize::try_from(copy.staging_layout.total_size).unwrap();
        let mut staging = CpuMapping::new(copy.staging, staging_len, Access::READ_WRITE)?;
        let staging = staging.as_mut_slice().unwrap();

        let mut memory = self.memory.lock().unwrap();
        // Foreign imports are not device allocations; reach them through their own mapping.
        let mut foreign = None;
        let buffer: &mut [u8] = match memory.get_mut(&inode(copy.buffer)) {
            Some(bytes) => bytes.as_mut_slice(),
            None => {
                let len = usize::try_from(copy.layout.total_size).unwrap();
                let mapping = CpuMapping::new(copy.buffer, len, Access::READ_WRITE)?;
                foreign.insert(mapping).as_mut_slice().unwrap()
            }
        };

        match copy.direction {
            CopyDirection::FromImage => copy_rect(
                copy.format,
                buffer,
                copy.layout,
                staging,
                copy.staging_layout,
                copy.rect,
            ),
            CopyDirection::ToImage => copy_rect(
                copy.format,
                staging,
                copy.staging_layout,
                buffer,
                copy.layout,
                copy.rect,
            ),
        }
    }
}

// ===============================================================================================
// Vendor driver
// ===============================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorCall {
    Create(u64),
    Import(u64),
    Bind(u64),
    Map(u64),
    Unmap(u64),
    Copy(u64, CopyDirection, Rect),
    Destroy(u64),
}

/// Lays images out with a 256-byte pitch and records every call.
#[derive(Default)]
pub struct RecordingVendor {
    next: AtomicU32,
    pub calls: Mutex<Vec<VendorCall>>,
    pub fail_bind: bool,
}

impl RecordingVendor {
    pub fn failing_bind() -> Self {
        Self {
            fail_bind: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<VendorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&VendorCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: VendorCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn layout_for(desc: &ImageDescription) -> HbmResult<PlaneLayout> {
        let hints = LayoutHints {
            stride_alignment: 256,
            size_alignment: 4096,
            min_frame_size: None,
        };
        compute_layout(desc.format, desc.width, desc.height, &hints)
    }
}

impl VendorDriver for RecordingVendor {
    fn create_image(&self, desc: &ImageDescription) -> HbmResult<VendorImage> {
        let handle = u64::from(self.next.fetch_add(1, Ordering::SeqCst)) + 1;
        self.record(VendorCall::Create(handle));
        Ok(VendorImage {
            handle,
            layout: Self::layout_for(desc)?,
        })
    }

    fn import_image(
        &self,
        _desc: &ImageDescription,
        _fds: &[BorrowedFd<'_>],
        layout: &PlaneLayout,
    ) -> HbmResult<VendorImage> {
        let handle = u64::from(self.next.fetch_add(1, Ordering::SeqCst)) + 1;
        self.record(VendorCall::Import(handle));
        Ok(VendorImage {
            handle,
            layout: layout.clone(),
        })
    }

    fn bind_memory(&self, image: u64, _fd: BorrowedFd<'_>) -> HbmResult<()> {
        self.record(VendorCall::Bind(image));
        if self.fail_bind {
            return Err(HbmError::BackendAllocationFailed("bind refused".to_string()));
        }
        Ok(())
    }

    fn map_image(&self, image: u64, _access: Access) -> HbmResult<VendorMapping> {
        self.record(VendorCall::Map(image));
        Err(HbmError::InvalidParam("tiled image".to_string()))
    }

    fn unmap_image(&self, image: u64) {
        self.record(VendorCall::Unmap(image));
    }

    fn copy_image(
        &self,
        image: u64,
        _staging: BorrowedFd<'_>,
        _staging_layout: &PlaneLayout,
        rect: Rect,
        direction: CopyDirection,
    ) -> HbmResult<()> {
        self.record(VendorCall::Copy(image, direction, rect));
        Ok(())
    }

    fn destroy_image(&self, image: u64) {
        self.record(VendorCall::Destroy(image));
    }
}

// ===============================================================================================
// Import target
// ===============================================================================================

#[derive(Default)]
pub struct RecordingTarget {
    next: AtomicU32,
    pub released: Mutex<Vec<u32>>,
    pub refuse: bool,
}

impl RecordingTarget {
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn imports(&self) -> u32 {
        self.next.load(Ordering::SeqCst)
    }
}

impl ImportTarget for RecordingTarget {
    fn import(&self, _fd: BorrowedFd<'_>) -> HbmResult<u32> {
        if self.refuse {
            return Err(HbmError::InvalidParam("no such buffer".to_string()));
        }
        Ok(self.next.fetch_add(1, Ordering::SeqCst) + 100)
    }

    fn release(&self, handle: u32) -> HbmResult<()> {
        self.released.lock().unwrap().push(handle);
        Ok(())
    }
}

// ===============================================================================================
// Contexts
// ===============================================================================================

pub fn counting_provider() -> Arc<CountingProvider> {
    Arc::new(CountingProvider::new(MemfdProvider::new()))
}

/// A context over memfd memory with the kernel-heap device policy.
pub fn memfd_context(provider: &Arc<CountingProvider>) -> Context {
    Context::builder()
        .provider(provider.clone())
        .build()
        .unwrap()
}

/// A context whose buffers live in non-mappable device memory.
pub fn vram_context(provider: &Arc<CountingProvider>) -> (Context, Arc<VramDevice>) {
    let device = Arc::new(VramDevice::new(provider.clone()));
    let ctx = Context::builder()
        .provider(provider.clone())
        .device(device.clone())
        .build()
        .unwrap();
    (ctx, device)
}

pub fn fill_pattern(bo: &mut BufferObject, seed: u8) -> Vec<u8> {
    let bytes = bo.mapped_bytes_mut().unwrap();
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(31).wrapping_add(seed);
    }
    bytes.to_vec()
}

pub fn request(width: u32, height: u32, format: Format, usage: Usage) -> BufferRequest {
    BufferRequest::new(width, height, format, usage)
}
