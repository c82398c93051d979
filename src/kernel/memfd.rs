use crate::engine::memory::{Allocation, MemoryDomain, MemoryProvider, MemoryType, MemoryTypeFlags};
use crate::error::{HbmError, HbmResult};
use crate::kernel::dmabuf::Access;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Mutex;

/// Memory provider backed by anonymous shared memory (`memfd_create`).
///
/// Serves hosts without dma-heaps. Every declared memory type is plain system memory, so the
/// cache-maintenance brackets are no-ops. An optional byte quota makes exhaustion and leaks
/// observable.
#[derive(Debug)]
pub struct MemfdProvider {
    memory_types: Vec<MemoryType>,
    quota: Option<u64>,
    in_use: Mutex<u64>,
}

impl Default for MemfdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemfdProvider {
    /// A provider declaring the same memory types as the kernel heap set.
    #[must_use]
    pub fn new() -> Self {
        Self::with_memory_types(vec![
            MemoryType::new(
                0,
                "memfd-cached",
                MemoryTypeFlags::CACHED | MemoryTypeFlags::MAPPABLE,
                MemoryDomain::Heap,
            ),
            MemoryType::new(
                1,
                "memfd-coherent",
                MemoryTypeFlags::COHERENT | MemoryTypeFlags::MAPPABLE,
                MemoryDomain::Heap,
            ),
            MemoryType::new(
                2,
                "memfd-local",
                MemoryTypeFlags::LOCAL | MemoryTypeFlags::COHERENT | MemoryTypeFlags::MAPPABLE,
                MemoryDomain::Heap,
            ),
        ])
    }

    #[must_use]
    pub fn with_memory_types(memory_types: Vec<MemoryType>) -> Self {
        Self {
            memory_types,
            quota: None,
            in_use: Mutex::new(0),
        }
    }

    /// Caps the total bytes outstanding at any time.
    #[must_use]
    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota = Some(bytes);
        self
    }

    /// Bytes currently allocated and not yet freed.
    #[must_use]
    pub fn bytes_in_use(&self) -> u64 {
        self.in_use.lock().map_or(0, |g| *g)
    }

    fn reserve(&self, size: u64) -> HbmResult<()> {
        let mut in_use = self
            .in_use
            .lock()
            .map_err(|_| HbmError::BackendAllocationFailed("quota lock poisoned".to_string()))?;
        let wanted = in_use.saturating_add(size);
        if let Some(quota) = self.quota
            && wanted > quota
        {
            return Err(HbmError::BackendAllocationFailed(format!(
                "quota exhausted: {} of {quota} bytes in use, {size} requested",
                *in_use
            )));
        }
        *in_use = wanted;
        Ok(())
    }

    fn release(&self, size: u64) {
        if let Ok(mut in_use) = self.in_use.lock() {
            *in_use = in_use.saturating_sub(size);
        }
    }
}

fn create_memfd(size: u64) -> io::Result<OwnedFd> {
    let name = CString::new("hbm").map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let len = libc::off_t::try_from(size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "size exceeds off_t"))?;
    if unsafe { libc::ftruncate(fd.as_raw_fd(), len) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

impl MemoryProvider for MemfdProvider {
    fn memory_types(&self) -> Vec<MemoryType> {
        self.memory_types.clone()
    }

    fn alloc(&self, size: u64, memory_type: &MemoryType) -> HbmResult<Allocation> {
        if !self.memory_types.iter().any(|mt| mt.id == memory_type.id) {
            return Err(HbmError::BackendAllocationFailed(format!(
                "{memory_type} is not a memfd type"
            )));
        }

        self.reserve(size)?;
        match create_memfd(size) {
            Ok(fd) => Ok(Allocation {
                fd,
                size,
                memory_type: memory_type.clone(),
            }),
            Err(e) => {
                self.release(size);
                Err(HbmError::BackendAllocationFailed(format!(
                    "memfd of {size} bytes: {e}"
                )))
            }
        }
    }

    fn free(&self, allocation: Allocation) {
        self.release(allocation.size);
    }

    fn set_name(&self, _fd: BorrowedFd<'_>, _name: &str) -> HbmResult<()> {
        Ok(())
    }

    fn sync_start(&self, _fd: BorrowedFd<'_>, _access: Access) -> HbmResult<()> {
        Ok(())
    }

    fn sync_end(&self, _fd: BorrowedFd<'_>, _access: Access) -> HbmResult<()> {
        Ok(())
    }
}
