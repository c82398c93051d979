use crate::engine::memory::{Allocation, MemoryDomain, MemoryProvider, MemoryType, MemoryTypeFlags};
use crate::error::{HbmError, HbmResult};
use crate::kernel::dmabuf::ioctl_retry;
use crate::kernel::ioctl::{DMA_HEAP_IOCTL_ALLOC, DmaHeapAllocationData};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Default location of the dma-heap character devices.
pub const DEFAULT_HEAP_DIR: &str = "/dev/dma_heap";

/// Environment variable overriding [`DEFAULT_HEAP_DIR`].
pub const HEAP_DIR_ENV: &str = "HBM_DMA_HEAP_DIR";

const SYSTEM_HEAP: &str = "system";
const SYSTEM_UNCACHED_HEAP: &str = "system-uncached";
const CMA_HEAP: &str = "linux,cma";

/// One opened `/dev/dma_heap/<name>` node.
#[derive(Debug)]
struct Heap {
    memory_type: MemoryType,
    file: File,
}

/// Memory provider backed by the Linux dma-heap interface.
///
/// The `system` heap is mandatory. `system-uncached` and `linux,cma` are optional; when one is
/// missing, its memory type is still declared but served by the system heap.
#[derive(Debug)]
pub struct DmaHeapProvider {
    dir: PathBuf,
    heaps: Vec<Heap>,
}

impl DmaHeapProvider {
    /// Opens the heaps under [`HEAP_DIR_ENV`] if set, else under [`DEFAULT_HEAP_DIR`].
    ///
    /// # Errors
    /// Returns an error if the system heap cannot be opened.
    pub fn open_default() -> HbmResult<Self> {
        let dir = std::env::var_os(HEAP_DIR_ENV)
            .map_or_else(|| PathBuf::from(DEFAULT_HEAP_DIR), PathBuf::from);
        Self::open(dir)
    }

    /// Opens the heaps under `dir`.
    ///
    /// # Errors
    /// Returns an error if the system heap cannot be opened.
    pub fn open(dir: impl AsRef<Path>) -> HbmResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let system = open_heap(&dir, SYSTEM_HEAP)?;

        let optional = |name: &str| -> HbmResult<File> {
            match open_heap(&dir, name) {
                Ok(file) => Ok(file),
                Err(e) => {
                    log::info!("dma-heap {name} unavailable ({e}), using {SYSTEM_HEAP}");
                    Ok(system.try_clone()?)
                }
            }
        };
        let uncached = optional(SYSTEM_UNCACHED_HEAP)?;
        let cma = optional(CMA_HEAP)?;

        let heaps = vec![
            Heap {
                memory_type: MemoryType::new(
                    0,
                    SYSTEM_HEAP,
                    MemoryTypeFlags::CACHED | MemoryTypeFlags::MAPPABLE,
                    MemoryDomain::Heap,
                ),
                file: system,
            },
            Heap {
                memory_type: MemoryType::new(
                    1,
                    SYSTEM_UNCACHED_HEAP,
                    MemoryTypeFlags::COHERENT | MemoryTypeFlags::MAPPABLE,
                    MemoryDomain::Heap,
                ),
                file: uncached,
            },
            Heap {
                memory_type: MemoryType::new(
                    2,
                    CMA_HEAP,
                    MemoryTypeFlags::LOCAL | MemoryTypeFlags::COHERENT | MemoryTypeFlags::MAPPABLE,
                    MemoryDomain::Heap,
                ),
                file: cma,
            },
        ];

        Ok(Self { dir, heaps })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn heap(&self, memory_type: &MemoryType) -> HbmResult<&Heap> {
        self.heaps
            .iter()
            .find(|h| h.memory_type.id == memory_type.id)
            .ok_or_else(|| {
                HbmError::BackendAllocationFailed(format!("{memory_type} is not a dma-heap type"))
            })
    }
}

fn open_heap(dir: &Path, name: &str) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(dir.join(name))
}

impl MemoryProvider for DmaHeapProvider {
    fn memory_types(&self) -> Vec<MemoryType> {
        self.heaps.iter().map(|h| h.memory_type.clone()).collect()
    }

    fn alloc(&self, size: u64, memory_type: &MemoryType) -> HbmResult<Allocation> {
        let heap = self.heap(memory_type)?;

        #[allow(clippy::cast_sign_loss)]
        let mut args = DmaHeapAllocationData {
            len: size,
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            ..Default::default()
        };

        unsafe { ioctl_retry(heap.file.as_fd(), DMA_HEAP_IOCTL_ALLOC, &raw mut args) }.map_err(|e| {
            HbmError::BackendAllocationFailed(format!(
                "{} heap refused {size} bytes: {e}",
                memory_type.name
            ))
        })?;

        #[allow(clippy::cast_possible_wrap)]
        let fd = unsafe { OwnedFd::from_raw_fd(args.fd as i32) };

        Ok(Allocation {
            fd,
            size,
            memory_type: heap.memory_type.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_system_heap_is_fatal() {
        let dir = std::env::temp_dir().join(format!("hbm-no-heaps-{}", std::process::id()));
        assert!(DmaHeapProvider::open(&dir).is_err());
    }
}
