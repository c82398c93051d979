use crate::kernel::ioctl::{
    DMA_BUF_IOCTL_SYNC, DMA_BUF_NAME_LEN, DMA_BUF_SET_NAME, DMA_BUF_SYNC_END, DMA_BUF_SYNC_READ,
    DMA_BUF_SYNC_START, DMA_BUF_SYNC_WRITE, DmaBufSync,
};
use bitflags::bitflags;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::{self, NonNull};
use std::time::Duration;

bitflags! {
    /// Direction of a CPU access to a buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl Access {
    const fn sync_bits(self) -> u64 {
        let mut flags = 0;
        if self.contains(Self::READ) {
            flags |= DMA_BUF_SYNC_READ;
        }
        if self.contains(Self::WRITE) {
            flags |= DMA_BUF_SYNC_WRITE;
        }
        flags
    }

    const fn prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        prot
    }
}

/// Issues an ioctl, retrying while the kernel reports `EINTR`/`EAGAIN`.
///
/// # Safety
/// `arg` must point to memory of the type the ioctl `cmd` expects, valid for the whole call.
pub unsafe fn ioctl_retry<T>(fd: BorrowedFd<'_>, cmd: u32, arg: *mut T) -> io::Result<()> {
    loop {
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), cmd as _, arg) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR | libc::EAGAIN) => continue,
            _ => return Err(err),
        }
    }
}

/// Returns the size of the object behind `fd` by seeking to its end, then rewinds.
///
/// # Errors
/// Returns the OS error if the descriptor is not seekable.
pub fn size(fd: BorrowedFd<'_>) -> io::Result<u64> {
    let end = unsafe { libc::lseek(fd.as_raw_fd(), 0, libc::SEEK_END) };
    if end < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe {
        libc::lseek(fd.as_raw_fd(), 0, libc::SEEK_SET);
    }
    #[allow(clippy::cast_sign_loss)]
    Ok(end as u64)
}

/// Attaches a debug name to a dma-buf (visible in `/sys/kernel/debug/dma_buf/bufinfo`).
///
/// Names longer than the kernel limit are truncated.
///
/// # Errors
/// Returns the OS error from `DMA_BUF_SET_NAME`.
pub fn set_name(fd: BorrowedFd<'_>, name: &str) -> io::Result<()> {
    let truncated: Vec<u8> = name
        .bytes()
        .filter(|&b| b != 0)
        .take(DMA_BUF_NAME_LEN - 1)
        .collect();
    let name = CString::new(truncated).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), DMA_BUF_SET_NAME as _, name.as_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Brackets the start of a CPU access (`DMA_BUF_SYNC_START`).
///
/// # Errors
/// Returns the OS error from `DMA_BUF_IOCTL_SYNC`.
pub fn sync_start(fd: BorrowedFd<'_>, access: Access) -> io::Result<()> {
    let mut args = DmaBufSync {
        flags: DMA_BUF_SYNC_START | access.sync_bits(),
    };
    unsafe { ioctl_retry(fd, DMA_BUF_IOCTL_SYNC, &raw mut args) }
}

/// Brackets the end of a CPU access (`DMA_BUF_SYNC_END`).
///
/// # Errors
/// Returns the OS error from `DMA_BUF_IOCTL_SYNC`.
pub fn sync_end(fd: BorrowedFd<'_>, access: Access) -> io::Result<()> {
    let mut args = DmaBufSync {
        flags: DMA_BUF_SYNC_END | access.sync_bits(),
    };
    unsafe { ioctl_retry(fd, DMA_BUF_IOCTL_SYNC, &raw mut args) }
}

/// Polls a dma-buf until its implicit fences allow `access`.
///
/// A dma-buf reports `POLLIN` once all writers are done (safe to read) and `POLLOUT` once all
/// readers and writers are done (safe to write). `timeout` of `None` waits forever. Interrupted
/// polls are retried.
///
/// # Errors
/// Returns `TimedOut` when the timeout expires, the OS error for a failed `poll`, or `Other`
/// when the descriptor signals an error condition instead of readiness.
pub fn wait_ready(fd: BorrowedFd<'_>, access: Access, timeout: Option<Duration>) -> io::Result<()> {
    let events = if access.contains(Access::WRITE) {
        libc::POLLOUT
    } else {
        libc::POLLIN
    };
    let timeout_ms = timeout.map_or(-1, |t| {
        libc::c_int::try_from(t.as_millis()).unwrap_or(libc::c_int::MAX)
    });

    let mut pollfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events,
        revents: 0,
    };

    loop {
        let ret = unsafe { libc::poll(&raw mut pollfd, 1, timeout_ms) };
        if ret > 0 {
            if pollfd.revents & events != 0 {
                return Ok(());
            }
            return Err(io::Error::other(format!(
                "fence descriptor reported revents {:#x}",
                pollfd.revents
            )));
        }
        if ret == 0 {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR | libc::EAGAIN) => continue,
            _ => return Err(err),
        }
    }
}

// ===============================================================================================
// CPU Mappings
// ===============================================================================================

/// A shared CPU mapping of a buffer descriptor. Unmapped on drop.
#[derive(Debug)]
pub struct CpuMapping {
    ptr: NonNull<u8>,
    len: usize,
    access: Access,
}

// The mapping is plain shared memory; ownership of the region moves with the struct.
unsafe impl Send for CpuMapping {}
unsafe impl Sync for CpuMapping {}

impl CpuMapping {
    /// Maps `len` bytes of `fd` starting at offset 0.
    ///
    /// # Errors
    /// Returns the OS error if `mmap` fails, or `InvalidInput` for a zero length.
    pub fn new(fd: BorrowedFd<'_>, len: usize, access: Access) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty buffer",
            ));
        }

        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                access.prot(),
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = NonNull::new(ret.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        Ok(Self { ptr, len, access })
    }

    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Read-only view. Mappings created without `READ` access may fault on read, so callers only
    /// read from mappings they created readable.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Writable view. Returns `None` if the mapping was not created with `WRITE` access.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        if !self.access.contains(Access::WRITE) {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) })
    }
}

impl Drop for CpuMapping {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if ret != 0 {
            log::error!(
                "munmap of {} bytes failed: {}",
                self.len,
                io::Error::last_os_error()
            );
        }
    }
}
