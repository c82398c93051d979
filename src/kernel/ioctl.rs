use crate::utils::{iow, iow_ptr, iowr};

// ===============================================================================================
// DMA Heaps (include/uapi/linux/dma-heap.h)
// ===============================================================================================

pub const DMA_HEAP_IOC_MAGIC: u32 = 0x48; // 'H'

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DmaHeapAllocationData {
    pub len: u64,
    pub fd: u32,
    pub fd_flags: u32,
    pub heap_flags: u64,
}

const _: () = assert!(std::mem::size_of::<DmaHeapAllocationData>() == 24);

pub const DMA_HEAP_IOCTL_ALLOC: u32 = iowr::<DmaHeapAllocationData>(DMA_HEAP_IOC_MAGIC, 0x0);

// ===============================================================================================
// DMA Buffers (include/uapi/linux/dma-buf.h)
// ===============================================================================================

pub const DMA_BUF_BASE: u32 = 0x62; // 'b'

pub const DMA_BUF_SYNC_READ: u64 = 1 << 0;
pub const DMA_BUF_SYNC_WRITE: u64 = 2 << 0;
pub const DMA_BUF_SYNC_START: u64 = 0 << 2;
pub const DMA_BUF_SYNC_END: u64 = 1 << 2;

pub const DMA_BUF_NAME_LEN: usize = 32;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DmaBufSync {
    pub flags: u64,
}

pub const DMA_BUF_IOCTL_SYNC: u32 = iow::<DmaBufSync>(DMA_BUF_BASE, 0);
pub const DMA_BUF_SET_NAME: u32 = iow_ptr(DMA_BUF_BASE, 1);

// ===============================================================================================
// DRM PRIME (include/uapi/drm/drm.h)
// ===============================================================================================

pub const DRM_IOCTL_BASE: u32 = 0x64; // 'd'

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DrmPrimeHandle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DrmGemClose {
    pub handle: u32,
    pub pad: u32,
}

pub const DRM_IOCTL_GEM_CLOSE: u32 = iow::<DrmGemClose>(DRM_IOCTL_BASE, 0x09);
pub const DRM_IOCTL_PRIME_FD_TO_HANDLE: u32 = iowr::<DrmPrimeHandle>(DRM_IOCTL_BASE, 0x2e);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioctl_numbers() {
        assert_eq!(DMA_HEAP_IOCTL_ALLOC, 0xC018_4800);
        assert_eq!(DMA_BUF_IOCTL_SYNC, 0x4008_6200);
        assert_eq!(DRM_IOCTL_PRIME_FD_TO_HANDLE, 0xC00C_642E);
        assert_eq!(DRM_IOCTL_GEM_CLOSE, 0x4008_6409);
    }
}
