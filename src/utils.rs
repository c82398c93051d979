#![allow(clippy::used_underscore_items, clippy::cast_possible_truncation)]

use crate::error::{HbmError, HbmResult};

const _IOC_NRBITS: u32 = 8;
const _IOC_TYPEBITS: u32 = 8;
const _IOC_SIZEBITS: u32 = 14;

const _IOC_NRSHIFT: u32 = 0;
const _IOC_TYPESHIFT: u32 = _IOC_NRSHIFT + _IOC_NRBITS;
const _IOC_SIZESHIFT: u32 = _IOC_TYPESHIFT + _IOC_TYPEBITS;
const _IOC_DIRSHIFT: u32 = _IOC_SIZESHIFT + _IOC_SIZEBITS;

const _IOC_WRITE: u32 = 1;
const _IOC_READ: u32 = 2;

#[must_use]
pub const fn _ioc(dir: u32, type_: u32, nr: u32, size: usize) -> u32 {
    (dir << _IOC_DIRSHIFT)
        | (type_ << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)
}

#[must_use]
pub const fn iow<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

#[must_use]
pub const fn iowr<T>(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_READ | _IOC_WRITE, type_, nr, std::mem::size_of::<T>())
}

/// Same encoding as `iow`, for ioctls whose argument is a pointer-sized value
/// (e.g. `DMA_BUF_SET_NAME`, which the kernel declares with a `const char *`).
#[must_use]
pub const fn iow_ptr(type_: u32, nr: u32) -> u32 {
    _ioc(_IOC_WRITE, type_, nr, std::mem::size_of::<u64>())
}

// ===============================================================================================
// Checked arithmetic used by the layout calculator
// ===============================================================================================

/// Rounds `val` up to a multiple of `align`. `align` does not need to be a power of two.
///
/// # Errors
/// Returns `LayoutOverflow` if the result does not fit in a `u64`.
pub fn align_up(val: u64, align: u64) -> HbmResult<u64> {
    if align <= 1 {
        return Ok(val);
    }
    let rem = val % align;
    if rem == 0 {
        return Ok(val);
    }
    val.checked_add(align - rem).ok_or(HbmError::LayoutOverflow)
}

#[must_use]
pub const fn div_round_up(val: u64, div: u64) -> u64 {
    val.div_ceil(div)
}

/// `a * b` with overflow reported as a layout error rather than a wrap.
///
/// # Errors
/// Returns `LayoutOverflow` on overflow.
pub fn checked_mul(a: u64, b: u64) -> HbmResult<u64> {
    a.checked_mul(b).ok_or(HbmError::LayoutOverflow)
}

/// `a + b` with overflow reported as a layout error.
///
/// # Errors
/// Returns `LayoutOverflow` on overflow.
pub fn checked_add(a: u64, b: u64) -> HbmResult<u64> {
    a.checked_add(b).ok_or(HbmError::LayoutOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_handles_non_power_of_two() {
        assert_eq!(align_up(460_800, 4096).unwrap(), 462_848);
        assert_eq!(align_up(100, 24).unwrap(), 120);
        assert_eq!(align_up(96, 32).unwrap(), 96);
        assert_eq!(align_up(7, 0).unwrap(), 7);
    }

    #[test]
    fn align_up_reports_overflow() {
        assert!(matches!(
            align_up(u64::MAX - 1, 4096),
            Err(HbmError::LayoutOverflow)
        ));
    }

    #[test]
    fn ioctl_numbers_match_kernel_headers() {
        // DMA_HEAP_IOCTL_ALLOC = _IOWR('H', 0x0, struct dma_heap_allocation_data), 24-byte arg
        assert_eq!(_ioc(_IOC_READ | _IOC_WRITE, 0x48, 0, 24), 0xC018_4800);
        // DMA_BUF_SET_NAME_B = _IOW('b', 1, __u64)
        assert_eq!(iow_ptr(0x62, 1), 0x4008_6201);
    }
}
