//! Staging buffers and linear rectangle copies.

use crate::engine::format::{self, Format};
use crate::engine::layout::PlaneLayout;
use crate::engine::memory::{Allocation, MemoryProvider, MemoryType};
use crate::error::{HbmError, HbmResult};
use crate::kernel::dmabuf::{Access, CpuMapping};
use crate::utils::{checked_add, checked_mul, div_round_up};
use std::mem::ManuallyDrop;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;

/// A pixel rectangle. For opaque byte buffers `x` is a byte offset and the rectangle covers
/// `width * height` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole `width` x `height` image.
    #[must_use]
    pub const fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }
}

/// Where a buffer's staging copies come from and how they are laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingPlan {
    pub memory_type: MemoryType,
    pub layout: PlaneLayout,
}

/// A CPU-mappable, coherent scratch allocation with a linear standard layout.
pub struct StagingBuffer {
    provider: Arc<dyn MemoryProvider>,
    allocation: ManuallyDrop<Allocation>,
    layout: PlaneLayout,
    mapping: Option<CpuMapping>,
}

impl std::fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("allocation", &*self.allocation)
            .field("layout", &self.layout)
            .field("mapped", &self.mapping.is_some())
            .finish_non_exhaustive()
    }
}

impl StagingBuffer {
    /// Allocates a staging buffer as described by `plan`.
    ///
    /// # Errors
    /// `BackendAllocationFailed` from the provider.
    pub fn new(provider: Arc<dyn MemoryProvider>, plan: &StagingPlan) -> HbmResult<Self> {
        let allocation = provider.alloc(plan.layout.total_size, &plan.memory_type)?;
        Ok(Self {
            provider,
            allocation: ManuallyDrop::new(allocation),
            layout: plan.layout.clone(),
            mapping: None,
        })
    }

    #[must_use]
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.allocation.fd.as_fd()
    }

    #[must_use]
    pub const fn layout(&self) -> &PlaneLayout {
        &self.layout
    }

    /// Maps the whole buffer read-write, reusing an existing mapping.
    ///
    /// # Errors
    /// `CopyFailed` if the buffer cannot be mapped.
    pub fn map(&mut self) -> HbmResult<&mut CpuMapping> {
        if self.mapping.is_none() {
            let len =
                usize::try_from(self.layout.total_size).map_err(|_| HbmError::LayoutOverflow)?;
            let mapping = self
                .provider
                .map(self.fd(), len, Access::READ_WRITE)
                .map_err(|e| HbmError::CopyFailed(format!("mapping staging buffer: {e}")))?;
            self.mapping = Some(mapping);
        }
        self.mapping
            .as_mut()
            .ok_or_else(|| HbmError::CopyFailed("staging buffer not mapped".to_string()))
    }

    #[must_use]
    pub const fn mapping(&self) -> Option<&CpuMapping> {
        self.mapping.as_ref()
    }

    pub fn mapping_mut(&mut self) -> Option<&mut CpuMapping> {
        self.mapping.as_mut()
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        self.mapping = None;
        // The allocation is never touched again after this point.
        let allocation = unsafe { ManuallyDrop::take(&mut self.allocation) };
        self.provider.free(allocation);
    }
}

/// Copies `rect` of every plane from `src` to `dst`, two linear buffers of `format` whose
/// strides and offsets may differ.
///
/// # Errors
/// `CopyFailed` if a row falls outside either buffer or its plane.
pub fn copy_rect(
    format: Format,
    src: &[u8],
    src_layout: &PlaneLayout,
    dst: &mut [u8],
    dst_layout: &PlaneLayout,
    rect: Rect,
) -> HbmResult<()> {
    if src_layout.plane_count() != dst_layout.plane_count() {
        return Err(HbmError::CopyFailed(format!(
            "plane count mismatch: {} vs {}",
            src_layout.plane_count(),
            dst_layout.plane_count()
        )));
    }

    if format.is_blob() {
        let start = u64::from(rect.x);
        let len = checked_mul(u64::from(rect.width), u64::from(rect.height))?;
        let s = checked_add(src_layout.planes[0].offset, start)?;
        let d = checked_add(dst_layout.planes[0].offset, start)?;
        return copy_span(src, s, dst, d, len);
    }

    for (plane, (sp, dp)) in src_layout.planes.iter().zip(&dst_layout.planes).enumerate() {
        let bpp = u64::from(format::bytes_per_pixel(format, plane)?);
        let (hsub, vsub) = format::subsampling(format, plane)?;
        let (hsub, vsub) = (u64::from(hsub), u64::from(vsub));

        let px = u64::from(rect.x) / hsub;
        let py = u64::from(rect.y) / vsub;
        let pw = div_round_up(checked_add(u64::from(rect.x), u64::from(rect.width))?, hsub) - px;
        let ph = div_round_up(checked_add(u64::from(rect.y), u64::from(rect.height))?, vsub) - py;
        let row_bytes = checked_mul(pw, bpp)?;
        if row_bytes > sp.stride || row_bytes > dp.stride {
            return Err(HbmError::CopyFailed(format!(
                "plane {plane}: row of {row_bytes} bytes exceeds stride"
            )));
        }

        for row in py..py + ph {
            let s = checked_add(sp.offset, checked_add(checked_mul(row, sp.stride)?, px * bpp)?)?;
            let d = checked_add(dp.offset, checked_add(checked_mul(row, dp.stride)?, px * bpp)?)?;
            if s + row_bytes > sp.offset + sp.size || d + row_bytes > dp.offset + dp.size {
                return Err(HbmError::CopyFailed(format!(
                    "plane {plane}: row {row} outside the plane"
                )));
            }
            copy_span(src, s, dst, d, row_bytes)?;
        }
    }

    Ok(())
}

fn copy_span(src: &[u8], s: u64, dst: &mut [u8], d: u64, len: u64) -> HbmResult<()> {
    let range = |start: u64, limit: usize| -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(start).ok()?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        (end <= limit).then_some(start..end)
    };
    let (Some(sr), Some(dr)) = (range(s, src.len()), range(d, dst.len())) else {
        return Err(HbmError::CopyFailed(format!(
            "{len} bytes at {s} -> {d} out of bounds ({} / {})",
            src.len(),
            dst.len()
        )));
    };
    dst[dr].copy_from_slice(&src[sr]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::layout::{LayoutHints, compute_layout, standard_layout};

    fn padded(format: Format, w: u32, h: u32) -> PlaneLayout {
        let hints = LayoutHints {
            stride_alignment: 64,
            size_alignment: 4096,
            min_frame_size: None,
        };
        compute_layout(format, w, h, &hints).unwrap()
    }

    #[test]
    fn nv12_roundtrip_between_strides() {
        let real = padded(Format::NV12, 30, 10);
        let staging = standard_layout(Format::NV12, 30, 10).unwrap();
        assert_ne!(real.planes[0].stride, staging.planes[0].stride);

        let src: Vec<u8> = (0..staging.total_size).map(|i| (i % 251) as u8).collect();
        let mut dst = vec![0u8; usize::try_from(real.total_size).unwrap()];
        copy_rect(Format::NV12, &src, &staging, &mut dst, &real, Rect::full(30, 10)).unwrap();

        let mut back = vec![0u8; src.len()];
        copy_rect(Format::NV12, &dst, &real, &mut back, &staging, Rect::full(30, 10)).unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn sub_rect_leaves_the_rest_untouched() {
        let layout = standard_layout(Format::ARGB8888, 8, 8).unwrap();
        let src = vec![0xffu8; 256];
        let mut dst = vec![0u8; 256];
        copy_rect(
            Format::ARGB8888,
            &src,
            &layout,
            &mut dst,
            &layout,
            Rect::new(2, 3, 2, 1),
        )
        .unwrap();

        let touched: Vec<usize> = dst
            .iter()
            .enumerate()
            .filter(|&(_, b)| *b == 0xff)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(touched, (3 * 32 + 8..3 * 32 + 16).collect::<Vec<_>>());
    }

    #[test]
    fn blob_copies_byte_range() {
        let layout = standard_layout(Format::INVALID, 100, 1).unwrap();
        let src: Vec<u8> = (0..100).collect();
        let mut dst = vec![0u8; 100];
        copy_rect(
            Format::INVALID,
            &src,
            &layout,
            &mut dst,
            &layout,
            Rect::new(10, 0, 5, 1),
        )
        .unwrap();
        assert_eq!(&dst[10..15], &src[10..15]);
        assert_eq!(dst[9], 0);
        assert_eq!(dst[15], 0);
    }

    #[test]
    fn out_of_bounds_is_a_copy_failure() {
        let layout = standard_layout(Format::ARGB8888, 8, 8).unwrap();
        let src = vec![0u8; 256];
        let mut dst = vec![0u8; 128];
        assert!(matches!(
            copy_rect(Format::ARGB8888, &src, &layout, &mut dst, &layout, Rect::full(8, 8)),
            Err(HbmError::CopyFailed(_))
        ));
    }
}
