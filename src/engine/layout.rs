//! Plane layout computation.

use crate::engine::format::{self, Format, MAX_PLANES, Modifier};
use crate::engine::usage::Capabilities;
use crate::error::{HbmError, HbmResult};
use crate::utils::{align_up, checked_add, checked_mul};

/// Page granularity most kernel heaps allocate in.
pub const DEFAULT_SIZE_GRANULARITY: u64 = 4096;

/// Row alignment required by camera and video codec hardware.
const HW_STRIDE_ALIGNMENT: u64 = 32;

/// One contiguous sub-region of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Plane {
    pub stride: u64,
    pub offset: u64,
    pub size: u64,
}

/// Per-plane placement plus the logical byte length of the allocation.
///
/// Invariants: at most [`MAX_PLANES`] planes; offsets strictly increase after plane 0;
/// `size[i] = offset[i + 1] - offset[i]` and the last plane runs to `total_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneLayout {
    pub modifier: Modifier,
    pub planes: Vec<Plane>,
    pub total_size: u64,
}

impl PlaneLayout {
    /// A single-plane byte buffer of `size` bytes.
    #[must_use]
    pub fn opaque(size: u64) -> Self {
        Self {
            modifier: Modifier::LINEAR,
            planes: vec![Plane {
                stride: size,
                offset: 0,
                size,
            }],
            total_size: size,
        }
    }

    /// Builds a layout from caller-supplied stride/offset metadata.
    ///
    /// # Errors
    /// `InvalidParam` if there are no planes, too many planes, offsets are not increasing, or
    /// an offset lies beyond `total_size`.
    pub fn from_metadata(
        strides: &[u64],
        offsets: &[u64],
        total_size: u64,
        modifier: Modifier,
    ) -> HbmResult<Self> {
        if strides.is_empty() || strides.len() != offsets.len() {
            return Err(HbmError::InvalidParam(format!(
                "{} strides for {} offsets",
                strides.len(),
                offsets.len()
            )));
        }
        if strides.len() > MAX_PLANES {
            return Err(HbmError::InvalidParam(format!(
                "{} planes exceed the limit of {MAX_PLANES}",
                strides.len()
            )));
        }
        if offsets.windows(2).any(|w| w[1] <= w[0]) {
            return Err(HbmError::InvalidParam(
                "plane offsets must be strictly increasing".to_string(),
            ));
        }
        if offsets.iter().any(|&o| o >= total_size) {
            return Err(HbmError::InvalidParam(format!(
                "plane offset beyond buffer size {total_size}"
            )));
        }

        let planes = strides
            .iter()
            .zip(offsets)
            .enumerate()
            .map(|(i, (&stride, &offset))| {
                let next = offsets.get(i + 1).copied().unwrap_or(total_size);
                Plane {
                    stride,
                    offset,
                    size: next - offset,
                }
            })
            .collect();

        Ok(Self {
            modifier,
            planes,
            total_size,
        })
    }

    #[must_use]
    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    #[must_use]
    pub fn plane_sizes_sum(&self) -> u64 {
        self.planes.iter().map(|p| p.size).sum()
    }
}

/// Device-specific alignment constraints fed into [`compute_layout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutHints {
    /// Row pitch alignment of plane 0, in bytes.
    pub stride_alignment: u64,
    /// Granularity the total size is rounded up to.
    pub size_alignment: u64,
    /// Minimum total size demanded by a consumer's fixed frame formula.
    pub min_frame_size: Option<u64>,
}

impl Default for LayoutHints {
    fn default() -> Self {
        Self::standard()
    }
}

impl LayoutHints {
    /// No device constraints at all: tightly packed planes, no size padding.
    #[must_use]
    pub const fn standard() -> Self {
        Self {
            stride_alignment: 1,
            size_alignment: 1,
            min_frame_size: None,
        }
    }

    /// Derives the constraints of the consumers named in `caps` on top of the backend's base
    /// alignment. When several consumers apply, the most restrictive value wins.
    ///
    /// # Errors
    /// `LayoutOverflow` if the codec frame formula overflows.
    pub fn for_capabilities(
        caps: &Capabilities,
        base_stride_alignment: u64,
        granularity: u64,
        width: u32,
        height: u32,
    ) -> HbmResult<Self> {
        let mut hints = Self {
            stride_alignment: base_stride_alignment.max(1),
            size_alignment: granularity.max(1),
            min_frame_size: None,
        };

        if caps.needs_camera_io {
            hints.stride_alignment = hints.stride_alignment.max(HW_STRIDE_ALIGNMENT);
            if height > 1 {
                // ISP output buffers are sized for a 32x16-aligned 4:2:0 frame.
                let w = align_up(u64::from(width), 32)?;
                let h = align_up(u64::from(height), 16)?;
                hints.min_frame_size = Some(checked_mul(checked_mul(w, h)?, 3)? / 2);
            }
        }

        if caps.needs_codec_io {
            hints.stride_alignment = hints.stride_alignment.max(HW_STRIDE_ALIGNMENT);
            hints.size_alignment = hints.size_alignment.max(DEFAULT_SIZE_GRANULARITY);
        }

        Ok(hints)
    }
}

/// Computes the linear layout of a `width` x `height` buffer of `format`.
///
/// Opaque byte buffers ([`Format::INVALID`]) degrade to one plane of `width * height` bytes.
///
/// # Errors
/// `InvalidParam` for zero dimensions, `UnsupportedFormat` for formats without a layout, and
/// `LayoutOverflow` when dimensions are too large to represent.
pub fn compute_layout(
    format: Format,
    width: u32,
    height: u32,
    hints: &LayoutHints,
) -> HbmResult<PlaneLayout> {
    if width == 0 || height == 0 {
        return Err(HbmError::InvalidParam(format!(
            "zero-sized buffer {width}x{height}"
        )));
    }

    let (mut planes, packed_size) = if format.is_blob() {
        let size = checked_mul(u64::from(width), u64::from(height))?;
        (
            vec![Plane {
                stride: size,
                offset: 0,
                size,
            }],
            size,
        )
    } else {
        let num_planes = format.num_planes();
        if num_planes == 0 {
            return Err(HbmError::UnsupportedFormat(format));
        }

        let base_stride = format::stride_from_format(format, width, 0)?;
        let stride0 = align_up(base_stride, hints.stride_alignment)?;

        let mut planes = Vec::with_capacity(num_planes);
        let mut offset = 0u64;
        for plane in 0..num_planes {
            let stride = format::subsample_stride(stride0, format, plane);
            let size = format::size_from_format(format, stride, height, plane)?;
            planes.push(Plane {
                stride,
                offset,
                size,
            });
            offset = checked_add(offset, size)?;
        }
        (planes, offset)
    };

    let wanted = packed_size.max(hints.min_frame_size.unwrap_or(0));
    let total_size = align_up(wanted, hints.size_alignment)?;

    // The last plane absorbs the tail padding.
    if let Some(last) = planes.last_mut() {
        last.size = total_size - last.offset;
    }

    Ok(PlaneLayout {
        modifier: Modifier::LINEAR,
        planes,
        total_size,
    })
}

/// The layout a CPU-side scratch copy of the buffer uses: linear, tightly packed, independent of
/// any device alignment or tiling of the real buffer.
///
/// # Errors
/// Same as [`compute_layout`].
pub fn standard_layout(format: Format, width: u32, height: u32) -> HbmResult<PlaneLayout> {
    compute_layout(format, width, height, &LayoutHints::standard())
}
