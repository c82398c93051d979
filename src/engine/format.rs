//! Pixel formats (DRM fourcc codes), format modifiers, and the planar layout table.

use crate::error::{HbmError, HbmResult};
use crate::utils::{checked_mul, div_round_up};
use std::fmt;

/// Upper bound on planes per buffer.
pub const MAX_PLANES: usize = 4;

const fn fourcc(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) | ((b as u32) << 8) | ((c as u32) << 16) | ((d as u32) << 24)
}

/// A DRM fourcc pixel format code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Format(pub u32);

impl Format {
    /// Opaque byte buffer with no image semantics.
    pub const INVALID: Self = Self(0);

    pub const ARGB8888: Self = Self(fourcc(b'A', b'R', b'2', b'4'));
    pub const XRGB8888: Self = Self(fourcc(b'X', b'R', b'2', b'4'));
    pub const ABGR8888: Self = Self(fourcc(b'A', b'B', b'2', b'4'));
    pub const XBGR8888: Self = Self(fourcc(b'X', b'B', b'2', b'4'));
    pub const RGB565: Self = Self(fourcc(b'R', b'G', b'1', b'6'));
    pub const BGR565: Self = Self(fourcc(b'B', b'G', b'1', b'6'));
    pub const BGR888: Self = Self(fourcc(b'B', b'G', b'2', b'4'));
    pub const R8: Self = Self(fourcc(b'R', b'8', b' ', b' '));
    pub const NV12: Self = Self(fourcc(b'N', b'V', b'1', b'2'));
    pub const YVU420: Self = Self(fourcc(b'Y', b'V', b'1', b'2'));
    /// YV12 with the Android stride rules (luma 32-byte, chroma 16-byte aligned).
    pub const YVU420_ANDROID: Self = Self(fourcc(b'9', b'9', b'9', b'7'));

    /// Flexible "let the allocator decide" format.
    pub const FLEX_IMPLEMENTATION_DEFINED: Self = Self(fourcc(b'9', b'9', b'9', b'8'));
    /// Flexible YUV 4:2:0 format, resolved to a concrete semi-planar layout.
    pub const FLEX_YCBCR_420_888: Self = Self(fourcc(b'9', b'9', b'9', b'9'));

    #[must_use]
    pub const fn is_blob(self) -> bool {
        self.0 == Self::INVALID.0
    }

    /// Concrete formats this engine can lay out and allocate.
    #[must_use]
    pub fn is_supported(self) -> bool {
        SUPPORTED_FORMATS.contains(&self)
    }

    /// Number of memory planes the format occupies with a linear layout.
    #[must_use]
    pub fn num_planes(self) -> usize {
        planar_layout(self).map_or(0, |l| l.num_planes)
    }

    /// Four printable characters for logs and buffer names.
    #[must_use]
    pub fn fourcc_string(self) -> String {
        if self.is_blob() {
            return "BLOB".to_string();
        }
        self.0
            .to_le_bytes()
            .iter()
            .map(|&b| {
                let c = char::from(b & 0x7f);
                if c.is_ascii_graphic() || c == ' ' { c } else { '?' }
            })
            .collect()
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fourcc_string())
    }
}

impl fmt::Debug for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Format({} / {:#010x})", self.fourcc_string(), self.0)
    }
}

/// Formats accepted after resolution.
pub const SUPPORTED_FORMATS: &[Format] = &[
    Format::ARGB8888,
    Format::XRGB8888,
    Format::ABGR8888,
    Format::XBGR8888,
    Format::RGB565,
    Format::BGR888,
    Format::NV12,
    Format::YVU420,
    Format::YVU420_ANDROID,
    Format::R8,
];

// ===============================================================================================
// Modifiers
// ===============================================================================================

/// An opaque tiling/compression tag (DRM format modifier).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Modifier(pub u64);

impl Modifier {
    pub const LINEAR: Self = Self(0);
    /// "No explicit modifier": the layout is implied by the driver.
    pub const INVALID: Self = Self(0x00ff_ffff_ffff_ffff);

    #[must_use]
    pub const fn is_linear(self) -> bool {
        self.0 == Self::LINEAR.0
    }

    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.0 == Self::INVALID.0
    }
}

impl Default for Modifier {
    fn default() -> Self {
        Self::INVALID
    }
}

// ===============================================================================================
// Planar Layout Table
// ===============================================================================================

#[derive(Debug)]
pub struct PlanarLayout {
    pub num_planes: usize,
    pub horizontal_subsampling: [u32; 3],
    pub vertical_subsampling: [u32; 3],
    pub bytes_per_pixel: [u32; 3],
}

static PACKED_1BPP: PlanarLayout = PlanarLayout {
    num_planes: 1,
    horizontal_subsampling: [1, 0, 0],
    vertical_subsampling: [1, 0, 0],
    bytes_per_pixel: [1, 0, 0],
};

static PACKED_2BPP: PlanarLayout = PlanarLayout {
    num_planes: 1,
    horizontal_subsampling: [1, 0, 0],
    vertical_subsampling: [1, 0, 0],
    bytes_per_pixel: [2, 0, 0],
};

static PACKED_3BPP: PlanarLayout = PlanarLayout {
    num_planes: 1,
    horizontal_subsampling: [1, 0, 0],
    vertical_subsampling: [1, 0, 0],
    bytes_per_pixel: [3, 0, 0],
};

static PACKED_4BPP: PlanarLayout = PlanarLayout {
    num_planes: 1,
    horizontal_subsampling: [1, 0, 0],
    vertical_subsampling: [1, 0, 0],
    bytes_per_pixel: [4, 0, 0],
};

static BIPLANAR_YUV420: PlanarLayout = PlanarLayout {
    num_planes: 2,
    horizontal_subsampling: [1, 2, 0],
    vertical_subsampling: [1, 2, 0],
    bytes_per_pixel: [1, 2, 0],
};

static TRIPLANAR_YUV420: PlanarLayout = PlanarLayout {
    num_planes: 3,
    horizontal_subsampling: [1, 2, 2],
    vertical_subsampling: [1, 2, 2],
    bytes_per_pixel: [1, 1, 1],
};

/// Looks up the linear planar layout of a concrete format. Flexible formats have none.
#[must_use]
pub fn planar_layout(format: Format) -> Option<&'static PlanarLayout> {
    let layout = match format {
        Format::INVALID | Format::R8 => &PACKED_1BPP,
        Format::RGB565 | Format::BGR565 => &PACKED_2BPP,
        Format::BGR888 => &PACKED_3BPP,
        Format::ARGB8888 | Format::XRGB8888 | Format::ABGR8888 | Format::XBGR8888 => &PACKED_4BPP,
        Format::NV12 => &BIPLANAR_YUV420,
        Format::YVU420 | Format::YVU420_ANDROID => &TRIPLANAR_YUV420,
        _ => return None,
    };
    Some(layout)
}

fn plane_info(format: Format, plane: usize) -> HbmResult<(&'static PlanarLayout, usize)> {
    let layout = planar_layout(format).ok_or(HbmError::UnsupportedFormat(format))?;
    if plane >= layout.num_planes {
        return Err(HbmError::InvalidParam(format!(
            "plane {plane} out of range for {format}"
        )));
    }
    Ok((layout, plane))
}

/// Bytes per pixel of `plane` (a subsampled chroma pair counts as one pixel).
///
/// # Errors
/// `UnsupportedFormat` for formats without a layout, `InvalidParam` for a bad plane index.
pub fn bytes_per_pixel(format: Format, plane: usize) -> HbmResult<u32> {
    let (layout, plane) = plane_info(format, plane)?;
    Ok(layout.bytes_per_pixel[plane])
}

/// Horizontal and vertical subsampling factors of `plane`.
///
/// # Errors
/// Same as [`bytes_per_pixel`].
pub fn subsampling(format: Format, plane: usize) -> HbmResult<(u32, u32)> {
    let (layout, plane) = plane_info(format, plane)?;
    Ok((
        layout.horizontal_subsampling[plane],
        layout.vertical_subsampling[plane],
    ))
}

/// Minimum linear stride of `plane` for an image `width` pixels wide.
///
/// # Errors
/// Same as [`bytes_per_pixel`], plus `LayoutOverflow`.
pub fn stride_from_format(format: Format, width: u32, plane: usize) -> HbmResult<u64> {
    let (layout, plane) = plane_info(format, plane)?;
    let plane_width = div_round_up(
        u64::from(width),
        u64::from(layout.horizontal_subsampling[plane]),
    );
    let stride = checked_mul(plane_width, u64::from(layout.bytes_per_pixel[plane]))?;

    if format == Format::YVU420_ANDROID {
        let align = if plane == 0 { 32 } else { 16 };
        return crate::utils::align_up(stride, align);
    }
    Ok(stride)
}

/// Number of rows of `plane` for an image `height` pixels tall.
///
/// # Errors
/// Same as [`bytes_per_pixel`].
pub fn height_from_format(format: Format, height: u32, plane: usize) -> HbmResult<u64> {
    let (layout, plane) = plane_info(format, plane)?;
    Ok(div_round_up(
        u64::from(height),
        u64::from(layout.vertical_subsampling[plane]),
    ))
}

/// Bytes occupied by `plane` given its stride.
///
/// # Errors
/// Same as [`bytes_per_pixel`], plus `LayoutOverflow`.
pub fn size_from_format(format: Format, stride: u64, height: u32, plane: usize) -> HbmResult<u64> {
    checked_mul(stride, height_from_format(format, height, plane)?)
}

/// Derives the stride of a chroma plane from the (possibly padded) luma stride.
///
/// Fully planar YUV halves the luma stride; every other format keeps the per-plane bytes per
/// pixel in step with the subsampling, so the luma stride carries over unchanged.
#[must_use]
pub fn subsample_stride(stride: u64, format: Format, plane: usize) -> u64 {
    if plane != 0 && matches!(format, Format::YVU420 | Format::YVU420_ANDROID) {
        return div_round_up(stride, 2);
    }
    stride
}
