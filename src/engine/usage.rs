//! Usage flags and the format/usage resolver.
//!
//! A request's usage bitmask is decomposed once into an immutable [`Capabilities`] set plus the
//! residual bits the backend did not recognize. Nothing downstream inspects raw usage bits.

use crate::engine::format::Format;
use crate::error::{HbmError, HbmResult};
use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Intended uses of a buffer, as passed in by clients.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Usage: u64 {
        const SCANOUT = 1 << 0;
        const CURSOR = 1 << 1;
        const RENDERING = 1 << 2;
        const LINEAR = 1 << 3;
        const TEXTURE = 1 << 4;
        const SW_READ_OFTEN = 1 << 5;
        const SW_READ_RARELY = 1 << 6;
        const SW_WRITE_OFTEN = 1 << 7;
        const SW_WRITE_RARELY = 1 << 8;
        const PROTECTED = 1 << 9;
        const HW_VIDEO_ENCODER = 1 << 10;
        const CAMERA_WRITE = 1 << 11;
        const CAMERA_READ = 1 << 12;
        const HW_VIDEO_DECODER = 1 << 13;
        const TEST_ALLOC = 1 << 15;
        const FRONT_RENDERING = 1 << 16;
        const RENDERSCRIPT = 1 << 17;
        const GPU_DATA_BUFFER = 1 << 18;
        const SENSOR_DIRECT_DATA = 1 << 19;

        const SW_READ_MASK = Self::SW_READ_OFTEN.bits() | Self::SW_READ_RARELY.bits();
        const SW_WRITE_MASK = Self::SW_WRITE_OFTEN.bits() | Self::SW_WRITE_RARELY.bits();
        const SW_MASK = Self::SW_READ_MASK.bits() | Self::SW_WRITE_MASK.bits();
        const CAMERA_MASK = Self::CAMERA_READ.bits() | Self::CAMERA_WRITE.bits();
        const CODEC_MASK = Self::HW_VIDEO_ENCODER.bits() | Self::HW_VIDEO_DECODER.bits();
    }
}

impl Usage {
    /// Flags the kernel dma-heap backend knows how to satisfy.
    pub const KERNEL_HEAP_SUPPORTED: Self = Self::SW_MASK
        .union(Self::SCANOUT)
        .union(Self::CURSOR)
        .union(Self::TEXTURE)
        .union(Self::RENDERING)
        .union(Self::LINEAR)
        .union(Self::CAMERA_MASK)
        .union(Self::CODEC_MASK)
        .union(Self::GPU_DATA_BUFFER)
        .union(Self::SENSOR_DIRECT_DATA);

    /// Consumed by the engine itself regardless of backend.
    const ENGINE_CONSUMED: Self = Self::TEST_ALLOC;

    /// Short tag list used in buffer names, e.g. `"SRo|Tex"`.
    #[must_use]
    pub fn short_string(self) -> String {
        const TAGS: &[(Usage, &str)] = &[
            (Usage::SCANOUT, "Sc"),
            (Usage::CURSOR, "Cu"),
            (Usage::RENDERING, "Rd"),
            (Usage::LINEAR, "Li"),
            (Usage::TEXTURE, "Tex"),
            (Usage::SW_READ_OFTEN, "SRo"),
            (Usage::SW_READ_RARELY, "SRr"),
            (Usage::SW_WRITE_OFTEN, "SWo"),
            (Usage::SW_WRITE_RARELY, "SWr"),
            (Usage::PROTECTED, "Pr"),
            (Usage::HW_VIDEO_ENCODER, "Enc"),
            (Usage::CAMERA_WRITE, "CW"),
            (Usage::CAMERA_READ, "CR"),
            (Usage::HW_VIDEO_DECODER, "Dec"),
            (Usage::FRONT_RENDERING, "Fr"),
            (Usage::GPU_DATA_BUFFER, "GDB"),
            (Usage::SENSOR_DIRECT_DATA, "SDD"),
        ];
        TAGS.iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, tag)| *tag)
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// How often the CPU touches a buffer in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum CpuFrequency {
    #[default]
    Never,
    Rarely,
    Often,
}

impl CpuFrequency {
    const fn from_bits(usage: Usage, often: Usage, rarely: Usage) -> Self {
        if usage.intersects(often) {
            Self::Often
        } else if usage.intersects(rarely) {
            Self::Rarely
        } else {
            Self::Never
        }
    }

    #[must_use]
    pub const fn is_used(self) -> bool {
        !matches!(self, Self::Never)
    }
}

/// Which alignment rules a request falls under. Exactly one per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentClass {
    /// Display, camera or codec consumers: contiguous memory, hardware alignment rules.
    ScanoutClass,
    /// Everything else: plain page granularity.
    Generic,
}

/// Orthogonal capability predicates derived from a usage bitmask.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub needs_scanout: bool,
    pub needs_cursor: bool,
    pub needs_gpu_sample: bool,
    pub needs_gpu_color: bool,
    pub needs_gpu_data: bool,
    pub cpu_read: CpuFrequency,
    pub cpu_write: CpuFrequency,
    pub needs_protected: bool,
    pub needs_camera_io: bool,
    pub needs_codec_io: bool,
    pub needs_sensor_data: bool,
    pub needs_linear: bool,
    pub front_rendering: bool,
    pub test_only: bool,
}

impl Capabilities {
    /// Splits `usage` into capability predicates and the bits `supported` does not cover.
    ///
    /// Pure function: the input bits are never mutated, and the residual is checked exactly
    /// once by the caller.
    #[must_use]
    pub fn decompose(usage: u64, supported: Usage) -> (Self, u64) {
        let consumed = supported.union(Usage::ENGINE_CONSUMED).bits();
        let residual = usage & !consumed;
        let flags = Usage::from_bits_truncate(usage & consumed);

        let caps = Self {
            needs_scanout: flags.contains(Usage::SCANOUT),
            needs_cursor: flags.contains(Usage::CURSOR),
            needs_gpu_sample: flags.contains(Usage::TEXTURE),
            needs_gpu_color: flags.contains(Usage::RENDERING),
            needs_gpu_data: flags.contains(Usage::GPU_DATA_BUFFER),
            cpu_read: CpuFrequency::from_bits(flags, Usage::SW_READ_OFTEN, Usage::SW_READ_RARELY),
            cpu_write: CpuFrequency::from_bits(
                flags,
                Usage::SW_WRITE_OFTEN,
                Usage::SW_WRITE_RARELY,
            ),
            needs_protected: flags.contains(Usage::PROTECTED),
            needs_camera_io: flags.intersects(Usage::CAMERA_MASK),
            needs_codec_io: flags.intersects(Usage::CODEC_MASK),
            needs_sensor_data: flags.contains(Usage::SENSOR_DIRECT_DATA),
            needs_linear: flags.contains(Usage::LINEAR),
            front_rendering: flags.contains(Usage::FRONT_RENDERING),
            test_only: flags.contains(Usage::TEST_ALLOC),
        };

        (caps, residual)
    }

    /// Scanout or cursor: consumed by a display engine that cannot snoop CPU caches.
    #[must_use]
    pub const fn uses_overlay(&self) -> bool {
        self.needs_scanout || self.needs_cursor
    }

    #[must_use]
    pub const fn uses_gpu(&self) -> bool {
        self.needs_gpu_sample || self.needs_gpu_color || self.needs_gpu_data
    }

    /// Generic GPU buffer or raw sensor data: bytes without image semantics.
    #[must_use]
    pub const fn uses_blob(&self) -> bool {
        self.needs_gpu_data || self.needs_sensor_data
    }

    #[must_use]
    pub const fn uses_cpu(&self) -> bool {
        self.cpu_read.is_used() || self.cpu_write.is_used()
    }

    #[must_use]
    pub const fn uses_cpu_often(&self) -> bool {
        matches!(self.cpu_read, CpuFrequency::Often)
            || matches!(self.cpu_write, CpuFrequency::Often)
    }

    /// Consumers that need physically contiguous, device-local memory.
    #[must_use]
    pub const fn needs_contiguous(&self) -> bool {
        self.uses_overlay() || self.needs_camera_io || self.needs_codec_io
    }

    #[must_use]
    pub const fn alignment_class(&self) -> AlignmentClass {
        if self.needs_contiguous() {
            AlignmentClass::ScanoutClass
        } else {
            AlignmentClass::Generic
        }
    }

    /// Chooses between mapping the buffer directly and shuttling through a staging copy.
    ///
    /// - display consumers: map only for frequent writes with no readback, since uncached
    ///   device-local reads are slow;
    /// - GPU consumers: map only for frequent CPU access;
    /// - anything else: always map.
    #[must_use]
    pub const fn prefers_direct_map(&self) -> bool {
        if self.uses_overlay() {
            self.uses_cpu_often() && !self.cpu_read.is_used()
        } else if self.uses_gpu() {
            self.uses_cpu_often()
        } else {
            true
        }
    }
}

/// Output of [`resolve`]: the concrete format plus the capability predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub format: Format,
    pub usage: Usage,
    pub caps: Capabilities,
}

impl fmt::Display for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.format, self.usage.short_string())
    }
}

/// Normalizes a format request and decomposes its usage bits.
///
/// Substitutions:
/// - implementation-defined resolves to NV12 for camera consumers, otherwise XBGR8888;
/// - flexible YCbCr 4:2:0 resolves to NV12;
/// - BGR565 resolves to RGB565;
/// - R8 becomes an opaque byte buffer for generic GPU buffers and sensor data.
///
/// # Errors
/// `UnsupportedFormat` if the (substituted) format is not in the supported set,
/// `UnsupportedUsage` with the residual bits if `supported` leaves any usage unconsumed.
pub fn resolve(format: Format, usage: u64, supported: Usage) -> HbmResult<Resolved> {
    let (caps, residual) = Capabilities::decompose(usage, supported);

    let concrete = match format {
        Format::FLEX_IMPLEMENTATION_DEFINED if caps.needs_camera_io => Format::NV12,
        Format::FLEX_IMPLEMENTATION_DEFINED => Format::XBGR8888,
        Format::FLEX_YCBCR_420_888 => Format::NV12,
        Format::BGR565 => Format::RGB565,
        Format::R8 if caps.uses_blob() => Format::INVALID,
        other => other,
    };

    if !concrete.is_blob() && !concrete.is_supported() {
        return Err(HbmError::UnsupportedFormat(format));
    }
    if concrete.is_blob() && format != Format::R8 {
        return Err(HbmError::UnsupportedFormat(format));
    }

    if residual != 0 {
        return Err(HbmError::UnsupportedUsage(residual));
    }

    Ok(Resolved {
        format: concrete,
        usage: Usage::from_bits_truncate(usage),
        caps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: Usage = Usage::KERNEL_HEAP_SUPPORTED;

    #[test]
    fn implementation_defined_depends_on_camera() {
        let r = resolve(
            Format::FLEX_IMPLEMENTATION_DEFINED,
            Usage::CAMERA_WRITE.bits(),
            ALL,
        )
        .unwrap();
        assert_eq!(r.format, Format::NV12);

        let r = resolve(Format::FLEX_IMPLEMENTATION_DEFINED, Usage::TEXTURE.bits(), ALL).unwrap();
        assert_eq!(r.format, Format::XBGR8888);
    }

    #[test]
    fn flexible_and_legacy_formats() {
        let r = resolve(Format::FLEX_YCBCR_420_888, Usage::TEXTURE.bits(), ALL).unwrap();
        assert_eq!(r.format, Format::NV12);
        let r = resolve(Format::BGR565, Usage::RENDERING.bits(), ALL).unwrap();
        assert_eq!(r.format, Format::RGB565);
    }

    #[test]
    fn r8_becomes_blob_only_for_buffer_consumers() {
        let r = resolve(Format::R8, Usage::GPU_DATA_BUFFER.bits(), ALL).unwrap();
        assert!(r.format.is_blob());
        let r = resolve(Format::R8, Usage::SENSOR_DIRECT_DATA.bits(), ALL).unwrap();
        assert!(r.format.is_blob());
        let r = resolve(Format::R8, Usage::TEXTURE.bits(), ALL).unwrap();
        assert_eq!(r.format, Format::R8);
    }

    #[test]
    fn unknown_bits_are_residual() {
        let bogus = 1u64 << 40;
        let err = resolve(Format::ARGB8888, Usage::TEXTURE.bits() | bogus, ALL).unwrap_err();
        assert!(matches!(err, HbmError::UnsupportedUsage(r) if r == bogus));
    }

    #[test]
    fn backend_matrix_limits_usage() {
        let err = resolve(Format::ARGB8888, Usage::PROTECTED.bits(), ALL).unwrap_err();
        assert!(matches!(err, HbmError::UnsupportedUsage(r) if r == Usage::PROTECTED.bits()));
    }

    #[test]
    fn test_alloc_is_always_consumed() {
        let r = resolve(
            Format::ARGB8888,
            (Usage::TEST_ALLOC | Usage::TEXTURE).bits(),
            Usage::TEXTURE,
        )
        .unwrap();
        assert!(r.caps.test_only);
    }

    #[test]
    fn unsupported_formats() {
        assert!(matches!(
            resolve(Format(0x1234_5678), Usage::TEXTURE.bits(), ALL),
            Err(HbmError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            resolve(Format::INVALID, Usage::GPU_DATA_BUFFER.bits(), ALL),
            Err(HbmError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn direct_map_preference() {
        let caps = |u: Usage| Capabilities::decompose(u.bits(), ALL).0;

        assert!(caps(Usage::SW_READ_RARELY).prefers_direct_map());
        assert!(caps(Usage::TEXTURE | Usage::SW_WRITE_OFTEN).prefers_direct_map());
        assert!(!caps(Usage::TEXTURE | Usage::SW_WRITE_RARELY).prefers_direct_map());
        assert!(caps(Usage::SCANOUT | Usage::SW_WRITE_OFTEN).prefers_direct_map());
        assert!(
            !caps(Usage::SCANOUT | Usage::SW_WRITE_OFTEN | Usage::SW_READ_RARELY)
                .prefers_direct_map()
        );
        assert!(!caps(Usage::SCANOUT | Usage::SW_WRITE_RARELY).prefers_direct_map());
    }

    #[test]
    fn alignment_class_is_exclusive() {
        let (c, _) = Capabilities::decompose(Usage::CAMERA_WRITE.bits(), ALL);
        assert_eq!(c.alignment_class(), AlignmentClass::ScanoutClass);
        let (c, _) = Capabilities::decompose(Usage::TEXTURE.bits(), ALL);
        assert_eq!(c.alignment_class(), AlignmentClass::Generic);
    }

    #[test]
    fn short_string() {
        assert_eq!((Usage::TEXTURE | Usage::SW_READ_OFTEN).short_string(), "Tex|SRo");
    }
}
