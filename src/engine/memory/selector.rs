//! Memory-type ranking and the direct-map/staging decision.

use super::{MemoryType, MemoryTypeFlags};
use crate::engine::usage::Capabilities;
use crate::error::{HbmError, HbmResult};

/// Outcome of [`select`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPlan {
    pub memory_type: MemoryType,
    /// CPU access goes through a separate linear scratch buffer.
    pub use_staging: bool,
}

/// Flag constraints a candidate is ranked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct FlagPolicy {
    required: MemoryTypeFlags,
    disallowed: MemoryTypeFlags,
    preferred: MemoryTypeFlags,
}

impl FlagPolicy {
    fn satisfied_by(&self, flags: MemoryTypeFlags) -> bool {
        flags.contains(self.required) && !flags.intersects(self.disallowed)
    }

    /// First candidate carrying the preferred flag, else the first admissible one.
    fn pick<'a>(&self, candidates: &'a [MemoryType]) -> Option<&'a MemoryType> {
        let mut admissible = candidates.iter().filter(|mt| self.satisfied_by(mt.flags));
        let first = admissible.clone().next()?;
        if self.preferred.is_empty() {
            return Some(first);
        }
        Some(
            admissible
                .find(|mt| mt.flags.contains(self.preferred))
                .unwrap_or(first),
        )
    }

    fn prefer(mut self, flag: MemoryTypeFlags) -> Self {
        // A preference that can never be met is no preference.
        self.preferred = if self.disallowed.intersects(flag) {
            MemoryTypeFlags::empty()
        } else {
            flag
        };
        self
    }
}

/// Hard constraints from the consumers alone, before CPU access is considered.
fn device_policy(caps: &Capabilities) -> FlagPolicy {
    let mut policy = FlagPolicy::default();

    if caps.uses_overlay() {
        // Display engines cannot snoop CPU caches.
        policy.required |= MemoryTypeFlags::LOCAL;
        policy.disallowed |= MemoryTypeFlags::CACHED;
    }
    if caps.needs_camera_io || caps.needs_codec_io {
        policy.required |= MemoryTypeFlags::LOCAL;
    }

    policy
}

/// Picks the memory type for a buffer and decides whether CPU access needs staging.
///
/// `candidates` are the backend's memory types in its preference order; `linear` says whether
/// the buffer's layout can be exposed to the CPU as-is.
///
/// 1. Display consumers require `LOCAL` and forbid `CACHED`; camera and codec consumers
///    require `LOCAL`.
/// 2. Without CPU access the most device-local type wins and no staging is used.
/// 3. With CPU access, a linear buffer whose usage prefers direct mapping takes a `MAPPABLE`
///    type (preferably `CACHED`). If no such type is admissible, or direct mapping is not
///    preferred, the buffer takes the most device-local type and CPU access is staged.
///
/// # Errors
/// `NoSuitableMemoryType` if no candidate satisfies the hard constraints.
pub fn select(
    caps: &Capabilities,
    candidates: &[MemoryType],
    linear: bool,
) -> HbmResult<MemoryPlan> {
    let base = device_policy(caps);

    if caps.uses_cpu() && linear && caps.prefers_direct_map() {
        let mut direct = base.prefer(MemoryTypeFlags::CACHED);
        direct.required |= MemoryTypeFlags::MAPPABLE;
        if let Some(mt) = direct.pick(candidates) {
            return Ok(MemoryPlan {
                memory_type: mt.clone(),
                use_staging: false,
            });
        }
        log::debug!("no mappable memory type admissible, falling back to staging");
    }

    let local = base.prefer(MemoryTypeFlags::LOCAL);
    let memory_type = local.pick(candidates).ok_or(HbmError::NoSuitableMemoryType)?;

    Ok(MemoryPlan {
        memory_type: memory_type.clone(),
        use_staging: caps.uses_cpu(),
    })
}

/// Picks the memory type staging buffers are allocated from: CPU-mappable and coherent,
/// preferably cached.
///
/// # Errors
/// `NoSuitableMemoryType` if the provider offers no mappable coherent type.
pub fn pick_staging_memory_type(candidates: &[MemoryType]) -> HbmResult<MemoryType> {
    let policy = FlagPolicy {
        required: MemoryTypeFlags::MAPPABLE | MemoryTypeFlags::COHERENT,
        ..FlagPolicy::default()
    }
    .prefer(MemoryTypeFlags::CACHED);

    policy
        .pick(candidates)
        .cloned()
        .ok_or(HbmError::NoSuitableMemoryType)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryDomain;
    use crate::engine::usage::{Capabilities, Usage};

    fn mt(id: u32, flags: MemoryTypeFlags) -> MemoryType {
        MemoryType::new(id, format!("mt{id}"), flags, MemoryDomain::Heap)
    }

    fn caps(usage: Usage) -> Capabilities {
        Capabilities::decompose(usage.bits(), Usage::all()).0
    }

    /// The kernel heap set: system, system-uncached, cma.
    fn heaps() -> Vec<MemoryType> {
        vec![
            mt(0, MemoryTypeFlags::CACHED | MemoryTypeFlags::MAPPABLE),
            mt(1, MemoryTypeFlags::COHERENT | MemoryTypeFlags::MAPPABLE),
            mt(
                2,
                MemoryTypeFlags::LOCAL | MemoryTypeFlags::COHERENT | MemoryTypeFlags::MAPPABLE,
            ),
        ]
    }

    /// A discrete GPU: fast unmappable VRAM and cached host memory.
    fn discrete() -> Vec<MemoryType> {
        vec![
            mt(0, MemoryTypeFlags::LOCAL),
            mt(1, MemoryTypeFlags::CACHED | MemoryTypeFlags::COHERENT | MemoryTypeFlags::MAPPABLE),
        ]
    }

    #[test]
    fn gpu_only_prefers_local_without_staging() {
        let plan = select(&caps(Usage::TEXTURE), &discrete(), true).unwrap();
        assert_eq!(plan.memory_type.id, 0);
        assert!(!plan.use_staging);
    }

    #[test]
    fn overlay_requires_local_uncached() {
        let plan = select(&caps(Usage::SCANOUT), &heaps(), true).unwrap();
        assert_eq!(plan.memory_type.id, 2);

        let only_cached = vec![mt(0, MemoryTypeFlags::LOCAL | MemoryTypeFlags::CACHED)];
        assert!(matches!(
            select(&caps(Usage::SCANOUT), &only_cached, true),
            Err(HbmError::NoSuitableMemoryType)
        ));
    }

    #[test]
    fn camera_is_forced_local() {
        let plan = select(&caps(Usage::CAMERA_WRITE), &heaps(), true).unwrap();
        assert!(plan.memory_type.flags.contains(MemoryTypeFlags::LOCAL));
    }

    #[test]
    fn frequent_cpu_gpu_maps_directly_when_mappable_exists() {
        let usage = Usage::SW_WRITE_OFTEN | Usage::TEXTURE;
        let plan = select(&caps(usage), &discrete(), true).unwrap();
        assert_eq!(plan.memory_type.id, 1);
        assert!(!plan.use_staging);
    }

    #[test]
    fn frequent_cpu_gpu_stages_without_mappable() {
        let usage = Usage::SW_WRITE_OFTEN | Usage::TEXTURE;
        let only_vram = vec![mt(0, MemoryTypeFlags::LOCAL)];
        let plan = select(&caps(usage), &only_vram, true).unwrap();
        assert_eq!(plan.memory_type.id, 0);
        assert!(plan.use_staging);
    }

    #[test]
    fn tiled_layouts_always_stage() {
        let usage = Usage::SW_WRITE_OFTEN | Usage::TEXTURE;
        let plan = select(&caps(usage), &discrete(), false).unwrap();
        assert_eq!(plan.memory_type.id, 0);
        assert!(plan.use_staging);
    }

    #[test]
    fn occasional_cpu_gpu_prefers_staging() {
        let usage = Usage::SW_READ_RARELY | Usage::TEXTURE;
        let plan = select(&caps(usage), &discrete(), true).unwrap();
        assert_eq!(plan.memory_type.id, 0);
        assert!(plan.use_staging);
    }

    #[test]
    fn cpu_only_maps_cached() {
        let plan = select(&caps(Usage::SW_READ_RARELY), &heaps(), true).unwrap();
        assert_eq!(plan.memory_type.id, 0);
        assert!(!plan.use_staging);
    }

    // Two overlay variants existed for CPU-accessed scanout buffers: one maps directly for
    // frequent writes only when nothing reads back, the other for any frequent access. The
    // unified policy keeps the stricter one.
    #[test]
    fn overlay_write_often_maps_directly() {
        let usage = Usage::SCANOUT | Usage::SW_WRITE_OFTEN;
        let plan = select(&caps(usage), &heaps(), true).unwrap();
        assert_eq!(plan.memory_type.id, 2);
        assert!(!plan.use_staging);
    }

    #[test]
    fn overlay_with_readback_stages() {
        let usage = Usage::SCANOUT | Usage::SW_READ_OFTEN | Usage::SW_WRITE_OFTEN;
        let plan = select(&caps(usage), &heaps(), true).unwrap();
        assert_eq!(plan.memory_type.id, 2);
        assert!(plan.use_staging);
    }

    #[test]
    fn staging_type_prefers_cached_coherent() {
        assert_eq!(pick_staging_memory_type(&discrete()).unwrap().id, 1);
        assert_eq!(pick_staging_memory_type(&heaps()).unwrap().id, 1);
        assert!(pick_staging_memory_type(&[mt(0, MemoryTypeFlags::LOCAL)]).is_err());
    }
}
