//! CPU access to buffers: fence waits, staging transfers, and cache-maintenance brackets.
//!
//! A buffer is `Idle`, `MappedStaging`, or `MappedDirect`. Mapping waits on the buffer's
//! implicit fence, then either maps the memory itself (bracketed by start/end-of-access) or
//! hands out a linear staging copy that is written back on flush and unmap. Staging transfers
//! run on the CPU only for mappable memory; vendor images and device memory are copied by
//! their driver.

use crate::engine::bo::BufferObject;
use crate::engine::layout::PlaneLayout;
use crate::engine::memory::DeviceCopy;
use crate::engine::staging::{Rect, StagingBuffer, copy_rect};
use crate::engine::vendor::{CopyDirection, VendorDriver, VendorMapping};
use crate::error::{HbmError, HbmResult};
use crate::kernel::dmabuf::{Access, CpuMapping};
use std::fmt;
use std::mem;
use std::os::fd::AsFd;
use std::ptr::NonNull;
use std::sync::Arc;

/// Observable mapping state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    Idle,
    MappedStaging,
    MappedDirect,
}

/// A vendor image mapping, unmapped on drop.
pub(crate) struct VendorView {
    vendor: Arc<dyn VendorDriver>,
    image: u64,
    mapping: VendorMapping,
}

impl Drop for VendorView {
    fn drop(&mut self) {
        self.vendor.unmap_image(self.image);
    }
}

pub(crate) enum DirectView {
    Cpu(CpuMapping),
    Vendor(VendorView),
}

impl DirectView {
    fn as_ptr(&self) -> *mut u8 {
        match self {
            Self::Cpu(m) => m.as_ptr(),
            Self::Vendor(v) => v.mapping.ptr.as_ptr(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Cpu(m) => m.as_slice(),
            Self::Vendor(v) => unsafe {
                std::slice::from_raw_parts(v.mapping.ptr.as_ptr(), v.mapping.len)
            },
        }
    }

    fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match self {
            Self::Cpu(m) => m.as_mut_slice(),
            Self::Vendor(v) => Some(unsafe {
                std::slice::from_raw_parts_mut(v.mapping.ptr.as_ptr(), v.mapping.len)
            }),
        }
    }
}

pub(crate) enum MapState {
    Idle,
    MappedStaging {
        staging: StagingBuffer,
        access: Access,
    },
    MappedDirect {
        view: DirectView,
        access: Access,
    },
}

impl MapState {
    const fn mode(&self) -> MapMode {
        match self {
            Self::Idle => MapMode::Idle,
            Self::MappedStaging { .. } => MapMode::MappedStaging,
            Self::MappedDirect { .. } => MapMode::MappedDirect,
        }
    }
}

impl fmt::Debug for MapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.mode(), f)
    }
}

impl BufferObject {
    #[must_use]
    pub const fn map_mode(&self) -> MapMode {
        self.state.mode()
    }

    /// Maps the buffer for CPU access and returns the start of the mapped bytes.
    ///
    /// Blocks until the implicit fence allows `access`. Staged buffers hand out a linear copy,
    /// pre-filled from the buffer when `access` includes reads. The returned memory is laid out
    /// as [`mapped_layout`](Self::mapped_layout) says.
    ///
    /// # Errors
    /// `AlreadyMapped` if a mapping is active, `SyncWaitFailed` if the fence wait fails,
    /// `CopyFailed` if the staging pre-fill fails, or the provider's allocation/map error.
    pub fn map(&mut self, access: Access) -> HbmResult<NonNull<u8>> {
        if !matches!(self.state, MapState::Idle) {
            return Err(HbmError::AlreadyMapped);
        }
        if access.is_empty() {
            return Err(HbmError::InvalidParam("empty map access".to_string()));
        }

        self.wait_fence(access)?;

        if let Some(plan) = &self.staging {
            let mut staging = match self.kept_staging.take() {
                Some(staging) => staging,
                None => StagingBuffer::new(self.provider.clone(), plan)?,
            };
            staging.map()?;

            if access.contains(Access::READ)
                && let Err(e) = self.copy_to_staging(&mut staging)
            {
                self.retire_staging(staging);
                return Err(e);
            }

            let ptr = NonNull::new(staging.map()?.as_ptr())
                .ok_or_else(|| HbmError::CopyFailed("null staging mapping".to_string()))?;
            self.state = MapState::MappedStaging { staging, access };
            return Ok(ptr);
        }

        if self.backing.vendor_image().is_none() && !self.backing.memory_type().is_mappable() {
            return Err(HbmError::InvalidParam(format!(
                "{} is not CPU-mappable and the buffer has no staging",
                self.backing.memory_type()
            )));
        }

        let fd = self.backing.fd();
        if let Err(e) = self.provider.sync_start(fd, access) {
            log::warn!("start of CPU access failed: {e}");
        }

        let view = match self.backing.vendor_image() {
            Some((vendor, image)) => vendor.map_image(image, access).map(|mapping| {
                DirectView::Vendor(VendorView {
                    vendor: vendor.clone(),
                    image,
                    mapping,
                })
            }),
            None => usize::try_from(self.layout.total_size)
                .map_err(|_| HbmError::LayoutOverflow)
                .and_then(|len| self.provider.map(fd, len, access))
                .map(DirectView::Cpu),
        };
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                if let Err(end) = self.provider.sync_end(fd, access) {
                    log::warn!("end of CPU access failed: {end}");
                }
                return Err(e);
            }
        };

        let ptr = NonNull::new(view.as_ptr())
            .ok_or_else(|| HbmError::InvalidParam("null buffer mapping".to_string()))?;
        self.state = MapState::MappedDirect { view, access };
        Ok(ptr)
    }

    /// Ends CPU access. Staged writes are copied back, then the end-of-access barrier runs even
    /// if the copy failed.
    ///
    /// # Errors
    /// `NotMapped` when idle, `CopyFailed` if writing the staging copy back fails, or the
    /// barrier's error for direct mappings. The buffer is idle afterwards in every case.
    pub fn unmap(&mut self) -> HbmResult<()> {
        match mem::replace(&mut self.state, MapState::Idle) {
            MapState::Idle => Err(HbmError::NotMapped),
            MapState::MappedStaging { staging, access } => {
                let result = if access.contains(Access::WRITE) {
                    self.copy_from_staging(&staging)
                } else {
                    Ok(())
                };
                self.retire_staging(staging);
                result
            }
            MapState::MappedDirect { view, access } => {
                drop(view);
                self.provider.sync_end(self.backing.fd(), access)
            }
        }
    }

    /// Makes CPU writes so far visible to devices. The buffer stays mapped.
    ///
    /// # Errors
    /// `NotMapped` when idle; otherwise as [`unmap`](Self::unmap).
    pub fn flush(&mut self) -> HbmResult<()> {
        match &self.state {
            MapState::Idle => Err(HbmError::NotMapped),
            MapState::MappedStaging { staging, access } => {
                if access.contains(Access::WRITE) {
                    self.copy_from_staging(staging)
                } else {
                    Ok(())
                }
            }
            MapState::MappedDirect { access, .. } => {
                let fd = self.backing.fd();
                let ended = self.provider.sync_end(fd, *access);
                let restarted = self.provider.sync_start(fd, *access);
                ended.and(restarted)
            }
        }
    }

    /// Makes device writes since the map visible through the active mapping. Direct mappings
    /// end and restart their CPU access, so start/end calls stay paired.
    ///
    /// # Errors
    /// `NotMapped` when idle, `SyncWaitFailed` if the fence wait fails, `CopyFailed` if the
    /// staging refresh fails.
    pub fn invalidate(&mut self) -> HbmResult<()> {
        if matches!(self.state, MapState::Idle) {
            return Err(HbmError::NotMapped);
        }
        self.wait_fence(Access::READ)?;

        let mut state = mem::replace(&mut self.state, MapState::Idle);
        let result = match &mut state {
            MapState::Idle => Err(HbmError::NotMapped),
            MapState::MappedStaging { staging, .. } => self.copy_to_staging(staging),
            MapState::MappedDirect { access, .. } => {
                let fd = self.backing.fd();
                let ended = self.provider.sync_end(fd, *access);
                let restarted = self.provider.sync_start(fd, *access);
                ended.and(restarted)
            }
        };
        self.state = state;
        result
    }

    /// The mapped bytes, if mapped for reading.
    #[must_use]
    pub fn mapped_bytes(&self) -> Option<&[u8]> {
        match &self.state {
            MapState::Idle => None,
            MapState::MappedStaging { staging, .. } => staging.mapping().map(CpuMapping::as_slice),
            MapState::MappedDirect { view, access } => {
                access.contains(Access::READ).then(|| view.as_slice())
            }
        }
    }

    /// The mapped bytes, if mapped for writing.
    pub fn mapped_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.state {
            MapState::Idle => None,
            MapState::MappedStaging { staging, access } => {
                if !access.contains(Access::WRITE) {
                    return None;
                }
                staging.mapping_mut().and_then(CpuMapping::as_mut_slice)
            }
            MapState::MappedDirect { view, access } => {
                if !access.contains(Access::WRITE) {
                    return None;
                }
                view.as_mut_slice()
            }
        }
    }

    /// Layout of the memory returned by [`map`](Self::map): the staging layout when staged,
    /// the buffer's own otherwise. `None` when idle.
    #[must_use]
    pub fn mapped_layout(&self) -> Option<&PlaneLayout> {
        match &self.state {
            MapState::Idle => None,
            MapState::MappedStaging { staging, .. } => Some(staging.layout()),
            MapState::MappedDirect { .. } => Some(&self.layout),
        }
    }

    // ===========================================================================================
    // Internals
    // ===========================================================================================

    fn wait_fence(&self, access: Access) -> HbmResult<()> {
        let Some(fence) = &self.fence else {
            return Ok(());
        };
        self.provider
            .wait_ready(fence.as_fd(), access, None)
            .map_err(|e| HbmError::SyncWaitFailed(e.to_string()))
    }

    fn full_rect(&self) -> Rect {
        Rect::full(self.width, self.height)
    }

    fn map_real(&self, access: Access) -> HbmResult<CpuMapping> {
        let memory_type = self.backing.memory_type();
        if !memory_type.is_mappable() {
            return Err(HbmError::InvalidParam(format!("{memory_type} is not CPU-mappable")));
        }
        let len = usize::try_from(self.layout.total_size).map_err(|_| HbmError::LayoutOverflow)?;
        self.provider
            .map(self.backing.fd(), len, access)
            .map_err(|e| HbmError::CopyFailed(format!("mapping buffer: {e}")))
    }

    fn copy_to_staging(&self, staging: &mut StagingBuffer) -> HbmResult<()> {
        let rect = self.full_rect();
        if let Some((vendor, image)) = self.backing.vendor_image() {
            return vendor.copy_image(
                image,
                staging.fd(),
                staging.layout(),
                rect,
                CopyDirection::FromImage,
            );
        }
        if !self.backing.cpu_copyable() {
            return self.device_copy(staging, rect, CopyDirection::FromImage);
        }

        let fd = self.backing.fd();
        if let Err(e) = self.provider.sync_start(fd, Access::READ) {
            log::warn!("start of staging read failed: {e}");
        }
        let result = self.read_into(staging, rect);
        if let Err(e) = self.provider.sync_end(fd, Access::READ) {
            log::warn!("end of staging read failed: {e}");
        }
        result
    }

    fn read_into(&self, staging: &mut StagingBuffer, rect: Rect) -> HbmResult<()> {
        let real = self.map_real(Access::READ)?;
        let staging_layout = staging.layout().clone();
        let dst = staging
            .map()?
            .as_mut_slice()
            .ok_or_else(|| HbmError::CopyFailed("staging buffer not writable".to_string()))?;
        copy_rect(self.format, real.as_slice(), &self.layout, dst, &staging_layout, rect)
    }

    fn copy_from_staging(&self, staging: &StagingBuffer) -> HbmResult<()> {
        let rect = self.full_rect();
        if let Some((vendor, image)) = self.backing.vendor_image() {
            return vendor.copy_image(
                image,
                staging.fd(),
                staging.layout(),
                rect,
                CopyDirection::ToImage,
            );
        }
        if !self.backing.cpu_copyable() {
            return self.device_copy(staging, rect, CopyDirection::ToImage);
        }

        let fd = self.backing.fd();
        if let Err(e) = self.provider.sync_start(fd, Access::WRITE) {
            log::warn!("start of staging write-back failed: {e}");
        }
        let result = self.write_back(staging, rect);
        // The barrier runs whether or not the copy made it.
        if let Err(e) = self.provider.sync_end(fd, Access::WRITE) {
            log::error!("end of staging write-back failed: {e}");
        }
        result
    }

    fn write_back(&self, staging: &StagingBuffer, rect: Rect) -> HbmResult<()> {
        let src = staging
            .mapping()
            .ok_or_else(|| HbmError::CopyFailed("staging buffer not mapped".to_string()))?;
        let mut real = self.map_real(Access::WRITE)?;
        let dst = real
            .as_mut_slice()
            .ok_or_else(|| HbmError::CopyFailed("buffer not writable".to_string()))?;
        copy_rect(self.format, src.as_slice(), staging.layout(), dst, &self.layout, rect)
    }

    fn device_copy(
        &self,
        staging: &StagingBuffer,
        rect: Rect,
        direction: CopyDirection,
    ) -> HbmResult<()> {
        self.device.copy_buffer(&DeviceCopy {
            format: self.format,
            buffer: self.backing.fd(),
            layout: &self.layout,
            staging: staging.fd(),
            staging_layout: staging.layout(),
            rect,
            direction,
        })
    }

    fn retire_staging(&mut self, staging: StagingBuffer) {
        if self.keep_staging {
            self.kept_staging = Some(staging);
        }
    }

    /// Tears down an active mapping without writing anything back.
    pub(crate) fn abandon_mapping(&mut self) {
        match mem::replace(&mut self.state, MapState::Idle) {
            MapState::Idle => {}
            MapState::MappedStaging { staging, .. } => {
                log::warn!("releasing a buffer with an active staging mapping");
                drop(staging);
            }
            MapState::MappedDirect { view, access } => {
                log::warn!("releasing a buffer with an active mapping");
                drop(view);
                if let Err(e) = self.provider.sync_end(self.backing.fd(), access) {
                    log::error!("end of CPU access failed: {e}");
                }
            }
        }
    }
}
