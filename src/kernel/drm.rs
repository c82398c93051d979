use crate::engine::bo::ImportTarget;
use crate::error::{HbmError, HbmResult};
use crate::kernel::dmabuf::ioctl_retry;
use crate::kernel::ioctl::{
    DRM_IOCTL_GEM_CLOSE, DRM_IOCTL_PRIME_FD_TO_HANDLE, DrmGemClose, DrmPrimeHandle,
};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Environment variable naming the render node used for re-import.
pub const RENDER_NODE_ENV: &str = "HBM_RENDER_NODE";

/// A DRM render node (`/dev/dri/renderD*`), used as a second device context into which
/// buffers are re-imported as GEM handles.
#[derive(Debug)]
pub struct RenderNode {
    path: PathBuf,
    file: File,
}

impl RenderNode {
    /// Opens a render node.
    ///
    /// # Errors
    /// Returns the OS error if the node cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> HbmResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(&path)?;
        Ok(Self { path, file })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ImportTarget for RenderNode {
    fn import(&self, fd: BorrowedFd<'_>) -> HbmResult<u32> {
        let mut args = DrmPrimeHandle {
            fd: fd.as_raw_fd(),
            ..Default::default()
        };
        unsafe { ioctl_retry(self.file.as_fd(), DRM_IOCTL_PRIME_FD_TO_HANDLE, &raw mut args) }
            .map_err(|e| {
                HbmError::ReimportFailed(format!("{}: prime import: {e}", self.path.display()))
            })?;
        Ok(args.handle)
    }

    fn release(&self, handle: u32) -> HbmResult<()> {
        let mut args = DrmGemClose { handle, pad: 0 };
        unsafe { ioctl_retry(self.file.as_fd(), DRM_IOCTL_GEM_CLOSE, &raw mut args) }?;
        Ok(())
    }
}
