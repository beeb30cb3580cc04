use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::BackendError;
use crate::contract::AccelerationMode;

pub const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

/// Device handle a hardware implementation needs before init.
///
/// The render node stays open for as long as the handle lives.
#[derive(Debug)]
pub struct AcceleratorHandle {
    mode: AccelerationMode,
    path: PathBuf,
    device: File,
}

impl AcceleratorHandle {
    /// Opens whatever `mode` requires; `Ok(None)` when it needs nothing.
    pub fn open(mode: AccelerationMode) -> Result<Option<Self>, BackendError> {
        match mode {
            AccelerationMode::Na => Ok(None),
            AccelerationMode::Vaapi => Self::open_render_node(DEFAULT_RENDER_NODE).map(Some),
        }
    }

    pub fn open_render_node(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| {
                BackendError::UnsupportedConfig(format!(
                    "failed to open render node {}: {err}",
                    path.display()
                ))
            })?;
        Ok(Self {
            mode: AccelerationMode::Vaapi,
            path: path.to_path_buf(),
            device,
        })
    }

    #[must_use]
    pub fn mode(&self) -> AccelerationMode {
        self.mode
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn device(&self) -> &File {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_mode_needs_no_handle() {
        assert!(AcceleratorHandle::open(AccelerationMode::Na).unwrap().is_none());
    }

    #[test]
    fn render_node_is_opened_read_write() {
        let node = tempfile::NamedTempFile::new().unwrap();
        let handle = AcceleratorHandle::open_render_node(node.path()).unwrap();
        assert_eq!(handle.mode(), AccelerationMode::Vaapi);
        assert_eq!(handle.path(), node.path());
        assert!(handle.device().metadata().unwrap().is_file());
    }

    #[test]
    fn missing_render_node_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let err = AcceleratorHandle::open_render_node(dir.path().join("renderD999")).unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedConfig(_)));
    }
}
